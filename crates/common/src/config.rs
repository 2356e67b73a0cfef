//! Head architecture configuration.
//!
//! Serialised as JSON so a run's head shape can be stored alongside its
//! checkpoint and compared on resume. Every knob the checkpoint validates
//! lives here; training-loop knobs (epochs, lr, batch size) stay with the
//! trainer.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Activation used between the head's hidden layers.
///
/// `relu` and `swish` act element-wise. `max` and `l2` are higher-order:
/// they reduce groups of `k` pre-activations to one value, once per
/// permutation. `combinact` mixes the whole higher-order family with
/// learned per-layer weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActFun {
    Relu,
    Swish,
    Max,
    L2,
    Combinact,
}

impl ActFun {
    /// Whether the activation consumes `k`-sized groups (changing the
    /// layer's output width) rather than acting element-wise.
    pub fn is_higher_order(&self) -> bool {
        matches!(self, Self::Max | Self::L2 | Self::Combinact)
    }
}

impl fmt::Display for ActFun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Relu => "relu",
            Self::Swish => "swish",
            Self::Max => "max",
            Self::L2 => "l2",
            Self::Combinact => "combinact",
        };
        write!(f, "{s}")
    }
}

impl FromStr for ActFun {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "relu" => Ok(Self::Relu),
            "swish" => Ok(Self::Swish),
            "max" => Ok(Self::Max),
            "l2" => Ok(Self::L2),
            "combinact" => Ok(Self::Combinact),
            other => anyhow::bail!("unknown activation function: {other}"),
        }
    }
}

/// How pre-activation permutations are drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermMethod {
    /// Independent random shuffle per permutation.
    Shuffle,
    /// Cyclic rotation by the permutation index.
    Roll,
}

impl fmt::Display for PermMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Shuffle => "shuffle",
            Self::Roll => "roll",
        };
        write!(f, "{s}")
    }
}

impl FromStr for PermMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shuffle" => Ok(Self::Shuffle),
            "roll" => Ok(Self::Roll),
            other => anyhow::bail!("unknown permutation method: {other}"),
        }
    }
}

// ── HeadConfig ──────────────────────────────────────────────────────────────

/// Structural hyper-parameters of the classification head.
///
/// A resumed checkpoint must match these exactly; see
/// `combinact_train::checkpoint`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadConfig {
    /// Activation variant between hidden layers.
    pub actfun: ActFun,
    /// Embedding width produced by the frozen backbone.
    pub input_dim: usize,
    /// Number of label classes.
    pub output_dim: usize,
    /// Higher-order activation group size.
    pub k: usize,
    /// Number of pre-activation permutations.
    pub p: usize,
    /// Inter-layer group size (grouped hidden linear).
    pub g: usize,
    /// Trainable-parameter budget used to size the hidden layers.
    #[serde(default = "default_num_params")]
    pub num_params: usize,
    /// Permutation strategy.
    #[serde(default = "default_perm_method")]
    pub perm_method: PermMethod,
}

fn default_num_params() -> usize {
    1_000_000
}

fn default_perm_method() -> PermMethod {
    PermMethod::Shuffle
}

impl Default for HeadConfig {
    fn default() -> Self {
        Self {
            actfun: ActFun::Swish,
            input_dim: 1280,
            output_dim: 1000,
            k: 2,
            p: 1,
            g: 1,
            num_params: 1_000_000,
            perm_method: PermMethod::Shuffle,
        }
    }
}

impl HeadConfig {
    /// Reject shapes the head cannot be built from.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.input_dim == 0 || self.output_dim == 0 {
            anyhow::bail!("head dimensions must be non-zero");
        }
        if self.k == 0 || self.p == 0 || self.g == 0 {
            anyhow::bail!("k, p and g must all be at least 1");
        }
        if self.num_params == 0 {
            anyhow::bail!("parameter budget must be non-zero");
        }
        Ok(())
    }

    /// Group size actually applied by the activation (1 for element-wise).
    pub fn effective_k(&self) -> usize {
        if self.actfun.is_higher_order() {
            self.k
        } else {
            1
        }
    }

    /// Permutation count actually applied (1 for element-wise).
    pub fn effective_p(&self) -> usize {
        if self.actfun.is_higher_order() {
            self.p
        } else {
            1
        }
    }

    /// Hidden width `n` solved from the parameter budget.
    ///
    /// With two hidden layers of width `n`, an activation that maps `n`
    /// pre-activations to `n/k · p` outputs, and a `g`-grouped middle
    /// linear, the trainable parameter count is
    ///
    /// ```text
    /// params(n) = in·n + n  +  (n/k·p)·n/g + n  +  (n/k·p)·out + out
    /// ```
    ///
    /// Solving `params(n) = num_params` for `n` and rounding down to a
    /// multiple of `k·g` keeps every grouped split exact.
    pub fn hidden_width(&self) -> usize {
        let k = self.effective_k() as f64;
        let p = self.effective_p() as f64;
        let g = self.g as f64;
        let input = self.input_dim as f64;
        let output = self.output_dim as f64;
        let budget = self.num_params as f64;

        let a = p / (k * g);
        let b = input + 2.0 + output * p / k;
        let c = output - budget;
        let n = (-b + (b * b - 4.0 * a * c).sqrt()) / (2.0 * a);

        let unit = self.effective_k() * self.g;
        let n = (n.max(0.0) as usize / unit) * unit;
        n.max(unit)
    }

    /// Save config to a JSON file.
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
