//! Numeric-precision execution strategies.
//!
//! Exactly one [`PrecisionStrategy`] variant is constructed at startup and
//! used for every training batch:
//!
//! * **Off** — everything in f32; plain backward + Adam step.
//! * **Native** — head forward in f16 against f32 master weights, dynamic
//!   loss scaling via [`GradScaler`]; a step whose unscaled gradients contain
//!   non-finite values is skipped (observable through `skipped_steps`) and
//!   the scale backs off.
//! * **Apex** — head forward in f16 under a static loss scale fixed at
//!   startup; the optimizer step is unconditional.
//!
//! The backbone is frozen in every variant: its output is detached before it
//! reaches the head, so no gradient path into it exists.

use candle_core::backprop::GradStore;
use candle_core::{DType, Result, Tensor, Var};
use candle_nn::loss;

use combinact_core::{FrozenBackbone, Mlp};

use crate::optim::Adam;

// ── Mode selection ──────────────────────────────────────────────────────────

/// Which mixed-precision regime the run uses. Fixed for the run's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmpMode {
    Off,
    Native,
    Apex,
}

impl AmpMode {
    /// Resolve the mode from the `--control-amp` value and the legacy
    /// per-mode switches. Requesting both mixed-precision variants is a
    /// configuration error, surfaced here before training starts.
    pub fn resolve(control_amp: &str, native_amp: bool, apex_amp: bool) -> anyhow::Result<Self> {
        let native = native_amp || control_amp == "native";
        let apex = apex_amp || control_amp == "apex";
        if !matches!(control_amp, "" | "none" | "native" | "apex") {
            anyhow::bail!("unknown --control-amp value: {control_amp}");
        }
        if native && apex {
            anyhow::bail!("native and apex mixed precision are mutually exclusive");
        }
        Ok(if native {
            Self::Native
        } else if apex {
            Self::Apex
        } else {
            Self::Off
        })
    }
}

// ── Loss scalers ────────────────────────────────────────────────────────────

/// Dynamic loss scaler for native mixed precision.
///
/// Multiplies the loss before backward so small f16 gradients survive;
/// divides gradients back out before the step. On overflow the scale halves
/// and the step is skipped; after `growth_interval` consecutive good steps
/// the scale doubles.
#[derive(Debug, Clone)]
pub struct GradScaler {
    scale: f64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: usize,
    good_steps: usize,
    skipped_steps: usize,
}

impl Default for GradScaler {
    fn default() -> Self {
        Self::new()
    }
}

impl GradScaler {
    pub fn new() -> Self {
        Self {
            scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            good_steps: 0,
            skipped_steps: 0,
        }
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Steps dropped because their gradients overflowed.
    pub fn skipped_steps(&self) -> usize {
        self.skipped_steps
    }

    /// Adjust the scale after a step attempt.
    pub fn update(&mut self, found_inf: bool) {
        if found_inf {
            self.scale *= self.backoff_factor;
            self.good_steps = 0;
            self.skipped_steps += 1;
        } else {
            self.good_steps += 1;
            if self.good_steps % self.growth_interval == 0 {
                self.scale *= self.growth_factor;
            }
        }
    }
}

/// Static loss scaler for the library-style (apex) path.
#[derive(Debug, Clone)]
pub struct StaticLossScaler {
    scale: f64,
}

impl StaticLossScaler {
    pub fn new() -> Self {
        Self { scale: 128.0 }
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }
}

impl Default for StaticLossScaler {
    fn default() -> Self {
        Self::new()
    }
}

/// Divide every tracked gradient by `scale` in place; report whether all
/// gradients stayed finite.
fn unscale_grads(grads: &mut GradStore, vars: &[(String, Var)], scale: f64) -> Result<bool> {
    let inv = 1.0 / scale;
    let mut all_finite = true;
    for (_, var) in vars {
        if let Some(g) = grads.remove(var.as_tensor()) {
            let g = g.to_dtype(DType::F32)?.affine(inv, 0.0)?;
            let total = g.abs()?.sum_all()?.to_scalar::<f32>()?;
            if !total.is_finite() {
                all_finite = false;
            }
            grads.insert(var.as_tensor(), g);
        }
    }
    Ok(all_finite)
}

// ── PrecisionStrategy ───────────────────────────────────────────────────────

/// Result of one training step.
pub struct StepOutput {
    /// Unscaled scalar loss for metric accumulation.
    pub loss: f32,
    /// f32 logits for accuracy computation.
    pub logits: Tensor,
}

/// One forward/backward/step recipe per precision regime.
pub enum PrecisionStrategy {
    Off,
    Native(GradScaler),
    Apex(StaticLossScaler),
}

impl PrecisionStrategy {
    pub fn new(mode: AmpMode) -> Self {
        match mode {
            AmpMode::Off => Self::Off,
            AmpMode::Native => Self::Native(GradScaler::new()),
            AmpMode::Apex => Self::Apex(StaticLossScaler::new()),
        }
    }

    pub fn mode(&self) -> AmpMode {
        match self {
            Self::Off => AmpMode::Off,
            Self::Native(_) => AmpMode::Native,
            Self::Apex(_) => AmpMode::Apex,
        }
    }

    /// Optimizer steps skipped so far (always 0 outside native mode).
    pub fn skipped_steps(&self) -> usize {
        match self {
            Self::Native(scaler) => scaler.skipped_steps(),
            _ => 0,
        }
    }

    /// Execute one training step over `(input, target)` and return the
    /// batch loss plus logits. Mutates the head (through the optimizer) and
    /// any scaler state; the native variant may skip the update entirely.
    pub fn train_step(
        &mut self,
        backbone: &FrozenBackbone,
        head: &Mlp,
        optimizer: &mut Adam,
        input: &Tensor,
        target: &Tensor,
    ) -> anyhow::Result<StepOutput> {
        let features = backbone.forward(input)?;
        match self {
            Self::Off => {
                let logits = head.forward(&features)?;
                let batch_loss = loss::cross_entropy(&logits, target)?;
                let grads = batch_loss.backward()?;
                optimizer.step(&grads)?;
                Ok(StepOutput {
                    loss: batch_loss.to_scalar::<f32>()?,
                    logits,
                })
            }
            Self::Native(scaler) => {
                let logits = head.forward_with_dtype(&features, DType::F16)?;
                let logits = logits.to_dtype(DType::F32)?;
                let batch_loss = loss::cross_entropy(&logits, target)?;
                let scaled = batch_loss.affine(scaler.scale(), 0.0)?;
                let mut grads = scaled.backward()?;
                let finite = unscale_grads(&mut grads, optimizer.vars(), scaler.scale())?;
                if finite {
                    optimizer.step(&grads)?;
                }
                scaler.update(!finite);
                Ok(StepOutput {
                    loss: batch_loss.to_scalar::<f32>()?,
                    logits,
                })
            }
            Self::Apex(scaler) => {
                let logits = head.forward_with_dtype(&features, DType::F16)?;
                let logits = logits.to_dtype(DType::F32)?;
                let batch_loss = loss::cross_entropy(&logits, target)?;
                let scaled = batch_loss.affine(scaler.scale(), 0.0)?;
                let mut grads = scaled.backward()?;
                unscale_grads(&mut grads, optimizer.vars(), scaler.scale())?;
                optimizer.step(&grads)?;
                Ok(StepOutput {
                    loss: batch_loss.to_scalar::<f32>()?,
                    logits,
                })
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
