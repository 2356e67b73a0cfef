//! Higher-order activation layers.
//!
//! Element-wise activations (`relu`, `swish`) pass width through unchanged.
//! Higher-order activations view the layer's `n` pre-activations as `n/k`
//! groups of `k` and reduce each group to one value, repeated over `p`
//! permutations of the pre-activation vector, so the output width is
//! `n/k · p`:
//!
//! | Activation | Group reduction |
//! |------------|-----------------|
//! | max        | max(x₁ … xₖ) |
//! | l2         | √(x₁² + … + xₖ²) |
//! | combinact  | softmax-weighted mix of the family below |
//!
//! `combinact` carries one trainable `alpha_primes` tensor of shape
//! `(p, family)` per layer; its softmax decides how much of each family
//! member contributes per permutation.

use candle_core::{bail, DType, IndexOp, Result, Tensor, D};
use candle_nn::{ops, Init, VarBuilder};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use combinact_common::{ActFun, PermMethod};

// ── Group reductions ────────────────────────────────────────────────────────

/// A reduction collapsing the trailing group dimension of a `(batch, n/k, k)`
/// tensor to `(batch, n/k)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupOp {
    Max,
    Min,
    Mean,
    L2,
}

/// Reductions mixed by `combinact`, in `alpha_primes` column order.
pub const COMBINACT_FAMILY: [GroupOp; 4] = [GroupOp::Max, GroupOp::Min, GroupOp::Mean, GroupOp::L2];

impl GroupOp {
    pub fn apply(&self, groups: &Tensor) -> Result<Tensor> {
        match self {
            Self::Max => groups.max(D::Minus1),
            Self::Min => groups.min(D::Minus1),
            Self::Mean => groups.mean(D::Minus1),
            Self::L2 => groups.sqr()?.sum(D::Minus1)?.sqrt(),
        }
    }
}

// ── Instrumentation ─────────────────────────────────────────────────────────

/// One layer's `combinact` mixing weights, averaged over the permutation
/// axis: the raw values and their softmax.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerAlphas {
    pub raw: Vec<f32>,
    pub normalized: Vec<f32>,
}

// ── HigherOrderActivation ───────────────────────────────────────────────────

/// Activation layer between two linears of the head.
pub struct HigherOrderActivation {
    actfun: ActFun,
    width: usize,
    k: usize,
    /// One index tensor per permutation; empty for element-wise activations.
    perms: Vec<Tensor>,
    /// `(p, family)` mixing weights; `combinact` only.
    alpha_primes: Option<Tensor>,
}

impl HigherOrderActivation {
    /// Build the layer for a pre-activation vector of `width` values.
    /// Permutations are drawn from `rng` (shuffle) or derived from the
    /// permutation index (roll).
    pub fn new(
        actfun: ActFun,
        width: usize,
        k: usize,
        p: usize,
        perm_method: PermMethod,
        vb: VarBuilder,
        rng: &mut StdRng,
    ) -> Result<Self> {
        if !actfun.is_higher_order() {
            return Ok(Self {
                actfun,
                width,
                k: 1,
                perms: Vec::new(),
                alpha_primes: None,
            });
        }
        if k == 0 || width % k != 0 {
            bail!("activation width {width} is not divisible by group size {k}");
        }

        let device = vb.device().clone();
        let mut perms = Vec::with_capacity(p);
        for j in 0..p {
            let indices: Vec<u32> = match perm_method {
                PermMethod::Shuffle => {
                    let mut order: Vec<u32> = (0..width as u32).collect();
                    order.shuffle(rng);
                    order
                }
                PermMethod::Roll => (0..width).map(|i| ((i + j) % width) as u32).collect(),
            };
            perms.push(Tensor::from_vec(indices, (width,), &device)?);
        }

        let alpha_primes = if actfun == ActFun::Combinact {
            Some(vb.get_with_hints((p, COMBINACT_FAMILY.len()), "alpha_primes", Init::Const(0.))?)
        } else {
            None
        };

        Ok(Self {
            actfun,
            width,
            k,
            perms,
            alpha_primes,
        })
    }

    /// Output width: `width` for element-wise, `width/k · p` for higher-order.
    pub fn out_dim(&self) -> usize {
        if self.perms.is_empty() {
            self.width
        } else {
            self.width / self.k * self.perms.len()
        }
    }

    /// Apply to a `(batch, width)` tensor of the given compute dtype.
    pub fn forward(&self, x: &Tensor, dtype: DType) -> Result<Tensor> {
        match self.actfun {
            ActFun::Relu => return x.relu(),
            ActFun::Swish => return ops::silu(x),
            _ => {}
        }

        let (batch, width) = x.dims2()?;
        if width != self.width {
            bail!("activation expects width {}, got {width}", self.width);
        }
        let groups = width / self.k;

        let mut parts = Vec::with_capacity(self.perms.len());
        for (j, perm) in self.perms.iter().enumerate() {
            let permuted = x.index_select(perm, 1)?;
            let grouped = permuted.reshape((batch, groups, self.k))?;
            let reduced = match self.actfun {
                ActFun::Max => GroupOp::Max.apply(&grouped)?,
                ActFun::L2 => GroupOp::L2.apply(&grouped)?,
                ActFun::Combinact => self.mix_family(&grouped, j, dtype)?,
                ActFun::Relu | ActFun::Swish => unreachable!(),
            };
            parts.push(reduced);
        }
        Tensor::cat(&parts, 1)
    }

    /// Softmax-weighted sum of the family reductions for permutation `j`.
    fn mix_family(&self, grouped: &Tensor, j: usize, dtype: DType) -> Result<Tensor> {
        let alpha_primes = self
            .alpha_primes
            .as_ref()
            .expect("combinact layer without alpha_primes");
        let alphas = ops::softmax(&alpha_primes.i(j)?.to_dtype(dtype)?, 0)?;
        let mut acc: Option<Tensor> = None;
        for (i, op) in COMBINACT_FAMILY.iter().enumerate() {
            let weighted = op.apply(grouped)?.broadcast_mul(&alphas.narrow(0, i, 1)?)?;
            acc = Some(match acc {
                None => weighted,
                Some(prev) => (prev + weighted)?,
            });
        }
        Ok(acc.unwrap())
    }

    /// Mixing-weight snapshot for the record; `None` unless `combinact`.
    pub fn alpha_snapshot(&self) -> Result<Option<LayerAlphas>> {
        let Some(alpha_primes) = self.alpha_primes.as_ref() else {
            return Ok(None);
        };
        let raw_t = alpha_primes.mean(0)?;
        let raw = raw_t.to_vec1::<f32>()?;
        let normalized = ops::softmax(&raw_t, 0)?.to_vec1::<f32>()?;
        Ok(Some(LayerAlphas { raw, normalized }))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
