//! Classification head: linear → activation → grouped linear → activation →
//! linear.
//!
//! Hidden width is solved from the configured parameter budget
//! ([`HeadConfig::hidden_width`]). The middle linear is split into `g`
//! independent groups. Every trainable parameter is registered through the
//! caller's `VarBuilder`, so the owning `VarMap` is the single source of
//! truth for checkpointing and optimisation.

use candle_core::{bail, DType, Result, Tensor};
use candle_nn::{linear, Linear, VarBuilder};
use rand::rngs::StdRng;

use combinact_common::{ActFun, HeadConfig};

use crate::activation::{HigherOrderActivation, LayerAlphas};

/// Linear forward at an explicit compute dtype. Weights are stored in f32;
/// reduced-precision passes cast per call, which keeps gradients flowing to
/// the f32 master copies.
fn linear_fwd(layer: &Linear, x: &Tensor, dtype: DType) -> Result<Tensor> {
    let w = layer.weight().to_dtype(dtype)?;
    let y = x.matmul(&w.t()?)?;
    match layer.bias() {
        Some(b) => y.broadcast_add(&b.to_dtype(dtype)?),
        None => Ok(y),
    }
}

// ── GroupedLinear ───────────────────────────────────────────────────────────

/// `g` parallel linears, each mapping an `in/g` slice to an `out/g` slice.
pub struct GroupedLinear {
    groups: Vec<Linear>,
    g: usize,
}

impl GroupedLinear {
    pub fn new(in_dim: usize, out_dim: usize, g: usize, vb: VarBuilder) -> Result<Self> {
        if g == 0 || in_dim % g != 0 || out_dim % g != 0 {
            bail!("grouped linear {in_dim}→{out_dim} is not divisible into {g} groups");
        }
        let mut groups = Vec::with_capacity(g);
        for i in 0..g {
            groups.push(linear(in_dim / g, out_dim / g, vb.pp(format!("group{i}")))?);
        }
        Ok(Self { groups, g })
    }

    pub fn forward_with_dtype(&self, x: &Tensor, dtype: DType) -> Result<Tensor> {
        if self.g == 1 {
            return linear_fwd(&self.groups[0], x, dtype);
        }
        let chunks = x.chunk(self.g, 1)?;
        let mut outs = Vec::with_capacity(self.g);
        for (layer, chunk) in self.groups.iter().zip(chunks.iter()) {
            outs.push(linear_fwd(layer, chunk, dtype)?);
        }
        Tensor::cat(&outs, 1)
    }
}

// ── Mlp head ────────────────────────────────────────────────────────────────

/// The trainable head consuming backbone embeddings.
pub struct Mlp {
    fc1: Linear,
    act1: HigherOrderActivation,
    fc2: GroupedLinear,
    act2: HigherOrderActivation,
    fc3: Linear,
    actfun: ActFun,
}

impl Mlp {
    /// Build the head from its architecture config. `rng` drives the
    /// activation-layer permutations.
    pub fn new(config: &HeadConfig, vb: VarBuilder, rng: &mut StdRng) -> Result<Self> {
        let n = config.hidden_width();
        let k = config.effective_k();
        let p = config.effective_p();

        let fc1 = linear(config.input_dim, n, vb.pp("fc1"))?;
        let act1 = HigherOrderActivation::new(
            config.actfun,
            n,
            k,
            p,
            config.perm_method,
            vb.pp("act1"),
            rng,
        )?;
        let fc2 = GroupedLinear::new(act1.out_dim(), n, config.g, vb.pp("fc2"))?;
        let act2 = HigherOrderActivation::new(
            config.actfun,
            n,
            k,
            p,
            config.perm_method,
            vb.pp("act2"),
            rng,
        )?;
        let fc3 = linear(act2.out_dim(), config.output_dim, vb.pp("fc3"))?;

        Ok(Self {
            fc1,
            act1,
            fc2,
            act2,
            fc3,
            actfun: config.actfun,
        })
    }

    pub fn actfun(&self) -> ActFun {
        self.actfun
    }

    /// Full-precision forward: `(batch, input_dim)` → `(batch, output_dim)` logits.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.forward_with_dtype(x, DType::F32)
    }

    /// Forward at an explicit compute dtype (f16 for mixed-precision passes).
    pub fn forward_with_dtype(&self, x: &Tensor, dtype: DType) -> Result<Tensor> {
        let x = x.to_dtype(dtype)?;
        let h = linear_fwd(&self.fc1, &x, dtype)?;
        let h = self.act1.forward(&h, dtype)?;
        let h = self.fc2.forward_with_dtype(&h, dtype)?;
        let h = self.act2.forward(&h, dtype)?;
        linear_fwd(&self.fc3, &h, dtype)
    }

    /// Per-layer `combinact` mixing weights; `None` for other activations.
    pub fn alpha_snapshot(&self) -> Result<Option<Vec<LayerAlphas>>> {
        let mut layers = Vec::new();
        for act in [&self.act1, &self.act2] {
            match act.alpha_snapshot()? {
                Some(a) => layers.push(a),
                None => return Ok(None),
            }
        }
        Ok(Some(layers))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
