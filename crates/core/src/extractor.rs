//! Frozen feature extractor.
//!
//! The backbone that produces embeddings for the trainable head. Its weights
//! are plain `Tensor`s, never `Var`s, so no gradient can reach them in any
//! precision mode. [`FrozenBackbone::forward`] detaches its output to keep
//! the autograd graph rooted at the head's input.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{bail, Device, Result, Tensor};
use rand::rngs::StdRng;
use rand::Rng;

/// Pretrained backbone, held frozen. A stack of dense layers with GELU
/// between them and no activation after the final projection.
pub struct FrozenBackbone {
    /// `(weight, bias)` per layer; weight is `(out, in)`.
    layers: Vec<(Tensor, Tensor)>,
    input_dim: usize,
    embed_dim: usize,
}

impl FrozenBackbone {
    /// Assemble from a name → tensor map with keys `fc{i}.weight` / `fc{i}.bias`.
    pub fn from_state_dict(tensors: &HashMap<String, Tensor>) -> Result<Self> {
        let mut layers = Vec::new();
        for i in 0.. {
            let (w_key, b_key) = (format!("fc{i}.weight"), format!("fc{i}.bias"));
            match (tensors.get(&w_key), tensors.get(&b_key)) {
                (Some(w), Some(b)) => layers.push((w.clone(), b.clone())),
                (None, None) => break,
                _ => bail!("backbone state dict missing {w_key} or {b_key}"),
            }
        }
        if layers.is_empty() {
            bail!("backbone state dict holds no layers");
        }
        let input_dim = layers[0].0.dim(1)?;
        let embed_dim = layers[layers.len() - 1].0.dim(0)?;
        Ok(Self {
            layers,
            input_dim,
            embed_dim,
        })
    }

    /// Load pretrained weights from a `.safetensors` file.
    pub fn load(path: &Path, device: &Device) -> anyhow::Result<Self> {
        let tensors = candle_core::safetensors::load(path, device)?;
        Ok(Self::from_state_dict(&tensors)?)
    }

    /// Two-layer backbone with Xavier-uniform weights drawn from `rng`.
    /// Stands in when no pretrained weights file is supplied.
    pub fn random(
        input_dim: usize,
        embed_dim: usize,
        device: &Device,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let dims = [(input_dim, embed_dim), (embed_dim, embed_dim)];
        let mut layers = Vec::with_capacity(dims.len());
        for (fan_in, fan_out) in dims {
            let bound = (6.0 / (fan_in + fan_out) as f32).sqrt();
            let w: Vec<f32> = (0..fan_out * fan_in)
                .map(|_| rng.gen_range(-bound..bound))
                .collect();
            let w = Tensor::from_vec(w, (fan_out, fan_in), device)?;
            let b = Tensor::zeros((fan_out,), candle_core::DType::F32, device)?;
            layers.push((w, b));
        }
        Ok(Self {
            layers,
            input_dim,
            embed_dim,
        })
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn embed_dim(&self) -> usize {
        self.embed_dim
    }

    /// Embed a `(batch, input_dim)` tensor. The result is detached.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let last = self.layers.len() - 1;
        let mut h = x.clone();
        for (i, (w, b)) in self.layers.iter().enumerate() {
            h = h.matmul(&w.t()?)?.broadcast_add(b)?;
            if i != last {
                h = h.gelu()?;
            }
        }
        Ok(h.detach())
    }

    /// Snapshot of the frozen weights, keyed like [`from_state_dict`] expects.
    pub fn state_dict(&self) -> HashMap<String, Tensor> {
        let mut out = HashMap::new();
        for (i, (w, b)) in self.layers.iter().enumerate() {
            out.insert(format!("fc{i}.weight"), w.clone());
            out.insert(format!("fc{i}.bias"), b.clone());
        }
        out
    }

    /// Replace the frozen weights from a snapshot with identical shapes.
    pub fn load_state_dict(&mut self, tensors: &HashMap<String, Tensor>) -> Result<()> {
        let restored = Self::from_state_dict(tensors)?;
        if restored.layers.len() != self.layers.len() {
            bail!(
                "backbone layer count mismatch: checkpoint has {}, model has {}",
                restored.layers.len(),
                self.layers.len()
            );
        }
        for (i, ((w_new, b_new), (w_old, b_old))) in
            restored.layers.iter().zip(self.layers.iter()).enumerate()
        {
            if w_new.dims() != w_old.dims() || b_new.dims() != b_old.dims() {
                bail!("backbone layer fc{i} shape mismatch");
            }
        }
        self.layers = restored.layers;
        self.input_dim = restored.input_dim;
        self.embed_dim = restored.embed_dim;
        Ok(())
    }

    /// Save the frozen weights to a `.safetensors` file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        candle_core::safetensors::save(&self.state_dict(), path)?;
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn forward_shape() {
        let device = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(0);
        let backbone = FrozenBackbone::random(6, 4, &device, &mut rng).unwrap();
        let x = Tensor::zeros((3, 6), candle_core::DType::F32, &device).unwrap();
        let out = backbone.forward(&x).unwrap();
        assert_eq!(out.dims(), &[3, 4]);
    }

    #[test]
    fn state_dict_round_trip() {
        let device = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(1);
        let backbone = FrozenBackbone::random(5, 3, &device, &mut rng).unwrap();
        let restored = FrozenBackbone::from_state_dict(&backbone.state_dict()).unwrap();
        assert_eq!(restored.input_dim(), 5);
        assert_eq!(restored.embed_dim(), 3);

        let x = Tensor::ones((2, 5), candle_core::DType::F32, &device).unwrap();
        let a = backbone.forward(&x).unwrap().to_vec2::<f32>().unwrap();
        let b = restored.forward(&x).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn safetensors_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backbone.safetensors");
        let device = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(2);
        let backbone = FrozenBackbone::random(4, 2, &device, &mut rng).unwrap();
        backbone.save(&path).unwrap();

        let loaded = FrozenBackbone::load(&path, &device).unwrap();
        assert_eq!(loaded.input_dim(), 4);
        assert_eq!(loaded.embed_dim(), 2);
    }

    #[test]
    fn shape_mismatch_rejected_on_restore() {
        let device = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(3);
        let mut backbone = FrozenBackbone::random(4, 2, &device, &mut rng).unwrap();
        let other = FrozenBackbone::random(4, 3, &device, &mut rng).unwrap();
        assert!(backbone.load_state_dict(&other.state_dict()).is_err());
    }
}
