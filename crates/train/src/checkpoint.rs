//! Checkpoint save/resume protocol.
//!
//! The full mutable training state is one [`TrainingState`] value serialised
//! as a single JSON document. Saves go through a write-temp-then-rename so a
//! crash mid-write can never leave a truncated checkpoint behind; each save
//! replaces the previous file wholesale. `serde_json` emits floats in
//! shortest round-trip form, so f32 weight and optimizer state survives a
//! save/load cycle bit-exact.
//!
//! The `epoch` field always names the *next* epoch to run: the trainer saves
//! before an epoch's work begins, so a resumed run repeats at most the epoch
//! that was interrupted.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_core::{Device, Result, Tensor};
use serde::{Deserialize, Serialize};

use combinact_common::{ActFun, HeadConfig, PermMethod};

// ── Tensor serialisation ────────────────────────────────────────────────────

/// A tensor flattened for serialisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorData {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl TensorData {
    pub fn from_tensor(t: &Tensor) -> Result<Self> {
        Ok(Self {
            shape: t.dims().to_vec(),
            data: t.flatten_all()?.to_dtype(candle_core::DType::F32)?.to_vec1::<f32>()?,
        })
    }

    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Tensor::from_vec(self.data.clone(), self.shape.clone(), device)
    }
}

/// Name → tensor map in stable (sorted) order.
pub type StateDict = BTreeMap<String, TensorData>;

/// Capture a name → tensor map as a [`StateDict`].
pub fn state_dict_from_tensors(tensors: &HashMap<String, Tensor>) -> Result<StateDict> {
    let mut out = StateDict::new();
    for (name, t) in tensors {
        out.insert(name.clone(), TensorData::from_tensor(t)?);
    }
    Ok(out)
}

/// Materialise a [`StateDict`] back into tensors.
pub fn state_dict_to_tensors(dict: &StateDict, device: &Device) -> Result<HashMap<String, Tensor>> {
    let mut out = HashMap::new();
    for (name, td) in dict {
        out.insert(name.clone(), td.to_tensor(device)?);
    }
    Ok(out)
}

// ── Component states ────────────────────────────────────────────────────────

/// Adam internals: step counter plus per-parameter moment buffers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub step_count: usize,
    pub first_moments: StateDict,
    pub second_moments: StateDict,
}

/// One-cycle schedule internals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub step: usize,
}

// ── TrainingState ───────────────────────────────────────────────────────────

/// The unit of checkpointing and resumption. Field names are the stable
/// on-disk keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    pub pre_model_state_dict: StateDict,
    pub model_state_dict: StateDict,
    pub optimizer: OptimizerState,
    pub scheduler: SchedulerState,
    pub curr_seed: u64,
    /// Next epoch to execute, 1-indexed.
    pub epoch: usize,
    pub actfun: ActFun,
    pub p: usize,
    pub k: usize,
    pub g: usize,
    pub perm_method: PermMethod,
}

impl TrainingState {
    /// A checkpoint must describe the same head architecture the run was
    /// configured with; resuming into a different shape is fatal.
    pub fn validate(&self, head: &HeadConfig) -> anyhow::Result<()> {
        if self.actfun != head.actfun {
            anyhow::bail!(
                "checkpoint actfun {} does not match configured {}",
                self.actfun,
                head.actfun
            );
        }
        if self.k != head.k {
            anyhow::bail!("checkpoint k {} does not match configured {}", self.k, head.k);
        }
        if self.p != head.p {
            anyhow::bail!("checkpoint p {} does not match configured {}", self.p, head.p);
        }
        if self.g != head.g {
            anyhow::bail!("checkpoint g {} does not match configured {}", self.g, head.g);
        }
        if self.perm_method != head.perm_method {
            anyhow::bail!(
                "checkpoint perm_method {} does not match configured {}",
                self.perm_method,
                head.perm_method
            );
        }
        Ok(())
    }
}

// ── CheckpointManager ───────────────────────────────────────────────────────

/// Owns the checkpoint path; saving replaces the file atomically.
pub struct CheckpointManager {
    path: PathBuf,
}

impl CheckpointManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically persist `state`: serialise to `<path>.tmp`, sync, rename.
    pub fn save(&self, state: &TrainingState) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create checkpoint dir {}", parent.display()))?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        {
            let file = File::create(&tmp)
                .with_context(|| format!("create checkpoint temp file {}", tmp.display()))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, state).context("serialise checkpoint")?;
            writer.flush()?;
            writer.into_inner()?.sync_all().context("sync checkpoint")?;
        }
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("rename checkpoint into {}", self.path.display()))?;
        Ok(())
    }

    /// Load the checkpoint, or `None` when no file exists yet.
    pub fn load(&self) -> anyhow::Result<Option<TrainingState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let file = File::open(&self.path)
            .with_context(|| format!("open checkpoint {}", self.path.display()))?;
        let state = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("parse checkpoint {}", self.path.display()))?;
        Ok(Some(state))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_state(epoch: usize) -> TrainingState {
        let mut model = StateDict::new();
        model.insert(
            "fc1.weight".to_string(),
            TensorData {
                shape: vec![2, 2],
                data: vec![0.1, -0.2, 0.3, 0.4],
            },
        );
        let mut moments = StateDict::new();
        moments.insert(
            "fc1.weight".to_string(),
            TensorData {
                shape: vec![2, 2],
                data: vec![1e-8, 0.5, -3.25, 7.5e-12],
            },
        );
        TrainingState {
            pre_model_state_dict: StateDict::new(),
            model_state_dict: model,
            optimizer: OptimizerState {
                step_count: 17,
                first_moments: moments.clone(),
                second_moments: moments,
            },
            scheduler: SchedulerState { step: 42 },
            curr_seed: 7,
            epoch,
            actfun: ActFun::Combinact,
            p: 2,
            k: 4,
            g: 1,
            perm_method: PermMethod::Shuffle,
        }
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path().join("run.json"));
        let state = toy_state(3);
        manager.save(&state).unwrap();
        let loaded = manager.load().unwrap().unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path().join("absent.json"));
        assert!(manager.load().unwrap().is_none());
    }

    #[test]
    fn save_replaces_wholesale() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path().join("run.json"));
        manager.save(&toy_state(1)).unwrap();
        manager.save(&toy_state(2)).unwrap();
        assert_eq!(manager.load().unwrap().unwrap().epoch, 2);
        // No temp file left behind.
        assert!(!dir.path().join("run.json.tmp").exists());
    }

    #[test]
    fn architecture_mismatch_is_fatal() {
        let state = toy_state(1);
        let mut head = HeadConfig {
            actfun: ActFun::Combinact,
            k: 4,
            p: 2,
            g: 1,
            ..Default::default()
        };
        assert!(state.validate(&head).is_ok());

        head.k = 2;
        let err = state.validate(&head).unwrap_err().to_string();
        assert!(err.contains("k"), "error should name the field: {err}");
    }

    #[test]
    fn tensor_data_round_trip() {
        let device = Device::Cpu;
        let t = Tensor::from_vec(vec![1.5f32, -2.25, 3.125, 0.0], (2, 2), &device).unwrap();
        let td = TensorData::from_tensor(&t).unwrap();
        let back = td.to_tensor(&device).unwrap();
        assert_eq!(back.dims(), &[2, 2]);
        assert_eq!(back.to_vec2::<f32>().unwrap(), t.to_vec2::<f32>().unwrap());
    }

    #[test]
    fn corrupt_checkpoint_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        std::fs::write(&path, "{\"epoch\": ").unwrap();
        let manager = CheckpointManager::new(path);
        assert!(manager.load().is_err());
    }
}
