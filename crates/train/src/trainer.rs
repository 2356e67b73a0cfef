//! Trainer: the resumable epoch-level orchestrator.
//!
//! Owns the backbone, head, optimizer, schedule, and precision strategy.
//! Each epoch runs checkpoint → re-seed → train pass → eval pass →
//! (final epoch only) clean recompute passes → record row → advance. The
//! checkpoint is written *before* the epoch's work, so its `epoch` field
//! always names the next epoch to execute and a crash mid-epoch resumes
//! that epoch from scratch.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::SeedableRng;

use combinact_common::{BatchStream, HeadConfig};
use combinact_core::{FrozenBackbone, Mlp};

use crate::checkpoint::{
    state_dict_from_tensors, state_dict_to_tensors, CheckpointManager, StateDict, TrainingState,
};
use crate::metrics::{format_alpha_layers, EpochRecord, RecordWriter};
use crate::optim::{Adam, ParamsAdam};
use crate::precision::{AmpMode, PrecisionStrategy};
use crate::runner::{run_eval_phase, run_train_phase};
use crate::scheduler::OneCycleLr;

// ── Config ──────────────────────────────────────────────────────────────────

/// Run-level knobs (everything the checkpoint does not validate).
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    /// Dataset name recorded per row.
    pub dataset: String,
    /// Backbone name recorded per row.
    pub model: String,
    pub epochs: usize,
    pub seed: u64,
    pub batch_size: usize,
    pub val_batch_size: usize,
    /// Peak learning rate handed to the one-cycle schedule.
    pub lr: f64,
    pub weight_decay: f64,
    /// Training batches per epoch used to size the schedule.
    pub steps_per_epoch: usize,
    pub amp: AmpMode,
    /// Checkpoint file; `None` disables checkpointing.
    pub check_path: Option<PathBuf>,
    /// CSV record file.
    pub record_path: PathBuf,
}

// ── Trainer ─────────────────────────────────────────────────────────────────

/// The training engine. One call to [`Trainer::run`] drives the whole
/// epoch loop to completion.
pub struct Trainer {
    backbone: FrozenBackbone,
    head: Mlp,
    varmap: VarMap,
    optimizer: Adam,
    scheduler: OneCycleLr,
    strategy: PrecisionStrategy,
    config: TrainerConfig,
    head_config: HeadConfig,
    /// Next epoch to execute, 1-indexed.
    epoch: usize,
    device: Device,
}

impl Trainer {
    /// Build model, optimizer, schedule, and precision strategy once, then
    /// resume from the configured checkpoint if one exists.
    pub fn new(
        backbone: FrozenBackbone,
        head_config: HeadConfig,
        config: TrainerConfig,
        device: Device,
    ) -> anyhow::Result<Self> {
        head_config.validate()?;
        if backbone.embed_dim() != head_config.input_dim {
            anyhow::bail!(
                "backbone embeds {} dims but head expects {}",
                backbone.embed_dim(),
                head_config.input_dim
            );
        }

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mut rng = StdRng::seed_from_u64(config.seed);
        let head = Mlp::new(&head_config, vb, &mut rng)?;

        let optimizer = Adam::from_varmap(
            &varmap,
            ParamsAdam {
                lr: config.lr,
                weight_decay: config.weight_decay,
                ..Default::default()
            },
        );
        let scheduler = OneCycleLr::new(config.lr, config.epochs * config.steps_per_epoch);
        let strategy = PrecisionStrategy::new(config.amp);

        let mut trainer = Self {
            backbone,
            head,
            varmap,
            optimizer,
            scheduler,
            strategy,
            config,
            head_config,
            epoch: 1,
            device,
        };
        tracing::info!(
            hidden_width = trainer.head_config.hidden_width(),
            num_params = trainer.num_head_params(),
            actfun = %trainer.head_config.actfun,
            "Built classification head"
        );
        trainer.try_resume()?;
        Ok(trainer)
    }

    /// Next epoch to run.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn head(&self) -> &Mlp {
        &self.head
    }

    /// Trainable parameter count of the head.
    pub fn num_head_params(&self) -> usize {
        self.varmap
            .all_vars()
            .iter()
            .map(|v| v.as_tensor().elem_count())
            .sum()
    }

    /// Optimizer steps the native scaler skipped so far.
    pub fn skipped_steps(&self) -> usize {
        self.strategy.skipped_steps()
    }

    fn checkpoint_manager(&self) -> Option<CheckpointManager> {
        self.config
            .check_path
            .as_ref()
            .map(CheckpointManager::new)
    }

    fn head_state_tensors(&self) -> HashMap<String, Tensor> {
        self.varmap
            .data()
            .lock()
            .unwrap()
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect()
    }

    /// Snapshot the full mutable training state.
    pub fn capture_state(&self) -> anyhow::Result<TrainingState> {
        Ok(TrainingState {
            pre_model_state_dict: state_dict_from_tensors(&self.backbone.state_dict())?,
            model_state_dict: state_dict_from_tensors(&self.head_state_tensors())?,
            optimizer: self.optimizer.state()?,
            scheduler: self.scheduler.state(),
            curr_seed: self.config.seed,
            epoch: self.epoch,
            actfun: self.head_config.actfun,
            p: self.head_config.p,
            k: self.head_config.k,
            g: self.head_config.g,
            perm_method: self.head_config.perm_method,
        })
    }

    fn restore_head_weights(&mut self, dict: &StateDict) -> anyhow::Result<()> {
        let vars = self.varmap.data().lock().unwrap().clone();
        if vars.len() != dict.len() {
            anyhow::bail!(
                "checkpoint head has {} tensors, model has {}",
                dict.len(),
                vars.len()
            );
        }
        for (name, var) in vars.iter() {
            let Some(td) = dict.get(name) else {
                anyhow::bail!("checkpoint head state is missing tensor {name}");
            };
            var.set(&td.to_tensor(&self.device)?)?;
        }
        Ok(())
    }

    fn restore(&mut self, state: &TrainingState) -> anyhow::Result<()> {
        let backbone_tensors = state_dict_to_tensors(&state.pre_model_state_dict, &self.device)?;
        self.backbone.load_state_dict(&backbone_tensors)?;
        self.restore_head_weights(&state.model_state_dict)?;
        self.optimizer.load_state(&state.optimizer)?;
        self.scheduler.load_state(&state.scheduler);
        self.epoch = state.epoch;
        Ok(())
    }

    /// Load the checkpoint if one exists; an architecture mismatch is fatal.
    fn try_resume(&mut self) -> anyhow::Result<()> {
        let Some(manager) = self.checkpoint_manager() else {
            return Ok(());
        };
        let Some(state) = manager.load()? else {
            return Ok(());
        };
        state.validate(&self.head_config)?;
        self.restore(&state)?;
        tracing::info!(
            checkpoint = %manager.path().display(),
            seed = state.curr_seed,
            epoch = state.epoch,
            actfun = %state.actfun,
            p = state.p,
            k = state.k,
            g = state.g,
            perm_method = %state.perm_method,
            "Loaded checkpoint"
        );
        Ok(())
    }

    /// Run the epoch loop to completion over the two streams.
    pub fn run(
        &mut self,
        train_stream: &dyn BatchStream,
        eval_stream: &dyn BatchStream,
    ) -> anyhow::Result<()> {
        let writer = RecordWriter::new(&self.config.record_path)?;
        while self.epoch <= self.config.epochs {
            self.run_epoch(train_stream, eval_stream, &writer)?;
        }
        Ok(())
    }

    fn run_epoch(
        &mut self,
        train_stream: &dyn BatchStream,
        eval_stream: &dyn BatchStream,
        writer: &RecordWriter,
    ) -> anyhow::Result<()> {
        // Persist state keyed to the epoch about to run.
        if let Some(manager) = self.checkpoint_manager() {
            manager.save(&self.capture_state()?)?;
        }

        // Deterministic epoch ordering, reproducible across resumes.
        let epoch_seed = self
            .config
            .seed
            .wrapping_mul(self.config.epochs as u64)
            .wrapping_add(self.epoch as u64);
        let mut rng = StdRng::seed_from_u64(epoch_seed);

        let start = Instant::now();

        let train_metrics = run_train_phase(
            train_stream,
            self.config.batch_size,
            &mut rng,
            &self.backbone,
            &self.head,
            &mut self.strategy,
            &mut self.optimizer,
            &mut self.scheduler,
            &self.device,
        )?;

        let alpha_layers = self.head.alpha_snapshot()?;

        let eval_metrics = run_eval_phase(
            eval_stream,
            self.config.val_batch_size,
            &self.backbone,
            &self.head,
            &self.device,
        )?;

        let curr_lr = self.optimizer.learning_rate();
        println!(
            "    Epoch {}: LR {:1.5} ||| aug_train_acc {:1.4} | val_acc {:1.4} ||| \
             aug_train_loss {:1.4} | val_loss {:1.4} ||| time = {:1.4}",
            self.epoch,
            curr_lr,
            train_metrics.accuracy(),
            eval_metrics.accuracy(),
            train_metrics.mean_loss(),
            eval_metrics.mean_loss(),
            start.elapsed().as_secs_f64(),
        );

        // Final epoch: recompute clean (no-gradient) train metrics and the
        // generalization gap against a clean eval pass.
        let mut epoch_train_loss = 0.0;
        let mut epoch_train_acc = 0.0;
        let mut gen_gap = 0.0;
        if self.epoch == self.config.epochs {
            let clean_train = run_eval_phase(
                train_stream,
                self.config.batch_size,
                &self.backbone,
                &self.head,
                &self.device,
            )?;
            let clean_eval = run_eval_phase(
                eval_stream,
                self.config.val_batch_size,
                &self.backbone,
                &self.head,
                &self.device,
            )?;
            epoch_train_loss = clean_train.mean_loss();
            epoch_train_acc = clean_train.accuracy();
            gen_gap = clean_eval.mean_loss() - clean_train.mean_loss();
        }

        let (alpha_primes, alphas) = format_alpha_layers(alpha_layers.as_deref());
        writer.append(&EpochRecord {
            dataset: self.config.dataset.clone(),
            seed: self.config.seed,
            epoch: self.epoch,
            time: start.elapsed().as_secs_f64(),
            actfun: self.head.actfun().to_string(),
            model: self.config.model.clone(),
            batch_size: self.config.batch_size,
            alpha_primes,
            alphas,
            num_params: self.num_head_params(),
            k: self.head_config.k,
            p: self.head_config.p,
            g: self.head_config.g,
            perm_method: self.head_config.perm_method.to_string(),
            gen_gap,
            epoch_train_loss,
            epoch_train_acc,
            epoch_aug_train_loss: train_metrics.mean_loss(),
            epoch_aug_train_acc: train_metrics.accuracy(),
            epoch_val_loss: eval_metrics.mean_loss(),
            epoch_val_acc: eval_metrics.accuracy(),
            curr_lr,
            found_lr: self.config.lr,
            epochs: self.config.epochs,
        })?;

        self.epoch += 1;
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use combinact_common::{ActFun, FeatureDataset, PermMethod};

    fn toy_streams() -> (FeatureDataset, FeatureDataset) {
        let train_features: Vec<f32> = (0..32).map(|i| ((i * 13) % 11) as f32 / 11.0).collect();
        let train_labels: Vec<u32> = (0..8).map(|i| i % 2).collect();
        let train = FeatureDataset::from_raw(train_features, train_labels, 4).unwrap();

        let eval_features: Vec<f32> = (0..16).map(|i| ((i * 7) % 5) as f32 / 5.0).collect();
        let eval_labels: Vec<u32> = (0..4).map(|i| i % 2).collect();
        let eval = FeatureDataset::from_raw(eval_features, eval_labels, 4).unwrap();
        (train, eval)
    }

    fn toy_head_config() -> HeadConfig {
        HeadConfig {
            actfun: ActFun::Max,
            input_dim: 8,
            output_dim: 2,
            k: 2,
            p: 1,
            g: 1,
            num_params: 3_000,
            perm_method: PermMethod::Shuffle,
        }
    }

    fn toy_trainer(
        epochs: usize,
        check_path: Option<PathBuf>,
        record_path: PathBuf,
    ) -> anyhow::Result<Trainer> {
        let device = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(100);
        let backbone = FrozenBackbone::random(4, 8, &device, &mut rng).unwrap();
        let config = TrainerConfig {
            dataset: "toy".to_string(),
            model: "toy-backbone".to_string(),
            epochs,
            seed: 42,
            batch_size: 4,
            val_batch_size: 4,
            lr: 0.01,
            weight_decay: 1e-5,
            steps_per_epoch: 2,
            amp: AmpMode::Off,
            check_path,
            record_path,
        };
        Trainer::new(backbone, toy_head_config(), config, device)
    }

    #[test]
    fn fresh_trainer_starts_at_epoch_one() {
        let dir = tempfile::tempdir().unwrap();
        let trainer = toy_trainer(2, None, dir.path().join("out.csv")).unwrap();
        assert_eq!(trainer.epoch(), 1);
    }

    #[test]
    fn captured_state_names_next_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let trainer = toy_trainer(3, None, dir.path().join("out.csv")).unwrap();
        let state = trainer.capture_state().unwrap();
        assert_eq!(state.epoch, 1);
        assert_eq!(state.k, 2);
        assert_eq!(state.actfun, ActFun::Max);
    }

    #[test]
    fn run_checkpoints_before_final_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let check = dir.path().join("run.json");
        let (train, eval) = toy_streams();

        let mut trainer =
            toy_trainer(2, Some(check.clone()), dir.path().join("out.csv")).unwrap();
        trainer.run(&train, &eval).unwrap();
        assert_eq!(trainer.epoch(), 3);

        // Last save happened before epoch 2 ran.
        let state = CheckpointManager::new(&check).load().unwrap().unwrap();
        assert_eq!(state.epoch, 2);
    }

    #[test]
    fn resume_picks_up_checkpoint_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let check = dir.path().join("run.json");
        let (train, eval) = toy_streams();

        let mut first =
            toy_trainer(2, Some(check.clone()), dir.path().join("a.csv")).unwrap();
        first.run(&train, &eval).unwrap();

        let resumed = toy_trainer(2, Some(check), dir.path().join("b.csv")).unwrap();
        assert_eq!(resumed.epoch(), 2);
        assert_eq!(resumed.num_head_params(), first.num_head_params());
    }

    #[test]
    fn resume_into_other_architecture_fails() {
        let dir = tempfile::tempdir().unwrap();
        let check = dir.path().join("run.json");
        let (train, eval) = toy_streams();

        let mut first =
            toy_trainer(1, Some(check.clone()), dir.path().join("a.csv")).unwrap();
        first.run(&train, &eval).unwrap();

        // Same run config, different head shape.
        let device = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(100);
        let backbone = FrozenBackbone::random(4, 8, &device, &mut rng).unwrap();
        let mut other_head = toy_head_config();
        other_head.k = 1;
        other_head.actfun = ActFun::Swish;
        let config = TrainerConfig {
            dataset: "toy".to_string(),
            model: "toy-backbone".to_string(),
            epochs: 2,
            seed: 42,
            batch_size: 4,
            val_batch_size: 4,
            lr: 0.01,
            weight_decay: 0.0,
            steps_per_epoch: 2,
            amp: AmpMode::Off,
            check_path: Some(check),
            record_path: dir.path().join("b.csv"),
        };
        let err = Trainer::new(backbone, other_head, config, device);
        assert!(err.is_err());
    }
}
