//! Epoch-level metric aggregation and the persisted experiment record.
//!
//! [`PhaseMetrics`] accumulates per-batch loss and correctness for one
//! (epoch, phase) pair. Mean loss is the unweighted mean over batches;
//! accuracy is sample-weighted since the final batch of a stream may be
//! short. [`RecordWriter`] appends one [`EpochRecord`] row per epoch to a
//! CSV log whose header is written once when the file is first created.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;

use combinact_core::LayerAlphas;

// ── PhaseMetrics ────────────────────────────────────────────────────────────

/// Running statistics for one pass over a batch stream.
#[derive(Debug, Clone, Default)]
pub struct PhaseMetrics {
    total_loss: f64,
    batch_count: usize,
    correct_count: usize,
    sample_count: usize,
}

impl PhaseMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in one batch's loss and correctness.
    pub fn record(&mut self, loss: f32, correct: usize, samples: usize) {
        self.total_loss += loss as f64;
        self.batch_count += 1;
        self.correct_count += correct;
        self.sample_count += samples;
    }

    pub fn batch_count(&self) -> usize {
        self.batch_count
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    /// Unweighted mean of per-batch losses. A phase with an empty stream is
    /// a caller error.
    pub fn mean_loss(&self) -> f64 {
        assert!(self.batch_count > 0, "phase consumed with no batches");
        self.total_loss / self.batch_count as f64
    }

    /// Sample-weighted accuracy.
    pub fn accuracy(&self) -> f64 {
        assert!(self.sample_count > 0, "phase consumed with no samples");
        self.correct_count as f64 / self.sample_count as f64
    }
}

// ── Alpha formatting ────────────────────────────────────────────────────────

/// Render per-layer mixing weights as nested lists for the record, e.g.
/// `[[0.1, -0.2], [0.0, 0.3]]`. Empty (no instrumentation) renders as `[]`.
pub fn format_alpha_layers(layers: Option<&[LayerAlphas]>) -> (String, String) {
    let Some(layers) = layers else {
        return ("[]".to_string(), "[]".to_string());
    };
    let fmt = |pick: fn(&LayerAlphas) -> &Vec<f32>| {
        let inner: Vec<String> = layers
            .iter()
            .map(|l| {
                let vals: Vec<String> = pick(l).iter().map(|v| format!("{v}")).collect();
                format!("[{}]", vals.join(", "))
            })
            .collect();
        format!("[{}]", inner.join(", "))
    };
    (fmt(|l| &l.raw), fmt(|l| &l.normalized))
}

// ── EpochRecord ─────────────────────────────────────────────────────────────

const FIELDNAMES: &str = "dataset,seed,epoch,time,actfun,model,batch_size,alpha_primes,alphas,\
num_params,k,p,g,perm_method,gen_gap,epoch_train_loss,epoch_train_acc,epoch_aug_train_loss,\
epoch_aug_train_acc,epoch_val_loss,epoch_val_acc,curr_lr,found_lr,epochs";

/// One persisted row of the experiment log.
#[derive(Debug, Clone)]
pub struct EpochRecord {
    pub dataset: String,
    pub seed: u64,
    pub epoch: usize,
    pub time: f64,
    pub actfun: String,
    pub model: String,
    pub batch_size: usize,
    pub alpha_primes: String,
    pub alphas: String,
    pub num_params: usize,
    pub k: usize,
    pub p: usize,
    pub g: usize,
    pub perm_method: String,
    pub gen_gap: f64,
    pub epoch_train_loss: f64,
    pub epoch_train_acc: f64,
    pub epoch_aug_train_loss: f64,
    pub epoch_aug_train_acc: f64,
    pub epoch_val_loss: f64,
    pub epoch_val_acc: f64,
    pub curr_lr: f64,
    pub found_lr: f64,
    pub epochs: usize,
}

impl EpochRecord {
    fn to_csv_row(&self) -> String {
        [
            csv_field(&self.dataset),
            self.seed.to_string(),
            self.epoch.to_string(),
            self.time.to_string(),
            csv_field(&self.actfun),
            csv_field(&self.model),
            self.batch_size.to_string(),
            csv_field(&self.alpha_primes),
            csv_field(&self.alphas),
            self.num_params.to_string(),
            self.k.to_string(),
            self.p.to_string(),
            self.g.to_string(),
            csv_field(&self.perm_method),
            self.gen_gap.to_string(),
            self.epoch_train_loss.to_string(),
            self.epoch_train_acc.to_string(),
            self.epoch_aug_train_loss.to_string(),
            self.epoch_aug_train_acc.to_string(),
            self.epoch_val_loss.to_string(),
            self.epoch_val_acc.to_string(),
            self.curr_lr.to_string(),
            self.found_lr.to_string(),
            self.epochs.to_string(),
        ]
        .join(",")
    }
}

/// Quote a field when it contains CSV metacharacters.
fn csv_field(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

// ── RecordWriter ────────────────────────────────────────────────────────────

/// Append-only CSV log, one row per epoch.
pub struct RecordWriter {
    path: PathBuf,
}

impl RecordWriter {
    /// Open (or create) the log. The header is written only when the file
    /// does not exist yet, so a resumed run keeps appending to its old rows.
    pub fn new(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create record dir {}", parent.display()))?;
            }
        }
        if !path.exists() {
            let mut f = std::fs::File::create(&path)
                .with_context(|| format!("create record file {}", path.display()))?;
            writeln!(f, "{FIELDNAMES}")?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &EpochRecord) -> anyhow::Result<()> {
        let mut f = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open record file {}", self.path.display()))?;
        writeln!(f, "{}", record.to_csv_row())?;
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
