//! # combinact-train — The Orchestration Engine
//!
//! Resumable training for the two-stage classifier:
//!
//! * **[`Trainer`]** — owns backbone, head, optimizer, schedule, and
//!   precision strategy. One call to [`Trainer::run`] drives checkpoint →
//!   re-seed → train → eval → (final epoch) clean recompute → record for
//!   every epoch.
//! * **[`PrecisionStrategy`]** — off / native dynamic-scale / apex-style
//!   static-scale execution of a training step.
//! * **[`CheckpointManager`]** — atomic single-file save/resume of the full
//!   [`TrainingState`].
//! * **[`OneCycleLr`]** — per-batch one-cycle learning-rate schedule.
//! * **[`PhaseMetrics`]** / **[`RecordWriter`]** — epoch aggregation and the
//!   append-only CSV experiment log.

pub mod checkpoint;
pub mod metrics;
pub mod optim;
pub mod precision;
pub mod runner;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::{CheckpointManager, TrainingState};
pub use metrics::{EpochRecord, PhaseMetrics, RecordWriter};
pub use optim::{Adam, ParamsAdam};
pub use precision::{AmpMode, GradScaler, PrecisionStrategy};
pub use runner::{run_eval_phase, run_train_phase};
pub use scheduler::OneCycleLr;
pub use trainer::{Trainer, TrainerConfig};
