//! Phase runners: one full pass over a batch stream.
//!
//! The training pass drives the precision strategy and advances the
//! learning-rate schedule once per batch. The evaluation pass is also the
//! final-epoch "clean recompute" pass: forward only, no backward, no
//! optimizer, no schedule movement.

use candle_core::{Device, Result, Tensor, D};
use candle_nn::loss;
use rand::rngs::StdRng;

use combinact_common::{batch_to_tensors, BatchStream};
use combinact_core::{FrozenBackbone, Mlp};

use crate::metrics::PhaseMetrics;
use crate::optim::Adam;
use crate::precision::PrecisionStrategy;
use crate::scheduler::OneCycleLr;

/// Arg-max predictions compared against integer targets.
fn count_correct(logits: &Tensor, target: &Tensor) -> Result<usize> {
    let predictions = logits.argmax(D::Minus1)?;
    let correct = predictions
        .eq(target)?
        .to_dtype(candle_core::DType::U32)?
        .sum_all()?
        .to_scalar::<u32>()?;
    Ok(correct as usize)
}

/// One training pass in the epoch's shuffled order.
#[allow(clippy::too_many_arguments)]
pub fn run_train_phase(
    stream: &dyn BatchStream,
    batch_size: usize,
    rng: &mut StdRng,
    backbone: &FrozenBackbone,
    head: &Mlp,
    strategy: &mut PrecisionStrategy,
    optimizer: &mut Adam,
    scheduler: &mut OneCycleLr,
    device: &Device,
) -> anyhow::Result<PhaseMetrics> {
    let dim = stream.feature_dim();
    let mut metrics = PhaseMetrics::new();
    for (features, labels) in stream.shuffled_batches(batch_size, rng) {
        let (input, target) = batch_to_tensors(&features, &labels, dim, device)?;
        optimizer.set_learning_rate(scheduler.current_lr());
        let out = strategy.train_step(backbone, head, optimizer, &input, &target)?;
        scheduler.advance();

        let correct = count_correct(&out.logits, &target)?;
        metrics.record(out.loss, correct, labels.len());
    }
    Ok(metrics)
}

/// One no-gradient pass in stream order: evaluation, or a final-epoch clean
/// recompute. Leaves model, optimizer, and schedule untouched.
pub fn run_eval_phase(
    stream: &dyn BatchStream,
    batch_size: usize,
    backbone: &FrozenBackbone,
    head: &Mlp,
    device: &Device,
) -> anyhow::Result<PhaseMetrics> {
    let dim = stream.feature_dim();
    let mut metrics = PhaseMetrics::new();
    for (features, labels) in stream.batches(batch_size) {
        let (input, target) = batch_to_tensors(&features, &labels, dim, device)?;
        let embedded = backbone.forward(&input)?;
        let logits = head.forward(&embedded)?.detach();
        let batch_loss = loss::cross_entropy(&logits, &target)?;

        let correct = count_correct(&logits, &target)?;
        metrics.record(batch_loss.to_scalar::<f32>()?, correct, labels.len());
    }
    Ok(metrics)
}

// ── Tests ───────────────────────────────────────────────────────────────────
