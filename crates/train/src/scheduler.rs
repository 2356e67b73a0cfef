//! One-cycle learning-rate schedule, stepped once per training batch.
//!
//! Cosine ramp from `max_lr / div_factor` up to `max_lr` over the first
//! `pct_start` of the run, then cosine anneal down to
//! `max_lr / (div_factor · final_div_factor)`. Steps past `total_steps`
//! clamp to the final rate rather than erroring, so a run whose epochs
//! yield a ragged final batch keeps training at the floor rate.

use crate::checkpoint::SchedulerState;

const PCT_START: f64 = 0.3;
const DIV_FACTOR: f64 = 25.0;
const FINAL_DIV_FACTOR: f64 = 1e4;

/// One-cycle schedule over a fixed step budget.
#[derive(Debug, Clone)]
pub struct OneCycleLr {
    step: usize,
    max_lr: f64,
    total_steps: usize,
}

impl OneCycleLr {
    /// * `max_lr` — peak learning rate.
    /// * `total_steps` — total training batches across all epochs.
    pub fn new(max_lr: f64, total_steps: usize) -> Self {
        Self {
            step: 0,
            max_lr,
            total_steps: total_steps.max(1),
        }
    }

    fn initial_lr(&self) -> f64 {
        self.max_lr / DIV_FACTOR
    }

    fn final_lr(&self) -> f64 {
        self.initial_lr() / FINAL_DIV_FACTOR
    }

    /// Cosine interpolation from `start` (pct 0) to `end` (pct 1).
    fn anneal(start: f64, end: f64, pct: f64) -> f64 {
        end + (start - end) / 2.0 * (1.0 + (std::f64::consts::PI * pct).cos())
    }

    /// Learning rate at the current step.
    pub fn current_lr(&self) -> f64 {
        let step = self.step.min(self.total_steps);
        let up_steps = ((PCT_START * self.total_steps as f64) as usize).max(1);
        if step <= up_steps {
            let pct = step as f64 / up_steps as f64;
            Self::anneal(self.initial_lr(), self.max_lr, pct)
        } else {
            let down_steps = (self.total_steps - up_steps).max(1);
            let pct = (step - up_steps) as f64 / down_steps as f64;
            Self::anneal(self.max_lr, self.final_lr(), pct)
        }
    }

    pub fn advance(&mut self) {
        self.step += 1;
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn state(&self) -> SchedulerState {
        SchedulerState { step: self.step }
    }

    pub fn load_state(&mut self, state: &SchedulerState) {
        self.step = state.step;
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
