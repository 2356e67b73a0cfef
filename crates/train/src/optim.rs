//! Adam optimizer over named `VarMap` parameters.
//!
//! Unlike the stock candle optimisers this one keys its moment buffers by
//! parameter name, so the full optimizer state can be captured into a
//! checkpoint and restored on resume. L2 regularisation is folded into the
//! gradient (`grad + weight_decay · θ`), matching classic Adam-with-L2
//! rather than decoupled AdamW.

use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::{Result, Tensor, Var};
use candle_nn::VarMap;

use crate::checkpoint::{OptimizerState, StateDict, TensorData};

/// Adam hyper-parameters.
#[derive(Debug, Clone, Copy)]
pub struct ParamsAdam {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for ParamsAdam {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

/// Adam with name-keyed, checkpointable moment buffers.
pub struct Adam {
    vars: Vec<(String, Var)>,
    params: ParamsAdam,
    step_count: usize,
    first_moments: HashMap<String, Tensor>,
    second_moments: HashMap<String, Tensor>,
}

impl Adam {
    /// Track every var currently registered in `varmap`, in name order.
    pub fn from_varmap(varmap: &VarMap, params: ParamsAdam) -> Self {
        let mut vars: Vec<(String, Var)> = varmap
            .data()
            .lock()
            .unwrap()
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            vars,
            params,
            step_count: 0,
            first_moments: HashMap::new(),
            second_moments: HashMap::new(),
        }
    }

    /// Tracked parameters, name-sorted.
    pub fn vars(&self) -> &[(String, Var)] {
        &self.vars
    }

    pub fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }

    pub fn step_count(&self) -> usize {
        self.step_count
    }

    /// One update over all tracked vars with a gradient in `grads`.
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.step_count += 1;
        let t = self.step_count as i32;
        let b1 = self.params.beta1;
        let b2 = self.params.beta2;
        let bias1 = 1.0 - b1.powi(t);
        let bias2 = 1.0 - b2.powi(t);

        for (name, var) in &self.vars {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            let theta = var.as_tensor();
            let grad = if self.params.weight_decay > 0.0 {
                (grad + theta.affine(self.params.weight_decay, 0.0)?)?
            } else {
                grad.clone()
            };

            let m_prev = match self.first_moments.get(name) {
                Some(m) => m.clone(),
                None => theta.zeros_like()?,
            };
            let v_prev = match self.second_moments.get(name) {
                Some(v) => v.clone(),
                None => theta.zeros_like()?,
            };

            let m = (m_prev.affine(b1, 0.0)? + grad.affine(1.0 - b1, 0.0)?)?;
            let v = (v_prev.affine(b2, 0.0)? + grad.sqr()?.affine(1.0 - b2, 0.0)?)?;

            let m_hat = m.affine(1.0 / bias1, 0.0)?;
            let v_hat = v.affine(1.0 / bias2, 0.0)?;
            let denom = v_hat.sqrt()?.affine(1.0, self.params.eps)?;
            let update = m_hat.div(&denom)?.affine(self.params.lr, 0.0)?;
            var.set(&(theta - update)?)?;

            self.first_moments.insert(name.clone(), m);
            self.second_moments.insert(name.clone(), v);
        }
        Ok(())
    }

    /// Capture moments and step counter for checkpointing.
    pub fn state(&self) -> Result<OptimizerState> {
        let mut first = StateDict::new();
        let mut second = StateDict::new();
        for (name, m) in &self.first_moments {
            first.insert(name.clone(), TensorData::from_tensor(m)?);
        }
        for (name, v) in &self.second_moments {
            second.insert(name.clone(), TensorData::from_tensor(v)?);
        }
        Ok(OptimizerState {
            step_count: self.step_count,
            first_moments: first,
            second_moments: second,
        })
    }

    /// Restore moments and step counter from a checkpoint.
    pub fn load_state(&mut self, state: &OptimizerState) -> Result<()> {
        self.step_count = state.step_count;
        self.first_moments.clear();
        self.second_moments.clear();
        for (name, var) in &self.vars {
            let device = var.as_tensor().device();
            if let Some(td) = state.first_moments.get(name) {
                self.first_moments.insert(name.clone(), td.to_tensor(device)?);
            }
            if let Some(td) = state.second_moments.get(name) {
                self.second_moments.insert(name.clone(), td.to_tensor(device)?);
            }
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{Init, VarBuilder};

    fn single_var(init: f32) -> (VarMap, Var) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        vb.get_with_hints((1,), "x", Init::Const(init as f64)).unwrap();
        let var = varmap.all_vars()[0].clone();
        (varmap, var)
    }

    #[test]
    fn quadratic_descends() {
        let (varmap, var) = single_var(5.0);
        let mut opt = Adam::from_varmap(
            &varmap,
            ParamsAdam {
                lr: 0.1,
                ..Default::default()
            },
        );
        for _ in 0..200 {
            let loss = var.as_tensor().sqr().unwrap().sum_all().unwrap();
            let grads = loss.backward().unwrap();
            opt.step(&grads).unwrap();
        }
        let x = var.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!(x.abs() < 0.5, "x did not descend: {x}");
    }

    #[test]
    fn vars_without_grads_untouched() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let used = vb.get_with_hints((1,), "used", Init::Const(1.0)).unwrap();
        let unused = vb.get_with_hints((1,), "unused", Init::Const(4.0)).unwrap();
        let mut opt = Adam::from_varmap(&varmap, ParamsAdam::default());

        let loss = used.sqr().unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        opt.step(&grads).unwrap();

        assert_eq!(unused.to_vec1::<f32>().unwrap(), vec![4.0]);
    }

    #[test]
    fn state_round_trip_is_exact() {
        let (varmap, var) = single_var(2.0);
        let mut opt = Adam::from_varmap(&varmap, ParamsAdam::default());
        for _ in 0..3 {
            let loss = var.as_tensor().sqr().unwrap().sum_all().unwrap();
            let grads = loss.backward().unwrap();
            opt.step(&grads).unwrap();
        }
        let state = opt.state().unwrap();
        assert_eq!(state.step_count, 3);

        let mut fresh = Adam::from_varmap(&varmap, ParamsAdam::default());
        fresh.load_state(&state).unwrap();
        assert_eq!(fresh.step_count(), 3);
        assert_eq!(fresh.state().unwrap(), state);
    }

    #[test]
    fn learning_rate_is_mutable() {
        let (varmap, _var) = single_var(0.0);
        let mut opt = Adam::from_varmap(&varmap, ParamsAdam::default());
        opt.set_learning_rate(0.05);
        assert_eq!(opt.learning_rate(), 0.05);
    }
}
