//! # combinact-core — The Network Engine
//!
//! The two halves of the classifier:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`extractor`] | `FrozenBackbone` — pretrained, gradient-free embedder |
//! | [`activation`] | element-wise and `k`-grouped higher-order activations, `combinact` mixing |
//! | [`model`] | `Mlp` head, `GroupedLinear`, budget-sized hidden layers |
//!
//! Everything goes through `candle-core`/`candle-nn`; head parameters live in
//! the caller's `VarMap`, backbone weights are plain tensors and can never
//! receive gradients.

pub mod activation;
pub mod extractor;
pub mod model;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use activation::{GroupOp, HigherOrderActivation, LayerAlphas, COMBINACT_FAMILY};
pub use extractor::FrozenBackbone;
pub use model::{GroupedLinear, Mlp};
