//! # combinact-common — Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`HeadConfig`]** — head architecture hyper-parameters (serialised as JSON).
//! * **[`ActFun`]** / **[`PermMethod`]** — closed activation / permutation choices.
//! * **[`FeatureDataset`]** / **[`BatchStream`]** — feature-vector loading & batching.
//! * **[`batch_to_tensors`]** — raw batch → Candle tensors.

pub mod config;
pub mod data;

pub use config::{ActFun, HeadConfig, PermMethod};
pub use data::{batch_to_tensors, write_feature_file, BatchStream, FeatureDataset};
