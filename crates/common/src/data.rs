//! Data pipeline: feature-vector loading and batching.
//!
//! The orchestrator consumes pre-extracted sample vectors through the
//! [`BatchStream`] trait: a finite, restartable sequence of `(input, target)`
//! batches. The concrete implementation here is [`FeatureDataset`], an
//! in-memory dataset over the `CFV1` binary format written by
//! [`write_feature_file`]. Augmentation and raw-image decoding live outside
//! this crate; by the time data reaches the trainer it is flat `f32` vectors
//! plus `u32` class labels.
//!
//! Epoch ordering is never drawn from global RNG state: callers pass the
//! generator into [`BatchStream::shuffled_batches`], so two runs seeded the
//! same way see the same batch order.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result as AnyhowResult};
use candle_core::{Device, Result, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

// ── Feature binary format ───────────────────────────────────────────────────

/// Magic bytes for the feature-vector binary format (version 1).
const FEATURE_MAGIC: &[u8; 4] = b"CFV1";
/// Header size: magic (4) + num_samples (8) + feature_dim (4).
const FEATURE_HEADER_LEN: usize = 4 + 8 + 4;

/// Write sample vectors to a binary file for use with [`FeatureDataset`].
///
/// Format: magic "CFV1" (4 bytes), `num_samples` as u64 LE (8 bytes),
/// `feature_dim` as u32 LE (4 bytes), then per sample `feature_dim` × f32 LE
/// followed by the label as u32 LE.
pub fn write_feature_file(
    path: &Path,
    feature_dim: usize,
    features: &[f32],
    labels: &[u32],
) -> AnyhowResult<()> {
    if feature_dim == 0 {
        anyhow::bail!("feature_dim must be non-zero");
    }
    if features.len() != labels.len() * feature_dim {
        anyhow::bail!(
            "feature/label mismatch: {} values for {} samples of dim {}",
            features.len(),
            labels.len(),
            feature_dim
        );
    }
    let mut f = BufWriter::new(File::create(path).context("create feature file")?);
    f.write_all(FEATURE_MAGIC)?;
    f.write_all(&(labels.len() as u64).to_le_bytes())?;
    f.write_all(&(feature_dim as u32).to_le_bytes())?;
    for (i, &label) in labels.iter().enumerate() {
        for &v in &features[i * feature_dim..(i + 1) * feature_dim] {
            f.write_all(&v.to_le_bytes())?;
        }
        f.write_all(&label.to_le_bytes())?;
    }
    f.into_inner()?.sync_all().context("sync feature file")?;
    Ok(())
}

// ── FeatureDataset ──────────────────────────────────────────────────────────

/// In-memory dataset of `(feature vector, class label)` samples.
pub struct FeatureDataset {
    path: Option<PathBuf>,
    features: Vec<f32>,
    labels: Vec<u32>,
    feature_dim: usize,
}

impl FeatureDataset {
    /// Load a `CFV1` file fully into memory.
    pub fn open(path: &Path) -> AnyhowResult<Self> {
        let mut reader = BufReader::new(File::open(path).context("open feature file")?);
        let mut header = [0u8; FEATURE_HEADER_LEN];
        reader
            .read_exact(&mut header)
            .context("read feature file header")?;
        if &header[0..4] != FEATURE_MAGIC {
            anyhow::bail!("invalid feature file: bad magic");
        }
        let num_samples = u64::from_le_bytes(header[4..12].try_into().unwrap()) as usize;
        let feature_dim = u32::from_le_bytes(header[12..16].try_into().unwrap()) as usize;
        if feature_dim == 0 {
            anyhow::bail!("invalid feature file: zero feature dim");
        }

        let mut features = Vec::with_capacity(num_samples * feature_dim);
        let mut labels = Vec::with_capacity(num_samples);
        let mut f32_buf = [0u8; 4];
        for _ in 0..num_samples {
            for _ in 0..feature_dim {
                reader.read_exact(&mut f32_buf).context("truncated sample")?;
                features.push(f32::from_le_bytes(f32_buf));
            }
            reader.read_exact(&mut f32_buf).context("truncated label")?;
            labels.push(u32::from_le_bytes(f32_buf));
        }

        Ok(Self {
            path: Some(path.to_path_buf()),
            features,
            labels,
            feature_dim,
        })
    }

    /// Build a dataset from already-materialised vectors (tooling, tests).
    pub fn from_raw(features: Vec<f32>, labels: Vec<u32>, feature_dim: usize) -> AnyhowResult<Self> {
        if feature_dim == 0 {
            anyhow::bail!("feature_dim must be non-zero");
        }
        if features.len() != labels.len() * feature_dim {
            anyhow::bail!(
                "feature/label mismatch: {} values for {} samples of dim {}",
                features.len(),
                labels.len(),
                feature_dim
            );
        }
        Ok(Self {
            path: None,
            features,
            labels,
            feature_dim,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn num_samples(&self) -> usize {
        self.labels.len()
    }

    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    /// Write the dataset back out in `CFV1` form.
    pub fn write(&self, path: &Path) -> AnyhowResult<()> {
        write_feature_file(path, self.feature_dim, &self.features, &self.labels)
    }

    /// Yield `(features, labels)` batches following `order`. The final batch
    /// may hold fewer than `batch_size` samples.
    fn batches_in_order<'a>(
        &'a self,
        batch_size: usize,
        order: Vec<usize>,
    ) -> Box<dyn Iterator<Item = (Vec<f32>, Vec<u32>)> + 'a> {
        assert!(batch_size > 0, "batch_size must be non-zero");
        let dim = self.feature_dim;
        let mut start = 0usize;
        Box::new(std::iter::from_fn(move || {
            if start >= order.len() {
                return None;
            }
            let end = (start + batch_size).min(order.len());
            let mut features = Vec::with_capacity((end - start) * dim);
            let mut labels = Vec::with_capacity(end - start);
            for &i in &order[start..end] {
                features.extend_from_slice(&self.features[i * dim..(i + 1) * dim]);
                labels.push(self.labels[i]);
            }
            start = end;
            Some((features, labels))
        }))
    }
}

// ── BatchStream trait ───────────────────────────────────────────────────────

/// Common interface for sample sources that yield `(features, labels)` batches.
///
/// Streams are finite and restartable: each call to [`batches`] or
/// [`shuffled_batches`] starts a fresh pass over the full dataset.
pub trait BatchStream {
    fn num_samples(&self) -> usize;
    fn feature_dim(&self) -> usize;
    /// Deterministic sequential pass.
    fn batches(&self, batch_size: usize) -> Box<dyn Iterator<Item = (Vec<f32>, Vec<u32>)> + '_>;
    /// Pass in an order drawn from the caller's generator.
    fn shuffled_batches<'a>(
        &'a self,
        batch_size: usize,
        rng: &mut StdRng,
    ) -> Box<dyn Iterator<Item = (Vec<f32>, Vec<u32>)> + 'a>;
}

impl BatchStream for FeatureDataset {
    fn num_samples(&self) -> usize {
        self.num_samples()
    }

    fn feature_dim(&self) -> usize {
        self.feature_dim()
    }

    fn batches(&self, batch_size: usize) -> Box<dyn Iterator<Item = (Vec<f32>, Vec<u32>)> + '_> {
        let order: Vec<usize> = (0..self.num_samples()).collect();
        self.batches_in_order(batch_size, order)
    }

    fn shuffled_batches<'a>(
        &'a self,
        batch_size: usize,
        rng: &mut StdRng,
    ) -> Box<dyn Iterator<Item = (Vec<f32>, Vec<u32>)> + 'a> {
        let mut order: Vec<usize> = (0..self.num_samples()).collect();
        order.shuffle(rng);
        self.batches_in_order(batch_size, order)
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// Convert a raw batch to Candle tensors: `(batch, dim)` f32 inputs and
/// `(batch,)` u32 targets.
pub fn batch_to_tensors(
    features: &[f32],
    labels: &[u32],
    feature_dim: usize,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let batch = labels.len();
    let input = Tensor::from_vec(features.to_vec(), (batch, feature_dim), device)?;
    let target = Tensor::from_vec(labels.to_vec(), (batch,), device)?;
    Ok((input, target))
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn toy_dataset(samples: usize, dim: usize) -> FeatureDataset {
        let features: Vec<f32> = (0..samples * dim).map(|i| i as f32).collect();
        let labels: Vec<u32> = (0..samples as u32).collect();
        FeatureDataset::from_raw(features, labels, dim).unwrap()
    }

    #[test]
    fn feature_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("features.bin");
        let ds = toy_dataset(5, 3);
        ds.write(&path).unwrap();

        let loaded = FeatureDataset::open(&path).unwrap();
        assert_eq!(loaded.num_samples(), 5);
        assert_eq!(loaded.feature_dim(), 3);
        let (features, labels) = loaded.batches(5).next().unwrap();
        assert_eq!(labels, vec![0, 1, 2, 3, 4]);
        assert_eq!(features[..3], [0.0, 1.0, 2.0]);
    }

    #[test]
    fn bad_magic_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bogus.bin");
        std::fs::write(&path, b"NOPE0000000000000000").unwrap();
        assert!(FeatureDataset::open(&path).is_err());
    }

    #[test]
    fn last_batch_may_be_short() {
        let ds = toy_dataset(10, 2);
        let sizes: Vec<usize> = ds.batches(4).map(|(_, l)| l.len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[test]
    fn shuffled_batches_cover_all_samples() {
        let ds = toy_dataset(16, 2);
        let mut rng = StdRng::seed_from_u64(7);
        let mut seen: Vec<u32> = ds
            .shuffled_batches(5, &mut rng)
            .flat_map(|(_, l)| l)
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..16).collect::<Vec<u32>>());
    }

    #[test]
    fn shuffle_is_seed_deterministic() {
        let ds = toy_dataset(32, 1);
        let collect = |seed: u64| -> Vec<u32> {
            let mut rng = StdRng::seed_from_u64(seed);
            ds.shuffled_batches(8, &mut rng).flat_map(|(_, l)| l).collect()
        };
        assert_eq!(collect(3), collect(3));
        assert_ne!(collect(3), collect(4));
    }

    #[test]
    fn mismatched_raw_lengths_rejected() {
        assert!(FeatureDataset::from_raw(vec![0.0; 7], vec![0, 1], 3).is_err());
    }

    #[test]
    fn batch_to_tensors_shapes() {
        let ds = toy_dataset(4, 3);
        let (features, labels) = ds.batches(4).next().unwrap();
        let device = Device::Cpu;
        let (x, y) = batch_to_tensors(&features, &labels, 3, &device).unwrap();
        assert_eq!(x.dims(), &[4, 3]);
        assert_eq!(y.dims(), &[4]);
    }
}
