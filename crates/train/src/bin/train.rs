//! CLI for training the higher-order-activation classifier head.

use std::path::PathBuf;

use candle_core::Device;
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;

use combinact_common::{ActFun, FeatureDataset, HeadConfig, PermMethod};
use combinact_core::FrozenBackbone;
use combinact_train::{AmpMode, Trainer, TrainerConfig};

/// Embedding width of the default randomly-initialised backbone.
const DEFAULT_EMBED_DIM: usize = 1280;

#[derive(Parser, Debug)]
#[command(
    name = "combinact-train",
    about = "Train a classifier head with higher-order activations on frozen features"
)]
struct Args {
    /// Dataset root holding train/ and val/ (or validation/) splits.
    #[arg(long, default_value = "caltech101")]
    data: PathBuf,
    /// Backbone name recorded in the output rows.
    #[arg(long, default_value = "resnet101")]
    model: String,
    /// Pretrained backbone weights (.safetensors). Random-init when absent.
    #[arg(long)]
    backbone_weights: Option<PathBuf>,
    #[arg(long, default_value = "swish")]
    actfun: ActFun,
    /// Higher-order activation group size.
    #[arg(short, long, default_value = "2")]
    k: usize,
    /// Number of pre-activation permutations.
    #[arg(short, long, default_value = "1")]
    p: usize,
    /// Inter-layer group size.
    #[arg(short, long, default_value = "1")]
    g: usize,
    #[arg(long, default_value = "shuffle")]
    perm_method: PermMethod,
    #[arg(long, default_value = "1000")]
    num_classes: usize,
    /// Head trainable-parameter budget.
    #[arg(long, default_value = "1000000")]
    num_params: usize,
    #[arg(long, default_value = "200")]
    epochs: usize,
    #[arg(long, default_value = "42")]
    seed: u64,
    #[arg(short, long, default_value = "32")]
    batch_size: usize,
    /// Ratio of validation batch size to training batch size.
    #[arg(long, default_value = "1")]
    validation_batch_size_multiplier: usize,
    #[arg(long, default_value = "0.01")]
    lr: f64,
    #[arg(long, default_value = "1e-5")]
    weight_decay: f64,
    /// Mixed-precision mode: none, native, or apex.
    #[arg(long, default_value = "none", value_parser = ["none", "native", "apex"])]
    control_amp: String,
    #[arg(long)]
    native_amp: bool,
    #[arg(long)]
    apex_amp: bool,
    /// Directory for recording checkpoints; omit to disable checkpointing.
    /// A run resumes automatically when its checkpoint file already exists.
    #[arg(long)]
    check_path: Option<PathBuf>,
    /// Output folder for the CSV record.
    #[arg(long, default_value = ".")]
    output: PathBuf,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    tracing::info!(
        actfun = %args.actfun,
        lr = args.lr,
        epochs = args.epochs,
        p = args.p,
        k = args.k,
        g = args.g,
        seed = args.seed,
        "Starting run"
    );

    let amp = AmpMode::resolve(&args.control_amp, args.native_amp, args.apex_amp)?;

    // ── Datasets ────────────────────────────────────────────────────────────
    let (train_dir, eval_dir) = match resolve_split_dirs(&args.data) {
        Ok(dirs) => dirs,
        Err(e) => {
            tracing::error!("{e}");
            std::process::exit(1);
        }
    };

    let train_ds = FeatureDataset::open(&train_dir.join("features.bin"))?;
    let eval_ds = FeatureDataset::open(&eval_dir.join("features.bin"))?;
    eprintln!(
        "Loaded {} train / {} val samples of dim {}",
        train_ds.num_samples(),
        eval_ds.num_samples(),
        train_ds.feature_dim()
    );
    if train_ds.num_samples() == 0 || eval_ds.num_samples() == 0 {
        anyhow::bail!("empty dataset split");
    }

    // ── Models ──────────────────────────────────────────────────────────────
    let device = Device::cuda_if_available(0)?;
    let backbone = match &args.backbone_weights {
        Some(path) => FrozenBackbone::load(path, &device)?,
        None => {
            let mut rng = StdRng::seed_from_u64(args.seed);
            FrozenBackbone::random(train_ds.feature_dim(), DEFAULT_EMBED_DIM, &device, &mut rng)?
        }
    };
    if backbone.input_dim() != train_ds.feature_dim() {
        anyhow::bail!(
            "backbone expects {}-dim inputs but dataset provides {}",
            backbone.input_dim(),
            train_ds.feature_dim()
        );
    }

    let head_config = HeadConfig {
        actfun: args.actfun,
        input_dim: backbone.embed_dim(),
        output_dim: args.num_classes,
        k: args.k,
        p: args.p,
        g: args.g,
        num_params: args.num_params,
        perm_method: args.perm_method,
    };

    // ── Output files ────────────────────────────────────────────────────────
    let dataset_name = args
        .data
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "dataset".to_string());
    let stem = format!(
        "out_{}_{}_{}_{}",
        chrono::Local::now().date_naive(),
        args.actfun,
        dataset_name,
        args.seed
    );
    let record_path = args.output.join(format!("{stem}.csv"));
    let check_path = args
        .check_path
        .as_ref()
        .map(|d| d.join(format!("{stem}.json")));

    let steps_per_epoch = (train_ds.num_samples() / args.batch_size).max(1);
    let config = TrainerConfig {
        dataset: dataset_name,
        model: args.model.clone(),
        epochs: args.epochs,
        seed: args.seed,
        batch_size: args.batch_size,
        val_batch_size: args.batch_size * args.validation_batch_size_multiplier,
        lr: args.lr,
        weight_decay: args.weight_decay,
        steps_per_epoch,
        amp,
        check_path,
        record_path,
    };

    let record_display = config.record_path.clone();
    let mut trainer = Trainer::new(backbone, head_config, config, device)?;
    trainer.run(&train_ds, &eval_ds)?;
    eprintln!("Training done. Record written to {}", record_display.display());
    Ok(())
}

/// Locate the train and validation split directories under the dataset root.
/// Missing directories are fatal before any output file is created.
fn resolve_split_dirs(data: &std::path::Path) -> anyhow::Result<(PathBuf, PathBuf)> {
    let train_dir = data.join("train");
    if !train_dir.is_dir() {
        anyhow::bail!("Training folder does not exist at: {}", train_dir.display());
    }
    let eval_dir = data.join("val");
    if eval_dir.is_dir() {
        return Ok((train_dir, eval_dir));
    }
    let eval_dir = data.join("validation");
    if eval_dir.is_dir() {
        return Ok((train_dir, eval_dir));
    }
    anyhow::bail!("Validation folder does not exist at: {}", eval_dir.display());
}

// ── Tests ───────────────────────────────────────────────────────────────────
