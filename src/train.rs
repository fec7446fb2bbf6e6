use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::TrainConfig;
use crate::dataset::{Batch, DatasetConfig, DatasetError, PedestrianDataset, PedestrianSplit};
use crate::export::{
    format_heatmap, render_heatmap, save_heatmap_png, save_input_png, save_preview_montage,
    write_npy_f32, write_npy_u8,
};
use crate::inria::load_inria;
use crate::model::{PersonNet, PersonNetConfig};
use crate::tud::load_tud;

#[derive(Debug, Clone, Serialize)]
pub struct EpochMetrics {
    pub loss: f64,
    pub accuracy: f64,
    pub batches: usize,
}

#[derive(Debug, Clone, Serialize)]
struct EpochSummary {
    epoch: usize,
    train: EpochMetrics,
    epoch_seconds: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub train_examples: usize,
    pub test_examples: usize,
    pub test: EpochMetrics,
    pub output_dir: PathBuf,
}

/// Min, mean and max over every element.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TensorStats {
    pub min: f32,
    pub mean: f32,
    pub max: f32,
}

pub fn run_training(cfg: &TrainConfig) -> anyhow::Result<RunSummary> {
    cfg.validate()?;

    let mut combined = load_datasets(cfg)?;
    combined.truncate(cfg.max_samples);
    info!("{} training examples.", combined.train.len());
    info!("{} testing examples.", combined.test.len());

    let dataset_cfg = DatasetConfig {
        image_height: cfg.height,
        image_width: cfg.width,
        out_height: cfg.out_height,
        out_width: cfg.out_width,
        normalize: true,
        cache_root: cfg
            .cache_root
            .as_ref()
            .map(|path| PathBuf::from(path).expand_home()),
        require_cache: cfg.require_cache,
    };
    let train_split = PedestrianSplit::new(combined.train, dataset_cfg.clone())
        .context("Training split is empty")?;
    let test_split =
        PedestrianSplit::new(combined.test, dataset_cfg).context("Testing split is empty")?;

    let device = resolve_device(&cfg.device)?;
    info!("Using device: {device:?}");

    let (varmap, model) = build_model(cfg, &device)?;

    let adam_params = ParamsAdamW {
        lr: cfg.lr,
        weight_decay: 0.0,
        ..Default::default()
    };
    let mut optimizer = AdamW::new(varmap.all_vars(), adam_params)?;

    let output_dir = PathBuf::from(&cfg.output_dir).expand_home();
    let run_id = cfg
        .run_name
        .clone()
        .unwrap_or_else(|| Utc::now().format("%Y%m%d-%H%M%S").to_string());
    let run_dir = output_dir.join("runs").join(&run_id);
    let checkpoints_dir = run_dir.join("checkpoints");
    fs::create_dir_all(&checkpoints_dir).with_context(|| {
        format!(
            "Failed creating checkpoint directory: {}",
            checkpoints_dir.display()
        )
    })?;

    let config_path = run_dir.join("config.json");
    fs::write(&config_path, serde_json::to_string_pretty(cfg)?)
        .with_context(|| format!("Failed writing config: {}", config_path.display()))?;

    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let mut epoch_summaries = Vec::new();
    let mut global_step = 0usize;

    for epoch in 1..=cfg.epochs {
        let epoch_started = Instant::now();

        let mut train_indices: Vec<usize> = (0..train_split.len()).collect();
        train_indices.shuffle(&mut rng);

        let train_metrics = run_train_epoch(
            &model,
            &train_split,
            &train_indices,
            cfg,
            &device,
            &mut optimizer,
            &mut global_step,
        )?;

        let epoch_seconds = epoch_started.elapsed().as_secs_f64();
        let summary = EpochSummary {
            epoch,
            train: train_metrics.clone(),
            epoch_seconds,
        };
        epoch_summaries.push(summary.clone());

        info!(
            "Epoch {epoch}/{}: train_loss={:.4}, train_accuracy={:.4} ({:.1}s)",
            cfg.epochs, train_metrics.loss, train_metrics.accuracy, epoch_seconds
        );

        let last_ckpt = checkpoints_dir.join("last.safetensors");
        varmap
            .save(&last_ckpt)
            .with_context(|| format!("Failed writing checkpoint: {}", last_ckpt.display()))?;
        let last_meta = checkpoints_dir.join("last.json");
        fs::write(&last_meta, serde_json::to_string_pretty(&summary)?).with_context(|| {
            format!(
                "Failed writing checkpoint metadata: {}",
                last_meta.display()
            )
        })?;
    }

    let history_path = run_dir.join("metrics_history.json");
    fs::write(
        &history_path,
        serde_json::to_string_pretty(&epoch_summaries)?,
    )
    .with_context(|| {
        format!(
            "Failed writing training history: {}",
            history_path.display()
        )
    })?;

    let test_metrics = evaluate(&model, &test_split, cfg.batch_size, &device)?;
    info!("test accuracy {:.6}", test_metrics.accuracy);

    export_sample_prediction(&model, &test_split, &device, &output_dir)?;

    let summary = RunSummary {
        run_id: run_id.clone(),
        train_examples: train_split.len(),
        test_examples: test_split.len(),
        test: test_metrics,
        output_dir: output_dir.clone(),
    };
    let summary_path = run_dir.join("summary.json");
    fs::write(&summary_path, serde_json::to_string_pretty(&summary)?)
        .with_context(|| format!("Failed writing run summary: {}", summary_path.display()))?;

    info!("Run ID: {run_id}");
    info!("Artifacts written to: {}", output_dir.display());
    Ok(summary)
}

/// Initializes the network and, with `--resume`, overwrites its weights from
/// a checkpoint before any training step.
pub fn build_model(cfg: &TrainConfig, device: &Device) -> anyhow::Result<(VarMap, PersonNet)> {
    let mut varmap = VarMap::new();
    let model = PersonNet::new(&model_config(cfg), &varmap, device, cfg.seed)?;
    if let Some(resume) = &cfg.resume {
        let resume_path = PathBuf::from(resume).expand_home();
        varmap
            .load(&resume_path)
            .with_context(|| format!("Failed loading checkpoint: {}", resume_path.display()))?;
        info!("Resumed weights from {}", resume_path.display());
    }
    Ok((varmap, model))
}

pub fn load_datasets(cfg: &TrainConfig) -> anyhow::Result<PedestrianDataset> {
    let mut parts = Vec::new();
    for root in cfg.tud_roots() {
        let root = PathBuf::from(root).expand_home();
        let dataset = load_tud(&root, cfg.test_fraction, cfg.seed)
            .with_context(|| format!("Failed loading TUD dataset: {}", root.display()))?;
        debug!(
            root = %root.display(),
            train = dataset.train.len(),
            test = dataset.test.len(),
            "loaded TUD dataset"
        );
        parts.push(dataset);
    }
    if let Some(root) = cfg.inria_root() {
        let root = PathBuf::from(root).expand_home();
        let dataset = load_inria(&root)
            .with_context(|| format!("Failed loading INRIA dataset: {}", root.display()))?;
        parts.push(dataset);
    }
    Ok(parts.into_iter().sum())
}

pub fn model_config(cfg: &TrainConfig) -> PersonNetConfig {
    PersonNetConfig {
        image_height: cfg.height,
        image_width: cfg.width,
        out_height: cfg.out_height,
        out_width: cfg.out_width,
        dropout: cfg.dropout_prob(),
    }
}

/// Per-image sum of squared errors, averaged over the batch.
pub fn squared_error_loss(predictions: &Tensor, targets: &Tensor) -> candle_core::Result<Tensor> {
    predictions.sub(targets)?.sqr()?.sum(1)?.mean_all()
}

/// Share of images whose highest-scoring cell matches the target's.
pub fn batch_accuracy(predictions: &Tensor, targets: &Tensor) -> candle_core::Result<f32> {
    predictions
        .argmax(1)?
        .eq(&targets.argmax(1)?)?
        .to_dtype(DType::F32)?
        .mean_all()?
        .to_scalar::<f32>()
}

pub fn tensor_stats(tensor: &Tensor) -> candle_core::Result<TensorStats> {
    let flat = tensor.flatten_all()?.to_dtype(DType::F32)?;
    Ok(TensorStats {
        min: flat.min(0)?.to_scalar::<f32>()?,
        mean: flat.mean_all()?.to_scalar::<f32>()?,
        max: flat.max(0)?.to_scalar::<f32>()?,
    })
}

fn run_train_epoch(
    model: &PersonNet,
    split: &PedestrianSplit,
    indices: &[usize],
    cfg: &TrainConfig,
    device: &Device,
    optimizer: &mut AdamW,
    global_step: &mut usize,
) -> anyhow::Result<EpochMetrics> {
    let num_batches = indices.len().div_ceil(cfg.batch_size);
    let progress = ProgressBar::new(num_batches as u64);
    progress.set_style(progress_style());

    let mut total_loss = 0f64;
    let mut total_accuracy = 0f64;
    let mut batches = 0usize;

    for batch in split.iter_batches(indices, cfg.batch_size) {
        let step = *global_step;
        let (inputs, targets) = batch_tensors(&batch?, split, device)?;

        let eval_predictions = model.forward_t(&inputs, false)?;
        let train_accuracy = batch_accuracy(&eval_predictions, &targets)?;
        if cfg.log_every_batches > 0 && step % cfg.log_every_batches == 0 {
            let input_stats = tensor_stats(&inputs)?;
            let target_stats = tensor_stats(&targets)?;
            let pred_stats = tensor_stats(&eval_predictions)?;
            progress.suspend(|| {
                info!("step {step}, training accuracy {train_accuracy}");
                info!(
                    "Input Min: {} Avg: {} Max: {}",
                    input_stats.min, input_stats.mean, input_stats.max
                );
                info!(
                    "Y Min: {} Avg: {} Max: {}",
                    target_stats.min, target_stats.mean, target_stats.max
                );
                info!(
                    "Y_Conv Min: {} Avg: {} Max: {}",
                    pred_stats.min, pred_stats.mean, pred_stats.max
                );
            });
        }

        let predictions = model.forward_t(&inputs, true)?;
        let loss = squared_error_loss(&predictions, &targets)?;
        let loss_value = f64::from(loss.to_scalar::<f32>()?);
        if !loss_value.is_finite() {
            anyhow::bail!("Training diverged: loss is {loss_value} at step {step}");
        }
        optimizer.backward_step(&loss)?;

        total_loss += loss_value;
        total_accuracy += f64::from(train_accuracy);
        batches += 1;
        *global_step += 1;

        progress.set_message(format!("loss={loss_value:.4} acc={train_accuracy:.3}"));
        progress.inc(1);
    }
    progress.finish_and_clear();

    if batches == 0 {
        anyhow::bail!("No training batches were produced");
    }

    Ok(EpochMetrics {
        loss: total_loss / batches as f64,
        accuracy: total_accuracy / batches as f64,
        batches,
    })
}

/// Runs the model without dropout over a split; accuracy is the mean of
/// per-batch accuracies.
pub fn evaluate(
    model: &PersonNet,
    split: &PedestrianSplit,
    batch_size: usize,
    device: &Device,
) -> anyhow::Result<EpochMetrics> {
    if split.is_empty() {
        return Err(DatasetError::EmptySplit).context("Cannot evaluate the model");
    }
    let indices: Vec<usize> = (0..split.len()).collect();
    let progress = ProgressBar::new(indices.len().div_ceil(batch_size) as u64);
    progress.set_style(progress_style());

    let mut total_loss = 0f64;
    let mut total_accuracy = 0f64;
    let mut batches = 0usize;
    for batch in split.iter_batches(&indices, batch_size) {
        let (inputs, targets) = batch_tensors(&batch?, split, device)?;
        let predictions = model.forward_t(&inputs, false)?;
        total_accuracy += f64::from(batch_accuracy(&predictions, &targets)?);
        total_loss += f64::from(squared_error_loss(&predictions, &targets)?.to_scalar::<f32>()?);
        batches += 1;
        progress.inc(1);
    }
    progress.finish_and_clear();

    Ok(EpochMetrics {
        loss: total_loss / batches as f64,
        accuracy: total_accuracy / batches as f64,
        batches,
    })
}

pub fn batch_tensors(
    batch: &Batch,
    split: &PedestrianSplit,
    device: &Device,
) -> anyhow::Result<(Tensor, Tensor)> {
    let (h, w) = (split.cfg.image_height, split.cfg.image_width);
    let inputs = Tensor::from_slice(&batch.inputs, (batch.len, 3, h, w), device)
        .context("Failed to build input tensor")?;
    let targets = Tensor::from_slice(&batch.targets, (batch.len, split.target_len()), device)
        .context("Failed to build target tensor")?;
    Ok((inputs, targets))
}

/// Predicts the first test image and writes `y.npy`, `W1.npy`, `y_u8.npy`,
/// `out.png`, `input.png` and `preview.png` into `output_dir`.
pub fn export_sample_prediction(
    model: &PersonNet,
    split: &PedestrianSplit,
    device: &Device,
    output_dir: &Path,
) -> anyhow::Result<Vec<u8>> {
    fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed creating output dir: {}", output_dir.display()))?;
    let (h, w) = (split.cfg.image_height, split.cfg.image_width);
    let (out_h, out_w) = (split.cfg.out_height, split.cfg.out_width);

    let (inputs, _) = batch_tensors(&split.first_example(true)?, split, device)?;
    let prediction = model
        .forward_t(&inputs, false)?
        .to_device(&Device::Cpu)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    write_npy_f32(
        &output_dir.join("y.npy"),
        &[1, prediction.len()],
        &prediction,
    )?;

    let raw = split.first_example(false)?;
    let heatmap = render_heatmap(&prediction);
    save_input_png(&output_dir.join("input.png"), &raw.inputs, h, w)?;
    save_heatmap_png(&output_dir.join("out.png"), &heatmap, out_h, out_w)?;
    save_preview_montage(
        &output_dir.join("preview.png"),
        &raw.inputs,
        &heatmap,
        h,
        w,
        out_h,
        out_w,
    )?;
    info!("Predicted heatmap:\n{}", format_heatmap(&heatmap, out_w));

    let w1 = model.conv1_weight_hwio()?.to_device(&Device::Cpu)?;
    let w1_shape = w1.dims().to_vec();
    let w1_values = w1.flatten_all()?.to_vec1::<f32>()?;
    write_npy_f32(&output_dir.join("W1.npy"), &w1_shape, &w1_values)?;
    write_npy_u8(&output_dir.join("y_u8.npy"), out_h, out_w, &heatmap)?;

    Ok(heatmap)
}

fn resolve_device(device_arg: &str) -> anyhow::Result<Device> {
    match device_arg {
        "auto" => match Device::cuda_if_available(0) {
            Ok(device) => Ok(device),
            Err(_) => Ok(Device::Cpu),
        },
        "cpu" => Ok(Device::Cpu),
        "cuda" => Device::new_cuda(0)
            .context("CUDA requested with --device cuda, but CUDA is not available"),
        other => anyhow::bail!("Unsupported --device value: {other} (expected auto|cpu|cuda)"),
    }
}

fn progress_style() -> ProgressStyle {
    ProgressStyle::with_template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}

trait ExpandHome {
    fn expand_home(&self) -> PathBuf;
}

impl ExpandHome for PathBuf {
    fn expand_home(&self) -> PathBuf {
        let path_str = self.to_string_lossy();
        if !path_str.starts_with('~') {
            return self.clone();
        }

        let home = std::env::var("HOME").unwrap_or_else(|_| String::from("/"));
        if path_str == "~" {
            return PathBuf::from(home);
        }

        if let Some(stripped) = path_str.strip_prefix("~/") {
            return PathBuf::from(home).join(stripped);
        }

        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor(rows: &[&[f32]]) -> Tensor {
        let cols = rows[0].len();
        let flat: Vec<f32> = rows.iter().flat_map(|row| row.iter().copied()).collect();
        Tensor::from_vec(flat, (rows.len(), cols), &Device::Cpu).unwrap()
    }

    #[test]
    fn loss_sums_per_image_and_averages_over_batch() {
        let pred = tensor(&[&[1.0, 0.0, 0.5], &[0.0, 0.0, 0.0]]);
        let target = tensor(&[&[0.0, 0.0, 0.0], &[1.0, 1.0, 0.0]]);
        // (1 + 0 + 0.25) and (1 + 1 + 0), averaged.
        let loss = squared_error_loss(&pred, &target)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((loss - 1.625).abs() < 1e-6);
    }

    #[test]
    fn accuracy_compares_argmax() {
        let pred = tensor(&[&[0.1, 0.9, 0.2], &[0.8, 0.1, 0.3], &[0.2, 0.3, 0.7], &[0.6, 0.2, 0.1]]);
        let target = tensor(&[&[0.0, 1.0, 0.0], &[0.0, 0.0, 1.0], &[0.0, 0.0, 1.0], &[1.0, 0.5, 0.0]]);
        let accuracy = batch_accuracy(&pred, &target).unwrap();
        assert!((accuracy - 0.75).abs() < 1e-6);
    }

    #[test]
    fn stats_cover_all_elements() {
        let stats = tensor_stats(&tensor(&[&[-1.0, 2.0], &[3.0, 0.0]])).unwrap();
        assert_eq!(
            stats,
            TensorStats {
                min: -1.0,
                mean: 1.0,
                max: 3.0
            }
        );
    }

    #[test]
    fn model_config_maps_keep_prob_to_dropout() {
        let cfg = TrainConfig::default();
        let model_cfg = model_config(&cfg);
        assert_eq!(model_cfg.flat_len(), 64 * 60 * 80);
        assert_eq!(model_cfg.output_len(), 1024);
        assert!((model_cfg.dropout - 0.5).abs() < 1e-6);
    }

    #[test]
    fn expands_home_prefix() {
        let home = std::env::var("HOME").unwrap_or_else(|_| String::from("/"));
        assert_eq!(PathBuf::from("~/data").expand_home(), PathBuf::from(home).join("data"));
        assert_eq!(PathBuf::from("/abs").expand_home(), PathBuf::from("/abs"));
    }

    #[test]
    fn unknown_device_is_rejected() {
        assert!(resolve_device("tpu").is_err());
        assert!(matches!(resolve_device("cpu").unwrap(), Device::Cpu));
    }

    #[test]
    fn explicit_cuda_request_fails_without_cuda() {
        if candle_core::utils::cuda_is_available() {
            return;
        }
        let err = resolve_device("cuda").unwrap_err();
        assert!(format!("{err:#}").contains("CUDA is not available"));
    }
}
