/// Experiment driver: datasets, network, criterion and optimizer for one fine-tuning run
use candle_core::Device;
use candle_nn::Optimizer;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::{Path, PathBuf};

use crate::config::ExperimentConfig;
use crate::data::{CxrDataset, DatasetSpec, Fold, ImageTransform, NpyDataset, UncertainPolicy};
use crate::evaluation::evaluate;
use crate::metrics::{self, MetricKind};
use crate::models::loader::load_pretrained_backbone;
use crate::models::{ArchitectureDescriptor, BackboneConfig, CxrNet, Network};
use crate::results::{ResultsDir, RunSink};
use crate::task::TaskMode;
use crate::training::{Adam, AdamConfig, Checkpoint, CheckpointStore, RunContext, Trainer, TrainingConfig};

/// Share of the subsampled train fold kept for training in holdout mode
const HOLDOUT_TRAIN_FRACTION: f64 = 0.8;

/// Outcome of a completed run
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Epoch whose checkpoint the final model was restored from
    pub best_epoch: usize,
    /// Mean defined validation AUC of the restored model
    pub best_val_score: f64,
    pub results_dir: PathBuf,
}

/// Run one fine-tuning experiment end to end
///
/// Writes checkpoints, the run logs and the final prediction and metric
/// tables under `config.results_dir`, which must not exist yet.
///
/// # Arguments
/// * `config` - Experiment configuration
/// * `data_root` - Directory holding `dataset.json`, `images.npy` and `labels.npy`
pub fn run_experiment<P: AsRef<Path>>(config: &ExperimentConfig, data_root: P) -> crate::Result<RunSummary> {
    config.validate()?;
    let device = select_device(config.require_accelerator)?;
    let mut results = ResultsDir::create(&config.results_dir)?;

    let task_mode = config.task_mode();
    results.note(&format!(
        "Running with WD {} and LR {}",
        config.weight_decay, config.learning_rate
    ))?;
    results.note(&format!("orientation: {} ({:?})", config.orientation, task_mode))?;
    let flip = config.orientation.uses_horizontal_flip();
    results.note(if flip {
        "augmenting training images with random horizontal flips"
    } else {
        "no horizontal flip augmentation"
    })?;

    let (train, val) = build_datasets(config, data_root.as_ref())?;
    let num_outputs = task_mode.num_outputs(train.label_names().len());

    let model = build_model(config, task_mode, num_outputs, &device)?;
    let criterion = task_mode.criterion();
    let optimizer = Adam::new(
        model.trainable_vars(),
        AdamConfig::new(config.learning_rate, config.weight_decay),
    )?;
    results.note(&format!("criterion: {}", criterion))?;

    let training_config = TrainingConfig {
        base_lr: config.learning_rate,
        weight_decay: config.weight_decay,
        max_epochs: config.num_epochs,
        batch_size: config.batch_size,
        require_accelerator: config.require_accelerator,
        holdout_from_train: config.cross_val_on_train,
        horizontal_flip: flip,
        seed: config.seed,
        ..Default::default()
    };

    let (mut model, best_epoch) = {
        let mut trainer = Trainer::new(
            training_config,
            RunContext {
                device: device.clone(),
                sink: &mut results,
                checkpoints: CheckpointStore::new(&config.results_dir),
            },
        );
        trainer.run(model, criterion, optimizer, &train, &val, task_mode)?
    };

    let (predictions, truths) = evaluate(&mut model, &val, config.batch_size, task_mode, &device)?;
    let output_labels = task_mode.output_labels(val.label_names());
    results.predictions(&output_labels, &predictions)?;

    let mut best_val_score = f64::NAN;
    for kind in [MetricKind::Auc, MetricKind::F1] {
        let table = metrics::aggregate(&predictions, &truths, &output_labels, task_mode, kind)?;
        results.note(&format!("final {} (mean {:.4}):\n{}", kind.as_str(), table.mean_defined(), table))?;
        if kind == MetricKind::Auc {
            best_val_score = table.mean_defined();
        }
        results.metric_table(&table)?;
    }

    Ok(RunSummary {
        best_epoch,
        best_val_score,
        results_dir: results.path().to_path_buf(),
    })
}

/// First CUDA device, or the CPU when an accelerator is optional
fn select_device(require_accelerator: bool) -> crate::Result<Device> {
    if candle_core::utils::cuda_is_available() {
        return Ok(Device::new_cuda(0)?);
    }
    if require_accelerator {
        return Err(crate::CxrError::Config(
            "no CUDA device available; set require_accelerator to false to train on CPU".to_string(),
        ));
    }
    log::warn!("CUDA unavailable, training on CPU");
    Ok(Device::Cpu)
}

/// Seeded mask with `round(0.8 * n)` true entries
fn holdout_mask(n: usize, seed: u64) -> Vec<bool> {
    let keep = (n as f64 * HOLDOUT_TRAIN_FRACTION).round() as usize;
    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(&mut StdRng::seed_from_u64(seed));

    let mut mask = vec![false; n];
    for &i in &order[..keep] {
        mask[i] = true;
    }
    mask
}

/// Train and validation datasets
///
/// With `cross_val_on_train` both come from the same subsample of the train
/// fold, split by a seeded 80/20 mask.
fn build_datasets(config: &ExperimentConfig, data_root: &Path) -> crate::Result<(NpyDataset, NpyDataset)> {
    let transform = ImageTransform::new(config.image_size, config.mean, config.std);

    let mut train_spec = DatasetSpec {
        uncertain: UncertainPolicy::Ones,
        sample: config.num_images,
        seed: config.seed,
        ..DatasetSpec::new(Fold::Train, config.orientation)
    };

    let val_spec = match (config.cross_val_on_train, config.num_images) {
        (true, Some(n)) => {
            let mask = holdout_mask(n, config.seed);
            let holdout = mask.iter().map(|keep| !keep).collect();
            train_spec.mask = Some(mask);
            DatasetSpec {
                mask: Some(holdout),
                ..train_spec.clone()
            }
        }
        (true, None) => {
            return Err(crate::CxrError::Config(
                "cross_val_on_train requires num_images".to_string(),
            ))
        }
        (false, _) => DatasetSpec {
            seed: config.seed,
            ..DatasetSpec::new(Fold::Val, config.orientation)
        },
    };

    let train = NpyDataset::from_directory(data_root, &train_spec, transform.clone())?;
    let val = NpyDataset::from_directory(data_root, &val_spec, transform)?;
    Ok((train, val))
}

/// Fresh network, optionally with pretrained backbone weights, or one resumed from a checkpoint
fn build_model(
    config: &ExperimentConfig,
    task_mode: TaskMode,
    num_outputs: usize,
    device: &Device,
) -> crate::Result<CxrNet> {
    if let Some(path) = &config.checkpoint {
        let checkpoint = Checkpoint::load(path, device)?;
        let architecture = &checkpoint.metadata.architecture;
        log::info!(
            "Resuming from {:?} (epoch {}, {:?} head with {} outputs)",
            path,
            checkpoint.metadata.epoch,
            architecture.task_mode,
            architecture.num_outputs
        );

        let mut model = CxrNet::from_parameters(architecture, &checkpoint.tensors, device)?;
        if architecture.task_mode != task_mode || architecture.num_outputs != num_outputs {
            log::info!("Replacing head for {:?} with {} outputs", task_mode, num_outputs);
            model.replace_head(task_mode, num_outputs)?;
        }
        return Ok(model);
    }

    let model = CxrNet::new(
        &ArchitectureDescriptor {
            backbone: BackboneConfig::default(),
            task_mode,
            num_outputs,
        },
        device,
    )?;
    if let Some(weights) = &config.pretrained_weights {
        load_pretrained_backbone(&model, weights)?;
    }
    Ok(model)
}
