/// Epoch loop with plateau decay, per-epoch checkpoints and early stopping
use candle_core::{DType, Device};
use candle_nn::Optimizer;
use std::time::Instant;

use crate::data::{BatchLoader, BatchOrder, CxrDataset};
use crate::evaluation::make_predictions;
use crate::metrics::MetricKind;
use crate::models::Network;
use crate::results::{EpochRow, RunSink};
use crate::task::TaskMode;
use super::checkpoint::{Checkpoint, CheckpointMetadata, CheckpointStore};
use super::loss::Criterion;
use super::optimizer::Adam;
use super::scheduler::{PlateauConfig, PlateauScheduler};

/// Training configuration
#[derive(Debug, Clone)]
pub struct TrainingConfig {
    /// Learning rate of the first epoch
    pub base_lr: f64,
    /// Weight decay (recorded in checkpoints; applied by the optimizer)
    pub weight_decay: f64,
    /// Maximum number of epochs
    pub max_epochs: usize,
    /// Batch size for training and validation
    pub batch_size: usize,
    /// Learning rate divisor on a non-improving epoch
    pub decay_factor: f64,
    /// Epochs without a new best before stopping
    pub patience: usize,
    /// Refuse to train on a non-CUDA device
    pub require_accelerator: bool,
    /// Validation data is a holdout carved out of the train fold
    pub holdout_from_train: bool,
    /// Random horizontal flips on training batches
    pub horizontal_flip: bool,
    /// Seed for the per-epoch shuffle
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            base_lr: 1e-4,
            weight_decay: 1e-4,
            max_epochs: 100,
            batch_size: 16,
            decay_factor: 10.0,
            patience: 3,
            require_accelerator: true,
            holdout_from_train: false,
            horizontal_flip: false,
            seed: 42,
        }
    }
}

/// Everything a run writes to or computes on
pub struct RunContext<'a> {
    pub device: Device,
    pub sink: &'a mut dyn RunSink,
    pub checkpoints: CheckpointStore,
}

/// Fine-tuning loop
pub struct Trainer<'a> {
    config: TrainingConfig,
    ctx: RunContext<'a>,
}

impl<'a> Trainer<'a> {
    /// Create new trainer
    pub fn new(config: TrainingConfig, ctx: RunContext<'a>) -> Self {
        Self { config, ctx }
    }

    /// Train until patience or `max_epochs` runs out
    ///
    /// Every epoch trains on shuffled batches, scores the validation set by
    /// mean defined AUC, updates the learning rate and writes a checkpoint.
    /// The model is finally restored from the best epoch's checkpoint.
    ///
    /// # Returns
    /// The restored model and its epoch (1-based)
    pub fn run<N, T, V>(
        &mut self,
        mut model: N,
        criterion: Criterion,
        mut optimizer: Adam,
        train: &T,
        val: &V,
        task_mode: TaskMode,
    ) -> crate::Result<(N, usize)>
    where
        N: Network,
        T: CxrDataset + ?Sized,
        V: CxrDataset + ?Sized,
    {
        if self.config.require_accelerator && !self.ctx.device.is_cuda() {
            return Err(crate::CxrError::Config(
                "training requires a CUDA device".to_string(),
            ));
        }
        if train.is_empty() || val.is_empty() {
            return Err(crate::CxrError::Config(format!(
                "empty dataset: {} train samples, {} validation samples",
                train.len(),
                val.len()
            )));
        }

        let config = self.config.clone();
        let start = Instant::now();

        let mut scheduler = PlateauScheduler::new(PlateauConfig {
            lr_init: config.base_lr,
            decay_factor: config.decay_factor,
            patience: config.patience,
        });
        optimizer.set_learning_rate(config.base_lr);

        let mut loader = BatchLoader::new(
            train.len(),
            config.batch_size,
            BatchOrder::Shuffled { seed: config.seed },
        )
        .with_horizontal_flip(config.horizontal_flip);

        let mut best_loss = f64::INFINITY;

        log::info!(
            "Training with {} for up to {} epochs ({} train / {} val samples, {} batches per epoch)",
            criterion,
            config.max_epochs,
            train.len(),
            val.len(),
            loader.num_batches()
        );
        if config.holdout_from_train {
            self.ctx.sink.note("WARNING: VALIDATING ON DATASET")?;
        }

        for epoch in 1..=config.max_epochs {
            self.ctx.sink.note(&format!("Epoch {}/{}", epoch, config.max_epochs))?;
            self.ctx.sink.note(&"-".repeat(10))?;

            model.set_training(true);
            loader.reset(epoch);

            let mut running_loss = 0.0f64;
            while let Some(batch) = loader.next_batch(train, &self.ctx.device)? {
                let outputs = model.forward(&batch.images)?;
                let loss = criterion.loss(&outputs, &batch.targets)?;
                optimizer.backward_step(&loss)?;

                running_loss += loss.to_dtype(DType::F64)?.to_scalar::<f64>()? * batch.len() as f64;
            }

            let epoch_loss = running_loss / train.len() as f64;
            self.ctx.sink.note(&format!(
                "train epoch {}: loss {:.4} with data size {}",
                epoch,
                epoch_loss,
                train.len()
            ))?;
            if epoch_loss < best_loss {
                best_loss = epoch_loss;
            }

            let (_, table) = make_predictions(
                &mut model,
                val,
                config.batch_size,
                task_mode,
                MetricKind::Auc,
                &self.ctx.device,
                &mut *self.ctx.sink,
            )?;
            let val_score = table.mean_defined();
            log::info!("Validation AUC by label:\n{}", table);
            self.ctx
                .sink
                .note(&format!("mean epoch validation accuracy: {}", val_score))?;

            let lr_before = scheduler.get_lr();
            let decision = scheduler.observe(epoch, val_score);
            if decision.decayed {
                self.ctx
                    .sink
                    .note(&format!("decay loss from {} to {}", lr_before, decision.lr))?;
                optimizer = optimizer.rebuild(model.trainable_vars(), decision.lr)?;
            }
            if decision.new_best {
                log::info!("New best validation score {:.4} at epoch {}", val_score, epoch);
            }

            let checkpoint = Checkpoint::new(
                model.named_tensors()?,
                CheckpointMetadata {
                    epoch,
                    best_epoch: scheduler.best_epoch(),
                    best_val_score: scheduler.best_score(),
                    last_val_score: val_score,
                    last_train_loss: epoch_loss,
                    lr: scheduler.get_lr(),
                    weight_decay: config.weight_decay,
                    metric: Some(table),
                    rng_seed: config.seed,
                    architecture: model.descriptor(),
                },
            );
            let path = self.ctx.checkpoints.save(&checkpoint)?;
            log::debug!("Saved checkpoint to {:?}", path);

            self.ctx.sink.epoch_row(&EpochRow {
                epoch,
                train_loss: epoch_loss,
                val_score,
            })?;

            let best_epoch = scheduler
                .best_epoch()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "none".to_string());
            self.ctx.sink.note(&format!(
                "best epoch: {}, best train loss: {:.4}, best val score: {:.4}",
                best_epoch,
                best_loss,
                scheduler.best_score()
            ))?;

            if decision.stop {
                self.ctx.sink.note(&format!(
                    "no improvement in {} epochs, break",
                    config.patience
                ))?;
                break;
            }
        }

        let elapsed = start.elapsed().as_secs();
        self.ctx.sink.note(&format!(
            "Training complete in {}m {}s",
            elapsed / 60,
            elapsed % 60
        ))?;

        let best_epoch = scheduler.best_epoch().ok_or_else(|| {
            crate::CxrError::Training(
                "validation score never rose above zero; there is no best checkpoint".to_string(),
            )
        })?;

        let checkpoint = self.ctx.checkpoints.load(best_epoch, &self.ctx.device)?;
        model.restore(&checkpoint.tensors)?;
        self.ctx.sink.note(&format!(
            "Restored epoch {} (val score {:.4})",
            best_epoch, checkpoint.metadata.last_val_score
        ))?;

        Ok((model, best_epoch))
    }
}
