/// Training infrastructure: loss, optimizer, plateau policy, checkpoints and the epoch loop

pub mod checkpoint;
pub mod loss;
pub mod optimizer;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::{Checkpoint, CheckpointMetadata, CheckpointStore};
pub use loss::Criterion;
pub use optimizer::{Adam, AdamConfig};
pub use scheduler::{EpochDecision, PlateauConfig, PlateauScheduler};
pub use trainer::{RunContext, Trainer, TrainingConfig};
