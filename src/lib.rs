//! Chest radiograph fine-tuning
//!
//! Fine-tunes a convolutional classifier on chest radiographs to predict
//! clinical findings (multi-label) or, in an auxiliary mode, the image view
//! (AP / PA / other).
//!
//! # Architecture
//!
//! - **Evaluation**: batched prediction over a held-out dataset, per-label
//!   AUC or F1 aggregation into a [`metrics::MetricTable`]
//! - **Training loop**: epochs of forward/backward passes, plateau learning
//!   rate decay driven by mean validation AUC, per-epoch checkpoints and
//!   early stopping
//! - **Experiment driver**: picks the task mode, builds datasets, network,
//!   criterion and optimizer, then hands off to the loop
//!
//! # Example
//!
//! ```ignore
//! use cxr_finetune::{run_experiment, ExperimentConfig};
//!
//! let config = ExperimentConfig::default();
//! let summary = run_experiment(&config, "data/chexpert")?;
//! println!("best epoch {}", summary.best_epoch);
//! ```

pub mod config;
pub mod data;
pub mod evaluation;
pub mod experiment;
pub mod metrics;
pub mod models;
pub mod results;
pub mod task;
pub mod training;

// Re-export commonly used items
pub use config::{ExperimentConfig, Orientation};
pub use experiment::{run_experiment, RunSummary};
pub use models::{CxrNet, Network};
pub use task::TaskMode;

/// Library error types
#[derive(Debug, thiserror::Error)]
pub enum CxrError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Metric error: {0}")]
    Metric(#[from] metrics::MetricError),

    #[error("Training error: {0}")]
    Training(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    #[error("NumPy read error: {0}")]
    Npy(#[from] ndarray_npy::ReadNpyError),
}

pub type Result<T> = std::result::Result<T, CxrError>;
