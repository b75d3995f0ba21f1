/// Experiment configuration
///
/// High-level hyperparameters for one fine-tuning run, loadable from JSON.
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::task::TaskMode;

/// ImageNet channel means used for input normalisation
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNet channel standard deviations used for input normalisation
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Which radiograph views to train on
///
/// `Trainer` switches the run into view classification instead of finding
/// prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum Orientation {
    All,
    Ap,
    Pa,
    Lat,
    Trainer,
}

impl Orientation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Ap => "ap",
            Self::Pa => "pa",
            Self::Lat => "lat",
            Self::Trainer => "trainer",
        }
    }

    /// Task mode selected by this orientation
    pub fn task_mode(&self) -> TaskMode {
        match self {
            Self::Trainer => TaskMode::Orientation,
            _ => TaskMode::MultiLabel,
        }
    }

    /// Random horizontal flips are only applied when mixing every view
    pub fn uses_horizontal_flip(&self) -> bool {
        matches!(self, Self::All)
    }
}

impl FromStr for Orientation {
    type Err = crate::CxrError;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "all" => Ok(Self::All),
            "ap" => Ok(Self::Ap),
            "pa" => Ok(Self::Pa),
            "lat" => Ok(Self::Lat),
            "trainer" => Ok(Self::Trainer),
            other => Err(crate::CxrError::Config(format!(
                "Invalid orientation: {}. Must be one of 'all', 'ap', 'pa', 'lat', 'trainer'",
                other
            ))),
        }
    }
}

impl TryFrom<String> for Orientation {
    type Error = crate::CxrError;

    fn try_from(s: String) -> crate::Result<Self> {
        s.parse()
    }
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for a fine-tuning experiment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Initial learning rate
    pub learning_rate: f64,

    /// L2 weight decay passed to Adam
    pub weight_decay: f64,

    /// View selector (also selects the task mode)
    pub orientation: Orientation,

    /// Hold out 20% of the train fold for validation instead of using the val fold
    pub cross_val_on_train: bool,

    /// Number of training images to subsample
    pub num_images: Option<usize>,

    /// Resume model weights from this checkpoint
    pub checkpoint: Option<PathBuf>,

    /// Pretrained backbone weights (safetensors)
    pub pretrained_weights: Option<PathBuf>,

    /// Maximum number of epochs
    pub num_epochs: usize,

    /// Batch size for training and evaluation
    pub batch_size: usize,

    /// Square input resolution
    pub image_size: usize,

    /// Per-channel normalisation mean
    pub mean: [f32; 3],

    /// Per-channel normalisation std
    pub std: [f32; 3],

    /// Output directory for checkpoints, logs and prediction tables
    pub results_dir: PathBuf,

    /// Refuse to run without a CUDA device
    pub require_accelerator: bool,

    /// Seed for shuffling, subsampling and holdout masks
    pub seed: u64,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            weight_decay: 1e-4,
            orientation: Orientation::All,
            cross_val_on_train: false,
            num_images: None,
            checkpoint: None,
            pretrained_weights: None,
            num_epochs: 100,
            batch_size: 16,
            image_size: 224,
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
            results_dir: PathBuf::from("results"),
            require_accelerator: true,
            seed: 42,
        }
    }
}

impl ExperimentConfig {
    /// Load configuration from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let value: serde_json::Value = serde_json::from_reader(std::io::BufReader::new(file))?;

        // Surface a bad selector as a configuration error, not a JSON one
        if let Some(selector) = value.get("orientation").and_then(|v| v.as_str()) {
            selector.parse::<Orientation>()?;
        }

        let config: Self = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if !(self.learning_rate > 0.0) {
            return Err(crate::CxrError::Config(
                "learning_rate must be > 0".to_string(),
            ));
        }

        if self.weight_decay < 0.0 {
            return Err(crate::CxrError::Config(
                "weight_decay must be >= 0".to_string(),
            ));
        }

        if self.batch_size == 0 || self.num_epochs == 0 {
            return Err(crate::CxrError::Config(
                "batch_size and num_epochs must be > 0".to_string(),
            ));
        }

        if self.image_size == 0 {
            return Err(crate::CxrError::Config(
                "image_size must be > 0".to_string(),
            ));
        }

        if self.std.iter().any(|s| *s <= 0.0) {
            return Err(crate::CxrError::Config(
                "normalisation std must be > 0".to_string(),
            ));
        }

        if self.cross_val_on_train && self.num_images.is_none() {
            return Err(crate::CxrError::Config(
                "cross_val_on_train requires num_images to size the holdout mask".to_string(),
            ));
        }

        Ok(())
    }

    /// Task mode selected by the orientation
    pub fn task_mode(&self) -> TaskMode {
        self.orientation.task_mode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orientation_parsing() {
        assert_eq!("ap".parse::<Orientation>().unwrap(), Orientation::Ap);
        assert_eq!("trainer".parse::<Orientation>().unwrap(), Orientation::Trainer);
        assert!(matches!(
            "lateral".parse::<Orientation>(),
            Err(crate::CxrError::Config(_))
        ));
    }

    #[test]
    fn test_orientation_selects_task_mode() {
        assert_eq!(Orientation::Trainer.task_mode(), TaskMode::Orientation);
        assert_eq!(Orientation::Pa.task_mode(), TaskMode::MultiLabel);
        assert!(Orientation::All.uses_horizontal_flip());
        assert!(!Orientation::Lat.uses_horizontal_flip());
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = ExperimentConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch_size, 16);
        assert_eq!(config.num_epochs, 100);
    }

    #[test]
    fn test_config_from_json() {
        let json = r#"{
            "learning_rate": 0.001,
            "weight_decay": 0.0,
            "orientation": "trainer",
            "results_dir": "out"
        }"#;

        let config: ExperimentConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.orientation, Orientation::Trainer);
        assert_eq!(config.batch_size, 16);
        assert_eq!(config.results_dir, PathBuf::from("out"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_orientation_in_json_file_is_config_error() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.json");

        std::fs::write(&path, r#"{"orientation": "lateral", "learning_rate": 0.001}"#)?;
        assert!(matches!(
            ExperimentConfig::from_json_file(&path),
            Err(crate::CxrError::Config(_))
        ));

        std::fs::write(&path, r#"{"orientation": "pa"}"#)?;
        assert_eq!(ExperimentConfig::from_json_file(&path)?.orientation, Orientation::Pa);

        assert!(serde_json::from_str::<Orientation>(r#""lateral""#).is_err());
        assert_eq!(serde_json::to_string(&Orientation::Trainer)?, r#""trainer""#);
        Ok(())
    }

    #[test]
    fn test_cross_val_requires_image_count() {
        let config = ExperimentConfig {
            cross_val_on_train: true,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
