/// Per-epoch model checkpointing with safetensors
use candle_core::{Device, Tensor};
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::metrics::MetricTable;
use crate::models::ArchitectureDescriptor;

/// Safetensors metadata key holding the JSON-encoded [`CheckpointMetadata`]
const METADATA_KEY: &str = "cxr_checkpoint";

/// Non-finite floats are stored as JSON null and read back as NaN
mod nan_as_null {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_some(value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
    }
}

/// Checkpoint metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Epoch this checkpoint was written after (1-based)
    pub epoch: usize,
    /// Best epoch so far, `None` if nothing beat the baseline yet
    pub best_epoch: Option<usize>,
    /// Best mean validation score so far
    #[serde(with = "nan_as_null")]
    pub best_val_score: f64,
    /// Mean validation score of this epoch
    #[serde(with = "nan_as_null")]
    pub last_val_score: f64,
    /// Mean training loss of this epoch
    #[serde(with = "nan_as_null")]
    pub last_train_loss: f64,
    /// Learning rate after this epoch's decay decision
    pub lr: f64,
    pub weight_decay: f64,
    /// Validation metric table of this epoch
    pub metric: Option<MetricTable>,
    /// Seed of the shuffling RNG; epoch order is derived from seed + epoch
    pub rng_seed: u64,
    /// Enough to rebuild the network before loading tensors
    pub architecture: ArchitectureDescriptor,
}

/// Model checkpoint
pub struct Checkpoint {
    /// Model parameters
    pub tensors: HashMap<String, Tensor>,
    /// Metadata
    pub metadata: CheckpointMetadata,
}

impl Checkpoint {
    /// Create new checkpoint
    pub fn new(tensors: HashMap<String, Tensor>, metadata: CheckpointMetadata) -> Self {
        Self { tensors, metadata }
    }

    /// Save checkpoint to a safetensors file with metadata in the header
    pub fn save<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        let metadata_json = serde_json::to_string(&self.metadata)?;
        let header = HashMap::from([(METADATA_KEY.to_string(), metadata_json)]);

        let mut names: Vec<&String> = self.tensors.keys().collect();
        names.sort();
        let data = names.into_iter().map(|name| (name.as_str(), &self.tensors[name]));

        safetensors::serialize_to_file(data, &Some(header), path.as_ref())?;
        Ok(())
    }

    /// Load checkpoint from file
    ///
    /// # Arguments
    /// * `path` - Path to checkpoint file
    /// * `device` - Device to load tensors on
    pub fn load<P: AsRef<Path>>(path: P, device: &Device) -> crate::Result<Self> {
        let buffer = std::fs::read(path.as_ref())?;

        let (_, header) = SafeTensors::read_metadata(&buffer)?;
        let metadata_json = header
            .metadata()
            .as_ref()
            .and_then(|m| m.get(METADATA_KEY))
            .ok_or_else(|| {
                crate::CxrError::Training(format!(
                    "{:?} has no checkpoint metadata",
                    path.as_ref()
                ))
            })?;
        let metadata: CheckpointMetadata = serde_json::from_str(metadata_json)?;

        let tensors = candle_core::safetensors::load_buffer(&buffer, device)?;

        Ok(Self { tensors, metadata })
    }
}

/// Directory of per-epoch checkpoints named `checkpoint_{epoch}.safetensors`
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, epoch: usize) -> PathBuf {
        self.dir.join(format!("checkpoint_{}.safetensors", epoch))
    }

    /// Persist a checkpoint under its epoch number
    pub fn save(&self, checkpoint: &Checkpoint) -> crate::Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(checkpoint.metadata.epoch);
        checkpoint.save(&path)?;
        Ok(path)
    }

    /// Load the checkpoint written after `epoch`
    pub fn load(&self, epoch: usize, device: &Device) -> crate::Result<Checkpoint> {
        let path = self.path_for(epoch);
        if !path.exists() {
            return Err(crate::CxrError::Training(format!(
                "no checkpoint for epoch {} at {:?}",
                epoch, path
            )));
        }
        Checkpoint::load(path, device)
    }
}
