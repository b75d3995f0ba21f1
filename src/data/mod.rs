/// Data loading for radiograph fine-tuning
pub mod numpy_dataset;
pub mod transforms;

pub use numpy_dataset::{DatasetManifest, DatasetSpec, Fold, ManifestRow, NpyDataset, UncertainPolicy};
pub use transforms::ImageTransform;

use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

/// Ground truth attached to a sample
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    /// Binary vector, one entry per finding label
    MultiHot(Vec<f32>),
    /// Class index for single-label tasks
    Class(u32),
}

/// One preprocessed image with its ground truth and source identifier
#[derive(Debug, Clone)]
pub struct Sample {
    /// Normalised image: [3, size, size]
    pub image: Tensor,
    pub target: Target,
    pub identifier: String,
}

/// Random-access supplier of samples
pub trait CxrDataset {
    /// Number of samples
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load the sample at `index`
    fn get(&self, index: usize) -> crate::Result<Sample>;

    /// Label column names, in target vector order
    fn label_names(&self) -> &[String];

    /// Sample identifiers aligned to dataset indices
    fn identifiers(&self) -> &[String];
}

/// A batch of stacked samples
#[derive(Debug, Clone)]
pub struct Batch {
    /// [batch, 3, size, size]
    pub images: Tensor,
    /// [batch, labels] f32 for multi-hot targets, [batch] u32 for class targets
    pub targets: Tensor,
    /// Dataset indices of the batch rows
    pub indices: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Batch iteration order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOrder {
    /// Dataset order, for evaluation
    Sequential,
    /// Reshuffled every epoch from `seed + epoch`
    Shuffled { seed: u64 },
}

/// Batch loader over any [`CxrDataset`]
///
/// The final batch may be smaller than `batch_size`.
pub struct BatchLoader {
    batch_size: usize,
    order: BatchOrder,
    horizontal_flip: bool,
    indices: Vec<usize>,
    current_idx: usize,
    rng: StdRng,
}

impl BatchLoader {
    /// Create new loader for a dataset of `num_samples`
    pub fn new(num_samples: usize, batch_size: usize, order: BatchOrder) -> Self {
        let seed = match order {
            BatchOrder::Shuffled { seed } => seed,
            BatchOrder::Sequential => 0,
        };

        let mut loader = Self {
            batch_size: batch_size.max(1),
            order,
            horizontal_flip: false,
            indices: (0..num_samples).collect(),
            current_idx: 0,
            rng: StdRng::seed_from_u64(seed),
        };
        loader.reset(0);
        loader
    }

    /// Flip each training image horizontally with probability 0.5
    pub fn with_horizontal_flip(mut self, enabled: bool) -> Self {
        self.horizontal_flip = enabled;
        self
    }

    /// Rewind for a new epoch, reshuffling when the order is shuffled
    pub fn reset(&mut self, epoch: usize) {
        self.current_idx = 0;
        self.indices.sort_unstable();

        if let BatchOrder::Shuffled { seed } = self.order {
            self.rng = StdRng::seed_from_u64(seed.wrapping_add(epoch as u64));
            self.indices.shuffle(&mut self.rng);
        }
    }

    /// Get number of batches
    pub fn num_batches(&self) -> usize {
        (self.indices.len() + self.batch_size - 1) / self.batch_size
    }

    /// Current visiting order
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Get next batch, or `None` once the epoch is exhausted
    pub fn next_batch<D: CxrDataset + ?Sized>(
        &mut self,
        dataset: &D,
        device: &Device,
    ) -> crate::Result<Option<Batch>> {
        if self.current_idx >= self.indices.len() {
            return Ok(None);
        }

        let end_idx = (self.current_idx + self.batch_size).min(self.indices.len());
        let batch_indices = self.indices[self.current_idx..end_idx].to_vec();
        self.current_idx = end_idx;

        let mut images = Vec::with_capacity(batch_indices.len());
        let mut multi_hot = Vec::new();
        let mut classes = Vec::new();

        for &idx in &batch_indices {
            let sample = dataset.get(idx)?;

            let image = if self.horizontal_flip && self.rng.gen_bool(0.5) {
                transforms::flip_horizontal(&sample.image)?
            } else {
                sample.image
            };
            images.push(image);

            match sample.target {
                Target::MultiHot(values) => multi_hot.push(values),
                Target::Class(class) => classes.push(class),
            }
        }

        let images = Tensor::stack(&images, 0)?.to_device(device)?;
        let batch_size = batch_indices.len();

        let targets = if classes.is_empty() {
            let num_labels = multi_hot.first().map(|v| v.len()).unwrap_or(0);
            let flat: Vec<f32> = multi_hot.into_iter().flatten().collect();
            Tensor::from_vec(flat, (batch_size, num_labels), device)?
        } else if multi_hot.is_empty() {
            Tensor::from_vec(classes, batch_size, device)?.to_dtype(DType::U32)?
        } else {
            return Err(crate::CxrError::Config(
                "dataset mixes multi-hot and class targets".to_string(),
            ));
        };

        Ok(Some(Batch {
            images,
            targets,
            indices: batch_indices,
        }))
    }
}

/// Dataset backed by preloaded tensors
pub struct InMemoryDataset {
    images: Vec<Tensor>,
    targets: Vec<Target>,
    label_names: Vec<String>,
    identifiers: Vec<String>,
}

impl InMemoryDataset {
    pub fn new(
        images: Vec<Tensor>,
        targets: Vec<Target>,
        label_names: Vec<String>,
        identifiers: Vec<String>,
    ) -> crate::Result<Self> {
        if images.len() != targets.len() || images.len() != identifiers.len() {
            return Err(crate::CxrError::Config(format!(
                "Length mismatch: {} images, {} targets, {} identifiers",
                images.len(),
                targets.len(),
                identifiers.len()
            )));
        }

        Ok(Self {
            images,
            targets,
            label_names,
            identifiers,
        })
    }
}

impl CxrDataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.images.len()
    }

    fn get(&self, index: usize) -> crate::Result<Sample> {
        let image = self.images.get(index).ok_or_else(|| {
            crate::CxrError::Config(format!("index {} out of range for {} samples", index, self.len()))
        })?;

        Ok(Sample {
            image: image.clone(),
            target: self.targets[index].clone(),
            identifier: self.identifiers[index].clone(),
        })
    }

    fn label_names(&self) -> &[String] {
        &self.label_names
    }

    fn identifiers(&self) -> &[String] {
        &self.identifiers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_dataset(n: usize) -> crate::Result<InMemoryDataset> {
        let device = Device::Cpu;
        let mut images = Vec::new();
        let mut targets = Vec::new();
        let mut ids = Vec::new();
        for i in 0..n {
            images.push(Tensor::full(i as f32, (3, 2, 2), &device)?);
            targets.push(Target::MultiHot(vec![(i % 2) as f32, 1.0]));
            ids.push(format!("img_{}.jpg", i));
        }
        InMemoryDataset::new(images, targets, vec!["Edema".into(), "Fracture".into()], ids)
    }

    #[test]
    fn test_sequential_batches_cover_dataset() -> crate::Result<()> {
        let dataset = toy_dataset(17)?;
        let mut loader = BatchLoader::new(dataset.len(), 16, BatchOrder::Sequential);
        assert_eq!(loader.num_batches(), 2);

        let first = loader.next_batch(&dataset, &Device::Cpu)?.unwrap();
        assert_eq!(first.images.dims(), &[16, 3, 2, 2]);
        assert_eq!(first.targets.dims(), &[16, 2]);
        assert_eq!(first.indices, (0..16).collect::<Vec<_>>());

        let last = loader.next_batch(&dataset, &Device::Cpu)?.unwrap();
        assert_eq!(last.indices, vec![16]);
        assert!(loader.next_batch(&dataset, &Device::Cpu)?.is_none());
        Ok(())
    }

    #[test]
    fn test_shuffle_is_reproducible_per_epoch() {
        let mut a = BatchLoader::new(50, 8, BatchOrder::Shuffled { seed: 7 });
        let mut b = BatchLoader::new(50, 8, BatchOrder::Shuffled { seed: 7 });
        a.reset(3);
        b.reset(3);
        assert_eq!(a.indices(), b.indices());

        let epoch3 = a.indices().to_vec();
        a.reset(4);
        assert_ne!(a.indices(), epoch3.as_slice());

        let mut sorted = a.indices().to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_class_targets_stack_as_u32() -> crate::Result<()> {
        let device = Device::Cpu;
        let images = vec![Tensor::zeros((3, 2, 2), DType::F32, &device)?; 3];
        let targets = vec![Target::Class(0), Target::Class(2), Target::Class(1)];
        let ids = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let dataset = InMemoryDataset::new(images, targets, vec![], ids)?;

        let mut loader = BatchLoader::new(dataset.len(), 4, BatchOrder::Sequential);
        let batch = loader.next_batch(&dataset, &device)?.unwrap();
        assert_eq!(batch.targets.dtype(), DType::U32);
        assert_eq!(batch.targets.to_vec1::<u32>()?, vec![0, 2, 1]);
        Ok(())
    }

    #[test]
    fn test_in_memory_length_mismatch() -> crate::Result<()> {
        let device = Device::Cpu;
        let images = vec![Tensor::zeros((3, 2, 2), DType::F32, &device)?];
        let result = InMemoryDataset::new(images, vec![], vec![], vec![]);
        assert!(result.is_err());
        Ok(())
    }
}
