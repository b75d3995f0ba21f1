/// NumPy-backed radiograph dataset (.npy images and labels plus a JSON manifest)
use candle_core::Device;
use ndarray::{Array2, Array3};
use ndarray_npy::ReadNpyExt;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use super::{CxrDataset, ImageTransform, Sample, Target};
use crate::config::Orientation;
use crate::task::{orientation_class, TaskMode};

/// Dataset partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Fold {
    Train,
    Val,
}

/// How uncertain (-1) labels are resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UncertainPolicy {
    Ones,
    Zeros,
}

impl UncertainPolicy {
    /// Resolve a raw label cell; blanks (NaN) are negative
    pub fn resolve(&self, raw: f32) -> f32 {
        if raw.is_nan() {
            0.0
        } else if raw < 0.0 {
            match self {
                Self::Ones => 1.0,
                Self::Zeros => 0.0,
            }
        } else if raw > 0.0 {
            1.0
        } else {
            0.0
        }
    }
}

/// One manifest row
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ManifestRow {
    /// Image path, used as the sample identifier
    pub id: String,
    pub fold: Fold,
    /// AP, PA, LL, ...
    #[serde(default)]
    pub view: String,
    #[serde(default)]
    pub lateral: bool,
}

/// Contents of dataset.json
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatasetManifest {
    pub label_names: Vec<String>,
    pub rows: Vec<ManifestRow>,
}

/// Construction parameters for a dataset view
#[derive(Debug, Clone)]
pub struct DatasetSpec {
    pub fold: Fold,
    pub uncertain: UncertainPolicy,
    pub orientation: Orientation,
    /// Seeded subsample of at most this many rows
    pub sample: Option<usize>,
    /// Keep only rows where the mask is true (applied after subsampling)
    pub mask: Option<Vec<bool>>,
    pub seed: u64,
}

impl DatasetSpec {
    pub fn new(fold: Fold, orientation: Orientation) -> Self {
        Self {
            fold,
            uncertain: UncertainPolicy::Zeros,
            orientation,
            sample: None,
            mask: None,
            seed: 42,
        }
    }

    fn keeps(&self, row: &ManifestRow) -> bool {
        if row.fold != self.fold {
            return false;
        }
        match self.orientation {
            Orientation::All | Orientation::Trainer => true,
            Orientation::Ap => !row.lateral && row.view == "AP",
            Orientation::Pa => !row.lateral && row.view == "PA",
            Orientation::Lat => row.lateral,
        }
    }
}

/// Dataset loaded from NumPy .npy files
pub struct NpyDataset {
    images: Array3<u8>,   // [N, H, W]
    labels: Array2<f32>,  // [N, num_labels]
    manifest: DatasetManifest,
    rows: Vec<usize>,
    identifiers: Vec<String>,
    label_names: Vec<String>,
    task_mode: TaskMode,
    uncertain: UncertainPolicy,
    transform: ImageTransform,
    device: Device,
}

impl NpyDataset {
    /// Load from directory containing images.npy, labels.npy and dataset.json
    pub fn from_directory<P: AsRef<Path>>(
        path: P,
        spec: &DatasetSpec,
        transform: ImageTransform,
    ) -> crate::Result<Self> {
        let dir = path.as_ref();

        log::info!("Loading NumPy dataset from: {:?}", dir);

        let manifest_file = File::open(dir.join("dataset.json"))?;
        let manifest: DatasetManifest = serde_json::from_reader(BufReader::new(manifest_file))?;

        let images = <Array3<u8> as ReadNpyExt>::read_npy(File::open(dir.join("images.npy"))?)?;
        let labels = <Array2<f32> as ReadNpyExt>::read_npy(File::open(dir.join("labels.npy"))?)?;

        Self::from_arrays(images, labels, manifest, spec, transform)
    }

    /// Build from already loaded arrays
    pub fn from_arrays(
        images: Array3<u8>,
        labels: Array2<f32>,
        manifest: DatasetManifest,
        spec: &DatasetSpec,
        transform: ImageTransform,
    ) -> crate::Result<Self> {
        let total = manifest.rows.len();
        if images.shape()[0] != total || labels.nrows() != total {
            return Err(crate::CxrError::Config(format!(
                "Shape mismatch: {} manifest rows, images {:?}, labels {:?}",
                total,
                images.shape(),
                labels.shape()
            )));
        }
        if labels.ncols() != manifest.label_names.len() {
            return Err(crate::CxrError::Config(format!(
                "labels.npy has {} columns but manifest names {} labels",
                labels.ncols(),
                manifest.label_names.len()
            )));
        }

        let mut rows: Vec<usize> = (0..total).filter(|&i| spec.keeps(&manifest.rows[i])).collect();

        if let Some(n) = spec.sample {
            if n < rows.len() {
                let mut rng = StdRng::seed_from_u64(spec.seed);
                rows.shuffle(&mut rng);
                rows.truncate(n);
                rows.sort_unstable();
            }
        }

        if let Some(mask) = &spec.mask {
            if mask.len() != rows.len() {
                return Err(crate::CxrError::Config(format!(
                    "mask has {} entries but {} rows were selected",
                    mask.len(),
                    rows.len()
                )));
            }
            rows = rows
                .into_iter()
                .zip(mask.iter())
                .filter_map(|(row, &keep)| keep.then_some(row))
                .collect();
        }

        let identifiers = rows.iter().map(|&i| manifest.rows[i].id.clone()).collect();
        let task_mode = spec.orientation.task_mode();
        let label_names = match task_mode {
            TaskMode::MultiLabel => manifest.label_names.clone(),
            TaskMode::Orientation => task_mode.output_labels(&manifest.label_names),
        };

        log::info!(
            "{:?} fold: {} of {} rows selected (orientation={}, sample={:?})",
            spec.fold,
            rows.len(),
            total,
            spec.orientation,
            spec.sample
        );

        Ok(Self {
            images,
            labels,
            manifest,
            rows,
            identifiers,
            label_names,
            task_mode,
            uncertain: spec.uncertain,
            transform,
            device: Device::Cpu,
        })
    }
}

impl CxrDataset for NpyDataset {
    fn len(&self) -> usize {
        self.rows.len()
    }

    fn get(&self, index: usize) -> crate::Result<Sample> {
        let row = *self.rows.get(index).ok_or_else(|| {
            crate::CxrError::Config(format!("index {} out of range for {} samples", index, self.rows.len()))
        })?;

        let image = self.images.index_axis(ndarray::Axis(0), row);
        let (height, width) = image.dim();
        let pixels: Vec<u8> = image.iter().copied().collect();
        let image = self.transform.apply(&pixels, height, width, &self.device)?;

        let target = match self.task_mode {
            TaskMode::MultiLabel => Target::MultiHot(
                self.labels
                    .row(row)
                    .iter()
                    .map(|&raw| self.uncertain.resolve(raw))
                    .collect(),
            ),
            TaskMode::Orientation => Target::Class(orientation_class(&self.manifest.rows[row].view)),
        };

        Ok(Sample {
            image,
            target,
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
