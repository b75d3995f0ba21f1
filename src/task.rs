/// Task modes and their label sets
use serde::{Deserialize, Serialize};

use crate::training::loss::Criterion;

/// Findings scored in multi-label mode
pub const CHEXPERT_FINDINGS: [&str; 14] = [
    "No Finding",
    "Enlarged Cardiomediastinum",
    "Cardiomegaly",
    "Lung Opacity",
    "Lung Lesion",
    "Edema",
    "Consolidation",
    "Pneumonia",
    "Atelectasis",
    "Pneumothorax",
    "Pleural Effusion",
    "Pleural Other",
    "Fracture",
    "Support Devices",
];

/// View classes in orientation mode, indexed by class id
pub const ORIENTATION_LABELS: [&str; 3] = ["AP", "PA", "other"];

/// Head activation applied to the final linear layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeadActivation {
    /// Independent per-label probabilities
    Sigmoid,
    /// Scores normalised to sum to 1
    Softmax,
}

/// Supervised task the network is trained for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskMode {
    /// Independent binary prediction per finding
    MultiLabel,
    /// Single-label AP / PA / other classification
    Orientation,
}

impl TaskMode {
    /// Number of outputs for the classifier head
    ///
    /// Multi-label heads are sized to the dataset's label columns.
    pub fn num_outputs(&self, dataset_labels: usize) -> usize {
        match self {
            Self::MultiLabel => dataset_labels,
            Self::Orientation => ORIENTATION_LABELS.len(),
        }
    }

    pub fn head_activation(&self) -> HeadActivation {
        match self {
            Self::MultiLabel => HeadActivation::Sigmoid,
            Self::Orientation => HeadActivation::Softmax,
        }
    }

    pub fn criterion(&self) -> Criterion {
        match self {
            Self::MultiLabel => Criterion::BinaryCrossEntropy,
            Self::Orientation => Criterion::CrossEntropy,
        }
    }

    /// Names of the prediction columns, in network output order
    pub fn output_labels(&self, dataset_labels: &[String]) -> Vec<String> {
        match self {
            Self::MultiLabel => dataset_labels.to_vec(),
            Self::Orientation => ORIENTATION_LABELS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Whether a prediction column is scored by the metric aggregator
    pub fn is_scored_label(&self, label: &str) -> bool {
        match self {
            Self::MultiLabel => CHEXPERT_FINDINGS.contains(&label),
            Self::Orientation => ORIENTATION_LABELS.contains(&label),
        }
    }
}

/// Map a radiograph view to its orientation class id
pub fn orientation_class(view: &str) -> u32 {
    match view {
        "AP" => 0,
        "PA" => 1,
        _ => 2,
    }
}
