/// Per-label metric aggregation over an evaluation pass
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::task::TaskMode;

/// Decision threshold applied to probabilities for F1
pub const F1_THRESHOLD: f32 = 0.5;

/// Why a per-label metric could not be computed
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MetricError {
    #[error("no samples to score")]
    Empty,

    #[error("length mismatch: {truths} truths vs {scores} scores")]
    LengthMismatch { truths: usize, scores: usize },

    #[error("only one class present ({positives} positives, {negatives} negatives)")]
    SingleClass { positives: usize, negatives: usize },

    #[error("no positive examples")]
    NoPositives,

    #[error("{count} non-finite scores")]
    NonFinite { count: usize },

    #[error("records misaligned at row {index}: prediction {prediction} vs truth {truth}")]
    Misaligned {
        index: usize,
        prediction: String,
        truth: String,
    },
}

/// Which scalar to compute per label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Auc,
    F1,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auc => "auc",
            Self::F1 => "f1",
        }
    }

    /// File name of the persisted metric table
    pub fn table_file_name(&self) -> &'static str {
        match self {
            Self::Auc => "aucs.csv",
            Self::F1 => "f1.csv",
        }
    }

    /// Compute this metric for one label column
    pub fn compute(&self, truths: &[bool], scores: &[f32]) -> Result<f64, MetricError> {
        match self {
            Self::Auc => roc_auc(truths, scores),
            Self::F1 => f1_score(truths, scores, F1_THRESHOLD),
        }
    }
}

impl FromStr for MetricKind {
    type Err = crate::CxrError;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "auc" => Ok(Self::Auc),
            "f1" => Ok(Self::F1),
            other => Err(crate::CxrError::Config(format!(
                "Invalid metric: {}. Must be 'auc' or 'f1'",
                other
            ))),
        }
    }
}

/// Predicted scores for one sample, in network output order
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionRecord {
    pub identifier: String,
    pub scores: Vec<f32>,
}

/// Ground truth for one sample, index-aligned with its prediction
#[derive(Debug, Clone, PartialEq)]
pub struct GroundTruthRecord {
    pub identifier: String,
    pub values: Vec<f32>,
}

/// One label's metric; `None` when undefined for this evaluation set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRow {
    pub label: String,
    pub value: Option<f64>,
}

/// Label -> metric value table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricTable {
    pub kind: MetricKind,
    pub rows: Vec<MetricRow>,
}

impl MetricTable {
    pub fn get(&self, label: &str) -> Option<f64> {
        self.rows
            .iter()
            .find(|row| row.label == label)
            .and_then(|row| row.value)
    }

    /// Mean over defined values; NaN when every label is undefined
    pub fn mean_defined(&self) -> f64 {
        let defined: Vec<f64> = self.rows.iter().filter_map(|row| row.value).collect();
        if defined.is_empty() {
            f64::NAN
        } else {
            defined.iter().sum::<f64>() / defined.len() as f64
        }
    }
}

impl fmt::Display for MetricTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self.rows.iter().map(|r| r.label.len()).max().unwrap_or(5).max(5);
        writeln!(f, "{:<width$}  {}", "label", self.kind.as_str(), width = width)?;
        for row in &self.rows {
            match row.value {
                Some(v) => writeln!(f, "{:<width$}  {:.6}", row.label, v, width = width)?,
                None => writeln!(f, "{:<width$}  NaN", row.label, width = width)?,
            }
        }
        Ok(())
    }
}

fn class_counts(truths: &[bool], scores: &[f32]) -> Result<(usize, usize), MetricError> {
    if truths.len() != scores.len() {
        return Err(MetricError::LengthMismatch {
            truths: truths.len(),
            scores: scores.len(),
        });
    }
    if truths.is_empty() {
        return Err(MetricError::Empty);
    }
    let non_finite = scores.iter().filter(|s| !s.is_finite()).count();
    if non_finite > 0 {
        return Err(MetricError::NonFinite { count: non_finite });
    }
    let positives = truths.iter().filter(|t| **t).count();
    Ok((positives, truths.len() - positives))
}

/// Area under the ROC curve (Mann-Whitney U with mid-ranks for ties)
pub fn roc_auc(truths: &[bool], scores: &[f32]) -> Result<f64, MetricError> {
    let (positives, negatives) = class_counts(truths, scores)?;
    if positives == 0 || negatives == 0 {
        return Err(MetricError::SingleClass { positives, negatives });
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    // Sum of (1-based, tie-averaged) ranks of the positives
    let mut positive_rank_sum = 0.0f64;
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && scores[order[end]] == scores[order[start]] {
            end += 1;
        }
        let mid_rank = (start + end + 1) as f64 / 2.0;
        let tied_positives = order[start..end].iter().filter(|&&i| truths[i]).count();
        positive_rank_sum += mid_rank * tied_positives as f64;
        start = end;
    }

    let p = positives as f64;
    let n = negatives as f64;
    Ok((positive_rank_sum - p * (p + 1.0) / 2.0) / (p * n))
}

/// F1 of thresholded scores against binary truths
pub fn f1_score(truths: &[bool], scores: &[f32], threshold: f32) -> Result<f64, MetricError> {
    let (positives, _) = class_counts(truths, scores)?;
    if positives == 0 {
        return Err(MetricError::NoPositives);
    }

    let mut tp = 0usize;
    let mut fp = 0usize;
    for (&truth, &score) in truths.iter().zip(scores) {
        if score >= threshold {
            if truth {
                tp += 1;
            } else {
                fp += 1;
            }
        }
    }
    let fn_ = positives - tp;

    Ok(2.0 * tp as f64 / (2 * tp + fp + fn_) as f64)
}

/// Aggregate aligned predictions and truths into a per-label table
///
/// `output_labels` names the score columns in network output order; only
/// labels scored under `task_mode` appear in the table. A label whose metric
/// cannot be computed is recorded as undefined.
pub fn aggregate(
    predictions: &[PredictionRecord],
    truths: &[GroundTruthRecord],
    output_labels: &[String],
    task_mode: TaskMode,
    kind: MetricKind,
) -> crate::Result<MetricTable> {
    if predictions.len() != truths.len() {
        return Err(MetricError::LengthMismatch {
            truths: truths.len(),
            scores: predictions.len(),
        }
        .into());
    }
    for (index, (pred, truth)) in predictions.iter().zip(truths).enumerate() {
        if pred.identifier != truth.identifier {
            return Err(MetricError::Misaligned {
                index,
                prediction: pred.identifier.clone(),
                truth: truth.identifier.clone(),
            }
            .into());
        }
    }

    let mut rows = Vec::new();
    for (column, label) in output_labels.iter().enumerate() {
        if !task_mode.is_scored_label(label) {
            continue;
        }

        let actual: Vec<bool> = truths
            .iter()
            .map(|t| t.values.get(column).copied().unwrap_or(0.0) >= 0.5)
            .collect();
        let scores: Vec<f32> = predictions
            .iter()
            .map(|p| p.scores.get(column).copied().unwrap_or(f32::NAN))
            .collect();

        let value = match kind.compute(&actual, &scores) {
            Ok(v) => Some(v),
            Err(e) => {
                log::debug!("can't calculate {} for {}: {}", kind.as_str(), label, e);
                None
            }
        };

        rows.push(MetricRow {
            label: label.clone(),
            value,
        });
    }

    Ok(MetricTable { kind, rows })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(
        truths: &[[f32; 2]],
        scores: &[[f32; 2]],
    ) -> (Vec<PredictionRecord>, Vec<GroundTruthRecord>) {
        let preds = scores
            .iter()
            .enumerate()
            .map(|(i, s)| PredictionRecord {
                identifier: format!("img_{}", i),
                scores: s.to_vec(),
            })
            .collect();
        let truths = truths
            .iter()
            .enumerate()
            .map(|(i, t)| GroundTruthRecord {
                identifier: format!("img_{}", i),
                values: t.to_vec(),
            })
            .collect();
        (preds, truths)
    }

    fn labels() -> Vec<String> {
        vec!["Edema".to_string(), "Cardiomegaly".to_string()]
    }

    #[test]
    fn test_auc_perfect_and_inverted() {
        let truths = [false, false, true, true];
        assert_eq!(roc_auc(&truths, &[0.1, 0.2, 0.8, 0.9]).unwrap(), 1.0);
        assert_eq!(roc_auc(&truths, &[0.9, 0.8, 0.2, 0.1]).unwrap(), 0.0);
    }

    #[test]
    fn test_auc_with_ties() {
        let auc = roc_auc(&[false, false, true, true], &[0.1, 0.4, 0.35, 0.8]).unwrap();
        assert!((auc - 0.75).abs() < 1e-12);

        let tied = roc_auc(&[false, true], &[0.5, 0.5]).unwrap();
        assert!((tied - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_auc_single_class_is_error() {
        assert_eq!(
            roc_auc(&[true, true], &[0.2, 0.3]),
            Err(MetricError::SingleClass { positives: 2, negatives: 0 })
        );
        assert_eq!(roc_auc(&[], &[]), Err(MetricError::Empty));
    }

    #[test]
    fn test_f1_score() {
        // tp=1, fp=1, fn=1
        let f1 = f1_score(&[true, false, true, false], &[0.9, 0.7, 0.2, 0.1], 0.5).unwrap();
        assert!((f1 - 0.5).abs() < 1e-12);
        assert_eq!(f1_score(&[false, false], &[0.9, 0.1], 0.5), Err(MetricError::NoPositives));
    }

    #[test]
    fn test_aggregate_records_undefined_labels() -> crate::Result<()> {
        // Cardiomegaly has only negatives
        let (preds, truths) = records(
            &[[0.0, 0.0], [1.0, 0.0], [1.0, 0.0]],
            &[[0.2, 0.1], [0.7, 0.4], [0.9, 0.3]],
        );

        let table = aggregate(&preds, &truths, &labels(), TaskMode::MultiLabel, MetricKind::Auc)?;

        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.get("Edema"), Some(1.0));
        assert_eq!(table.rows[1].value, None);
        assert_eq!(table.mean_defined(), 1.0);

        for row in table.rows.iter().filter_map(|r| r.value) {
            assert!((0.0..=1.0).contains(&row));
        }
        Ok(())
    }

    #[test]
    fn test_non_finite_scores_are_undefined() -> crate::Result<()> {
        assert_eq!(
            roc_auc(&[false, true, false, true], &[f32::NAN; 4]),
            Err(MetricError::NonFinite { count: 4 })
        );
        assert_eq!(
            f1_score(&[true, false], &[f32::INFINITY, 0.1], 0.5),
            Err(MetricError::NonFinite { count: 1 })
        );

        // Edema column diverged, Cardiomegaly is still scoreable
        let (preds, truths) = records(
            &[[0.0, 1.0], [1.0, 0.0], [1.0, 1.0], [0.0, 0.0]],
            &[[f32::NAN, 0.6], [0.6, 0.2], [0.4, 0.9], [0.1, 0.5]],
        );
        for kind in [MetricKind::Auc, MetricKind::F1] {
            let table = aggregate(&preds, &truths, &labels(), TaskMode::MultiLabel, kind)?;
            assert_eq!(table.rows[0].value, None);
            assert!(table.get("Cardiomegaly").is_some());
        }
        Ok(())
    }

    #[test]
    fn test_aggregate_is_idempotent() -> crate::Result<()> {
        let (preds, truths) = records(
            &[[0.0, 1.0], [1.0, 0.0], [1.0, 1.0], [0.0, 0.0]],
            &[[0.3, 0.6], [0.6, 0.2], [0.4, 0.9], [0.1, 0.5]],
        );

        for kind in [MetricKind::Auc, MetricKind::F1] {
            let first = aggregate(&preds, &truths, &labels(), TaskMode::MultiLabel, kind)?;
            let second = aggregate(&preds, &truths, &labels(), TaskMode::MultiLabel, kind)?;
            assert_eq!(first, second);
        }
        Ok(())
    }

    #[test]
    fn test_aggregate_skips_unscored_columns() -> crate::Result<()> {
        let (preds, truths) = records(&[[0.0, 1.0], [1.0, 0.0]], &[[0.1, 0.9], [0.8, 0.2]]);
        let columns = vec!["Edema".to_string(), "Age".to_string()];

        let table = aggregate(&preds, &truths, &columns, TaskMode::MultiLabel, MetricKind::Auc)?;

        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0].label, "Edema");
        Ok(())
    }

    #[test]
    fn test_aggregate_rejects_misaligned_records() {
        let (preds, mut truths) = records(&[[0.0, 1.0], [1.0, 0.0]], &[[0.1, 0.9], [0.8, 0.2]]);
        truths[1].identifier = "other".to_string();

        let result = aggregate(&preds, &truths, &labels(), TaskMode::MultiLabel, MetricKind::Auc);
        assert!(matches!(
            result,
            Err(crate::CxrError::Metric(MetricError::Misaligned { index: 1, .. }))
        ));
    }

    #[test]
    fn test_mean_of_all_undefined_is_nan() {
        let table = MetricTable {
            kind: MetricKind::Auc,
            rows: vec![MetricRow { label: "Edema".to_string(), value: None }],
        };
        assert!(table.mean_defined().is_nan());
    }

    #[test]
    fn test_metric_kind_parsing() {
        assert_eq!("f1".parse::<MetricKind>().unwrap(), MetricKind::F1);
        assert!("accuracy".parse::<MetricKind>().is_err());
    }
}
