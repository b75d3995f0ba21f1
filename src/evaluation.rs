/// Batched prediction over an evaluation dataset
use candle_core::{DType, Device};

use crate::data::{BatchLoader, BatchOrder, CxrDataset};
use crate::metrics::{self, GroundTruthRecord, MetricKind, MetricTable, PredictionRecord};
use crate::models::Network;
use crate::results::RunSink;
use crate::task::{TaskMode, ORIENTATION_LABELS};

/// Evaluation batch size
pub const DEFAULT_EVAL_BATCH_SIZE: usize = 16;

/// Run the model over `dataset` in dataset order
///
/// Leaves the model in inference mode; switching back to training is the
/// caller's job.
///
/// # Returns
/// Predictions and ground truths, one per sample, index-aligned with the
/// dataset's identifiers
pub fn evaluate<N, D>(
    model: &mut N,
    dataset: &D,
    batch_size: usize,
    task_mode: TaskMode,
    device: &Device,
) -> crate::Result<(Vec<PredictionRecord>, Vec<GroundTruthRecord>)>
where
    N: Network + ?Sized,
    D: CxrDataset + ?Sized,
{
    model.set_training(false);

    let identifiers = dataset.identifiers();
    let mut loader = BatchLoader::new(dataset.len(), batch_size, BatchOrder::Sequential);
    let mut predictions = Vec::with_capacity(dataset.len());
    let mut truths = Vec::with_capacity(dataset.len());

    log::info!("Evaluating on {} samples", dataset.len());

    while let Some(batch) = loader.next_batch(dataset, device)? {
        let probs = model
            .forward(&batch.images)?
            .to_dtype(DType::F32)?
            .to_vec2::<f32>()?;

        if probs.len() != batch.len() {
            return Err(crate::CxrError::Model(format!(
                "model returned {} rows for a batch of {}",
                probs.len(),
                batch.len()
            )));
        }

        let true_values: Vec<Vec<f32>> = match task_mode {
            TaskMode::MultiLabel => batch.targets.to_dtype(DType::F32)?.to_vec2::<f32>()?,
            TaskMode::Orientation => batch
                .targets
                .to_dtype(DType::U32)?
                .to_vec1::<u32>()?
                .into_iter()
                .map(binarize_class)
                .collect(),
        };

        for ((&index, scores), values) in batch.indices.iter().zip(probs).zip(true_values) {
            let identifier = identifiers[index].clone();
            predictions.push(PredictionRecord {
                identifier: identifier.clone(),
                scores,
            });
            truths.push(GroundTruthRecord { identifier, values });
        }
    }

    Ok((predictions, truths))
}

/// One-hot encode an orientation class against the fixed label set
fn binarize_class(class: u32) -> Vec<f32> {
    (0..ORIENTATION_LABELS.len())
        .map(|k| if k as u32 == class { 1.0 } else { 0.0 })
        .collect()
}

/// Full evaluation pass: predict, aggregate, persist
///
/// Writes the prediction table and the metric table to `sink`.
pub fn make_predictions<N, D>(
    model: &mut N,
    dataset: &D,
    batch_size: usize,
    task_mode: TaskMode,
    metric: MetricKind,
    device: &Device,
    sink: &mut dyn RunSink,
) -> crate::Result<(Vec<PredictionRecord>, MetricTable)>
where
    N: Network + ?Sized,
    D: CxrDataset + ?Sized,
{
    let (predictions, truths) = evaluate(model, dataset, batch_size, task_mode, device)?;

    let output_labels = task_mode.output_labels(dataset.label_names());
    let table = metrics::aggregate(&predictions, &truths, &output_labels, task_mode, metric)?;

    sink.predictions(&output_labels, &predictions)?;
    sink.metric_table(&table)?;

    Ok((predictions, table))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{InMemoryDataset, Target};
    use crate::models::{ArchitectureDescriptor, BackboneConfig, CxrNet};
    use crate::results::MemorySink;
    use candle_core::Tensor;

    fn probe(task_mode: TaskMode, num_outputs: usize) -> crate::Result<CxrNet> {
        CxrNet::new(
            &ArchitectureDescriptor {
                backbone: BackboneConfig { channels: vec![], dropout: 0.0 },
                task_mode,
                num_outputs,
            },
            &Device::Cpu,
        )
    }

    fn dataset(n: usize, orientation: bool) -> crate::Result<InMemoryDataset> {
        let device = Device::Cpu;
        let mut images = Vec::new();
        let mut targets = Vec::new();
        let mut ids = Vec::new();
        for i in 0..n {
            images.push(Tensor::full(i as f32 / n as f32, (3, 4, 4), &device)?);
            targets.push(if orientation {
                Target::Class((i % 3) as u32)
            } else {
                Target::MultiHot(vec![(i % 2) as f32, 0.0])
            });
            ids.push(format!("patient{:05}/view1_frontal.jpg", i));
        }
        let labels = if orientation {
            ORIENTATION_LABELS.iter().map(|s| s.to_string()).collect()
        } else {
            vec!["Edema".to_string(), "Fracture".to_string()]
        };
        InMemoryDataset::new(images, targets, labels, ids)
    }

    #[test]
    fn test_partial_final_batch_stays_aligned() -> crate::Result<()> {
        let data = dataset(17, false)?;
        let mut model = probe(TaskMode::MultiLabel, 2)?;

        let (preds, truths) = evaluate(&mut model, &data, 16, TaskMode::MultiLabel, &Device::Cpu)?;

        assert_eq!(preds.len(), 17);
        assert_eq!(truths.len(), 17);
        for (i, (p, t)) in preds.iter().zip(&truths).enumerate() {
            assert_eq!(p.identifier, t.identifier);
            assert_eq!(p.identifier, data.identifiers()[i]);
            assert_eq!(t.values[0], (i % 2) as f32);
        }
        assert_eq!(preds[16].identifier, data.identifiers()[16]);
        Ok(())
    }

    #[test]
    fn test_evaluate_switches_to_inference_mode() -> crate::Result<()> {
        let data = dataset(3, false)?;
        let mut model = probe(TaskMode::MultiLabel, 2)?;
        assert!(model.is_training());

        evaluate(&mut model, &data, DEFAULT_EVAL_BATCH_SIZE, TaskMode::MultiLabel, &Device::Cpu)?;

        assert!(!model.is_training());
        Ok(())
    }

    #[test]
    fn test_orientation_truths_are_binarized() -> crate::Result<()> {
        let data = dataset(5, true)?;
        let mut model = probe(TaskMode::Orientation, 3)?;

        let (preds, truths) = evaluate(&mut model, &data, 2, TaskMode::Orientation, &Device::Cpu)?;

        assert_eq!(truths[0].values, vec![1.0, 0.0, 0.0]);
        assert_eq!(truths[2].values, vec![0.0, 0.0, 1.0]);
        assert_eq!(truths[4].values, vec![0.0, 1.0, 0.0]);
        for p in &preds {
            let sum: f32 = p.scores.iter().sum();
            assert!((sum - 1.0).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn test_make_predictions_persists_tables() -> crate::Result<()> {
        let data = dataset(8, false)?;
        let mut model = probe(TaskMode::MultiLabel, 2)?;
        let mut sink = MemorySink::new();

        let (preds, table) = make_predictions(
            &mut model,
            &data,
            DEFAULT_EVAL_BATCH_SIZE,
            TaskMode::MultiLabel,
            MetricKind::Auc,
            &Device::Cpu,
            &mut sink,
        )?;

        assert_eq!(preds.len(), 8);
        assert_eq!(sink.predictions, preds);
        assert_eq!(sink.tables, vec![table.clone()]);

        // Fracture is all-negative, so only Edema is defined
        assert_eq!(table.rows.len(), 2);
        assert!(table.get("Edema").is_some_and(|auc| (0.0..=1.0).contains(&auc)));
        assert_eq!(table.get("Fracture"), None);
        Ok(())
    }
}
