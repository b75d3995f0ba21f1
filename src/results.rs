/// Run artifacts: text log, per-epoch CSV log, prediction and metric tables
use chrono::Utc;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::metrics::{MetricTable, PredictionRecord};

/// Timestamp format used in the run log
const TIMESTAMP_FORMAT: &str = "%d %b %Y %H:%M:%S";

/// One row of the machine-readable epoch log
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochRow {
    pub epoch: usize,
    pub train_loss: f64,
    pub val_score: f64,
}

/// Destination for everything a run records
pub trait RunSink {
    /// Append a line to the human-readable run log
    fn log_line(&mut self, line: &str) -> crate::Result<()>;

    /// Append a row to the per-epoch log; the header goes in on epoch 1
    fn epoch_row(&mut self, row: &EpochRow) -> crate::Result<()>;

    /// Persist the latest prediction table
    fn predictions(&mut self, labels: &[String], records: &[PredictionRecord]) -> crate::Result<()>;

    /// Persist the latest metric table
    fn metric_table(&mut self, table: &MetricTable) -> crate::Result<()>;

    /// Print and durably log a line
    fn note(&mut self, line: &str) -> crate::Result<()> {
        log::info!("{}", line);
        self.log_line(line)
    }
}

/// File-backed results directory
pub struct ResultsDir {
    dir: PathBuf,
}

impl ResultsDir {
    /// Create a fresh results directory; an existing one is never reused
    pub fn create<P: AsRef<Path>>(dir: P) -> crate::Result<Self> {
        let dir = dir.as_ref();
        if dir.exists() {
            return Err(crate::CxrError::Config(format!(
                "results directory {:?} already exists; remove or rename it",
                dir
            )));
        }
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join("logger")
    }

    pub fn epoch_log_path(&self) -> PathBuf {
        self.dir.join("log_train")
    }

    pub fn predictions_path(&self) -> PathBuf {
        self.dir.join("preds.csv")
    }

    fn append(&self, path: PathBuf) -> crate::Result<fs::File> {
        Ok(OpenOptions::new().create(true).append(true).open(path)?)
    }
}

impl RunSink for ResultsDir {
    fn log_line(&mut self, line: &str) -> crate::Result<()> {
        let mut file = self.append(self.log_path())?;
        writeln!(file, "[{}] {}", Utc::now().format(TIMESTAMP_FORMAT), line)?;
        Ok(())
    }

    fn epoch_row(&mut self, row: &EpochRow) -> crate::Result<()> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(self.append(self.epoch_log_path())?);
        if row.epoch == 1 {
            writer.write_record(["epoch", "train_loss", "average auc"])?;
        }
        writer.write_record([
            row.epoch.to_string(),
            row.train_loss.to_string(),
            row.val_score.to_string(),
        ])?;
        writer.flush()?;
        Ok(())
    }

    fn predictions(&mut self, labels: &[String], records: &[PredictionRecord]) -> crate::Result<()> {
        let mut writer = csv::Writer::from_path(self.predictions_path())?;

        let mut header = vec!["Image Index".to_string()];
        header.extend(labels.iter().map(|l| format!("prob_{}", l)));
        writer.write_record(&header)?;

        for record in records {
            let mut row = vec![record.identifier.clone()];
            row.extend(record.scores.iter().map(|s| s.to_string()));
            writer.write_record(&row)?;
        }
        writer.flush()?;
        Ok(())
    }

    fn metric_table(&mut self, table: &MetricTable) -> crate::Result<()> {
        let mut writer = csv::Writer::from_path(self.dir.join(table.kind.table_file_name()))?;
        writer.write_record(["label", table.kind.as_str()])?;
        for row in &table.rows {
            let value = row.value.map(|v| v.to_string()).unwrap_or_default();
            writer.write_record([row.label.as_str(), value.as_str()])?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// In-memory sink for tests and dry runs
#[derive(Debug, Default)]
pub struct MemorySink {
    pub lines: Vec<String>,
    pub epochs: Vec<EpochRow>,
    pub predictions: Vec<PredictionRecord>,
    pub tables: Vec<MetricTable>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any logged line contains `needle`
    pub fn contains(&self, needle: &str) -> bool {
        self.lines.iter().any(|line| line.contains(needle))
    }
}

impl RunSink for MemorySink {
    fn log_line(&mut self, line: &str) -> crate::Result<()> {
        self.lines.push(line.to_string());
        Ok(())
    }

    fn epoch_row(&mut self, row: &EpochRow) -> crate::Result<()> {
        self.epochs.push(*row);
        Ok(())
    }

    fn predictions(&mut self, _labels: &[String], records: &[PredictionRecord]) -> crate::Result<()> {
        self.predictions = records.to_vec();
        Ok(())
    }

    fn metric_table(&mut self, table: &MetricTable) -> crate::Result<()> {
        self.tables.push(table.clone());
        Ok(())
    }
}
