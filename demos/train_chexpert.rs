/// CheXpert fine-tuning - train a finding or view classifier from a prepared .npy dataset
///
/// Usage: train_chexpert <data_dir> [config.json]
use cxr_finetune::{run_experiment, ExperimentConfig};

fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("=== CheXpert fine-tuning ===");

    let mut args = std::env::args().skip(1);
    let data_dir = args
        .next()
        .ok_or_else(|| anyhow::anyhow!("usage: train_chexpert <data_dir> [config.json]"))?;

    let config = match args.next() {
        Some(path) => {
            log::info!("Loading configuration from: {}", path);
            ExperimentConfig::from_json_file(&path)?
        }
        None => ExperimentConfig::default(),
    };
    log::info!("Experiment configuration: {:#?}", config);

    let summary = run_experiment(&config, &data_dir)?;

    log::info!("Training complete!");
    log::info!("  - Best epoch: {}", summary.best_epoch);
    log::info!("  - Validation AUC: {:.4}", summary.best_val_score);
    log::info!("  - Results: {:?}", summary.results_dir);

    Ok(())
}
