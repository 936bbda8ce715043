/// Species distribution model runner: fetches occurrences, builds the study
/// area, fits a maxent model and writes every stage artifact to the data dir.
/// Stages whose inputs are unchanged are reloaded; `--force` recomputes all.
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use habitat_core::model::Scorer;
use habitat_core::{Pipeline, PipelineConfig};

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "sdm", about = "Fit and evaluate a presence/background species distribution model")]
struct Args {
    /// JSON pipeline configuration (omit for built-in defaults)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Artifact directory (overrides config)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Scientific name to model (overrides config)
    #[arg(long)]
    species: Option<String>,

    /// RNG seed for background sampling and the train/test split (overrides config)
    #[arg(long)]
    seed: Option<u64>,

    /// Recompute every stage, ignoring cached artifacts
    #[arg(long)]
    force: bool,
}

fn load_config(args: &Args) -> Result<PipelineConfig> {
    let mut cfg = match &args.config {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("Cannot load config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(dir) = &args.data_dir {
        cfg.data_dir = dir.clone();
    }
    if let Some(species) = &args.species {
        cfg.species = species.clone();
    }
    if let Some(seed) = args.seed {
        cfg.seed = seed;
    }
    cfg.force_recompute |= args.force;
    cfg.validate().context("Invalid configuration")?;
    Ok(cfg)
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let cfg = load_config(&args)?;

    eprintln!("[sdm] {} (seed {}) -> {}", cfg.species, cfg.seed, cfg.data_dir.display());
    let pipeline = Pipeline::from_config(cfg).context("Failed to set up data sources")?;
    let run = pipeline.run().context("Pipeline failed")?;

    eprintln!("\n{:<20} {:>8} {:>10} {:>14}", "artifact", "cached", "time (ms)", "key");
    eprintln!("{}", "-".repeat(55));
    for s in &run.stages {
        eprintln!(
            "{:<20} {:>8} {:>10} {:>14}",
            s.artifact,
            if s.cached { "yes" } else { "no" },
            s.elapsed_ms,
            s.key
        );
    }

    let c = &run.collinearity;
    eprintln!("\nPredictors kept ({}): {}", c.kept.len(), c.kept.join(", "));
    for d in &c.dropped {
        eprintln!("  dropped {:<12} |r| = {:.3} with {}", d.name, d.correlation.abs(), d.partner);
    }

    let e = &run.evaluation;
    eprintln!(
        "\nTest set: {} presences, {} absences ({} skipped)",
        e.n_test_presences, e.n_test_absences, e.n_skipped
    );
    eprintln!("{:<10} {:>8}", "metric", "value");
    eprintln!("{}", "-".repeat(19));
    for (name, v) in [
        ("AUC", e.auc),
        ("threshold", e.threshold),
        ("TPR", e.tpr),
        ("FNR", e.fnr),
        ("FPR", e.fpr),
        ("TNR", e.tnr),
    ] {
        eprintln!("{name:<10} {v:>8.4}");
    }

    eprintln!(
        "\nSuitability map: {} of {} cells scored from {} predictors.",
        run.suitability.valid_count(),
        run.suitability.grid.len(),
        run.model.predictors().len()
    );
    println!("{}", serde_json::to_string_pretty(e).context("Failed to serialise evaluation")?);
    Ok(())
}
