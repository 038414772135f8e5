use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use recondet::{
    data::{synthetic, Table},
    model::ModelConfig,
    training::CancellationToken,
    AnomalyDetector, Config, ModelBundle, Pipeline,
};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbose logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Preset {
    Ecg,
    CreditCard,
}

#[derive(Clone, Copy, ValueEnum)]
enum SynthKind {
    Blobs,
    Waveform,
}

#[derive(Subcommand)]
enum Commands {
    /// Train on a labeled or unlabeled table and report detection quality
    Train {
        #[arg(short, long, value_name = "FILE")]
        dataset: PathBuf,

        #[arg(short, long, value_name = "FILE", conflicts_with = "preset")]
        config: Option<PathBuf>,

        #[arg(long, value_enum)]
        preset: Option<Preset>,

        /// Where to write the trained detector bundle
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Where to write the evaluation report as JSON
        #[arg(short, long, value_name = "FILE")]
        report: Option<PathBuf>,
    },

    /// Score every row of a table with a saved detector
    Detect {
        #[arg(short, long, value_name = "FILE")]
        dataset: PathBuf,

        #[arg(short, long, value_name = "FILE")]
        model: PathBuf,

        /// Overrides the threshold stored in the bundle
        #[arg(short, long)]
        threshold: Option<f32>,

        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Write a synthetic labeled table
    Synth {
        #[arg(short, long, value_enum, default_value = "blobs")]
        kind: SynthKind,

        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,

        #[arg(long, default_value_t = 1000)]
        normal: usize,

        #[arg(long, default_value_t = 50)]
        anomalous: usize,

        /// Feature count for blobs, samples per row for waveforms
        #[arg(long, default_value_t = 32)]
        width: usize,

        #[arg(long, default_value_t = 21)]
        seed: u64,
    },
}

fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    if let Err(e) = run(cli.command) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Train {
            dataset,
            config,
            preset,
            output,
            report,
        } => {
            let size_model = config.is_none() && preset.is_none();
            let config = match (config, preset) {
                (Some(path), _) => Config::from_json_file(&path)
                    .with_context(|| format!("failed to load config {}", path.display()))?,
                (None, Some(Preset::Ecg)) => Config::ecg(),
                (None, Some(Preset::CreditCard)) => Config::credit_card(),
                (None, None) => Config::default(),
            };

            let table = Table::from_json_file(&dataset)
                .with_context(|| format!("failed to load dataset {}", dataset.display()))?;
            println!("Starting training with {} rows...", table.len());

            let pipeline = Pipeline::new(config)?;
            let mut prepared = pipeline.prepare(&table)?;
            if size_model {
                let dim = prepared.data().feature_dim();
                prepared = prepared.with_model(ModelConfig::sized_for(dim));
            }
            let evaluated = prepared.train(&CancellationToken::new())?.evaluate()?;

            let trained = evaluated.trained();
            println!(
                "Training finished after {} epochs ({:?}), best epoch {}",
                trained.stats().history.len(),
                trained.stop_reason(),
                trained.best_epoch()
            );

            match evaluated.report() {
                Some(r) => {
                    r.print_report();
                    if let Some(path) = &report {
                        r.save_to_file(path)?;
                        println!("Report saved to {}", path.display());
                    }
                }
                None => println!(
                    "Threshold {:.6} flags {} of {} evaluation rows",
                    evaluated.threshold(),
                    evaluated.anomaly_count(),
                    evaluated.flags().len()
                ),
            }

            if let Some(path) = output {
                let detector = evaluated.into_detector()?;
                detector.to_bundle()?.save(&path)?;
                println!("Model saved to {}", path.display());
            }

            Ok(())
        }

        Commands::Detect {
            dataset,
            model,
            threshold,
            output,
        } => {
            let bundle = ModelBundle::load(&model)
                .with_context(|| format!("failed to load model {}", model.display()))?;
            let mut detector = AnomalyDetector::from_bundle(&bundle)?;
            if let Some(t) = threshold {
                detector.set_threshold(t);
            }

            let table = Table::from_json_file(&dataset)
                .with_context(|| format!("failed to load dataset {}", dataset.display()))?;
            let detections = detector.detect_table(&table)?;
            let flagged = detections.iter().filter(|d| d.is_anomaly).count();
            info!(rows = detections.len(), flagged, threshold = detector.threshold(), "Scored table");

            let json = serde_json::to_string_pretty(&detections)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json)?;
                    println!("Results saved to {}", path.display());
                }
                None => println!("{}", json),
            }

            Ok(())
        }

        Commands::Synth {
            kind,
            output,
            normal,
            anomalous,
            width,
            seed,
        } => {
            let table = match kind {
                SynthKind::Blobs => synthetic::uniform_blobs(normal, anomalous, width, seed),
                SynthKind::Waveform => synthetic::periodic_waveform(normal, anomalous, width, seed),
            };
            table.to_json_file(&output)?;
            println!("Wrote {} rows to {}", table.len(), output.display());

            Ok(())
        }
    }
}
