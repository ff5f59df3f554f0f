//! Chronoshelf CLI
//!
//! Command-line interface for chronoshelf operations:
//! - Run a CSV file through the pipeline into a new version
//! - Inspect the current version, version history and manifests
//! - Read back the data points of a version
//! - Generate a default config file

use anyhow::Context;
use chronoshelf::config::{generate_default_config, Config, LoggingConfig};
use chronoshelf::pipeline::EtlRunner;
use chronoshelf::source::CsvSource;
use chronoshelf::storage::{DataPoint, Manifest};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "chronoshelf")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Versioned time-series snapshots on object storage")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: ./chronoshelf.toml, then the user and system config dirs)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format (table, json)
    #[arg(short, long, default_value = "table", global = true)]
    pub format: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load a CSV file into a new version of a dataset
    Run {
        /// Dataset id
        dataset: String,
        /// Long-format CSV (series, obs_time, value, unit, frequency)
        csv: PathBuf,
        /// Fail on the first unparseable row
        #[arg(long)]
        strict: bool,
        /// Unit for rows without one
        #[arg(long, default_value = "")]
        unit: String,
        /// Frequency for rows without one
        #[arg(long, default_value = "")]
        frequency: String,
    },

    /// Show the current version of a dataset
    Current {
        dataset: String,
    },

    /// List versions of a dataset, newest first
    Versions {
        dataset: String,
    },

    /// Print a version's manifest (default: current version)
    Manifest {
        dataset: String,
        #[arg(short, long)]
        version: Option<String>,
    },

    /// Print the data points of a version (default: current version)
    Show {
        dataset: String,
        #[arg(short, long)]
        version: Option<String>,
        /// Maximum number of rows to print
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Show watermarks and lock status of a dataset
    State {
        dataset: String,
    },

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Config { output } = &cli.command {
        let content = generate_default_config();
        match output {
            Some(path) => {
                std::fs::write(path, content)
                    .with_context(|| format!("writing {}", path.display()))?;
                println!("Wrote default config to {}", path.display());
            }
            None => print!("{}", content),
        }
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };
    init_logging(&config.logging)?;
    tracing::debug!("Chronoshelf v{}", env!("CARGO_PKG_VERSION"));

    let runner = EtlRunner::from_config(&config)?;
    let json = cli.format == "json";

    match cli.command {
        Commands::Run {
            dataset,
            csv,
            strict,
            unit,
            frequency,
        } => {
            let source = CsvSource::new(csv)
                .strict(strict)
                .default_unit(unit)
                .default_frequency(frequency);

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupt received, stopping at the next step");
                    on_signal.cancel();
                }
            });

            let report = runner.run(&dataset, &source, &cancel).await?;
            if let Some(notification) = report.notification {
                // Let the notification finish before the runtime shuts down
                let _ = notification.await;
            }

            let outcome = report.outcome;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "dataset_id": outcome.dataset_id,
                        "version_id": outcome.version_id,
                        "previous_version_id": outcome.previous_version_id,
                        "points_extracted": report.points_extracted,
                        "has_new_data": outcome.has_new_data,
                        "manifest": outcome.manifest,
                    }))?
                );
            } else {
                match (&outcome.version_id, &outcome.manifest) {
                    (Some(version_id), Some(manifest)) => {
                        println!("Published {} for {}", version_id, dataset);
                        print_manifest_summary(manifest);
                    }
                    _ => println!("Nothing to publish for {}", dataset),
                }
            }
        }

        Commands::Current { dataset } => {
            match runner.loader().current_manifest(&dataset).await? {
                Some(manifest) if json => println!("{}", serde_json::to_string_pretty(&manifest)?),
                Some(manifest) => println!("{}", manifest.version()),
                None => println!("{} has no published version", dataset),
            }
        }

        Commands::Versions { dataset } => {
            let loader = runner.loader();
            let versions = loader.versions().list_versions(&dataset).await?;
            let current = loader.versions().get_current_version(&dataset).await?;

            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "current": current,
                        "versions": versions,
                    }))?
                );
            } else if versions.is_empty() {
                println!("{} has no versions", dataset);
            } else {
                for version in versions {
                    let marker = if current.as_deref() == Some(version.as_str()) {
                        "*"
                    } else {
                        " "
                    };
                    println!("{} {}", marker, version);
                }
            }
        }

        Commands::Manifest { dataset, version } => {
            let version_id = resolve_version(&runner, &dataset, version).await?;
            let manifest = runner
                .loader()
                .manifests()
                .load_manifest(&dataset, &version_id)
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&manifest)?);
            } else {
                println!("{}", manifest.version());
                print_manifest_summary(&manifest);
            }
        }

        Commands::Show {
            dataset,
            version,
            limit,
        } => {
            let version_id = resolve_version(&runner, &dataset, version).await?;
            let points = runner.loader().read_version(&dataset, &version_id).await?;
            let shown = &points[..points.len().min(limit)];

            if json {
                println!("{}", serde_json::to_string_pretty(shown)?);
            } else {
                print_points(shown);
                if points.len() > shown.len() {
                    println!("... {} more", points.len() - shown.len());
                }
            }
        }

        Commands::State { dataset } => {
            let key = config.lock.lock_key(&dataset);
            let locked = runner.locks().is_held(&key).await?;
            let watermarks = match runner.state() {
                Some(state) => Some(state.load(&dataset).await?),
                None => None,
            };

            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "lock_key": key,
                        "locked": locked,
                        "watermarks": watermarks,
                    }))?
                );
            } else {
                println!("Lock {}: {}", key, if locked { "held" } else { "free" });
                match watermarks {
                    Some(marks) if marks.is_empty() => println!("No watermarks"),
                    Some(marks) => {
                        println!("{:<24} {}", "Series", "Last obs_time");
                        println!("{}", "-".repeat(50));
                        for (series, obs_time) in marks.iter() {
                            println!("{:<24} {}", series, obs_time.to_rfc3339());
                        }
                    }
                    None => println!("State tracking disabled"),
                }
            }
        }

        Commands::Config { .. } => unreachable!("handled before config is loaded"),
    }

    Ok(())
}

fn init_logging(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("chronoshelf={}", logging.level)));

    let writer = match &logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path))?;
            tracing_subscriber::fmt::writer::BoxMakeWriter::new(std::sync::Mutex::new(file))
        }
        None => tracing_subscriber::fmt::writer::BoxMakeWriter::new(std::io::stderr),
    };

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(writer))
            .init();
    }
    Ok(())
}

async fn resolve_version(
    runner: &EtlRunner,
    dataset: &str,
    version: Option<String>,
) -> anyhow::Result<String> {
    match version {
        Some(version) => Ok(version),
        None => runner
            .loader()
            .versions()
            .get_current_version(dataset)
            .await?
            .with_context(|| format!("{} has no published version", dataset)),
    }
}

fn print_manifest_summary(manifest: &Manifest) {
    println!("  Data points:  {}", manifest.data_points_count);
    println!("  Series:       {}", manifest.series_codes.join(", "));
    if let (Some(min), Some(max)) = (manifest.date_range.min_obs_time, manifest.date_range.max_obs_time) {
        println!("  Date range:   {} .. {}", min.format("%Y-%m-%d"), max.format("%Y-%m-%d"));
    }
    println!("  Files:        {}", manifest.parquet_files.len());
    println!(
        "  New series:   {}",
        manifest.changelog.new_series.iter().cloned().collect::<Vec<_>>().join(", ")
    );
    println!(
        "  Updated:      {}",
        manifest.changelog.updated_series.iter().cloned().collect::<Vec<_>>().join(", ")
    );
    if let Some(previous) = &manifest.previous_version {
        println!("  Previous:     {}", previous);
    }
}

fn print_points(points: &[DataPoint]) {
    println!(
        "{:<20} {:<26} {:>14} {:<10} {}",
        "Series", "Obs time", "Value", "Unit", "Freq"
    );
    println!("{}", "-".repeat(80));
    for point in points {
        println!(
            "{:<20} {:<26} {:>14} {:<10} {}",
            point.internal_series_code,
            point.obs_time.to_rfc3339(),
            point.value,
            point.unit,
            point.frequency
        );
    }
}
