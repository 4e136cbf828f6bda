use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use feedstock_adapters::narrative::{scan_document, DatePolicy};
use feedstock_adapters::normalize::normalize;
use feedstock_adapters::settlement::extract_dataset;
use feedstock_core::{DatasetKey, PriceBasis, Table, Value, DATA_SET_COLUMN, MTH_STRIKE_COLUMN};
use feedstock_sync::{JobRegistry, SyncConfig};
use tracing::warn;
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "feedstock-cli")]
#[command(about = "Feedstock ingestion jobs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one registered job to completion.
    Run { job: String },
    /// List the jobs in jobs.yaml.
    Jobs,
    /// Serve the HTTP trigger endpoints.
    Serve {
        #[arg(long, default_value = "0.0.0.0:7071")]
        addr: String,
    },
    /// Extract one dataset from a settlement report file.
    Extract {
        #[arg(long)]
        file: PathBuf,
        #[arg(long, value_parser = parse_dataset)]
        dataset: DatasetKey,
    },
    /// Scan a markdown-converted driver report into page records.
    Scan {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        pdf_name: Option<String>,
        /// Leave undated pages undated instead of using the first date found.
        #[arg(long)]
        per_page_dates: bool,
    },
}

fn init_tracing(default_filter: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))
}

fn dataset_name(key: DatasetKey) -> String {
    serde_json::to_value(key)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

fn parse_dataset(text: &str) -> Result<DatasetKey, String> {
    serde_json::from_value(serde_json::Value::String(text.to_string())).map_err(|_| {
        let known = DatasetKey::ALL.map(dataset_name).join(", ");
        format!("unknown dataset {text:?}; expected one of {known}")
    })
}

fn cell_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Text(s) => serde_json::Value::from(s.as_str()),
        Value::Number(n) => serde_json::Value::from(*n),
        Value::Date(d) => serde_json::Value::from(d.format("%Y-%m-%d").to_string()),
    }
}

/// One JSON object per row, keyed by column name.
fn table_json(table: &Table) -> serde_json::Value {
    table
        .rows()
        .iter()
        .map(|row| {
            table
                .columns()
                .iter()
                .cloned()
                .zip(row.iter().map(cell_json))
                .collect::<serde_json::Map<_, _>>()
        })
        .map(serde_json::Value::Object)
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("info")?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { job } => {
            let outcome = feedstock_sync::run_job_from_env(&job).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.success {
                bail!("job {job} failed");
            }
        }
        Commands::Jobs => {
            let config = SyncConfig::from_env();
            let registry = JobRegistry::load(&config.workspace_root.join("jobs.yaml")).await?;
            for job in &registry.jobs {
                let state = if job.enabled { "enabled" } else { "disabled" };
                println!("{}\t{state}\t{}", job.job_id, job.display_name);
            }
        }
        Commands::Serve { addr } => {
            feedstock_web::serve_from_env(&addr).await?;
        }
        Commands::Extract { file, dataset } => {
            let blob = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let rows = extract_dataset(&blob, dataset)?;
            let table = normalize(
                &rows,
                Some(dataset.report_title()),
                &[
                    DATA_SET_COLUMN,
                    MTH_STRIKE_COLUMN,
                    PriceBasis::Settlement.column(),
                    PriceBasis::Last.column(),
                ],
            )?;
            println!("{}", serde_json::to_string_pretty(&table_json(&table))?);
        }
        Commands::Scan {
            file,
            pdf_name,
            per_page_dates,
        } => {
            let markdown = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let pdf_name = pdf_name.unwrap_or_else(|| {
                file.with_extension("pdf")
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            });
            let policy = if per_page_dates {
                DatePolicy::PerPage
            } else {
                DatePolicy::InheritFirst
            };
            let scan = scan_document(&markdown, &pdf_name, policy);
            for diagnostic in &scan.diagnostics {
                warn!(line = diagnostic.line_no + 1, error = %diagnostic.error, "unreadable line");
            }
            println!("{}", serde_json::to_string_pretty(&scan.records)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dataset_names_round_trip_through_the_parser() {
        assert_eq!(parse_dataset("cad-usd"), Ok(DatasetKey::CadUsd));
        let err = parse_dataset("butane").unwrap_err();
        assert!(err.contains("henry-hub-natural-gas"));
    }

    #[test]
    fn tables_print_as_row_objects() {
        let mut table = Table::new(["MTH_STRIKE", "SETT"]);
        table
            .push_row(vec![Value::text("DEC24"), Value::Number(69.39)])
            .unwrap();
        assert_eq!(
            table_json(&table),
            serde_json::json!([{"MTH_STRIKE": "DEC24", "SETT": 69.39}])
        );
    }
}
