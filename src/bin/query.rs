use clap::Parser;
use std::path::PathBuf;

use gatherer::collectors::FieldValue;
use gatherer::config::AgentConfig;
use gatherer::storage::{SqliteStorage, Storage};

#[derive(Parser, Debug)]
#[command(author, version, about = "Query metrics stored by gatherer", long_about = None)]
struct Args {
    /// Measurement name to show
    #[arg(short, long, default_value = "supervisor")]
    name: String,

    /// Number of latest metrics to show
    #[arg(short, long, default_value = "10")]
    limit: usize,

    /// Database file; defaults to ~/.gatherer/gatherer.db
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Output format: text or json
    #[arg(short, long, default_value = "text")]
    format: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let path = args
        .database
        .unwrap_or_else(|| AgentConfig::default().database_path());
    let storage = SqliteStorage::new(path);
    storage.initialize()?;

    let metrics = storage.query_latest(&args.name, args.limit)?;
    if metrics.is_empty() {
        eprintln!("No metrics named '{}' found.", args.name);
    }

    match args.format.as_str() {
        "json" => {
            for metric in &metrics {
                println!("{}", serde_json::to_string(metric)?);
            }
        }
        "text" => {
            for metric in &metrics {
                let tags: Vec<String> = metric.tags().iter().map(|(k, v)| format!("{k}={v}")).collect();
                let fields: Vec<String> = metric
                    .fields()
                    .iter()
                    .map(|(k, v)| match v {
                        FieldValue::Integer(i) => format!("{k}={i}"),
                        FieldValue::Float(f) => format!("{k}={f}"),
                        FieldValue::String(s) => format!("{k}={s:?}"),
                        FieldValue::Boolean(b) => format!("{k}={b}"),
                    })
                    .collect();
                println!(
                    "{} {} [{}] {}",
                    metric.timestamp().format("%Y-%m-%d %H:%M:%S UTC"),
                    metric.name(),
                    tags.join(","),
                    fields.join(" ")
                );
            }

            let stats = storage.get_stats()?;
            println!();
            println!("Total metrics: {}", stats.total_metrics);
            println!("Collection rounds: {}", stats.total_collection_rounds);
            if let Some(size) = stats.database_size_bytes {
                println!("Database size: {:.2} KB", size as f64 / 1024.0);
            }
        }
        other => {
            anyhow::bail!("invalid format '{other}', use 'text' or 'json'");
        }
    }

    Ok(())
}
