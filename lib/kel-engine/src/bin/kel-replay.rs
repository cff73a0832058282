//! KEL replay tool
//!
//! Feeds a file of JSON-lines messages through the engine and reports the resulting
//! key states. With a data directory the logs persist between runs.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use kel_engine::{
    ApplyOutcome, EngineConfig, FileStore, Inbound, KelStore, MemoryStore, Registry, spawn_ingest,
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "kel-replay")]
#[command(about = "Replay Key Event Log messages through the verification engine")]
struct Cli {
    /// Directory for file-backed storage; in-memory when unset
    #[arg(long, env = "KEL_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply every message in a JSON-lines file and print the resulting key states
    Replay {
        /// One `{"event": ...}` or `{"receipt": ...}` object per line
        input: PathBuf,
    },
    /// Print the key state of one prefix
    State { prefix: String },
    /// Print the accepted log of one prefix
    Kel { prefix: String },
    /// List prefixes with accepted events
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "kel_engine=info".into()))
        .with(fmt::layer().json())
        .init();

    let cli = Cli::parse();
    let mut config = EngineConfig::from_env()?;
    if cli.data_dir.is_some() {
        config.data_dir = cli.data_dir.clone();
    }

    let store: Arc<dyn KelStore> = match &config.data_dir {
        Some(dir) => Arc::new(FileStore::open(dir)?),
        None => Arc::new(MemoryStore::new()),
    };
    let registry = Arc::new(Registry::new(store, config));

    match cli.command {
        Commands::Replay { input } => {
            let contents = std::fs::read_to_string(&input)
                .with_context(|| format!("reading {}", input.display()))?;
            let (handle, worker) = spawn_ingest(registry.clone());

            let mut counts = [0usize; 4];
            for (line_no, line) in contents.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let inbound: Inbound = serde_json::from_str(line)
                    .with_context(|| format!("parsing line {}", line_no + 1))?;
                match handle.submit(inbound).await {
                    Ok(ApplyOutcome::Accepted) => counts[0] += 1,
                    Ok(ApplyOutcome::Pending(_) | ApplyOutcome::ReceiptEscrowed) => counts[1] += 1,
                    Ok(ApplyOutcome::Ignored) => counts[2] += 1,
                    Err(e) => {
                        tracing::warn!("Line {} rejected: {}", line_no + 1, e);
                        counts[3] += 1;
                    }
                }
            }
            drop(handle);
            worker.await?;

            eprintln!(
                "accepted {}, escrowed {}, ignored {}, rejected {}",
                counts[0], counts[1], counts[2], counts[3]
            );
            let mut states = Vec::new();
            for prefix in registry.prefixes()? {
                if let Some(state) = registry.key_state(&prefix)? {
                    states.push(state);
                }
            }
            println!("{}", serde_json::to_string_pretty(&states)?);
        }
        Commands::State { prefix } => {
            let state = registry
                .key_state(&prefix)?
                .with_context(|| format!("no accepted events for {}", prefix))?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Commands::Kel { prefix } => {
            println!("{}", serde_json::to_string_pretty(&registry.kel(&prefix)?)?);
        }
        Commands::List => {
            for prefix in registry.prefixes()? {
                println!("{}", prefix);
            }
        }
    }

    Ok(())
}
