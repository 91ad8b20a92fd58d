//! NBA Engine — Binary Entrypoint
//! One binary, two modes: `serve` boots the Axum HTTP predictor,
//! `batch` evaluates stored customers and prints a run summary.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use nba_engine::batch;
use nba_engine::config::{EngineConfig, ModelConfig};
use nba_engine::enhance::build_model_client;
use nba_engine::metrics::Metrics;
use nba_engine::{create_router, AppState, Engine, JsonStore, MemoryStore, Storage};

#[derive(Parser)]
#[command(name = "nba-engine", about = "Customer NBA decision engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the online HTTP predictor.
    Serve {
        #[arg(long, default_value = "0.0.0.0:8000")]
        addr: String,
        /// Storage target: a JSON data directory. Omit for an empty in-memory store.
        #[arg(long)]
        data: Option<PathBuf>,
    },
    /// Evaluate stored customers once and print a summary.
    Batch {
        /// Cap on how many customers to process.
        #[arg(long)]
        limit: Option<usize>,
        /// Concurrent workers; 1 means sequential.
        #[arg(long)]
        workers: Option<usize>,
        /// Storage target: a JSON data directory. Omit for an empty in-memory store.
        #[arg(long)]
        data: Option<PathBuf>,
    },
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("nba_engine=info,warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

fn open_storage(data: Option<PathBuf>) -> anyhow::Result<Arc<dyn Storage>> {
    match data {
        Some(dir) => Ok(Arc::new(JsonStore::open(dir)?)),
        None => {
            tracing::warn!("no --data directory given; starting with an empty in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let cfg = EngineConfig::load_default();
    let model = build_model_client(&ModelConfig::load_default());
    let engine = Arc::new(Engine::new(cfg.clone(), model));

    match cli.command {
        Command::Serve { addr, data } => {
            let metrics = Metrics::init();
            let storage = open_storage(data)?;
            let state = AppState {
                engine,
                storage,
            };
            let router = create_router(state).merge(metrics.router());

            let listener = tokio::net::TcpListener::bind(&addr).await?;
            tracing::info!(%addr, "serving");
            axum::serve(listener, router).await?;
        }
        Command::Batch {
            limit,
            workers,
            data,
        } => {
            let storage = open_storage(data)?;
            let workers = workers.unwrap_or(cfg.batch_workers);
            let summary =
                batch::run(engine, storage, limit, workers, chrono::Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }
    Ok(())
}
