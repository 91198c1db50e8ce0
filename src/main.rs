use std::io::BufRead;
use std::sync::Arc;

use anyhow::Context;
use metasync::config::{AppConfig, StoreBackend};
use metasync::seed;
use metasync::store::traits::Store;
use metasync::{
    CallContext, ChangeOrigin, ConnectorRegistry, Engine, IncomingChange, LogEventSink, LoggingConnector, MemoryStore,
    PostgresStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    use env_logger::Builder;
    use log::LevelFilter;

    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter_module("sqlx", LevelFilter::Warn)
        .parse_default_env()
        .init();

    let path = std::env::args()
        .nth(1)
        .context("usage: metasync <changes.jsonl>")?;

    let config = AppConfig::load()?;
    log::info!("Configuration loaded: backend={:?}", config.store.backend);

    match config.store.backend {
        StoreBackend::Memory => replay(Arc::new(MemoryStore::new()), &config, &path).await,
        StoreBackend::Postgres => {
            let database_url = config.database_url()?;
            let store = PostgresStore::new(&database_url, config.store.max_connections.unwrap_or(20)).await?;
            log::info!("Running database migrations...");
            store.migrate().await?;
            replay(Arc::new(store), &config, &path).await
        }
    }
}

/// Feed every line of `path` through the coordinator and print each outcome
async fn replay<S: Store + 'static>(store: Arc<S>, config: &AppConfig, path: &str) -> anyhow::Result<()> {
    let connectors = ConnectorRegistry::new().with_fallback(Arc::new(LoggingConnector::new("outbound")));
    let engine = Engine::new(
        store,
        seed::glossary_types(),
        Arc::new(LogEventSink),
        connectors,
        &config.sync,
    );

    if std::env::var("LOAD_SEED_DATA").unwrap_or_default() == "true" {
        log::info!("Loading seed data...");
        seed::load_seed_data(&engine).await?;
    }

    let file = std::fs::File::open(path).with_context(|| format!("Failed to open {}", path))?;
    let (mut applied, mut failed) = (0usize, 0usize);

    for (number, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read line {}", number + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        let change: IncomingChange =
            serde_json::from_str(&line).with_context(|| format!("Invalid change on line {}", number + 1))?;

        let ctx = match &change.origin {
            ChangeOrigin::External {
                external_system_id, ..
            } => CallContext::synchronizer(external_system_id),
            ChangeOrigin::Internal { .. } => CallContext::system(),
        };

        match engine.coordinator.submit(&ctx, change).await {
            Ok(outcome) => {
                applied += 1;
                println!("{}", serde_json::to_string(&outcome)?);
            }
            Err(e) => {
                failed += 1;
                log::warn!("Line {} rejected ({:?}): {}", number + 1, e.kind(), e);
            }
        }
    }

    engine.propagation().wait_idle().await;
    for report in engine.propagation().drain_reports() {
        println!("{}", serde_json::to_string(&report)?);
    }
    log::info!("Replay finished: {} processed, {} rejected", applied, failed);
    Ok(())
}
