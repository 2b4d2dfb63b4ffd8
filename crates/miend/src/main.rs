use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use config::{BusKind, Config};
use mien_core::{CommandExtractor, EnrollmentStore, FaceRegistry, SqliteBackend};

const BUS_NAME: &str = "org.mien.Registry1";
const OBJECT_PATH: &str = "/org/mien/Registry1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("miend starting");

    let config = Config::load()?;
    tracing::info!(
        db = %config.db_path.display(),
        dimension = config.dimension,
        threshold = config.match_threshold,
        extractor = %config.extractor_command.display(),
        bus = ?config.bus,
        "configuration loaded"
    );

    let backend = SqliteBackend::open(&config.db_path)
        .with_context(|| format!("opening {}", config.db_path.display()))?;
    let store = EnrollmentStore::open(Box::new(backend), config.dimension)?;
    let registry = Arc::new(FaceRegistry::with_linear_scan(store));

    // The provider is killed at the same deadline the D-Bus caller waits for.
    let extract_timeout = Duration::from_secs(config.extract_timeout_secs);
    let extractor = CommandExtractor::new(
        config.extractor_command.clone(),
        config.extractor_args.clone(),
    )
    .with_timeout(extract_timeout);
    let handle = engine::spawn_extractor(Box::new(extractor), extract_timeout);

    let service = dbus_interface::RegistryService::new(
        registry,
        handle,
        config.match_threshold,
        config.extractor_command.display().to_string(),
    );

    let builder = match config.bus {
        BusKind::System => zbus::connection::Builder::system()?,
        BusKind::Session => zbus::connection::Builder::session()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .with_context(|| format!("registering {BUS_NAME} on the {:?} bus", config.bus))?;

    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "miend ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("miend shutting down");

    Ok(())
}
