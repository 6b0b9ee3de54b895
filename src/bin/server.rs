//! Writing Center API server.
//!
//! The config directory can be overridden with `WRITING_CENTER_CONFIG_DIR`;
//! log filtering follows `RUST_LOG`.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use writingcore::{server, Config, Database, WritingResult};

#[tokio::main]
async fn main() -> WritingResult<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("writingcore=info,tower_http=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_dir = std::env::var_os("WRITING_CENTER_CONFIG_DIR").map(PathBuf::from);
    let config = Config::new(config_dir)?;
    let db = Database::new(config.database_file())?;

    tracing::info!(database = %config.database_file(), "Opened database");

    server::start_server(Arc::new(Mutex::new(db)), Arc::new(Mutex::new(config))).await
}
