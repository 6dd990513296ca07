//! Pipeline entry point.
//!
//! Loads configuration, initializes tracing, opens the state store, wires
//! the FTP remote and the native decoder adapter into the supervisor, and
//! runs until the window drains or an interrupt arrives. Initialization
//! failures (bad configuration, unreadable state store) exit non-zero
//! before any worker starts.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use radar_ingest::decode::NativeDecoder;
use radar_ingest::remote::FtpRemote;
use radar_ingest::state::StateStore;
use radar_ingest::supervisor::{ExitStatus, Supervisor};
use radar_ingest::Settings;

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => return args.next().map(PathBuf::from),
            other if !other.starts_with('-') => return Some(PathBuf::from(other)),
            _ => {}
        }
    }
    None
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = config_path_from_args();
    let settings =
        Settings::new(config_path.as_deref()).context("loading configuration")?;
    init_tracing(&settings.log_level);
    info!(
        radar = %settings.radar.name,
        host = %settings.connection.host,
        start = %settings.start_instant(),
        end = ?settings.window.end_instant,
        "Configuration loaded"
    );

    for dir in [
        &settings.directories.raw_root,
        &settings.directories.container_root,
        &settings.directories.product_root,
    ] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating {}", dir.display()))?;
    }

    let store = Arc::new(
        StateStore::open(&settings.directories.state_db).context("opening state store")?,
    );
    let remote = Arc::new(FtpRemote::new(&settings));
    let decoder = Arc::new(NativeDecoder::new(&settings.directories.decoder_resources));

    let supervisor = Supervisor::new(Arc::new(settings), store, remote, decoder);
    match supervisor.run().await? {
        ExitStatus::Drained => info!("Calendar window complete, exiting"),
        ExitStatus::Interrupted => info!("Shutdown complete"),
    }
    Ok(())
}
