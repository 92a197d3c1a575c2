//! WebSocket voice server binary for parley.

use clap::Parser;
use parley::SessionConfig;
use parley::server::{AppState, serve};
use parley::services::HttpServiceFactory;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Real-time full-duplex voice conversation server.
#[derive(Parser)]
#[command(name = "parley-server", version, about)]
struct Cli {
    /// Path to TOML configuration file (defaults to the user config dir).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overriding `server.bind`.
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("parley=info,parley_server=info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match cli.config {
        Some(ref path) => SessionConfig::from_file(path)?,
        None => {
            let path = SessionConfig::default_config_path();
            if path.exists() {
                info!("loading config from {}", path.display());
                SessionConfig::from_file(&path)?
            } else {
                SessionConfig::default()
            }
        }
    };
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }
    config.validate()?;

    let listener = TcpListener::bind(&config.server.bind).await?;
    let state = Arc::new(AppState::new(config, Arc::new(HttpServiceFactory)));

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C");
        }
        on_signal.cancel();
    });

    info!("parley v{}", env!("CARGO_PKG_VERSION"));
    serve(listener, state, shutdown).await?;
    Ok(())
}
