use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use claudex_core::SessionManager;
use claudex_server::AppState;
use serde::Deserialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_PORT: u16 = 9090;

#[derive(Debug, Parser)]
#[command(name = "claudex", about = "Terminal session server for agent workflows")]
struct Cli {
    /// Port to listen on; falls back to $PORT, then the config file.
    #[arg(long)]
    port: Option<u16>,

    /// Session metadata and scrollback directory.
    #[arg(long)]
    storage_dir: Option<PathBuf>,

    /// Directory with the static web frontend.
    #[arg(long)]
    web_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    port: Option<u16>,
}

/// `~/.claudex/config.json`; missing or corrupt files fall back to defaults.
fn load_config() -> ConfigFile {
    let Some(home) = dirs::home_dir() else {
        return ConfigFile { port: None };
    };
    let path = home.join(".claudex").join("config.json");
    std::fs::read_to_string(path)
        .ok()
        .and_then(|data| serde_json::from_str(&data).ok())
        .unwrap_or(ConfigFile { port: None })
}

fn resolve_port(cli: &Cli, config: &ConfigFile) -> u16 {
    if let Some(port) = cli.port {
        return port;
    }
    if let Ok(port) = std::env::var("PORT")
        && let Ok(port) = port.parse()
    {
        return port;
    }
    config.port.unwrap_or(DEFAULT_PORT)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = load_config();
    let port = resolve_port(&cli, &config);

    let home = dirs::home_dir().context("cannot determine home directory")?;
    let storage_dir = cli
        .storage_dir
        .unwrap_or_else(|| home.join(".claudex").join("sessions"));
    let web_dir = cli.web_dir.or_else(|| {
        let dir = home.join(".claudex").join("web");
        dir.is_dir().then_some(dir)
    });

    let manager = Arc::new(SessionManager::new(storage_dir));
    let state = AppState::new(Arc::clone(&manager));
    let app = claudex_server::router(state, web_dir);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind port {port}"))?;
    info!(port, "claudex server listening on http://localhost:{port}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(manager))
        .await
        .context("server error")?;

    Ok(())
}

/// Waits for ctrl-c, then saves every session and kills their children so
/// no orphans outlive the server.
async fn shutdown_signal(manager: Arc<SessionManager>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutting down, saving session state");
    manager.shutdown();
}
