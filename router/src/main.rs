//! Fleet Router Server Entry Point

use clap::Parser;
use fleet_router::{
    api,
    cli::{Cli, Commands},
    config::{load_fleet_config, ServerConfig},
    gateway::Gateway,
    logging, AppState,
};
use std::net::SocketAddr;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = cli.server_config();

    if let Some(Commands::Check { path }) = &cli.command {
        let path = path.as_deref().unwrap_or(&config.config_path);
        return check_config(path);
    }

    if let Err(e) = logging::init() {
        eprintln!("failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }

    match run_server(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            error!("{}", message);
            ExitCode::FAILURE
        }
    }
}

fn check_config(path: &Path) -> ExitCode {
    match load_fleet_config(path) {
        Ok(fleet) => {
            println!("{}: {} backend(s)", path.display(), fleet.backends.len());
            for backend in &fleet.backends {
                println!(
                    "  {:<20} {:<24} {}{}",
                    backend.name,
                    backend.address(),
                    backend.model_id,
                    if backend.enabled { "" } else { " (disabled)" }
                );
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}: {}", path.display(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run_server(config: ServerConfig) -> Result<(), String> {
    info!("Fleet Router v{}", env!("CARGO_PKG_VERSION"));

    let fleet = load_fleet_config(&config.config_path)
        .map_err(|e| format!("Failed to load {}: {}", config.config_path.display(), e))?;
    info!(
        path = %config.config_path.display(),
        backends = fleet.backends.len(),
        strategy = ?fleet.routing.strategy,
        supervisor = fleet.supervisor.enabled,
        "Fleet configuration loaded"
    );

    let gateway = Arc::new(
        Gateway::new(fleet)
            .await
            .map_err(|e| format!("Failed to build gateway: {}", e))?,
    );
    let _background = gateway.start().await;

    let state = AppState {
        gateway,
        config_path: Some(config.config_path.clone()),
    };
    let router = api::create_router(state);

    let bind_addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| format!("Failed to bind to {}: {}", bind_addr, e))?;

    info!("Router server listening on {}", bind_addr);

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|e| format!("Server error: {}", e))
}
