use std::{env, path::PathBuf, sync::Arc};

use flow_jwt_validation::{
    gateway::{GatewayRequestHandler, GatewayServerManager, RouteTable},
    manager::ConfigurationManager,
    validation::TokenValidator,
};
use log::{error, info};
use tokio::signal;

const DEFAULT_PORT: u16 = 3000;

#[tokio::main]
async fn main() {
    env_logger::init();

    let validation_file = env::var_os("VALIDATION_CONFIG").map(PathBuf::from);
    let routes_file = env::var("GATEWAY_ROUTES").unwrap_or_else(|_| "routes.yaml".to_owned());
    let port = env::var("GATEWAY_PORT")
        .ok()
        .and_then(|port| port.parse().ok())
        .unwrap_or(DEFAULT_PORT);

    let manager = ConfigurationManager::from_sources(validation_file.as_deref())
        .expect("Failed to read validation configuration");
    let snapshot = manager
        .reconfigure(env::args().skip(1).filter_map(|arg| {
            arg.split_once('=')
                .map(|(key, value)| (key.to_owned(), value.to_owned()))
        }))
        .expect("Invalid validation configuration");
    for (issuer, result) in snapshot.refresh_all().await {
        if let Err(e) = result {
            error!("Initial key load for issuer '{}' failed: {}", issuer, e);
        }
    }

    let routes = RouteTable::from_file(&routes_file).expect("Failed to read routes");
    info!("Loaded {} route(s) from {}", routes.len(), routes_file);
    let validator = Arc::new(TokenValidator::new(manager.store()));
    let handler =
        GatewayRequestHandler::new(routes, validator).expect("Failed to create gateway handler");

    let server = GatewayServerManager::new();
    let port = server
        .start(port, handler.into_router())
        .await
        .expect("Failed to start gateway");
    info!("Running gateway on port: {}", port);

    shutdown_signal().await;
    server.stop().await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
