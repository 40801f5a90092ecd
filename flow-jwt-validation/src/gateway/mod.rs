//! Embedded REST gateway authenticating requests with the validation engine.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use flow_jwt_validation::gateway::{GatewayRequestHandler, GatewayServerManager, RouteTable};
//! use flow_jwt_validation::manager::IssuerStore;
//! use flow_jwt_validation::validation::TokenValidator;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let routes = RouteTable::from_file("routes.yaml")?;
//! let validator = Arc::new(TokenValidator::new(Arc::new(IssuerStore::new())));
//! let handler = GatewayRequestHandler::new(routes, validator)?;
//!
//! let manager = GatewayServerManager::new();
//! manager.start(8080, handler.into_router()).await?;
//! # Ok(())
//! # }
//! ```

mod handler;
mod problem;
mod proxy;
mod routes;
mod server;

pub use handler::{GatewayRequestHandler, MAX_BODY_SIZE};
pub use problem::{GatewayErrorCode, ProblemDetail, PROBLEM_CONTENT_TYPE};
pub use proxy::{UpstreamClient, DEFAULT_UPSTREAM_TIMEOUT};
pub use routes::{
    PathPattern, RouteConfig, RouteMatch, RouteTable, HEALTH_PATH, MANAGEMENT_PREFIX,
    METRICS_PATH,
};
pub use server::{GatewayServerManager, ServerStatus};
