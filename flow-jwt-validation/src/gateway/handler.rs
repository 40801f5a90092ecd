use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use axum::{
    body::{self, Body},
    extract::{Request, State},
    response::{IntoResponse, Response},
    Json, Router,
};
use http::{header::CONTENT_LENGTH, StatusCode};
use log::{debug, warn};
use serde_json::{json, Map, Value};

use crate::{
    events::{GatewayEvent, GatewaySecurityEvents},
    jwt_extract::TokenExtractor,
    outcome::ValidationOutcome,
    validation::TokenValidator,
};

use super::{
    problem::{GatewayErrorCode, ProblemDetail},
    proxy::{UpstreamClient, DEFAULT_UPSTREAM_TIMEOUT},
    routes::{RouteTable, HEALTH_PATH, METRICS_PATH},
};

/// Largest request body forwarded upstream.
pub const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Routes, authenticates and forwards gateway requests.
pub struct GatewayRequestHandler {
    routes: RouteTable,
    validator: Arc<TokenValidator>,
    events: Arc<GatewaySecurityEvents>,
    extractor: TokenExtractor,
    upstream: UpstreamClient,
}

impl GatewayRequestHandler {
    pub fn new(routes: RouteTable, validator: Arc<TokenValidator>) -> Result<Self, reqwest::Error> {
        Ok(Self {
            routes,
            validator,
            events: Arc::new(GatewaySecurityEvents::new()),
            extractor: TokenExtractor::authorization_header(),
            upstream: UpstreamClient::new(DEFAULT_UPSTREAM_TIMEOUT)?,
        })
    }

    pub fn with_upstream(mut self, upstream: UpstreamClient) -> Self {
        self.upstream = upstream;
        self
    }

    pub fn events(&self) -> &Arc<GatewaySecurityEvents> {
        &self.events
    }

    pub fn validator(&self) -> &Arc<TokenValidator> {
        &self.validator
    }

    /// An axum router sending every request through [Self::handle].
    pub fn into_router(self) -> Router {
        Router::new()
            .fallback(dispatch)
            .with_state(Arc::new(self))
    }

    pub async fn handle(&self, request: Request) -> Response {
        let (parts, body) = request.into_parts();
        let path = parts.uri.path();

        let Some(matched) = self.routes.find(&parts.method, path) else {
            debug!("No route for {} {}", parts.method, path);
            self.events.record(GatewayEvent::RouteNotFound);
            return ProblemDetail::gateway(
                GatewayErrorCode::RouteNotFound,
                format!("no route for {} {}", parts.method, path),
            )
            .into_response();
        };
        self.events.record(GatewayEvent::RouteMatched);
        let route = matched.route;

        if route.require_auth {
            let outcome = match self.extractor.extract(&parts.headers) {
                Ok(token) => self
                    .validator
                    .validate_with(token.as_deref(), &route.requirements()),
                Err(rejection) => self.validator.reject(rejection),
            };
            if let ValidationOutcome::Invalid(rejection) = outcome {
                debug!(
                    "Rejected {} {} ({}): {}",
                    parts.method,
                    path,
                    route.path_pattern,
                    rejection
                );
                self.events.record(GatewayEvent::Rejected);
                return ProblemDetail::from_rejection(&rejection).into_response();
            }
            self.events.record(GatewayEvent::Authorized);
        }

        if route.is_management() {
            self.events.record(GatewayEvent::ManagementServed);
            return self.serve_management(route.path_pattern.as_str());
        }
        let Some(target) = route.target_url(&matched.remainder, parts.uri.query()) else {
            warn!("Refusing {} {}: leaves the route target", parts.method, path);
            self.events.record(GatewayEvent::RouteNotFound);
            return ProblemDetail::gateway(
                GatewayErrorCode::RouteNotFound,
                format!("no route for {} {}", parts.method, path),
            )
            .into_response();
        };

        let declared_size = parts
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        if declared_size.is_some_and(|size| size > MAX_BODY_SIZE) {
            return self.body_too_large();
        }
        let Ok(body) = body::to_bytes(body, MAX_BODY_SIZE).await else {
            return self.body_too_large();
        };

        debug!("Forwarding {} {} to {}", parts.method, path, target);
        match self
            .upstream
            .forward(parts.method.clone(), target.clone(), &parts.headers, body)
            .await
        {
            Ok(response) => {
                self.events.record(GatewayEvent::Proxied);
                response
            }
            Err(e) => {
                warn!("Upstream {} failed: {}", target, e);
                self.events.record(GatewayEvent::UpstreamFailed);
                ProblemDetail::gateway(
                    GatewayErrorCode::UpstreamFailed,
                    format!("upstream for {} {} is unavailable", parts.method, path),
                )
                .into_response()
            }
        }
    }

    fn body_too_large(&self) -> Response {
        self.events.record(GatewayEvent::BodyTooLarge);
        ProblemDetail::gateway(
            GatewayErrorCode::BodyTooLarge,
            format!("request body exceeds {} bytes", MAX_BODY_SIZE),
        )
        .into_response()
    }

    fn serve_management(&self, path: &str) -> Response {
        match path {
            HEALTH_PATH => Json(self.health()).into_response(),
            METRICS_PATH => Json(self.metrics()).into_response(),
            _ => StatusCode::NOT_FOUND.into_response(),
        }
    }

    fn health(&self) -> Value {
        let snapshot = self.validator.store().snapshot();
        let mut degraded = false;
        let issuers = snapshot
            .iter()
            .map(|(name, issuer)| {
                let status = issuer.key_source.status();
                let keys = issuer
                    .key_source
                    .current_key_set()
                    .map(|key_set| key_set.len())
                    .unwrap_or_default();
                if issuer.config.enabled && keys == 0 {
                    degraded = true;
                }
                let last_fetched_at = status
                    .last_fetched_at
                    .and_then(|at| at.duration_since(UNIX_EPOCH).ok())
                    .map(|since| since.as_secs());
                (
                    name.clone(),
                    json!({
                        "enabled": issuer.config.enabled,
                        "keySource": issuer.config.key_source.source_type().to_string(),
                        "keys": keys,
                        "lastFetchedAt": last_fetched_at,
                        "lastError": status.last_error,
                    }),
                )
            })
            .collect::<Map<_, _>>();
        json!({
            "status": if degraded { "DEGRADED" } else { "UP" },
            "issuerCount": snapshot.len(),
            "issuers": issuers,
        })
    }

    fn metrics(&self) -> Value {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|since| since.as_secs())
            .unwrap_or_default();
        json!({
            "timestamp": timestamp,
            "validation": self.validator.events().snapshot(),
            "gateway": self.events.snapshot(),
            "decodedTokens": self.validator.decoded_tokens(),
        })
    }
}

async fn dispatch(
    State(handler): State<Arc<GatewayRequestHandler>>,
    request: Request<Body>,
) -> Response {
    handler.handle(request).await
}
