#![allow(dead_code)]

use std::sync::Arc;

use axum::{body::Body, Router};
use flow_jwt_validation::{
    gateway::{GatewayRequestHandler, RouteTable},
    manager::ConfigurationManager,
    properties::PropertyLayer,
    validation::TokenValidator,
};
use http::{header::AUTHORIZATION, Method, Request, Response};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

pub mod jwt;
pub mod keys;

/// Serves `jwk_set` on `/<issuer>/jwks` of the mock server.
pub async fn mock_jwks(mock_server: &MockServer, issuer: &str, jwk_set: String) -> String {
    Mock::given(method("GET"))
        .and(path(format!("/{}/jwks", issuer)))
        .respond_with(ResponseTemplate::new(200).set_body_string(jwk_set))
        .mount(mock_server)
        .await;
    format!("{}/{}/jwks", mock_server.uri(), issuer)
}

/// A manager with only dynamic properties, already resolved and with all key
/// sets loaded.
pub async fn configured_manager(properties: &[(&str, String)]) -> ConfigurationManager {
    let manager = ConfigurationManager::new(PropertyLayer::new(), PropertyLayer::new());
    let snapshot = manager
        .reconfigure(properties.iter().map(|(k, v)| (*k, v.as_str())))
        .expect("Failed to resolve configuration");
    for (name, result) in snapshot.refresh_all().await {
        result.unwrap_or_else(|e| panic!("Failed to load keys of {}: {}", name, e));
    }
    manager
}

pub fn gateway(manager: &ConfigurationManager, routes: &str) -> (Router, Arc<TokenValidator>) {
    let validator = Arc::new(TokenValidator::new(manager.store()));
    let handler = GatewayRequestHandler::new(
        RouteTable::parse(routes).expect("Failed to parse routes"),
        validator.clone(),
    )
    .expect("Failed to create gateway handler");
    (handler.into_router(), validator)
}

pub async fn call(
    router: &Router,
    method: Method,
    uri: &str,
    token: Option<&str>,
) -> Response<Body> {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        request = request.header(AUTHORIZATION, format!("Bearer {}", token));
    }
    router
        .clone()
        .oneshot(request.body(Body::empty()).unwrap())
        .await
        .unwrap()
}

pub async fn json_body(response: Response<Body>) -> Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}
