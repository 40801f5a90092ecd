#![doc = include_str!("../README.md")]

/// [ClaimMapper](crate::claims::ClaimMapper) flattens verified claims into
/// string attributes.
///
/// The attribute names are stable and documented on
/// [ClaimMapper](crate::claims::ClaimMapper).
pub mod claims;

/// Error types returned by configuration, key loading, route parsing and the
/// gateway lifecycle.
///
/// Rejected tokens are not errors, see [outcome](crate::outcome).
pub mod error;

/// Lock-free counters of validation and gateway outcomes.
pub mod events;

/// The embedded REST gateway.
///
/// A [RouteTable](crate::gateway::RouteTable) maps requests to targets,
/// [GatewayRequestHandler](crate::gateway::GatewayRequestHandler) authenticates
/// and forwards them, and
/// [GatewayServerManager](crate::gateway::GatewayServerManager) owns the
/// listener.
pub mod gateway;

/// [IssuerConfig](crate::issuer::IssuerConfig) describes one trusted issuer.
///
/// # Example
///
/// ```
/// use flow_jwt_validation::issuer::{IssuerConfig, MatchPolicy};
///
/// let issuer = IssuerConfig::builder("keycloak")
///     .identifier("https://kc.example.com/realms/main")
///     .jwks_url("https://kc.example.com/realms/main/protocol/openid-connect/certs")
///     .audience("orders-service")
///     .scopes(&["orders.read"])
///     .match_policy(MatchPolicy::All)
///     .build()
///     .expect("valid issuer configuration");
/// assert_eq!(issuer.name, "keycloak");
/// ```
pub mod issuer;

/// [JwksKeySource](crate::jwks::JwksKeySource) holds the signing keys of one
/// issuer and refreshes them in the background.
pub mod jwks;

/// [TokenExtractor](crate::jwt_extract::TokenExtractor) pulls the raw token
/// out of a [UnitOfWork](crate::jwt_extract::UnitOfWork).
pub mod jwt_extract;

/// [UnverifiedJwt](crate::jwt_unverified::UnverifiedJwt) is used internally
/// to read the issuer and key id of a token before it is verified.
pub mod jwt_unverified;

/// Resolution of the configuration layers into the live
/// [IssuerStore](crate::manager::IssuerStore).
///
/// # Example
///
/// ```
/// use flow_jwt_validation::manager::ConfigurationManager;
/// use flow_jwt_validation::properties::PropertyLayer;
///
/// #[tokio::main]
/// async fn main() {
///     let static_layer = PropertyLayer::from_yaml(r#"
/// validation:
///   keycloak:
///     jwks-url: https://kc.example.com/certs
///     audience: orders-service
/// "#).expect("valid static configuration");
///     let manager = ConfigurationManager::new(static_layer, PropertyLayer::new());
///
///     let snapshot = manager
///         .reconfigure([("validation.keycloak.audience", "ignored, static wins")])
///         .expect("valid configuration");
///     let keycloak = snapshot.get("keycloak").unwrap();
///     assert_eq!(keycloak.config.expected_audience.as_deref(), Some("orders-service"));
/// }
/// ```
pub mod manager;

/// [ValidationOutcome](crate::outcome::ValidationOutcome) and the error code
/// taxonomy shared by record attributes and gateway responses.
pub mod outcome;

/// [TokenProcessor](crate::processor::TokenProcessor) validates the token of
/// a unit of work and tells the hosting runtime where to route it.
pub mod processor;

/// Parsing of the flat `validation.<issuer>.<field>` key space.
pub mod properties;

/// [TokenValidator](crate::validation::TokenValidator) runs the validation
/// pipeline.
pub mod validation;
