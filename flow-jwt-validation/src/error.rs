use std::{error::Error, fmt::Display};

/// Raised while resolving issuer configuration.
///
/// Resolution is all-or-nothing: when any of these is returned the previously
/// active issuer set stays in place.
#[derive(Clone, Debug, PartialEq)]
pub enum ConfigurationError {
    /// A key below the validation prefix does not name a known field.
    UnknownProperty(String),
    InvalidValue { key: String, reason: String },
    InvalidIssuerName(String),
    MissingKeySource(String),
    ConflictingKeySource { issuer: String, keys: Vec<String> },
    DuplicateIssuer { identifier: String, names: Vec<String> },
    InvalidKeySource { issuer: String, reason: String },
    StaticFile(String),
}

impl Display for ConfigurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigurationError::UnknownProperty(key) => {
                write!(f, "Unknown configuration property '{}'", key)
            }
            ConfigurationError::InvalidValue { key, reason } => {
                write!(f, "Invalid value for '{}': {}", key, reason)
            }
            ConfigurationError::InvalidIssuerName(name) => {
                write!(f, "Invalid issuer name '{}'", name)
            }
            ConfigurationError::MissingKeySource(issuer) => write!(
                f,
                "Issuer '{}' has no key source (jwks-url, jwks-file or jwks-content)",
                issuer
            ),
            ConfigurationError::ConflictingKeySource { issuer, keys } => write!(
                f,
                "Issuer '{}' defines more than one key source: {}",
                issuer,
                keys.join(", ")
            ),
            ConfigurationError::DuplicateIssuer { identifier, names } => write!(
                f,
                "Issuer identifier '{}' is claimed by several issuers: {}",
                identifier,
                names.join(", ")
            ),
            ConfigurationError::InvalidKeySource { issuer, reason } => {
                write!(f, "Invalid key source for issuer '{}': {}", issuer, reason)
            }
            ConfigurationError::StaticFile(reason) => {
                write!(f, "Unable to read static configuration: {}", reason)
            }
        }
    }
}
impl Error for ConfigurationError {}

#[derive(Clone, Debug, PartialEq)]
pub enum JwkError {
    FetchFailed(String),
    ParseFailed(String),
    EmptyKeySet,
    MissingKeyType(usize),
    MissingKeyId(usize),
    DecodingFailed(String),
}

impl Display for JwkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JwkError::FetchFailed(reason) => write!(f, "JWKS fetch failed: {}", reason),
            JwkError::ParseFailed(reason) => write!(f, "JWKS parse failed: {}", reason),
            JwkError::EmptyKeySet => write!(f, "JWKS contains no keys"),
            JwkError::MissingKeyType(index) => write!(f, "JWK #{} lacks 'kty'", index),
            JwkError::MissingKeyId(index) => write!(f, "JWK #{} lacks 'kid'", index),
            JwkError::DecodingFailed(kid) => {
                write!(f, "JWK '{}' could not be turned into a decoding key", kid)
            }
        }
    }
}
impl Error for JwkError {}

#[derive(Clone, Debug, PartialEq)]
pub enum RouteConfigError {
    Parse(String),
    InvalidEntry { entry: String, reason: String },
    DuplicateRoute { entry: String },
    InvalidTarget { entry: String, target: String },
}

impl Display for RouteConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteConfigError::Parse(reason) => write!(f, "Unable to parse routes: {}", reason),
            RouteConfigError::InvalidEntry { entry, reason } => {
                write!(f, "Invalid route {}: {}", entry, reason)
            }
            RouteConfigError::DuplicateRoute { entry } => {
                write!(f, "Duplicate route {}", entry)
            }
            RouteConfigError::InvalidTarget { entry, target } => {
                write!(f, "Route {} has unresolvable target '{}'", entry, target)
            }
        }
    }
}
impl Error for RouteConfigError {}

#[derive(Clone, Debug, PartialEq)]
pub enum ServerLifecycleError {
    AlreadyRunning { port: u16 },
    StartFailed { port: u16, reason: String },
}

impl Display for ServerLifecycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerLifecycleError::AlreadyRunning { port } => {
                write!(f, "Gateway is already running on port {}", port)
            }
            ServerLifecycleError::StartFailed { port, reason } => {
                write!(f, "Gateway failed to start on port {}: {}", port, reason)
            }
        }
    }
}
impl Error for ServerLifecycleError {}
