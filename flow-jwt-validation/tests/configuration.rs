use std::io::Write;

use flow_jwt_validation::{
    error::ConfigurationError,
    jwks::KeySourceRef,
    manager::ConfigurationManager,
    properties::PropertyLayer,
    validation::TokenValidator,
};
use tempfile::NamedTempFile;

use crate::common::{
    jwt::JwtBuilder,
    keys::{jwk_set, SigningKey},
};

pub mod common;

fn static_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(contents.as_bytes())
        .expect("Failed to write temp file");
    file
}

#[tokio::test]
async fn static_file_wins_over_dynamic_properties() {
    let jwks = jwk_set(&[&SigningKey::primary()]);
    let file = static_file(
        r#"
validation:
  issuer-A:
    audience: aud-A
"#,
    );
    let manager = ConfigurationManager::new(
        PropertyLayer::from_yaml_file(file.path()).unwrap(),
        PropertyLayer::new(),
    );

    manager
        .reconfigure([
            ("validation.issuer-A.jwks-content", jwks.as_str()),
            ("validation.issuer-A.audience", "aud-B"),
        ])
        .unwrap();
    let validator = TokenValidator::new(manager.store());

    let token_a = JwtBuilder::new().iss("issuer-A").aud("aud-A").build();
    let token_b = JwtBuilder::new().iss("issuer-A").aud("aud-B").build();
    assert!(validator.validate(Some(&token_a)).is_valid());
    assert!(!validator.validate(Some(&token_b)).is_valid());
}

#[tokio::test]
async fn environment_wins_over_dynamic_properties() {
    let env = PropertyLayer::from_env_vars([
        (
            "VALIDATION__ISSUER_A__JWKS_URL".to_owned(),
            "https://env.example.com/jwks".to_owned(),
        ),
        ("PATH".to_owned(), "/usr/bin".to_owned()),
    ])
    .unwrap();
    let manager = ConfigurationManager::new(PropertyLayer::new(), env);

    let snapshot = manager
        .reconfigure([
            ("validation.issuer-A.jwks-url", "https://dynamic.example.com/jwks"),
            ("validation.issuer-A.audience", "orders"),
        ])
        .unwrap();

    assert!(snapshot.get("issuer-a").is_none());
    let issuer = snapshot.get("issuer-A").unwrap();
    assert_eq!(
        issuer.config.key_source,
        KeySourceRef::Server("https://env.example.com/jwks".parse().unwrap())
    );
    assert_eq!(issuer.config.expected_audience.as_deref(), Some("orders"));
}

#[tokio::test]
async fn failed_reconfiguration_keeps_previous_issuers() {
    let manager = ConfigurationManager::new(PropertyLayer::new(), PropertyLayer::new());
    manager
        .reconfigure([("validation.issuer-A.jwks-url", "https://a.example.com/jwks")])
        .unwrap();

    let result = manager.reconfigure([
        ("validation.issuer-A.jwks-url", "https://a.example.com/jwks"),
        ("validation.issuer-B.audience", "orders"),
    ]);

    assert_eq!(
        result.unwrap_err(),
        ConfigurationError::MissingKeySource("issuer-B".to_owned())
    );
    let snapshot = manager.store().snapshot();
    assert_eq!(snapshot.len(), 1);
    assert!(snapshot.get("issuer-A").is_some());
}

#[tokio::test]
async fn jwks_file_source() {
    let jwks = static_file(&jwk_set(&[&SigningKey::primary()]));
    let path = jwks.path().to_string_lossy().into_owned();
    let manager = ConfigurationManager::new(PropertyLayer::new(), PropertyLayer::new());

    let snapshot = manager
        .reconfigure([("validation.issuer-A.jwks-file", path.as_str())])
        .unwrap();
    for (_, result) in snapshot.refresh_all().await {
        result.unwrap();
    }

    let token = JwtBuilder::new().iss("issuer-A").build();
    assert!(TokenValidator::new(manager.store())
        .validate(Some(&token))
        .is_valid());
}

#[test]
fn unreadable_static_file() {
    let result = ConfigurationManager::from_sources(Some(std::path::Path::new(
        "/nonexistent/validation.yaml",
    )));

    assert!(matches!(result, Err(ConfigurationError::StaticFile(_))));
}
