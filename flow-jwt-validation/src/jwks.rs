use std::{
    collections::HashMap,
    fmt::{self, Display},
    path::PathBuf,
    sync::Arc,
    time::{Duration, SystemTime},
};

use arc_swap::{ArcSwap, ArcSwapOption};
use async_trait::async_trait;
use jsonwebtoken::{
    jwk::{Jwk, JwkSet, KeyAlgorithm},
    Algorithm, DecodingKey,
};
use log::{debug, info, warn};
use serde_json::Value;
use tokio::{task::JoinHandle, time};
use url::Url;

#[cfg(test)]
use mockall::automock;

use crate::error::JwkError;

/// Where the keys of one issuer come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeySourceRef {
    Server(Url),
    File(PathBuf),
    Memory(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeySourceType {
    Server,
    File,
    Memory,
}

impl KeySourceRef {
    pub fn source_type(&self) -> KeySourceType {
        match self {
            KeySourceRef::Server(_) => KeySourceType::Server,
            KeySourceRef::File(_) => KeySourceType::File,
            KeySourceRef::Memory(_) => KeySourceType::Memory,
        }
    }
}

impl Display for KeySourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySourceRef::Server(url) => write!(f, "server {}", url),
            KeySourceRef::File(path) => write!(f, "file {}", path.display()),
            KeySourceRef::Memory(_) => write!(f, "inline content"),
        }
    }
}

impl Display for KeySourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySourceType::Server => f.write_str("SERVER"),
            KeySourceType::File => f.write_str("FILE"),
            KeySourceType::Memory => f.write_str("MEMORY"),
        }
    }
}

#[derive(Clone)]
pub struct VerificationKey {
    pub decoding_key: DecodingKey,
    pub algorithm: Option<Algorithm>,
}

/// A parsed, non-empty JWK set with a decoding key per `kid`.
pub struct KeySet {
    jwks: JwkSet,
    keys: HashMap<String, VerificationKey>,
}

impl KeySet {
    /// Parses a JWKS document.
    ///
    /// Rejects sets without keys and entries lacking `kty` or `kid`.
    pub fn parse(raw: &[u8]) -> Result<Self, JwkError> {
        let value: Value =
            serde_json::from_slice(raw).map_err(|e| JwkError::ParseFailed(e.to_string()))?;
        let entries = value
            .get("keys")
            .and_then(Value::as_array)
            .ok_or_else(|| JwkError::ParseFailed("missing 'keys' array".to_owned()))?;
        if entries.is_empty() {
            return Err(JwkError::EmptyKeySet);
        }
        for (index, entry) in entries.iter().enumerate() {
            if entry.get("kty").and_then(Value::as_str).is_none() {
                return Err(JwkError::MissingKeyType(index));
            }
            if entry.get("kid").and_then(Value::as_str).is_none() {
                return Err(JwkError::MissingKeyId(index));
            }
        }
        let jwks: JwkSet =
            serde_json::from_value(value).map_err(|e| JwkError::ParseFailed(e.to_string()))?;
        let keys = jwks
            .keys
            .iter()
            .map(parse_jwk)
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(Self { jwks, keys })
    }

    pub fn get(&self, kid: &str) -> Option<&VerificationKey> {
        self.keys.get(kid)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn key_ids(&self) -> Vec<&str> {
        let mut ids = self.keys.keys().map(String::as_str).collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }

    pub fn jwks(&self) -> &JwkSet {
        &self.jwks
    }
}

impl fmt::Debug for KeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySet")
            .field("key_ids", &self.key_ids())
            .finish()
    }
}

fn parse_jwk(jwk: &Jwk) -> Result<(String, VerificationKey), JwkError> {
    let key_id = jwk
        .common
        .key_id
        .clone()
        .ok_or(JwkError::MissingKeyId(0))?;
    let decoding_key =
        DecodingKey::from_jwk(jwk).map_err(|_| JwkError::DecodingFailed(key_id.clone()))?;
    Ok((
        key_id,
        VerificationKey {
            decoding_key,
            algorithm: jwk.common.key_algorithm.and_then(parse_key_alg),
        },
    ))
}

fn parse_key_alg(key_alg: KeyAlgorithm) -> Option<Algorithm> {
    match key_alg {
        KeyAlgorithm::HS256 => Some(Algorithm::HS256),
        KeyAlgorithm::HS384 => Some(Algorithm::HS384),
        KeyAlgorithm::HS512 => Some(Algorithm::HS512),
        KeyAlgorithm::ES256 => Some(Algorithm::ES256),
        KeyAlgorithm::ES384 => Some(Algorithm::ES384),
        KeyAlgorithm::RS256 => Some(Algorithm::RS256),
        KeyAlgorithm::RS384 => Some(Algorithm::RS384),
        KeyAlgorithm::RS512 => Some(Algorithm::RS512),
        KeyAlgorithm::PS256 => Some(Algorithm::PS256),
        KeyAlgorithm::PS384 => Some(Algorithm::PS384),
        KeyAlgorithm::PS512 => Some(Algorithm::PS512),
        KeyAlgorithm::EdDSA => Some(Algorithm::EdDSA),
        _ => None,
    }
}

/// Reads the raw JWKS document of a refreshable key source.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait JwksLoader: Send + Sync {
    async fn load(&self) -> Result<Vec<u8>, JwkError>;
}

pub struct HttpJwksLoader {
    jwks_url: Url,
    client: reqwest::Client,
}

impl HttpJwksLoader {
    pub fn new(jwks_url: Url, timeout: Duration) -> Result<Self, JwkError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| JwkError::FetchFailed(e.to_string()))?;
        Ok(Self { jwks_url, client })
    }
}

#[async_trait]
impl JwksLoader for HttpJwksLoader {
    async fn load(&self) -> Result<Vec<u8>, JwkError> {
        let response = self
            .client
            .get(self.jwks_url.clone())
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| JwkError::FetchFailed(e.to_string()))?;
        let body = response
            .bytes()
            .await
            .map_err(|e| JwkError::FetchFailed(e.to_string()))?;
        Ok(body.to_vec())
    }
}

pub struct FileJwksLoader {
    path: PathBuf,
}

impl FileJwksLoader {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl JwksLoader for FileJwksLoader {
    async fn load(&self) -> Result<Vec<u8>, JwkError> {
        tokio::fs::read(&self.path)
            .await
            .map_err(|e| JwkError::FetchFailed(format!("{}: {}", self.path.display(), e)))
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RefreshStatus {
    pub last_fetched_at: Option<SystemTime>,
    pub last_error: Option<String>,
}

/// Signing keys of one issuer.
///
/// Readers only ever see the last successfully loaded [KeySet]; a failed
/// refresh records its error and leaves the cached set in place.
pub struct JwksKeySource {
    locator: KeySourceRef,
    refresh_interval: Duration,
    loader: Option<Box<dyn JwksLoader>>,
    current: ArcSwapOption<KeySet>,
    status: ArcSwap<RefreshStatus>,
}

impl JwksKeySource {
    pub fn new(
        locator: KeySourceRef,
        refresh_interval: Duration,
        timeout: Duration,
    ) -> Result<Self, JwkError> {
        match &locator {
            KeySourceRef::Server(url) => {
                let loader = HttpJwksLoader::new(url.clone(), timeout)?;
                Ok(Self::with_loader(locator, refresh_interval, Box::new(loader)))
            }
            KeySourceRef::File(path) => {
                let loader = FileJwksLoader::new(path.clone());
                Ok(Self::with_loader(locator, refresh_interval, Box::new(loader)))
            }
            KeySourceRef::Memory(content) => {
                let key_set = KeySet::parse(content.as_bytes())?;
                Ok(Self {
                    locator,
                    refresh_interval,
                    loader: None,
                    current: ArcSwapOption::from_pointee(key_set),
                    status: ArcSwap::from_pointee(RefreshStatus {
                        last_fetched_at: Some(SystemTime::now()),
                        last_error: None,
                    }),
                })
            }
        }
    }

    pub fn with_loader(
        locator: KeySourceRef,
        refresh_interval: Duration,
        loader: Box<dyn JwksLoader>,
    ) -> Self {
        Self {
            locator,
            refresh_interval,
            loader: Some(loader),
            current: ArcSwapOption::empty(),
            status: ArcSwap::from_pointee(RefreshStatus::default()),
        }
    }

    pub fn locator(&self) -> &KeySourceRef {
        &self.locator
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    /// The cached key set. Never touches the network or the filesystem.
    pub fn current_key_set(&self) -> Option<Arc<KeySet>> {
        self.current.load_full()
    }

    pub fn status(&self) -> RefreshStatus {
        self.status.load().as_ref().clone()
    }

    /// Reloads the key set. A no-op for inline content.
    pub async fn refresh(&self) -> Result<(), JwkError> {
        let Some(loader) = &self.loader else {
            return Ok(());
        };
        let loaded = match loader.load().await {
            Ok(raw) => KeySet::parse(&raw),
            Err(e) => Err(e),
        };
        match loaded {
            Ok(key_set) => {
                info!(
                    "Updated JWK set from {} ({} keys)",
                    self.locator,
                    key_set.len()
                );
                self.current.store(Some(Arc::new(key_set)));
                self.status.store(Arc::new(RefreshStatus {
                    last_fetched_at: Some(SystemTime::now()),
                    last_error: None,
                }));
                Ok(())
            }
            Err(e) => {
                warn!(
                    "Failed to refresh JWK set from {}, keeping previous keys: {}",
                    self.locator, e
                );
                let previous = self.status.load();
                self.status.store(Arc::new(RefreshStatus {
                    last_fetched_at: previous.last_fetched_at,
                    last_error: Some(e.to_string()),
                }));
                Err(e)
            }
        }
    }

    /// Spawns the background refresh job; `None` when the source never changes.
    ///
    /// The first refresh runs immediately, then once per refresh interval.
    pub fn spawn_refresh(self: &Arc<Self>) -> Option<RefreshTask> {
        self.loader.as_ref()?;
        Some(RefreshTask(tokio::spawn(refresh_job(self.clone()))))
    }

    pub(crate) fn has_origin(&self, locator: &KeySourceRef, refresh_interval: Duration) -> bool {
        self.locator == *locator && self.refresh_interval == refresh_interval
    }
}

impl fmt::Debug for JwksKeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwksKeySource")
            .field("locator", &self.locator.to_string())
            .field("refresh_interval", &self.refresh_interval)
            .finish()
    }
}

async fn refresh_job(source: Arc<JwksKeySource>) {
    let mut interval = time::interval(source.refresh_interval);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if source.refresh().await.is_err() {
            debug!(
                "Next JWK set refresh from {} in {:?}",
                source.locator, source.refresh_interval
            );
        }
    }
}

/// Handle of a running refresh job; the job stops when the handle is dropped.
#[derive(Debug)]
pub struct RefreshTask(JoinHandle<()>);

impl Drop for RefreshTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use mockall::Sequence;
    use serde_json::json;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    const TEST_RSA_MODULUS: &str = "oEz_RrupHP9d9XiFbXLoJMwG-75Z18t4ziBy2PHTZHxkHOep7aFeNj-13NmIcL4ooj-2nxrLhWbgA2iBaWr95wKkf5peTsc-5Q6-B2uCcn9xPSQK08Y_jNVhtly3mAOdsT4Y9mQIO_oqaqEyzutypZBEu-18NkbGVwkNhG9sxvUjFXHvMoJs5iwILaDA2FhuEioIDzOy-ZjD8p928ye2v8CdPWl1xPxoBXd2KIe3RkocRDxLeeBg3wH8a9tQ5Z7fOmiXiAI8_lN57zYf078yazvLUlKzCo1pQoR25MU51d7zgI_I7H2Fb5PZGcCmfvN1Up41OfEQyMLL6JYyoP23XQ";

    fn jwks_json(kid: &str) -> Value {
        json!({
            "keys": [{
                "kty": "RSA",
                "use": "sig",
                "alg": "RS256",
                "kid": kid,
                "n": TEST_RSA_MODULUS,
                "e": "AQAB"
            }]
        })
    }

    fn jwks_bytes(kid: &str) -> Vec<u8> {
        serde_json::to_vec(&jwks_json(kid)).unwrap()
    }

    #[test]
    fn parse_key_set() {
        let key_set = KeySet::parse(&jwks_bytes("test-kid")).unwrap();
        assert_eq!(key_set.len(), 1);
        assert_eq!(key_set.key_ids(), vec!["test-kid"]);
        assert_eq!(
            key_set.get("test-kid").unwrap().algorithm,
            Some(Algorithm::RS256)
        );
    }

    #[test]
    fn reject_empty_key_set() {
        let result = KeySet::parse(br#"{"keys": []}"#);
        assert_eq!(result.unwrap_err(), JwkError::EmptyKeySet);
    }

    #[test]
    fn reject_key_without_kid() {
        let mut jwks = jwks_json("x");
        jwks["keys"][0].as_object_mut().unwrap().remove("kid");
        let result = KeySet::parse(&serde_json::to_vec(&jwks).unwrap());
        assert_eq!(result.unwrap_err(), JwkError::MissingKeyId(0));
    }

    #[test]
    fn reject_key_without_kty() {
        let mut jwks = jwks_json("x");
        jwks["keys"][0].as_object_mut().unwrap().remove("kty");
        let result = KeySet::parse(&serde_json::to_vec(&jwks).unwrap());
        assert_eq!(result.unwrap_err(), JwkError::MissingKeyType(0));
    }

    #[test]
    fn reject_garbage() {
        assert!(matches!(
            KeySet::parse(b"not json"),
            Err(JwkError::ParseFailed(_))
        ));
    }

    #[tokio::test]
    async fn memory_source_is_loaded_once() {
        let content = jwks_json("inline").to_string();
        let source = JwksKeySource::new(
            KeySourceRef::Memory(content),
            Duration::from_secs(60),
            Duration::from_secs(1),
        )
        .unwrap();

        let first = source.current_key_set().unwrap();
        assert!(source.refresh().await.is_ok());
        let second = source.current_key_set().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::new(source).spawn_refresh().is_none());
    }

    #[tokio::test]
    async fn repeated_reads_return_same_key_set() {
        let mut loader = MockJwksLoader::new();
        loader
            .expect_load()
            .times(1)
            .returning(|| Ok(jwks_bytes("kid-1")));
        let source = JwksKeySource::with_loader(
            KeySourceRef::Server("https://issuer.example.com/jwks".parse().unwrap()),
            Duration::from_secs(60),
            Box::new(loader),
        );
        assert!(source.current_key_set().is_none());

        source.refresh().await.unwrap();

        let first = source.current_key_set().unwrap();
        let second = source.current_key_set().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_key_set() {
        let mut seq = Sequence::new();
        let mut loader = MockJwksLoader::new();
        loader
            .expect_load()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(jwks_bytes("kid-1")));
        loader
            .expect_load()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Err(JwkError::FetchFailed("connection refused".to_owned())));
        let source = JwksKeySource::with_loader(
            KeySourceRef::Server("https://issuer.example.com/jwks".parse().unwrap()),
            Duration::from_secs(60),
            Box::new(loader),
        );

        source.refresh().await.unwrap();
        let before = source.current_key_set().unwrap();
        let fetched_at = source.status().last_fetched_at;

        let result = source.refresh().await;

        assert!(result.is_err());
        let after = source.current_key_set().unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        let status = source.status();
        assert_eq!(status.last_fetched_at, fetched_at);
        assert!(status.last_error.unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn invalid_document_keeps_previous_key_set() {
        let mut seq = Sequence::new();
        let mut loader = MockJwksLoader::new();
        loader
            .expect_load()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(jwks_bytes("kid-1")));
        loader
            .expect_load()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(br#"{"keys": []}"#.to_vec()));
        let source = JwksKeySource::with_loader(
            KeySourceRef::File(PathBuf::from("/etc/jwks.json")),
            Duration::from_secs(60),
            Box::new(loader),
        );

        source.refresh().await.unwrap();
        assert_eq!(source.refresh().await, Err(JwkError::EmptyKeySet));
        assert_eq!(source.current_key_set().unwrap().key_ids(), vec!["kid-1"]);
    }

    #[tokio::test]
    async fn file_source_rereads_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("jwks.json");
        std::fs::write(&file, jwks_bytes("first")).unwrap();
        let source = JwksKeySource::new(
            KeySourceRef::File(file.clone()),
            Duration::from_secs(60),
            Duration::from_secs(1),
        )
        .unwrap();

        source.refresh().await.unwrap();
        assert_eq!(source.current_key_set().unwrap().key_ids(), vec!["first"]);

        std::fs::write(&file, jwks_bytes("second")).unwrap();
        source.refresh().await.unwrap();
        assert_eq!(source.current_key_set().unwrap().key_ids(), vec!["second"]);
    }

    #[tokio::test]
    async fn server_source_is_refreshed_in_background() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jwks.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(jwks_json("remote")))
            .mount(&mock_server)
            .await;
        let source = Arc::new(
            JwksKeySource::new(
                KeySourceRef::Server(
                    format!("{}/jwks.json", &mock_server.uri()).parse().unwrap(),
                ),
                Duration::from_millis(5),
                Duration::from_secs(1),
            )
            .unwrap(),
        );
        let _task = source.spawn_refresh().unwrap();

        let mut success = false;
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(500) {
            if source.current_key_set().is_some() {
                success = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(success, "Key source did not receive JWKS in time");
    }

    #[tokio::test]
    async fn server_error_is_recorded() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jwks.json"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&mock_server)
            .await;
        let source = JwksKeySource::new(
            KeySourceRef::Server(format!("{}/jwks.json", &mock_server.uri()).parse().unwrap()),
            Duration::from_secs(60),
            Duration::from_secs(1),
        )
        .unwrap();

        assert!(matches!(
            source.refresh().await,
            Err(JwkError::FetchFailed(_))
        ));
        assert!(source.current_key_set().is_none());
        assert!(source.status().last_error.is_some());
    }
}
