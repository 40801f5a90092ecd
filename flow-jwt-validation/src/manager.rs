use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use arc_swap::ArcSwap;
use futures_util::future::join_all;
use log::{debug, info};

use crate::{
    error::{ConfigurationError, JwkError},
    issuer::{IssuerConfig, DEFAULT_REFRESH_INTERVAL},
    jwks::{JwksKeySource, RefreshTask},
    jwt_extract::{TokenExtractor, TokenLocation, DEFAULT_BEARER_PREFIX, DEFAULT_TOKEN_HEADER},
    properties::PropertyLayer,
};

pub const DEFAULT_MAX_TOKEN_SIZE: usize = 16384;
pub const DEFAULT_JWKS_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings shared by all issuers.
#[derive(Clone, Debug, PartialEq)]
pub struct ValidationSettings {
    pub token_location: TokenLocation,
    pub token_header: String,
    pub bearer_prefix: Option<String>,
    pub max_token_size: usize,
    pub refresh_interval: Duration,
    pub jwks_timeout: Duration,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            token_location: TokenLocation::AuthorizationHeader,
            token_header: DEFAULT_TOKEN_HEADER.to_owned(),
            bearer_prefix: Some(DEFAULT_BEARER_PREFIX.to_owned()),
            max_token_size: DEFAULT_MAX_TOKEN_SIZE,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            jwks_timeout: DEFAULT_JWKS_TIMEOUT,
        }
    }
}

impl ValidationSettings {
    fn from_layer(layer: &PropertyLayer) -> Self {
        let defaults = Self::default();
        let globals = &layer.globals;
        let token_location = globals.token_location.unwrap_or_default();
        // Custom headers carry the bare token unless a prefix is configured.
        let bearer_prefix = match (&globals.bearer_prefix, token_location) {
            (Some(prefix), _) => Some(prefix.clone()),
            (None, TokenLocation::AuthorizationHeader) => defaults.bearer_prefix,
            (None, _) => None,
        };
        Self {
            token_location,
            token_header: globals
                .token_header
                .clone()
                .unwrap_or(defaults.token_header),
            bearer_prefix,
            max_token_size: globals.max_token_size.unwrap_or(defaults.max_token_size),
            refresh_interval: globals
                .refresh_interval
                .unwrap_or(defaults.refresh_interval),
            jwks_timeout: globals.jwks_timeout.unwrap_or(defaults.jwks_timeout),
        }
    }

    /// The extractor matching the configured token location.
    pub fn token_extractor(&self) -> TokenExtractor {
        TokenExtractor::new(
            self.token_location,
            self.token_header.clone(),
            self.bearer_prefix.clone(),
            self.max_token_size,
        )
    }
}

/// Result of merging the configuration layers; no key sources yet.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedConfiguration {
    pub settings: ValidationSettings,
    pub issuers: BTreeMap<String, IssuerConfig>,
}

/// Merges the three configuration layers.
///
/// Precedence is per field: static file over environment over dynamic
/// properties.
pub fn resolve(
    static_layer: &PropertyLayer,
    env_layer: &PropertyLayer,
    dynamic_layer: &PropertyLayer,
) -> Result<ResolvedConfiguration, ConfigurationError> {
    let env_layer = env_layer
        .clone()
        .with_issuer_names_from(&[static_layer, dynamic_layer]);
    let merged = static_layer
        .clone()
        .overlay(env_layer.overlay(dynamic_layer.clone()));
    let settings = ValidationSettings::from_layer(&merged);

    let issuers = merged
        .issuers
        .into_iter()
        .map(|(name, properties)| {
            let config = properties.into_config(&name, settings.refresh_interval)?;
            Ok((name, config))
        })
        .collect::<Result<BTreeMap<_, _>, ConfigurationError>>()?;
    check_unique_identifiers(issuers.values())?;

    Ok(ResolvedConfiguration { settings, issuers })
}

fn check_unique_identifiers<'a>(
    issuers: impl Iterator<Item = &'a IssuerConfig>,
) -> Result<(), ConfigurationError> {
    let mut names_by_identifier: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for issuer in issuers {
        names_by_identifier
            .entry(issuer.identifier.as_str())
            .or_default()
            .push(issuer.name.clone());
    }
    match names_by_identifier
        .into_iter()
        .find(|(_, names)| names.len() > 1)
    {
        Some((identifier, names)) => Err(ConfigurationError::DuplicateIssuer {
            identifier: identifier.to_owned(),
            names,
        }),
        None => Ok(()),
    }
}

/// An issuer together with its live key source.
#[derive(Debug)]
pub struct ResolvedIssuer {
    pub config: IssuerConfig,
    pub key_source: Arc<JwksKeySource>,
    refresh_task: Option<Arc<RefreshTask>>,
}

impl ResolvedIssuer {
    pub fn is_refreshing(&self) -> bool {
        self.refresh_task.is_some()
    }
}

/// Immutable view of every configured issuer.
///
/// Validations hold on to the snapshot they started with; reconfiguration
/// publishes a new one.
#[derive(Debug, Default)]
pub struct IssuerSnapshot {
    settings: ValidationSettings,
    issuers: BTreeMap<String, Arc<ResolvedIssuer>>,
    by_identifier: HashMap<String, String>,
}

impl IssuerSnapshot {
    pub fn settings(&self) -> &ValidationSettings {
        &self.settings
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ResolvedIssuer>> {
        self.issuers.get(name)
    }

    /// Finds the issuer whose expected `iss` equals `identifier`, enabled or not.
    pub fn by_identifier(&self, identifier: &str) -> Option<&Arc<ResolvedIssuer>> {
        self.issuers.get(self.by_identifier.get(identifier)?)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<ResolvedIssuer>)> {
        self.issuers.iter()
    }

    pub fn len(&self) -> usize {
        self.issuers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.issuers.is_empty()
    }

    /// Refreshes the key sources of all enabled issuers concurrently.
    pub async fn refresh_all(&self) -> Vec<(String, Result<(), JwkError>)> {
        let enabled = self
            .issuers
            .iter()
            .filter(|(_, issuer)| issuer.config.enabled)
            .collect::<Vec<_>>();
        let results = join_all(
            enabled
                .iter()
                .map(|(_, issuer)| issuer.key_source.refresh()),
        )
        .await;
        enabled
            .into_iter()
            .map(|(name, _)| name.clone())
            .zip(results)
            .collect()
    }

    /// Builds live issuers, reusing key sources of `previous` whose locator
    /// and refresh interval did not change.
    ///
    /// Spawns refresh jobs, so this has to run within a tokio runtime.
    fn build(
        resolved: ResolvedConfiguration,
        previous: &IssuerSnapshot,
    ) -> Result<Self, ConfigurationError> {
        let mut issuers = BTreeMap::new();
        let mut by_identifier = HashMap::new();
        for (name, config) in resolved.issuers {
            let reused = previous.issuers.get(&name).filter(|old| {
                old.key_source
                    .has_origin(&config.key_source, config.refresh_interval)
                    && old.config.enabled == config.enabled
            });
            let (key_source, refresh_task) = match reused {
                Some(old) => {
                    debug!("Keeping key source of issuer '{}'", name);
                    (old.key_source.clone(), old.refresh_task.clone())
                }
                None => {
                    let key_source = Arc::new(
                        JwksKeySource::new(
                            config.key_source.clone(),
                            config.refresh_interval,
                            resolved.settings.jwks_timeout,
                        )
                        .map_err(|e| ConfigurationError::InvalidKeySource {
                            issuer: name.clone(),
                            reason: e.to_string(),
                        })?,
                    );
                    let refresh_task = if config.enabled {
                        key_source.spawn_refresh().map(Arc::new)
                    } else {
                        None
                    };
                    (key_source, refresh_task)
                }
            };
            by_identifier.insert(config.identifier.clone(), name.clone());
            issuers.insert(
                name,
                Arc::new(ResolvedIssuer {
                    config,
                    key_source,
                    refresh_task,
                }),
            );
        }
        Ok(Self {
            settings: resolved.settings,
            issuers,
            by_identifier,
        })
    }
}

/// Holds the current [IssuerSnapshot] behind an atomic reference.
#[derive(Debug, Default)]
pub struct IssuerStore {
    current: ArcSwap<IssuerSnapshot>,
}

impl IssuerStore {
    /// An empty store: every token is rejected as coming from an unknown issuer.
    pub fn new() -> Self {
        Self::default()
    }

    /// A store with a fixed set of issuers, bypassing the property layers.
    ///
    /// Must be called within a tokio runtime when any issuer uses a remote or
    /// file key source.
    pub fn with_issuers(
        settings: ValidationSettings,
        issuers: impl IntoIterator<Item = IssuerConfig>,
    ) -> Result<Self, ConfigurationError> {
        let mut by_name = BTreeMap::new();
        for issuer in issuers {
            if by_name.contains_key(&issuer.name) {
                return Err(ConfigurationError::DuplicateIssuer {
                    identifier: issuer.identifier.clone(),
                    names: vec![issuer.name.clone(), issuer.name],
                });
            }
            by_name.insert(issuer.name.clone(), issuer);
        }
        check_unique_identifiers(by_name.values())?;
        let snapshot = IssuerSnapshot::build(
            ResolvedConfiguration {
                settings,
                issuers: by_name,
            },
            &IssuerSnapshot::default(),
        )?;
        Ok(Self {
            current: ArcSwap::from_pointee(snapshot),
        })
    }

    pub fn snapshot(&self) -> Arc<IssuerSnapshot> {
        self.current.load_full()
    }

    fn replace(&self, snapshot: IssuerSnapshot) -> Arc<IssuerSnapshot> {
        let snapshot = Arc::new(snapshot);
        self.current.store(snapshot.clone());
        snapshot
    }
}

/// Owns the static and environment layers and republishes the issuer store
/// whenever the dynamic properties change.
pub struct ConfigurationManager {
    static_layer: PropertyLayer,
    env_layer: PropertyLayer,
    store: Arc<IssuerStore>,
    reconfiguring: Mutex<()>,
}

impl ConfigurationManager {
    pub fn new(static_layer: PropertyLayer, env_layer: PropertyLayer) -> Self {
        Self {
            static_layer,
            env_layer,
            store: Arc::new(IssuerStore::new()),
            reconfiguring: Mutex::new(()),
        }
    }

    /// Reads the optional static YAML file and the `VALIDATION__*` environment.
    pub fn from_sources(static_file: Option<&Path>) -> Result<Self, ConfigurationError> {
        let static_layer = match static_file {
            Some(path) => PropertyLayer::from_yaml_file(path)?,
            None => PropertyLayer::new(),
        };
        Ok(Self::new(static_layer, PropertyLayer::from_env()?))
    }

    pub fn store(&self) -> Arc<IssuerStore> {
        self.store.clone()
    }

    /// Resolves the layers against new dynamic properties and swaps in the
    /// result.
    ///
    /// On error nothing changes and the previous issuers stay active. Must be
    /// called within a tokio runtime.
    pub fn reconfigure<K, V>(
        &self,
        dynamic_properties: impl IntoIterator<Item = (K, V)>,
    ) -> Result<Arc<IssuerSnapshot>, ConfigurationError>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let dynamic_layer = PropertyLayer::from_properties(dynamic_properties)?;
        self.apply(&dynamic_layer)
    }

    pub fn apply(&self, dynamic_layer: &PropertyLayer) -> Result<Arc<IssuerSnapshot>, ConfigurationError> {
        let _guard = self
            .reconfiguring
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let resolved = resolve(&self.static_layer, &self.env_layer, dynamic_layer)?;
        let snapshot = IssuerSnapshot::build(resolved, &self.store.snapshot())?;
        info!(
            "Resolved {} issuer(s): {}",
            snapshot.len(),
            snapshot
                .iter()
                .map(|(name, issuer)| format!(
                    "{}{}",
                    name,
                    if issuer.config.enabled { "" } else { " (disabled)" }
                ))
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(self.store.replace(snapshot))
    }
}
