use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use log::debug;
use serde_yaml::Value as YamlValue;

use crate::{
    error::ConfigurationError,
    issuer::{is_valid_issuer_name, IssuerConfig, IssuerConfigBuilder, MatchPolicy},
    jwks::KeySourceRef,
    jwt_extract::TokenLocation,
};

pub const PREFIX: &str = "validation";
pub const ENV_PREFIX: &str = "VALIDATION__";

pub const KEY_TOKEN_LOCATION: &str = "validation.token.location";
pub const KEY_TOKEN_HEADER: &str = "validation.token.header";
pub const KEY_BEARER_PREFIX: &str = "validation.bearer.prefix";
pub const KEY_MAX_TOKEN_SIZE: &str = "validation.max.token.size";
pub const KEY_REFRESH_INTERVAL: &str = "validation.jwks.refresh.interval";
pub const KEY_JWKS_TIMEOUT: &str = "validation.jwks.timeout";

// First segments of global keys; these can't be used as issuer names.
const RESERVED_NAMES: [&str; 4] = ["token", "bearer", "max", "jwks"];

/// Global (non-issuer) settings of one layer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GlobalProperties {
    pub token_location: Option<TokenLocation>,
    pub token_header: Option<String>,
    pub bearer_prefix: Option<String>,
    pub max_token_size: Option<usize>,
    pub refresh_interval: Option<Duration>,
    pub jwks_timeout: Option<Duration>,
}

/// The fields of one issuer as given by one layer; absent fields fall through
/// to lower layers.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IssuerProperties {
    pub key_source: Option<KeySourceProperty>,
    pub identifier: Option<String>,
    pub audience: Option<String>,
    pub scopes: Option<BTreeSet<String>>,
    pub roles: Option<BTreeSet<String>>,
    pub enabled: Option<bool>,
    pub refresh_interval: Option<Duration>,
    pub scopes_claim: Option<String>,
    pub roles_claim: Option<String>,
    pub match_policy: Option<MatchPolicy>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum KeySourceProperty {
    Url(String),
    File(PathBuf),
    Content(String),
}

impl KeySourceProperty {
    fn field(&self) -> &'static str {
        match self {
            KeySourceProperty::Url(_) => "jwks-url",
            KeySourceProperty::File(_) => "jwks-file",
            KeySourceProperty::Content(_) => "jwks-content",
        }
    }
}

/// One configuration layer, parsed from the flat
/// `validation.<issuer>.<field>` key space into typed groups.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PropertyLayer {
    pub globals: GlobalProperties,
    pub issuers: BTreeMap<String, IssuerProperties>,
}

impl PropertyLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a flat key/value map.
    ///
    /// Keys outside the `validation.` prefix are ignored and blank values are
    /// treated as unset. Unknown keys inside the prefix are rejected.
    pub fn from_properties<K, V>(
        properties: impl IntoIterator<Item = (K, V)>,
    ) -> Result<Self, ConfigurationError>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut properties = properties
            .into_iter()
            .map(|(k, v)| (k.as_ref().trim().to_owned(), v.as_ref().trim().to_owned()))
            .collect::<Vec<_>>();
        properties.sort();

        let mut layer = PropertyLayer::new();
        for (key, value) in properties {
            let Some(remainder) = key
                .strip_prefix(PREFIX)
                .and_then(|rest| rest.strip_prefix('.'))
            else {
                debug!("Ignoring property '{}' outside of '{}.'", key, PREFIX);
                continue;
            };
            if value.is_empty() {
                continue;
            }
            layer.set(&key, remainder, value)?;
        }
        Ok(layer)
    }

    /// Parses a YAML document.
    ///
    /// Nested mappings are flattened into dotted keys and sequences are joined
    /// with `,`, so `validation: { keycloak: { scopes: [a, b] } }` equals
    /// `validation.keycloak.scopes = a,b`.
    pub fn from_yaml(source: &str) -> Result<Self, ConfigurationError> {
        let document: YamlValue = serde_yaml::from_str(source)
            .map_err(|e| ConfigurationError::StaticFile(e.to_string()))?;
        let mut flat = Vec::new();
        match document {
            YamlValue::Null => {}
            YamlValue::Mapping(_) => flatten("", &document, &mut flat)?,
            _ => {
                return Err(ConfigurationError::StaticFile(
                    "top level must be a mapping".to_owned(),
                ))
            }
        }
        Self::from_properties(flat)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| ConfigurationError::StaticFile(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml(&source)
    }

    /// Parses environment variables.
    ///
    /// Only `VALIDATION__*` variables are considered. Names are lower-cased,
    /// `__` separates segments and `_` stands for `-`:
    /// `VALIDATION__KEYCLOAK__JWKS_URL` is `validation.keycloak.jwks-url`.
    /// See [`PropertyLayer::with_issuer_names_from`] for mixed-case issuer names.
    pub fn from_env_vars(
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Self, ConfigurationError> {
        let properties = vars
            .into_iter()
            .filter(|(name, _)| name.starts_with(ENV_PREFIX))
            .map(|(name, value)| {
                let key = name
                    .to_ascii_lowercase()
                    .split("__")
                    .map(|segment| segment.replace('_', "-"))
                    .collect::<Vec<_>>()
                    .join(".");
                (key, value)
            })
            .collect::<Vec<_>>();
        Self::from_properties(properties)
    }

    pub fn from_env() -> Result<Self, ConfigurationError> {
        Self::from_env_vars(std::env::vars())
    }

    /// Renames issuers to the spelling used by the first of `others` that
    /// names them, ignoring case.
    ///
    /// Environment variable names cannot carry the case of an issuer name, so
    /// `VALIDATION__ISSUER_A__AUDIENCE` addresses `issuer-A` once the
    /// environment layer has been aligned with the other layers.
    pub fn with_issuer_names_from(self, others: &[&PropertyLayer]) -> PropertyLayer {
        let issuers = self
            .issuers
            .into_iter()
            .map(|(name, properties)| {
                let spelled = others
                    .iter()
                    .flat_map(|layer| layer.issuers.keys())
                    .find(|other| other.eq_ignore_ascii_case(&name))
                    .cloned()
                    .unwrap_or(name);
                (spelled, properties)
            })
            .collect();
        PropertyLayer {
            globals: self.globals,
            issuers,
        }
    }

    /// Combines two layers field by field; values of `self` win.
    pub fn overlay(self, lower: PropertyLayer) -> PropertyLayer {
        let globals = GlobalProperties {
            token_location: self.globals.token_location.or(lower.globals.token_location),
            token_header: self.globals.token_header.or(lower.globals.token_header),
            bearer_prefix: self.globals.bearer_prefix.or(lower.globals.bearer_prefix),
            max_token_size: self.globals.max_token_size.or(lower.globals.max_token_size),
            refresh_interval: self
                .globals
                .refresh_interval
                .or(lower.globals.refresh_interval),
            jwks_timeout: self.globals.jwks_timeout.or(lower.globals.jwks_timeout),
        };
        let mut issuers = lower.issuers;
        for (name, upper) in self.issuers {
            let merged = match issuers.remove(&name) {
                Some(lower) => upper.overlay(lower),
                None => upper,
            };
            issuers.insert(name, merged);
        }
        PropertyLayer { globals, issuers }
    }

    fn set(&mut self, key: &str, remainder: &str, value: String) -> Result<(), ConfigurationError> {
        let globals = &mut self.globals;
        match key {
            KEY_TOKEN_LOCATION => globals.token_location = Some(parse(key, &value)?),
            KEY_TOKEN_HEADER => globals.token_header = Some(value),
            KEY_BEARER_PREFIX => globals.bearer_prefix = Some(value),
            KEY_MAX_TOKEN_SIZE => globals.max_token_size = Some(positive(key, &value)?),
            KEY_REFRESH_INTERVAL => globals.refresh_interval = Some(seconds(key, &value)?),
            KEY_JWKS_TIMEOUT => globals.jwks_timeout = Some(seconds(key, &value)?),
            _ => {
                let (name, field) = remainder
                    .split_once('.')
                    .ok_or_else(|| ConfigurationError::UnknownProperty(key.to_owned()))?;
                if RESERVED_NAMES.contains(&name) || field.contains('.') {
                    return Err(ConfigurationError::UnknownProperty(key.to_owned()));
                }
                if !is_valid_issuer_name(name) {
                    return Err(ConfigurationError::InvalidIssuerName(name.to_owned()));
                }
                self.issuers
                    .entry(name.to_owned())
                    .or_default()
                    .set(key, field, value)?;
            }
        }
        Ok(())
    }
}

impl IssuerProperties {
    fn set(&mut self, key: &str, field: &str, value: String) -> Result<(), ConfigurationError> {
        match field {
            "jwks-url" => self.set_key_source(key, KeySourceProperty::Url(value))?,
            "jwks-file" => self.set_key_source(key, KeySourceProperty::File(PathBuf::from(value)))?,
            "jwks-content" => self.set_key_source(key, KeySourceProperty::Content(value))?,
            "issuer" => self.identifier = Some(value),
            "audience" => self.audience = Some(value),
            "scopes" => self.scopes = Some(list(&value)),
            "roles" => self.roles = Some(list(&value)),
            "enabled" => self.enabled = Some(boolean(key, &value)?),
            "refresh-interval" => self.refresh_interval = Some(seconds(key, &value)?),
            "scopes-claim" => self.scopes_claim = Some(value),
            "roles-claim" => self.roles_claim = Some(value),
            "match-policy" => self.match_policy = Some(parse(key, &value)?),
            _ => return Err(ConfigurationError::UnknownProperty(key.to_owned())),
        }
        Ok(())
    }

    fn set_key_source(
        &mut self,
        key: &str,
        key_source: KeySourceProperty,
    ) -> Result<(), ConfigurationError> {
        if let Some(existing) = &self.key_source {
            let issuer = key
                .split('.')
                .nth(1)
                .unwrap_or(key)
                .to_owned();
            return Err(ConfigurationError::ConflictingKeySource {
                issuer,
                keys: vec![existing.field().to_owned(), key_source.field().to_owned()],
            });
        }
        self.key_source = Some(key_source);
        Ok(())
    }

    fn overlay(self, lower: IssuerProperties) -> IssuerProperties {
        IssuerProperties {
            // The locator is a single field: one layer names the whole key source.
            key_source: self.key_source.or(lower.key_source),
            identifier: self.identifier.or(lower.identifier),
            audience: self.audience.or(lower.audience),
            scopes: self.scopes.or(lower.scopes),
            roles: self.roles.or(lower.roles),
            enabled: self.enabled.or(lower.enabled),
            refresh_interval: self.refresh_interval.or(lower.refresh_interval),
            scopes_claim: self.scopes_claim.or(lower.scopes_claim),
            roles_claim: self.roles_claim.or(lower.roles_claim),
            match_policy: self.match_policy.or(lower.match_policy),
        }
    }

    /// Turns the merged fields into an [IssuerConfig].
    pub fn into_config(
        self,
        name: &str,
        default_refresh_interval: Duration,
    ) -> Result<IssuerConfig, ConfigurationError> {
        let mut builder: IssuerConfigBuilder = IssuerConfig::builder(name);
        builder = match self.key_source {
            Some(KeySourceProperty::Url(url)) => builder.jwks_url(url),
            Some(KeySourceProperty::File(path)) => builder.key_source(KeySourceRef::File(path)),
            Some(KeySourceProperty::Content(content)) => builder.jwks_content(content),
            None => return Err(ConfigurationError::MissingKeySource(name.to_owned())),
        };
        if let Some(identifier) = self.identifier {
            builder = builder.identifier(identifier);
        }
        if let Some(audience) = self.audience {
            builder = builder.audience(audience);
        }
        if let Some(scopes) = self.scopes {
            builder = builder.scopes(&scopes.into_iter().collect::<Vec<_>>());
        }
        if let Some(roles) = self.roles {
            builder = builder.roles(&roles.into_iter().collect::<Vec<_>>());
        }
        if let Some(scopes_claim) = self.scopes_claim {
            builder = builder.scopes_claim(scopes_claim);
        }
        if let Some(roles_claim) = self.roles_claim {
            builder = builder.roles_claim(roles_claim);
        }
        builder
            .enabled(self.enabled.unwrap_or(true))
            .match_policy(self.match_policy.unwrap_or_default())
            .refresh_interval(self.refresh_interval.unwrap_or(default_refresh_interval))
            .build()
    }
}

fn flatten(
    prefix: &str,
    value: &YamlValue,
    out: &mut Vec<(String, String)>,
) -> Result<(), ConfigurationError> {
    match value {
        YamlValue::Mapping(mapping) => {
            for (key, value) in mapping {
                let key = yaml_scalar(key).ok_or_else(|| {
                    ConfigurationError::StaticFile(format!(
                        "non-scalar key below '{}'",
                        prefix
                    ))
                })?;
                let key = if prefix.is_empty() {
                    key
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten(&key, value, out)?;
            }
        }
        YamlValue::Sequence(items) => {
            let items = items
                .iter()
                .map(|item| {
                    yaml_scalar(item).ok_or_else(|| {
                        ConfigurationError::StaticFile(format!(
                            "'{}' must be a list of scalars",
                            prefix
                        ))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            out.push((prefix.to_owned(), items.join(",")));
        }
        YamlValue::Null => {}
        YamlValue::Tagged(tagged) => flatten(prefix, &tagged.value, out)?,
        scalar => {
            if let Some(s) = yaml_scalar(scalar) {
                out.push((prefix.to_owned(), s));
            }
        }
    }
    Ok(())
}

fn yaml_scalar(value: &YamlValue) -> Option<String> {
    match value {
        YamlValue::String(s) => Some(s.clone()),
        YamlValue::Number(n) => Some(n.to_string()),
        YamlValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn parse<T: FromStr<Err = String>>(key: &str, value: &str) -> Result<T, ConfigurationError> {
    value.parse().map_err(|reason| ConfigurationError::InvalidValue {
        key: key.to_owned(),
        reason,
    })
}

fn boolean(key: &str, value: &str) -> Result<bool, ConfigurationError> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(ConfigurationError::InvalidValue {
            key: key.to_owned(),
            reason: format!("expected true or false, got '{}'", value),
        }),
    }
}

fn positive(key: &str, value: &str) -> Result<usize, ConfigurationError> {
    match value.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigurationError::InvalidValue {
            key: key.to_owned(),
            reason: format!("expected a positive integer, got '{}'", value),
        }),
    }
}

fn seconds(key: &str, value: &str) -> Result<Duration, ConfigurationError> {
    positive(key, value).map(|n| Duration::from_secs(n as u64))
}

fn list(value: &str) -> BTreeSet<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
        .collect()
}
