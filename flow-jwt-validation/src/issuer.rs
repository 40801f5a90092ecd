use std::{collections::BTreeSet, path::PathBuf, str::FromStr, time::Duration};

use url::Url;

use crate::{claims::ClaimMapper, error::ConfigurationError, jwks::KeySourceRef};

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// How configured scopes (or roles) are compared with those of a token.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MatchPolicy {
    /// Every required value must be present.
    #[default]
    All,
    /// At least one required value must be present.
    Any,
}

impl MatchPolicy {
    pub fn is_satisfied(&self, required: &BTreeSet<String>, present: &BTreeSet<String>) -> bool {
        if required.is_empty() {
            return true;
        }
        match self {
            MatchPolicy::All => required.is_subset(present),
            MatchPolicy::Any => !required.is_disjoint(present),
        }
    }
}

impl FromStr for MatchPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(MatchPolicy::All),
            "any" => Ok(MatchPolicy::Any),
            other => Err(format!("expected 'all' or 'any', got '{}'", other)),
        }
    }
}

/// Resolved, immutable configuration of one trusted issuer.
#[derive(Clone, Debug, PartialEq)]
pub struct IssuerConfig {
    pub name: String,
    /// Expected value of the `iss` claim.
    pub identifier: String,
    pub key_source: KeySourceRef,
    pub expected_audience: Option<String>,
    pub expected_scopes: BTreeSet<String>,
    pub expected_roles: BTreeSet<String>,
    pub match_policy: MatchPolicy,
    pub enabled: bool,
    pub refresh_interval: Duration,
    pub claim_mapper: ClaimMapper,
}

impl IssuerConfig {
    pub fn builder(name: impl Into<String>) -> IssuerConfigBuilder {
        IssuerConfigBuilder::new(name.into())
    }
}

pub struct IssuerConfigBuilder {
    name: String,
    identifier: Option<String>,
    jwks_url: Option<String>,
    jwks_file: Option<PathBuf>,
    jwks_content: Option<String>,
    audience: Option<String>,
    scopes: BTreeSet<String>,
    roles: BTreeSet<String>,
    match_policy: MatchPolicy,
    enabled: bool,
    refresh_interval: Option<Duration>,
    scopes_claim: Option<String>,
    roles_claim: Option<String>,
}

impl IssuerConfigBuilder {
    fn new(name: String) -> Self {
        IssuerConfigBuilder {
            name,
            identifier: None,
            jwks_url: None,
            jwks_file: None,
            jwks_content: None,
            audience: None,
            scopes: BTreeSet::new(),
            roles: BTreeSet::new(),
            match_policy: MatchPolicy::default(),
            enabled: true,
            refresh_interval: None,
            scopes_claim: None,
            roles_claim: None,
        }
    }

    /// Set the expected `iss` claim.
    ///
    /// Defaults to the issuer name.
    pub fn identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    /// Fetch keys from a JWKS endpoint.
    pub fn jwks_url(mut self, jwks_url: impl Into<String>) -> Self {
        self.jwks_url = Some(jwks_url.into());
        self
    }

    /// Read keys from a local JWKS file, re-read on every refresh.
    pub fn jwks_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.jwks_file = Some(path.into());
        self
    }

    /// Use an inline JWKS document.
    pub fn jwks_content(mut self, content: impl Into<String>) -> Self {
        self.jwks_content = Some(content.into());
        self
    }

    pub fn key_source(mut self, key_source: KeySourceRef) -> Self {
        self.jwks_url = None;
        self.jwks_file = None;
        self.jwks_content = None;
        match key_source {
            KeySourceRef::Server(url) => self.jwks_url = Some(url.to_string()),
            KeySourceRef::File(path) => self.jwks_file = Some(path),
            KeySourceRef::Memory(content) => self.jwks_content = Some(content),
        }
        self
    }

    /// Set the expected audience, matched against `aud`.
    pub fn audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    pub fn scopes(mut self, scopes: &[impl ToString]) -> Self {
        self.scopes = scopes.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn roles(mut self, roles: &[impl ToString]) -> Self {
        self.roles = roles.iter().map(|r| r.to_string()).collect();
        self
    }

    pub fn match_policy(mut self, match_policy: MatchPolicy) -> Self {
        self.match_policy = match_policy;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the interval for re-reading the key source.
    ///
    /// Default value is `Duration::from_secs(60)`.
    pub fn refresh_interval(mut self, refresh_interval: Duration) -> Self {
        self.refresh_interval = Some(refresh_interval);
        self
    }

    /// Dotted path of the claim holding scopes, e.g. `authorization.scopes`.
    pub fn scopes_claim(mut self, path: impl Into<String>) -> Self {
        self.scopes_claim = Some(path.into());
        self
    }

    /// Dotted path of the claim holding roles, e.g. `realm_access.roles`.
    pub fn roles_claim(mut self, path: impl Into<String>) -> Self {
        self.roles_claim = Some(path.into());
        self
    }

    pub fn build(self) -> Result<IssuerConfig, ConfigurationError> {
        if !is_valid_issuer_name(&self.name) {
            return Err(ConfigurationError::InvalidIssuerName(self.name));
        }
        let mut locators = Vec::new();
        if self.jwks_url.is_some() {
            locators.push("jwks-url".to_owned());
        }
        if self.jwks_file.is_some() {
            locators.push("jwks-file".to_owned());
        }
        if self.jwks_content.is_some() {
            locators.push("jwks-content".to_owned());
        }
        if locators.len() > 1 {
            return Err(ConfigurationError::ConflictingKeySource {
                issuer: self.name,
                keys: locators,
            });
        }

        let key_source = if let Some(jwks_url) = &self.jwks_url {
            let url = Url::parse(jwks_url).map_err(|e| ConfigurationError::InvalidKeySource {
                issuer: self.name.clone(),
                reason: format!("invalid jwks-url '{}': {}", jwks_url, e),
            })?;
            if url.scheme() != "http" && url.scheme() != "https" {
                return Err(ConfigurationError::InvalidKeySource {
                    issuer: self.name.clone(),
                    reason: format!("jwks-url '{}' is not http(s)", jwks_url),
                });
            }
            KeySourceRef::Server(url)
        } else if let Some(path) = self.jwks_file {
            if path.as_os_str().is_empty() {
                return Err(ConfigurationError::InvalidKeySource {
                    issuer: self.name.clone(),
                    reason: "empty jwks-file path".to_owned(),
                });
            }
            KeySourceRef::File(path)
        } else if let Some(content) = self.jwks_content {
            KeySourceRef::Memory(content)
        } else {
            return Err(ConfigurationError::MissingKeySource(self.name));
        };

        let refresh_interval = self.refresh_interval.unwrap_or(DEFAULT_REFRESH_INTERVAL);
        if refresh_interval.is_zero() {
            return Err(ConfigurationError::InvalidValue {
                key: format!("{}.refresh-interval", self.name),
                reason: "must be greater than zero".to_owned(),
            });
        }

        Ok(IssuerConfig {
            identifier: self.identifier.unwrap_or_else(|| self.name.clone()),
            name: self.name,
            key_source,
            expected_audience: self.audience,
            expected_scopes: self.scopes,
            expected_roles: self.roles,
            match_policy: self.match_policy,
            enabled: self.enabled,
            refresh_interval,
            claim_mapper: ClaimMapper::new(self.scopes_claim, self.roles_claim),
        })
    }
}

pub(crate) fn is_valid_issuer_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
