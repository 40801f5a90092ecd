use std::{collections::BTreeSet, fmt::Display, path::Path};

use http::Method;
use serde::Deserialize;
use url::Url;

use crate::{error::RouteConfigError, validation::Requirements};

/// Paths below this prefix are served by the gateway itself.
pub const MANAGEMENT_PREFIX: &str = "/_gateway/";
pub const HEALTH_PATH: &str = "/_gateway/health";
pub const METRICS_PATH: &str = "/_gateway/metrics";

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Literal(String),
    /// `*`, exactly one segment.
    Single,
    /// Trailing `**`, any remainder including none.
    Rest,
}

/// A `/`-separated path pattern with `*` and trailing `**` wildcards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl PathPattern {
    pub fn parse(raw: &str) -> Result<Self, String> {
        if !raw.starts_with('/') {
            return Err(format!("path '{}' must start with '/'", raw));
        }
        let parts = split_path(raw);
        let mut segments = Vec::with_capacity(parts.len());
        for (index, part) in parts.iter().enumerate() {
            let segment = match *part {
                "**" if index + 1 == parts.len() => Segment::Rest,
                "**" => return Err("'**' is only allowed as the last segment".to_owned()),
                "*" => Segment::Single,
                literal if literal.contains('*') => {
                    return Err(format!("unsupported wildcard in segment '{}'", literal))
                }
                literal => Segment::Literal(literal.to_owned()),
            };
            segments.push(segment);
        }
        Ok(Self {
            raw: raw.to_owned(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Returns the part of `path` matched by a trailing `**` (empty when the
    /// pattern has none), or `None` when the path does not match.
    ///
    /// Paths with dot segments or encoded separators never match.
    pub fn matches(&self, path: &str) -> Option<String> {
        let parts = split_path(path);
        if parts.iter().any(|part| is_unsafe_segment(part)) {
            return None;
        }
        for (index, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Rest => return Some(parts[index.min(parts.len())..].join("/")),
                Segment::Single => {
                    parts.get(index)?;
                }
                Segment::Literal(literal) => {
                    if parts.get(index) != Some(&literal.as_str()) {
                        return None;
                    }
                }
            }
        }
        (parts.len() == self.segments.len()).then(String::new)
    }
}

impl Display for PathPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|part| !part.is_empty()).collect()
}

/// `.` and `..` in any spelling `Url` resolves, and segments that an upstream
/// could split further.
fn is_unsafe_segment(segment: &str) -> bool {
    let lower = segment.to_ascii_lowercase();
    matches!(lower.replace("%2e", ".").as_str(), "." | "..")
        || lower.contains('\\')
        || lower.contains("%2f")
        || lower.contains("%5c")
}

/// One gateway route. A route without target is a management route.
#[derive(Clone, Debug, PartialEq)]
pub struct RouteConfig {
    pub path_pattern: PathPattern,
    pub method: Method,
    pub target: Option<Url>,
    pub require_auth: bool,
    /// Name of the only issuer whose tokens are accepted.
    pub required_issuer: Option<String>,
    pub required_scopes: BTreeSet<String>,
    pub required_roles: BTreeSet<String>,
}

impl RouteConfig {
    pub fn requirements(&self) -> Requirements {
        Requirements {
            required_issuer: self.required_issuer.clone(),
            required_scopes: self.required_scopes.clone(),
            required_roles: self.required_roles.clone(),
        }
    }

    pub fn is_management(&self) -> bool {
        self.target.is_none()
    }

    /// The upstream URL for a request matched by this route.
    ///
    /// `None` for management routes and for remainders that would leave the
    /// target path.
    pub fn target_url(&self, remainder: &str, query: Option<&str>) -> Option<Url> {
        let mut url = self.target.clone()?;
        if !remainder.is_empty() {
            let base = url.path().trim_end_matches('/').to_owned();
            url.set_path(&format!("{}/{}", base, remainder));
            if !url.path().starts_with(&format!("{}/", base)) {
                return None;
            }
        }
        url.set_query(query.filter(|q| !q.is_empty()));
        Some(url)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RouteFile {
    routes: Vec<RouteEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RouteEntry {
    path: String,
    method: String,
    target: Option<String>,
    #[serde(default = "default_require_auth")]
    require_auth: bool,
    required_issuer: Option<String>,
    #[serde(default)]
    required_scopes: Vec<String>,
    #[serde(default)]
    required_roles: Vec<String>,
}

fn default_require_auth() -> bool {
    true
}

/// A matched route and the path remainder captured by `**`.
#[derive(Debug)]
pub struct RouteMatch<'a> {
    pub route: &'a RouteConfig,
    pub remainder: String,
}

/// Ordered, immutable list of routes; the first matching route wins.
///
/// ```yaml
/// routes:
///   - path: /api/orders/**
///     method: GET
///     target: http://orders.internal:8080/orders
///     required-issuer: keycloak
///     required-scopes: [orders.read]
///   - path: /_gateway/health
///     method: GET
///     require-auth: false
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RouteTable {
    routes: Vec<RouteConfig>,
}

impl RouteTable {
    pub fn new(routes: Vec<RouteConfig>) -> Result<Self, RouteConfigError> {
        let mut seen = BTreeSet::new();
        for route in &routes {
            let key = (route.method.to_string(), route.path_pattern.as_str().to_owned());
            if !seen.insert(key) {
                return Err(RouteConfigError::DuplicateRoute {
                    entry: format!("{} {}", route.method, route.path_pattern),
                });
            }
        }
        Ok(Self { routes })
    }

    pub fn parse(source: &str) -> Result<Self, RouteConfigError> {
        let file: RouteFile =
            serde_yaml::from_str(source).map_err(|e| RouteConfigError::Parse(e.to_string()))?;
        let routes = file
            .routes
            .into_iter()
            .enumerate()
            .map(|(index, entry)| entry.into_route(index))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(routes)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RouteConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| RouteConfigError::Parse(format!("{}: {}", path.display(), e)))?;
        Self::parse(&source)
    }

    pub fn find(&self, method: &Method, path: &str) -> Option<RouteMatch<'_>> {
        self.routes
            .iter()
            .filter(|route| route.method == *method)
            .find_map(|route| {
                route
                    .path_pattern
                    .matches(path)
                    .map(|remainder| RouteMatch { route, remainder })
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = &RouteConfig> {
        self.routes.iter()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl RouteEntry {
    fn into_route(self, index: usize) -> Result<RouteConfig, RouteConfigError> {
        let entry = format!("#{} {} {}", index + 1, self.method, self.path);
        let invalid = |reason: String| RouteConfigError::InvalidEntry {
            entry: entry.clone(),
            reason,
        };

        let method = Method::from_bytes(self.method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| invalid(format!("invalid method '{}'", self.method)))?;
        let path_pattern = PathPattern::parse(self.path.trim()).map_err(invalid)?;

        let management = path_pattern.as_str().starts_with(MANAGEMENT_PREFIX);
        let target = match (&self.target, management) {
            (Some(_), true) => {
                return Err(invalid("management routes have no target".to_owned()))
            }
            (None, true) => {
                if ![HEALTH_PATH, METRICS_PATH].contains(&path_pattern.as_str()) {
                    return Err(invalid(format!(
                        "unknown management path '{}'",
                        path_pattern
                    )));
                }
                None
            }
            (None, false) => return Err(invalid("missing target".to_owned())),
            (Some(target), false) => Some(parse_target(target).ok_or_else(|| {
                RouteConfigError::InvalidTarget {
                    entry: entry.clone(),
                    target: target.clone(),
                }
            })?),
        };

        Ok(RouteConfig {
            path_pattern,
            method,
            target,
            require_auth: self.require_auth,
            required_issuer: self.required_issuer.filter(|i| !i.trim().is_empty()),
            required_scopes: self.required_scopes.into_iter().collect(),
            required_roles: self.required_roles.into_iter().collect(),
        })
    }
}

fn parse_target(target: &str) -> Option<Url> {
    let url = Url::parse(target.trim()).ok()?;
    let supported = matches!(url.scheme(), "http" | "https") && url.host().is_some();
    supported.then_some(url)
}
