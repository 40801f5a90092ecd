use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};

/// Flat, string-keyed attributes derived from a validated token.
pub type AttributeMap = BTreeMap<String, String>;

pub const ATTR_AUTHORIZED: &str = "jwt.authorized";
pub const ATTR_SUBJECT: &str = "jwt.subject";
pub const ATTR_ISSUER: &str = "jwt.issuer";
pub const ATTR_ISSUER_NAME: &str = "jwt.issuer.name";
pub const ATTR_AUDIENCE: &str = "jwt.audience";
pub const ATTR_EXPIRES_AT: &str = "jwt.expires-at";
pub const ATTR_SCOPES: &str = "jwt.scopes";
pub const ATTR_ROLES: &str = "jwt.roles";

/// Converts verified claims into an [AttributeMap].
///
/// Naming scheme:
///
/// | attribute         | source                                            |
/// |-------------------|---------------------------------------------------|
/// | `jwt.subject`     | `sub`                                             |
/// | `jwt.issuer`      | `iss`                                             |
/// | `jwt.issuer.name` | name of the configured issuer that matched        |
/// | `jwt.audience`    | `aud`, comma separated when several               |
/// | `jwt.expires-at`  | `exp`, seconds since the epoch                    |
/// | `jwt.scopes`      | scopes claim path, else `scope` / `scp`, sorted   |
/// | `jwt.roles`       | roles claim path, else `roles`, sorted            |
///
/// Missing claims produce absent attributes. Lists are comma separated.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClaimMapper {
    scopes_claim: Option<String>,
    roles_claim: Option<String>,
}

impl ClaimMapper {
    pub fn new(scopes_claim: Option<String>, roles_claim: Option<String>) -> Self {
        Self {
            scopes_claim,
            roles_claim,
        }
    }

    pub fn map(&self, claims: &Map<String, Value>, issuer_name: &str) -> AttributeMap {
        let mut attributes = AttributeMap::new();
        attributes.insert(ATTR_ISSUER_NAME.to_owned(), issuer_name.to_owned());
        if let Some(sub) = claims.get("sub").and_then(scalar) {
            attributes.insert(ATTR_SUBJECT.to_owned(), sub);
        }
        if let Some(iss) = claims.get("iss").and_then(scalar) {
            attributes.insert(ATTR_ISSUER.to_owned(), iss);
        }
        if let Some(aud) = claims.get("aud") {
            let audiences = values(aud, false);
            if !audiences.is_empty() {
                attributes.insert(ATTR_AUDIENCE.to_owned(), audiences.join(","));
            }
        }
        if let Some(exp) = claims.get("exp").and_then(Value::as_i64) {
            attributes.insert(ATTR_EXPIRES_AT.to_owned(), exp.to_string());
        }
        let scopes = self.scopes(claims);
        if !scopes.is_empty() {
            attributes.insert(ATTR_SCOPES.to_owned(), join(&scopes));
        }
        let roles = self.roles(claims);
        if !roles.is_empty() {
            attributes.insert(ATTR_ROLES.to_owned(), join(&roles));
        }
        attributes
    }

    pub fn scopes(&self, claims: &Map<String, Value>) -> BTreeSet<String> {
        let value = match &self.scopes_claim {
            Some(path) => lookup(claims, path),
            None => claims.get("scope").or_else(|| claims.get("scp")),
        };
        value
            .map(|v| values(v, true).into_iter().collect())
            .unwrap_or_default()
    }

    pub fn roles(&self, claims: &Map<String, Value>) -> BTreeSet<String> {
        let value = match &self.roles_claim {
            Some(path) => lookup(claims, path),
            None => claims.get("roles"),
        };
        value
            .map(|v| values(v, true).into_iter().collect())
            .unwrap_or_default()
    }
}

/// Follows a dotted path such as `realm_access.roles` through nested objects.
fn lookup<'a>(claims: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = claims.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

// A string claim is split on whitespace when it is a space separated list (`scope`).
fn values(value: &Value, split_whitespace: bool) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().filter_map(scalar).collect(),
        Value::String(s) if split_whitespace => {
            s.split_whitespace().map(|part| part.to_owned()).collect()
        }
        other => scalar(other).into_iter().collect(),
    }
}

fn join(set: &BTreeSet<String>) -> String {
    set.iter().cloned().collect::<Vec<_>>().join(",")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn claims(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn single_aud() {
        let attributes = ClaimMapper::default().map(&claims(json!({ "aud": "single" })), "a");
        assert_eq!(attributes.get(ATTR_AUDIENCE).unwrap(), "single");
    }

    #[test]
    fn multiple_aud() {
        let attributes = ClaimMapper::default()
            .map(&claims(json!({ "aud": ["first", "second"] })), "a");
        assert_eq!(attributes.get(ATTR_AUDIENCE).unwrap(), "first,second");
    }

    #[test]
    fn standard_claims() {
        let attributes = ClaimMapper::default().map(
            &claims(json!({
                "sub": "u1",
                "iss": "issuer-A",
                "exp": 1700000000,
                "scope": "write read",
            })),
            "issuer-A",
        );
        assert_eq!(attributes.get(ATTR_SUBJECT).unwrap(), "u1");
        assert_eq!(attributes.get(ATTR_ISSUER).unwrap(), "issuer-A");
        assert_eq!(attributes.get(ATTR_ISSUER_NAME).unwrap(), "issuer-A");
        assert_eq!(attributes.get(ATTR_EXPIRES_AT).unwrap(), "1700000000");
        assert_eq!(attributes.get(ATTR_SCOPES).unwrap(), "read,write");
    }

    #[test]
    fn missing_claims_are_absent() {
        let attributes = ClaimMapper::default().map(&Map::new(), "a");
        assert_eq!(attributes.len(), 1);
        assert!(attributes.get(ATTR_SUBJECT).is_none());
        assert!(attributes.get(ATTR_ROLES).is_none());
    }

    #[test]
    fn nested_role_claim() {
        let mapper = ClaimMapper::new(None, Some("realm_access.roles".to_owned()));
        let claims = claims(json!({ "realm_access": { "roles": ["admin", "user"] } }));

        assert_eq!(
            mapper.roles(&claims),
            BTreeSet::from(["admin".to_owned(), "user".to_owned()])
        );
        assert_eq!(mapper.map(&claims, "a").get(ATTR_ROLES).unwrap(), "admin,user");
    }

    #[test]
    fn scp_array_claim() {
        let scopes = ClaimMapper::default().scopes(&claims(json!({ "scp": ["a", "b"] })));
        assert_eq!(scopes, BTreeSet::from(["a".to_owned(), "b".to_owned()]));
    }

    #[test]
    fn wrongly_typed_claims_do_not_fail() {
        let attributes = ClaimMapper::new(Some("scope.nested".to_owned()), None)
            .map(&claims(json!({ "sub": {"x": 1}, "exp": "soon", "scope": "a" })), "a");
        assert!(attributes.get(ATTR_SUBJECT).is_none());
        assert!(attributes.get(ATTR_EXPIRES_AT).is_none());
        assert!(attributes.get(ATTR_SCOPES).is_none());
    }
}
