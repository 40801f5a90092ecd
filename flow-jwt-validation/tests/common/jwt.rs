use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::{encode, Algorithm, Header};
use serde_json::{json, Map, Value};

use crate::common::keys::SigningKey;

/// Builds RS256 tokens; valid for an hour unless `exp` is set.
#[derive(Clone, Debug)]
pub struct JwtBuilder {
    key: SigningKey,
    claims: Map<String, Value>,
}

impl JwtBuilder {
    pub fn new() -> Self {
        JwtBuilder::default()
    }

    pub fn signed_with(mut self, key: SigningKey) -> Self {
        self.key = key;
        self
    }

    pub fn claim(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.claims.insert(name.to_owned(), value.into());
        self
    }

    pub fn iss(self, iss: &str) -> Self {
        self.claim("iss", iss)
    }

    pub fn subject(self, sub: &str) -> Self {
        self.claim("sub", sub)
    }

    pub fn aud(self, aud: &str) -> Self {
        self.claim("aud", aud)
    }

    pub fn nbf(self, nbf: u64) -> Self {
        self.claim("nbf", nbf)
    }

    pub fn exp(self, exp: u64) -> Self {
        self.claim("exp", exp)
    }

    /// Space separated.
    pub fn scope(self, scope: &str) -> Self {
        self.claim("scope", scope)
    }

    pub fn build(&self) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.key.kid.clone());
        encode(&header, &self.claims, &self.key.encoding_key()).unwrap()
    }
}

impl Default for JwtBuilder {
    fn default() -> Self {
        let mut claims = Map::new();
        claims.insert("exp".to_owned(), json!(seconds_from_now(60 * 60)));
        JwtBuilder {
            key: SigningKey::primary(),
            claims,
        }
    }
}

pub fn seconds_from_now(secs: i64) -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;
    (now + secs) as u64
}
