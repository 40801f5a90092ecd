use jsonwebtoken::EncodingKey;
use serde::Deserialize;
use serde_json::{json, Value};

pub const DEFAULT_KID: &str = "default-kid";

#[derive(Deserialize)]
struct StoredPair {
    private_key: String,
    modulus: String,
    exponent: String,
}

/// An RS256 key pair from `key-pairs.json`, published under `kid`.
#[derive(Clone, Debug)]
pub struct SigningKey {
    pub kid: String,
    pem: String,
    n: String,
    e: String,
}

impl SigningKey {
    /// Signs every token unless a builder is told otherwise.
    pub fn primary() -> Self {
        Self::stored(0)
    }

    /// Never published by the issuers the tests configure.
    pub fn secondary() -> Self {
        Self::stored(1)
    }

    fn stored(index: usize) -> Self {
        let pairs: Vec<StoredPair> = serde_json::from_str(include_str!("key-pairs.json"))
            .expect("Failed to read key-pairs.json");
        let pair = &pairs[index];
        SigningKey {
            kid: DEFAULT_KID.to_owned(),
            pem: pair.private_key.clone(),
            n: pair.modulus.clone(),
            e: pair.exponent.clone(),
        }
    }

    pub fn with_kid(mut self, kid: &str) -> Self {
        self.kid = kid.to_owned();
        self
    }

    pub fn encoding_key(&self) -> EncodingKey {
        EncodingKey::from_rsa_pem(self.pem.as_bytes()).expect("Invalid private key")
    }

    pub fn jwk(&self) -> Value {
        json!({
            "kty": "RSA",
            "use": "sig",
            "alg": "RS256",
            "kid": self.kid,
            "n": self.n,
            "e": self.e,
        })
    }
}

/// A JWK set document with the public half of each key.
pub fn jwk_set(keys: &[&SigningKey]) -> String {
    json!({ "keys": keys.iter().map(|key| key.jwk()).collect::<Vec<_>>() }).to_string()
}
