use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde_json::{Map, Value};

/// A JWT whose header and claims have been decoded but not verified.
///
/// Only used to pick the issuer (and key) a token claims to come from.
#[derive(Debug, Clone)]
pub struct UnverifiedJwt {
    token: String,
    header: Map<String, Value>,
    claims: Map<String, Value>,
}

impl UnverifiedJwt {
    /// Decodes the header and payload segments.
    ///
    /// Fails with a human readable reason when the token is not three
    /// dot-separated base64url segments whose first two are JSON objects.
    pub fn parse(raw_token: impl Into<String>) -> Result<Self, String> {
        let token = raw_token.into();
        let segments = token.split('.').collect::<Vec<_>>();
        if segments.len() != 3 {
            return Err(format!(
                "expected 3 dot-separated segments, found {}",
                segments.len()
            ));
        }
        let header = decode_segment(segments[0], "header")?;
        let claims = decode_segment(segments[1], "payload")?;
        Ok(Self {
            token,
            header,
            claims,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.token
    }

    pub fn header(&self) -> &Map<String, Value> {
        &self.header
    }

    pub fn claims(&self) -> &Map<String, Value> {
        &self.claims
    }

    pub fn issuer(&self) -> Option<&str> {
        self.claims.get("iss")?.as_str()
    }

    pub fn key_id(&self) -> Option<&str> {
        self.header.get("kid")?.as_str()
    }
}

fn decode_segment(segment: &str, name: &str) -> Result<Map<String, Value>, String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|e| format!("{} is not valid base64url: {}", name, e))?;
    match serde_json::from_slice(&bytes) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(format!("{} is not a JSON object", name)),
        Err(e) => Err(format!("{} is not valid JSON: {}", name, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(value: &str) -> String {
        URL_SAFE_NO_PAD.encode(value)
    }

    #[test]
    fn parse_ok() {
        let token = format!(
            "{}.{}.sig",
            segment(r#"{"alg":"RS256","kid":"k1"}"#),
            segment(r#"{"iss":"issuer-A","sub":"u1"}"#)
        );
        let jwt = UnverifiedJwt::parse(token).unwrap();

        assert_eq!(jwt.issuer(), Some("issuer-A"));
        assert_eq!(jwt.key_id(), Some("k1"));
        assert_eq!(jwt.claims().get("sub").unwrap(), "u1");
    }

    #[test]
    fn wrong_segment_count() {
        assert!(UnverifiedJwt::parse("NotAJWT").is_err());
        assert!(UnverifiedJwt::parse("a.b").is_err());
        assert!(UnverifiedJwt::parse("a.b.c.d").is_err());
    }

    #[test]
    fn invalid_base64() {
        let token = format!("{}.!!!.sig", segment(r#"{"alg":"RS256"}"#));
        assert!(UnverifiedJwt::parse(token).unwrap_err().contains("payload"));
    }

    #[test]
    fn payload_must_be_object() {
        let token = format!("{}.{}.sig", segment(r#"{"alg":"RS256"}"#), segment("[1,2]"));
        assert!(UnverifiedJwt::parse(token).is_err());
    }

    #[test]
    fn missing_issuer() {
        let token = format!("{}.{}.sig", segment(r#"{"alg":"RS256"}"#), segment("{}"));
        assert_eq!(UnverifiedJwt::parse(token).unwrap().issuer(), None);
    }
}
