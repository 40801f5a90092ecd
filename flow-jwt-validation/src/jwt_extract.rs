use std::{collections::BTreeMap, fmt::Display, io, str::FromStr};

use http::HeaderMap;

use crate::outcome::{ErrorCategory, Rejection};

pub const DEFAULT_TOKEN_HEADER: &str = "Authorization";
pub const DEFAULT_BEARER_PREFIX: &str = "Bearer";

/// Where a unit of work carries its token.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TokenLocation {
    #[default]
    AuthorizationHeader,
    CustomHeader,
    FlowContent,
}

impl FromStr for TokenLocation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AUTHORIZATION_HEADER" => Ok(TokenLocation::AuthorizationHeader),
            "CUSTOM_HEADER" => Ok(TokenLocation::CustomHeader),
            "FLOW_CONTENT" => Ok(TokenLocation::FlowContent),
            other => Err(format!(
                "expected AUTHORIZATION_HEADER, CUSTOM_HEADER or FLOW_CONTENT, got '{}'",
                other
            )),
        }
    }
}

impl Display for TokenLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenLocation::AuthorizationHeader => f.write_str("AUTHORIZATION_HEADER"),
            TokenLocation::CustomHeader => f.write_str("CUSTOM_HEADER"),
            TokenLocation::FlowContent => f.write_str("FLOW_CONTENT"),
        }
    }
}

/// The view of an inbound record the extractor needs.
pub trait UnitOfWork {
    /// Header (or attribute) value, with the name matched case-insensitively.
    fn header(&self, name: &str) -> Option<&str>;

    /// Size of the payload in bytes, known without reading it.
    fn content_size(&self) -> u64;

    fn read_content(&self) -> io::Result<Vec<u8>>;
}

/// A record with string attributes and an in-memory payload.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Record {
    pub attributes: BTreeMap<String, String>,
    pub content: Vec<u8>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_content(mut self, content: impl Into<Vec<u8>>) -> Self {
        self.content = content.into();
        self
    }
}

impl UnitOfWork for Record {
    fn header(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    fn content_size(&self) -> u64 {
        self.content.len() as u64
    }

    fn read_content(&self) -> io::Result<Vec<u8>> {
        Ok(self.content.clone())
    }
}

impl UnitOfWork for HeaderMap {
    fn header(&self, name: &str) -> Option<&str> {
        self.get(name)?.to_str().ok()
    }

    fn content_size(&self) -> u64 {
        0
    }

    fn read_content(&self) -> io::Result<Vec<u8>> {
        Ok(Vec::new())
    }
}

/// Pulls the raw token out of a unit of work.
#[derive(Clone, Debug, PartialEq)]
pub struct TokenExtractor {
    location: TokenLocation,
    header_name: String,
    prefix: Option<String>,
    max_content_size: usize,
}

impl TokenExtractor {
    pub fn new(
        location: TokenLocation,
        header_name: impl Into<String>,
        prefix: Option<String>,
        max_content_size: usize,
    ) -> Self {
        Self {
            location,
            header_name: header_name.into(),
            prefix: prefix
                .map(|p| p.trim().to_owned())
                .filter(|p| !p.is_empty()),
            max_content_size,
        }
    }

    /// `Authorization: Bearer <token>`, the strategy used by the gateway.
    pub fn authorization_header() -> Self {
        Self::new(
            TokenLocation::AuthorizationHeader,
            DEFAULT_TOKEN_HEADER,
            Some(DEFAULT_BEARER_PREFIX.to_owned()),
            usize::MAX,
        )
    }

    pub fn location(&self) -> TokenLocation {
        self.location
    }

    /// Returns `Ok(None)` when the unit carries no token at all.
    ///
    /// Oversized payloads are rejected from their reported size, before
    /// anything is read.
    pub fn extract(&self, unit: &dyn UnitOfWork) -> Result<Option<String>, Rejection> {
        match self.location {
            TokenLocation::AuthorizationHeader | TokenLocation::CustomHeader => {
                let Some(value) = unit.header(&self.header_name) else {
                    return Ok(None);
                };
                self.strip_prefix(value)
            }
            TokenLocation::FlowContent => self.read_content(unit),
        }
    }

    fn strip_prefix(&self, value: &str) -> Result<Option<String>, Rejection> {
        let value = value.trim();
        let token = match &self.prefix {
            Some(prefix) => {
                let matches_prefix = value
                    .get(..prefix.len())
                    .is_some_and(|head| head.eq_ignore_ascii_case(prefix));
                let rest = &value[if matches_prefix { prefix.len() } else { 0 }..];
                if !matches_prefix || !(rest.is_empty() || rest.starts_with(char::is_whitespace))
                {
                    return Err(Rejection::new(
                        ErrorCategory::Malformed,
                        format!(
                            "{} header does not start with '{}'",
                            self.header_name, prefix
                        ),
                    ));
                }
                rest.trim()
            }
            None => value,
        };
        if token.is_empty() {
            Ok(None)
        } else {
            Ok(Some(token.to_owned()))
        }
    }

    fn read_content(&self, unit: &dyn UnitOfWork) -> Result<Option<String>, Rejection> {
        let size = unit.content_size();
        if size == 0 {
            return Ok(None);
        }
        if size > self.max_content_size as u64 {
            return Err(Rejection::new(
                ErrorCategory::SizeExceeded,
                format!(
                    "content of {} bytes exceeds the maximum token size of {} bytes",
                    size, self.max_content_size
                ),
            ));
        }
        let content = unit.read_content().map_err(|e| {
            Rejection::new(
                ErrorCategory::Malformed,
                format!("unable to read content: {}", e),
            )
        })?;
        let content = String::from_utf8(content).map_err(|_| {
            Rejection::new(ErrorCategory::Malformed, "content is not valid UTF-8")
        })?;
        let token = content.trim();
        if token.is_empty() {
            Ok(None)
        } else {
            Ok(Some(token.to_owned()))
        }
    }
}
