use std::{collections::BTreeMap, fmt::Display};

use http::StatusCode;
use serde::Serialize;

use crate::claims::{AttributeMap, ATTR_AUTHORIZED};

pub const ATTR_ERROR_CODE: &str = "jwt.error.code";
pub const ATTR_ERROR_CATEGORY: &str = "jwt.error.category";
pub const ATTR_ERROR_REASON: &str = "jwt.error.reason";

/// Classification of a rejected token.
///
/// Each category has a stable error code shared by the record attributes and
/// the gateway's problem responses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    MissingToken,
    SizeExceeded,
    Malformed,
    IssuerUnknown,
    SignatureInvalid,
    Expired,
    NotYetValid,
    AudienceMismatch,
    InsufficientScope,
    InsufficientRole,
    IssuerNotAllowed,
    KeysUnavailable,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 12] = [
        ErrorCategory::MissingToken,
        ErrorCategory::SizeExceeded,
        ErrorCategory::Malformed,
        ErrorCategory::IssuerUnknown,
        ErrorCategory::SignatureInvalid,
        ErrorCategory::Expired,
        ErrorCategory::NotYetValid,
        ErrorCategory::AudienceMismatch,
        ErrorCategory::InsufficientScope,
        ErrorCategory::InsufficientRole,
        ErrorCategory::IssuerNotAllowed,
        ErrorCategory::KeysUnavailable,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            ErrorCategory::MissingToken => "AUTH-001",
            ErrorCategory::SizeExceeded => "AUTH-002",
            ErrorCategory::Malformed => "AUTH-003",
            ErrorCategory::IssuerUnknown => "AUTH-004",
            ErrorCategory::SignatureInvalid => "AUTH-005",
            ErrorCategory::Expired => "AUTH-006",
            ErrorCategory::NotYetValid => "AUTH-007",
            ErrorCategory::AudienceMismatch => "AUTH-008",
            ErrorCategory::InsufficientScope => "AUTH-009",
            ErrorCategory::InsufficientRole => "AUTH-010",
            ErrorCategory::IssuerNotAllowed => "AUTH-011",
            ErrorCategory::KeysUnavailable => "AUTH-012",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ErrorCategory::MissingToken => "MISSING_TOKEN",
            ErrorCategory::SizeExceeded => "SIZE_EXCEEDED",
            ErrorCategory::Malformed => "MALFORMED",
            ErrorCategory::IssuerUnknown => "ISSUER_UNKNOWN",
            ErrorCategory::SignatureInvalid => "SIGNATURE_INVALID",
            ErrorCategory::Expired => "EXPIRED",
            ErrorCategory::NotYetValid => "NOT_YET_VALID",
            ErrorCategory::AudienceMismatch => "AUDIENCE_MISMATCH",
            ErrorCategory::InsufficientScope => "INSUFFICIENT_SCOPE",
            ErrorCategory::InsufficientRole => "INSUFFICIENT_ROLE",
            ErrorCategory::IssuerNotAllowed => "ISSUER_NOT_ALLOWED",
            ErrorCategory::KeysUnavailable => "KEYS_UNAVAILABLE",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            ErrorCategory::MissingToken => "Bearer token missing",
            ErrorCategory::SizeExceeded => "Bearer token too large",
            ErrorCategory::Malformed => "Malformed bearer token",
            ErrorCategory::IssuerUnknown => "Unknown token issuer",
            ErrorCategory::SignatureInvalid => "Invalid token signature",
            ErrorCategory::Expired => "Token expired",
            ErrorCategory::NotYetValid => "Token not yet valid",
            ErrorCategory::AudienceMismatch => "Token audience mismatch",
            ErrorCategory::InsufficientScope => "Insufficient scope",
            ErrorCategory::InsufficientRole => "Insufficient role",
            ErrorCategory::IssuerNotAllowed => "Issuer not allowed",
            ErrorCategory::KeysUnavailable => "Signing keys unavailable",
        }
    }

    /// HTTP status used when the gateway rejects a request with this category.
    pub fn status(&self) -> StatusCode {
        match self {
            ErrorCategory::InsufficientScope
            | ErrorCategory::InsufficientRole
            | ErrorCategory::IssuerNotAllowed => StatusCode::FORBIDDEN,
            ErrorCategory::KeysUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::UNAUTHORIZED,
        }
    }
}

impl Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Rejection {
    pub category: ErrorCategory,
    pub reason: String,
}

impl Rejection {
    pub fn new(category: ErrorCategory, reason: impl Into<String>) -> Self {
        Self {
            category,
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        self.category.code()
    }
}

impl Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.code(), self.category, self.reason)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ValidationOutcome {
    Valid {
        issuer_name: String,
        claims: serde_json::Map<String, serde_json::Value>,
        attributes: AttributeMap,
    },
    Invalid(Rejection),
}

impl ValidationOutcome {
    pub fn invalid(category: ErrorCategory, reason: impl Into<String>) -> Self {
        ValidationOutcome::Invalid(Rejection::new(category, reason))
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationOutcome::Valid { .. })
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            ValidationOutcome::Valid { .. } => None,
            ValidationOutcome::Invalid(rejection) => Some(rejection),
        }
    }

    /// Attributes to attach to the unit of work that carried the token.
    pub fn to_attributes(&self) -> AttributeMap {
        match self {
            ValidationOutcome::Valid { attributes, .. } => {
                let mut attributes = attributes.clone();
                attributes.insert(ATTR_AUTHORIZED.to_owned(), "true".to_owned());
                attributes
            }
            ValidationOutcome::Invalid(rejection) => BTreeMap::from([
                (ATTR_AUTHORIZED.to_owned(), "false".to_owned()),
                (ATTR_ERROR_CODE.to_owned(), rejection.code().to_owned()),
                (
                    ATTR_ERROR_CATEGORY.to_owned(),
                    rejection.category.name().to_owned(),
                ),
                (ATTR_ERROR_REASON.to_owned(), rejection.reason.clone()),
            ]),
        }
    }
}
