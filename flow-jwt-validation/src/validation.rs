use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use jsonwebtoken::{decode, decode_header, errors::ErrorKind, Validation};
use log::debug;
use serde_json::{Map, Value};

use crate::{
    events::{SecurityEvent, SecurityEventCounter},
    issuer::MatchPolicy,
    jwt_unverified::UnverifiedJwt,
    manager::{IssuerStore, ResolvedIssuer},
    outcome::{ErrorCategory, Rejection, ValidationOutcome},
};

/// Per-call constraints on top of the issuer's own policy, e.g. those of a
/// gateway route.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Requirements {
    /// Name of the only issuer accepted.
    pub required_issuer: Option<String>,
    /// All of these must be granted.
    pub required_scopes: BTreeSet<String>,
    /// All of these must be granted.
    pub required_roles: BTreeSet<String>,
}

/// Validates raw tokens against the current issuer snapshot.
pub struct TokenValidator {
    store: Arc<IssuerStore>,
    events: Arc<SecurityEventCounter>,
    decoded: AtomicU64,
}

impl TokenValidator {
    pub fn new(store: Arc<IssuerStore>) -> Self {
        Self::with_events(store, Arc::new(SecurityEventCounter::new()))
    }

    pub fn with_events(store: Arc<IssuerStore>, events: Arc<SecurityEventCounter>) -> Self {
        Self {
            store,
            events,
            decoded: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<IssuerStore> {
        &self.store
    }

    pub fn events(&self) -> &Arc<SecurityEventCounter> {
        &self.events
    }

    /// Number of tokens that got past the size check into unverified decoding.
    pub fn decoded_tokens(&self) -> u64 {
        self.decoded.load(Ordering::Relaxed)
    }

    pub fn validate(&self, raw_token: Option<&str>) -> ValidationOutcome {
        self.validate_with(raw_token, &Requirements::default())
    }

    /// Runs the full pipeline and records the outcome as a security event.
    ///
    /// Never fails: every problem with the token is an
    /// [Invalid](ValidationOutcome::Invalid) outcome.
    pub fn validate_with(
        &self,
        raw_token: Option<&str>,
        requirements: &Requirements,
    ) -> ValidationOutcome {
        let outcome = match self.run(raw_token, requirements) {
            Ok(outcome) => outcome,
            Err(rejection) => ValidationOutcome::Invalid(rejection),
        };
        self.record(&outcome);
        outcome
    }

    /// Records a rejection raised before validation, e.g. by the extractor.
    pub fn reject(&self, rejection: Rejection) -> ValidationOutcome {
        let outcome = ValidationOutcome::Invalid(rejection);
        self.record(&outcome);
        outcome
    }

    fn record(&self, outcome: &ValidationOutcome) {
        match outcome {
            ValidationOutcome::Valid { issuer_name, .. } => {
                debug!("Token accepted from issuer '{}'", issuer_name);
                self.events.record(SecurityEvent::Success);
            }
            ValidationOutcome::Invalid(rejection) => {
                debug!("Token rejected: {}", rejection);
                self.events.record(SecurityEvent::Rejected(rejection.category));
            }
        }
    }

    fn run(
        &self,
        raw_token: Option<&str>,
        requirements: &Requirements,
    ) -> Result<ValidationOutcome, Rejection> {
        let snapshot = self.store.snapshot();

        let token = raw_token.map(str::trim).unwrap_or_default();
        if token.is_empty() {
            return Err(Rejection::new(
                ErrorCategory::MissingToken,
                "no bearer token provided",
            ));
        }
        let max_token_size = snapshot.settings().max_token_size;
        if token.len() > max_token_size {
            return Err(Rejection::new(
                ErrorCategory::SizeExceeded,
                format!(
                    "token of {} bytes exceeds the maximum of {} bytes",
                    token.len(),
                    max_token_size
                ),
            ));
        }

        self.decoded.fetch_add(1, Ordering::Relaxed);
        let jwt = UnverifiedJwt::parse(token)
            .map_err(|reason| Rejection::new(ErrorCategory::Malformed, reason))?;

        let iss = jwt.issuer().ok_or_else(|| {
            Rejection::new(ErrorCategory::IssuerUnknown, "token has no 'iss' claim")
        })?;
        let issuer = snapshot
            .by_identifier(iss)
            .filter(|issuer| issuer.config.enabled)
            .ok_or_else(|| {
                Rejection::new(
                    ErrorCategory::IssuerUnknown,
                    format!("issuer '{}' is not configured", iss),
                )
            })?;
        let claims = verify(&jwt, issuer)?;

        if let Some(required) = &requirements.required_issuer {
            if *required != issuer.config.name {
                return Err(Rejection::new(
                    ErrorCategory::IssuerNotAllowed,
                    format!(
                        "issuer '{}' is not accepted here, expected '{}'",
                        issuer.config.name, required
                    ),
                ));
            }
        }

        let mapper = &issuer.config.claim_mapper;
        let scopes = mapper.scopes(&claims);
        check_granted(
            ErrorCategory::InsufficientScope,
            "scope",
            issuer.config.match_policy,
            &issuer.config.expected_scopes,
            &requirements.required_scopes,
            &scopes,
        )?;
        let roles = mapper.roles(&claims);
        check_granted(
            ErrorCategory::InsufficientRole,
            "role",
            issuer.config.match_policy,
            &issuer.config.expected_roles,
            &requirements.required_roles,
            &roles,
        )?;

        let attributes = mapper.map(&claims, &issuer.config.name);
        Ok(ValidationOutcome::Valid {
            issuer_name: issuer.config.name.clone(),
            claims,
            attributes,
        })
    }
}

/// Signature and standard claims, checked by `jsonwebtoken` with the issuer's
/// cached keys.
fn verify(jwt: &UnverifiedJwt, issuer: &ResolvedIssuer) -> Result<Map<String, Value>, Rejection> {
    let header = decode_header(jwt.as_str()).map_err(classify)?;
    let key_set = issuer.key_source.current_key_set().ok_or_else(|| {
        Rejection::new(
            ErrorCategory::KeysUnavailable,
            format!(
                "no signing keys loaded yet for issuer '{}'",
                issuer.config.name
            ),
        )
    })?;
    let key = match header.kid.as_deref() {
        Some(kid) => key_set.get(kid).ok_or_else(|| {
            Rejection::new(
                ErrorCategory::SignatureInvalid,
                format!("unknown key id '{}'", kid),
            )
        })?,
        None => match key_set.key_ids().as_slice() {
            [only] => key_set.get(only).ok_or_else(|| {
                Rejection::new(ErrorCategory::SignatureInvalid, "token has no key id")
            })?,
            _ => {
                return Err(Rejection::new(
                    ErrorCategory::SignatureInvalid,
                    "token has no key id",
                ))
            }
        },
    };
    if let Some(algorithm) = key.algorithm {
        if algorithm != header.alg {
            return Err(Rejection::new(
                ErrorCategory::SignatureInvalid,
                format!(
                    "token algorithm {:?} does not match key algorithm {:?}",
                    header.alg, algorithm
                ),
            ));
        }
    }

    let mut validation = Validation::new(header.alg);
    let mut required_claims = vec!["exp", "iss"];
    validation.set_issuer(&[&issuer.config.identifier]);
    validation.validate_nbf = true;
    if let Some(audience) = &issuer.config.expected_audience {
        required_claims.push("aud");
        validation.set_audience(&[audience]);
    } else {
        validation.validate_aud = false;
    }
    validation.set_required_spec_claims(&required_claims);

    decode::<Map<String, Value>>(jwt.as_str(), &key.decoding_key, &validation)
        .map(|data| data.claims)
        .map_err(classify)
}

fn classify(error: jsonwebtoken::errors::Error) -> Rejection {
    let category = match error.kind() {
        ErrorKind::ExpiredSignature => ErrorCategory::Expired,
        ErrorKind::ImmatureSignature => ErrorCategory::NotYetValid,
        ErrorKind::InvalidAudience => ErrorCategory::AudienceMismatch,
        ErrorKind::MissingRequiredClaim(claim) if claim == "aud" => {
            ErrorCategory::AudienceMismatch
        }
        ErrorKind::InvalidIssuer => ErrorCategory::IssuerUnknown,
        ErrorKind::MissingRequiredClaim(_)
        | ErrorKind::InvalidToken
        | ErrorKind::Base64(_)
        | ErrorKind::Json(_)
        | ErrorKind::Utf8(_) => ErrorCategory::Malformed,
        _ => ErrorCategory::SignatureInvalid,
    };
    Rejection::new(category, error.to_string())
}

fn check_granted(
    category: ErrorCategory,
    kind: &str,
    policy: MatchPolicy,
    issuer_required: &BTreeSet<String>,
    call_required: &BTreeSet<String>,
    granted: &BTreeSet<String>,
) -> Result<(), Rejection> {
    if !policy.is_satisfied(issuer_required, granted) {
        return Err(Rejection::new(
            category,
            format!(
                "token grants [{}], issuer requires {} of [{}]",
                join(granted),
                if policy == MatchPolicy::All { "all" } else { "any" },
                join(issuer_required)
            ),
        ));
    }
    let missing = call_required.difference(granted).cloned().collect::<Vec<_>>();
    if !missing.is_empty() {
        return Err(Rejection::new(
            category,
            format!("missing required {}(s): {}", kind, missing.join(", ")),
        ));
    }
    Ok(())
}

fn join(values: &BTreeSet<String>) -> String {
    values.iter().cloned().collect::<Vec<_>>().join(", ")
}
