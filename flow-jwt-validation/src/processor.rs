use std::sync::Arc;

use crate::{
    claims::AttributeMap,
    events::SecurityEventCounter,
    jwt_extract::UnitOfWork,
    manager::IssuerStore,
    outcome::ValidationOutcome,
    validation::TokenValidator,
};

/// Where the hosting runtime should route a processed unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Relationship {
    Success,
    Failure,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProcessedUnit {
    pub outcome: ValidationOutcome,
    /// Attributes to add to the unit, see [ValidationOutcome::to_attributes].
    pub attributes: AttributeMap,
    pub relationship: Relationship,
}

/// Validates the token carried by a unit of work.
///
/// Extraction settings are read from the issuer snapshot on every call, so a
/// reconfiguration of the token location applies to the next unit.
pub struct TokenProcessor {
    validator: TokenValidator,
}

impl TokenProcessor {
    pub fn new(store: Arc<IssuerStore>) -> Self {
        Self {
            validator: TokenValidator::new(store),
        }
    }

    pub fn with_events(store: Arc<IssuerStore>, events: Arc<SecurityEventCounter>) -> Self {
        Self {
            validator: TokenValidator::with_events(store, events),
        }
    }

    pub fn validator(&self) -> &TokenValidator {
        &self.validator
    }

    pub fn process(&self, unit: &dyn UnitOfWork) -> ProcessedUnit {
        let extractor = self
            .validator
            .store()
            .snapshot()
            .settings()
            .token_extractor();
        let outcome = match extractor.extract(unit) {
            Ok(token) => self.validator.validate(token.as_deref()),
            Err(rejection) => self.validator.reject(rejection),
        };
        let relationship = if outcome.is_valid() {
            Relationship::Success
        } else {
            Relationship::Failure
        };
        ProcessedUnit {
            attributes: outcome.to_attributes(),
            outcome,
            relationship,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        claims::ATTR_AUTHORIZED,
        events::SecurityEvent,
        jwt_extract::{Record, TokenLocation},
        manager::ValidationSettings,
        outcome::{ErrorCategory, ATTR_ERROR_CODE, ATTR_ERROR_REASON},
    };

    use super::*;

    fn processor(settings: ValidationSettings) -> TokenProcessor {
        TokenProcessor::new(Arc::new(
            IssuerStore::with_issuers(settings, Vec::new()).unwrap(),
        ))
    }

    #[test]
    fn missing_header_goes_to_failure() {
        let processor = processor(ValidationSettings::default());

        let processed = processor.process(&Record::new());

        assert_eq!(processed.relationship, Relationship::Failure);
        assert_eq!(processed.attributes.get(ATTR_ERROR_CODE).unwrap(), "AUTH-001");
        assert_eq!(processed.attributes.get(ATTR_AUTHORIZED).unwrap(), "false");
        assert!(processed.attributes.contains_key(ATTR_ERROR_REASON));
    }

    #[test]
    fn wrong_prefix_is_recorded() {
        let processor = processor(ValidationSettings::default());
        let record = Record::new().with_attribute("Authorization", "Basic dXNlcjpwYXNz");

        let processed = processor.process(&record);

        assert_eq!(
            processed.outcome.rejection().unwrap().category,
            ErrorCategory::Malformed
        );
        assert_eq!(
            processor
                .validator()
                .events()
                .count(SecurityEvent::Rejected(ErrorCategory::Malformed)),
            1
        );
    }

    #[test]
    fn oversized_content_is_rejected() {
        let processor = processor(ValidationSettings {
            token_location: TokenLocation::FlowContent,
            max_token_size: 8,
            ..Default::default()
        });
        let record = Record::new().with_content("a.b.c.d.e.f.g");

        let processed = processor.process(&record);

        assert_eq!(processed.attributes.get(ATTR_ERROR_CODE).unwrap(), "AUTH-002");
        assert_eq!(processor.validator().decoded_tokens(), 0);
    }
}
