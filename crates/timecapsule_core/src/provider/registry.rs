//! In-process send provider registry.
//!
//! Routes each channel part (email or mail) to exactly one provider.

use crate::model::ledger::CreditType;
use crate::provider::SendProvider;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Provider registration/selection errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderRegistryError {
    #[error("provider id is invalid: {0}")]
    InvalidProviderId(String),
    #[error("a provider is already registered for `{}`", .0.as_str())]
    DuplicateKind(CreditType),
    #[error("no provider registered for `{}`", .0.as_str())]
    ProviderNotFound(CreditType),
}

/// Runtime provider registry keyed by channel part.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: BTreeMap<CreditType, Arc<dyn SendProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one provider for its channel part.
    pub fn register(
        &mut self,
        provider: Arc<dyn SendProvider>,
    ) -> Result<(), ProviderRegistryError> {
        let provider_id = provider.provider_id().trim().to_string();
        if !is_valid_provider_id(&provider_id) {
            return Err(ProviderRegistryError::InvalidProviderId(provider_id));
        }
        let kind = provider.kind();
        if self.providers.contains_key(&kind) {
            return Err(ProviderRegistryError::DuplicateKind(kind));
        }

        self.providers.insert(kind, provider);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Returns registered provider ids ordered by channel part.
    pub fn provider_ids(&self) -> Vec<String> {
        self.providers
            .values()
            .map(|provider| provider.provider_id().to_string())
            .collect()
    }

    pub fn get(&self, kind: CreditType) -> Option<Arc<dyn SendProvider>> {
        self.providers.get(&kind).cloned()
    }

    /// Returns the provider for `kind` or a routing error.
    pub fn require(&self, kind: CreditType) -> Result<Arc<dyn SendProvider>, ProviderRegistryError> {
        self.get(kind)
            .ok_or(ProviderRegistryError::ProviderNotFound(kind))
    }
}

fn is_valid_provider_id(value: &str) -> bool {
    if value.is_empty() {
        return false;
    }
    value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::{ProviderRegistry, ProviderRegistryError};
    use crate::model::ledger::CreditType;
    use crate::provider::{DryRunProvider, SendError, SendProvider, SendReceipt, SendRequest};
    use std::sync::Arc;

    struct NamedProvider {
        provider_id: String,
        kind: CreditType,
    }

    impl SendProvider for NamedProvider {
        fn provider_id(&self) -> &str {
            &self.provider_id
        }

        fn kind(&self) -> CreditType {
            self.kind
        }

        fn send(&self, _request: &SendRequest) -> Result<SendReceipt, SendError> {
            Ok(SendReceipt {
                provider_ref: "ref".to_string(),
                transit_days: None,
            })
        }
    }

    #[test]
    fn registers_one_provider_per_kind() {
        let mut registry = ProviderRegistry::new();
        registry
            .register(Arc::new(DryRunProvider::new(CreditType::Email)))
            .expect("email provider should register");
        registry
            .register(Arc::new(DryRunProvider::new(CreditType::Mail)))
            .expect("mail provider should register");
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.provider_ids(),
            vec!["dry_run_email".to_string(), "dry_run_mail".to_string()]
        );

        let duplicate = registry.register(Arc::new(DryRunProvider::new(CreditType::Mail)));
        assert_eq!(
            duplicate,
            Err(ProviderRegistryError::DuplicateKind(CreditType::Mail))
        );
    }

    #[test]
    fn rejects_invalid_provider_id() {
        let mut registry = ProviderRegistry::new();
        let invalid = registry.register(Arc::new(NamedProvider {
            provider_id: "Postal Service".to_string(),
            kind: CreditType::Mail,
        }));
        assert!(matches!(
            invalid,
            Err(ProviderRegistryError::InvalidProviderId(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn require_reports_missing_kind() {
        let registry = ProviderRegistry::new();
        assert!(matches!(
            registry.require(CreditType::Email),
            Err(ProviderRegistryError::ProviderNotFound(CreditType::Email))
        ));
    }
}
