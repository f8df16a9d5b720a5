//! Scheme registry
//!
//! Maps configured scheme names to constructors.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::broadcast::BroadcastScheme;
use super::tag::TagScheme;
use super::wka::WkaScheme;
use super::MembershipScheme;
use crate::error::{Error, Result};

pub type SchemeFactory = Arc<dyn Fn() -> Arc<dyn MembershipScheme> + Send + Sync>;

#[derive(Clone, Default)]
pub struct SchemeRegistry {
    factories: BTreeMap<String, SchemeFactory>,
}

impl SchemeRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the tag, wka and broadcast schemes
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(TagScheme::NAME, Arc::new(|| Arc::new(TagScheme::new())));
        registry.register(WkaScheme::NAME, Arc::new(|| Arc::new(WkaScheme::new())));
        registry.register(BroadcastScheme::NAME, Arc::new(|| Arc::new(BroadcastScheme::new())));
        registry
    }

    /// Add or replace a scheme
    pub fn register(&mut self, name: impl Into<String>, factory: SchemeFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Construct the scheme registered under `name`
    pub fn create(&self, name: &str) -> Result<Arc<dyn MembershipScheme>> {
        let name = name.trim();
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| Error::UnknownScheme {
                name: name.to_string(),
                supported: self.names(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheme::memory::{InMemoryScheme, MemoryNetwork};

    #[test]
    fn test_builtin_schemes() {
        let registry = SchemeRegistry::with_builtin();
        assert_eq!(registry.names(), vec!["broadcast", "tag", "wka"]);
        assert_eq!(registry.create(" wka ").unwrap().name(), "wka");
    }

    #[test]
    fn test_unknown_scheme() {
        let registry = SchemeRegistry::with_builtin();
        match registry.create("multicast") {
            Err(Error::UnknownScheme { name, supported }) => {
                assert_eq!(name, "multicast");
                assert_eq!(supported.len(), 3);
            }
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("multicast should not resolve"),
        }
    }

    #[test]
    fn test_custom_registration() {
        let network = MemoryNetwork::new();
        let mut registry = SchemeRegistry::new();
        registry.register(
            "memory",
            Arc::new(move || Arc::new(InMemoryScheme::new(network.clone()))),
        );

        assert!(registry.contains("memory"));
        assert_eq!(registry.create("memory").unwrap().name(), "memory");
    }
}
