//! Provider registry: built once at startup, then shared read-only.

use super::{Provider, ProviderAdapter};
use std::collections::HashMap;
use std::sync::Arc;

struct Registration {
    provider: Provider,
    adapter: Arc<dyn ProviderAdapter>,
}

/// Catalog of known providers and the adapter serving each.
///
/// Mutation needs `&mut self`, so once wrapped in an `Arc` all reads are
/// lock-free.
#[derive(Default)]
pub struct ProviderRegistry {
    entries: Vec<Registration>,
    index: HashMap<String, usize>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a provider. Replacing keeps the original position.
    pub fn register(&mut self, provider: Provider, adapter: Arc<dyn ProviderAdapter>) {
        let registration = Registration { provider, adapter };
        match self.index.get(&registration.provider.id) {
            Some(&position) => self.entries[position] = registration,
            None => {
                self.index
                    .insert(registration.provider.id.clone(), self.entries.len());
                self.entries.push(registration);
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&Provider> {
        self.index.get(id).map(|&i| &self.entries[i].provider)
    }

    pub fn adapter(&self, id: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.index
            .get(id)
            .map(|&i| Arc::clone(&self.entries[i].adapter))
    }

    /// Providers in registration order.
    pub fn list(&self) -> impl Iterator<Item = &Provider> {
        self.entries.iter().map(|r| &r.provider)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
