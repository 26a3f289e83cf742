use std::any::Any;
use std::sync::Arc;

use dashmap::DashMap;

use super::{ResourceError, ResourceKind};

type Entry = Arc<dyn Any + Send + Sync>;

/// Arena giving every resource a single instance per (kind, id).
#[derive(Default)]
pub struct ResourceRegistry {
    entries: DashMap<(ResourceKind, String), Entry>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the registered instance, creating it with `make` on first lookup.
    pub fn get_or_insert_with<R, F>(
        &self,
        kind: ResourceKind,
        id: &str,
        make: F,
    ) -> Result<R, ResourceError>
    where
        R: Clone + Send + Sync + 'static,
        F: FnOnce() -> R,
    {
        let entry = self
            .entries
            .entry((kind, id.to_string()))
            .or_insert_with(|| {
                tracing::trace!(target: "reqlet::resource", ?kind, %id, "Registering resource");
                Arc::new(make()) as Entry
            })
            .clone();
        downcast(kind, id, entry)
    }

    pub fn get<R: Clone + Send + Sync + 'static>(
        &self,
        kind: ResourceKind,
        id: &str,
    ) -> Result<R, ResourceError> {
        let entry = self
            .entries
            .get(&(kind, id.to_string()))
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ResourceError::NotFound {
                kind,
                id: id.to_string(),
            })?;
        downcast(kind, id, entry)
    }

    pub fn remove(&self, kind: ResourceKind, id: &str) -> bool {
        self.entries.remove(&(kind, id.to_string())).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count(&self, kind: ResourceKind) -> usize {
        self.entries.iter().filter(|entry| entry.key().0 == kind).count()
    }
}

fn downcast<R: Clone + Send + Sync + 'static>(
    kind: ResourceKind,
    id: &str,
    entry: Entry,
) -> Result<R, ResourceError> {
    entry
        .downcast::<R>()
        .map(|value| R::clone(&value))
        .map_err(|_| ResourceError::TypeMismatch {
            kind,
            id: id.to_string(),
        })
}

impl std::fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("entries", &self.entries.len())
            .finish()
    }
}
