//! Drives a resource's declared dependency closure to a fixed point: once a
//! definition's bytes are loaded, its dependency lists are read and every
//! external dependency is loaded recursively (breadth-first), internal
//! dependencies going straight to the internal cache.

use log::trace;

use crate::cache::{ExternalDomain, InternalDomain, ScopedCache};
use crate::error::CacheError;
use crate::identifier::{ExternalKey, ResourceId, Revision, ScopeHandle};

struct AwaitingDef {
    scope: ScopeHandle,
    key: ExternalKey,
}

/// Wraps the external cache and tracks which definitions still have their
/// dependency declarations unread. Dependency lists live inside the
/// serialized resource, so they can only be read after the resource itself
/// finished loading.
pub struct DependencyResolver {
    external: ScopedCache<ExternalDomain>,
    awaiting: Vec<AwaitingDef>,
}

impl DependencyResolver {
    pub fn new(external: ScopedCache<ExternalDomain>) -> Self {
        Self {
            external,
            awaiting: Vec::new(),
        }
    }

    pub fn external(&self) -> &ScopedCache<ExternalDomain> {
        &self.external
    }

    pub fn external_mut(&mut self) -> &mut ScopedCache<ExternalDomain> {
        &mut self.external
    }

    /// Loads `id` including its transitive dependencies. The definition
    /// itself loads first; its declarations are read on a later
    /// [`update`](Self::update) tick.
    pub fn load(&mut self, scope: ScopeHandle, id: ResourceId, revision: Revision) -> Result<(), CacheError> {
        self.external.load_resource(scope, id, revision)?;
        let key = self.external.key_for(id, revision);
        self.awaiting.push(AwaitingDef { scope, key });
        Ok(())
    }

    /// True while any definition awaits its dependency declarations. The
    /// full closure is done only when this is false *and* the external cache
    /// stopped loading.
    pub fn is_loading(&self) -> bool {
        !self.awaiting.is_empty() || self.external.is_loading_any()
    }

    fn remove_awaiting(&mut self, key: &ExternalKey) {
        self.awaiting.retain(|awaiting| &awaiting.key != key);
    }

    /// Advances the external cache, prunes failed definitions, expands the
    /// dependency lists of everything that finished loading. Returns `true`
    /// iff the whole dependency closure of every requested load is done.
    pub fn update(&mut self, internal: &mut ScopedCache<InternalDomain>) -> Result<bool, CacheError> {
        let result = self.external.update();

        // Failed keys leave the awaiting list no matter how they failed; a
        // partial dependency graph is never kept half-loaded silently.
        for key in self.external.take_failed() {
            self.remove_awaiting(&key);
        }
        result?;

        let mut index = 0;
        while index < self.awaiting.len() {
            if !self.external.is_loaded(None, &self.awaiting[index].key) {
                index += 1;
                continue;
            }

            let AwaitingDef { scope, key } = self.awaiting.swap_remove(index);
            let resource = self
                .external
                .get(&key)
                .expect("loaded definition without a payload");

            match resource.dependencies() {
                Some(declared) => {
                    for (dependency_id, _count) in declared.external_dependencies() {
                        // Recursive: the dependency enters the awaiting list
                        // itself, expanding the closure breadth-first.
                        if let Err(error) = self.load(scope, dependency_id, Revision::Latest) {
                            self.awaiting.clear();
                            return Err(CacheError::DependencyUnresolvable {
                                id: key.id,
                                source: Box::new(error),
                            });
                        }
                    }
                    for name in declared.internal_dependencies() {
                        // Internal resources are dependency-free leaves.
                        if let Err(error) = internal.load(scope, name) {
                            self.awaiting.clear();
                            return Err(CacheError::DependencyUnresolvable {
                                id: key.id,
                                source: Box::new(error),
                            });
                        }
                    }
                }
                None => trace!("loaded resource {} does not declare any dependencies", key),
            }
        }

        Ok(self.awaiting.is_empty() && !self.external.is_loading_any())
    }
}
