//! Single entry point composing the internal cache, the external cache (via
//! the dependency resolver) and the instantiation queue.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};

use crate::cache::{ExternalDomain, InternalDomain, ScopedCache, UnloadReadyRegistry};
use crate::collaborators::{ContentIndex, RecoveryClient, Storage};
use crate::engine::{DeserializerRegistry, LoadEngine};
use crate::error::CacheError;
use crate::identifier::{InternalName, ResourceId, Revision, ScopeHandle, TypeTag};
use crate::resource::{Deserializer, Resource};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// An instance whose definition's dependency closure must finish before the
/// instance itself may load.
struct InstanceItem {
    scope: ScopeHandle,
    id: ResourceId,
    revision: Revision,
}

/// The resource cache: load resources (and their dependency closures) into
/// scopes, read them with the `get` methods, release them with the `unload`
/// methods, and drive everything by calling [`update`](Self::update) once
/// per tick.
///
/// A plain owned value; whoever composes the application decides where it
/// lives and how it is shared.
pub struct CacheFacade {
    internal: ScopedCache<InternalDomain>,
    resolver: crate::deps::DependencyResolver,
    /// Instances waiting for their definition's dependency graph. Strictly
    /// FIFO: one item is promoted per idle tick.
    instance_queue: VecDeque<InstanceItem>,
    deserializers: Arc<DeserializerRegistry>,
    unload_ready: Arc<UnloadReadyRegistry>,
}

impl CacheFacade {
    /// `internal_root` is the storage prefix of statically named engine
    /// assets (may be empty).
    pub fn new(
        storage: Arc<dyn Storage>,
        index: Arc<dyn ContentIndex>,
        recovery: Arc<dyn RecoveryClient>,
        internal_root: impl Into<String>,
    ) -> Self {
        let deserializers = Arc::new(DeserializerRegistry::new());
        let unload_ready = Arc::new(UnloadReadyRegistry::new());

        let internal = ScopedCache::new(
            InternalDomain::new(internal_root),
            LoadEngine::new("internal", storage.clone(), deserializers.clone()),
            unload_ready.clone(),
        );
        let external = ScopedCache::new(
            ExternalDomain::new(index, recovery),
            LoadEngine::new("external", storage, deserializers.clone()),
            unload_ready.clone(),
        );

        Self {
            internal,
            resolver: crate::deps::DependencyResolver::new(external),
            instance_queue: VecDeque::new(),
            deserializers,
            unload_ready,
        }
    }

    pub fn register_deserializer(&self, type_tag: TypeTag, deserializer: Arc<dyn Deserializer>) {
        self.deserializers.register(type_tag, deserializer);
    }

    /// Registers a per-type predicate gating physical unload (e.g. "not
    /// while still playing").
    pub fn register_unload_readiness(
        &self,
        type_tag: TypeTag,
        predicate: impl Fn(&dyn Resource) -> bool + Send + Sync + 'static,
    ) {
        self.unload_ready.register(type_tag, predicate);
    }

    /// Loads an external resource, with its dependency closure when
    /// `with_deps` is set.
    pub fn load(
        &mut self,
        scope: ScopeHandle,
        id: ResourceId,
        with_deps: bool,
        revision: Revision,
    ) -> Result<(), CacheError> {
        if with_deps {
            self.resolver.load(scope, id, revision)
        } else {
            self.resolver.external_mut().load_resource(scope, id, revision)
        }
    }

    /// Loads a placed instance: first the definition with its full
    /// dependency closure, then (once all dependency work drained) the
    /// instance itself. Instances are dependency-free by construction.
    pub fn load_instance(
        &mut self,
        scope: ScopeHandle,
        instance_id: ResourceId,
        def_id: ResourceId,
        revision: Revision,
    ) -> Result<(), CacheError> {
        self.resolver.load(scope, def_id, revision)?;
        debug!("queueing instance {} behind definition {}", instance_id, def_id);
        self.instance_queue.push_back(InstanceItem {
            scope,
            id: instance_id,
            revision,
        });
        Ok(())
    }

    pub fn load_internal(&mut self, scope: ScopeHandle, name: InternalName) -> Result<(), CacheError> {
        self.internal.load(scope, name)
    }

    /// Loads every known resource of `type_tag`. Can be called again to pick
    /// up resources created since the previous call.
    pub fn load_all_of(&mut self, scope: ScopeHandle, type_tag: TypeTag, with_deps: bool) -> Result<(), CacheError> {
        let ids = self.resolver.external().domain().index().all_of(type_tag);
        for id in ids {
            self.load(scope, id, with_deps, Revision::Latest)?;
        }
        Ok(())
    }

    /// Releases everything `scope` holds, in both domains.
    pub fn unload_scope(&mut self, scope: ScopeHandle) {
        self.resolver.external_mut().unload_scope(scope);
        self.internal.unload_scope(scope);
    }

    /// Forcefully unloads one external resource; blocking. Does nothing if
    /// it is not loaded.
    pub fn unload(&mut self, id: ResourceId, revision: Revision) -> Result<(), CacheError> {
        self.resolver.external_mut().unload_resource(id, revision)
    }

    /// Reloads the tip of an external resource in place; blocking.
    pub fn reload(&mut self, id: ResourceId) -> Result<(), CacheError> {
        self.resolver.external_mut().reload_resource(id)
    }

    /// Reloads an internal resource in place; blocking. Useful for live
    /// asset iteration without restarting.
    pub fn reload_internal(&mut self, name: &InternalName) -> Result<(), CacheError> {
        self.internal.reload(name)
    }

    /// Replaces one internal resource's backing file with another's; see
    /// [`ScopedCache::replace`].
    pub fn replace(&mut self, old: &InternalName, new: &InternalName) -> Result<(), CacheError> {
        self.internal.replace(old, new)
    }

    /// Promotes a freshly synced latest revision; see
    /// [`ScopedCache::promote_latest`].
    pub fn promote_latest(&mut self, id: ResourceId, old_revision: u32) -> Result<(), CacheError> {
        self.resolver.external_mut().promote_latest(id, old_revision)
    }

    pub fn get(&self, id: ResourceId, revision: Revision) -> Option<Arc<dyn Resource>> {
        self.resolver.external().get_resource(id, revision)
    }

    pub fn get_internal(&self, name: &InternalName) -> Option<Arc<dyn Resource>> {
        self.internal.get(name)
    }

    /// Every loaded external resource of the given type.
    pub fn get_all_of(&self, type_tag: TypeTag) -> Vec<Arc<dyn Resource>> {
        self.resolver.external().get_all_of(type_tag)
    }

    pub fn is_loaded(&self, scope: Option<ScopeHandle>, id: ResourceId, revision: Revision) -> bool {
        self.resolver.external().is_loaded_resource(scope, id, revision)
    }

    pub fn is_loaded_internal(&self, scope: Option<ScopeHandle>, name: &InternalName) -> bool {
        self.internal.is_loaded(scope, name)
    }

    /// True while either domain is loading or draining unloads, dependency
    /// resolution is outstanding, or instances await promotion.
    pub fn is_loading(&self) -> bool {
        self.internal.is_loading_any() || self.resolver.is_loading() || !self.instance_queue.is_empty()
    }

    pub fn loaded_count(&self) -> usize {
        self.internal.loaded_count() + self.resolver.external().loaded_count()
    }

    /// Loading progress in `[0, 1]` across both domains.
    pub fn progress(&self) -> f32 {
        let internal = self.internal.engine();
        let external = self.resolver.external().engine();
        let submitted = internal.submitted() + external.submitted();
        if submitted == 0 {
            1.0
        } else {
            (internal.completed() + external.completed()) as f32 / submitted as f32
        }
    }

    /// Drives both domains one tick. Only once all dependency work is idle
    /// is the next queued instance promoted and its plain load issued.
    /// Returns `true` iff everything requested has been loaded.
    pub fn update(&mut self) -> Result<bool, CacheError> {
        let mut idle = true;
        if !self.internal.update()? {
            idle = false;
        }
        if !self.resolver.update(&mut self.internal)? {
            idle = false;
        }
        // Dependency expansion may have issued internal loads just now,
        // after the internal cache already ticked.
        if self.internal.is_loading_any() {
            idle = false;
        }

        if idle && let Some(item) = self.instance_queue.pop_front() {
            idle = false;
            debug!("definitions drained, loading instance {}", item.id);
            self.resolver
                .external_mut()
                .load_resource(item.scope, item.id, item.revision)?;
        }

        Ok(idle && self.instance_queue.is_empty())
    }

    /// Blocks until [`update`](Self::update) reports idle. No timeout.
    pub fn finish_loading(&mut self) -> Result<(), CacheError> {
        while !self.update()? {
            std::thread::sleep(POLL_INTERVAL);
        }
        Ok(())
    }
}

impl Drop for CacheFacade {
    fn drop(&mut self) {
        // By the time the facade goes away every scope should have unloaded.
        let remaining = self.loaded_count();
        if remaining > 0 {
            warn!("cache dropped with {} resources still loaded", remaining);
        }
    }
}
