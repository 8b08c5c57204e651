//! The reference-counted cache core: one instance per domain, tracking
//! loading, loaded, unloading and reloading entries, driven by a cooperative
//! `update()` tick.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools;
use log::{debug, error, trace};

use crate::cache::domain::{CacheDomain, ExternalDomain, FailureDisposition, InternalDomain};
use crate::cache::unload::UnloadReadyRegistry;
use crate::engine::LoadEngine;
use crate::error::CacheError;
use crate::identifier::{ExternalKey, InternalName, ResourceId, Revision, ScopeHandle, TypeTag};
use crate::resource::Resource;

/// Sleep between `update()` iterations in the blocking drive loops. No
/// timeout: a fetch job that never completes hangs the blocking callers
/// forever, like the original busy-wait did.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

struct CacheEntry<K> {
    key: K,
    /// Derived once from the domain, immutable afterwards.
    locator: String,
    type_tag: TypeTag,
    scopes: HashSet<ScopeHandle>,
    /// `None` while the fetch job is in flight.
    payload: Option<Arc<dyn Resource>>,
    /// Set when every scope left while the fetch was still in flight; the
    /// finished payload is diverted straight to the unload queue instead of
    /// being promoted (an in-flight load is never cancelled, so the result
    /// must not leak).
    unload_when_loaded: bool,
}

struct UnloadingEntry<K> {
    key: K,
    type_tag: TypeTag,
    payload: Arc<dyn Resource>,
}

impl<K> UnloadingEntry<K> {
    fn from_entry(entry: CacheEntry<K>) -> Self {
        Self {
            key: entry.key,
            type_tag: entry.type_tag,
            payload: entry.payload.expect("unloading entry without a payload"),
        }
    }
}

enum ReloadPhase {
    /// Old bytes discarded, fresh fetch not yet issued.
    Unloading,
    /// Fresh fetch in flight.
    Loading,
}

/// A reload never takes the old object out of callers' hands: the old
/// payload is retained and the fresh contents are merged into it.
struct ReloadTicket<K> {
    key: K,
    /// Normally the entry's own locator; `replace` substitutes another
    /// name's.
    locator: String,
    type_tag: TypeTag,
    params: Option<serde_json::Value>,
    old: Arc<dyn Resource>,
    phase: ReloadPhase,
}

/// Scoped, reference-counted cache over one [`CacheDomain`].
///
/// States per key: Unloaded (absent) -> Loading -> Loaded -> Unloading ->
/// Unloaded, with Reloading reachable only from Loaded. A key exists in at
/// most one of the loading/loaded maps.
pub struct ScopedCache<D: CacheDomain> {
    domain: D,
    engine: LoadEngine,
    unload_ready: Arc<UnloadReadyRegistry>,
    loading: HashMap<D::Key, CacheEntry<D::Key>>,
    loaded: HashMap<D::Key, CacheEntry<D::Key>>,
    unloading: Vec<UnloadingEntry<D::Key>>,
    reloading: Vec<ReloadTicket<D::Key>>,
    /// Keys that failed unrecoverably (or whose redownload failed), waiting
    /// to be collected by the dependency resolver.
    failed: Vec<D::Key>,
}

impl<D: CacheDomain> ScopedCache<D> {
    pub fn new(domain: D, engine: LoadEngine, unload_ready: Arc<UnloadReadyRegistry>) -> Self {
        Self {
            domain,
            engine,
            unload_ready,
            loading: HashMap::new(),
            loaded: HashMap::new(),
            unloading: Vec::new(),
            reloading: Vec::new(),
            failed: Vec::new(),
        }
    }

    pub fn domain(&self) -> &D {
        &self.domain
    }

    pub fn engine(&self) -> &LoadEngine {
        &self.engine
    }

    /// Loads `key` into `scope`. Idempotent: a key that is already loaded or
    /// loading only gets the scope added; one fetch job exists per key no
    /// matter how many callers asked for it. Failures surface later, out of
    /// [`update`](Self::update).
    pub fn load(&mut self, scope: ScopeHandle, key: D::Key) -> Result<(), CacheError> {
        let existing = match self.loaded.get_mut(&key) {
            Some(entry) => Some(entry),
            None => self.loading.get_mut(&key),
        };
        if let Some(entry) = existing {
            // A fresh consumer voids any deferred unload.
            entry.unload_when_loaded = false;
            if entry.scopes.insert(scope) {
                debug!("load({}, {}): added scope, scope count: {}", scope, key, entry.scopes.len());
            }
            return Ok(());
        }

        let type_tag = self.domain.type_of(&key)?;
        let locator = self.domain.locator(&key);
        debug!("load({}, {}): new resource from {}", scope, key, locator);
        self.engine.submit(&locator, type_tag, self.domain.parameters(&key));

        let mut scopes = HashSet::new();
        scopes.insert(scope);
        self.loading.insert(
            key.clone(),
            CacheEntry {
                key,
                locator,
                type_tag,
                scopes,
                payload: None,
                unload_when_loaded: false,
            },
        );
        Ok(())
    }

    /// Removes `scope` from every entry referencing it. Entries whose scope
    /// set empties transition to pending-unload; entries still in flight are
    /// flagged and unload right after their fetch completes.
    pub fn unload_scope(&mut self, scope: ScopeHandle) {
        let mut emptied = Vec::new();
        for (key, entry) in self.loaded.iter_mut() {
            if entry.scopes.remove(&scope) {
                if entry.scopes.is_empty() {
                    emptied.push(key.clone());
                } else {
                    debug!(
                        "unload({}): removed scope from {}, scope count: {}",
                        scope,
                        key,
                        entry.scopes.len()
                    );
                }
            }
        }
        for key in emptied {
            let entry = self.loaded.remove(&key).expect("key collected above");
            debug!("unload({}): fully removing {}", scope, key);
            self.unloading.push(UnloadingEntry::from_entry(entry));
        }

        for (key, entry) in self.loading.iter_mut() {
            if entry.scopes.remove(&scope) && entry.scopes.is_empty() {
                debug!("unload({}): {} is still loading, deferring its unload", scope, key);
                entry.unload_when_loaded = true;
            }
        }
    }

    /// Forcefully unloads `key` regardless of how many scopes hold it, then
    /// drives [`update`](Self::update) until the entry is physically gone.
    /// Blocks without timeout while an unload-readiness predicate holds the
    /// entry back or while its fetch is still in flight.
    pub fn unload(&mut self, key: &D::Key) -> Result<(), CacheError> {
        if let Some(entry) = self.loaded.remove(key) {
            debug!("unload({}): forced", key);
            self.unloading.push(UnloadingEntry::from_entry(entry));
        } else if let Some(entry) = self.loading.get_mut(key) {
            debug!("unload({}): forced while still loading, deferred", key);
            entry.scopes.clear();
            entry.unload_when_loaded = true;
        } else {
            return Ok(());
        }

        while self.is_tracked(key) {
            self.update()?;
            if !self.is_tracked(key) {
                break;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        Ok(())
    }

    /// Refetches a loaded resource and merges the fresh contents into the
    /// retained old payload, so existing holders observe the new state
    /// through their old reference. Blocks until the merge completed.
    pub fn reload(&mut self, key: &D::Key) -> Result<(), CacheError> {
        let entry = self.loaded.get(key).ok_or_else(|| {
            CacheError::InvalidState(format!("reload({}) called but the resource is not loaded", key))
        })?;
        let ticket = ReloadTicket {
            key: key.clone(),
            locator: entry.locator.clone(),
            type_tag: entry.type_tag,
            params: self.domain.parameters(key),
            old: entry.payload.clone().expect("loaded entry without a payload"),
            phase: ReloadPhase::Unloading,
        };
        self.reloading.push(ticket);
        self.drive_reloads()
    }

    fn drive_reloads(&mut self) -> Result<(), CacheError> {
        while !self.reloading.is_empty() {
            self.update()?;
            if self.reloading.is_empty() {
                break;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        Ok(())
    }

    /// `scope = None` means "in any scope".
    pub fn is_loaded(&self, scope: Option<ScopeHandle>, key: &D::Key) -> bool {
        match self.loaded.get(key) {
            Some(entry) => scope.is_none_or(|scope| entry.scopes.contains(&scope)),
            None => false,
        }
    }

    /// `scope = None` means "in any scope".
    pub fn is_loading(&self, scope: Option<ScopeHandle>, key: &D::Key) -> bool {
        match self.loading.get(key) {
            Some(entry) => scope.is_none_or(|scope| entry.scopes.contains(&scope)),
            None => false,
        }
    }

    /// True while anything is mid-fetch, mid-reload, or still draining the
    /// unload queue.
    pub fn is_loading_any(&self) -> bool {
        !self.loading.is_empty()
            || !self.reloading.is_empty()
            || !self.unloading.is_empty()
            || self.engine.queued() > 0
    }

    pub fn is_unloading(&self) -> bool {
        !self.unloading.is_empty()
    }

    fn is_tracked(&self, key: &D::Key) -> bool {
        self.loading.contains_key(key)
            || self.loaded.contains_key(key)
            || self.unloading.iter().any(|pending| &pending.key == key)
    }

    /// The loaded payload, `None` while absent or still loading. Never
    /// blocks.
    pub fn get(&self, key: &D::Key) -> Option<Arc<dyn Resource>> {
        self.loaded.get(key).and_then(|entry| entry.payload.clone())
    }

    /// Every loaded payload of the given type.
    pub fn get_all_of(&self, type_tag: TypeTag) -> Vec<Arc<dyn Resource>> {
        self.loaded
            .values()
            .filter(|entry| entry.type_tag == type_tag)
            .filter_map(|entry| entry.payload.clone())
            .collect_vec()
    }

    pub fn loaded_count(&self) -> usize {
        self.loaded.len()
    }

    /// Keys whose load failed unrecoverably since the last call. Consumed by
    /// the dependency resolver to prune its awaiting list.
    pub fn take_failed(&mut self) -> Vec<D::Key> {
        std::mem::take(&mut self.failed)
    }

    /// Advances every queue by one tick: polls the engine (dispatching
    /// failures to the domain hook), collects recovery outcomes, drains the
    /// readiness-gated unload queue, advances reload tickets and promotes
    /// finished loads. Returns `true` iff no work remains anywhere.
    pub fn update(&mut self) -> Result<bool, CacheError> {
        // Engine completions; each failure goes through the domain hook and
        // either turns into a background recovery or propagates.
        loop {
            match self.engine.update() {
                Ok(()) => break,
                Err(error) => self.dispatch_failure(error)?,
            }
        }

        // Recovery outcomes: a successful redownload retries the original
        // load from storage, a failed one drops the entry.
        for (key, success) in self.domain.poll_recoveries() {
            if success {
                if let Some(entry) = self.loading.get(&key) {
                    self.engine.submit(&entry.locator, entry.type_tag, self.domain.parameters(&key));
                }
            } else {
                self.loading.remove(&key);
                self.failed.push(key);
            }
        }

        // Unload queue: free what the readiness predicates allow, retry the
        // rest next tick.
        let unload_ready = Arc::clone(&self.unload_ready);
        self.unloading.retain(|pending| {
            if unload_ready.is_ready(pending.type_tag, pending.payload.as_ref()) {
                debug!("unloaded {}", pending.key);
                false
            } else {
                trace!("{} is not ready to unload, retrying next tick", pending.key);
                true
            }
        });

        // Reload queue: issue the fresh fetch, then merge once it finished.
        let mut index = 0;
        while index < self.reloading.len() {
            let ticket = &mut self.reloading[index];
            match ticket.phase {
                ReloadPhase::Unloading => {
                    self.engine.submit(&ticket.locator, ticket.type_tag, ticket.params.clone());
                    ticket.phase = ReloadPhase::Loading;
                    index += 1;
                }
                ReloadPhase::Loading => {
                    if let Some(fresh) = self.engine.take_finished(&ticket.locator) {
                        ticket.old.merge(fresh.as_ref());
                        debug!("reloaded {}", ticket.key);
                        self.reloading.remove(index);
                    } else {
                        index += 1;
                    }
                }
            }
        }

        // Promote finished loads, or divert them straight to the unload
        // queue when every scope already left.
        let finished = self
            .loading
            .iter()
            .filter(|(_, entry)| self.engine.is_finished(&entry.locator))
            .map(|(key, _)| key.clone())
            .collect_vec();
        for key in finished {
            let mut entry = self.loading.remove(&key).expect("key collected above");
            entry.payload = self.engine.take_finished(&entry.locator);
            if entry.scopes.is_empty() || entry.unload_when_loaded {
                debug!("{}: no scopes left after load, unloading", key);
                self.unloading.push(UnloadingEntry::from_entry(entry));
            } else {
                debug!("{} loaded (scope count: {})", key, entry.scopes.len());
                self.loaded.insert(key, entry);
            }
        }

        Ok(self.loading.is_empty()
            && self.unloading.is_empty()
            && self.reloading.is_empty()
            && self.engine.queued() == 0)
    }

    /// Drives [`update`](Self::update) until it reports idle, sleeping
    /// briefly between iterations. For callers off the primary loop that
    /// must not proceed before the cache drained. No timeout.
    pub fn wait_until_idle(&mut self) -> Result<(), CacheError> {
        while !self.update()? {
            std::thread::sleep(POLL_INTERVAL);
        }
        Ok(())
    }

    fn dispatch_failure(&mut self, error: CacheError) -> Result<(), CacheError> {
        let Some(locator) = error.locator().map(str::to_owned) else {
            return Err(error);
        };

        // An in-flight load owns this locator?
        let loading_key = self
            .loading
            .iter()
            .find(|(_, entry)| entry.locator == locator)
            .map(|(key, _)| key.clone());
        if let Some(key) = loading_key {
            return match self.domain.handle_failure(&key, &error) {
                FailureDisposition::Recovering => Ok(()),
                FailureDisposition::Fail => {
                    self.loading.remove(&key);
                    self.failed.push(key);
                    Err(error)
                }
            };
        }

        // A reload ticket then; its old payload simply stays as it was.
        if let Some(position) = self
            .reloading
            .iter()
            .position(|ticket| ticket.locator == locator && matches!(ticket.phase, ReloadPhase::Loading))
        {
            let ticket = self.reloading.remove(position);
            error!("reload of {} failed: {}", ticket.key, error);
            return Err(error);
        }

        Err(error)
    }
}

impl ScopedCache<ExternalDomain> {
    /// Normalizes the requested revision into the key identity actually
    /// cached.
    pub fn key_for(&self, id: ResourceId, revision: Revision) -> ExternalKey {
        self.domain.normalize(id, revision)
    }

    pub fn load_resource(&mut self, scope: ScopeHandle, id: ResourceId, revision: Revision) -> Result<(), CacheError> {
        let key = self.key_for(id, revision);
        self.load(scope, key)
    }

    pub fn is_loaded_resource(&self, scope: Option<ScopeHandle>, id: ResourceId, revision: Revision) -> bool {
        self.is_loaded(scope, &self.key_for(id, revision))
    }

    pub fn is_loading_resource(&self, scope: Option<ScopeHandle>, id: ResourceId, revision: Revision) -> bool {
        self.is_loading(scope, &self.key_for(id, revision))
    }

    pub fn get_resource(&self, id: ResourceId, revision: Revision) -> Option<Arc<dyn Resource>> {
        self.get(&self.key_for(id, revision))
    }

    pub fn unload_resource(&mut self, id: ResourceId, revision: Revision) -> Result<(), CacheError> {
        let key = self.key_for(id, revision);
        self.unload(&key)
    }

    /// Reloads the tip of `id`, e.g. after sync wrote a new revision behind
    /// our back.
    pub fn reload_resource(&mut self, id: ResourceId) -> Result<(), CacheError> {
        self.reload(&ExternalKey::latest(id))
    }

    /// Promotes a freshly synced tip: drops the loaded `old_revision` entry
    /// and refetches the Latest slot, merging into its payload so holders of
    /// either reference observe the new contents. Blocking.
    pub fn promote_latest(&mut self, id: ResourceId, old_revision: u32) -> Result<(), CacheError> {
        let latest = ExternalKey::latest(id);
        if !self.loaded.contains_key(&latest) {
            return Err(CacheError::InvalidState(format!(
                "promote_latest({}) called but the latest revision is not loaded",
                id
            )));
        }

        let old_payload = match self.loaded.remove(&ExternalKey::new(id, Revision::At(old_revision))) {
            Some(entry) => {
                debug!("promote_latest({}): dropping old revision r{}", id, old_revision);
                let payload = entry.payload.clone();
                self.unloading.push(UnloadingEntry::from_entry(entry));
                payload
            }
            None => None,
        };

        self.reload(&latest)?;

        // Holders of the old revision switch to the new tip as well.
        if let Some(old_payload) = old_payload
            && let Some(fresh) = self.get(&latest)
        {
            old_payload.merge(fresh.as_ref());
        }
        Ok(())
    }
}

impl ScopedCache<InternalDomain> {
    /// Hot-swaps the backing resource of a loaded static name with another
    /// name's file. The entry keeps its name and payload identity; only the
    /// contents change. Blocking, like
    /// [`reload`](ScopedCache::reload).
    pub fn replace(&mut self, old: &InternalName, new: &InternalName) -> Result<(), CacheError> {
        if old.type_tag() != new.type_tag() {
            return Err(CacheError::InvalidState(format!(
                "replace({}, {}): type mismatch ({} vs {})",
                old,
                new,
                old.type_tag(),
                new.type_tag()
            )));
        }
        let entry = self.loaded.get(old).ok_or_else(|| {
            CacheError::InvalidState(format!("replace({}) called but the resource is not loaded", old))
        })?;
        let ticket = ReloadTicket {
            key: old.clone(),
            locator: self.domain.locator(new),
            type_tag: new.type_tag(),
            params: None,
            old: entry.payload.clone().expect("loaded entry without a payload"),
            phase: ReloadPhase::Unloading,
        };
        self.reloading.push(ticket);
        self.drive_reloads()
    }
}
