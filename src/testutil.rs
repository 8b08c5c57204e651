//! Shared fixtures: an in-memory storage, a scripted content index and
//! recovery client, and serde_json-backed test resources.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::{ExternalDomain, InternalDomain, ScopedCache, UnloadReadyRegistry};
use crate::collaborators::{ContentIndex, RecoveryClient, Storage};
use crate::engine::{DeserializerRegistry, LoadEngine};
use crate::error::{CacheError, FetchError};
use crate::identifier::{InternalName, ResourceId, Revision, TypeTag};
use crate::resource::{DependencyDeclaring, Deserializer, Resource};

pub const JSON_DEF: TypeTag = TypeTag::new("def");
pub const TEXTURE: TypeTag = TypeTag::new("texture");

pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Locator scheme shared by [`TestIndex`] and [`TestRecovery`].
pub fn latest_path(id: &ResourceId) -> String {
    format!("external/{}", id)
}

pub fn revision_path(id: &ResourceId, revision: u32) -> String {
    format!("external/{}.r{}", id, revision)
}

// ---------------------------------------------------------------------------
// Storage

pub struct MapStorage {
    files: RwLock<HashMap<String, Vec<u8>>>,
}

impl MapStorage {
    pub fn new() -> Self {
        Self {
            files: RwLock::new(HashMap::new()),
        }
    }

    pub fn put(&self, path: impl Into<String>, bytes: Vec<u8>) {
        self.files.write().unwrap().insert(path.into(), bytes);
    }
}

impl Storage for MapStorage {
    fn exists(&self, path: &str) -> bool {
        self.files.read().unwrap().contains_key(path)
    }

    fn fetch(&self, path: &str) -> Result<Vec<u8>, FetchError> {
        self.files.read().unwrap().get(path).cloned().ok_or(FetchError::NotFound)
    }
}

/// Filesystem-backed storage for the tempdir test.
pub struct DirStorage {
    root: PathBuf,
}

impl DirStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Storage for DirStorage {
    fn exists(&self, path: &str) -> bool {
        self.root.join(path).is_file()
    }

    fn fetch(&self, path: &str) -> Result<Vec<u8>, FetchError> {
        std::fs::read(self.root.join(path)).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => FetchError::NotFound,
            _ => FetchError::Corrupt(e.to_string()),
        })
    }
}

// ---------------------------------------------------------------------------
// Resources

#[derive(Clone, Serialize, Deserialize)]
struct DefData {
    value: String,
    #[serde(default)]
    external: Vec<Uuid>,
    #[serde(default)]
    internal: Vec<String>,
}

/// A definition resource: a value plus declared dependencies, stored as
/// JSON. Mutable state lives behind a lock so `merge` can update shared
/// instances in place.
pub struct TestDef {
    inner: RwLock<DefData>,
}

impl TestDef {
    pub fn plain(value: impl Into<String>) -> Self {
        Self::with_deps(value, Vec::new(), Vec::new())
    }

    pub fn with_deps(value: impl Into<String>, external: Vec<ResourceId>, internal: Vec<&str>) -> Self {
        Self {
            inner: RwLock::new(DefData {
                value: value.into(),
                external: external.into_iter().map(|id| *id.as_uuid()).collect(),
                internal: internal.into_iter().map(str::to_owned).collect(),
            }),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&*self.inner.read().unwrap()).unwrap()
    }

    pub fn value(&self) -> String {
        self.inner.read().unwrap().value.clone()
    }
}

impl Resource for TestDef {
    fn merge(&self, newer: &dyn Resource) {
        if let Some(newer) = newer.downcast_ref::<TestDef>() {
            *self.inner.write().unwrap() = newer.inner.read().unwrap().clone();
        }
    }

    fn dependencies(&self) -> Option<&dyn DependencyDeclaring> {
        Some(self)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl DependencyDeclaring for TestDef {
    fn external_dependencies(&self) -> Vec<(ResourceId, u32)> {
        self.inner
            .read()
            .unwrap()
            .external
            .iter()
            .map(|uuid| (ResourceId::from_uuid(*uuid), 1))
            .collect()
    }

    fn internal_dependencies(&self) -> Vec<InternalName> {
        self.inner
            .read()
            .unwrap()
            .internal
            .iter()
            .map(|path| InternalName::new(path.clone(), TEXTURE))
            .collect()
    }
}

/// A leaf resource holding raw bytes, used for internal assets.
pub struct TestTexture {
    data: RwLock<Vec<u8>>,
}

impl TestTexture {
    pub fn data(&self) -> Vec<u8> {
        self.data.read().unwrap().clone()
    }
}

impl Resource for TestTexture {
    fn merge(&self, newer: &dyn Resource) {
        if let Some(newer) = newer.downcast_ref::<TestTexture>() {
            *self.data.write().unwrap() = newer.data.read().unwrap().clone();
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

pub struct DefDeserializer;

impl Deserializer for DefDeserializer {
    fn deserialize(&self, bytes: &[u8], _params: Option<&serde_json::Value>) -> anyhow::Result<Box<dyn Resource>> {
        let data: DefData = serde_json::from_slice(bytes)?;
        Ok(Box::new(TestDef {
            inner: RwLock::new(data),
        }))
    }
}

pub struct TextureDeserializer;

impl Deserializer for TextureDeserializer {
    fn deserialize(&self, bytes: &[u8], _params: Option<&serde_json::Value>) -> anyhow::Result<Box<dyn Resource>> {
        Ok(Box::new(TestTexture {
            data: RwLock::new(bytes.to_vec()),
        }))
    }
}

pub fn json_deserializers() -> Arc<DeserializerRegistry> {
    let registry = Arc::new(DeserializerRegistry::new());
    registry.register(JSON_DEF, Arc::new(DefDeserializer));
    registry.register(TEXTURE, Arc::new(TextureDeserializer));
    registry
}

// ---------------------------------------------------------------------------
// Index and recovery

struct IndexEntry {
    type_tag: TypeTag,
    latest: u32,
}

pub struct TestIndex {
    entries: RwLock<HashMap<ResourceId, IndexEntry>>,
}

impl TestIndex {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn add(&self, id: ResourceId, type_tag: TypeTag, latest: u32) {
        self.entries.write().unwrap().insert(id, IndexEntry { type_tag, latest });
    }
}

impl ContentIndex for TestIndex {
    fn type_of(&self, id: &ResourceId) -> Option<TypeTag> {
        self.entries.read().unwrap().get(id).map(|entry| entry.type_tag)
    }

    fn latest_revision(&self, id: &ResourceId) -> Option<u32> {
        self.entries.read().unwrap().get(id).map(|entry| entry.latest)
    }

    fn filepath(&self, id: &ResourceId) -> String {
        latest_path(id)
    }

    fn revision_filepath(&self, id: &ResourceId, revision: u32) -> String {
        revision_path(id, revision)
    }

    fn all_of(&self, type_tag: TypeTag) -> Vec<ResourceId> {
        self.entries
            .read()
            .unwrap()
            .iter()
            .filter(|(_, entry)| entry.type_tag == type_tag)
            .map(|(id, _)| *id)
            .collect()
    }
}

/// Scripted recovery client: repairs are bytes that get written into the
/// shared storage when `redownload` is asked for the matching id.
pub struct TestRecovery {
    online: bool,
    storage: Arc<MapStorage>,
    repairs: RwLock<HashMap<ResourceId, Vec<u8>>>,
    calls: AtomicUsize,
}

impl TestRecovery {
    pub fn online(storage: Arc<MapStorage>) -> Self {
        Self {
            online: true,
            storage,
            repairs: RwLock::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn offline(storage: Arc<MapStorage>) -> Self {
        Self {
            online: false,
            ..Self::online(storage)
        }
    }

    pub fn plan_repair(&self, id: ResourceId, bytes: Vec<u8>) {
        self.repairs.write().unwrap().insert(id, bytes);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RecoveryClient for TestRecovery {
    fn is_online(&self) -> bool {
        self.online
    }

    fn redownload(&self, id: ResourceId, revision: Revision) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.repairs.read().unwrap().get(&id) {
            Some(bytes) => {
                let path = match revision {
                    Revision::Latest => latest_path(&id),
                    Revision::At(revision) => revision_path(&id, revision),
                };
                self.storage.put(path, bytes.clone());
                true
            }
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Cache fixtures

pub fn external_cache(
    storage: Arc<MapStorage>,
    index: Arc<TestIndex>,
    recovery: Arc<TestRecovery>,
) -> ScopedCache<ExternalDomain> {
    external_cache_gated(storage, index, recovery, Arc::new(UnloadReadyRegistry::new()))
}

pub fn external_cache_gated(
    storage: Arc<MapStorage>,
    index: Arc<TestIndex>,
    recovery: Arc<TestRecovery>,
    unload_ready: Arc<UnloadReadyRegistry>,
) -> ScopedCache<ExternalDomain> {
    ScopedCache::new(
        ExternalDomain::new(index, recovery),
        LoadEngine::new("external-test", storage, json_deserializers()),
        unload_ready,
    )
}

pub fn internal_cache(storage: Arc<MapStorage>, unload_ready: Arc<UnloadReadyRegistry>) -> ScopedCache<InternalDomain> {
    ScopedCache::new(
        InternalDomain::new(""),
        LoadEngine::new("internal-test", storage, json_deserializers()),
        unload_ready,
    )
}

/// Writes `def` to the latest slot of `id` and registers it in the index.
pub fn put_def(storage: &MapStorage, index: &TestIndex, id: ResourceId, def: &TestDef) {
    storage.put(latest_path(&id), def.to_bytes());
    index.add(id, JSON_DEF, 1);
}

// ---------------------------------------------------------------------------
// Drive helpers

/// Ticks `update` until it reports idle, with a generous timeout so a broken
/// state machine fails the test instead of hanging it.
pub fn drive(mut update: impl FnMut() -> Result<bool, CacheError>) {
    try_drive(&mut update).expect("update failed while driving to idle");
}

pub fn try_drive(update: &mut impl FnMut() -> Result<bool, CacheError>) -> Result<(), CacheError> {
    for _ in 0..5000 {
        if update()? {
            return Ok(());
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    panic!("cache did not reach idle in time");
}

/// Drives until `update` returns an error, which is handed back.
pub fn drive_until_error(mut update: impl FnMut() -> Result<bool, CacheError>) -> CacheError {
    for _ in 0..5000 {
        match update() {
            Ok(_) => std::thread::sleep(std::time::Duration::from_millis(1)),
            Err(error) => return error,
        }
    }
    panic!("expected an error but the cache stayed healthy");
}
