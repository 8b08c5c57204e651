use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque id of an externally sourced (user/content) resource.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct ResourceId(Uuid);

impl ResourceId {
    pub fn random() -> Self {
        ResourceId(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        ResourceId(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Revision of an external resource. `Latest` is a sentinel that is
/// normalized against the content index at load time: a request for the
/// newest known revision collapses to `Latest`, so only one entry per
/// resource tracks the tip.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Revision {
    Latest,
    At(u32),
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Revision::Latest => write!(f, "latest"),
            Revision::At(revision) => write!(f, "r{}", revision),
        }
    }
}

/// Identity of a cache entry in the external domain.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ExternalKey {
    pub id: ResourceId,
    pub revision: Revision,
}

impl ExternalKey {
    pub fn new(id: ResourceId, revision: Revision) -> Self {
        Self { id, revision }
    }

    pub fn latest(id: ResourceId) -> Self {
        Self {
            id,
            revision: Revision::Latest,
        }
    }
}

impl fmt::Display for ExternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.revision)
    }
}

/// Names a resource type; keys the deserializer registry and the
/// unload-readiness registry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TypeTag(&'static str);

impl TypeTag {
    pub const fn new(name: &'static str) -> Self {
        TypeTag(name)
    }

    pub fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Identity of a cache entry in the internal domain: a static path plus the
/// type it deserializes into. Internal resources have no revisions and are
/// assumed to be dependency-free leaves.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct InternalName {
    path: String,
    type_tag: TypeTag,
}

impl InternalName {
    pub fn new(path: impl Into<String>, type_tag: TypeTag) -> Self {
        Self {
            path: path.into(),
            type_tag,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn type_tag(&self) -> TypeTag {
        self.type_tag
    }
}

impl fmt::Display for InternalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

static NEXT_SCOPE: AtomicU64 = AtomicU64::new(1);

/// A consumer-defined lifetime boundary (e.g. a screen). Entries stay loaded
/// while at least one scope references them.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ScopeHandle(u64);

impl ScopeHandle {
    /// Allocates a process-wide unique handle.
    pub fn allocate() -> Self {
        ScopeHandle(NEXT_SCOPE.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ScopeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope#{}", self.0)
    }
}
