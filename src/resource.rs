use std::any::Any;

use crate::identifier::{InternalName, ResourceId};

/// A loaded, cacheable object.
///
/// Implementors that want to survive [`reload`](crate::cache::ScopedCache::reload)
/// must keep their mutable state behind interior mutability (e.g. `RwLock`
/// fields), because `merge` updates the contents of an already shared
/// `Arc<dyn Resource>` in place. Holders keep their reference; only the
/// contents change.
pub trait Resource: Any + Send + Sync {
    /// Replaces this resource's contents with `newer`'s. Called with the
    /// freshly deserialized resource after a reload; implementations should
    /// ignore a `newer` of a different concrete type.
    fn merge(&self, newer: &dyn Resource);

    /// Capability probe: resources that declare dependencies return
    /// themselves here. Checked once per load by the dependency resolver.
    fn dependencies(&self) -> Option<&dyn DependencyDeclaring> {
        None
    }

    fn as_any(&self) -> &dyn Any;
}

impl dyn Resource {
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

/// Dependency declarations embedded in a serialized resource. Read only
/// after the resource itself finished loading.
pub trait DependencyDeclaring {
    /// External dependencies with their use count inside the declaring
    /// resource (the count is bookkeeping for editors, the cache loads each
    /// id once regardless).
    fn external_dependencies(&self) -> Vec<(ResourceId, u32)>;

    fn internal_dependencies(&self) -> Vec<InternalName>;
}

/// Turns fetched bytes into a resource. One deserializer is registered per
/// [`TypeTag`](crate::identifier::TypeTag) on the load engine.
pub trait Deserializer: Send + Sync {
    /// `params` are the opaque per-load parameters the domain resolved for
    /// this key, if any.
    fn deserialize(&self, bytes: &[u8], params: Option<&serde_json::Value>) -> anyhow::Result<Box<dyn Resource>>;
}
