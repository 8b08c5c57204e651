//! Contracts for the collaborators the cache consumes but does not own:
//! the storage medium, the local content index and the remote recovery
//! client. The host wires concrete implementations into
//! [`CacheFacade::new`](crate::facade::CacheFacade::new).

use crate::error::FetchError;
use crate::identifier::{ResourceId, Revision, TypeTag};

/// The storage medium resources are fetched from (local filesystem, archive,
/// blob store). Paths are the opaque locators produced by the cache domains.
pub trait Storage: Send + Sync {
    fn exists(&self, path: &str) -> bool;

    fn fetch(&self, path: &str) -> Result<Vec<u8>, FetchError>;
}

/// The local bookkeeping index for external resources: which type an id
/// deserializes into, which revision is the newest, where revisions live on
/// storage, and which ids exist per type.
pub trait ContentIndex: Send + Sync {
    fn type_of(&self, id: &ResourceId) -> Option<TypeTag>;

    /// The newest known revision of `id`, `None` if the id is unknown or
    /// unrevisioned.
    fn latest_revision(&self, id: &ResourceId) -> Option<u32>;

    /// Locator of the tip of `id` (the "latest" slot).
    fn filepath(&self, id: &ResourceId) -> String;

    /// Locator of one concrete revision of `id`.
    fn revision_filepath(&self, id: &ResourceId, revision: u32) -> String;

    /// Every known id of the given type, for bulk loads.
    fn all_of(&self, type_tag: TypeTag) -> Vec<ResourceId>;
}

/// Remote recovery for the external domain: when a fetch reports a missing
/// or corrupt file and we are online, the cache asks this client to fetch a
/// pristine copy into storage, then retries the original load.
pub trait RecoveryClient: Send + Sync {
    fn is_online(&self) -> bool;

    /// Re-fetches `id` at `revision` into local storage. Blocking; the
    /// cache calls this from a background thread. Returns whether the
    /// download succeeded.
    fn redownload(&self, id: ResourceId, revision: Revision) -> bool;
}
