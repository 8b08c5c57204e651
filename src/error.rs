use thiserror::Error;

use crate::identifier::{ResourceId, TypeTag};

/// Errors surfacing out of the cache, mostly from `update()` calls.
///
/// `NotFound` and `Corrupt` are recoverable in the external domain while the
/// recovery client is online; everything else propagates to the caller.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("resource not found in storage: {locator}")]
    NotFound { locator: String },

    #[error("resource at {locator} is corrupt: {reason}")]
    Corrupt { locator: String, reason: String },

    #[error("dependency of {id} could not be resolved")]
    DependencyUnresolvable {
        id: ResourceId,
        #[source]
        source: Box<CacheError>,
    },

    #[error("no deserializer registered for resource type {type_tag}")]
    UnknownType { locator: String, type_tag: TypeTag },

    #[error("invalid cache state: {0}")]
    InvalidState(String),
}

impl CacheError {
    /// The storage locator the failure happened at, if it came from a load job.
    pub fn locator(&self) -> Option<&str> {
        match self {
            CacheError::NotFound { locator } => Some(locator),
            CacheError::Corrupt { locator, .. } => Some(locator),
            CacheError::UnknownType { locator, .. } => Some(locator),
            CacheError::DependencyUnresolvable { .. } | CacheError::InvalidState(_) => None,
        }
    }

    /// True for the failure classes the external domain may redownload.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CacheError::NotFound { .. } | CacheError::Corrupt { .. })
    }
}

/// Failure classes of the storage seam, converted into [`CacheError`] with the
/// locator attached by the load engine.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("no such file")]
    NotFound,
    #[error("unreadable bytes: {0}")]
    Corrupt(String),
}
