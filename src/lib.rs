//! Scoped, dependency-aware resource cache for game assets.
//!
//! Consumers load resources by id into a [`ScopeHandle`] (a screen, a
//! scene); the cache fetches and deserializes the bytes on a background
//! worker, resolves each resource's declared dependency closure, and unloads
//! entries exactly when no scope references them any more. Everything is
//! driven by calling [`CacheFacade::update`] once per tick from the host
//! loop.

pub mod cache;
pub mod collaborators;
pub mod deps;
pub mod engine;
pub mod error;
pub mod facade;
pub mod identifier;
pub mod resource;

#[cfg(test)]
pub(crate) mod testutil;

pub use cache::{ScopedCache, UnloadReadyRegistry};
pub use collaborators::{ContentIndex, RecoveryClient, Storage};
pub use deps::DependencyResolver;
pub use engine::{DeserializerRegistry, LoadEngine};
pub use error::{CacheError, FetchError};
pub use facade::CacheFacade;
pub use identifier::{ExternalKey, InternalName, ResourceId, Revision, ScopeHandle, TypeTag};
pub use resource::{DependencyDeclaring, Deserializer, Resource};
