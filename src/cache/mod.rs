pub mod domain;
pub mod scoped;
pub mod unload;

pub use domain::{CacheDomain, ExternalDomain, FailureDisposition, InternalDomain};
pub use scoped::ScopedCache;
pub use unload::UnloadReadyRegistry;
