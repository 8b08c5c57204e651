//! The two cache domains. Both are instances of the same
//! [`ScopedCache`](super::ScopedCache) contract; only identity, path
//! resolution and failure handling differ.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, channel};

use log::{error, warn};

use crate::collaborators::{ContentIndex, RecoveryClient};
use crate::error::CacheError;
use crate::identifier::{ExternalKey, InternalName, ResourceId, Revision, TypeTag};

/// What the cache should do with a failed load.
pub enum FailureDisposition {
    /// A recovery job was started; keep the entry in Loading and wait for
    /// [`CacheDomain::poll_recoveries`].
    Recovering,
    /// Unrecoverable; drop the entry and propagate the error.
    Fail,
}

/// Capability set a cache domain provides: identity, type and path
/// resolution, optional load parameters, and the failure-handling hook.
pub trait CacheDomain {
    type Key: Clone + Eq + Hash + fmt::Display;

    fn type_of(&self, key: &Self::Key) -> Result<TypeTag, CacheError>;

    /// Storage locator for the key. Derived once per entry and immutable
    /// afterwards.
    fn locator(&self, key: &Self::Key) -> String;

    fn parameters(&self, _key: &Self::Key) -> Option<serde_json::Value> {
        None
    }

    /// Called when the load job for `key` fails. Returning `Recovering`
    /// means the domain started a background recovery and the entry stays
    /// in Loading.
    fn handle_failure(&mut self, key: &Self::Key, error: &CacheError) -> FailureDisposition;

    /// Outcomes of recoveries started by `handle_failure`: `(key, success)`.
    fn poll_recoveries(&mut self) -> Vec<(Self::Key, bool)>;
}

/// Domain of externally sourced, revisioned content. Identity is
/// (id, revision); missing/corrupt files are redownloaded when online.
pub struct ExternalDomain {
    index: Arc<dyn ContentIndex>,
    recovery: Arc<dyn RecoveryClient>,
    recovered_tx: Sender<(ExternalKey, bool)>,
    recovered_rx: Receiver<(ExternalKey, bool)>,
    /// Keys with a redownload currently in flight.
    redownloading: Vec<ExternalKey>,
}

impl ExternalDomain {
    pub fn new(index: Arc<dyn ContentIndex>, recovery: Arc<dyn RecoveryClient>) -> Self {
        let (recovered_tx, recovered_rx) = channel();
        Self {
            index,
            recovery,
            recovered_tx,
            recovered_rx,
            redownloading: Vec::new(),
        }
    }

    pub fn index(&self) -> &Arc<dyn ContentIndex> {
        &self.index
    }

    /// Normalizes a requested revision against the index: anything at or
    /// beyond the newest known revision (and anything non-positive)
    /// collapses to `Latest`, so only one entry tracks the tip.
    pub fn normalize(&self, id: ResourceId, revision: Revision) -> ExternalKey {
        let revision = match revision {
            Revision::At(requested) => match self.index.latest_revision(&id) {
                Some(latest) if requested < latest => Revision::At(requested),
                _ => Revision::Latest,
            },
            Revision::Latest => Revision::Latest,
        };
        ExternalKey::new(id, revision)
    }
}

impl CacheDomain for ExternalDomain {
    type Key = ExternalKey;

    fn type_of(&self, key: &Self::Key) -> Result<TypeTag, CacheError> {
        self.index.type_of(&key.id).ok_or_else(|| CacheError::NotFound {
            locator: key.id.to_string(),
        })
    }

    fn locator(&self, key: &Self::Key) -> String {
        match key.revision {
            Revision::Latest => self.index.filepath(&key.id),
            Revision::At(revision) => self.index.revision_filepath(&key.id, revision),
        }
    }

    fn handle_failure(&mut self, key: &Self::Key, error: &CacheError) -> FailureDisposition {
        if !error.is_recoverable() {
            return FailureDisposition::Fail;
        }

        if !self.recovery.is_online() {
            error!("found a corrupt or missing file for {}, offline - aborting load", key);
            return FailureDisposition::Fail;
        }

        warn!("found a corrupt or missing file for {}, redownloading", key);
        self.redownloading.push(*key);

        let recovery = self.recovery.clone();
        let tx = self.recovered_tx.clone();
        let key = *key;
        std::thread::Builder::new()
            .name("redownload".into())
            .spawn(move || {
                let success = recovery.redownload(key.id, key.revision);
                // Domain may be gone by the time the download ends.
                let _ = tx.send((key, success));
            })
            .expect("Failed to spawn the redownload thread");

        FailureDisposition::Recovering
    }

    fn poll_recoveries(&mut self) -> Vec<(Self::Key, bool)> {
        let mut outcomes = Vec::new();
        while let Ok((key, success)) = self.recovered_rx.try_recv() {
            if let Some(position) = self.redownloading.iter().position(|pending| *pending == key) {
                self.redownloading.swap_remove(position);
                if success {
                    warn!("redownload of {} successful, retrying load", key);
                } else {
                    error!("failed to redownload {}", key);
                }
                outcomes.push((key, success));
            } else {
                error!("got a redownload outcome for {} which was not redownloading", key);
            }
        }
        outcomes
    }
}

/// Domain of statically named engine assets. No revisions, no recovery;
/// the type is carried by the name itself.
pub struct InternalDomain {
    /// Prefix put in front of every internal path, e.g. the data directory.
    root: String,
}

impl InternalDomain {
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }
}

impl CacheDomain for InternalDomain {
    type Key = InternalName;

    fn type_of(&self, key: &Self::Key) -> Result<TypeTag, CacheError> {
        Ok(key.type_tag())
    }

    fn locator(&self, key: &Self::Key) -> String {
        if self.root.is_empty() {
            key.path().to_owned()
        } else {
            format!("{}/{}", self.root, key.path())
        }
    }

    fn handle_failure(&mut self, _key: &Self::Key, _error: &CacheError) -> FailureDisposition {
        // Internal assets ship with the engine; a broken one is fatal.
        FailureDisposition::Fail
    }

    fn poll_recoveries(&mut self) -> Vec<(Self::Key, bool)> {
        Vec::new()
    }
}
