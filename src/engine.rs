//! The asynchronous load primitive: a background worker that fetches bytes
//! from storage and deserializes them, handing completed resources back
//! through a completion channel that [`update`](LoadEngine::update) drains
//! on the cooperative tick.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;

use log::{debug, trace, warn};

use crate::collaborators::Storage;
use crate::error::{CacheError, FetchError};
use crate::identifier::TypeTag;
use crate::resource::{Deserializer, Resource};

/// Deserializers by type tag, shared between the engine owner and its worker
/// thread. Registration after worker start is fine; jobs observe whatever is
/// registered when they run.
pub struct DeserializerRegistry {
    deserializers: RwLock<HashMap<TypeTag, Arc<dyn Deserializer>>>,
}

impl DeserializerRegistry {
    pub fn new() -> Self {
        Self {
            deserializers: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, type_tag: TypeTag, deserializer: Arc<dyn Deserializer>) {
        self.deserializers
            .write()
            .expect("deserializer registry lock poisoned")
            .insert(type_tag, deserializer);
    }

    fn get(&self, type_tag: TypeTag) -> Option<Arc<dyn Deserializer>> {
        self.deserializers
            .read()
            .expect("deserializer registry lock poisoned")
            .get(&type_tag)
            .cloned()
    }
}

impl Default for DeserializerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

struct LoadJob {
    locator: String,
    type_tag: TypeTag,
    params: Option<serde_json::Value>,
}

struct JobOutcome {
    locator: String,
    result: Result<Box<dyn Resource>, CacheError>,
}

/// One engine per cache domain. All methods are non-blocking; progress is
/// made by the worker thread and observed through [`update`](Self::update).
pub struct LoadEngine {
    job_tx: Option<Sender<LoadJob>>,
    done_rx: Receiver<JobOutcome>,
    worker: Option<JoinHandle<()>>,
    /// Locators submitted but not yet completed (successfully or not).
    in_flight: HashSet<String>,
    /// Completed payloads waiting for the cache to take them.
    finished: HashMap<String, Arc<dyn Resource>>,
    /// Completed failures, surfaced one per `update()` call.
    failures: VecDeque<CacheError>,
    submitted: usize,
    completed: usize,
}

impl LoadEngine {
    pub fn new(name: &str, storage: Arc<dyn Storage>, deserializers: Arc<DeserializerRegistry>) -> Self {
        let (job_tx, job_rx) = channel::<LoadJob>();
        let (done_tx, done_rx) = channel::<JobOutcome>();

        let worker = std::thread::Builder::new()
            .name(format!("loader-{}", name))
            .spawn(move || worker_loop(job_rx, done_tx, storage, deserializers))
            .expect("Failed to spawn the loader thread");

        Self {
            job_tx: Some(job_tx),
            done_rx,
            worker: Some(worker),
            in_flight: HashSet::new(),
            finished: HashMap::new(),
            failures: VecDeque::new(),
            submitted: 0,
            completed: 0,
        }
    }

    /// Queues a fetch+deserialize job. A locator that is already in flight
    /// or already finished is not submitted again; all callers share the one
    /// eventual result.
    pub fn submit(&mut self, locator: &str, type_tag: TypeTag, params: Option<serde_json::Value>) {
        if self.in_flight.contains(locator) || self.finished.contains_key(locator) {
            trace!("submit({}): already in flight, coalescing", locator);
            return;
        }

        trace!("submit({}) as {}", locator, type_tag);
        self.in_flight.insert(locator.to_owned());
        self.submitted += 1;
        self.job_tx
            .as_ref()
            .expect("engine used after shutdown")
            .send(LoadJob {
                locator: locator.to_owned(),
                type_tag,
                params,
            })
            .expect("loader thread hung up");
    }

    /// Drains the completion queue. Successful payloads become takeable via
    /// [`take_finished`](Self::take_finished); the first pending failure is
    /// returned (one per call, so the owning cache can dispatch each to its
    /// domain's failure hook in turn).
    pub fn update(&mut self) -> Result<(), CacheError> {
        while let Ok(outcome) = self.done_rx.try_recv() {
            self.in_flight.remove(&outcome.locator);
            self.completed += 1;
            match outcome.result {
                Ok(resource) => {
                    debug!("finished loading {}", outcome.locator);
                    self.finished.insert(outcome.locator, Arc::from(resource));
                }
                Err(error) => {
                    warn!("load of {} failed: {}", outcome.locator, error);
                    self.failures.push_back(error);
                }
            }
        }

        match self.failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    pub fn is_finished(&self, locator: &str) -> bool {
        self.finished.contains_key(locator)
    }

    pub fn take_finished(&mut self, locator: &str) -> Option<Arc<dyn Resource>> {
        self.finished.remove(locator)
    }

    /// Jobs submitted but not yet drained into the finished map, including
    /// failures that have not been surfaced yet.
    pub fn queued(&self) -> usize {
        self.in_flight.len() + self.failures.len()
    }

    pub fn submitted(&self) -> usize {
        self.submitted
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    /// Completion ratio in `[0, 1]` over everything ever submitted.
    pub fn progress(&self) -> f32 {
        if self.submitted == 0 {
            1.0
        } else {
            self.completed as f32 / self.submitted as f32
        }
    }
}

impl Drop for LoadEngine {
    fn drop(&mut self) {
        // Closing the job channel terminates the worker loop.
        drop(self.job_tx.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn worker_loop(
    job_rx: Receiver<LoadJob>,
    done_tx: Sender<JobOutcome>,
    storage: Arc<dyn Storage>,
    deserializers: Arc<DeserializerRegistry>,
) {
    while let Ok(job) = job_rx.recv() {
        let result = run_job(&job, storage.as_ref(), &deserializers);
        let outcome = JobOutcome {
            locator: job.locator,
            result,
        };
        if done_tx.send(outcome).is_err() {
            // Engine dropped, nobody cares about the result any more.
            return;
        }
    }
}

fn run_job(
    job: &LoadJob,
    storage: &dyn Storage,
    deserializers: &DeserializerRegistry,
) -> Result<Box<dyn Resource>, CacheError> {
    let Some(deserializer) = deserializers.get(job.type_tag) else {
        return Err(CacheError::UnknownType {
            locator: job.locator.clone(),
            type_tag: job.type_tag,
        });
    };

    // Some storages report every failure uniformly from fetch(); probing
    // exists() first keeps the missing-file class distinct.
    if !storage.exists(&job.locator) {
        return Err(CacheError::NotFound {
            locator: job.locator.clone(),
        });
    }

    let bytes = storage.fetch(&job.locator).map_err(|e| match e {
        FetchError::NotFound => CacheError::NotFound {
            locator: job.locator.clone(),
        },
        FetchError::Corrupt(reason) => CacheError::Corrupt {
            locator: job.locator.clone(),
            reason,
        },
    })?;

    deserializer
        .deserialize(&bytes, job.params.as_ref())
        .map_err(|e| CacheError::Corrupt {
            locator: job.locator.clone(),
            reason: format!("{:#}", e),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{DirStorage, JSON_DEF, MapStorage, TestDef, json_deserializers};
    use std::time::Duration;

    fn drain(engine: &mut LoadEngine) -> Result<(), CacheError> {
        for _ in 0..500 {
            engine.update()?;
            if engine.queued() == 0 {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("engine did not drain in time");
    }

    #[test]
    fn loads_and_finishes_a_job() {
        let storage = Arc::new(MapStorage::new());
        storage.put("defs/a", TestDef::plain("a").to_bytes());

        let mut engine = LoadEngine::new("test", storage, json_deserializers());
        engine.submit("defs/a", JSON_DEF, None);
        drain(&mut engine).unwrap();

        assert!(engine.is_finished("defs/a"));
        let resource = engine.take_finished("defs/a").unwrap();
        let def = resource.downcast_ref::<TestDef>().unwrap();
        assert_eq!(def.value(), "a");
        assert!(!engine.is_finished("defs/a"));
    }

    #[test]
    fn duplicate_submits_coalesce_into_one_job() {
        let storage = Arc::new(MapStorage::new());
        storage.put("defs/a", TestDef::plain("a").to_bytes());

        let mut engine = LoadEngine::new("test", storage, json_deserializers());
        engine.submit("defs/a", JSON_DEF, None);
        engine.submit("defs/a", JSON_DEF, None);
        engine.submit("defs/a", JSON_DEF, None);
        drain(&mut engine).unwrap();

        assert_eq!(engine.submitted(), 1);
        assert_eq!(engine.completed(), 1);
    }

    #[test]
    fn missing_file_fails_as_not_found() {
        let storage = Arc::new(MapStorage::new());
        let mut engine = LoadEngine::new("test", storage, json_deserializers());
        engine.submit("defs/missing", JSON_DEF, None);

        let error = drain(&mut engine).unwrap_err();
        assert!(matches!(error, CacheError::NotFound { .. }));
        assert_eq!(error.locator(), Some("defs/missing"));
    }

    #[test]
    fn garbage_bytes_fail_as_corrupt() {
        let storage = Arc::new(MapStorage::new());
        storage.put("defs/bad", b"not json at all".to_vec());

        let mut engine = LoadEngine::new("test", storage, json_deserializers());
        engine.submit("defs/bad", JSON_DEF, None);

        let error = drain(&mut engine).unwrap_err();
        assert!(matches!(error, CacheError::Corrupt { .. }));
    }

    #[test]
    fn loads_from_filesystem_storage() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.json"), TestDef::plain("disk").to_bytes()).unwrap();

        let storage = Arc::new(DirStorage::new(dir.path()));
        let mut engine = LoadEngine::new("fs-test", storage, json_deserializers());
        engine.submit("a.json", JSON_DEF, None);
        drain(&mut engine).unwrap();

        let resource = engine.take_finished("a.json").unwrap();
        assert_eq!(resource.downcast_ref::<TestDef>().unwrap().value(), "disk");
    }

    #[test]
    fn unregistered_type_fails() {
        let storage = Arc::new(MapStorage::new());
        storage.put("defs/a", TestDef::plain("a").to_bytes());

        let mut engine = LoadEngine::new("test", storage, Arc::new(DeserializerRegistry::new()));
        engine.submit("defs/a", JSON_DEF, None);

        let error = drain(&mut engine).unwrap_err();
        assert!(matches!(error, CacheError::UnknownType { .. }));
    }
}
