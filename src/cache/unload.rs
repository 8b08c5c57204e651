use std::collections::HashMap;
use std::sync::RwLock;

use crate::identifier::TypeTag;
use crate::resource::Resource;

type Predicate = Box<dyn Fn(&dyn Resource) -> bool + Send + Sync>;

/// Per-type "may this be freed right now" predicates, consulted while the
/// unload queue drains (e.g. an audio clip must not be freed while still
/// playing). Types without a registered predicate are always ready.
pub struct UnloadReadyRegistry {
    predicates: RwLock<HashMap<TypeTag, Predicate>>,
}

impl UnloadReadyRegistry {
    pub fn new() -> Self {
        Self {
            predicates: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, type_tag: TypeTag, predicate: impl Fn(&dyn Resource) -> bool + Send + Sync + 'static) {
        self.predicates
            .write()
            .expect("unload readiness lock poisoned")
            .insert(type_tag, Box::new(predicate));
    }

    pub fn is_ready(&self, type_tag: TypeTag, resource: &dyn Resource) -> bool {
        match self
            .predicates
            .read()
            .expect("unload readiness lock poisoned")
            .get(&type_tag)
        {
            Some(predicate) => predicate(resource),
            None => true,
        }
    }
}

impl Default for UnloadReadyRegistry {
    fn default() -> Self {
        Self::new()
    }
}
