//! Worker registry.
//!
//! One registry lives on each worker thread; configuration commands are
//! broadcast per core by the surrounding orchestrator, so all mutation
//! here is serialized by construction. Reads clone the stored capability
//! handle; a worker being reset keeps serving in-flight requests through
//! the state those requests already hold.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    rc::Rc,
};

use serde_json::Value;
use tracing::{debug, info};

use crate::worker::{DepMap, Driver, WorkerError, WorkerKind};

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("driver `{0}` is not registered")]
    DriverNotFound(String),
    #[error("worker `{0}` not found")]
    WorkerNotFound(String),
    #[error("worker `{0}` already exists")]
    WorkerExists(String),
    #[error("worker `{0}` is still required by `{1}`")]
    WorkerInUse(String, String),
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

struct WorkerEntry {
    driver: String,
    kind: WorkerKind,
    requires: Vec<String>,
}

#[derive(Default)]
pub struct Registry {
    drivers: RefCell<HashMap<String, Rc<dyn Driver>>>,
    workers: RefCell<HashMap<String, WorkerEntry>>,
    epoch: Cell<u64>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver factory. Idempotent per name: the first
    /// registration wins.
    pub fn register_driver(&self, name: impl Into<String>, driver: Rc<dyn Driver>) {
        let name = name.into();
        let mut drivers = self.drivers.borrow_mut();
        if drivers.contains_key(&name) {
            debug!("driver `{name}` already registered, keeping the existing factory");
            return;
        }
        drivers.insert(name, driver);
    }

    pub fn has_driver(&self, name: &str) -> bool {
        self.drivers.borrow().contains_key(name)
    }

    /// Monotone counter bumped by every successful mutation.
    pub fn epoch(&self) -> u64 {
        self.epoch.get()
    }

    pub fn get(&self, id: &str) -> Option<WorkerKind> {
        self.workers.borrow().get(id).map(|e| e.kind.clone())
    }

    pub fn check_skill(&self, id: &str, skill: &str) -> bool {
        self.get(id).map(|w| w.check_skill(skill)).unwrap_or(false)
    }

    fn resolve_deps(&self, dep_ids: &[String]) -> Result<DepMap, WorkerError> {
        let workers = self.workers.borrow();
        let mut deps = DepMap::with_capacity(dep_ids.len());
        for id in dep_ids {
            let entry = workers
                .get(id)
                .ok_or_else(|| WorkerError::DependencyMissing(id.clone()))?;
            deps.insert(id.clone(), entry.kind.clone());
        }
        Ok(deps)
    }

    pub fn create(
        &self,
        id: &str,
        driver_name: &str,
        config: &Value,
        dep_ids: &[String],
    ) -> Result<(), RegistryError> {
        if self.workers.borrow().contains_key(id) {
            return Err(RegistryError::WorkerExists(id.to_string()));
        }
        let driver = self
            .drivers
            .borrow()
            .get(driver_name)
            .cloned()
            .ok_or_else(|| RegistryError::DriverNotFound(driver_name.to_string()))?;
        let deps = self.resolve_deps(dep_ids)?;
        let kind = driver.create(id, config, &deps)?;
        kind.start()?;
        self.workers.borrow_mut().insert(
            id.to_string(),
            WorkerEntry {
                driver: driver_name.to_string(),
                kind,
                requires: dep_ids.to_vec(),
            },
        );
        self.epoch.set(self.epoch.get() + 1);
        info!("worker `{id}` created with driver `{driver_name}`");
        Ok(())
    }

    /// Reconfigure an existing worker. On error the pre-update state stays
    /// in force, per the worker reset contract.
    pub fn update(&self, id: &str, config: &Value, dep_ids: &[String]) -> Result<(), RegistryError> {
        let kind = self
            .get(id)
            .ok_or_else(|| RegistryError::WorkerNotFound(id.to_string()))?;
        let deps = self.resolve_deps(dep_ids)?;
        kind.reset(config, &deps)?;
        if let Some(entry) = self.workers.borrow_mut().get_mut(id) {
            entry.requires = dep_ids.to_vec();
        }
        self.epoch.set(self.epoch.get() + 1);
        info!("worker `{id}` updated");
        Ok(())
    }

    /// Stop and remove a worker. Fails while any other worker still
    /// depends on it.
    pub fn delete(&self, id: &str) -> Result<(), RegistryError> {
        {
            let workers = self.workers.borrow();
            if !workers.contains_key(id) {
                return Err(RegistryError::WorkerNotFound(id.to_string()));
            }
            for (other, entry) in workers.iter() {
                if entry.requires.iter().any(|dep| dep == id) {
                    return Err(RegistryError::WorkerInUse(
                        id.to_string(),
                        other.clone(),
                    ));
                }
            }
        }
        let entry = self.workers.borrow_mut().remove(id).expect("checked above");
        entry.kind.stop()?;
        entry.kind.destroy();
        self.epoch.set(self.epoch.get() + 1);
        info!("worker `{id}` removed (driver `{}`)", entry.driver);
        Ok(())
    }
}
