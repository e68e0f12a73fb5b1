//! Discovery contracts.
//!
//! A provider resolves a logical application name to an [`App`] handle.
//! The handle owns the current endpoint snapshot; providers refresh it in
//! the background on their own schedule. Consumers clone the snapshot
//! `Rc` on read and never observe a partially updated node list.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    rc::Rc,
};

use crate::{AnyResult, worker::Worker};

/// One resolved upstream endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub addr: String,
    pub port: u16,
    pub weight: u16,
    pub labels: HashMap<String, String>,
}

impl Endpoint {
    pub fn new(addr: impl Into<String>, port: u16) -> Self {
        Self {
            addr: addr.into(),
            port,
            weight: 1,
            labels: HashMap::new(),
        }
    }

    pub fn with_weight(mut self, weight: u16) -> Self {
        self.weight = weight.max(1);
        self
    }

    /// Identity of the endpoint within health tracking and pools.
    pub fn key(&self) -> String {
        format!("{}:{}", self.addr, self.port)
    }

    pub fn authority(&self) -> String {
        self.key()
    }
}

/// Named application handle with an interior endpoint snapshot.
pub struct App {
    name: String,
    nodes: RefCell<Rc<Vec<Rc<Endpoint>>>>,
    version: Cell<u64>,
}

impl App {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: RefCell::new(Rc::new(Vec::new())),
            version: Cell::new(0),
        }
    }

    pub fn with_nodes(name: impl Into<String>, nodes: Vec<Rc<Endpoint>>) -> Self {
        let app = Self::new(name);
        app.set_nodes(nodes);
        app
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current snapshot; cheap clone of the shared list.
    pub fn nodes(&self) -> Rc<Vec<Rc<Endpoint>>> {
        self.nodes.borrow().clone()
    }

    /// Bumped on every accepted refresh; balancers key per-snapshot state
    /// off this.
    pub fn version(&self) -> u64 {
        self.version.get()
    }

    pub fn set_nodes(&self, nodes: Vec<Rc<Endpoint>>) {
        *self.nodes.borrow_mut() = Rc::new(nodes);
        self.version.set(self.version.get() + 1);
    }

    /// Apply one refresh result. A failed refresh retains the previous
    /// snapshot; an authoritative response replaces it, even when empty.
    /// Returns whether the snapshot was replaced.
    pub fn apply_refresh(&self, result: AnyResult<Vec<Rc<Endpoint>>>) -> bool {
        match result {
            Ok(nodes) => {
                self.set_nodes(nodes);
                true
            }
            Err(e) => {
                tracing::warn!(app = %self.name, "discovery refresh failed, keeping previous snapshot: {e:#}");
                false
            }
        }
    }
}

pub trait Discovery {
    /// Resolve an application handle. Providers register the name on first
    /// use and keep refreshing it until stopped.
    fn get_app(&self, name: &str) -> AnyResult<Rc<App>>;
}

/// A worker exposing the discovery capability.
pub trait DiscoveryWorker: Worker + Discovery {}
impl<T: Worker + Discovery> DiscoveryWorker for T {}
