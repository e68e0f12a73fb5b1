//! The worker abstraction.
//!
//! A worker is a live, reconfigurable instance of a driver, identified by
//! a globally unique id. Workers are stored as a tagged capability union
//! ([`WorkerKind`]); callers obtain a specific capability through the
//! typed accessors instead of string-keyed downcasts. Because a worker's
//! capability variant is fixed at creation, a reset can never shrink the
//! skill set a dependent relies on.

use std::{collections::HashMap, rc::Rc};

use serde_json::Value;

use crate::{
    discovery::DiscoveryWorker,
    filter::HttpFilter,
    router::ServiceWorker,
    upstream::UpstreamWorker,
};

pub const SKILL_SERVICE: &str = "service";
pub const SKILL_UPSTREAM: &str = "upstream";
pub const SKILL_DISCOVERY: &str = "discovery";
pub const SKILL_FILTER: &str = "filter";
pub const SKILL_AUTH: &str = "auth";
pub const SKILL_ROUTER: &str = "router";

#[derive(thiserror::Error, Debug)]
pub enum WorkerError {
    #[error("invalid config: {0}")]
    Config(String),
    #[error("required worker `{0}` not found")]
    DependencyMissing(String),
    #[error("worker `{id}` does not provide skill `{skill}`")]
    DependencyType { id: String, skill: String },
    #[error(transparent)]
    Other(#[from] crate::AnyError),
}

/// Lifecycle every worker implements.
///
/// `reset` re-initializes the worker from a new config and resolved
/// dependency set. It must either succeed fully or leave the previous
/// state in force; in-flight requests keep observing the state they
/// started with.
pub trait Worker {
    fn id(&self) -> &str;

    fn start(&self) -> Result<(), WorkerError> {
        Ok(())
    }

    fn reset(&self, config: &Value, deps: &DepMap) -> Result<(), WorkerError>;

    fn stop(&self) -> Result<(), WorkerError> {
        Ok(())
    }

    fn destroy(&self) {}

    fn check_skill(&self, skill: &str) -> bool;
}

/// A worker exposing the filter capability.
pub trait FilterWorker: Worker + HttpFilter {}
impl<T: Worker + HttpFilter> FilterWorker for T {}

/// Capability union stored by the registry.
#[derive(Clone)]
pub enum WorkerKind {
    Service(Rc<dyn ServiceWorker>),
    Upstream(Rc<dyn UpstreamWorker>),
    Filter(Rc<dyn FilterWorker>),
    Discovery(Rc<dyn DiscoveryWorker>),
    Router(Rc<dyn Worker>),
}

macro_rules! each_kind {
    ($self:ident, $w:ident => $e:expr) => {
        match $self {
            WorkerKind::Service($w) => $e,
            WorkerKind::Upstream($w) => $e,
            WorkerKind::Filter($w) => $e,
            WorkerKind::Discovery($w) => $e,
            WorkerKind::Router($w) => $e,
        }
    };
}

impl WorkerKind {
    pub fn id(&self) -> &str {
        each_kind!(self, w => w.id())
    }

    pub fn start(&self) -> Result<(), WorkerError> {
        each_kind!(self, w => w.start())
    }

    pub fn reset(&self, config: &Value, deps: &DepMap) -> Result<(), WorkerError> {
        each_kind!(self, w => w.reset(config, deps))
    }

    pub fn stop(&self) -> Result<(), WorkerError> {
        each_kind!(self, w => w.stop())
    }

    pub fn destroy(&self) {
        each_kind!(self, w => w.destroy())
    }

    pub fn check_skill(&self, skill: &str) -> bool {
        each_kind!(self, w => w.check_skill(skill))
    }

    pub fn as_service(&self) -> Option<Rc<dyn ServiceWorker>> {
        match self {
            WorkerKind::Service(w) => Some(w.clone()),
            _ => None,
        }
    }

    pub fn as_upstream(&self) -> Option<Rc<dyn UpstreamWorker>> {
        match self {
            WorkerKind::Upstream(w) => Some(w.clone()),
            _ => None,
        }
    }

    pub fn as_filter(&self) -> Option<Rc<dyn FilterWorker>> {
        match self {
            WorkerKind::Filter(w) => Some(w.clone()),
            _ => None,
        }
    }

    pub fn as_discovery(&self) -> Option<Rc<dyn DiscoveryWorker>> {
        match self {
            WorkerKind::Discovery(w) => Some(w.clone()),
            _ => None,
        }
    }
}

/// Resolved dependency set handed to `create` and `reset`: required
/// worker id to live worker.
pub type DepMap = HashMap<String, WorkerKind>;

pub fn require<'a>(deps: &'a DepMap, id: &str) -> Result<&'a WorkerKind, WorkerError> {
    deps.get(id)
        .ok_or_else(|| WorkerError::DependencyMissing(id.to_string()))
}

pub fn require_service(deps: &DepMap, id: &str) -> Result<Rc<dyn ServiceWorker>, WorkerError> {
    require(deps, id)?
        .as_service()
        .ok_or_else(|| WorkerError::DependencyType {
            id: id.to_string(),
            skill: SKILL_SERVICE.to_string(),
        })
}

pub fn require_upstream(deps: &DepMap, id: &str) -> Result<Rc<dyn UpstreamWorker>, WorkerError> {
    require(deps, id)?
        .as_upstream()
        .ok_or_else(|| WorkerError::DependencyType {
            id: id.to_string(),
            skill: SKILL_UPSTREAM.to_string(),
        })
}

pub fn require_filter(deps: &DepMap, id: &str) -> Result<Rc<dyn FilterWorker>, WorkerError> {
    require(deps, id)?
        .as_filter()
        .ok_or_else(|| WorkerError::DependencyType {
            id: id.to_string(),
            skill: SKILL_FILTER.to_string(),
        })
}

pub fn require_discovery(
    deps: &DepMap,
    id: &str,
) -> Result<Rc<dyn DiscoveryWorker>, WorkerError> {
    require(deps, id)?
        .as_discovery()
        .ok_or_else(|| WorkerError::DependencyType {
            id: id.to_string(),
            skill: SKILL_DISCOVERY.to_string(),
        })
}

/// A named factory producing workers of one kind. `create` parses the
/// config document, resolves dependencies and returns the fully
/// initialized worker; the registry starts it afterwards.
pub trait Driver {
    fn create(&self, id: &str, config: &Value, deps: &DepMap) -> Result<WorkerKind, WorkerError>;
}
