//! The `upstream-http` worker: a discovery-backed endpoint pool with a
//! balancing policy and failure-window health tracking.
//!
//! Selection only considers healthy endpoints; when every endpoint is in
//! cooldown the worker reports [`NoNode`] and the service answers with a
//! gateway error instead of electing a "least bad" node. The health
//! table survives resets so a reconfiguration does not forget which
//! endpoints are cooling down.

use std::{cell::RefCell, rc::Rc};

use floodgate_core::{
    config::from_value,
    context::Context,
    discovery::{App, Endpoint},
    upstream::{NoNode, Scheme, Upstream},
    worker::{require_discovery, DepMap, Driver, Worker, WorkerError, WorkerKind, SKILL_UPSTREAM},
};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

mod balance;
mod health;

pub use balance::BalanceStrategy;
pub use health::{HealthConfig, HealthTable};

use balance::{Balance, SelectView};

#[derive(Deserialize)]
struct UpstreamHttpConfig {
    #[serde(default)]
    scheme: Scheme,
    #[serde(default, alias = "type")]
    balance: BalanceStrategy,
    /// Id of the discovery worker resolving `service_name`.
    discovery: String,
    #[serde(alias = "config")]
    service_name: String,
    #[serde(default)]
    health: HealthConfig,
}

struct UpstreamState {
    scheme: Scheme,
    app: Rc<App>,
    balance: Balance,
}

pub struct UpstreamHttpWorker {
    id: String,
    health: HealthTable,
    state: RefCell<Rc<UpstreamState>>,
}

impl UpstreamHttpWorker {
    fn empty(id: &str) -> Self {
        Self {
            id: id.to_string(),
            health: HealthTable::new(HealthConfig::default()),
            state: RefCell::new(Rc::new(UpstreamState {
                scheme: Scheme::default(),
                app: Rc::new(App::new(id)),
                balance: Balance::new(BalanceStrategy::default()),
            })),
        }
    }

    /// Inline upstream of a service without a named upstream worker.
    pub(crate) fn anonymous(
        id: &str,
        nodes: Vec<Rc<Endpoint>>,
        strategy: BalanceStrategy,
        scheme: Scheme,
    ) -> Self {
        let worker = Self::empty(id);
        *worker.state.borrow_mut() = Rc::new(UpstreamState {
            scheme,
            app: Rc::new(App::with_nodes(id, nodes)),
            balance: Balance::new(strategy),
        });
        worker
    }
}

impl Worker for UpstreamHttpWorker {
    fn id(&self) -> &str {
        &self.id
    }

    fn reset(&self, config: &Value, deps: &DepMap) -> Result<(), WorkerError> {
        let cfg: UpstreamHttpConfig = from_value(config)?;
        let discovery = require_discovery(deps, &cfg.discovery)?;
        let app = discovery
            .get_app(&cfg.service_name)
            .map_err(WorkerError::Other)?;
        let balance = Balance::new(cfg.balance);
        debug!(
            upstream = %self.id,
            app = %cfg.service_name,
            strategy = ?balance.strategy(),
            "upstream configured"
        );
        self.health.set_config(cfg.health);
        *self.state.borrow_mut() = Rc::new(UpstreamState {
            scheme: cfg.scheme,
            app,
            balance,
        });
        Ok(())
    }

    fn check_skill(&self, skill: &str) -> bool {
        skill == SKILL_UPSTREAM
    }
}

impl Upstream for UpstreamHttpWorker {
    fn scheme(&self) -> Scheme {
        self.state.borrow().scheme
    }

    fn select(&self, ctx: &Context) -> Result<Rc<Endpoint>, NoNode> {
        let state = self.state.borrow().clone();
        let nodes = state.app.nodes();
        let live: Vec<Rc<Endpoint>> = nodes
            .iter()
            .filter(|n| self.health.is_healthy(&n.key()))
            .cloned()
            .collect();
        if live.is_empty() {
            return Err(NoNode);
        }
        let healthy = |e: &Endpoint| self.health.is_healthy(&e.key());
        let view = SelectView {
            all: &nodes,
            live: &live,
            version: state.app.version(),
            client_ip: ctx.client_ip(),
            healthy: &healthy,
        };
        state.balance.select(&view).ok_or(NoNode)
    }

    fn report_success(&self, endpoint: &Endpoint) {
        self.health.record_success(&endpoint.key());
    }

    fn report_failure(&self, endpoint: &Endpoint) {
        self.health.record_failure(&endpoint.key());
    }
}

pub struct UpstreamHttpDriver;

impl Driver for UpstreamHttpDriver {
    fn create(&self, id: &str, config: &Value, deps: &DepMap) -> Result<WorkerKind, WorkerError> {
        let worker = Rc::new(UpstreamHttpWorker::empty(id));
        worker.reset(config, deps)?;
        Ok(WorkerKind::Upstream(worker))
    }
}
