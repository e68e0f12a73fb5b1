//! Discovery providers.
//!
//! The remote providers (Consul, Eureka, Nacos) share one polling
//! engine: per application a background task fetches the registry over
//! the executor's pooled HTTP connector, parses the provider-specific
//! payload and applies it to the [`App`] snapshot. A failed poll keeps
//! the previous snapshot; only an authoritative response replaces it.
//! One task per app also means at most one in-flight refresh per app.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    rc::Rc,
    time::Duration,
};

use floodgate_core::{
    bail_into,
    config::from_value,
    context::ProxyRequest,
    discovery::{App, Discovery, Endpoint},
    upstream::{Execute, Scheme},
    worker::{DepMap, Worker, WorkerError, SKILL_DISCOVERY},
    AnyResult,
};
use http::Method;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::proxy::HttpExecutor;

pub mod consul;
pub mod eureka;
pub mod nacos;
pub mod static_;

const fn default_interval_ms() -> u64 {
    3_000
}

const fn default_poll_timeout_ms() -> u64 {
    2_000
}

#[derive(Deserialize)]
struct RemoteDiscoveryConfig {
    /// Registry servers, `host[:port]`; the provider default port applies
    /// when omitted.
    hosts: Vec<String>,
    #[serde(default = "default_interval_ms")]
    interval_ms: u64,
    #[serde(default = "default_poll_timeout_ms")]
    timeout_ms: u64,
}

/// Provider-specific request path and payload decoding.
pub(crate) trait Fetch: 'static {
    fn default_port(&self) -> u16;
    fn path(&self, app: &str) -> String;
    fn parse(&self, body: &[u8]) -> AnyResult<Vec<Rc<Endpoint>>>;
}

pub(crate) struct ProviderState {
    servers: Vec<Endpoint>,
    interval: Duration,
    executor: HttpExecutor,
}

fn parse_server(entry: &str, default_port: u16) -> AnyResult<Endpoint> {
    let entry = entry
        .trim()
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .trim_end_matches('/');
    if entry.is_empty() {
        bail_into!("empty discovery server entry");
    }
    match entry.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid discovery server port in `{entry}`"))?;
            Ok(Endpoint::new(host, port))
        }
        None => Ok(Endpoint::new(entry, default_port)),
    }
}

/// Fetch a registry document from the first answering server.
pub(crate) async fn fetch_bytes(
    state: &ProviderState,
    path_and_query: &str,
) -> AnyResult<bytes::Bytes> {
    let (path, query) = match path_and_query.split_once('?') {
        Some((p, q)) => (p, q),
        None => (path_and_query, ""),
    };
    let proxy = ProxyRequest::new(Method::GET, path, query);
    let mut last_error = None;
    for server in &state.servers {
        match state.executor.execute(&proxy, server, Scheme::Http).await {
            Ok(response) if response.status().is_success() => {
                return Ok(response.into_body());
            }
            Ok(response) => {
                last_error = Some(anyhow::anyhow!(
                    "registry {} answered {}",
                    server.key(),
                    response.status()
                ));
            }
            Err(e) => last_error = Some(anyhow::anyhow!("registry {}: {e}", server.key())),
        }
    }
    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("no discovery server configured")))
}

/// Generic polling provider over a [`Fetch`] implementation.
pub(crate) struct RemoteDiscovery<F> {
    id: String,
    fetcher: Rc<F>,
    state: Rc<RefCell<Rc<ProviderState>>>,
    apps: RefCell<HashMap<String, Rc<App>>>,
    stop: Rc<Cell<bool>>,
}

impl<F: Fetch> RemoteDiscovery<F> {
    pub(crate) fn new(id: &str, fetcher: F) -> Self {
        Self {
            id: id.to_string(),
            fetcher: Rc::new(fetcher),
            state: Rc::new(RefCell::new(Rc::new(ProviderState {
                servers: Vec::new(),
                interval: Duration::from_millis(default_interval_ms()),
                executor: HttpExecutor::new(
                    Scheme::Http,
                    Some(Duration::from_millis(default_poll_timeout_ms())),
                    floodgate_core::config::DEFAULT_MAX_BODY_SIZE,
                ),
            }))),
            apps: RefCell::new(HashMap::new()),
            stop: Rc::new(Cell::new(false)),
        }
    }

    fn spawn_refresher(&self, name: &str, app: Rc<App>) {
        let state = self.state.clone();
        let stop = self.stop.clone();
        let fetcher = self.fetcher.clone();
        let name = name.to_string();
        monoio::spawn(async move {
            loop {
                if stop.get() {
                    debug!(app = %name, "discovery refresher stopped");
                    break;
                }
                let current = state.borrow().clone();
                let path = fetcher.path(&name);
                let result = fetch_bytes(&current, &path)
                    .await
                    .and_then(|body| fetcher.parse(&body));
                app.apply_refresh(result);
                monoio::time::sleep(current.interval).await;
            }
        });
    }
}

impl<F: Fetch> Worker for RemoteDiscovery<F> {
    fn id(&self) -> &str {
        &self.id
    }

    fn reset(&self, config: &Value, _deps: &DepMap) -> Result<(), WorkerError> {
        let cfg: RemoteDiscoveryConfig = from_value(config)?;
        if cfg.hosts.is_empty() {
            return Err(WorkerError::Config(
                "discovery needs at least one registry host".into(),
            ));
        }
        let mut servers = Vec::with_capacity(cfg.hosts.len());
        for host in &cfg.hosts {
            servers.push(
                parse_server(host, self.fetcher.default_port())
                    .map_err(|e| WorkerError::Config(e.to_string()))?,
            );
        }
        *self.state.borrow_mut() = Rc::new(ProviderState {
            servers,
            interval: Duration::from_millis(cfg.interval_ms),
            executor: HttpExecutor::new(
                Scheme::Http,
                Some(Duration::from_millis(cfg.timeout_ms)),
                floodgate_core::config::DEFAULT_MAX_BODY_SIZE,
            ),
        });
        Ok(())
    }

    fn stop(&self) -> Result<(), WorkerError> {
        self.stop.set(true);
        Ok(())
    }

    fn check_skill(&self, skill: &str) -> bool {
        skill == SKILL_DISCOVERY
    }
}

impl<F: Fetch> Discovery for RemoteDiscovery<F> {
    fn get_app(&self, name: &str) -> AnyResult<Rc<App>> {
        if let Some(app) = self.apps.borrow().get(name) {
            return Ok(app.clone());
        }
        let app = Rc::new(App::new(name));
        self.apps
            .borrow_mut()
            .insert(name.to_string(), app.clone());
        self.spawn_refresher(name, app.clone());
        Ok(app)
    }
}
