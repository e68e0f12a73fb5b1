//! Static discovery: node lists come from configuration, no polling.
//!
//! Besides named apps, `get_app` accepts an inline node list
//! (`host:port[ weight];...`) as the application name, which is how
//! services with an anonymous upstream resolve without a named app.

use std::{cell::RefCell, collections::HashMap, rc::Rc};

use floodgate_core::{
    bail_into,
    config::from_value,
    discovery::{App, Discovery, Endpoint},
    worker::{DepMap, Driver, Worker, WorkerError, WorkerKind, SKILL_DISCOVERY},
    AnyResult,
};
use serde::Deserialize;
use serde_json::Value;

/// Parse one `host:port[ weight]` entry.
pub(crate) fn parse_node(entry: &str) -> AnyResult<Rc<Endpoint>> {
    let entry = entry.trim();
    let (addr_part, weight) = match entry.split_once(char::is_whitespace) {
        Some((addr, rest)) => {
            let rest = rest.trim();
            let digits = rest
                .strip_prefix("weight=")
                .unwrap_or(rest);
            let weight: u16 = digits
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid node weight in `{entry}`"))?;
            (addr, weight)
        }
        None => (entry, 1),
    };
    let (host, port) = addr_part
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("node `{entry}` is missing a port"))?;
    let port: u16 = port
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid node port in `{entry}`"))?;
    if host.is_empty() {
        bail_into!("node `{}` is missing a host", entry);
    }
    Ok(Rc::new(Endpoint::new(host, port).with_weight(weight)))
}

/// Parse a `;`-separated node list.
pub(crate) fn parse_node_list(list: &str) -> AnyResult<Vec<Rc<Endpoint>>> {
    let mut nodes = Vec::new();
    for entry in list.split(';') {
        if entry.trim().is_empty() {
            continue;
        }
        nodes.push(parse_node(entry)?);
    }
    if nodes.is_empty() {
        bail_into!("empty node list");
    }
    Ok(nodes)
}

#[derive(Deserialize)]
struct StaticDiscoveryConfig {
    /// Application name to node list entries.
    #[serde(default)]
    apps: HashMap<String, Vec<String>>,
}

pub struct StaticDiscoveryWorker {
    id: String,
    apps: RefCell<HashMap<String, Rc<App>>>,
}

impl Worker for StaticDiscoveryWorker {
    fn id(&self) -> &str {
        &self.id
    }

    fn reset(&self, config: &Value, _deps: &DepMap) -> Result<(), WorkerError> {
        let cfg: StaticDiscoveryConfig = from_value(config)?;
        // validate everything before touching live handles
        let mut parsed = HashMap::with_capacity(cfg.apps.len());
        for (name, entries) in &cfg.apps {
            let mut nodes = Vec::with_capacity(entries.len());
            for entry in entries {
                nodes.push(parse_node(entry).map_err(|e| WorkerError::Config(e.to_string()))?);
            }
            parsed.insert(name.clone(), nodes);
        }
        let mut apps = self.apps.borrow_mut();
        for (name, nodes) in parsed {
            match apps.get(&name) {
                // upstreams keep their handle; update it in place
                Some(app) => app.set_nodes(nodes),
                None => {
                    apps.insert(name.clone(), Rc::new(App::with_nodes(name, nodes)));
                }
            }
        }
        Ok(())
    }

    fn check_skill(&self, skill: &str) -> bool {
        skill == SKILL_DISCOVERY
    }
}

impl Discovery for StaticDiscoveryWorker {
    fn get_app(&self, name: &str) -> AnyResult<Rc<App>> {
        if let Some(app) = self.apps.borrow().get(name) {
            return Ok(app.clone());
        }
        if name.contains(':') {
            // inline node list from an anonymous upstream
            let nodes = parse_node_list(name)?;
            let app = Rc::new(App::with_nodes(name, nodes));
            self.apps
                .borrow_mut()
                .insert(name.to_string(), app.clone());
            return Ok(app);
        }
        bail_into!("static discovery has no app named `{}`", name)
    }
}

pub struct StaticDiscoveryDriver;

impl Driver for StaticDiscoveryDriver {
    fn create(&self, id: &str, config: &Value, deps: &DepMap) -> Result<WorkerKind, WorkerError> {
        let worker = Rc::new(StaticDiscoveryWorker {
            id: id.to_string(),
            apps: RefCell::new(HashMap::new()),
        });
        worker.reset(config, deps)?;
        Ok(WorkerKind::Discovery(worker))
    }
}
