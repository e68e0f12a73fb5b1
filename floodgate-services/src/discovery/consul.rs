//! Consul discovery over the health endpoint.

use std::rc::Rc;

use floodgate_core::{
    discovery::Endpoint,
    worker::{DepMap, Driver, Worker, WorkerError, WorkerKind},
    AnyResult,
};
use serde::Deserialize;
use serde_json::Value;

use super::{Fetch, RemoteDiscovery};

#[derive(Deserialize)]
struct ConsulWeights {
    #[serde(rename = "Passing", default)]
    passing: Option<u16>,
}

#[derive(Deserialize)]
struct ConsulService {
    #[serde(rename = "Address", default)]
    address: String,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Weights", default)]
    weights: Option<ConsulWeights>,
    #[serde(rename = "Meta", default)]
    meta: std::collections::HashMap<String, String>,
}

#[derive(Deserialize)]
struct ConsulNode {
    #[serde(rename = "Address", default)]
    address: String,
}

#[derive(Deserialize)]
struct ConsulEntry {
    #[serde(rename = "Node")]
    node: ConsulNode,
    #[serde(rename = "Service")]
    service: ConsulService,
}

pub(crate) struct ConsulFetch;

impl Fetch for ConsulFetch {
    fn default_port(&self) -> u16 {
        8500
    }

    fn path(&self, app: &str) -> String {
        format!("/v1/health/service/{app}?passing=true")
    }

    fn parse(&self, body: &[u8]) -> AnyResult<Vec<Rc<Endpoint>>> {
        let entries: Vec<ConsulEntry> = serde_json::from_slice(body)?;
        Ok(entries
            .into_iter()
            .map(|entry| {
                let address = if entry.service.address.is_empty() {
                    entry.node.address
                } else {
                    entry.service.address
                };
                let weight = entry
                    .service
                    .weights
                    .and_then(|w| w.passing)
                    .unwrap_or(1);
                let mut endpoint =
                    Endpoint::new(address, entry.service.port).with_weight(weight);
                endpoint.labels = entry.service.meta;
                Rc::new(endpoint)
            })
            .collect())
    }
}

pub struct ConsulDiscoveryDriver;

impl Driver for ConsulDiscoveryDriver {
    fn create(&self, id: &str, config: &Value, deps: &DepMap) -> Result<WorkerKind, WorkerError> {
        let worker = Rc::new(RemoteDiscovery::new(id, ConsulFetch));
        worker.reset(config, deps)?;
        Ok(WorkerKind::Discovery(worker))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_health_entries() {
        let body = serde_json::json!([
            {
                "Node": { "Address": "10.0.0.1" },
                "Service": {
                    "Address": "",
                    "Port": 8080,
                    "Weights": { "Passing": 3 },
                    "Meta": { "zone": "a" }
                }
            },
            {
                "Node": { "Address": "10.0.0.2" },
                "Service": { "Address": "10.9.9.9", "Port": 9090 }
            }
        ])
        .to_string();
        let nodes = ConsulFetch.parse(body.as_bytes()).unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].key(), "10.0.0.1:8080");
        assert_eq!(nodes[0].weight, 3);
        assert_eq!(nodes[0].labels["zone"], "a");
        assert_eq!(nodes[1].key(), "10.9.9.9:9090");
        assert_eq!(nodes[1].weight, 1);
    }

    #[test]
    fn rejects_malformed_payloads() {
        assert!(ConsulFetch.parse(b"not json").is_err());
    }
}
