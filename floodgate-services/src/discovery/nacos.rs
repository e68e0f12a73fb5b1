//! Nacos discovery over the instance list endpoint.

use std::rc::Rc;

use floodgate_core::{
    discovery::Endpoint,
    worker::{DepMap, Driver, Worker, WorkerError, WorkerKind},
    AnyResult,
};
use serde::Deserialize;
use serde_json::Value;

use super::{Fetch, RemoteDiscovery};

fn default_weight() -> f64 {
    1.0
}

fn default_healthy() -> bool {
    true
}

#[derive(Deserialize)]
struct NacosHost {
    ip: String,
    port: u16,
    #[serde(default = "default_weight")]
    weight: f64,
    #[serde(default = "default_healthy")]
    healthy: bool,
    #[serde(default)]
    metadata: std::collections::HashMap<String, String>,
}

#[derive(Deserialize)]
struct NacosResponse {
    #[serde(default)]
    hosts: Vec<NacosHost>,
}

pub(crate) struct NacosFetch;

impl Fetch for NacosFetch {
    fn default_port(&self) -> u16 {
        8848
    }

    fn path(&self, app: &str) -> String {
        format!("/nacos/v1/ns/instance/list?serviceName={app}&healthyOnly=true")
    }

    fn parse(&self, body: &[u8]) -> AnyResult<Vec<Rc<Endpoint>>> {
        let response: NacosResponse = serde_json::from_slice(body)?;
        Ok(response
            .hosts
            .into_iter()
            .filter(|host| host.healthy)
            .map(|host| {
                let weight = host.weight.round().max(1.0).min(f64::from(u16::MAX)) as u16;
                let mut endpoint = Endpoint::new(host.ip, host.port).with_weight(weight);
                endpoint.labels = host.metadata;
                Rc::new(endpoint)
            })
            .collect())
    }
}

pub struct NacosDiscoveryDriver;

impl Driver for NacosDiscoveryDriver {
    fn create(&self, id: &str, config: &Value, deps: &DepMap) -> Result<WorkerKind, WorkerError> {
        let worker = Rc::new(RemoteDiscovery::new(id, NacosFetch));
        worker.reset(config, deps)?;
        Ok(WorkerKind::Discovery(worker))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_instance_list() {
        let body = serde_json::json!({
            "name": "orders",
            "hosts": [
                { "ip": "10.0.0.1", "port": 8848, "weight": 2.4, "healthy": true,
                  "metadata": { "zone": "a" } },
                { "ip": "10.0.0.2", "port": 8848, "healthy": false }
            ]
        })
        .to_string();
        let nodes = NacosFetch.parse(body.as_bytes()).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].key(), "10.0.0.1:8848");
        assert_eq!(nodes[0].weight, 2);
        assert_eq!(nodes[0].labels["zone"], "a");
    }

    #[test]
    fn fractional_weights_floor_to_one() {
        let body = serde_json::json!({ "hosts": [
            { "ip": "10.0.0.1", "port": 80, "weight": 0.1 }
        ]})
        .to_string();
        let nodes = NacosFetch.parse(body.as_bytes()).unwrap();
        assert_eq!(nodes[0].weight, 1);
    }
}
