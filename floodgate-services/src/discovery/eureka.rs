//! Eureka discovery over the application endpoint.

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
struct EurekaPort {
    #[serde(rename = "$")]
    value: u16,
}

#[derive(Deserialize)]
struct EurekaInstance {
    #[serde(rename = "ipAddr")]
    ip_addr: String,
    port: EurekaPort,
    status: String,
    #[serde(default)]
    metadata: std::collections::HashMap<String, Value>,
}

#[derive(Deserialize)]
struct EurekaApplication {
    #[serde(default)]
    instance: Vec<EurekaInstance>,
}

#[derive(Deserialize)]
struct EurekaResponse {
    application: EurekaApplication,
}

pub(crate) struct EurekaFetch;

impl Fetch for EurekaFetch {
    fn default_port(&self) -> u16 {
        8761
    }

    fn path(&self, app: &str) -> String {
        format!("/eureka/apps/{}", app.to_ascii_uppercase())
    }

    fn parse(&self, body: &[u8]) -> AnyResult<Vec<Rc<Endpoint>>> {
        let response: EurekaResponse = serde_json::from_slice(body)?;
        Ok(response
            .application
            .instance
            .into_iter()
            .filter(|instance| instance.status.eq_ignore_ascii_case("UP"))
            .map(|instance| {
                let weight = instance
                    .metadata
                    .get("weight")
                    .and_then(|v| v.as_u64())
                    .map(|w| w.min(u64::from(u16::MAX)) as u16)
                    .unwrap_or(1);
                let mut endpoint =
                    Endpoint::new(instance.ip_addr, instance.port.value).with_weight(weight);
                endpoint.labels = instance
                    .metadata
                    .into_iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k, s.to_string())))
                    .collect();
                Rc::new(endpoint)
            })
            .collect())
    }
}

pub struct EurekaDiscoveryDriver;

impl Driver for EurekaDiscoveryDriver {
    fn create(&self, id: &str, config: &Value, deps: &DepMap) -> Result<WorkerKind, WorkerError> {
        let worker = Rc::new(RemoteDiscovery::new(id, EurekaFetch));
        worker.reset(config, deps)?;
        Ok(WorkerKind::Discovery(worker))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_only_up_instances() {
        let body = serde_json::json!({
            "application": {
                "name": "ORDERS",
                "instance": [
                    {
                        "ipAddr": "10.0.0.1",
                        "port": { "$": 8080, "@enabled": "true" },
                        "status": "UP",
                        "metadata": { "weight": 2, "zone": "a" }
                    },
                    {
                        "ipAddr": "10.0.0.2",
                        "port": { "$": 8080 },
                        "status": "DOWN"
                    }
                ]
            }
        })
        .to_string();
        let nodes = EurekaFetch.parse(body.as_bytes()).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].key(), "10.0.0.1:8080");
        assert_eq!(nodes[0].weight, 2);
        assert_eq!(nodes[0].labels["zone"], "a");
    }

    #[test]
    fn app_names_are_uppercased_in_the_path() {
        assert_eq!(EurekaFetch.path("orders"), "/eureka/apps/ORDERS");
    }
}
