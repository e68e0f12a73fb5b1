//! Floodgate driver implementations.
//!
//! Everything here runs on monoio's thread-per-core runtime: one
//! [`Registry`] and one [`RouterTable`](router::RouterTable) live on each
//! worker thread, and configuration commands are broadcast per core by
//! the surrounding orchestrator.

use std::rc::Rc;

use floodgate_core::registry::Registry;

use crate::router::RouterTable;

pub mod auth;
pub mod discovery;
pub mod gateway;
pub mod plugins;
pub mod proxy;
pub mod router;
pub mod service;
pub mod upstream;
pub mod util;

/// Register every built-in driver factory. Called once per worker thread
/// at process init; repeated calls are no-ops per driver name.
pub fn register_default_drivers(registry: &Registry, table: &Rc<RouterTable>) {
    registry.register_driver(
        "http-router",
        Rc::new(router::HttpRouterDriver::new(table.clone())),
    );
    registry.register_driver(
        "grpc-router",
        Rc::new(router::GrpcRouterDriver::new(table.clone())),
    );
    registry.register_driver("service-http", Rc::new(service::ServiceHttpDriver));
    registry.register_driver("upstream-http", Rc::new(upstream::UpstreamHttpDriver));

    registry.register_driver("static", Rc::new(discovery::static_::StaticDiscoveryDriver));
    registry.register_driver("consul", Rc::new(discovery::consul::ConsulDiscoveryDriver));
    registry.register_driver("eureka", Rc::new(discovery::eureka::EurekaDiscoveryDriver));
    registry.register_driver("nacos", Rc::new(discovery::nacos::NacosDiscoveryDriver));

    registry.register_driver("basic", Rc::new(auth::basic::BasicAuthDriver));
    registry.register_driver("apikey", Rc::new(auth::apikey::ApikeyAuthDriver));
    registry.register_driver("aksk", Rc::new(auth::aksk::AkskAuthDriver));
    registry.register_driver("jwt", Rc::new(auth::jwt::JwtAuthDriver));

    registry.register_driver(
        "extra-params",
        Rc::new(plugins::extra_params::ExtraParamsDriver),
    );
    registry.register_driver(
        "access-log",
        Rc::new(plugins::access_log::AccessLogDriver),
    );
}
