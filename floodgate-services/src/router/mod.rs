//! Hierarchical request router and its drivers.
//!
//! Routing walks four dimensions: port → host → path → append rules
//! (header / query / method predicates). Exact keys win over the
//! wildcard at every level, path checkers are evaluated in order of
//! descending specificity, and append candidates with more rules are
//! tried first. Ties inside a specificity class keep registration order.
//!
//! Route rules are contributed by router workers (`http-router`,
//! `grpc-router`); the [`RouterTable`] aggregates them, rebuilds the
//! matcher beside the live one and swaps it atomically per worker
//! thread. A failed build (duplicate route, bad pattern) leaves the
//! previous tree serving.

use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    rc::Rc,
};

use floodgate_core::{
    config::from_value,
    router::{AppendRule, MatchInput, ServiceWorker, ALL},
    worker::{require_service, DepMap, Driver, Worker, WorkerError, WorkerKind, SKILL_ROUTER},
};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error};

mod matcher;
mod tree;

pub use matcher::PortMatcher;
pub use tree::{Root, RouterBuildError};

/// One route contributed by a router worker.
#[derive(Clone)]
pub struct RouteSpec {
    pub id: String,
    pub port: u16,
    pub hosts: Vec<String>,
    pub location: String,
    pub appends: Vec<AppendRule>,
    pub target: Rc<dyn ServiceWorker>,
}

/// Aggregated routing state of one worker thread.
pub struct RouterTable {
    routes: RefCell<BTreeMap<String, Vec<RouteSpec>>>,
    matcher: RefCell<Rc<PortMatcher>>,
    epoch: Cell<u64>,
}

impl Default for RouterTable {
    fn default() -> Self {
        Self {
            routes: RefCell::new(BTreeMap::new()),
            matcher: RefCell::new(Rc::new(PortMatcher::default())),
            epoch: Cell::new(0),
        }
    }
}

impl RouterTable {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Replace the routes of one router worker. The new tree is built
    /// beside the live one; on failure nothing is swapped.
    pub fn apply(&self, worker_id: &str, specs: Vec<RouteSpec>) -> Result<(), RouterBuildError> {
        let mut routes = self.routes.borrow().clone();
        routes.insert(worker_id.to_string(), specs);
        let matcher = build(&routes)?;
        *self.routes.borrow_mut() = routes;
        self.swap(matcher);
        Ok(())
    }

    /// Drop the routes of one router worker.
    pub fn remove(&self, worker_id: &str) {
        let mut routes = self.routes.borrow().clone();
        if routes.remove(worker_id).is_none() {
            return;
        }
        match build(&routes) {
            Ok(matcher) => {
                *self.routes.borrow_mut() = routes;
                self.swap(matcher);
            }
            // removal cannot introduce conflicts; patterns were validated
            // when the surviving routes were applied
            Err(e) => error!("router rebuild after removal failed: {e}"),
        }
    }

    fn swap(&self, matcher: PortMatcher) {
        *self.matcher.borrow_mut() = Rc::new(matcher);
        self.epoch.set(self.epoch.get() + 1);
        debug!(epoch = self.epoch.get(), "router tree swapped");
    }

    /// Current matcher; requests hold it for their whole lifetime.
    pub fn matcher(&self) -> Rc<PortMatcher> {
        self.matcher.borrow().clone()
    }

    pub fn find(&self, input: &dyn MatchInput) -> Option<Rc<dyn ServiceWorker>> {
        self.matcher.borrow().find(input)
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.get()
    }
}

fn build(routes: &BTreeMap<String, Vec<RouteSpec>>) -> Result<PortMatcher, RouterBuildError> {
    let mut root = Root::new();
    for specs in routes.values() {
        for spec in specs {
            root.add(
                &spec.id,
                spec.target.clone(),
                spec.port,
                &spec.hosts,
                &spec.location,
                &spec.appends,
            )?;
        }
    }
    Ok(root.build())
}

#[derive(Deserialize)]
struct MatchItem {
    name: String,
    pattern: String,
}

#[derive(Deserialize)]
struct HttpRouterRule {
    #[serde(default)]
    location: String,
    #[serde(default)]
    header: Vec<MatchItem>,
    #[serde(default)]
    query: Vec<MatchItem>,
    #[serde(default)]
    method: Option<String>,
}

#[derive(Deserialize)]
struct HttpRouterConfig {
    /// Port the rules apply to; `0` registers them for every listener.
    #[serde(default)]
    listen: u16,
    #[serde(default)]
    hosts: Vec<String>,
    /// Id of the target service worker; must appear in the dependency set.
    target: String,
    #[serde(default)]
    rules: Vec<HttpRouterRule>,
}

fn appends_of(rule_method: &Option<String>, header: &[MatchItem], query: &[MatchItem]) -> Vec<AppendRule> {
    let mut appends = Vec::new();
    for item in header {
        appends.push(AppendRule::header(item.name.clone(), item.pattern.clone()));
    }
    for item in query {
        appends.push(AppendRule::query(item.name.clone(), item.pattern.clone()));
    }
    match rule_method.as_deref() {
        None | Some("") | Some(ALL) => {}
        Some(method) => appends.push(AppendRule::method(method)),
    }
    appends
}

struct HttpRouterWorker {
    id: String,
    table: Rc<RouterTable>,
}

impl HttpRouterWorker {
    fn apply(&self, config: &Value, deps: &DepMap) -> Result<(), WorkerError> {
        let cfg: HttpRouterConfig = from_value(config)?;
        let target = require_service(deps, &cfg.target)?;
        let mut specs = Vec::new();
        let rules = if cfg.rules.is_empty() {
            vec![HttpRouterRule {
                location: String::new(),
                header: Vec::new(),
                query: Vec::new(),
                method: None,
            }]
        } else {
            cfg.rules
        };
        for (i, rule) in rules.iter().enumerate() {
            specs.push(RouteSpec {
                id: format!("{}:{i}", self.id),
                port: cfg.listen,
                hosts: cfg.hosts.clone(),
                location: rule.location.clone(),
                appends: appends_of(&rule.method, &rule.header, &rule.query),
                target: target.clone(),
            });
        }
        self.table
            .apply(&self.id, specs)
            .map_err(|e| WorkerError::Other(e.into()))
    }
}

impl Worker for HttpRouterWorker {
    fn id(&self) -> &str {
        &self.id
    }

    fn reset(&self, config: &Value, deps: &DepMap) -> Result<(), WorkerError> {
        self.apply(config, deps)
    }

    fn stop(&self) -> Result<(), WorkerError> {
        self.table.remove(&self.id);
        Ok(())
    }

    fn check_skill(&self, skill: &str) -> bool {
        skill == SKILL_ROUTER
    }
}

pub struct HttpRouterDriver {
    table: Rc<RouterTable>,
}

impl HttpRouterDriver {
    pub fn new(table: Rc<RouterTable>) -> Self {
        Self { table }
    }
}

impl Driver for HttpRouterDriver {
    fn create(&self, id: &str, config: &Value, deps: &DepMap) -> Result<WorkerKind, WorkerError> {
        let worker = Rc::new(HttpRouterWorker {
            id: id.to_string(),
            table: self.table.clone(),
        });
        worker.apply(config, deps)?;
        Ok(WorkerKind::Router(worker))
    }
}

#[derive(Deserialize)]
struct GrpcRouterRule {
    #[serde(default)]
    service: String,
    #[serde(default)]
    method: String,
    #[serde(default)]
    header: Vec<MatchItem>,
    #[serde(default)]
    query: Vec<MatchItem>,
}

#[derive(Deserialize)]
struct GrpcRouterConfig {
    #[serde(default)]
    listen: u16,
    #[serde(default)]
    hosts: Vec<String>,
    target: String,
    #[serde(default)]
    rules: Vec<GrpcRouterRule>,
}

/// Path of a gRPC (or Dubbo2) rule: `/service/method`, `*` standing in
/// for any method.
fn grpc_location(service: &str, method: &str) -> String {
    let service = if service.is_empty() { ALL } else { service };
    let method = if method.is_empty() { ALL } else { method };
    if service == ALL && method == ALL {
        return String::new();
    }
    format!("/{service}/{method}")
}

struct GrpcRouterWorker {
    id: String,
    table: Rc<RouterTable>,
}

impl GrpcRouterWorker {
    fn apply(&self, config: &Value, deps: &DepMap) -> Result<(), WorkerError> {
        let cfg: GrpcRouterConfig = from_value(config)?;
        let target = require_service(deps, &cfg.target)?;
        let rules = if cfg.rules.is_empty() {
            vec![GrpcRouterRule {
                service: String::new(),
                method: String::new(),
                header: Vec::new(),
                query: Vec::new(),
            }]
        } else {
            cfg.rules
        };
        let specs = rules
            .iter()
            .enumerate()
            .map(|(i, rule)| RouteSpec {
                id: format!("{}:{i}", self.id),
                port: cfg.listen,
                hosts: cfg.hosts.clone(),
                location: grpc_location(&rule.service, &rule.method),
                appends: appends_of(&None, &rule.header, &rule.query),
                target: target.clone(),
            })
            .collect();
        self.table
            .apply(&self.id, specs)
            .map_err(|e| WorkerError::Other(e.into()))
    }
}

impl Worker for GrpcRouterWorker {
    fn id(&self) -> &str {
        &self.id
    }

    fn reset(&self, config: &Value, deps: &DepMap) -> Result<(), WorkerError> {
        self.apply(config, deps)
    }

    fn stop(&self) -> Result<(), WorkerError> {
        self.table.remove(&self.id);
        Ok(())
    }

    fn check_skill(&self, skill: &str) -> bool {
        skill == SKILL_ROUTER
    }
}

pub struct GrpcRouterDriver {
    table: Rc<RouterTable>,
}

impl GrpcRouterDriver {
    pub fn new(table: Rc<RouterTable>) -> Self {
        Self { table }
    }
}

impl Driver for GrpcRouterDriver {
    fn create(&self, id: &str, config: &Value, deps: &DepMap) -> Result<WorkerKind, WorkerError> {
        let worker = Rc::new(GrpcRouterWorker {
            id: id.to_string(),
            table: self.table.clone(),
        });
        worker.apply(config, deps)?;
        Ok(WorkerKind::Router(worker))
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use bytes::Bytes;
    use floodgate_core::{
        context::Context,
        router::ServiceHandler,
        worker::SKILL_SERVICE,
    };
    use http::{header, Method, Request};

    use super::*;

    struct StubService {
        name: &'static str,
    }

    impl Worker for StubService {
        fn id(&self) -> &str {
            self.name
        }

        fn reset(&self, _config: &Value, _deps: &DepMap) -> Result<(), WorkerError> {
            Ok(())
        }

        fn check_skill(&self, skill: &str) -> bool {
            skill == SKILL_SERVICE
        }
    }

    #[async_trait(?Send)]
    impl ServiceHandler for StubService {
        async fn handle(&self, ctx: &mut Context) {
            ctx.set_metadata("service", self.name);
        }
    }

    fn svc(name: &'static str) -> Rc<dyn ServiceWorker> {
        Rc::new(StubService { name })
    }

    fn ctx(method: Method, uri: &str, host: &str, port: u16) -> Context {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::HOST, host)
            .body(Bytes::new())
            .unwrap();
        Context::new(request, port, None)
    }

    fn handler_of(root: &Root, ctx: &Context) -> Option<String> {
        root.build().find_handler_id(ctx).map(str::to_string)
    }

    #[test]
    fn exact_path_and_host_beat_wildcards() {
        let mut root = Root::new();
        root.add("a", svc("svc-a"), 0, &[], "", &[]).unwrap();
        root.add(
            "b",
            svc("svc-b"),
            0,
            &["api.x".to_string()],
            "/v1/ping",
            &[],
        )
        .unwrap();

        let request = ctx(Method::GET, "http://api.x/v1/ping", "api.x", 8080);
        assert_eq!(handler_of(&root, &request).as_deref(), Some("b"));

        let other = ctx(Method::GET, "http://other/v1/ping", "other", 8080);
        assert_eq!(handler_of(&root, &other).as_deref(), Some("a"));
    }

    #[test]
    fn insertion_order_does_not_change_matching() {
        let routes: Vec<(&str, &str, &str)> = vec![
            ("r1", "api.x", "/v1/*"),
            ("r2", "api.x", "/v1/ping"),
            ("r3", "*", "/v1/ping"),
            ("r4", "api.x", "*.json"),
        ];
        let requests = [
            ("http://api.x/v1/ping", "api.x"),
            ("http://api.x/v1/other", "api.x"),
            ("http://api.x/data/a.json", "api.x"),
            ("http://y/v1/ping", "y"),
        ];

        let build = |order: &[usize]| {
            let mut root = Root::new();
            for &i in order {
                let (id, host, loc) = routes[i];
                root.add(id, svc("s"), 0, &[host.to_string()], loc, &[])
                    .unwrap();
            }
            root
        };

        let forward = build(&[0, 1, 2, 3]);
        let backward = build(&[3, 2, 1, 0]);
        for (uri, host) in requests {
            let request = ctx(Method::GET, uri, host, 80);
            assert_eq!(
                handler_of(&forward, &request),
                handler_of(&backward, &request),
                "order-dependent match for {uri}"
            );
        }
    }

    #[test]
    fn more_append_rules_win() {
        let mut root = Root::new();
        root.add("plain", svc("s"), 0, &[], "/v1/x", &[]).unwrap();
        root.add(
            "narrow",
            svc("s"),
            0,
            &[],
            "/v1/x",
            &[
                AppendRule::header("X-Env", "prod"),
                AppendRule::method("GET"),
            ],
        )
        .unwrap();

        let request = Request::builder()
            .method(Method::GET)
            .uri("http://h/v1/x")
            .header(header::HOST, "h")
            .header("X-Env", "prod")
            .body(Bytes::new())
            .unwrap();
        let matching = Context::new(request, 80, None);
        assert_eq!(handler_of(&root, &matching).as_deref(), Some("narrow"));

        let plain = ctx(Method::POST, "http://h/v1/x", "h", 80);
        assert_eq!(handler_of(&root, &plain).as_deref(), Some("plain"));
    }

    #[test]
    fn method_rules_are_case_insensitive() {
        let mut root = Root::new();
        root.add(
            "get-only",
            svc("s"),
            0,
            &[],
            "/m",
            &[AppendRule::method("get")],
        )
        .unwrap();
        let get = ctx(Method::GET, "http://h/m", "h", 80);
        assert_eq!(handler_of(&root, &get).as_deref(), Some("get-only"));
        let post = ctx(Method::POST, "http://h/m", "h", 80);
        assert_eq!(handler_of(&root, &post), None);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut root = Root::new();
        root.add("a", svc("s"), 0, &[], "/dup", &[]).unwrap();
        let err = root.add("b", svc("s"), 0, &[], "/dup", &[]).unwrap_err();
        assert!(matches!(err, RouterBuildError::Duplicate { .. }));
        // same id may re-register the same shape
        root.add("a", svc("s"), 0, &[], "/dup", &[]).unwrap();
    }

    #[test]
    fn exact_port_wins_over_wildcard_port() {
        let mut root = Root::new();
        root.add("any-port", svc("s"), 0, &[], "/p", &[]).unwrap();
        root.add("p9000", svc("s"), 9000, &[], "/p", &[]).unwrap();

        let on_9000 = ctx(Method::GET, "http://h/p", "h", 9000);
        assert_eq!(handler_of(&root, &on_9000).as_deref(), Some("p9000"));
        let elsewhere = ctx(Method::GET, "http://h/p", "h", 9001);
        assert_eq!(handler_of(&root, &elsewhere).as_deref(), Some("any-port"));
    }

    #[test]
    fn prefix_specificity_prefers_longer_literal() {
        let mut root = Root::new();
        root.add("short", svc("s"), 0, &[], "/api/*", &[]).unwrap();
        root.add("long", svc("s"), 0, &[], "/api/v2/*", &[]).unwrap();
        let request = ctx(Method::GET, "http://h/api/v2/x", "h", 80);
        assert_eq!(handler_of(&root, &request).as_deref(), Some("long"));
    }

    #[test]
    fn grpc_location_wildcards() {
        assert_eq!(grpc_location("demo.Echo", "Say"), "/demo.Echo/Say");
        assert_eq!(grpc_location("demo.Echo", ""), "/demo.Echo/*");
        assert_eq!(grpc_location("", ""), "");
    }

    #[test]
    fn table_apply_failure_keeps_previous_tree() {
        let table = RouterTable::new();
        table
            .apply(
                "w1",
                vec![RouteSpec {
                    id: "w1:0".into(),
                    port: 0,
                    hosts: vec![],
                    location: "/a".into(),
                    appends: vec![],
                    target: svc("s"),
                }],
            )
            .unwrap();
        let epoch = table.epoch();

        // colliding handler from another worker
        let err = table.apply(
            "w2",
            vec![RouteSpec {
                id: "w2:0".into(),
                port: 0,
                hosts: vec![],
                location: "/a".into(),
                appends: vec![],
                target: svc("s"),
            }],
        );
        assert!(err.is_err());
        assert_eq!(table.epoch(), epoch);

        let request = ctx(Method::GET, "http://h/a", "h", 80);
        assert!(table.find(&request).is_some());

        table.remove("w1");
        assert!(table.find(&request).is_none());
    }
}
