//! The `service-http` worker: binds an upstream to a filter chain,
//! timeout, retry budget and scheme/method overrides.
//!
//! `handle` applies the overrides to the proxy view, runs the filter
//! chain and, unless a filter already answered, sends the request
//! upstream with at most `retry + 1` attempts inside one overall
//! deadline. Only connection setup and request-stage I/O failures are
//! retried; a decoded response of any status is final. Deadline expiry
//! aborts the in-flight attempt, marks its endpoint failed and
//! synthesizes a 504.

use std::{cell::RefCell, rc::Rc, time::Duration};

use async_trait::async_trait;
use floodgate_core::{
    config::{default_max_body_size, default_timeout_ms, from_value},
    context::Context,
    discovery::Endpoint,
    filter::{ChainState, FilterChain, HttpFilter, Next},
    router::ServiceHandler,
    upstream::{Execute, ExecuteError, Scheme, UpstreamWorker},
    worker::{
        require_filter, require_upstream, DepMap, Driver, FilterWorker, Worker, WorkerError,
        WorkerKind, SKILL_SERVICE,
    },
};
use http::{Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::{
    discovery::static_::parse_node_list,
    proxy::HttpExecutor,
    upstream::{BalanceStrategy, UpstreamHttpWorker},
};

#[derive(Deserialize)]
struct AnonymousUpstream {
    #[serde(rename = "type", default)]
    balance: BalanceStrategy,
    /// Inline node list, `host:port[ weight]` entries separated by `;`.
    config: String,
}

#[derive(Deserialize)]
struct ServiceHttpConfig {
    #[serde(default)]
    upstream: Option<String>,
    #[serde(default)]
    upstream_anonymous: Option<AnonymousUpstream>,
    #[serde(default = "default_timeout_ms")]
    timeout: u64,
    #[serde(default)]
    retry: usize,
    #[serde(default)]
    scheme: Option<Scheme>,
    #[serde(default)]
    proxy_method: Option<String>,
    #[serde(default)]
    plugin_config: Vec<String>,
    #[serde(default = "default_max_body_size")]
    max_body_size: usize,
}

/// Adapter lending the filter capability of a worker to a chain.
struct FilterRef(Rc<dyn FilterWorker>);

#[async_trait(?Send)]
impl HttpFilter for FilterRef {
    async fn do_filter(&self, ctx: &mut Context, next: Next<'_>) {
        self.0.do_filter(ctx, next).await;
    }
}

struct ServiceState {
    upstream: Rc<dyn UpstreamWorker>,
    chain: FilterChain,
    timeout: Duration,
    retry: usize,
    scheme_override: Option<Scheme>,
    proxy_method: Option<Method>,
    executor: HttpExecutor,
}

pub struct ServiceHttpWorker {
    id: String,
    state: RefCell<Rc<ServiceState>>,
}

impl ServiceHttpWorker {
    fn empty(id: &str) -> Self {
        Self {
            id: id.to_string(),
            state: RefCell::new(Rc::new(ServiceState {
                upstream: Rc::new(UpstreamHttpWorker::anonymous(
                    id,
                    Vec::new(),
                    BalanceStrategy::default(),
                    Scheme::default(),
                )),
                chain: FilterChain::default(),
                timeout: Duration::from_millis(default_timeout_ms()),
                retry: 0,
                scheme_override: None,
                proxy_method: None,
                executor: HttpExecutor::new(Scheme::default(), None, default_max_body_size()),
            })),
        }
    }
}

impl Worker for ServiceHttpWorker {
    fn id(&self) -> &str {
        &self.id
    }

    fn reset(&self, config: &Value, deps: &DepMap) -> Result<(), WorkerError> {
        let cfg: ServiceHttpConfig = from_value(config)?;

        let upstream: Rc<dyn UpstreamWorker> = if let Some(up_id) = &cfg.upstream {
            require_upstream(deps, up_id)?
        } else if let Some(anon) = &cfg.upstream_anonymous {
            let nodes = parse_node_list(&anon.config)
                .map_err(|e| WorkerError::Config(e.to_string()))?;
            Rc::new(UpstreamHttpWorker::anonymous(
                &self.id,
                nodes,
                anon.balance,
                cfg.scheme.unwrap_or_default(),
            ))
        } else {
            return Err(WorkerError::Config(
                "service needs `upstream` or `upstream_anonymous`".into(),
            ));
        };

        let mut filters: Vec<Rc<dyn HttpFilter>> = Vec::with_capacity(cfg.plugin_config.len());
        for filter_id in &cfg.plugin_config {
            filters.push(Rc::new(FilterRef(require_filter(deps, filter_id)?)));
        }

        let proxy_method = match cfg.proxy_method.as_deref() {
            None | Some("") => None,
            Some(m) => Some(
                Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                    .map_err(|_| WorkerError::Config(format!("invalid proxy_method `{m}`")))?,
            ),
        };

        let timeout = Duration::from_millis(cfg.timeout);
        let pool_scheme = cfg.scheme.unwrap_or_else(|| upstream.scheme());
        let mut executor = HttpExecutor::new(pool_scheme, Some(timeout), cfg.max_body_size);
        executor.transfer_pools_from(&self.state.borrow().executor);

        *self.state.borrow_mut() = Rc::new(ServiceState {
            upstream,
            chain: FilterChain::new(filters),
            timeout,
            retry: cfg.retry,
            scheme_override: cfg.scheme,
            proxy_method,
            executor,
        });
        Ok(())
    }

    fn check_skill(&self, skill: &str) -> bool {
        skill == SKILL_SERVICE
    }
}

pub(crate) enum DispatchError {
    NoNode,
    Upstream(ExecuteError),
}

/// Attempt loop of one request. Each attempt selects an endpoint,
/// records it as in flight and sends; retriable failures mark the
/// endpoint and move on while the retry budget lasts.
pub(crate) async fn dispatch<E: Execute + ?Sized>(
    executor: &E,
    upstream: &Rc<dyn UpstreamWorker>,
    ctx: &mut Context,
    scheme: Scheme,
    retry: usize,
    inflight: &RefCell<Option<Rc<Endpoint>>>,
) -> Result<(), DispatchError> {
    let attempts = retry + 1;
    let mut last_error = None;
    for attempt in 0..attempts {
        let endpoint = upstream.select(ctx).map_err(|_| DispatchError::NoNode)?;
        *inflight.borrow_mut() = Some(endpoint.clone());
        match executor.execute(ctx.proxy(), &endpoint, scheme).await {
            Ok(response) => {
                upstream.report_success(&endpoint);
                ctx.set_metadata("upstream", endpoint.authority());
                ctx.set_response(response);
                return Ok(());
            }
            Err(e) if e.is_retriable() => {
                upstream.report_failure(&endpoint);
                warn!(
                    endpoint = %endpoint.key(),
                    attempt,
                    "retriable upstream failure: {e}"
                );
                last_error = Some(e);
            }
            Err(e) => {
                upstream.report_failure(&endpoint);
                return Err(DispatchError::Upstream(e));
            }
        }
    }
    Err(DispatchError::Upstream(
        last_error.expect("at least one attempt ran"),
    ))
}

#[async_trait(?Send)]
impl ServiceHandler for ServiceHttpWorker {
    async fn handle(&self, ctx: &mut Context) {
        let state = self.state.borrow().clone();
        ctx.set_metadata("service", self.id.clone());

        if let Some(method) = &state.proxy_method {
            ctx.proxy_mut().set_method(method.clone());
        }
        let scheme = state
            .scheme_override
            .unwrap_or_else(|| state.upstream.scheme());

        if state.chain.run(ctx).await == ChainState::Responded {
            ctx.run_finalizers();
            return;
        }

        let inflight = RefCell::new(None);
        let sent = monoio::time::timeout(
            state.timeout,
            dispatch(
                &state.executor,
                &state.upstream,
                ctx,
                scheme,
                state.retry,
                &inflight,
            ),
        )
        .await;
        match sent {
            Ok(Ok(())) => {}
            Ok(Err(DispatchError::NoNode)) => {
                ctx.set_error_response(StatusCode::BAD_GATEWAY, "upstream has no live endpoint");
            }
            Ok(Err(DispatchError::Upstream(e))) => {
                ctx.set_error_response(
                    StatusCode::BAD_GATEWAY,
                    &format!("upstream request failed: {e}"),
                );
            }
            Err(_) => {
                if let Some(endpoint) = inflight.borrow().as_ref() {
                    state.upstream.report_failure(endpoint);
                }
                ctx.set_error_response(StatusCode::GATEWAY_TIMEOUT, "upstream request timed out");
            }
        }
        ctx.run_finalizers();
    }
}

pub struct ServiceHttpDriver;

impl Driver for ServiceHttpDriver {
    fn create(&self, id: &str, config: &Value, deps: &DepMap) -> Result<WorkerKind, WorkerError> {
        let worker = Rc::new(ServiceHttpWorker::empty(id));
        worker.reset(config, deps)?;
        Ok(WorkerKind::Service(worker))
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, collections::VecDeque};

    use bytes::Bytes;
    use http::{Request, Response};

    use super::*;

    struct MockExecute {
        outcomes: RefCell<VecDeque<Result<&'static str, ExecuteError>>>,
        calls: Cell<usize>,
    }

    impl MockExecute {
        fn new(outcomes: Vec<Result<&'static str, ExecuteError>>) -> Self {
            Self {
                outcomes: RefCell::new(outcomes.into()),
                calls: Cell::new(0),
            }
        }
    }

    #[async_trait(?Send)]
    impl Execute for MockExecute {
        async fn execute(
            &self,
            _proxy: &floodgate_core::context::ProxyRequest,
            _endpoint: &Endpoint,
            _scheme: Scheme,
        ) -> Result<Response<Bytes>, ExecuteError> {
            self.calls.set(self.calls.get() + 1);
            match self.outcomes.borrow_mut().pop_front().expect("scripted") {
                Ok(body) => Ok(Response::new(Bytes::from_static(body.as_bytes()))),
                Err(e) => Err(e),
            }
        }
    }

    fn upstream(addrs: &[&str]) -> Rc<dyn UpstreamWorker> {
        let nodes = addrs
            .iter()
            .map(|a| Rc::new(Endpoint::new(*a, 80)))
            .collect();
        Rc::new(UpstreamHttpWorker::anonymous(
            "test-up",
            nodes,
            BalanceStrategy::RoundRobin,
            Scheme::Http,
        ))
    }

    fn ctx() -> Context {
        let request = Request::builder().uri("/x").body(Bytes::new()).unwrap();
        Context::new(request, 80, None)
    }

    #[test]
    fn connection_reset_is_retried_on_the_next_endpoint() {
        let executor = MockExecute::new(vec![
            Err(ExecuteError::Io("connection reset by peer".into())),
            Ok("from-b"),
        ]);
        let upstream = upstream(&["a", "b"]);
        let mut ctx = ctx();
        let inflight = RefCell::new(None);

        let result = futures::executor::block_on(dispatch(
            &executor,
            &upstream,
            &mut ctx,
            Scheme::Http,
            2,
            &inflight,
        ));
        assert!(result.is_ok());
        assert_eq!(executor.calls.get(), 2);
        assert_eq!(ctx.response().unwrap().body().as_ref(), b"from-b");
        assert_eq!(
            ctx.metadata("upstream").unwrap().as_str().unwrap(),
            "b:80"
        );
    }

    #[test]
    fn attempts_are_bounded_by_the_retry_budget() {
        let executor = MockExecute::new(vec![
            Err(ExecuteError::Connect("refused".into())),
            Err(ExecuteError::Connect("refused".into())),
            Err(ExecuteError::Connect("refused".into())),
            Err(ExecuteError::Connect("refused".into())),
        ]);
        let upstream = upstream(&["a", "b"]);
        let mut ctx = ctx();
        let inflight = RefCell::new(None);

        let result = futures::executor::block_on(dispatch(
            &executor,
            &upstream,
            &mut ctx,
            Scheme::Http,
            2,
            &inflight,
        ));
        assert!(matches!(result, Err(DispatchError::Upstream(_))));
        assert_eq!(executor.calls.get(), 3);
    }

    #[test]
    fn no_live_endpoint_means_no_outbound_attempt() {
        let executor = MockExecute::new(vec![]);
        let upstream = upstream(&["a"]);
        let dead = Endpoint::new("a", 80);
        for _ in 0..5 {
            upstream.report_failure(&dead);
        }
        let mut ctx = ctx();
        let inflight = RefCell::new(None);

        let result = futures::executor::block_on(dispatch(
            &executor,
            &upstream,
            &mut ctx,
            Scheme::Http,
            3,
            &inflight,
        ));
        assert!(matches!(result, Err(DispatchError::NoNode)));
        assert_eq!(executor.calls.get(), 0);
    }

    #[test]
    fn non_retriable_errors_stop_the_loop() {
        let executor = MockExecute::new(vec![Err(ExecuteError::BodyTooLarge(16))]);
        let upstream = upstream(&["a", "b"]);
        let mut ctx = ctx();
        let inflight = RefCell::new(None);

        let result = futures::executor::block_on(dispatch(
            &executor,
            &upstream,
            &mut ctx,
            Scheme::Http,
            5,
            &inflight,
        ));
        assert!(matches!(result, Err(DispatchError::Upstream(_))));
        assert_eq!(executor.calls.get(), 1);
    }

    struct SlowExecute;

    #[async_trait(?Send)]
    impl Execute for SlowExecute {
        async fn execute(
            &self,
            _proxy: &floodgate_core::context::ProxyRequest,
            _endpoint: &Endpoint,
            _scheme: Scheme,
        ) -> Result<Response<Bytes>, ExecuteError> {
            monoio::time::sleep(Duration::from_millis(200)).await;
            Ok(Response::new(Bytes::new()))
        }
    }

    #[monoio::test(timer_enabled = true)]
    async fn deadline_expiry_aborts_the_attempt() {
        let upstream = upstream(&["a"]);
        let mut ctx = ctx();
        let inflight = RefCell::new(None);

        let result = monoio::time::timeout(
            Duration::from_millis(20),
            dispatch(&SlowExecute, &upstream, &mut ctx, Scheme::Http, 0, &inflight),
        )
        .await;
        assert!(result.is_err());
        // the aborted attempt left its endpoint recorded for failure marking
        assert_eq!(inflight.borrow().as_ref().unwrap().addr, "a");
        assert!(ctx.response().is_none());
    }

    #[test]
    fn service_config_requires_an_upstream() {
        let worker = ServiceHttpWorker::empty("svc");
        let err = worker
            .reset(&serde_json::json!({ "timeout": 50 }), &DepMap::new())
            .unwrap_err();
        assert!(matches!(err, WorkerError::Config(_)));
    }

    #[test]
    fn anonymous_upstream_from_inline_nodes() {
        let worker = ServiceHttpWorker::empty("svc");
        worker
            .reset(
                &serde_json::json!({
                    "upstream_anonymous": { "type": "round_robin", "config": "10.0.0.1:80 2;10.0.0.2:80" },
                    "retry": 1,
                }),
                &DepMap::new(),
            )
            .unwrap();
        let state = worker.state.borrow().clone();
        assert_eq!(state.retry, 1);
        let ctx = ctx();
        assert!(state.upstream.select(&ctx).is_ok());
    }
}
