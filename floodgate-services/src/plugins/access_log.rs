//! Per-request access logging.
//!
//! The filter registers a finalizer so the entry is recorded after the
//! request settles, including on deadline expiry. Entries flow through a
//! channel to an asynchronous sink task; when more than `capacity`
//! entries are pending the new entry is dropped and counted instead of
//! blocking the request.

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use async_trait::async_trait;
use floodgate_core::{
    config::from_value,
    context::Context,
    filter::{HttpFilter, Next},
    worker::{DepMap, Driver, Worker, WorkerError, WorkerKind, SKILL_FILTER},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct AccessEntry {
    pub method: String,
    pub path: String,
    pub status: u16,
    pub latency_ms: u64,
    pub service: Option<String>,
    pub upstream: Option<String>,
}

/// Where finished entries end up. Concrete sinks (files, syslog, remote
/// collectors) live outside the core; the default writes through
/// `tracing`.
pub trait LogSink {
    fn write(&self, entry: &AccessEntry);
}

pub struct TracingSink;

impl LogSink for TracingSink {
    fn write(&self, entry: &AccessEntry) {
        info!(
            target: "floodgate::access",
            method = %entry.method,
            path = %entry.path,
            status = entry.status,
            latency_ms = entry.latency_ms,
            service = entry.service.as_deref().unwrap_or("-"),
            upstream = entry.upstream.as_deref().unwrap_or("-"),
        );
    }
}

const fn default_capacity() -> usize {
    1024
}

#[derive(Deserialize)]
struct AccessLogConfig {
    #[serde(default = "default_capacity")]
    capacity: usize,
}

type Tx = local_sync::mpsc::unbounded::Tx<AccessEntry>;
type Rx = local_sync::mpsc::unbounded::Rx<AccessEntry>;

struct Recorder {
    tx: Tx,
    rx: RefCell<Option<Rx>>,
    pending: Cell<usize>,
    capacity: Cell<usize>,
    dropped: Cell<u64>,
    drain_started: Cell<bool>,
    sink: Rc<dyn LogSink>,
}

impl Recorder {
    fn new(sink: Rc<dyn LogSink>, capacity: usize) -> Rc<Self> {
        let (tx, rx) = local_sync::mpsc::unbounded::channel();
        Rc::new(Self {
            tx,
            rx: RefCell::new(Some(rx)),
            pending: Cell::new(0),
            capacity: Cell::new(capacity),
            dropped: Cell::new(0),
            drain_started: Cell::new(false),
            sink,
        })
    }

    /// Queue an entry; drops it when the sink is falling behind.
    fn try_record(&self, entry: AccessEntry) -> bool {
        if self.pending.get() >= self.capacity.get() {
            self.dropped.set(self.dropped.get() + 1);
            if self.dropped.get().is_power_of_two() {
                warn!(dropped = self.dropped.get(), "access log sink overflow");
            }
            return false;
        }
        if self.tx.send(entry).is_ok() {
            self.pending.set(self.pending.get() + 1);
            true
        } else {
            false
        }
    }

    fn ensure_drain(self: &Rc<Self>) {
        if self.drain_started.get() {
            return;
        }
        let Some(mut rx) = self.rx.borrow_mut().take() else {
            return;
        };
        self.drain_started.set(true);
        let recorder = self.clone();
        monoio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                recorder.pending.set(recorder.pending.get().saturating_sub(1));
                recorder.sink.write(&entry);
            }
        });
    }
}

fn entry_from(ctx: &Context) -> AccessEntry {
    AccessEntry {
        method: ctx.request().method().to_string(),
        path: ctx.request().uri().path().to_string(),
        status: ctx.response().map(|r| r.status().as_u16()).unwrap_or(0),
        latency_ms: ctx.started_at().elapsed().as_millis() as u64,
        service: ctx
            .metadata("service")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        upstream: ctx
            .metadata("upstream")
            .and_then(|v| v.as_str())
            .map(str::to_string),
    }
}

pub struct AccessLogWorker {
    id: String,
    recorder: Rc<Recorder>,
}

impl Worker for AccessLogWorker {
    fn id(&self) -> &str {
        &self.id
    }

    fn reset(&self, config: &Value, _deps: &DepMap) -> Result<(), WorkerError> {
        let cfg: AccessLogConfig = from_value(config)?;
        self.recorder.capacity.set(cfg.capacity);
        Ok(())
    }

    fn check_skill(&self, skill: &str) -> bool {
        skill == SKILL_FILTER
    }
}

#[async_trait(?Send)]
impl HttpFilter for AccessLogWorker {
    async fn do_filter(&self, ctx: &mut Context, next: Next<'_>) {
        self.recorder.ensure_drain();
        let recorder = self.recorder.clone();
        ctx.defer(move |ctx| {
            recorder.try_record(entry_from(ctx));
        });
        next.do_chain(ctx).await
    }
}

pub struct AccessLogDriver;

impl Driver for AccessLogDriver {
    fn create(&self, id: &str, config: &Value, deps: &DepMap) -> Result<WorkerKind, WorkerError> {
        let worker = Rc::new(AccessLogWorker {
            id: id.to_string(),
            recorder: Recorder::new(Rc::new(TracingSink), default_capacity()),
        });
        worker.reset(config, deps)?;
        Ok(WorkerKind::Filter(worker))
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use floodgate_core::filter::FilterChain;
    use http::{Request, StatusCode};

    use super::*;

    #[derive(Default)]
    struct CollectSink {
        entries: RefCell<Vec<AccessEntry>>,
    }

    impl LogSink for CollectSink {
        fn write(&self, entry: &AccessEntry) {
            self.entries.borrow_mut().push(entry.clone());
        }
    }

    fn entry(status: u16) -> AccessEntry {
        AccessEntry {
            method: "GET".into(),
            path: "/x".into(),
            status,
            latency_ms: 1,
            service: None,
            upstream: None,
        }
    }

    #[test]
    fn overflow_drops_instead_of_blocking() {
        let recorder = Recorder::new(Rc::new(TracingSink), 2);
        assert!(recorder.try_record(entry(200)));
        assert!(recorder.try_record(entry(200)));
        // sink not draining; the third entry is dropped
        assert!(!recorder.try_record(entry(200)));
        assert_eq!(recorder.dropped.get(), 1);
        assert_eq!(recorder.pending.get(), 2);
    }

    #[monoio::test(timer_enabled = true)]
    async fn entries_reach_the_sink_after_finalizers_run() {
        let sink = Rc::new(CollectSink::default());
        let worker = Rc::new(AccessLogWorker {
            id: "log".into(),
            recorder: Recorder::new(sink.clone(), 16),
        });

        let request = Request::builder().uri("/logged").body(Bytes::new()).unwrap();
        let mut ctx = Context::new(request, 80, None);
        ctx.set_metadata("service", "svc-a");

        let chain = FilterChain::new(vec![worker as Rc<dyn HttpFilter>]);
        chain.run(&mut ctx).await;
        ctx.set_error_response(StatusCode::BAD_GATEWAY, "down");
        ctx.run_finalizers();

        // let the drain task run
        monoio::time::sleep(std::time::Duration::from_millis(5)).await;
        let entries = sink.entries.borrow();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "/logged");
        assert_eq!(entries[0].status, 502);
        assert_eq!(entries[0].service.as_deref(), Some("svc-a"));
    }
}
