//! Parameter injection filter.
//!
//! Injects or overrides query, header and body parameters on the proxy
//! view. Each parameter carries a conflict policy deciding what happens
//! when the inbound request already provides it: `error` fails the
//! request with 400, `origin` keeps the inbound value, `convert`
//! overwrites it. JSON bodies are addressed with `$.a.b` member paths;
//! form bodies are re-encoded with the injected parameters visible.
//! Bodies are only touched for POST, PUT and PATCH.

use std::{cell::RefCell, rc::Rc};

use async_trait::async_trait;
use bytes::Bytes;
use floodgate_core::{
    config::from_value,
    context::Context,
    filter::{HttpFilter, Next},
    worker::{DepMap, Driver, Worker, WorkerError, WorkerKind, SKILL_FILTER},
};
use http::{Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

const NAME: &str = "extra_params";

#[derive(Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum Position {
    Query,
    Header,
    Body,
}

#[derive(Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
enum Conflict {
    Error,
    #[default]
    Origin,
    Convert,
}

#[derive(Deserialize, Clone)]
struct ParamConfig {
    name: String,
    position: Position,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    conflict: Conflict,
}

#[derive(Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
enum BodyType {
    Json,
    FormData,
}

#[derive(Deserialize)]
struct ExtraParamsConfig {
    #[serde(default)]
    params: Vec<ParamConfig>,
    #[serde(default)]
    request_body_type: Option<BodyType>,
}

struct ExtraParamsState {
    query: Vec<ParamConfig>,
    header: Vec<ParamConfig>,
    body: Vec<ParamConfig>,
    body_type: Option<BodyType>,
}

pub struct ExtraParamsWorker {
    id: String,
    state: RefCell<Rc<ExtraParamsState>>,
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn path_segments(name: &str) -> Vec<&str> {
    name.strip_prefix("$.")
        .unwrap_or(name)
        .split('.')
        .filter(|s| !s.is_empty())
        .collect()
}

fn json_get<'a>(root: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    let mut current = root;
    for segment in segments {
        current = current.get(segment)?;
    }
    Some(current)
}

fn json_set(root: &mut Value, segments: &[&str], value: Value) -> Result<(), ()> {
    let mut current = root;
    let (last, parents) = segments.split_last().ok_or(())?;
    for segment in parents {
        let map = current.as_object_mut().ok_or(())?;
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
    }
    current
        .as_object_mut()
        .ok_or(())?
        .insert(last.to_string(), value);
    Ok(())
}

enum ApplyError {
    Conflict(String),
    BodyType(&'static str),
}

impl ExtraParamsWorker {
    fn apply(&self, ctx: &mut Context) -> Result<(), ApplyError> {
        let state = self.state.borrow().clone();
        let method = ctx.proxy().method().clone();
        let has_body = matches!(method, Method::POST | Method::PUT | Method::PATCH);

        if has_body && (!state.body.is_empty() || state.body_type.is_some()) {
            let content_type = ctx.proxy().content_type().map(str::to_string);
            match (state.body_type, content_type.as_deref()) {
                (Some(BodyType::Json), ct) if ct != Some("application/json") => {
                    return Err(ApplyError::BodyType("request body type is not json"));
                }
                (Some(BodyType::FormData), ct)
                    if ct != Some("application/x-www-form-urlencoded")
                        && ct != Some("multipart/form-data") =>
                {
                    return Err(ApplyError::BodyType("request body type is not form-data"));
                }
                _ => {}
            }
            match content_type.as_deref() {
                Some("application/json") => self.apply_json_body(ctx, &state)?,
                Some("application/x-www-form-urlencoded") => {
                    self.apply_form_body(ctx, &state)?
                }
                _ => {}
            }
        }

        for param in &state.query {
            let exists = ctx
                .proxy()
                .query_get(&param.name)
                .is_some_and(|v| !v.is_empty());
            if exists {
                match param.conflict {
                    Conflict::Error => {
                        return Err(ApplyError::Conflict(format!(
                            "query(\"{}\") has a conflict",
                            param.name
                        )))
                    }
                    Conflict::Origin => continue,
                    Conflict::Convert => {}
                }
            }
            ctx.proxy_mut()
                .query_set(&param.name, &value_text(&param.value));
        }

        for param in &state.header {
            let exists = ctx.proxy().header(&param.name).is_some();
            if exists {
                match param.conflict {
                    Conflict::Error => {
                        return Err(ApplyError::Conflict(format!(
                            "header(\"{}\") has a conflict",
                            param.name
                        )))
                    }
                    Conflict::Origin => continue,
                    Conflict::Convert => {}
                }
            }
            ctx.proxy_mut()
                .set_header(&param.name, &value_text(&param.value));
        }
        Ok(())
    }

    fn apply_json_body(
        &self,
        ctx: &mut Context,
        state: &ExtraParamsState,
    ) -> Result<(), ApplyError> {
        let raw = ctx.proxy().body();
        let mut body: Value = if raw.is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_slice(raw)
                .map_err(|_| ApplyError::Conflict("request body is not valid json".into()))?
        };
        for param in &state.body {
            let segments = path_segments(&param.name);
            if json_get(&body, &segments).is_some() {
                match param.conflict {
                    Conflict::Error => {
                        return Err(ApplyError::Conflict(format!(
                            "body({}) already exists",
                            param.name
                        )))
                    }
                    Conflict::Origin => continue,
                    Conflict::Convert => {}
                }
            }
            if json_set(&mut body, &segments, param.value.clone()).is_err() {
                warn!(param = %param.name, "json path does not address an object member");
            }
        }
        ctx.proxy_mut()
            .set_raw("application/json", Bytes::from(body.to_string()));
        Ok(())
    }

    fn apply_form_body(
        &self,
        ctx: &mut Context,
        state: &ExtraParamsState,
    ) -> Result<(), ApplyError> {
        let mut pairs = ctx.proxy().body_form();
        for param in &state.body {
            let existing = pairs.iter_mut().find(|(k, _)| *k == param.name);
            match existing {
                Some(pair) => match param.conflict {
                    Conflict::Error => {
                        return Err(ApplyError::Conflict(format!(
                            "body({}) already exists",
                            param.name
                        )))
                    }
                    Conflict::Origin => continue,
                    Conflict::Convert => pair.1 = value_text(&param.value),
                },
                None => pairs.push((param.name.clone(), value_text(&param.value))),
            }
        }
        ctx.proxy_mut().set_form(&pairs);
        Ok(())
    }
}

impl Worker for ExtraParamsWorker {
    fn id(&self) -> &str {
        &self.id
    }

    fn reset(&self, config: &Value, _deps: &DepMap) -> Result<(), WorkerError> {
        let cfg: ExtraParamsConfig = from_value(config)?;
        let mut query = Vec::new();
        let mut header = Vec::new();
        let mut body = Vec::new();
        for param in cfg.params {
            match param.position {
                Position::Query => query.push(param),
                Position::Header => header.push(param),
                Position::Body => body.push(param),
            }
        }
        *self.state.borrow_mut() = Rc::new(ExtraParamsState {
            query,
            header,
            body,
            body_type: cfg.request_body_type,
        });
        Ok(())
    }

    fn check_skill(&self, skill: &str) -> bool {
        skill == SKILL_FILTER
    }
}

#[async_trait(?Send)]
impl HttpFilter for ExtraParamsWorker {
    async fn do_filter(&self, ctx: &mut Context, next: Next<'_>) {
        match self.apply(ctx) {
            Ok(()) => next.do_chain(ctx).await,
            Err(ApplyError::Conflict(message)) => {
                ctx.set_error_response(StatusCode::BAD_REQUEST, &format!("[{NAME}] {message}"));
            }
            Err(ApplyError::BodyType(message)) => {
                ctx.set_error_response(StatusCode::BAD_REQUEST, &format!("[{NAME}] {message}"));
            }
        }
    }
}

pub struct ExtraParamsDriver;

impl Driver for ExtraParamsDriver {
    fn create(&self, id: &str, config: &Value, deps: &DepMap) -> Result<WorkerKind, WorkerError> {
        let worker = Rc::new(ExtraParamsWorker {
            id: id.to_string(),
            state: RefCell::new(Rc::new(ExtraParamsState {
                query: Vec::new(),
                header: Vec::new(),
                body: Vec::new(),
                body_type: None,
            })),
        });
        worker.reset(config, deps)?;
        Ok(WorkerKind::Filter(worker))
    }
}

#[cfg(test)]
mod tests {
    use floodgate_core::filter::{ChainState, FilterChain};
    use http::{header, Request};

    use super::*;

    fn worker(config: Value) -> Rc<ExtraParamsWorker> {
        let worker = Rc::new(ExtraParamsWorker {
            id: "extra".into(),
            state: RefCell::new(Rc::new(ExtraParamsState {
                query: Vec::new(),
                header: Vec::new(),
                body: Vec::new(),
                body_type: None,
            })),
        });
        worker.reset(&config, &DepMap::new()).unwrap();
        worker
    }

    fn run(config: Value, ctx: Context) -> (ChainState, Context) {
        let mut ctx = ctx;
        let chain = FilterChain::new(vec![worker(config) as Rc<dyn HttpFilter>]);
        let state = futures::executor::block_on(chain.run(&mut ctx));
        (state, ctx)
    }

    fn json_ctx(body: &'static str) -> Context {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/x")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Bytes::from_static(body.as_bytes()))
            .unwrap();
        Context::new(request, 80, None)
    }

    #[test]
    fn json_injection_respects_origin_policy() {
        let config = serde_json::json!({ "params": [
            { "name": "a", "position": "body", "value": 99, "conflict": "origin" },
            { "name": "b", "position": "body", "value": 2 },
        ]});
        let (state, ctx) = run(config, json_ctx(r#"{"a":1}"#));
        assert_eq!(state, ChainState::Completed);
        let body: Value = serde_json::from_slice(ctx.proxy().body()).unwrap();
        assert_eq!(body["a"], 1);
        assert_eq!(body["b"], 2);
    }

    #[test]
    fn json_convert_policy_overwrites() {
        let config = serde_json::json!({ "params": [
            { "name": "a", "position": "body", "value": "new", "conflict": "convert" },
        ]});
        let (_, ctx) = run(config, json_ctx(r#"{"a":"old"}"#));
        let body: Value = serde_json::from_slice(ctx.proxy().body()).unwrap();
        assert_eq!(body["a"], "new");
    }

    #[test]
    fn nested_json_paths_create_intermediate_objects() {
        let config = serde_json::json!({ "params": [
            { "name": "$.meta.trace", "position": "body", "value": "t-1" },
        ]});
        let (_, ctx) = run(config, json_ctx(r#"{}"#));
        let body: Value = serde_json::from_slice(ctx.proxy().body()).unwrap();
        assert_eq!(body["meta"]["trace"], "t-1");
    }

    #[test]
    fn conflict_error_fails_with_400() {
        let config = serde_json::json!({ "params": [
            { "name": "a", "position": "query", "value": "x", "conflict": "error" },
        ]});
        let request = Request::builder()
            .uri("/x?a=1")
            .body(Bytes::new())
            .unwrap();
        let (state, ctx) = run(config, Context::new(request, 80, None));
        assert_eq!(state, ChainState::Responded);
        assert_eq!(ctx.response().unwrap().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn query_and_header_injection() {
        let config = serde_json::json!({ "params": [
            { "name": "tenant", "position": "query", "value": "t1" },
            { "name": "X-Injected", "position": "header", "value": "yes" },
        ]});
        let request = Request::builder()
            .uri("/x?keep=1")
            .body(Bytes::new())
            .unwrap();
        let (state, ctx) = run(config, Context::new(request, 80, None));
        assert_eq!(state, ChainState::Completed);
        assert_eq!(ctx.proxy().query_get("tenant").as_deref(), Some("t1"));
        assert_eq!(ctx.proxy().header("x-injected"), Some("yes"));
    }

    #[test]
    fn form_injection_is_visible_to_the_upstream() {
        let config = serde_json::json!({ "params": [
            { "name": "b", "position": "body", "value": "2" },
        ]});
        let request = Request::builder()
            .method(Method::POST)
            .uri("/x")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Bytes::from_static(b"a=1"))
            .unwrap();
        let (state, ctx) = run(config, Context::new(request, 80, None));
        assert_eq!(state, ChainState::Completed);
        let pairs = ctx.proxy().body_form();
        assert!(pairs.contains(&("a".to_string(), "1".to_string())));
        assert!(pairs.contains(&("b".to_string(), "2".to_string())));
    }

    #[test]
    fn body_type_gate_rejects_mismatches() {
        let config = serde_json::json!({
            "request_body_type": "json",
            "params": [],
        });
        let request = Request::builder()
            .method(Method::POST)
            .uri("/x")
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Bytes::from_static(b"hello"))
            .unwrap();
        let (state, ctx) = run(config, Context::new(request, 80, None));
        assert_eq!(state, ChainState::Responded);
        assert_eq!(ctx.response().unwrap().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn get_requests_keep_their_body_untouched() {
        let config = serde_json::json!({ "params": [
            { "name": "b", "position": "body", "value": "2" },
        ]});
        let request = Request::builder()
            .method(Method::GET)
            .uri("/x")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Bytes::from_static(b"{}"))
            .unwrap();
        let (state, ctx) = run(config, Context::new(request, 80, None));
        assert_eq!(state, ChainState::Completed);
        assert_eq!(ctx.proxy().body().as_ref(), b"{}");
    }
}
