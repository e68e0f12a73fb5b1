//! API-key authentication.
//!
//! The key is looked up in the `Authorization` header, the `Apikey`
//! query parameter, or an `Apikey` field of a form or JSON body, in that
//! order. With `hide_credentials` the matched location is stripped from
//! the proxy view so the upstream never sees the key; a JSON body is
//! re-serialized without the field, other body bytes stay untouched.

use std::{cell::RefCell, rc::Rc};

use async_trait::async_trait;
use bytes::Bytes;
use floodgate_core::{
    config::from_value,
    context::Context,
    filter::{HttpFilter, Next},
    worker::{DepMap, Driver, Worker, WorkerError, WorkerKind, SKILL_AUTH, SKILL_FILTER},
};
use http::header;
use serde::Deserialize;
use serde_json::Value;

use super::{check_authorization_type, expired, reject, AuthError};

const NAME: &str = "apikey_auth";
const SUPPORT_TYPES: &[&str] = &["apikey", "apikey_auth", "apikey-auth", "apikeyauth"];
const PARAM: &str = "Apikey";

#[derive(Deserialize, Clone)]
struct ApikeyUser {
    apikey: String,
    #[serde(default)]
    expire: i64,
}

#[derive(Deserialize)]
struct ApikeyConfig {
    #[serde(default, alias = "user")]
    users: Vec<ApikeyUser>,
    #[serde(default)]
    hide_credentials: bool,
}

struct ApikeyState {
    users: Vec<ApikeyUser>,
    hide: bool,
}

pub struct ApikeyAuthWorker {
    id: String,
    state: RefCell<Rc<ApikeyState>>,
}

impl ApikeyAuthWorker {
    fn credential(&self, ctx: &mut Context, hide: bool) -> Result<String, AuthError> {
        // header first
        if let Some(value) = ctx
            .request()
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
        {
            let value = value.to_string();
            if hide {
                ctx.proxy_mut().remove_header(header::AUTHORIZATION.as_str());
            }
            return Ok(value);
        }

        // then the query string
        if let Some(value) = ctx.request_query(PARAM).filter(|v| !v.is_empty()) {
            if hide {
                ctx.proxy_mut().query_del(PARAM);
            }
            return Ok(value);
        }

        // finally the body
        match ctx.proxy().content_type() {
            Some("application/x-www-form-urlencoded") => {
                let form = ctx.proxy().body_form();
                let value = form
                    .iter()
                    .find(|(k, _)| k == PARAM)
                    .map(|(_, v)| v.clone())
                    .ok_or(AuthError::Missing)?;
                if hide {
                    let kept: Vec<_> =
                        form.into_iter().filter(|(k, _)| k != PARAM).collect();
                    ctx.proxy_mut().set_form(&kept);
                }
                Ok(value)
            }
            Some("application/json") => {
                let mut body: Value = serde_json::from_slice(ctx.request().body())
                    .map_err(|e| AuthError::Malformed(format!("invalid json body: {e}")))?;
                let value = match body.get(PARAM) {
                    Some(Value::String(s)) => s.clone(),
                    Some(_) => {
                        return Err(AuthError::Malformed(format!(
                            "`{PARAM}` must be a string"
                        )))
                    }
                    None => return Err(AuthError::Missing),
                };
                if hide {
                    if let Some(map) = body.as_object_mut() {
                        map.remove(PARAM);
                    }
                    ctx.proxy_mut()
                        .set_raw("application/json", Bytes::from(body.to_string()));
                }
                Ok(value)
            }
            _ => Err(AuthError::Missing),
        }
    }
}

impl Worker for ApikeyAuthWorker {
    fn id(&self) -> &str {
        &self.id
    }

    fn reset(&self, config: &Value, _deps: &DepMap) -> Result<(), WorkerError> {
        let cfg: ApikeyConfig = from_value(config)?;
        *self.state.borrow_mut() = Rc::new(ApikeyState {
            users: cfg.users,
            hide: cfg.hide_credentials,
        });
        Ok(())
    }

    fn check_skill(&self, skill: &str) -> bool {
        skill == SKILL_FILTER || skill == SKILL_AUTH
    }
}

#[async_trait(?Send)]
impl HttpFilter for ApikeyAuthWorker {
    async fn do_filter(&self, ctx: &mut Context, next: Next<'_>) {
        if let Err(e) = check_authorization_type(SUPPORT_TYPES, ctx) {
            return reject(ctx, NAME, &e);
        }
        let state = self.state.borrow().clone();
        let value = match self.credential(ctx, state.hide) {
            Ok(value) => value,
            Err(e) => return reject(ctx, NAME, &e),
        };
        for user in &state.users {
            if user.apikey == value {
                if expired(user.expire) {
                    return reject(ctx, NAME, &AuthError::Expired);
                }
                return next.do_chain(ctx).await;
            }
        }
        reject(ctx, NAME, &AuthError::InvalidUser)
    }
}

pub struct ApikeyAuthDriver;

impl Driver for ApikeyAuthDriver {
    fn create(&self, id: &str, config: &Value, deps: &DepMap) -> Result<WorkerKind, WorkerError> {
        let worker = Rc::new(ApikeyAuthWorker {
            id: id.to_string(),
            state: RefCell::new(Rc::new(ApikeyState {
                users: Vec::new(),
                hide: false,
            })),
        });
        worker.reset(config, deps)?;
        Ok(WorkerKind::Filter(worker))
    }
}

#[cfg(test)]
mod tests {
    use floodgate_core::filter::{ChainState, FilterChain};
    use http::{Request, StatusCode};

    use super::*;

    fn worker(users: &[(&str, i64)], hide: bool) -> Rc<ApikeyAuthWorker> {
        let users: Vec<_> = users
            .iter()
            .map(|(k, e)| serde_json::json!({ "apikey": k, "expire": e }))
            .collect();
        let worker = Rc::new(ApikeyAuthWorker {
            id: "apikey".into(),
            state: RefCell::new(Rc::new(ApikeyState {
                users: Vec::new(),
                hide: false,
            })),
        });
        worker
            .reset(
                &serde_json::json!({ "users": users, "hide_credentials": hide }),
                &DepMap::new(),
            )
            .unwrap();
        worker
    }

    fn run(worker: Rc<ApikeyAuthWorker>, mut ctx: Context) -> (ChainState, Context) {
        let chain = FilterChain::new(vec![worker as Rc<dyn HttpFilter>]);
        let state = futures::executor::block_on(chain.run(&mut ctx));
        (state, ctx)
    }

    #[test]
    fn key_in_query_is_accepted_and_hidden() {
        let ctx = Context::new(
            Request::builder()
                .uri("/x?Apikey=k1&keep=1")
                .body(Bytes::new())
                .unwrap(),
            80,
            None,
        );
        let (state, ctx) = run(worker(&[("k1", 0)], true), ctx);
        assert_eq!(state, ChainState::Completed);
        // the forwarded query no longer carries the credential
        assert_eq!(ctx.proxy().query_get("Apikey"), None);
        assert_eq!(ctx.proxy().query_get("keep").as_deref(), Some("1"));
    }

    #[test]
    fn unknown_key_is_rejected() {
        let ctx = Context::new(
            Request::builder()
                .uri("/x?Apikey=nope")
                .body(Bytes::new())
                .unwrap(),
            80,
            None,
        );
        let (state, ctx) = run(worker(&[("k1", 0)], false), ctx);
        assert_eq!(state, ChainState::Responded);
        assert_eq!(
            ctx.response().unwrap().status(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn expired_user_is_rejected() {
        let ctx = Context::new(
            Request::builder()
                .uri("/x?Apikey=k1")
                .body(Bytes::new())
                .unwrap(),
            80,
            None,
        );
        let (state, _) = run(worker(&[("k1", 1)], false), ctx);
        assert_eq!(state, ChainState::Responded);
    }

    #[test]
    fn key_in_json_body_is_hidden() {
        let ctx = Context::new(
            Request::builder()
                .method(http::Method::POST)
                .uri("/x")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Bytes::from_static(br#"{"Apikey":"k1","a":1}"#))
                .unwrap(),
            80,
            None,
        );
        let (state, ctx) = run(worker(&[("k1", 0)], true), ctx);
        assert_eq!(state, ChainState::Completed);
        let body: Value = serde_json::from_slice(ctx.proxy().body()).unwrap();
        assert!(body.get("Apikey").is_none());
        assert_eq!(body["a"], 1);
    }

    #[test]
    fn wrong_authorization_type_is_rejected() {
        let ctx = Context::new(
            Request::builder()
                .uri("/x?Apikey=k1")
                .header(super::super::AUTHORIZATION_TYPE, "basic")
                .body(Bytes::new())
                .unwrap(),
            80,
            None,
        );
        let (state, ctx) = run(worker(&[("k1", 0)], false), ctx);
        assert_eq!(state, ChainState::Responded);
        assert_eq!(
            ctx.response().unwrap().status(),
            StatusCode::UNAUTHORIZED
        );
    }
}
