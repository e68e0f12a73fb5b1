//! Access-key / secret-key authentication.
//!
//! The client sends `Authorization: AKSK ak=<key>,signature=<hex>` where
//! the signature is HMAC-SHA256 over
//! `method \n path \n query \n X-Gateway-Date` with the user's secret
//! key. Comparison is case-insensitive on the hex digest.

use std::{cell::RefCell, rc::Rc};

use async_trait::async_trait;
use floodgate_core::{
    config::from_value,
    context::Context,
    filter::{HttpFilter, Next},
    worker::{DepMap, Driver, Worker, WorkerError, WorkerKind, SKILL_AUTH, SKILL_FILTER},
};
use hmac::{Hmac, Mac};
use http::header;
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;

use super::{check_authorization_type, expired, reject, AuthError};

const NAME: &str = "aksk_auth";
const SUPPORT_TYPES: &[&str] = &["aksk", "aksk_auth", "aksk-auth", "akskauth"];
const DATE_HEADER: &str = "X-Gateway-Date";

type HmacSha256 = Hmac<Sha256>;

#[derive(Deserialize, Clone)]
struct AkskUser {
    ak: String,
    sk: String,
    #[serde(default)]
    expire: i64,
}

#[derive(Deserialize)]
struct AkskConfig {
    #[serde(default, alias = "user")]
    users: Vec<AkskUser>,
    #[serde(default)]
    hide_credentials: bool,
}

struct AkskState {
    users: Vec<AkskUser>,
    hide: bool,
}

pub struct AkskAuthWorker {
    id: String,
    state: RefCell<Rc<AkskState>>,
}

fn parse_credential(header: &str) -> Result<(String, String), AuthError> {
    let fields = header
        .strip_prefix("AKSK ")
        .or_else(|| header.strip_prefix("aksk "))
        .unwrap_or(header);
    let mut ak = None;
    let mut signature = None;
    for field in fields.split(',') {
        match field.trim().split_once('=') {
            Some(("ak", v)) => ak = Some(v.to_string()),
            Some(("signature", v)) => signature = Some(v.to_string()),
            _ => {}
        }
    }
    match (ak, signature) {
        (Some(ak), Some(signature)) => Ok((ak, signature)),
        _ => Err(AuthError::Malformed(
            "expected `ak=...,signature=...`".into(),
        )),
    }
}

pub(crate) fn string_to_sign(method: &str, path: &str, query: &str, date: &str) -> String {
    format!("{method}\n{path}\n{query}\n{date}")
}

pub(crate) fn sign(sk: &str, payload: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(sk.as_bytes())
        .expect("hmac accepts keys of any length");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

impl Worker for AkskAuthWorker {
    fn id(&self) -> &str {
        &self.id
    }

    fn reset(&self, config: &Value, _deps: &DepMap) -> Result<(), WorkerError> {
        let cfg: AkskConfig = from_value(config)?;
        *self.state.borrow_mut() = Rc::new(AkskState {
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
impl HttpFilter for AkskAuthWorker {
    async fn do_filter(&self, ctx: &mut Context, next: Next<'_>) {
        if let Err(e) = check_authorization_type(SUPPORT_TYPES, ctx) {
            return reject(ctx, NAME, &e);
        }
        let Some(authorization) = ctx
            .request()
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
        else {
            return reject(ctx, NAME, &AuthError::Missing);
        };
        let (ak, signature) = match parse_credential(authorization) {
            Ok(pair) => pair,
            Err(e) => return reject(ctx, NAME, &e),
        };

        let date = ctx
            .request()
            .headers()
            .get(DATE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let payload = string_to_sign(
            ctx.request().method().as_str(),
            ctx.request().uri().path(),
            ctx.request().uri().query().unwrap_or(""),
            date,
        );

        let state = self.state.borrow().clone();
        let Some(user) = state.users.iter().find(|u| u.ak == ak) else {
            return reject(ctx, NAME, &AuthError::InvalidUser);
        };
        if !sign(&user.sk, &payload).eq_ignore_ascii_case(&signature) {
            return reject(ctx, NAME, &AuthError::InvalidUser);
        }
        if expired(user.expire) {
            return reject(ctx, NAME, &AuthError::Expired);
        }
        if state.hide {
            ctx.proxy_mut().remove_header(header::AUTHORIZATION.as_str());
        }
        next.do_chain(ctx).await
    }
}

pub struct AkskAuthDriver;

impl Driver for AkskAuthDriver {
    fn create(&self, id: &str, config: &Value, deps: &DepMap) -> Result<WorkerKind, WorkerError> {
        let worker = Rc::new(AkskAuthWorker {
            id: id.to_string(),
            state: RefCell::new(Rc::new(AkskState {
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
    use bytes::Bytes;
    use floodgate_core::filter::{ChainState, FilterChain};
    use http::Request;

    use super::*;

    fn worker() -> Rc<AkskAuthWorker> {
        let worker = Rc::new(AkskAuthWorker {
            id: "aksk".into(),
            state: RefCell::new(Rc::new(AkskState {
                users: Vec::new(),
                hide: false,
            })),
        });
        worker
            .reset(
                &serde_json::json!({
                    "users": [{ "ak": "AK1", "sk": "secret" }],
                    "hide_credentials": true,
                }),
                &DepMap::new(),
            )
            .unwrap();
        worker
    }

    fn run(authorization: &str, date: &str) -> (ChainState, Context) {
        let request = Request::builder()
            .method(http::Method::GET)
            .uri("/v1/x?b=2")
            .header(header::AUTHORIZATION, authorization)
            .header(DATE_HEADER, date)
            .body(Bytes::new())
            .unwrap();
        let mut ctx = Context::new(request, 80, None);
        let chain = FilterChain::new(vec![worker() as Rc<dyn HttpFilter>]);
        let state = futures::executor::block_on(chain.run(&mut ctx));
        (state, ctx)
    }

    #[test]
    fn valid_signature_passes() {
        let date = "20260801T000000Z";
        let signature = sign("secret", &string_to_sign("GET", "/v1/x", "b=2", date));
        let (state, ctx) = run(&format!("AKSK ak=AK1,signature={signature}"), date);
        assert_eq!(state, ChainState::Completed);
        assert!(ctx.proxy().header("authorization").is_none());
    }

    #[test]
    fn tampered_request_fails_the_signature() {
        let date = "20260801T000000Z";
        let signature = sign("secret", &string_to_sign("GET", "/v1/other", "b=2", date));
        let (state, _) = run(&format!("AKSK ak=AK1,signature={signature}"), date);
        assert_eq!(state, ChainState::Responded);
    }

    #[test]
    fn unknown_access_key_fails() {
        let date = "d";
        let signature = sign("secret", &string_to_sign("GET", "/v1/x", "b=2", date));
        let (state, _) = run(&format!("AKSK ak=OTHER,signature={signature}"), date);
        assert_eq!(state, ChainState::Responded);
    }

    #[test]
    fn malformed_header_fails() {
        let (state, _) = run("AKSK nonsense", "d");
        assert_eq!(state, ChainState::Responded);
    }
}
