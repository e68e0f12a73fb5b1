//! HTTP basic authentication.

use std::{cell::RefCell, rc::Rc};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
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

const NAME: &str = "basic_auth";
const SUPPORT_TYPES: &[&str] = &["basic", "basic_auth", "basic-auth", "basicauth"];

#[derive(Deserialize, Clone)]
struct BasicUser {
    username: String,
    password: String,
    #[serde(default)]
    expire: i64,
}

#[derive(Deserialize)]
struct BasicConfig {
    #[serde(default, alias = "user")]
    users: Vec<BasicUser>,
    #[serde(default)]
    hide_credentials: bool,
}

struct BasicState {
    users: Vec<BasicUser>,
    hide: bool,
}

pub struct BasicAuthWorker {
    id: String,
    state: RefCell<Rc<BasicState>>,
}

fn decode_credential(ctx: &Context) -> Result<(String, String), AuthError> {
    let header = ctx
        .request()
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(AuthError::Missing)?;
    let encoded = header
        .strip_prefix("Basic ")
        .or_else(|| header.strip_prefix("basic "))
        .ok_or_else(|| AuthError::Malformed("expected a Basic credential".into()))?;
    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|_| AuthError::Malformed("credential is not valid base64".into()))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| AuthError::Malformed("credential is not valid utf-8".into()))?;
    let (user, pass) = decoded
        .split_once(':')
        .ok_or_else(|| AuthError::Malformed("credential is missing a `:`".into()))?;
    Ok((user.to_string(), pass.to_string()))
}

impl Worker for BasicAuthWorker {
    fn id(&self) -> &str {
        &self.id
    }

    fn reset(&self, config: &Value, _deps: &DepMap) -> Result<(), WorkerError> {
        let cfg: BasicConfig = from_value(config)?;
        *self.state.borrow_mut() = Rc::new(BasicState {
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
impl HttpFilter for BasicAuthWorker {
    async fn do_filter(&self, ctx: &mut Context, next: Next<'_>) {
        if let Err(e) = check_authorization_type(SUPPORT_TYPES, ctx) {
            return reject(ctx, NAME, &e);
        }
        let (username, password) = match decode_credential(ctx) {
            Ok(pair) => pair,
            Err(e) => return reject(ctx, NAME, &e),
        };
        let state = self.state.borrow().clone();
        if state.hide {
            ctx.proxy_mut().remove_header(header::AUTHORIZATION.as_str());
        }
        for user in &state.users {
            if user.username == username && user.password == password {
                if expired(user.expire) {
                    return reject(ctx, NAME, &AuthError::Expired);
                }
                return next.do_chain(ctx).await;
            }
        }
        reject(ctx, NAME, &AuthError::InvalidUser)
    }
}

pub struct BasicAuthDriver;

impl Driver for BasicAuthDriver {
    fn create(&self, id: &str, config: &Value, deps: &DepMap) -> Result<WorkerKind, WorkerError> {
        let worker = Rc::new(BasicAuthWorker {
            id: id.to_string(),
            state: RefCell::new(Rc::new(BasicState {
                users: Vec::new(),
                hide: false,
            })),
        });
        worker.reset(config, deps)?;
        Ok(WorkerKind::Filter(worker))
    }
}
