//! JWT authentication (HMAC algorithms).
//!
//! The token comes from `Authorization: Bearer <token>` or the `token`
//! query parameter. Signature and `exp` are verified with
//! `jsonwebtoken`; the configured user claim is then matched against the
//! user list, whose own `expire` field still applies.

use std::{cell::RefCell, collections::HashMap, rc::Rc};

use async_trait::async_trait;
use floodgate_core::{
    config::from_value,
    context::Context,
    filter::{HttpFilter, Next},
    worker::{DepMap, Driver, Worker, WorkerError, WorkerKind, SKILL_AUTH, SKILL_FILTER},
};
use http::header;
use jsonwebtoken::{decode, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::Value;

use super::{check_authorization_type, expired, reject, AuthError};

const NAME: &str = "jwt_auth";
const SUPPORT_TYPES: &[&str] = &["jwt", "jwt_auth", "jwt-auth", "jwtauth"];
const QUERY_PARAM: &str = "token";

fn default_user_claim() -> String {
    "sub".to_string()
}

fn default_algorithm() -> Algorithm {
    Algorithm::HS256
}

#[derive(Deserialize, Clone)]
struct JwtUser {
    name: String,
    #[serde(default)]
    expire: i64,
}

#[derive(Deserialize)]
struct JwtConfig {
    secret: String,
    #[serde(default = "default_algorithm")]
    algorithm: Algorithm,
    #[serde(default = "default_user_claim")]
    user_claim: String,
    #[serde(default, alias = "user")]
    users: Vec<JwtUser>,
    #[serde(default)]
    hide_credentials: bool,
}

struct JwtState {
    key: DecodingKey,
    validation: Validation,
    user_claim: String,
    users: Vec<JwtUser>,
    hide: bool,
}

pub struct JwtAuthWorker {
    id: String,
    state: RefCell<Option<Rc<JwtState>>>,
}

enum TokenSource {
    Header,
    Query,
}

fn extract_token(ctx: &Context) -> Result<(String, TokenSource), AuthError> {
    if let Some(value) = ctx
        .request()
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        let token = value
            .strip_prefix("Bearer ")
            .or_else(|| value.strip_prefix("bearer "))
            .ok_or_else(|| AuthError::Malformed("expected a Bearer token".into()))?;
        return Ok((token.trim().to_string(), TokenSource::Header));
    }
    if let Some(token) = ctx.request_query(QUERY_PARAM).filter(|t| !t.is_empty()) {
        return Ok((token, TokenSource::Query));
    }
    Err(AuthError::Missing)
}

impl Worker for JwtAuthWorker {
    fn id(&self) -> &str {
        &self.id
    }

    fn reset(&self, config: &Value, _deps: &DepMap) -> Result<(), WorkerError> {
        let cfg: JwtConfig = from_value(config)?;
        if !matches!(
            cfg.algorithm,
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512
        ) {
            return Err(WorkerError::Config(format!(
                "unsupported jwt algorithm {:?}, only HMAC variants are accepted",
                cfg.algorithm
            )));
        }
        *self.state.borrow_mut() = Some(Rc::new(JwtState {
            key: DecodingKey::from_secret(cfg.secret.as_bytes()),
            validation: Validation::new(cfg.algorithm),
            user_claim: cfg.user_claim,
            users: cfg.users,
            hide: cfg.hide_credentials,
        }));
        Ok(())
    }

    fn check_skill(&self, skill: &str) -> bool {
        skill == SKILL_FILTER || skill == SKILL_AUTH
    }
}

#[async_trait(?Send)]
impl HttpFilter for JwtAuthWorker {
    async fn do_filter(&self, ctx: &mut Context, next: Next<'_>) {
        if let Err(e) = check_authorization_type(SUPPORT_TYPES, ctx) {
            return reject(ctx, NAME, &e);
        }
        let Some(state) = self.state.borrow().clone() else {
            return reject(ctx, NAME, &AuthError::InvalidUser);
        };
        let (token, source) = match extract_token(ctx) {
            Ok(found) => found,
            Err(e) => return reject(ctx, NAME, &e),
        };

        let claims =
            match decode::<HashMap<String, Value>>(&token, &state.key, &state.validation) {
                Ok(data) => data.claims,
                Err(e) => {
                    let err = match e.kind() {
                        ErrorKind::ExpiredSignature => AuthError::Expired,
                        _ => AuthError::InvalidUser,
                    };
                    return reject(ctx, NAME, &err);
                }
            };
        let Some(subject) = claims.get(&state.user_claim).and_then(|v| v.as_str()) else {
            return reject(
                ctx,
                NAME,
                &AuthError::Malformed(format!("token lacks the `{}` claim", state.user_claim)),
            );
        };
        let Some(user) = state.users.iter().find(|u| u.name == subject) else {
            return reject(ctx, NAME, &AuthError::InvalidUser);
        };
        if expired(user.expire) {
            return reject(ctx, NAME, &AuthError::Expired);
        }
        if state.hide {
            match source {
                TokenSource::Header => {
                    ctx.proxy_mut().remove_header(header::AUTHORIZATION.as_str())
                }
                TokenSource::Query => ctx.proxy_mut().query_del(QUERY_PARAM),
            }
        }
        next.do_chain(ctx).await
    }
}

pub struct JwtAuthDriver;

impl Driver for JwtAuthDriver {
    fn create(&self, id: &str, config: &Value, deps: &DepMap) -> Result<WorkerKind, WorkerError> {
        let worker = Rc::new(JwtAuthWorker {
            id: id.to_string(),
            state: RefCell::new(None),
        });
        worker.reset(config, deps)?;
        Ok(WorkerKind::Filter(worker))
    }
}
