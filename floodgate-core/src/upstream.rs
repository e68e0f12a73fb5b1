//! Upstream and executor contracts.

use std::rc::Rc;

use async_trait::async_trait;
use bytes::Bytes;
use http::Response;
use serde::{Deserialize, Serialize};

use crate::{
    context::{Context, ProxyRequest},
    discovery::Endpoint,
    worker::Worker,
};

/// Outbound scheme of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Http,
    Https,
    Grpc,
    Dubbo2,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::Grpc => "grpc",
            Scheme::Dubbo2 => "dubbo2",
        }
    }
}

/// No live endpoint is available for selection.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("upstream has no live endpoint")]
pub struct NoNode;

/// A logical endpoint pool with a balancing policy and health tracking.
pub trait Upstream {
    fn scheme(&self) -> Scheme;

    /// Pick one endpoint for the next attempt. All endpoints unhealthy is
    /// a failure; the upstream never elects a "least bad" node.
    fn select(&self, ctx: &Context) -> Result<Rc<Endpoint>, NoNode>;

    fn report_success(&self, endpoint: &Endpoint);

    fn report_failure(&self, endpoint: &Endpoint);
}

/// A worker exposing the upstream capability.
pub trait UpstreamWorker: Worker + Upstream {}
impl<T: Worker + Upstream> UpstreamWorker for T {}

#[derive(thiserror::Error, Debug)]
pub enum ExecuteError {
    #[error("connect to upstream failed: {0}")]
    Connect(String),
    #[error("upstream i/o error: {0}")]
    Io(String),
    #[error("upstream response body exceeds the {0} byte limit")]
    BodyTooLarge(usize),
    #[error("outbound scheme `{}` is not supported", .0.as_str())]
    Unsupported(Scheme),
}

impl ExecuteError {
    /// Connection setup failures and request-stage I/O errors may be
    /// retried on another endpoint; a decoded response is always final.
    pub fn is_retriable(&self) -> bool {
        matches!(self, ExecuteError::Connect(_) | ExecuteError::Io(_))
    }
}

/// Performs one outbound attempt against a resolved endpoint.
#[async_trait(?Send)]
pub trait Execute {
    async fn execute(
        &self,
        proxy: &ProxyRequest,
        endpoint: &Endpoint,
        scheme: Scheme,
    ) -> Result<Response<Bytes>, ExecuteError>;
}
