//! Gateway entry service.
//!
//! Sits at the bottom of a `service_async` stack: the listener layers
//! above it decode the HTTP request and stamp the accepted address and
//! port into the context map; this service buffers the body (bounded),
//! matches the router table and hands the request to the matched service
//! worker. Its factory is reconstructed on configuration epochs like any
//! other handler factory, while the registry and router table it holds
//! are shared per worker thread.

use std::{convert::Infallible, rc::Rc};

use bytes::{Bytes, BytesMut};
use floodgate_core::{
    context::{error_response, Context, ListenPort, PeerAddr},
    router::MatchInput,
};
use http::{Request, Response, StatusCode};
use monoio_http::common::{
    body::{Body, FixedBody},
    error::HttpError,
};
use service_async::{AsyncMakeService, MakeService, ParamRef, Service};
use tracing::warn;

use crate::{router::RouterTable, util::into_fixed_response};

pub struct GatewayService {
    table: Rc<RouterTable>,
    max_body: usize,
}

impl GatewayService {
    pub fn factory(table: Rc<RouterTable>, max_body: usize) -> GatewayFactory {
        GatewayFactory { table, max_body }
    }
}

impl<CX, B> Service<(Request<B>, CX)> for GatewayService
where
    CX: ParamRef<PeerAddr> + ParamRef<ListenPort>,
    B: Body<Data = Bytes, Error = HttpError> + FixedBody,
{
    type Response = Response<B>;
    type Error = Infallible;

    async fn call(&self, (request, cx): (Request<B>, CX)) -> Result<Self::Response, Self::Error> {
        let port = ParamRef::<ListenPort>::param_ref(&cx).0;
        let peer = ParamRef::<PeerAddr>::param_ref(&cx).0;

        let (parts, mut body) = request.into_parts();
        let mut buf = BytesMut::new();
        while let Some(chunk) = body.next_data().await {
            let data = match chunk {
                Ok(data) => data,
                Err(e) => {
                    warn!("failed to read request body: {e:?}");
                    return Ok(into_fixed_response(error_response(
                        StatusCode::BAD_REQUEST,
                        "unreadable request body",
                    )));
                }
            };
            if buf.len() + data.len() > self.max_body {
                return Ok(into_fixed_response(error_response(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    "request body exceeds the configured limit",
                )));
            }
            buf.extend_from_slice(&data);
        }
        let request = Request::from_parts(parts, buf.freeze());

        let mut ctx = Context::new(request, port, Some(peer));
        // hold one matcher for the whole request
        let matcher = self.table.matcher();
        match matcher.find(&ctx as &dyn MatchInput) {
            Some(service) => service.handle(&mut ctx).await,
            None => ctx.set_error_response(StatusCode::NOT_FOUND, "no route matched"),
        }

        let response = ctx.take_response().unwrap_or_else(|| {
            error_response(StatusCode::BAD_GATEWAY, "no response was produced")
        });
        Ok(into_fixed_response(response))
    }
}

pub struct GatewayFactory {
    table: Rc<RouterTable>,
    max_body: usize,
}

impl MakeService for GatewayFactory {
    type Service = GatewayService;
    type Error = Infallible;

    fn make_via_ref(&self, _old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(GatewayService {
            table: self.table.clone(),
            max_body: self.max_body,
        })
    }
}

impl AsyncMakeService for GatewayFactory {
    type Service = GatewayService;
    type Error = Infallible;

    async fn make_via_ref(
        &self,
        _old: Option<&Self::Service>,
    ) -> Result<Self::Service, Self::Error> {
        Ok(GatewayService {
            table: self.table.clone(),
            max_body: self.max_body,
        })
    }
}
