//! Outbound request executor.
//!
//! Builds the wire request from the context's proxy view, connects
//! through pooled `monoio-transports` connectors and buffers the
//! response. Connection pools are transferred from the previous executor
//! on service reset so a reconfiguration does not drop warm connections.
//!
//! HTTPS upstreams use the TLS connector behind the `tls` feature; when
//! the feature is off the request falls back to plain HTTP, matching the
//! listener-side behaviour of the rest of the stack. Dubbo2 has no
//! outbound codec here and is reported unsupported.

use std::{
    net::{SocketAddr, ToSocketAddrs},
    time::Duration,
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::{header, HeaderValue, Request, Response, Uri};
use monoio::net::TcpStream;
use monoio_http::common::body::{Body, FixedBody, HttpBody};
#[cfg(feature = "tls")]
use monoio_transports::connectors::{TcpTlsAddr, TlsConnector, TlsStream};
use monoio_transports::{
    connectors::{Connector, TcpConnector},
    http::{HttpConnection, HttpConnector},
};
use floodgate_core::{
    context::ProxyRequest,
    discovery::Endpoint,
    upstream::{Execute, ExecuteError, Scheme},
};
use tracing::debug;

type PooledHttpConnector = HttpConnector<TcpConnector, SocketAddr, TcpStream>;
#[cfg(feature = "tls")]
type PooledHttpsConnector =
    HttpConnector<TlsConnector<TcpConnector>, TcpTlsAddr, TlsStream<TcpStream>>;

pub struct HttpExecutor {
    http_connector: PooledHttpConnector,
    #[cfg(feature = "tls")]
    https_connector: PooledHttpsConnector,
    max_body: usize,
}

impl HttpExecutor {
    pub fn new(scheme: Scheme, read_timeout: Option<Duration>, max_body: usize) -> Self {
        let mut http_connector = match scheme {
            // gRPC upstreams speak HTTP/2 only
            Scheme::Grpc => PooledHttpConnector::build_tcp_http2_only(),
            _ => PooledHttpConnector::default(),
        };
        http_connector.set_read_timeout(read_timeout);

        #[cfg(feature = "tls")]
        let https_connector = {
            let mut c = match scheme {
                Scheme::Grpc => PooledHttpsConnector::build_tls_http2_only(),
                _ => PooledHttpsConnector::default(),
            };
            c.set_read_timeout(read_timeout);
            c
        };

        Self {
            http_connector,
            #[cfg(feature = "tls")]
            https_connector,
            max_body,
        }
    }

    /// Adopt the warm connection pools of the executor being replaced.
    pub fn transfer_pools_from(&mut self, old: &Self) {
        match PooledHttpConnector::transfer_pool(&old.http_connector, &mut self.http_connector) {
            Ok(_) => debug!("transferred http pool to the new executor"),
            Err(e) => tracing::error!("failed to transfer http pool: {e:?}"),
        }
        #[cfg(feature = "tls")]
        match PooledHttpsConnector::transfer_pool(&old.https_connector, &mut self.https_connector)
        {
            Ok(_) => debug!("transferred https pool to the new executor"),
            Err(e) => tracing::error!("failed to transfer https pool: {e:?}"),
        }
    }

    fn build_request(
        &self,
        proxy: &ProxyRequest,
        endpoint: &Endpoint,
        scheme: Scheme,
    ) -> Result<Request<HttpBody>, ExecuteError> {
        let authority = endpoint.authority();
        let scheme_str = match scheme {
            Scheme::Https => "https",
            _ => "http",
        };
        let path_and_query = if proxy.query_raw().is_empty() {
            proxy.path().to_string()
        } else {
            format!("{}?{}", proxy.path(), proxy.query_raw())
        };
        let uri = Uri::builder()
            .scheme(scheme_str)
            .authority(authority.as_str())
            .path_and_query(path_and_query)
            .build()
            .map_err(|e| ExecuteError::Connect(format!("invalid upstream uri: {e}")))?;

        let body = proxy.body().clone();
        let content_length = body.len();
        let mut request = Request::new(HttpBody::fixed_body(if body.is_empty() {
            None
        } else {
            Some(body)
        }));
        *request.method_mut() = proxy.method().clone();
        *request.uri_mut() = uri;
        *request.headers_mut() = proxy.headers().clone();

        let headers = request.headers_mut();
        headers.remove(header::HOST);
        if let Ok(host) = HeaderValue::from_str(&authority) {
            headers.insert(header::HOST, host);
        }
        // the proxy body is fully buffered; fix framing headers up
        headers.remove(header::TRANSFER_ENCODING);
        if content_length > 0 {
            if let Ok(len) = HeaderValue::from_str(&content_length.to_string()) {
                headers.insert(header::CONTENT_LENGTH, len);
            }
        } else {
            headers.remove(header::CONTENT_LENGTH);
        }
        Ok(request)
    }

    async fn collect_response(
        &self,
        response: Response<HttpBody>,
    ) -> Result<Response<Bytes>, ExecuteError> {
        let (parts, mut body) = response.into_parts();
        let mut buf = BytesMut::new();
        while let Some(chunk) = body.next_data().await {
            let data = chunk.map_err(|e| ExecuteError::Io(format!("{e:?}")))?;
            if buf.len() + data.len() > self.max_body {
                return Err(ExecuteError::BodyTooLarge(self.max_body));
            }
            buf.extend_from_slice(&data);
        }
        let mut response = Response::from_parts(parts, buf.freeze());
        response.headers_mut().remove(header::TRANSFER_ENCODING);
        Ok(response)
    }

    async fn send_http(
        &self,
        mut request: Request<HttpBody>,
        endpoint: &Endpoint,
    ) -> Result<Response<Bytes>, ExecuteError> {
        let key = resolve(endpoint)?;
        let mut conn = self
            .http_connector
            .connect(key)
            .await
            .map_err(|e| ExecuteError::Connect(format!("{e:?}")))?;
        match &conn {
            HttpConnection::Http1(_) => {
                *request.version_mut() = http::Version::HTTP_11;
            }
            HttpConnection::Http2(_) => {
                *request.version_mut() = http::Version::HTTP_2;
                request.headers_mut().remove(header::HOST);
            }
        }
        let (result, _) = conn.send_request(request).await;
        let response = result.map_err(|e| ExecuteError::Io(format!("{e:?}")))?;
        self.collect_response(response).await
    }

    #[cfg(feature = "tls")]
    async fn send_https(
        &self,
        mut request: Request<HttpBody>,
    ) -> Result<Response<Bytes>, ExecuteError> {
        let key = request
            .uri()
            .try_into()
            .map_err(|e| ExecuteError::Connect(format!("{e:?}")))?;
        let mut conn = self
            .https_connector
            .connect(key)
            .await
            .map_err(|e| ExecuteError::Connect(format!("{e:?}")))?;
        match &conn {
            HttpConnection::Http1(_) => {
                *request.version_mut() = http::Version::HTTP_11;
            }
            HttpConnection::Http2(_) => {
                *request.version_mut() = http::Version::HTTP_2;
                request.headers_mut().remove(header::HOST);
            }
        }
        let (result, _) = conn.send_request(request).await;
        let response = result.map_err(|e| ExecuteError::Io(format!("{e:?}")))?;
        self.collect_response(response).await
    }
}

fn resolve(endpoint: &Endpoint) -> Result<SocketAddr, ExecuteError> {
    (endpoint.addr.as_str(), endpoint.port)
        .to_socket_addrs()
        .map_err(|e| ExecuteError::Connect(format!("resolve {}: {e}", endpoint.key())))?
        .next()
        .ok_or_else(|| ExecuteError::Connect(format!("unable to resolve {}", endpoint.key())))
}

#[async_trait(?Send)]
impl Execute for HttpExecutor {
    async fn execute(
        &self,
        proxy: &ProxyRequest,
        endpoint: &Endpoint,
        scheme: Scheme,
    ) -> Result<Response<Bytes>, ExecuteError> {
        if scheme == Scheme::Dubbo2 {
            return Err(ExecuteError::Unsupported(scheme));
        }
        let request = self.build_request(proxy, endpoint, scheme)?;
        #[cfg(feature = "tls")]
        if scheme == Scheme::Https {
            return self.send_https(request).await;
        }
        self.send_http(request, endpoint).await
    }
}
