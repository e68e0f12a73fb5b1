//! Per-request context shared by the router, the filter chain and the
//! request executor.
//!
//! A [`Context`] keeps three views of one request:
//!
//! - the **request view**: the inbound request as parsed by the listener,
//!   never mutated after construction;
//! - the **proxy view**: the outbound draft, initialized from the request
//!   view and rewritten by filters and the service worker;
//! - the **response view**: written either by a short-circuiting filter or
//!   by the executor.
//!
//! Filters communicate through the metadata map and may register
//! finalizers that the service worker runs after the request settles,
//! including on deadline expiry.

use std::{collections::HashMap, net::SocketAddr, time::Instant};

use bytes::Bytes;
use derive_more::{From, Into};
use http::{
    header, HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode,
};
use serde_json::Value;

/// Address of the connected peer, set by the listener stack.
#[derive(From, Into, Debug, Clone, Copy)]
pub struct PeerAddr(pub SocketAddr);

/// Local port the request was accepted on, set by the listener stack.
#[derive(From, Into, Debug, Clone, Copy)]
pub struct ListenPort(pub u16);

type Finalizer = Box<dyn FnOnce(&mut Context)>;

pub struct Context {
    request: Request<Bytes>,
    proxy: ProxyRequest,
    response: Option<Response<Bytes>>,
    metadata: HashMap<String, Value>,
    peer_addr: Option<SocketAddr>,
    port: u16,
    started_at: Instant,
    finalizers: Vec<Finalizer>,
}

impl Context {
    pub fn new(request: Request<Bytes>, port: u16, peer_addr: Option<SocketAddr>) -> Self {
        let proxy = ProxyRequest::from_request(&request);
        Self {
            request,
            proxy,
            response: None,
            metadata: HashMap::new(),
            peer_addr,
            port,
            started_at: Instant::now(),
            finalizers: Vec::new(),
        }
    }

    /// Immutable inbound request view.
    pub fn request(&self) -> &Request<Bytes> {
        &self.request
    }

    pub fn proxy(&self) -> &ProxyRequest {
        &self.proxy
    }

    pub fn proxy_mut(&mut self) -> &mut ProxyRequest {
        &mut self.proxy
    }

    pub fn response(&self) -> Option<&Response<Bytes>> {
        self.response.as_ref()
    }

    pub fn set_response(&mut self, response: Response<Bytes>) {
        self.response = Some(response);
    }

    pub fn take_response(&mut self) -> Option<Response<Bytes>> {
        self.response.take()
    }

    /// Write a gateway error response with a JSON body.
    pub fn set_error_response(&mut self, status: StatusCode, message: &str) {
        self.response = Some(error_response(status, message));
    }

    pub fn metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.metadata.insert(key.into(), value.into());
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn client_ip(&self) -> Option<std::net::IpAddr> {
        self.peer_addr.map(|a| a.ip())
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Host of the inbound request with any `:port` suffix stripped.
    pub fn host(&self) -> &str {
        let raw = self
            .request
            .headers()
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| self.request.uri().host())
            .unwrap_or("");
        strip_host_port(raw)
    }

    /// Value of an inbound query parameter.
    pub fn request_query(&self, name: &str) -> Option<String> {
        let query = self.request.uri().query()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    /// Register a finalizer run once the request settles. Finalizers run in
    /// registration order, on both success and deadline expiry.
    pub fn defer(&mut self, f: impl FnOnce(&mut Context) + 'static) {
        self.finalizers.push(Box::new(f));
    }

    pub fn run_finalizers(&mut self) {
        let finalizers = std::mem::take(&mut self.finalizers);
        for f in finalizers {
            f(self);
        }
    }
}

/// Gateway error response with a JSON body.
pub fn error_response(status: StatusCode, message: &str) -> Response<Bytes> {
    let body = serde_json::json!({
        "status": status.as_u16(),
        "error": message,
    });
    let body = Bytes::from(body.to_string());
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::CONTENT_LENGTH, body.len())
        .body(body)
        .expect("static response parts are valid")
}

fn strip_host_port(raw: &str) -> &str {
    if let Some(rest) = raw.strip_prefix('[') {
        // bracketed IPv6 literal
        return rest.split(']').next().unwrap_or(rest);
    }
    raw.rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(raw)
}

/// Mutable outbound draft of the request being proxied.
pub struct ProxyRequest {
    method: Method,
    path: String,
    query: String,
    headers: HeaderMap,
    body: Bytes,
}

impl ProxyRequest {
    /// Bare draft request, used for gateway-internal calls such as
    /// discovery polling.
    pub fn new(method: Method, path: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: query.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    fn from_request(request: &Request<Bytes>) -> Self {
        Self {
            method: request.method().clone(),
            path: request.uri().path().to_string(),
            query: request.uri().query().unwrap_or("").to_string(),
            headers: request.headers().clone(),
            body: request.body().clone(),
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn set_path(&mut self, path: impl Into<String>) {
        self.path = path.into();
    }

    /// Raw query string without the leading `?`.
    pub fn query_raw(&self) -> &str {
        &self.query
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name),
            HeaderValue::try_from(value),
        ) else {
            tracing::warn!("dropping invalid proxy header `{name}`");
            return;
        };
        self.headers.insert(name, value);
    }

    pub fn remove_header(&mut self, name: &str) {
        if let Ok(name) = HeaderName::try_from(name) {
            self.headers.remove(name);
        }
    }

    /// Media type of the draft body, without parameters.
    pub fn content_type(&self) -> Option<&str> {
        self.header(header::CONTENT_TYPE.as_str())
            .map(|v| v.split(';').next().unwrap_or(v).trim())
    }

    pub fn query_pairs(&self) -> Vec<(String, String)> {
        url::form_urlencoded::parse(self.query.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    pub fn query_get(&self, name: &str) -> Option<String> {
        self.query_pairs()
            .into_iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }

    pub fn query_set(&mut self, name: &str, value: &str) {
        let mut pairs = self.query_pairs();
        match pairs.iter_mut().find(|(k, _)| k == name) {
            Some(pair) => pair.1 = value.to_string(),
            None => pairs.push((name.to_string(), value.to_string())),
        }
        self.set_query_pairs(&pairs);
    }

    pub fn query_del(&mut self, name: &str) {
        let pairs: Vec<_> = self
            .query_pairs()
            .into_iter()
            .filter(|(k, _)| k != name)
            .collect();
        self.set_query_pairs(&pairs);
    }

    fn set_query_pairs(&mut self, pairs: &[(String, String)]) {
        let mut ser = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in pairs {
            ser.append_pair(k, v);
        }
        self.query = ser.finish();
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Parse the draft body as `application/x-www-form-urlencoded` pairs.
    pub fn body_form(&self) -> Vec<(String, String)> {
        url::form_urlencoded::parse(&self.body)
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    /// Replace the draft body with re-encoded form pairs.
    pub fn set_form(&mut self, pairs: &[(String, String)]) {
        let mut ser = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in pairs {
            ser.append_pair(k, v);
        }
        self.body = Bytes::from(ser.finish());
        self.set_header(
            header::CONTENT_TYPE.as_str(),
            "application/x-www-form-urlencoded",
        );
    }

    /// Replace the draft body and its content type.
    pub fn set_raw(&mut self, content_type: &str, body: Bytes) {
        self.set_header(header::CONTENT_TYPE.as_str(), content_type);
        self.body = body;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str) -> Request<Bytes> {
        Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header(header::HOST, "api.example.com:8080")
            .body(Bytes::new())
            .unwrap()
    }

    #[test]
    fn host_strips_port() {
        let ctx = Context::new(request("/x"), 80, None);
        assert_eq!(ctx.host(), "api.example.com");
        assert_eq!(strip_host_port("[::1]:8080"), "::1");
        assert_eq!(strip_host_port("plain"), "plain");
    }

    #[test]
    fn proxy_query_editing() {
        let mut ctx = Context::new(request("/x?a=1&b=2"), 80, None);
        assert_eq!(ctx.proxy().query_get("a").as_deref(), Some("1"));
        ctx.proxy_mut().query_del("a");
        assert_eq!(ctx.proxy().query_get("a"), None);
        assert_eq!(ctx.proxy().query_get("b").as_deref(), Some("2"));
        ctx.proxy_mut().query_set("c", "3");
        assert_eq!(ctx.proxy().query_raw(), "b=2&c=3");
        // the request view stays untouched
        assert_eq!(ctx.request().uri().query(), Some("a=1&b=2"));
    }

    #[test]
    fn proxy_form_round_trip() {
        let mut ctx = Context::new(request("/x"), 80, None);
        ctx.proxy_mut().set_form(&[
            ("user".to_string(), "u1".to_string()),
            ("token".to_string(), "t t".to_string()),
        ]);
        assert_eq!(
            ctx.proxy().content_type(),
            Some("application/x-www-form-urlencoded")
        );
        let pairs = ctx.proxy().body_form();
        assert_eq!(pairs[1], ("token".to_string(), "t t".to_string()));
    }

    #[test]
    fn finalizers_run_in_order() {
        let mut ctx = Context::new(request("/x"), 80, None);
        ctx.defer(|c| c.set_metadata("first", 1));
        ctx.defer(|c| {
            assert!(c.metadata("first").is_some());
            c.set_metadata("second", 2);
        });
        ctx.run_finalizers();
        assert!(ctx.metadata("second").is_some());
        // a second run is a no-op
        ctx.run_finalizers();
    }

    #[test]
    fn error_response_body() {
        let mut ctx = Context::new(request("/x"), 80, None);
        ctx.set_error_response(StatusCode::BAD_GATEWAY, "no live upstream");
        let resp = ctx.take_response().unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let v: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(v["status"], 502);
    }
}
