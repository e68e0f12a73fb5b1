use bytes::Bytes;
use http::{header, HeaderValue, Response};
use monoio_http::common::body::FixedBody;

/// Convert a buffered context response into the listener's body type.
pub fn into_fixed_response<B: FixedBody>(response: Response<Bytes>) -> Response<B> {
    let (mut parts, body) = response.into_parts();
    parts.headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&body.len().to_string())
            .expect("a decimal length is a valid header value"),
    );
    let body = if body.is_empty() { None } else { Some(body) };
    Response::from_parts(parts, B::fixed_body(body))
}
