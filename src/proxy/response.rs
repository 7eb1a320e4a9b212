//! Responses the proxy itself produces

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::header::{HeaderValue, CONTENT_TYPE, PROXY_AUTHENTICATE};
use hyper::{Response, StatusCode};

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

fn text_response(status: StatusCode, body: String) -> Response<ProxyBody> {
    let mut resp = Response::new(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed());
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    resp
}

/// `200` telling the client the tunnel is open
///
/// No framing headers: hyper refuses `Content-Length` on a 2xx CONNECT reply.
pub fn connect_established() -> Response<ProxyBody> {
    Response::new(Empty::<Bytes>::new().map_err(|e| match e {}).boxed())
}

/// `403` for a destination the policy rejects
pub fn forbidden_response(authority: &str) -> Response<ProxyBody> {
    text_response(
        StatusCode::FORBIDDEN,
        format!("CONNECT to {} is not permitted by proxy policy\n", authority),
    )
}

/// `407` asking for Basic credentials
pub fn auth_required_response() -> Response<ProxyBody> {
    let mut resp = text_response(
        StatusCode::PROXY_AUTHENTICATION_REQUIRED,
        "Proxy authentication required\n".to_string(),
    );
    resp.headers_mut().insert(
        PROXY_AUTHENTICATE,
        HeaderValue::from_static("Basic realm=\"tapline\""),
    );
    resp
}

/// `500` when the tunnel could not be set up
pub fn error_response(message: &str) -> Response<ProxyBody> {
    text_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("Proxy error: {}\n", message),
    )
}

/// `501` for anything the proxy does not tunnel
pub fn not_implemented_response(method: &str) -> Response<ProxyBody> {
    text_response(
        StatusCode::NOT_IMPLEMENTED,
        format!("{} is not supported by this proxy, use CONNECT\n", method),
    )
}
