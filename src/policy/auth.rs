//! Proxy authentication hook

use base64::Engine;
use hyper::HeaderMap;

/// Decides whether a CONNECT request is authenticated
///
/// Returning `false` answers the client with 407.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, headers: &HeaderMap) -> bool;
}

/// Accepts every request
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(&self, _headers: &HeaderMap) -> bool {
        true
    }
}

/// HTTP Basic credentials checked against `Proxy-Authorization`
#[derive(Debug, Clone)]
pub struct BasicAuth {
    username: String,
    password: String,
}

impl BasicAuth {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    fn credentials(headers: &HeaderMap) -> Option<(String, String)> {
        let value = headers.get(hyper::header::PROXY_AUTHORIZATION)?.to_str().ok()?;
        let (scheme, encoded) = value.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return None;
        }
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, pass) = decoded.split_once(':')?;
        Some((user.to_string(), pass.to_string()))
    }
}

impl Authenticator for BasicAuth {
    fn authenticate(&self, headers: &HeaderMap) -> bool {
        match Self::credentials(headers) {
            Some((user, pass)) => user == self.username && pass == self.password,
            None => false,
        }
    }
}
