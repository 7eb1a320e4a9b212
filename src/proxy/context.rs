//! Per-CONNECT request context shared by both legs of a tunnel

use std::collections::HashMap;
use std::net::SocketAddr;

use hyper::{HeaderMap, Method, Request, Uri, Version};

const DEFAULT_PORT: u16 = 443;

/// What the client asked for, fixed once the CONNECT is parsed
#[derive(Debug, Clone)]
pub struct ConnectContext {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    client_addr: SocketAddr,
    authority: String,
    host: String,
    port: u16,
    attributes: HashMap<String, String>,
}

impl ConnectContext {
    pub fn from_request<B>(req: &Request<B>, client_addr: SocketAddr) -> Self {
        Self::build(
            req.method().clone(),
            req.uri().clone(),
            req.version(),
            req.headers().clone(),
            client_addr,
        )
    }

    /// Context for a bare `host:port`, as if a CONNECT for it arrived
    pub fn for_authority(authority: &str, client_addr: SocketAddr) -> Self {
        let uri = authority.parse::<Uri>().unwrap_or_default();
        Self::build(
            Method::CONNECT,
            uri,
            Version::HTTP_11,
            HeaderMap::new(),
            client_addr,
        )
    }

    fn build(
        method: Method,
        uri: Uri,
        version: Version,
        headers: HeaderMap,
        client_addr: SocketAddr,
    ) -> Self {
        let authority = uri
            .authority()
            .map(|a| a.as_str().to_string())
            .unwrap_or_else(|| uri.to_string());
        let host = uri
            .host()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
            .unwrap_or_default();
        let port = uri.port_u16().unwrap_or(DEFAULT_PORT);

        let destination = if host.contains(':') {
            format!("[{}]:{}", host, port)
        } else {
            format!("{}:{}", host, port)
        };
        let mut attributes = HashMap::new();
        attributes.insert("destination".to_string(), destination);

        Self {
            method,
            uri,
            version,
            headers,
            client_addr,
            authority,
            host,
            port,
            attributes,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    /// `host:port` as the client wrote it
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Host without IPv6 brackets
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}
