//! Test infrastructure for end-to-end proxy tests.
#![allow(dead_code)]

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, ServerConfig};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tapline::capture::{ContentObserver, ObserverError};
use tapline::tls::{CertificateAuthority, GeneratedCa};
use tapline::{CapturedRequest, CapturedResponse, Config, ProxyServer};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::client::TlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

// ---------------------------------------------------------------------------
// TestCa
// ---------------------------------------------------------------------------

/// A test CA whose files live in a tempdir.
pub struct TestCa {
    pub ca: CertificateAuthority,
    pub cert_der: CertificateDer<'static>,
    pub dir: TempDir,
    pub cert_path: String,
    pub key_path: String,
}

impl TestCa {
    pub fn generate() -> Self {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        let generated = GeneratedCa::generate().unwrap();
        let ca = CertificateAuthority::from_pem(&generated.cert_pem, &generated.key_pem).unwrap();
        let cert_der = ca.cert_der().clone();

        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("ca.crt");
        let key_path = dir.path().join("ca.key");
        generated.save(&cert_path, &key_path).unwrap();

        Self {
            ca,
            cert_der,
            cert_path: cert_path.to_str().unwrap().to_string(),
            key_path: key_path.to_str().unwrap().to_string(),
            dir,
        }
    }

    /// A client config trusting only this CA, HTTP/1.1 ALPN.
    pub fn client_tls_config(&self) -> Arc<ClientConfig> {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.add(self.cert_der.clone()).unwrap();
        let mut config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Arc::new(config)
    }

    /// A server config for `host` signed by this CA, HTTP/1.1 ALPN.
    pub fn server_tls_config(&self, host: &str) -> Arc<ServerConfig> {
        let (cert, key) = self.ca.issue_leaf(host).unwrap();
        let cert_chain = vec![cert, self.cert_der.clone()];
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)
            .unwrap();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Arc::new(config)
    }
}

// ---------------------------------------------------------------------------
// Upstreams
// ---------------------------------------------------------------------------

/// A handler function for the test upstream.
pub type UpstreamHandler =
    Arc<dyn Fn(Request<Incoming>) -> UpstreamResponse + Send + Sync + 'static>;

pub type UpstreamResponse = std::pin::Pin<
    Box<
        dyn std::future::Future<
                Output = std::result::Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error>,
            > + Send,
    >,
>;

/// A test HTTP/1.1 upstream, plain or TLS.
pub struct TestUpstream {
    pub addr: SocketAddr,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl TestUpstream {
    /// HTTPS upstream with a certificate for 127.0.0.1 signed by `ca`.
    pub async fn start_tls(ca: &TestCa, handler: UpstreamHandler) -> Self {
        let acceptor = TlsAcceptor::from(ca.server_tls_config("127.0.0.1"));
        Self::start_with(Some(acceptor), handler).await
    }

    /// Cleartext HTTP upstream.
    pub async fn start_plain(handler: UpstreamHandler) -> Self {
        Self::start_with(None, handler).await
    }

    async fn start_with(acceptor: Option<TlsAcceptor>, handler: UpstreamHandler) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    result = listener.accept() => {
                        let Ok((stream, _)) = result else { continue };
                        let acceptor = acceptor.clone();
                        let handler = handler.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req: Request<Incoming>| {
                                let handler = handler.clone();
                                handler(req)
                            });
                            match acceptor {
                                Some(acceptor) => {
                                    let Ok(tls_stream) = acceptor.accept(stream).await else {
                                        return;
                                    };
                                    let _ = http1::Builder::new()
                                        .serve_connection(TokioIo::new(tls_stream), service)
                                        .await;
                                }
                                None => {
                                    let _ = http1::Builder::new()
                                        .serve_connection(TokioIo::new(stream), service)
                                        .await;
                                }
                            }
                        });
                    }
                }
            }
        });

        Self { addr, shutdown_tx }
    }

    pub fn authority(&self) -> String {
        self.addr.to_string()
    }

    pub fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Returns 200 with a fixed text body and `Content-Length`.
pub fn ok_handler(body: &'static str) -> UpstreamHandler {
    Arc::new(move |_req| {
        Box::pin(async move {
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain")
                .header("Content-Length", body.len())
                .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
                .unwrap())
        })
    })
}

/// Answers every request with its own path as the body.
pub fn path_handler() -> UpstreamHandler {
    Arc::new(|req: Request<Incoming>| {
        Box::pin(async move {
            let path = req.uri().path().to_string();
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain")
                .body(Full::new(Bytes::from(path)).map_err(|e| match e {}).boxed())
                .unwrap())
        })
    })
}

/// Raw TCP echo server: every byte read is written back, EOF is mirrored.
pub async fn start_echo_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });
    addr
}

/// TLS upstream that reads one request head, writes `response` verbatim and
/// closes with close_notify.
pub async fn start_raw_tls_upstream(ca: &TestCa, response: &'static [u8]) -> SocketAddr {
    let acceptor = TlsAcceptor::from(ca.server_tls_config("127.0.0.1"));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(mut tls) = acceptor.accept(stream).await else {
                    return;
                };
                read_head(&mut tls).await;
                let _ = tls.write_all(response).await;
                let _ = tls.shutdown().await;
            });
        }
    });
    addr
}

// ---------------------------------------------------------------------------
// TestProxy
// ---------------------------------------------------------------------------

/// Proxy config bound to an ephemeral port, optionally signing with `ca`.
pub fn proxy_config(ca: Option<&TestCa>) -> Config {
    let mut config = Config::minimal("127.0.0.1:0".to_string());
    if let Some(ca) = ca {
        config.proxy.ca_cert = Some(ca.cert_path.clone());
        config.proxy.ca_key = Some(ca.key_path.clone());
    }
    config.logging.log_connects = false;
    config
}

pub struct TestProxyBuilder {
    config: Config,
    observers: Vec<Arc<dyn ContentObserver>>,
    upstream_tls: Option<Arc<ClientConfig>>,
}

impl TestProxyBuilder {
    pub fn observer(mut self, observer: Arc<dyn ContentObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn upstream_tls(mut self, config: Arc<ClientConfig>) -> Self {
        self.upstream_tls = Some(config);
        self
    }

    pub async fn start(self) -> TestProxy {
        let mut server = ProxyServer::new(self.config).unwrap();
        for observer in self.observers {
            server = server.with_observer(observer);
        }
        if let Some(tls) = self.upstream_tls {
            server = server.with_upstream_tls(tls);
        }

        let addr = server.bind().await.unwrap();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let _ = server.serve(shutdown_rx).await;
        });

        TestProxy { addr, shutdown_tx }
    }
}

pub struct TestProxy {
    pub addr: SocketAddr,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl TestProxy {
    pub fn builder(config: Config) -> TestProxyBuilder {
        TestProxyBuilder {
            config,
            observers: Vec::new(),
            upstream_tls: None,
        }
    }

    pub fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}

// ---------------------------------------------------------------------------
// Clients
// ---------------------------------------------------------------------------

/// Read bytes one at a time up to and including the blank line.
async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(1) => head.push(byte[0]),
            _ => break,
        }
    }
    String::from_utf8_lossy(&head).into_owned()
}

/// Reply to a CONNECT: status code, response head, and the open stream.
pub struct Connected {
    pub status: u16,
    pub head: String,
    pub stream: TcpStream,
}

/// Send `CONNECT authority` to the proxy with extra headers and read the reply head.
pub async fn send_connect(
    proxy: SocketAddr,
    authority: &str,
    extra_headers: &[(&str, &str)],
) -> Connected {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    for (name, value) in extra_headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let head = read_head(&mut stream).await;
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or(0);
    Connected {
        status,
        head,
        stream,
    }
}

/// Send a raw request line to the proxy and return the status code.
pub async fn send_raw(proxy: SocketAddr, request: &str) -> u16 {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let head = read_head(&mut stream).await;
    head.split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or(0)
}

/// TLS handshake over an established tunnel, trusting `ca`, SNI 127.0.0.1.
pub async fn tls_over_tunnel(stream: TcpStream, ca: &TestCa) -> TlsStream<TcpStream> {
    let connector = TlsConnector::from(ca.client_tls_config());
    let server_name = ServerName::try_from("127.0.0.1").unwrap();
    connector.connect(server_name, stream).await.unwrap()
}

/// HTTP/1.1 client connection over any stream.
pub async fn http1_client<S>(io: S) -> SendRequest<Full<Bytes>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
        .await
        .unwrap();
    tokio::spawn(async move {
        let _ = conn.await;
    });
    sender
}

/// GET `path_and_query` on an HTTP/1.1 client and collect status and body.
pub async fn get(sender: &mut SendRequest<Full<Bytes>>, path_and_query: &str) -> (u16, Bytes) {
    sender.ready().await.unwrap();
    let req = Request::builder()
        .method("GET")
        .uri(path_and_query)
        .header("Host", "127.0.0.1")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let resp = sender.send_request(req).await.unwrap();
    let status = resp.status().as_u16();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    (status, body)
}

// ---------------------------------------------------------------------------
// Observers
// ---------------------------------------------------------------------------

/// Stores every transaction it is handed.
#[derive(Default)]
pub struct RecordingObserver {
    seen: Mutex<Vec<(CapturedRequest, CapturedResponse)>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn transactions(&self) -> Vec<(CapturedRequest, CapturedResponse)> {
        self.seen.lock().unwrap().clone()
    }

    /// Poll until at least `n` transactions arrived or five seconds pass.
    pub async fn wait_for(&self, n: usize) -> Vec<(CapturedRequest, CapturedResponse)> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let seen = self.transactions();
            if seen.len() >= n || tokio::time::Instant::now() >= deadline {
                return seen;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

impl ContentObserver for RecordingObserver {
    fn name(&self) -> &str {
        "recording"
    }

    fn interested(&self, _request: &CapturedRequest) -> bool {
        true
    }

    fn accept(
        &self,
        request: &CapturedRequest,
        response: &CapturedResponse,
    ) -> Result<(), ObserverError> {
        self.seen
            .lock()
            .unwrap()
            .push((request.clone(), response.clone()));
        Ok(())
    }
}

/// Panics on every transaction.
pub struct PanickingObserver;

impl ContentObserver for PanickingObserver {
    fn name(&self) -> &str {
        "panicking"
    }

    fn interested(&self, _request: &CapturedRequest) -> bool {
        true
    }

    fn accept(
        &self,
        _request: &CapturedRequest,
        _response: &CapturedResponse,
    ) -> Result<(), ObserverError> {
        panic!("observer blew up");
    }
}

/// Returns an error for every transaction.
pub struct FailingObserver;

impl ContentObserver for FailingObserver {
    fn name(&self) -> &str {
        "failing"
    }

    fn interested(&self, _request: &CapturedRequest) -> bool {
        true
    }

    fn accept(
        &self,
        _request: &CapturedRequest,
        _response: &CapturedResponse,
    ) -> Result<(), ObserverError> {
        Err("rejected".into())
    }
}
