//! CONNECT handling end to end: policy, authentication, delegation and relay

mod common;

use base64::Engine;
use common::{proxy_config, send_connect, send_raw, start_echo_upstream, TestCa, TestProxy};
use std::time::Duration;
use tapline::test_report;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

async fn echo_roundtrip(stream: &mut tokio::net::TcpStream, payload: &[u8]) -> Vec<u8> {
    stream.write_all(payload).await.unwrap();
    let mut echoed = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut echoed))
        .await
        .expect("echo timed out")
        .unwrap();
    echoed
}

#[tokio::test]
async fn test_passthrough_relays_bytes_verbatim() {
    let t = test_report!("Without a CA, tunnel bytes pass through unchanged");

    let upstream = start_echo_upstream().await;
    t.setup(format!("Echo upstream on {}", upstream));
    let proxy = TestProxy::builder(proxy_config(None)).start().await;

    let mut connected = send_connect(proxy.addr, &upstream.to_string(), &[]).await;
    t.assert_eq("CONNECT status", &connected.status, &200u16);

    let payload: Vec<u8> = (0..4).flat_map(|_| 0u8..=255).collect();
    t.action(format!("Send {} bytes covering every byte value", payload.len()));
    let echoed = echo_roundtrip(&mut connected.stream, &payload).await;
    t.assert_true("byte-for-byte identical", echoed == payload);

    proxy.shutdown();
}

#[tokio::test]
async fn test_allow_list_admits_members_only() {
    let t = test_report!("Non-empty allow-list rejects destinations not on it");

    let upstream = start_echo_upstream().await;
    let mut config = proxy_config(None);
    config.policy.allow = vec![upstream.to_string()];
    t.setup(format!("allow = [{}]", upstream));
    let proxy = TestProxy::builder(config).start().await;

    let allowed = send_connect(proxy.addr, &upstream.to_string(), &[]).await;
    t.assert_eq("listed destination", &allowed.status, &200u16);

    let other = send_connect(proxy.addr, "127.0.0.1:1", &[]).await;
    t.assert_eq("unlisted destination", &other.status, &403u16);

    proxy.shutdown();
}

#[tokio::test]
async fn test_deny_list_rejects_member() {
    let t = test_report!("Deny-listed destination gets 403");

    let upstream = start_echo_upstream().await;
    let mut config = proxy_config(None);
    config.policy.deny = vec![upstream.to_string()];
    let proxy = TestProxy::builder(config).start().await;

    let denied = send_connect(proxy.addr, &upstream.to_string(), &[]).await;
    t.output("response head", &denied.head);
    t.assert_eq("status", &denied.status, &403u16);

    proxy.shutdown();
}

#[tokio::test]
async fn test_auth_required_then_accepted() {
    let t = test_report!("Basic proxy auth: 407 without credentials, 200 with them");

    let upstream = start_echo_upstream().await;
    let mut config = proxy_config(None);
    config.proxy.auth_username = Some("alice".to_string());
    config.proxy.auth_password = Some("s3cret".to_string());
    let proxy = TestProxy::builder(config).start().await;

    let anonymous = send_connect(proxy.addr, &upstream.to_string(), &[]).await;
    t.assert_eq("no credentials", &anonymous.status, &407u16);
    t.assert_contains("challenge", &anonymous.head, "Basic realm=\"tapline\"");

    let wrong = format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode("alice:nope")
    );
    let rejected =
        send_connect(proxy.addr, &upstream.to_string(), &[("Proxy-Authorization", &wrong)]).await;
    t.assert_eq("wrong password", &rejected.status, &407u16);

    let right = format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode("alice:s3cret")
    );
    let mut accepted =
        send_connect(proxy.addr, &upstream.to_string(), &[("Proxy-Authorization", &right)]).await;
    t.assert_eq("valid credentials", &accepted.status, &200u16);
    let echoed = echo_roundtrip(&mut accepted.stream, b"ping").await;
    t.assert_eq("tunnel works", &echoed.as_slice(), &b"ping".as_slice());

    proxy.shutdown();
}

#[tokio::test]
async fn test_non_connect_method_is_501() {
    let t = test_report!("Plain HTTP requests are answered with 501");

    let proxy = TestProxy::builder(proxy_config(None)).start().await;
    let status = send_raw(
        proxy.addr,
        "GET http://127.0.0.1/ HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n",
    )
    .await;
    t.assert_eq("status", &status, &501u16);

    proxy.shutdown();
}

#[tokio::test]
async fn test_unreachable_upstream_is_500() {
    let t = test_report!("Failed upstream connect yields 500");

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let closed = listener.local_addr().unwrap();
    drop(listener);
    t.setup(format!("Nothing listens on {}", closed));

    let proxy = TestProxy::builder(proxy_config(None)).start().await;
    let connected = send_connect(proxy.addr, &closed.to_string(), &[]).await;
    t.assert_eq("status", &connected.status, &500u16);

    proxy.shutdown();
}

#[tokio::test]
async fn test_host_outside_intercept_set_is_relayed_plain() {
    let t = test_report!("A host the CA does not cover is delegated to the plain relay");

    let ca = TestCa::generate();
    let upstream = start_echo_upstream().await;
    let mut config = proxy_config(Some(&ca));
    config.proxy.intercept_hosts = vec!["*.example.com".to_string()];
    t.setup("Intercept only *.example.com; CONNECT to 127.0.0.1");
    let proxy = TestProxy::builder(config).start().await;

    let mut connected = send_connect(proxy.addr, &upstream.to_string(), &[]).await;
    t.assert_eq("CONNECT status", &connected.status, &200u16);

    // A TLS ClientHello would be answered by the proxy if it intercepted;
    // here it comes straight back from the echo server.
    let echoed = echo_roundtrip(&mut connected.stream, b"\x16\x03\x01not-a-handshake").await;
    t.assert_eq(
        "raw bytes echoed",
        &echoed.as_slice(),
        &b"\x16\x03\x01not-a-handshake".as_slice(),
    );

    proxy.shutdown();
}

#[tokio::test]
async fn test_connect_reply_head_is_bare_200() {
    let t = test_report!("CONNECT reply is a bare 200 head and the tunnel carries bytes after it");

    let upstream = start_echo_upstream().await;
    let proxy = TestProxy::builder(proxy_config(None)).start().await;

    let mut connected = send_connect(proxy.addr, &upstream.to_string(), &[]).await;
    t.output("response head", &connected.head);
    t.assert_true(
        "status line",
        connected.head.starts_with("HTTP/1.1 200"),
    );
    t.assert_true("head terminated", connected.head.ends_with("\r\n\r\n"));
    let lowered = connected.head.to_ascii_lowercase();
    t.assert_true("no content-length", !lowered.contains("content-length"));
    t.assert_true("no transfer-encoding", !lowered.contains("transfer-encoding"));

    let echoed = echo_roundtrip(&mut connected.stream, b"after the head").await;
    t.assert_eq(
        "tunnel carries bytes",
        &echoed.as_slice(),
        &b"after the head".as_slice(),
    );

    proxy.shutdown();
}

#[tokio::test]
async fn test_silent_client_handshake_times_out() {
    let t = test_report!("A client that never starts TLS has both legs closed after the idle timeout");

    let ca = TestCa::generate();
    let origin = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();
    let mut config = proxy_config(Some(&ca));
    config.proxy.idle_timeout_ms = 200;
    t.setup(format!("CA configured, idle_timeout_ms = 200, raw origin on {}", origin_addr));
    let proxy = TestProxy::builder(config).start().await;

    let mut connected = send_connect(proxy.addr, &origin_addr.to_string(), &[]).await;
    t.assert_eq("CONNECT status", &connected.status, &200u16);
    let (mut upstream_side, _) = tokio::time::timeout(Duration::from_secs(2), origin.accept())
        .await
        .expect("proxy never dialled the origin")
        .unwrap();

    t.action("Send no ClientHello and wait on the origin socket");
    let mut buf = [0u8; 16];
    let upstream_read =
        tokio::time::timeout(Duration::from_secs(2), upstream_side.read(&mut buf)).await;
    t.assert_true(
        "origin socket closed",
        matches!(upstream_read, Ok(Ok(0)) | Ok(Err(_))),
    );

    let client_read =
        tokio::time::timeout(Duration::from_secs(2), connected.stream.read(&mut buf)).await;
    t.assert_true(
        "client socket closed",
        matches!(client_read, Ok(Ok(0)) | Ok(Err(_))),
    );

    proxy.shutdown();
}
