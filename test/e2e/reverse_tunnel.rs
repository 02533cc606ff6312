//! End-to-end reverse tunnel tests.
//!
//! Each test runs a real burrow server and a real agent on ephemeral ports,
//! then drives traffic through the server as an ordinary proxy client:
//!
//! 1. Plain HTTP request relayed to a destination only the agent can reach
//! 2. CONNECT tunnel carrying bytes in both directions
//! 3. Tunnel teardown propagating from either end
//! 4. Deregistered connections being replaced by the agent
//!
//! ## Running
//!
//! ```bash
//! cargo test -p burrow-e2e --test reverse_tunnel
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use base64::Engine;
use burrow_agent::{Agent, AgentConfig};
use burrow_server::{api, AppState};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::info;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const STEP: Duration = Duration::from_secs(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A running server and agent pair. Both stop when dropped.
struct Stack {
    server_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl Stack {
    async fn start(identity: &str, idle_connections: usize) -> Self {
        init_tracing();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();

        tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                let _ = api::serve(listener, AppState::default(), async move {
                    shutdown.cancelled().await;
                })
                .await;
            }
        });

        let server_url = format!("http://{server_addr}").parse().unwrap();
        let mut config = AgentConfig::new(server_url, identity).unwrap();
        config.idle_connections = idle_connections;
        let agent = Agent::new(config).unwrap();
        tokio::spawn({
            let shutdown = shutdown.clone();
            async move { agent.run(shutdown).await }
        });

        let stack = Self {
            server_addr,
            shutdown,
        };
        stack.wait_for_idle(identity, idle_connections).await;
        info!(%server_addr, identity, "Stack ready");
        stack
    }

    fn base_url(&self) -> String {
        format!("http://{}", self.server_addr)
    }

    async fn idle(&self, identity: &str) -> u64 {
        let pools: serde_json::Value = reqwest::get(format!("{}/v1/sockets", self.base_url()))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        pools
            .as_array()
            .into_iter()
            .flatten()
            .find(|pool| pool["identity"] == identity)
            .and_then(|pool| pool["idle"].as_u64())
            .unwrap_or(0)
    }

    async fn wait_for_idle(&self, identity: &str, at_least: usize) {
        timeout(STEP, async {
            while self.idle(identity).await < at_least as u64 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("agent never registered");
    }

    /// Open a CONNECT tunnel to `target` as `identity`.
    async fn connect(&self, identity: &str, target: SocketAddr) -> TcpStream {
        let credentials =
            base64::engine::general_purpose::STANDARD.encode(format!("{identity}:unused"));
        let mut stream = TcpStream::connect(self.server_addr).await.unwrap();
        stream
            .write_all(
                format!(
                    "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\nProxy-Authorization: Basic {credentials}\r\n\r\n"
                )
                .as_bytes(),
            )
            .await
            .unwrap();

        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            assert_eq!(stream.read(&mut byte).await.unwrap(), 1, "proxy hung up");
            head.push(byte[0]);
        }
        let head = String::from_utf8(head).unwrap();
        assert!(
            head.to_ascii_lowercase()
                .starts_with("http/1.1 200 connection established"),
            "{head}"
        );
        stream
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// A TCP destination that hands its first accepted connection to the test.
async fn tcp_destination() -> (SocketAddr, oneshot::Receiver<TcpStream>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            let _ = tx.send(stream);
        }
    });
    (addr, rx)
}

fn chunks() -> Vec<Vec<u8>> {
    (0..10u8).map(|i| vec![b'a' + i; 4 * 1024]).collect()
}

#[tokio::test]
async fn proxied_request_reaches_destination() {
    let destination = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/plain")
                .set_body_string("hello"),
        )
        .expect(1)
        .mount(&destination)
        .await;

    let stack = Stack::start("alice", 1).await;
    let proxy = reqwest::Proxy::http(stack.base_url())
        .unwrap()
        .basic_auth("alice", "whatever");
    let client = reqwest::Client::builder().proxy(proxy).build().unwrap();

    let response = timeout(STEP, client.get(format!("{}/", destination.uri())).send())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "hello");

    // The agent replaces the connection it used.
    stack.wait_for_idle("alice", 1).await;
}

#[tokio::test]
async fn tunnel_carries_bytes_both_ways() {
    let stack = Stack::start("bob", 1).await;
    let (target_addr, accepted) = tcp_destination().await;

    let caller = stack.connect("bob", target_addr).await;
    let target = timeout(STEP, accepted).await.unwrap().unwrap();

    let (mut caller_rx, mut caller_tx) = caller.into_split();
    let (mut target_rx, mut target_tx) = target.into_split();
    let expected = chunks().concat();

    let upstream = async {
        for chunk in chunks() {
            caller_tx.write_all(&chunk).await.unwrap();
        }
        let mut received = vec![0u8; expected.len()];
        target_rx.read_exact(&mut received).await.unwrap();
        received
    };
    let downstream = async {
        for chunk in chunks() {
            target_tx.write_all(&chunk).await.unwrap();
        }
        let mut received = vec![0u8; expected.len()];
        caller_rx.read_exact(&mut received).await.unwrap();
        received
    };

    let (at_target, at_caller) = timeout(STEP, async { tokio::join!(upstream, downstream) })
        .await
        .unwrap();
    assert_eq!(at_target, expected);
    assert_eq!(at_caller, expected);
}

#[tokio::test]
async fn caller_hangup_closes_target() {
    let stack = Stack::start("bob", 1).await;
    let (target_addr, accepted) = tcp_destination().await;

    let mut caller = stack.connect("bob", target_addr).await;
    let mut target = timeout(STEP, accepted).await.unwrap().unwrap();

    caller.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    target.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    drop(caller);
    let mut rest = Vec::new();
    timeout(STEP, target.read_to_end(&mut rest))
        .await
        .expect("target connection was not closed")
        .unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn target_hangup_closes_caller() {
    let stack = Stack::start("bob", 1).await;
    let (target_addr, accepted) = tcp_destination().await;

    let mut caller = stack.connect("bob", target_addr).await;
    let mut target = timeout(STEP, accepted).await.unwrap().unwrap();

    target.write_all(b"bye").await.unwrap();
    drop(target);

    let mut received = Vec::new();
    timeout(STEP, caller.read_to_end(&mut received))
        .await
        .expect("caller connection was not closed")
        .unwrap();
    assert_eq!(received, b"bye");
}

#[tokio::test]
async fn deregistered_connections_are_replaced() {
    let stack = Stack::start("carol", 2).await;

    let result: serde_json::Value = reqwest::Client::new()
        .delete(format!("{}/v1/sockets/carol", stack.base_url()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(result["message"], "ok");
    assert_eq!(result["closed"], 2);

    // The agent notices the closed connections and registers new ones.
    stack.wait_for_idle("carol", 2).await;
}

#[tokio::test]
async fn connect_requires_credentials() {
    let stack = Stack::start("dave", 1).await;
    let mut stream = TcpStream::connect(stack.server_addr).await.unwrap();
    stream
        .write_all(b"CONNECT 127.0.0.1:1 HTTP/1.1\r\nHost: 127.0.0.1:1\r\n\r\n")
        .await
        .unwrap();

    let mut buf = vec![0u8; 512];
    let n = timeout(STEP, stream.read(&mut buf)).await.unwrap().unwrap();
    let head = String::from_utf8_lossy(&buf[..n]);
    assert!(head.starts_with("HTTP/1.1 407"), "{head}");

    // The agent's connection is untouched.
    assert_eq!(stack.idle("dave").await, 1);
}
