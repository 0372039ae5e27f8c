//! End-to-end tests driving the worker engine over real sockets.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use gantry_core::http::{HeaderMap, HeaderValue, StatusCode, header};
use gantry_core::net::SocketAddr;
use gantry_core::scheduler::TaskScheduler;
use gantry_core::{
    App, HttpTransport, ListenerSpec, MessageHandler, Result, Scope, ShutdownEvent, Worker,
    WorkerConfig, WsHandshake, WsMessage, async_trait,
};

struct TestApp {
    delay: Option<Duration>,
}

#[async_trait]
impl MessageHandler for TestApp {
    async fn call(&self, scope: Scope, mut transport: HttpTransport) -> Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match scope.path.as_str() {
            "/info" => {
                let mut payload = HashMap::new();
                payload.insert("path", scope.path.clone());
                payload.insert("query_string", scope.query_string.clone());
                let body = serde_json::to_string(&payload).expect("serializable");
                let mut headers = HeaderMap::new();
                headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
                transport.response_str(StatusCode::OK, headers, body)
            }
            "/echo" => {
                let body = transport.request_body().await?;
                transport.response_bytes(StatusCode::OK, HeaderMap::new(), body)
            }
            _ => transport.response_empty(StatusCode::NOT_FOUND, HeaderMap::new()),
        }
    }

    async fn call_ws(&self, scope: Scope, handshake: WsHandshake) -> Result<()> {
        match scope.path.as_str() {
            "/ws_echo" => {
                let mut transport = handshake.accept().await?;
                loop {
                    match transport.recv().await? {
                        Some(WsMessage::Text(text)) => {
                            transport.send(WsMessage::Text(text)).await?;
                        }
                        Some(WsMessage::Bytes(bytes)) => {
                            transport.send(WsMessage::Bytes(bytes)).await?;
                        }
                        Some(WsMessage::Close(_)) | None => {
                            let _ = transport.close().await;
                            return Ok(());
                        }
                    }
                }
            }
            _ => handshake.reject(403),
        }
    }
}

struct Running {
    addr: std::net::SocketAddr,
    shutdown: ShutdownEvent,
    handle: tokio::task::JoinHandle<Result<()>>,
}

fn start(config: WorkerConfig, delay: Option<Duration>) -> Running {
    let holder = ListenerSpec::tcp("127.0.0.1", 0, 128).build().unwrap();
    let SocketAddr::Tcp(addr) = holder.local_addr() else {
        panic!("expected tcp bind");
    };
    let shutdown = ShutdownEvent::new();
    let scheduler = Arc::new(TaskScheduler::start(1, 30).unwrap());
    let app = App::Message(Arc::new(TestApp { delay }));
    let worker_shutdown = shutdown.clone();
    let handle = tokio::spawn(async move {
        let worker = Worker::new(config);
        worker
            .serve_async(app, scheduler, holder, worker_shutdown, None)
            .await
    });
    Running {
        addr,
        shutdown,
        handle,
    }
}

async fn raw_request(addr: std::net::SocketAddr, request: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_get_scope_echo() {
    let server = start(WorkerConfig::default(), None);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let response = raw_request(
        server.addr,
        b"GET /info?test=true HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
    assert!(response.contains("application/json"), "{response}");
    assert!(response.contains(r#""path":"/info""#), "{response}");
    assert!(response.contains(r#""query_string":"test=true""#), "{response}");

    server.shutdown.set();
    server.handle.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_post_echo_small_and_large() {
    let server = start(WorkerConfig::default(), None);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let response = raw_request(
        server.addr,
        b"POST /echo HTTP/1.1\r\nhost: localhost\r\ncontent-length: 4\r\nconnection: close\r\n\r\ntest",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
    assert!(response.ends_with("test"), "{response}");

    let payload: Vec<u8> = (0..160_000u32).map(|i| b'a' + (i % 23) as u8).collect();
    let mut request = format!(
        "POST /echo HTTP/1.1\r\nhost: localhost\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
        payload.len()
    )
    .into_bytes();
    request.extend_from_slice(&payload);
    let response = raw_request(server.addr, &request).await;
    let body_start = response.find("\r\n\r\n").unwrap() + 4;
    assert_eq!(response.as_bytes()[body_start..], payload[..]);

    server.shutdown.set();
    server.handle.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_upgrade_is_rejected() {
    let config = WorkerConfig {
        websockets: false,
        ..WorkerConfig::default()
    };
    let server = start(config, None);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let response = raw_request(
        server.addr,
        b"GET /ws_echo HTTP/1.1\r\nhost: localhost\r\nconnection: upgrade\r\nupgrade: websocket\r\nsec-websocket-version: 13\r\nsec-websocket-key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 400"), "{response}");

    server.shutdown.set();
    server.handle.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_websocket_echo_and_reject() {
    let server = start(WorkerConfig::default(), None);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Echo endpoint accepts and mirrors text and binary frames.
    let stream = TcpStream::connect(server.addr).await.unwrap();
    let (mut ws, _) = tokio_tungstenite::client_async(
        format!("ws://{}/ws_echo", server.addr),
        stream,
    )
    .await
    .unwrap();

    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    ws.send(Message::text("foo")).await.unwrap();
    let echoed = ws.next().await.unwrap().unwrap();
    assert_eq!(echoed.into_text().unwrap().as_str(), "foo");

    ws.send(Message::binary(Bytes::from_static(b"foo")))
        .await
        .unwrap();
    let echoed = ws.next().await.unwrap().unwrap();
    assert_eq!(echoed.into_data(), Bytes::from_static(b"foo"));

    ws.close(None).await.unwrap();

    // Reject endpoint answers the handshake with 403.
    let stream = TcpStream::connect(server.addr).await.unwrap();
    let err = tokio_tungstenite::client_async(
        format!("ws://{}/ws_reject", server.addr),
        stream,
    )
    .await
    .unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 403);
        }
        other => panic!("expected http rejection, got {other:?}"),
    }

    server.shutdown.set();
    server.handle.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_backpressure_serializes_handlers() {
    let config = WorkerConfig {
        backpressure: 1,
        ..WorkerConfig::default()
    };
    let delay = Duration::from_millis(200);
    let server = start(config, Some(delay));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    let (first, second) = tokio::join!(
        raw_request(
            server.addr,
            b"GET /info HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n",
        ),
        raw_request(
            server.addr,
            b"GET /info HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n",
        ),
    );
    let elapsed = started.elapsed();

    assert!(first.starts_with("HTTP/1.1 200 OK"));
    assert!(second.starts_with("HTTP/1.1 200 OK"));
    // With a single permit the two handlers cannot overlap.
    assert!(elapsed >= delay * 2, "handlers overlapped: {elapsed:?}");

    server.shutdown.set();
    server.handle.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_stops_accepting() {
    let server = start(WorkerConfig::default(), None);
    tokio::time::sleep(Duration::from_millis(100)).await;

    server.shutdown.set();
    server.handle.await.unwrap().unwrap();

    assert!(TcpStream::connect(server.addr).await.is_err());
}
