//! End-to-end controller behavior against an in-process session-protocol
//! worker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixStream};

use drover_core::connection::{AddressSpec, Connection};
use drover_core::controller::{Controller, ControllerConfig};
use drover_core::pool::{DummySpawner, Options, Pool, PoolConfig, SpawnError};

/// Reads one session-protocol envelope off a worker-side stream.
async fn read_envelope(stream: &mut TcpStream) -> HashMap<String, String> {
    let mut size = [0u8; 4];
    stream.read_exact(&mut size).await.unwrap();
    let mut body = vec![0u8; u32::from_be_bytes(size) as usize];
    stream.read_exact(&mut body).await.unwrap();

    let mut fields = HashMap::new();
    let mut parts = body.split(|b| *b == 0);
    while let (Some(key), Some(value)) = (parts.next(), parts.next()) {
        fields.insert(
            String::from_utf8(key.to_vec()).unwrap(),
            String::from_utf8(value.to_vec()).unwrap(),
        );
    }
    fields
}

/// A session-protocol worker: envelope in, canned HTTP response out. The
/// returned counter tracks how many requests reached it.
async fn spawn_session_worker() -> (AddressSpec, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = AddressSpec::Tcp(listener.local_addr().unwrap().to_string());
    let counter = Arc::new(AtomicUsize::new(0));
    let counter2 = counter.clone();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let counter = counter2.clone();
            tokio::spawn(async move {
                let fields = read_envelope(&mut stream).await;
                counter.fetch_add(1, Ordering::SeqCst);
                let path = fields.get("PATH_INFO").cloned().unwrap_or_default();

                if fields.get("HTTP_UPGRADE").is_some() {
                    stream
                        .write_all(
                            b"HTTP/1.1 101 Switching Protocols\r\n\
                              Upgrade: echo\r\nConnection: Upgrade\r\n\r\n",
                        )
                        .await
                        .unwrap();
                    // Echo until the peer half-closes.
                    let mut buf = [0u8; 1024];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    return;
                }

                // Read the request body until the controller's shutdown(WR).
                let mut body = Vec::new();
                let _ = stream.read_to_end(&mut body).await;

                let response = match path.as_str() {
                    "/cacheable" => format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\
                         Cache-Control: max-age=60\r\n\
                         Date: {}\r\n\
                         Content-Length: 5\r\n\r\nhello",
                        drover_core::http::date::format_imf_fixdate(
                            drover_core::http::date::now_epoch()
                        )
                    ),
                    "/echo" => format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                        body.len(),
                        String::from_utf8_lossy(&body)
                    ),
                    _ => "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".to_string(),
                };
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });

    (address, counter)
}

fn controller_with(address: AddressSpec, max: usize) -> (Arc<Controller>, Arc<DummySpawner>) {
    let spawner = Arc::new(DummySpawner::new(1).fallback_address(address));
    let pool = Pool::new(
        PoolConfig {
            max,
            max_idle_time: Duration::from_secs(300),
        },
        spawner.clone(),
    );
    let options = Options::new("app")
        .min_processes(0)
        .max_request_queue_time(Duration::from_millis(100));
    let mut config = ControllerConfig::new(options);
    config.friendly_error_pages = true;
    (Controller::new(pool, config), spawner)
}

/// Runs one client connection against the controller over a socketpair,
/// returning the client end.
fn connect(controller: &Arc<Controller>) -> UnixStream {
    let (client, server) = UnixStream::pair().unwrap();
    let controller = controller.clone();
    tokio::spawn(async move {
        let conn = Connection::new_unix(server, "test client");
        controller.handle_connection(conn, "127.0.0.1".to_string()).await;
    });
    client
}

async fn roundtrip(controller: &Arc<Controller>, request: &str) -> String {
    let mut client = connect(controller);
    client.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    client.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test]
async fn basic_dispatch_proxies_a_request() {
    let (address, hits) = spawn_session_worker().await;
    let (controller, _) = controller_with(address, 4);

    let response = roundtrip(
        &controller,
        "GET / HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("X-Powered-By: Drover"));
    assert!(response.ends_with("\r\n\r\nok"));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(controller.pool().alive_process_count(), 1);
}

#[tokio::test]
async fn envelope_carries_cgi_keys_and_body() {
    let (address, _) = spawn_session_worker().await;
    let (controller, _) = controller_with(address, 4);

    let response = roundtrip(
        &controller,
        "POST /echo?q=1 HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\
         Connection: close\r\n\r\nhello",
    )
    .await;
    assert!(response.contains("200 OK"));
    assert!(response.ends_with("hello"));
}

#[tokio::test]
async fn chunked_request_bodies_are_buffered_and_forwarded() {
    let (address, _) = spawn_session_worker().await;
    let (controller, _) = controller_with(address, 4);

    let response = roundtrip(
        &controller,
        "POST /echo HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\
         Connection: close\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
    )
    .await;
    assert!(response.ends_with("hello world"));
}

#[tokio::test]
async fn queue_overflow_returns_the_canned_503() {
    let (address, _) = spawn_session_worker().await;
    let (controller, _) = controller_with(address, 1);

    // Take the only session slot and keep it.
    let held = controller
        .pool()
        .get(Options::new("app").min_processes(0))
        .await
        .expect("held session");

    let response = roundtrip(
        &controller,
        "GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
    assert!(response.contains("This website is under heavy load"));
    held.close(false, false);
}

#[tokio::test]
async fn spawn_failure_renders_a_friendly_error_page() {
    let (address, _) = spawn_session_worker().await;
    let (controller, spawner) = controller_with(address, 4);
    spawner.fail_next(SpawnError::new("INTERNAL_ERROR", "exit status 1").with_log("stack trace"));

    let response = roundtrip(
        &controller,
        "GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    assert!(response.contains("exit status 1"));
    assert!(response.contains("stack trace"));
}

#[tokio::test]
async fn malformed_requests_get_400() {
    let (address, _) = spawn_session_worker().await;
    let (controller, _) = controller_with(address, 4);

    let response = roundtrip(&controller, "GARBAGE\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
}

#[tokio::test]
async fn upgrade_with_a_body_is_rejected() {
    let (address, _) = spawn_session_worker().await;
    let (controller, _) = controller_with(address, 4);

    let response = roundtrip(
        &controller,
        "GET / HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nContent-Length: 3\r\n\r\nabc",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
}

#[tokio::test]
async fn turbocache_hit_short_circuits_the_pool() {
    let (address, hits) = spawn_session_worker().await;
    let (controller, _) = controller_with(address, 4);

    let request = "GET /cacheable HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n";
    let first = roundtrip(&controller, request).await;
    assert!(first.contains("hello"));
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let mut bodies = Vec::new();
    for _ in 0..10 {
        let response = roundtrip(&controller, request).await;
        assert!(response.contains("Age: "));
        assert!(response.ends_with("hello"));
        // Byte equality is modulo the synthesized Age header.
        let without_age: String = response
            .lines()
            .filter(|line| !line.starts_with("Age: "))
            .collect::<Vec<_>>()
            .join("\n");
        bodies.push(without_age);
    }
    assert!(bodies.windows(2).all(|w| w[0] == w[1]));
    // The pool was never consulted again.
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn upgraded_connections_become_a_bidirectional_pump() {
    let (address, _) = spawn_session_worker().await;
    let (controller, _) = controller_with(address, 4);

    let mut client = connect(&controller);
    client
        .write_all(b"GET /ws HTTP/1.1\r\nHost: x\r\nUpgrade: echo\r\nConnection: Upgrade\r\n\r\n")
        .await
        .unwrap();

    let mut buf = [0u8; 1024];
    let n = client.read(&mut buf).await.unwrap();
    let head = String::from_utf8_lossy(&buf[..n]).to_string();
    assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));

    client.write_all(b"ping").await.unwrap();
    let mut echo = [0u8; 4];
    client.read_exact(&mut echo).await.unwrap();
    assert_eq!(&echo, b"ping");

    // Half-closing our side propagates and tears the pump down.
    client.shutdown().await.unwrap();
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn keep_alive_serves_sequential_requests_on_one_connection() {
    let (address, hits) = spawn_session_worker().await;
    let (controller, _) = controller_with(address, 4);

    let mut client = connect(&controller);
    for i in 1..=3 {
        client
            .write_all(b"GET /echo HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let mut head = Vec::new();
        // Read until the end of this response's body ("...\r\n\r\n" plus
        // the zero-length echo body means the head is the whole response).
        loop {
            let mut byte = [0u8; 1];
            client.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
            if head.ends_with(b"\r\n\r\n") {
                break;
            }
        }
        let text = String::from_utf8_lossy(&head);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "request {}: {}", i, text);
        assert!(text.contains("Content-Length: 0\r\n"));
        assert_eq!(hits.load(Ordering::SeqCst), i);
    }
}
