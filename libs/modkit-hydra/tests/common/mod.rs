#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

//! Test servers shared by the integration tests.
//!
//! Every server runs on a background thread with its own runtime, so tests
//! stay plain `#[test]` functions calling the blocking client.

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, Query};
use axum::http::{HeaderMap, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Redirect};
use axum::routing::{any, get};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn fixture(name: &str) -> String {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
        .to_string_lossy()
        .into_owned()
}

/// Run `serve` on a fresh listener in a background runtime
fn spawn_async<F, Fut>(serve: F) -> SocketAddr
where
    F: FnOnce(tokio::net::TcpListener) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()>,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            tx.send(listener.local_addr().unwrap()).unwrap();
            serve(listener).await;
        });
    });
    rx.recv().unwrap()
}

// ---------------------------------------------------------------------------
// echo server (axum)
// ---------------------------------------------------------------------------

pub struct EchoServer {
    addr: SocketAddr,
}

impl EchoServer {
    pub fn start() -> Self {
        let addr = spawn_async(|listener| async move {
            axum::serve(listener, echo_router()).await.unwrap();
        });
        Self { addr }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

fn echo_router() -> Router {
    Router::new()
        .route("/echo", any(echo))
        .route("/echo/{*rest}", any(echo))
        .route("/slow/{millis}", get(slow))
        .route("/redirect/{hops}", any(redirect))
        .route("/temporary", any(|| async { Redirect::temporary("/echo") }))
        .route("/absolute", get(absolute_redirect))
        .route("/status/{code}", any(status))
        .route("/cookies/set", get(set_cookies))
        .route("/cookies/redirect", get(set_cookie_and_redirect))
        .route("/cookies", get(show_cookies))
}

async fn echo(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> impl IntoResponse {
    let headers: HashMap<String, String> = headers
        .iter()
        .map(|(k, v)| (k.as_str().to_owned(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
        .collect();
    axum::Json(serde_json::json!({
        "method": method.as_str(),
        "uri": uri.to_string(),
        "headers": headers,
        "body": String::from_utf8_lossy(&body),
    }))
}

async fn slow(Path(millis): Path<u64>) -> &'static str {
    tokio::time::sleep(Duration::from_millis(millis)).await;
    "slow"
}

async fn redirect(method: Method, Path(hops): Path<u32>, body: Bytes) -> axum::response::Response {
    if hops == 0 {
        return format!("{} {}", method.as_str(), String::from_utf8_lossy(&body)).into_response();
    }
    Redirect::to(&format!("/redirect/{}", hops - 1)).into_response()
}

async fn absolute_redirect(Query(params): Query<HashMap<String, String>>) -> axum::response::Response {
    match params.get("to") {
        Some(to) => Redirect::to(to).into_response(),
        None => StatusCode::BAD_REQUEST.into_response(),
    }
}

async fn status(Path(code): Path<u16>) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_REQUEST)
}

async fn set_cookies(Query(params): Query<HashMap<String, String>>) -> impl IntoResponse {
    let mut headers = HeaderMap::new();
    for (name, value) in params {
        headers.append(
            header::SET_COOKIE,
            format!("{name}={value}; Path=/").parse().unwrap(),
        );
    }
    (headers, "set")
}

async fn set_cookie_and_redirect() -> impl IntoResponse {
    (
        [(header::SET_COOKIE, "hop=1; Path=/")],
        Redirect::to("/cookies"),
    )
}

async fn show_cookies(headers: HeaderMap) -> String {
    headers
        .get(header::COOKIE)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// raw servers for misbehaving peers
// ---------------------------------------------------------------------------

/// Read one request head (and discard it)
fn read_head(stream: &TcpStream) -> Vec<String> {
    let mut reader = BufReader::new(stream);
    let mut lines = Vec::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }
        let line = line.trim_end().to_owned();
        if line.is_empty() {
            break;
        }
        lines.push(line);
    }
    lines
}

/// Server answering one request per connection with keep-alive headers,
/// then closing the socket anyway. Returns the address and a connection counter.
pub fn flaky_keepalive_server() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connections);
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            counter.fetch_add(1, Ordering::SeqCst);
            if read_head(&stream).is_empty() {
                continue;
            }
            let _ = stream.write_all(
                b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: keep-alive\r\n\r\nok",
            );
            let _ = stream.flush();
            // dropped: the pooled connection is now dead
        }
    });
    (addr, connections)
}

/// Server sending a response head and a partial body, then going silent
pub fn stalling_server(stall: Duration) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            thread::spawn(move || {
                read_head(&stream);
                let _ = stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\npartial");
                let _ = stream.flush();
                thread::sleep(stall);
            });
        }
    });
    addr
}

/// Server that accepts connections and never answers
pub fn silent_server(stall: Duration) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { continue };
            thread::spawn(move || {
                let mut sink = [0_u8; 1024];
                let _ = (&stream).read(&mut sink);
                thread::sleep(stall);
                drop(stream);
            });
        }
    });
    addr
}

/// Head of a request seen by [`recording_proxy`]
#[derive(Debug, Clone)]
pub struct Recorded {
    pub request_line: String,
    pub headers: Vec<String>,
}

impl Recorded {
    pub fn header(&self, name: &str) -> Option<String> {
        let prefix = format!("{}:", name.to_ascii_lowercase());
        self.headers
            .iter()
            .find(|h| h.to_ascii_lowercase().starts_with(&prefix))
            .map(|h| h[prefix.len()..].trim().to_owned())
    }
}

/// Forward proxy stand-in: records every request head and answers it itself.
///
/// `CONNECT` requests are refused with 407.
pub fn recording_proxy() -> (SocketAddr, mpsc::Receiver<Recorded>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            let mut head = read_head(&stream);
            if head.is_empty() {
                continue;
            }
            let request_line = head.remove(0);
            let response: &[u8] = if request_line.starts_with("CONNECT ") {
                b"HTTP/1.1 407 Proxy Authentication Required\r\nContent-Length: 0\r\n\r\n"
            } else {
                b"HTTP/1.1 200 OK\r\nContent-Length: 7\r\nConnection: close\r\n\r\nproxied"
            };
            let _ = tx.send(Recorded {
                request_line,
                headers: head,
            });
            let _ = stream.write_all(response);
        }
    });
    (addr, rx)
}

// ---------------------------------------------------------------------------
// TLS server (tokio-rustls)
// ---------------------------------------------------------------------------

fn server_identity(cert: &str, key: &str) -> (Vec<rustls_pki_types::CertificateDer<'static>>, rustls_pki_types::PrivateKeyDer<'static>) {
    use rustls_pki_types::pem::PemObject;
    use rustls_pki_types::{CertificateDer, PrivateKeyDer};

    let certs = CertificateDer::pem_file_iter(fixture(cert))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    (certs, PrivateKeyDer::from_pem_file(fixture(key)).unwrap())
}

/// HTTPS server answering every request with `secure`, using the given
/// certificate and key fixtures
pub fn tls_server(cert: &str, key: &str) -> SocketAddr {
    let (certs, key) = server_identity(cert, key);
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .unwrap();
    serve_tls(config)
}

/// HTTPS server that requires a client certificate issued by `client_ca`.
///
/// Pinned to TLS 1.2 so a missing certificate fails the client's handshake.
pub fn mutual_tls_server(cert: &str, key: &str, client_ca: &str) -> SocketAddr {
    use rustls_pki_types::CertificateDer;
    use rustls_pki_types::pem::PemObject;

    let (certs, key) = server_identity(cert, key);
    let mut roots = rustls::RootCertStore::empty();
    for ca in CertificateDer::pem_file_iter(fixture(client_ca)).unwrap() {
        roots.add(ca.unwrap()).unwrap();
    }
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let verifier = rustls::server::WebPkiClientVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
        .build()
        .unwrap();
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS12])
        .unwrap()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .unwrap();
    serve_tls(config)
}

fn serve_tls(config: rustls::ServerConfig) -> SocketAddr {
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));

    spawn_async(move |listener| async move {
        loop {
            let Ok((tcp, _)) = listener.accept().await else { continue };
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                use tokio::io::{AsyncReadExt, AsyncWriteExt};
                let Ok(mut tls) = acceptor.accept(tcp).await else { return };
                let mut buf = vec![0_u8; 4096];
                let mut seen = Vec::new();
                while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
                    match tls.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => seen.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = tls
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\nConnection: close\r\n\r\nsecure")
                    .await;
                let _ = tls.shutdown().await;
            });
        }
    })
}
