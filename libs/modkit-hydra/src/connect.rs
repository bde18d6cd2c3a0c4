//! Establishing new connections: DNS, TCP, proxy tunnel, TLS, HTTP/1.1 handshake.

use crate::error::{HttpError, TimeoutKind, classify_io};
use crate::pool::{Connection, Route};
use hyper_util::rt::TokioIo;
use rustls_pki_types::ServerName;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// Largest proxy `CONNECT` response head we accept
const MAX_TUNNEL_RESPONSE: usize = 8 * 1024;

trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

type BoxedIo = Box<dyn Io>;

/// Opens connections for pool misses
#[derive(Clone)]
pub(crate) struct Connector {
    tls: Arc<rustls::ClientConfig>,
    tcp_no_delay: bool,
}

impl Connector {
    pub(crate) fn new(tls: Arc<rustls::ClientConfig>, tcp_no_delay: bool) -> Self {
        Self { tls, tcp_no_delay }
    }

    /// Open a connection for `route` within `timeout` (zero = no limit)
    ///
    /// # Errors
    /// `Timeout{Connect}`, `ResolutionFailure`, `Socket` or `ClientProtocol`
    /// depending on the phase that failed.
    pub(crate) async fn connect(&self, route: &Route, timeout: Duration) -> Result<Connection, HttpError> {
        if timeout.is_zero() {
            return self.establish(route).await;
        }
        tokio::time::timeout(timeout, self.establish(route))
            .await
            .map_err(|elapsed| HttpError::timeout(TimeoutKind::Connect, timeout, elapsed))?
    }

    async fn establish(&self, route: &Route) -> Result<Connection, HttpError> {
        let key = &route.key;
        let io: BoxedIo = match &route.proxy {
            None => {
                let tcp = self.open_tcp(&key.host, key.port).await?;
                if route.is_tls() {
                    self.handshake_tls(&key.host, tcp).await?
                } else {
                    Box::new(tcp)
                }
            }
            Some(proxy) => {
                let tcp = self.open_tcp(&proxy.host, proxy.port).await?;
                let mut io: BoxedIo = if proxy.is_tls() {
                    self.handshake_tls(&proxy.host, tcp).await?
                } else {
                    Box::new(tcp)
                };
                if route.is_tls() {
                    tunnel(&mut io, &key.host, key.port, proxy.authorization().as_deref()).await?;
                    self.handshake_tls(&key.host, io).await?
                } else {
                    io
                }
            }
        };

        let (sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(io))
            .await
            .map_err(|e| HttpError::ClientProtocol(Box::new(e)))?;
        let route_name = key.to_string();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!(route = %route_name, error = %e, "connection task ended with error");
            }
        });
        tracing::debug!(route = %key, "opened new connection");
        Ok(sender)
    }

    async fn open_tcp(&self, host: &str, port: u16) -> Result<TcpStream, HttpError> {
        let addrs: Vec<_> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| HttpError::ResolutionFailure {
                host: host.to_owned(),
                source: Box::new(e),
            })?
            .collect();
        if addrs.is_empty() {
            return Err(HttpError::ResolutionFailure {
                host: host.to_owned(),
                source: "no addresses returned".into(),
            });
        }

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    if self.tcp_no_delay
                        && let Err(e) = stream.set_nodelay(true)
                    {
                        tracing::debug!(error = %e, "failed to set TCP_NODELAY");
                    }
                    return Ok(stream);
                }
                Err(e) => {
                    tracing::trace!(%addr, error = %e, "connect attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(classify_io(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "no address could be connected")
        })))
    }

    async fn handshake_tls<S>(&self, host: &str, io: S) -> Result<BoxedIo, HttpError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let server_name = ServerName::try_from(host.to_owned())
            .map_err(|e| HttpError::invalid_argument(format!("invalid TLS server name '{host}'"), e))?;
        let stream = TlsConnector::from(Arc::clone(&self.tls))
            .connect(server_name, io)
            .await
            .map_err(|e| match e.kind() {
                io::ErrorKind::InvalidData | io::ErrorKind::Other => HttpError::ClientProtocol(Box::new(e)),
                _ => classify_io(e),
            })?;
        Ok(Box::new(stream))
    }
}

/// Ask an HTTP proxy for a `CONNECT` tunnel to `host:port`
async fn tunnel(io: &mut BoxedIo, host: &str, port: u16, authorization: Option<&str>) -> Result<(), HttpError> {
    let authority = if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };
    let mut head = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    if let Some(value) = authorization {
        head.push_str("Proxy-Authorization: ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    io.write_all(head.as_bytes()).await.map_err(classify_io)?;
    io.flush().await.map_err(classify_io)?;

    let mut buf = Vec::with_capacity(512);
    let mut chunk = [0_u8; 512];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        if buf.len() > MAX_TUNNEL_RESPONSE {
            return Err(HttpError::ClientProtocol("proxy CONNECT response too large".into()));
        }
        let n = io.read(&mut chunk).await.map_err(classify_io)?;
        if n == 0 {
            return Err(HttpError::Socket {
                kind: crate::error::SocketFaultKind::ClosedBeforeResponse,
                source: "proxy closed the connection during CONNECT".into(),
            });
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let status_line = String::from_utf8_lossy(&buf);
    let status_line = status_line.lines().next().unwrap_or_default();
    let status = status_line.split_whitespace().nth(1).unwrap_or_default();
    if status != "200" {
        return Err(HttpError::ClientProtocol(
            format!("proxy refused tunnel to {authority}: {status_line}").into(),
        ));
    }
    tracing::debug!(target = %authority, "proxy tunnel established");
    Ok(())
}
