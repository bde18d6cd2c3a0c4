use crate::config::KeepAlive;
use crate::connect::Connector;
use crate::error::{BoxError, HttpError, SocketFaultKind, TimeoutKind, classify_io};
use crate::layers::context;
use crate::pool::{ConnectionPool, Lease, Route};
use crate::request::Settings;
use crate::response::ResponseBody;
use bytes::Bytes;
use http::header::{self, HeaderValue};
use http::{Request, Response, Uri};
use http_body::{Body, Frame, SizeHint};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use pin_project_lite::pin_project;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Instant, Sleep};
use url::Url;

/// Innermost service: leases a pooled connection and performs one exchange.
///
/// The returned body holds the lease; the connection goes back to the pool
/// once the body has been read to the end.
#[derive(Clone)]
pub(crate) struct PooledTransport {
    pool: Arc<ConnectionPool>,
    connector: Connector,
    keepalive: KeepAlive,
    defaults: Settings,
    /// Keep client-authenticated TLS connections out of the pool
    isolate_identity: bool,
}

impl PooledTransport {
    pub(crate) fn new(
        pool: Arc<ConnectionPool>,
        connector: Connector,
        keepalive: KeepAlive,
        defaults: Settings,
        isolate_identity: bool,
    ) -> Self {
        Self {
            pool,
            connector,
            keepalive,
            defaults,
            isolate_identity,
        }
    }

    async fn send(self, req: Request<Full<Bytes>>) -> Result<Response<ResponseBody>, HttpError> {
        let settings = context(&req).map_or_else(|| self.defaults.clone(), |ctx| ctx.settings.clone());
        let url = Url::parse(&req.uri().to_string())?;
        let route = Route::for_url(&url, settings.proxy.clone())?;

        let mut lease = self.pool.acquire(&route, settings.request_timeout).await?;
        let reused = lease.is_reused();
        let mut conn = match lease.take_connection() {
            Some(conn) => conn,
            None => self.connector.connect(&route, settings.connect_timeout).await?,
        };
        conn.ready().await.map_err(|e| HttpError::Socket {
            kind: SocketFaultKind::ClosedBeforeResponse,
            source: Box::new(e),
        })?;

        let req = self.prepare(req, &route, &url)?;
        tracing::debug!(
            method = %req.method(),
            url = %url,
            reused,
            "sending request"
        );

        let exchange = conn.send_request(req);
        let result = if settings.socket_timeout.is_zero() {
            exchange.await
        } else {
            tokio::time::timeout(settings.socket_timeout, exchange)
                .await
                .map_err(|elapsed| HttpError::timeout(TimeoutKind::Socket, settings.socket_timeout, elapsed))?
        };
        let response = result.map_err(|e| classify_hyper(e, settings.socket_timeout))?;

        if let Some(expires) = self.reuse_expiry(&response, &route) {
            lease.allow_reuse(expires);
        }
        lease.attach(conn);

        let (parts, body) = response.into_parts();
        let body = PooledBody::new(body, lease, settings.socket_timeout);
        Ok(Response::from_parts(parts, body.boxed()))
    }

    fn prepare(
        &self,
        mut req: Request<Full<Bytes>>,
        route: &Route,
        url: &Url,
    ) -> Result<Request<Full<Bytes>>, HttpError> {
        let host = match url.port() {
            Some(port) => format!("{}:{port}", url.host_str().unwrap_or_default()),
            None => url.host_str().unwrap_or_default().to_owned(),
        };
        let headers = req.headers_mut();
        if !headers.contains_key(header::HOST) {
            headers.insert(header::HOST, HeaderValue::from_str(&host)?);
        }
        if matches!(self.keepalive, KeepAlive::Disabled | KeepAlive::Seconds(0)) {
            headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
        }

        match &route.proxy {
            // Plain HTTP through a proxy keeps the absolute form
            Some(proxy) if !route.is_tls() => {
                if let Some(value) = proxy.authorization() {
                    req.headers_mut()
                        .insert(header::PROXY_AUTHORIZATION, HeaderValue::from_str(&value)?);
                }
            }
            _ => {
                let origin = match url.query() {
                    Some(query) => format!("{}?{query}", url.path()),
                    None => url.path().to_owned(),
                };
                *req.uri_mut() = origin
                    .parse::<Uri>()
                    .map_err(|e| HttpError::invalid_argument("invalid request target", e))?;
            }
        }
        Ok(req)
    }

    /// `None` when the connection must not be reused, otherwise its idle expiry
    fn reuse_expiry<B>(&self, response: &Response<B>, route: &Route) -> Option<Option<Instant>> {
        let server_closes = response
            .headers()
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.split(',').any(|token| token.trim().eq_ignore_ascii_case("close")));
        if server_closes || (self.isolate_identity && route.is_tls()) {
            return None;
        }
        match self.keepalive {
            KeepAlive::Disabled | KeepAlive::Seconds(0) => None,
            KeepAlive::Seconds(secs) => Some(Some(Instant::now() + Duration::from_secs(secs))),
            KeepAlive::Enabled => Some(
                keep_alive_timeout(response.headers()).map(|timeout| Instant::now() + timeout),
            ),
        }
    }
}

impl tower::Service<Request<Full<Bytes>>> for PooledTransport {
    type Response = Response<ResponseBody>;
    type Error = HttpError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.pool.is_closed() {
            return Poll::Ready(Err(HttpError::ClientStopped));
        }
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Full<Bytes>>) -> Self::Future {
        Box::pin(self.clone().send(req))
    }
}

/// `timeout=N` of a server `Keep-Alive` header
fn keep_alive_timeout(headers: &http::HeaderMap) -> Option<Duration> {
    let value = headers.get("keep-alive")?.to_str().ok()?;
    value.split(',').find_map(|param| {
        let (name, secs) = param.split_once('=')?;
        if name.trim().eq_ignore_ascii_case("timeout") {
            secs.trim().parse::<u64>().ok().map(Duration::from_secs)
        } else {
            None
        }
    })
}

/// Map a hyper failure before the response head to the client taxonomy
pub(crate) fn classify_hyper(err: hyper::Error, socket_timeout: Duration) -> HttpError {
    if err.is_timeout() {
        return HttpError::timeout(TimeoutKind::Socket, socket_timeout, err);
    }
    if err.is_parse() || err.is_parse_status() || err.is_parse_too_large() {
        return HttpError::ClientProtocol(Box::new(err));
    }
    if err.is_canceled() || err.is_incomplete_message() || err.is_closed() {
        return HttpError::Socket {
            kind: SocketFaultKind::ClosedBeforeResponse,
            source: Box::new(err),
        };
    }
    match io_kind(&err) {
        Some(
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof,
        ) => HttpError::Socket {
            kind: SocketFaultKind::ClosedBeforeResponse,
            source: Box::new(err),
        },
        Some(kind) => classify_io(io::Error::new(kind, err)),
        None => HttpError::Unknown(Box::new(err)),
    }
}

fn io_kind(err: &hyper::Error) -> Option<io::ErrorKind> {
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<io::Error>() {
            return Some(io.kind());
        }
        source = cause.source();
    }
    None
}

/// A failure after the head arrived is never a pre-response fault
fn classify_body_error(err: hyper::Error, socket_timeout: Duration) -> HttpError {
    match classify_hyper(err, socket_timeout) {
        HttpError::Socket {
            kind: SocketFaultKind::ClosedBeforeResponse,
            source,
        } => HttpError::Socket {
            kind: SocketFaultKind::Other,
            source,
        },
        other => other,
    }
}

pin_project! {
    /// Response body holding the pool lease of its connection.
    ///
    /// Enforces the socket timeout between frames and hands the connection
    /// back to the pool at end of stream.
    pub(crate) struct PooledBody {
        #[pin]
        inner: Incoming,
        lease: Option<Lease>,
        socket_timeout: Duration,
        sleep: Option<Pin<Box<Sleep>>>,
    }
}

impl PooledBody {
    fn new(inner: Incoming, lease: Lease, socket_timeout: Duration) -> Self {
        let lease = if inner.is_end_stream() {
            lease.release();
            None
        } else {
            Some(lease)
        };
        Self {
            inner,
            lease,
            socket_timeout,
            sleep: None,
        }
    }
}

impl Body for PooledBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        match this.inner.poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                *this.sleep = None;
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.lease.take();
                Poll::Ready(Some(Err(Box::new(classify_body_error(e, *this.socket_timeout)))))
            }
            Poll::Ready(None) => {
                if let Some(lease) = this.lease.take() {
                    lease.release();
                }
                Poll::Ready(None)
            }
            Poll::Pending => {
                if this.socket_timeout.is_zero() {
                    return Poll::Pending;
                }
                // The read timer starts when the reader first has to wait.
                let timeout = *this.socket_timeout;
                let sleep = this
                    .sleep
                    .get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
                if sleep.as_mut().poll(cx).is_ready() {
                    this.lease.take();
                    let err = HttpError::timeout(
                        TimeoutKind::Socket,
                        *this.socket_timeout,
                        "no data received while reading the response body",
                    );
                    return Poll::Ready(Some(Err(Box::new(err))));
                }
                Poll::Pending
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
