//! Redirect following
//!
//! `301`, `302`, `303`, `307` and `308` responses carrying a `Location` are
//! followed up to the per-request limit:
//! - `307` / `308` replay the method and body unchanged
//! - the others switch to `GET` (`HEAD` stays `HEAD`) and drop the body
//! - `Authorization`, `Cookie` and `Proxy-Authorization` are stripped when a
//!   hop leaves the origin (scheme, host, port)
//!
//! Every hop travels through the inner stack again, so cookies set along the
//! way are stored and sent on the next hop.

use crate::error::HttpError;
use crate::response::ResponseBody;
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode, Uri, header};
use http_body_util::{BodyExt, Full};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tower::{Layer, Service, ServiceExt};
use url::Url;

/// Headers that are stripped on cross-origin redirects to prevent credential leakage
const SENSITIVE_HEADERS: &[header::HeaderName] = &[
    header::AUTHORIZATION,
    header::COOKIE,
    header::PROXY_AUTHORIZATION,
];

/// Intermediate bodies larger than this are abandoned instead of drained
const REDIRECT_DRAIN_LIMIT: usize = 64 * 1024;

/// Tower layer following redirects
///
/// The limits given here apply to requests that carry no per-request
/// context; client requests always carry one.
#[derive(Debug, Clone, Copy)]
pub struct RedirectLayer {
    max_redirects: usize,
    follow: bool,
}

impl RedirectLayer {
    #[must_use]
    pub fn new(max_redirects: usize, follow: bool) -> Self {
        Self {
            max_redirects,
            follow,
        }
    }
}

impl<S> Layer<S> for RedirectLayer {
    type Service = RedirectService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RedirectService {
            inner,
            max_redirects: self.max_redirects,
            follow: self.follow,
        }
    }
}

/// Service following redirects
#[derive(Debug, Clone)]
pub struct RedirectService<S> {
    inner: S,
    max_redirects: usize,
    follow: bool,
}

/// Check if the redirect is to the same origin (scheme, host, port)
///
/// Missing schemes default to "https" (fail-closed).
fn is_same_origin(original: &Uri, target: &Uri) -> bool {
    let orig_scheme = original.scheme_str().unwrap_or("https");
    let target_scheme = target.scheme_str().unwrap_or("https");

    let orig_host = original.host().unwrap_or("");
    let target_host = target.host().unwrap_or("");

    let orig_port = original
        .port_u16()
        .unwrap_or_else(|| default_port(orig_scheme));
    let target_port = target
        .port_u16()
        .unwrap_or_else(|| default_port(target_scheme));

    orig_scheme == target_scheme
        && orig_host.eq_ignore_ascii_case(target_host)
        && orig_port == target_port
}

/// Get the default port for a scheme
fn default_port(scheme: &str) -> u16 {
    match scheme {
        "http" => 80,
        "https" => 443,
        _ => 0,
    }
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

/// Resolve `Location` against the URL that produced it
fn resolve_location(current: &Url, response: &Response<ResponseBody>) -> Result<Option<Url>, HttpError> {
    let Some(location) = response.headers().get(header::LOCATION) else {
        return Ok(None);
    };
    let location = location
        .to_str()
        .map_err(|e| HttpError::ClientProtocol(format!("invalid Location header: {e}").into()))?;
    let target = current
        .join(location)
        .map_err(|e| HttpError::ClientProtocol(format!("invalid Location '{location}': {e}").into()))?;
    match target.scheme() {
        "http" | "https" => Ok(Some(target)),
        other => Err(HttpError::ClientProtocol(
            format!("refusing redirect to unsupported scheme '{other}'").into(),
        )),
    }
}

/// Next request in the chain, derived from the previous one
fn next_request(
    previous: &Request<Full<Bytes>>,
    status: StatusCode,
    target: &Url,
) -> Result<Request<Full<Bytes>>, HttpError> {
    let uri: Uri = target
        .as_str()
        .parse()
        .map_err(|e| HttpError::invalid_argument("invalid redirect target", e))?;

    let keep_method = matches!(
        status,
        StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT
    );
    let (method, body) = if keep_method {
        (previous.method().clone(), previous.body().clone())
    } else if previous.method() == Method::HEAD {
        (Method::HEAD, Full::new(Bytes::new()))
    } else {
        (Method::GET, Full::new(Bytes::new()))
    };

    let mut headers = previous.headers().clone();
    headers.remove(header::HOST);
    if !keep_method {
        headers.remove(header::CONTENT_TYPE);
        headers.remove(header::CONTENT_LENGTH);
        headers.remove(header::EXPECT);
    }
    if !is_same_origin(previous.uri(), &uri) {
        for header_name in SENSITIVE_HEADERS {
            if headers.remove(header_name).is_some() {
                tracing::debug!(header = %header_name, "Stripped sensitive header on cross-origin redirect");
            }
        }
    }

    let mut request = Request::new(body);
    *request.method_mut() = method;
    *request.uri_mut() = uri;
    *request.version_mut() = previous.version();
    *request.headers_mut() = headers;
    *request.extensions_mut() = previous.extensions().clone();
    Ok(request)
}

/// Drain response body up to limit bytes to allow connection reuse.
///
/// Stops early once `limit` bytes have been read; the connection is then
/// not reused.
pub(crate) async fn drain_response_body(
    response: Response<ResponseBody>,
    limit: usize,
) -> Result<(), HttpError> {
    let (_parts, body) = response.into_parts();
    let mut body = std::pin::pin!(body);
    let mut drained = 0usize;

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(crate::error::from_boxed)?;
        if let Some(chunk) = frame.data_ref() {
            drained += chunk.len();
            if drained >= limit {
                break;
            }
        }
    }

    Ok(())
}

impl<S> Service<Request<Full<Bytes>>> for RedirectService<S>
where
    S: Service<Request<Full<Bytes>>, Response = Response<ResponseBody>, Error = HttpError>
        + Clone
        + Send
        + 'static,
    S::Future: Send,
{
    type Response = S::Response;
    type Error = HttpError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Full<Bytes>>) -> Self::Future {
        // Swap so we consume the instance that was poll_ready'd,
        // leaving a fresh clone for the next poll_ready cycle.
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);

        let context = super::context(&req).cloned();
        let (follow, max_redirects) = context.as_ref().map_or((self.follow, self.max_redirects), |ctx| {
            (ctx.settings.follow_redirects, ctx.settings.max_redirects)
        });

        Box::pin(async move {
            let mut current_url = Url::parse(&req.uri().to_string())?;
            let mut req = req;
            let mut redirects = 0usize;

            loop {
                let mut svc = inner.clone();
                svc.ready().await?;
                let response = svc.call(next_attempt(&req)).await?;

                if !follow || !is_redirect(response.status()) {
                    return Ok(response);
                }
                let Some(target) = resolve_location(&current_url, &response)? else {
                    return Ok(response);
                };

                redirects += 1;
                if redirects > max_redirects {
                    tracing::debug!(count = redirects, max = max_redirects, "Redirect limit reached");
                    return Err(HttpError::ClientProtocol(
                        format!("maximum redirects ({max_redirects}) exceeded").into(),
                    ));
                }

                let status = response.status();
                if let Err(e) = drain_response_body(response, REDIRECT_DRAIN_LIMIT).await {
                    tracing::debug!(error = %e, "Failed to drain redirect body; connection may not be reused");
                }

                tracing::debug!(
                    status = status.as_u16(),
                    from = %current_url,
                    to = %target,
                    hop = redirects,
                    "Following redirect"
                );

                req = next_request(&req, status, &target)?;
                if let Some(ctx) = &context {
                    ctx.exchange.set_final_url(target.clone());
                }
                current_url = target;
            }
        })
    }
}

/// Copy of `req` for one attempt; the original is kept to derive the next hop
fn next_attempt(req: &Request<Full<Bytes>>) -> Request<Full<Bytes>> {
    let mut attempt = Request::new(req.body().clone());
    *attempt.method_mut() = req.method().clone();
    *attempt.uri_mut() = req.uri().clone();
    *attempt.version_mut() = req.version();
    *attempt.headers_mut() = req.headers().clone();
    *attempt.extensions_mut() = req.extensions().clone();
    attempt
}
