use crate::error::HttpError;
use crate::response::ResponseBody;
use bytes::Bytes;
use http::{Request, Response};
use http_body_util::Full;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service, ServiceExt};

/// Decides whether a failed attempt is replayed.
///
/// `attempt` counts executions so far: it is `1` when the first attempt
/// failed. Only faults reported by the transport reach the decider; HTTP
/// statuses never do.
pub trait RetryDecider: Send + Sync {
    fn should_retry(&self, fault: &HttpError, attempt: usize) -> bool;
}

impl<F> RetryDecider for F
where
    F: Fn(&HttpError, usize) -> bool + Send + Sync,
{
    fn should_retry(&self, fault: &HttpError, attempt: usize) -> bool {
        self(fault, attempt)
    }
}

/// Default decider: up to `max_retries` replays of faults that happened
/// before any response byte was received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutomaticRetries {
    pub max_retries: usize,
}

impl AutomaticRetries {
    #[must_use]
    pub fn new(max_retries: usize) -> Self {
        Self { max_retries }
    }
}

impl RetryDecider for AutomaticRetries {
    fn should_retry(&self, fault: &HttpError, attempt: usize) -> bool {
        attempt <= self.max_retries && fault.is_pre_response_fault()
    }
}

/// Shareable retry decision, set through `ClientConfig::retry_policy`
#[derive(Clone)]
pub struct RetryPolicy(Arc<dyn RetryDecider>);

impl RetryPolicy {
    pub fn new(decider: impl RetryDecider + 'static) -> Self {
        Self(Arc::new(decider))
    }

    /// Default policy for `automatic_retries`
    #[must_use]
    pub fn automatic(max_retries: usize) -> Self {
        Self::new(AutomaticRetries::new(max_retries))
    }

    #[must_use]
    pub fn should_retry(&self, fault: &HttpError, attempt: usize) -> bool {
        self.0.should_retry(fault, attempt)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy").finish_non_exhaustive()
    }
}

/// Tower layer replaying requests whose attempt failed at the transport level
#[derive(Clone, Debug)]
pub struct RetryLayer {
    policy: RetryPolicy,
}

impl RetryLayer {
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }
}

impl<S> Layer<S> for RetryLayer {
    type Service = RetryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RetryService {
            inner,
            policy: self.policy.clone(),
        }
    }
}

/// Service that implements the retry loop
///
/// Retries are immediate: a pre-response fault usually means a stale pooled
/// connection, and the next attempt leases or opens another one. Every
/// replay is counted on the request's exchange so the response can report
/// `times_retried`.
#[derive(Clone, Debug)]
pub struct RetryService<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S> Service<Request<Full<Bytes>>> for RetryService<S>
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
        let policy = self.policy.clone();

        let (parts, body_bytes) = req.into_parts();

        // Preserve HTTP version for retry requests (required per HTTP spec)
        let http_version = parts.version;

        // Extensions carry the per-request context; every attempt needs it
        let extensions = parts.extensions.clone();
        let exchange = super::context_of(&extensions).map(|ctx| Arc::clone(&ctx.exchange));

        let parts = Arc::new(parts);

        Box::pin(async move {
            let method = parts.method.clone();

            // Use authority() for full host:port, falling back to host() or "unknown"
            let url_host = parts
                .uri
                .authority()
                .map(ToString::to_string)
                .or_else(|| parts.uri.host().map(ToOwned::to_owned))
                .unwrap_or_else(|| "unknown".to_owned());
            let request_id = parts
                .headers
                .get("x-request-id")
                .or_else(|| parts.headers.get("x-correlation-id"))
                .and_then(|v| v.to_str().ok())
                .map(String::from);

            let mut attempt = 0usize;
            loop {
                // Reconstruct request from preserved parts
                let mut req = Request::from_parts((*parts).clone(), body_bytes.clone());

                // Restore HTTP version (may have been lost during Parts clone)
                *req.version_mut() = http_version;
                *req.extensions_mut() = extensions.clone();

                let mut svc = inner.clone();
                svc.ready().await?;

                match svc.call(req).await {
                    Ok(resp) => return Ok(resp),
                    Err(err) => {
                        attempt += 1;
                        if !policy.should_retry(&err, attempt) {
                            if attempt > 1 {
                                tracing::debug!(
                                    attempts = attempt,
                                    error = %err,
                                    method = %method,
                                    host = %url_host,
                                    "Giving up after retries"
                                );
                            }
                            return Err(err);
                        }

                        tracing::debug!(
                            retry = attempt,
                            error = %err,
                            method = %method,
                            host = %url_host,
                            request_id = ?request_id,
                            "Retrying request after error"
                        );
                        if let Some(exchange) = &exchange {
                            exchange.record_retry();
                        }
                    }
                }
            }
        })
    }
}
