use crate::config::ClientConfig;
use crate::error::HttpError;
use http::header::{self, HeaderMap, HeaderValue};
use http::Request;
use std::task::{Context, Poll};
use tower::{Layer, Service};

/// Tower layer filling in client-wide headers the request does not carry
#[derive(Debug, Clone)]
pub struct DefaultHeadersLayer {
    defaults: HeaderMap,
}

impl DefaultHeadersLayer {
    /// Defaults derived from the client configuration (`User-Agent`)
    ///
    /// # Errors
    /// Returns `HttpError::InvalidArgument` if the user agent is not a valid header value
    pub fn from_config(config: &ClientConfig) -> Result<Self, HttpError> {
        let mut defaults = HeaderMap::with_capacity(1);
        defaults.insert(header::USER_AGENT, HeaderValue::from_str(&config.user_agent)?);
        Ok(Self { defaults })
    }

    #[must_use]
    pub fn defaults(&self) -> &HeaderMap {
        &self.defaults
    }
}

impl<S> Layer<S> for DefaultHeadersLayer {
    type Service = DefaultHeadersService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        DefaultHeadersService {
            inner,
            defaults: self.defaults.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DefaultHeadersService<S> {
    inner: S,
    defaults: HeaderMap,
}

impl<S, B> Service<Request<B>> for DefaultHeadersService<S>
where
    S: Service<Request<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        let headers = req.headers_mut();
        for (name, value) in &self.defaults {
            if !headers.contains_key(name) {
                headers.insert(name.clone(), value.clone());
            }
        }
        self.inner.call(req)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tower::ServiceExt;

    /// Records the headers of every request it sees
    #[derive(Clone, Default)]
    struct Recorder {
        seen: Arc<Mutex<Vec<HeaderMap>>>,
    }

    impl Service<Request<()>> for Recorder {
        type Response = ();
        type Error = HttpError;
        type Future = std::future::Ready<Result<(), HttpError>>;

        fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: Request<()>) -> Self::Future {
            self.seen.lock().unwrap().push(req.headers().clone());
            std::future::ready(Ok(()))
        }
    }

    fn layer(user_agent: &str) -> DefaultHeadersLayer {
        let config = ClientConfig {
            user_agent: user_agent.to_owned(),
            ..ClientConfig::default()
        };
        DefaultHeadersLayer::from_config(&config).unwrap()
    }

    #[tokio::test]
    async fn test_missing_user_agent_is_filled_in() {
        let recorder = Recorder::default();
        let service = layer(crate::DEFAULT_USER_AGENT).layer(recorder.clone());

        service.oneshot(Request::new(())).await.unwrap();

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen[0][header::USER_AGENT], crate::DEFAULT_USER_AGENT);
    }

    #[tokio::test]
    async fn test_request_value_wins() {
        let recorder = Recorder::default();
        let service = layer("hydra/1.0").layer(recorder.clone());

        let req = Request::builder()
            .header("user-agent", "caller/2.0")
            .body(())
            .unwrap();
        service.oneshot(req).await.unwrap();

        let seen = recorder.seen.lock().unwrap();
        let values: Vec<_> = seen[0].get_all(header::USER_AGENT).iter().collect();
        assert_eq!(values, ["caller/2.0"]);
    }

    #[test]
    fn test_invalid_user_agent() {
        let config = ClientConfig {
            user_agent: "bad\nagent".to_owned(),
            ..ClientConfig::default()
        };
        let result = DefaultHeadersLayer::from_config(&config);
        assert!(matches!(result, Err(HttpError::InvalidArgument { .. })));
    }
}
