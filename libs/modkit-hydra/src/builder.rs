use crate::client::Client;
use crate::config::{
    ClientConfig, CookieMode, KeepAlive, ProxyConfig, SslConfig, TlsRootConfig, VerifyMode,
};
use crate::connect::Connector;
use crate::error::HttpError;
use crate::layers::{
    CookieLayer, DefaultHeadersLayer, RedirectLayer, RetryDecider, RetryLayer, RetryPolicy,
};
use crate::pool::ConnectionPool;
use crate::request::Settings;
use crate::response::ResponseBody;
use crate::ssl::build_tls_config;
use crate::transport::PooledTransport;
use crate::trust::{IntoTrustStrategy, TrustStrategy};
use bytes::Bytes;
use http::Response;
use http_body_util::{BodyExt, Full};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tower::util::BoxCloneService;
use tower::{ServiceBuilder, ServiceExt};
use tower_http::decompression::DecompressionLayer;

/// Type-erased service between layer composition steps in [`build_service`].
pub(crate) type InnerService =
    BoxCloneService<http::Request<Full<Bytes>>, http::Response<ResponseBody>, HttpError>;

/// Builder for constructing a [`Client`] from a [`ClientConfig`]
///
/// Configuration errors surface from [`ClientBuilder::build`]; the I/O
/// engine itself starts on the first network request.
#[derive(Debug, Clone, Default)]
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    /// Create a new builder with default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder with a specific configuration
    #[must_use]
    pub fn with_config(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Start from [`ClientConfig::load`]
    ///
    /// # Errors
    /// Returns `HttpError::Config` when a configuration source is invalid.
    pub fn from_file(path: Option<&Path>) -> Result<Self, HttpError> {
        ClientConfig::load(path).map(Self::with_config)
    }

    /// Set the user agent string
    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Total pooled connections, leased plus idle
    #[must_use]
    pub fn pool_max(mut self, max: usize) -> Self {
        self.config.pool_max = max;
        self
    }

    #[must_use]
    pub fn pool_max_per_route(mut self, max: usize) -> Self {
        self.config.pool_max_per_route = Some(max);
        self
    }

    #[must_use]
    pub fn cookies(mut self, mode: CookieMode) -> Self {
        self.config.cookies = mode;
        self
    }

    /// Advertise and decode gzip, deflate and brotli
    #[must_use]
    pub fn compression(mut self, enabled: bool) -> Self {
        self.config.compression = enabled;
        self
    }

    /// Maximum wait for a pooled connection
    ///
    /// Zero waits forever.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Limit on DNS, TCP connect, proxy tunnel and TLS handshake together
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Maximum gap between received bytes
    #[must_use]
    pub fn socket_timeout(mut self, timeout: Duration) -> Self {
        self.config.socket_timeout = timeout;
        self
    }

    /// Set the maximum number of redirects to follow
    #[must_use]
    pub fn max_redirects(mut self, max_redirects: usize) -> Self {
        self.config.max_redirects = max_redirects;
        self
    }

    /// Return 3xx responses as they are
    #[must_use]
    pub fn no_redirects(mut self) -> Self {
        self.config.follow_redirects = false;
        self
    }

    #[must_use]
    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.config.follow_redirects = follow;
        self
    }

    /// Replays of faults that happened before any response byte
    #[must_use]
    pub fn automatic_retries(mut self, retries: usize) -> Self {
        self.config.automatic_retries = retries;
        self
    }

    /// Replace the default retry decision
    ///
    /// `automatic_retries` is ignored once a decider is set.
    #[must_use]
    pub fn retry_policy(mut self, decider: impl RetryDecider + 'static) -> Self {
        self.config.retry_policy = Some(RetryPolicy::new(decider));
        self
    }

    #[must_use]
    pub fn expect_continue(mut self, enabled: bool) -> Self {
        self.config.expect_continue = enabled;
        self
    }

    /// Check idle connections before reusing them
    #[must_use]
    pub fn stale_check(mut self, enabled: bool) -> Self {
        self.config.stale_check = enabled;
        self
    }

    #[must_use]
    pub fn keepalive(mut self, keepalive: KeepAlive) -> Self {
        self.config.keepalive = keepalive;
        self
    }

    #[must_use]
    pub fn tcp_no_delay(mut self, enabled: bool) -> Self {
        self.config.tcp_no_delay = enabled;
        self
    }

    #[must_use]
    pub fn proxy(mut self, proxy: ProxyConfig) -> Self {
        self.config.proxy = Some(proxy);
        self
    }

    /// Replace the whole TLS trust and identity configuration
    #[must_use]
    pub fn ssl(mut self, ssl: SslConfig) -> Self {
        self.config.ssl = ssl;
        self
    }

    /// Set the certificate verification mode
    ///
    /// **WARNING**: `VerifyMode::Disable` accepts any certificate for any
    /// host. Use it only against test endpoints.
    #[must_use]
    pub fn verify(mut self, mode: VerifyMode) -> Self {
        if mode == VerifyMode::Disable {
            tracing::warn!(
                target: "modkit_hydra::security",
                "verify(Disable) called - TLS peers will NOT be authenticated"
            );
        }
        self.config.ssl.verify = mode;
        self
    }

    /// Trust chains accepted by `strategy` even when the trust store would not.
    ///
    /// A strategy set earlier is kept; either one trusting the chain is enough.
    #[must_use]
    pub fn trust_strategy(mut self, strategy: impl IntoTrustStrategy) -> Self {
        self.config.ssl.trust_strategy =
            TrustStrategy::combine(self.config.ssl.trust_strategy.take(), Some(strategy));
        self
    }

    /// Root certificates used when no trust material is configured
    #[must_use]
    pub fn tls_roots(mut self, roots: TlsRootConfig) -> Self {
        self.config.tls_roots = roots;
        self
    }

    /// Build the client
    ///
    /// # Errors
    /// Returns `HttpError::Config` for invalid settings or unusable TLS
    /// material, and `HttpError::InvalidArgument` for a user agent that is
    /// not a valid header value.
    pub fn build(self) -> Result<Client, HttpError> {
        self.config.validate()?;
        DefaultHeadersLayer::from_config(&self.config)?;
        let tls = build_tls_config(&self.config)?;
        Ok(Client::from_parts(self.config, tls))
    }
}

/// Compose the tower stack in front of the pool
///
/// Request flow (outer to inner):
///   `DefaultHeaders → Decompression? → Redirect → Cookie → Retry → PooledTransport`
///
/// Retries sit innermost, so a redirect hop or a cookie round trip is never
/// replayed as a whole; each hop gets its own retry budget. Decompression
/// sits outside the redirect loop so intermediate 3xx bodies are drained raw.
pub(crate) fn build_service(
    config: &ClientConfig,
    pool: Arc<ConnectionPool>,
    tls: Arc<rustls::ClientConfig>,
) -> Result<InnerService, HttpError> {
    let defaults = DefaultHeadersLayer::from_config(config)?;
    let policy = config
        .retry_policy
        .clone()
        .unwrap_or_else(|| RetryPolicy::automatic(config.automatic_retries));

    let transport = PooledTransport::new(
        pool,
        Connector::new(tls, config.tcp_no_delay),
        config.keepalive,
        Settings::from_config(config),
        config.ssl.track_state && config.ssl.has_client_identity(),
    );

    let mut service: InnerService = ServiceBuilder::new()
        .layer(RedirectLayer::new(config.max_redirects, config.follow_redirects))
        .layer(CookieLayer)
        .layer(RetryLayer::new(policy))
        .service(transport)
        .boxed_clone();

    if config.compression {
        service = ServiceBuilder::new()
            .layer(DecompressionLayer::new())
            .service(service)
            .map_response(map_decompression_response)
            .boxed_clone();
    }

    Ok(ServiceBuilder::new().layer(defaults).service(service).boxed_clone())
}

/// Map the decompression response to our boxed response body type.
///
/// tower-http's `DecompressionBody` uses `tower_http::BoxError`, which is
/// the same boxed error type the response body carries.
fn map_decompression_response<B>(response: Response<B>) -> Response<ResponseBody>
where
    B: hyper::body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (parts, body) = response.into_parts();
    let boxed_body: ResponseBody = body.map_err(Into::into).boxed();
    Response::from_parts(parts, boxed_body)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::config::DEFAULT_USER_AGENT;
    use crate::trust::{Certificate, CertificateError};

    #[test]
    fn test_builder_default() {
        let builder = ClientBuilder::new();
        assert_eq!(builder.config.request_timeout, Duration::from_secs(60));
        assert_eq!(builder.config.user_agent, DEFAULT_USER_AGENT);
        assert_eq!(builder.config.automatic_retries, 3);
        assert_eq!(builder.config.pool_max, 50);
    }

    #[test]
    fn test_builder_setters() {
        let builder = ClientBuilder::new()
            .user_agent("custom/1.0")
            .pool_max(8)
            .pool_max_per_route(2)
            .cookies(CookieMode::PerRequest)
            .compression(false)
            .socket_timeout(Duration::from_secs(2))
            .keepalive(KeepAlive::Seconds(30))
            .no_redirects();
        assert_eq!(builder.config.user_agent, "custom/1.0");
        assert_eq!(builder.config.max_per_route(), 2);
        assert_eq!(builder.config.cookies, CookieMode::PerRequest);
        assert!(!builder.config.compression);
        assert_eq!(builder.config.socket_timeout, Duration::from_secs(2));
        assert_eq!(builder.config.keepalive, KeepAlive::Seconds(30));
        assert!(!builder.config.follow_redirects);
    }

    #[test]
    fn test_builder_retry_policy_replaces_default() {
        let builder = ClientBuilder::new().retry_policy(|_: &HttpError, attempt: usize| attempt < 10);
        let policy = builder.config.retry_policy.unwrap();
        assert!(policy.should_retry(&HttpError::ClientStopped, 9));
        assert!(!policy.should_retry(&HttpError::ClientStopped, 10));
    }

    #[test]
    fn test_builder_trust_strategies_combine() {
        let builder = ClientBuilder::new()
            .trust_strategy(|_: &[Certificate], _: &str| Ok::<_, CertificateError>(false))
            .trust_strategy(|chain: &[Certificate], _: &str| {
                Ok::<_, CertificateError>(!chain.is_empty())
            });
        let strategy = builder.config.ssl.trust_strategy.unwrap();
        assert!(strategy.is_trusted(&[Certificate::from_der(vec![1, 2, 3])], "UNKNOWN").unwrap());
        assert!(!strategy.is_trusted(&[], "UNKNOWN").unwrap());
    }

    #[test]
    fn test_builder_build() {
        let client = ClientBuilder::new().build().unwrap();
        assert!(!client.is_closed());
    }

    #[test]
    fn test_builder_build_invalid_user_agent() {
        let err = ClientBuilder::new().user_agent("bad\nagent").build().unwrap_err();
        assert!(matches!(err, HttpError::InvalidArgument { .. }));
    }

    #[test]
    fn test_builder_build_invalid_pool() {
        let err = ClientBuilder::new().pool_max(0).build().unwrap_err();
        assert!(matches!(err, HttpError::Config(_)));
    }

    #[test]
    fn test_builder_build_missing_truststore() {
        let ssl = SslConfig {
            truststore: Some("/nonexistent/trust.pem".to_owned()),
            ..SslConfig::default()
        };
        let err = ClientBuilder::new().ssl(ssl).build().unwrap_err();
        assert!(matches!(err, HttpError::Config(_)));
    }

    #[test]
    fn test_service_stack_builds_with_and_without_compression() {
        let config = ClientConfig::default();
        let tls = build_tls_config(&config).unwrap();
        let pool = Arc::new(ConnectionPool::new(1, 1, false));
        assert!(build_service(&config, Arc::clone(&pool), Arc::clone(&tls)).is_ok());

        let config = ClientConfig {
            compression: false,
            ..ClientConfig::default()
        };
        assert!(build_service(&config, pool, tls).is_ok());
    }
}
