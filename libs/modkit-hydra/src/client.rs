use crate::async_response::{AsyncResponse, CallbackResult};
use crate::background::BackgroundResponse;
use crate::builder::ClientBuilder;
use crate::config::{ClientConfig, CookieMode};
use crate::cookie::CookieJar;
use crate::engine::Engine;
use crate::error::HttpError;
use crate::pool::PoolStats;
use crate::request::{Exchange, Request, RequestOptions, Verb};
use crate::response::{Response, ResponseBody, Source};
use crate::stub::{StubDescriptor, StubRegistry, UrlPattern};
use bytes::Bytes;
use http_body_util::Full;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use tower::buffer::Buffer;
use tower::{Service, ServiceExt};

/// Type alias for the future type of the inner service
pub type ServiceFuture =
    Pin<Box<dyn Future<Output = Result<http::Response<ResponseBody>, HttpError>> + Send>>;

/// Type alias for the buffered service
/// Buffer<Req, F> in tower 0.5 where Req is the request type and F is the service future type
pub type BufferedService = Buffer<http::Request<Full<Bytes>>, ServiceFuture>;

/// Outcome of [`Client::request`]
#[derive(Debug)]
pub enum Dispatched {
    /// Lazy response, resolved on first observation
    Sync(Response),
    /// Queued on the client's batch until [`Client::execute`]
    Async(AsyncResponse),
}

impl Dispatched {
    /// The lazy response, if the call was not queued
    #[must_use]
    pub fn into_sync(self) -> Option<Response> {
        match self {
            Dispatched::Sync(response) => Some(response),
            Dispatched::Async(_) => None,
        }
    }

    /// The queued unit, if the call was queued
    #[must_use]
    pub fn into_async(self) -> Option<AsyncResponse> {
        match self {
            Dispatched::Async(unit) => Some(unit),
            Dispatched::Sync(_) => None,
        }
    }
}

enum EngineSlot {
    Idle,
    Running(Arc<Engine>),
    Closed,
}

struct ClientInner {
    config: ClientConfig,
    tls: Arc<rustls::ClientConfig>,
    engine: Mutex<EngineSlot>,
    stubs: Mutex<StubRegistry>,
    pending: Mutex<Vec<AsyncResponse>>,
    cookie_jar: Arc<CookieJar>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let EngineSlot::Running(engine) = std::mem::replace(self.engine.get_mut(), EngineSlot::Closed) {
            engine.shutdown();
        }
    }
}

/// Pooled HTTP client with blocking calls and batched async execution
///
/// Verb methods come in three flavors:
/// - `get(url, options)`: a lazy [`Response`]; nothing is sent until a
///   result is observed
/// - `get_with(url, options, handler)`: sends immediately and hands the
///   response to `handler`, releasing the connection afterwards
/// - `async_get(url, options)`: queues an [`AsyncResponse`] that runs on
///   the next [`Client::execute`]
///
/// # Thread Safety
///
/// `Client` is `Clone + Send + Sync`. Clones share the pool, the stubs, the
/// cookie jar and the pending batch. Dropping the last clone closes the
/// client.
///
/// Every blocking method must be called outside of an async runtime (use
/// `tokio::task::spawn_blocking` from async code); tokio panics otherwise.
///
/// # Example
///
/// ```ignore
/// use modkit_hydra::{Client, RequestOptions};
///
/// let client = Client::new()?;
/// let mut response = client.get("https://example.com/api", RequestOptions::new())?;
/// println!("{} {}", response.code()?, response.text()?);
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

/// Non-owning handle held by queued responses
#[derive(Clone)]
pub(crate) struct WeakClient(Weak<ClientInner>);

impl WeakClient {
    pub(crate) fn upgrade(&self) -> Option<Client> {
        self.0.upgrade().map(|inner| Client { inner })
    }
}

macro_rules! verbs {
    ($($variant:ident => $lazy:ident, $eager:ident, $queued:ident, $background:ident;)*) => {
        $(
            #[doc = concat!("Lazy `", stringify!($variant), "` request; nothing is sent until the response is observed.")]
            ///
            /// # Errors
            /// `InvalidArgument` or `Config` for an unusable URL or options,
            /// `ClientStopped` once the client is closed.
            pub fn $lazy(&self, url: &str, options: RequestOptions) -> Result<Response, HttpError> {
                self.sync(Verb::$variant, url, options)
            }

            #[doc = concat!("Send a `", stringify!($variant), "` request now and hand the response to `handler`.")]
            ///
            /// # Errors
            /// Option errors as for the lazy variant, or the classified
            /// transport fault; the handler does not run then.
            pub fn $eager<R>(
                &self,
                url: &str,
                options: RequestOptions,
                handler: impl FnOnce(&mut Response) -> R,
            ) -> Result<R, HttpError> {
                self.sync(Verb::$variant, url, options)?.call_with(handler)
            }

            #[doc = concat!("Queue a `", stringify!($variant), "` request for the next [`Client::execute`].")]
            ///
            /// # Errors
            /// Option errors are raised now, not at execution.
            pub fn $queued(&self, url: &str, options: RequestOptions) -> Result<AsyncResponse, HttpError> {
                self.queue(Verb::$variant, url, options)
            }

            #[doc = concat!("Start a `", stringify!($variant), "` request on the client's executor and return at once.")]
            ///
            /// # Errors
            /// Option errors as for the lazy variant, `ClientStopped` once
            /// the client is closed.
            pub fn $background(&self, url: &str, options: RequestOptions) -> Result<BackgroundResponse, HttpError> {
                BackgroundResponse::spawn(self, self.sync(Verb::$variant, url, options)?)
            }
        )*
    };
}

impl Client {
    /// Create a client with default configuration
    ///
    /// # Errors
    /// Returns an error if TLS initialization fails
    pub fn new() -> Result<Self, HttpError> {
        ClientBuilder::new().build()
    }

    /// Create a builder for configuring the client
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// # Errors
    /// Returns `HttpError::Config` for invalid settings.
    pub fn with_config(config: ClientConfig) -> Result<Self, HttpError> {
        ClientBuilder::with_config(config).build()
    }

    /// Create a client from dynamic options, e.g. `{"cookies": "per_request"}`
    ///
    /// # Errors
    /// Returns `HttpError::Config` for unknown shapes or invalid values.
    pub fn from_value(options: serde_json::Value) -> Result<Self, HttpError> {
        Self::with_config(ClientConfig::from_value(options)?)
    }

    pub(crate) fn from_parts(config: ClientConfig, tls: Arc<rustls::ClientConfig>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                tls,
                engine: Mutex::new(EngineSlot::Idle),
                stubs: Mutex::new(StubRegistry::default()),
                pending: Mutex::new(Vec::new()),
                cookie_jar: Arc::new(CookieJar::new()),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// The client-wide jar, when cookies are shared
    #[must_use]
    pub fn cookie_jar(&self) -> Option<&CookieJar> {
        (self.inner.config.cookies == CookieMode::Shared).then_some(&*self.inner.cookie_jar)
    }

    verbs! {
        Get => get, get_with, async_get, background_get;
        Put => put, put_with, async_put, background_put;
        Head => head, head_with, async_head, background_head;
        Post => post, post_with, async_post, background_post;
        Delete => delete, delete_with, async_delete, background_delete;
        Options => options, options_with, async_options, background_options;
        Patch => patch, patch_with, async_patch, background_patch;
    }

    /// Dispatch by verb; `options.async` queues the call instead
    ///
    /// # Errors
    /// `InvalidArgument` or `Config` for an unusable URL or options,
    /// `ClientStopped` once the client is closed.
    pub fn request(&self, verb: Verb, url: &str, options: RequestOptions) -> Result<Dispatched, HttpError> {
        if options.run_async {
            self.queue(verb, url, options).map(Dispatched::Async)
        } else {
            self.sync(verb, url, options).map(Dispatched::Sync)
        }
    }

    fn sync(&self, verb: Verb, url: &str, options: RequestOptions) -> Result<Response, HttpError> {
        self.ensure_open()?;
        let request = Request::build(verb, url, options, &self.inner.config)?;
        Ok(match self.find_stub(&request) {
            Some(descriptor) => Response::new(request, Source::Stub(descriptor)),
            None => Response::new(request, Source::Network(self.clone())),
        })
    }

    fn queue(&self, verb: Verb, url: &str, options: RequestOptions) -> Result<AsyncResponse, HttpError> {
        self.ensure_open()?;
        let request = Request::build(verb, url, options, &self.inner.config)?;
        let source = match self.find_stub(&request) {
            Some(descriptor) => Source::Stub(descriptor),
            None => Source::Queued(WeakClient(Arc::downgrade(&self.inner))),
        };
        let unit = AsyncResponse::new(request.clone(), Response::new(request, source));
        self.inner.pending.lock().push(unit.clone());
        tracing::trace!(verb = %verb, url, "request queued");
        Ok(unit)
    }

    fn find_stub(&self, request: &Request) -> Option<StubDescriptor> {
        let descriptor = self.inner.stubs.lock().resolve(request.url());
        if descriptor.is_some() {
            tracing::debug!(url = %request.url(), "answering from stub");
        }
        descriptor
    }

    /// Answer URLs matching `pattern` with `descriptor` instead of the network.
    ///
    /// Registering the same pattern again replaces its stub; the first
    /// matching pattern in registration order wins.
    pub fn stub(&self, pattern: impl Into<UrlPattern>, descriptor: StubDescriptor) {
        self.inner.stubs.lock().insert(pattern.into(), descriptor);
    }

    /// Remove the stub registered for `pattern`; returns whether one existed
    pub fn unstub(&self, pattern: impl Into<UrlPattern>) -> bool {
        self.inner.stubs.lock().remove(&pattern.into())
    }

    /// Remove every stub, including a pending `respond_with`
    pub fn clear_stubs(&self) {
        self.inner.stubs.lock().clear();
    }

    /// Answer the next request, whatever its URL, with `descriptor`
    pub fn respond_with(&self, descriptor: StubDescriptor) {
        self.inner.stubs.lock().set_one_shot(descriptor);
    }

    /// Number of queued requests
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Discard queued requests without running any callback
    pub fn clear_pending(&self) {
        let dropped = std::mem::take(&mut *self.inner.pending.lock());
        if !dropped.is_empty() {
            tracing::debug!(count = dropped.len(), "discarded pending requests");
        }
    }

    /// Run every queued request concurrently and wait for all of them.
    ///
    /// Returns the callback results in submission order. Failures reach the
    /// units' failure callbacks only; a panicking callback yields `()`.
    ///
    /// # Errors
    /// `ClientStopped` once the client is closed.
    pub fn execute(&self) -> Result<Vec<CallbackResult>, HttpError> {
        self.ensure_open()?;
        let units = std::mem::take(&mut *self.inner.pending.lock());
        if units.is_empty() {
            return Ok(Vec::new());
        }
        let engine = self.engine()?;
        tracing::debug!(count = units.len(), "executing pending requests");

        let tasks: Vec<_> = units
            .into_iter()
            .map(|unit| engine.handle().spawn_blocking(move || unit.run()))
            .collect();
        let results = engine.handle().block_on(async move {
            let mut results = Vec::with_capacity(tasks.len());
            for task in tasks {
                let result = match task.await {
                    Ok(result) => result,
                    Err(e) => {
                        tracing::error!(error = %e, "async request task failed");
                        Box::new(()) as CallbackResult
                    }
                };
                results.push(result);
            }
            results
        });
        Ok(results)
    }

    /// Pool occupancy; all zero until the first network request
    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        match &*self.inner.engine.lock() {
            EngineSlot::Running(engine) => engine.stats(),
            EngineSlot::Idle | EngineSlot::Closed => PoolStats {
                max: self.inner.config.pool_max,
                leased: 0,
                pending: 0,
                available: 0,
            },
        }
    }

    /// Stop the sweeper, release pooled connections and drop queued requests.
    ///
    /// Idempotent. Every later request fails with `ClientStopped`.
    pub fn close(&self) {
        let previous = std::mem::replace(&mut *self.inner.engine.lock(), EngineSlot::Closed);
        self.inner.pending.lock().clear();
        if let EngineSlot::Running(engine) = previous {
            engine.shutdown();
        }
        tracing::debug!("client closed");
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(*self.inner.engine.lock(), EngineSlot::Closed)
    }

    fn ensure_open(&self) -> Result<(), HttpError> {
        if self.is_closed() {
            return Err(HttpError::ClientStopped);
        }
        Ok(())
    }

    /// The running engine, started on first use
    pub(crate) fn engine(&self) -> Result<Arc<Engine>, HttpError> {
        let mut slot = self.inner.engine.lock();
        match &*slot {
            EngineSlot::Running(engine) => Ok(Arc::clone(engine)),
            EngineSlot::Closed => Err(HttpError::ClientStopped),
            EngineSlot::Idle => {
                let engine = Arc::new(Engine::start(&self.inner.config, Arc::clone(&self.inner.tls))?);
                *slot = EngineSlot::Running(Arc::clone(&engine));
                Ok(engine)
            }
        }
    }

    /// Drive `fut` to completion on the engine runtime.
    ///
    /// Must not be called from within an async runtime.
    pub(crate) fn block_on<F: Future>(&self, fut: F) -> Result<F::Output, HttpError> {
        let engine = self.engine()?;
        Ok(engine.handle().block_on(fut))
    }

    /// Send `request` through the service stack and wait for the response head
    pub(crate) fn fetch(
        &self,
        request: &Request,
    ) -> Result<(http::Response<ResponseBody>, Arc<Exchange>), HttpError> {
        let jar = match self.inner.config.cookies {
            CookieMode::Disabled => None,
            CookieMode::Shared => Some(Arc::clone(&self.inner.cookie_jar)),
            CookieMode::PerRequest => Some(Arc::new(CookieJar::new())),
        };
        let (req, exchange) = request.to_http(jar)?;
        let mut service = self.engine()?.service();

        let response = self.block_on(async move {
            service.ready().await.map_err(map_buffer_error)?;
            service.call(req).await.map_err(map_buffer_error)
        })??;
        Ok((response, exchange))
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.inner.engine.lock() {
            EngineSlot::Idle => "idle",
            EngineSlot::Running(_) => "running",
            EngineSlot::Closed => "closed",
        };
        f.debug_struct("Client")
            .field("state", &state)
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

/// Map buffer errors to `HttpError`
///
/// Buffer can return `ServiceError` which wraps the inner service error,
/// or `Closed` if the buffer worker has shut down.
pub(crate) fn map_buffer_error(err: tower::BoxError) -> HttpError {
    match err.downcast::<HttpError>() {
        Ok(http_err) => *http_err,
        Err(err) => {
            // The worker is gone: the client was closed or its runtime died.
            tracing::error!(
                error = %err,
                "buffer worker closed unexpectedly; service unavailable"
            );
            HttpError::ClientStopped
        }
    }
}
