#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! Pooled HTTP client for `ModKit` with blocking calls and batched async execution
//!
//! This crate provides a hyper-based HTTP/1.1 client with:
//! - Lazy responses: nothing is sent until a result is observed
//! - Queued requests executed concurrently by [`Client::execute`]
//! - Background requests that start at once and are collected later
//! - Connection pooling bounded in total and per route, with an idle sweeper
//! - Per-phase timeouts (connect, socket read, pool acquisition)
//! - Retries of faults that happen before any response byte
//! - Redirects, cookies (shared or per request) and forward proxies
//! - TLS via rustls with strict, browser and disabled hostname verification,
//!   trust stores, client identities and custom [`TrustStrategy`] deciders
//! - URL stubs for tests
//! - **Transparent response decompression** (gzip, brotli, deflate)
//!
//! # Example
//!
//! ```ignore
//! use modkit_hydra::{Client, RequestOptions};
//!
//! let client = Client::builder()
//!     .user_agent("my-app/1.0")
//!     .cookies(modkit_hydra::CookieMode::Shared)
//!     .build()?;
//!
//! // lazy: the request runs when the code is read
//! let mut response = client.get("https://example.com/api", RequestOptions::new())?;
//! println!("{}", response.code()?);
//!
//! // batched
//! client
//!     .async_get("https://example.com/a", RequestOptions::new())?
//!     .on_success(|response, _| response.text());
//! let results = client.execute()?;
//!
//! // background: returns at once, `get` waits for the response
//! let pending = client.background_get("https://example.com/slow", RequestOptions::new())?;
//! let body = pending.get()?.text()?;
//! ```

mod async_response;
mod background;
mod builder;
mod client;
mod config;
mod connect;
mod cookie;
mod engine;
mod error;
pub mod facade;
pub mod layers;
mod pool;
mod request;
mod response;
mod ssl;
mod stub;
mod tls;
mod transport;
mod trust;
mod verifier;

pub use async_response::{AsyncResponse, CallbackResult};
pub use background::BackgroundResponse;
pub use builder::ClientBuilder;
pub use client::{Client, Dispatched};
pub use config::{
    ClientConfig, CookieMode, DEFAULT_USER_AGENT, ENV_PREFIX, KeepAlive, ProxyConfig, SslConfig,
    TlsRootConfig, VerifyMode,
};
pub use cookie::{Cookie, CookieDescriptor, CookieJar};
pub use error::{BoxError, HttpError, SocketFaultKind, TimeoutKind};
pub use facade::Facade;
pub use layers::{AutomaticRetries, RetryDecider, RetryPolicy};
pub use pool::PoolStats;
pub use request::{Auth, Entity, OneOrMany, Query, Request, RequestBody, RequestOptions, Verb};
pub use response::{Response, ResponseBody};
pub use stub::{StubDescriptor, StubbedResponse, UrlPattern};
pub use trust::{Certificate, CertificateError, IntoTrustStrategy, TrustDecider, TrustStrategy};
