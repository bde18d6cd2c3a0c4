//! Tower layers for the HTTP client middleware stack
//!
//! ## Available Layers
//!
//! - [`DefaultHeadersLayer`] - Fills in client-wide headers such as `User-Agent`
//! - [`RedirectLayer`] - Follows redirects within the per-request limit
//! - [`CookieLayer`] - Sends and records cookies on every hop
//! - [`RetryLayer`] - Replays requests that failed before any response byte

mod cookie;
mod default_headers;
mod redirect;
mod retry;

pub use cookie::{CookieLayer, CookieService};
pub use default_headers::{DefaultHeadersLayer, DefaultHeadersService};
pub use redirect::{RedirectLayer, RedirectService};
pub use retry::{AutomaticRetries, RetryDecider, RetryLayer, RetryPolicy, RetryService};

use crate::request::RequestContext;

/// Per-request context attached by the client, if any
pub(crate) fn context<B>(req: &http::Request<B>) -> Option<&RequestContext> {
    context_of(req.extensions())
}

pub(crate) fn context_of(extensions: &http::Extensions) -> Option<&RequestContext> {
    extensions.get::<RequestContext>()
}
