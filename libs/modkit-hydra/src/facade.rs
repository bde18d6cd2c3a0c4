//! Process-wide default client and static-style verb functions.
//!
//! ```ignore
//! use modkit_hydra::{RequestOptions, facade};
//!
//! let body = facade::get("http://localhost:8080/health", RequestOptions::new())?.text()?;
//! ```

use crate::async_response::AsyncResponse;
use crate::background::BackgroundResponse;
use crate::client::Client;
use crate::config::ClientConfig;
use crate::error::HttpError;
use crate::request::RequestOptions;
use crate::response::Response;
use parking_lot::Mutex;

static DEFAULT: Mutex<Option<Client>> = parking_lot::const_mutex(None);

/// The shared default client, created with default configuration on first use
///
/// # Errors
/// Returns an error if the client cannot be built (TLS initialization).
pub fn default_client() -> Result<Client, HttpError> {
    let mut slot = DEFAULT.lock();
    match &*slot {
        Some(client) if !client.is_closed() => Ok(client.clone()),
        _ => {
            let client = Client::new()?;
            tracing::debug!("created default client");
            *slot = Some(client.clone());
            Ok(client)
        }
    }
}

/// Close and forget the default client; the next use creates a fresh one
pub fn reset() {
    if let Some(client) = DEFAULT.lock().take() {
        client.close();
    }
}

/// Client holder for types exposing verb functions of their own
///
/// A facade either owns a private client or borrows the process-wide
/// default (see [`Facade::shared`]).
#[derive(Debug, Clone)]
pub struct Facade {
    client: Client,
}

impl Facade {
    /// Facade with a private client
    ///
    /// # Errors
    /// Returns `HttpError::Config` for invalid settings.
    pub fn new(config: ClientConfig) -> Result<Self, HttpError> {
        Ok(Self {
            client: Client::with_config(config)?,
        })
    }

    /// Facade over the default client
    ///
    /// # Errors
    /// Returns an error if the default client cannot be built.
    pub fn shared() -> Result<Self, HttpError> {
        Ok(Self {
            client: default_client()?,
        })
    }

    #[must_use]
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }
}

macro_rules! facade_verbs {
    ($($lazy:ident, $eager:ident, $queued:ident, $background:ident;)*) => {
        $(
            #[doc = concat!("[`Client::", stringify!($lazy), "`] on the default client")]
            ///
            /// # Errors
            /// As for the client method, or when the default client cannot be built.
            pub fn $lazy(url: &str, options: RequestOptions) -> Result<Response, HttpError> {
                default_client()?.$lazy(url, options)
            }

            #[doc = concat!("[`Client::", stringify!($eager), "`] on the default client")]
            ///
            /// # Errors
            /// As for the client method, or when the default client cannot be built.
            pub fn $eager<R>(
                url: &str,
                options: RequestOptions,
                handler: impl FnOnce(&mut Response) -> R,
            ) -> Result<R, HttpError> {
                default_client()?.$eager(url, options, handler)
            }

            #[doc = concat!("[`Client::", stringify!($queued), "`] on the default client")]
            ///
            /// # Errors
            /// As for the client method, or when the default client cannot be built.
            pub fn $queued(url: &str, options: RequestOptions) -> Result<AsyncResponse, HttpError> {
                default_client()?.$queued(url, options)
            }

            #[doc = concat!("[`Client::", stringify!($background), "`] on the default client")]
            ///
            /// # Errors
            /// As for the client method, or when the default client cannot be built.
            pub fn $background(url: &str, options: RequestOptions) -> Result<BackgroundResponse, HttpError> {
                default_client()?.$background(url, options)
            }
        )*
    };
}

facade_verbs! {
    get, get_with, async_get, background_get;
    put, put_with, async_put, background_put;
    head, head_with, async_head, background_head;
    post, post_with, async_post, background_post;
    delete, delete_with, async_delete, background_delete;
    options, options_with, async_options, background_options;
    patch, patch_with, async_patch, background_patch;
}

/// [`Client::execute`] on the default client
///
/// # Errors
/// As for the client method, or when the default client cannot be built.
pub fn execute() -> Result<Vec<crate::async_response::CallbackResult>, HttpError> {
    default_client()?.execute()
}
