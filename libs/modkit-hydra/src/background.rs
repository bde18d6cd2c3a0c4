use crate::client::Client;
use crate::error::HttpError;
use crate::response::Response;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::task::JoinHandle;

/// Request running on the client's executor, started at creation.
///
/// The response arrives fully read, so its body stays available after the
/// connection is back in the pool. Block for it with [`BackgroundResponse::get`]
/// or `.await` it from async code.
#[must_use = "a background request keeps running, but its response is lost if the handle is dropped"]
pub struct BackgroundResponse {
    handle: JoinHandle<Result<Response, HttpError>>,
    client: Client,
}

impl BackgroundResponse {
    pub(crate) fn spawn(client: &Client, mut response: Response) -> Result<Self, HttpError> {
        let engine = client.engine()?;
        let handle = engine.handle().spawn_blocking(move || {
            response.body()?;
            Ok(response)
        });
        Ok(Self {
            handle,
            client: client.clone(),
        })
    }

    /// True once the request has completed, successfully or not
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the response.
    ///
    /// Must not be called from within an async runtime; `.await` the handle there.
    ///
    /// # Errors
    /// The classified fault of the request, or `ClientStopped` once the
    /// client is closed.
    pub fn get(self) -> Result<Response, HttpError> {
        let client = self.client.clone();
        client.block_on(self)?
    }
}

impl Future for BackgroundResponse {
    type Output = Result<Response, HttpError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx).map(|joined| match joined {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(HttpError::ClientStopped),
            Err(e) => {
                tracing::error!(error = %e, "background request task failed");
                Err(HttpError::Unknown(Box::new(e)))
            }
        })
    }
}

impl fmt::Debug for BackgroundResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundResponse")
            .field("finished", &self.handle.is_finished())
            .finish_non_exhaustive()
    }
}
