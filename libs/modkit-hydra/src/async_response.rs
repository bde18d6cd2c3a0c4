//! Queued requests executed in batches by [`Client::execute`](crate::Client::execute).

use crate::error::HttpError;
use crate::request::Request;
use crate::response::Response;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Value returned by whichever callback ran for a unit
pub type CallbackResult = Box<dyn Any + Send>;

type SuccessHandler = Box<dyn FnOnce(&mut Response, &Request) -> CallbackResult + Send>;
type FailureHandler = Box<dyn FnOnce(&HttpError) -> CallbackResult + Send>;
type CancelledHandler = Box<dyn FnOnce() -> CallbackResult + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Pending,
    Running,
    Cancelled,
    Done,
}

struct Unit {
    request: Request,
    response: Option<Response>,
    on_success: Option<SuccessHandler>,
    on_failure: Option<FailureHandler>,
    on_cancelled: Option<CancelledHandler>,
    status: Status,
    result: Option<CallbackResult>,
}

/// Handle to a queued request.
///
/// Callbacks are single-slot: registering a second success handler replaces
/// the first. Nothing runs until the owning client's `execute`.
#[derive(Clone)]
pub struct AsyncResponse {
    unit: Arc<Mutex<Unit>>,
}

impl AsyncResponse {
    pub(crate) fn new(request: Request, response: Response) -> Self {
        Self {
            unit: Arc::new(Mutex::new(Unit {
                request,
                response: Some(response),
                on_success: None,
                on_failure: None,
                on_cancelled: None,
                status: Status::Pending,
                result: None,
            })),
        }
    }

    /// Handler for a resolved response; the connection is released when it returns
    pub fn on_success<R, F>(&self, handler: F) -> &Self
    where
        R: Any + Send + 'static,
        F: FnOnce(&mut Response, &Request) -> R + Send + 'static,
    {
        self.unit.lock().on_success = Some(Box::new(move |response: &mut Response, request: &Request| {
            Box::new(handler(response, request)) as CallbackResult
        }));
        self
    }

    /// Handler for a classified transport fault
    pub fn on_failure<R, F>(&self, handler: F) -> &Self
    where
        R: Any + Send + 'static,
        F: FnOnce(&HttpError) -> R + Send + 'static,
    {
        self.unit.lock().on_failure =
            Some(Box::new(move |err: &HttpError| Box::new(handler(err)) as CallbackResult));
        self
    }

    pub fn on_cancelled<R, F>(&self, handler: F) -> &Self
    where
        R: Any + Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        self.unit.lock().on_cancelled = Some(Box::new(move || Box::new(handler()) as CallbackResult));
        self
    }

    /// Cancel a unit that has not run yet.
    ///
    /// Runs the cancelled callback immediately; `execute` later reports its
    /// result without touching the network. Returns `false` when the unit
    /// already ran or was cancelled before.
    pub fn cancel(&self) -> bool {
        let handler = {
            let mut unit = self.unit.lock();
            if unit.status != Status::Pending {
                return false;
            }
            unit.status = Status::Cancelled;
            unit.on_success = None;
            unit.on_failure = None;
            unit.on_cancelled.take()
        };
        let result: CallbackResult = match handler {
            Some(handler) => handler(),
            None => Box::new(()),
        };
        self.unit.lock().result = Some(result);
        tracing::debug!("async request cancelled");
        true
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.unit.lock().status == Status::Cancelled
    }

    /// Whether the request has been executed
    #[must_use]
    pub fn is_called(&self) -> bool {
        self.unit.lock().status == Status::Done
    }

    #[must_use]
    pub fn request(&self) -> Request {
        self.unit.lock().request.clone()
    }

    /// Take the response out of an executed unit, e.g. to inspect its head
    #[must_use]
    pub fn take_response(&self) -> Option<Response> {
        let mut unit = self.unit.lock();
        if unit.status == Status::Done {
            unit.response.take()
        } else {
            None
        }
    }

    /// Take the callback result of an executed or cancelled unit
    #[must_use]
    pub fn take_result(&self) -> Option<CallbackResult> {
        self.unit.lock().result.take()
    }

    /// Resolve the request and run the matching callback.
    ///
    /// Handlers run outside the unit lock, so they may use this handle.
    pub(crate) fn run(&self) -> CallbackResult {
        let (request, mut response, on_success, on_failure) = {
            let mut unit = self.unit.lock();
            match unit.status {
                Status::Pending => {}
                Status::Cancelled => return unit.result.take().unwrap_or_else(|| Box::new(())),
                Status::Running | Status::Done => {
                    tracing::debug!("async request already executed");
                    return Box::new(());
                }
            }
            let Some(response) = unit.response.take() else {
                unit.status = Status::Done;
                return Box::new(());
            };
            unit.status = Status::Running;
            (
                unit.request.clone(),
                response,
                unit.on_success.take(),
                unit.on_failure.take(),
            )
        };

        let result: CallbackResult = match response.call() {
            Ok(resolved) => match on_success {
                Some(handler) => handler(resolved, &request),
                None => Box::new(()),
            },
            Err(err) => {
                tracing::debug!(url = %request.url(), error = %err, "async request failed");
                match on_failure {
                    Some(handler) => handler(&err),
                    None => Box::new(()),
                }
            }
        };
        response.release();

        let mut unit = self.unit.lock();
        unit.response = Some(response);
        unit.status = Status::Done;
        result
    }
}

impl fmt::Debug for AsyncResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = self.unit.lock();
        f.debug_struct("AsyncResponse")
            .field("verb", &unit.request.verb())
            .field("url", &unit.request.url().as_str())
            .field("status", &unit.status)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::request::{RequestOptions, Verb};
    use crate::stub::StubDescriptor;

    fn unit(body: &str, code: u16) -> AsyncResponse {
        let request = Request::build(
            Verb::Get,
            "http://async.test/item",
            RequestOptions::new(),
            &ClientConfig::default(),
        )
        .unwrap();
        let response = Response::stubbed(
            Some(request.clone()),
            StubDescriptor::new().body(body).code(code),
        );
        AsyncResponse::new(request, response)
    }

    #[test]
    fn test_success_handler_result() {
        let handle = unit("payload", 201);
        handle.on_success(|response, request| {
            format!("{} {} {}", request.verb(), response.code().unwrap(), response.text().unwrap())
        });

        let result = handle.run();
        assert_eq!(*result.downcast::<String>().unwrap(), "GET 201 payload");
        assert!(handle.is_called());
        assert_eq!(handle.take_response().unwrap().code().unwrap(), 201);
    }

    #[test]
    fn test_default_result_is_unit() {
        let handle = unit("", 200);
        assert!(handle.run().downcast::<()>().is_ok());
    }

    #[test]
    fn test_handlers_are_single_slot() {
        let handle = unit("x", 200);
        handle.on_success(|_, _| 1_u32).on_success(|_, _| 2_u32);
        assert_eq!(*handle.run().downcast::<u32>().unwrap(), 2);
    }

    #[test]
    fn test_cancel_runs_cancelled_handler_once() {
        let handle = unit("x", 200);
        handle
            .on_success(|_, _| "success")
            .on_cancelled(|| "cancelled");

        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert!(handle.is_cancelled());
        assert!(!handle.is_called());

        let result = handle.run();
        assert_eq!(*result.downcast::<&str>().unwrap(), "cancelled");
        assert!(handle.take_response().is_none());
    }

    #[test]
    fn test_cancel_after_run_is_refused() {
        let handle = unit("x", 200);
        handle.run();
        assert!(!handle.cancel());
    }

    #[test]
    fn test_second_run_does_not_repeat_handler() {
        let handle = unit("x", 200);
        handle.on_success(|_, _| 7_i32);
        assert_eq!(*handle.run().downcast::<i32>().unwrap(), 7);
        assert!(handle.run().downcast::<()>().is_ok());
    }
}
