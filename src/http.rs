//! HTTP middleware that recovers panics raised by request handlers.
//!
//! [`RecoveryLayer`] wraps any tower service producing an axum
//! [`Response`]. A panic in the inner service becomes a [`Fault`] which is
//! handed to the reporter, and the client receives an empty
//! `500 Internal Server Error`.
//!
//! Two cases differ:
//! - a panic carrying [`AbortHandler`] is re-raised untouched and never
//!   reported, so the server drops the connection
//! - an upgrade request cannot be answered with a status once the handler
//!   took over the connection; the fault is reported and the connection is
//!   then aborted the same way

use std::fmt;
use std::panic;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use tower::{Layer, Service};

pub use crate::fault::AbortHandler;

use crate::call::{catch, catch_async};
use crate::fault::Fault;
use crate::handler::{ErrorContext, ErrorHandler, SharedHandler, StackPrint, TracingHandler};

/// Abort the current request without a response.
///
/// Inside a handler wrapped by [`RecoveryLayer`] this drops the connection
/// and nothing is reported.
pub fn abort() -> ! {
    panic::resume_unwind(Box::new(AbortHandler))
}

/// Whether the request asks for a protocol upgrade.
pub fn is_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

/// Layer applying [`Recovery`] to a service.
#[derive(Clone)]
pub struct RecoveryLayer {
    reporter: SharedHandler,
}

impl RecoveryLayer {
    /// Report faults with a [`TracingHandler`] in structured mode.
    pub fn new() -> Self {
        Self::with_reporter(TracingHandler::new(StackPrint::Structured))
    }

    pub fn with_reporter<H: ErrorHandler>(reporter: H) -> Self {
        Self {
            reporter: Arc::new(reporter),
        }
    }

    pub fn with_shared_reporter(reporter: SharedHandler) -> Self {
        Self { reporter }
    }
}

impl Default for RecoveryLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RecoveryLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryLayer").finish_non_exhaustive()
    }
}

impl<S> Layer<S> for RecoveryLayer {
    type Service = Recovery<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Recovery {
            inner,
            reporter: Arc::clone(&self.reporter),
        }
    }
}

/// Service recovering panics of the inner service.
#[derive(Clone)]
pub struct Recovery<S> {
    inner: S,
    reporter: SharedHandler,
}

impl<S> fmt::Debug for Recovery<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recovery").finish_non_exhaustive()
    }
}

impl<S, B> Service<Request<B>> for Recovery<S>
where
    S: Service<Request<B>, Response = Response>,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<B>) -> Self::Future {
        let upgrade = is_upgrade(request.headers());
        let context = ErrorContext::request(request.method(), request.uri());
        let reporter = Arc::clone(&self.reporter);
        let inner = &mut self.inner;
        let called = catch(move || inner.call(request));

        Box::pin(async move {
            let outcome = match called {
                Ok(future) => catch_async(future).await,
                Err(fault) => Err(fault),
            };
            match outcome {
                Ok(result) => result,
                Err(fault) => Ok(recovered(fault, upgrade, &context, &*reporter)),
            }
        })
    }
}

fn recovered(
    fault: Fault,
    upgrade: bool,
    context: &ErrorContext,
    reporter: &dyn ErrorHandler,
) -> Response {
    if fault.is_abort() {
        tracing::debug!(%context, "handler aborted the request");
        abort();
    }

    let response = (!upgrade).then(|| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    reporter.handle(context, &fault);
    match response {
        Some(response) => response,
        None => abort(),
    }
}
