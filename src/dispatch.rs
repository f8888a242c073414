//! Fire-and-forget dispatch of units of work.
//!
//! Each dispatched unit runs on its own OS thread (or tokio task) inside a
//! protected call. If it returns an error or panics, the error is handed
//! to a handler on that same thread; the caller never waits for it.
//!
//! The process-wide default handler is set at most once, during startup.
//! Code that needs a different handler builds a [`Dispatcher`] instead of
//! replacing the default.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::thread;

use thiserror::Error;

use crate::call::{call, call_async};
use crate::fault::BoxError;
use crate::handler::{ErrorContext, ErrorHandler, SharedHandler, TracingHandler};

static DEFAULT_HANDLER: OnceLock<SharedHandler> = OnceLock::new();

const THREAD_NAME: &str = "recovery-dispatch";

#[derive(Debug, Error)]
pub enum DispatchError {
    /// The default handler was already set, or already used
    #[error("default error handler has already been set")]
    HandlerAlreadySet,
}

/// Set the process-wide default handler.
///
/// The default is fixed the first time it is read, so this only succeeds
/// when called before the first dispatch.
pub fn set_default_handler<H: ErrorHandler>(handler: H) -> Result<(), DispatchError> {
    DEFAULT_HANDLER
        .set(Arc::new(handler))
        .map_err(|_| DispatchError::HandlerAlreadySet)
}

/// The process-wide default handler, a [`TracingHandler`] unless one was
/// set.
pub fn default_handler() -> SharedHandler {
    Arc::clone(DEFAULT_HANDLER.get_or_init(|| Arc::new(TracingHandler::from_settings())))
}

/// Run `unit` on a new thread; deliver its error, returned or recovered,
/// to `handler` on that thread.
pub fn go_handler<H, F>(handler: H, unit: F)
where
    H: FnOnce(BoxError) + Send + 'static,
    F: FnOnce() -> Result<(), BoxError> + Send + 'static,
{
    spawn_thread(THREAD_NAME.to_string(), move || {
        if let Err(err) = call(unit) {
            handler(err);
        }
    });
}

/// Run `unit` on a new thread, reporting errors to the default handler.
pub fn go<F>(unit: F)
where
    F: FnOnce() -> Result<(), BoxError> + Send + 'static,
{
    Dispatcher::new_shared(default_handler()).go(unit);
}

/// Run `unit` as a tokio task; deliver its error to `handler` on that
/// task. Must be called from within a tokio runtime.
pub fn spawn_handler<H, F>(handler: H, unit: F)
where
    H: FnOnce(BoxError) + Send + 'static,
    F: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(err) = call_async(unit).await {
            handler(err);
        }
    });
}

/// Run `unit` as a tokio task, reporting errors to the default handler.
pub fn spawn<F>(unit: F)
where
    F: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    Dispatcher::new_shared(default_handler()).spawn(unit);
}

fn spawn_thread<F>(name: String, body: F)
where
    F: FnOnce() + Send + 'static,
{
    if let Err(err) = thread::Builder::new().name(name.clone()).spawn(body) {
        tracing::error!(error = %err, thread = %name, "failed to spawn dispatch thread");
    }
}

/// Dispatches units of work to a fixed handler.
///
/// # Example
///
/// ```no_run
/// use panic_recovery::dispatch::Dispatcher;
/// use panic_recovery::handler::{StackPrint, TracingHandler};
///
/// let dispatcher = Dispatcher::new(TracingHandler::new(StackPrint::Full)).named("indexer");
/// dispatcher.go(|| {
///     // work that may panic
///     Ok(())
/// });
/// ```
#[derive(Clone)]
pub struct Dispatcher {
    handler: SharedHandler,
    name: Option<String>,
}

impl Dispatcher {
    pub fn new<H: ErrorHandler>(handler: H) -> Self {
        Self::new_shared(Arc::new(handler))
    }

    pub fn new_shared(handler: SharedHandler) -> Self {
        Self {
            handler,
            name: None,
        }
    }

    /// Name used for spawned threads and in the reported [`ErrorContext`].
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn handler(&self) -> &SharedHandler {
        &self.handler
    }

    /// Run `unit` on a new thread.
    pub fn go<F>(&self, unit: F)
    where
        F: FnOnce() -> Result<(), BoxError> + Send + 'static,
    {
        let handler = Arc::clone(&self.handler);
        let name = self.name.clone();
        let thread_name = name.clone().unwrap_or_else(|| THREAD_NAME.to_string());
        spawn_thread(thread_name, move || {
            if let Err(err) = call(unit) {
                handler.handle(&ErrorContext::task(name), &*err);
            }
        });
    }

    /// Run `unit` as a tokio task. Must be called from within a tokio
    /// runtime.
    pub fn spawn<F>(&self, unit: F)
    where
        F: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let handler = Arc::clone(&self.handler);
        let name = self.name.clone();
        tokio::spawn(async move {
            if let Err(err) = call_async(unit).await {
                handler.handle(&ErrorContext::task(name), &*err);
            }
        });
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
