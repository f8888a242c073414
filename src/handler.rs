//! Error handlers.
//!
//! Every boundary that recovers a fault forwards it to an [`ErrorHandler`]
//! together with an [`ErrorContext`] describing where it happened. The
//! default handler, [`TracingHandler`], logs through `tracing`.

use std::error::Error;
use std::fmt;
use std::sync::Arc;

use axum::http::{Method, Uri};
use serde::{Deserialize, Serialize};

use crate::fault;
use crate::settings;

/// Where a reported error came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorContext {
    /// A dispatched thread or task
    Task { name: Option<String> },
    /// An inbound HTTP request
    Request { method: Method, uri: Uri },
}

impl ErrorContext {
    pub fn task(name: Option<String>) -> Self {
        ErrorContext::Task { name }
    }

    pub fn request(method: &Method, uri: &Uri) -> Self {
        ErrorContext::Request {
            method: method.clone(),
            uri: uri.clone(),
        }
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorContext::Task { name: Some(name) } => write!(f, "task {}", name),
            ErrorContext::Task { name: None } => f.write_str("task"),
            ErrorContext::Request { method, uri } => write!(f, "{} {}", method, uri),
        }
    }
}

/// Receives errors recovered at a boundary.
pub trait ErrorHandler: Send + Sync + 'static {
    fn handle(&self, context: &ErrorContext, error: &(dyn Error + 'static));
}

impl<F> ErrorHandler for F
where
    F: Fn(&ErrorContext, &(dyn Error + 'static)) + Send + Sync + 'static,
{
    fn handle(&self, context: &ErrorContext, error: &(dyn Error + 'static)) {
        self(context, error)
    }
}

/// Shared handle to a handler.
pub type SharedHandler = Arc<dyn ErrorHandler>;

/// Wrap a closure as a [`SharedHandler`].
pub fn from_fn<F>(handler: F) -> SharedHandler
where
    F: Fn(&ErrorContext, &(dyn Error + 'static)) + Send + Sync + 'static,
{
    Arc::new(handler)
}

/// How much of the stack a [`TracingHandler`] writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StackPrint {
    /// The full rendering, stack included, is the log message
    Full,
    /// Short message, full rendering in a `full` field
    #[default]
    Structured,
    /// Short message only
    None,
}

macro_rules! report {
    ($bug:expr, $($arg:tt)+) => {
        if $bug {
            tracing::error!($($arg)+)
        } else {
            tracing::warn!($($arg)+)
        }
    };
}

/// Logs recovered errors with `tracing`.
///
/// Wrapped panics are logged at `ERROR`; thrown and returned errors are
/// expected failures and are logged at `WARN`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingHandler {
    stack_print: StackPrint,
}

impl TracingHandler {
    pub fn new(stack_print: StackPrint) -> Self {
        Self { stack_print }
    }

    /// Use the stack print mode from the installed settings.
    pub fn from_settings() -> Self {
        Self::new(settings::current().stack_print)
    }

    pub fn stack_print(&self) -> StackPrint {
        self.stack_print
    }
}

impl ErrorHandler for TracingHandler {
    fn handle(&self, context: &ErrorContext, error: &(dyn Error + 'static)) {
        let bug = fault::is_panic(error);
        match self.stack_print {
            StackPrint::Full => report!(bug, %context, "{:#}", error),
            StackPrint::Structured => {
                let full = format!("{:#}", error);
                report!(bug, %context, full = %full, "{}", error)
            }
            StackPrint::None => report!(bug, %context, "{}", error),
        }
    }
}
