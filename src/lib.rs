//! Panic recovery - convert panics into inspectable errors
//!
//! A unit of work run through [`call`] or [`catch`] never takes its thread
//! down: a panic comes back as a [`Fault`], either a [`PanicError`] carrying
//! the panic payload and the stack of the panic site, or a [`ThrownError`]
//! raised on purpose with [`throw`].
//!
//! On top of that sit [`dispatch`], which runs units on their own thread or
//! tokio task and reports failures to a handler, and [`http`], a tower
//! middleware doing the same for request handlers.
//!
//! Recovery relies on unwinding; with `panic = "abort"` nothing can be
//! intercepted.

pub mod call;
pub mod classify;
pub mod dispatch;
pub mod fault;
pub mod handler;
mod hook;
pub mod http;
pub mod logging;
pub mod settings;
pub mod stack;

pub use call::{call, call_async, catch, catch_async, CatchFault};
pub use classify::classify;
pub use fault::{
    throw, AbortHandler, BoxError, Fault, NilPanic, PanicError, PanicPayload, ResultExt,
    ThrownError,
};
pub use handler::{ErrorContext, ErrorHandler, StackPrint, TracingHandler};
pub use hook::install as install_hook;
pub use stack::{Frame, StackSnapshot};
