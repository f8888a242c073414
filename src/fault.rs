//! Fault-derived errors.
//!
//! A recovered panic becomes one of two errors:
//!
//! - [`PanicError`], a wrapped fault: anything that was not raised on
//!   purpose. It always carries a [`StackSnapshot`] and renders as
//!   `panic: <message>`.
//! - [`ThrownError`], an intentional error raised with [`throw`] to escape
//!   a deep call stack. It renders exactly like the error it carries.
//!
//! [`Fault`] is the union of the two and is what the protected-call
//! functions hand back. `{}` gives the short rendering, `{:#}` appends the
//! captured stack.

use std::any::Any;
use std::error::Error;
use std::fmt;
use std::panic;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::settings;
use crate::stack::StackSnapshot;

/// Boxed, thread-safe error, the common currency of handlers and units of
/// work.
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Panic payload meaning "abort this request without a response".
///
/// Transport adapters re-raise it instead of reporting it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Error)]
#[error("abort handler")]
pub struct AbortHandler;

/// Placeholder for a panic raised without a payload (`panic_any(())`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Error)]
#[error("panic called with nil argument")]
pub struct NilPanic;

/// What a [`PanicError`] was raised with.
#[derive(Debug)]
pub enum PanicPayload {
    /// `panic!("...")` and other string payloads
    Message(String),
    /// A payload with error semantics
    Error(BoxError),
    /// Anything else. `rendered` is the value for primitives and
    /// `Box<dyn Any>` otherwise.
    Opaque {
        rendered: String,
        value: Mutex<Option<Box<dyn Any + Send>>>,
    },
}

macro_rules! take_as {
    ($payload:ident, $ty:ty, |$value:ident| $make:expr) => {
        let $payload = match $payload.downcast::<$ty>() {
            Ok($value) => return $make,
            Err(other) => other,
        };
    };
}

macro_rules! render_primitive {
    ($payload:ident, $($ty:ty),+) => {
        $(
            if let Some(value) = $payload.downcast_ref::<$ty>() {
                return PanicPayload::opaque(value.to_string(), $payload);
            }
        )+
    };
}

impl PanicPayload {
    /// Normalize a raw panic payload.
    pub fn from_any(payload: Box<dyn Any + Send>) -> Self {
        take_as!(payload, String, |s| PanicPayload::Message(*s));
        take_as!(payload, &'static str, |s| PanicPayload::Message((*s).to_string()));
        take_as!(payload, BoxError, |e| PanicPayload::Error(*e));
        take_as!(payload, AbortHandler, |e| PanicPayload::Error(e));
        take_as!(payload, NilPanic, |e| PanicPayload::Error(e));
        take_as!(payload, std::io::Error, |e| PanicPayload::Error(e));
        take_as!(payload, fmt::Error, |e| PanicPayload::Error(e));
        render_primitive!(
            payload, i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64,
            bool, char
        );
        PanicPayload::opaque("Box<dyn Any>".to_string(), payload)
    }

    fn opaque(rendered: String, value: Box<dyn Any + Send>) -> Self {
        PanicPayload::Opaque {
            rendered,
            value: Mutex::new(Some(value)),
        }
    }

    /// The payload's message, without the `panic: ` prefix.
    pub fn message(&self) -> String {
        match self {
            PanicPayload::Message(message) => message.clone(),
            PanicPayload::Error(err) => err.to_string(),
            PanicPayload::Opaque { rendered, .. } => rendered.clone(),
        }
    }

    /// The payload as an error, when it has error semantics.
    pub fn as_error(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PanicPayload::Error(err) => Some(&**err),
            _ => None,
        }
    }

    /// Rebuild a payload suitable for `resume_unwind`.
    pub fn into_any(self) -> Box<dyn Any + Send> {
        match self {
            PanicPayload::Message(message) => Box::new(message),
            PanicPayload::Error(err) => match err.downcast::<AbortHandler>() {
                Ok(abort) => abort,
                Err(err) => match err.downcast::<NilPanic>() {
                    Ok(_) => Box::new(()),
                    Err(err) => Box::new(err),
                },
            },
            PanicPayload::Opaque { rendered, value } => value
                .into_inner()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .unwrap_or_else(|| Box::new(rendered) as Box<dyn Any + Send>),
        }
    }
}

/// A panic that was converted into an error.
#[derive(Debug)]
pub struct PanicError {
    payload: PanicPayload,
    stack: Arc<StackSnapshot>,
    passthrough: bool,
}

impl PanicError {
    /// Wrap a raw panic payload together with the stack of its panic site.
    pub fn new(payload: Box<dyn Any + Send>, stack: StackSnapshot) -> Self {
        Self {
            payload: PanicPayload::from_any(payload),
            stack: Arc::new(stack),
            passthrough: false,
        }
    }

    /// A wrapped fault with a plain message payload.
    pub fn from_message(message: impl Into<String>, stack: StackSnapshot) -> Self {
        Self {
            payload: PanicPayload::Message(message.into()),
            stack: Arc::new(stack),
            passthrough: false,
        }
    }

    /// The fault raised without any payload.
    pub fn nil(stack: StackSnapshot) -> Self {
        Self {
            payload: PanicPayload::Error(Box::new(NilPanic)),
            stack: Arc::new(stack),
            passthrough: false,
        }
    }

    /// An error that already embeds a wrapped fault. It renders as-is and
    /// shares the embedded stack.
    pub(crate) fn passthrough(err: BoxError, stack: Arc<StackSnapshot>) -> Self {
        Self {
            payload: PanicPayload::Error(err),
            stack,
            passthrough: true,
        }
    }

    pub fn payload(&self) -> &PanicPayload {
        &self.payload
    }

    pub fn into_payload(self) -> PanicPayload {
        self.payload
    }

    /// The message without the `panic: ` prefix.
    pub fn message(&self) -> String {
        self.payload.message()
    }

    pub fn stack(&self) -> &StackSnapshot {
        &self.stack
    }

    /// Shared handle to the stack, for errors that wrap this one.
    pub fn shared_stack(&self) -> Arc<StackSnapshot> {
        Arc::clone(&self.stack)
    }

    /// Whether the payload is the [`AbortHandler`] sentinel.
    pub fn is_abort(&self) -> bool {
        self.payload_is::<AbortHandler>()
    }

    /// Whether the panic was raised without a payload.
    pub fn is_nil(&self) -> bool {
        self.payload_is::<NilPanic>()
    }

    fn payload_is<E: Error + 'static>(&self) -> bool {
        self.payload
            .as_error()
            .is_some_and(|err| err.downcast_ref::<E>().is_some())
    }
}

impl fmt::Display for PanicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.payload, self.passthrough) {
            (PanicPayload::Error(err), true) => write!(f, "{}", err)?,
            (payload, _) => write!(f, "panic: {}", payload.message())?,
        }
        if f.alternate() && !self.stack.is_empty() {
            write!(f, "\n{:#}", self.stack)?;
        }
        Ok(())
    }
}

impl Error for PanicError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.payload.as_error()
    }
}

/// An error raised on purpose with [`throw`].
#[derive(Debug)]
pub struct ThrownError {
    inner: BoxError,
    stack: Option<Arc<StackSnapshot>>,
}

impl ThrownError {
    /// Wrap `err`, capturing the caller's stack when thrown stacks are
    /// enabled.
    #[inline(never)]
    pub fn new(err: impl Into<BoxError>) -> Self {
        Self::with_skip(err.into(), 2)
    }

    /// `skip` counts from this function: 1 is its caller.
    #[inline(never)]
    fn with_skip(inner: BoxError, skip: usize) -> Self {
        let stack = if settings::current().thrown_stacks {
            Some(Arc::new(StackSnapshot::capture(skip)))
        } else {
            None
        };
        Self { inner, stack }
    }

    pub fn inner(&self) -> &(dyn Error + Send + Sync + 'static) {
        self.inner.as_ref()
    }

    pub fn into_inner(self) -> BoxError {
        self.inner
    }

    pub fn stack(&self) -> Option<&StackSnapshot> {
        self.stack.as_deref()
    }
}

impl fmt::Display for ThrownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)?;
        if let Some(stack) = self.stack.as_deref().filter(|_| f.alternate()) {
            if !stack.is_empty() {
                write!(f, "\n{:#}", stack)?;
            }
        }
        Ok(())
    }
}

impl Error for ThrownError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&*self.inner)
    }
}

/// An error produced by intercepting a panic.
#[derive(Debug, Error)]
pub enum Fault {
    /// The panic was not raised on purpose
    #[error(transparent)]
    Panic(#[from] PanicError),

    /// The panic carried an error raised with [`throw`]
    #[error(transparent)]
    Thrown(#[from] ThrownError),
}

impl Fault {
    pub fn is_panic(&self) -> bool {
        matches!(self, Fault::Panic(_))
    }

    pub fn is_thrown(&self) -> bool {
        matches!(self, Fault::Thrown(_))
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, Fault::Panic(panic) if panic.is_abort())
    }

    pub fn stack(&self) -> Option<&StackSnapshot> {
        match self {
            Fault::Panic(panic) => Some(panic.stack()),
            Fault::Thrown(thrown) => thrown.stack(),
        }
    }

    pub fn has_stack(&self) -> bool {
        self.stack().is_some_and(|stack| !stack.is_empty())
    }

    /// The fault as a panic payload. Classifying it again yields this
    /// fault unchanged.
    pub fn into_panic(self) -> Box<dyn Any + Send> {
        Box::new(self)
    }

    /// Re-raise the fault. An enclosing protected call gets it back
    /// unchanged.
    pub fn resume(self) -> ! {
        panic::resume_unwind(self.into_panic())
    }
}

/// Raise `err` as an intentional error.
///
/// Unwinds to the nearest protected call, which returns the error as a
/// [`Fault::Thrown`]. The panic hook is bypassed, so nothing is printed.
/// Outside a protected call this unwinds the thread like any panic.
#[inline(never)]
pub fn throw<E: Into<BoxError>>(err: E) -> ! {
    let thrown = ThrownError::with_skip(err.into(), 2);
    panic::resume_unwind(Box::new(thrown))
}

/// Throwing shortcut for results.
pub trait ResultExt<T> {
    /// Return the `Ok` value or [`throw`] the error.
    fn or_throw(self) -> T;
}

impl<T, E: Into<BoxError>> ResultExt<T> for Result<T, E> {
    #[inline(never)]
    fn or_throw(self) -> T {
        match self {
            Ok(value) => value,
            Err(err) => {
                let thrown = ThrownError::with_skip(err.into(), 2);
                panic::resume_unwind(Box::new(thrown))
            }
        }
    }
}

/// Find a wrapped fault in `err` or its source chain.
pub fn wrapped_fault<'a>(err: &'a (dyn Error + 'static)) -> Option<&'a PanicError> {
    std::iter::successors(Some(err), |&err| err.source()).find_map(|err| {
        err.downcast_ref::<PanicError>()
            .or_else(|| match err.downcast_ref::<Fault>() {
                Some(Fault::Panic(panic)) => Some(panic),
                _ => None,
            })
    })
}

/// Whether `err` is, or wraps, a panic that was not raised on purpose.
/// This is the "bug" signal used to pick an alert severity.
pub fn is_panic(err: &(dyn Error + 'static)) -> bool {
    wrapped_fault(err).is_some()
}
