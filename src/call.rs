//! Protected calls.
//!
//! [`catch`] runs a unit of work and converts a panic into a [`Fault`].
//! [`call`] layers that over a unit returning `Result`: the unit's own error
//! comes back untouched, a panic comes back as `E::from(fault)`. The async
//! variants put the same boundary around every poll of a future.
//!
//! The unit is run under `AssertUnwindSafe`: state it shares with the
//! caller may be left half-updated by a panic, exactly as if the panic had
//! been caught by any other means.

use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::classify::classify_with;
use crate::fault::{Fault, NilPanic, PanicError};
use crate::hook::Scope;
use crate::stack::StackSnapshot;

/// Run `unit`, converting a panic into a [`Fault`].
///
/// # Examples
///
/// ```
/// let fault = panic_recovery::catch(|| panic!("boom")).unwrap_err();
/// assert_eq!(fault.to_string(), "panic: boom");
/// ```
pub fn catch<R, F>(unit: F) -> Result<R, Fault>
where
    F: FnOnce() -> R,
{
    let scope = Scope::enter();
    match panic::catch_unwind(AssertUnwindSafe(unit)) {
        Ok(value) => {
            scope.discard();
            Ok(value)
        }
        Err(payload) => {
            let recorded = scope.take_stack(&*payload);
            drop(scope);
            Err(recover(payload, recorded))
        }
    }
}

/// Run `unit` and return its result, or the converted panic.
///
/// An error returned normally by `unit` is passed through exactly as it
/// was; classification only happens when `unit` panicked.
///
/// # Examples
///
/// ```
/// use panic_recovery::{call, BoxError};
///
/// let ok: Result<(), BoxError> = call(|| Ok(()));
/// assert!(ok.is_ok());
///
/// let err: Result<(), BoxError> = call(|| panic!("boom"));
/// assert_eq!(err.unwrap_err().to_string(), "panic: boom");
/// ```
pub fn call<T, E, F>(unit: F) -> Result<T, E>
where
    F: FnOnce() -> Result<T, E>,
    E: From<Fault>,
{
    catch(unit).unwrap_or_else(|fault| Err(E::from(fault)))
}

/// Convert an intercepted payload. A fault is never lost: panics without
/// a payload, or with a missing one, become a [`NilPanic`] fault.
#[inline(never)]
fn recover(payload: Box<dyn Any + Send>, recorded: Option<StackSnapshot>) -> Fault {
    let payload = if payload.is::<()>() {
        Box::new(NilPanic) as Box<dyn Any + Send>
    } else {
        payload
    };
    let fault = match classify_with(payload, recorded, 2) {
        Some(fault) => fault,
        None => Fault::Panic(PanicError::nil(StackSnapshot::capture(2))),
    };
    if !fault.is_abort() {
        tracing::debug!(error = %fault, thrown = fault.is_thrown(), "recovered from panic");
    }
    fault
}

/// A future that converts panics raised while polling `F` into a
/// [`Fault`].
#[must_use = "futures do nothing unless polled"]
pub struct CatchFault<F> {
    inner: Option<Pin<Box<F>>>,
}

impl<F: Future> CatchFault<F> {
    pub fn new(future: F) -> Self {
        Self {
            inner: Some(Box::pin(future)),
        }
    }
}

impl<F: Future> Future for CatchFault<F> {
    type Output = Result<F::Output, Fault>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(inner) = this.inner.as_mut() else {
            panic!("`CatchFault` polled after completion");
        };

        let scope = Scope::enter();
        let polled = panic::catch_unwind(AssertUnwindSafe(|| inner.as_mut().poll(cx)));
        let output = match polled {
            Ok(Poll::Pending) => {
                scope.discard();
                return Poll::Pending;
            }
            Ok(Poll::Ready(value)) => {
                scope.discard();
                Ok(value)
            }
            Err(payload) => {
                let recorded = scope.take_stack(&*payload);
                drop(scope);
                Err(recover(payload, recorded))
            }
        };
        this.inner = None;
        Poll::Ready(output)
    }
}

/// Await `future`, converting a panic raised while polling it into a
/// [`Fault`].
pub fn catch_async<F: Future>(future: F) -> CatchFault<F> {
    CatchFault::new(future)
}

/// Async counterpart of [`call`].
pub async fn call_async<T, E, F>(unit: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<Fault>,
{
    catch_async(unit)
        .await
        .unwrap_or_else(|fault| Err(E::from(fault)))
}
