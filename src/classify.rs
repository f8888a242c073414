//! Fault classification.
//!
//! Turns a recovered panic payload into a [`Fault`], in this order:
//!
//! 1. a `()` payload (no payload at all) yields nothing
//! 2. a [`ThrownError`] is returned unchanged
//! 3. a [`PanicError`] or [`Fault`] is returned unchanged
//! 4. a boxed error that already embeds a wrapped fault keeps that fault's
//!    stack instead of capturing a new one
//! 5. anything else is wrapped in a new [`PanicError`]
//!
//! Rules 2 and 3 also accept one level of `Box`, and `Option` for a
//! possibly missing value; `None` yields nothing. Together they make
//! classification idempotent, so nested protected calls never add a second
//! `panic: ` prefix or a second stack.

use std::any::Any;

use crate::fault::{self, BoxError, Fault, PanicError, ThrownError};
use crate::stack::StackSnapshot;

macro_rules! pass_through {
    ($recovered:ident, $ty:ty, |$value:ident| $make:expr) => {
        let $recovered = match $recovered.downcast::<$ty>() {
            Ok($value) => return $make,
            Err(other) => other,
        };
    };
}

/// Classify a recovered panic payload.
///
/// When a new [`PanicError`] has to be built, its stack is captured here,
/// skipping `skip` frames above the caller of `classify`.
#[inline(never)]
pub fn classify(recovered: Box<dyn Any + Send>, skip: usize) -> Option<Fault> {
    classify_with(recovered, None, skip + 1)
}

/// Classify with a stack that was already recorded at the panic site.
/// Without one, the stack is captured now, skipping `skip` frames above
/// the caller.
#[inline(never)]
pub(crate) fn classify_with(
    recovered: Box<dyn Any + Send>,
    recorded: Option<StackSnapshot>,
    skip: usize,
) -> Option<Fault> {
    if recovered.is::<()>() {
        return None;
    }

    pass_through!(recovered, Fault, |f| Some(*f));
    pass_through!(recovered, ThrownError, |t| Some(Fault::Thrown(*t)));
    pass_through!(recovered, PanicError, |p| Some(Fault::Panic(*p)));
    pass_through!(recovered, Box<Fault>, |f| Some(**f));
    pass_through!(recovered, Box<ThrownError>, |t| Some(Fault::Thrown(**t)));
    pass_through!(recovered, Box<PanicError>, |p| Some(Fault::Panic(**p)));
    pass_through!(recovered, Option<Fault>, |f| *f);
    pass_through!(recovered, Option<Box<Fault>>, |f| (*f).map(|f| *f));
    pass_through!(recovered, Option<ThrownError>, |t| (*t).map(Fault::Thrown));
    pass_through!(recovered, Option<PanicError>, |p| (*p).map(Fault::Panic));

    let recovered = match recovered.downcast::<BoxError>() {
        Ok(err) => match embedded(*err) {
            Ok(fault) => return Some(fault),
            Err(err) => Box::new(err) as Box<dyn Any + Send>,
        },
        Err(other) => other,
    };

    let stack = match recorded {
        Some(stack) => stack,
        None => StackSnapshot::capture(skip + 1),
    };
    Some(Fault::Panic(PanicError::new(recovered, stack)))
}

/// Rule 4: a boxed error that is, or wraps, an earlier fault.
fn embedded(err: BoxError) -> Result<Fault, BoxError> {
    let err = match err.downcast::<Fault>() {
        Ok(fault) => return Ok(*fault),
        Err(err) => err,
    };
    let err = match err.downcast::<ThrownError>() {
        Ok(thrown) => return Ok(Fault::Thrown(*thrown)),
        Err(err) => err,
    };
    let err = match err.downcast::<PanicError>() {
        Ok(panic) => return Ok(Fault::Panic(*panic)),
        Err(err) => err,
    };
    let stack = fault::wrapped_fault(&*err).map(PanicError::shared_stack);
    match stack {
        Some(stack) => Ok(Fault::Panic(PanicError::passthrough(err, stack))),
        None => Err(err),
    }
}
