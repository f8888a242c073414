//! Panic-site interception.
//!
//! By the time `catch_unwind` returns, the frames that raised the panic are
//! gone. A process-wide panic hook therefore records the stack while the
//! panic is still in flight, but only for threads currently inside a
//! protected [`Scope`]. Panics anywhere else go to the previously installed
//! hook as if this crate were not there.

use std::any::{Any, TypeId};
use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::panic;
use std::sync::Once;

use crate::fault::{Fault, PanicError, ThrownError};
use crate::settings;
use crate::stack::StackSnapshot;

static INSTALL: Once = Once::new();

thread_local! {
    static DEPTH: Cell<usize> = const { Cell::new(0) };
    static PENDING: RefCell<Option<(Fingerprint, StackSnapshot)>> = const { RefCell::new(None) };
}

/// Identifies the payload a recorded stack belongs to. A payload raised
/// with `resume_unwind` never reaches the hook, so a stack left over from
/// a panic caught earlier must not be attached to it.
#[derive(Debug, PartialEq, Eq)]
struct Fingerprint {
    type_id: TypeId,
    message: Option<String>,
}

impl Fingerprint {
    fn of(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&'static str>()
            .map(|message| (*message).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned());
        Self {
            type_id: (*payload).type_id(),
            message,
        }
    }
}

/// Install the interception hook, chaining to whatever hook was installed
/// before. Idempotent.
pub fn install() {
    INSTALL.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if !in_scope() {
                previous(info);
                return;
            }
            if settings::current().print_intercepted {
                previous(info);
            }
            if carries_stack(info.payload()) {
                return;
            }
            let stack = StackSnapshot::capture_panic_site();
            let fingerprint = Fingerprint::of(info.payload());
            // the slot may be borrowed if a panic escapes a nested hook call
            let _ = PENDING.try_with(|pending| {
                if let Ok(mut slot) = pending.try_borrow_mut() {
                    *slot = Some((fingerprint, stack));
                }
            });
        }));
    });
}

fn in_scope() -> bool {
    DEPTH.try_with(|depth| depth.get() > 0).unwrap_or(false)
}

/// Payloads that were already classified keep their own stack.
fn carries_stack(payload: &(dyn Any + Send)) -> bool {
    payload.is::<Fault>()
        || payload.is::<PanicError>()
        || payload.is::<ThrownError>()
        || payload.is::<Box<Fault>>()
        || payload.is::<Box<PanicError>>()
        || payload.is::<Box<ThrownError>>()
}

/// Marks the current thread as running inside a protected call for as long
/// as the guard lives.
///
/// Scopes nest; the hook stays active until the outermost one is dropped.
pub(crate) struct Scope {
    // bound to the thread whose depth counter it incremented
    _thread: PhantomData<*const ()>,
}

impl Scope {
    pub(crate) fn enter() -> Self {
        install();
        DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self {
            _thread: PhantomData,
        }
    }

    /// Take the stack the hook recorded for `payload`. A stack recorded
    /// for any other panic is dropped.
    pub(crate) fn take_stack(&self, payload: &(dyn Any + Send)) -> Option<StackSnapshot> {
        let (fingerprint, stack) = PENDING.with(|pending| pending.borrow_mut().take())?;
        (fingerprint == Fingerprint::of(payload)).then_some(stack)
    }

    /// Drop any stack left over from a panic that someone else caught
    /// inside this scope.
    pub(crate) fn discard(&self) {
        PENDING.with(|pending| pending.borrow_mut().take());
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        let _ = DEPTH.try_with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}
