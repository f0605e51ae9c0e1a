//! Fault boundary support: turns a caught task panic into a
//! [`PoolError::Recovery`] carrying the panic message and a bounded trace.

use crate::error::PoolError;

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::sync::Once;
use std::task::{Context, Poll};

/// Upper bound on the stack trace embedded in a recovery error.
pub const MAX_TRACE_BYTES: usize = 7000;

thread_local! {
  static LAST_PANIC_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
  // Set only while a pool task is being polled on this thread.
  static CAPTURE_TRACES: Cell<bool> = const { Cell::new(false) };
}

static TRACE_HOOK: Once = Once::new();

/// Chains a panic hook that records the panicking thread's backtrace so a
/// worker can attach it after `catch_unwind`. The previous hook still runs.
///
/// Only panics raised while a [`Traced`] future is being polled pay for a
/// backtrace; every other panic in the process goes straight to the previous
/// hook. A hook installed later with `std::panic::set_hook` replaces this one,
/// after which recovery traces are captured at the catch site instead.
pub(crate) fn install_trace_hook() {
  TRACE_HOOK.call_once(|| {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
      if CAPTURE_TRACES.try_with(Cell::get).unwrap_or(false) {
        let trace = Backtrace::force_capture().to_string();
        let _ = LAST_PANIC_TRACE.try_with(|slot| {
          if let Ok(mut slot) = slot.try_borrow_mut() {
            *slot = Some(trace);
          }
        });
      }
      previous(info);
    }));
  });
}

/// Wraps a task future so panics raised while polling it record a trace.
pub(crate) fn traced<F: Future + Unpin>(inner: F) -> Traced<F> {
  Traced { inner }
}

pub(crate) struct Traced<F> {
  inner: F,
}

impl<F: Future + Unpin> Future for Traced<F> {
  type Output = F::Output;

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let _capture = CaptureGuard::enter();
    Pin::new(&mut self.inner).poll(cx)
  }
}

// Restores the flag on drop, which also runs while unwinding out of `poll`.
struct CaptureGuard {
  previous: bool,
}

impl CaptureGuard {
  fn enter() -> Self {
    Self {
      previous: CAPTURE_TRACES.with(|flag| flag.replace(true)),
    }
  }
}

impl Drop for CaptureGuard {
  fn drop(&mut self) {
    let previous = self.previous;
    let _ = CAPTURE_TRACES.try_with(|flag| flag.set(previous));
  }
}

/// Builds the recovery error for a payload caught on the current thread.
pub(crate) fn recovery_error(payload: Box<dyn Any + Send>) -> PoolError {
  let trace = LAST_PANIC_TRACE
    .try_with(|slot| slot.borrow_mut().take())
    .ok()
    .flatten()
    .unwrap_or_else(|| Backtrace::force_capture().to_string());

  PoolError::Recovery {
    message: panic_message(payload.as_ref()),
    trace: truncate_trace(trace, MAX_TRACE_BYTES),
  }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(message) = payload.downcast_ref::<&'static str>() {
    (*message).to_string()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "non-string panic payload".to_string()
  }
}

fn truncate_trace(mut trace: String, max_bytes: usize) -> String {
  if trace.len() > max_bytes {
    let mut end = max_bytes;
    while !trace.is_char_boundary(end) {
      end -= 1;
    }
    trace.truncate(end);
  }
  trace
}
