//! Error taxonomy and the corruption-report channel.
//!
//! Failures split into two families with very different dispositions:
//!
//! - **Recoverable** failures ([`AllocError`]) make the operation return
//!   null and record the kind in a thread-local cell readable through
//!   [`last_error`]. The heap state is untouched apart from a failure
//!   counter; the caller may retry.
//! - **Fatal** conditions ([`FatalError`]) mean the heap's own metadata can
//!   no longer be trusted. The engine hands `(kind, address, message)` to
//!   the installed [`CorruptionHandler`] and never returns. The default
//!   handler prints a diagnostic to stderr and aborts the process.
//!
//! Nothing in this module allocates: by the time an error is being
//! reported, the allocator may be the component that is broken.

use std::cell::Cell;
use std::process;

/// Failures an operation reports by returning null.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocError {
  /// The operating system refused to hand out more address space, or the
  /// region table is exhausted.
  OutOfMemory,
  /// The request itself is unserviceable: zero or overflowing size, an
  /// alignment that is not a power of two, or a size that is not a
  /// multiple of the requested alignment.
  InvalidSize,
}

/// Conditions that terminate the process through the corruption handler.
///
/// By the time one of these is observed, arbitrary memory may already be
/// compromised; no recovery is attempted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FatalError {
  /// The pointer is misaligned or lies outside every registered region.
  InvalidPointer,
  /// A block header, boundary tag, or free-list link failed validation.
  Corruption,
  /// A block was handed back while already marked free.
  DoubleFree,
}

/// Signature of an installable corruption handler.
///
/// The handler receives the failure kind, the offending address, and a
/// short description. It must diverge: the heap is in an unknown state and
/// there is nothing to return to. A process may install a handler that
/// logs and exits cleanly instead of aborting.
pub type CorruptionHandler = fn(kind: FatalError, address: usize, message: &str) -> !;

/// A fatal condition detected while a lock was still held.
///
/// Faults are carried up to a point where every lock has been released and
/// only then dispatched to the handler, so the handler never runs inside a
/// critical section.
pub(crate) struct Fault {
  pub kind: FatalError,
  pub address: usize,
  pub message: &'static str,
}

thread_local! {
  static LAST_ERROR: Cell<Option<AllocError>> = const { Cell::new(None) };
}

/// Returns the most recent recoverable failure observed on this thread.
///
/// The cell is written on every null-returning failure and is never
/// cleared by successful operations, mirroring `errno` discipline.
pub fn last_error() -> Option<AllocError> {
  LAST_ERROR.with(|cell| cell.get())
}

pub(crate) fn set_last_error(error: AllocError) {
  LAST_ERROR.with(|cell| cell.set(Some(error)));
}

/// Default corruption handler: diagnostic on stderr, then abort.
pub(crate) fn default_corruption_handler(
  kind: FatalError,
  address: usize,
  message: &str,
) -> ! {
  eprintln!("mallocator: fatal {kind:?} at {address:#x}: {message}");
  process::abort();
}
