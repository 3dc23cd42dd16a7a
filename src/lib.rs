//! # mallocator - A Thread-Safe First-Fit Heap
//!
//! This crate is a general-purpose dynamic memory allocator: a drop-in
//! heap for processes that do not use the platform allocator. It obtains
//! raw address space from the operating system, carves it into
//! variably-sized blocks, and defragments by coalescing freed neighbors.
//!
//! ## Overview
//!
//! ```text
//!   Heap Memory (one sbrk chunk, carved into blocks):
//!
//!   ┌──────────────────────────────────────────────────────────────────┐
//!   │  ┌────┬───────┐ ┌────┬─────────┐ ┌────┬───────────────────────┐  │
//!   │  │hdr │ A     │ │hdr │ B (free)│ │hdr │     free remainder    │  │
//!   │  └────┴───────┘ └────┴─────────┘ └────┴───────────────────────┘  │
//!   │         ▲              ▲                   ▲                     │
//!   │         │              └───────────────────┴── on the free list  │
//!   │    live allocation                                               │
//!   └──────────────────────────────────────────────────────────────────┘
//!
//!   Allocation: first fit over the free list, splitting oversized hits.
//!   Deallocation: validate, coalesce with both physical neighbors,
//!   push the result onto the free list.
//! ```
//!
//! Small requests are served from 64 KiB `sbrk` chunks; any request whose
//! total footprint reaches 128 KiB gets a dedicated anonymous mapping
//! that is returned to the OS on free. Every block carries a 32-byte
//! header with a magic sentinel, so stray writes are caught and reported
//! through an installable corruption handler instead of silently
//! propagating.
//!
//! ## Crate Structure
//!
//! ```text
//!   mallocator
//!   ├── align      - alignment macros (align!, align_to!)
//!   ├── block      - block header, magic, validation (internal)
//!   ├── free_list  - intrusive doubly-linked free list (internal)
//!   ├── region     - registry of OS-acquired regions (internal)
//!   ├── os         - sbrk/mmap memory source (internal)
//!   ├── error      - error taxonomy, last-error cell, handler
//!   ├── stats      - statistics snapshot
//!   └── heap       - the engine and the process-global facade
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! unsafe {
//!   let p = mallocator::allocate(256);
//!   assert!(!p.is_null());
//!
//!   p.write(42);
//!   assert_eq!(p.read(), 42);
//!   assert!(mallocator::usable_size(p) >= 256);
//!
//!   mallocator::deallocate(p);
//! }
//! ```
//!
//! ## Guarantees
//!
//! - Every pointer handed out is 16-byte aligned.
//! - Payloads of live allocations never overlap and are never moved.
//! - The heap is multi-producer/multi-consumer; one exclusive mutex
//!   serializes state changes and is not held across system calls.
//! - `deallocate(null)` is a no-op. Recoverable failures (out of memory,
//!   invalid sizes) return null and record a thread-local
//!   [`last_error`]; corruption, double frees, and foreign pointers
//!   terminate the process through the installed handler.
//!
//! ## Safety
//!
//! This crate is inherently unsafe: it manages raw memory outside the
//! borrow checker. Callers must uphold the usual malloc discipline -
//! no use after free, no double free, no writing past the requested
//! size. The allocator detects many violations, but detection is a
//! diagnostic, not a guarantee.

pub mod align;
mod block;
mod error;
mod free_list;
mod heap;
mod os;
mod region;
mod stats;

pub use error::{last_error, AllocError, CorruptionHandler, FatalError};
pub use heap::{
  allocate, allocate_aligned, allocate_zeroed, deallocate, heap, init,
  install_corruption_handler, reallocate, stats, teardown, usable_size, Heap, IntegrityReport,
};
pub use os::{EXTEND_CHUNK, MAP_THRESHOLD};
pub use stats::HeapStats;
