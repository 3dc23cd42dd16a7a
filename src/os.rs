//! The OS memory source: where the heap's raw address space comes from.
//!
//! The source runs a hybrid strategy keyed on the total footprint of a
//! request (header plus effective payload):
//!
//! ```text
//!                 total footprint T
//!                        │
//!          T < 128 KiB   │   T ≥ 128 KiB
//!        ┌───────────────┴───────────────┐
//!        ▼                               ▼
//!   sbrk in chunks of ≥ 64 KiB      mmap, page-rounded
//!   chunk is carved into blocks,    single-tenant region,
//!   remainder feeds the free list   munmap on deallocate
//! ```
//!
//! Extending in 64 KiB chunks amortizes the syscall over many small
//! requests; the uncarved remainder of each chunk parks on the free list
//! and services them. When the free list is badly fragmented (free share
//! above 0.30) the source may instead route a page-sized-or-larger request
//! through `mmap`, keeping it out of the churned heap entirely.
//!
//! `sbrk` manipulates one process-global cursor and is not atomic, so a
//! process-wide lock serializes every extension. `mmap` needs no such
//! protection. Both primitives can fail; failures are counted and after
//! ten of them the source raises an emergency flag, which only affects
//! logging — there is no automatic retry.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use libc::{c_void, intptr_t, MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE};
use log::{error, warn};

use crate::align::ALIGNMENT;
use crate::error::AllocError;
use crate::region::RegionOrigin;
use crate::{align, align_to};

/// Total-footprint threshold at which a request switches from the
/// heap-break path to the page-map path.
pub const MAP_THRESHOLD: usize = 128 * 1024;

/// Minimum heap-break extension per syscall.
pub const EXTEND_CHUNK: usize = 64 * 1024;

/// Free-share ratio above which the source may reroute requests of at
/// least one page through the page-map path.
pub const FRAGMENTATION_REROUTE: f64 = 0.30;

/// OS failures after which the source flags an emergency.
pub const EMERGENCY_FAILURES: u32 = 10;

const DEFAULT_PAGE_SIZE: usize = 4096;

// The program break is a per-process resource shared by every heap in the
// process, so the pool lock is a process-wide static rather than a field.
static BREAK_LOCK: spin::Mutex<()> = spin::Mutex::new(());

/// Memory handed back by [`OsSource::acquire`].
pub struct SourceChunk {
  pub base: *mut u8,
  pub len: usize,
  pub origin: RegionOrigin,
}

pub struct OsSource {
  page_size: AtomicUsize,
  extend_calls: AtomicU64,
  map_calls: AtomicU64,
  failures: AtomicU32,
  emergency: AtomicBool,
}

impl OsSource {
  pub const fn new() -> Self {
    Self {
      page_size: AtomicUsize::new(0),
      extend_calls: AtomicU64::new(0),
      map_calls: AtomicU64::new(0),
      failures: AtomicU32::new(0),
      emergency: AtomicBool::new(false),
    }
  }

  /// System page size, queried once and cached.
  pub fn page_size(&self) -> usize {
    let cached = self.page_size.load(Ordering::Relaxed);
    if cached != 0 {
      return cached;
    }

    let queried = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let page_size = if queried > 0 {
      queried as usize
    } else {
      DEFAULT_PAGE_SIZE
    };

    self.page_size.store(page_size, Ordering::Relaxed);
    page_size
  }

  /// Rounds `len` up to a whole number of pages.
  pub fn page_align(
    &self,
    len: usize,
  ) -> usize {
    let page_size = self.page_size();
    align_to!(len, page_size)
  }

  /// Acquires memory for a request with total footprint `total`.
  ///
  /// Dispatches between the heap-break and page-map paths as described in
  /// the module docs. The returned chunk is always at least `total` bytes,
  /// 16-byte aligned, and owned exclusively by the caller until it is
  /// registered and carved.
  pub fn acquire(
    &self,
    total: usize,
    fragmentation: f64,
  ) -> Result<SourceChunk, AllocError> {
    let reroute = fragmentation > FRAGMENTATION_REROUTE && total >= self.page_size();

    if total >= MAP_THRESHOLD || reroute {
      let len = self.page_align(total);
      let base = self.map(len)?;

      return Ok(SourceChunk {
        base,
        len,
        origin: RegionOrigin::PageMap,
      });
    }

    self.extend(total)
  }

  /// Grows the program break by one chunk and returns all of it.
  fn extend(
    &self,
    total: usize,
  ) -> Result<SourceChunk, AllocError> {
    let chunk = align!(total).max(EXTEND_CHUNK);

    // The break may start misaligned; over-extend by one alignment unit
    // and round the base up.
    let raw = {
      let _pool = BREAK_LOCK.lock();
      unsafe { libc::sbrk((chunk + ALIGNMENT) as intptr_t) }
    };

    if raw == usize::MAX as *mut c_void {
      self.record_failure();
      warn!("sbrk({}) failed, address space exhausted", chunk + ALIGNMENT);
      return Err(AllocError::OutOfMemory);
    }

    self.extend_calls.fetch_add(1, Ordering::Relaxed);
    let base = align_to!(raw as usize, ALIGNMENT);

    Ok(SourceChunk {
      base: base as *mut u8,
      len: chunk,
      origin: RegionOrigin::HeapBreak,
    })
  }

  /// Maps `len` bytes of fresh anonymous pages.
  ///
  /// `len` must already be page-aligned. The mapping is page-aligned,
  /// zero-filled, and writable.
  pub fn map(
    &self,
    len: usize,
  ) -> Result<*mut u8, AllocError> {
    debug_assert_eq!(len % self.page_size(), 0);

    let base = unsafe {
      libc::mmap(
        ptr::null_mut(),
        len,
        PROT_READ | PROT_WRITE,
        MAP_PRIVATE | MAP_ANONYMOUS,
        -1,
        0,
      )
    };

    if base == MAP_FAILED {
      self.record_failure();
      warn!("mmap of {len} bytes failed");
      return Err(AllocError::OutOfMemory);
    }

    self.map_calls.fetch_add(1, Ordering::Relaxed);
    Ok(base as *mut u8)
  }

  /// Returns a mapped region to the OS.
  ///
  /// # Safety
  ///
  /// `(base, len)` must describe exactly one mapping previously returned
  /// by [`map`](Self::map) with no live references into it.
  pub unsafe fn unmap(
    &self,
    base: *mut u8,
    len: usize,
  ) {
    let rc = unsafe { libc::munmap(base as *mut c_void, len) };
    if rc != 0 {
      warn!("munmap({base:p}, {len}) failed");
    }
  }

  fn record_failure(&self) {
    let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;

    if failures >= EMERGENCY_FAILURES && !self.emergency.swap(true, Ordering::Relaxed) {
      error!("memory source entering emergency state after {failures} failures");
    }
  }

  pub fn failures(&self) -> u32 {
    self.failures.load(Ordering::Relaxed)
  }

  pub fn emergency(&self) -> bool {
    self.emergency.load(Ordering::Relaxed)
  }

  pub fn extend_calls(&self) -> u64 {
    self.extend_calls.load(Ordering::Relaxed)
  }

  pub fn map_calls(&self) -> u64 {
    self.map_calls.load(Ordering::Relaxed)
  }
}
