//! The heap engine: first-fit allocation, bidirectional coalescing, and
//! the process-global facade.
//!
//! ## How an allocation travels
//!
//! ```text
//!   allocate(size)
//!        │ effective size E = max(align16(size), 16)
//!        │ total footprint T = 32 + E
//!        ▼
//!   T < 128 KiB ──► walk free list (first fit) ──► hit ──► split? ──► ptr
//!        │                      │
//!        │                     miss
//!        ▼                      ▼
//!   page-map path        OS source: sbrk chunk ≥ 64 KiB
//!   (single-tenant       register region, carve one fresh
//!    region)             block, split, remainder → free list
//! ```
//!
//! ## Splitting
//!
//! A free block is cut when the remainder can host a minimum block
//! (header + 16 bytes):
//!
//! ```text
//!   before:  ┌────────┬──────────────────────────────────┐
//!            │ header │            free payload          │
//!            └────────┴──────────────────────────────────┘
//!   after:   ┌────────┬────────────┬────────┬────────────┐
//!            │ header │ E(s) bytes │ header │ remainder  │──► free list
//!            └────────┴────────────┴────────┴────────────┘
//! ```
//!
//! ## Coalescing
//!
//! Deallocation merges the dying block with free physical neighbors on
//! both sides, so no two adjacent free blocks ever coexist in a region.
//! The left neighbor is found in O(1) through the `prev_size` boundary
//! tag; at most three blocks fuse in one deallocate:
//!
//! ```text
//!   ┌───────┬───────┬───────┐        ┌───────────────────────┐
//!   │ free  │ dying │ free  │  ───►  │        one block      │
//!   └───────┴───────┴───────┘        └───────────────────────┘
//! ```
//!
//! ## Locking
//!
//! One exclusive heap mutex serializes every state change. It is *not*
//! held across `sbrk`/`mmap`: on a free-list miss the lock is dropped,
//! the source is consulted (under its own process-wide pool lock), and
//! the lock is re-taken to carve the fresh chunk. The registry lock nests
//! innermost. Fatal conditions detected under a lock are carried out of
//! the critical section first and only then handed to the corruption
//! handler, so no callback ever runs while a lock is held.

use std::cmp;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use log::debug;

use crate::align::{effective_size, ALIGNMENT, MIN_PAYLOAD};
use crate::block::{
  self, BlockHeader, HeaderState, BLOCK_ALLOCATED, BLOCK_FREE, HEADER_SIZE, MAGIC,
};
use crate::error::{
  default_corruption_handler, set_last_error, AllocError, CorruptionHandler, FatalError, Fault,
};
use crate::align_to;
use crate::free_list::FreeList;
use crate::os::{OsSource, SourceChunk, MAP_THRESHOLD};
use crate::region::{Region, RegionOrigin, RegionRegistry};
use crate::stats::HeapStats;

/// Requests past this size are rejected outright as invalid rather than
/// bounced off the OS.
const MAX_REQUEST: usize = isize::MAX as usize;

/// High half of the recovery word written in front of an offset aligned
/// allocation (see [`Heap::allocate_aligned`]).
const ALIGN_TAG: u64 = 0xA11A_A11A;

/// Mutable heap state guarded by the heap mutex.
struct HeapState {
  free_list: FreeList,
  total_allocated: usize,
  total_free: usize,
  allocation_count: usize,
  peak_allocated: usize,
}

impl HeapState {
  const fn new() -> Self {
    Self {
      free_list: FreeList::new(),
      total_allocated: 0,
      total_free: 0,
      allocation_count: 0,
      peak_allocated: 0,
    }
  }

  fn fragmentation(&self) -> f64 {
    let managed = self.total_allocated + self.total_free;
    if managed == 0 {
      return 0.0;
    }

    self.total_free as f64 / managed as f64
  }
}

/// A first-fit heap with bidirectional coalescing.
///
/// One process-wide instance lives behind the crate-level facade
/// functions; tests build private instances so their free lists do not
/// interleave. Every method takes `&self`: the engine is internally
/// synchronized and safe to share across threads.
pub struct Heap {
  state: spin::Mutex<HeapState>,
  registry: RegionRegistry,
  source: OsSource,
  /// Installed corruption handler as a `usize`-encoded `fn` pointer;
  /// 0 selects the aborting default.
  handler: AtomicUsize,
  failed_allocations: AtomicU64,
  initialized: AtomicBool,
}

/// What a pointer resolved to: its owning region, real header, and the
/// byte distance from the header's payload to the user pointer (non-zero
/// only for offset aligned allocations).
struct Resolved {
  region: Region,
  header: *mut BlockHeader,
  offset: usize,
}

fn fault(
  kind: FatalError,
  address: usize,
  message: &'static str,
) -> Fault {
  Fault {
    kind,
    address,
    message,
  }
}

/// Full in-place validation, mapped onto the fatal taxonomy.
unsafe fn check_header(
  header: *mut BlockHeader,
  region: &Region,
) -> Result<(), Fault> {
  let state = unsafe { block::validate(header, region.base, region.end()) };
  let address = header as usize;

  match state {
    HeaderState::Valid => Ok(()),
    HeaderState::CorruptMagic => Err(fault(
      FatalError::Corruption,
      address,
      "block header magic mismatch",
    )),
    HeaderState::InvalidSize => Err(fault(
      FatalError::Corruption,
      address,
      "block size field is corrupt",
    )),
    HeaderState::Misaligned => Err(fault(
      FatalError::InvalidPointer,
      address,
      "block header is misaligned",
    )),
    HeaderState::InvalidFreeState => Err(fault(
      FatalError::Corruption,
      address,
      "free flag holds neither 0 nor 1",
    )),
    HeaderState::OutOfBounds => Err(fault(
      FatalError::Corruption,
      address,
      "block extends past its region",
    )),
  }
}

impl Heap {
  pub const fn new() -> Self {
    Self {
      state: spin::Mutex::new(HeapState::new()),
      registry: RegionRegistry::new(),
      source: OsSource::new(),
      handler: AtomicUsize::new(0),
      failed_allocations: AtomicU64::new(0),
      initialized: AtomicBool::new(false),
    }
  }

  /// Prepares the heap for use. Idempotent; every operation calls it
  /// lazily, so an explicit call is only ever a warm-up.
  pub fn init(&self) {
    if self
      .initialized
      .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
      .is_ok()
    {
      let page_size = self.source.page_size();
      debug!(
        "heap initialized: page size {page_size}, map threshold {MAP_THRESHOLD}"
      );
    }
  }

  /// Installs a corruption handler, replacing the aborting default.
  ///
  /// The handler runs with no heap locks held and must diverge.
  pub fn install_corruption_handler(
    &self,
    handler: CorruptionHandler,
  ) {
    self.handler.store(handler as usize, Ordering::Release);
  }

  fn die(
    &self,
    fault: Fault,
  ) -> ! {
    let raw = self.handler.load(Ordering::Acquire);
    if raw == 0 {
      default_corruption_handler(fault.kind, fault.address, fault.message);
    }

    // Encoded by install_corruption_handler from the same fn type.
    let handler: CorruptionHandler = unsafe { mem::transmute(raw) };
    handler(fault.kind, fault.address, fault.message)
  }

  fn note_failure(
    &self,
    error: AllocError,
  ) {
    self.failed_allocations.fetch_add(1, Ordering::Relaxed);
    set_last_error(error);
  }

  // --------------------------------------------------------------------
  // Allocation
  // --------------------------------------------------------------------

  /// Allocates `size` bytes, returning a 16-byte-aligned pointer or null.
  ///
  /// A zero or absurd size fails with [`AllocError::InvalidSize`]; an OS
  /// refusal fails with [`AllocError::OutOfMemory`]. On success the
  /// payload is writable, at least `size` bytes, and disjoint from every
  /// other live allocation until the matching [`deallocate`](Self::deallocate).
  ///
  /// # Safety
  ///
  /// The returned memory is uninitialized. The caller must not use the
  /// pointer after deallocating it.
  pub unsafe fn allocate(
    &self,
    size: usize,
  ) -> *mut u8 {
    self.init();

    if size == 0 || size > MAX_REQUEST {
      self.note_failure(AllocError::InvalidSize);
      return ptr::null_mut();
    }

    let eff = effective_size(size);
    let total = HEADER_SIZE + eff;
    let fragmentation;

    if total < MAP_THRESHOLD {
      let mut state = self.state.lock();

      match unsafe { self.search_and_take(&mut state, eff) } {
        Ok(Some(payload)) => return payload,
        Ok(None) => fragmentation = state.fragmentation(),
        Err(fault) => {
          drop(state);
          self.die(fault);
        }
      }
    } else {
      fragmentation = 0.0;
    }

    // Free list could not serve the request; go to the OS with every
    // lock released.
    unsafe { self.allocate_from_source(total, eff, fragmentation) }
  }

  /// First-fit walk. Returns the user pointer on a hit, `None` on a miss,
  /// and a fault if the walk runs into corrupt metadata.
  unsafe fn search_and_take(
    &self,
    state: &mut HeapState,
    eff: usize,
  ) -> Result<Option<*mut u8>, Fault> {
    let limit = state.free_list.len();
    let mut node = state.free_list.head();
    let mut visited = 0usize;

    while !node.is_null() {
      if visited > limit {
        return Err(fault(
          FatalError::Corruption,
          node as usize,
          "free list contains a cycle",
        ));
      }
      visited += 1;

      // Per-step validation: every node must still look like a free
      // block before its fields are trusted.
      unsafe {
        if (*node).magic != MAGIC {
          return Err(fault(
            FatalError::Corruption,
            node as usize,
            "free list reached a block with corrupt magic",
          ));
        }
        if (*node).is_free != BLOCK_FREE {
          return Err(fault(
            FatalError::Corruption,
            node as usize,
            "free list reached a block not marked free",
          ));
        }
        let node_size = (*node).size;
        if node_size % ALIGNMENT != 0 || node_size < MIN_PAYLOAD {
          return Err(fault(
            FatalError::Corruption,
            node as usize,
            "free list reached a block with corrupt size",
          ));
        }

        if node_size >= eff {
          let Some(region) = self.registry.find(node as usize) else {
            return Err(fault(
              FatalError::Corruption,
              node as usize,
              "free block belongs to no registered region",
            ));
          };

          let payload = self.take_block(state, node, eff, &region, true);
          return Ok(Some(payload));
        }

        node = (*BlockHeader::links(node)).next_free;
      }
    }

    Ok(None)
  }

  /// Claims `block` for an allocation of effective size `eff`, splitting
  /// off the tail when it can host a minimum block.
  unsafe fn take_block(
    &self,
    state: &mut HeapState,
    block: *mut BlockHeader,
    eff: usize,
    region: &Region,
    from_list: bool,
  ) -> *mut u8 {
    unsafe {
      if from_list {
        state.free_list.remove(block);
        state.total_free -= (*block).size;
      }

      if (*block).size >= eff + HEADER_SIZE + MIN_PAYLOAD {
        let remainder_size = (*block).size - eff - HEADER_SIZE;
        (*block).size = eff;

        let remainder_at = (block as *mut u8).add(HEADER_SIZE + eff);
        let remainder = BlockHeader::write(remainder_at, remainder_size, eff, BLOCK_FREE);

        // The block after the remainder now has a new left neighbor size.
        let after = BlockHeader::next_physical(remainder);
        if (after as usize) < region.end() {
          (*after).prev_size = remainder_size;
        }

        state.free_list.push_front(remainder);
        state.total_free += remainder_size;
      }

      (*block).is_free = BLOCK_ALLOCATED;
      state.total_allocated += (*block).size;
      state.allocation_count += 1;
      state.peak_allocated = cmp::max(state.peak_allocated, state.total_allocated);

      BlockHeader::payload(block)
    }
  }

  /// Miss path: acquire from the OS, register the region, carve.
  unsafe fn allocate_from_source(
    &self,
    total: usize,
    eff: usize,
    fragmentation: f64,
  ) -> *mut u8 {
    let chunk = match self.source.acquire(total, fragmentation) {
      Ok(chunk) => chunk,
      Err(error) => {
        self.note_failure(error);
        return ptr::null_mut();
      }
    };

    unsafe { self.install_chunk(chunk, eff) }
  }

  /// Registers a fresh chunk and returns a payload carved from it.
  unsafe fn install_chunk(
    &self,
    chunk: SourceChunk,
    eff: usize,
  ) -> *mut u8 {
    let region = Region {
      base: chunk.base as usize,
      len: chunk.len,
      origin: chunk.origin,
    };

    if !self.registry.register(region) {
      if chunk.origin == RegionOrigin::PageMap {
        unsafe { self.source.unmap(chunk.base, chunk.len) };
      }
      self.note_failure(AllocError::OutOfMemory);
      return ptr::null_mut();
    }

    unsafe {
      match chunk.origin {
        RegionOrigin::PageMap => {
          // Single-tenant: one block fills the region and never meets
          // the free list.
          let header =
            BlockHeader::write(chunk.base, chunk.len - HEADER_SIZE, 0, BLOCK_ALLOCATED);

          let mut state = self.state.lock();
          state.total_allocated += (*header).size;
          state.allocation_count += 1;
          state.peak_allocated = cmp::max(state.peak_allocated, state.total_allocated);
          drop(state);

          BlockHeader::payload(header)
        }
        RegionOrigin::HeapBreak => {
          // The whole chunk becomes one fresh free-shaped block; the
          // ordinary split rule parks the remainder on the free list.
          let header = BlockHeader::write(chunk.base, chunk.len - HEADER_SIZE, 0, BLOCK_FREE);

          let mut state = self.state.lock();
          self.take_block(&mut state, header, eff, &region, false)
        }
      }
    }
  }

  // --------------------------------------------------------------------
  // Deallocation
  // --------------------------------------------------------------------

  /// Returns a block to the heap. Null is a silent no-op; any pointer
  /// this allocator did not hand out terminates the process through the
  /// corruption handler.
  ///
  /// # Safety
  ///
  /// `pointer` must be null or a live pointer from this heap; the caller
  /// must not touch the memory afterwards.
  pub unsafe fn deallocate(
    &self,
    pointer: *mut u8,
  ) {
    if pointer.is_null() {
      return;
    }
    self.init();

    let resolved = match unsafe { self.resolve(pointer) } {
      Ok(resolved) => resolved,
      Err(fault) => self.die(fault),
    };

    if resolved.region.origin == RegionOrigin::PageMap {
      unsafe { self.deallocate_mapped(resolved) };
      return;
    }

    let mut state = self.state.lock();
    let outcome = unsafe { self.deallocate_in_region(&mut state, &resolved) };

    if let Err(fault) = outcome {
      drop(state);
      self.die(fault);
    }
  }

  unsafe fn deallocate_in_region(
    &self,
    state: &mut HeapState,
    resolved: &Resolved,
  ) -> Result<(), Fault> {
    let header = resolved.header;

    unsafe {
      check_header(header, &resolved.region)?;

      if (*header).is_free == BLOCK_FREE {
        return Err(fault(
          FatalError::DoubleFree,
          header as usize,
          "block deallocated twice",
        ));
      }

      let freed = (*header).size;
      self.insert_free_coalesced(state, header, &resolved.region)?;

      state.total_allocated -= freed;
      state.allocation_count -= 1;
    }

    Ok(())
  }

  /// Large-path release: the whole region goes back to the OS.
  unsafe fn deallocate_mapped(
    &self,
    resolved: Resolved,
  ) {
    let header = resolved.header;

    unsafe {
      if let Err(fault) = check_header(header, &resolved.region) {
        self.die(fault);
      }
      if (*header).is_free == BLOCK_FREE {
        self.die(fault(
          FatalError::DoubleFree,
          header as usize,
          "block deallocated twice",
        ));
      }

      let payload = (*header).size;

      {
        let mut state = self.state.lock();
        state.total_allocated -= payload;
        state.allocation_count -= 1;
      }

      if self.registry.unregister(resolved.region.base).is_none() {
        self.die(fault(
          FatalError::InvalidPointer,
          pointer_address(header),
          "mapped region already released",
        ));
      }

      self
        .source
        .unmap(resolved.region.base as *mut u8, resolved.region.len);
    }
  }

  /// Marks `block` free, fuses it with free physical neighbors, fixes the
  /// successor's boundary tag, and inserts the result at the list head.
  ///
  /// The heap lock must be held; `block` must be a valid allocated block
  /// that is not on the free list.
  unsafe fn insert_free_coalesced(
    &self,
    state: &mut HeapState,
    block: *mut BlockHeader,
    region: &Region,
  ) -> Result<(), Fault> {
    unsafe {
      let mut merged = block;

      // Forward: absorb a free right neighbor.
      let next = BlockHeader::next_physical(merged);
      if (next as usize) < region.end() {
        check_header(next, region)?;

        if (*next).is_free == BLOCK_FREE {
          state.free_list.remove(next);
          state.total_free -= (*next).size;
          (*merged).size += HEADER_SIZE + (*next).size;
        }
      }

      // Backward: fold into a free left neighbor found via the tag.
      let prev_size = (*merged).prev_size;
      if prev_size != 0 {
        if prev_size % ALIGNMENT != 0
          || (merged as usize) < region.base + HEADER_SIZE + prev_size
        {
          return Err(fault(
            FatalError::Corruption,
            merged as usize,
            "boundary tag is corrupt",
          ));
        }

        let prev = BlockHeader::prev_physical(merged);
        check_header(prev, region)?;

        if (*prev).size != prev_size {
          return Err(fault(
            FatalError::Corruption,
            prev as usize,
            "boundary tag disagrees with neighbor size",
          ));
        }

        if (*prev).is_free == BLOCK_FREE {
          state.free_list.remove(prev);
          state.total_free -= prev_size;
          (*prev).size = prev_size + HEADER_SIZE + (*merged).size;
          merged = prev;
        }
      }

      // Whatever follows the merged block has a new left neighbor size.
      let after = BlockHeader::next_physical(merged);
      if (after as usize) < region.end() {
        (*after).prev_size = (*merged).size;
      }

      (*merged).is_free = BLOCK_FREE;
      state.free_list.push_front(merged);
      state.total_free += (*merged).size;
    }

    Ok(())
  }

  // --------------------------------------------------------------------
  // Reallocate and friends
  // --------------------------------------------------------------------

  /// Resizes an allocation, preserving the payload prefix.
  ///
  /// `null` behaves as [`allocate`](Self::allocate); `new_size == 0`
  /// behaves as [`deallocate`](Self::deallocate) and returns null. The
  /// returned pointer may or may not equal the input; on failure null is
  /// returned and the input pointer stays valid.
  ///
  /// # Safety
  ///
  /// `pointer` must be null or a live pointer from this heap. On success
  /// the old pointer must no longer be used (unless it was returned).
  pub unsafe fn reallocate(
    &self,
    pointer: *mut u8,
    new_size: usize,
  ) -> *mut u8 {
    unsafe {
      if pointer.is_null() {
        return self.allocate(new_size);
      }
      if new_size == 0 {
        self.deallocate(pointer);
        return ptr::null_mut();
      }

      self.init();

      if new_size > MAX_REQUEST {
        self.note_failure(AllocError::InvalidSize);
        return ptr::null_mut();
      }

      let resolved = match self.resolve(pointer) {
        Ok(resolved) => resolved,
        Err(fault) => self.die(fault),
      };
      let eff = effective_size(new_size);

      if resolved.region.origin == RegionOrigin::PageMap {
        return self.reallocate_mapped(pointer, &resolved, eff, new_size);
      }

      self.reallocate_in_region(pointer, &resolved, eff, new_size)
    }
  }

  unsafe fn reallocate_mapped(
    &self,
    pointer: *mut u8,
    resolved: &Resolved,
    eff: usize,
    new_size: usize,
  ) -> *mut u8 {
    unsafe {
      if let Err(fault) = check_header(resolved.header, &resolved.region) {
        self.die(fault);
      }
      if (*resolved.header).is_free == BLOCK_FREE {
        self.die(fault(
          FatalError::DoubleFree,
          resolved.header as usize,
          "reallocate of a block that is already free",
        ));
      }

      let usable = (*resolved.header).size - resolved.offset;
      if eff <= usable {
        return pointer;
      }

      self.move_allocation(pointer, usable, new_size)
    }
  }

  unsafe fn reallocate_in_region(
    &self,
    pointer: *mut u8,
    resolved: &Resolved,
    eff: usize,
    new_size: usize,
  ) -> *mut u8 {
    let header = resolved.header;

    let mut state = self.state.lock();

    unsafe {
      if let Err(fault) = check_header(header, &resolved.region) {
        drop(state);
        self.die(fault);
      }
      if (*header).is_free == BLOCK_FREE {
        drop(state);
        self.die(fault(
          FatalError::DoubleFree,
          header as usize,
          "reallocate of a block that is already free",
        ));
      }

      let old = (*header).size;
      let usable = old - resolved.offset;

      // Offset aligned allocations only shrink in place; growth moves.
      if resolved.offset != 0 {
        if eff <= usable {
          return pointer;
        }
        drop(state);
        return self.move_allocation(pointer, usable, new_size);
      }

      if eff <= old {
        // Shrink. Split the tail off when it can host a block, and give
        // it back through the ordinary coalescing insert.
        if old - eff >= HEADER_SIZE + MIN_PAYLOAD {
          (*header).size = eff;

          let tail_at = (header as *mut u8).add(HEADER_SIZE + eff);
          let tail =
            BlockHeader::write(tail_at, old - eff - HEADER_SIZE, eff, BLOCK_ALLOCATED);

          if let Err(fault) = self.insert_free_coalesced(&mut state, tail, &resolved.region) {
            drop(state);
            self.die(fault);
          }
          state.total_allocated -= old - eff;
        }
        return pointer;
      }

      // Grow in place by consuming a free right neighbor.
      let next = BlockHeader::next_physical(header);
      if (next as usize) < resolved.region.end() {
        if let Err(fault) = check_header(next, &resolved.region) {
          drop(state);
          self.die(fault);
        }

        if (*next).is_free == BLOCK_FREE && old + HEADER_SIZE + (*next).size >= eff {
          state.free_list.remove(next);
          state.total_free -= (*next).size;
          (*header).size = old + HEADER_SIZE + (*next).size;

          let merged = (*header).size;
          if merged - eff >= HEADER_SIZE + MIN_PAYLOAD {
            // Return the excess as a fresh free block.
            (*header).size = eff;

            let tail_at = (header as *mut u8).add(HEADER_SIZE + eff);
            let tail =
              BlockHeader::write(tail_at, merged - eff - HEADER_SIZE, eff, BLOCK_ALLOCATED);

            if let Err(fault) = self.insert_free_coalesced(&mut state, tail, &resolved.region)
            {
              drop(state);
              self.die(fault);
            }
          } else {
            let after = BlockHeader::next_physical(header);
            if (after as usize) < resolved.region.end() {
              (*after).prev_size = (*header).size;
            }
          }

          state.total_allocated += (*header).size - old;
          state.peak_allocated = cmp::max(state.peak_allocated, state.total_allocated);
          return pointer;
        }
      }

      drop(state);
      self.move_allocation(pointer, old, new_size)
    }
  }

  /// Allocate-copy-deallocate fallback shared by every grow path.
  unsafe fn move_allocation(
    &self,
    pointer: *mut u8,
    old_usable: usize,
    new_size: usize,
  ) -> *mut u8 {
    unsafe {
      let fresh = self.allocate(new_size);
      if fresh.is_null() {
        // last error already recorded; the old pointer stays valid.
        return ptr::null_mut();
      }

      ptr::copy_nonoverlapping(pointer, fresh, cmp::min(old_usable, new_size));
      self.deallocate(pointer);

      fresh
    }
  }

  /// Allocates `count * size` zero-filled bytes.
  ///
  /// The product is computed with an overflow check; overflow fails with
  /// [`AllocError::InvalidSize`].
  ///
  /// # Safety
  ///
  /// Same contract as [`allocate`](Self::allocate).
  pub unsafe fn allocate_zeroed(
    &self,
    count: usize,
    size: usize,
  ) -> *mut u8 {
    let Some(total) = count.checked_mul(size) else {
      self.note_failure(AllocError::InvalidSize);
      return ptr::null_mut();
    };

    unsafe {
      let pointer = self.allocate(total);
      if !pointer.is_null() {
        ptr::write_bytes(pointer, 0, total);
      }

      pointer
    }
  }

  /// Allocates `size` bytes aligned to `alignment`.
  ///
  /// `alignment` must be a power of two and `size` one of its multiples,
  /// otherwise the request fails with [`AllocError::InvalidSize`].
  ///
  /// For alignments up to 16 this is a plain allocation. Up to the page
  /// size, the block is over-allocated by `alignment - 16` and the user
  /// pointer advanced to the next boundary; the advance is recorded in a
  /// tagged word directly before the returned pointer so deallocation can
  /// recover the real header. Past the page size the request goes
  /// straight to the page-map path with an in-region aligned carve.
  ///
  /// # Safety
  ///
  /// Same contract as [`allocate`](Self::allocate).
  pub unsafe fn allocate_aligned(
    &self,
    alignment: usize,
    size: usize,
  ) -> *mut u8 {
    self.init();

    if alignment == 0 || !alignment.is_power_of_two() {
      self.note_failure(AllocError::InvalidSize);
      return ptr::null_mut();
    }
    if size == 0 || size > MAX_REQUEST || size % alignment != 0 {
      self.note_failure(AllocError::InvalidSize);
      return ptr::null_mut();
    }

    if alignment <= ALIGNMENT {
      return unsafe { self.allocate(size) };
    }

    let eff = effective_size(size);

    if alignment > self.source.page_size() {
      return unsafe { self.allocate_mapped_aligned(eff, alignment) };
    }

    unsafe {
      // Worst-case slack to the next boundary from a 16-aligned payload.
      let padded = eff + (alignment - ALIGNMENT);
      let raw = self.allocate(padded);
      if raw.is_null() {
        return raw;
      }

      let address = raw as usize;
      let aligned = align_to!(address, alignment);
      if aligned == address {
        return raw;
      }

      let offset = aligned - address;

      // Deterministic recovery: make sure the phantom "header" in front
      // of the aligned pointer can never pass a magic check, then stash
      // the tagged offset right below the pointer we hand out.
      ptr::write_bytes((aligned - ALIGNMENT) as *mut u8, 0, 8);
      ((aligned - 8) as *mut u64).write((ALIGN_TAG << 32) | offset as u64);

      aligned as *mut u8
    }
  }

  /// Aligned carve inside a dedicated mapping, for alignments past the
  /// page size.
  unsafe fn allocate_mapped_aligned(
    &self,
    eff: usize,
    alignment: usize,
  ) -> *mut u8 {
    let Some(worst) = eff.checked_add(alignment) else {
      self.note_failure(AllocError::InvalidSize);
      return ptr::null_mut();
    };

    let len = self.source.page_align(HEADER_SIZE + worst);
    let base = match self.source.map(len) {
      Ok(base) => base,
      Err(error) => {
        self.note_failure(error);
        return ptr::null_mut();
      }
    };

    let region = Region {
      base: base as usize,
      len,
      origin: RegionOrigin::PageMap,
    };
    if !self.registry.register(region) {
      unsafe { self.source.unmap(base, len) };
      self.note_failure(AllocError::OutOfMemory);
      return ptr::null_mut();
    }

    unsafe {
      let payload_at = align_to!(base as usize + HEADER_SIZE, alignment);
      let header_at = (payload_at - HEADER_SIZE) as *mut u8;
      let payload_len = region.end() - payload_at;

      let header = BlockHeader::write(header_at, payload_len, 0, BLOCK_ALLOCATED);

      let mut state = self.state.lock();
      state.total_allocated += payload_len;
      state.allocation_count += 1;
      state.peak_allocated = cmp::max(state.peak_allocated, state.total_allocated);
      drop(state);

      BlockHeader::payload(header)
    }
  }

  /// Actual payload bytes behind a live pointer: at least what was
  /// requested, always a multiple of 16.
  ///
  /// # Safety
  ///
  /// `pointer` must be null (returns 0) or a live pointer from this heap.
  pub unsafe fn usable_size(
    &self,
    pointer: *mut u8,
  ) -> usize {
    if pointer.is_null() {
      return 0;
    }
    self.init();

    unsafe {
      let resolved = match self.resolve(pointer) {
        Ok(resolved) => resolved,
        Err(fault) => self.die(fault),
      };

      if let Err(fault) = check_header(resolved.header, &resolved.region) {
        self.die(fault);
      }
      if (*resolved.header).is_free == BLOCK_FREE {
        self.die(fault(
          FatalError::DoubleFree,
          resolved.header as usize,
          "size query on a block that is already free",
        ));
      }

      (*resolved.header).size - resolved.offset
    }
  }

  /// Maps a user pointer back to its region and header, handling the
  /// tagged-offset indirection of aligned allocations.
  unsafe fn resolve(
    &self,
    pointer: *mut u8,
  ) -> Result<Resolved, Fault> {
    let address = pointer as usize;

    if address % ALIGNMENT != 0 {
      return Err(fault(
        FatalError::InvalidPointer,
        address,
        "pointer is not 16-byte aligned",
      ));
    }

    let Some(region) = self.registry.find(address) else {
      return Err(fault(
        FatalError::InvalidPointer,
        address,
        "pointer lies outside every registered region",
      ));
    };

    unsafe {
      if address >= region.base + HEADER_SIZE {
        let candidate = (address - HEADER_SIZE) as *mut BlockHeader;
        if (*candidate).magic == MAGIC {
          return Ok(Resolved {
            region,
            header: candidate,
            offset: 0,
          });
        }
      }

      // No header directly in front: an offset aligned allocation leaves
      // a tagged recovery word below the pointer instead.
      if address >= region.base + HEADER_SIZE + MIN_PAYLOAD {
        let word = ((address - 8) as *const u64).read();
        if word >> 32 == ALIGN_TAG {
          let offset = (word & 0xFFFF_FFFF) as usize;

          if offset >= MIN_PAYLOAD
            && offset % ALIGNMENT == 0
            && address - region.base >= offset + HEADER_SIZE
          {
            let header = (address - offset - HEADER_SIZE) as *mut BlockHeader;
            if (*header).magic == MAGIC {
              return Ok(Resolved {
                region,
                header,
                offset,
              });
            }
          }
        }
      }
    }

    Err(fault(
      FatalError::Corruption,
      address,
      "no valid block header in front of pointer",
    ))
  }

  // --------------------------------------------------------------------
  // Introspection and lifecycle
  // --------------------------------------------------------------------

  /// Snapshot of the heap counters.
  pub fn stats(&self) -> HeapStats {
    let state = self.state.lock();
    let mut stats = HeapStats {
      total_allocated: state.total_allocated,
      total_free: state.total_free,
      allocation_count: state.allocation_count,
      peak_allocated: state.peak_allocated,
      ..Default::default()
    };
    drop(state);

    stats.failed_allocations = self.failed_allocations.load(Ordering::Relaxed);
    stats.region_count = self.registry.count();
    stats.mapped_region_count = self.registry.count_origin(RegionOrigin::PageMap);
    stats.extend_calls = self.source.extend_calls();
    stats.map_calls = self.source.map_calls();
    stats.emergency = self.source.emergency();

    stats
  }

  /// Walks every heap-break region and the free list, verifying the
  /// structural invariants. Intended for tests and debugging at
  /// quiescence; concurrent mutators make the snapshot advisory.
  pub fn check_integrity(&self) -> IntegrityReport {
    let state = self.state.lock();
    let mut report = IntegrityReport::default();

    for index in 0..self.registry.count() {
      let Some(region) = self.registry.get(index) else {
        break;
      };
      if region.origin != RegionOrigin::HeapBreak {
        continue;
      }
      report.heap_regions += 1;

      let mut cursor = region.base;
      let mut previous_size = 0usize;
      let mut previous_free = false;
      let mut broken = false;

      while cursor < region.end() {
        let header = cursor as *mut BlockHeader;
        let state_of =
          unsafe { block::validate(header, region.base, region.end()) };

        if state_of != HeaderState::Valid {
          report.corrupt_headers += 1;
          broken = true;
          break;
        }

        unsafe {
          if (*header).prev_size != previous_size {
            report.corrupt_headers += 1;
          }

          report.blocks += 1;
          let free = (*header).is_free == BLOCK_FREE;
          if free {
            report.free_blocks += 1;
            report.free_bytes += (*header).size;
            if previous_free {
              report.adjacent_free_pairs += 1;
            }
          }

          previous_free = free;
          previous_size = (*header).size;
          cursor += HEADER_SIZE + (*header).size;
        }
      }

      if !broken && cursor != region.end() {
        report.uncovered_regions += 1;
      }
      if broken {
        report.uncovered_regions += 1;
      }
    }

    // Free-list reachability: next links enumerate exactly len nodes and
    // every prev link points back where it should.
    let mut listed = 0usize;
    let mut links_ok = true;
    let mut previous = ptr::null_mut();
    let mut node = state.free_list.head();

    while !node.is_null() && listed <= state.free_list.len() {
      unsafe {
        if (*node).magic != MAGIC || (*node).is_free != BLOCK_FREE {
          links_ok = false;
          break;
        }
        if (*BlockHeader::links(node)).prev_free != previous {
          links_ok = false;
          break;
        }

        listed += 1;
        previous = node;
        node = (*BlockHeader::links(node)).next_free;
      }
    }

    report.listed_free_blocks = listed;
    report.list_links_ok = links_ok && listed == state.free_list.len();
    report.counters_ok = report.free_bytes == state.total_free;

    report
  }

  /// Dismantles the heap state. Test harness use only.
  ///
  /// Requires that no allocations are live. Heap-break memory cannot be
  /// returned to the OS and is simply forgotten; the next allocation
  /// starts from a clean slate.
  ///
  /// # Panics
  ///
  /// Panics when live allocations remain.
  pub fn teardown(&self) {
    let mut state = self.state.lock();
    assert_eq!(
      state.allocation_count, 0,
      "teardown requires zero live allocations"
    );

    state.free_list.clear();
    state.total_allocated = 0;
    state.total_free = 0;
    state.peak_allocated = 0;
    drop(state);

    self.registry.clear();
  }
}

impl Default for Heap {
  fn default() -> Self {
    Self::new()
  }
}

/// Findings of [`Heap::check_integrity`].
#[derive(Clone, Copy, Debug, Default)]
pub struct IntegrityReport {
  pub heap_regions: usize,
  pub blocks: usize,
  pub free_blocks: usize,
  pub free_bytes: usize,
  pub listed_free_blocks: usize,
  pub adjacent_free_pairs: usize,
  pub corrupt_headers: usize,
  pub uncovered_regions: usize,
  pub list_links_ok: bool,
  pub counters_ok: bool,
}

impl IntegrityReport {
  /// True when every structural invariant held.
  pub fn ok(&self) -> bool {
    self.corrupt_headers == 0
      && self.adjacent_free_pairs == 0
      && self.uncovered_regions == 0
      && self.list_links_ok
      && self.counters_ok
      && self.free_blocks == self.listed_free_blocks
  }
}

fn pointer_address(header: *mut BlockHeader) -> usize {
  header as usize + HEADER_SIZE
}

// ----------------------------------------------------------------------
// Process-global facade
// ----------------------------------------------------------------------

static HEAP: Heap = Heap::new();

/// The process-wide heap instance behind the crate-level functions.
pub fn heap() -> &'static Heap {
  &HEAP
}

/// See [`Heap::init`].
pub fn init() {
  HEAP.init();
}

/// See [`Heap::allocate`].
///
/// # Safety
///
/// As for [`Heap::allocate`].
pub unsafe fn allocate(size: usize) -> *mut u8 {
  unsafe { HEAP.allocate(size) }
}

/// See [`Heap::deallocate`].
///
/// # Safety
///
/// As for [`Heap::deallocate`].
pub unsafe fn deallocate(pointer: *mut u8) {
  unsafe { HEAP.deallocate(pointer) }
}

/// See [`Heap::reallocate`].
///
/// # Safety
///
/// As for [`Heap::reallocate`].
pub unsafe fn reallocate(
  pointer: *mut u8,
  new_size: usize,
) -> *mut u8 {
  unsafe { HEAP.reallocate(pointer, new_size) }
}

/// See [`Heap::allocate_zeroed`].
///
/// # Safety
///
/// As for [`Heap::allocate_zeroed`].
pub unsafe fn allocate_zeroed(
  count: usize,
  size: usize,
) -> *mut u8 {
  unsafe { HEAP.allocate_zeroed(count, size) }
}

/// See [`Heap::allocate_aligned`].
///
/// # Safety
///
/// As for [`Heap::allocate_aligned`].
pub unsafe fn allocate_aligned(
  alignment: usize,
  size: usize,
) -> *mut u8 {
  unsafe { HEAP.allocate_aligned(alignment, size) }
}

/// See [`Heap::usable_size`].
///
/// # Safety
///
/// As for [`Heap::usable_size`].
pub unsafe fn usable_size(pointer: *mut u8) -> usize {
  unsafe { HEAP.usable_size(pointer) }
}

/// See [`Heap::stats`].
pub fn stats() -> HeapStats {
  HEAP.stats()
}

/// See [`Heap::install_corruption_handler`].
pub fn install_corruption_handler(handler: CorruptionHandler) {
  HEAP.install_corruption_handler(handler);
}

/// See [`Heap::teardown`]. Test harness use only.
pub fn teardown() {
  HEAP.teardown();
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::last_error;
  use std::thread;

  fn panicking_handler(
    kind: FatalError,
    address: usize,
    message: &str,
  ) -> ! {
    panic!("{kind:?} at {address:#x}: {message}");
  }

  fn xorshift(state: &mut u64) -> u64 {
    let mut x = *state;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    *state = x;
    x
  }

  #[test]
  fn zero_size_allocation_returns_null() {
    let heap = Heap::new();

    unsafe {
      assert!(heap.allocate(0).is_null());
    }
    assert_eq!(last_error(), Some(AllocError::InvalidSize));
  }

  #[test]
  fn deallocate_null_is_a_noop() {
    let heap = Heap::new();

    unsafe {
      heap.deallocate(ptr::null_mut());
    }
    assert_eq!(heap.stats().allocation_count, 0);
  }

  #[test]
  fn basic_allocation_write_and_read() {
    let heap = Heap::new();

    unsafe {
      let p = heap.allocate(mem::size_of::<u64>()) as *mut u64;
      assert!(!p.is_null());
      assert_eq!(p as usize % ALIGNMENT, 0);

      *p = 0xDEADBEEF_DEADBEEF;

      let q = heap.allocate(256) as *mut u8;
      assert!(!q.is_null());
      for i in 0..256 {
        q.add(i).write(i as u8);
      }

      assert_eq!(*p, 0xDEADBEEF_DEADBEEF);
      for i in 0..256 {
        assert_eq!(q.add(i).read(), i as u8);
      }

      heap.deallocate(q);
      heap.deallocate(p as *mut u8);
    }
  }

  #[test]
  fn usable_size_contract_holds_for_small_sizes() {
    let heap = Heap::new();

    unsafe {
      for size in 1..=64usize {
        let p = heap.allocate(size);
        assert!(!p.is_null());

        let usable = heap.usable_size(p);
        assert!(usable >= size);
        assert_eq!(usable % ALIGNMENT, 0);
        assert!(usable - size < ALIGNMENT);

        heap.deallocate(p);
      }
    }
  }

  #[test]
  fn freed_block_is_reused_for_an_equal_request() {
    let heap = Heap::new();

    unsafe {
      let p1 = heap.allocate(64);
      let p2 = heap.allocate(64);
      let p3 = heap.allocate(64);
      assert!(!p1.is_null() && !p2.is_null() && !p3.is_null());

      heap.deallocate(p2);
      let p4 = heap.allocate(64);

      assert_eq!(p4, p2);

      heap.deallocate(p1);
      heap.deallocate(p3);
      heap.deallocate(p4);
    }
  }

  #[test]
  fn freed_large_block_is_split_for_small_requests() {
    let heap = Heap::new();

    unsafe {
      let p1 = heap.allocate(1024);
      assert!(!p1.is_null());
      heap.deallocate(p1);

      let mut small = [ptr::null_mut(); 8];
      for slot in &mut small {
        *slot = heap.allocate(64);
        assert!(!slot.is_null());
      }

      // The first small allocation lands in the memory p1 occupied.
      let first = small[0] as usize;
      assert!(first >= p1 as usize && first < p1 as usize + 1024);

      for slot in small {
        heap.deallocate(slot);
      }
    }
  }

  #[test]
  fn adjacent_blocks_coalesce_in_any_free_order() {
    let heap = Heap::new();

    unsafe {
      let p1 = heap.allocate(64);
      let p2 = heap.allocate(64);
      let p3 = heap.allocate(64);

      heap.deallocate(p1);
      heap.deallocate(p3);
      heap.deallocate(p2);

      // Everything fused back into one block per region.
      let report = heap.check_integrity();
      assert!(report.ok(), "{report:?}");
      assert_eq!(report.heap_regions, 1);
      assert_eq!(report.free_blocks, 1);

      // The fused front of the chunk serves a request spanning all
      // three former payloads plus their absorbed headers.
      let q = heap.allocate(256);
      assert_eq!(q, p1);
      heap.deallocate(q);
    }
  }

  #[test]
  fn large_allocations_are_mapped_and_unmapped() {
    let heap = Heap::new();

    unsafe {
      let p = heap.allocate(256 * 1024);
      assert!(!p.is_null());
      assert_eq!(p as usize % ALIGNMENT, 0);

      let stats = heap.stats();
      assert_eq!(stats.mapped_region_count, 1);
      assert_eq!(stats.map_calls, 1);
      assert_eq!(stats.extend_calls, 0);

      // The mapping is writable end to end.
      p.write(1);
      p.add(256 * 1024 - 1).write(2);

      heap.deallocate(p);

      let stats = heap.stats();
      assert_eq!(stats.mapped_region_count, 0);
      assert_eq!(stats.region_count, 0);
      assert_eq!(stats.total_allocated, 0);
    }
  }

  #[test]
  fn map_threshold_is_exact_on_the_total_footprint() {
    let heap = Heap::new();

    unsafe {
      // Footprint exactly 128 KiB: page-map path.
      let exactly = heap.allocate(MAP_THRESHOLD - HEADER_SIZE);
      assert!(!exactly.is_null());
      assert_eq!(heap.stats().mapped_region_count, 1);
      assert_eq!(heap.stats().extend_calls, 0);
      heap.deallocate(exactly);

      // Sixteen bytes less: heap-break path.
      let below = heap.allocate(MAP_THRESHOLD - HEADER_SIZE - 16);
      assert!(!below.is_null());
      assert_eq!(heap.stats().mapped_region_count, 0);
      assert_eq!(heap.stats().extend_calls, 1);
      heap.deallocate(below);
    }
  }

  #[test]
  fn fragmented_heap_reroutes_misses_through_the_page_map() {
    let heap = Heap::new();

    unsafe {
      // One tiny allocation leaves a huge free remainder: the free share
      // is far past 0.30.
      let tiny = heap.allocate(16);
      assert!(heap.stats().fragmentation_ratio() > 0.9);

      // A request too big for the remainder but page-sized: rerouted.
      let big = heap.allocate(65472);
      assert!(!big.is_null());
      assert_eq!(heap.stats().mapped_region_count, 1);
      assert_eq!(heap.stats().extend_calls, 1);

      heap.deallocate(big);
      heap.deallocate(tiny);
    }
  }

  #[test]
  fn counters_return_to_baseline_after_free() {
    let heap = Heap::new();

    unsafe {
      let before = heap.stats();

      let p = heap.allocate(100);
      let during = heap.stats();
      assert_eq!(during.total_allocated, before.total_allocated + 112);
      assert_eq!(during.allocation_count, before.allocation_count + 1);

      heap.deallocate(p);
      let after = heap.stats();
      assert_eq!(after.total_allocated, before.total_allocated);
      assert_eq!(after.allocation_count, before.allocation_count);
    }
  }

  #[test]
  fn uniform_churn_fully_coalesces_each_region() {
    let heap = Heap::new();

    unsafe {
      let mut blocks = Vec::new();
      for _ in 0..16 {
        let p = heap.allocate(512);
        assert!(!p.is_null());
        blocks.push(p);
      }

      // Free in an interleaved order to exercise both merge directions.
      for p in blocks.iter().step_by(2) {
        heap.deallocate(*p);
      }
      for p in blocks.iter().skip(1).step_by(2) {
        heap.deallocate(*p);
      }

      let report = heap.check_integrity();
      assert!(report.ok(), "{report:?}");
      assert_eq!(report.free_blocks, report.heap_regions);

      let stats = heap.stats();
      assert_eq!(stats.total_allocated, 0);
      assert_eq!(stats.total_free, report.free_bytes);
    }
  }

  #[test]
  fn reallocate_grows_and_preserves_the_prefix() {
    let heap = Heap::new();

    unsafe {
      let p = heap.allocate(64);
      for i in 0..64u8 {
        p.add(i as usize).write(i);
      }

      let q = heap.reallocate(p, 4096);
      assert!(!q.is_null());
      for i in 0..64u8 {
        assert_eq!(q.add(i as usize).read(), i);
      }

      heap.deallocate(q);
    }
  }

  #[test]
  fn reallocate_to_a_fitting_size_keeps_the_pointer() {
    let heap = Heap::new();

    unsafe {
      let p = heap.allocate(256);

      let shrunk = heap.reallocate(p, 64);
      assert_eq!(shrunk, p);

      let same = heap.reallocate(p, heap.usable_size(p));
      assert_eq!(same, p);

      heap.deallocate(p);

      let report = heap.check_integrity();
      assert!(report.ok(), "{report:?}");
    }
  }

  #[test]
  fn reallocate_consumes_a_free_right_neighbor_in_place() {
    let heap = Heap::new();

    unsafe {
      let a = heap.allocate(64);
      let b = heap.allocate(64);
      heap.deallocate(b);

      let grown = heap.reallocate(a, 256);
      assert_eq!(grown, a);

      heap.deallocate(a);
      assert!(heap.check_integrity().ok());
    }
  }

  #[test]
  fn reallocate_null_and_zero_mirror_allocate_and_deallocate() {
    let heap = Heap::new();

    unsafe {
      let p = heap.reallocate(ptr::null_mut(), 128);
      assert!(!p.is_null());
      assert_eq!(heap.stats().allocation_count, 1);

      let gone = heap.reallocate(p, 0);
      assert!(gone.is_null());
      assert_eq!(heap.stats().allocation_count, 0);
    }
  }

  #[test]
  fn allocate_zeroed_payload_is_all_zeros() {
    let heap = Heap::new();

    unsafe {
      let p = heap.allocate_zeroed(4, 256);
      assert!(!p.is_null());

      for i in 0..1024 {
        assert_eq!(p.add(i).read(), 0);
      }

      heap.deallocate(p);
    }
  }

  #[test]
  fn allocate_zeroed_rejects_overflowing_products() {
    let heap = Heap::new();

    unsafe {
      let p = heap.allocate_zeroed(usize::MAX, 16);
      assert!(p.is_null());
    }
    assert_eq!(last_error(), Some(AllocError::InvalidSize));
  }

  #[test]
  fn aligned_allocations_respect_the_requested_boundary() {
    let heap = Heap::new();

    unsafe {
      for alignment in [32usize, 64, 256, 4096] {
        let size = alignment * 2;
        let p = heap.allocate_aligned(alignment, size);
        assert!(!p.is_null(), "alignment {alignment}");
        assert_eq!(p as usize % alignment, 0);
        assert!(heap.usable_size(p) >= size);

        // Every byte of the promised payload is writable.
        ptr::write_bytes(p, 0x5A, size);
        assert_eq!(p.add(size - 1).read(), 0x5A);

        heap.deallocate(p);
      }

      assert_eq!(heap.stats().total_allocated, 0);
      assert!(heap.check_integrity().ok());
    }
  }

  #[test]
  fn aligned_allocations_past_the_page_size_are_mapped() {
    let heap = Heap::new();
    let alignment = 32 * 1024;

    unsafe {
      let p = heap.allocate_aligned(alignment, alignment);
      assert!(!p.is_null());
      assert_eq!(p as usize % alignment, 0);
      assert_eq!(heap.stats().mapped_region_count, 1);

      heap.deallocate(p);
      assert_eq!(heap.stats().mapped_region_count, 0);
    }
  }

  #[test]
  fn aligned_allocation_argument_errors_return_null() {
    let heap = Heap::new();

    unsafe {
      assert!(heap.allocate_aligned(24, 48).is_null());
      assert_eq!(last_error(), Some(AllocError::InvalidSize));

      assert!(heap.allocate_aligned(64, 100).is_null());
      assert_eq!(last_error(), Some(AllocError::InvalidSize));

      assert!(heap.allocate_aligned(0, 64).is_null());
      assert_eq!(last_error(), Some(AllocError::InvalidSize));
    }
  }

  #[test]
  #[should_panic(expected = "DoubleFree")]
  fn double_free_is_fatal() {
    let heap = Heap::new();
    heap.install_corruption_handler(panicking_handler);

    unsafe {
      let p = heap.allocate(64);
      heap.deallocate(p);
      heap.deallocate(p);
    }
  }

  #[test]
  #[should_panic(expected = "Corruption")]
  fn clobbered_magic_is_fatal_on_free() {
    let heap = Heap::new();
    heap.install_corruption_handler(panicking_handler);

    unsafe {
      let p = heap.allocate(64);
      // Scribble over the header's magic field.
      (p.sub(16) as *mut u32).write(0);
      heap.deallocate(p);
    }
  }

  #[test]
  #[should_panic(expected = "Corruption")]
  fn buffer_overflow_into_the_next_header_is_fatal() {
    let heap = Heap::new();
    heap.install_corruption_handler(panicking_handler);

    unsafe {
      let p = heap.allocate(100);
      // Classic overflow: 200 bytes into a 100-byte allocation tramples
      // the following block's header.
      ptr::write_bytes(p, 0xCC, 200);
      heap.deallocate(p);
    }
  }

  #[test]
  #[should_panic(expected = "InvalidPointer")]
  fn foreign_pointers_are_fatal() {
    let heap = Heap::new();
    let other = Heap::new();
    heap.install_corruption_handler(panicking_handler);

    unsafe {
      let foreign = other.allocate(64);
      heap.deallocate(foreign);
    }
  }

  #[test]
  fn teardown_resets_an_idle_heap() {
    let heap = Heap::new();

    unsafe {
      let p = heap.allocate(64);
      heap.deallocate(p);
    }

    heap.teardown();

    let stats = heap.stats();
    assert_eq!(stats.total_allocated, 0);
    assert_eq!(stats.total_free, 0);
    assert_eq!(stats.region_count, 0);

    // The heap is usable again afterwards.
    unsafe {
      let p = heap.allocate(64);
      assert!(!p.is_null());
      heap.deallocate(p);
    }
  }

  #[test]
  fn concurrent_churn_leaves_a_quiescent_heap() {
    static SHARED: Heap = Heap::new();

    thread::scope(|scope| {
      for thread_index in 0..8u64 {
        scope.spawn(move || {
          let mut rng = 0x9E37_79B9_7F4A_7C15 ^ (thread_index + 1);

          for _ in 0..1000 {
            let size = (xorshift(&mut rng) % 1024 + 1) as usize;

            unsafe {
              let p = SHARED.allocate(size);
              assert!(!p.is_null());

              // Touch both ends to catch overlapping handouts.
              p.write(thread_index as u8);
              p.add(size - 1).write(thread_index as u8);
              assert_eq!(p.read(), thread_index as u8);

              SHARED.deallocate(p);
            }
          }
        });
      }
    });

    let stats = SHARED.stats();
    assert_eq!(stats.total_allocated, 0);
    assert_eq!(stats.allocation_count, 0);

    let report = SHARED.check_integrity();
    assert!(report.ok(), "{report:?}");
  }

  #[test]
  fn global_facade_round_trips() {
    init();

    unsafe {
      let p = allocate(128);
      assert!(!p.is_null());
      assert_eq!(p as usize % ALIGNMENT, 0);
      assert!(usable_size(p) >= 128);

      p.write(0xEE);
      let q = reallocate(p, 256);
      assert!(!q.is_null());
      assert_eq!(q.read(), 0xEE);

      deallocate(q);
    }

    assert!(stats().peak_allocated >= 128);
  }
}
