//! The global free list: an intrusive doubly-linked list of free blocks.
//!
//! The list owns no memory of its own. Each node *is* a free block, and the
//! `prev_free`/`next_free` links live in the block's payload (see
//! [`FreeLinks`]), so an empty heap costs one null pointer:
//!
//! ```text
//!   head ──► ┌────────┐      ┌────────┐      ┌────────┐
//!            │ block C│ ───► │ block A│ ───► │ block B│ ───► null
//!    null ◄─ │        │ ◄─── │        │ ◄─── │        │
//!            └────────┘      └────────┘      └────────┘
//! ```
//!
//! Insertion is at the head and removal is by node, both O(1). The list is
//! ordered by neither address nor size; first-fit order is simply the
//! reverse of insertion order. There are no sentinel nodes.

use std::ptr;

use crate::block::{BlockHeader, FreeLinks};

pub struct FreeList {
  head: *mut BlockHeader,
  len: usize,
}

// The raw node pointers target heap blocks owned by the enclosing heap's
// mutex, never thread-local storage.
unsafe impl Send for FreeList {}

impl FreeList {
  pub const fn new() -> Self {
    Self {
      head: ptr::null_mut(),
      len: 0,
    }
  }

  pub fn head(&self) -> *mut BlockHeader {
    self.head
  }

  pub fn len(&self) -> usize {
    self.len
  }

  pub fn is_empty(&self) -> bool {
    self.head.is_null()
  }

  /// Links a free block in at the head.
  ///
  /// # Safety
  ///
  /// `block` must be a valid free block that is not currently on the list;
  /// its first payload bytes are overwritten with the links.
  pub unsafe fn push_front(
    &mut self,
    block: *mut BlockHeader,
  ) {
    unsafe {
      let links = BlockHeader::links(block);
      (*links).prev_free = ptr::null_mut();
      (*links).next_free = self.head;

      if !self.head.is_null() {
        (*BlockHeader::links(self.head)).prev_free = block;
      }
    }

    self.head = block;
    self.len += 1;
  }

  /// Unlinks a block from anywhere in the list.
  ///
  /// # Safety
  ///
  /// `block` must currently be on this list with intact links.
  pub unsafe fn remove(
    &mut self,
    block: *mut BlockHeader,
  ) {
    unsafe {
      let links = BlockHeader::links(block);
      let prev = (*links).prev_free;
      let next = (*links).next_free;

      if prev.is_null() {
        debug_assert_eq!(self.head, block);
        self.head = next;
      } else {
        (*BlockHeader::links(prev)).next_free = next;
      }

      if !next.is_null() {
        (*BlockHeader::links(next)).prev_free = prev;
      }

      // Leave no dangling links behind in what is about to become payload.
      (*links).prev_free = ptr::null_mut();
      (*links).next_free = ptr::null_mut();
    }

    self.len -= 1;
  }

  pub fn clear(&mut self) {
    self.head = ptr::null_mut();
    self.len = 0;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::block::{BLOCK_FREE, HEADER_SIZE};

  #[repr(align(16))]
  struct Arena([u8; 2048]);

  /// Carves `count` fake free blocks of 64-byte payloads out of the arena.
  unsafe fn carve(
    arena: &mut Arena,
    count: usize,
  ) -> Vec<*mut BlockHeader> {
    let mut blocks = Vec::new();
    let mut at = arena.0.as_mut_ptr();

    for i in 0..count {
      unsafe {
        let prev_size = if i == 0 { 0 } else { 64 };
        blocks.push(BlockHeader::write(at, 64, prev_size, BLOCK_FREE));
        at = at.add(HEADER_SIZE + 64);
      }
    }

    blocks
  }

  /// Walks `next_free` from the head, collecting every node.
  unsafe fn forward_order(list: &FreeList) -> Vec<*mut BlockHeader> {
    let mut order = Vec::new();
    let mut node = list.head();

    while !node.is_null() {
      order.push(node);
      node = unsafe { (*BlockHeader::links(node)).next_free };
    }

    order
  }

  #[test]
  fn push_front_builds_reverse_insertion_order() {
    let mut arena = Arena([0; 2048]);

    unsafe {
      let blocks = carve(&mut arena, 3);
      let mut list = FreeList::new();

      for block in &blocks {
        list.push_front(*block);
      }

      assert_eq!(list.len(), 3);
      assert_eq!(forward_order(&list), vec![blocks[2], blocks[1], blocks[0]]);
    }
  }

  #[test]
  fn backward_links_reach_the_head() {
    let mut arena = Arena([0; 2048]);

    unsafe {
      let blocks = carve(&mut arena, 3);
      let mut list = FreeList::new();

      for block in &blocks {
        list.push_front(*block);
      }

      // Follow prev_free from the tail back up to the head.
      let mut node = blocks[0];
      let mut hops = 0;
      while !(*BlockHeader::links(node)).prev_free.is_null() {
        node = (*BlockHeader::links(node)).prev_free;
        hops += 1;
      }

      assert_eq!(node, list.head());
      assert_eq!(hops, 2);
    }
  }

  #[test]
  fn remove_handles_head_middle_and_tail() {
    let mut arena = Arena([0; 2048]);

    unsafe {
      let blocks = carve(&mut arena, 4);
      let mut list = FreeList::new();

      for block in &blocks {
        list.push_front(*block);
      }
      // Order is now [3, 2, 1, 0].

      list.remove(blocks[2]); // middle
      assert_eq!(forward_order(&list), vec![blocks[3], blocks[1], blocks[0]]);

      list.remove(blocks[3]); // head
      assert_eq!(forward_order(&list), vec![blocks[1], blocks[0]]);

      list.remove(blocks[0]); // tail
      assert_eq!(forward_order(&list), vec![blocks[1]]);

      list.remove(blocks[1]);
      assert!(list.is_empty());
      assert_eq!(list.len(), 0);
    }
  }

  #[test]
  fn removed_blocks_carry_no_stale_links() {
    let mut arena = Arena([0; 2048]);

    unsafe {
      let blocks = carve(&mut arena, 2);
      let mut list = FreeList::new();

      list.push_front(blocks[0]);
      list.push_front(blocks[1]);
      list.remove(blocks[1]);

      let links = BlockHeader::links(blocks[1]);
      assert!((*links).prev_free.is_null());
      assert!((*links).next_free.is_null());
    }
  }
}
