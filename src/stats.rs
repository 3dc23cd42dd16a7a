//! Heap statistics snapshot.

/// Point-in-time counters copied out of the heap under its lock.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeapStats {
  /// Payload bytes of every live allocation.
  pub total_allocated: usize,
  /// Payload bytes of every block on the free list.
  pub total_free: usize,
  /// Number of live allocations.
  pub allocation_count: usize,
  /// High-water mark of `total_allocated`.
  pub peak_allocated: usize,
  /// Operations that returned null with an error.
  pub failed_allocations: u64,
  /// Registered regions of any origin.
  pub region_count: usize,
  /// Registered page-map regions (one per live large allocation).
  pub mapped_region_count: usize,
  /// Heap-break extensions performed since startup.
  pub extend_calls: u64,
  /// Page mappings performed since startup.
  pub map_calls: u64,
  /// True once the OS source has failed ten times.
  pub emergency: bool,
}

impl HeapStats {
  /// Free share of the managed payload bytes, in `[0.0, 1.0]`.
  pub fn fragmentation_ratio(&self) -> f64 {
    let managed = self.total_allocated + self.total_free;
    if managed == 0 {
      return 0.0;
    }

    self.total_free as f64 / managed as f64
  }

  /// [`fragmentation_ratio`](Self::fragmentation_ratio) as a percentage.
  pub fn fragmentation_pct(&self) -> f64 {
    self.fragmentation_ratio() * 100.0
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn fragmentation_of_an_empty_heap_is_zero() {
    let stats = HeapStats::default();
    assert_eq!(stats.fragmentation_pct(), 0.0);
  }

  #[test]
  fn fragmentation_is_the_free_share() {
    let stats = HeapStats {
      total_allocated: 3 * 1024,
      total_free: 1024,
      ..Default::default()
    };

    assert_eq!(stats.fragmentation_ratio(), 0.25);
    assert_eq!(stats.fragmentation_pct(), 25.0);
  }
}
