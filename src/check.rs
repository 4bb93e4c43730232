//! Read-only heap consistency checking.
//!
//! [`Heap::check_heap`] walks the block tiling from the prologue to the
//! epilogue and then sweeps the segregated lists, verifying the structural
//! invariants the allocator promises between public calls:
//!
//! - prologue and epilogue sentinel words are intact
//! - the class table is the first block and permanently allocated
//! - the tiling is gapless, in bounds, and ends exactly at the epilogue
//! - every header equals its footer, every size is legal, every payload
//!   is double-word aligned
//! - no two free blocks are adjacent (coalescing is maximal)
//! - every listed block is free, sized for its list, doubly linked both
//!   ways, and the list population matches the free blocks seen on the
//!   address-order walk
//!
//! The walker never mutates the heap, so it can run between any two
//! operations; the tests run it after every public call. It is diagnostic
//! only: caller misuse (double free, stray pointer writes) is detected
//! after the fact at best.

use std::fmt;
use std::ptr;

use log::debug;

use crate::arena::Arena;
use crate::block::{
  DSIZE, MIN_BLOCK, WSIZE, block_size, footer, get, header, is_allocated, link_next, link_prev,
  next_block, pack, tag_alloc, tag_size,
};
use crate::class::{NUM_CLASSES, class_of};
use crate::heap::Heap;

/// A violated structural invariant, reported with the payload address of
/// the offending block where there is one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckError {
  /// Prologue header or footer no longer reads `(DSIZE, allocated)`.
  BadPrologue,
  /// The class table is not the first block, or is no longer allocated.
  BadClassTable,
  /// The epilogue header is missing or not the heap's last word.
  BadEpilogue,
  /// A block walk left the arena bounds.
  OutOfBounds(usize),
  /// A payload address off the double-word boundary.
  MisalignedPayload(usize),
  /// A block size below the minimum or off the double word.
  BadBlockSize(usize),
  /// Header and footer of one block disagree.
  HeaderFooterMismatch(usize),
  /// Two free blocks touch; a coalesce was missed.
  AdjacentFreeBlocks(usize),
  /// An allocated block sits on a free list.
  AllocatedOnFreeList(usize),
  /// A free block sits on the list of the wrong size class.
  WrongClass(usize),
  /// A list's embedded prev/next links disagree with each other.
  BrokenLink(usize),
  /// List population and walked free-block count differ.
  FreeCountMismatch {
    /// Free blocks seen on the address-order walk.
    walked: usize,
    /// Blocks reachable over the segregated lists.
    listed: usize,
  },
}

impl fmt::Display for CheckError {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    match self {
      Self::BadPrologue => write!(f, "prologue sentinel corrupted"),
      Self::BadClassTable => write!(f, "class table block corrupted"),
      Self::BadEpilogue => write!(f, "epilogue sentinel corrupted or misplaced"),
      Self::OutOfBounds(at) => write!(f, "block at {at:#x} leaves the heap bounds"),
      Self::MisalignedPayload(at) => write!(f, "payload at {at:#x} is misaligned"),
      Self::BadBlockSize(at) => write!(f, "block at {at:#x} has an illegal size"),
      Self::HeaderFooterMismatch(at) => write!(f, "header/footer mismatch at {at:#x}"),
      Self::AdjacentFreeBlocks(at) => write!(f, "uncoalesced free neighbors at {at:#x}"),
      Self::AllocatedOnFreeList(at) => write!(f, "allocated block at {at:#x} on a free list"),
      Self::WrongClass(at) => write!(f, "free block at {at:#x} on the wrong list"),
      Self::BrokenLink(at) => write!(f, "inconsistent list links at {at:#x}"),
      Self::FreeCountMismatch { walked, listed } => {
        write!(f, "{walked} free blocks in the heap, {listed} on the lists")
      }
    }
  }
}

impl std::error::Error for CheckError {}

impl<A: Arena> Heap<A> {
  /// Walks the whole heap and the free lists, verifying every structural
  /// invariant. With `verbose` set, each block is logged at debug level
  /// on the way.
  pub fn check_heap(
    &self,
    verbose: bool,
  ) -> Result<(), CheckError> {
    unsafe {
      let lo = self.arena.lo() as usize;
      let hi = self.arena.hi() as usize;

      let prologue_tag = pack(DSIZE, true);
      if get(header(self.prologue)) != prologue_tag || get(self.prologue) != prologue_tag {
        return Err(CheckError::BadPrologue);
      }

      let table = next_block(self.prologue);
      if table != self.heads || !is_allocated(table) {
        return Err(CheckError::BadClassTable);
      }

      // Address-order walk: prologue to epilogue, every block checked.
      let mut bp = table;
      let mut walked = 0usize;
      let mut prev_free = false;

      loop {
        let at = bp as usize;
        // The epilogue payload sits exactly at hi, so the walk may touch
        // hi itself; only the header word below must stay in bounds.
        if at < lo + 2 * WSIZE || at > hi {
          return Err(CheckError::OutOfBounds(at));
        }

        let tag = get(header(bp));
        if tag_size(tag) == 0 {
          break;
        }

        if at % DSIZE != 0 {
          return Err(CheckError::MisalignedPayload(at));
        }

        let size = tag_size(tag);
        if size < MIN_BLOCK || size % DSIZE != 0 {
          return Err(CheckError::BadBlockSize(at));
        }
        if at - WSIZE + size > hi {
          return Err(CheckError::OutOfBounds(at));
        }
        if tag != get(footer(bp)) {
          return Err(CheckError::HeaderFooterMismatch(at));
        }

        let free = !tag_alloc(tag);
        if free && prev_free {
          return Err(CheckError::AdjacentFreeBlocks(at));
        }

        if verbose {
          debug!(
            "{at:#x}: size={size} {}",
            if free { "free" } else { "allocated" }
          );
        }

        walked += free as usize;
        prev_free = free;
        bp = next_block(bp);
      }

      // The epilogue must be the heap's last word: the tiling covers the
      // arena exactly.
      if get(header(bp)) != pack(0, true) || header(bp) as usize != hi - WSIZE {
        return Err(CheckError::BadEpilogue);
      }

      // List sweep: membership, class fit, link integrity. The count
      // comparison closes the loop with the walk above; a free block on
      // no list (or on two) cannot balance.
      let mut listed = 0usize;

      for class in 0..NUM_CLASSES {
        let mut prev = ptr::null_mut();
        let mut bp = self.head(class);

        while !bp.is_null() {
          let at = bp as usize;
          if at < lo || at >= hi {
            return Err(CheckError::OutOfBounds(at));
          }
          if is_allocated(bp) {
            return Err(CheckError::AllocatedOnFreeList(at));
          }
          if class_of(block_size(bp)) != class {
            return Err(CheckError::WrongClass(at));
          }
          if link_prev(bp) != prev {
            return Err(CheckError::BrokenLink(at));
          }

          listed += 1;
          if listed > walked {
            // More list entries than free blocks exist; bail before a
            // corrupted link cycles forever.
            return Err(CheckError::FreeCountMismatch { walked, listed });
          }

          prev = bp;
          bp = link_next(bp);
        }
      }

      if listed != walked {
        return Err(CheckError::FreeCountMismatch { walked, listed });
      }

      Ok(())
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::arena::FixedArena;
  use crate::block::put;

  fn checked_heap() -> Heap<FixedArena> {
    Heap::new(FixedArena::new(1 << 16)).expect("arena covers initialization")
  }

  #[test]
  fn fresh_heap_passes() {
    let heap = checked_heap();
    heap.check_heap(false).unwrap();
  }

  #[test]
  fn verbose_walk_passes_after_traffic() {
    let mut heap = checked_heap();

    unsafe {
      let p = heap.allocate(100);
      let q = heap.allocate(2000);
      heap.free(p);
      let r = heap.reallocate(q, 300);
      heap.check_heap(true).unwrap();
      heap.free(r);
      heap.check_heap(true).unwrap();
    }
  }

  #[test]
  fn detects_a_torn_footer() {
    let mut heap = checked_heap();

    unsafe {
      let p = heap.allocate(100);
      put(footer(p), pack(block_size(p), false));

      assert_eq!(
        heap.check_heap(false),
        Err(CheckError::HeaderFooterMismatch(p as usize))
      );
    }
  }

  #[test]
  fn detects_an_allocated_block_on_a_list() {
    let mut heap = checked_heap();

    unsafe {
      let p = heap.allocate(100);
      heap.free(p);

      // Flip the freed block's tags to "allocated" while it is still
      // listed.
      let size = block_size(p);
      put(header(p), pack(size, true));
      put(footer(p), pack(size, true));

      assert!(matches!(
        heap.check_heap(false),
        Err(CheckError::AllocatedOnFreeList(_))
      ));
    }
  }

  #[test]
  fn detects_uncoalesced_neighbors() {
    let mut heap = checked_heap();

    unsafe {
      let p = heap.allocate(100);
      let _q = heap.allocate(100); // fences the hole off the seed remainder
      heap.free(p);

      // Split the listed hole into two free blocks behind the registry's
      // back: the walk sees neighbors a coalesce should have merged.
      let half = block_size(p) / 2;
      put(header(p), pack(half, false));
      put(footer(p), pack(half, false));
      put(header(p.add(half)), pack(half, false));
      put(footer(p.add(half)), pack(half, false));

      assert_eq!(
        heap.check_heap(false),
        Err(CheckError::AdjacentFreeBlocks(p.add(half) as usize))
      );
    }
  }

  #[test]
  fn detects_a_block_on_the_wrong_list() {
    let mut heap = checked_heap();

    unsafe {
      let p = heap.allocate(100);
      let _q = heap.allocate(100); // fences the hole off the seed remainder
      heap.free(p);

      // Shrink the listed hole and stamp its other half as allocated: the
      // tiling stays sound, but the hole now sits on the list of a class
      // it no longer belongs to.
      let half = block_size(p) / 2;
      put(header(p), pack(half, false));
      put(footer(p), pack(half, false));
      put(header(p.add(half)), pack(half, true));
      put(footer(p.add(half)), pack(half, true));

      assert_eq!(
        heap.check_heap(false),
        Err(CheckError::WrongClass(p as usize))
      );
    }
  }
}
