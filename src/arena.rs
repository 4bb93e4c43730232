//! Heap arenas: where the allocator's backing bytes come from.
//!
//! The allocator only ever asks its arena one question: "give me `n` more
//! contiguous bytes at the end of the heap". [`SbrkArena`] answers by
//! moving the program break, the way a classical `malloc` does;
//! [`FixedArena`] answers from a region reserved up front, which is what
//! lets the tests run many independent heaps in one process and hit
//! out-of-memory deterministically.

use std::alloc;
use std::ptr;

use libc::{c_void, intptr_t, sbrk};

use crate::block::DSIZE;
use crate::{align, align_to};

/// A provider of contiguous heap memory.
///
/// # Safety
///
/// Implementors must guarantee that a successful `extend(n)` returns `n`
/// writable bytes starting exactly at the previous heap end, that the
/// region stays valid and unaliased by anything else for the arena's
/// lifetime, and that `lo()`/`hi()` bound every byte handed out so far.
/// The allocator builds all of its pointer arithmetic on these promises.
pub unsafe trait Arena {
  /// Grows the heap by `n_bytes` and returns the address where the new
  /// bytes begin, or `None` if the arena cannot grow. A failed call must
  /// leave the heap bounds unchanged.
  fn extend(
    &mut self,
    n_bytes: usize,
  ) -> Option<*mut u8>;

  /// First byte of the managed region.
  fn lo(&self) -> *mut u8;

  /// One past the last byte of the managed region.
  fn hi(&self) -> *mut u8;
}

/// Arena backed by the program break, grown with `sbrk(2)`.
///
/// The first extension also swallows whatever padding brings the break to
/// the double-word boundary; every allocator request is a multiple of
/// [`DSIZE`], so the break stays aligned from then on.
pub struct SbrkArena {
  lo: *mut u8,
  hi: *mut u8,
}

impl SbrkArena {
  /// Creates the process-wide sbrk arena.
  ///
  /// # Safety
  ///
  /// At most one `SbrkArena` may be live in a process, and nothing else
  /// may move the program break while it is. A second break mover would
  /// tear the contiguity that `extend` promises.
  pub unsafe fn new() -> Self {
    Self {
      lo: ptr::null_mut(),
      hi: ptr::null_mut(),
    }
  }
}

unsafe impl Arena for SbrkArena {
  fn extend(
    &mut self,
    n_bytes: usize,
  ) -> Option<*mut u8> {
    let brk = unsafe { sbrk(0) } as usize;
    let pad = align_to!(brk, DSIZE) - brk;

    // A request near usize::MAX would wrap into a negative increment and
    // shrink the break instead of failing.
    let total = pad.checked_add(n_bytes)?;
    if total > isize::MAX as usize {
      return None;
    }

    let raw = unsafe { sbrk(total as intptr_t) };
    if raw == usize::MAX as *mut c_void {
      // sbrk reports failure as (void*)-1
      return None;
    }

    let start = unsafe { (raw as *mut u8).add(pad) };
    if !self.hi.is_null() && start != self.hi {
      // Something else moved the break since the last extension; the new
      // bytes do not continue our tiling and must not be used.
      return None;
    }

    if self.lo.is_null() {
      self.lo = start;
    }
    self.hi = unsafe { start.add(n_bytes) };

    Some(start)
  }

  fn lo(&self) -> *mut u8 {
    self.lo
  }

  fn hi(&self) -> *mut u8 {
    self.hi
  }
}

/// Arena carved from a single region reserved up front.
///
/// `extend` serves the region front to back and fails once it is
/// exhausted, which is how the out-of-memory paths are exercised without
/// touching the real program break.
pub struct FixedArena {
  base: *mut u8,
  layout: alloc::Layout,
  used: usize,
}

impl FixedArena {
  /// Reserves `capacity` bytes, rounded up to the double word.
  ///
  /// # Panics
  ///
  /// Panics if the rounded capacity cannot be described by an allocation
  /// layout, and aborts on allocation failure of the backing region.
  pub fn new(capacity: usize) -> Self {
    let capacity = align!(capacity.max(DSIZE));
    let layout = alloc::Layout::from_size_align(capacity, DSIZE)
      .expect("arena capacity must fit an allocation layout");

    let base = unsafe { alloc::alloc(layout) };
    if base.is_null() {
      alloc::handle_alloc_error(layout);
    }

    Self {
      base,
      layout,
      used: 0,
    }
  }
}

unsafe impl Arena for FixedArena {
  fn extend(
    &mut self,
    n_bytes: usize,
  ) -> Option<*mut u8> {
    if n_bytes == 0 || n_bytes > self.layout.size() - self.used {
      return None;
    }

    let start = unsafe { self.base.add(self.used) };
    self.used += n_bytes;

    Some(start)
  }

  fn lo(&self) -> *mut u8 {
    self.base
  }

  fn hi(&self) -> *mut u8 {
    unsafe { self.base.add(self.used) }
  }
}

impl Drop for FixedArena {
  fn drop(&mut self) {
    unsafe { alloc::dealloc(self.base, self.layout) };
  }
}
