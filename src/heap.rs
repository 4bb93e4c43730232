//! # Segregated-Fit Heap
//!
//! The allocator proper: boundary-tag blocks tiled over one contiguous
//! arena, indexed by an array of segregated free lists.
//!
//! ## Heap layout
//!
//! ```text
//!            low addresses                                high addresses
//!   ┌─────┬──────────────┬─────────────────┬─────────────────┬──────────┐
//!   │ pad │   PROLOGUE   │   CLASS TABLE   │ regular blocks… │ EPILOGUE │
//!   │     │ hdr+ftr      │ one allocated   │ allocated and   │ hdr only │
//!   │     │ (DSIZE, 1)   │ block holding   │ free blocks,    │ (0, 1)   │
//!   │     │              │ the list heads  │ maximally       │          │
//!   │     │              │                 │ coalesced       │          │
//!   └─────┴──────────────┴─────────────────┴─────────────────┴──────────┘
//! ```
//!
//! The prologue and epilogue are synthetic allocated sentinels: every
//! coalesce can read its neighbors' tags without caring whether it sits at
//! a heap end. The class table (one head word per size class) is itself
//! an ordinary allocated block, so address-order walks cross it like any
//! other block and it can never be merged away.
//!
//! ## Operation flow
//!
//! ```text
//!   allocate(size)                          free(bp)
//!   ──────────────                          ────────
//!   adjust to block size                    clear alloc bit
//!        │                                  coalesce with neighbors
//!        ▼                                  insert merged block
//!   first fit over the lists,
//!   smallest eligible class first ──┐       reallocate(bp, size)
//!        │ hit                      │ miss  ────────────────────
//!        ▼                          ▼       shrink in place, or
//!   place: split when the     extend arena  absorb a free right
//!   remainder can stand       by the block  neighbor, or grow at
//!   alone, re-list the tail   size, merge   the heap tail, or
//!        │                    with old tail relocate + copy
//!        ▼                          │
//!   payload pointer  ◄──────────────┘
//! ```
//!
//! A free block's `prev`/`next` list links live inside its own payload
//! bytes, so the registry costs nothing beyond the minimum block size.
//! Unlinking is O(1); no list is ever scanned to remove a block.
//!
//! ## Safety
//!
//! The whole module is raw pointer arithmetic over arena bytes: the
//! classical unsafe core. The public methods are `unsafe fn`s handing out
//! raw payloads, as a malloc does. Callers promise to free only what this
//! heap allocated, at most once, and to stop using payloads after freeing
//! them. The allocator never detects misuse; `check_heap` exists to
//! diagnose the aftermath.

use std::ptr;

use log::{debug, trace};

use crate::align_to;
use crate::arena::Arena;
use crate::block::{
  DSIZE, MIN_BLOCK, WSIZE, block_size, footer, get, header, is_allocated, link_next, link_prev,
  next_block, pack, prev_block, put, set_link_next, set_link_prev, tag_alloc, tag_size,
};
use crate::class::{NUM_CLASSES, class_of};

/// Bytes of free space seeded right after the sentinels, so small
/// workloads never go back to the arena.
const CHUNK: usize = 1 << 12;

/// Converts a payload request into a block size: header and footer are
/// added, the result is rounded up to the double word, and the minimum
/// block size is enforced. `None` when the request is too large to
/// represent.
fn adjust(size: usize) -> Option<usize> {
  if size <= DSIZE {
    Some(MIN_BLOCK)
  } else {
    let padded = size.checked_add(DSIZE + (DSIZE - 1))?;
    Some(padded & !(DSIZE - 1))
  }
}

/// A segregated-fit allocator over one [`Arena`].
///
/// Each `Heap` owns its arena outright, so independent heaps can coexist
/// in one process (the tests run dozens). All bookkeeping beyond these
/// four fields lives inside the arena itself, encoded in boundary tags
/// and in-payload list links.
pub struct Heap<A: Arena> {
  /// Backing arena; the only source of new heap bytes.
  pub(crate) arena: A,

  /// Payload pointer of the prologue sentinel; anchor for heap walks.
  pub(crate) prologue: *mut u8,

  /// Base of the in-heap class table, one head word per size class.
  pub(crate) heads: *mut u8,

  /// Adjusted size of the last request that missed every free list, or
  /// zero. A request of the same size skips the search and grows the
  /// heap directly; freeing a block of this size clears the field.
  last_miss: usize,
}

impl<A: Arena> Heap<A> {
  /// Brings up an empty heap on `arena`: alignment pad, prologue,
  /// class table, epilogue, and one seeded free region of `CHUNK`
  /// bytes.
  ///
  /// Returns `None` if the arena cannot cover initialization; no partial
  /// heap escapes in that case.
  pub fn new(mut arena: A) -> Option<Self> {
    unsafe {
      // Sentinel carve: pad word, prologue header/footer, epilogue header.
      let base = arena.extend(4 * WSIZE)?;
      put(base, 0);
      put(base.add(WSIZE), pack(DSIZE, true));
      put(base.add(2 * WSIZE), pack(DSIZE, true));
      put(base.add(3 * WSIZE), pack(0, true));
      let prologue = base.add(2 * WSIZE);

      // The class table is an ordinary allocated block: its header
      // overwrites the old epilogue, and a fresh epilogue closes the heap
      // after its footer.
      let table_size = (NUM_CLASSES + 2) * WSIZE;
      let heads = arena.extend(table_size)?;
      put(header(heads), pack(table_size, true));
      put(footer(heads), pack(table_size, true));
      put(header(next_block(heads)), pack(0, true));
      ptr::write_bytes(heads, 0, NUM_CLASSES * WSIZE);

      let mut heap = Self {
        arena,
        prologue,
        heads,
        last_miss: 0,
      };

      heap.extend_heap(CHUNK / WSIZE)?;

      debug!(
        "heap up: prologue={:p}, class table={:p}, seed={} bytes",
        prologue, heads, CHUNK
      );

      Some(heap)
    }
  }

  /// The backing arena.
  pub fn arena(&self) -> &A {
    &self.arena
  }

  /// Head of the free list for `class`, or null when the list is empty.
  pub(crate) unsafe fn head(
    &self,
    class: usize,
  ) -> *mut u8 {
    unsafe { get(self.heads.add(class * WSIZE)) as *mut u8 }
  }

  unsafe fn set_head(
    &mut self,
    class: usize,
    bp: *mut u8,
  ) {
    unsafe { put(self.heads.add(class * WSIZE), bp as usize) }
  }

  /// Splices the free block `bp` at the head of the list for its size.
  unsafe fn insert(
    &mut self,
    bp: *mut u8,
  ) {
    unsafe {
      let class = class_of(block_size(bp));
      let old_head = self.head(class);

      set_link_prev(bp, ptr::null_mut());
      set_link_next(bp, old_head);
      if !old_head.is_null() {
        set_link_prev(old_head, bp);
      }
      self.set_head(class, bp);
    }
  }

  /// Removes the free block `bp` from its list in O(1) by patching its
  /// neighbors' embedded links.
  unsafe fn unlink(
    &mut self,
    bp: *mut u8,
  ) {
    unsafe {
      let class = class_of(block_size(bp));
      let prev = link_prev(bp);
      let next = link_next(bp);

      if prev.is_null() {
        self.set_head(class, next);
      } else {
        set_link_next(prev, next);
      }
      if !next.is_null() {
        set_link_prev(next, prev);
      }
    }
  }

  /// First-fit search: scan the list for the class of `asize`, then every
  /// larger class, and return the first block big enough.
  unsafe fn find_fit(
    &self,
    asize: usize,
  ) -> Option<*mut u8> {
    unsafe {
      for class in class_of(asize)..NUM_CLASSES {
        let mut bp = self.head(class);
        while !bp.is_null() {
          if block_size(bp) >= asize {
            return Some(bp);
          }
          bp = link_next(bp);
        }
      }
      None
    }
  }

  /// Grows the heap by `n_words` words (rounded up to an even count to
  /// keep double-word alignment), stamps the fresh bytes as one free
  /// block, and rewrites the epilogue at the new tail. The block is
  /// merged with a free old tail and inserted into its list; the merged
  /// payload is returned.
  unsafe fn extend_heap(
    &mut self,
    n_words: usize,
  ) -> Option<*mut u8> {
    unsafe {
      let size = align_to!(n_words, 2) * WSIZE;
      let bp = self.arena.extend(size)?;
      trace!("extend: {size} bytes at {bp:p}");

      // The new bytes begin where the old epilogue header sat, so the old
      // epilogue payload address is the new block's payload.
      put(header(bp), pack(size, false));
      put(footer(bp), pack(size, false));
      put(header(next_block(bp)), pack(0, true));

      Some(self.coalesce(bp))
    }
  }

  /// Merges the free block `bp` with any free neighbor, inserts the
  /// result into its list, and returns its payload. `bp` must carry free
  /// header/footer tags and must not be on any list yet.
  ///
  /// The four boundary-tag cases, keyed on the neighbors' alloc bits:
  ///
  /// ```text
  ///   prev  next      action
  ///   ───── ─────     ─────────────────────────────────────────────
  ///   alloc alloc     insert bp as-is
  ///   alloc free      absorb next (unlink it), grow forward
  ///   free  alloc     absorbed by prev (unlink it), grow backward
  ///   free  free      both neighbors unlinked, one block spans all
  /// ```
  unsafe fn coalesce(
    &mut self,
    bp: *mut u8,
  ) -> *mut u8 {
    unsafe {
      // The word below the payload is the previous block's footer; the
      // prologue guarantees it exists.
      let prev_alloc = tag_alloc(get(bp.sub(DSIZE)));
      let next = next_block(bp);
      let next_alloc = is_allocated(next);
      let mut size = block_size(bp);

      let merged = match (prev_alloc, next_alloc) {
        (true, true) => bp,

        (true, false) => {
          self.unlink(next);
          size += block_size(next);
          put(header(bp), pack(size, false));
          put(footer(bp), pack(size, false));
          bp
        }

        (false, true) => {
          let prev = prev_block(bp);
          self.unlink(prev);
          size += block_size(prev);
          put(header(prev), pack(size, false));
          put(footer(prev), pack(size, false));
          prev
        }

        (false, false) => {
          let prev = prev_block(bp);
          self.unlink(prev);
          self.unlink(next);
          size += block_size(prev) + block_size(next);
          put(header(prev), pack(size, false));
          put(footer(prev), pack(size, false));
          prev
        }
      };

      self.insert(merged);
      merged
    }
  }

  /// Installs an allocated block of `asize` bytes at the start of the
  /// free block `bp`, unlinking it first. When the remainder can stand
  /// alone as a block, it is split off high and re-listed; otherwise the
  /// whole block is consumed.
  unsafe fn place(
    &mut self,
    bp: *mut u8,
    asize: usize,
  ) -> *mut u8 {
    unsafe {
      let csize = block_size(bp);
      debug_assert!(csize >= asize);

      self.unlink(bp);

      if csize - asize >= MIN_BLOCK {
        put(header(bp), pack(asize, true));
        put(footer(bp), pack(asize, true));

        let tail = next_block(bp);
        put(header(tail), pack(csize - asize, false));
        put(footer(tail), pack(csize - asize, false));
        self.insert(tail);
      } else {
        put(header(bp), pack(csize, true));
        put(footer(bp), pack(csize, true));
      }

      bp
    }
  }

  /// Allocates `size` bytes and returns the payload pointer, aligned to
  /// [`DSIZE`]. Null when `size` is zero or the arena cannot cover the
  /// request; the heap is unchanged in either case.
  ///
  /// # Safety
  ///
  /// The returned memory is uninitialized, and the pointer must not be
  /// used after it is freed or after the heap is dropped.
  pub unsafe fn allocate(
    &mut self,
    size: usize,
  ) -> *mut u8 {
    if size == 0 {
      return ptr::null_mut();
    }

    let asize = match adjust(size) {
      Some(asize) => asize,
      None => return ptr::null_mut(),
    };

    unsafe {
      // A request that just missed every list will miss again; skip the
      // search and go straight to the arena.
      if asize != self.last_miss {
        if let Some(bp) = self.find_fit(asize) {
          return self.place(bp, asize);
        }
      }

      self.last_miss = asize;
      match self.extend_heap(asize / WSIZE) {
        Some(bp) => self.place(bp, asize),
        None => {
          trace!("allocate({size}): arena exhausted");
          ptr::null_mut()
        }
      }
    }
  }

  /// Releases the block behind `bp` and merges it with any free
  /// neighbor. Null is a no-op.
  ///
  /// # Safety
  ///
  /// `bp` must be null or a payload pointer obtained from this heap's
  /// `allocate`/`reallocate` and not freed since.
  pub unsafe fn free(
    &mut self,
    bp: *mut u8,
  ) {
    if bp.is_null() {
      return;
    }

    unsafe {
      let size = block_size(bp);
      put(header(bp), pack(size, false));
      put(footer(bp), pack(size, false));

      // A block of the sticky miss size just came back; the next request
      // of that size must search again.
      if size == self.last_miss {
        self.last_miss = 0;
      }

      self.coalesce(bp);
    }
  }

  /// Resizes the block behind `bp` to `size` bytes, in place when it
  /// can: shrinking splits the surplus back to the lists, growing first
  /// tries to absorb a free right neighbor, then to take fresh bytes
  /// when the block already borders the epilogue, and only then
  /// relocates, copying the old payload.
  ///
  /// `reallocate(null, size)` behaves as `allocate(size)`;
  /// `reallocate(bp, 0)` frees `bp` and returns null. On failure null is
  /// returned and the original block is left intact.
  ///
  /// # Safety
  ///
  /// Same contract as [`Heap::free`] for `bp`; the returned pointer
  /// replaces it.
  pub unsafe fn reallocate(
    &mut self,
    bp: *mut u8,
    size: usize,
  ) -> *mut u8 {
    unsafe {
      if size == 0 {
        self.free(bp);
        return ptr::null_mut();
      }
      if bp.is_null() {
        return self.allocate(size);
      }

      let asize = match adjust(size) {
        Some(asize) => asize,
        None => return ptr::null_mut(),
      };
      let old = block_size(bp);

      if asize <= old {
        // Shrink in place; the tail goes back to the lists when it can
        // stand alone, merging with a free right neighbor on the way.
        if old - asize >= MIN_BLOCK {
          put(header(bp), pack(asize, true));
          put(footer(bp), pack(asize, true));

          let tail = next_block(bp);
          put(header(tail), pack(old - asize, false));
          put(footer(tail), pack(old - asize, false));
          self.coalesce(tail);
        }
        return bp;
      }

      let next = next_block(bp);
      let next_tag = get(header(next));

      // A free right neighbor big enough lets the block grow without
      // moving.
      if !tag_alloc(next_tag) && old + tag_size(next_tag) >= asize {
        let total = old + tag_size(next_tag);
        self.unlink(next);

        if total - asize >= MIN_BLOCK {
          put(header(bp), pack(asize, true));
          put(footer(bp), pack(asize, true));

          let tail = next_block(bp);
          put(header(tail), pack(total - asize, false));
          put(footer(tail), pack(total - asize, false));
          self.insert(tail);
        } else {
          put(header(bp), pack(total, true));
          put(footer(bp), pack(total, true));
        }
        return bp;
      }

      // At the heap tail only the missing bytes are needed; the block
      // then swallows them and the epilogue moves out.
      if tag_size(next_tag) == 0 {
        let delta = asize - old;
        if self.arena.extend(delta).is_none() {
          return ptr::null_mut();
        }
        put(header(bp), pack(asize, true));
        put(footer(bp), pack(asize, true));
        put(header(next_block(bp)), pack(0, true));
        return bp;
      }

      // Relocate: fresh block, payload copy, release the old block.
      let new_bp = self.allocate(size);
      if new_bp.is_null() {
        return ptr::null_mut();
      }
      ptr::copy_nonoverlapping(bp, new_bp, old - DSIZE);
      self.free(bp);

      new_bp
    }
  }
}
