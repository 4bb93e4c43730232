//! # segalloc - A Segregated-Fit Memory Allocator Library
//!
//! This crate provides a classical **boundary-tag allocator** with
//! **segregated free lists**, managing one contiguous heap obtained from an
//! sbrk-style arena.
//!
//! ## Overview
//!
//! Every block carries a header word and a mirrored footer word; free
//! blocks additionally thread themselves onto one of a fixed set of
//! doubly-linked lists, bucketed by size:
//!
//! ```text
//!   Heap (one contiguous arena):
//!
//!   ┌─────┬──────────┬─────────────┬────────┬────────┬────────┬──────────┐
//!   │ pad │ PROLOGUE │ CLASS TABLE │ alloc  │ free   │ alloc  │ EPILOGUE │
//!   │     │ sentinel │ list heads  │ block  │ block  │ block  │ sentinel │
//!   └─────┴──────────┴─────────────┴────────┴───▲────┴────────┴──────────┘
//!                          │                    │
//!                          │   class 0: ────────┘ (≤ 64 bytes)
//!                          │   class 1: null       (≤ 128)
//!                          └── …
//!                              class 7: null       (everything larger)
//!
//!   Allocation: bucket the size, first fit over the lists, split the
//!               surplus. On a miss, grow the arena by the block size.
//!   Free:       clear the alloc bit, merge with free neighbors via the
//!               boundary tags, splice onto the right list.
//! ```
//!
//! ## Crate Structure
//!
//! ```text
//!   segalloc
//!   ├── align      - Alignment macros (align!, align_to!)
//!   ├── arena      - Arena trait, SbrkArena (program break), FixedArena
//!   ├── block      - Boundary-tag words and block geometry (internal)
//!   ├── class      - Size-class staircase (internal)
//!   ├── heap       - Heap: allocate / free / reallocate
//!   └── check      - Read-only invariant walker (CheckError)
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use segalloc::{FixedArena, Heap};
//!
//! let mut heap = Heap::new(FixedArena::new(1 << 16)).expect("arena large enough");
//!
//! unsafe {
//!   let p = heap.allocate(64);
//!   assert!(!p.is_null());
//!
//!   p.write(42);
//!   assert_eq!(p.read(), 42);
//!
//!   let p = heap.reallocate(p, 1024);
//!   assert_eq!(p.read(), 42);
//!
//!   heap.free(p);
//! }
//!
//! heap.check_heap(false).expect("invariants hold");
//! ```
//!
//! Against the real program break, use [`SbrkArena`] instead (one per
//! process):
//!
//! ```rust,no_run
//! use segalloc::{Heap, SbrkArena};
//!
//! let mut heap = Heap::new(unsafe { SbrkArena::new() }).expect("sbrk available");
//! ```
//!
//! ## Design Notes
//!
//! - Payloads are aligned to the double word ([`DSIZE`]): 16 bytes on
//!   64-bit machines, 8 on 32-bit.
//! - Free-list links live inside free blocks' own payload bytes, so the
//!   registry costs no memory beyond the minimum block size.
//! - Coalescing is maximal: after every public call, no two free blocks
//!   are adjacent.
//! - The allocator is **single-threaded**; each [`Heap`] owns its arena
//!   and multiple heaps over [`FixedArena`]s can coexist in one process.
//! - Memory is never returned to the operating system.
//!
//! ## Safety
//!
//! This crate is inherently unsafe as it deals with raw memory
//! management: `allocate`, `free` and `reallocate` traffic in raw
//! pointers and require `unsafe` blocks. The crate-internal block
//! arithmetic is the unsafe core; [`Heap::check_heap`] exists to validate
//! its invariants from tests and debug builds.

pub mod align;
mod arena;
mod block;
mod check;
mod class;
mod heap;

pub use arena::{Arena, FixedArena, SbrkArena};
pub use block::{DSIZE, MIN_BLOCK, WSIZE};
pub use check::CheckError;
pub use heap::Heap;
