use libc::sbrk;
use segalloc::{DSIZE, Heap, SbrkArena};

/// Pauses the walkthrough so the process can be inspected from outside
/// (`pmap <pid>`, `/proc/<pid>/maps`, a debugger) before the next step
/// runs.
fn pause() {
  println!("\n>>> ENTER to continue");
  let mut line = String::new();
  let _ = std::io::stdin().read_line(&mut line);
}

/// Shows where the program break currently sits.
fn show_break(step: &str) {
  // sbrk(0) queries the break without moving it.
  let brk = unsafe { sbrk(0) };
  println!("[{step}] break = {brk:?} (pid {})", std::process::id());
}

fn main() {
  // RUST_LOG=debug shows the allocator's own diagnostics, including the
  // full block walk of check_heap at the end.
  env_logger::init();

  // One segregated-fit heap over the real program break. The unsafe
  // contract: this process has exactly one break mover, and it's us.
  let mut heap = match Heap::new(unsafe { SbrkArena::new() }) {
    Some(heap) => heap,
    None => {
      eprintln!("could not bring the heap up (sbrk failed)");
      return;
    }
  };

  unsafe {
    show_break("start");
    pause();

    // --------------------------------------------------------------------
    // 1) Allocate 64 bytes and write through the pointer.
    // --------------------------------------------------------------------
    let first_block = heap.allocate(64);
    println!("\n[1] allocate(64) = {:?}", first_block);
    println!(
      "[1] aligned to DSIZE={}? addr % {} = {}",
      DSIZE,
      DSIZE,
      first_block as usize % DSIZE
    );

    let first_ptr = first_block as *mut u64;
    first_ptr.write(0xDEADBEEF);
    println!("[1] value written = 0x{:X}", first_ptr.read());

    pause();

    // --------------------------------------------------------------------
    // 2) Allocate 200 bytes next to it.
    // --------------------------------------------------------------------
    let second_block = heap.allocate(200);
    println!("\n[2] allocate(200) = {:?}", second_block);
    std::ptr::write_bytes(second_block, 0xAB, 200);
    println!("[2] initialized the block with 0xAB");

    pause();

    // --------------------------------------------------------------------
    // 3) Free the first block, then allocate the same size again.
    //    The segregated first fit hands the hole right back.
    // --------------------------------------------------------------------
    heap.free(first_block);
    println!("\n[3] freed the first block at {:?}", first_block);

    let third_block = heap.allocate(64);
    println!("[3] allocate(64) again = {:?}", third_block);
    println!(
      "[3] third_block == first_block? {}",
      if third_block == first_block {
        "Yes, the freed block was reused"
      } else {
        "No, it was placed somewhere else"
      }
    );

    pause();

    // --------------------------------------------------------------------
    // 4) Grow the 200-byte block. Its right neighbor decides whether it
    //    can stay in place or has to move with a payload copy.
    // --------------------------------------------------------------------
    let grown = heap.reallocate(second_block, 2000);
    println!("\n[4] reallocate(200 -> 2000) = {:?}", grown);
    println!(
      "[4] moved? {}, first byte still 0x{:X}",
      if grown == second_block { "no" } else { "yes" },
      grown.read()
    );

    pause();

    // --------------------------------------------------------------------
    // 5) Allocate a large block to watch the break move.
    // --------------------------------------------------------------------
    show_break("before large alloc");

    let big_block = heap.allocate(64 * 1024);
    println!("\n[5] allocate(64 KiB) = {:?}", big_block);

    show_break("after large alloc");
    pause();

    // --------------------------------------------------------------------
    // 6) Walk the whole heap and verify every invariant.
    //    (Run with RUST_LOG=debug to see each block on the walk.)
    // --------------------------------------------------------------------
    heap.free(third_block);
    heap.free(grown);
    heap.free(big_block);

    match heap.check_heap(true) {
      Ok(()) => println!("\n[6] check_heap: all invariants hold"),
      Err(problem) => println!("\n[6] check_heap: {}", problem),
    }

    // ------------------------------------------------------------------
    // 7) End of demo. The heap keeps its pages; the OS reclaims
    //    everything when the process exits.
    // ------------------------------------------------------------------
    println!("\n[7] End of example.");
  }
}
