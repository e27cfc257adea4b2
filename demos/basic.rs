//! Drives the allocator through its labelled API and prints what the heap
//! looks like after each step.
//!
//! Run with `ALLOCATOR_ALGORITHM=best_fit` or `ALLOCATOR_SCRIBBLE=1` to see
//! the other settings.

use memalloc::MemAlloc;

fn log_alloc(addr: *mut u8, size: usize) {
    println!("Requested {size} bytes of memory");
    println!("Received this address: {addr:?}");
}

fn main() {
    let allocator = MemAlloc::new();

    let first = allocator.allocate(300, "First Allocation").expect("out of memory");
    log_alloc(first.as_ptr(), 300);

    let second = allocator.allocate(100, "Second Allocation").expect("out of memory");
    log_alloc(second.as_ptr(), 100);

    let third = allocator.allocate(500, "Third Allocation").expect("out of memory");
    log_alloc(third.as_ptr(), 500);

    allocator.print_memory();

    unsafe {
        allocator.release(second.as_ptr()).expect("release failed");
        allocator.print_memory();

        let grown = allocator
            .resize(first.as_ptr(), 2000, "Grown First")
            .expect("resize failed")
            .expect("resize to a non-zero size returns a block");
        allocator.print_memory();

        allocator.release(grown.as_ptr()).expect("release failed");
    }

    // `third` is leaked on purpose.
    allocator.check_leaks();
}
