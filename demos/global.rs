//! This example is designed to test the implementation of
//! the trait `GlobalAlloc` on our allocator. See [`MemAlloc`] to
//! see the actual trait implementation.

use memalloc::MemAlloc;
use std::{sync::mpsc, thread};

#[global_allocator]
static ALLOCATOR: MemAlloc = MemAlloc::new();

fn main() {
    // Box example
    let val_box = Box::new(22);
    println!("Box Value: {}, At: {:p}", val_box, val_box);

    // Vec example
    let mut v = Vec::new();
    for i in 0..5 {
        v.push(i * 10);
        println!("Added {}; Capacity: {}; At: {:p}", v[i], v.capacity(), v.as_ptr());
    }

    // String example
    let msg = String::from("Heap Testing");
    println!("\nString '{}' - At: {:p}", msg, msg.as_ptr());

    let p1 = Box::new(2.22);
    let addr_p1 = format!("{:p}", p1);
    println!("P1 Allocated at: {}", addr_p1);

    drop(p1);
    println!("P1 Deallocated");

    let p2 = Box::new(2.22);
    println!("P2 at: {:p} (P1 was at {})", p2, addr_p1);

    // Merge example: `a` and `b` are neighbors, once both are free the
    // coalesced block can hold `c`.
    let a = Box::new([0u8; 64]);
    let b = Box::new([0u8; 64]);
    let ptr_b = b.as_ptr();

    drop(a);
    drop(b);

    let c = Box::new([0u8; 128]);
    let ptr_c = c.as_ptr();
    println!("B was at {:p}, C is at {:p}", ptr_b, ptr_c);

    // Thread example test
    let t1 = thread::spawn(|| {
        let _ = Box::new(222);
    });

    let t2 = thread::spawn(|| {
        let _ = Box::new(222);
    });

    t1.join().unwrap();
    t2.join().unwrap();

    // Channels allocate over aligned blocks.
    let (tx, rx) = mpsc::channel();
    let sender = thread::spawn(move || {
        for i in 0..3 {
            tx.send(vec![i; 16]).unwrap();
        }
    });
    for received in rx {
        println!("Received {} values at {:p}", received.len(), received.as_ptr());
    }
    sender.join().unwrap();

    ALLOCATOR.print_memory();
    let stats = ALLOCATOR.stats();
    println!("{} regions, {} blocks in use", stats.regions, stats.used_blocks);
}
