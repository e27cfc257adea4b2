use std::ptr::NonNull;

use memalloc::{AllocError, BLOCK_HEADER_SIZE, Config, FitStrategy, HeapStats, MemAlloc};

use test_env_log::test;

fn allocator(strategy: FitStrategy) -> MemAlloc {
    MemAlloc::with_config(Config::new(strategy, false))
}

fn state(allocator: &MemAlloc) -> String {
    let mut out = String::new();
    allocator.write_memory_state(&mut out).unwrap();
    out
}

/// Address of the header in front of `ptr`, as the dumps print it.
fn header_of(ptr: NonNull<u8>) -> String {
    format!("{:p}", ptr.as_ptr().wrapping_sub(BLOCK_HEADER_SIZE))
}

#[test]
fn releasing_everything_gives_the_region_back() {
    let allocator = allocator(FitStrategy::First);

    let a = allocator.allocate(100, "A").unwrap();
    let b = allocator.allocate(200, "B").unwrap();
    let c = allocator.allocate(300, "C").unwrap();

    let stats = allocator.stats();
    assert_eq!(1, stats.regions);
    assert_eq!(3, stats.used_blocks);

    let rendered = state(&allocator);
    for label in ["'A'", "'B'", "'C'"] {
        assert!(rendered.contains(label), "{rendered}");
    }

    unsafe {
        allocator.release(b.as_ptr()).unwrap();
        allocator.release(a.as_ptr()).unwrap();
        assert_eq!(1, allocator.stats().regions);
        allocator.release(c.as_ptr()).unwrap();
    }

    assert_eq!(HeapStats::default(), allocator.stats());
    assert_eq!("-- Current Memory State --\n\n-- Free List --\nNULL\n", state(&allocator));
}

#[test]
fn free_list_is_most_recently_released_first() {
    let allocator = allocator(FitStrategy::First);

    let mut released = Vec::new();
    for label in ["A", "B", "C"] {
        released.push(allocator.allocate(64, label).unwrap());
        allocator.allocate(16, "fence").unwrap();
    }
    for ptr in &released {
        unsafe { allocator.release(ptr.as_ptr()) }.unwrap();
    }

    let rendered = state(&allocator);
    let chain = rendered.lines().last().unwrap();
    let expected: String = released
        .iter()
        .rev()
        .map(|&ptr| format!("[{}] -> ", header_of(ptr)))
        .collect();

    assert!(chain.starts_with(&expected), "{chain}");
    assert!(chain.ends_with("NULL"));
}

#[test]
fn released_blocks_are_handed_out_again() {
    let allocator = allocator(FitStrategy::First);

    let _keep = allocator.allocate(32, "keep").unwrap();
    let hole = allocator.allocate(500, "hole").unwrap();
    let _fence = allocator.allocate(32, "fence").unwrap();

    unsafe { allocator.release(hole.as_ptr()) }.unwrap();

    let reused = allocator.allocate(480, "reused").unwrap();
    assert_eq!(hole, reused);
}

/// Leaves two holes behind fences and returns them, small one first.
fn holes(allocator: &MemAlloc) -> (NonNull<u8>, NonNull<u8>) {
    allocator.allocate(16, "fence").unwrap();
    let small = allocator.allocate(200, "small").unwrap();
    allocator.allocate(16, "fence").unwrap();
    let large = allocator.allocate(600, "large").unwrap();
    allocator.allocate(16, "fence").unwrap();

    unsafe {
        allocator.release(small.as_ptr()).unwrap();
        allocator.release(large.as_ptr()).unwrap();
    }

    (small, large)
}

#[test]
fn best_fit_prefers_the_tightest_hole() {
    let allocator = allocator(FitStrategy::Best);
    let (small, _) = holes(&allocator);

    // Too little is left over to split, so the whole hole is reused.
    let ptr = allocator.allocate(150, "best").unwrap();
    assert_eq!(small, ptr);
}

#[test]
fn worst_fit_carves_the_largest_block() {
    let allocator = allocator(FitStrategy::Worst);
    let (small, large) = holes(&allocator);

    let ptr = allocator.allocate(150, "worst").unwrap();

    // The region's leading free block is larger than either hole.
    assert!(ptr < small);
    assert!(ptr < large);
}

#[test]
fn large_requests_get_their_own_region() {
    let allocator = allocator(FitStrategy::First);

    let small = allocator.allocate(64, "small").unwrap();
    let large = allocator.allocate(1 << 20, "large").unwrap();
    assert_eq!(2, allocator.stats().regions);

    unsafe {
        large.as_ptr().write_bytes(7, 1 << 20);
        allocator.release(large.as_ptr()).unwrap();
    }
    assert_eq!(1, allocator.stats().regions);

    unsafe { allocator.release(small.as_ptr()) }.unwrap();
    assert_eq!(0, allocator.stats().regions);
}

#[test]
fn leak_check_names_what_was_kept() {
    let allocator = allocator(FitStrategy::First);

    let kept = allocator.allocate(300, "Leaky").unwrap();
    let freed = allocator.allocate(100, "Freed").unwrap();
    unsafe { allocator.release(freed.as_ptr()) }.unwrap();

    let mut report = String::new();
    assert!(allocator.write_leak_check(&mut report).unwrap());

    let size = memalloc::Kernel::<memalloc::Os>::block_size(300).unwrap();
    assert!(report.starts_with("-- Leak Check --\n"));
    assert!(report.contains(&format!("[BLOCK {}] {size}\t'Leaky'", header_of(kept))));
    assert!(!report.contains("Freed"));
    assert!(report.ends_with(&format!("-- Summary --\n1 blocks lost ({size} bytes)\n")));

    unsafe { allocator.release(kept.as_ptr()) }.unwrap();
    assert!(allocator.leaks().is_empty());
}

#[test]
fn zeroed_allocations_skip_scribbling() {
    let allocator = MemAlloc::with_config(Config::new(FitStrategy::First, true));

    let scribbled = allocator.allocate(128, "scribbled").unwrap();
    let zeroed = allocator.zero_allocate(16, 8, "zeroed").unwrap();

    unsafe {
        let scribbled = std::slice::from_raw_parts(scribbled.as_ptr(), 128);
        let zeroed = std::slice::from_raw_parts(zeroed.as_ptr(), 128);
        assert!(scribbled.iter().all(|&b| b == memalloc::utils::SCRIBBLE_BYTE));
        assert!(zeroed.iter().all(|&b| b == 0));
    }

    assert!(matches!(
        allocator.zero_allocate(usize::MAX, 2, "overflow"),
        Err(AllocError::InvalidArgument(_))
    ));
}

#[test]
fn resize_moves_and_releases() {
    let allocator = allocator(FitStrategy::First);

    unsafe {
        let below = allocator.allocate(16, "fence").unwrap();
        let fresh = allocator.resize(std::ptr::null_mut(), 40, "fresh").unwrap().unwrap();
        let above = allocator.allocate(16, "fence").unwrap();
        fresh.as_ptr().write_bytes(3, 40);

        let moved = allocator.resize(fresh.as_ptr(), 4000, "moved").unwrap().unwrap();
        assert_ne!(fresh, moved);
        assert!(std::slice::from_raw_parts(moved.as_ptr(), 40).iter().all(|&b| b == 3));

        assert_eq!(3, allocator.leaks().blocks);
        assert_eq!(
            Err(AllocError::DoubleFree { addr: fresh.as_ptr() as usize }),
            allocator.release(fresh.as_ptr())
        );

        assert_eq!(None, allocator.resize(moved.as_ptr(), 0, "").unwrap());
        allocator.release(below.as_ptr()).unwrap();
        allocator.release(above.as_ptr()).unwrap();
    }

    assert_eq!(HeapStats::default(), allocator.stats());
}

#[test]
fn pointers_from_elsewhere_are_rejected() {
    let allocator = allocator(FitStrategy::First);
    let _ours = allocator.allocate(16, "ours").unwrap();

    let mut foreign = Box::new([0u128; 16]);
    let inside = unsafe { foreign.as_mut_ptr().add(8) }.cast::<u8>();

    assert_eq!(
        Err(AllocError::UnknownPointer { addr: inside as usize }),
        unsafe { allocator.release(inside) }
    );
    assert_eq!(1, allocator.stats().used_blocks);
}
