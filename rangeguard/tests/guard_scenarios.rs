mod common;

use common::{HEAP_BASE, ScriptedAllocator};
use proptest::prelude::*;
use rangeguard::{Address, AllocationGuard, RawAllocator, SimulatedHeap, Violation, ViolationPolicy};

fn reporting<A: RawAllocator>(allocator: A) -> AllocationGuard<A> {
    AllocationGuard::new(allocator).with_policy(ViolationPolicy::Report)
}

fn scripted(addresses: &[usize]) -> AllocationGuard<ScriptedAllocator> {
    reporting(ScriptedAllocator::new(addresses.iter().copied()))
}

#[test]
fn test_documented_scenario() {
    let mut guard = reporting(SimulatedHeap::new(HEAP_BASE));
    let a = guard.allocate(16).unwrap();

    assert_eq!(guard.validate(a, 16), Ok(()));
    assert_eq!(
        guard.validate(a, 17),
        Err(Violation::OutOfBounds {
            address: a,
            size: 17,
            length: 16
        })
    );
    assert_eq!(guard.release(a), Ok(()));
    assert_eq!(guard.release(a), Err(Violation::DoubleRelease { address: a }));
    assert_eq!(
        guard.validate(a, 1),
        Err(Violation::UseAfterRelease {
            address: a,
            size: 1,
            block: a
        })
    );
}

#[test]
fn test_reuse_inside_released_block_truncates_it() {
    let mut guard = scripted(&[0x1000, 0x1020]);
    let a = guard.allocate(100).unwrap();
    guard.release(a).unwrap();
    let b = guard.allocate(40).unwrap();
    assert_eq!(b, Address::new(0x1020));

    let stale = guard.tracker().unwrap().get(a).unwrap();
    assert_eq!(stale.length, b.distance_from(a));
    assert!(stale.released);
    assert!(matches!(guard.validate(a, 100), Err(Violation::UseAfterRelease { .. })));
    assert_eq!(guard.validate(b, 40), Ok(()));
}

#[test]
fn test_chain_of_stale_records_collapses() {
    let mut guard = scripted(&[0x1000, 0x1010, 0x1020, 0x1008]);
    let blocks: Vec<Address> = (0..3).map(|_| guard.allocate(16).unwrap()).collect();
    for &block in &blocks {
        guard.release(block).unwrap();
    }

    let spanning = guard.allocate(48).unwrap();
    let tracker = guard.tracker().unwrap();
    let starts: Vec<(usize, usize, bool)> = tracker
        .ranges()
        .map(|range| (range.start.get(), range.length, range.released))
        .collect();
    assert_eq!(starts, vec![(0x1000, 8, true), (0x1008, 48, false)]);

    assert!(matches!(
        guard.validate(Address::new(0x1004), 4),
        Err(Violation::UseAfterRelease { .. })
    ));
    assert_eq!(guard.validate(Address::new(0x1010), 8), Ok(()));
    assert_eq!(guard.validate(spanning.offset(40), 8), Ok(()));
}

#[test]
fn test_allocator_handing_out_live_memory() {
    let mut guard = scripted(&[0x1000, 0x1000, 0x1008]);
    let a = guard.allocate(16).unwrap();
    assert_eq!(guard.allocate(16), Err(Violation::DuplicateKey { address: a }));
    assert_eq!(
        guard.allocate(16),
        Err(Violation::OverlapsLive {
            address: Address::new(0x1008),
            length: 16,
            existing: a
        })
    );
    // The failed attempts left the tracker untouched.
    assert_eq!(guard.tracker().unwrap().len(), 1);
    assert_eq!(guard.validate(a, 16), Ok(()));
}

#[test]
fn test_untracked_is_distinct_from_out_of_bounds() {
    let mut guard = reporting(SimulatedHeap::new(HEAP_BASE));
    let a = guard.allocate(32).unwrap();

    let never_allocated = Address::new(0x8000);
    let release = guard.release(never_allocated).unwrap_err();
    assert_eq!(release, Violation::Untracked { address: never_allocated });
    assert!(release.is_untracked());

    let below = guard.validate(Address::new(0x10), 1).unwrap_err();
    assert!(matches!(below, Violation::BeforeFirstAllocation { .. }));
    assert!(below.is_untracked());

    let beyond = guard.validate(never_allocated, 1).unwrap_err();
    assert!(matches!(beyond, Violation::StartOutOfBounds { .. }));
    assert!(beyond.is_untracked());

    let overflow = guard.validate(a.offset(8), 32).unwrap_err();
    assert!(matches!(overflow, Violation::EndOutOfBounds { .. }));
    assert!(!overflow.is_untracked());
}

#[test]
fn test_exhaustion_is_reported() {
    let mut guard = scripted(&[]);
    assert_eq!(guard.allocate(8), Err(Violation::AllocatorExhausted { size: 8 }));
    assert!(guard.origins().is_empty());
}

#[test]
fn test_moving_resize_retires_old_block() {
    let mut guard = scripted(&[0x1000, 0x2000]);
    let a = guard.allocate(32).unwrap();
    let moved = guard.resize(a, 64).unwrap();
    assert_eq!(moved, Address::new(0x2000));

    assert!(matches!(guard.validate(a, 1), Err(Violation::UseAfterRelease { .. })));
    assert_eq!(guard.validate(moved, 64), Ok(()));
    assert_eq!(guard.release(a), Err(Violation::DoubleRelease { address: a }));
    assert_eq!(guard.release(moved), Ok(()));
    assert_eq!(guard.allocator().released, vec![moved]);
}

#[test]
fn test_resize_onto_live_block_keeps_old_block() {
    let mut guard = scripted(&[0x1000, 0x2000, 0x2000]);
    let a = guard.allocate(16).unwrap();
    let b = guard.allocate(16).unwrap();

    // The allocator moves `a` on top of `b`, which is still live.
    assert_eq!(guard.resize(a, 32), Err(Violation::DuplicateKey { address: b }));

    let old = guard.tracker().unwrap().get(a).unwrap();
    assert!(!old.released);
    assert_eq!(old.length, 16);
    assert_eq!(guard.validate(a, 16), Ok(()));
    assert_eq!(guard.validate(b, 16), Ok(()));
    assert_eq!(guard.release(a), Ok(()));
    assert_eq!(guard.release(b), Ok(()));
    assert_eq!(guard.allocator().released, vec![a, b]);
}

#[test]
#[should_panic(expected = "out of bounds")]
fn test_default_policy_fails_loudly() {
    let mut guard = AllocationGuard::new(SimulatedHeap::new(HEAP_BASE));
    let a = guard.allocate(16).unwrap();
    let _ = guard.validate(a, 17);
}

proptest! {
    #[test]
    fn allocation_round_trip(size in 0usize..4096, extra in 0usize..64) {
        let mut guard = reporting(SimulatedHeap::new(HEAP_BASE));
        let block = guard.allocate(size).unwrap();
        for k in [0, size / 2, size] {
            prop_assert_eq!(guard.validate(block, k), Ok(()));
        }
        prop_assert!(guard.validate(block, size + 1 + extra).is_err());
    }

    #[test]
    fn release_then_validate_fails(
        sizes in prop::collection::vec(1usize..256, 1..20),
        pick in any::<prop::sample::Index>(),
    ) {
        let mut guard = reporting(SimulatedHeap::new(HEAP_BASE));
        let blocks: Vec<Address> =
            sizes.iter().map(|&size| guard.allocate(size).unwrap()).collect();
        let victim = blocks[pick.index(blocks.len())];
        guard.release(victim).unwrap();

        let is_use_after_release = matches!(
            guard.validate(victim, 1),
            Err(Violation::UseAfterRelease { .. })
        );
        prop_assert!(is_use_after_release);
        for &block in blocks.iter().filter(|&&block| block != victim) {
            prop_assert_eq!(guard.validate(block, 1), Ok(()));
        }
    }
}
