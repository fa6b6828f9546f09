//! RangeGuard Library
//!
//! A bounds-checking layer for memory allocation. Every block handed out by
//! an allocator is recorded in an ordered map keyed by start address, so that
//! releases and accesses can be checked against the blocks actually handed
//! out, including blocks that were released and later reused.
//!
//! The main entry point is [`AllocationGuard`], which wraps any
//! [`RawAllocator`]. A process-wide guard over the system allocator is
//! available through the free functions re-exported here.
//!
//! # Examples
//! ```
//! use rangeguard::{Address, AllocationGuard, SimulatedHeap, Violation, ViolationPolicy};
//!
//! let heap = SimulatedHeap::new(Address::new(0x1000));
//! let mut guard = AllocationGuard::new(heap).with_policy(ViolationPolicy::Report);
//!
//! let block = guard.allocate(64)?;
//! guard.validate(block.offset(8), 56)?;
//! assert!(matches!(
//!     guard.validate(block, 65),
//!     Err(Violation::OutOfBounds { .. })
//! ));
//! guard.release(block)?;
//! # Ok::<(), Violation>(())
//! ```

pub mod address;
pub mod allocator;
pub mod error;
pub mod guard;
pub mod replay;
pub mod tracker;
pub mod tree;

pub use address::Address;
pub use allocator::{RawAllocator, SimulatedHeap, SystemAllocator};
pub use error::{GuardResult, Operation, Violation};
pub use guard::{
    AllocationGuard, Origin, OriginHistogram, ViolationPolicy, allocate, global_guard, release,
    report, reset, resize, validate,
};
pub use tracker::{Range, RangeTracker, Reconciliation};
pub use tree::RbMap;
