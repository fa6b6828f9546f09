//! Allocation guard.
//!
//! Sits in front of a [`RawAllocator`], records every block it hands out and
//! checks releases and accesses against those records. Violations go through
//! a [`ViolationPolicy`]: by default the guard fails loudly on the first one.

mod origin;

pub use origin::{Origin, OriginHistogram, OriginStats};

use crate::address::Address;
use crate::allocator::{RawAllocator, SystemAllocator};
use crate::error::{GuardResult, Operation, Violation};
use crate::tracker::RangeTracker;
use anyhow::bail;
use std::fmt;
use std::panic::Location;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use tracing::{debug, error, warn};

/// What the guard does once it detects a violation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ViolationPolicy {
    /// Return the violation to the caller.
    Report,
    /// Panic with the violation message.
    #[default]
    Panic,
    /// Abort the process.
    Abort,
}

impl ViolationPolicy {
    /// Environment variable read by the process-wide guard.
    pub const ENV_VAR: &'static str = "RANGEGUARD_POLICY";

    /// Policy named by [`Self::ENV_VAR`], falling back to the default.
    pub fn from_env() -> Self {
        match std::env::var(Self::ENV_VAR) {
            Ok(value) => value.parse().unwrap_or_else(|err| {
                warn!("{}, using {}", err, Self::default());
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }
}

impl FromStr for ViolationPolicy {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> anyhow::Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "report" => Ok(ViolationPolicy::Report),
            "panic" => Ok(ViolationPolicy::Panic),
            "abort" => Ok(ViolationPolicy::Abort),
            other => bail!("Unknown violation policy '{}'", other),
        }
    }
}

impl fmt::Display for ViolationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ViolationPolicy::Report => "report",
            ViolationPolicy::Panic => "panic",
            ViolationPolicy::Abort => "abort",
        };
        f.write_str(name)
    }
}

/// Bounds-checking front end for an allocator.
///
/// Every block handed out is recorded; released blocks stay recorded so a
/// second release or a stale access can be diagnosed.
#[derive(Debug)]
pub struct AllocationGuard<A> {
    allocator: A,
    /// Created on the first allocation.
    tracker: Option<RangeTracker>,
    origins: OriginHistogram,
    policy: ViolationPolicy,
}

impl<A: RawAllocator> AllocationGuard<A> {
    pub fn new(allocator: A) -> Self {
        Self {
            allocator,
            tracker: None,
            origins: OriginHistogram::new(),
            policy: ViolationPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: ViolationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> ViolationPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: ViolationPolicy) {
        self.policy = policy;
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    /// Recorded ranges, or `None` before the first allocation.
    pub fn tracker(&self) -> Option<&RangeTracker> {
        self.tracker.as_ref()
    }

    /// Allocation totals per call site.
    pub fn origins(&self) -> &OriginHistogram {
        &self.origins
    }

    /// Forgets every record and origin.
    ///
    /// Outstanding blocks are not returned to the allocator.
    pub fn reset(&mut self) {
        self.tracker = None;
        self.origins.clear();
    }

    /// Allocates `size` bytes and records the block, attributing it to the
    /// caller's source location.
    #[track_caller]
    pub fn allocate(&mut self, size: usize) -> GuardResult<Address> {
        self.allocate_from(size, Origin::Caller(Location::caller()))
    }

    /// Same as [`AllocationGuard::allocate`] with an explicit origin.
    #[track_caller]
    pub fn allocate_from(&mut self, size: usize, origin: Origin) -> GuardResult<Address> {
        if size == 0 {
            warn!("Allocating memory of size 0 from {}", origin);
        }
        let Some(address) = self.allocator.allocate(size) else {
            return self.fail(Violation::AllocatorExhausted { size });
        };
        if let Err(violation) = self.record(address, size) {
            return self.fail(violation);
        }
        self.origins.record(origin, size);
        debug!("Allocated {} bytes at {} for {}", size, address, origin);
        Ok(address)
    }

    /// Releases a live block.
    ///
    /// The record is kept and flagged as released.
    #[track_caller]
    pub fn release(&mut self, address: Address) -> GuardResult<()> {
        self.retire(address, Operation::Release)?;
        // SAFETY: the block had a live record, so the allocator handed it out
        // and it has not been released since.
        unsafe { self.allocator.release(address) };
        debug!("Released {}", address);
        Ok(())
    }

    /// Resizes a block, possibly moving it.
    ///
    /// A null `address` allocates; a zero `size` releases and returns null.
    #[track_caller]
    pub fn resize(&mut self, address: Address, size: usize) -> GuardResult<Address> {
        if address.is_null() {
            return self.allocate(size);
        }
        if size == 0 {
            warn!("Resizing {} to size 0", address);
            self.release(address)?;
            return Ok(Address::NULL);
        }

        // The allocator may move the block, so the old record goes stale first.
        self.retire(address, Operation::Resize)?;
        // SAFETY: same as in `release`.
        let Some(moved) = (unsafe { self.allocator.resize(address, size) }) else {
            self.restore(address);
            return self.fail(Violation::AllocatorExhausted { size });
        };
        // The caller never learns about a block that could not be recorded,
        // so it keeps owning the old one.
        if let Err(violation) = self.record(moved, size) {
            self.restore(address);
            return self.fail(violation);
        }
        debug!("Resized {} to {} bytes at {}", address, size, moved);
        Ok(moved)
    }

    /// Checks that `[address, address + size)` lies inside one live block.
    ///
    /// The access may start anywhere inside the block, not only at its start.
    #[track_caller]
    pub fn validate(&self, address: Address, size: usize) -> GuardResult<()> {
        if size == 0 {
            warn!("Validating an access of size 0 at {}", address);
        }
        if address.is_null() {
            return self.fail(Violation::NullPointer {
                operation: Operation::Validate,
            });
        }
        let checked = match &self.tracker {
            Some(tracker) => check_access(tracker, address, size),
            None => Err(Violation::BeforeFirstAllocation { address }),
        };
        match checked {
            Ok(()) => Ok(()),
            Err(violation) => self.fail(violation),
        }
    }

    /// Flags the live record at `address` as released.
    #[track_caller]
    fn retire(&mut self, address: Address, operation: Operation) -> GuardResult<()> {
        if address.is_null() {
            return self.fail(Violation::NullPointer { operation });
        }
        let marked = match self.tracker.as_mut() {
            Some(tracker) => tracker.mark_released(address).map(drop),
            None => Err(Violation::Untracked { address }),
        };
        match marked {
            Ok(()) => Ok(()),
            Err(violation) => self.fail(violation),
        }
    }

    /// Flips a record retired by a failed resize back to live.
    fn restore(&mut self, address: Address) {
        if let Some(tracker) = self.tracker.as_mut() {
            tracker.mark_live(address);
        }
    }

    /// Records a block the allocator handed out. The tracker is left
    /// untouched on failure.
    fn record(&mut self, address: Address, size: usize) -> Result<(), Violation> {
        let tracker = self.tracker.get_or_insert_with(RangeTracker::new);
        let outcome = tracker.record_allocation(address, size)?;
        if !outcome.is_clean() {
            debug!(?outcome, "Reconciled stale ranges around {}", address);
        }
        Ok(())
    }

    /// Applies the policy to a detected violation.
    #[track_caller]
    fn fail<T>(&self, violation: Violation) -> GuardResult<T> {
        error!("{}", violation);
        match self.policy {
            ViolationPolicy::Report => Err(violation),
            ViolationPolicy::Panic => panic!("{violation}"),
            ViolationPolicy::Abort => std::process::abort(),
        }
    }
}

/// Classifies an access against the recorded ranges.
fn check_access(tracker: &RangeTracker, address: Address, size: usize) -> Result<(), Violation> {
    if let Some(block) = tracker.get(address) {
        if block.released {
            return Err(Violation::UseAfterRelease {
                address,
                size,
                block: block.start,
            });
        }
        if size > block.length {
            return Err(Violation::OutOfBounds {
                address,
                size,
                length: block.length,
            });
        }
        return Ok(());
    }

    let Some(block) = tracker.predecessor(address) else {
        return Err(Violation::BeforeFirstAllocation { address });
    };
    let end = block.end();
    if address > end {
        return Err(Violation::StartOutOfBounds {
            address,
            block: block.start,
            length: block.length,
        });
    }
    if block.released {
        return Err(Violation::UseAfterRelease {
            address,
            size,
            block: block.start,
        });
    }
    if address.checked_offset(size).is_none_or(|last| last > end) {
        return Err(Violation::EndOutOfBounds {
            address,
            size,
            block: block.start,
            length: block.length,
        });
    }
    Ok(())
}

/// Process-wide guard instance.
static GLOBAL_GUARD: OnceLock<Mutex<AllocationGuard<SystemAllocator>>> = OnceLock::new();

/// Gets the process-wide guard over the system allocator.
///
/// Created on first use with the policy from [`ViolationPolicy::ENV_VAR`].
pub fn global_guard() -> &'static Mutex<AllocationGuard<SystemAllocator>> {
    GLOBAL_GUARD.get_or_init(|| {
        let guard = AllocationGuard::new(SystemAllocator::new());
        Mutex::new(guard.with_policy(ViolationPolicy::from_env()))
    })
}

fn lock_global() -> MutexGuard<'static, AllocationGuard<SystemAllocator>> {
    // A violation under the panic policy poisons the lock; the guard itself
    // is still consistent, so keep going.
    global_guard().lock().unwrap_or_else(PoisonError::into_inner)
}

/// Allocates through the process-wide guard.
#[track_caller]
pub fn allocate(size: usize) -> GuardResult<Address> {
    lock_global().allocate(size)
}

/// Releases through the process-wide guard.
#[track_caller]
pub fn release(address: Address) -> GuardResult<()> {
    lock_global().release(address)
}

/// Resizes through the process-wide guard.
#[track_caller]
pub fn resize(address: Address, size: usize) -> GuardResult<Address> {
    lock_global().resize(address, size)
}

/// Validates an access through the process-wide guard.
#[track_caller]
pub fn validate(address: Address, size: usize) -> GuardResult<()> {
    lock_global().validate(address, size)
}

/// Allocation totals per call site of the process-wide guard.
pub fn report() -> String {
    lock_global().origins().to_string()
}

/// Forgets everything the process-wide guard recorded.
pub fn reset() {
    lock_global().reset();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::SimulatedHeap;

    fn guard() -> AllocationGuard<SimulatedHeap> {
        AllocationGuard::new(SimulatedHeap::new(Address::new(0x1000)))
            .with_policy(ViolationPolicy::Report)
    }

    #[test]
    fn test_tracker_created_lazily() {
        let mut guard = guard();
        assert!(guard.tracker().is_none());
        assert_eq!(
            guard.validate(Address::new(0x1000), 1),
            Err(Violation::BeforeFirstAllocation {
                address: Address::new(0x1000)
            })
        );
        guard.allocate(8).unwrap();
        assert_eq!(guard.tracker().map(RangeTracker::len), Some(1));
    }

    #[test]
    fn test_interior_pointer_access() {
        let mut guard = guard();
        let block = guard.allocate(64).unwrap();
        assert!(guard.validate(block.offset(16), 48).is_ok());
        assert!(matches!(
            guard.validate(block.offset(16), 49),
            Err(Violation::EndOutOfBounds { .. })
        ));
        // Empty accesses only warn, even one past the end.
        assert!(guard.validate(block, 0).is_ok());
        assert!(guard.validate(block.offset(64), 0).is_ok());
        assert!(matches!(
            guard.validate(block.offset(65), 0),
            Err(Violation::StartOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_stale_interior_pointer() {
        let mut guard = guard();
        let block = guard.allocate(64).unwrap();
        guard.release(block).unwrap();
        assert_eq!(
            guard.validate(block.offset(8), 4),
            Err(Violation::UseAfterRelease {
                address: block.offset(8),
                size: 4,
                block
            })
        );
    }

    #[test]
    fn test_null_pointers() {
        let mut guard = guard();
        assert_eq!(
            guard.release(Address::NULL),
            Err(Violation::NullPointer {
                operation: Operation::Release
            })
        );
        assert_eq!(
            guard.validate(Address::NULL, 0),
            Err(Violation::NullPointer {
                operation: Operation::Validate
            })
        );
    }

    #[test]
    fn test_resize_degenerate_cases() {
        let mut guard = guard();
        let block = guard.resize(Address::NULL, 24).unwrap();
        assert!(guard.validate(block, 24).is_ok());

        assert_eq!(guard.resize(block, 0), Ok(Address::NULL));
        assert_eq!(guard.allocator().outstanding(), 0);
        assert_eq!(
            guard.resize(block, 10),
            Err(Violation::DoubleRelease { address: block })
        );
        assert_eq!(
            guard.resize(Address::new(0x9999), 10),
            Err(Violation::Untracked {
                address: Address::new(0x9999)
            })
        );
    }

    #[test]
    fn test_failed_resize_keeps_block_live() {
        let heap = SimulatedHeap::with_capacity(Address::new(0x1000), 64);
        let mut guard = AllocationGuard::new(heap).with_policy(ViolationPolicy::Report);
        let block = guard.allocate(32).unwrap();
        assert_eq!(
            guard.resize(block, 4096),
            Err(Violation::AllocatorExhausted { size: 4096 })
        );
        assert!(guard.validate(block, 32).is_ok());
        assert!(guard.release(block).is_ok());
    }

    #[test]
    fn test_origins_follow_callers() {
        let mut guard = guard();
        for size in [8, 16] {
            guard.allocate(size).unwrap();
        }
        guard.allocate(100).unwrap();
        let entries = guard.origins().entries();
        assert_eq!(entries.len(), 2);
        assert_eq!((entries[0].calls, entries[0].bytes), (2, 24));
        assert!(entries[1].origin.to_string().contains("guard.rs"));

        guard.reset();
        assert!(guard.origins().is_empty());
        assert!(guard.tracker().is_none());
    }

    #[test]
    #[should_panic(expected = "has already been released")]
    fn test_panic_policy_on_double_release() {
        let mut guard = AllocationGuard::new(SimulatedHeap::new(Address::new(0x1000)));
        let block = guard.allocate(8).unwrap();
        guard.release(block).unwrap();
        let _ = guard.release(block);
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("Report".parse::<ViolationPolicy>().unwrap(), ViolationPolicy::Report);
        assert_eq!(" abort ".parse::<ViolationPolicy>().unwrap(), ViolationPolicy::Abort);
        assert!("ignore".parse::<ViolationPolicy>().is_err());
        assert_eq!(ViolationPolicy::default(), ViolationPolicy::Panic);
    }
}
