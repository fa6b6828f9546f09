//! Allocation range tracking.
//!
//! Records the address range of every allocation the guard has seen, live or
//! released, and answers bounds queries against them. Released records are
//! kept as history so double releases and stale accesses can be told apart
//! from pointers that were never handed out.
//!
//! Allocators reuse and split memory they previously released, so a new
//! range may land on top of stale records. [`RangeTracker::record_allocation`]
//! reconciles only the records that can collide with the new range, keeping
//! every operation logarithmic in the number of records.

use crate::address::Address;
use crate::error::{GuardResult, Violation};
use crate::tree::RbMap;
use smallvec::SmallVec;
use std::fmt;
use tracing::debug;

/// A recorded allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: Address,
    pub length: usize,
    /// Set once the allocation was returned to the allocator.
    pub released: bool,
}

impl Range {
    /// First address past the range.
    pub fn end(&self) -> Address {
        self.start.offset(self.length)
    }

    pub fn contains(&self, address: Address) -> bool {
        self.start <= address && address < self.end()
    }

    pub fn is_live(&self) -> bool {
        !self.released
    }
}

/// Per-record payload stored in the tree, keyed by start address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Extent {
    length: usize,
    released: bool,
}

impl Extent {
    fn at(self, start: Address) -> Range {
        Range {
            start,
            length: self.length,
            released: self.released,
        }
    }
}

/// Fix-ups applied to stale records while recording a new allocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Released predecessor cut short at the new start, with its old length.
    pub truncated: Option<(Address, usize)>,
    /// A released record at the very same start was reused for the new range.
    pub revived: bool,
    /// Starts of released records swallowed by the new range.
    pub erased: Vec<Address>,
}

impl Reconciliation {
    /// Whether recording touched no other record.
    pub fn is_clean(&self) -> bool {
        self.truncated.is_none() && !self.revived && self.erased.is_empty()
    }
}

/// Tracks allocated address ranges and validates addresses against them.
///
/// Recorded spans never overlap: no record contains the start of another.
/// Live records mirror the allocator's outstanding blocks one to one.
#[derive(Debug, Default)]
pub struct RangeTracker {
    /// Map from allocation start address to its extent.
    ranges: RbMap<Address, Extent>,
}

impl RangeTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records, live and released.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Records a new live allocation, reconciling stale records it lands on.
    ///
    /// Nothing is modified unless the whole operation succeeds.
    ///
    /// # Arguments
    /// * `start` - Address returned by the allocator
    /// * `length` - Size of the allocation in bytes
    ///
    /// # Returns
    /// * `Ok(Reconciliation)` - Range recorded; describes which stale records changed
    /// * `Err(Violation::DuplicateKey)` - A live allocation already starts at `start`
    /// * `Err(Violation::OverlapsLive)` - The range overlaps another live allocation
    pub fn record_allocation(
        &mut self,
        start: Address,
        length: usize,
    ) -> GuardResult<Reconciliation> {
        let end = start.offset(length);

        let exact = self.get(start);
        if exact.is_some_and(|range| range.is_live()) {
            return Err(Violation::DuplicateKey { address: start });
        }

        let overlapped = self.predecessor(start).filter(|pred| pred.end() > start);
        if let Some(pred) = overlapped.filter(Range::is_live) {
            return Err(Violation::OverlapsLive {
                address: start,
                length,
                existing: pred.start,
            });
        }

        let swallowed = self.starts_within(start, end);
        if let Some(live) = swallowed.iter().find(|range| range.is_live()) {
            return Err(Violation::OverlapsLive {
                address: start,
                length,
                existing: live.start,
            });
        }

        let mut outcome = Reconciliation::default();

        // The new range begins inside a stale one: keep only its head.
        if let Some(pred) = overlapped {
            if let Some(extent) = self.ranges.get_mut(&pred.start) {
                extent.length = start.distance_from(pred.start);
                debug!(
                    "Truncated released range at {} from {} to {} bytes",
                    pred.start, pred.length, extent.length
                );
            }
            outcome.truncated = Some((pred.start, pred.length));
        }

        // Stale starts inside the new range no longer name an allocation.
        for stale in &swallowed {
            self.ranges.remove(&stale.start);
            debug!("Erased released range at {} swallowed by {}", stale.start, start);
            outcome.erased.push(stale.start);
        }

        let fresh = Extent {
            length,
            released: false,
        };
        match self.ranges.get_mut(&start) {
            Some(extent) => {
                debug!(
                    "Reusing released range at {} ({} -> {} bytes)",
                    start, extent.length, length
                );
                *extent = fresh;
                outcome.revived = true;
            }
            None => {
                let inserted = self.ranges.insert(start, fresh);
                debug_assert!(inserted, "start was checked to be free");
            }
        }

        Ok(outcome)
    }

    /// Records with a start strictly inside `(start, end)`, highest first.
    fn starts_within(&self, start: Address, end: Address) -> SmallVec<[Range; 4]> {
        let mut found = SmallVec::new();
        let mut bound = end;
        while let Some(range) = self.predecessor(bound) {
            if range.start <= start {
                break;
            }
            found.push(range);
            bound = range.start;
        }
        found
    }

    /// Marks the allocation starting at `start` as released.
    ///
    /// The record is kept so later releases and accesses can be diagnosed.
    ///
    /// # Returns
    /// * `Ok(Range)` - The updated record
    /// * `Err(Violation::Untracked)` - No allocation starts at `start`
    /// * `Err(Violation::DoubleRelease)` - The allocation was already released
    pub fn mark_released(&mut self, start: Address) -> GuardResult<Range> {
        let extent = self
            .ranges
            .get_mut(&start)
            .ok_or(Violation::Untracked { address: start })?;
        if extent.released {
            return Err(Violation::DoubleRelease { address: start });
        }
        extent.released = true;
        Ok(extent.at(start))
    }

    /// Flips a released record back to live. Returns `false` if there is no
    /// record at `start`.
    pub(crate) fn mark_live(&mut self, start: Address) -> bool {
        match self.ranges.get_mut(&start) {
            Some(extent) => {
                extent.released = false;
                true
            }
            None => false,
        }
    }

    /// Drops the record starting at `start` altogether.
    pub fn forget(&mut self, start: Address) -> Option<Range> {
        self.ranges.remove(&start).map(|extent| extent.at(start))
    }

    /// Record starting exactly at `start`.
    pub fn get(&self, start: Address) -> Option<Range> {
        self.ranges.get(&start).map(|extent| extent.at(start))
    }

    /// Record with the greatest start strictly below `address`.
    pub fn predecessor(&self, address: Address) -> Option<Range> {
        self.ranges
            .floor_exclusive(&address)
            .map(|(start, extent)| extent.at(*start))
    }

    /// Whether the record at `start` was released. `None` if there is none.
    pub fn is_released(&self, start: Address) -> Option<bool> {
        self.ranges.get(&start).map(|extent| extent.released)
    }

    pub fn length_of(&self, start: Address) -> Option<usize> {
        self.ranges.get(&start).map(|extent| extent.length)
    }

    /// Record whose span holds `address`.
    ///
    /// A record starting exactly at `address` is returned even when it is
    /// empty.
    pub fn find_containing(&self, address: Address) -> Option<Range> {
        self.get(address)
            .or_else(|| self.predecessor(address).filter(|range| range.contains(address)))
    }

    /// All records in ascending address order.
    pub fn ranges(&self) -> impl DoubleEndedIterator<Item = Range> + ExactSizeIterator + '_ {
        self.ranges.iter().map(|(start, extent)| extent.at(*start))
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        self.ranges.assert_invariants();
        let ranges: Vec<Range> = self.ranges().collect();
        for pair in ranges.windows(2) {
            assert!(
                pair[0].end() <= pair[1].start,
                "{:?} overlaps {:?}",
                pair[0],
                pair[1]
            );
        }
    }
}

impl fmt::Display for RangeTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, range) in self.ranges().enumerate() {
            let state = if range.released { "released" } else { "live" };
            writeln!(
                f,
                "Index: {} Address: {} Length: {} State: {}",
                index, range.start, range.length, state
            )?;
        }
        Ok(())
    }
}
