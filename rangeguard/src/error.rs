//! Violations detected by the guard.

use crate::address::Address;
use std::fmt;
use thiserror::Error;

/// Guard entry point a violation was raised from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Release,
    Resize,
    Validate,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Release => "release",
            Operation::Resize => "resize",
            Operation::Validate => "validate",
        };
        f.write_str(name)
    }
}

/// Every way a caller can break the allocation contract.
///
/// The set is closed: harnesses can match on it to assert which check fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("null pointer passed to {operation}")]
    NullPointer { operation: Operation },

    #[error("address {address} was not handed out by the guarded allocator")]
    Untracked { address: Address },

    #[error("address {address} has already been released")]
    DoubleRelease { address: Address },

    #[error("access of {size} bytes at {address} touches the released block at {block}")]
    UseAfterRelease {
        address: Address,
        size: usize,
        block: Address,
    },

    #[error("access of {size} bytes at {address} is out of bounds of its {length}-byte block")]
    OutOfBounds {
        address: Address,
        size: usize,
        length: usize,
    },

    #[error("address {address} lies before the first tracked allocation")]
    BeforeFirstAllocation { address: Address },

    #[error("address {address} starts past the end of the {length}-byte block at {block}")]
    StartOutOfBounds {
        address: Address,
        block: Address,
        length: usize,
    },

    #[error("access of {size} bytes at {address} ends past the {length}-byte block at {block}")]
    EndOutOfBounds {
        address: Address,
        size: usize,
        block: Address,
        length: usize,
    },

    #[error("allocation at {address} collides with a live allocation at the same address")]
    DuplicateKey { address: Address },

    #[error("allocation of {length} bytes at {address} overlaps the live allocation at {existing}")]
    OverlapsLive {
        address: Address,
        length: usize,
        existing: Address,
    },

    #[error("allocator could not satisfy a request for {size} bytes")]
    AllocatorExhausted { size: usize },
}

impl Violation {
    /// Whether the violation means the address is not inside any tracked
    /// block, as opposed to an access running past a block it starts in.
    pub fn is_untracked(&self) -> bool {
        matches!(
            self,
            Violation::Untracked { .. }
                | Violation::BeforeFirstAllocation { .. }
                | Violation::StartOutOfBounds { .. }
        )
    }
}

pub type GuardResult<T> = std::result::Result<T, Violation>;
