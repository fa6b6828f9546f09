//! Per-call-site allocation totals.

use std::fmt;
use std::panic::Location;

/// Where an allocation request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Source location of the caller, captured with `#[track_caller]`.
    Caller(&'static Location<'static>),
    /// Line of a replayed trace.
    TraceLine(usize),
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Caller(location) => write!(f, "{location}"),
            Origin::TraceLine(line) => write!(f, "trace line {line}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OriginStats {
    pub origin: Origin,
    pub calls: usize,
    pub bytes: usize,
}

/// Linear table of allocation origins, in order of first appearance.
#[derive(Debug, Default, Clone)]
pub struct OriginHistogram {
    entries: Vec<OriginStats>,
}

impl OriginHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, origin: Origin, size: usize) {
        match self.entries.iter_mut().find(|entry| entry.origin == origin) {
            Some(entry) => {
                entry.calls += 1;
                entry.bytes = entry.bytes.saturating_add(size);
            }
            None => self.entries.push(OriginStats {
                origin,
                calls: 1,
                bytes: size,
            }),
        }
    }

    pub fn get(&self, origin: Origin) -> Option<&OriginStats> {
        self.entries.iter().find(|entry| entry.origin == origin)
    }

    pub fn entries(&self) -> &[OriginStats] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.entries.iter().fold(0, |total, entry| total.saturating_add(entry.bytes))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl fmt::Display for OriginHistogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            writeln!(
                f,
                "The call site at {} requested {} allocations for a total of {} bytes",
                entry.origin, entry.calls, entry.bytes
            )?;
        }
        Ok(())
    }
}
