//! Allocation trace replay.
//!
//! A trace is a line based script of allocator calls:
//!
//! ```text
//! # comments run to the end of the line
//! buf = alloc 64
//! check buf+16 8
//! big = realloc buf 256
//! tmp = realloc null 32
//! free big
//! report
//! dump
//! ```
//!
//! Each call goes through an [`AllocationGuard`] over a [`SimulatedHeap`], so
//! a trace reproduces the address reuse a real program would see without
//! touching any memory. Replay stops at the first violation.

use crate::address::Address;
use crate::allocator::SimulatedHeap;
use crate::error::Violation;
use crate::guard::{AllocationGuard, Origin, ViolationPolicy};
use anyhow::{Context, Result, anyhow, bail};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info};

/// Parses a decimal or `0x` prefixed hexadecimal number.
pub fn parse_number(text: &str) -> Result<usize> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.with_context(|| format!("Invalid number '{}'", text))
}

/// Pointer operand of a trace step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Null,
    Literal(Address),
    Named { name: String, offset: usize },
}

impl Operand {
    fn parse(text: &str) -> Result<Self> {
        if text == "null" {
            return Ok(Operand::Null);
        }
        if text.starts_with("0x") || text.starts_with("0X") {
            return Ok(Operand::Literal(Address::new(parse_number(text)?)));
        }
        let (name, offset) = match text.split_once('+') {
            Some((name, offset)) => (name, parse_number(offset)?),
            None => (text, 0),
        };
        if !is_identifier(name) {
            bail!("Invalid pointer name '{}'", name);
        }
        Ok(Operand::Named {
            name: name.to_string(),
            offset,
        })
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Null => f.write_str("null"),
            Operand::Literal(address) => write!(f, "{address}"),
            Operand::Named { name, offset: 0 } => f.write_str(name),
            Operand::Named { name, offset } => write!(f, "{name}+{offset}"),
        }
    }
}

fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// One trace instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Alloc { name: String, size: usize },
    Realloc { name: String, from: Operand, size: usize },
    Free(Operand),
    Check { target: Operand, size: usize },
    Report,
    Dump,
}

impl Step {
    /// Parses one line; blank and comment-only lines yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let code = line.split_once('#').map_or(line, |(code, _)| code);
        let tokens: Vec<&str> = code.split_whitespace().collect();
        let step = match tokens.as_slice() {
            [] => return Ok(None),
            [name, "=", "alloc", size] => Step::Alloc {
                name: Self::target_name(name)?,
                size: parse_number(size)?,
            },
            [name, "=", "realloc", from, size] => Step::Realloc {
                name: Self::target_name(name)?,
                from: Operand::parse(from)?,
                size: parse_number(size)?,
            },
            ["free", target] => Step::Free(Operand::parse(target)?),
            ["check", target, size] => Step::Check {
                target: Operand::parse(target)?,
                size: parse_number(size)?,
            },
            ["report"] => Step::Report,
            ["dump"] => Step::Dump,
            _ => bail!("Unrecognized instruction '{}'", code.trim()),
        };
        Ok(Some(step))
    }

    fn target_name(name: &str) -> Result<String> {
        if !is_identifier(name) || name == "null" {
            bail!("Invalid pointer name '{}'", name);
        }
        Ok(name.to_string())
    }
}

/// First violation hit by a replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceViolation {
    pub line: usize,
    pub violation: Violation,
}

impl fmt::Display for TraceViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.violation)
    }
}

/// Result of running a trace.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Steps executed successfully.
    pub steps: usize,
    pub violation: Option<TraceViolation>,
    /// Text produced by `report` and `dump` steps.
    pub output: String,
}

impl ReplaySummary {
    pub fn is_clean(&self) -> bool {
        self.violation.is_none()
    }
}

/// Runs traces against a guarded simulated heap.
///
/// Pointer names persist across calls to [`Replay::run`].
#[derive(Debug)]
pub struct Replay {
    guard: AllocationGuard<SimulatedHeap>,
    pointers: HashMap<String, Address>,
}

impl Replay {
    pub fn new(heap: SimulatedHeap, policy: ViolationPolicy) -> Self {
        Self {
            guard: AllocationGuard::new(heap).with_policy(policy),
            pointers: HashMap::new(),
        }
    }

    pub fn guard(&self) -> &AllocationGuard<SimulatedHeap> {
        &self.guard
    }

    /// Address currently bound to a pointer name.
    pub fn pointer(&self, name: &str) -> Option<Address> {
        self.pointers.get(name).copied()
    }

    /// Tracked ranges, one per line.
    pub fn dump(&self) -> String {
        match self.guard.tracker() {
            Some(tracker) if !tracker.is_empty() => tracker.to_string(),
            _ => "No tracked ranges\n".to_string(),
        }
    }

    /// Parses and executes `source`.
    ///
    /// Malformed lines and unknown pointer names are errors; violations end
    /// the replay and are returned in the summary.
    pub fn run(&mut self, source: &str) -> Result<ReplaySummary> {
        let steps = source
            .lines()
            .enumerate()
            .filter_map(|(index, line)| {
                Step::parse(line)
                    .with_context(|| format!("Failed to parse line {}", index + 1))
                    .transpose()
                    .map(|step| step.map(|step| (index + 1, step)))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut summary = ReplaySummary::default();
        for (line, step) in steps {
            debug!("Replaying line {}: {:?}", line, step);
            let executed = self
                .execute(line, &step, &mut summary.output)
                .with_context(|| format!("Failed to replay line {}", line))?;
            if let Err(violation) = executed {
                summary.violation = Some(TraceViolation { line, violation });
                return Ok(summary);
            }
            summary.steps += 1;
        }
        info!("Replayed {} steps", summary.steps);
        Ok(summary)
    }

    /// Runs one step. The outer error is a trace error, the inner one a
    /// violation detected by the guard.
    fn execute(
        &mut self,
        line: usize,
        step: &Step,
        output: &mut String,
    ) -> Result<Result<(), Violation>> {
        let outcome = match step {
            Step::Alloc { name, size } => self
                .guard
                .allocate_from(*size, Origin::TraceLine(line))
                .map(|address| self.bind(name, address)),
            Step::Realloc { name, from, size } => {
                let from = self.resolve(from)?;
                let result = if from.is_null() {
                    self.guard.allocate_from(*size, Origin::TraceLine(line))
                } else {
                    self.guard.resize(from, *size)
                };
                result.map(|address| self.bind(name, address))
            }
            Step::Free(target) => {
                let address = self.resolve(target)?;
                self.guard.release(address)
            }
            Step::Check { target, size } => {
                let address = self.resolve(target)?;
                self.guard.validate(address, *size)
            }
            Step::Report => {
                output.push_str(&self.guard.origins().to_string());
                Ok(())
            }
            Step::Dump => {
                output.push_str(&self.dump());
                Ok(())
            }
        };
        Ok(outcome)
    }

    fn bind(&mut self, name: &str, address: Address) {
        self.pointers.insert(name.to_string(), address);
    }

    fn resolve(&self, operand: &Operand) -> Result<Address> {
        match operand {
            Operand::Null => Ok(Address::NULL),
            Operand::Literal(address) => Ok(*address),
            Operand::Named { name, offset } => {
                let base = self
                    .pointer(name)
                    .ok_or_else(|| anyhow!("Unknown pointer '{}'", name))?;
                base.checked_offset(*offset)
                    .ok_or_else(|| anyhow!("Offset {} overflows pointer '{}'", offset, name))
            }
        }
    }
}
