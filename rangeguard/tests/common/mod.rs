//! Common test utilities and macros

use rangeguard::replay::Replay;
use rangeguard::{Address, RawAllocator, SimulatedHeap, ViolationPolicy};
use std::collections::VecDeque;
use std::path::Path;

#[derive(Debug)]
pub enum TestResult {
    Success,
    SuccessWithOutput(String),
    Error(String),
    ErrorRegex(String),
}

impl PartialEq for TestResult {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (TestResult::Success, TestResult::Success) => true,
            (TestResult::SuccessWithOutput(a), TestResult::SuccessWithOutput(b)) => a == b,
            (TestResult::Error(a), TestResult::Error(b)) => a == b,
            (TestResult::ErrorRegex(pattern), TestResult::Error(msg)) => {
                regex::Regex::new(pattern).unwrap().is_match(msg)
            }
            (TestResult::Error(msg), TestResult::ErrorRegex(pattern)) => {
                regex::Regex::new(pattern).unwrap().is_match(msg)
            }
            _ => false,
        }
    }
}

/// Base address of the simulated heap used by trace tests.
pub const HEAP_BASE: Address = Address::new(0x1000);

pub fn run_replay_test(input_file: &Path) -> TestResult {
    let source = std::fs::read_to_string(input_file).unwrap();
    let mut replay = Replay::new(SimulatedHeap::new(HEAP_BASE), ViolationPolicy::Report);

    match replay.run(&source) {
        Ok(summary) => match summary.violation {
            Some(violation) => TestResult::Error(violation.to_string()),
            None if summary.output.is_empty() => TestResult::Success,
            None => TestResult::SuccessWithOutput(summary.output),
        },
        Err(e) => TestResult::Error(format!("{:#}", e)),
    }
}

/// Allocator that hands out a fixed list of addresses, in order.
///
/// Lets tests place blocks exactly where a real allocator might, including
/// inside blocks released earlier.
#[derive(Debug, Default)]
pub struct ScriptedAllocator {
    script: VecDeque<Address>,
    pub released: Vec<Address>,
}

impl ScriptedAllocator {
    pub fn new(addresses: impl IntoIterator<Item = usize>) -> Self {
        Self {
            script: addresses.into_iter().map(Address::new).collect(),
            released: Vec::new(),
        }
    }
}

impl RawAllocator for ScriptedAllocator {
    fn allocate(&mut self, _size: usize) -> Option<Address> {
        self.script.pop_front()
    }

    unsafe fn release(&mut self, address: Address) {
        self.released.push(address);
    }

    unsafe fn resize(&mut self, _address: Address, _size: usize) -> Option<Address> {
        self.script.pop_front()
    }
}

#[macro_export]
macro_rules! check_replay {
    ($test_name:ident, input=$input_file:expr, result=$expected:expr) => {
        #[test]
        fn $test_name() {
            let input_path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
                .join("tests")
                .join("inputs")
                .join($input_file);

            let result = crate::common::run_replay_test(&input_path);
            assert_eq!(result, $expected);
        }
    };
}
