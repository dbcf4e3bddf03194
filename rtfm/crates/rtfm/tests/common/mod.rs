//! Test Utilities for the rtfm Test Suite
//!
//! Fixtures shared by the integration tests: context builders, heap buffers
//! with stable addresses, deferred-task recorders and scripted lock hooks.

#![allow(dead_code)]

use rtfm::{CommitLocks, Context, FunctionRegistry, RuntimeConfig};
use std::cell::RefCell;
use std::rc::Rc;

/// Page size small enough to exercise page turnover in tests
pub const SMALL_PAGE_SIZE: usize = 256;

// ============================================================================
// CONTEXT FIXTURE
// ============================================================================

/// Test fixture owning one context
pub struct Fixture {
    pub ctx: Context,
}

impl Fixture {
    pub fn with_defaults() -> Self {
        Self {
            ctx: Context::with_defaults(),
        }
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        let ctx = Context::new(config, rtfm::FunctionTable::empty())
            .expect("test configuration should validate");
        Self { ctx }
    }

    pub fn with_registry(registry: &FunctionRegistry) -> Self {
        let ctx = Context::new(RuntimeConfig::default(), registry.freeze())
            .expect("default configuration should validate");
        Self { ctx }
    }

    pub fn small_pages() -> Self {
        Self::with_config(RuntimeConfig {
            page_size: SMALL_PAGE_SIZE,
            ..Default::default()
        })
    }
}

// ============================================================================
// HEAP BUFFER
// ============================================================================

/// Heap bytes with a fixed address, so transactions log them
pub struct HeapBuffer {
    data: Box<[u8]>,
}

impl HeapBuffer {
    pub fn new(len: usize) -> Self {
        Self::from_bytes(&vec![0u8; len])
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec().into_boxed_slice(),
        }
    }

    pub fn ptr(&mut self) -> *mut u8 {
        self.data.as_mut_ptr()
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.data.to_vec()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }
}

// ============================================================================
// TASK RECORDER
// ============================================================================

/// Records the order deferred tasks run in
#[derive(Clone, Default)]
pub struct TaskRecorder {
    log: Rc<RefCell<Vec<u32>>>,
}

impl TaskRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Task that appends `n` when it runs
    pub fn task(&self, n: u32) -> impl FnOnce() + 'static {
        let log = Rc::clone(&self.log);
        move || log.borrow_mut().push(n)
    }

    pub fn recorded(&self) -> Vec<u32> {
        self.log.borrow().clone()
    }
}

// ============================================================================
// LOCK HOOKS
// ============================================================================

/// Lock hook failing a fixed number of times before succeeding
pub struct FlakyLocks {
    failures_left: u32,
    /// `pre_acquire` argument of every attempt
    pub attempts: Vec<bool>,
    pub releases: u32,
}

impl FlakyLocks {
    pub fn failing(times: u32) -> Self {
        Self {
            failures_left: times,
            attempts: Vec::new(),
            releases: 0,
        }
    }
}

impl CommitLocks for FlakyLocks {
    fn try_acquire(&mut self, pre_acquire: bool) -> bool {
        self.attempts.push(pre_acquire);
        if self.failures_left > 0 {
            self.failures_left -= 1;
            false
        } else {
            true
        }
    }

    fn release(&mut self) {
        self.releases += 1;
    }
}
