//! # rtfm - Software Transactional Memory Runtime
//!
//! rtfm gives arbitrary imperative code atomicity and rollback without a
//! garbage collector. Writes performed inside a transaction are logged before
//! they land; an abort replays the log and leaves memory exactly as it was.
//!
//! ## Overview
//!
//! - **Write logging**: every recorded write snapshots the previous bytes once per tagged region
//! - **Nested transactions**: a child folds into its parent on success and unwinds alone on failure
//! - **Deferred tasks**: commit tasks run FIFO, abort tasks run LIFO
//! - **Open/closed dispatch**: a frozen function table maps original functions to transactional substitutes
//! - **Lock retry**: an outer transaction whose commit locks are contested retries with pre-acquisition
//!
//! ## Quick Start
//!
//! ```rust
//! use rtfm::{Abort, Context, TransactionResult};
//!
//! let mut ctx = Context::with_defaults();
//! let mut x = 0u32;
//! let p: *mut u32 = &mut x;
//!
//! let result = ctx.transact(|tx| {
//!     unsafe { tx.write(p, 1)? };
//!     Err(Abort::ByRequest)
//! });
//!
//! assert_eq!(result, TransactionResult::AbortedByRequest);
//! assert_eq!(x, 0);
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Context (one per logical thread)                         │
//! │   status ─ mode ─ frames ─ Arc<FunctionTable> ─ stats    │
//! │                                                          │
//! │   current ──► Transaction (innermost)                    │
//! │                 hit set ─ write log ─ bump allocator     │
//! │                 commit tasks ─ abort tasks               │
//! │                 parent ──► Transaction ──► ... ──► root  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ### Abort propagation
//!
//! Transactional code returns [`Transactional<T>`]. An abort is an
//! `Err(Abort)` travelling back with `?` to the nearest `transact` call, which
//! undoes that nest and runs its abort tasks before control continues.
//!
//! ## Safety
//!
//! Recording a write reads the target bytes, and undo writes them back. Every
//! address handed to the runtime must stay valid for reads and writes until
//! the outermost transaction finishes. Addresses on the stack of the running
//! transaction are classified and skipped.
//!
//! ## Modules
//!
//! - [`abi`]: ABI descriptor shared with instrumented code
//! - [`allocator`]: Bump allocation of undo copies
//! - [`config`]: Runtime configuration and validation
//! - [`context`]: Per-thread transaction context and public entry points
//! - [`error`]: Abort outcomes and runtime errors
//! - [`function_table`]: Original to substitute function mapping
//! - [`hit_set`]: Already-logged region membership
//! - [`memory`]: Tagged memory locations
//! - [`stack`]: Stack range classification
//! - [`stats`]: Per-context statistics
//! - [`task_array`]: Deferred commit and abort callbacks
//! - [`transaction`]: The unit of atomicity
//! - [`write_log`]: Append-only log of undo entries

// Core runtime modules
pub mod context;
pub mod transaction;
pub mod config;
pub mod error;

// Transaction bookkeeping
pub mod allocator;
pub mod hit_set;
pub mod memory;
pub mod task_array;
pub mod write_log;

// Dispatch and compatibility
pub mod abi;
pub mod function_table;

// Platform and monitoring
pub mod stack;
pub mod stats;

// Re-export main types for convenience
pub use abi::AbiDescriptor;
pub use config::{ConfigError, InternalAbortAction, RetryTransactions, RuntimeConfig};
pub use context::{
    CommitLocks, Context, ContextStatus, ExecutionMode, LockHook, NoLocks, TransactionResult,
};
pub use error::{Abort, Result, RtfmError, Transactional};
pub use function_table::{FunctionRegistry, FunctionTable};
pub use memory::TaggedMemoryLocation;
pub use stack::StackRange;
pub use stats::{StatsSummary, TransactionStats};
pub use task_array::TaskKey;

#[doc(hidden)]
pub use log as __log;

/// rtfm version string from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Create a context with configuration taken from the environment
///
/// Falls back to the default configuration when the environment holds an
/// invalid value.
///
/// # Examples
///
/// ```rust
/// let ctx = rtfm::init();
/// assert!(!ctx.is_transactional());
/// ```
pub fn init() -> Context {
    let config = RuntimeConfig::from_env();
    match Context::new(config, FunctionTable::empty()) {
        Ok(ctx) => ctx,
        Err(e) => {
            log::warn!("invalid environment configuration ({}), using defaults", e);
            Context::with_defaults()
        }
    }
}

/// Create a context with custom configuration and function table
pub fn init_with_config(
    config: RuntimeConfig,
    functions: std::sync::Arc<FunctionTable>,
) -> Result<Context> {
    Context::new(config, functions)
}
