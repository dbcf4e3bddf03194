//! rtfm Runtime Library
//!
//! Flat C ABI over the rtfm engine for instrumented code:
//! - Transactions, aborts and open/closed switching
//! - Write recording and transactional memory helpers
//! - Function registration and lookup

mod thread_context;
mod transact;

pub use thread_context::{published_function_table, register_open_function};
pub use transact::*;
