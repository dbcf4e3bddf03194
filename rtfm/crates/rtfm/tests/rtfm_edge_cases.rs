//! Edge Case Tests - Configuration, Manual Transactions and Registration
//!
//! Boundary behavior that the scenario tests do not reach.

mod common;

use common::{Fixture, HeapBuffer, TaskRecorder};
use rtfm::{
    AbiDescriptor, ContextStatus, FunctionRegistry, RetryTransactions, RtfmError, RuntimeConfig,
    TaskKey, TransactionResult,
};
use std::cell::Cell;
use std::io::Write;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[test]
fn test_config_file_roundtrip() {
    let config = RuntimeConfig {
        retry: RetryTransactions::RetryNestedToo,
        page_size: 64 * 1024,
        max_lock_retries: Some(3),
        ..Default::default()
    };
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(config.to_toml_string().unwrap().as_bytes())
        .unwrap();

    let loaded = RuntimeConfig::load_from_path(file.path()).unwrap();
    assert_eq!(loaded, config);
}

#[test]
fn test_config_file_partial_keeps_defaults() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "internal_abort_action = \"crash\"").unwrap();

    let loaded = RuntimeConfig::load_from_path(file.path()).unwrap();
    assert_eq!(loaded.page_size, RuntimeConfig::default().page_size);
    assert_eq!(
        loaded.internal_abort_action,
        rtfm::InternalAbortAction::Crash
    );
}

#[test]
fn test_config_file_invalid_page_size() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "page_size = 1000").unwrap();

    let err = RuntimeConfig::load_from_path(file.path()).unwrap_err();
    assert!(matches!(err, RtfmError::Configuration(_)));
    assert!(err.is_recoverable());
}

#[test]
fn test_config_file_missing() {
    let dir = tempfile::tempdir().unwrap();
    let err = RuntimeConfig::load_from_path(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, RtfmError::Io(_)));
}

// ============================================================================
// DISABLED RUNTIME
// ============================================================================

/// With the runtime disabled writes land directly and nothing is undone
#[test]
fn test_disabled_runtime_does_not_undo() {
    let mut fixture = Fixture::with_config(RuntimeConfig {
        enabled: false,
        ..Default::default()
    });
    let mut x = Box::new(0u32);
    let p: *mut u32 = &mut *x;

    let result = fixture.ctx.transact(|tx| {
        unsafe { tx.write(p, 4)? };
        assert!(!tx.is_closed());
        tx.abort_by_request()
    });

    assert_eq!(result, TransactionResult::AbortedByRequest);
    assert_eq!(*x, 4);
    assert!(!fixture.ctx.start_transaction());
    assert_eq!(fixture.ctx.status(), ContextStatus::Idle);
}

// ============================================================================
// MANUAL TRANSACTIONS
// ============================================================================

/// A manual nest aborts alone; the manual parent then commits
#[test]
fn test_manual_nested_abort_then_commit() {
    let mut fixture = Fixture::with_defaults();
    let mut buf = HeapBuffer::new(2);
    let p = buf.ptr();
    let ctx = &mut fixture.ctx;

    assert!(ctx.start_transaction());
    unsafe { ctx.write(p, 1u8).unwrap() };
    assert!(ctx.start_transaction());
    assert_eq!(ctx.depth(), 2);
    unsafe { ctx.write(p.add(1), 2u8).unwrap() };
    unsafe { ctx.write(p, 3u8).unwrap() };

    assert_eq!(ctx.abort_transaction(), TransactionResult::AbortedByRequest);
    assert_eq!(ctx.depth(), 1);
    assert_eq!(ctx.status(), ContextStatus::OnTrack);
    assert_eq!(buf.bytes(), vec![1, 0]);

    assert_eq!(ctx.commit_transaction(), TransactionResult::Committed);
    assert!(!ctx.is_transactional());
    assert_eq!(buf.bytes(), vec![1, 0]);
}

/// Committing a manual transaction after a language abort reports the abort
#[test]
fn test_manual_commit_after_abort_reports_abort() {
    let mut fixture = Fixture::with_defaults();
    let mut x = Box::new(5u16);
    let p: *mut u16 = &mut *x;
    let ctx = &mut fixture.ctx;

    assert!(ctx.start_transaction());
    unsafe { ctx.write(p, 6).unwrap() };
    assert!(ctx.abort_by_language::<()>().is_err());
    assert!(unsafe { ctx.write(p, 7) }.is_err());

    assert_eq!(ctx.commit_transaction(), TransactionResult::AbortedByLanguage);
    assert_eq!(*x, 5);
    assert_eq!(ctx.status(), ContextStatus::Idle);
}

// ============================================================================
// DEFERRED TASKS
// ============================================================================

/// A keyed handler registered in a committed nest can be withdrawn by the parent
#[test]
fn test_abort_handler_survives_fold() {
    let mut fixture = Fixture::with_defaults();
    let recorder = TaskRecorder::new();
    let key = TaskKey(0xABC);

    let result = fixture.ctx.transact(|tx| {
        tx.commit(|nested| {
            nested.push_on_abort_handler(key, recorder.task(1));
            Ok(())
        });
        assert!(tx.pop_on_abort_handler(key));
        assert!(!tx.pop_on_abort_handler(key));
        tx.abort_by_request()
    });

    assert_eq!(result, TransactionResult::AbortedByRequest);
    assert!(recorder.recorded().is_empty());
}

// ============================================================================
// DEBUG RETRY
// ============================================================================

/// RetryNestedToo reruns every level once and still commits the last run
#[test]
fn test_debug_retry_nested_too() {
    let mut fixture = Fixture::with_config(RuntimeConfig {
        retry: RetryTransactions::RetryNestedToo,
        ..Default::default()
    });
    let mut x = Box::new(0u32);
    let p: *mut u32 = &mut *x;
    let outer_runs = Cell::new(0);
    let nested_runs = Cell::new(0);
    let recorder = TaskRecorder::new();

    let result = fixture.ctx.transact(|tx| {
        outer_runs.set(outer_runs.get() + 1);
        unsafe { tx.write(p, *p + 1)? };
        tx.defer_until_abort(recorder.task(outer_runs.get()));
        let nested = tx.transact(|inner| {
            nested_runs.set(nested_runs.get() + 1);
            unsafe { inner.write(p, *p + 10) }
        });
        assert_eq!(nested, TransactionResult::Committed);
        Ok(())
    });

    assert_eq!(result, TransactionResult::Committed);
    assert_eq!(outer_runs.get(), 2);
    assert_eq!(nested_runs.get(), 4);
    assert_eq!(*x, 11);
    assert_eq!(recorder.recorded(), vec![1]);
    assert_eq!(fixture.ctx.stats().summary().debug_retries, 3);
}

// ============================================================================
// REGISTRATION AND ABI
// ============================================================================

fn first(x: u8) -> u8 {
    x.wrapping_add(1)
}

fn first_closed(x: u8) -> u8 {
    x.wrapping_add(2)
}

fn other_closed(x: u8) -> u8 {
    x.wrapping_add(3)
}

/// A second substitute for the same function is refused and the first kept
#[test]
fn test_conflicting_registration_keeps_first() {
    let mut registry = FunctionRegistry::new();
    registry
        .register(first as *const (), first_closed as *const ())
        .unwrap();
    registry
        .register(first as *const (), first_closed as *const ())
        .unwrap();

    let err = registry
        .register(first as *const (), other_closed as *const ())
        .unwrap_err();
    assert!(matches!(err, RtfmError::ConflictingRegistration { .. }));
    assert_eq!(registry.len(), 1);

    let table = registry.freeze();
    let found = table.lookup(first as *const ()).unwrap();
    assert_eq!(found.as_ptr() as usize, first_closed as usize);
}

#[test]
fn test_abi_descriptor_blob_is_accepted() {
    let blob = AbiDescriptor::current().to_bytes();
    rtfm::abi::check_abi(&blob);
}

#[test]
#[should_panic(expected = "ABI check failed")]
fn test_truncated_abi_blob_is_fatal() {
    let blob = AbiDescriptor::current().to_bytes();
    rtfm::abi::check_abi(&blob[..8]);
}
