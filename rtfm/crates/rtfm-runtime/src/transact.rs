//! Transaction Runtime - C FFI wrapper for rtfm
//!
//! Every entry point works on the calling thread's context. Work and task
//! callbacks are plain C functions taking one opaque argument. A callback
//! that requests an abort must return promptly; the abort takes effect when
//! it does.
//!
//! Commit and abort tasks run after the runtime has finished the
//! transaction, before the call that finished it returns. They see an idle
//! context (or the enclosing one for tasks released by a nested call).

use crate::thread_context::{self, released, with_context, ActiveGuard};
use rtfm::{ContextStatus, TaskKey, TransactionResult};
use std::ffi::c_void;

/// Transactional work or deferred task
pub type RtfmCallback = extern "C" fn(arg: *mut c_void);

/// Outcome of a transaction, as seen by C
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtfmResult {
    Committed = 0,
    AbortedByRequest = 1,
    AbortedByLanguage = 2,
    AbortedByCascade = 3,
    AbortedByFailedLockAcquisition = 4,
}

impl From<TransactionResult> for RtfmResult {
    fn from(result: TransactionResult) -> Self {
        match result {
            TransactionResult::Committed => RtfmResult::Committed,
            TransactionResult::AbortedByRequest => RtfmResult::AbortedByRequest,
            TransactionResult::AbortedByLanguage => RtfmResult::AbortedByLanguage,
            TransactionResult::AbortedByCascade => RtfmResult::AbortedByCascade,
            TransactionResult::AbortedByFailedLockAcquisition => {
                RtfmResult::AbortedByFailedLockAcquisition
            }
        }
    }
}

/// Context status, as seen by C
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtfmStatus {
    Idle = 0,
    OnTrack = 1,
    AbortedByRequest = 2,
    AbortedByLanguage = 3,
    AbortedByFailedLockAcquisition = 4,
    AbortedByCascade = 5,
    Committing = 6,
}

impl From<ContextStatus> for RtfmStatus {
    fn from(status: ContextStatus) -> Self {
        match status {
            ContextStatus::Idle => RtfmStatus::Idle,
            ContextStatus::OnTrack => RtfmStatus::OnTrack,
            ContextStatus::AbortedByRequest => RtfmStatus::AbortedByRequest,
            ContextStatus::AbortedByLanguage => RtfmStatus::AbortedByLanguage,
            ContextStatus::AbortedByFailedLockAcquisition => {
                RtfmStatus::AbortedByFailedLockAcquisition
            }
            ContextStatus::AbortedByCascade => RtfmStatus::AbortedByCascade,
            ContextStatus::Committing => RtfmStatus::Committing,
        }
    }
}

fn run_callback(ctx: &mut rtfm::Context, work: RtfmCallback, arg: *mut c_void) {
    let _active = ActiveGuard::enter(ctx);
    work(arg);
}

// ============================================================================
// TRANSACTIONS
// ============================================================================

#[no_mangle]
pub extern "C" fn rtfm_transact(work: RtfmCallback, arg: *mut c_void) -> RtfmResult {
    with_context(|ctx| {
        thread_context::refresh_function_table(ctx);
        ctx.transact(|tx| {
            run_callback(tx, work, arg);
            tx.ensure_on_track()
        })
        .into()
    })
}

/// Like `rtfm_transact`; anything but a commit is fatal
#[no_mangle]
pub extern "C" fn rtfm_commit(work: RtfmCallback, arg: *mut c_void) {
    with_context(|ctx| {
        thread_context::refresh_function_table(ctx);
        ctx.commit(|tx| {
            run_callback(tx, work, arg);
            tx.ensure_on_track()
        })
    })
}

#[no_mangle]
pub extern "C" fn rtfm_start_transaction() -> bool {
    with_context(|ctx| {
        thread_context::refresh_function_table(ctx);
        ctx.start_transaction()
    })
}

#[no_mangle]
pub extern "C" fn rtfm_commit_transaction() -> RtfmResult {
    with_context(|ctx| ctx.commit_transaction().into())
}

#[no_mangle]
pub extern "C" fn rtfm_abort_transaction() -> RtfmResult {
    with_context(|ctx| ctx.abort_transaction().into())
}

/// Abort the innermost transaction at the caller's request
#[no_mangle]
pub extern "C" fn rtfm_abort() {
    with_context(|ctx| {
        let _ = ctx.abort_by_request::<()>();
    })
}

#[no_mangle]
pub extern "C" fn rtfm_cascading_abort() {
    with_context(|ctx| {
        let _ = ctx.cascading_abort::<()>();
    })
}

// ============================================================================
// OPEN / CLOSED
// ============================================================================

/// Run `work` without recording its writes
#[no_mangle]
pub extern "C" fn rtfm_open(work: RtfmCallback, arg: *mut c_void) {
    with_context(|ctx| ctx.open(|ctx| run_callback(ctx, work, arg)))
}

/// Run `work` closed from inside open code; returns the status afterwards
#[no_mangle]
pub extern "C" fn rtfm_close(work: RtfmCallback, arg: *mut c_void) -> RtfmStatus {
    with_context(|ctx| {
        ctx.close(|ctx| {
            run_callback(ctx, work, arg);
            ctx.ensure_on_track()
        })
        .into()
    })
}

#[no_mangle]
pub extern "C" fn rtfm_is_transactional() -> bool {
    with_context(|ctx| ctx.is_transactional())
}

#[no_mangle]
pub extern "C" fn rtfm_is_closed() -> bool {
    with_context(|ctx| ctx.is_closed())
}

// ============================================================================
// WRITE RECORDING
// ============================================================================

/// Snapshot `size` bytes at `ptr` before closed code writes them
///
/// Returns false once the transaction has aborted: nothing was recorded and
/// the store should be skipped.
///
/// # Safety
///
/// The range must be valid for reads now and for writes until the outermost
/// transaction finishes.
#[no_mangle]
pub unsafe extern "C" fn rtfm_record_write(ptr: *const c_void, size: usize) -> bool {
    with_context(|ctx| ctx.record_write(ptr as *const u8, size).is_ok())
}

/// Like [`rtfm_record_write`], for stores made by open code
///
/// # Safety
///
/// Same as [`rtfm_record_write`].
#[no_mangle]
pub unsafe extern "C" fn rtfm_record_open_write(ptr: *const c_void, size: usize) -> bool {
    with_context(|ctx| ctx.record_open_write(ptr as *const u8, size).is_ok())
}

#[no_mangle]
pub extern "C" fn rtfm_did_allocate(ptr: *const c_void, size: usize) {
    with_context(|ctx| ctx.did_allocate(ptr as *const u8, size))
}

// ============================================================================
// FUNCTIONS
// ============================================================================

/// Register `substitute` as the closed variant of `original`
///
/// A conflicting registration keeps the first substitute and is logged.
#[no_mangle]
pub extern "C" fn rtfm_register_open_function(original: *const c_void, substitute: *const c_void) {
    if let Err(e) =
        thread_context::register_open_function(original as *const (), substitute as *const ())
    {
        thread_context::log_registration_error(&e);
    }
}

/// Closed variant of `original`; null after aborting by language on a miss
#[no_mangle]
pub extern "C" fn rtfm_lookup_function(original: *const c_void) -> *const c_void {
    with_context(|ctx| match ctx.lookup_function(original as *const ()) {
        Ok(substitute) => substitute.as_ptr() as *const c_void,
        Err(_) => std::ptr::null(),
    })
}

// ============================================================================
// CHECKS
// ============================================================================

#[no_mangle]
pub extern "C" fn rtfm_check_consistency() {
    with_context(|ctx| ctx.check_consistency())
}

/// Compare the caller's ABI descriptor with this runtime; fatal on mismatch
///
/// # Safety
///
/// `blob` must point to `len` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn rtfm_check_abi(blob: *const u8, len: usize) {
    if blob.is_null() {
        rtfm::fatal!("ABI check with a null descriptor");
    }
    let bytes = std::slice::from_raw_parts(blob, len);
    rtfm::abi::check_abi(bytes);
}

// ============================================================================
// DEFERRED TASKS
// ============================================================================

#[no_mangle]
pub extern "C" fn rtfm_on_commit(task: RtfmCallback, arg: *mut c_void) {
    with_context(|ctx| ctx.defer_until_commit(released(move || task(arg))))
}

#[no_mangle]
pub extern "C" fn rtfm_on_abort(task: RtfmCallback, arg: *mut c_void) {
    with_context(|ctx| ctx.defer_until_abort(released(move || task(arg))))
}

#[no_mangle]
pub extern "C" fn rtfm_push_on_abort_handler(key: *const c_void, task: RtfmCallback, arg: *mut c_void) {
    with_context(|ctx| ctx.push_on_abort_handler(TaskKey(key as usize), released(move || task(arg))))
}

#[no_mangle]
pub extern "C" fn rtfm_pop_on_abort_handler(key: *const c_void) -> bool {
    with_context(|ctx| ctx.pop_on_abort_handler(TaskKey(key as usize)))
}

// ============================================================================
// MEMORY
// ============================================================================

/// `malloc` whose block is freed again if the transaction aborts
#[no_mangle]
pub extern "C" fn rtfm_malloc(size: usize) -> *mut c_void {
    // SAFETY: plain libc allocation
    let ptr = unsafe { libc::malloc(size) };
    if ptr.is_null() {
        return ptr;
    }
    with_context(|ctx| {
        if ctx.is_closed() {
            ctx.did_allocate(ptr as *const u8, size);
            let block = ptr as usize;
            // SAFETY: the block is only reachable from the aborted transaction
            ctx.defer_until_abort(released(move || unsafe { libc::free(block as *mut c_void) }));
        }
    });
    ptr
}

/// `free` deferred until commit in closed code
///
/// # Safety
///
/// `ptr` must be null or come from `rtfm_malloc`/`malloc` and not be freed
/// twice.
#[no_mangle]
pub unsafe extern "C" fn rtfm_free(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    let deferred = with_context(|ctx| {
        if ctx.is_closed() {
            let block = ptr as usize;
            ctx.defer_until_commit(released(move || libc::free(block as *mut c_void)));
            true
        } else {
            false
        }
    });
    if !deferred {
        libc::free(ptr);
    }
}

/// Transactional `memcpy`; the copy is skipped once the transaction aborted
///
/// # Safety
///
/// Same contract as C `memcpy`.
#[no_mangle]
pub unsafe extern "C" fn rtfm_memcpy(dst: *mut c_void, src: *const c_void, n: usize) -> *mut c_void {
    with_context(|ctx| {
        let _ = ctx.copy_nonoverlapping(src as *const u8, dst as *mut u8, n);
    });
    dst
}

/// Transactional `memmove`
///
/// # Safety
///
/// Same contract as C `memmove`.
#[no_mangle]
pub unsafe extern "C" fn rtfm_memmove(dst: *mut c_void, src: *const c_void, n: usize) -> *mut c_void {
    with_context(|ctx| {
        let _ = ctx.copy(src as *const u8, dst as *mut u8, n);
    });
    dst
}

/// Transactional `memset`
///
/// # Safety
///
/// Same contract as C `memset`.
#[no_mangle]
pub unsafe extern "C" fn rtfm_memset(dst: *mut c_void, c: i32, n: usize) -> *mut c_void {
    with_context(|ctx| {
        let _ = ctx.write_bytes(dst as *mut u8, c as u8, n);
    });
    dst
}
