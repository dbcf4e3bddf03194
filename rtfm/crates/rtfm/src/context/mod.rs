//! Context - Per-Thread Transaction State
//!
//! The context owns the transaction chain of one logical thread and mediates
//! every public entry point: scoped and manual transactions, aborts, write
//! recording, open/closed execution and deferred tasks.
//!
//! ## Status state machine
//!
//! ```text
//!             transact / start_transaction
//!   Idle ────────────────────────────────────► OnTrack
//!    ▲                                          │   │
//!    │        commit tasks run                  │   │ abort_* / Err(Abort)
//!    ├──────────── Committing ◄─────────────────┘   ▼
//!    │                                      Aborted{ByRequest, ByLanguage,
//!    └──────────────── undo + abort tasks ◄──  ByCascade, ByFailedLock...}
//! ```
//!
//! `OnTrack` is never observed without a current transaction.
//!
//! ## Stack frames
//!
//! Scoped transactions take a frame marker in a non-inlined runtime frame and
//! call the closure through another non-inlined frame, so everything the
//! closure puts on the stack lies below the marker. Manual transactions use
//! the stack pointer at `start_transaction`, so stack slots of functions
//! called after it are treated as transient.

mod memory;

use crate::config::{InternalAbortAction, RuntimeConfig};
use crate::error::{Abort, Result, RtfmError, Transactional};
use crate::function_table::FunctionTable;
use crate::stack::{self, StackRange};
use crate::stats::TransactionStats;
use crate::task_array::{Task, TaskKey};
use crate::transaction::Transaction;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

/// Status of a context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextStatus {
    /// No transaction
    Idle,
    /// Transaction running normally
    OnTrack,
    AbortedByRequest,
    AbortedByLanguage,
    AbortedByFailedLockAcquisition,
    AbortedByCascade,
    /// Commit tasks running
    Committing,
}

impl ContextStatus {
    pub fn is_aborted(self) -> bool {
        self.abort_reason().is_some()
    }

    /// The abort carried by an aborted status
    pub fn abort_reason(self) -> Option<Abort> {
        match self {
            ContextStatus::AbortedByRequest => Some(Abort::ByRequest),
            ContextStatus::AbortedByLanguage => Some(Abort::ByLanguage),
            ContextStatus::AbortedByFailedLockAcquisition => Some(Abort::FailedLockAcquisition),
            ContextStatus::AbortedByCascade => Some(Abort::Cascade),
            ContextStatus::Idle | ContextStatus::OnTrack | ContextStatus::Committing => None,
        }
    }
}

impl From<Abort> for ContextStatus {
    fn from(abort: Abort) -> Self {
        match abort {
            Abort::ByRequest => ContextStatus::AbortedByRequest,
            Abort::ByLanguage => ContextStatus::AbortedByLanguage,
            Abort::FailedLockAcquisition => ContextStatus::AbortedByFailedLockAcquisition,
            Abort::Cascade => ContextStatus::AbortedByCascade,
        }
    }
}

/// Outcome of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionResult {
    Committed,
    AbortedByRequest,
    AbortedByLanguage,
    AbortedByCascade,
    /// Lock retries exhausted, or a manual transaction whose locks failed
    AbortedByFailedLockAcquisition,
}

impl TransactionResult {
    pub fn is_committed(self) -> bool {
        self == TransactionResult::Committed
    }
}

impl From<Abort> for TransactionResult {
    fn from(abort: Abort) -> Self {
        match abort {
            Abort::ByRequest => TransactionResult::AbortedByRequest,
            Abort::ByLanguage => TransactionResult::AbortedByLanguage,
            Abort::FailedLockAcquisition => TransactionResult::AbortedByFailedLockAcquisition,
            Abort::Cascade => TransactionResult::AbortedByCascade,
        }
    }
}

/// Whether writes are currently recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Writes are not logged
    Open,
    /// Writes are logged
    Closed,
}

/// Lock step consulted before an outer commit
///
/// `pre_acquire` is true on attempts that follow a lock failure: the hook
/// should take every contested lock up front rather than opportunistically.
pub trait CommitLocks {
    /// Try to take every lock the commit needs
    fn try_acquire(&mut self, pre_acquire: bool) -> bool;

    /// Release what `try_acquire` took, after commit tasks ran
    fn release(&mut self) {}
}

/// Commit without any lock
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLocks;

impl CommitLocks for NoLocks {
    fn try_acquire(&mut self, _pre_acquire: bool) -> bool {
        true
    }
}

/// Closure adapter for [`CommitLocks`]
pub struct LockHook<F>(pub F);

impl<F: FnMut(bool) -> bool> CommitLocks for LockHook<F> {
    fn try_acquire(&mut self, pre_acquire: bool) -> bool {
        (self.0)(pre_acquire)
    }
}

/// Context - one per logical thread
pub struct Context {
    current: Option<Box<Transaction>>,
    stack: StackRange,
    /// Frame marker of the outermost transaction, 0 when idle
    outer_frame: usize,
    pre_acquire_locks: bool,
    status: ContextStatus,
    mode: ExecutionMode,
    functions: Arc<FunctionTable>,
    config: RuntimeConfig,
    stats: TransactionStats,
    /// Nesting of `transact` calls running with the runtime disabled
    disabled_depth: usize,
}

impl Context {
    /// Create a context for the calling thread
    ///
    /// # Errors
    ///
    /// Returns `RtfmError::Configuration` when `config` does not validate.
    pub fn new(config: RuntimeConfig, functions: Arc<FunctionTable>) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config, functions))
    }

    /// Context with the default configuration and an empty function table
    pub fn with_defaults() -> Self {
        Self::build(RuntimeConfig::default(), FunctionTable::empty())
    }

    fn build(config: RuntimeConfig, functions: Arc<FunctionTable>) -> Self {
        let stack = StackRange::current();
        log::debug!(
            "context created: stack {:#x}..{:#x}, {} redirections",
            stack.low,
            stack.high,
            functions.len()
        );
        Self {
            current: None,
            stack,
            outer_frame: 0,
            pre_acquire_locks: false,
            status: ContextStatus::Idle,
            mode: ExecutionMode::Closed,
            functions,
            config,
            stats: TransactionStats::new(),
            disabled_depth: 0,
        }
    }

    // ========================================================================
    // SCOPED TRANSACTIONS
    // ========================================================================

    /// Run `work` as a transaction
    ///
    /// Outside a transaction this starts an outer transaction, which commits,
    /// aborts, or retries after a lock failure. Inside one it starts a nested
    /// transaction, which folds into its parent on success and unwinds alone
    /// on failure. A nested `AbortedByRequest` leaves the parent on track;
    /// any other nested abort leaves the parent aborted as well.
    ///
    /// `work` may run more than once (lock retries, debug retry mode).
    pub fn transact<F>(&mut self, work: F) -> TransactionResult
    where
        F: FnMut(&mut Context) -> Transactional<()>,
    {
        self.transact_with_locks(&mut NoLocks, work)
    }

    /// Like [`Context::transact`], consulting `locks` before an outer commit
    ///
    /// Nested transactions never consult the hook.
    pub fn transact_with_locks<F>(&mut self, locks: &mut dyn CommitLocks, mut work: F) -> TransactionResult
    where
        F: FnMut(&mut Context) -> Transactional<()>,
    {
        if !self.config.enabled {
            return self.run_disabled(&mut work);
        }
        if self.current.is_some() {
            self.transact_nested(&mut work)
        } else {
            self.transact_outer(locks, &mut work)
        }
    }

    /// Like [`Context::transact`], but anything other than a commit is fatal
    pub fn commit<F>(&mut self, work: F)
    where
        F: FnMut(&mut Context) -> Transactional<()>,
    {
        let result = self.transact(work);
        if !result.is_committed() {
            crate::fatal!("transaction required to commit ended with {:?}", result);
        }
    }

    #[inline(never)]
    fn transact_outer<F>(&mut self, locks: &mut dyn CommitLocks, work: &mut F) -> TransactionResult
    where
        F: FnMut(&mut Context) -> Transactional<()>,
    {
        let frame_marker = 0u8;
        let frame = std::hint::black_box(&frame_marker) as *const u8 as usize;

        self.begin_outer(frame, false);
        let depth = self.depth();
        let mut debug_retry = self.config.retry.applies_to(false);
        let mut lock_failures = 0u32;

        let result = loop {
            let outcome = run_closed(self, work);
            let mut status = self.settle(outcome, depth);

            if status == ContextStatus::OnTrack {
                if debug_retry {
                    debug_retry = false;
                    log::debug!("debug retry of outer transaction");
                    self.rollback_outer();
                    self.restart_outer();
                    if self.config.stats_enabled {
                        self.stats.record_debug_retry();
                    }
                    continue;
                }

                self.status = ContextStatus::Committing;
                let pre_acquire = self.pre_acquire_locks;
                let committed = match self.current.as_deref_mut() {
                    Some(tx) => tx.attempt_to_commit_outer_nest(&mut *locks, pre_acquire),
                    None => None,
                };
                match committed {
                    Some(tasks_run) => {
                        log::debug!("outer transaction committed, {} commit tasks run", tasks_run);
                        if self.config.stats_enabled {
                            self.stats.record_commit(tasks_run);
                        }
                        break TransactionResult::Committed;
                    }
                    None => {
                        self.status = ContextStatus::AbortedByFailedLockAcquisition;
                        status = self.status;
                    }
                }
            }

            let reason = match status.abort_reason() {
                Some(reason) => reason,
                None => crate::fatal!("outer transaction settled in {:?}", status),
            };
            let tasks_run = self.rollback_outer();
            if self.config.stats_enabled {
                self.stats.record_abort(reason, tasks_run);
            }

            if reason == Abort::FailedLockAcquisition {
                lock_failures += 1;
                if let Some(max) = self.config.max_lock_retries {
                    if lock_failures > max {
                        log::warn!("giving up after {} lock retries", max);
                        break TransactionResult::AbortedByFailedLockAcquisition;
                    }
                }
                log::debug!("retrying outer transaction with lock pre-acquisition");
                self.pre_acquire_locks = true;
                self.restart_outer();
                if self.config.stats_enabled {
                    self.stats.record_lock_retry();
                }
                continue;
            }

            break reason.into();
        };

        self.end_outer();
        result
    }

    #[inline(never)]
    fn transact_nested<F>(&mut self, work: &mut F) -> TransactionResult
    where
        F: FnMut(&mut Context) -> Transactional<()>,
    {
        if let Some(reason) = self.status.abort_reason() {
            log::debug!("nested transaction skipped: parent already {:?}", self.status);
            return reason.into();
        }

        let frame_marker = 0u8;
        let frame = std::hint::black_box(&frame_marker) as *const u8 as usize;

        let saved_mode = self.mode;
        self.begin_nested(frame, false);
        let depth = self.depth();
        let mut debug_retry = self.config.retry.applies_to(true);

        let result = loop {
            let outcome = run_closed(self, work);
            let status = self.settle(outcome, depth);

            if status == ContextStatus::OnTrack {
                if debug_retry {
                    debug_retry = false;
                    log::debug!("debug retry of nested transaction");
                    self.rollback_nested_in_place();
                    if self.config.stats_enabled {
                        self.stats.record_debug_retry();
                    }
                    continue;
                }
                self.fold_nested();
                break TransactionResult::Committed;
            }

            match status.abort_reason() {
                Some(reason) => break self.unwind_nested(reason),
                None => crate::fatal!("nested transaction settled in {:?}", status),
            }
        };

        self.mode = saved_mode;
        result
    }

    fn run_disabled<F>(&mut self, work: &mut F) -> TransactionResult
    where
        F: FnMut(&mut Context) -> Transactional<()>,
    {
        log::trace!("runtime disabled, running work open");
        let saved_mode = self.mode;
        self.mode = ExecutionMode::Open;
        self.disabled_depth += 1;
        let outcome = work(self);
        self.disabled_depth -= 1;
        self.mode = saved_mode;
        match outcome {
            Ok(()) => TransactionResult::Committed,
            Err(abort) => abort.into(),
        }
    }

    // ========================================================================
    // MANUAL TRANSACTIONS
    // ========================================================================

    /// Begin a transaction without a scope
    ///
    /// Returns false when the runtime is disabled or the enclosing
    /// transaction has already aborted.
    pub fn start_transaction(&mut self) -> bool {
        if !self.config.enabled {
            log::warn!("start_transaction with the runtime disabled");
            return false;
        }

        let frame = stack::approximate_stack_pointer();
        if self.current.is_none() {
            self.begin_outer(frame, true);
            return true;
        }
        if self.status != ContextStatus::OnTrack {
            return false;
        }
        self.begin_nested(frame, true);
        true
    }

    /// Commit the innermost manual transaction
    ///
    /// An already aborted transaction is rolled back and its abort returned.
    /// Fatal outside a manual transaction.
    pub fn commit_transaction(&mut self) -> TransactionResult {
        let nested = self.require_manual("commit_transaction");
        if let Some(tx) = self.current.as_deref_mut() {
            tx.set_done();
        }

        if let Some(reason) = self.status.abort_reason() {
            return self.finish_manual_abort(reason, nested);
        }

        if nested {
            self.fold_nested();
            return TransactionResult::Committed;
        }

        self.status = ContextStatus::Committing;
        let tasks_run = self
            .current
            .as_deref_mut()
            .and_then(|tx| tx.attempt_to_commit_outer_nest(&mut NoLocks, false))
            .unwrap_or(0);
        if self.config.stats_enabled {
            self.stats.record_commit(tasks_run);
        }
        self.end_outer();
        TransactionResult::Committed
    }

    /// Abort the innermost manual transaction
    ///
    /// Fatal outside a manual transaction.
    pub fn abort_transaction(&mut self) -> TransactionResult {
        let nested = self.require_manual("abort_transaction");
        if let Some(tx) = self.current.as_deref_mut() {
            tx.set_done();
        }
        if self.status == ContextStatus::OnTrack {
            self.note_abort(Abort::ByRequest);
        }
        let reason = self.status.abort_reason().unwrap_or(Abort::ByRequest);
        self.finish_manual_abort(reason, nested)
    }

    fn require_manual(&self, operation: &str) -> bool {
        match self.current.as_deref() {
            Some(tx) if tx.is_manual() => tx.is_nested(),
            Some(_) => crate::fatal!("{} on a scoped transaction", operation),
            None => crate::fatal!("{} outside a transaction", operation),
        }
    }

    fn finish_manual_abort(&mut self, reason: Abort, nested: bool) -> TransactionResult {
        if nested {
            return self.unwind_nested(reason);
        }
        let tasks_run = self.rollback_outer();
        if self.config.stats_enabled {
            self.stats.record_abort(reason, tasks_run);
        }
        self.end_outer();
        reason.into()
    }

    // ========================================================================
    // ABORTS
    // ========================================================================

    /// Abort the innermost transaction at the caller's request
    ///
    /// Return the error with `?`; the nearest `transact` undoes the
    /// transaction and runs its abort tasks.
    pub fn abort_by_request<T>(&mut self) -> Transactional<T> {
        self.abort_with(Abort::ByRequest)
    }

    /// Abort because the code cannot run transactionally
    ///
    /// Fatal instead when `internal_abort_action` is `Crash`.
    pub fn abort_by_language<T>(&mut self) -> Transactional<T> {
        self.abort_with(Abort::ByLanguage)
    }

    /// Abort because a lock needed for commit is taken
    ///
    /// The outer transaction retries with lock pre-acquisition.
    pub fn abort_by_failed_lock_acquisition<T>(&mut self) -> Transactional<T> {
        self.abort_with(Abort::FailedLockAcquisition)
    }

    /// Abort every nesting level
    pub fn cascading_abort<T>(&mut self) -> Transactional<T> {
        self.abort_with(Abort::Cascade)
    }

    fn abort_with<T>(&mut self, abort: Abort) -> Transactional<T> {
        if self.current.is_none() {
            if self.disabled_depth > 0 {
                return Err(abort);
            }
            crate::fatal!("{} requested outside a transaction", abort);
        }
        if self.status == ContextStatus::OnTrack {
            self.note_abort(abort);
        }
        Err(self.status.abort_reason().unwrap_or(abort))
    }

    /// `Err` with the pending abort when the transaction is no longer on track
    ///
    /// Useful after a nested `transact` returned anything but a commit.
    pub fn ensure_on_track(&self) -> Transactional<()> {
        match self.status.abort_reason() {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }

    fn note_abort(&mut self, abort: Abort) {
        if abort == Abort::ByLanguage {
            if self.config.internal_abort_action == InternalAbortAction::Crash {
                crate::fatal!("transaction aborted by language at depth {}", self.depth());
            }
            if self.config.ensure_on_internal_abort {
                log::error!("transaction aborted by language at depth {}", self.depth());
            }
        }
        log::debug!("transaction at depth {} aborting: {}", self.depth(), abort);
        self.status = abort.into();
    }

    // ========================================================================
    // WRITE RECORDING
    // ========================================================================

    /// Snapshot `[address, address + size)` before closed code writes to it
    ///
    /// A no-op in open code. Returns the pending abort once the transaction is
    /// no longer on track. Fatal outside a transaction.
    ///
    /// # Safety
    ///
    /// The range must be valid for reads now and for writes until the
    /// outermost transaction finishes.
    pub unsafe fn record_write(&mut self, address: *const u8, size: usize) -> Transactional<()> {
        if self.mode == ExecutionMode::Open {
            return Ok(());
        }
        self.record(address, size)
    }

    /// Snapshot a region written by open code, so it is still undone on abort
    ///
    /// # Safety
    ///
    /// Same as [`Context::record_write`].
    pub unsafe fn record_open_write(&mut self, address: *const u8, size: usize) -> Transactional<()> {
        self.record(address, size)
    }

    unsafe fn record(&mut self, address: *const u8, size: usize) -> Transactional<()> {
        let tx = match self.current.as_deref_mut() {
            Some(tx) => tx,
            None if self.disabled_depth > 0 => return Ok(()),
            None => crate::fatal!("write to {:p} recorded outside a transaction", address),
        };
        if let Some(reason) = self.status.abort_reason() {
            return Err(reason);
        }
        let outcome = tx.record_write(address as usize, size, &self.stack);
        if self.config.stats_enabled {
            self.stats.record_write(outcome);
        }
        Ok(())
    }

    /// Tell the runtime `[address, address + size)` was allocated in this
    /// transaction and needs no snapshot
    ///
    /// Freeing it on abort is up to the caller (see [`Context::alloc`]).
    pub fn did_allocate(&mut self, address: *const u8, size: usize) {
        if let Some(tx) = self.current.as_deref_mut() {
            tx.did_allocate(address as usize, size);
        }
    }

    // ========================================================================
    // DEFERRED TASKS
    // ========================================================================

    /// Run `task` when the outermost transaction commits
    ///
    /// Outside a transaction the task runs immediately.
    pub fn defer_until_commit(&mut self, task: impl FnOnce() + 'static) {
        match self.current.as_deref_mut() {
            Some(tx) => tx.push_commit_task(Task::new(task)),
            None => task(),
        }
    }

    /// Run `task` if the innermost transaction aborts
    ///
    /// Outside a transaction the task is dropped.
    pub fn defer_until_abort(&mut self, task: impl FnOnce() + 'static) {
        match self.current.as_deref_mut() {
            Some(tx) => tx.push_abort_task(Task::new(task)),
            None => log::trace!("abort task dropped outside a transaction"),
        }
    }

    /// Register an abort task that can be withdrawn by `key`
    pub fn push_on_abort_handler(&mut self, key: TaskKey, task: impl FnOnce() + 'static) {
        match self.current.as_deref_mut() {
            Some(tx) => tx.push_abort_task(Task::keyed(key, task)),
            None => log::trace!("abort handler {:?} dropped outside a transaction", key),
        }
    }

    /// Withdraw the most recent abort handler registered with `key`
    pub fn pop_on_abort_handler(&mut self, key: TaskKey) -> bool {
        let popped = self
            .current
            .as_deref_mut()
            .map_or(false, |tx| tx.abort_tasks_mut().pop_key(key).is_some());
        if !popped {
            log::warn!("no abort handler registered for {:?}", key);
        }
        popped
    }

    // ========================================================================
    // OPEN / CLOSED EXECUTION
    // ========================================================================

    /// Run `work` without recording writes
    pub fn open<R>(&mut self, work: impl FnOnce(&mut Context) -> R) -> R {
        if self.current.is_none() {
            return work(self);
        }
        let saved_mode = self.mode;
        self.mode = ExecutionMode::Open;
        let result = work(self);
        self.mode = saved_mode;
        result
    }

    /// Run `work` with writes recorded again, from inside open code
    ///
    /// Returns the status afterwards. Fatal outside a transaction.
    pub fn close(&mut self, work: impl FnOnce(&mut Context) -> Transactional<()>) -> ContextStatus {
        if self.current.is_none() {
            crate::fatal!("close outside a transaction");
        }
        let saved_mode = self.mode;
        self.mode = ExecutionMode::Closed;
        if let Err(abort) = work(self) {
            if self.status == ContextStatus::OnTrack {
                self.note_abort(abort);
            }
        }
        self.mode = saved_mode;
        self.status
    }

    // ========================================================================
    // FUNCTION REDIRECTION
    // ========================================================================

    /// Substitute registered for `original`; a miss aborts by language
    pub fn lookup_function(&mut self, original: *const ()) -> Transactional<NonNull<()>> {
        match self.functions.lookup(original) {
            Some(substitute) => Ok(substitute),
            None => {
                log::debug!("no transactional substitute for {:p}", original);
                self.abort_by_language()
            }
        }
    }

    /// Look up `original` and cast the substitute to the function type `S`
    ///
    /// # Safety
    ///
    /// `S` must be the function pointer type the substitute was registered
    /// with.
    pub unsafe fn resolve<S: Copy>(&mut self, original: *const ()) -> Transactional<S> {
        if std::mem::size_of::<S>() != std::mem::size_of::<*const ()>() {
            crate::fatal!(
                "resolve target type is {} bytes, not a function pointer",
                std::mem::size_of::<S>()
            );
        }
        let substitute = self.lookup_function(original)?;
        Ok(std::mem::transmute_copy::<*mut (), S>(&substitute.as_ptr()))
    }

    /// Replace the function table; refused while a transaction runs
    pub fn set_function_table(&mut self, functions: Arc<FunctionTable>) -> Result<()> {
        if self.current.is_some() {
            return Err(RtfmError::InvalidArgument(
                "function table cannot change inside a transaction".to_string(),
            ));
        }
        self.functions = functions;
        Ok(())
    }

    pub fn functions(&self) -> &Arc<FunctionTable> {
        &self.functions
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub fn status(&self) -> ContextStatus {
        self.status
    }

    /// Whether a transaction is active
    pub fn is_transactional(&self) -> bool {
        self.current.is_some()
    }

    /// Whether writes are being recorded right now
    pub fn is_closed(&self) -> bool {
        self.current.is_some() && self.mode == ExecutionMode::Closed
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Nesting depth, 0 when idle
    pub fn depth(&self) -> usize {
        self.current.as_deref().map_or(0, Transaction::depth)
    }

    pub fn pre_acquire_locks(&self) -> bool {
        self.pre_acquire_locks
    }

    pub fn stack_range(&self) -> StackRange {
        self.stack
    }

    pub fn current_transaction(&self) -> Option<&Transaction> {
        self.current.as_deref()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn stats(&self) -> &TransactionStats {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats.reset();
    }

    /// Whether `address` is transient stack of the innermost transaction
    pub fn is_inner_transaction_stack(&self, address: *const u8) -> bool {
        self.current
            .as_deref()
            .map_or(false, |tx| self.stack.is_below_frame(address as usize, tx.frame()))
    }

    /// Whether `address` is transient stack of the outermost transaction
    pub fn is_transaction_stack(&self, address: *const u8) -> bool {
        self.current.is_some() && self.stack.is_below_frame(address as usize, self.outer_frame)
    }

    /// Validate status and chain invariants; fatal on violation
    pub fn check_consistency(&self) {
        match (&self.current, self.status) {
            (None, ContextStatus::Idle) => {}
            (None, status) => crate::fatal!("status {:?} without a transaction", status),
            (Some(_), ContextStatus::Idle) => crate::fatal!("idle status with an active transaction"),
            (Some(tx), _) => {
                if self.outer_frame == 0 {
                    crate::fatal!("active transaction without an outer frame");
                }
                if let Err(message) = tx.check_consistency() {
                    crate::fatal!("{}", message);
                }
            }
        }
        if self.mode == ExecutionMode::Open && self.current.is_none() && self.disabled_depth == 0 {
            crate::fatal!("open mode without a transaction");
        }
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    fn begin_outer(&mut self, frame: usize, manual: bool) {
        log::debug!("begin outer transaction (manual = {})", manual);
        self.current = Some(Box::new(Transaction::new(None, frame, self.config.page_size, manual)));
        self.outer_frame = frame;
        self.pre_acquire_locks = false;
        self.status = ContextStatus::OnTrack;
        self.mode = ExecutionMode::Closed;
        if self.config.stats_enabled {
            self.stats.record_start(false);
        }
    }

    fn begin_nested(&mut self, frame: usize, manual: bool) {
        let parent = self.current.take();
        let tx = Transaction::new(parent, frame, self.config.page_size, manual);
        log::debug!("begin nested transaction at depth {} (manual = {})", tx.depth(), manual);
        self.current = Some(Box::new(tx));
        self.mode = ExecutionMode::Closed;
        if self.config.stats_enabled {
            self.stats.record_start(true);
        }
    }

    /// Mark user code finished and fold an `Err` into the status
    ///
    /// Manual transactions `work` left open above `depth` are aborted first,
    /// so the scoped transaction settles its own level.
    fn settle(&mut self, outcome: Transactional<()>, depth: usize) -> ContextStatus {
        self.mode = ExecutionMode::Closed;
        let unbalanced = self.depth().saturating_sub(depth);
        if unbalanced > 0 {
            log::warn!(
                "scoped transaction at depth {} ended with {} unbalanced manual transactions",
                depth,
                unbalanced
            );
            for _ in 0..unbalanced {
                if let Some(tx) = self.current.as_deref_mut() {
                    tx.set_done();
                }
                let reason = self.status.abort_reason().unwrap_or(Abort::ByRequest);
                self.unwind_nested(reason);
            }
        }
        if let Some(tx) = self.current.as_deref_mut() {
            tx.set_done();
        }
        if let Err(abort) = outcome {
            if self.status == ContextStatus::OnTrack {
                self.note_abort(abort);
            }
        }
        self.status
    }

    fn rollback_outer(&mut self) -> usize {
        let (restored, tasks_run) = match self.current.as_deref_mut() {
            // SAFETY: logged ranges were promised valid by record_write callers
            Some(tx) => unsafe { tx.abort_outer_nest(&self.stack) },
            None => crate::fatal!("rollback without a transaction"),
        };
        log::debug!(
            "outer transaction rolled back: {} entries restored, {} abort tasks run",
            restored,
            tasks_run
        );
        tasks_run
    }

    fn restart_outer(&mut self) {
        if let Some(tx) = self.current.as_deref_mut() {
            tx.reset();
        }
        self.status = ContextStatus::OnTrack;
        self.mode = ExecutionMode::Closed;
    }

    fn end_outer(&mut self) {
        if let Some(tx) = self.current.take() {
            if self.config.stats_enabled {
                self.stats
                    .record_log_size(tx.write_log().len(), tx.write_log().total_bytes());
            }
        }
        self.outer_frame = 0;
        self.pre_acquire_locks = false;
        self.status = ContextStatus::Idle;
        self.mode = ExecutionMode::Closed;
    }

    fn rollback_nested_in_place(&mut self) {
        if let Some(tx) = self.current.as_deref_mut() {
            // SAFETY: logged ranges were promised valid by record_write callers
            unsafe { tx.undo(&self.stack) };
            tx.abort_tasks_mut().run_reverse();
            tx.reset();
        }
        self.status = ContextStatus::OnTrack;
    }

    fn fold_nested(&mut self) {
        let tx = match self.current.take() {
            Some(tx) => tx,
            None => crate::fatal!("nested commit without a transaction"),
        };
        self.current = Some(tx.commit_nested(&self.stack));
        if self.config.stats_enabled {
            self.stats.record_commit(0);
        }
    }

    fn unwind_nested(&mut self, reason: Abort) -> TransactionResult {
        let tx = match self.current.take() {
            Some(tx) => tx,
            None => crate::fatal!("nested abort without a transaction"),
        };
        // SAFETY: logged ranges were promised valid by record_write callers
        let (parent, restored) = unsafe { tx.abort_nested(&self.stack) };
        self.current = Some(parent);
        log::debug!("nested transaction unwound ({}), {} entries restored", reason, restored);

        if self.config.stats_enabled {
            self.stats.record_abort(reason, 0);
        }
        if reason == Abort::ByRequest {
            self.status = ContextStatus::OnTrack;
        }
        reason.into()
    }
}

/// Call `work` from its own frame, below the caller's frame marker
#[inline(never)]
fn run_closed<F>(ctx: &mut Context, work: &mut F) -> Transactional<()>
where
    F: FnMut(&mut Context) -> Transactional<()>,
{
    work(ctx)
}

impl Default for Context {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("status", &self.status)
            .field("mode", &self.mode)
            .field("depth", &self.depth())
            .field("pre_acquire_locks", &self.pre_acquire_locks)
            .field("current", &self.current)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryTransactions;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    fn heap<T>(value: T) -> Box<T> {
        Box::new(value)
    }

    // ========================================================================
    // STATUS
    // ========================================================================

    #[test]
    fn test_fresh_context_is_idle() {
        let ctx = Context::with_defaults();
        assert_eq!(ctx.status(), ContextStatus::Idle);
        assert!(!ctx.is_transactional());
        assert!(!ctx.is_closed());
        assert_eq!(ctx.depth(), 0);
        ctx.check_consistency();
    }

    #[test]
    fn test_status_inside_transaction() {
        let mut ctx = Context::with_defaults();
        let result = ctx.transact(|tx| {
            assert_eq!(tx.status(), ContextStatus::OnTrack);
            assert!(tx.is_transactional());
            assert!(tx.is_closed());
            assert_eq!(tx.depth(), 1);
            tx.check_consistency();
            Ok(())
        });
        assert_eq!(result, TransactionResult::Committed);
        assert_eq!(ctx.status(), ContextStatus::Idle);
    }

    #[test]
    fn test_abort_reason_roundtrip() {
        for abort in [Abort::ByRequest, Abort::ByLanguage, Abort::Cascade, Abort::FailedLockAcquisition] {
            assert_eq!(ContextStatus::from(abort).abort_reason(), Some(abort));
        }
        assert!(!ContextStatus::OnTrack.is_aborted());
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    #[test]
    fn test_abort_restores_heap_value() {
        let mut ctx = Context::with_defaults();
        let mut x = heap(10u64);
        let p: *mut u64 = &mut *x;

        let result = ctx.transact(|tx| {
            unsafe { tx.write(p, 11)? };
            tx.abort_by_request()
        });
        assert_eq!(result, TransactionResult::AbortedByRequest);
        assert_eq!(*x, 10);
    }

    #[test]
    fn test_caller_stack_value_is_restored() {
        let mut ctx = Context::with_defaults();
        let mut x = 5u32;
        let p: *mut u32 = &mut x;

        let result = ctx.transact(|tx| {
            unsafe { tx.write(p, 6)? };
            Err(Abort::ByRequest)
        });
        assert_eq!(result, TransactionResult::AbortedByRequest);
        assert_eq!(x, 5);
    }

    #[test]
    fn test_closure_local_is_not_logged() {
        let mut ctx = Context::with_defaults();
        ctx.commit(|tx| {
            let mut local = 0u64;
            let p: *mut u64 = &mut local;
            std::hint::black_box(p);
            assert!(tx.is_inner_transaction_stack(p as *const u8));
            assert!(tx.is_transaction_stack(p as *const u8));
            unsafe { tx.write(p, 1)? };
            assert!(tx.current_transaction().map_or(false, |t| t.write_log().is_empty()));
            Ok(())
        });
    }

    #[test]
    fn test_open_writes_are_not_logged() {
        let mut ctx = Context::with_defaults();
        let mut x = heap(1u8);
        let p: *mut u8 = &mut *x;

        let result = ctx.transact(|tx| {
            tx.open(|open| {
                assert!(!open.is_closed());
                unsafe { open.write(p, 2) }
            })?;
            Err(Abort::ByRequest)
        });
        assert_eq!(result, TransactionResult::AbortedByRequest);
        assert_eq!(*x, 2);
    }

    #[test]
    fn test_record_open_write_is_undone() {
        let mut ctx = Context::with_defaults();
        let mut x = heap(1u8);
        let p: *mut u8 = &mut *x;

        ctx.transact(|tx| {
            tx.open(|open| -> Transactional<()> {
                unsafe {
                    open.record_open_write(p, 1)?;
                    *p = 3;
                }
                Ok(())
            })?;
            Err(Abort::ByRequest)
        });
        assert_eq!(*x, 1);
    }

    #[test]
    fn test_close_inside_open_records() {
        let mut ctx = Context::with_defaults();
        let mut x = heap(1u8);
        let p: *mut u8 = &mut *x;

        ctx.transact(|tx| {
            let status = tx.open(|open| open.close(|closed| unsafe { closed.write(p, 9) }));
            assert_eq!(status, ContextStatus::OnTrack);
            Err(Abort::ByRequest)
        });
        assert_eq!(*x, 1);
    }

    #[test]
    #[should_panic(expected = "close outside a transaction")]
    fn test_close_outside_transaction_is_fatal() {
        let mut ctx = Context::with_defaults();
        ctx.close(|_| Ok(()));
    }

    #[test]
    #[should_panic(expected = "recorded outside a transaction")]
    fn test_record_outside_transaction_is_fatal() {
        let mut ctx = Context::with_defaults();
        let x = 0u8;
        let _ = unsafe { ctx.record_write(&x, 1) };
    }

    #[test]
    #[should_panic(expected = "requested outside a transaction")]
    fn test_abort_outside_transaction_is_fatal() {
        let mut ctx = Context::with_defaults();
        let _ = ctx.abort_by_request::<()>();
    }

    // ========================================================================
    // ABORT POLICY
    // ========================================================================

    #[test]
    #[should_panic(expected = "aborted by language")]
    fn test_crash_on_language_abort() {
        let config = RuntimeConfig {
            internal_abort_action: InternalAbortAction::Crash,
            ..Default::default()
        };
        let mut ctx = Context::new(config, FunctionTable::empty()).unwrap();
        let _ = ctx.transact(|tx| tx.abort_by_language());
    }

    #[test]
    fn test_lookup_miss_aborts_by_language() {
        fn missing() {}
        let mut ctx = Context::with_defaults();
        let result = ctx.transact(|tx| {
            tx.lookup_function(missing as *const ())?;
            Ok(())
        });
        assert_eq!(result, TransactionResult::AbortedByLanguage);
    }

    #[test]
    fn test_status_stays_aborted_for_later_writes() {
        let mut ctx = Context::with_defaults();
        let mut x = heap(0u8);
        let p: *mut u8 = &mut *x;
        let result = ctx.transact(|tx| {
            let _ = tx.cascading_abort::<()>();
            let err = unsafe { tx.write(p, 1) }.unwrap_err();
            assert_eq!(err, Abort::Cascade);
            Ok(())
        });
        assert_eq!(result, TransactionResult::AbortedByCascade);
        assert_eq!(*x, 0);
    }

    // ========================================================================
    // NESTING
    // ========================================================================

    #[test]
    fn test_nested_abort_by_request_keeps_parent_on_track() {
        let mut ctx = Context::with_defaults();
        let mut x = heap(0u32);
        let p: *mut u32 = &mut *x;

        let result = ctx.transact(|tx| {
            unsafe { tx.write(p, 1)? };
            let inner = tx.transact(|nested| {
                unsafe { nested.write(p, 2)? };
                Err(Abort::ByRequest)
            });
            assert_eq!(inner, TransactionResult::AbortedByRequest);
            assert_eq!(unsafe { *p }, 1);
            assert_eq!(tx.status(), ContextStatus::OnTrack);
            Ok(())
        });
        assert_eq!(result, TransactionResult::Committed);
        assert_eq!(*x, 1);
    }

    #[test]
    fn test_nested_language_abort_reaches_parent() {
        let mut ctx = Context::with_defaults();
        let result = ctx.transact(|tx| {
            let inner = tx.transact(|nested| nested.abort_by_language());
            assert_eq!(inner, TransactionResult::AbortedByLanguage);
            assert!(tx.ensure_on_track().is_err());
            Ok(())
        });
        assert_eq!(result, TransactionResult::AbortedByLanguage);
    }

    #[test]
    fn test_nested_depth() {
        let mut ctx = Context::with_defaults();
        ctx.commit(|tx| {
            tx.commit(|nested| {
                assert_eq!(nested.depth(), 2);
                Ok(())
            });
            assert_eq!(tx.depth(), 1);
            Ok(())
        });
    }

    // ========================================================================
    // MANUAL TRANSACTIONS
    // ========================================================================

    #[test]
    fn test_manual_commit() {
        let mut ctx = Context::with_defaults();
        let mut x = heap(0u16);
        let p: *mut u16 = &mut *x;

        assert!(ctx.start_transaction());
        unsafe { ctx.write(p, 7).unwrap() };
        assert_eq!(ctx.commit_transaction(), TransactionResult::Committed);
        assert_eq!(*x, 7);
        assert_eq!(ctx.status(), ContextStatus::Idle);
    }

    #[test]
    fn test_manual_abort() {
        let mut ctx = Context::with_defaults();
        let mut x = heap(0u16);
        let p: *mut u16 = &mut *x;

        assert!(ctx.start_transaction());
        unsafe { ctx.write(p, 7).unwrap() };
        assert!(ctx.start_transaction());
        unsafe { ctx.write(p, 8).unwrap() };
        assert_eq!(ctx.abort_transaction(), TransactionResult::AbortedByRequest);
        assert_eq!(*x, 7);
        assert_eq!(ctx.abort_transaction(), TransactionResult::AbortedByRequest);
        assert_eq!(*x, 0);
        assert!(!ctx.is_transactional());
    }

    #[test]
    fn test_unbalanced_manual_nest_aborts_with_scope() {
        let mut ctx = Context::with_defaults();
        let mut x = heap(0u16);
        let p: *mut u16 = &mut *x;

        let result = ctx.transact(|tx| {
            unsafe { tx.write(p, 1)? };
            assert!(tx.start_transaction());
            unsafe { tx.write(p, 2)? };
            Err(Abort::ByRequest)
        });
        assert_eq!(result, TransactionResult::AbortedByRequest);
        assert_eq!(*x, 0);
        assert_eq!(ctx.status(), ContextStatus::Idle);
        assert!(!ctx.is_transactional());
    }

    #[test]
    fn test_unbalanced_manual_nest_keeps_scope_commit_tasks() {
        let mut ctx = Context::with_defaults();
        let mut x = heap(0u16);
        let p: *mut u16 = &mut *x;
        let ran = Rc::new(Cell::new(false));

        let result = ctx.transact(|tx| {
            let ran = Rc::clone(&ran);
            tx.defer_until_commit(move || ran.set(true));
            unsafe { tx.write(p, 1)? };
            assert!(tx.start_transaction());
            unsafe { tx.write(p, 2)? };
            Ok(())
        });
        assert_eq!(result, TransactionResult::Committed);
        assert!(ran.get());
        assert_eq!(*x, 1);
        assert_eq!(ctx.status(), ContextStatus::Idle);
    }

    #[test]
    fn test_unbalanced_manual_nest_inside_nested_scope() {
        let mut ctx = Context::with_defaults();
        let mut x = heap(0u16);
        let p: *mut u16 = &mut *x;

        let result = ctx.transact(|tx| {
            unsafe { tx.write(p, 1)? };
            let nested = tx.transact(|inner| {
                unsafe { inner.write(p, 2)? };
                assert!(inner.start_transaction());
                assert!(inner.start_transaction());
                unsafe { inner.write(p, 3)? };
                Ok(())
            });
            assert_eq!(nested, TransactionResult::Committed);
            assert_eq!(tx.depth(), 1);
            Ok(())
        });
        assert_eq!(result, TransactionResult::Committed);
        assert_eq!(*x, 2);
    }

    #[test]
    #[should_panic(expected = "commit_transaction outside a transaction")]
    fn test_manual_commit_without_start_is_fatal() {
        let mut ctx = Context::with_defaults();
        ctx.commit_transaction();
    }

    // ========================================================================
    // TASKS
    // ========================================================================

    #[test]
    fn test_defer_outside_transaction() {
        let mut ctx = Context::with_defaults();
        let ran = Rc::new(Cell::new(0));
        let r = Rc::clone(&ran);
        ctx.defer_until_commit(move || r.set(r.get() + 1));
        let r = Rc::clone(&ran);
        ctx.defer_until_abort(move || r.set(r.get() + 10));
        assert_eq!(ran.get(), 1);
    }

    #[test]
    fn test_abort_handler_pop() {
        let mut ctx = Context::with_defaults();
        let log = Rc::new(RefCell::new(Vec::new()));
        let result = ctx.transact(|tx| {
            let sink = Rc::clone(&log);
            tx.push_on_abort_handler(TaskKey(1), move || sink.borrow_mut().push("one"));
            let sink = Rc::clone(&log);
            tx.push_on_abort_handler(TaskKey(2), move || sink.borrow_mut().push("two"));
            assert!(tx.pop_on_abort_handler(TaskKey(2)));
            assert!(!tx.pop_on_abort_handler(TaskKey(3)));
            Err(Abort::ByRequest)
        });
        assert_eq!(result, TransactionResult::AbortedByRequest);
        assert_eq!(*log.borrow(), vec!["one"]);
    }

    // ========================================================================
    // CONFIGURATION
    // ========================================================================

    #[test]
    fn test_disabled_runtime_runs_open() {
        let config = RuntimeConfig {
            enabled: false,
            ..Default::default()
        };
        let mut ctx = Context::new(config, FunctionTable::empty()).unwrap();
        let mut x = heap(0u8);
        let p: *mut u8 = &mut *x;

        let result = ctx.transact(|tx| {
            assert!(!tx.is_transactional());
            unsafe { tx.write(p, 4)? };
            tx.abort_by_request()
        });
        assert_eq!(result, TransactionResult::AbortedByRequest);
        assert_eq!(*x, 4);
        assert!(!ctx.start_transaction());
    }

    #[test]
    fn test_debug_retry_runs_work_twice() {
        let config = RuntimeConfig {
            retry: RetryTransactions::RetryNonNested,
            ..Default::default()
        };
        let mut ctx = Context::new(config, FunctionTable::empty()).unwrap();
        let mut x = heap(0u32);
        let p: *mut u32 = &mut *x;
        let runs = Cell::new(0);

        let result = ctx.transact(|tx| {
            runs.set(runs.get() + 1);
            let current = unsafe { *p };
            unsafe { tx.write(p, current + 1) }
        });
        assert_eq!(result, TransactionResult::Committed);
        assert_eq!(runs.get(), 2);
        assert_eq!(*x, 1);
        assert_eq!(ctx.stats().summary().debug_retries, 1);
    }

    #[test]
    fn test_set_function_table_refused_inside_transaction() {
        let mut ctx = Context::with_defaults();
        ctx.commit(|tx| {
            assert!(tx.set_function_table(FunctionTable::empty()).is_err());
            Ok(())
        });
        assert!(ctx.set_function_table(FunctionTable::empty()).is_ok());
    }
}
