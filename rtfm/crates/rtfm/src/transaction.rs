//! Transaction - The Unit of Atomicity
//!
//! A transaction owns everything needed to roll its writes back:
//!
//! - **HitSet**: regions already protected, so each gets one snapshot
//! - **WriteLog**: (location, copy) pairs in recording order
//! - **BumpAllocator**: storage for the copies
//! - **Commit / abort tasks**: deferred callbacks
//!
//! Nesting is an owned chain: the innermost transaction holds its parent and
//! hands it back when it commits or aborts.
//!
//! ## Lifecycle
//!
//! ```text
//! Fresh ──► Running ──► Committed
//!   ▲          │──────► AbortedByRequest
//!   │          │──────► AbortedByLanguage
//!   │          └──────► AbortedByFailedLockAcquisition
//!   └──── reset() ◄──────────┘
//! ```

use crate::allocator::BumpAllocator;
use crate::context::CommitLocks;
use crate::hit_set::HitSet;
use crate::memory::{self, TaggedMemoryLocation};
use crate::stack::StackRange;
use crate::task_array::{Task, TaskArray};
use crate::write_log::{WriteLog, WriteLogEntry};

/// What one `record_write` call did, per chunk
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecordOutcome {
    /// Chunks snapshotted into the log
    pub logged: usize,
    /// Chunks already present in the hit set
    pub already_logged: usize,
    /// Chunks on the transaction's own stack
    pub stack_skipped: usize,
    /// Bytes copied
    pub bytes: usize,
}

/// Transaction - one nesting level
pub struct Transaction {
    parent: Option<Box<Transaction>>,
    hit_set: HitSet,
    write_log: WriteLog,
    allocator: BumpAllocator,
    commit_tasks: TaskArray,
    abort_tasks: TaskArray,
    /// Frame marker: stack below this address dies with the transaction
    frame: usize,
    done: bool,
    manual: bool,
    depth: usize,
}

impl Transaction {
    pub fn new(parent: Option<Box<Transaction>>, frame: usize, page_size: usize, manual: bool) -> Self {
        let depth = parent.as_ref().map_or(1, |p| p.depth + 1);
        Self {
            parent,
            hit_set: HitSet::new(),
            write_log: WriteLog::new(),
            allocator: BumpAllocator::new(page_size),
            commit_tasks: TaskArray::new(),
            abort_tasks: TaskArray::new(),
            frame,
            done: false,
            manual,
            depth,
        }
    }

    /// Snapshot `[address, address + size)` before it is overwritten
    ///
    /// Chunks on this transaction's own stack and chunks already in the hit
    /// set are skipped.
    ///
    /// # Safety
    ///
    /// The range must be valid for reads now and for writes until the
    /// outermost transaction finishes.
    pub unsafe fn record_write(&mut self, address: usize, size: usize, stack: &StackRange) -> RecordOutcome {
        let mut outcome = RecordOutcome::default();

        for location in TaggedMemoryLocation::chunks(address, size) {
            if self.owns_stack_region(location, stack) {
                outcome.stack_skipped += 1;
                continue;
            }
            if self.hit_set.contains(&location) {
                outcome.already_logged += 1;
                continue;
            }

            let copy = self.allocator.allocate(location.size());
            memory::snapshot(location, copy);
            self.write_log.push(WriteLogEntry { location, copy });
            self.hit_set.insert(location);

            log::trace!("logged {:?} at depth {}", location, self.depth);
            outcome.logged += 1;
            outcome.bytes += location.size();
        }

        outcome
    }

    /// Mark a fresh allocation as needing no snapshot
    ///
    /// Regions wider than the tag are ignored; their writes get logged
    /// normally.
    pub fn did_allocate(&mut self, address: usize, size: usize) {
        if let Some(location) = TaggedMemoryLocation::try_new(address, size) {
            self.hit_set.insert(location);
        }
    }

    /// Restore every logged region
    ///
    /// Entries are replayed newest first, so each byte ends holding the
    /// oldest snapshot that covers it. Entries on this transaction's own
    /// stack are skipped: that memory now belongs to the runtime's frames.
    ///
    /// # Safety
    ///
    /// Every logged region must still be valid for writes.
    pub unsafe fn undo(&mut self, stack: &StackRange) -> usize {
        let mut restored = 0;
        for entry in self.write_log.iter().rev() {
            if self.owns_stack_region(entry.location, stack) {
                continue;
            }
            memory::restore(entry.location, entry.copy);
            restored += 1;
        }
        log::debug!(
            "undid {} of {} entries at depth {}",
            restored,
            self.write_log.len(),
            self.depth
        );
        restored
    }

    /// Fold this nest into its parent and return the parent
    ///
    /// Entries on this nest's stack are dropped, and so are entries whose
    /// key the parent already holds: the parent's snapshot is older.
    pub fn commit_nested(mut self: Box<Self>, stack: &StackRange) -> Box<Transaction> {
        let mut parent = match self.parent.take() {
            Some(parent) => parent,
            None => crate::fatal!("commit_nested on an outer transaction"),
        };

        let mut folded = 0;
        for entry in self.write_log.iter() {
            if self.owns_stack_region(entry.location, stack) {
                continue;
            }
            if parent.hit_set.insert(entry.location) {
                parent.write_log.push(*entry);
                folded += 1;
            }
        }
        for key in self.hit_set.iter() {
            if !self.owns_stack_region(*key, stack) {
                parent.hit_set.insert(*key);
            }
        }

        parent.allocator.merge_from(&mut self.allocator);
        parent.commit_tasks.append(&mut self.commit_tasks);
        parent.abort_tasks.append(&mut self.abort_tasks);

        log::debug!(
            "folded {} of {} entries from depth {} into parent",
            folded,
            self.write_log.len(),
            self.depth
        );
        parent
    }

    /// Undo this nest and return the parent
    ///
    /// The nest's abort tasks still have to run once, whichever way the
    /// parent finishes: each becomes a shared task placed on both of the
    /// parent's arrays. Commit tasks of the nest are dropped.
    ///
    /// # Safety
    ///
    /// Same as [`Transaction::undo`].
    pub unsafe fn abort_nested(mut self: Box<Self>, stack: &StackRange) -> (Box<Transaction>, usize) {
        let restored = self.undo(stack);
        let mut parent = match self.parent.take() {
            Some(parent) => parent,
            None => crate::fatal!("abort_nested on an outer transaction"),
        };

        // Parent commit runs FIFO, so feed it the nest's tasks newest first
        let mut on_commit = Vec::with_capacity(self.abort_tasks.len());
        for task in self.abort_tasks.drain() {
            let (for_commit, for_abort) = task.into_shared_pair();
            parent.abort_tasks.push(for_abort);
            on_commit.push(for_commit);
        }
        for task in on_commit.into_iter().rev() {
            parent.commit_tasks.push(task);
        }

        (parent, restored)
    }

    /// Take the commit locks and run commit tasks oldest first
    ///
    /// Returns `None` without running anything when the lock hook fails,
    /// otherwise the number of tasks run.
    pub fn attempt_to_commit_outer_nest(
        &mut self,
        locks: &mut dyn CommitLocks,
        pre_acquire: bool,
    ) -> Option<usize> {
        if !locks.try_acquire(pre_acquire) {
            log::debug!("commit locks unavailable (pre_acquire = {})", pre_acquire);
            return None;
        }
        let ran = self.commit_tasks.run_forward();
        locks.release();
        self.abort_tasks.clear();
        Some(ran)
    }

    /// Undo and run abort tasks newest first
    ///
    /// Returns (entries restored, tasks run).
    ///
    /// # Safety
    ///
    /// Same as [`Transaction::undo`].
    pub unsafe fn abort_outer_nest(&mut self, stack: &StackRange) -> (usize, usize) {
        let restored = self.undo(stack);
        self.commit_tasks.clear();
        let ran = self.abort_tasks.run_reverse();
        (restored, ran)
    }

    /// Clear all owned containers for a retry
    pub fn reset(&mut self) {
        self.hit_set.clear();
        self.write_log.clear();
        self.allocator.reset();
        self.commit_tasks.clear();
        self.abort_tasks.clear();
        self.done = false;
    }

    /// Check that every logged key is in the hit set
    pub fn check_consistency(&self) -> std::result::Result<(), String> {
        for entry in self.write_log.iter() {
            if !self.hit_set.contains(&entry.location) {
                return Err(format!(
                    "write log entry {:?} at depth {} missing from hit set",
                    entry.location, self.depth
                ));
            }
        }
        if let Some(parent) = &self.parent {
            if parent.depth + 1 != self.depth {
                return Err(format!(
                    "depth {} has parent at depth {}",
                    self.depth, parent.depth
                ));
            }
            parent.check_consistency()?;
        } else if self.depth != 1 {
            return Err(format!("outer transaction at depth {}", self.depth));
        }
        Ok(())
    }

    #[inline]
    fn owns_stack_region(&self, location: TaggedMemoryLocation, stack: &StackRange) -> bool {
        location.size() > 0
            && stack.is_below_frame(location.address(), self.frame)
            && stack.is_below_frame(location.end() - 1, self.frame)
    }

    pub fn push_commit_task(&mut self, task: Task) {
        self.commit_tasks.push(task);
    }

    pub fn push_abort_task(&mut self, task: Task) {
        self.abort_tasks.push(task);
    }

    pub fn abort_tasks_mut(&mut self) -> &mut TaskArray {
        &mut self.abort_tasks
    }

    pub fn commit_tasks(&self) -> &TaskArray {
        &self.commit_tasks
    }

    pub fn abort_tasks(&self) -> &TaskArray {
        &self.abort_tasks
    }

    pub fn parent(&self) -> Option<&Transaction> {
        self.parent.as_deref()
    }

    pub fn is_nested(&self) -> bool {
        self.parent.is_some()
    }

    pub fn hit_set(&self) -> &HitSet {
        &self.hit_set
    }

    pub fn write_log(&self) -> &WriteLog {
        &self.write_log
    }

    pub fn allocator(&self) -> &BumpAllocator {
        &self.allocator
    }

    pub fn frame(&self) -> usize {
        self.frame
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn set_done(&mut self) {
        self.done = true;
    }

    pub fn is_manual(&self) -> bool {
        self.manual
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("depth", &self.depth)
            .field("frame", &format_args!("{:#x}", self.frame))
            .field("entries", &self.write_log.len())
            .field("hits", &self.hit_set.len())
            .field("commit_tasks", &self.commit_tasks.len())
            .field("abort_tasks", &self.abort_tasks.len())
            .field("done", &self.done)
            .field("manual", &self.manual)
            .finish()
    }
}
