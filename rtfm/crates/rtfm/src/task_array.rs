//! Task Array - Deferred Commit and Abort Callbacks
//!
//! Tasks are stored in chunks. Appending another array moves its chunks over
//! without touching individual tasks, so relative order is kept on both sides.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Tasks per chunk
pub const CHUNK_CAPACITY: usize = 64;

type Callback = Box<dyn FnOnce()>;

/// Identifies a keyed abort handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskKey(pub usize);

enum TaskBody {
    Once(Callback),
    /// Shared between two arrays; whichever runs first wins
    Shared(Rc<RefCell<Option<Callback>>>),
}

/// One deferred callback
pub struct Task {
    key: Option<TaskKey>,
    body: TaskBody,
}

impl Task {
    pub fn new(callback: impl FnOnce() + 'static) -> Self {
        Self {
            key: None,
            body: TaskBody::Once(Box::new(callback)),
        }
    }

    pub fn keyed(key: TaskKey, callback: impl FnOnce() + 'static) -> Self {
        Self {
            key: Some(key),
            body: TaskBody::Once(Box::new(callback)),
        }
    }

    pub fn key(&self) -> Option<TaskKey> {
        self.key
    }

    /// Split into two handles of one callback that runs at most once
    ///
    /// The key is dropped: the handler scope that owned it has ended.
    pub fn into_shared_pair(self) -> (Task, Task) {
        let cell = match self.body {
            TaskBody::Once(callback) => Rc::new(RefCell::new(Some(callback))),
            TaskBody::Shared(cell) => cell,
        };
        (
            Task {
                key: None,
                body: TaskBody::Shared(Rc::clone(&cell)),
            },
            Task {
                key: None,
                body: TaskBody::Shared(cell),
            },
        )
    }

    /// Run the callback, returning whether it actually executed
    pub fn run(self) -> bool {
        match self.body {
            TaskBody::Once(callback) => {
                callback();
                true
            }
            TaskBody::Shared(cell) => {
                let callback = cell.borrow_mut().take();
                match callback {
                    Some(callback) => {
                        callback();
                        true
                    }
                    None => false,
                }
            }
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = matches!(self.body, TaskBody::Shared(_));
        f.debug_struct("Task")
            .field("key", &self.key)
            .field("shared", &shared)
            .finish()
    }
}

/// TaskArray - ordered deferred callbacks
#[derive(Debug, Default)]
pub struct TaskArray {
    chunks: Vec<Vec<Task>>,
    len: usize,
}

impl TaskArray {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: Task) {
        let needs_chunk = self
            .chunks
            .last()
            .map_or(true, |chunk| chunk.len() >= CHUNK_CAPACITY);
        if needs_chunk {
            self.chunks.push(Vec::with_capacity(CHUNK_CAPACITY));
        }
        if let Some(chunk) = self.chunks.last_mut() {
            chunk.push(task);
        }
        self.len += 1;
    }

    /// Move every task of `other` after the tasks of `self`
    pub fn append(&mut self, other: &mut TaskArray) {
        self.chunks.append(&mut other.chunks);
        self.len += other.len;
        other.len = 0;
    }

    /// Remove the most recent task carrying `key`
    pub fn pop_key(&mut self, key: TaskKey) -> Option<Task> {
        for chunk in self.chunks.iter_mut().rev() {
            if let Some(index) = chunk.iter().rposition(|task| task.key == Some(key)) {
                self.len -= 1;
                return Some(chunk.remove(index));
            }
        }
        None
    }

    /// Take every task out in insertion order
    pub fn drain(&mut self) -> impl DoubleEndedIterator<Item = Task> {
        self.len = 0;
        std::mem::take(&mut self.chunks).into_iter().flatten()
    }

    /// Run every task oldest first; returns how many executed
    pub fn run_forward(&mut self) -> usize {
        self.drain().map(Task::run).filter(|ran| *ran).count()
    }

    /// Run every task newest first; returns how many executed
    pub fn run_reverse(&mut self) -> usize {
        self.drain().rev().map(Task::run).filter(|ran| *ran).count()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.len = 0;
    }
}
