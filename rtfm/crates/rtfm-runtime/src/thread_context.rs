//! Thread Context - One rtfm Context per OS Thread
//!
//! Entry points reach the calling thread's context through [`with_context`].
//! While a C callback runs inside a transaction the owning borrow is held by
//! the suspended entry point, so the callback's own calls go through the
//! `ACTIVE` pointer instead.
//!
//! Tasks handed to the engine by the C entry points are wrapped with
//! [`released`]: the engine only queues them, and they run once the entry
//! point that finished the transaction has let go of the context. A commit
//! or abort task may therefore call back into the runtime.

use lazy_static::lazy_static;
use parking_lot::{Mutex, RwLock};
use rtfm::{Context, FunctionRegistry, FunctionTable, RtfmError};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::ptr;
use std::sync::Arc;

lazy_static! {
    static ref REGISTRY: Mutex<FunctionRegistry> = Mutex::new(FunctionRegistry::new());
    static ref PUBLISHED: RwLock<Arc<FunctionTable>> = RwLock::new(FunctionTable::empty());
}

thread_local! {
    static CONTEXT: RefCell<Context> = RefCell::new(rtfm::init());
    static ACTIVE: Cell<*mut Context> = const { Cell::new(ptr::null_mut()) };
    static RELEASED: RefCell<VecDeque<Box<dyn FnOnce()>>> = RefCell::new(VecDeque::new());
}

/// Run `f` with the calling thread's context
///
/// Tasks the engine released during `f` run after it returns.
pub(crate) fn with_context<R>(f: impl FnOnce(&mut Context) -> R) -> R {
    let active = ACTIVE.with(Cell::get);
    let result = if !active.is_null() {
        // SAFETY: ACTIVE is only set by `ActiveGuard`, whose owner is
        // suspended in the callback that is calling us
        f(unsafe { &mut *active })
    } else {
        CONTEXT.with(|cell| match cell.try_borrow_mut() {
            Ok(mut ctx) => f(&mut ctx),
            Err(_) => rtfm::fatal!("runtime re-entered outside a transactional callback"),
        })
    };
    run_released_tasks();
    result
}

/// Defer `task` until the context is no longer borrowed
pub(crate) fn released(task: impl FnOnce() + 'static) -> impl FnOnce() + 'static {
    move || RELEASED.with(|queue| queue.borrow_mut().push_back(Box::new(task)))
}

fn run_released_tasks() {
    // Tasks may release more tasks
    while let Some(task) = RELEASED.with(|queue| queue.borrow_mut().pop_front()) {
        task();
    }
}

/// Marks `ctx` as the context of a running callback until dropped
pub(crate) struct ActiveGuard {
    previous: *mut Context,
}

impl ActiveGuard {
    pub(crate) fn enter(ctx: &mut Context) -> Self {
        let previous = ACTIVE.with(|active| active.replace(ctx as *mut Context));
        Self { previous }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        ACTIVE.with(|active| active.set(self.previous));
    }
}

/// Hand the latest published table to an idle context
pub(crate) fn refresh_function_table(ctx: &mut Context) {
    if ctx.is_transactional() {
        return;
    }
    let published = Arc::clone(&PUBLISHED.read());
    if Arc::ptr_eq(ctx.functions(), &published) {
        return;
    }
    if let Err(e) = ctx.set_function_table(published) {
        log::warn!("function table not refreshed: {}", e);
    }
}

/// Register `substitute` as the closed variant of `original` and publish
///
/// # Errors
///
/// Whatever [`FunctionRegistry::register`] refuses; the published table is
/// left unchanged in that case.
pub fn register_open_function(original: *const (), substitute: *const ()) -> rtfm::Result<()> {
    let mut registry = REGISTRY.lock();
    registry.register(original, substitute)?;
    *PUBLISHED.write() = registry.freeze();
    Ok(())
}

/// Currently published table
pub fn published_function_table() -> Arc<FunctionTable> {
    Arc::clone(&PUBLISHED.read())
}

pub(crate) fn log_registration_error(err: &RtfmError) {
    match err {
        RtfmError::ConflictingRegistration { .. } => {
            log::warn!("registration ignored: {}", err)
        }
        _ => log::error!("registration failed: {}", err),
    }
}
