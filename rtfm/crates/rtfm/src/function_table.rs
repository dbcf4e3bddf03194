//! Function Table - Open to Closed Dispatch
//!
//! Maps an original function pointer to the transactional substitute that
//! must run in its place while a transaction is active. Substitutes take the
//! [`Context`](crate::Context) as their trailing argument:
//!
//! ```text
//! fn original(a: A, b: B) -> R
//! fn substitute(a: A, b: B, ctx: &mut Context) -> R
//! ```
//!
//! A [`FunctionRegistry`] collects registrations at startup and freezes into
//! an immutable [`FunctionTable`] shared through an `Arc`. Lookups never lock.

use crate::error::{Result, RtfmError};
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use std::ptr::NonNull;
use std::sync::Arc;

/// FunctionRegistry - builder of the dispatch table
///
/// # Examples
///
/// ```rust
/// use rtfm::FunctionRegistry;
///
/// fn original(x: u32) -> u32 { x }
/// fn substitute(x: u32, _ctx: &mut rtfm::Context) -> u32 { x }
///
/// let mut registry = FunctionRegistry::new();
/// registry
///     .register(original as *const (), substitute as *const ())
///     .unwrap();
/// let table = registry.freeze();
/// assert!(table.lookup(original as *const ()).is_some());
/// ```
#[derive(Debug, Default, Clone)]
pub struct FunctionRegistry {
    entries: IndexMap<usize, usize>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `original` to `substitute`
    ///
    /// Registering the same pair again is a no-op. A different substitute for
    /// an already mapped original is refused and the first mapping is kept.
    pub fn register(&mut self, original: *const (), substitute: *const ()) -> Result<()> {
        if original.is_null() || substitute.is_null() {
            return Err(RtfmError::InvalidArgument(format!(
                "null function pointer in registration ({:p} -> {:p})",
                original, substitute
            )));
        }

        let original = original as usize;
        let requested = substitute as usize;
        match self.entries.get(&original) {
            Some(&existing) if existing == requested => Ok(()),
            Some(&existing) => Err(RtfmError::ConflictingRegistration {
                original,
                existing,
                requested,
            }),
            None => {
                log::trace!("registered open function {:#x} -> {:#x}", original, requested);
                self.entries.insert(original, requested);
                Ok(())
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Build the immutable table; the registry stays usable
    pub fn freeze(&self) -> Arc<FunctionTable> {
        Arc::new(FunctionTable {
            map: self.entries.iter().map(|(&k, &v)| (k, v)).collect(),
            order: self.entries.keys().copied().collect(),
        })
    }
}

/// FunctionTable - frozen original to substitute map
#[derive(Debug, Default)]
pub struct FunctionTable {
    map: FxHashMap<usize, usize>,
    /// Originals in registration order
    order: Vec<usize>,
}

impl FunctionTable {
    /// Shared empty table
    pub fn empty() -> Arc<FunctionTable> {
        Arc::new(FunctionTable::default())
    }

    /// Substitute registered for `original`
    #[inline]
    pub fn lookup(&self, original: *const ()) -> Option<NonNull<()>> {
        self.map
            .get(&(original as usize))
            .and_then(|&substitute| NonNull::new(substitute as *mut ()))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// (original, substitute) pairs in registration order
    pub fn registrations(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.order
            .iter()
            .filter_map(move |original| self.map.get(original).map(|&s| (*original, s)))
    }
}
