//! Stack Classification - Transient Stack Memory Detection
//!
//! Writes to stack slots that die when a transaction's closure returns never
//! need an undo copy. Restoring them would even be harmful: by the time undo
//! runs, the runtime's own frames occupy that memory.
//!
//! A transaction records a frame marker (the address of a local in the
//! runtime frame that calls the user closure). The closure and everything it
//! calls live below the marker, so an address is transaction stack when it
//! lies within the thread's stack bounds and below the marker.
//!
//! ## Platform Support
//!
//! | Platform | Bounds source |
//! |----------|---------------|
//! | Linux | `pthread_getattr_np` + `pthread_attr_getstack` |
//! | macOS | `pthread_get_stackaddr_np` + `pthread_get_stacksize_np` |
//! | Other | window around the stack pointer at context creation |

/// Fallback stack window size when the OS bounds are unknown
const FALLBACK_STACK_WINDOW: usize = 8 * 1024 * 1024;

/// StackRange - `[low, high)` of a thread stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackRange {
    pub low: usize,
    pub high: usize,
}

impl StackRange {
    /// Bounds of the calling thread's stack
    pub fn current() -> StackRange {
        match os_stack_bounds() {
            Some(range) => range,
            None => {
                let sp = approximate_stack_pointer();
                log::debug!("thread stack bounds unknown, estimating around {:#x}", sp);
                StackRange::around(sp)
            }
        }
    }

    /// Estimated range for a stack pointer when the OS cannot tell
    pub fn around(sp: usize) -> StackRange {
        StackRange {
            low: sp.saturating_sub(FALLBACK_STACK_WINDOW),
            high: sp.saturating_add(FALLBACK_STACK_WINDOW),
        }
    }

    #[inline]
    pub fn contains(&self, address: usize) -> bool {
        address >= self.low && address < self.high
    }

    /// Whether `address` is stack memory below `frame`
    ///
    /// Anything below a runtime frame marker belongs to frames the marker's
    /// owner called, which are dead once it resumes.
    #[inline]
    pub fn is_below_frame(&self, address: usize, frame: usize) -> bool {
        address >= self.low && address < frame && address < self.high
    }

    pub fn size(&self) -> usize {
        self.high.saturating_sub(self.low)
    }
}

/// Address of a local in a fresh frame, close to the stack pointer
#[inline(never)]
pub fn approximate_stack_pointer() -> usize {
    let marker = 0u8;
    std::hint::black_box(&marker) as *const u8 as usize
}

#[cfg(target_os = "linux")]
fn os_stack_bounds() -> Option<StackRange> {
    use std::mem::MaybeUninit;

    // SAFETY: attr is initialised by pthread_getattr_np before use and
    // destroyed afterwards
    unsafe {
        let mut attr = MaybeUninit::<libc::pthread_attr_t>::uninit();
        if libc::pthread_getattr_np(libc::pthread_self(), attr.as_mut_ptr()) != 0 {
            return None;
        }
        let mut attr = attr.assume_init();

        let mut addr: *mut libc::c_void = std::ptr::null_mut();
        let mut size: libc::size_t = 0;
        let rc = libc::pthread_attr_getstack(&attr, &mut addr, &mut size);
        libc::pthread_attr_destroy(&mut attr);

        if rc != 0 || addr.is_null() || size == 0 {
            return None;
        }
        let low = addr as usize;
        Some(StackRange {
            low,
            high: low.saturating_add(size),
        })
    }
}

#[cfg(target_os = "macos")]
fn os_stack_bounds() -> Option<StackRange> {
    // SAFETY: both calls only read the calling thread's own descriptor
    unsafe {
        let thread = libc::pthread_self();
        let high = libc::pthread_get_stackaddr_np(thread) as usize;
        let size = libc::pthread_get_stacksize_np(thread);
        if high == 0 || size == 0 {
            return None;
        }
        Some(StackRange {
            low: high.saturating_sub(size),
            high,
        })
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn os_stack_bounds() -> Option<StackRange> {
    None
}
