pub mod atomic {
    #[cfg(not(all(loom, test)))]
    pub use core::sync::atomic::{AtomicU32, AtomicUsize};

    #[cfg(all(loom, test))]
    pub use loom::sync::atomic::{AtomicU32, AtomicUsize};

    #[cfg(feature = "read-shared")]
    #[cfg(not(all(loom, test)))]
    pub use core::sync::atomic::fence;

    #[cfg(feature = "read-shared")]
    #[cfg(all(loom, test))]
    pub use loom::sync::atomic::fence;
}

pub mod ordering {
    use core::sync::atomic::Ordering;

    /// Selects the memory ordering for one atomic site of the barrier
    /// protocol.
    ///
    /// Every relaxable site routes its ordering through this function, so
    /// enabling the `sequential` feature collapses the whole contract to
    /// [`Ordering::SeqCst`] at once. Sites that are sequentially consistent
    /// regardless of the feature spell their ordering out directly.
    #[inline(always)]
    pub const fn mem_ord(order: Ordering) -> Ordering {
        if cfg!(feature = "sequential") {
            Ordering::SeqCst
        } else {
            order
        }
    }
}

pub mod thread {
    #[cfg(not(all(loom, test)))]
    pub use std::thread::yield_now;

    #[cfg(all(loom, test))]
    pub use loom::thread::yield_now;
}

#[cfg(feature = "read-shared")]
pub mod sync {
    #[cfg(not(all(loom, test)))]
    pub use std::sync::Mutex;

    #[cfg(all(loom, test))]
    pub use loom::sync::Mutex;
}

/// Forwards to [`log::trace!`] when the `trace` feature is enabled, and
/// expands to nothing otherwise.
macro_rules! trace {
    ($($arg:tt)*) => {{
        #[cfg(feature = "trace")]
        log::trace!($($arg)*);
    }};
}

pub(crate) use trace;
