//! Biased per-object locks modeled on the Octet barriers of Bond et al.,
//! "OCTET: Capturing and Controlling Cross-Thread Dependencies
//! Efficiently" (OOPSLA 2013).
//!
//! Every [`Lock`] is one pointer-sized state word naming the thread that
//! owns the guarded object. The owner re-acquires with a single relaxed
//! load; any other thread requests a handoff by incrementing the owner's
//! request counter and waiting for the owner to grant it at a cooperative
//! checkpoint (a [`yield_locks`] call, or any wait loop inside the owner's
//! own barriers). Acquisition is therefore asymmetric: owner hits are
//! nearly free, steals cost a cross-thread round trip.
//!
//! Barriers do not return guards and have no matching unlock. A lock stays
//! owned until another thread steals it, the owner grants pending requests,
//! or the owner calls [`Lock::force_unlock`]. Barriers instead return an
//! `interrupted` flag: `true` means the calling thread granted peer
//! requests during the call and thereby relinquished every *other* lock it
//! held. [`lock_all`] turns that flag into an all-or-restart loop that
//! acquires a whole group of locks simultaneously.
//!
//! # Thread lifecycle
//!
//! Each OS thread must call [`init_thread`] before its first barrier and
//! should call [`shutdown_thread`] before it exits. Shutting down marks the
//! thread permanently blocked, which lets peers steal its remaining locks
//! without waiting. The per-thread record is leaked by design: lock state
//! words may keep naming a terminated thread indefinitely.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::thread;
//!
//! use octetlock::{lock_all, Access, Lock};
//!
//! let locks: Arc<[Lock; 2]> = Arc::new([Lock::new(), Lock::new()]);
//!
//! let handles: Vec<_> = (0..2)
//!     .map(|_| {
//!         let locks = Arc::clone(&locks);
//!         thread::spawn(move || {
//!             octetlock::init_thread();
//!             for _ in 0..100 {
//!                 lock_all(&[(&locks[0], Access::Write), (&locks[1], Access::Read)]);
//!                 // Objects guarded by both locks are accessible here.
//!             }
//!             octetlock::shutdown_thread();
//!         })
//!     })
//!     .collect();
//!
//! for handle in handles {
//!     handle.join().unwrap();
//! }
//! ```
//!
//! # Features
//!
//! All features are independent and disabled by default.
//!
//! - `read-shared`: adds distinct read states. A single reader holds the
//!   lock read-exclusive; further readers broaden it to read-shared, which
//!   every thread may then read on the fast path. A write to a read-shared
//!   object must revoke permission from all active threads. Without this
//!   feature, [`Lock::read_lock`] is an alias for [`Lock::write_lock`].
//! - `sequential`: collapses the entire memory-ordering contract to
//!   sequentially-consistent operations, trading throughput for a
//!   conservative baseline when debugging ordering issues.
//! - `stats`: counts barriers and slow paths per thread, exposed through
//!   the `stats()` snapshot.
//! - `trace`: logs lock transitions through the [`log`] facade at trace
//!   level.
//!
//! [`log`]: https://docs.rs/log

pub(crate) mod cfg;

mod group;
mod lock;
mod state;
mod stats;
mod thread;

pub use group::{lock_all, Access, BACKOFF_EXP_LIMIT, BACKOFF_RETRIES};
pub use lock::Lock;
pub use thread::{init_thread, shutdown_thread, yield_locks};

#[cfg(feature = "stats")]
pub use stats::{stats, Stats};
