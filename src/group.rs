//! Ordered acquisition of several locks at once.
//!
//! Taking locks one by one is not atomic here: granting a peer's request
//! while waiting for the next lock silently relinquishes the ones already
//! held. [`lock_all`] retries the whole sequence until one pass completes
//! without granting anything, at which point every requested lock is held
//! simultaneously.

use std::time::Duration;

use crate::lock::Lock;
use crate::thread;

/// The mode a lock in a [`lock_all`] group is taken in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Read permission.
    Read,
    /// Full write-exclusive permission.
    Write,
}

/// Failed passes before the retry loop starts napping.
pub const BACKOFF_RETRIES: usize = 5;

/// Number of further failed passes over which the nap keeps doubling,
/// starting from one microsecond.
pub const BACKOFF_EXP_LIMIT: usize = 13;

/// Acquires every lock in `locks`, in order, such that all of them are
/// held simultaneously on return.
///
/// The restart criterion is coarse: a pass is retried whenever *any*
/// request was granted during it, even one against a lock from an earlier
/// pass that this call no longer cares about. In the common case the
/// retry takes straight fast paths and succeeds immediately; only
/// pathological contention reaches the exponential backoff, which marks
/// the thread blocked around each nap so that peers waiting on it are not
/// stuck behind a sleeping thread.
///
/// Makes no statement about locks outside the group: some of them may
/// have been relinquished along the way.
///
/// # Examples
///
/// ```
/// use octetlock::{lock_all, Access, Lock};
///
/// octetlock::init_thread();
///
/// let from = Lock::new();
/// let to = Lock::new();
/// let audit = Lock::new();
/// lock_all(&[(&from, Access::Write), (&to, Access::Write), (&audit, Access::Read)]);
/// // All three objects are now accessible under their requested modes.
///
/// octetlock::shutdown_thread();
/// ```
pub fn lock_all(locks: &[(&Lock, Access)]) {
    let Some((first, rest)) = locks.split_first() else {
        return;
    };

    let me = thread::current();

    let mut retries = 0;
    let mut delay_us = 1;

    loop {
        // Whatever was granted while taking the first lock concerned
        // locks this pass had not claimed yet.
        let _ = acquire(first);

        let mut restart = false;
        for entry in rest {
            restart |= acquire(entry);
        }
        if !restart {
            return;
        }

        retries += 1;
        if retries > BACKOFF_RETRIES {
            if retries < BACKOFF_RETRIES + BACKOFF_EXP_LIMIT {
                delay_us *= 2;
            }
            me.handle_requests(true);
            std::thread::sleep(Duration::from_micros(delay_us));
            me.unblock();
        }
    }
}

fn acquire(&(lock, access): &(&Lock, Access)) -> bool {
    match access {
        Access::Read => lock.read_lock(),
        Access::Write => lock.write_lock(),
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use super::{lock_all, Access};
    use crate::lock::Lock;
    use crate::thread;

    #[test]
    fn empty_group_is_a_noop() {
        // Returns before touching any per-thread state, so no
        // registration is required.
        lock_all(&[]);
    }

    #[test]
    fn group_holds_every_lock_on_return() {
        crate::init_thread();
        let a = Lock::new();
        let b = Lock::new();
        let c = Lock::new();

        lock_all(&[(&a, Access::Write), (&b, Access::Write), (&c, Access::Read)]);

        let me = thread::current();
        assert!(a.load_relaxed().owned_by(me));
        assert!(b.load_relaxed().owned_by(me));
        assert!(c.load_relaxed().owned_by(me));
        crate::shutdown_thread();
    }

    #[test]
    fn group_reacquisition_is_idempotent() {
        crate::init_thread();
        let a = Lock::new();
        let b = Lock::new();
        let group = [(&a, Access::Write), (&b, Access::Write)];

        lock_all(&group);
        lock_all(&group);

        let me = thread::current();
        assert!(a.load_relaxed().owned_by(me));
        assert!(b.load_relaxed().owned_by(me));
        crate::shutdown_thread();
    }
}
