//! Octet barrier locks.
//!
//! A [`Lock`] guards one heap object with a single pointer-sized state
//! word. The thread named by the word re-acquires with one relaxed load;
//! every other thread negotiates a handoff by marking the word
//! intermediate, pinging the owner, and waiting for the owner to reach a
//! cooperative checkpoint. Barriers return an `interrupted` flag telling
//! the caller whether it granted peer requests while waiting, which means
//! locks *other* than the one being acquired were relinquished during the
//! call.
//!
//! Locks start out owned by a permanently-blocked sentinel thread, so the
//! first acquisition takes the slow path but never waits.

use core::fmt;
use core::sync::atomic::Ordering::{AcqRel, Relaxed};

#[cfg(feature = "read-shared")]
use core::sync::atomic::Ordering::{Acquire, SeqCst};

#[cfg(feature = "read-shared")]
use crate::cfg::atomic::fence;

use crate::cfg::atomic::AtomicUsize;
use crate::cfg::ordering::mem_ord;
use crate::cfg::trace;
use crate::state::State;
use crate::stats;
use crate::thread::{self, notify_one, ThreadInfo};

/// A biased per-object lock.
///
/// Barriers have no matching unlock: ownership persists until another
/// thread steals it through the handoff protocol, the owner reaches a
/// cooperative checkpoint ([`yield_locks`], or any wait loop inside its
/// own barriers), or the owner calls [`force_unlock`].
///
/// # Examples
///
/// ```
/// use octetlock::Lock;
///
/// octetlock::init_thread();
///
/// let lock = Lock::new();
/// let interrupted = lock.write_lock();
/// assert!(!interrupted);
/// // The object guarded by `lock` may now be read and written.
///
/// octetlock::shutdown_thread();
/// ```
///
/// [`yield_locks`]: crate::yield_locks
/// [`force_unlock`]: Lock::force_unlock
pub struct Lock {
    state: AtomicUsize,
}

impl Lock {
    /// Creates a lock owned by the blocked sentinel thread.
    #[must_use]
    #[inline]
    pub fn new() -> Lock {
        let unowned = State::wr_ex(thread::dead_thread());
        Lock { state: AtomicUsize::new(unowned.into_raw()) }
    }

    /// Acquires this lock in write-exclusive mode.
    ///
    /// Returns whether any peer requests were granted while waiting, and
    /// hence whether locks other than this one were relinquished during
    /// the call.
    #[inline]
    pub fn write_lock(&self) -> bool {
        stats::record_write_barrier();

        let goal = State::wr_ex(thread::current());

        // If we observe our own ownership, only this thread can have
        // written it, so no cross-thread ordering is needed. Any other
        // value sends us to the slow path, whose CAS reads up-to-date
        // data.
        let state = self.load_relaxed();
        if state != goal {
            trace!("slow path to write-lock {:p}", self);
            return self.write_slow(goal);
        }

        // The fast path never grants requests.
        false
    }

    /// Acquires this lock in read mode: read-exclusive if this thread is
    /// the first reader, read-shared once other threads read too.
    ///
    /// Returns whether any peer requests were granted while waiting, as
    /// for [`write_lock`](Lock::write_lock).
    #[cfg(feature = "read-shared")]
    #[inline]
    pub fn read_lock(&self) -> bool {
        stats::record_read_barrier();

        let me = thread::current();

        let state = self.load_relaxed();
        if !state.owned_by(me) {
            if state.is_rd_sh() {
                // RdSh may have been published by another thread; make the
                // writes that happened-before that transition visible.
                fence(mem_ord(Acquire));
            } else {
                trace!("slow path to read-lock {:p}", self);
                return self.read_slow(me);
            }
        }

        // The fast path never grants requests.
        false
    }

    /// Acquires this lock in read mode.
    ///
    /// Without the `read-shared` feature there is no distinct read state,
    /// and a read barrier is exactly a write barrier.
    #[cfg(not(feature = "read-shared"))]
    #[inline]
    pub fn read_lock(&self) -> bool {
        self.write_lock()
    }

    /// Releases this lock back to the sentinel if the calling thread owns
    /// it.
    ///
    /// Best effort: if the word has already been marked intermediate, or
    /// ownership has been stolen, or the state is read-shared, the lock is
    /// left alone. The loss is benign; the next owner took it through the
    /// regular handoff.
    pub fn force_unlock(&self) {
        let me = thread::current();

        let state = self.load_relaxed();
        if state.owned_by(me) {
            trace!("force-unlocking {:p}", self);
            let unowned = State::wr_ex(thread::dead_thread());
            let _ = self.state.compare_exchange(
                state.into_raw(),
                unowned.into_raw(),
                mem_ord(AcqRel),
                mem_ord(Relaxed),
            );
        }
    }

    /// The write-barrier slow path: a handoff from whoever the state word
    /// names.
    fn write_slow(&self, goal: State) -> bool {
        stats::record_slow_write();

        let me = thread::current();

        // Snapshot the response count around the handoff to detect
        // whether we granted requests (lost other locks) in the interim.
        let responses_before = me.responses_relaxed();

        let prev = self.lock_intermediate(me);

        match prev.owner() {
            Some(owner) if !core::ptr::eq(owner, me) => {
                // Another thread holds this RdEx or WrEx; one round trip.
                notify_one(me, owner);
            }
            Some(_) => {
                // The only remaining slow-path case: upgrading our own
                // read-exclusive hold. Nobody to ask.
                debug_assert_eq!(prev, State::rd_ex(me));
            }
            None => self.revoke_read_shared(me),
        }

        // Peers may observe either Intermediate or the new owner here;
        // both deny them access, so this store needs no ordering of its
        // own. The CAS that installed Intermediate is the hinge.
        self.state.store(goal.into_raw(), mem_ord(Relaxed));

        trace!("write-locked {:p}", self);

        me.responses_relaxed() != responses_before
    }

    /// The read-barrier slow path: ends in RdSh or RdEx depending on what
    /// the displaced state was.
    #[cfg(feature = "read-shared")]
    fn read_slow(&self, me: &'static ThreadInfo) -> bool {
        stats::record_slow_read();

        let responses_before = me.responses_relaxed();

        let prev = self.lock_intermediate(me);

        // The terminal stores below keep the conservative default
        // ordering.
        if prev.is_rd_sh() {
            // Some other reader broadened the state while we were queueing
            // behind Intermediate; put it back the way it was.
            self.state.store(State::RD_SH.into_raw(), SeqCst);
        } else if prev.is_rd_ex() {
            // A foreign exclusive reader; generalize to read-shared.
            debug_assert!(!prev.owned_by(me));
            self.state.store(State::RD_SH.into_raw(), SeqCst);
        } else {
            debug_assert!(prev.is_wr_ex());
            if let Some(owner) = prev.owner() {
                notify_one(me, owner);
            }
            self.state.store(State::rd_ex(me).into_raw(), SeqCst);
        }

        trace!("read-locked {:p}", self);

        me.responses_relaxed() != responses_before
    }

    /// Revokes read-shared access: asks every active thread for
    /// permission, since readers are not tracked per object.
    #[cfg(feature = "read-shared")]
    fn revoke_read_shared(&self, me: &'static ThreadInfo) {
        trace!("revoking read-shared access to {:p}", self);

        // Collect the pings with the registry locked, then wait with it
        // released so that peers can register and deregister meanwhile.
        let peers = thread::registry::ping_all(me);
        for (peer, required) in peers {
            peer.await_response(me, required);
        }
    }

    #[cfg(not(feature = "read-shared"))]
    fn revoke_read_shared(&self, _me: &'static ThreadInfo) {
        // Locks only ever carry owner-tagged words in this configuration.
        unreachable!("read-shared state without the read-shared feature");
    }

    /// Marks the lock as mid-handoff and returns the displaced state,
    /// which is never intermediate.
    ///
    /// If the word is already intermediate, another thread is mid-steal
    /// and we wait for it to install a terminal state first. Every trip
    /// around the loop grants our own pending requests: a peer may be
    /// waiting on us while we wait here.
    fn lock_intermediate(&self, me: &'static ThreadInfo) -> State {
        // Anything read here is verified by the compare-exchange, so a
        // stale value is harmless.
        let mut prev = self.load_relaxed();

        while prev.is_intermediate() || !self.try_intermediate(prev) {
            // Yielding is a large win when threads outnumber cores.
            crate::cfg::thread::yield_now();
            me.handle_requests(false);
            prev = self.load_relaxed();
        }

        trace!("{:p} marked intermediate, was {:?}", self, prev);
        debug_assert!(!prev.is_intermediate());
        prev
    }

    fn try_intermediate(&self, prev: State) -> bool {
        self.state
            .compare_exchange_weak(
                prev.into_raw(),
                State::INTERMEDIATE.into_raw(),
                mem_ord(AcqRel),
                mem_ord(Relaxed),
            )
            .is_ok()
    }

    pub(crate) fn load_relaxed(&self) -> State {
        State::from_raw(self.state.load(mem_ord(Relaxed)))
    }
}

impl Default for Lock {
    /// Creates a `Lock` owned by the sentinel thread.
    fn default() -> Lock {
        Lock::new()
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock").field("state", &self.load_relaxed()).finish()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::mpsc::channel;
    use std::sync::{Arc, Barrier};
    use std::thread::spawn;

    use super::Lock;
    use crate::thread;

    #[test]
    fn new_lock_is_sentinel_owned() {
        let lock = Lock::new();
        let state = lock.load_relaxed();
        assert!(state.is_wr_ex());
        assert!(state.owned_by(thread::dead_thread()));
    }

    #[test]
    fn first_acquire_never_waits_then_fast_paths() {
        crate::init_thread();
        let lock = Lock::new();

        // Slow path against the blocked sentinel: no wait, no grants.
        assert!(!lock.write_lock());
        assert!(lock.load_relaxed().owned_by(thread::current()));

        // Owner hits from here on.
        for _ in 0..1_000 {
            assert!(!lock.write_lock());
        }
        assert!(lock.load_relaxed().owned_by(thread::current()));
        crate::shutdown_thread();
    }

    #[test]
    fn reacquire_is_idempotent() {
        crate::init_thread();
        let lock = Lock::new();
        assert!(!lock.write_lock());
        let owned = lock.load_relaxed();
        assert!(!lock.write_lock());
        assert_eq!(lock.load_relaxed(), owned);
        crate::shutdown_thread();
    }

    #[test]
    fn force_unlock_returns_lock_to_sentinel() {
        crate::init_thread();
        let lock = Lock::new();
        lock.write_lock();
        lock.force_unlock();
        assert!(lock.load_relaxed().owned_by(thread::dead_thread()));

        // And the next acquisition works as if the lock were fresh.
        assert!(!lock.write_lock());
        assert!(lock.load_relaxed().owned_by(thread::current()));
        crate::shutdown_thread();
    }

    #[test]
    fn force_unlock_by_non_owner_is_a_noop() {
        crate::init_thread();
        let lock = Lock::new();
        // We never acquired it; the sentinel stays the owner.
        lock.force_unlock();
        assert!(lock.load_relaxed().owned_by(thread::dead_thread()));
        crate::shutdown_thread();
    }

    #[test]
    fn force_unlock_of_foreign_lock_is_a_noop() {
        crate::init_thread();
        let lock = Arc::new(Lock::new());
        let (owned_tx, owned_rx) = channel();
        let (done_tx, done_rx) = channel::<()>();

        let handle = spawn({
            let lock = Arc::clone(&lock);
            move || {
                crate::init_thread();
                lock.write_lock();
                owned_tx.send(()).unwrap();
                done_rx.recv().unwrap();
                crate::shutdown_thread();
            }
        });

        owned_rx.recv().unwrap();
        lock.force_unlock();
        assert!(!lock.load_relaxed().owned_by(thread::current()));
        assert!(!lock.load_relaxed().owned_by(thread::dead_thread()));
        done_tx.send(()).unwrap();
        handle.join().unwrap();
        crate::shutdown_thread();
    }

    #[test]
    fn steal_from_terminated_owner_never_waits() {
        let lock = Arc::new(Lock::new());

        spawn({
            let lock = Arc::clone(&lock);
            move || {
                crate::init_thread();
                lock.write_lock();
                crate::shutdown_thread();
            }
        })
        .join()
        .unwrap();

        // The terminated owner is blocked, so the steal completes without
        // waiting and without granting anything on our side.
        crate::init_thread();
        assert!(!lock.write_lock());
        assert!(lock.load_relaxed().owned_by(thread::current()));
        crate::shutdown_thread();
    }

    #[test]
    fn crossed_steals_interrupt_a_waiter() {
        let ours = Arc::new(Lock::new());
        let theirs = Arc::new(Lock::new());
        let start = Arc::new(Barrier::new(2));

        let handle = spawn({
            let ours = Arc::clone(&ours);
            let theirs = Arc::clone(&theirs);
            let start = Arc::clone(&start);
            move || {
                crate::init_thread();
                theirs.write_lock();
                start.wait();
                let interrupted = ours.write_lock();
                crate::shutdown_thread();
                interrupted
            }
        });

        crate::init_thread();
        ours.write_lock();
        start.wait();
        let interrupted = theirs.write_lock();
        crate::shutdown_thread();

        // Each thread steals the lock the other holds. At least one of
        // them must grant the other's request from inside its own wait
        // loop, and that grant is reported as an interruption.
        let peer_interrupted = handle.join().unwrap();
        assert!(interrupted || peer_interrupted);
    }

    #[cfg(feature = "read-shared")]
    mod read_shared {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;
        use std::thread::spawn;

        use super::super::Lock;
        use crate::thread;

        #[test]
        fn first_reader_takes_read_exclusive() {
            crate::init_thread();
            let lock = Lock::new();
            assert!(!lock.read_lock());
            let state = lock.load_relaxed();
            assert!(state.is_rd_ex());
            assert!(state.owned_by(thread::current()));

            // Re-reads are owner hits.
            assert!(!lock.read_lock());
            crate::shutdown_thread();
        }

        #[test]
        fn upgrade_own_read_lock_in_place() {
            crate::init_thread();
            let lock = Lock::new();
            lock.read_lock();
            assert!(lock.load_relaxed().is_rd_ex());

            // Upgrading needs no round trip and grants nothing.
            assert!(!lock.write_lock());
            let state = lock.load_relaxed();
            assert!(state.is_wr_ex());
            assert!(state.owned_by(thread::current()));
            crate::shutdown_thread();
        }

        #[test]
        fn second_reader_broadens_to_read_shared() {
            crate::init_thread();
            let lock = Arc::new(Lock::new());
            lock.read_lock();

            // Broadening a foreign RdEx to RdSh requires no round trip,
            // so the reader finishes without us granting anything.
            spawn({
                let lock = Arc::clone(&lock);
                move || {
                    crate::init_thread();
                    lock.read_lock();
                    assert!(lock.load_relaxed().is_rd_sh());
                    // RdSh reads stay on the fast path.
                    assert!(!lock.read_lock());
                    crate::shutdown_thread();
                }
            })
            .join()
            .unwrap();

            assert!(lock.load_relaxed().is_rd_sh());
            crate::shutdown_thread();
        }

        #[test]
        fn write_revokes_read_shared_access() {
            let lock = Arc::new(Lock::new());
            let done = Arc::new(AtomicBool::new(false));

            // One reader takes the lock to RdEx and then keeps granting.
            let reader = spawn({
                let lock = Arc::clone(&lock);
                let done = Arc::clone(&done);
                move || {
                    crate::init_thread();
                    lock.read_lock();
                    while !done.load(Ordering::Relaxed) {
                        crate::yield_locks();
                        std::thread::yield_now();
                    }
                    crate::shutdown_thread();
                }
            });

            // A second reader broadens to RdSh, then writes, which must
            // ask every active thread for permission.
            let writer = spawn({
                let lock = Arc::clone(&lock);
                let done = Arc::clone(&done);
                move || {
                    crate::init_thread();
                    while !lock.load_relaxed().is_rd_ex() {
                        std::thread::yield_now();
                    }
                    lock.read_lock();
                    assert!(lock.load_relaxed().is_rd_sh());

                    lock.write_lock();
                    assert!(lock.load_relaxed().owned_by(thread::current()));
                    done.store(true, Ordering::Relaxed);
                    crate::shutdown_thread();
                }
            });

            writer.join().unwrap();
            reader.join().unwrap();
        }
    }
}

#[cfg(all(loom, test))]
mod model {
    use loom::cell::UnsafeCell;
    use loom::sync::Arc;
    use loom::{model, thread};

    use super::Lock;

    #[test]
    fn write_barriers_are_mutually_exclusive() {
        model(|| {
            let lock = Arc::new(Lock::new());
            let data = Arc::new(UnsafeCell::new(0));

            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let lock = Arc::clone(&lock);
                    let data = Arc::clone(&data);
                    thread::spawn(move || {
                        crate::init_thread();
                        lock.write_lock();
                        data.with_mut(|value| unsafe { *value += 1 });
                        // Shutting down grants the peer's pending steal and
                        // publishes our write.
                        crate::shutdown_thread();
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }

            data.with(|value| assert_eq!(unsafe { *value }, 2));
        });
    }

    #[test]
    fn steal_from_blocked_owner_sees_its_writes() {
        model(|| {
            let lock = Arc::new(Lock::new());
            let data = Arc::new(UnsafeCell::new(0));

            let owner = thread::spawn({
                let lock = Arc::clone(&lock);
                let data = Arc::clone(&data);
                move || {
                    crate::init_thread();
                    lock.write_lock();
                    data.with_mut(|value| unsafe { *value = 42 });
                    crate::shutdown_thread();
                }
            });

            let thief = thread::spawn({
                let lock = Arc::clone(&lock);
                let data = Arc::clone(&data);
                move || {
                    crate::init_thread();
                    lock.write_lock();
                    // Either we beat the owner to its first acquisition, or
                    // we stole after its write and must observe it.
                    let value = data.with(|value| unsafe { *value });
                    assert!(value == 0 || value == 42);
                    crate::shutdown_thread();
                }
            });

            owner.join().unwrap();
            thief.join().unwrap();
        });
    }
}
