//! Per-thread protocol state and the thread lifecycle.
//!
//! Every participating thread owns one heap-allocated [`ThreadInfo`]
//! record. Its address doubles as the thread's identity token inside lock
//! state words, so the allocation is leaked on purpose: a terminated
//! thread may still be named by the state word of any lock it owned.
//!
//! Peers communicate asymmetrically through the two counters of a
//! `ThreadInfo`. A thread that wants an object pings its owner by bumping
//! the owner's request counter, then polls the owner's response counter.
//! The owner catches up at its next cooperative checkpoint, granting every
//! request at once and implicitly relinquishing all of its exclusive
//! locks.

use core::cell::Cell;
use core::fmt;
use core::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release, SeqCst};

use crate::cfg::atomic::AtomicU32;
use crate::cfg::ordering::mem_ord;
use crate::cfg::trace;

/// The low bit of the request word, set while the thread is blocked.
const BLOCKED: u32 = 1;

/// The request/response counter pair of one participating thread.
///
/// `requests` packs a 31-bit request counter (peers add 2 per ping) with
/// the blocked flag in the low bit. `responses` counts the requests this
/// thread has agreed to and is written by this thread alone. Whenever
/// `requests >> 1` exceeds `responses`, peers are waiting on this thread.
///
/// The counters sit on separate cache lines so that peers hammering
/// `requests` do not invalidate the line the owner re-reads `responses`
/// from.
pub(crate) struct ThreadInfo {
    requests: CacheLine<AtomicU32>,
    responses: CacheLine<AtomicU32>,
}

/// Pads its contents out to a cache-line boundary.
#[repr(align(64))]
struct CacheLine<T>(T);

// The state-word encoding steals the low pointer bit as a tag.
const _: () = assert!(core::mem::align_of::<ThreadInfo>() >= 2);

impl ThreadInfo {
    #[cfg(not(all(loom, test)))]
    pub(crate) const fn new(start_blocked: bool) -> Self {
        Self {
            requests: CacheLine(AtomicU32::new(start_blocked as u32)),
            responses: CacheLine(AtomicU32::new(0)),
        }
    }

    /// Creates a new Loom based `ThreadInfo` instance (non-const).
    #[cfg(all(loom, test))]
    pub(crate) fn new(start_blocked: bool) -> Self {
        Self {
            requests: CacheLine(AtomicU32::new(start_blocked as u32)),
            responses: CacheLine(AtomicU32::new(0)),
        }
    }

    /// Grants every request received so far, atomically setting the
    /// blocked flag to `should_block`.
    ///
    /// Advancing `responses` up to the request count implicitly
    /// relinquishes every lock this thread holds in an exclusive state.
    /// Must not be called while the thread is already blocked; `unblock`
    /// is the only valid transition out of that state.
    pub(crate) fn handle_requests(&self, should_block: bool) {
        // fetch_or returns the prior word, whose high bits equal the
        // current request count either way.
        let req = self.requests.0.fetch_or(should_block as u32, mem_ord(AcqRel));
        debug_assert_eq!(req & BLOCKED, 0, "handle_requests on a blocked thread");

        let request_count = req >> 1;

        // Waiters poll `responses` with acquire loads; releasing here
        // publishes every data write made while the locks were held.
        self.responses.0.store(request_count, mem_ord(Release));
    }

    /// Clears the blocked flag. Pairs with a `handle_requests(true)`.
    pub(crate) fn unblock(&self) {
        self.requests.0.fetch_and(!BLOCKED, mem_ord(AcqRel));
    }

    /// Notifies this thread that the caller wants an object it owns.
    ///
    /// Returns the response count that will satisfy the request, and
    /// whether the target was blocked at the time of the ping. A blocked
    /// target has implicitly granted the request already, so there is
    /// nothing to wait for. The count still advances while the target is
    /// blocked: on wakeup it wants to know that requests were granted in
    /// its absence.
    pub(crate) fn ping(&self) -> Ping {
        // Add 2 to step over the blocked flag in the low bit.
        let req = self.requests.0.fetch_add(2, SeqCst).wrapping_add(2);

        // A 31-bit counter; switch to 64-bit words if this ever fires.
        debug_assert!(req < (1 << 31) - 4, "request counter overflow");

        let owner_was_blocked = req & BLOCKED != 0;
        trace!("pinged {:p}, blocked={}", self, owner_was_blocked);

        Ping { required: req >> 1, owner_was_blocked }
    }

    /// Waits until this thread's response counter reaches `required`.
    ///
    /// `me` must be the calling thread's own record: the loop keeps
    /// granting requests against the caller, since two threads waiting on
    /// each other's responses would otherwise never make progress.
    pub(crate) fn await_response(&self, me: &ThreadInfo, required: u32) {
        trace!("awaiting response {} from {:p}", required, self);

        // Acquire pairs with the release store in `handle_requests`,
        // making the previous owner's data writes visible.
        let mut responses = self.responses.0.load(mem_ord(Acquire));
        while responses < required {
            crate::cfg::thread::yield_now();
            me.handle_requests(false);
            responses = self.responses.0.load(mem_ord(Acquire));
        }
    }

    /// Relaxed view of the response counter. The slow paths snapshot it
    /// before and after to detect whether the caller granted anything
    /// while waiting; only the caller ever writes its own counter, so no
    /// cross-thread ordering is involved.
    pub(crate) fn responses_relaxed(&self) -> u32 {
        self.responses.0.load(mem_ord(Relaxed))
    }
}

impl fmt::Debug for ThreadInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let req = self.requests.0.load(Relaxed);
        f.debug_struct("ThreadInfo")
            .field("requests", &(req >> 1))
            .field("blocked", &(req & BLOCKED != 0))
            .field("responses", &self.responses.0.load(Relaxed))
            .finish()
    }
}

/// The outcome of a [`ThreadInfo::ping`].
pub(crate) struct Ping {
    pub(crate) required: u32,
    pub(crate) owner_was_blocked: bool,
}

/// One slow-path round trip: pings `owner` and waits for its response,
/// unless the ping found it already blocked.
pub(crate) fn notify_one(me: &ThreadInfo, owner: &ThreadInfo) {
    debug_assert!(!core::ptr::eq(me, owner), "thread notified itself");

    let ping = owner.ping();
    if !ping.owner_was_blocked {
        owner.await_response(me, ping.required);
    }
}

#[cfg(not(all(loom, test)))]
static DEAD_THREAD: ThreadInfo = ThreadInfo::new(true);

#[cfg(all(loom, test))]
loom::lazy_static! {
    static ref DEAD_THREAD: ThreadInfo = ThreadInfo::new(true);
}

/// The process-wide "dead thread" that owns every newly created lock.
///
/// It is permanently blocked, so the first real acquirer of a fresh lock
/// takes the slow path but never waits: pings against a blocked thread
/// are implicitly granted.
pub(crate) fn dead_thread() -> &'static ThreadInfo {
    &DEAD_THREAD
}

#[cfg(not(all(loom, test)))]
std::thread_local! {
    static CURRENT: Cell<Option<&'static ThreadInfo>> = Cell::new(None);
}

#[cfg(all(loom, test))]
loom::thread_local! {
    static CURRENT: Cell<Option<&'static ThreadInfo>> = Cell::new(None);
}

/// The calling thread's own record.
///
/// # Panics
///
/// Panics if the thread never called [`init_thread`].
pub(crate) fn current() -> &'static ThreadInfo {
    CURRENT
        .with(Cell::get)
        .expect("octetlock: thread used a barrier before init_thread()")
}

/// Registers the calling thread with the barrier protocol.
///
/// Must be called exactly once per OS thread, before any barrier. The
/// record it allocates is leaked on purpose: lock state words may keep
/// naming this thread long after it has terminated.
pub fn init_thread() {
    CURRENT.with(|current| {
        debug_assert!(current.get().is_none(), "init_thread called twice on this thread");

        let info: &'static ThreadInfo = Box::leak(Box::new(ThreadInfo::new(false)));
        current.set(Some(info));
        trace!("registered thread {:p}", info);

        #[cfg(feature = "read-shared")]
        registry::insert(info);
    });
}

/// Deregisters the calling thread.
///
/// Marks the thread blocked and grants every outstanding request, so
/// peers can keep stealing its locks without waiting. The thread record
/// stays allocated; see [`init_thread`].
pub fn shutdown_thread() {
    let me = current();
    me.handle_requests(true);
    trace!("thread {:p} shut down", me);

    #[cfg(feature = "read-shared")]
    registry::remove(me);
}

/// A cooperative checkpoint: grants every request issued against the
/// calling thread, relinquishing all exclusive locks it holds.
///
/// Calling this at loop boundaries improves throughput under contention;
/// correctness never requires it, because every slow-path wait grants
/// requests on the waiter's behalf.
pub fn yield_locks() {
    current().handle_requests(false);
}

#[cfg(feature = "read-shared")]
pub(crate) mod registry {
    //! The set of live threads, consulted when a write barrier must
    //! revoke read-shared access: readers are not tracked per object, so
    //! permission is requested from every active thread.

    use super::ThreadInfo;
    use crate::cfg::sync::Mutex;

    #[cfg(not(all(loom, test)))]
    static ACTIVE: Mutex<Vec<&'static ThreadInfo>> = Mutex::new(Vec::new());

    #[cfg(all(loom, test))]
    loom::lazy_static! {
        static ref ACTIVE: Mutex<Vec<&'static ThreadInfo>> = Mutex::new(Vec::new());
    }

    pub(crate) fn insert(info: &'static ThreadInfo) {
        let mut active = ACTIVE.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        active.push(info);
    }

    pub(crate) fn remove(info: &'static ThreadInfo) {
        let mut active = ACTIVE.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let index = active.iter().position(|peer| core::ptr::eq(*peer, info));
        debug_assert!(index.is_some(), "shutdown of an unregistered thread");
        if let Some(index) = index {
            active.swap_remove(index);
        }
    }

    /// Pings every registered thread other than `me` and returns the
    /// `(peer, required_response)` pairs still worth waiting on. The set
    /// mutex is held across the pings but must be released before the
    /// caller starts waiting.
    pub(crate) fn ping_all(me: &'static ThreadInfo) -> Vec<(&'static ThreadInfo, u32)> {
        let active = ACTIVE.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut peers = Vec::with_capacity(active.len());
        for peer in active.iter().copied() {
            if core::ptr::eq(peer, me) {
                continue;
            }
            let ping = peer.ping();
            if !ping.owner_was_blocked {
                peers.push((peer, ping.required));
            }
        }
        peers
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use super::{dead_thread, notify_one, ThreadInfo};

    #[test]
    fn grants_all_requests_at_once() {
        let info = ThreadInfo::new(false);
        let first = info.ping();
        let second = info.ping();
        assert!(!first.owner_was_blocked);
        assert!(!second.owner_was_blocked);
        assert_eq!(first.required, 1);
        assert_eq!(second.required, 2);

        info.handle_requests(false);
        assert_eq!(info.responses_relaxed(), 2);
    }

    #[test]
    fn ping_reports_blocked_targets() {
        let info = ThreadInfo::new(true);
        let ping = info.ping();
        assert!(ping.owner_was_blocked);
        assert_eq!(ping.required, 1);
    }

    #[test]
    fn block_round_trip() {
        let info = ThreadInfo::new(false);
        info.handle_requests(true);
        assert!(info.ping().owner_was_blocked);

        info.unblock();
        assert!(!info.ping().owner_was_blocked);
        info.handle_requests(false);
        assert_eq!(info.responses_relaxed(), 2);
    }

    #[test]
    fn responses_track_requests_monotonically() {
        let info = ThreadInfo::new(false);
        let mut last = 0;
        for round in 1..=100 {
            info.ping();
            info.handle_requests(false);
            let responses = info.responses_relaxed();
            assert_eq!(responses, round);
            assert!(responses >= last);
            last = responses;
        }
    }

    #[test]
    fn satisfied_response_returns_without_waiting() {
        let me = ThreadInfo::new(false);
        let owner = ThreadInfo::new(false);
        let ping = owner.ping();
        owner.handle_requests(false);
        owner.await_response(&me, ping.required);
    }

    #[test]
    fn notify_blocked_owner_never_waits() {
        let me = ThreadInfo::new(false);
        let owner = ThreadInfo::new(true);
        notify_one(&me, &owner);
        assert_eq!(owner.responses_relaxed(), 0);
    }

    #[test]
    fn notify_waits_for_a_grant() {
        let me = ThreadInfo::new(false);
        let owner = ThreadInfo::new(false);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                while owner.requests.0.load(core::sync::atomic::Ordering::Relaxed) >> 1 == 0 {
                    std::thread::yield_now();
                }
                owner.handle_requests(false);
            });
            notify_one(&me, &owner);
        });
        assert_eq!(owner.responses_relaxed(), 1);
    }

    #[test]
    fn dead_thread_is_permanently_blocked() {
        assert!(dead_thread().ping().owner_was_blocked);
    }

    #[test]
    fn lifecycle_round_trip() {
        crate::init_thread();
        let me = super::current();
        assert_eq!(me.responses_relaxed(), 0);
        crate::yield_locks();
        crate::shutdown_thread();
        assert!(me.ping().owner_was_blocked);
    }

    #[test]
    #[should_panic = "before init_thread"]
    fn barrier_before_init_is_detected() {
        super::current();
    }

    #[test]
    #[should_panic = "init_thread called twice"]
    fn double_init_is_detected() {
        crate::init_thread();
        crate::shutdown_thread();
        crate::init_thread();
    }
}
