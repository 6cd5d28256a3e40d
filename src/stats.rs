//! Per-thread barrier statistics.
//!
//! Compiled down to no-ops unless the `stats` feature is enabled. The
//! counters are plain thread-local cells: every barrier bumps its own
//! thread's counts, and [`stats`] snapshots them for that thread only.

#[cfg(feature = "stats")]
mod imp {
    use core::cell::Cell;

    std::thread_local! {
        static WRITE_BARRIERS: Cell<u64> = Cell::new(0);
        static SLOW_WRITES: Cell<u64> = Cell::new(0);
        static READ_BARRIERS: Cell<u64> = Cell::new(0);
        static SLOW_READS: Cell<u64> = Cell::new(0);
    }

    /// A snapshot of the calling thread's barrier counters.
    ///
    /// Read barriers are counted separately only in `read-shared` builds;
    /// otherwise they alias write barriers and land in the write counts.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Stats {
        /// Write barriers executed, fast or slow.
        pub write_barriers: u64,
        /// Write barriers that took the slow path.
        pub slow_writes: u64,
        /// Read barriers executed, fast or slow.
        pub read_barriers: u64,
        /// Read barriers that took the slow path.
        pub slow_reads: u64,
    }

    /// Returns the calling thread's barrier counters.
    pub fn stats() -> Stats {
        Stats {
            write_barriers: WRITE_BARRIERS.with(Cell::get),
            slow_writes: SLOW_WRITES.with(Cell::get),
            read_barriers: READ_BARRIERS.with(Cell::get),
            slow_reads: SLOW_READS.with(Cell::get),
        }
    }

    pub(crate) fn record_write_barrier() {
        WRITE_BARRIERS.with(|count| count.set(count.get() + 1));
    }

    pub(crate) fn record_slow_write() {
        SLOW_WRITES.with(|count| count.set(count.get() + 1));
    }

    #[cfg(feature = "read-shared")]
    pub(crate) fn record_read_barrier() {
        READ_BARRIERS.with(|count| count.set(count.get() + 1));
    }

    #[cfg(feature = "read-shared")]
    pub(crate) fn record_slow_read() {
        SLOW_READS.with(|count| count.set(count.get() + 1));
    }
}

#[cfg(not(feature = "stats"))]
mod imp {
    pub(crate) fn record_write_barrier() {}

    pub(crate) fn record_slow_write() {}

    #[cfg(feature = "read-shared")]
    pub(crate) fn record_read_barrier() {}

    #[cfg(feature = "read-shared")]
    pub(crate) fn record_slow_read() {}
}

#[cfg(feature = "read-shared")]
pub(crate) use imp::{record_read_barrier, record_slow_read};

pub(crate) use imp::{record_slow_write, record_write_barrier};

#[cfg(feature = "stats")]
pub use imp::{stats, Stats};

#[cfg(all(not(loom), test, feature = "stats"))]
mod test {
    use crate::Lock;

    #[test]
    fn slow_and_fast_paths_are_counted() {
        crate::init_thread();
        let lock = Lock::new();
        let before = crate::stats();

        // One slow acquisition against the sentinel, then owner hits.
        lock.write_lock();
        for _ in 0..9 {
            lock.write_lock();
        }

        let after = crate::stats();
        assert_eq!(after.write_barriers - before.write_barriers, 10);
        assert_eq!(after.slow_writes - before.slow_writes, 1);
        crate::shutdown_thread();
    }

    #[cfg(feature = "read-shared")]
    #[test]
    fn read_barriers_are_counted_separately() {
        crate::init_thread();
        let lock = Lock::new();
        let before = crate::stats();

        lock.read_lock();
        lock.read_lock();

        let after = crate::stats();
        assert_eq!(after.read_barriers - before.read_barriers, 2);
        assert_eq!(after.slow_reads - before.slow_reads, 1);
        assert_eq!(after.write_barriers, before.write_barriers);
        crate::shutdown_thread();
    }
}
