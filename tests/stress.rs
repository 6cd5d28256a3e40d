//! Account-transfer stress suite.
//!
//! Threads repeatedly pick two distinct accounts to move one unit between
//! under write barriers, plus a third account to read. If the barriers
//! enforce mutual exclusion, the balances sum to zero once every thread
//! has joined.

use std::cell::UnsafeCell;
use std::sync::{Arc, Barrier};
use std::thread;

use once_cell::sync::Lazy;

use octetlock::{lock_all, Access, Lock};

/// A balance guarded by an octet lock.
struct Account {
    balance: UnsafeCell<i64>,
    lock: Lock,
}

// Balances are only touched under the barrier protocol of `lock`.
unsafe impl Sync for Account {}

impl Account {
    fn new() -> Account {
        Account { balance: UnsafeCell::new(0), lock: Lock::new() }
    }

    /// Caller must hold write access through `self.lock`.
    unsafe fn add(&self, delta: i64) {
        unsafe { *self.balance.get() += delta };
    }

    /// Caller must hold at least read access through `self.lock`.
    unsafe fn read(&self) -> i64 {
        unsafe { *self.balance.get() }
    }
}

/// A small deterministic generator, one per thread.
struct Rng(u64);

impl Rng {
    fn pick(&mut self, bound: usize) -> usize {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (self.0 >> 33) as usize % bound
    }
}

/// Runs `threads` workers over `accounts` accounts for `iterations`
/// transfers each, and returns the final balance sum.
fn transfer_run(
    threads: usize,
    iterations: usize,
    accounts: usize,
    do_yield: bool,
    do_unlock: bool,
) -> i64 {
    let accounts: Arc<Vec<Account>> = Arc::new((0..accounts).map(|_| Account::new()).collect());
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|id| {
            let accounts = Arc::clone(&accounts);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                octetlock::init_thread();
                start.wait();

                let mut rng = Rng(100 * id as u64 + 7);
                let mut done = 0;
                while done < iterations {
                    let from = rng.pick(accounts.len());
                    let to = rng.pick(accounts.len());
                    let extra = rng.pick(accounts.len());
                    // The read-modify-write below cancels out when the
                    // endpoints coincide; pick again.
                    if from == to {
                        continue;
                    }
                    done += 1;

                    lock_all(&[
                        (&accounts[from].lock, Access::Write),
                        (&accounts[to].lock, Access::Write),
                        (&accounts[extra].lock, Access::Read),
                    ]);

                    // SAFETY: write access to `from` and `to` and read
                    // access to `extra` were just acquired as a group.
                    unsafe {
                        let _observed = accounts[extra].read();
                        accounts[from].add(-1);
                        accounts[to].add(1);
                    }

                    if do_unlock {
                        accounts[to].lock.force_unlock();
                        accounts[from].lock.force_unlock();
                        accounts[extra].lock.force_unlock();
                    }
                    if do_yield {
                        octetlock::yield_locks();
                    }
                }

                octetlock::shutdown_thread();
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    // Joining every worker ordered their final writes before these reads.
    accounts.iter().map(|account| unsafe { account.read() }).sum()
}

#[test]
fn single_thread_counter() {
    octetlock::init_thread();
    let account = Account::new();

    for _ in 0..1_000_000 {
        // With no peers there is nothing to grant: the first barrier is a
        // waitless steal from the sentinel, the rest are owner hits.
        let interrupted = account.lock.write_lock();
        assert!(!interrupted);
        unsafe { account.add(1) };
    }

    assert_eq!(unsafe { account.read() }, 1_000_000);
    octetlock::shutdown_thread();
}

#[test]
fn two_threads_ping_pong_one_lock() {
    const ITERS: usize = 10_000;

    let account = Arc::new(Account::new());
    let start = Arc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let account = Arc::clone(&account);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                octetlock::init_thread();
                start.wait();
                for _ in 0..ITERS {
                    account.lock.write_lock();
                    unsafe { account.add(1) };
                }
                octetlock::shutdown_thread();
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(unsafe { account.read() }, (2 * ITERS) as i64);
}

#[test]
fn lots_and_lots_on_a_static_account() {
    static ACCOUNT: Lazy<Account> = Lazy::new(Account::new);

    const ITERS: usize = 1_000;
    const CONCURRENCY: usize = 6;

    let handles: Vec<_> = (0..CONCURRENCY)
        .map(|_| {
            thread::spawn(|| {
                octetlock::init_thread();
                for _ in 0..ITERS {
                    ACCOUNT.lock.write_lock();
                    unsafe { ACCOUNT.add(1) };
                }
                octetlock::shutdown_thread();
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    octetlock::init_thread();
    ACCOUNT.lock.write_lock();
    assert_eq!(unsafe { ACCOUNT.read() }, (ITERS * CONCURRENCY) as i64);
    octetlock::shutdown_thread();
}

#[test]
fn ten_threads_ten_accounts_sum_to_zero() {
    assert_eq!(transfer_run(10, 10_000, 10, false, false), 0);
}

#[test]
fn two_account_contention_exercises_backoff() {
    // Every transfer wants both locks, so passes keep restarting and the
    // exponential backoff kicks in.
    assert_eq!(transfer_run(10, 1_000, 2, false, false), 0);
}

#[test]
fn yielding_citizens_sum_to_zero() {
    assert_eq!(transfer_run(4, 5_000, 8, true, false), 0);
}

#[test]
fn explicit_unlock_sum_to_zero() {
    assert_eq!(transfer_run(4, 5_000, 8, false, true), 0);
}

#[test]
fn orphaned_locks_are_stolen_without_waiting() {
    let accounts: Arc<Vec<Account>> = Arc::new((0..4).map(|_| Account::new()).collect());

    // A worker acquires every account and terminates without releasing.
    thread::spawn({
        let accounts = Arc::clone(&accounts);
        move || {
            octetlock::init_thread();
            for account in accounts.iter() {
                account.lock.write_lock();
                unsafe { account.add(1) };
            }
            octetlock::shutdown_thread();
        }
    })
    .join()
    .unwrap();

    // The orphaned owner is blocked, so stealing completes immediately.
    thread::spawn({
        let accounts = Arc::clone(&accounts);
        move || {
            octetlock::init_thread();
            for account in accounts.iter() {
                let interrupted = account.lock.write_lock();
                assert!(!interrupted);
                unsafe { account.add(-1) };
            }
            octetlock::shutdown_thread();
        }
    })
    .join()
    .unwrap();

    let sum: i64 = accounts.iter().map(|account| unsafe { account.read() }).sum();
    assert_eq!(sum, 0);
}

#[test]
fn foreign_force_unlock_changes_nothing() {
    let account = Arc::new(Account::new());

    thread::spawn({
        let account = Arc::clone(&account);
        move || {
            octetlock::init_thread();
            account.lock.write_lock();
            unsafe { account.add(7) };
            octetlock::shutdown_thread();
        }
    })
    .join()
    .unwrap();

    // We do not own the lock; releasing it must be a silent no-op, and a
    // regular steal must still find the balance intact.
    octetlock::init_thread();
    account.lock.force_unlock();
    account.lock.write_lock();
    assert_eq!(unsafe { account.read() }, 7);
    octetlock::shutdown_thread();
}
