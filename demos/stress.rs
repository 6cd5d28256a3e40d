//! Exercises octet locks as lightweight locks under configurable
//! contention.
//!
//! Creates an array of accounts, all starting at zero. Every thread
//! repeatedly picks one account to increment, one to decrement, and a
//! third to just read, acquiring all three as a group. At the end the sum
//! of all balances must be zero, provided the barriers enforce mutual
//! exclusion.
//!
//! Usage: `stress [THREADS] [ITERATIONS] [ACCOUNTS]`

use std::cell::UnsafeCell;
use std::env;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

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
}

/// A small deterministic generator, seeded per thread.
struct Rng(u64);

impl Rng {
    fn pick(&mut self, bound: usize) -> usize {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (self.0 >> 33) as usize % bound
    }
}

fn parse_arg(args: &[String], index: usize, default: usize) -> usize {
    match args.get(index) {
        Some(raw) => match raw.parse() {
            Ok(value) if value >= 1 => value,
            _ => {
                eprintln!("invalid argument `{raw}`, expected a positive integer");
                process::exit(2);
            }
        },
        None => default,
    }
}

fn futz(id: usize, accounts: &[Account], iterations: usize) {
    octetlock::init_thread();

    let mut rng = Rng(100 * id as u64 + 7);
    let mut done = 0;
    while done < iterations {
        let from = rng.pick(accounts.len());
        let to = rng.pick(accounts.len());
        let extra = rng.pick(accounts.len());
        // The read-modify-write below cancels out when the endpoints
        // coincide; pick again.
        if from == to {
            continue;
        }
        done += 1;

        lock_all(&[
            (&accounts[from].lock, Access::Write),
            (&accounts[to].lock, Access::Write),
            (&accounts[extra].lock, Access::Read),
        ]);

        // SAFETY: write access to `from` and `to` and read access to
        // `extra` were just acquired as a group.
        unsafe {
            let _observed = *accounts[extra].balance.get();
            *accounts[from].balance.get() -= 1;
            *accounts[to].balance.get() += 1;
        }
    }

    #[cfg(feature = "stats")]
    {
        let stats = octetlock::stats();
        println!(
            "thread {id}: {}/{} slow writes, {}/{} slow reads",
            stats.slow_writes, stats.write_barriers, stats.slow_reads, stats.read_barriers,
        );
    }

    octetlock::shutdown_thread();
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let threads = parse_arg(&args, 1, 10);
    let iterations = parse_arg(&args, 2, 10_000);
    let num_accounts = parse_arg(&args, 3, 10);

    println!("threads={threads} iterations={iterations} accounts={num_accounts}");

    let accounts: Arc<Vec<Account>> = Arc::new((0..num_accounts).map(|_| Account::new()).collect());

    let start = Instant::now();

    let handles: Vec<_> = (0..threads)
        .map(|id| {
            let accounts = Arc::clone(&accounts);
            thread::spawn(move || futz(id, &accounts, iterations))
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let elapsed = start.elapsed();

    // Joining every worker ordered their final writes before these reads.
    let sum: i64 = accounts.iter().map(|account| unsafe { *account.balance.get() }).sum();

    println!("{}ms", elapsed.as_millis());
    assert_eq!(sum, 0, "balances must cancel out");
}
