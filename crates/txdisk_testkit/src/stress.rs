//! Stress runners for txdisk.
//!
//! These drive many short local transactions from several threads and
//! report how many committed.

use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use txdisk_core::{Engine, TxResult};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Transactions attempted.
    pub total_ops: usize,
    /// Transactions that committed.
    pub successful_ops: usize,
    /// Transactions that failed or were rolled back.
    pub failed_ops: usize,
    /// Wall-clock duration.
    pub duration: Duration,
    /// Transactions per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the run.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {name} ===");
        println!("Transactions: {}", self.total_ops);
        println!("Committed: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} tx/sec", self.ops_per_second);
    }
}

/// Configuration for stress runs.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Concurrent threads.
    pub threads: usize,
    /// Transactions each thread runs.
    pub transactions_per_thread: usize,
    /// Distinct files the writers spread over.
    pub files: usize,
    /// Bytes appended per transaction.
    pub write_size: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            transactions_per_thread: 250,
            files: 16,
            write_size: 64,
        }
    }
}

fn run_threads(config: &StressConfig, work: impl Fn(usize, usize) -> TxResult<()> + Sync) -> StressTestResult {
    let successful = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    let start = Instant::now();
    thread::scope(|scope| {
        for t in 0..config.threads {
            let (work, successful, failed) = (&work, &successful, &failed);
            scope.spawn(move || {
                for i in 0..config.transactions_per_thread {
                    match work(t, i) {
                        Ok(()) => successful.fetch_add(1, Ordering::Relaxed),
                        Err(_) => failed.fetch_add(1, Ordering::Relaxed),
                    };
                }
            });
        }
    });
    StressTestResult::new(
        successful.into_inner(),
        failed.into_inner(),
        start.elapsed(),
    )
}

/// Appends to files under `/stress` from every thread.
pub fn stress_concurrent_writers(engine: &Engine, config: &StressConfig) -> TxResult<StressTestResult> {
    let setup = engine.create_session()?;
    if !setup.file_exists("/stress", true)? {
        setup.create_file("/stress", true)?;
    }
    setup.commit()?;

    let data = vec![0xABu8; config.write_size];
    Ok(run_threads(config, |t, i| {
        let path = format!("/stress/f{}", (t * config.transactions_per_thread + i) % config.files);
        let session = engine.create_session()?;
        let result = (|| {
            if !session.file_exists(&path, true)? {
                session.create_file(&path, false)?;
            }
            let mut out = session.open_output_stream(&path, false)?;
            out.write_bytes(&data)?;
            out.close();
            session.commit()
        })();
        if result.is_err() {
            let _ = session.rollback();
        }
        result
    }))
}

/// Increments a decimal counter in `/counter` from every thread.
///
/// Returns the run result and the final counter value, which equals the
/// number of committed increments when isolation holds.
pub fn stress_counter(engine: &Engine, config: &StressConfig) -> TxResult<(StressTestResult, u64)> {
    let setup = engine.create_session()?;
    if !setup.file_exists("/counter", true)? {
        setup.create_file("/counter", false)?;
    }
    setup.commit()?;

    let result = run_threads(config, |_, _| {
        let session = engine.create_session()?;
        let outcome = (|| {
            let current = read_counter(&session)?;
            session.truncate_file("/counter", 0)?;
            let mut out = session.open_output_stream("/counter", false)?;
            out.write_bytes((current + 1).to_string().as_bytes())?;
            out.close();
            session.commit()
        })();
        if outcome.is_err() {
            let _ = session.rollback();
        }
        outcome
    });

    let reader = engine.create_session()?;
    let value = read_counter(&reader)?;
    reader.commit()?;
    Ok((result, value))
}

fn read_counter(session: &txdisk_core::Session) -> TxResult<u64> {
    let mut stream = session.open_input_stream("/counter", true)?;
    let mut text = String::new();
    stream
        .read_to_string(&mut text)
        .map_err(txdisk_core::TxError::Io)?;
    stream.close();
    Ok(text.trim().parse().unwrap_or(0))
}
