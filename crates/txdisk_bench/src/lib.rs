//! Benchmark utilities.

#![warn(missing_docs)]

use std::time::Duration;
use txdisk_core::log::{Effect, LogEntry};
use txdisk_core::{Config, ResourcePath, TransactionIdentifier};

/// Deterministic payload of the given size.
pub fn payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

/// A path `depth` levels below the root.
pub fn deep_path(depth: usize, leaf: usize) -> ResourcePath {
    let mut text = String::new();
    for level in 0..depth.saturating_sub(1) {
        text.push_str(&format!("/d{level}"));
    }
    text.push_str(&format!("/f{leaf}"));
    ResourcePath::parse(&text).expect("generated path is valid")
}

/// A one-phase commit entry writing `size` bytes.
pub fn commit_entry(n: u64, size: usize) -> LogEntry {
    LogEntry::Commit {
        ident: TransactionIdentifier::Local(n),
        effects: vec![Effect::Write {
            path: deep_path(2, 0),
            offset: 0,
            data: payload(size),
        }],
    }
}

/// Engine configuration for benchmarks.
pub fn bench_config(dir: &std::path::Path) -> Config {
    Config::new(dir)
        .synchronous_recovery(true)
        .group_commit_window(Duration::from_millis(1))
}
