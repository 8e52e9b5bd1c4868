//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::io::Read;
use std::path::Path;
use std::time::Duration;
use txdisk_core::{Config, Engine, Session};

pub fn config(dir: &Path) -> Config {
    Config::new(dir)
        .synchronous_recovery(true)
        .lock_wait_timeout(Duration::from_millis(500))
        .timeout_check_interval(Duration::from_millis(50))
        .group_commit_window(Duration::from_millis(1))
}

pub fn boot(dir: &Path) -> Engine {
    let engine = Engine::boot(config(dir)).unwrap();
    engine.wait_for_bootup(Duration::from_secs(5)).unwrap();
    engine
}

pub fn read_all(session: &Session, path: &str) -> Vec<u8> {
    let mut stream = session.open_input_stream(path, false).unwrap();
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).unwrap();
    buf
}

pub fn write_file(session: &Session, path: &str, data: &[u8]) {
    session.create_file(path, false).unwrap();
    let mut out = session.open_output_stream(path, false).unwrap();
    out.write_bytes(data).unwrap();
    out.close();
}
