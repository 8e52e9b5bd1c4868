//! CLI command implementations.

pub mod dump_log;
pub mod inspect;
pub mod pending;
pub mod verify;

use crate::error::{CliError, CliResult};
use std::path::Path;
use std::sync::Arc;
use txdisk_core::log::Effect;
use txdisk_storage::{DirSegmentStore, SegmentStore};

/// Opens the log of an existing instance without creating anything.
pub fn open_log(dir: &Path) -> CliResult<Arc<dyn SegmentStore>> {
    let logs = dir.join("logs");
    if !logs.is_dir() {
        return Err(CliError::NotAnInstance(dir.to_path_buf()));
    }
    Ok(Arc::new(DirSegmentStore::new(&logs)?))
}

/// One-line rendering of an effect.
pub fn describe_effect(effect: &Effect) -> String {
    match effect {
        Effect::CreateFile { path } => format!("create-file {path}"),
        Effect::CreateDir { path } => format!("create-dir {path}"),
        Effect::Delete { path } => format!("delete {path}"),
        Effect::Move { source, destination } => format!("move {source} -> {destination}"),
        Effect::Write { path, offset, data } => format!("write {path} @{offset} ({} bytes)", data.len()),
        Effect::Truncate { path, length } => format!("truncate {path} to {length}"),
    }
}
