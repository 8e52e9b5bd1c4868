//! Dump-log command implementation.

use super::{describe_effect, open_log};
use crate::error::CliResult;
use serde::Serialize;
use std::path::Path;
use std::process::ExitCode;
use txdisk_core::log::{LogEntry, LogPosition, LogScanner};

/// Log entry representation for output.
#[derive(Debug, Serialize)]
pub struct EntryInfo {
    /// Segment number.
    pub segment: u64,
    /// Offset of the frame in the segment.
    pub offset: u64,
    /// Entry type.
    pub entry_type: String,
    /// Transaction identifier.
    pub ident: String,
    /// Effects carried by prepare and commit entries.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub effects: Vec<String>,
    /// Event ids raised or consumed.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<u64>,
    /// Checkpoint progress.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied: Option<u32>,
}

impl EntryInfo {
    fn new(position: LogPosition, entry: &LogEntry) -> Self {
        let mut info = Self {
            segment: position.segment,
            offset: position.offset,
            entry_type: format!("{:?}", entry.entry_type()),
            ident: entry.ident().to_string(),
            effects: Vec::new(),
            events: Vec::new(),
            applied: None,
        };
        match entry {
            LogEntry::Prepare { effects, .. } | LogEntry::Commit { effects, .. } => {
                info.effects = effects.iter().map(describe_effect).collect();
            }
            LogEntry::EventEnqueue { events, .. } => info.events = events.iter().map(|e| e.id).collect(),
            LogEntry::EventDequeue { event_id, .. } => info.events.push(*event_id),
            LogEntry::Checkpoint { applied, .. } => info.applied = Some(*applied),
            LogEntry::Rollback { .. } | LogEntry::Completed { .. } => {}
        }
        info
    }
}

/// Runs the dump-log command.
pub fn run(dir: &Path, json: bool, limit: Option<usize>) -> CliResult<ExitCode> {
    let scanner = LogScanner::new(open_log(dir)?)?;
    for item in scanner.take(limit.unwrap_or(usize::MAX)) {
        let (position, entry) = item?;
        let info = EntryInfo::new(position, &entry);
        if json {
            println!("{}", serde_json::to_string(&info)?);
        } else {
            print_text(&info);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn print_text(info: &EntryInfo) {
    print!("{:>8}@{:<10} {:<13} {}", info.segment, info.offset, info.entry_type, info.ident);
    if let Some(applied) = info.applied {
        print!(" applied={applied}");
    }
    if !info.events.is_empty() {
        print!(" events={:?}", info.events);
    }
    println!();
    for effect in &info.effects {
        println!("{:20}- {effect}", "");
    }
}
