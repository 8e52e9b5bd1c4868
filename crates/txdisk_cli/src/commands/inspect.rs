//! Inspect command implementation.

use super::open_log;
use crate::error::CliResult;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::ExitCode;
use txdisk_core::log::SegmentIterator;

/// Summary of one segment.
#[derive(Debug, Serialize)]
pub struct SegmentInfo {
    /// Segment number.
    pub segment: u64,
    /// File size in bytes.
    pub size: u64,
    /// Bytes covered by complete entries.
    pub valid_len: u64,
    /// Entry counts keyed by type name.
    pub entries: BTreeMap<String, usize>,
    /// First problem found, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Reads every segment and counts its entries.
pub fn collect(dir: &Path) -> CliResult<Vec<SegmentInfo>> {
    let store = open_log(dir)?;
    let mut out = Vec::new();
    for segment in store.list()? {
        let mut iter = SegmentIterator::new(segment, store.open(segment)?)?;
        let mut entries = BTreeMap::new();
        let mut error = None;
        for item in iter.by_ref() {
            match item {
                Ok((_, entry)) => *entries.entry(format!("{:?}", entry.entry_type())).or_insert(0) += 1,
                Err(e) => {
                    error = Some(e.to_string());
                    break;
                }
            }
        }
        out.push(SegmentInfo {
            segment,
            size: iter.total_size(),
            valid_len: iter.valid_len(),
            entries,
            error,
        });
    }
    Ok(out)
}

/// Runs the inspect command.
pub fn run(dir: &Path, json: bool) -> CliResult<ExitCode> {
    let segments = collect(dir)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&segments)?);
        return Ok(ExitCode::SUCCESS);
    }

    println!("Instance: {}", dir.display());
    println!("Segments: {}", segments.len());
    for info in &segments {
        println!();
        println!("  txlog_{:08}  {} bytes", info.segment, info.size);
        for (kind, count) in &info.entries {
            println!("    {kind:<14} {count}");
        }
        if info.valid_len < info.size && info.error.is_none() {
            println!("    partial entry after byte {}", info.valid_len);
        }
        if let Some(error) = &info.error {
            println!("    error: {error}");
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;
    use txdisk_core::log::LogEntry;
    use txdisk_core::TransactionIdentifier;

    #[test]
    fn counts_entries_per_type() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("logs")).unwrap();
        let mut bytes = Vec::new();
        for n in 0..3 {
            let ident = TransactionIdentifier::Local(n);
            bytes.extend(LogEntry::Commit { ident: ident.clone(), effects: Vec::new() }.encode_frame().unwrap());
            bytes.extend(LogEntry::Completed { ident }.encode_frame().unwrap());
        }
        bytes.extend_from_slice(b"TX");
        fs::write(dir.path().join("logs/txlog_00000001"), &bytes).unwrap();

        let segments = collect(dir.path()).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].entries["Commit"], 3);
        assert_eq!(segments[0].entries["Completed"], 3);
        assert_eq!(segments[0].valid_len + 2, segments[0].size);
        assert!(segments[0].error.is_none());
    }

    #[test]
    fn rejects_plain_directories() {
        let dir = tempdir().unwrap();
        assert!(collect(dir.path()).is_err());
    }
}
