//! Dead-letter files for events nobody could handle.
//!
//! Each rejected event becomes one JSON line in `letter_N` under the
//! instance's `deadletter/` directory. A file is rotated once it reaches
//! [`DEAD_LETTER_ROTATE_BYTES`].

use crate::error::TxResult;
use crate::log::QueuedEvent;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// Size at which a dead-letter file is closed and the next one started.
pub const DEAD_LETTER_ROTATE_BYTES: u64 = 10 * 1024;

const LETTER_PREFIX: &str = "letter_";

/// One undeliverable event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Queue id of the event.
    pub event_id: u64,
    /// The changed path.
    pub path: String,
    /// Whether the path is a directory.
    pub is_directory: bool,
    /// Event bitmask.
    pub event_type: u8,
    /// Why delivery failed.
    pub reason: String,
    /// Milliseconds since the Unix epoch.
    pub recorded_at: u64,
}

impl DeadLetter {
    /// Builds a letter for `event`.
    #[must_use]
    pub fn new(event: &QueuedEvent, reason: impl Into<String>) -> Self {
        let recorded_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        Self {
            event_id: event.id,
            path: event.event.path.to_string(),
            is_directory: event.event.is_directory,
            event_type: event.event.event_type.bits(),
            reason: reason.into(),
            recorded_at,
        }
    }
}

fn letter_index(path: &Path) -> Option<u64> {
    path.file_name()?
        .to_str()?
        .strip_prefix(LETTER_PREFIX)?
        .parse()
        .ok()
}

fn letter_files(dir: &Path) -> io::Result<Vec<(u64, PathBuf)>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(index) = letter_index(&path) {
            files.push((index, path));
        }
    }
    files.sort();
    Ok(files)
}

/// Appends dead letters to the current file, rotating by size.
#[derive(Debug)]
pub struct DeadLetterWriter {
    dir: PathBuf,
    index: u64,
    file: Option<File>,
    size: u64,
}

impl DeadLetterWriter {
    /// Continues after the newest existing file in `dir`, creating the
    /// directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or read.
    pub fn open(dir: impl Into<PathBuf>) -> TxResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let (index, size) = match letter_files(&dir)?.pop() {
            Some((index, path)) => (index, fs::metadata(path)?.len()),
            None => (1, 0),
        };
        Ok(Self {
            dir,
            index,
            file: None,
            size,
        })
    }

    /// The file the next letter goes to.
    #[must_use]
    pub fn current_path(&self) -> PathBuf {
        self.dir.join(format!("{LETTER_PREFIX}{}", self.index))
    }

    /// Appends one letter and syncs it.
    ///
    /// # Errors
    ///
    /// Returns an error if the letter cannot be written.
    pub fn write(&mut self, letter: &DeadLetter) -> TxResult<()> {
        if self.size >= DEAD_LETTER_ROTATE_BYTES {
            self.index += 1;
            self.size = 0;
            self.file = None;
            info!(file = %self.current_path().display(), "dead-letter file rotated");
        }
        let mut line = serde_json::to_vec(letter).map_err(io::Error::from)?;
        line.push(b'\n');

        if self.file.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.current_path())?;
            self.file = Some(file);
        }
        if let Some(file) = self.file.as_mut() {
            file.write_all(&line)?;
            file.sync_data()?;
        }
        self.size += line.len() as u64;
        warn!(event_id = letter.event_id, path = %letter.path, reason = %letter.reason, "event dead-lettered");
        Ok(())
    }

    /// Reads every letter in `dir`, oldest file first.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be read or a line is not a
    /// letter.
    pub fn read_all(dir: &Path) -> TxResult<Vec<DeadLetter>> {
        let mut letters = Vec::new();
        if !dir.exists() {
            return Ok(letters);
        }
        for (_, path) in letter_files(dir)? {
            for line in BufReader::new(File::open(path)?).lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                letters.push(serde_json::from_str(&line).map_err(io::Error::from)?);
            }
        }
        Ok(letters)
    }
}
