//! Pending command implementation.

use super::open_log;
use crate::error::CliResult;
use std::path::Path;
use std::process::ExitCode;
use txdisk_core::recovery::{self, RecoveryPlan};

/// Runs the pending command: a dry-run recovery scan.
pub fn run(dir: &Path) -> CliResult<ExitCode> {
    let plan = RecoveryPlan::scan(open_log(dir)?)?;
    println!("Scanned {} entries", plan.entries);
    if plan.is_clean() && plan.abandoned.is_empty() {
        println!("Nothing to recover");
        return Ok(ExitCode::SUCCESS);
    }

    for (ident, status) in recovery::describe(&plan) {
        println!("  {status:<21} {ident}");
    }
    if !plan.live_events.is_empty() {
        println!("  {} undelivered event(s)", plan.live_events.len());
    }
    Ok(ExitCode::SUCCESS)
}
