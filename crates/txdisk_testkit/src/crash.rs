//! Crash recovery testing for txdisk.
//!
//! A crash is simulated with [`Engine::halt`], which stops every worker
//! without writing the records a clean shutdown would. The harness then
//! boots a fresh engine over the same instance directory.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use txdisk_testkit::crash::CrashHarness;
//!
//! let harness = CrashHarness::new();
//! let (engine, faults) = harness.boot_with_faults();
//! faults.set_fail_syncs(true);
//! // ... a commit now fails and the engine stops
//! let engine = harness.crash_and_reboot(engine);
//! ```

use crate::faults::{FailingFileStore, FaultySegmentStore, LogFaults};
use crate::fixtures::test_config;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tracing::info;
use txdisk_core::{Config, DiskStore, Engine, EngineParts, ThreadScheduler};
use txdisk_storage::DirSegmentStore;

/// Boots, crashes and reboots engines over one scratch directory.
pub struct CrashHarness {
    dir: TempDir,
}

impl Default for CrashHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl CrashHarness {
    /// Creates a harness over a new temporary directory.
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    /// The instance directory.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Configuration every boot uses.
    pub fn config(&self) -> Config {
        test_config(self.dir.path())
    }

    fn parts(&self) -> EngineParts {
        let segments = DirSegmentStore::new(&self.dir.path().join("logs")).expect("Failed to open log directory");
        let files = DiskStore::new(self.config().resolved_data_root()).expect("Failed to open data root");
        EngineParts {
            segments: Arc::new(segments),
            files: Arc::new(files),
            scheduler: Arc::new(ThreadScheduler),
        }
    }

    fn ready(engine: Engine) -> Engine {
        engine
            .wait_for_bootup(Duration::from_secs(5))
            .expect("Engine did not finish booting");
        engine
    }

    /// Boots a normal engine and waits for recovery.
    pub fn boot(&self) -> Engine {
        Self::ready(Engine::boot(self.config()).expect("Failed to boot engine"))
    }

    /// Boots an engine whose log fails on command.
    pub fn boot_with_faults(&self) -> (Engine, Arc<LogFaults>) {
        let mut parts = self.parts();
        let (segments, faults) = FaultySegmentStore::new(parts.segments);
        parts.segments = Arc::new(segments);
        let engine = Engine::boot_with(self.config(), parts).expect("Failed to boot engine");
        (Self::ready(engine), faults)
    }

    /// Boots an engine whose file store refuses effects while `failing`.
    ///
    /// Bootup is not awaited: recovery over a failing store does not
    /// finish until the failed transactions are declared complete.
    pub fn boot_with_failing_store(&self, failing: bool) -> (Engine, Arc<FailingFileStore>) {
        let mut parts = self.parts();
        let store = FailingFileStore::new(parts.files, failing);
        parts.files = Arc::clone(&store) as _;
        let engine = Engine::boot_with(self.config(), parts).expect("Failed to boot engine");
        (engine, store)
    }

    /// Simulates a crash of `engine`.
    pub fn crash(engine: Engine) {
        info!(instance = %engine.instance_id(), "simulating crash");
        engine.halt();
    }

    /// Crashes `engine` and boots a new one over the same directory.
    pub fn crash_and_reboot(&self, engine: Engine) -> Engine {
        Self::crash(engine);
        self.boot()
    }
}
