//! Test fixtures and engine helpers.

use std::io::Read;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use txdisk_core::{Config, Engine, Session};

/// Configuration tuned for tests: recovery finishes inside boot, lock
/// waits are short and the detectors run often.
pub fn test_config(dir: &Path) -> Config {
    Config::new(dir)
        .synchronous_recovery(true)
        .lock_wait_timeout(Duration::from_millis(500))
        .timeout_check_interval(Duration::from_millis(50))
        .deadlock_detector_interval(Duration::from_millis(100))
        .group_commit_window(Duration::from_millis(1))
}

/// An engine over a temporary instance directory.
///
/// The engine shuts down when the fixture is dropped; the directory is
/// removed after it.
pub struct TestEngine {
    /// The running engine.
    pub engine: Engine,
    dir: TempDir,
}

impl TestEngine {
    /// Boots an engine with [`test_config`].
    pub fn new() -> Self {
        Self::with_config(|config| config)
    }

    /// Boots an engine with [`test_config`] adjusted by `tune`.
    pub fn with_config(tune: impl FnOnce(Config) -> Config) -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let engine = Engine::boot(tune(test_config(dir.path()))).expect("Failed to boot engine");
        engine
            .wait_for_bootup(Duration::from_secs(5))
            .expect("Engine did not finish booting");
        Self { engine, dir }
    }

    /// The instance directory.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Physical location of a managed path.
    pub fn data_path(&self, path: &str) -> PathBuf {
        self.dir.path().join("data").join(path.trim_start_matches('/'))
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for TestEngine {
    type Target = Engine;

    fn deref(&self) -> &Self::Target {
        &self.engine
    }
}

impl Drop for TestEngine {
    fn drop(&mut self) {
        self.engine.shutdown();
    }
}

/// Runs `f` with a fresh engine.
///
/// # Example
///
/// ```rust,ignore
/// use txdisk_testkit::with_temp_engine;
///
/// #[test]
/// fn my_test() {
///     with_temp_engine(|engine| {
///         let session = engine.create_session().unwrap();
///         session.create_file("/a", false).unwrap();
///         session.commit().unwrap();
///     });
/// }
/// ```
pub fn with_temp_engine<F, R>(f: F) -> R
where
    F: FnOnce(&Engine) -> R,
{
    let fixture = TestEngine::new();
    f(&fixture)
}

/// Creates `path` and writes `data` to it inside `session`.
pub fn write_file(session: &Session, path: &str, data: &[u8]) {
    session.create_file(path, false).expect("create failed");
    let mut out = session.open_output_stream(path, false).expect("open failed");
    out.write_bytes(data).expect("write failed");
    out.close();
}

/// Reads all of `path` inside `session`.
pub fn read_file(session: &Session, path: &str) -> Vec<u8> {
    let mut stream = session.open_input_stream(path, false).expect("open failed");
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).expect("read failed");
    buf
}
