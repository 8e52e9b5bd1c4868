//! # txdisk testkit
//!
//! Test utilities for txdisk.
//!
//! This crate provides:
//! - [`TestEngine`], an engine over a scratch instance directory
//! - [`FaultySegmentStore`] and [`FailingFileStore`] for failure injection
//! - [`CrashHarness`], which halts an engine and boots a new one on the
//!   same directory
//! - stress runners for concurrent local transactions
//!
//! ## Usage
//!
//! ```rust,ignore
//! use txdisk_testkit::prelude::*;
//!
//! #[test]
//! fn survives_restart() {
//!     let mut harness = CrashHarness::new();
//!     let engine = harness.boot();
//!     // ... work, then
//!     let engine = harness.crash_and_reboot(engine);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod faults;
pub mod fixtures;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::faults::*;
    pub use crate::fixtures::*;
    pub use crate::stress::*;
}

pub use crash::*;
pub use faults::*;
pub use fixtures::*;
pub use stress::*;
