//! # linescan - Rust client runtime for JS-50 laser line-profile scan heads
//!
//! Multi-head scanning runtime for networked laser profile sensors:
//! - UDP broadcast discovery of scan heads and ScanSync timing devices
//! - Per-head control/data TCP sessions with a background receive task
//! - Phase-table scheduling of interleaved camera/laser firings
//! - Lock-free per-pair profile buffering with frame assembly across heads
//!
//! ## Quick Start
//! ```no_run
//! use linescan::{DataFormat, ScanSystem, Units};
//! use std::time::Duration;
//!
//! let mut system = ScanSystem::new(Units::Inches).unwrap();
//! system.discover().unwrap();
//! system.create_scan_head(12345, 0).unwrap();
//! system.connect(Duration::from_secs(10)).unwrap();
//!
//! system.phase_create().unwrap();
//! system.phase_insert_camera(12345, linescan::Camera::A, None).unwrap();
//!
//! let period_us = system.min_scan_period().max(1000);
//! system.start_scanning(period_us, DataFormat::XyBrightnessFull, false).unwrap();
//! ```

pub mod alignment;
pub mod discover;
pub mod error;
pub mod model;
pub mod net;
pub mod packet;
pub mod phase;
pub mod profile;
pub mod protocol;
pub mod queue;
pub mod scan_head;
pub mod scansync;
pub mod system;
pub mod types;
pub mod window;

pub use discover::power_cycle_scan_head;
pub use error::Error;
pub use profile::{Profile, ProfilePoint, RawProfile};
pub use scan_head::ScanHead;
pub use system::ScanSystem;
pub use types::*;
pub use window::ScanWindow;

/// Result type alias for linescan operations.
pub type Result<T> = std::result::Result<T, Error>;
