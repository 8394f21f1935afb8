//! Version capture on write, and navigation across recorded versions.
//!
//! # Invariants
//! - Capture and the entity write commit in the same transaction.
//! - Navigation never records a version and never moves a version number.
//! - A failed navigation leaves the stored row, its pointer and the
//!   in-memory entity exactly as they were.

pub mod navigator;
pub mod recorder;

pub use navigator::{ApproachKind, NavigationReport, Navigator};
pub use recorder::{AuthorResolver, CaptureMode, Recorder, load_entity, retry_on_conflict};
