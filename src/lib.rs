//! Cohort (promotion) management and progress-tracking engine.
//!
//! Students gain course access transitively: cohort membership grants access
//! to whatever courses the cohort's scheduled sessions deliver. Attendance is
//! tracked per (student, session), and a single 0..1 progress score per
//! (student, cohort) is derived from course completion (0.7) and attendance
//! (0.3). A background scheduler reconciles unmarked attendance and keeps
//! snapshots fresh; a one-shot migration tool converts the legacy
//! direct-enrollment model.

pub mod attendance;
pub mod cohorts;
pub mod db;
pub mod error;
pub mod migration;
pub mod models;
pub mod progress;
pub mod report;
pub mod scheduler;
pub mod sessions;
pub mod sources;

pub use error::{EngineError, Result};
