//! Node scheduling
//!
//! Maps a node identity to the endpoint of its running node process,
//! starting the process on demand. Concurrent schedule calls for one
//! identity collapse into a single launch.

pub mod launcher;
pub mod registry;
pub mod service;

pub use launcher::{LaunchedNode, NodeLauncher, ProcessLauncher, ProcessLauncherConfig};
pub use registry::{AssignmentRegistry, ScheduleAssignment};
pub use service::{Scheduler, SchedulerConfig, SchedulerStats};
