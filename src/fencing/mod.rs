//! Fencing Module
//!
//! The fence agent seam, the administrator override channel, and the
//! master's fencing run.

mod agent;
mod manual;
pub mod runner;

pub use agent::{FenceAgent, FenceError, FenceLogEntry, FenceOutcome};
pub use manual::{override_name, FifoOverride, ManualOverride};
pub use runner::{FencingContext, FencingEvent, FencingRun, FencingSettings};
