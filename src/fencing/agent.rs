//! Fence Agent Interface

use std::fmt;

use serde::{Deserialize, Serialize};

/// Result of one fencing device invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FenceError {
    Success,
    AgentError,
    Fork,
    NoConfig,
    NoMethod,
    NoDevice,
    ReadAgent,
    ReadArgs,
    ReadMethod,
    ReadDevice,
}

impl FenceError {
    pub fn is_success(&self) -> bool {
        matches!(self, FenceError::Success)
    }
}

impl fmt::Display for FenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FenceError::Success => "success",
            FenceError::AgentError => "error from agent",
            FenceError::Fork => "error from fork",
            FenceError::NoConfig => "error from config",
            FenceError::NoMethod => "error no method",
            FenceError::NoDevice => "error no device",
            FenceError::ReadAgent => "error config agent",
            FenceError::ReadArgs => "error config args",
            FenceError::ReadMethod => "error config method",
            FenceError::ReadDevice => "error config device",
        };
        write!(f, "{}", s)
    }
}

/// One device attempt within a fencing run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FenceLogEntry {
    pub method: u32,
    pub device: u32,
    /// Empty when no agent was configured
    pub agent: String,
    pub error: FenceError,
}

/// What a fencing attempt produced
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FenceOutcome {
    pub success: bool,
    pub log: Vec<FenceLogEntry>,
}

impl FenceOutcome {
    pub fn success() -> Self {
        Self {
            success: true,
            log: Vec::new(),
        }
    }

    pub fn failed(log: Vec<FenceLogEntry>) -> Self {
        Self {
            success: false,
            log,
        }
    }
}

/// Runs the configured fencing methods for a node.
///
/// Calls block until every method has been tried; the runner calls this
/// from a blocking worker.
pub trait FenceAgent: Send + Sync {
    fn fence(&self, victim: &str) -> FenceOutcome;
}
