/// Session lifecycle states
///
/// A session is Pending until admitted, Running while its fetcher works, and
/// ends Completed, Failed, or Cancelled. Sessions found unfinished in the
/// checkpoint store at startup come back as Recovering.
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    // ===== Active States =====
    Pending,
    Initializing,
    Running,

    // ===== Terminal States =====
    Completed,
    Failed,
    Cancelled,

    // ===== Special States =====
    /// Reloaded from a checkpoint left by an interrupted run
    Recovering,
}

impl SessionStatus {
    /// Returns true if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true if an interrupted run would have left this session unfinished
    ///
    /// These are the states reloaded as Recovering on startup.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Pending | Self::Initializing | Self::Running)
    }

    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Recovering => "recovering",
        }
    }

    /// Returns None if the string doesn't match any known state.
    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "initializing" => Some(Self::Initializing),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "recovering" => Some(Self::Recovering),
            _ => None,
        }
    }

    /// Returns all possible session states
    pub fn all_states() -> Vec<Self> {
        vec![
            Self::Pending,
            Self::Initializing,
            Self::Running,
            Self::Completed,
            Self::Failed,
            Self::Cancelled,
            Self::Recovering,
        ]
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}
