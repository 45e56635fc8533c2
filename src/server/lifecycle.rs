//! Component lifecycle states

use std::fmt;

use serde::Serialize;

/// Lifecycle of a server component
///
/// ```text
/// INSTANTIATED ──► STARTING ──► RUNNING ──► STOPPING ──► TERMINATED
///                     │                        ▲
///                     └────── start failed ────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComponentStatus {
    Instantiated,
    Starting,
    Running,
    Stopping,
    Terminated,
}

impl ComponentStatus {
    pub fn is_running(self) -> bool {
        self == ComponentStatus::Running
    }

    /// Whether `start` may be called from this state
    pub fn can_start(self) -> bool {
        matches!(self, ComponentStatus::Instantiated | ComponentStatus::Terminated)
    }

    /// STOPPING or TERMINATED
    pub fn is_stopped(self) -> bool {
        matches!(self, ComponentStatus::Stopping | ComponentStatus::Terminated)
    }
}

impl fmt::Display for ComponentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ComponentStatus::Instantiated => "INSTANTIATED",
            ComponentStatus::Starting => "STARTING",
            ComponentStatus::Running => "RUNNING",
            ComponentStatus::Stopping => "STOPPING",
            ComponentStatus::Terminated => "TERMINATED",
        };
        f.write_str(name)
    }
}
