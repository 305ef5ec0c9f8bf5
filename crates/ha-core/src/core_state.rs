//! Lifecycle state of the running instance

use serde::{Deserialize, Serialize};

/// Where the instance is in its own startup/shutdown sequence.
///
/// Setup retries are only scheduled on the wall clock once the instance is
/// `Running`; before that they wait for the started signal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreState {
    #[default]
    NotRunning,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl CoreState {
    pub fn is_running(self) -> bool {
        self == CoreState::Running
    }

    /// True once shutdown has begun
    pub fn is_stopping(self) -> bool {
        matches!(self, CoreState::Stopping | CoreState::Stopped)
    }
}

impl std::fmt::Display for CoreState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CoreState::NotRunning => "NOT_RUNNING",
            CoreState::Starting => "STARTING",
            CoreState::Running => "RUNNING",
            CoreState::Stopping => "STOPPING",
            CoreState::Stopped => "STOPPED",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stopping_states() {
        assert!(!CoreState::Running.is_stopping());
        assert!(CoreState::Stopping.is_stopping());
        assert!(CoreState::Stopped.is_stopping());
        assert!(CoreState::Running.is_running());
        assert!(!CoreState::Starting.is_running());
    }

    #[test]
    fn test_serde_snake_case() {
        let json = serde_json::to_string(&CoreState::NotRunning).unwrap();
        assert_eq!(json, "\"not_running\"");
    }
}
