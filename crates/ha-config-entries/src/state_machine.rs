//! Config Entry State Machine
//!
//! Enforces valid state transitions for the ConfigEntry lifecycle:
//!
//! ```text
//! NotLoaded → SetupInProgress → Loaded ─────→ NotLoaded
//!                            ↘ SetupError ──→ NotLoaded
//!                            ↘ SetupRetry ──→ SetupInProgress (scheduled retry)
//!                            ↘ MigrationError
//!
//! Loaded/SetupError/SetupRetry → FailedUnload
//! ```
//!
//! MigrationError and FailedUnload are only left by removing the entry.

use crate::entry::ConfigEntryState;
use rand::Rng;
use std::time::Duration;
use thiserror::Error;

/// Error when an invalid state transition is attempted
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Invalid state transition from {from:?} to {to:?}: {reason}")]
pub struct InvalidTransition {
    pub from: ConfigEntryState,
    pub to: ConfigEntryState,
    pub reason: &'static str,
}

impl ConfigEntryState {
    /// Attempt a transition to a new state.
    ///
    /// Returns the new state if valid, or an error describing why the transition
    /// is invalid.
    pub fn try_transition(
        self,
        to: ConfigEntryState,
    ) -> Result<ConfigEntryState, InvalidTransition> {
        use ConfigEntryState::*;

        let valid = match (self, to) {
            (NotLoaded, SetupInProgress) => true,

            (SetupInProgress, Loaded)
            | (SetupInProgress, SetupError)
            | (SetupInProgress, SetupRetry)
            | (SetupInProgress, MigrationError) => true,

            // Scheduled retry, or unload while waiting
            (SetupRetry, SetupInProgress) | (SetupRetry, NotLoaded) | (SetupRetry, FailedUnload) => {
                true
            }

            (SetupError, NotLoaded) | (SetupError, FailedUnload) => true,

            (Loaded, NotLoaded) | (Loaded, FailedUnload) => true,

            _ => false,
        };

        if valid {
            Ok(to)
        } else {
            Err(InvalidTransition {
                from: self,
                to,
                reason: Self::transition_error_reason(self, to),
            })
        }
    }

    /// Check if a transition is valid without performing it
    pub fn can_transition_to(self, to: ConfigEntryState) -> bool {
        self.try_transition(to).is_ok()
    }

    fn transition_error_reason(from: ConfigEntryState, to: ConfigEntryState) -> &'static str {
        use ConfigEntryState::*;

        match (from, to) {
            (MigrationError, _) => "MigrationError is terminal, remove the entry to recover",
            (FailedUnload, _) => "FailedUnload is terminal, remove the entry to recover",
            (SetupInProgress, NotLoaded) => {
                "Setup in progress, must complete before returning to NotLoaded"
            }
            (NotLoaded, Loaded) => "Cannot jump to Loaded, must go through SetupInProgress",
            (NotLoaded, SetupError) => "Cannot jump to SetupError, must go through SetupInProgress",
            (Loaded, SetupInProgress) => "Already loaded, unload first before re-setup",
            (SetupError, SetupInProgress) => "Unload the failed entry before setting it up again",
            _ => "Invalid state transition",
        }
    }

    /// Whether the not-ready retry counter survives entering this state
    pub(crate) fn keeps_tries(self) -> bool {
        matches!(
            self,
            ConfigEntryState::SetupRetry | ConfigEntryState::SetupInProgress
        )
    }
}

/// Delay before the next not-ready setup attempt.
///
/// `base * 2^min(tries, max_exponent)` plus up to one millisecond of jitter,
/// so with the defaults: 5s, 10s, 20s, 40s, 80s, then 80s forever.
pub fn retry_delay(tries: u32, base_secs: f64, max_exponent: u32) -> Duration {
    let factor = 2_u32.saturating_pow(tries.min(max_exponent));
    let base = Duration::from_secs_f64(base_secs * factor as f64);
    let jitter = Duration::from_micros(rand::thread_rng().gen_range(0..=1000));
    base + jitter
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConfigEntryState::*;

    // ==================== Valid Transitions ====================

    #[test]
    fn test_not_loaded_to_setup_in_progress() {
        assert!(NotLoaded.can_transition_to(SetupInProgress));
        assert_eq!(
            NotLoaded.try_transition(SetupInProgress),
            Ok(SetupInProgress)
        );
    }

    #[test]
    fn test_setup_outcomes() {
        assert!(SetupInProgress.can_transition_to(Loaded));
        assert!(SetupInProgress.can_transition_to(SetupError));
        assert!(SetupInProgress.can_transition_to(SetupRetry));
        assert!(SetupInProgress.can_transition_to(MigrationError));
    }

    #[test]
    fn test_setup_retry_exits() {
        assert!(SetupRetry.can_transition_to(SetupInProgress));
        assert!(SetupRetry.can_transition_to(NotLoaded));
        assert!(SetupRetry.can_transition_to(FailedUnload));
    }

    #[test]
    fn test_unload_paths() {
        assert!(Loaded.can_transition_to(NotLoaded));
        assert!(Loaded.can_transition_to(FailedUnload));
        assert!(SetupError.can_transition_to(NotLoaded));
        assert!(SetupError.can_transition_to(FailedUnload));
    }

    // ==================== Invalid Transitions ====================

    #[test]
    fn test_not_loaded_cannot_jump_to_loaded() {
        let err = NotLoaded.try_transition(Loaded).unwrap_err();
        assert_eq!(err.from, NotLoaded);
        assert_eq!(err.to, Loaded);
    }

    #[test]
    fn test_loaded_cannot_go_to_setup_in_progress() {
        assert!(!Loaded.can_transition_to(SetupInProgress));
    }

    #[test]
    fn test_setup_in_progress_cannot_go_to_not_loaded() {
        assert!(!SetupInProgress.can_transition_to(NotLoaded));
    }

    #[test]
    fn test_setup_error_requires_unload_before_setup() {
        assert!(!SetupError.can_transition_to(SetupInProgress));
    }

    // ==================== Terminal States ====================

    #[test]
    fn test_terminal_states() {
        for to in [
            NotLoaded,
            SetupInProgress,
            Loaded,
            SetupError,
            SetupRetry,
            MigrationError,
            FailedUnload,
        ] {
            assert!(!MigrationError.can_transition_to(to));
            assert!(!FailedUnload.can_transition_to(to));
        }

        let err = MigrationError.try_transition(NotLoaded).unwrap_err();
        assert!(err.reason.contains("terminal"));
    }

    #[test]
    fn test_error_display() {
        let err = InvalidTransition {
            from: NotLoaded,
            to: Loaded,
            reason: "test reason",
        };
        let msg = format!("{}", err);
        assert!(msg.contains("NotLoaded"));
        assert!(msg.contains("Loaded"));
        assert!(msg.contains("test reason"));
    }

    #[test]
    fn test_tries_survive_only_retry_cycle() {
        assert!(SetupRetry.keeps_tries());
        assert!(SetupInProgress.keeps_tries());
        assert!(!Loaded.keeps_tries());
        assert!(!NotLoaded.keeps_tries());
        assert!(!SetupError.keeps_tries());
    }

    // ==================== Retry Delay ====================

    #[test]
    fn test_retry_delay_exponential_backoff() {
        let expected = [5, 10, 20, 40, 80, 80, 80];
        for (tries, secs) in expected.into_iter().enumerate() {
            let delay = retry_delay(tries as u32, 5.0, 4);
            let base = Duration::from_secs(secs);
            assert!(delay >= base, "tries={tries} delay={delay:?}");
            assert!(delay <= base + Duration::from_millis(1), "tries={tries} delay={delay:?}");
        }
    }

    #[test]
    fn test_retry_delay_respects_settings() {
        let delay = retry_delay(10, 0.5, 2);
        assert!(delay >= Duration::from_secs(2));
        assert!(delay <= Duration::from_millis(2001));
    }

    // ==================== Complete State Graph Coverage ====================

    #[test]
    fn test_full_setup_success_path() {
        let state = NotLoaded;
        let state = state.try_transition(SetupInProgress).unwrap();
        let state = state.try_transition(Loaded).unwrap();
        let state = state.try_transition(NotLoaded).unwrap();
        assert_eq!(state, NotLoaded);
    }

    #[test]
    fn test_setup_retry_path() {
        let state = NotLoaded;
        let state = state.try_transition(SetupInProgress).unwrap();
        let state = state.try_transition(SetupRetry).unwrap();
        let state = state.try_transition(SetupInProgress).unwrap();
        let state = state.try_transition(Loaded).unwrap();
        assert_eq!(state, Loaded);
    }

    #[test]
    fn test_failed_unload_path() {
        let state = NotLoaded;
        let state = state.try_transition(SetupInProgress).unwrap();
        let state = state.try_transition(Loaded).unwrap();
        let state = state.try_transition(FailedUnload).unwrap();
        assert_eq!(state, FailedUnload);
        assert!(state.try_transition(NotLoaded).is_err());
    }
}
