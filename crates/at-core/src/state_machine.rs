//! Job status transitions
//!
//! `running` may settle into any other state. `awaiting_review` is the one
//! settled state that can still move, and only on an external decision.
//! Everything else is final.

use crate::error::StoreError;
use crate::types::JobStatus;

/// Statuses reachable from `from` in one step
#[must_use]
pub fn allowed_transitions(from: JobStatus) -> &'static [JobStatus] {
    use JobStatus::{AwaitingReview, Completed, Failed, Running, Stopped};
    match from {
        Running => &[Completed, Failed, Stopped, AwaitingReview],
        AwaitingReview => &[Completed, Failed],
        Completed | Failed | Stopped => &[],
    }
}

/// Reject any step not in the transition table
pub fn validate_transition(from: JobStatus, to: JobStatus) -> Result<(), StoreError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn any_status() -> impl Strategy<Value = JobStatus> {
        prop_oneof![
            Just(JobStatus::Running),
            Just(JobStatus::Completed),
            Just(JobStatus::Failed),
            Just(JobStatus::Stopped),
            Just(JobStatus::AwaitingReview),
        ]
    }

    #[test]
    fn running_settles_anywhere() {
        for to in [
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Stopped,
            JobStatus::AwaitingReview,
        ] {
            assert!(validate_transition(JobStatus::Running, to).is_ok());
        }
    }

    #[test]
    fn review_resolves_only_to_completed_or_failed() {
        assert!(validate_transition(JobStatus::AwaitingReview, JobStatus::Completed).is_ok());
        assert!(validate_transition(JobStatus::AwaitingReview, JobStatus::Failed).is_ok());
        assert!(validate_transition(JobStatus::AwaitingReview, JobStatus::Stopped).is_err());
        assert!(validate_transition(JobStatus::AwaitingReview, JobStatus::Running).is_err());
    }

    proptest! {
        #[test]
        fn final_states_never_move(from in any_status(), to in any_status()) {
            if from.is_final() {
                prop_assert!(validate_transition(from, to).is_err());
            }
        }

        #[test]
        fn nothing_returns_to_running(from in any_status()) {
            prop_assert!(validate_transition(from, JobStatus::Running).is_err());
        }

        #[test]
        fn allowed_targets_are_settled(from in any_status()) {
            for to in allowed_transitions(from) {
                prop_assert!(to.is_settled());
            }
        }
    }
}
