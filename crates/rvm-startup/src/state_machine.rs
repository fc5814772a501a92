use crate::error::StateMachineError;
use rvm_core::StepStatus;

/// Validates a step status transition.
///
/// Terminal states have no outgoing transitions. With the `strict-debug`
/// feature an illegal transition panics instead of returning an error.
pub fn validate_transition(from: StepStatus, to: StepStatus) -> Result<(), StateMachineError> {
    if allowed(from, to) {
        Ok(())
    } else {
        #[cfg(feature = "strict-debug")]
        panic!("Illegal step transition attempted: {from:?} -> {to:?}");

        #[cfg(not(feature = "strict-debug"))]
        Err(StateMachineError::IllegalTransition { from, to })
    }
}

pub fn allowed_transitions(from: StepStatus) -> Vec<StepStatus> {
    use StepStatus::*;
    match from {
        // Failed straight from Pending: a dependency was not met.
        Pending => vec![Running, Skipped, Failed],
        Running => vec![Completed, Failed, Timeout, Error],
        Completed | Failed | Timeout | Skipped | Error => vec![],
    }
}

fn allowed(from: StepStatus, to: StepStatus) -> bool {
    allowed_transitions(from).into_iter().any(|s| s == to)
}
