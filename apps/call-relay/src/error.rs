use thiserror::Error;

use crate::calls::CallError;
use crate::protocol::UserId;

/// Failures the router reports back to the sender as `call-error`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("register before sending signaling messages")]
    NotRegistered,
    #[error("`from` must match the registered user {registered}")]
    IdentityMismatch { registered: UserId },
    #[error("user id must not be empty")]
    InvalidIdentifier,
    #[error("cannot call yourself")]
    SelfCall,
    #[error("user {0} is not online")]
    TargetUnresolved(UserId),
    #[error("invalid call state: {0}")]
    InvalidTransition(String),
    #[error("a call with {0} is already in progress")]
    CallInProgress(UserId),
}

impl RelayError {
    /// Text delivered to the client in `call-error`.
    pub fn reason(&self) -> String {
        self.to_string()
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            RelayError::NotRegistered => "not_registered",
            RelayError::IdentityMismatch { .. } => "identity_mismatch",
            RelayError::InvalidIdentifier => "invalid_identifier",
            RelayError::SelfCall => "self_call",
            RelayError::TargetUnresolved(_) => "target_unresolved",
            RelayError::InvalidTransition(_) => "invalid_transition",
            RelayError::CallInProgress(_) => "call_in_progress",
        }
    }

    pub(crate) fn from_call(err: CallError, peer: &UserId) -> Self {
        match err {
            CallError::Conflict => RelayError::CallInProgress(peer.clone()),
            other => RelayError::InvalidTransition(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::{CallEvent, CallState};

    #[test_timeout::timeout]
    fn call_errors_map_onto_relay_taxonomy() {
        let bob = UserId::new("bob");
        assert_eq!(
            RelayError::from_call(CallError::Conflict, &bob),
            RelayError::CallInProgress(bob.clone())
        );
        let err = RelayError::from_call(
            CallError::InvalidTransition {
                state: CallState::Active,
                event: CallEvent::Answer,
            },
            &bob,
        );
        assert_eq!(err.metric_label(), "invalid_transition");
        assert_eq!(
            err.reason(),
            "invalid call state: answer is not allowed while the call is active"
        );
    }

    #[test_timeout::timeout]
    fn unresolved_target_names_the_user() {
        let err = RelayError::TargetUnresolved(UserId::new("bob"));
        assert_eq!(err.reason(), "user bob is not online");
    }
}
