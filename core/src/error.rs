use crate::key::StateKey;
use thiserror::Error;

/// Structural problems detected while declaring or materializing a tree.
///
/// Duplicate registration is reported eagerly at declaration time; every
/// other variant is reported by `materialize`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TreeDefinitionError {
    #[error("state '{key}' is already defined")]
    DuplicateState { key: StateKey },

    #[error("state '{key}' has children but no initial child")]
    MissingInitialChild { key: StateKey },

    #[error("initial child '{target}' of state '{key}' is not a defined state")]
    UnknownInitialChild { key: StateKey, target: StateKey },

    #[error("initial child '{target}' of state '{key}' has parent '{actual}', not '{key}'")]
    InitialChildParentMismatch {
        key: StateKey,
        target: StateKey,
        actual: StateKey,
    },

    #[error("initial child '{target}' of the implicit root must not declare a parent (found '{parent}')")]
    ImplicitRootInitialChildHasParent { target: StateKey, parent: StateKey },

    #[error("state '{key}' names undefined parent '{parent}'")]
    UnknownParent { key: StateKey, parent: StateKey },

    #[error("state '{key}' transitions to undefined state '{target}'")]
    UnknownTransitionTarget { key: StateKey, target: StateKey },

    #[error("parent chain of state '{key}' revisits '{offender}'")]
    ParentCycle { key: StateKey, offender: StateKey },

    #[error("final state '{parent}' cannot be the parent of '{key}'")]
    FinalAsParent { key: StateKey, parent: StateKey },

    #[error("machine state '{key}' has no on_machine_done handler")]
    MissingMachineDoneHandler { key: StateKey },
}

/// A failure raised by a handler while the tree is executing.
///
/// Faults are surfaced to the executor as asynchronous errors and are never
/// recovered inside the declarative layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerFault {
    message: String,
}

impl HandlerFault {
    pub fn new(message: impl Into<String>) -> Self {
        HandlerFault {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub(crate) fn wrong_message_type(expected: &str) -> Self {
        HandlerFault::new(format!("message is not a '{expected}'"))
    }

    pub(crate) fn missing_payload(expected: &str) -> Self {
        HandlerFault::new(format!("entry payload of type '{expected}' was not supplied"))
    }

    pub(crate) fn missing_data(key: &StateKey, expected: &str) -> Self {
        HandlerFault::new(format!("state '{key}' holds no data of type '{expected}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_render_their_keys() {
        let err = TreeDefinitionError::UnknownParent {
            key: StateKey::new("child"),
            parent: StateKey::new("ghost"),
        };
        assert_eq!(err.to_string(), "state 'child' names undefined parent 'ghost'");
    }

    #[test]
    fn faults_carry_a_message() {
        let fault = HandlerFault::missing_payload("Ticket");
        assert!(fault.message().contains("Ticket"));
    }
}
