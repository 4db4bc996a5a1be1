use std::fmt;

use uuid::Uuid;

use crate::error::SignalingError;
use crate::signal::SessionDescription;

/// Which side of the two-party negotiation this participant plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Role {
    #[default]
    Undetermined,
    Caller,
    Receiver,
}

impl Role {
    pub fn is_caller(self) -> bool {
        matches!(self, Role::Caller)
    }

    pub fn is_resolved(self) -> bool {
        !matches!(self, Role::Undetermined)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Undetermined => "undetermined",
            Role::Caller => "caller",
            Role::Receiver => "receiver",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of one signaling coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CoordinatorState {
    #[default]
    Idle,
    RoleResolving,
    Negotiating,
    CandidateExchange,
    Connected,
    Closed,
    Failed,
}

impl CoordinatorState {
    pub fn can_transition_to(self, next: CoordinatorState) -> bool {
        use CoordinatorState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Failed, _) => false,
            (_, Failed) => true,
            (Idle, RoleResolving) => true,
            (RoleResolving, Negotiating) => true,
            (Negotiating, CandidateExchange) => true,
            (Negotiating, Connected) => true,
            (CandidateExchange, Connected) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CoordinatorState::Closed | CoordinatorState::Failed)
    }
}

/// One negotiation attempt. Mutated only under the coordinator's
/// negotiation lock.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    role: Role,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    state: CoordinatorState,
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            role: Role::Undetermined,
            local_description: None,
            remote_description: None,
            state: CoordinatorState::Idle,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Roles are write-once.
    pub fn assign_role(&mut self, role: Role) -> Result<(), SignalingError> {
        if !role.is_resolved() {
            return Err(SignalingError::RoleUnresolved);
        }
        if self.role.is_resolved() {
            return Err(SignalingError::RoleAlreadyAssigned);
        }
        self.role = role;
        Ok(())
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_description.is_some()
    }

    pub(crate) fn commit_local(&mut self, description: SessionDescription) {
        self.local_description = Some(description);
    }

    pub(crate) fn commit_remote(&mut self, description: SessionDescription) {
        self.remote_description = Some(description);
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == CoordinatorState::Closed
    }

    /// Returns `false` (and leaves the state alone) for transitions the
    /// state machine does not allow.
    pub(crate) fn transition(&mut self, next: CoordinatorState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        tracing::debug!(
            target = "pollrtc::session",
            session_id = %self.id,
            from = ?self.state,
            to = ?next,
            "state transition"
        );
        self.state = next;
        true
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_is_assigned_once() {
        let mut session = Session::new();
        assert_eq!(session.role(), Role::Undetermined);
        session.assign_role(Role::Receiver).expect("first assignment");
        assert_eq!(
            session.assign_role(Role::Caller),
            Err(SignalingError::RoleAlreadyAssigned)
        );
        assert_eq!(session.role(), Role::Receiver);
    }

    #[test]
    fn undetermined_is_not_an_assignment() {
        let mut session = Session::new();
        assert_eq!(
            session.assign_role(Role::Undetermined),
            Err(SignalingError::RoleUnresolved)
        );
        session.assign_role(Role::Caller).expect("caller");
    }

    #[test]
    fn happy_path_transitions() {
        use CoordinatorState::*;
        let mut session = Session::new();
        for next in [RoleResolving, Negotiating, CandidateExchange, Connected, Closed] {
            assert!(session.transition(next), "transition to {next:?}");
        }
        assert!(!session.transition(Failed));
        assert!(!session.transition(Idle));
        assert_eq!(session.state(), Closed);
    }

    #[test]
    fn failed_only_leads_to_closed() {
        use CoordinatorState::*;
        let mut session = Session::new();
        assert!(session.transition(RoleResolving));
        assert!(session.transition(Failed));
        assert!(!session.transition(Negotiating));
        assert!(!session.transition(Failed));
        assert!(session.transition(Closed));
        assert!(!session.transition(Closed));
    }

    #[test]
    fn skipping_states_is_rejected() {
        let mut session = Session::new();
        assert!(!session.transition(CoordinatorState::Negotiating));
        assert!(!session.transition(CoordinatorState::Connected));
        assert_eq!(session.state(), CoordinatorState::Idle);
    }
}
