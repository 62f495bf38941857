//! Access policy boundary.
//!
//! The controller asks an [`AccessPolicy`] before every operation. The
//! bundled [`StaticAccessPolicy`] is driven by per-principal grants: a
//! principal may act on its own sessions, admins on everyone's.

use crate::session::Identity;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Operations subject to authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Start,
    Stop,
    View,
    Emit,
}

impl Action {
    pub const ALL: [Action; 4] = [Action::Start, Action::Stop, Action::View, Action::Emit];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

pub trait AccessPolicy: Send + Sync {
    /// Decide whether `identity` may perform `action`, on a session owned by
    /// `owner` when one is involved.
    fn authorize(&self, identity: &Identity, action: Action, owner: Option<&Identity>) -> Decision;

    /// Optional per-requester ceiling on concurrent sessions.
    fn session_cap(&self, _identity: &Identity) -> Option<usize> {
        None
    }
}

/// What one principal is allowed to do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrincipalGrant {
    pub principal: Identity,
    pub actions: Vec<Action>,
    /// Admins may act on sessions they do not own.
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub max_sessions: Option<usize>,
}

impl PrincipalGrant {
    /// Every action, on own sessions only.
    pub fn full_access(principal: impl Into<String>) -> Self {
        Self {
            principal: Identity::new(principal),
            actions: Action::ALL.to_vec(),
            admin: false,
            max_sessions: None,
        }
    }

    /// Every action, on any session.
    pub fn admin(principal: impl Into<String>) -> Self {
        Self {
            admin: true,
            ..Self::full_access(principal)
        }
    }

    /// Restrict the grant to `actions`.
    pub fn with_actions(mut self, actions: &[Action]) -> Self {
        self.actions = actions.to_vec();
        self
    }

    /// Cap this principal's concurrent sessions.
    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = Some(max);
        self
    }

    /// Whether the grant includes `action`.
    pub fn has_action(&self, action: Action) -> bool {
        self.actions.contains(&action)
    }
}

/// Grant-table policy. Unknown principals are denied everything.
#[derive(Debug, Clone, Default)]
pub struct StaticAccessPolicy {
    grants: HashMap<Identity, PrincipalGrant>,
}

impl StaticAccessPolicy {
    /// Build a policy from `grants`; later grants for the same principal win.
    pub fn new(grants: impl IntoIterator<Item = PrincipalGrant>) -> Self {
        Self {
            grants: grants
                .into_iter()
                .map(|g| (g.principal.clone(), g))
                .collect(),
        }
    }

    /// The grant for `identity`, if any.
    pub fn grant(&self, identity: &Identity) -> Option<&PrincipalGrant> {
        self.grants.get(identity)
    }
}

impl AccessPolicy for StaticAccessPolicy {
    fn authorize(&self, identity: &Identity, action: Action, owner: Option<&Identity>) -> Decision {
        let Some(grant) = self.grants.get(identity) else {
            return Decision::Deny;
        };
        if !grant.has_action(action) {
            return Decision::Deny;
        }
        match owner {
            Some(owner) if owner != identity && !grant.admin => Decision::Deny,
            _ => Decision::Allow,
        }
    }

    fn session_cap(&self, identity: &Identity) -> Option<usize> {
        self.grants.get(identity).and_then(|g| g.max_sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> StaticAccessPolicy {
        StaticAccessPolicy::new(vec![
            PrincipalGrant::full_access("alice").with_max_sessions(1),
            PrincipalGrant::full_access("viewer").with_actions(&[Action::View]),
            PrincipalGrant::admin("ops"),
        ])
    }

    #[test]
    fn owners_act_on_their_sessions() {
        let p = policy();
        let alice = Identity::new("alice");
        assert_eq!(p.authorize(&alice, Action::Start, None), Decision::Allow);
        assert_eq!(p.authorize(&alice, Action::Stop, Some(&alice)), Decision::Allow);
        assert_eq!(
            p.authorize(&alice, Action::Stop, Some(&Identity::new("bob"))),
            Decision::Deny
        );
    }

    #[test]
    fn admins_act_on_anyone() {
        let p = policy();
        let ops = Identity::new("ops");
        assert_eq!(
            p.authorize(&ops, Action::Stop, Some(&Identity::new("alice"))),
            Decision::Allow
        );
    }

    #[test]
    fn actions_are_scoped() {
        let p = policy();
        let viewer = Identity::new("viewer");
        assert_eq!(p.authorize(&viewer, Action::Start, None), Decision::Deny);
        assert_eq!(p.authorize(&viewer, Action::View, Some(&viewer)), Decision::Allow);
    }

    #[test]
    fn unknown_principal_denied() {
        let p = policy();
        assert_eq!(
            p.authorize(&Identity::new("mallory"), Action::View, None),
            Decision::Deny
        );
    }

    #[test]
    fn session_cap_from_grant() {
        let p = policy();
        assert_eq!(p.session_cap(&Identity::new("alice")), Some(1));
        assert_eq!(p.session_cap(&Identity::new("ops")), None);
    }
}
