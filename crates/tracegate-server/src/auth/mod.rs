//! Authentication and authorization for the control surface.

pub mod tokens;

pub use tokens::{hash_token, TokenDirectory};

use crate::config::PrincipalSection;
use tracegate_core::{Identity, PrincipalGrant, StaticAccessPolicy};

/// Build the token directory and access policy from configured principals.
pub fn from_principals(principals: &[PrincipalSection]) -> (TokenDirectory, StaticAccessPolicy) {
    let mut tokens = TokenDirectory::new();
    let mut grants = Vec::with_capacity(principals.len());
    for p in principals {
        let identity = Identity::new(p.name.clone());
        tokens.insert(&p.token_sha256, identity.clone());
        grants.push(PrincipalGrant {
            principal: identity,
            actions: p.actions.clone(),
            admin: p.admin,
            max_sessions: p.max_sessions,
        });
    }
    (tokens, StaticAccessPolicy::new(grants))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracegate_core::{AccessPolicy, Action, Decision};

    #[test]
    fn principals_become_grants() {
        let principals = vec![
            PrincipalSection {
                name: "ops".into(),
                token_sha256: hash_token("ops-token"),
                admin: true,
                actions: Action::ALL.to_vec(),
                max_sessions: None,
            },
            PrincipalSection {
                name: "viewer".into(),
                token_sha256: hash_token("viewer-token"),
                admin: false,
                actions: vec![Action::View],
                max_sessions: Some(1),
            },
        ];
        let (tokens, policy) = from_principals(&principals);

        let ops = tokens.resolve("ops-token").unwrap().clone();
        let viewer = tokens.resolve("viewer-token").unwrap().clone();
        assert_eq!(
            policy.authorize(&ops, Action::Stop, Some(&viewer)),
            Decision::Allow
        );
        assert_eq!(policy.authorize(&viewer, Action::Start, None), Decision::Deny);
        assert_eq!(policy.session_cap(&viewer), Some(1));
    }
}
