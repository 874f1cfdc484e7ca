//! Invites: agents whose secret admits new members to a group.
//!
//! An admin creates a fresh agent, gives it an invite role and reveals the
//! current read key to it. Whoever holds the invite secret can then write to
//! the group as that agent, adding an account with the invite's role and
//! revealing the read key to it.

use serde_json::{json, Value};

use covalent_core::{AgentSecret, CoId, MapChange, Member};

use crate::error::{PermsError, Result};
use crate::keys::KeyResolver;
use crate::role::Role;

/// Changes creating an invite for `role`, with the new invite secret.
///
/// Must be resolved as an admin of the group.
pub fn create_invite(keys: &KeyResolver<'_, '_>, group: &CoId, role: Role) -> Result<(AgentSecret, Vec<Value>)> {
    let invite_role = role
        .as_invite()
        .ok_or_else(|| PermsError::InvalidRole(format!("no invite for {}", role)))?;
    let me = keys.identity().author();
    if keys.perms().current_role(group, me) != Some(Role::Admin) {
        return Err(PermsError::InsufficientPermission(format!(
            "{} is not an admin of {}",
            me, group
        )));
    }

    let secret = keys.crypto().new_agent_secret();
    let invite = Member::Agent(keys.crypto().agent_id(&secret));
    let mut changes = vec![MapChange::set(invite.to_string(), json!(invite_role.as_str()))];
    match keys.reveal_to(group, &invite) {
        Ok(reveal) => changes.extend(reveal),
        Err(PermsError::NoReadKey(_)) => {}
        Err(e) => return Err(e),
    }
    Ok((secret, changes))
}

/// Changes an invite agent writes to admit `account`.
///
/// Must be resolved with the invite agent's identity.
pub fn accept_invite(keys: &KeyResolver<'_, '_>, group: &CoId, account: &CoId) -> Result<(Role, Vec<Value>)> {
    let invite = Member::Agent(keys.identity().agent);
    let state = keys.perms().group(group)?;
    let role = state
        .role_of(&invite)
        .and_then(Role::invite_grant)
        .ok_or_else(|| PermsError::InsufficientPermission("invite is not valid".into()))?;

    let member = Member::Account(*account);
    let mut changes = vec![MapChange::set(member.to_string(), json!(role.as_str()))];
    match keys.reveal_to(group, &member) {
        Ok(reveal) => changes.extend(reveal),
        Err(PermsError::NoReadKey(_)) => {}
        Err(e) => return Err(e),
    }
    Ok((role, changes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::Identity;
    use crate::resolver::PermissionResolver;
    use covalent_core::{
        CoValueHeader, CryptoProvider, NativeCrypto, SessionId, Transaction, VerifiedState,
    };
    use std::collections::BTreeMap;

    fn write(
        states: &mut BTreeMap<CoId, VerifiedState>,
        crypto: &NativeCrypto,
        id: CoId,
        author: covalent_core::AccountOrAgent,
        secret: &AgentSecret,
        at: i64,
        changes: Vec<Value>,
    ) {
        let session = SessionId {
            author,
            suffix: [0; 8],
        };
        states
            .get_mut(&id)
            .unwrap()
            .add_local_transactions(crypto, session, secret, vec![Transaction::trusting(at, changes)])
            .unwrap();
    }

    #[test]
    fn test_invite_flow_admits_account_with_key() {
        let crypto = NativeCrypto;
        let mut states = BTreeMap::new();

        // Joining account: agent-authored account group.
        let bob_secret = crypto.new_agent_secret();
        let bob_agent = crypto.agent_id(&bob_secret);
        let bob_header = CoValueHeader::account(bob_agent.into(), 0);
        let bob = bob_header.id().unwrap();
        states.insert(bob, VerifiedState::new(bob, bob_header).unwrap());
        write(
            &mut states,
            &crypto,
            bob,
            bob_agent.into(),
            &bob_secret,
            1,
            vec![MapChange::set(bob_agent.to_string(), json!("admin"))],
        );

        // Group with a read key.
        let admin = crypto.new_agent_secret();
        let admin_me = Identity::agent(&crypto, admin.clone());
        let header = CoValueHeader::group(admin_me.agent.into(), 0);
        let group = header.id().unwrap();
        states.insert(group, VerifiedState::new(group, header).unwrap());
        let rotation = {
            let perms = PermissionResolver::new(&states);
            KeyResolver::new(&perms, &crypto, &admin_me)
                .rotate(&group, &[])
                .unwrap()
                .2
        };
        write(&mut states, &crypto, group, admin_me.agent.into(), &admin, 2, rotation);

        let (invite_secret, changes) = {
            let perms = PermissionResolver::new(&states);
            create_invite(&KeyResolver::new(&perms, &crypto, &admin_me), &group, Role::Writer).unwrap()
        };
        write(&mut states, &crypto, group, admin_me.agent.into(), &admin, 3, changes);

        let invite_me = Identity::agent(&crypto, invite_secret.clone());
        let (role, changes) = {
            let perms = PermissionResolver::new(&states);
            accept_invite(&KeyResolver::new(&perms, &crypto, &invite_me), &group, &bob).unwrap()
        };
        assert_eq!(role, Role::Writer);
        write(&mut states, &crypto, group, invite_me.agent.into(), &invite_secret, 4, changes);

        let perms = PermissionResolver::new(&states);
        let group_state = perms.group(&group).unwrap();
        assert!(group_state.rejected().is_empty());
        assert_eq!(group_state.role_of(&Member::Account(bob)), Some(Role::Writer));

        let bob_me = Identity::account(&crypto, bob, bob_secret);
        assert!(KeyResolver::new(&perms, &crypto, &bob_me)
            .current_read_key(&group)
            .is_ok());
    }

    #[test]
    fn test_non_admin_cannot_create_invite() {
        let crypto = NativeCrypto;
        let mut states = BTreeMap::new();
        let admin = crypto.new_agent_secret();
        let header = CoValueHeader::group(crypto.agent_id(&admin).into(), 0);
        let group = header.id().unwrap();
        states.insert(group, VerifiedState::new(group, header).unwrap());

        let stranger = Identity::agent(&crypto, crypto.new_agent_secret());
        let perms = PermissionResolver::new(&states);
        assert!(matches!(
            create_invite(&KeyResolver::new(&perms, &crypto, &stranger), &group, Role::Reader),
            Err(PermsError::InsufficientPermission(_))
        ));
    }
}
