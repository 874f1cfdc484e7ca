//! Read keys: resolving key secrets and rotating them.
//!
//! A group's `readKey` names the key new private transactions are encrypted
//! with. Its secret reaches members through revelations stored in the group:
//!
//! - `<key>_for_<account or agent>`: sealed to that member's agent
//! - `<key>_for_everyone`: the secret in the clear
//! - `<key>_for_<other key>`: encrypted under another key, which may be an
//!   older or newer key of this group or a key of a parent group
//!
//! Rotation creates a fresh key, reveals it to every remaining member and
//! links the previous key to it, so members keep access to history.

use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};

use covalent_core::{CoId, CryptoProvider, Encrypted, KeyId, KeySecret, MapChange, Member, Sealed};

use crate::account::Identity;
use crate::error::{PermsError, Result};
use crate::group::{read_key_key, revelation_key};
use crate::resolver::PermissionResolver;
use crate::role::Role;

/// Associated data for sealing or encrypting `key` inside `group`.
pub fn revelation_context(group: &CoId, key: &KeyId) -> Vec<u8> {
    format!("{}/{}", group, key).into_bytes()
}

fn secret_from_bytes(bytes: Vec<u8>) -> Option<KeySecret> {
    <[u8; 32]>::try_from(bytes.as_slice()).ok().map(KeySecret)
}

/// Finds key secrets available to one identity.
pub struct KeyResolver<'r, 'a> {
    perms: &'r PermissionResolver<'a>,
    crypto: &'r dyn CryptoProvider,
    me: &'r Identity,
}

impl<'r, 'a> KeyResolver<'r, 'a> {
    pub fn new(
        perms: &'r PermissionResolver<'a>,
        crypto: &'r dyn CryptoProvider,
        me: &'r Identity,
    ) -> Self {
        Self { perms, crypto, me }
    }

    pub fn perms(&self) -> &'r PermissionResolver<'a> {
        self.perms
    }

    pub fn identity(&self) -> &'r Identity {
        self.me
    }

    pub fn crypto(&self) -> &'r dyn CryptoProvider {
        self.crypto
    }

    /// The group's current read key and its secret.
    pub fn current_read_key(&self, group: &CoId) -> Result<(KeyId, KeySecret)> {
        let key = self
            .perms
            .group(group)?
            .read_key()
            .ok_or(PermsError::NoReadKey(*group))?;
        Ok((key, self.key_secret(group, &key)?))
    }

    /// The secret of `key`, looked up in `group` and its parents.
    pub fn key_secret(&self, group: &CoId, key: &KeyId) -> Result<KeySecret> {
        let mut visited = BTreeSet::new();
        self.find(group, key, &mut visited)
            .ok_or(PermsError::MissingReadKey(*key))
    }

    fn find(
        &self,
        group: &CoId,
        key: &KeyId,
        visited: &mut BTreeSet<(CoId, KeyId)>,
    ) -> Option<KeySecret> {
        if !visited.insert((*group, *key)) {
            return None;
        }
        let state = self.perms.group(group).ok()?;
        let context = revelation_context(group, key);

        // Sealed to us directly.
        let mut targets = vec![Member::Agent(self.me.agent)];
        if let Some(account) = self.me.account {
            targets.insert(0, Member::Account(account));
        }
        for target in targets {
            let Some(sealed) = state.revelation(key, &target.to_string()) else {
                continue;
            };
            let opened = sealed
                .parse::<Sealed>()
                .and_then(|s| self.crypto.unseal(&self.me.secret, &s, &context));
            match opened {
                Ok(bytes) => {
                    if let Some(secret) = secret_from_bytes(bytes) {
                        return Some(secret);
                    }
                }
                Err(e) => tracing::debug!(%group, %key, error = %e, "cannot unseal revelation"),
            }
        }

        // Revealed to everyone.
        if let Some(plain) = state.revelation(key, &Member::Everyone.to_string()) {
            if let Ok(secret) = plain.parse::<KeySecret>() {
                return Some(secret);
            }
        }

        // Encrypted under another key of this group or a parent.
        let parents = state.parents();
        for other in state.keys_revealing(key) {
            let Some(encrypted) = state.revelation(key, &other.to_string()) else {
                continue;
            };
            let Ok(encrypted) = encrypted.parse::<Encrypted>() else {
                continue;
            };
            let other_secret = std::iter::once(group)
                .chain(parents.iter())
                .find_map(|g| self.find(g, &other, visited));
            if let Some(other_secret) = other_secret {
                if let Some(secret) = self
                    .crypto
                    .decrypt(&other_secret, &encrypted, &context)
                    .ok()
                    .and_then(secret_from_bytes)
                {
                    return Some(secret);
                }
            }
        }

        None
    }

    /// Changes revealing the group's current read key to one member.
    pub fn reveal_to(&self, group: &CoId, member: &Member) -> Result<Vec<Value>> {
        let (key, secret) = self.current_read_key(group)?;
        let change = match member {
            Member::Everyone => MapChange::set(
                revelation_key(&key, Member::Everyone),
                json!(secret.to_string()),
            ),
            _ => {
                let sealer = self.perms.sealer_for(member)?;
                let sealed = self.crypto.seal(
                    &self.me.secret,
                    &sealer,
                    &secret.0,
                    &revelation_context(group, &key),
                )?;
                MapChange::set(revelation_key(&key, member), json!(sealed.to_string()))
            }
        };
        Ok(vec![change])
    }

    /// Changes that rotate the group's read key.
    ///
    /// `overrides` are role changes made in the same transaction; they are
    /// applied on top of the current role table before choosing recipients.
    /// Returns the new key with the changes.
    pub fn rotate(
        &self,
        group: &CoId,
        overrides: &[(Member, Role)],
    ) -> Result<(KeyId, KeySecret, Vec<Value>)> {
        let state = self.perms.group(group)?;
        let mut members: BTreeMap<Member, Role> =
            state.members().map(|(m, r)| (*m, r)).collect();
        for (member, role) in overrides {
            members.insert(*member, *role);
        }

        let (new_key, new_secret) = self.crypto.new_key_secret();
        let new_context = revelation_context(group, &new_key);
        let mut changes = Vec::new();

        for (member, role) in &members {
            if !role.receives_keys() {
                continue;
            }
            if *member == Member::Everyone {
                if role.can_read() {
                    changes.push(MapChange::set(
                        revelation_key(&new_key, member),
                        json!(new_secret.to_string()),
                    ));
                }
                continue;
            }
            let sealer = match self.perms.sealer_for(member) {
                Ok(sealer) => sealer,
                Err(e) => {
                    tracing::warn!(%group, %member, error = %e, "cannot reveal new read key");
                    continue;
                }
            };
            let sealed = self
                .crypto
                .seal(&self.me.secret, &sealer, &new_secret.0, &new_context)?;
            changes.push(MapChange::set(
                revelation_key(&new_key, member),
                json!(sealed.to_string()),
            ));
        }

        if let Some(old_key) = state.read_key() {
            match self.key_secret(group, &old_key) {
                Ok(old_secret) => {
                    let encrypted = self.crypto.encrypt(
                        &new_secret,
                        &old_secret.0,
                        &revelation_context(group, &old_key),
                    )?;
                    changes.push(MapChange::set(
                        revelation_key(&old_key, new_key),
                        json!(encrypted.to_string()),
                    ));
                }
                Err(e) => tracing::warn!(%group, %old_key, error = %e, "previous read key unavailable"),
            }
        }

        for parent in state.parents() {
            match self.current_read_key(&parent) {
                Ok((parent_key, parent_secret)) => {
                    let encrypted =
                        self.crypto
                            .encrypt(&parent_secret, &new_secret.0, &new_context)?;
                    changes.push(MapChange::set(
                        revelation_key(&new_key, parent_key),
                        json!(encrypted.to_string()),
                    ));
                }
                Err(e) => tracing::debug!(%group, %parent, error = %e, "parent read key unavailable"),
            }
        }

        changes.push(MapChange::set(read_key_key(), json!(new_key.to_string())));
        Ok((new_key, new_secret, changes))
    }

    /// Changes linking a child group's current key to this parent's key,
    /// so members of the parent can read the child.
    pub fn link_child_key(&self, child: &CoId, parent: &CoId) -> Result<Vec<Value>> {
        let (child_key, child_secret) = self.current_read_key(child)?;
        let (parent_key, parent_secret) = self.current_read_key(parent)?;
        let encrypted = self.crypto.encrypt(
            &parent_secret,
            &child_secret.0,
            &revelation_context(child, &child_key),
        )?;
        Ok(vec![MapChange::set(
            revelation_key(&child_key, parent_key),
            json!(encrypted.to_string()),
        )])
    }
}
