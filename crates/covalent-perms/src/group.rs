//! Group state: the role table, read keys and parent links of a group.
//!
//! A group is a CoMap whose keys are members, `readKey`, key revelations
//! (`<key>_for_<target>`) and parent links (`parent_<co id>`). Whether each of
//! its transactions is valid depends on the roles established by the ones
//! before it, so the state is computed as a single fold over the group's
//! transactions in merge order.
//!
//! ## Rules
//!
//! - The header's `initialAdmin` is admin from the beginning of time.
//! - An account writing into its own account group acts as admin.
//! - Admins may change anything, except making `everyone` an admin or
//!   giving `everyone` an invite role.
//! - Invite agents may add accounts or agents with a role up to their
//!   invite's level, may not override an existing equal or higher role or a
//!   revocation, and may reveal keys only to the members they add in the
//!   same transaction.
//! - Everyone else may change nothing.
//! - A transaction with any invalid change is rejected as a whole.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use covalent_core::{
    AccountOrAgent, AgentId, CoId, CoMap, ContentMerge, DecodedTransaction, KeyId, MapChange,
    Member, Ruleset, Transaction, TransactionId, VerifiedState,
};

use crate::error::{PermsError, Result};
use crate::role::Role;

const READ_KEY: &str = "readKey";
const PARENT_PREFIX: &str = "parent_";
const FOR_SEPARATOR: &str = "_for_";

/// One assignment in a member's role history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RoleEntry {
    role: Role,
    made_at: i64,
    tx: Option<TransactionId>,
}

/// Classification of a group map key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupKey {
    Member(Member),
    ReadKey,
    Revelation { key: KeyId, target: String },
    Parent(CoId),
    Other(String),
}

impl GroupKey {
    pub fn classify(key: &str) -> Self {
        if key == READ_KEY {
            return GroupKey::ReadKey;
        }
        if let Some(member) = Member::parse_key(key) {
            return GroupKey::Member(member);
        }
        if let Some(parent) = key.strip_prefix(PARENT_PREFIX) {
            if let Ok(id) = parent.parse() {
                return GroupKey::Parent(id);
            }
        }
        if KeyId::is_key_id(key) {
            if let Some((k, target)) = key.split_once(FOR_SEPARATOR) {
                if let Ok(k) = k.parse() {
                    return GroupKey::Revelation {
                        key: k,
                        target: target.to_string(),
                    };
                }
            }
        }
        GroupKey::Other(key.to_string())
    }
}

/// The map key under which `key` is revealed to `target`.
pub fn revelation_key(key: &KeyId, target: impl std::fmt::Display) -> String {
    format!("{}{}{}", key, FOR_SEPARATOR, target)
}

/// The map key linking a group to a parent group.
pub fn parent_key(parent: &CoId) -> String {
    format!("{}{}", PARENT_PREFIX, parent)
}

/// The `readKey` map key.
pub fn read_key_key() -> &'static str {
    READ_KEY
}

/// Result of folding a group's transactions.
#[derive(Debug, Clone)]
pub struct GroupState {
    id: CoId,
    is_account: bool,
    roles: BTreeMap<Member, Vec<RoleEntry>>,
    content: CoMap,
    valid: BTreeSet<TransactionId>,
    rejected: Vec<(TransactionId, String)>,
}

impl GroupState {
    /// Fold the transactions of a group-ruleset CoValue.
    pub fn fold(state: &VerifiedState) -> Result<Self> {
        let initial_admin = match &state.header().ruleset {
            Ruleset::Group { initial_admin } => *initial_admin,
            _ => return Err(PermsError::NotAGroup(*state.id())),
        };

        let mut group = GroupState {
            id: *state.id(),
            is_account: state.header().is_account(),
            roles: BTreeMap::new(),
            content: CoMap::default(),
            valid: BTreeSet::new(),
            rejected: Vec::new(),
        };
        group.roles.insert(
            Member::from(initial_admin),
            vec![RoleEntry {
                role: Role::Admin,
                made_at: i64::MIN,
                tx: None,
            }],
        );

        for tx in state.transactions_in_merge_order() {
            let changes = match tx.tx {
                Transaction::Trusting { changes, .. } => changes,
                Transaction::Private { .. } => {
                    group.reject(tx.id, "group transactions must be trusting".into());
                    continue;
                }
            };
            match group.check_transaction(tx.id.session.author, changes) {
                Ok(assignments) => {
                    for (member, role) in assignments {
                        group.roles.entry(member).or_default().push(RoleEntry {
                            role,
                            made_at: tx.made_at(),
                            tx: Some(tx.id),
                        });
                    }
                    group.content.apply(&DecodedTransaction {
                        id: tx.id,
                        made_at: tx.made_at(),
                        changes: changes.clone(),
                    });
                    group.valid.insert(tx.id);
                }
                Err(reason) => group.reject(tx.id, reason),
            }
        }

        Ok(group)
    }

    fn reject(&mut self, tx: TransactionId, reason: String) {
        tracing::warn!(group = %self.id, %tx, %reason, "rejecting group transaction");
        self.rejected.push((tx, reason));
    }

    /// Role an author acts with when changing this group.
    fn author_role(&self, author: AccountOrAgent) -> Option<Role> {
        if author == AccountOrAgent::Account(self.id) {
            return Some(Role::Admin);
        }
        self.role_of(&Member::from(author))
    }

    /// Check all changes of a transaction; on success returns the role
    /// assignments it makes.
    fn check_transaction(
        &self,
        author: AccountOrAgent,
        changes: &[Value],
    ) -> std::result::Result<Vec<(Member, Role)>, String> {
        let author_role = self
            .author_role(author)
            .ok_or_else(|| format!("{} is not a member", author))?;
        let mut assignments = Vec::new();
        let mut revealed_to = Vec::new();

        for change in changes {
            let change: MapChange = serde_json::from_value(change.clone())
                .map_err(|e| format!("malformed group change: {}", e))?;
            let (key, value) = match change {
                MapChange::Set { key, value } => (key, Some(value)),
                MapChange::Del { key } => (key, None),
            };

            if author_role.is_admin() {
                if let GroupKey::Member(member) = GroupKey::classify(&key) {
                    let role = parse_role(value.as_ref())?;
                    if member == Member::Everyone && (role.is_admin() || role.is_invite()) {
                        return Err(format!("everyone cannot be given the {} role", role));
                    }
                    assignments.push((member, role));
                }
                continue;
            }

            let grant = author_role
                .invite_grant()
                .ok_or_else(|| format!("{} may not change the group", author_role))?;
            match GroupKey::classify(&key) {
                GroupKey::Member(Member::Everyone) => {
                    return Err("invites cannot change everyone".into());
                }
                GroupKey::Member(member) => {
                    let role = parse_role(value.as_ref())?;
                    if role.is_invite() || role.level() == 0 || role.level() > grant.level() {
                        return Err(format!("{} cannot grant {}", author_role, role));
                    }
                    let current = assignments
                        .iter()
                        .rev()
                        .find(|(m, _)| *m == member)
                        .map(|(_, r)| *r)
                        .or_else(|| self.role_of(&member));
                    if let Some(current) = current {
                        if current == Role::Revoked || current.level() >= role.level() {
                            return Err(format!("{} cannot override {}", author_role, current));
                        }
                    }
                    assignments.push((member, role));
                }
                GroupKey::Revelation { target, .. } if value.is_some() => {
                    match Member::parse_key(&target) {
                        Some(member @ Member::Account(_)) | Some(member @ Member::Agent(_)) => {
                            revealed_to.push(member);
                        }
                        _ => return Err("invites may only reveal keys to members".into()),
                    }
                }
                _ => return Err(format!("{} may not set {}", author_role, key)),
            }
        }

        // Invites reveal keys only to the members admitted alongside them.
        for target in revealed_to {
            if !assignments.iter().any(|(member, _)| *member == target) {
                return Err(format!("{} may not reveal keys to {}", author_role, target));
            }
        }

        Ok(assignments)
    }

    pub fn id(&self) -> &CoId {
        &self.id
    }

    pub fn is_account(&self) -> bool {
        self.is_account
    }

    /// The group's map content, including only valid transactions.
    pub fn content(&self) -> &CoMap {
        &self.content
    }

    pub fn is_valid(&self, tx: &TransactionId) -> bool {
        self.valid.contains(tx)
    }

    pub fn valid_transactions(&self) -> &BTreeSet<TransactionId> {
        &self.valid
    }

    pub fn rejected(&self) -> &[(TransactionId, String)] {
        &self.rejected
    }

    /// Current role of a member, not considering inheritance.
    pub fn role_of(&self, member: &Member) -> Option<Role> {
        self.roles.get(member)?.last().map(|e| e.role)
    }

    /// Role of a member for a transaction made at `made_at`.
    ///
    /// Role changes are never retroactive: the last assignment made at or
    /// before `made_at` applies.
    pub fn role_at(&self, member: &Member, made_at: i64) -> Option<Role> {
        self.roles
            .get(member)?
            .iter()
            .rev()
            .find(|e| e.made_at <= made_at)
            .map(|e| e.role)
    }

    /// Every member with its current role.
    pub fn members(&self) -> impl Iterator<Item = (&Member, Role)> {
        self.roles
            .iter()
            .filter_map(|(m, history)| history.last().map(|e| (m, e.role)))
    }

    pub fn read_key(&self) -> Option<KeyId> {
        self.content.get(READ_KEY)?.as_str()?.parse().ok()
    }

    /// Stored revelation of `key` for a target (member id, `everyone` or key id).
    pub fn revelation(&self, key: &KeyId, target: &str) -> Option<&str> {
        self.content.get(&revelation_key(key, target))?.as_str()
    }

    /// Key ids under which `key` has been encrypted.
    pub fn keys_revealing(&self, key: &KeyId) -> Vec<KeyId> {
        self.content
            .keys()
            .filter_map(|k| match GroupKey::classify(k) {
                GroupKey::Revelation { key: revealed, target } if revealed == *key => {
                    KeyId::from_str(&target).ok()
                }
                _ => None,
            })
            .collect()
    }

    /// Parent groups linked at or before `made_at`.
    pub fn parents_at(&self, made_at: i64) -> Vec<CoId> {
        self.content
            .state_at(made_at)
            .keys()
            .filter_map(|k| match GroupKey::classify(k) {
                GroupKey::Parent(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Current parent groups.
    pub fn parents(&self) -> Vec<CoId> {
        self.parents_at(i64::MAX)
    }

    /// For an account: the agent currently acting for it.
    ///
    /// That is the most recently added agent holding the admin role.
    pub fn current_agent(&self) -> Result<AgentId> {
        self.roles
            .iter()
            .filter_map(|(m, history)| match (m, history.last()) {
                (Member::Agent(agent), Some(entry)) if entry.role.is_admin() => {
                    Some((entry.made_at, entry.tx, *agent))
                }
                _ => None,
            })
            .max()
            .map(|(_, _, agent)| agent)
            .ok_or(PermsError::NoCurrentAgent(self.id))
    }

    /// Ids of other CoValues this group depends on: parents and account members.
    pub fn dependencies(&self) -> BTreeSet<CoId> {
        let mut deps: BTreeSet<CoId> = self.parents().into_iter().collect();
        deps.extend(self.roles.keys().filter_map(|m| match m {
            Member::Account(id) if *id != self.id => Some(*id),
            _ => None,
        }));
        deps
    }
}

fn parse_role(value: Option<&Value>) -> std::result::Result<Role, String> {
    value
        .and_then(Value::as_str)
        .ok_or_else(|| "member roles cannot be deleted".to_string())?
        .parse()
        .map_err(|e: PermsError| e.to_string())
}
