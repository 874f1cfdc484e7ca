//! Permission resolver: which transactions of a CoValue are valid.
//!
//! Validity depends on the CoValue's ruleset:
//!
//! - `unsafeAllowAll`: every transaction is valid
//! - `group`: decided by the group fold (see [`GroupState`])
//! - `ownedByGroup`: the author must hold writer or admin in the owning
//!   group, as of the transaction's `madeAt`
//!
//! Roles are inherited from parent groups (invite roles excepted) and from
//! the `everyone` member.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;

use covalent_core::{
    AccountOrAgent, CoId, Member, Ruleset, SealerId, SignerId, TxRef, VerifiedState,
};

use crate::error::{PermsError, Result};
use crate::group::GroupState;
use crate::role::Role;

/// Access to the verified state of other CoValues.
pub trait CoValueLookup {
    /// The verified state of `id`, if it is loaded.
    fn verified(&self, id: &CoId) -> Option<&VerifiedState>;
}

impl CoValueLookup for BTreeMap<CoId, VerifiedState> {
    fn verified(&self, id: &CoId) -> Option<&VerifiedState> {
        self.get(id)
    }
}

impl CoValueLookup for HashMap<CoId, VerifiedState> {
    fn verified(&self, id: &CoId) -> Option<&VerifiedState> {
        self.get(id)
    }
}

/// Resolves roles and transaction validity, caching group folds.
///
/// A resolver is meant to live for one operation; it does not notice
/// changes made to the lookup after a group has been folded.
pub struct PermissionResolver<'a> {
    lookup: &'a dyn CoValueLookup,
    groups: RefCell<HashMap<CoId, Rc<GroupState>>>,
}

impl<'a> PermissionResolver<'a> {
    pub fn new(lookup: &'a dyn CoValueLookup) -> Self {
        Self {
            lookup,
            groups: RefCell::new(HashMap::new()),
        }
    }

    pub fn lookup(&self) -> &'a dyn CoValueLookup {
        self.lookup
    }

    /// The folded state of a group.
    pub fn group(&self, id: &CoId) -> Result<Rc<GroupState>> {
        if let Some(group) = self.groups.borrow().get(id) {
            return Ok(Rc::clone(group));
        }
        let state = self
            .lookup
            .verified(id)
            .ok_or(PermsError::GroupUnavailable(*id))?;
        let group = Rc::new(GroupState::fold(state)?);
        self.groups.borrow_mut().insert(*id, Rc::clone(&group));
        Ok(group)
    }

    /// Role of `member` in `group` at `made_at`, including inherited roles.
    pub fn effective_role(&self, group: &CoId, member: &Member, made_at: i64) -> Option<Role> {
        let mut visited = BTreeSet::new();
        self.effective_role_inner(group, member, made_at, &mut visited)
    }

    fn effective_role_inner(
        &self,
        group: &CoId,
        member: &Member,
        made_at: i64,
        visited: &mut BTreeSet<CoId>,
    ) -> Option<Role> {
        if !visited.insert(*group) {
            return None;
        }
        let state = match self.group(group) {
            Ok(state) => state,
            Err(e) => {
                tracing::debug!(%group, error = %e, "cannot resolve role");
                return None;
            }
        };

        let mut role = state.role_at(member, made_at);
        if *member != Member::Everyone {
            role = Role::max(role, state.role_at(&Member::Everyone, made_at));
        }
        for parent in state.parents_at(made_at) {
            let inherited = self
                .effective_role_inner(&parent, member, made_at, visited)
                .filter(|r| !r.is_invite());
            role = Role::max(role, inherited);
        }
        role
    }

    /// Current role of an author in a group.
    pub fn current_role(&self, group: &CoId, author: AccountOrAgent) -> Option<Role> {
        if author == AccountOrAgent::Account(*group) {
            return Some(Role::Admin);
        }
        self.effective_role(group, &Member::from(author), i64::MAX)
    }

    /// The valid transactions of `state`, in merge order.
    pub fn valid_transactions<'s>(&self, state: &'s VerifiedState) -> Vec<TxRef<'s>> {
        let all = state.transactions_in_merge_order();
        match &state.header().ruleset {
            Ruleset::UnsafeAllowAll => all,
            Ruleset::Group { .. } => {
                let group = match self.group(state.id()) {
                    Ok(group) => group,
                    Err(e) => {
                        tracing::warn!(id = %state.id(), error = %e, "group fold failed");
                        return Vec::new();
                    }
                };
                all.into_iter().filter(|tx| group.is_valid(&tx.id)).collect()
            }
            Ruleset::OwnedByGroup { group } => {
                if self.group(group).is_err() {
                    tracing::debug!(id = %state.id(), %group, "owner group not loaded");
                    return Vec::new();
                }
                all.into_iter()
                    .filter(|tx| {
                        let member = Member::from(tx.id.session.author);
                        self.effective_role(group, &member, tx.made_at())
                            .map(Role::can_write)
                            .unwrap_or(false)
                    })
                    .collect()
            }
        }
    }

    /// The signer that must have signed sessions of `author`.
    pub fn signer_for(&self, author: &AccountOrAgent) -> Result<SignerId> {
        match author {
            AccountOrAgent::Agent(agent) => Ok(agent.signer),
            AccountOrAgent::Account(account) => Ok(self.group(account)?.current_agent()?.signer),
        }
    }

    /// The sealer that key revelations for `member` are sealed to.
    pub fn sealer_for(&self, member: &Member) -> Result<SealerId> {
        match member {
            Member::Agent(agent) => Ok(agent.sealer),
            Member::Account(account) => Ok(self.group(account)?.current_agent()?.sealer),
            Member::Everyone => Err(PermsError::InsufficientPermission(
                "everyone has no sealer".into(),
            )),
        }
    }
}
