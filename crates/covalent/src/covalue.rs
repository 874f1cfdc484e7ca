//! CoValueCore: one CoValue's verified log plus the logic tying it to
//! permissions, content and sync.
//!
//! A core holds only verified data. Whether a transaction counts is decided
//! when content is materialized, against the registry the core lives in.

use std::collections::{BTreeSet, HashMap};

use covalent_core::{
    validate_header, validate_session_batch, AccountOrAgent, AgentSecret, AppendOutcome, CoContent,
    CoId, CoValueHeader, CoValueType, CoreError, CryptoProvider, KnownState, Member, Ruleset,
    SessionId, SessionNewContent, Signature, SignerId, Transaction, ValidationError,
    VerifiedState,
};
use covalent_perms::{decode_transactions, CoValueLookup, KeyResolver, PermissionResolver, PermsError, Role};
use covalent_sync::{ContentMessage, Priority};

/// A CoValue as held by a node.
#[derive(Debug)]
pub struct CoValueCore {
    verified: VerifiedState,
    priority: Priority,
}

impl CoValueCore {
    /// A core for a header received for `id`.
    pub fn new(id: CoId, header: CoValueHeader) -> Result<Self, ValidationError> {
        validate_header(&id, &header)?;
        let priority = Priority::for_header(&header);
        Ok(Self {
            verified: VerifiedState::new(id, header)?,
            priority,
        })
    }

    /// A core for a locally created header.
    pub fn create(header: CoValueHeader) -> Result<Self, ValidationError> {
        let id = header.id()?;
        Self::new(id, header)
    }

    pub fn id(&self) -> &CoId {
        self.verified.id()
    }

    pub fn header(&self) -> &CoValueHeader {
        self.verified.header()
    }

    pub fn kind(&self) -> CoValueType {
        self.verified.header().kind
    }

    pub fn verified(&self) -> &VerifiedState {
        &self.verified
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn known_state(&self) -> KnownState {
        self.verified.known_state()
    }

    /// Validate and append a batch received from a peer.
    pub fn try_add(
        &mut self,
        crypto: &dyn CryptoProvider,
        session: SessionId,
        signer: &SignerId,
        content: &SessionNewContent,
    ) -> Result<AppendOutcome, ValidationError> {
        validate_session_batch(&session, content)?;
        self.verified.try_add_transactions(
            crypto,
            session,
            signer,
            content.after,
            &content.new_transactions,
            None,
            &content.last_signature,
        )
    }

    /// Append transactions authored on this node.
    pub fn add_local(
        &mut self,
        crypto: &dyn CryptoProvider,
        session: SessionId,
        secret: &AgentSecret,
        txs: Vec<Transaction>,
    ) -> Result<Signature, CoreError> {
        self.verified.add_local_transactions(crypto, session, secret, txs)
    }

    /// `content` messages carrying what the holder of `known` lacks.
    pub fn content_since(&self, known: Option<&KnownState>) -> Vec<ContentMessage> {
        self.verified
            .new_content_since(known)
            .unwrap_or_default()
            .into_iter()
            .map(|piece| ContentMessage::from_piece(piece, self.priority))
            .collect()
    }

    /// CoValues needed to verify and interpret this one: the owning group,
    /// parent groups, member accounts and the accounts that authored sessions.
    pub fn dependencies(&self, perms: &PermissionResolver<'_>) -> BTreeSet<CoId> {
        let id = *self.id();
        let mut deps = BTreeSet::new();
        match &self.header().ruleset {
            Ruleset::OwnedByGroup { group } => {
                deps.insert(*group);
            }
            Ruleset::Group { initial_admin } => {
                if let AccountOrAgent::Account(account) = initial_admin {
                    deps.insert(*account);
                }
                if let Ok(group) = perms.group(&id) {
                    deps.extend(group.dependencies());
                }
            }
            Ruleset::UnsafeAllowAll => {}
        }
        deps.extend(
            self.verified
                .sessions()
                .keys()
                .filter_map(|session| session.author.as_account().copied()),
        );
        deps.remove(&id);
        deps
    }

    /// Whether `author` may currently write to this CoValue.
    pub fn check_write(
        &self,
        perms: &PermissionResolver<'_>,
        author: AccountOrAgent,
    ) -> Result<(), PermsError> {
        let allowed = match &self.header().ruleset {
            Ruleset::UnsafeAllowAll => true,
            Ruleset::Group { .. } => {
                author == AccountOrAgent::Account(*self.id())
                    || perms
                        .group(self.id())?
                        .role_of(&Member::from(author))
                        .map(|role| role.is_admin() || role.is_invite())
                        .unwrap_or(false)
            }
            Ruleset::OwnedByGroup { group } => perms
                .current_role(group, author)
                .map(Role::can_write)
                .unwrap_or(false),
        };
        if allowed {
            Ok(())
        } else {
            Err(PermsError::InsufficientPermission(format!(
                "{} may not write to {}",
                author,
                self.id()
            )))
        }
    }

    /// Materialize content from the valid, readable transactions.
    pub fn content(&self, keys: &KeyResolver<'_, '_>) -> CoContent {
        let decoded = decode_transactions(keys, &self.verified);
        CoContent::from_transactions(self.kind(), &decoded)
    }
}

/// Every CoValue a node holds.
#[derive(Debug, Default)]
pub struct Registry {
    covalues: HashMap<CoId, CoValueCore>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &CoId) -> Option<&CoValueCore> {
        self.covalues.get(id)
    }

    pub fn get_mut(&mut self, id: &CoId) -> Option<&mut CoValueCore> {
        self.covalues.get_mut(id)
    }

    pub fn contains(&self, id: &CoId) -> bool {
        self.covalues.contains_key(id)
    }

    /// Register a core; an existing core under the same id is kept.
    pub fn insert(&mut self, core: CoValueCore) -> &mut CoValueCore {
        self.covalues.entry(*core.id()).or_insert(core)
    }

    pub fn ids(&self) -> impl Iterator<Item = &CoId> {
        self.covalues.keys()
    }

    pub fn len(&self) -> usize {
        self.covalues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.covalues.is_empty()
    }

    /// Ids ordered so that groups and accounts come before what they own.
    pub fn ids_by_priority(&self) -> Vec<CoId> {
        let mut ids: Vec<(Priority, CoId)> = self
            .covalues
            .values()
            .map(|core| (core.priority(), *core.id()))
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// The dependency closure of `id`, split into held and missing ids.
    pub fn dependency_closure(&self, id: &CoId) -> (BTreeSet<CoId>, BTreeSet<CoId>) {
        let perms = PermissionResolver::new(self);
        let mut held = BTreeSet::new();
        let mut missing = BTreeSet::new();
        let mut stack = vec![*id];
        while let Some(next) = stack.pop() {
            if held.contains(&next) || missing.contains(&next) {
                continue;
            }
            match self.get(&next) {
                Some(core) => {
                    held.insert(next);
                    stack.extend(core.dependencies(&perms));
                }
                None => {
                    missing.insert(next);
                }
            }
        }
        (held, missing)
    }

    /// The part of the dependency closure of `id` that is not held yet.
    pub fn missing_dependencies(&self, id: &CoId) -> BTreeSet<CoId> {
        self.dependency_closure(id).1
    }
}

impl CoValueLookup for Registry {
    fn verified(&self, id: &CoId) -> Option<&VerifiedState> {
        self.covalues.get(id).map(CoValueCore::verified)
    }
}
