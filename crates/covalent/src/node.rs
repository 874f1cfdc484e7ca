//! LocalNode: the unified API of a Covalent replica.
//!
//! A node owns an identity, a session and the registry of every CoValue it
//! holds. Local writes are validated against the permission resolver,
//! signed into the node's session and pushed to interested peers; incoming
//! sync messages are applied by the [`SyncManager`].

use std::collections::BTreeSet;
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::{json, Value};
use tokio::sync::{broadcast, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use covalent_core::{
    AgentId, AgentSecret, CoContent, CoId, CoList, CoMap, CoPlainText, CoStream, CoValueHeader,
    CoValueType, CryptoProvider, KnownState, ListChange, MapChange, Member, Ruleset, SessionId,
    Transaction, TransactionId,
};
use covalent_perms::{
    accept_invite, create_invite, key_group, parent_key, profile_id, root_id, seal_changes,
    GroupState, Identity, KeyResolver, PermissionResolver, PermsError, Role, PROFILE_KEY,
    ROOT_KEY,
};
use covalent_sync::{
    run_dispatcher, Peer, PeerConnector, PeerEvent, PeerId, PeerState, PeerStats,
    PriorityBasedMessageQueue, SyncMessage,
};

use crate::config::NodeConfig;
use crate::covalue::{CoValueCore, Registry};
use crate::error::{NodeError, Result};
use crate::now_millis;
use crate::sync_manager::SyncManager;

/// Capacity of the change notification channel.
const UPDATE_CAPACITY: usize = 1024;

/// How a transaction's changes are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privacy {
    /// Changes in the clear.
    Trusting,
    /// Changes encrypted under the owning group's current read key.
    Private,
}

impl Privacy {
    /// Group-owned values are private; groups and open values are not.
    pub fn default_for(header: &CoValueHeader) -> Self {
        match header.ruleset {
            Ruleset::OwnedByGroup { .. } => Privacy::Private,
            Ruleset::Group { .. } | Ruleset::UnsafeAllowAll => Privacy::Trusting,
        }
    }
}

struct NodeInner {
    registry: Registry,
    sync: SyncManager,
    /// A `crash_on_close` peer was lost.
    failed: bool,
}

struct Shared {
    crypto: Arc<dyn CryptoProvider>,
    identity: Identity,
    session: SessionId,
    config: NodeConfig,
    inner: Mutex<NodeInner>,
    updates: broadcast::Sender<CoId>,
    /// Woken whenever sync state changes; `load` waits on it.
    progress: Notify,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.inner
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .sync
            .close_all();
    }
}

/// Mutations made under one lock acquisition.
struct Txn<'a> {
    registry: &'a mut Registry,
    crypto: &'a dyn CryptoProvider,
    max_tx_size: usize,
    changed: BTreeSet<CoId>,
}

impl<'a> Txn<'a> {
    fn new(registry: &'a mut Registry, crypto: &'a dyn CryptoProvider, max_tx_size: usize) -> Self {
        Self {
            registry,
            crypto,
            max_tx_size,
            changed: BTreeSet::new(),
        }
    }

    fn core(&self, id: &CoId) -> Result<&CoValueCore> {
        self.registry.get(id).ok_or(NodeError::NotLoaded(*id))
    }

    fn expect_kind(&self, id: &CoId, kind: CoValueType) -> Result<()> {
        if self.core(id)?.kind() == kind {
            Ok(())
        } else {
            Err(NodeError::WrongKind { id: *id, expected: kind })
        }
    }

    fn expect_group(&self, id: &CoId) -> Result<()> {
        if self.core(id)?.header().is_group() {
            Ok(())
        } else {
            Err(NodeError::NotAGroup(*id))
        }
    }

    fn expect_admin(&self, group: &CoId, writer: &Identity) -> Result<()> {
        self.expect_group(group)?;
        let perms = PermissionResolver::new(&*self.registry);
        if perms.current_role(group, writer.author()) == Some(Role::Admin) {
            Ok(())
        } else {
            Err(PermsError::InsufficientPermission(format!(
                "{} is not an admin of {}",
                writer.author(),
                group
            ))
            .into())
        }
    }

    fn create(&mut self, header: CoValueHeader) -> Result<CoId> {
        let core = CoValueCore::create(header)?;
        let id = *core.id();
        self.registry.insert(core);
        self.changed.insert(id);
        debug!(covalue = %id, "created");
        Ok(id)
    }

    /// Run `f` with a key resolver for `writer`.
    fn with_keys<T>(
        &self,
        writer: &Identity,
        f: impl FnOnce(&KeyResolver<'_, '_>) -> covalent_perms::Result<T>,
    ) -> Result<T> {
        let perms = PermissionResolver::new(&*self.registry);
        let keys = KeyResolver::new(&perms, self.crypto, writer);
        Ok(f(&keys)?)
    }

    fn rotate(&self, writer: &Identity, group: &CoId, overrides: &[(Member, Role)]) -> Result<Vec<Value>> {
        self.with_keys(writer, |keys| {
            keys.rotate(group, overrides).map(|(_, _, changes)| changes)
        })
    }

    /// Sign `changes` into `session` of `id` as one transaction.
    fn append(
        &mut self,
        writer: &Identity,
        session: SessionId,
        id: &CoId,
        changes: Vec<Value>,
        privacy: Privacy,
    ) -> Result<()> {
        let tx = {
            let perms = PermissionResolver::new(&*self.registry);
            let core = self.core(id)?;
            core.check_write(&perms, writer.author())?;
            let made_at = now_millis();
            match privacy {
                Privacy::Trusting => Transaction::trusting(made_at, changes),
                Privacy::Private => {
                    let group = key_group(core.verified()).ok_or(PermsError::NoReadKey(*id))?;
                    let keys = KeyResolver::new(&perms, self.crypto, writer);
                    let (key, secret) = keys.current_read_key(&group)?;
                    let tx_id = TransactionId {
                        session,
                        tx_index: core.verified().next_tx_index(&session),
                    };
                    seal_changes(self.crypto, id, &tx_id, (key, &secret), made_at, &changes)?
                }
            }
        };

        if let Ok(bytes) = serde_json::to_vec(&tx) {
            if bytes.len() > self.max_tx_size {
                warn!(covalue = %id, size = bytes.len(), limit = self.max_tx_size, "large transaction");
            }
        }

        let core = self
            .registry
            .get_mut(id)
            .ok_or(NodeError::NotLoaded(*id))?;
        core.add_local(self.crypto, session, &writer.secret, vec![tx])?;
        self.changed.insert(*id);
        Ok(())
    }

    fn into_changed(self) -> BTreeSet<CoId> {
        self.changed
    }
}

/// A Covalent replica.
///
/// Cheap to clone; all clones share the same state. Must be used within a
/// tokio runtime once peers are attached.
#[derive(Clone)]
pub struct LocalNode {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for LocalNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalNode")
            .field("author", &self.shared.identity.author())
            .field("session", &self.shared.session)
            .finish()
    }
}

impl LocalNode {
    fn from_parts(
        crypto: Arc<dyn CryptoProvider>,
        config: NodeConfig,
        identity: Identity,
        session: SessionId,
        registry: Registry,
    ) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                crypto,
                identity,
                session,
                config,
                inner: Mutex::new(NodeInner {
                    registry,
                    sync: SyncManager::new(),
                    failed: false,
                }),
                updates,
                progress: Notify::new(),
            }),
        }
    }

    /// A node acting as a bare agent, without an account.
    pub fn with_agent(crypto: Arc<dyn CryptoProvider>, config: NodeConfig, secret: AgentSecret) -> Self {
        let identity = Identity::agent(crypto.as_ref(), secret);
        let session = SessionId::new_random(identity.author());
        Self::from_parts(crypto, config, identity, session, Registry::new())
    }

    /// Create a new account with a profile carrying `name`.
    ///
    /// Returns the node and the agent secret that logs into the account.
    pub fn with_new_account(
        crypto: Arc<dyn CryptoProvider>,
        config: NodeConfig,
        name: &str,
    ) -> Result<(Self, AgentSecret)> {
        let secret = crypto.new_agent_secret();
        let agent = Identity::agent(crypto.as_ref(), secret.clone());
        let agent_session = SessionId::new_random(agent.author());
        let mut registry = Registry::new();

        let (identity, session) = {
            let mut txn = Txn::new(&mut registry, crypto.as_ref(), config.max_recommended_tx_size);
            let now = now_millis();
            let account = txn.create(CoValueHeader::account(agent.author(), now))?;

            let me = Member::Agent(agent.agent);
            let mut changes = vec![MapChange::set(me.to_string(), json!(Role::Admin.as_str()))];
            changes.extend(txn.rotate(&agent, &account, &[(me, Role::Admin)])?);
            txn.append(&agent, agent_session, &account, changes, Privacy::Trusting)?;

            let identity = Identity::account(crypto.as_ref(), account, secret.clone());
            let session = SessionId::new_random(identity.author());
            let profile = txn.create(CoValueHeader::owned_by(
                CoValueType::Comap,
                account,
                Some(json!({ "type": "profile" })),
                now,
            ))?;
            txn.append(
                &identity,
                session,
                &profile,
                vec![MapChange::set("name", json!(name))],
                Privacy::Trusting,
            )?;
            txn.append(
                &identity,
                session,
                &account,
                vec![MapChange::set(PROFILE_KEY, json!(profile.to_string()))],
                Privacy::Trusting,
            )?;
            (identity, session)
        };

        info!(account = ?identity.account, "account created");
        Ok((Self::from_parts(crypto, config, identity, session, registry), secret))
    }

    /// Log into an existing account, loading it from `peers`.
    pub async fn with_loaded_account(
        crypto: Arc<dyn CryptoProvider>,
        config: NodeConfig,
        account: CoId,
        secret: AgentSecret,
        peers: Vec<Peer>,
    ) -> Result<Self> {
        let identity = Identity::account(crypto.as_ref(), account, secret);
        let session = SessionId::new_random(identity.author());
        let node = Self::from_parts(crypto, config, identity, session, Registry::new());
        for peer in peers {
            node.add_peer(peer);
        }

        node.load(&account).await?;
        let current = node.group(&account)?.current_agent()?;
        if current != node.agent_id() {
            return Err(PermsError::InsufficientPermission(format!(
                "agent is not the current agent of {}",
                account
            ))
            .into());
        }
        if let Some(profile) = node.profile_id()? {
            node.load(&profile).await?;
        }
        info!(%account, "account loaded");
        Ok(node)
    }

    fn lock(&self) -> MutexGuard<'_, NodeInner> {
        self.shared.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply local mutations, then propagate and announce what changed.
    fn mutate<T>(&self, f: impl FnOnce(&mut Txn<'_>) -> Result<T>) -> Result<T> {
        let shared = &self.shared;
        let (result, changed) = {
            let mut guard = self.lock();
            if guard.failed {
                return Err(NodeError::StorageLost);
            }
            let NodeInner { registry, sync, .. } = &mut *guard;
            let mut txn = Txn::new(
                registry,
                shared.crypto.as_ref(),
                shared.config.max_recommended_tx_size,
            );
            let result = f(&mut txn);
            let changed = txn.into_changed();
            for id in &changed {
                sync.on_changed(registry, id, None);
            }
            (result, changed)
        };
        self.announce(changed);
        result
    }

    fn announce(&self, changed: impl IntoIterator<Item = CoId>) {
        for id in changed {
            // No receivers is fine.
            let _ = self.shared.updates.send(id);
        }
        self.shared.progress.notify_waiters();
    }

    // ─────────────────────────────────────────────────────────────────────
    // Identity
    // ─────────────────────────────────────────────────────────────────────

    pub fn account_id(&self) -> Option<CoId> {
        self.shared.identity.account
    }

    pub fn agent_id(&self) -> AgentId {
        self.shared.identity.agent
    }

    pub fn session_id(&self) -> SessionId {
        self.shared.session
    }

    pub fn identity(&self) -> &Identity {
        &self.shared.identity
    }

    pub fn config(&self) -> &NodeConfig {
        &self.shared.config
    }

    /// Whether a storage peer was lost; local writes then fail.
    pub fn is_failed(&self) -> bool {
        self.lock().failed
    }

    // ─────────────────────────────────────────────────────────────────────
    // CoValues
    // ─────────────────────────────────────────────────────────────────────

    /// Register a new CoValue.
    pub fn create_covalue(&self, header: CoValueHeader) -> Result<CoId> {
        self.mutate(|txn| {
            if let Some(group) = header.owner_group() {
                txn.expect_group(group)?;
            }
            txn.create(header)
        })
    }

    fn create_owned(&self, kind: CoValueType, owner: &CoId, meta: Option<Value>) -> Result<CoId> {
        self.create_covalue(CoValueHeader::owned_by(kind, *owner, meta, now_millis()))
    }

    pub fn create_map(&self, owner: &CoId) -> Result<CoId> {
        self.create_owned(CoValueType::Comap, owner, None)
    }

    pub fn create_list(&self, owner: &CoId) -> Result<CoId> {
        self.create_owned(CoValueType::Colist, owner, None)
    }

    pub fn create_stream(&self, owner: &CoId) -> Result<CoId> {
        self.create_owned(CoValueType::Costream, owner, None)
    }

    pub fn create_text(&self, owner: &CoId) -> Result<CoId> {
        self.create_owned(CoValueType::Coplaintext, owner, None)
    }

    /// Append `changes` to `id` as one transaction from this node's session.
    pub fn transact(&self, id: &CoId, changes: Vec<Value>, privacy: Privacy) -> Result<()> {
        let shared = &self.shared;
        self.mutate(|txn| txn.append(&shared.identity, shared.session, id, changes, privacy))
    }

    /// Append with the privacy the CoValue's ruleset calls for.
    fn write(&self, id: &CoId, kind: CoValueType, changes: Vec<Value>) -> Result<()> {
        let shared = &self.shared;
        self.mutate(|txn| {
            txn.expect_kind(id, kind)?;
            let privacy = Privacy::default_for(txn.core(id)?.header());
            txn.append(&shared.identity, shared.session, id, changes, privacy)
        })
    }

    pub fn map_set(&self, id: &CoId, key: &str, value: Value) -> Result<()> {
        self.write(id, CoValueType::Comap, vec![MapChange::set(key, value)])
    }

    pub fn map_delete(&self, id: &CoId, key: &str) -> Result<()> {
        self.write(id, CoValueType::Comap, vec![MapChange::del(key)])
    }

    pub fn list_append(&self, id: &CoId, value: Value) -> Result<()> {
        let anchor = self.list(id)?.end_anchor();
        self.write(id, CoValueType::Colist, ListChange::insert_all(anchor, [value]))
    }

    /// Insert `value` so that it ends up at `index`.
    pub fn list_insert(&self, id: &CoId, index: usize, value: Value) -> Result<()> {
        let list = self.list(id)?;
        if index > list.len() {
            return Err(NodeError::IndexOutOfRange { id: *id, index });
        }
        let anchor = list.anchor_for_index(index);
        self.write(id, CoValueType::Colist, ListChange::insert_all(anchor, [value]))
    }

    pub fn list_delete(&self, id: &CoId, index: usize) -> Result<()> {
        let op = self
            .list(id)?
            .op_at(index)
            .ok_or(NodeError::IndexOutOfRange { id: *id, index })?;
        self.write(id, CoValueType::Colist, vec![ListChange::delete(op)])
    }

    pub fn stream_push(&self, id: &CoId, value: Value) -> Result<()> {
        self.write(id, CoValueType::Costream, vec![value])
    }

    /// Insert `text` at grapheme index `index`.
    pub fn text_insert(&self, id: &CoId, index: usize, text: &str) -> Result<()> {
        let current = self.text(id)?;
        if index > current.len() {
            return Err(NodeError::IndexOutOfRange { id: *id, index });
        }
        let changes = CoPlainText::insert_changes(current.anchor_for_index(index), text);
        self.write(id, CoValueType::Coplaintext, changes)
    }

    /// Delete the graphemes in `range`.
    pub fn text_delete(&self, id: &CoId, range: Range<usize>) -> Result<()> {
        let changes = self.text(id)?.delete_changes(range);
        if changes.is_empty() {
            return Ok(());
        }
        self.write(id, CoValueType::Coplaintext, changes)
    }

    /// Materialized content of `id` as this node may read it.
    pub fn content(&self, id: &CoId) -> Result<CoContent> {
        let inner = self.lock();
        let core = inner.registry.get(id).ok_or(NodeError::NotLoaded(*id))?;
        let perms = PermissionResolver::new(&inner.registry);
        let keys = KeyResolver::new(&perms, self.shared.crypto.as_ref(), &self.shared.identity);
        Ok(core.content(&keys))
    }

    pub fn map(&self, id: &CoId) -> Result<CoMap> {
        match self.content(id)? {
            CoContent::Map(map) => Ok(map),
            _ => Err(NodeError::WrongKind { id: *id, expected: CoValueType::Comap }),
        }
    }

    pub fn list(&self, id: &CoId) -> Result<CoList> {
        match self.content(id)? {
            CoContent::List(list) => Ok(list),
            _ => Err(NodeError::WrongKind { id: *id, expected: CoValueType::Colist }),
        }
    }

    pub fn stream(&self, id: &CoId) -> Result<CoStream> {
        match self.content(id)? {
            CoContent::Stream(stream) => Ok(stream),
            _ => Err(NodeError::WrongKind { id: *id, expected: CoValueType::Costream }),
        }
    }

    pub fn text(&self, id: &CoId) -> Result<CoPlainText> {
        match self.content(id)? {
            CoContent::Text(text) => Ok(text),
            _ => Err(NodeError::WrongKind { id: *id, expected: CoValueType::Coplaintext }),
        }
    }

    pub fn header(&self, id: &CoId) -> Option<CoValueHeader> {
        self.lock().registry.get(id).map(|core| core.header().clone())
    }

    pub fn known_state(&self, id: &CoId) -> Option<KnownState> {
        self.lock().registry.get(id).map(CoValueCore::known_state)
    }

    pub fn is_loaded(&self, id: &CoId) -> bool {
        self.lock().registry.contains(id)
    }

    /// Ids of every CoValue this node holds.
    pub fn covalue_ids(&self) -> Vec<CoId> {
        self.lock().registry.ids_by_priority()
    }

    /// Changed CoValue ids, as they change.
    pub fn subscribe(&self) -> broadcast::Receiver<CoId> {
        self.shared.updates.subscribe()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Groups
    // ─────────────────────────────────────────────────────────────────────

    /// The folded state of a group.
    pub fn group(&self, id: &CoId) -> Result<GroupState> {
        let inner = self.lock();
        if !inner.registry.contains(id) {
            return Err(NodeError::NotLoaded(*id));
        }
        let perms = PermissionResolver::new(&inner.registry);
        let state = perms.group(id)?;
        Ok((*state).clone())
    }

    /// Create a group administered by this node's identity.
    pub fn create_group(&self) -> Result<CoId> {
        let shared = &self.shared;
        let me = &shared.identity;
        self.mutate(|txn| {
            let group = txn.create(CoValueHeader::group(me.author(), now_millis()))?;
            let member = Member::from(me.author());
            let mut changes = vec![MapChange::set(member.to_string(), json!(Role::Admin.as_str()))];
            changes.extend(txn.rotate(me, &group, &[(member, Role::Admin)])?);
            txn.append(me, shared.session, &group, changes, Privacy::Trusting)?;
            Ok(group)
        })
    }

    /// Give `member` a role in `group`, rotating the read key.
    pub async fn add_member(&self, group: &CoId, member: Member, role: Role) -> Result<()> {
        if role.is_invite() || (member == Member::Everyone && role.is_admin()) {
            return Err(PermsError::InvalidRole(format!("cannot give {} to {}", role, member)).into());
        }
        if let Member::Account(account) = member {
            self.load(&account).await?;
        }
        self.change_role(group, member, role)
    }

    /// Revoke `member`'s access to `group`, rotating the read key.
    pub fn remove_member(&self, group: &CoId, member: Member) -> Result<()> {
        self.change_role(group, member, Role::Revoked)
    }

    fn change_role(&self, group: &CoId, member: Member, role: Role) -> Result<()> {
        let shared = &self.shared;
        let me = &shared.identity;
        self.mutate(|txn| {
            txn.expect_admin(group, me)?;
            let mut changes = vec![MapChange::set(member.to_string(), json!(role.as_str()))];
            changes.extend(txn.rotate(me, group, &[(member, role)])?);
            txn.append(me, shared.session, group, changes, Privacy::Trusting)?;
            info!(%group, %member, %role, "role changed");
            Ok(())
        })
    }

    /// Create an invite admitting accounts to `group` with `role`.
    pub fn create_invite(&self, group: &CoId, role: Role) -> Result<AgentSecret> {
        let shared = &self.shared;
        let me = &shared.identity;
        self.mutate(|txn| {
            txn.expect_group(group)?;
            let (secret, changes) = txn.with_keys(me, |keys| create_invite(keys, group, role))?;
            txn.append(me, shared.session, group, changes, Privacy::Trusting)?;
            Ok(secret)
        })
    }

    /// Join `group` using an invite secret. Returns the role granted.
    ///
    /// The membership is written by the invite agent from its own session.
    pub async fn accept_invite(&self, group: &CoId, invite: AgentSecret) -> Result<Role> {
        let account = self.account_id().ok_or(NodeError::NoAccount)?;
        self.load(group).await?;
        let invite = Identity::agent(self.shared.crypto.as_ref(), invite);
        let session = SessionId::new_random(invite.author());
        self.mutate(|txn| {
            txn.expect_group(group)?;
            let (role, changes) = txn.with_keys(&invite, |keys| accept_invite(keys, group, &account))?;
            txn.append(&invite, session, group, changes, Privacy::Trusting)?;
            info!(%group, %account, %role, "invite accepted");
            Ok(role)
        })
    }

    /// Make `child` inherit roles from `parent`; members of `parent` can then
    /// read `child`.
    pub async fn extend_group(&self, child: &CoId, parent: &CoId) -> Result<()> {
        self.load(parent).await?;
        let shared = &self.shared;
        let me = &shared.identity;
        self.mutate(|txn| {
            txn.expect_admin(child, me)?;
            txn.expect_group(parent)?;
            let mut changes = vec![MapChange::set(parent_key(parent), json!("extend"))];
            match txn.with_keys(me, |keys| keys.link_child_key(child, parent)) {
                Ok(link) => changes.extend(link),
                Err(NodeError::Permission(PermsError::NoReadKey(_))) => {}
                Err(e) => return Err(e),
            }
            txn.append(me, shared.session, child, changes, Privacy::Trusting)
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Account
    // ─────────────────────────────────────────────────────────────────────

    pub fn profile_id(&self) -> Result<Option<CoId>> {
        let account = self.account_id().ok_or(NodeError::NoAccount)?;
        Ok(profile_id(&self.group(&account)?))
    }

    pub fn root_id(&self) -> Result<Option<CoId>> {
        let account = self.account_id().ok_or(NodeError::NoAccount)?;
        Ok(root_id(&self.group(&account)?))
    }

    /// Point the account's `root` at an application CoValue.
    pub fn set_root(&self, root: &CoId) -> Result<()> {
        let account = self.account_id().ok_or(NodeError::NoAccount)?;
        self.transact(
            &account,
            vec![MapChange::set(ROOT_KEY, json!(root.to_string()))],
            Privacy::Trusting,
        )
    }

    // ─────────────────────────────────────────────────────────────────────
    // Loading
    // ─────────────────────────────────────────────────────────────────────

    /// Make `id` and everything needed to read it available locally.
    ///
    /// Asks upstream peers for whatever is missing. Fails with
    /// `Unavailable` when no peer has it or the load timeout elapses.
    pub async fn load(&self, id: &CoId) -> Result<()> {
        let deadline = Instant::now() + self.shared.config.load_timeout;
        {
            let mut inner = self.lock();
            let missing = inner.registry.missing_dependencies(id);
            for covalue in &missing {
                inner.sync.retry(covalue);
            }
        }

        loop {
            let notified = self.shared.progress.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.check_load(id)? {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                debug!(covalue = %id, "load timed out");
                return Err(NodeError::Unavailable(*id));
            }
        }
    }

    /// Whether `id` and its dependencies are complete, requesting what is not.
    fn check_load(&self, id: &CoId) -> Result<bool> {
        let mut inner = self.lock();
        let NodeInner { registry, sync, .. } = &mut *inner;
        let (held, missing) = registry.dependency_closure(id);
        let mut done = true;
        for covalue in missing {
            sync.request_load(registry, covalue);
            if sync.is_unavailable(&covalue) {
                return Err(NodeError::Unavailable(*id));
            }
            done = false;
        }
        if held.iter().any(|covalue| sync.is_loading(covalue)) {
            done = false;
        }
        Ok(done)
    }

    /// Load `id`, then every CoValue its content references, transitively.
    pub async fn load_deep(&self, id: &CoId) -> Result<()> {
        let mut visited = BTreeSet::new();
        let mut queue = vec![*id];
        while let Some(next) = queue.pop() {
            if !visited.insert(next) {
                continue;
            }
            self.load(&next).await?;
            let references = self.content(&next)?.referenced_ids();
            queue.extend(references.into_iter().filter(|r| !visited.contains(r)));
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Peers
    // ─────────────────────────────────────────────────────────────────────

    /// Attach a peer. Server and storage peers are sent a `load` for every
    /// CoValue this node holds.
    pub fn add_peer(&self, peer: Peer) {
        let _closed = self.attach(peer);
    }

    /// Attach a peer; the receiver fires when its connection is gone.
    fn attach(&self, peer: Peer) -> oneshot::Receiver<()> {
        let Peer {
            id,
            role,
            priority,
            crash_on_close,
            mut incoming,
            outgoing,
        } = peer;
        let queue = Arc::new(PriorityBasedMessageQueue::new());
        tokio::spawn(run_dispatcher(queue.clone(), outgoing));
        {
            let mut inner = self.lock();
            let NodeInner { registry, sync, .. } = &mut *inner;
            let state = PeerState::new(id.clone(), role, priority, crash_on_close, queue.clone());
            sync.add_peer(registry, state);
        }
        self.shared.progress.notify_waiters();

        let (closed_tx, closed_rx) = oneshot::channel();
        let weak = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            let reason = loop {
                let event = incoming.recv().await;
                let Some(node) = upgrade(&weak) else {
                    return;
                };
                match event {
                    Some(PeerEvent::Message(message)) => node.receive(&id, message),
                    Some(PeerEvent::Disconnected) | None => break "disconnected",
                    Some(PeerEvent::PingTimeout) => break "ping timeout",
                }
            };
            if let Some(node) = upgrade(&weak) {
                node.peer_closed(&id, &queue, reason);
            }
            let _ = closed_tx.send(());
        });
        closed_rx
    }

    fn receive(&self, peer: &PeerId, message: SyncMessage) {
        let changed = {
            let mut inner = self.lock();
            let NodeInner { registry, sync, .. } = &mut *inner;
            sync.handle(registry, self.shared.crypto.as_ref(), peer, message)
        };
        self.announce(changed);
    }

    fn peer_closed(&self, peer: &PeerId, queue: &Arc<PriorityBasedMessageQueue>, reason: &str) {
        {
            let mut inner = self.lock();
            let NodeInner {
                registry,
                sync,
                failed,
            } = &mut *inner;
            if sync.remove_peer(registry, peer, queue) {
                *failed = true;
                error!(peer = %peer, reason, "lost a crash-on-close peer; local writes disabled");
            } else {
                debug!(peer = %peer, reason, "peer closed");
            }
        }
        self.shared.progress.notify_waiters();
    }

    /// Keep a connection to an upstream peer, reconnecting with backoff.
    ///
    /// The task ends when the node is dropped or the reconnect policy gives up.
    pub fn connect_upstream(&self, connector: Arc<dyn PeerConnector>) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.shared);
        let policy = self.shared.config.sync.reconnect.clone();
        tokio::spawn(async move {
            let mut attempt = 0u32;
            loop {
                match connector.connect().await {
                    Ok(peer) => {
                        attempt = 0;
                        let peer_id = peer.id.clone();
                        let closed = match upgrade(&weak) {
                            Some(node) => node.attach(peer),
                            None => return,
                        };
                        let _ = closed.await;
                        info!(peer = %peer_id, "upstream connection closed; reconnecting");
                        tokio::time::sleep(policy.delay_for(0)).await;
                    }
                    Err(e) => {
                        if !policy.should_retry(attempt) {
                            warn!(attempt, error = %e, "giving up on upstream");
                            return;
                        }
                        let delay = policy.delay_for(attempt);
                        warn!(attempt, ?delay, error = %e, "connect failed");
                        attempt += 1;
                        tokio::time::sleep(delay).await;
                    }
                }
                if weak.strong_count() == 0 {
                    return;
                }
            }
        })
    }

    /// Ids of the attached peers.
    pub fn peers(&self) -> Vec<PeerId> {
        self.lock().sync.peer_ids()
    }

    /// Message counters of one peer connection.
    pub fn peer_stats(&self, peer: &PeerId) -> Option<PeerStats> {
        self.lock().sync.peer_stats(peer)
    }
}

fn upgrade(weak: &Weak<Shared>) -> Option<LocalNode> {
    weak.upgrade().map(|shared| LocalNode { shared })
}
