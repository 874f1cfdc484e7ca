//! Strong identifier types for Covalent.
//!
//! All identifiers are newtypes with a prefixed string form (`co_z…`,
//! `sealer_z…/signer_z…`, `…_session_z…`) that is also their wire encoding.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;
use crate::macros::parse_hex_body;

/// A 32-byte CoValue identifier: the BLAKE3 hash of the canonical header.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoId(pub [u8; 32]);

impl CoId {
    const PREFIX: &'static str = "co_z";

    /// Create a new CoId from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string (without prefix).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for CoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CoId({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for CoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::PREFIX, self.to_hex())
    }
}

impl FromStr for CoId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s
            .strip_prefix(Self::PREFIX)
            .ok_or_else(|| CoreError::invalid_id(s, "missing co_z prefix"))?;
        Ok(Self(parse_hex_body(s, body)?))
    }
}

string_serde!(CoId);

/// Ed25519 verifying key of an agent.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SignerId(pub [u8; 32]);

impl SignerId {
    const PREFIX: &'static str = "signer_z";

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SignerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignerId({})", &hex::encode(self.0)[..16])
    }
}

impl fmt::Display for SignerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::PREFIX, hex::encode(self.0))
    }
}

impl FromStr for SignerId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s
            .strip_prefix(Self::PREFIX)
            .ok_or_else(|| CoreError::invalid_id(s, "missing signer_z prefix"))?;
        Ok(Self(parse_hex_body(s, body)?))
    }
}

string_serde!(SignerId);

/// X25519 public key of an agent.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SealerId(pub [u8; 32]);

impl SealerId {
    const PREFIX: &'static str = "sealer_z";

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SealerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SealerId({})", &hex::encode(self.0)[..16])
    }
}

impl fmt::Display for SealerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::PREFIX, hex::encode(self.0))
    }
}

impl FromStr for SealerId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s
            .strip_prefix(Self::PREFIX)
            .ok_or_else(|| CoreError::invalid_id(s, "missing sealer_z prefix"))?;
        Ok(Self(parse_hex_body(s, body)?))
    }
}

string_serde!(SealerId);

/// A cryptographic identity: a sealer (key agreement) plus a signer.
///
/// String form: `sealer_z<hex>/signer_z<hex>`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AgentId {
    pub sealer: SealerId,
    pub signer: SignerId,
}

impl fmt::Debug for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgentId({})", &hex::encode(self.signer.0)[..16])
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.sealer, self.signer)
    }
}

impl FromStr for AgentId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (sealer, signer) = s
            .split_once('/')
            .ok_or_else(|| CoreError::invalid_id(s, "agent id needs sealer/signer"))?;
        Ok(Self {
            sealer: sealer.parse()?,
            signer: signer.parse()?,
        })
    }
}

string_serde!(AgentId);

/// The author of a session: an account (by its CoId) or a bare agent.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AccountOrAgent {
    Account(CoId),
    Agent(AgentId),
}

impl AccountOrAgent {
    pub fn as_account(&self) -> Option<&CoId> {
        match self {
            AccountOrAgent::Account(id) => Some(id),
            AccountOrAgent::Agent(_) => None,
        }
    }

    pub fn as_agent(&self) -> Option<&AgentId> {
        match self {
            AccountOrAgent::Agent(agent) => Some(agent),
            AccountOrAgent::Account(_) => None,
        }
    }
}

impl fmt::Debug for AccountOrAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountOrAgent::Account(id) => write!(f, "Account({:?})", id),
            AccountOrAgent::Agent(agent) => write!(f, "{:?}", agent),
        }
    }
}

impl fmt::Display for AccountOrAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountOrAgent::Account(id) => write!(f, "{}", id),
            AccountOrAgent::Agent(agent) => write!(f, "{}", agent),
        }
    }
}

impl FromStr for AccountOrAgent {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with(CoId::PREFIX) {
            Ok(AccountOrAgent::Account(s.parse()?))
        } else {
            Ok(AccountOrAgent::Agent(s.parse()?))
        }
    }
}

impl From<CoId> for AccountOrAgent {
    fn from(id: CoId) -> Self {
        AccountOrAgent::Account(id)
    }
}

impl From<AgentId> for AccountOrAgent {
    fn from(agent: AgentId) -> Self {
        AccountOrAgent::Agent(agent)
    }
}

string_serde!(AccountOrAgent);

/// One device's append-only log within a CoValue.
///
/// String form: `<author>_session_z<hex>`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId {
    pub author: AccountOrAgent,
    pub suffix: [u8; 8],
}

impl SessionId {
    const SEPARATOR: &'static str = "_session_z";

    /// A fresh session for `author` with a random device suffix.
    pub fn new_random(author: AccountOrAgent) -> Self {
        let mut suffix = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut suffix);
        Self { author, suffix }
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({:?}, {})", self.author, hex::encode(self.suffix))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.author, Self::SEPARATOR, hex::encode(self.suffix))
    }
}

impl FromStr for SessionId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (author, suffix) = s
            .rsplit_once(Self::SEPARATOR)
            .ok_or_else(|| CoreError::invalid_id(s, "missing _session_z"))?;
        Ok(Self {
            author: author.parse()?,
            suffix: parse_hex_body(s, suffix)?,
        })
    }
}

string_serde!(SessionId);

/// Identifier of a symmetric read key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(pub [u8; 16]);

impl KeyId {
    const PREFIX: &'static str = "key_z";

    pub fn new_random() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Whether a string looks like a key id (used when classifying group keys).
    pub fn is_key_id(s: &str) -> bool {
        s.starts_with(Self::PREFIX)
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({})", hex::encode(self.0))
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::PREFIX, hex::encode(self.0))
    }
}

impl FromStr for KeyId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s
            .strip_prefix(Self::PREFIX)
            .ok_or_else(|| CoreError::invalid_id(s, "missing key_z prefix"))?;
        Ok(Self(parse_hex_body(s, body)?))
    }
}

string_serde!(KeyId);

/// Position of a transaction: (session, index within that session).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId {
    #[serde(rename = "sessionID")]
    pub session: SessionId,
    #[serde(rename = "txIndex")]
    pub tx_index: u32,
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.session, self.tx_index)
    }
}

/// Position of a single change: a transaction plus the change index within it.
///
/// List elements and text graphemes are identified by the `OpId` of the
/// change that inserted them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId {
    #[serde(rename = "sessionID")]
    pub session: SessionId,
    #[serde(rename = "txIndex")]
    pub tx_index: u32,
    #[serde(rename = "changeIdx")]
    pub change_idx: u32,
}

impl OpId {
    pub fn new(tx: TransactionId, change_idx: u32) -> Self {
        Self {
            session: tx.session,
            tx_index: tx.tx_index,
            change_idx,
        }
    }

    pub fn tx_id(&self) -> TransactionId {
        TransactionId {
            session: self.session,
            tx_index: self.tx_index,
        }
    }
}

/// A key in a group's role table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Member {
    Account(CoId),
    Agent(AgentId),
    Everyone,
}

impl Member {
    const EVERYONE: &'static str = "everyone";

    /// Parse a group map key, returning `None` for keys that are not members.
    pub fn parse_key(key: &str) -> Option<Self> {
        key.parse().ok()
    }
}

impl fmt::Debug for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Member::Account(id) => write!(f, "Member({:?})", id),
            Member::Agent(agent) => write!(f, "Member({:?})", agent),
            Member::Everyone => write!(f, "Member(everyone)"),
        }
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Member::Account(id) => write!(f, "{}", id),
            Member::Agent(agent) => write!(f, "{}", agent),
            Member::Everyone => f.write_str(Self::EVERYONE),
        }
    }
}

impl FromStr for Member {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == Self::EVERYONE {
            return Ok(Member::Everyone);
        }
        match s.parse::<AccountOrAgent>()? {
            AccountOrAgent::Account(id) => Ok(Member::Account(id)),
            AccountOrAgent::Agent(agent) => Ok(Member::Agent(agent)),
        }
    }
}

impl From<AccountOrAgent> for Member {
    fn from(author: AccountOrAgent) -> Self {
        match author {
            AccountOrAgent::Account(id) => Member::Account(id),
            AccountOrAgent::Agent(agent) => Member::Agent(agent),
        }
    }
}

string_serde!(Member);

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(byte: u8) -> AgentId {
        AgentId {
            sealer: SealerId([byte; 32]),
            signer: SignerId([byte.wrapping_add(1); 32]),
        }
    }

    #[test]
    fn test_co_id_string_roundtrip() {
        let id = CoId::from_bytes([0x42; 32]);
        let s = id.to_string();
        assert!(s.starts_with("co_z4242"));
        assert_eq!(s.parse::<CoId>().unwrap(), id);
    }

    #[test]
    fn test_co_id_debug_is_short() {
        let id = CoId::from_bytes([0xab; 32]);
        assert_eq!(format!("{:?}", id), "CoId(abababababababab)");
    }

    #[test]
    fn test_co_id_rejects_bad_input() {
        assert!("xx_z00".parse::<CoId>().is_err());
        assert!("co_zzz".parse::<CoId>().is_err());
        assert!("co_z0011".parse::<CoId>().is_err());
    }

    #[test]
    fn test_agent_id_string_form() {
        let a = agent(1);
        let s = a.to_string();
        assert!(s.starts_with("sealer_z0101"));
        assert!(s.contains("/signer_z0202"));
        assert_eq!(s.parse::<AgentId>().unwrap(), a);
    }

    #[test]
    fn test_session_id_with_account_author() {
        let session = SessionId {
            author: AccountOrAgent::Account(CoId([7; 32])),
            suffix: [9; 8],
        };
        let s = session.to_string();
        assert!(s.ends_with("_session_z0909090909090909"));
        assert_eq!(s.parse::<SessionId>().unwrap(), session);
    }

    #[test]
    fn test_session_id_with_agent_author() {
        let session = SessionId::new_random(AccountOrAgent::Agent(agent(3)));
        let parsed: SessionId = session.to_string().parse().unwrap();
        assert_eq!(parsed, session);
        assert!(parsed.author.as_agent().is_some());
    }

    #[test]
    fn test_member_keys() {
        assert_eq!(Member::parse_key("everyone"), Some(Member::Everyone));
        assert_eq!(
            Member::parse_key(&CoId([1; 32]).to_string()),
            Some(Member::Account(CoId([1; 32])))
        );
        assert_eq!(Member::parse_key("readKey"), None);
        assert_eq!(Member::parse_key("parent_co_z00"), None);
    }

    #[test]
    fn test_op_id_json_field_names() {
        let op = OpId {
            session: SessionId {
                author: AccountOrAgent::Account(CoId([1; 32])),
                suffix: [2; 8],
            },
            tx_index: 4,
            change_idx: 1,
        };
        let json = serde_json::to_value(op).unwrap();
        assert_eq!(json["txIndex"], 4);
        assert_eq!(json["changeIdx"], 1);
        assert!(json["sessionID"].as_str().unwrap().contains("_session_z"));
    }

    #[test]
    fn test_key_id_detection() {
        let key = KeyId::new_random();
        assert!(KeyId::is_key_id(&key.to_string()));
        assert!(!KeyId::is_key_id("everyone"));
    }
}
