//! Sync protocol message types.
//!
//! Four messages are exchanged per CoValue. Their JSON shape (an `action`
//! tag plus camelCase fields) is the compatibility contract with other peers.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

use covalent_core::{
    CoId, CoValueHeader, CoValueType, ContentPiece, KnownState, Ruleset, SessionId,
    SessionNewContent,
};

/// Scheduling priority of an outgoing message.
///
/// On the wire: `0` (high), `3` (medium), `6` (low).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn wire_value(self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Medium => 3,
            Priority::Low => 6,
        }
    }

    /// Parse a wire value; values in between round to the nearer lower bucket.
    pub fn from_wire(value: u8) -> Self {
        match value {
            0..=2 => Priority::High,
            3..=5 => Priority::Medium,
            _ => Priority::Low,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }

    /// Priority of content for a CoValue with this header.
    ///
    /// Accounts and groups go first because everything else depends on them;
    /// streams are typically bulky and go last.
    pub fn for_header(header: &CoValueHeader) -> Self {
        if matches!(header.ruleset, Ruleset::Group { .. }) {
            Priority::High
        } else if header.kind == CoValueType::Costream {
            Priority::Low
        } else {
            Priority::Medium
        }
    }
}

impl Serialize for Priority {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.wire_value())
    }
}

impl<'de> Deserialize<'de> for Priority {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Priority::from_wire(u8::deserialize(deserializer)?))
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// A `known` message: our state, optionally correcting the peer's view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownMessage {
    #[serde(flatten)]
    pub known: KnownState,
    #[serde(rename = "isCorrection", default, skip_serializing_if = "is_false")]
    pub is_correction: bool,
}

/// A `content` message: new sessions content, optionally with the header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentMessage {
    pub id: CoId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<CoValueHeader>,
    pub new: BTreeMap<SessionId, SessionNewContent>,
    pub priority: Priority,
}

impl ContentMessage {
    pub fn from_piece(piece: ContentPiece, priority: Priority) -> Self {
        Self {
            id: piece.id,
            header: piece.header,
            new: piece.new,
            priority,
        }
    }

    /// Transactions carried, summed over sessions.
    pub fn transaction_count(&self) -> usize {
        self.new.values().map(|c| c.new_transactions.len()).sum()
    }
}

/// A `done` message: the sender has nothing more for this CoValue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoneMessage {
    pub id: CoId,
}

/// Sync protocol messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum SyncMessage {
    /// Ask for a CoValue, telling the peer what we already hold.
    Load(KnownState),

    /// Tell the peer what we hold.
    Known(KnownMessage),

    /// Send new content.
    Content(ContentMessage),

    /// Nothing more to send for this CoValue.
    Done(DoneMessage),
}

impl SyncMessage {
    pub fn known(known: KnownState) -> Self {
        SyncMessage::Known(KnownMessage {
            known,
            is_correction: false,
        })
    }

    pub fn correction(known: KnownState) -> Self {
        SyncMessage::Known(KnownMessage {
            known,
            is_correction: true,
        })
    }

    /// The CoValue this message is about.
    pub fn id(&self) -> &CoId {
        match self {
            SyncMessage::Load(known) => &known.id,
            SyncMessage::Known(msg) => &msg.known.id,
            SyncMessage::Content(msg) => &msg.id,
            SyncMessage::Done(msg) => &msg.id,
        }
    }

    /// Scheduling priority: control messages always go first.
    pub fn priority(&self) -> Priority {
        match self {
            SyncMessage::Content(msg) => msg.priority,
            _ => Priority::High,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            SyncMessage::Load(_) => "load",
            SyncMessage::Known(_) => "known",
            SyncMessage::Content(_) => "content",
            SyncMessage::Done(_) => "done",
        }
    }
}
