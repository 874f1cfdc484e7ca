//! Roles a member can hold in a group.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::PermsError;

/// A member's role. Ordering for access checks: admin > writer > reader > revoked.
///
/// Invite roles belong to invite agents: they grant no access to content,
/// only the right to admit accounts up to the corresponding level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    Admin,
    Writer,
    Reader,
    Revoked,
    AdminInvite,
    WriterInvite,
    ReaderInvite,
}

impl Role {
    /// Access level used when comparing roles.
    pub fn level(self) -> u8 {
        match self {
            Role::Admin => 3,
            Role::Writer => 2,
            Role::Reader => 1,
            Role::Revoked | Role::AdminInvite | Role::WriterInvite | Role::ReaderInvite => 0,
        }
    }

    pub fn can_write(self) -> bool {
        self.level() >= Role::Writer.level()
    }

    pub fn can_read(self) -> bool {
        self.level() >= Role::Reader.level()
    }

    pub fn is_admin(self) -> bool {
        self == Role::Admin
    }

    pub fn is_invite(self) -> bool {
        matches!(self, Role::AdminInvite | Role::WriterInvite | Role::ReaderInvite)
    }

    /// The highest role an invite of this kind may hand out.
    pub fn invite_grant(self) -> Option<Role> {
        match self {
            Role::AdminInvite => Some(Role::Admin),
            Role::WriterInvite => Some(Role::Writer),
            Role::ReaderInvite => Some(Role::Reader),
            _ => None,
        }
    }

    /// The invite role that admits members as `self`.
    pub fn as_invite(self) -> Option<Role> {
        match self {
            Role::Admin => Some(Role::AdminInvite),
            Role::Writer => Some(Role::WriterInvite),
            Role::Reader => Some(Role::ReaderInvite),
            _ => None,
        }
    }

    /// Whether the holder should receive read keys on rotation.
    pub fn receives_keys(self) -> bool {
        self.can_read() || self.is_invite()
    }

    /// The stronger of two optional roles.
    pub fn max(a: Option<Role>, b: Option<Role>) -> Option<Role> {
        match (a, b) {
            (Some(a), Some(b)) => Some(if b.level() > a.level() { b } else { a }),
            (a, None) => a,
            (None, b) => b,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Writer => "writer",
            Role::Reader => "reader",
            Role::Revoked => "revoked",
            Role::AdminInvite => "adminInvite",
            Role::WriterInvite => "writerInvite",
            Role::ReaderInvite => "readerInvite",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = PermsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "writer" => Ok(Role::Writer),
            "reader" => Ok(Role::Reader),
            "revoked" => Ok(Role::Revoked),
            "adminInvite" => Ok(Role::AdminInvite),
            "writerInvite" => Ok(Role::WriterInvite),
            "readerInvite" => Ok(Role::ReaderInvite),
            other => Err(PermsError::InvalidRole(other.to_string())),
        }
    }
}
