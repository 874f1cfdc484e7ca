//! Accounts and the local identity.
//!
//! An account is a group (meta `{"type": "account"}`) whose admin agents act
//! for it. Its map also points at the account's profile and root CoValues.

use covalent_core::{AccountOrAgent, AgentId, AgentSecret, CoId, CryptoProvider};

use crate::group::GroupState;

/// Profile key in an account's map.
pub const PROFILE_KEY: &str = "profile";

/// Root key in an account's map.
pub const ROOT_KEY: &str = "root";

/// Who is acting locally: an agent, optionally on behalf of an account.
#[derive(Debug, Clone)]
pub struct Identity {
    pub account: Option<CoId>,
    pub agent: AgentId,
    pub secret: AgentSecret,
}

impl Identity {
    /// A bare agent identity, as used by invite agents.
    pub fn agent(crypto: &dyn CryptoProvider, secret: AgentSecret) -> Self {
        Self {
            account: None,
            agent: crypto.agent_id(&secret),
            secret,
        }
    }

    /// An agent acting for `account`.
    pub fn account(crypto: &dyn CryptoProvider, account: CoId, secret: AgentSecret) -> Self {
        Self {
            account: Some(account),
            agent: crypto.agent_id(&secret),
            secret,
        }
    }

    /// The author recorded on sessions this identity writes.
    pub fn author(&self) -> AccountOrAgent {
        match self.account {
            Some(account) => AccountOrAgent::Account(account),
            None => AccountOrAgent::Agent(self.agent),
        }
    }
}

/// The account's profile CoValue, if set.
pub fn profile_id(account: &GroupState) -> Option<CoId> {
    account.content().get(PROFILE_KEY)?.as_str()?.parse().ok()
}

/// The account's root CoValue, if set.
pub fn root_id(account: &GroupState) -> Option<CoId> {
    account.content().get(ROOT_KEY)?.as_str()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use covalent_core::NativeCrypto;

    #[test]
    fn test_identity_author() {
        let crypto = NativeCrypto;
        let secret = crypto.new_agent_secret();
        let agent = crypto.agent_id(&secret);

        let bare = Identity::agent(&crypto, secret.clone());
        assert_eq!(bare.author(), AccountOrAgent::Agent(agent));

        let account = Identity::account(&crypto, CoId([4; 32]), secret);
        assert_eq!(account.author(), AccountOrAgent::Account(CoId([4; 32])));
        assert_eq!(account.agent, agent);
    }
}
