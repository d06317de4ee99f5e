//! Structural addresses used across the protocol: phone-based JIDs, group JIDs,
//! and the opaque LID address space.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::JidError;

pub const SERVER_DEFAULT: &str = "s.whatsapp.net";
pub const SERVER_GROUP: &str = "g.us";
pub const SERVER_BROADCAST: &str = "broadcast";
pub const SERVER_NEWSLETTER: &str = "newsletter";
pub const SERVER_LID: &str = "lid";
pub const SERVER_CALL: &str = "call";

/// A structural WhatsApp address: `user[_agent][.device]@server`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Jid {
    pub user: String,
    pub agent: u8,
    pub device: u16,
    pub server: String,
    pub integrator: Option<u16>,
}

impl Jid {
    pub fn new(user: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            agent: 0,
            device: 0,
            server: server.into(),
            integrator: None,
        }
    }

    pub fn with_device(mut self, device: u16) -> Self {
        self.device = device;
        self
    }

    pub fn with_agent(mut self, agent: u8) -> Self {
        self.agent = agent;
        self
    }

    /// Projects to the "user JID" form: device and agent zeroed out.
    pub fn to_user_jid(&self) -> Jid {
        Jid {
            user: self.user.clone(),
            agent: 0,
            device: 0,
            server: self.server.clone(),
            integrator: self.integrator,
        }
    }

    pub fn is_group(&self) -> bool {
        self.server == SERVER_GROUP
    }

    pub fn is_broadcast(&self) -> bool {
        self.server == SERVER_BROADCAST
    }

    pub fn is_lid(&self) -> bool {
        self.server == SERVER_LID
    }

    /// Parses the canonical text form `user[_agent][.device]@server`.
    pub fn parse(input: &str) -> Result<Self, JidError> {
        let (left, server) = input
            .split_once('@')
            .ok_or_else(|| JidError::Malformed(input.to_owned()))?;
        if server.is_empty() {
            return Err(JidError::Malformed(input.to_owned()));
        }

        let (user_and_agent, device) = match left.split_once('.') {
            Some((user_part, device_part)) => {
                let device: u16 = device_part
                    .parse()
                    .map_err(|_| JidError::Malformed(input.to_owned()))?;
                (user_part, device)
            }
            None => (left, 0),
        };

        let (user, agent) = match user_and_agent.split_once('_') {
            Some((user_part, agent_part)) => {
                let agent: u8 = agent_part
                    .parse()
                    .map_err(|_| JidError::Malformed(input.to_owned()))?;
                (user_part, agent)
            }
            None => (user_and_agent, 0),
        };

        if user.is_empty() {
            return Err(JidError::Malformed(input.to_owned()));
        }

        Ok(Jid {
            user: user.to_owned(),
            agent,
            device,
            server: server.to_owned(),
            integrator: None,
        })
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user)?;
        if self.agent != 0 {
            write!(f, "_{}", self.agent)?;
        }
        if self.device != 0 {
            write!(f, ".{}", self.device)?;
        }
        write!(f, "@{}", self.server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_plain_user_jid() {
        let jid = Jid::parse("5511999999999@s.whatsapp.net").unwrap();
        assert_eq!(jid.user, "5511999999999");
        assert_eq!(jid.device, 0);
        assert_eq!(jid.server, SERVER_DEFAULT);
        assert_eq!(jid.to_string(), "5511999999999@s.whatsapp.net");
    }

    #[test]
    fn round_trips_device_and_agent() {
        let jid = Jid::parse("5511999999999_2.5@s.whatsapp.net").unwrap();
        assert_eq!(jid.agent, 2);
        assert_eq!(jid.device, 5);
        assert_eq!(jid.to_string(), "5511999999999_2.5@s.whatsapp.net");
    }

    #[test]
    fn to_user_jid_drops_device() {
        let jid = Jid::parse("123.4@s.whatsapp.net").unwrap();
        let user_jid = jid.to_user_jid();
        assert_eq!(user_jid.device, 0);
        assert_eq!(user_jid.user, "123");
    }

    #[test]
    fn rejects_missing_server() {
        assert!(Jid::parse("123").is_err());
    }

    #[test]
    fn group_and_lid_detection() {
        let group = Jid::new("12345-67890", SERVER_GROUP);
        assert!(group.is_group());
        let lid = Jid::new("987", SERVER_LID);
        assert!(lid.is_lid());
    }
}
