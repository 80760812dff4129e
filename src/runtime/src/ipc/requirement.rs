//! Declarative constraints on who may open a session.

use super::value::{EntryKey, IpcValue};
use serde::{Deserialize, Serialize};
use vmbridge_core::error::{BridgeError, Result};

/// Identity of the process on the other end of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub signing_identifier: Option<String>,
    pub team_identifier: Option<String>,
    pub platform_binary: bool,
    pub pid: u32,
}

impl PeerIdentity {
    /// Identity of the calling process; unsigned.
    pub fn current() -> Self {
        Self {
            pid: std::process::id(),
            ..Default::default()
        }
    }

    pub fn with_signing_identifier(mut self, id: impl Into<String>) -> Self {
        self.signing_identifier = Some(id.into());
        self
    }

    pub fn with_team_identifier(mut self, id: impl Into<String>) -> Self {
        self.team_identifier = Some(id.into());
        self
    }

    pub fn with_platform_binary(mut self, platform_binary: bool) -> Self {
        self.platform_binary = platform_binary;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Constraint {
    SigningIdentifier(String),
    TeamIdentifier(String),
    PlatformBinary(bool),
    Pid(u32),
}

impl Constraint {
    fn check(&self, peer: &PeerIdentity) -> std::result::Result<(), String> {
        let ok = match self {
            Constraint::SigningIdentifier(id) => peer.signing_identifier.as_deref() == Some(id),
            Constraint::TeamIdentifier(id) => peer.team_identifier.as_deref() == Some(id),
            Constraint::PlatformBinary(expected) => peer.platform_binary == *expected,
            Constraint::Pid(pid) => peer.pid == *pid,
        };
        if ok {
            Ok(())
        } else {
            Err(format!("peer does not satisfy {self}"))
        }
    }
}

impl std::fmt::Display for Constraint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Constraint::SigningIdentifier(id) => write!(f, "signing-identifier == {id:?}"),
            Constraint::TeamIdentifier(id) => write!(f, "team-identifier == {id:?}"),
            Constraint::PlatformBinary(b) => write!(f, "platform-binary == {b}"),
            Constraint::Pid(pid) => write!(f, "pid == {pid}"),
        }
    }
}

/// All constraints must hold for a peer to be accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerRequirement {
    constraints: Vec<Constraint>,
}

impl PeerRequirement {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signing_identifier(mut self, id: impl Into<String>) -> Self {
        self.constraints.push(Constraint::SigningIdentifier(id.into()));
        self
    }

    pub fn team_identifier(mut self, id: impl Into<String>) -> Self {
        self.constraints.push(Constraint::TeamIdentifier(id.into()));
        self
    }

    pub fn platform_binary(mut self, platform_binary: bool) -> Self {
        self.constraints.push(Constraint::PlatformBinary(platform_binary));
        self
    }

    pub fn pid(mut self, pid: u32) -> Self {
        self.constraints.push(Constraint::Pid(pid));
        self
    }

    /// Build from a key/value dictionary such as
    /// `{"signing-identifier": "com.example.helper", "platform-binary": true}`.
    pub fn from_dictionary(dict: &IpcValue) -> Result<Self> {
        dict.as_dictionary()?;
        let mut requirement = Self::new();
        let mut failure = None;
        dict.apply(|key, value| {
            let EntryKey::Key(key) = key else {
                return false;
            };
            let parsed = match key {
                "signing-identifier" => value
                    .as_str()
                    .map(|id| Constraint::SigningIdentifier(id.to_string())),
                "team-identifier" => value
                    .as_str()
                    .map(|id| Constraint::TeamIdentifier(id.to_string())),
                "platform-binary" => value.as_bool().map(Constraint::PlatformBinary),
                "pid" => value.as_u64().and_then(|pid| {
                    u32::try_from(pid)
                        .map(Constraint::Pid)
                        .map_err(|_| BridgeError::InvalidFormat(format!("pid {pid} out of range")))
                }),
                other => Err(BridgeError::InvalidFormat(format!(
                    "unknown peer requirement key: {other}"
                ))),
            };
            match parsed {
                Ok(constraint) => {
                    requirement.constraints.push(constraint);
                    true
                }
                Err(e) => {
                    failure = Some(e);
                    false
                }
            }
        })?;
        match failure {
            Some(e) => Err(e),
            None => Ok(requirement),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    /// First violated constraint, if any.
    pub fn evaluate(&self, peer: &PeerIdentity) -> std::result::Result<(), String> {
        self.constraints.iter().try_for_each(|c| c.check(peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_constraints_must_hold() {
        let requirement = PeerRequirement::new()
            .signing_identifier("com.example.helper")
            .platform_binary(false);
        let peer = PeerIdentity::current().with_signing_identifier("com.example.helper");
        assert!(requirement.evaluate(&peer).is_ok());

        let wrong = PeerIdentity::current().with_signing_identifier("com.example.other");
        let reason = requirement.evaluate(&wrong).unwrap_err();
        assert!(reason.contains("signing-identifier"));

        let platform = peer.clone().with_platform_binary(true);
        assert!(requirement.evaluate(&platform).is_err());
    }

    #[test]
    fn test_empty_requirement_accepts_anyone() {
        assert!(PeerRequirement::new().is_empty());
        assert!(PeerRequirement::new().evaluate(&PeerIdentity::default()).is_ok());
    }

    #[test]
    fn test_from_dictionary() {
        let mut dict = IpcValue::dictionary();
        dict.insert("team-identifier", "ABCDE12345").unwrap();
        dict.insert("pid", u64::from(std::process::id())).unwrap();
        let requirement = PeerRequirement::from_dictionary(&dict).unwrap();

        let peer = PeerIdentity::current().with_team_identifier("ABCDE12345");
        assert!(requirement.evaluate(&peer).is_ok());
        assert!(requirement
            .evaluate(&PeerIdentity::current().with_team_identifier("OTHER"))
            .is_err());
    }

    #[test]
    fn test_from_dictionary_rejects_bad_entries() {
        let mut unknown = IpcValue::dictionary();
        unknown.insert("entitlement", "x").unwrap();
        assert!(matches!(
            PeerRequirement::from_dictionary(&unknown),
            Err(BridgeError::InvalidFormat(_))
        ));

        let mut mistyped = IpcValue::dictionary();
        mistyped.insert("platform-binary", "yes").unwrap();
        assert!(matches!(
            PeerRequirement::from_dictionary(&mistyped),
            Err(BridgeError::TypeMismatch { .. })
        ));

        assert!(PeerRequirement::from_dictionary(&IpcValue::array()).is_err());
    }
}
