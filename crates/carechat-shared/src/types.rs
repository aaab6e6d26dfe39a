use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque user identifier issued by the external directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Mom,
    Doctor,
    Midwife,
    ServiceProvider,
    Admin,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::Mom,
        Role::Doctor,
        Role::Midwife,
        Role::ServiceProvider,
        Role::Admin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Mom => "mom",
            Role::Doctor => "doctor",
            Role::Midwife => "midwife",
            Role::ServiceProvider => "service_provider",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mom" => Ok(Role::Mom),
            "doctor" => Ok(Role::Doctor),
            "midwife" => Ok(Role::Midwife),
            "service_provider" | "service-provider" => Ok(Role::ServiceProvider),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Identifies a conversation by its unordered participant pair.
///
/// The pair is normalised so that `between(a, b) == between(b, a)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationKey {
    low: UserId,
    high: UserId,
}

impl ConversationKey {
    pub fn between(a: &UserId, b: &UserId) -> Self {
        if a <= b {
            Self {
                low: a.clone(),
                high: b.clone(),
            }
        } else {
            Self {
                low: b.clone(),
                high: a.clone(),
            }
        }
    }

    pub fn participants(&self) -> (&UserId, &UserId) {
        (&self.low, &self.high)
    }

    pub fn contains(&self, user: &UserId) -> bool {
        &self.low == user || &self.high == user
    }

    /// The participant that is not `local`, if `local` takes part at all.
    pub fn counterparty(&self, local: &UserId) -> Option<&UserId> {
        if &self.low == local {
            Some(&self.high)
        } else if &self.high == local {
            Some(&self.low)
        } else {
            None
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.low, self.high)
    }
}

/// Locally generated identity of a message, stable for the optimistic entry's lifetime.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ClientId(pub Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ClientId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Canonical message identifier assigned by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ServerMessageId(pub String);

impl ServerMessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerMessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    File,
    Image,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::File => "file",
            MessageKind::Image => "image",
        }
    }

    pub fn needs_attachment(&self) -> bool {
        !matches!(self, MessageKind::Text)
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MessageKind::Text),
            "file" => Ok(MessageKind::File),
            "image" => Ok(MessageKind::Image),
            other => Err(format!("unknown message kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

/// Bearer credential supplied by the authentication collaborator.
///
/// `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_key_is_unordered() {
        let a = UserId::from("alice");
        let b = UserId::from("bob");
        assert_eq!(ConversationKey::between(&a, &b), ConversationKey::between(&b, &a));
        assert_eq!(ConversationKey::between(&b, &a).to_string(), "alice_bob");
    }

    #[test]
    fn conversation_key_counterparty() {
        let a = UserId::from("alice");
        let b = UserId::from("bob");
        let key = ConversationKey::between(&a, &b);
        assert_eq!(key.counterparty(&a), Some(&b));
        assert_eq!(key.counterparty(&b), Some(&a));
        assert_eq!(key.counterparty(&UserId::from("carol")), None);
    }

    #[test]
    fn role_parses_both_spellings() {
        assert_eq!("service-provider".parse::<Role>().unwrap(), Role::ServiceProvider);
        assert_eq!("Midwife".parse::<Role>().unwrap(), Role::Midwife);
        assert!("nurse".parse::<Role>().is_err());
        assert_eq!(serde_json::to_string(&Role::ServiceProvider).unwrap(), "\"service_provider\"");
    }

    #[test]
    fn credential_debug_is_redacted() {
        let cred = Credential::new("secret-token");
        assert!(!format!("{cred:?}").contains("secret"));
        assert_eq!(cred.authorization_header(), "Bearer secret-token");
    }
}
