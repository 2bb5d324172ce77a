use std::fmt;
use std::str::FromStr;

use chrono::Utc;

use crate::db::PortalRecord;
use crate::error::BridgeError;

/// Identifies one bridged conversation. Direct and group chats are shared by every Matrix
/// participant, so their receiver is empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortalKey {
    pub id: String,
    pub receiver: String,
}

impl PortalKey {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            receiver: String::new(),
        }
    }

    pub fn with_receiver(id: impl Into<String>, receiver: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            receiver: receiver.into(),
        }
    }
}

impl fmt::Display for PortalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.receiver.is_empty() {
            f.write_str(&self.id)
        } else {
            write!(f, "{}/{}", self.id, self.receiver)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversationKind {
    Open,
    Private,
    Direct,
    Group,
    Team,
}

impl ConversationKind {
    /// Maps a Mattermost channel type letter.
    pub fn from_channel_type(channel_type: &str) -> Option<Self> {
        match channel_type {
            "O" => Some(Self::Open),
            "P" => Some(Self::Private),
            "D" => Some(Self::Direct),
            "G" => Some(Self::Group),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Private => "private",
            Self::Direct => "direct",
            Self::Group => "group",
            Self::Team => "team",
        }
    }

    pub fn is_direct_like(&self) -> bool {
        matches!(self, Self::Direct | Self::Group)
    }
}

impl fmt::Display for ConversationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversationKind {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "private" => Ok(Self::Private),
            "direct" => Ok(Self::Direct),
            "group" => Ok(Self::Group),
            "team" => Ok(Self::Team),
            other => Err(BridgeError::Conversion(format!(
                "unknown conversation kind {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMember {
    pub mm_user_id: String,
    /// Set when the member is a ghost of a Matrix user.
    pub matrix_user_id: Option<String>,
}

/// Everything needed to create or update the Matrix room of a portal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatInfo {
    pub name: Option<String>,
    pub topic: Option<String>,
    pub kind: ConversationKind,
    pub parent: Option<PortalKey>,
    pub members: Vec<ChatMember>,
}

impl ChatInfo {
    pub fn new(kind: ConversationKind) -> Self {
        Self {
            name: None,
            topic: None,
            kind,
            parent: None,
            members: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Portal {
    pub key: PortalKey,
    pub kind: ConversationKind,
    pub mxid: Option<String>,
    pub parent: Option<PortalKey>,
    pub name: Option<String>,
    pub topic: Option<String>,
    pub relay_login_id: Option<String>,
}

impl Portal {
    pub fn new(key: PortalKey, kind: ConversationKind) -> Self {
        Self {
            key,
            kind,
            mxid: None,
            parent: None,
            name: None,
            topic: None,
            relay_login_id: None,
        }
    }

    pub fn apply_info(&mut self, info: &ChatInfo) {
        if info.name.is_some() {
            self.name = info.name.clone();
        }
        if info.topic.is_some() {
            self.topic = info.topic.clone();
        }
        if info.parent.is_some() {
            self.parent = info.parent.clone();
        }
    }

    pub fn to_record(&self) -> PortalRecord {
        let now = Utc::now();
        PortalRecord {
            id: 0,
            conversation_id: self.key.id.clone(),
            receiver: self.key.receiver.clone(),
            kind: self.kind.as_str().to_string(),
            matrix_room_id: self.mxid.clone(),
            parent_id: self.parent.as_ref().map(|p| p.id.clone()),
            name: self.name.clone(),
            topic: self.topic.clone(),
            relay_login_id: self.relay_login_id.clone(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl TryFrom<PortalRecord> for Portal {
    type Error = BridgeError;

    fn try_from(record: PortalRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            kind: record.kind.parse()?,
            key: PortalKey::with_receiver(record.conversation_id, record.receiver),
            mxid: record.matrix_room_id,
            parent: record.parent_id.map(PortalKey::new),
            name: record.name,
            topic: record.topic,
            relay_login_id: record.relay_login_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::{ConversationKind, Portal, PortalKey};

    #[test_case("O", Some(ConversationKind::Open))]
    #[test_case("P", Some(ConversationKind::Private))]
    #[test_case("D", Some(ConversationKind::Direct))]
    #[test_case("G", Some(ConversationKind::Group))]
    #[test_case("X", None)]
    fn channel_types_map_to_kinds(channel_type: &str, expected: Option<ConversationKind>) {
        assert_eq!(ConversationKind::from_channel_type(channel_type), expected);
    }

    #[test]
    fn record_conversion_keeps_key_and_kind() {
        let mut portal = Portal::new(PortalKey::new("chan1"), ConversationKind::Private);
        portal.parent = Some(PortalKey::new("team1"));
        portal.mxid = Some("!room:example.org".to_string());

        let back = Portal::try_from(portal.to_record()).expect("valid record");
        assert_eq!(back, portal);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!("channel".parse::<ConversationKind>().is_err());
    }
}
