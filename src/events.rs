use chrono::{DateTime, TimeZone, Utc};

use crate::mattermost::models::Post;
use crate::portal::{ChatInfo, PortalKey};

#[derive(Debug, Clone, PartialEq)]
pub struct EventMeta {
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_username: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(conversation_id: impl Into<String>, sender_id: impl Into<String>, millis: i64) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            sender_id: sender_id.into(),
            sender_username: None,
            timestamp: millis_to_datetime(millis),
        }
    }
}

/// A Mattermost-side change normalized for the runtime's per-portal queue.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    MessagePosted { meta: EventMeta, post: Post },
    MessageEdited { meta: EventMeta, post: Post },
    MessageRemoved { meta: EventMeta, post_id: String },
    ReactionAdded { meta: EventMeta, post_id: String, emoji_name: String },
    ReactionRemoved { meta: EventMeta, post_id: String, emoji_name: String },
    ChatInfoChanged { meta: EventMeta, info: ChatInfo },
}

impl RemoteEvent {
    pub fn meta(&self) -> &EventMeta {
        match self {
            Self::MessagePosted { meta, .. }
            | Self::MessageEdited { meta, .. }
            | Self::MessageRemoved { meta, .. }
            | Self::ReactionAdded { meta, .. }
            | Self::ReactionRemoved { meta, .. }
            | Self::ChatInfoChanged { meta, .. } => meta,
        }
    }

    pub fn portal_key(&self) -> PortalKey {
        PortalKey::new(self.meta().conversation_id.clone())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::MessagePosted { .. } => "message_posted",
            Self::MessageEdited { .. } => "message_edited",
            Self::MessageRemoved { .. } => "message_removed",
            Self::ReactionAdded { .. } => "reaction_added",
            Self::ReactionRemoved { .. } => "reaction_removed",
            Self::ChatInfoChanged { .. } => "chat_info_changed",
        }
    }

    /// Idempotency key derived only from source-assigned IDs, so a live delivery and a later
    /// backfill of the same item collide. Reactions have none: the same emoji can be added and
    /// removed repeatedly, and the reaction mappings already make each toggle idempotent.
    pub fn dedup_key(&self) -> Option<String> {
        match self {
            Self::MessagePosted { post, .. } => Some(format!("post:{}", post.id)),
            Self::MessageEdited { post, .. } => Some(format!("edit:{}:{}", post.id, post.edit_at)),
            Self::MessageRemoved { post_id, .. } => Some(format!("delete:{post_id}")),
            Self::ReactionAdded { .. } | Self::ReactionRemoved { .. } => None,
            Self::ChatInfoChanged { .. } => None,
        }
    }
}

pub fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(Utc::now)
}
