use chrono::{DateTime, Utc};

/// A Matrix identity represented on Mattermost. `metadata` holds the versioned JSON document
/// owned by the identity module.
#[derive(Debug, Clone, PartialEq)]
pub struct GhostRecord {
    pub id: i64,
    pub matrix_user_id: String,
    pub mm_username: String,
    pub mm_user_id: Option<String>,
    pub metadata: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A Mattermost account represented on Matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct PuppetRecord {
    pub id: i64,
    pub mm_user_id: String,
    pub matrix_user_id: String,
    pub display_name: Option<String>,
    pub avatar_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PortalRecord {
    pub id: i64,
    pub conversation_id: String,
    pub receiver: String,
    pub kind: String,
    pub matrix_room_id: Option<String>,
    pub parent_id: Option<String>,
    pub name: Option<String>,
    pub topic: Option<String>,
    pub relay_login_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoginRecord {
    pub id: String,
    pub matrix_user_id: String,
    pub metadata: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One Matrix event produced from one part of a Mattermost post.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageMapping {
    pub id: i64,
    pub mm_post_id: String,
    pub part_index: i32,
    pub mm_channel_id: String,
    pub matrix_room_id: String,
    pub matrix_event_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReactionMapping {
    pub id: i64,
    pub mm_post_id: String,
    pub mm_user_id: String,
    pub emoji_name: String,
    pub matrix_room_id: String,
    pub matrix_event_id: String,
    pub created_at: DateTime<Utc>,
}
