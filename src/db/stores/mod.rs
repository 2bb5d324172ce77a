use async_trait::async_trait;

use super::DatabaseError;
use super::models::{
    GhostRecord, LoginRecord, MessageMapping, PortalRecord, PuppetRecord, ReactionMapping,
};

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_ghost(&self, matrix_user_id: &str) -> Result<Option<GhostRecord>, DatabaseError>;
    async fn get_ghost_by_mm_id(
        &self,
        mm_user_id: &str,
    ) -> Result<Option<GhostRecord>, DatabaseError>;
    async fn upsert_ghost(&self, ghost: &GhostRecord) -> Result<(), DatabaseError>;
    async fn get_puppet(&self, mm_user_id: &str) -> Result<Option<PuppetRecord>, DatabaseError>;
    async fn get_puppet_by_matrix_id(
        &self,
        matrix_user_id: &str,
    ) -> Result<Option<PuppetRecord>, DatabaseError>;
    async fn upsert_puppet(&self, puppet: &PuppetRecord) -> Result<(), DatabaseError>;
}

#[async_trait]
pub trait RoomStore: Send + Sync {
    async fn get_portal(
        &self,
        conversation_id: &str,
        receiver: &str,
    ) -> Result<Option<PortalRecord>, DatabaseError>;
    async fn get_portal_by_room(&self, room_id: &str)
    -> Result<Option<PortalRecord>, DatabaseError>;
    /// Inserts or updates by `(conversation_id, receiver)`. Changing the kind of an existing
    /// portal is rejected with [`DatabaseError::Conflict`].
    async fn upsert_portal(&self, portal: &PortalRecord) -> Result<(), DatabaseError>;
    async fn list_portals(&self, limit: i64, offset: i64)
    -> Result<Vec<PortalRecord>, DatabaseError>;
    async fn count_portals(&self) -> Result<i64, DatabaseError>;
}

#[async_trait]
pub trait LoginStore: Send + Sync {
    async fn get_login(&self, id: &str) -> Result<Option<LoginRecord>, DatabaseError>;
    async fn list_logins(&self) -> Result<Vec<LoginRecord>, DatabaseError>;
    async fn upsert_login(&self, login: &LoginRecord) -> Result<(), DatabaseError>;
    async fn delete_login(&self, id: &str) -> Result<(), DatabaseError>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// All parts of a post, ordered by part index.
    async fn get_by_mm_post_id(&self, post_id: &str)
    -> Result<Vec<MessageMapping>, DatabaseError>;
    async fn get_by_matrix_event_id(
        &self,
        event_id: &str,
    ) -> Result<Option<MessageMapping>, DatabaseError>;
    async fn upsert_message_mapping(&self, mapping: &MessageMapping) -> Result<(), DatabaseError>;
    async fn delete_by_mm_post_id(&self, post_id: &str) -> Result<(), DatabaseError>;
    async fn get_reaction(
        &self,
        post_id: &str,
        user_id: &str,
        emoji_name: &str,
    ) -> Result<Option<ReactionMapping>, DatabaseError>;
    async fn get_reaction_by_matrix_event_id(
        &self,
        event_id: &str,
    ) -> Result<Option<ReactionMapping>, DatabaseError>;
    async fn upsert_reaction(&self, mapping: &ReactionMapping) -> Result<(), DatabaseError>;
    async fn delete_reaction(
        &self,
        post_id: &str,
        user_id: &str,
        emoji_name: &str,
    ) -> Result<(), DatabaseError>;
}
