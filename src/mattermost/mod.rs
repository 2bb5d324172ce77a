use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub mod client;
pub mod models;
#[cfg(test)]
pub mod testing;
pub mod websocket;

pub use self::client::{HttpClientFactory, MattermostClient};
use self::models::{
    Channel, ChannelMember, FileInfo, NewChannel, NewPost, NewUser, Post, PostList, Reaction,
    Team, User, UserAccessToken, UserPatch,
};

pub type MmResult<T> = Result<T, MattermostError>;

#[derive(Debug, Clone, Error)]
pub enum MattermostError {
    #[error("mattermost returned {status} ({id}): {message}")]
    Http {
        status: u16,
        id: String,
        message: String,
    },
    #[error("mattermost transport error: {0}")]
    Transport(String),
    #[error("failed to decode mattermost response: {0}")]
    Decode(String),
}

impl MattermostError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// The server refused a create because the entity already exists.
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Http { status, id, .. } => {
                *status == 409 || (*status == 400 && id.contains("exists"))
            }
            _ => false,
        }
    }

    pub fn is_already_member(&self) -> bool {
        match self {
            Self::Http { id, .. } => self.is_conflict() || id.contains("already"),
            _ => false,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self.status(), Some(401 | 403))
    }

    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            Self::Decode(_) => false,
        }
    }
}

/// The subset of the Mattermost REST API (v4) the bridge talks to.
#[async_trait]
pub trait MattermostApi: Send + Sync {
    async fn get_me(&self) -> MmResult<User>;
    async fn get_user(&self, user_id: &str) -> MmResult<User>;
    async fn get_user_by_username(&self, username: &str) -> MmResult<User>;
    async fn get_user_by_email(&self, email: &str) -> MmResult<User>;
    async fn get_users(&self, page: u32, per_page: u32) -> MmResult<Vec<User>>;
    async fn create_user(&self, user: &NewUser) -> MmResult<User>;
    async fn patch_user(&self, user_id: &str, patch: &UserPatch) -> MmResult<User>;
    async fn set_profile_image(&self, user_id: &str, data: Vec<u8>) -> MmResult<()>;
    async fn get_profile_image(&self, user_id: &str) -> MmResult<Vec<u8>>;
    async fn create_user_access_token(
        &self,
        user_id: &str,
        description: &str,
    ) -> MmResult<UserAccessToken>;

    async fn get_all_teams(&self, page: u32, per_page: u32) -> MmResult<Vec<Team>>;
    async fn get_team(&self, team_id: &str) -> MmResult<Team>;
    async fn get_teams_for_user(&self, user_id: &str) -> MmResult<Vec<Team>>;

    async fn get_public_channels(
        &self,
        team_id: &str,
        page: u32,
        per_page: u32,
    ) -> MmResult<Vec<Channel>>;
    async fn get_private_channels(
        &self,
        team_id: &str,
        page: u32,
        per_page: u32,
    ) -> MmResult<Vec<Channel>>;
    async fn get_channel(&self, channel_id: &str) -> MmResult<Channel>;
    async fn get_channel_by_name(&self, team_id: &str, name: &str) -> MmResult<Channel>;
    async fn create_channel(&self, channel: &NewChannel) -> MmResult<Channel>;
    async fn get_channel_members(
        &self,
        channel_id: &str,
        page: u32,
        per_page: u32,
    ) -> MmResult<Vec<ChannelMember>>;
    async fn add_channel_member(&self, channel_id: &str, user_id: &str) -> MmResult<()>;
    async fn create_direct_channel(&self, user_a: &str, user_b: &str) -> MmResult<Channel>;

    async fn create_post(&self, post: &NewPost) -> MmResult<Post>;
    async fn get_post(&self, post_id: &str) -> MmResult<Post>;
    async fn update_post(&self, post_id: &str, message: &str) -> MmResult<Post>;
    async fn delete_post(&self, post_id: &str) -> MmResult<()>;
    async fn get_posts_for_channel(
        &self,
        channel_id: &str,
        page: u32,
        per_page: u32,
    ) -> MmResult<PostList>;
    async fn get_posts_before(
        &self,
        channel_id: &str,
        post_id: &str,
        per_page: u32,
    ) -> MmResult<PostList>;
    async fn get_posts_after(
        &self,
        channel_id: &str,
        post_id: &str,
        per_page: u32,
    ) -> MmResult<PostList>;

    async fn save_reaction(&self, reaction: &Reaction) -> MmResult<Reaction>;
    async fn delete_reaction(&self, user_id: &str, post_id: &str, emoji_name: &str)
    -> MmResult<()>;
    async fn get_reactions(&self, post_id: &str) -> MmResult<Vec<Reaction>>;

    async fn get_file_info(&self, file_id: &str) -> MmResult<FileInfo>;
    async fn get_file(&self, file_id: &str) -> MmResult<Vec<u8>>;
    async fn upload_file(
        &self,
        channel_id: &str,
        filename: &str,
        data: Vec<u8>,
    ) -> MmResult<FileInfo>;
}

/// Hands out the admin client and per-identity clients backed by personal access tokens.
pub trait ClientFactory: Send + Sync {
    fn admin(&self) -> Arc<dyn MattermostApi>;
    fn with_token(&self, token: &str) -> MmResult<Arc<dyn MattermostApi>>;
}
