use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;
use url::Url;

use super::models::{
    ApiErrorBody, Channel, ChannelMember, FileInfo, FileUploadResponse, NewChannel, NewPost,
    NewUser, Post, PostList, Reaction, Team, User, UserAccessToken, UserPatch,
};
use super::{ClientFactory, MattermostApi, MattermostError, MmResult};

fn transport(err: reqwest::Error) -> MattermostError {
    MattermostError::Transport(err.to_string())
}

/// REST client bound to one access token.
pub struct MattermostClient {
    http: Client,
    api_base: Url,
    token: SecretString,
}

impl MattermostClient {
    pub fn new(http: Client, server_url: &Url, token: &str) -> MmResult<Self> {
        let mut api_base = server_url.clone();
        api_base
            .path_segments_mut()
            .map_err(|_| MattermostError::Transport(format!("{server_url} cannot be a base")))?
            .pop_if_empty()
            .extend(["api", "v4"]);

        Ok(Self {
            http,
            api_base,
            token: SecretString::from(token.to_string()),
        })
    }

    fn endpoint(&self, segments: &[&str], query: &[(&str, String)]) -> MmResult<Url> {
        let mut url = self.api_base.clone();
        url.path_segments_mut()
            .map_err(|_| MattermostError::Transport("invalid api base".to_string()))?
            .extend(segments);
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    fn paging(page: u32, per_page: u32) -> Vec<(&'static str, String)> {
        vec![("page", page.to_string()), ("per_page", per_page.to_string())]
    }

    async fn execute(&self, request: RequestBuilder) -> MmResult<Response> {
        let response = request
            .bearer_auth(self.token.expose_secret())
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.bytes().await.unwrap_or_default();
        let parsed: ApiErrorBody = serde_json::from_slice(&body).unwrap_or_default();
        let message = if parsed.message.is_empty() {
            String::from_utf8_lossy(&body).into_owned()
        } else {
            parsed.message
        };
        Err(MattermostError::Http {
            status: status.as_u16(),
            id: parsed.id,
            message,
        })
    }

    async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder) -> MmResult<T> {
        let response = self.execute(request).await?;
        let body = response.bytes().await.map_err(transport)?;
        serde_json::from_slice(&body).map_err(|e| MattermostError::Decode(e.to_string()))
    }

    async fn fetch_bytes(&self, request: RequestBuilder) -> MmResult<Vec<u8>> {
        let response = self.execute(request).await?;
        Ok(response.bytes().await.map_err(transport)?.to_vec())
    }

    async fn get<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        query: &[(&str, String)],
    ) -> MmResult<T> {
        let url = self.endpoint(segments, query)?;
        debug!(url = %url, "mattermost GET");
        self.fetch(self.http.get(url)).await
    }
}

#[async_trait]
impl MattermostApi for MattermostClient {
    async fn get_me(&self) -> MmResult<User> {
        self.get(&["users", "me"], &[]).await
    }

    async fn get_user(&self, user_id: &str) -> MmResult<User> {
        self.get(&["users", user_id], &[]).await
    }

    async fn get_user_by_username(&self, username: &str) -> MmResult<User> {
        self.get(&["users", "username", username], &[]).await
    }

    async fn get_user_by_email(&self, email: &str) -> MmResult<User> {
        self.get(&["users", "email", email], &[]).await
    }

    async fn get_users(&self, page: u32, per_page: u32) -> MmResult<Vec<User>> {
        self.get(&["users"], &Self::paging(page, per_page)).await
    }

    async fn create_user(&self, user: &NewUser) -> MmResult<User> {
        let url = self.endpoint(&["users"], &[])?;
        self.fetch(self.http.post(url).json(user)).await
    }

    async fn patch_user(&self, user_id: &str, patch: &UserPatch) -> MmResult<User> {
        let url = self.endpoint(&["users", user_id, "patch"], &[])?;
        self.fetch(self.http.put(url).json(patch)).await
    }

    async fn set_profile_image(&self, user_id: &str, data: Vec<u8>) -> MmResult<()> {
        let url = self.endpoint(&["users", user_id, "image"], &[])?;
        let form = Form::new().part("image", Part::bytes(data).file_name("avatar"));
        self.execute(self.http.post(url).multipart(form)).await?;
        Ok(())
    }

    async fn get_profile_image(&self, user_id: &str) -> MmResult<Vec<u8>> {
        let url = self.endpoint(&["users", user_id, "image"], &[])?;
        self.fetch_bytes(self.http.get(url)).await
    }

    async fn create_user_access_token(
        &self,
        user_id: &str,
        description: &str,
    ) -> MmResult<UserAccessToken> {
        let url = self.endpoint(&["users", user_id, "tokens"], &[])?;
        self.fetch(self.http.post(url).json(&json!({ "description": description })))
            .await
    }

    async fn get_all_teams(&self, page: u32, per_page: u32) -> MmResult<Vec<Team>> {
        self.get(&["teams"], &Self::paging(page, per_page)).await
    }

    async fn get_team(&self, team_id: &str) -> MmResult<Team> {
        self.get(&["teams", team_id], &[]).await
    }

    async fn get_teams_for_user(&self, user_id: &str) -> MmResult<Vec<Team>> {
        self.get(&["users", user_id, "teams"], &[]).await
    }

    async fn get_public_channels(
        &self,
        team_id: &str,
        page: u32,
        per_page: u32,
    ) -> MmResult<Vec<Channel>> {
        self.get(&["teams", team_id, "channels"], &Self::paging(page, per_page))
            .await
    }

    async fn get_private_channels(
        &self,
        team_id: &str,
        page: u32,
        per_page: u32,
    ) -> MmResult<Vec<Channel>> {
        self.get(
            &["teams", team_id, "channels", "private"],
            &Self::paging(page, per_page),
        )
        .await
    }

    async fn get_channel(&self, channel_id: &str) -> MmResult<Channel> {
        self.get(&["channels", channel_id], &[]).await
    }

    async fn get_channel_by_name(&self, team_id: &str, name: &str) -> MmResult<Channel> {
        self.get(&["teams", team_id, "channels", "name", name], &[])
            .await
    }

    async fn create_channel(&self, channel: &NewChannel) -> MmResult<Channel> {
        let url = self.endpoint(&["channels"], &[])?;
        self.fetch(self.http.post(url).json(channel)).await
    }

    async fn get_channel_members(
        &self,
        channel_id: &str,
        page: u32,
        per_page: u32,
    ) -> MmResult<Vec<ChannelMember>> {
        self.get(
            &["channels", channel_id, "members"],
            &Self::paging(page, per_page),
        )
        .await
    }

    async fn add_channel_member(&self, channel_id: &str, user_id: &str) -> MmResult<()> {
        let url = self.endpoint(&["channels", channel_id, "members"], &[])?;
        self.execute(self.http.post(url).json(&json!({ "user_id": user_id })))
            .await?;
        Ok(())
    }

    async fn create_direct_channel(&self, user_a: &str, user_b: &str) -> MmResult<Channel> {
        let url = self.endpoint(&["channels", "direct"], &[])?;
        self.fetch(self.http.post(url).json(&json!([user_a, user_b])))
            .await
    }

    async fn create_post(&self, post: &NewPost) -> MmResult<Post> {
        let url = self.endpoint(&["posts"], &[])?;
        self.fetch(self.http.post(url).json(post)).await
    }

    async fn get_post(&self, post_id: &str) -> MmResult<Post> {
        self.get(&["posts", post_id], &[]).await
    }

    async fn update_post(&self, post_id: &str, message: &str) -> MmResult<Post> {
        let url = self.endpoint(&["posts", post_id, "patch"], &[])?;
        self.fetch(self.http.put(url).json(&json!({ "message": message })))
            .await
    }

    async fn delete_post(&self, post_id: &str) -> MmResult<()> {
        let url = self.endpoint(&["posts", post_id], &[])?;
        self.execute(self.http.delete(url)).await?;
        Ok(())
    }

    async fn get_posts_for_channel(
        &self,
        channel_id: &str,
        page: u32,
        per_page: u32,
    ) -> MmResult<PostList> {
        self.get(
            &["channels", channel_id, "posts"],
            &Self::paging(page, per_page),
        )
        .await
    }

    async fn get_posts_before(
        &self,
        channel_id: &str,
        post_id: &str,
        per_page: u32,
    ) -> MmResult<PostList> {
        self.get(
            &["channels", channel_id, "posts"],
            &[
                ("before", post_id.to_string()),
                ("per_page", per_page.to_string()),
            ],
        )
        .await
    }

    async fn get_posts_after(
        &self,
        channel_id: &str,
        post_id: &str,
        per_page: u32,
    ) -> MmResult<PostList> {
        self.get(
            &["channels", channel_id, "posts"],
            &[
                ("after", post_id.to_string()),
                ("per_page", per_page.to_string()),
            ],
        )
        .await
    }

    async fn save_reaction(&self, reaction: &Reaction) -> MmResult<Reaction> {
        let url = self.endpoint(&["reactions"], &[])?;
        self.fetch(self.http.post(url).json(reaction)).await
    }

    async fn delete_reaction(
        &self,
        user_id: &str,
        post_id: &str,
        emoji_name: &str,
    ) -> MmResult<()> {
        let url = self.endpoint(
            &["users", user_id, "posts", post_id, "reactions", emoji_name],
            &[],
        )?;
        self.execute(self.http.delete(url)).await?;
        Ok(())
    }

    async fn get_reactions(&self, post_id: &str) -> MmResult<Vec<Reaction>> {
        // The server answers `null` for posts without reactions.
        let reactions: Option<Vec<Reaction>> = self.get(&["posts", post_id, "reactions"], &[]).await?;
        Ok(reactions.unwrap_or_default())
    }

    async fn get_file_info(&self, file_id: &str) -> MmResult<FileInfo> {
        self.get(&["files", file_id, "info"], &[]).await
    }

    async fn get_file(&self, file_id: &str) -> MmResult<Vec<u8>> {
        let url = self.endpoint(&["files", file_id], &[])?;
        self.fetch_bytes(self.http.get(url)).await
    }

    async fn upload_file(
        &self,
        channel_id: &str,
        filename: &str,
        data: Vec<u8>,
    ) -> MmResult<FileInfo> {
        let url = self.endpoint(&["files"], &[])?;
        let form = Form::new()
            .text("channel_id", channel_id.to_string())
            .part("files", Part::bytes(data).file_name(filename.to_string()));
        let uploaded: FileUploadResponse = self.fetch(self.http.post(url).multipart(form)).await?;
        uploaded
            .file_infos
            .into_iter()
            .next()
            .ok_or_else(|| MattermostError::Decode("upload returned no file info".to_string()))
    }
}

/// Builds token-bound clients that share one connection pool.
pub struct HttpClientFactory {
    http: Client,
    server_url: Url,
    admin: Arc<dyn MattermostApi>,
}

impl HttpClientFactory {
    pub fn new(server_url: &str, admin_token: &str, timeout: Duration) -> MmResult<Self> {
        let server_url = Url::parse(server_url)
            .map_err(|e| MattermostError::Transport(format!("invalid server url: {e}")))?;
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(transport)?;
        let admin = Arc::new(MattermostClient::new(http.clone(), &server_url, admin_token)?);

        Ok(Self {
            http,
            server_url,
            admin,
        })
    }
}

impl ClientFactory for HttpClientFactory {
    fn admin(&self) -> Arc<dyn MattermostApi> {
        self.admin.clone()
    }

    fn with_token(&self, token: &str) -> MmResult<Arc<dyn MattermostApi>> {
        let client = MattermostClient::new(self.http.clone(), &self.server_url, token)?;
        Ok(Arc::new(client))
    }
}
