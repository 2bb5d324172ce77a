//! In-memory Mattermost used by the async tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::models::{
    Channel, ChannelMember, FileInfo, NewChannel, NewPost, NewUser, Post, PostList, Reaction,
    Team, User, UserAccessToken, UserPatch,
};
use super::{ClientFactory, MattermostApi, MattermostError, MmResult};

pub const ADMIN_TOKEN: &str = "admin-token";
const EPOCH_MILLIS: i64 = 1_700_000_000_000;

#[derive(Default)]
struct State {
    next_id: u64,
    users: HashMap<String, User>,
    tokens: HashMap<String, String>,
    images: HashMap<String, Vec<u8>>,
    teams: Vec<Team>,
    team_members: HashMap<String, HashSet<String>>,
    channels: Vec<Channel>,
    channel_members: HashMap<String, Vec<String>>,
    posts: HashMap<String, Post>,
    channel_posts: HashMap<String, Vec<String>>,
    reactions: Vec<Reaction>,
    files: HashMap<String, (FileInfo, Vec<u8>)>,
    failing: HashSet<&'static str>,
    calls: HashMap<&'static str, usize>,
}

impl State {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}{}", self.next_id)
    }

    fn now(&self) -> i64 {
        EPOCH_MILLIS + self.next_id as i64 * 1000
    }
}

fn not_found(what: &str) -> MattermostError {
    MattermostError::Http {
        status: 404,
        id: format!("store.sql_{what}.missing.app_error"),
        message: format!("{what} not found"),
    }
}

/// Shared fake server. Every client handed out by [`ClientFactory`] acts as the user its
/// token belongs to.
#[derive(Clone)]
pub struct FakeMattermost {
    state: Arc<Mutex<State>>,
    admin_id: String,
}

impl Default for FakeMattermost {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeMattermost {
    pub fn new() -> Self {
        let fake = Self {
            state: Arc::new(Mutex::new(State::default())),
            admin_id: String::new(),
        };
        let admin = fake.add_user("admin");
        {
            let mut state = fake.state.lock();
            if let Some(user) = state.users.get_mut(&admin.id) {
                user.roles = "system_user system_admin".to_string();
            }
            state.tokens.insert(ADMIN_TOKEN.to_string(), admin.id.clone());
        }
        Self {
            admin_id: admin.id,
            ..fake
        }
    }

    pub fn admin_id(&self) -> &str {
        &self.admin_id
    }

    pub fn add_user(&self, username: &str) -> User {
        let mut state = self.state.lock();
        let user = User {
            id: state.next_id("user"),
            username: username.to_string(),
            email: format!("{username}@example.com"),
            roles: "system_user".to_string(),
            ..Default::default()
        };
        state.users.insert(user.id.clone(), user.clone());
        user
    }

    pub fn add_token(&self, user_id: &str, token: &str) {
        self.state
            .lock()
            .tokens
            .insert(token.to_string(), user_id.to_string());
    }

    pub fn add_team(&self, name: &str) -> Team {
        let mut state = self.state.lock();
        let team = Team {
            id: state.next_id("team"),
            name: name.to_string(),
            display_name: name.to_string(),
            team_type: "O".to_string(),
            ..Default::default()
        };
        state.teams.push(team.clone());
        team
    }

    pub fn join_team(&self, team_id: &str, user_id: &str) {
        self.state
            .lock()
            .team_members
            .entry(team_id.to_string())
            .or_default()
            .insert(user_id.to_string());
    }

    pub fn add_channel(&self, team_id: &str, channel_type: &str, name: &str) -> Channel {
        let mut state = self.state.lock();
        let channel = Channel {
            id: state.next_id("chan"),
            team_id: team_id.to_string(),
            channel_type: channel_type.to_string(),
            name: name.to_string(),
            display_name: name.to_string(),
            ..Default::default()
        };
        state.channels.push(channel.clone());
        channel
    }

    pub fn add_member(&self, channel_id: &str, user_id: &str) {
        let mut state = self.state.lock();
        let members = state
            .channel_members
            .entry(channel_id.to_string())
            .or_default();
        if !members.iter().any(|m| m == user_id) {
            members.push(user_id.to_string());
        }
    }

    pub fn add_post(&self, channel_id: &str, user_id: &str, message: &str) -> Post {
        let mut state = self.state.lock();
        Self::insert_post(
            &mut state,
            user_id,
            NewPost {
                channel_id: channel_id.to_string(),
                message: message.to_string(),
                ..Default::default()
            },
        )
    }

    pub fn add_system_post(&self, channel_id: &str, user_id: &str, post_type: &str) -> Post {
        let mut state = self.state.lock();
        let mut post = Self::insert_post(
            &mut state,
            user_id,
            NewPost {
                channel_id: channel_id.to_string(),
                message: "joined the channel".to_string(),
                ..Default::default()
            },
        );
        post.post_type = post_type.to_string();
        state.posts.insert(post.id.clone(), post.clone());
        post
    }

    pub fn add_file(&self, name: &str, mime_type: &str, data: &[u8], dims: Option<(i32, i32)>) -> String {
        let mut state = self.state.lock();
        let id = state.next_id("file");
        let (width, height) = dims.unwrap_or_default();
        let info = FileInfo {
            id: id.clone(),
            name: name.to_string(),
            extension: name.rsplit_once('.').map(|(_, ext)| ext.to_string()).unwrap_or_default(),
            size: data.len() as i64,
            mime_type: mime_type.to_string(),
            width,
            height,
        };
        state.files.insert(id.clone(), (info, data.to_vec()));
        id
    }

    /// Stores bytes without file info so metadata lookups fail.
    pub fn add_bare_file(&self, data: &[u8]) -> String {
        let id = self.add_file("", "", data, None);
        if let Some((info, _)) = self.state.lock().files.get_mut(&id) {
            info.id.clear();
        }
        id
    }

    pub fn add_reaction(&self, post_id: &str, user_id: &str, emoji_name: &str) {
        let mut state = self.state.lock();
        let create_at = state.now();
        state.reactions.push(Reaction {
            user_id: user_id.to_string(),
            post_id: post_id.to_string(),
            emoji_name: emoji_name.to_string(),
            create_at,
            channel_id: String::new(),
        });
    }

    pub fn fail(&self, method: &'static str) {
        self.state.lock().failing.insert(method);
    }

    pub fn recover(&self, method: &str) {
        self.state.lock().failing.remove(method);
    }

    pub fn calls(&self, method: &str) -> usize {
        self.state.lock().calls.get(method).copied().unwrap_or(0)
    }

    pub fn users(&self) -> Vec<User> {
        self.state.lock().users.values().cloned().collect()
    }

    pub fn user_by_username(&self, username: &str) -> Option<User> {
        self.state
            .lock()
            .users
            .values()
            .find(|u| u.username == username)
            .cloned()
    }

    pub fn user(&self, user_id: &str) -> Option<User> {
        self.state.lock().users.get(user_id).cloned()
    }

    pub fn post(&self, post_id: &str) -> Option<Post> {
        self.state.lock().posts.get(post_id).cloned()
    }

    /// Posts of a channel, oldest first.
    pub fn channel_posts(&self, channel_id: &str) -> Vec<Post> {
        let state = self.state.lock();
        state
            .channel_posts
            .get(channel_id)
            .map(|ids| ids.iter().filter_map(|id| state.posts.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    pub fn channel_members(&self, channel_id: &str) -> Vec<String> {
        self.state
            .lock()
            .channel_members
            .get(channel_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn reactions(&self) -> Vec<Reaction> {
        self.state.lock().reactions.clone()
    }

    pub fn profile_image(&self, user_id: &str) -> Option<Vec<u8>> {
        self.state.lock().images.get(user_id).cloned()
    }

    pub fn client_for(&self, user_id: &str) -> Arc<dyn MattermostApi> {
        Arc::new(FakeClient {
            fake: self.clone(),
            token: None,
            user_id: Some(user_id.to_string()),
        })
    }

    fn insert_post(state: &mut State, user_id: &str, new_post: NewPost) -> Post {
        let id = state.next_id("post");
        let post = Post {
            id: id.clone(),
            create_at: state.now(),
            update_at: state.now(),
            user_id: user_id.to_string(),
            channel_id: new_post.channel_id.clone(),
            root_id: new_post.root_id,
            message: new_post.message,
            props: new_post.props,
            file_ids: new_post.file_ids,
            ..Default::default()
        };
        state.posts.insert(id.clone(), post.clone());
        state
            .channel_posts
            .entry(new_post.channel_id)
            .or_default()
            .push(id);
        post
    }
}

impl ClientFactory for FakeMattermost {
    fn admin(&self) -> Arc<dyn MattermostApi> {
        self.client_for(&self.admin_id)
    }

    fn with_token(&self, token: &str) -> MmResult<Arc<dyn MattermostApi>> {
        Ok(Arc::new(FakeClient {
            fake: self.clone(),
            token: Some(token.to_string()),
            user_id: None,
        }))
    }
}

pub struct FakeClient {
    fake: FakeMattermost,
    token: Option<String>,
    user_id: Option<String>,
}

impl FakeClient {
    fn enter(&self, method: &'static str) -> MmResult<parking_lot::MutexGuard<'_, State>> {
        let mut state = self.fake.state.lock();
        *state.calls.entry(method).or_default() += 1;
        if state.failing.contains(method) {
            return Err(MattermostError::Http {
                status: 500,
                id: "fake.failure".to_string(),
                message: format!("{method} failed"),
            });
        }
        Ok(state)
    }

    fn acting_user(&self, state: &State) -> MmResult<String> {
        if let Some(user_id) = &self.user_id {
            return Ok(user_id.clone());
        }
        self.token
            .as_ref()
            .and_then(|token| state.tokens.get(token).cloned())
            .ok_or_else(|| MattermostError::Http {
                status: 401,
                id: "api.context.session_expired.app_error".to_string(),
                message: "invalid or expired session".to_string(),
            })
    }

    fn page<T: Clone>(items: &[T], page: u32, per_page: u32) -> Vec<T> {
        items
            .iter()
            .skip((page * per_page) as usize)
            .take(per_page as usize)
            .cloned()
            .collect()
    }

    /// Builds a newest-first post list from a chronological slice.
    fn post_list(state: &State, ids: &[String]) -> PostList {
        let mut list = PostList::default();
        for id in ids.iter().rev() {
            if let Some(post) = state.posts.get(id) {
                list.order.push(id.clone());
                list.posts.insert(id.clone(), post.clone());
            }
        }
        list
    }
}

#[async_trait]
impl MattermostApi for FakeClient {
    async fn get_me(&self) -> MmResult<User> {
        let state = self.enter("get_me")?;
        let id = self.acting_user(&state)?;
        state.users.get(&id).cloned().ok_or_else(|| not_found("user"))
    }

    async fn get_user(&self, user_id: &str) -> MmResult<User> {
        let state = self.enter("get_user")?;
        state.users.get(user_id).cloned().ok_or_else(|| not_found("user"))
    }

    async fn get_user_by_username(&self, username: &str) -> MmResult<User> {
        let state = self.enter("get_user_by_username")?;
        state
            .users
            .values()
            .find(|u| u.username == username)
            .cloned()
            .ok_or_else(|| not_found("user"))
    }

    async fn get_user_by_email(&self, email: &str) -> MmResult<User> {
        let state = self.enter("get_user_by_email")?;
        state
            .users
            .values()
            .find(|u| u.email == email)
            .cloned()
            .ok_or_else(|| not_found("user"))
    }

    async fn get_users(&self, page: u32, per_page: u32) -> MmResult<Vec<User>> {
        let state = self.enter("get_users")?;
        let mut users: Vec<User> = state.users.values().cloned().collect();
        users.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(Self::page(&users, page, per_page))
    }

    async fn create_user(&self, user: &NewUser) -> MmResult<User> {
        drop(self.enter("create_user")?);
        // Lets concurrent callers interleave between lookup and insert.
        tokio::task::yield_now().await;

        let mut state = self.fake.state.lock();
        if state.users.values().any(|u| u.username == user.username) {
            return Err(MattermostError::Http {
                status: 400,
                id: "app.user.save.username_exists.app_error".to_string(),
                message: "An account with that username already exists.".to_string(),
            });
        }
        let created = User {
            id: state.next_id("user"),
            username: user.username.clone(),
            email: user.email.clone(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            nickname: user.nickname.clone(),
            position: user.position.clone(),
            roles: "system_user".to_string(),
            ..Default::default()
        };
        state.users.insert(created.id.clone(), created.clone());
        Ok(created)
    }

    async fn patch_user(&self, user_id: &str, patch: &UserPatch) -> MmResult<User> {
        let mut state = self.enter("patch_user")?;
        let user = state.users.get_mut(user_id).ok_or_else(|| not_found("user"))?;
        if let Some(first) = &patch.first_name {
            user.first_name = first.clone();
        }
        if let Some(last) = &patch.last_name {
            user.last_name = last.clone();
        }
        if let Some(nickname) = &patch.nickname {
            user.nickname = nickname.clone();
        }
        Ok(user.clone())
    }

    async fn set_profile_image(&self, user_id: &str, data: Vec<u8>) -> MmResult<()> {
        let mut state = self.enter("set_profile_image")?;
        state.images.insert(user_id.to_string(), data);
        if let Some(user) = state.users.get_mut(user_id) {
            user.last_picture_update += 1;
        }
        Ok(())
    }

    async fn get_profile_image(&self, user_id: &str) -> MmResult<Vec<u8>> {
        let state = self.enter("get_profile_image")?;
        state
            .images
            .get(user_id)
            .cloned()
            .ok_or_else(|| not_found("image"))
    }

    async fn create_user_access_token(
        &self,
        user_id: &str,
        description: &str,
    ) -> MmResult<UserAccessToken> {
        let mut state = self.enter("create_user_access_token")?;
        if !state.users.contains_key(user_id) {
            return Err(not_found("user"));
        }
        let id = state.next_id("token");
        let token = format!("{id}-secret");
        state.tokens.insert(token.clone(), user_id.to_string());
        Ok(UserAccessToken {
            id,
            token,
            user_id: user_id.to_string(),
            description: description.to_string(),
        })
    }

    async fn get_all_teams(&self, page: u32, per_page: u32) -> MmResult<Vec<Team>> {
        let state = self.enter("get_all_teams")?;
        Ok(Self::page(&state.teams, page, per_page))
    }

    async fn get_team(&self, team_id: &str) -> MmResult<Team> {
        let state = self.enter("get_team")?;
        state
            .teams
            .iter()
            .find(|t| t.id == team_id)
            .cloned()
            .ok_or_else(|| not_found("team"))
    }

    async fn get_teams_for_user(&self, user_id: &str) -> MmResult<Vec<Team>> {
        let state = self.enter("get_teams_for_user")?;
        Ok(state
            .teams
            .iter()
            .filter(|t| {
                state
                    .team_members
                    .get(&t.id)
                    .is_some_and(|members| members.contains(user_id))
            })
            .cloned()
            .collect())
    }

    async fn get_public_channels(
        &self,
        team_id: &str,
        page: u32,
        per_page: u32,
    ) -> MmResult<Vec<Channel>> {
        let state = self.enter("get_public_channels")?;
        let channels: Vec<Channel> = state
            .channels
            .iter()
            .filter(|c| c.team_id == team_id && c.channel_type == "O")
            .cloned()
            .collect();
        Ok(Self::page(&channels, page, per_page))
    }

    async fn get_private_channels(
        &self,
        team_id: &str,
        page: u32,
        per_page: u32,
    ) -> MmResult<Vec<Channel>> {
        let state = self.enter("get_private_channels")?;
        let channels: Vec<Channel> = state
            .channels
            .iter()
            .filter(|c| c.team_id == team_id && c.channel_type == "P")
            .cloned()
            .collect();
        Ok(Self::page(&channels, page, per_page))
    }

    async fn get_channel(&self, channel_id: &str) -> MmResult<Channel> {
        let state = self.enter("get_channel")?;
        state
            .channels
            .iter()
            .find(|c| c.id == channel_id)
            .cloned()
            .ok_or_else(|| not_found("channel"))
    }

    async fn get_channel_by_name(&self, team_id: &str, name: &str) -> MmResult<Channel> {
        let state = self.enter("get_channel_by_name")?;
        state
            .channels
            .iter()
            .find(|c| c.team_id == team_id && c.name == name)
            .cloned()
            .ok_or_else(|| not_found("channel"))
    }

    async fn create_channel(&self, channel: &NewChannel) -> MmResult<Channel> {
        let mut state = self.enter("create_channel")?;
        if state
            .channels
            .iter()
            .any(|c| c.team_id == channel.team_id && c.name == channel.name)
        {
            return Err(MattermostError::Http {
                status: 400,
                id: "store.sql_channel.save_channel.exists.app_error".to_string(),
                message: "A channel with that name already exists".to_string(),
            });
        }
        let created = Channel {
            id: state.next_id("chan"),
            team_id: channel.team_id.clone(),
            channel_type: channel.channel_type.clone(),
            name: channel.name.clone(),
            display_name: channel.display_name.clone(),
            purpose: channel.purpose.clone(),
            ..Default::default()
        };
        state.channels.push(created.clone());
        Ok(created)
    }

    async fn get_channel_members(
        &self,
        channel_id: &str,
        page: u32,
        per_page: u32,
    ) -> MmResult<Vec<ChannelMember>> {
        let state = self.enter("get_channel_members")?;
        let members: Vec<ChannelMember> = state
            .channel_members
            .get(channel_id)
            .map(|ids| {
                ids.iter()
                    .map(|user_id| ChannelMember {
                        channel_id: channel_id.to_string(),
                        user_id: user_id.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self::page(&members, page, per_page))
    }

    async fn add_channel_member(&self, channel_id: &str, user_id: &str) -> MmResult<()> {
        let mut state = self.enter("add_channel_member")?;
        let members = state
            .channel_members
            .entry(channel_id.to_string())
            .or_default();
        if members.iter().any(|m| m == user_id) {
            return Err(MattermostError::Http {
                status: 400,
                id: "api.channel.add_user.to.channel.already_member".to_string(),
                message: "user is already a member".to_string(),
            });
        }
        members.push(user_id.to_string());
        Ok(())
    }

    async fn create_direct_channel(&self, user_a: &str, user_b: &str) -> MmResult<Channel> {
        let mut state = self.enter("create_direct_channel")?;
        let mut pair = [user_a, user_b];
        pair.sort();
        let name = format!("{}__{}", pair[0], pair[1]);
        if let Some(existing) = state.channels.iter().find(|c| c.name == name) {
            return Ok(existing.clone());
        }
        let channel = Channel {
            id: state.next_id("dm"),
            channel_type: "D".to_string(),
            name,
            ..Default::default()
        };
        state.channels.push(channel.clone());
        state.channel_members.insert(
            channel.id.clone(),
            vec![pair[0].to_string(), pair[1].to_string()],
        );
        Ok(channel)
    }

    async fn create_post(&self, post: &NewPost) -> MmResult<Post> {
        let mut state = self.enter("create_post")?;
        let author = self.acting_user(&state)?;
        Ok(FakeMattermost::insert_post(&mut state, &author, post.clone()))
    }

    async fn get_post(&self, post_id: &str) -> MmResult<Post> {
        let state = self.enter("get_post")?;
        state.posts.get(post_id).cloned().ok_or_else(|| not_found("post"))
    }

    async fn update_post(&self, post_id: &str, message: &str) -> MmResult<Post> {
        let mut state = self.enter("update_post")?;
        let now = state.now();
        let post = state.posts.get_mut(post_id).ok_or_else(|| not_found("post"))?;
        post.message = message.to_string();
        post.edit_at = now;
        Ok(post.clone())
    }

    async fn delete_post(&self, post_id: &str) -> MmResult<()> {
        let mut state = self.enter("delete_post")?;
        let post = state.posts.remove(post_id).ok_or_else(|| not_found("post"))?;
        if let Some(ids) = state.channel_posts.get_mut(&post.channel_id) {
            ids.retain(|id| id != post_id);
        }
        Ok(())
    }

    async fn get_posts_for_channel(
        &self,
        channel_id: &str,
        page: u32,
        per_page: u32,
    ) -> MmResult<PostList> {
        let state = self.enter("get_posts_for_channel")?;
        let ids = state.channel_posts.get(channel_id).cloned().unwrap_or_default();
        let newest_first: Vec<String> = ids.into_iter().rev().collect();
        let mut window = Self::page(&newest_first, page, per_page);
        window.reverse();
        Ok(Self::post_list(&state, &window))
    }

    async fn get_posts_before(
        &self,
        channel_id: &str,
        post_id: &str,
        per_page: u32,
    ) -> MmResult<PostList> {
        let state = self.enter("get_posts_before")?;
        let ids = state.channel_posts.get(channel_id).cloned().unwrap_or_default();
        let anchor = ids.iter().position(|id| id == post_id).unwrap_or(0);
        let start = anchor.saturating_sub(per_page as usize);
        Ok(Self::post_list(&state, &ids[start..anchor]))
    }

    async fn get_posts_after(
        &self,
        channel_id: &str,
        post_id: &str,
        per_page: u32,
    ) -> MmResult<PostList> {
        let state = self.enter("get_posts_after")?;
        let ids = state.channel_posts.get(channel_id).cloned().unwrap_or_default();
        let start = ids
            .iter()
            .position(|id| id == post_id)
            .map(|anchor| anchor + 1)
            .unwrap_or(ids.len());
        let end = (start + per_page as usize).min(ids.len());
        Ok(Self::post_list(&state, &ids[start..end]))
    }

    async fn save_reaction(&self, reaction: &Reaction) -> MmResult<Reaction> {
        let mut state = self.enter("save_reaction")?;
        let mut saved = reaction.clone();
        saved.create_at = state.now();
        state.reactions.push(saved.clone());
        Ok(saved)
    }

    async fn delete_reaction(
        &self,
        user_id: &str,
        post_id: &str,
        emoji_name: &str,
    ) -> MmResult<()> {
        let mut state = self.enter("delete_reaction")?;
        state.reactions.retain(|r| {
            !(r.user_id == user_id && r.post_id == post_id && r.emoji_name == emoji_name)
        });
        Ok(())
    }

    async fn get_reactions(&self, post_id: &str) -> MmResult<Vec<Reaction>> {
        let state = self.enter("get_reactions")?;
        Ok(state
            .reactions
            .iter()
            .filter(|r| r.post_id == post_id)
            .cloned()
            .collect())
    }

    async fn get_file_info(&self, file_id: &str) -> MmResult<FileInfo> {
        let state = self.enter("get_file_info")?;
        state
            .files
            .get(file_id)
            .filter(|(info, _)| !info.id.is_empty())
            .map(|(info, _)| info.clone())
            .ok_or_else(|| not_found("file_info"))
    }

    async fn get_file(&self, file_id: &str) -> MmResult<Vec<u8>> {
        let state = self.enter("get_file")?;
        state
            .files
            .get(file_id)
            .map(|(_, data)| data.clone())
            .ok_or_else(|| not_found("file"))
    }

    async fn upload_file(
        &self,
        _channel_id: &str,
        filename: &str,
        data: Vec<u8>,
    ) -> MmResult<FileInfo> {
        drop(self.enter("upload_file")?);
        let mime = mime_guess::from_path(filename)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        let id = self.fake.add_file(filename, &mime, &data, None);
        let state = self.fake.state.lock();
        state
            .files
            .get(&id)
            .map(|(info, _)| info.clone())
            .ok_or_else(|| not_found("file"))
    }
}
