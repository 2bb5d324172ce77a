//! Full-server mirror: walks users, teams and channels once per login and feeds the runtime
//! the same events live traffic would.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::MirrorConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::events::{EventMeta, RemoteEvent};
use crate::identity::IdentityManager;
use crate::matrix_admin::{MatrixAdmin, generate_matrix_user_id};
use crate::mattermost::MattermostApi;
use crate::mattermost::models::{Channel, Team, User};
use crate::portal::{ChatInfo, ConversationKind, PortalKey};
use crate::registry::LoginSession;
use crate::relay::load_chat_info;
use crate::runtime::BridgeRuntime;

const USER_PAGE_SIZE: u32 = 200;
const TEAM_PAGE_SIZE: u32 = 100;
const CHANNEL_PAGE_SIZE: u32 = 200;
const MEMBER_PAGE_SIZE: u32 = 200;
const DEFAULT_HISTORY_LIMIT: u32 = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub users: usize,
    pub matrix_accounts: usize,
    pub teams: usize,
    pub channels: usize,
    pub messages: usize,
}

pub struct MirrorSync {
    login: Arc<LoginSession>,
    runtime: Arc<dyn BridgeRuntime>,
    identity: Arc<IdentityManager>,
    matrix_admin: Option<Arc<MatrixAdmin>>,
    config: MirrorConfig,
    server_name: String,
}

impl MirrorSync {
    pub fn new(
        login: Arc<LoginSession>,
        runtime: Arc<dyn BridgeRuntime>,
        identity: Arc<IdentityManager>,
        matrix_admin: Option<Arc<MatrixAdmin>>,
        config: MirrorConfig,
        server_name: impl Into<String>,
    ) -> Self {
        Self {
            login,
            runtime,
            identity,
            matrix_admin,
            config,
            server_name: server_name.into(),
        }
    }

    fn client(&self) -> Arc<dyn MattermostApi> {
        self.login.client()
    }

    fn meta(&self, conversation_id: &str) -> EventMeta {
        EventMeta::new(
            conversation_id,
            self.login.mm_user_id.clone(),
            Utc::now().timestamp_millis(),
        )
    }

    async fn queue_info(&self, conversation_id: &str, info: ChatInfo) -> BridgeResult<()> {
        self.runtime
            .queue_remote_event(
                self.login.clone(),
                RemoteEvent::ChatInfoChanged {
                    meta: self.meta(conversation_id),
                    info,
                },
            )
            .await
    }

    /// Users first so that rooms created afterwards find their puppets and accounts.
    /// Running it again only picks up entities this process has not seen.
    pub async fn sync_all(&self) -> BridgeResult<SyncStats> {
        info!(login = %self.login.id, "starting full server sync");
        let mut stats = SyncStats::default();

        if self.config.sync_all_users {
            match self.sync_users().await {
                Ok((users, accounts)) => {
                    stats.users = users;
                    stats.matrix_accounts = accounts;
                }
                Err(err) => warn!(error = %err, "failed to sync users"),
            }
        }

        if self.config.sync_all_teams {
            let (teams, channels, messages) = self.sync_teams().await?;
            stats.teams = teams;
            stats.channels = channels;
            stats.messages = messages;
        }

        info!(?stats, "full server sync complete");
        Ok(stats)
    }

    /// Returns (users seen, Matrix accounts created).
    pub async fn sync_users(&self) -> BridgeResult<(usize, usize)> {
        let client = self.client();
        let admin = self
            .matrix_admin
            .as_ref()
            .filter(|_| self.config.create_matrix_accounts);
        let mut seen = 0;
        let mut created = 0;
        let mut page = 0;

        loop {
            let users = client.get_users(page, USER_PAGE_SIZE).await?;
            for user in &users {
                if !self.login.synced().mark_user(&user.id) {
                    continue;
                }
                if user.delete_at > 0 || user.is_bot || self.identity.is_ghost_username(&user.username) {
                    debug!(username = %user.username, "not mirroring account");
                    continue;
                }
                seen += 1;
                if let Some(admin) = admin
                    && self.create_matrix_user_if_needed(admin, user).await
                {
                    created += 1;
                }
            }
            if users.len() < USER_PAGE_SIZE as usize {
                break;
            }
            page += 1;
        }

        info!(users = seen, created, "synced users");
        Ok((seen, created))
    }

    /// Creates the mirror account for a Mattermost user, or refreshes its display name when it
    /// already exists. Returns whether an account was created.
    pub async fn create_matrix_user_if_needed(&self, admin: &MatrixAdmin, user: &User) -> bool {
        let mxid = generate_matrix_user_id(&user.username, &self.server_name);
        let display_name = user.display_name();
        match admin.provision_account_if_absent(&mxid, &display_name).await {
            Ok(Some(_)) => {
                info!(mxid, username = %user.username, "created matrix account");
                true
            }
            Ok(None) => {
                if let Err(err) = admin.set_display_name(&mxid, &display_name).await {
                    debug!(mxid, error = %err, "could not refresh display name");
                }
                false
            }
            Err(err) => {
                warn!(mxid, error = %err, "failed to provision matrix account");
                false
            }
        }
    }

    /// Returns (teams, channels, messages) newly handled.
    pub async fn sync_teams(&self) -> BridgeResult<(usize, usize, usize)> {
        let client = self.client();
        let mut teams = Vec::new();
        let mut page = 0;
        loop {
            let batch = client.get_all_teams(page, TEAM_PAGE_SIZE).await?;
            let done = batch.len() < TEAM_PAGE_SIZE as usize;
            teams.extend(batch);
            if done {
                break;
            }
            page += 1;
        }
        info!(count = teams.len(), "found teams to sync");

        let mut totals = (0, 0, 0);
        for team in &teams {
            match self.sync_team(team).await {
                Ok((created, channels, messages)) => {
                    totals.0 += usize::from(created);
                    totals.1 += channels;
                    totals.2 += messages;
                }
                Err(err) => warn!(team = %team.name, error = %err, "failed to sync team"),
            }
        }
        Ok(totals)
    }

    /// Returns whether the team was new to this login, then the channels and messages newly
    /// handled in it. Channels of a known team are still walked so one that failed earlier
    /// gets another attempt.
    pub async fn sync_team(&self, team: &Team) -> BridgeResult<(bool, usize, usize)> {
        let created = !self.login.synced().has_team(&team.id);
        if created {
            let key = PortalKey::new(team.id.clone());
            let materialized = self
                .runtime
                .get_portal(&key)
                .await?
                .is_some_and(|portal| portal.mxid.is_some());
            if !materialized {
                info!(team = %team.display_name, "creating space for team");
                let mut info = ChatInfo::new(ConversationKind::Team);
                info.name = Some(team.display_name.clone()).filter(|name| !name.is_empty());
                info.topic = Some(team.description.clone()).filter(|topic| !topic.is_empty());
                self.queue_info(&team.id, info).await?;
            }
            self.login.synced().mark_team(&team.id);
        }

        if !self.config.sync_all_channels {
            return Ok((created, 0, 0));
        }
        match self.sync_channels(&team.id).await {
            Ok((channels, messages)) => Ok((created, channels, messages)),
            Err(err) => {
                warn!(team = %team.name, error = %err, "failed to sync channels");
                Ok((created, 0, 0))
            }
        }
    }

    /// Returns (channels, messages) newly handled in the team.
    pub async fn sync_channels(&self, team_id: &str) -> BridgeResult<(usize, usize)> {
        let client = self.client();
        let mut channels = Vec::new();
        let mut page = 0;
        loop {
            let batch = client
                .get_public_channels(team_id, page, CHANNEL_PAGE_SIZE)
                .await?;
            let done = batch.len() < CHANNEL_PAGE_SIZE as usize;
            channels.extend(batch);
            if done {
                break;
            }
            page += 1;
        }
        match client
            .get_private_channels(team_id, 0, CHANNEL_PAGE_SIZE)
            .await
        {
            Ok(private) => channels.extend(private),
            Err(err) => warn!(team_id, error = %err, "failed to list private channels, may need admin"),
        }
        info!(team_id, count = channels.len(), "found channels to sync");

        let mut totals = (0, 0);
        for channel in &channels {
            match self.sync_channel(channel).await {
                Ok(Some(messages)) => {
                    totals.0 += 1;
                    totals.1 += messages;
                }
                Ok(None) => {}
                Err(err) => warn!(channel = %channel.name, error = %err, "failed to sync channel"),
            }
        }
        Ok(totals)
    }

    /// Returns the number of history messages queued, or `None` when the channel was skipped.
    pub async fn sync_channel(&self, channel: &Channel) -> BridgeResult<Option<usize>> {
        let kind = ConversationKind::from_channel_type(&channel.channel_type).ok_or_else(|| {
            BridgeError::Conversion(format!("unknown channel type {}", channel.channel_type))
        })?;
        if kind.is_direct_like() {
            return Ok(None);
        }
        if self.login.synced().has_channel(&channel.id) {
            return Ok(None);
        }

        let key = PortalKey::new(channel.id.clone());
        let room = self.runtime.get_portal(&key).await?.and_then(|p| p.mxid);
        match &room {
            None => {
                info!(channel = %channel.display_name, "creating room for channel");
                let info = load_chat_info(self.client().as_ref(), &self.identity, &channel.id).await?;
                self.queue_info(&channel.id, info).await?;
            }
            Some(room_id) if self.config.auto_invite_users => {
                if let Err(err) = self.sync_channel_memberships(&channel.id, room_id).await {
                    warn!(channel = %channel.name, error = %err, "failed to sync memberships");
                }
            }
            Some(_) => {}
        }
        self.login.synced().mark_channel(&channel.id);

        if self.config.sync_history && room.is_none() {
            return Ok(Some(self.sync_history(&channel.id, 0).await?));
        }
        Ok(Some(0))
    }

    /// Queues the latest `limit` posts oldest first. Zero uses the configured limit.
    pub async fn sync_history(&self, channel_id: &str, limit: u32) -> BridgeResult<usize> {
        let limit = [limit, self.config.history_limit, DEFAULT_HISTORY_LIMIT]
            .into_iter()
            .find(|&l| l > 0)
            .unwrap_or(DEFAULT_HISTORY_LIMIT);
        let list = self
            .client()
            .get_posts_for_channel(channel_id, 0, limit)
            .await?;

        let mut posts = list.into_ordered();
        posts.reverse();
        let mut queued = 0;
        for post in posts {
            if post.is_system() || post.is_from_matrix() {
                continue;
            }
            let meta = EventMeta::new(channel_id, post.user_id.clone(), post.create_at);
            self.runtime
                .queue_remote_event(self.login.clone(), RemoteEvent::MessagePosted { meta, post })
                .await?;
            queued += 1;
        }
        info!(channel_id, queued, "queued historical messages");
        Ok(queued)
    }

    /// Joins the mirror accounts of a channel's members to its room. Members without an
    /// account, and ghosts, are skipped.
    pub async fn sync_channel_memberships(&self, channel_id: &str, room_id: &str) -> BridgeResult<usize> {
        let Some(admin) = self
            .matrix_admin
            .as_ref()
            .filter(|_| self.config.create_matrix_accounts)
        else {
            return Ok(0);
        };
        let client = self.client();
        let mut joined = 0;
        let mut page = 0;
        loop {
            let members = client
                .get_channel_members(channel_id, page, MEMBER_PAGE_SIZE)
                .await?;
            for member in &members {
                let user = match client.get_user(&member.user_id).await {
                    Ok(user) => user,
                    Err(err) => {
                        warn!(user_id = %member.user_id, error = %err, "failed to fetch member");
                        continue;
                    }
                };
                if self.identity.is_ghost_username(&user.username) {
                    continue;
                }
                let mxid = generate_matrix_user_id(&user.username, &self.server_name);
                match admin.admin_join(&mxid, room_id).await {
                    Ok(()) => joined += 1,
                    Err(err) => debug!(mxid, room_id, error = %err, "could not join member"),
                }
            }
            if members.len() < MEMBER_PAGE_SIZE as usize {
                break;
            }
            page += 1;
        }
        info!(room_id, joined, "joined matrix users to room");
        Ok(joined)
    }

    /// Memberships and, when enabled, history for one channel.
    pub async fn backfill_channel(&self, channel_id: &str) -> BridgeResult<usize> {
        let key = PortalKey::new(channel_id);
        let portal = self
            .runtime
            .get_portal(&key)
            .await?
            .ok_or_else(|| BridgeError::NotFound(format!("portal {key}")))?;
        if let Some(room_id) = &portal.mxid
            && let Err(err) = self.sync_channel_memberships(channel_id, room_id).await
        {
            warn!(channel_id, error = %err, "failed to sync memberships");
        }
        if !self.config.sync_history {
            return Ok(0);
        }
        match self.sync_history(channel_id, 0).await {
            Ok(queued) => Ok(queued),
            Err(err) => {
                warn!(channel_id, error = %err, "failed to backfill messages");
                Ok(0)
            }
        }
    }

    pub async fn backfill_all_channels(&self) -> usize {
        let mut done = 0;
        for channel_id in self.login.synced().channels() {
            match self.backfill_channel(&channel_id).await {
                Ok(_) => done += 1,
                Err(err) => warn!(channel_id, error = %err, "failed to backfill channel"),
            }
        }
        info!(channels = done, "backfilled synced channels");
        done
    }
}
