//! In-process runtime: database-backed portals, ghosts and logins, one serialized queue per
//! portal, and Matrix room state through the appservice.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::BridgeRuntime;
use crate::config::Config;
use crate::convert::{ConvertedMessage, MatrixMedia, MessageConverter, emoji, text_content};
use crate::db::{DatabaseManager, MessageMapping, PuppetRecord, ReactionMapping};
use crate::error::{BridgeError, BridgeResult};
use crate::events::RemoteEvent;
use crate::identity::Ghost;
use crate::matrix::{MatrixAppservice, RelayProvider, RoomOptions};
use crate::mattermost::models::Post;
use crate::portal::{ChatInfo, ConversationKind, Portal, PortalKey};
use crate::registry::{LoginSession, StoredLogin};
use crate::relay::MattermostRelay;
use crate::web::metrics::Metrics;

const DEDUP_CAPACITY: usize = 10_000;
const PORTAL_PAGE_SIZE: i64 = 500;

type Queued = (Arc<LoginSession>, RemoteEvent);

/// Bounded set of recently handled idempotency keys. The oldest keys are forgotten first.
#[derive(Debug)]
struct SeenKeys {
    order: VecDeque<String>,
    keys: HashSet<String>,
    capacity: usize,
}

impl SeenKeys {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            keys: HashSet::new(),
            capacity,
        }
    }

    /// Returns `true` the first time a key is seen.
    fn insert(&mut self, key: String) -> bool {
        if self.keys.contains(&key) {
            return false;
        }
        if self.order.len() >= self.capacity
            && let Some(oldest) = self.order.pop_front()
        {
            self.keys.remove(&oldest);
        }
        self.keys.insert(key.clone());
        self.order.push_back(key);
        true
    }
}

pub struct LocalRuntime {
    config: Arc<Config>,
    db: DatabaseManager,
    matrix: Arc<MatrixAppservice>,
    media: Arc<dyn MatrixMedia>,
    converter: Arc<MessageConverter>,
    relays: OnceCell<Weak<dyn RelayProvider>>,
    queues: Mutex<HashMap<PortalKey, mpsc::UnboundedSender<Queued>>>,
    rooms: Mutex<HashMap<PortalKey, watch::Sender<Option<String>>>>,
    creating: Mutex<HashMap<PortalKey, Arc<tokio::sync::Mutex<()>>>>,
    seen: Mutex<SeenKeys>,
    puppets: Mutex<HashSet<String>>,
    joined: Mutex<HashSet<(String, String)>>,
    this: Weak<LocalRuntime>,
}

impl LocalRuntime {
    pub fn new(
        config: Arc<Config>,
        db: DatabaseManager,
        matrix: Arc<MatrixAppservice>,
        media: Arc<dyn MatrixMedia>,
        converter: Arc<MessageConverter>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            config,
            db,
            matrix,
            media,
            converter,
            relays: OnceCell::new(),
            queues: Mutex::new(HashMap::new()),
            rooms: Mutex::new(HashMap::new()),
            creating: Mutex::new(HashMap::new()),
            seen: Mutex::new(SeenKeys::new(DEDUP_CAPACITY)),
            puppets: Mutex::new(HashSet::new()),
            joined: Mutex::new(HashSet::new()),
            this: this.clone(),
        })
    }

    /// Connects the runtime to the relays it uses for chat info, user info and backfill.
    pub fn attach_relays(&self, relays: Weak<dyn RelayProvider>) {
        if self.relays.set(relays).is_err() {
            warn!("relay provider already attached");
        }
    }

    fn relay(&self, login: &LoginSession) -> BridgeResult<Arc<MattermostRelay>> {
        self.relays
            .get()
            .and_then(Weak::upgrade)
            .and_then(|provider| provider.relay_for(Some(&login.id)))
            .ok_or_else(|| BridgeError::NotFound(format!("relay for login {}", login.id)))
    }

    fn mark_seen(&self, key: String) -> bool {
        self.seen.lock().insert(key)
    }

    /// Whether the event was already queued once, recording it otherwise.
    fn is_repeat(&self, event: &RemoteEvent) -> bool {
        event.dedup_key().is_some_and(|key| !self.mark_seen(key))
    }

    fn watcher(&self, key: &PortalKey) -> watch::Receiver<Option<String>> {
        self.rooms
            .lock()
            .entry(key.clone())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }

    fn notify_room(&self, key: &PortalKey, room_id: &str) {
        let rooms = self.rooms.lock();
        if let Some(tx) = rooms.get(key) {
            tx.send_replace(Some(room_id.to_string()));
        }
    }

    fn spawn_worker(&self, key: PortalKey) -> Option<mpsc::UnboundedSender<Queued>> {
        let runtime = self.this.upgrade()?;
        let (tx, mut rx) = mpsc::unbounded_channel::<Queued>();
        tokio::spawn(async move {
            debug!(portal = %key, "portal queue started");
            while let Some((login, event)) = rx.recv().await {
                let kind = event.kind();
                if let Err(err) = runtime.handle(&login, &key, event).await {
                    Metrics::mattermost_event_failed();
                    warn!(portal = %key, kind, error = %err, "failed to bridge event to matrix");
                }
            }
        });
        Some(tx)
    }

    async fn handle(&self, login: &Arc<LoginSession>, key: &PortalKey, event: RemoteEvent) -> BridgeResult<()> {
        match event {
            RemoteEvent::ChatInfoChanged { info, .. } => self.apply_chat_info(login, key, &info).await,
            RemoteEvent::MessagePosted { post, .. } => {
                let room = self.ensure_room(login, key, Some(&post.id)).await?;
                let converted = self
                    .converter
                    .to_matrix(&post, login.client().as_ref(), self.media.as_ref())
                    .await;
                self.post_converted(login, &room, &post, converted).await
            }
            RemoteEvent::MessageEdited { post, .. } => self.edit_message(login, &post).await,
            RemoteEvent::MessageRemoved { post_id, .. } => self.remove_message(&post_id).await,
            RemoteEvent::ReactionAdded { meta, post_id, emoji_name } => {
                self.add_reaction(login, &meta.sender_id, &post_id, &emoji_name)
                    .await
            }
            RemoteEvent::ReactionRemoved { meta, post_id, emoji_name } => {
                self.remove_reaction(&meta.sender_id, &post_id, &emoji_name)
                    .await
            }
        }
    }

    async fn apply_chat_info(&self, login: &LoginSession, key: &PortalKey, info: &ChatInfo) -> BridgeResult<()> {
        let Some(mut portal) = self.get_portal(key).await? else {
            self.materialize(login, key, info).await?;
            return Ok(());
        };
        let Some(room_id) = portal.mxid.clone() else {
            self.materialize(login, key, info).await?;
            return Ok(());
        };

        if let Some(name) = &info.name
            && portal.name.as_ref() != Some(name)
            && let Err(err) = self.matrix.set_room_name(&room_id, name).await
        {
            warn!(room_id, error = %err, "failed to update room name");
        }
        if let Some(topic) = &info.topic
            && portal.topic.as_ref() != Some(topic)
            && let Err(err) = self.matrix.set_room_topic(&room_id, topic).await
        {
            warn!(room_id, error = %err, "failed to update room topic");
        }
        portal.apply_info(info);
        self.save_portal(&portal).await
    }

    /// The portal's room, created on first use. A room created here is seeded with the
    /// latest history, leaving out `current` which the caller posts itself.
    async fn ensure_room(&self, login: &LoginSession, key: &PortalKey, current: Option<&str>) -> BridgeResult<String> {
        if let Some(room) = self.get_portal(key).await?.and_then(|p| p.mxid) {
            return Ok(room);
        }
        let relay = self.relay(login)?;
        let info = relay.get_chat_info(&key.id).await?;
        let room = self.materialize(login, key, &info).await?;

        let count = self.config.bridge.initial_backfill as usize;
        if count > 0 && info.kind != ConversationKind::Team {
            self.initial_backfill(login, &relay, &room, &key.id, count, current)
                .await;
        }
        Ok(room)
    }

    async fn initial_backfill(
        &self,
        login: &LoginSession,
        relay: &MattermostRelay,
        room: &str,
        channel_id: &str,
        count: usize,
        current: Option<&str>,
    ) {
        let fetched = match relay.fetch_messages(channel_id, None, false, count).await {
            Ok(fetched) => fetched,
            Err(err) => {
                warn!(channel_id, error = %err, "initial backfill failed");
                return;
            }
        };
        let mut bridged = 0;
        for message in fetched.messages {
            if Some(message.post.id.as_str()) == current
                || message.post.is_from_matrix()
                || !self.mark_seen(format!("post:{}", message.post.id))
            {
                continue;
            }
            if let Err(err) = self
                .post_converted(login, room, &message.post, message.converted)
                .await
            {
                warn!(post_id = %message.post.id, error = %err, "failed to backfill post");
                continue;
            }
            bridged += 1;
            for reaction in message.reactions {
                if let Err(err) = self
                    .add_reaction(login, &reaction.user_id, &reaction.post_id, &reaction.emoji_name)
                    .await
                {
                    debug!(post_id = %reaction.post_id, error = %err, "failed to backfill reaction");
                }
            }
        }
        info!(channel_id, bridged, "initial backfill complete");
    }

    /// Creates the room (and the parent space) for a portal.
    async fn materialize(&self, login: &LoginSession, key: &PortalKey, info: &ChatInfo) -> BridgeResult<String> {
        let parent_room = match &info.parent {
            Some(parent) => match self.ensure_space(login, parent).await {
                Ok(room) => Some(room),
                Err(err) => {
                    warn!(portal = %key, parent = %parent, error = %err, "failed to create parent space");
                    None
                }
            },
            None => None,
        };
        self.create_portal_room(login, key, info, parent_room).await
    }

    async fn ensure_space(&self, login: &LoginSession, key: &PortalKey) -> BridgeResult<String> {
        if let Some(room) = self.get_portal(key).await?.and_then(|p| p.mxid) {
            return Ok(room);
        }
        let info = self.relay(login)?.get_chat_info(&key.id).await?;
        self.create_portal_room(login, key, &info, None).await
    }

    async fn create_portal_room(
        &self,
        login: &LoginSession,
        key: &PortalKey,
        info: &ChatInfo,
        parent_room: Option<String>,
    ) -> BridgeResult<String> {
        let lock = self
            .creating
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let mut portal = match self.get_portal(key).await? {
            Some(portal) => {
                if let Some(room) = portal.mxid {
                    return Ok(room);
                }
                portal
            }
            None => Portal::new(key.clone(), info.kind),
        };
        portal.apply_info(info);

        // Members that are ghosts stand for real Matrix users; invite those directly.
        let mut invite = vec![login.matrix_user_id.clone()];
        for member in &info.members {
            if let Some(mxid) = &member.matrix_user_id
                && !invite.contains(mxid)
            {
                invite.push(mxid.clone());
            }
        }
        if let Some(admin) = &self.config.bridge.admin_mxid
            && !invite.contains(admin)
        {
            invite.push(admin.clone());
        }

        let options = RoomOptions {
            name: info.name.clone(),
            topic: info.topic.clone(),
            is_space: info.kind == ConversationKind::Team,
            is_direct: info.kind == ConversationKind::Direct,
            invite,
        };
        let room = self
            .matrix
            .create_room(&options)
            .await
            .map_err(BridgeError::matrix)?;

        portal.mxid = Some(room.clone());
        portal.relay_login_id.get_or_insert_with(|| login.id.clone());
        self.save_portal(&portal).await?;

        if let Some(space) = parent_room
            && let Err(err) = self.matrix.add_to_space(&space, &room).await
        {
            warn!(space, room, error = %err, "failed to link room into space");
        }
        info!(portal = %key, kind = %info.kind, room, "created portal room");
        Ok(room)
    }

    /// Registers the puppet of a Mattermost account once per process, refreshing its
    /// profile, and joins it to `room_id`.
    async fn ensure_puppet(&self, login: &LoginSession, mm_user_id: &str, room_id: &str) -> BridgeResult<String> {
        let mxid = self.matrix.puppet_user_id(mm_user_id);
        if !self.puppets.lock().contains(&mxid) {
            self.sync_puppet(login, mm_user_id, &mxid).await?;
            self.puppets.lock().insert(mxid.clone());
        }

        let pair = (room_id.to_string(), mxid.clone());
        if !self.joined.lock().contains(&pair) {
            if let Err(err) = self.matrix.invite(room_id, &mxid).await {
                debug!(room_id, mxid, error = %err, "puppet invite failed, joining anyway");
            }
            self.matrix
                .join_as(room_id, &mxid)
                .await
                .map_err(BridgeError::matrix)?;
            self.joined.lock().insert(pair);
        }
        Ok(mxid)
    }

    async fn sync_puppet(&self, login: &LoginSession, mm_user_id: &str, mxid: &str) -> BridgeResult<()> {
        let users = self.db.user_store();
        let existing = users.get_puppet(mm_user_id).await?;
        let info = match self.relay(login) {
            Ok(relay) => relay.get_user_info(mm_user_id).await.ok(),
            Err(_) => None,
        };
        let name = info.as_ref().map(|i| i.name.clone());
        let avatar_id = info.as_ref().and_then(|i| i.avatar_id.clone());

        match &existing {
            None => {
                self.matrix
                    .ensure_puppet_registered(mxid, name.as_deref())
                    .await
                    .map_err(BridgeError::matrix)?;
            }
            Some(record) => {
                if let Some(name) = &name
                    && record.display_name.as_ref() != Some(name)
                    && let Err(err) = self.matrix.set_display_name(mxid, name).await
                {
                    warn!(mxid, error = %err, "failed to update puppet name");
                }
            }
        }

        let previous_avatar = existing.as_ref().and_then(|r| r.avatar_id.clone());
        if avatar_id.is_some() && avatar_id != previous_avatar {
            self.sync_puppet_avatar(login, mm_user_id, mxid).await;
        }

        let now = Utc::now();
        users
            .upsert_puppet(&PuppetRecord {
                id: 0,
                mm_user_id: mm_user_id.to_string(),
                matrix_user_id: mxid.to_string(),
                display_name: name.or_else(|| existing.as_ref().and_then(|r| r.display_name.clone())),
                avatar_id: avatar_id.or(previous_avatar),
                created_at: existing.as_ref().map(|r| r.created_at).unwrap_or(now),
                updated_at: now,
            })
            .await?;
        Ok(())
    }

    async fn sync_puppet_avatar(&self, login: &LoginSession, mm_user_id: &str, mxid: &str) {
        let image = match login.client().get_profile_image(mm_user_id).await {
            Ok(image) => image,
            Err(err) => {
                debug!(mm_user_id, error = %err, "no profile image");
                return;
            }
        };
        let mime = crate::convert::sniff_mime(&image);
        let uploaded = self.media.upload(image, "avatar", mime).await;
        match uploaded {
            Ok(mxc) => {
                if let Err(err) = self.matrix.set_avatar_url(mxid, &mxc).await {
                    warn!(mxid, error = %err, "failed to set puppet avatar");
                }
            }
            Err(err) => warn!(mxid, error = %err, "failed to upload puppet avatar"),
        }
    }

    async fn post_converted(
        &self,
        login: &LoginSession,
        room_id: &str,
        post: &Post,
        converted: ConvertedMessage,
    ) -> BridgeResult<()> {
        if converted.is_empty() {
            debug!(post_id = %post.id, "nothing to bridge");
            return Ok(());
        }
        let messages = self.db.message_store();
        let sender = self.ensure_puppet(login, &post.user_id, room_id).await?;

        let thread_event = match &converted.thread_root {
            Some(root) => messages
                .get_by_mm_post_id(root)
                .await?
                .into_iter()
                .next()
                .map(|mapping| mapping.matrix_event_id),
            None => None,
        };

        for (index, part) in converted.parts.into_iter().enumerate() {
            let mut content = part.content;
            if let Some(root) = &thread_event {
                content["m.relates_to"] = json!({
                    "rel_type": "m.thread",
                    "event_id": root,
                    "is_falling_back": true,
                    "m.in_reply_to": { "event_id": root },
                });
            }
            let event_id = self
                .matrix
                .send_event_as(room_id, &sender, "m.room.message", &content)
                .await
                .map_err(BridgeError::matrix)?;
            messages
                .upsert_message_mapping(&MessageMapping {
                    id: 0,
                    mm_post_id: post.id.clone(),
                    part_index: index as i32,
                    mm_channel_id: post.channel_id.clone(),
                    matrix_room_id: room_id.to_string(),
                    matrix_event_id: event_id,
                    created_at: Utc::now(),
                })
                .await?;
        }
        Ok(())
    }

    async fn edit_message(&self, login: &LoginSession, post: &Post) -> BridgeResult<()> {
        let mappings = self.db.message_store().get_by_mm_post_id(&post.id).await?;
        let Some(first) = mappings.first() else {
            debug!(post_id = %post.id, "edit of an unbridged post");
            return Ok(());
        };
        let sender = self
            .ensure_puppet(login, &post.user_id, &first.matrix_room_id)
            .await?;

        let new_content = text_content(&post.message);
        let mut content = new_content.clone();
        content["body"] = json!(format!("* {}", post.message));
        if let Some(html) = new_content.get("formatted_body").and_then(|v| v.as_str()) {
            content["formatted_body"] = json!(format!("* {html}"));
        }
        content["m.new_content"] = new_content;
        content["m.relates_to"] = json!({
            "rel_type": "m.replace",
            "event_id": first.matrix_event_id,
        });
        self.matrix
            .send_event_as(&first.matrix_room_id, &sender, "m.room.message", &content)
            .await
            .map_err(BridgeError::matrix)?;
        Ok(())
    }

    async fn remove_message(&self, post_id: &str) -> BridgeResult<()> {
        let messages = self.db.message_store();
        let mappings = messages.get_by_mm_post_id(post_id).await?;
        if mappings.is_empty() {
            debug!(post_id, "removal of an unbridged post");
            return Ok(());
        }
        let bot = self.matrix.bot_user_id();
        for mapping in &mappings {
            if let Err(err) = self
                .matrix
                .redact_as(&mapping.matrix_room_id, &bot, &mapping.matrix_event_id)
                .await
            {
                warn!(event_id = %mapping.matrix_event_id, error = %err, "failed to redact");
            }
        }
        messages.delete_by_mm_post_id(post_id).await?;
        Ok(())
    }

    async fn add_reaction(
        &self,
        login: &LoginSession,
        mm_user_id: &str,
        post_id: &str,
        emoji_name: &str,
    ) -> BridgeResult<()> {
        let messages = self.db.message_store();
        if messages
            .get_reaction(post_id, mm_user_id, emoji_name)
            .await?
            .is_some()
        {
            return Ok(());
        }
        let Some(target) = messages.get_by_mm_post_id(post_id).await?.into_iter().next() else {
            debug!(post_id, "reaction to an unbridged post");
            return Ok(());
        };
        let sender = self
            .ensure_puppet(login, mm_user_id, &target.matrix_room_id)
            .await?;
        let content = json!({
            "m.relates_to": {
                "rel_type": "m.annotation",
                "event_id": target.matrix_event_id,
                "key": emoji::to_unicode(emoji_name),
            }
        });
        let event_id = self
            .matrix
            .send_event_as(&target.matrix_room_id, &sender, "m.reaction", &content)
            .await
            .map_err(BridgeError::matrix)?;
        messages
            .upsert_reaction(&ReactionMapping {
                id: 0,
                mm_post_id: post_id.to_string(),
                mm_user_id: mm_user_id.to_string(),
                emoji_name: emoji_name.to_string(),
                matrix_room_id: target.matrix_room_id,
                matrix_event_id: event_id,
                created_at: Utc::now(),
            })
            .await?;
        Ok(())
    }

    async fn remove_reaction(&self, mm_user_id: &str, post_id: &str, emoji_name: &str) -> BridgeResult<()> {
        let messages = self.db.message_store();
        let Some(mapping) = messages.get_reaction(post_id, mm_user_id, emoji_name).await? else {
            return Ok(());
        };
        let sender = self.matrix.puppet_user_id(mm_user_id);
        self.matrix
            .redact_as(&mapping.matrix_room_id, &sender, &mapping.matrix_event_id)
            .await
            .map_err(BridgeError::matrix)?;
        messages.delete_reaction(post_id, mm_user_id, emoji_name).await?;
        Ok(())
    }
}

#[async_trait]
impl BridgeRuntime for LocalRuntime {
    async fn queue_remote_event(&self, login: Arc<LoginSession>, event: RemoteEvent) -> BridgeResult<()> {
        if self.is_repeat(&event) {
            debug!(kind = event.kind(), "dropping repeated event");
            return Ok(());
        }

        let key = event.portal_key();
        let mut queues = self.queues.lock();
        let mut item = (login, event);
        if let Some(tx) = queues.get(&key) {
            match tx.send(item) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(returned)) => item = returned,
            }
        }
        let tx = self
            .spawn_worker(key.clone())
            .ok_or_else(|| BridgeError::NotFound("runtime is shutting down".to_string()))?;
        tx.send(item)
            .map_err(|_| BridgeError::NotFound(format!("queue for portal {key}")))?;
        queues.insert(key, tx);
        Ok(())
    }

    async fn get_portal(&self, key: &PortalKey) -> BridgeResult<Option<Portal>> {
        self.db
            .room_store()
            .get_portal(&key.id, &key.receiver)
            .await?
            .map(Portal::try_from)
            .transpose()
    }

    async fn get_portal_by_room(&self, room_id: &str) -> BridgeResult<Option<Portal>> {
        self.db
            .room_store()
            .get_portal_by_room(room_id)
            .await?
            .map(Portal::try_from)
            .transpose()
    }

    async fn save_portal(&self, portal: &Portal) -> BridgeResult<()> {
        self.db.room_store().upsert_portal(&portal.to_record()).await?;
        if let Some(room) = &portal.mxid {
            self.notify_room(&portal.key, room);
        }
        Ok(())
    }

    async fn list_portals(&self) -> BridgeResult<Vec<Portal>> {
        let rooms = self.db.room_store();
        let mut portals = Vec::new();
        let mut offset = 0;
        loop {
            let page = rooms.list_portals(PORTAL_PAGE_SIZE, offset).await?;
            let done = (page.len() as i64) < PORTAL_PAGE_SIZE;
            for record in page {
                portals.push(Portal::try_from(record)?);
            }
            if done {
                break;
            }
            offset += PORTAL_PAGE_SIZE;
        }
        Ok(portals)
    }

    async fn get_ghost(&self, matrix_user_id: &str) -> BridgeResult<Option<Ghost>> {
        self.db
            .user_store()
            .get_ghost(matrix_user_id)
            .await?
            .map(Ghost::try_from)
            .transpose()
    }

    async fn get_ghost_by_mm_id(&self, mm_user_id: &str) -> BridgeResult<Option<Ghost>> {
        self.db
            .user_store()
            .get_ghost_by_mm_id(mm_user_id)
            .await?
            .map(Ghost::try_from)
            .transpose()
    }

    async fn save_ghost(&self, ghost: &Ghost) -> BridgeResult<()> {
        self.db.user_store().upsert_ghost(&ghost.to_record()).await?;
        Ok(())
    }

    async fn get_login(&self, id: &str) -> BridgeResult<Option<StoredLogin>> {
        self.db
            .login_store()
            .get_login(id)
            .await?
            .map(StoredLogin::try_from)
            .transpose()
    }

    async fn save_login(&self, login: &StoredLogin) -> BridgeResult<()> {
        self.db.login_store().upsert_login(&login.to_record()).await?;
        Ok(())
    }

    async fn delete_login(&self, id: &str) -> BridgeResult<()> {
        self.db.login_store().delete_login(id).await?;
        Ok(())
    }

    async fn list_logins(&self) -> BridgeResult<Vec<StoredLogin>> {
        self.db
            .login_store()
            .list_logins()
            .await?
            .into_iter()
            .map(StoredLogin::try_from)
            .collect()
    }

    async fn wait_for_portal_room(&self, key: &PortalKey) -> BridgeResult<Option<String>> {
        let wait = &self.config.mattermost.portal_wait;
        let interval = Duration::from_millis(wait.interval_ms);
        let mut rx = self.watcher(key);
        for attempt in 0..wait.attempts {
            if let Some(room) = self.get_portal(key).await?.and_then(|p| p.mxid) {
                return Ok(Some(room));
            }
            if let Some(room) = rx.borrow_and_update().clone() {
                return Ok(Some(room));
            }
            debug!(portal = %key, attempt, "waiting for portal room");
            let _ = tokio::time::timeout(interval, rx.changed()).await;
        }
        Ok(None)
    }

    async fn set_portal_relay(&self, key: &PortalKey, login_id: &str) -> BridgeResult<()> {
        let mut portal = self
            .get_portal(key)
            .await?
            .ok_or_else(|| BridgeError::NotFound(format!("portal {key}")))?;
        portal.relay_login_id = Some(login_id.to_string());
        self.save_portal(&portal).await
    }

    async fn invite_to_room(&self, room_id: &str, matrix_user_id: &str) -> BridgeResult<()> {
        self.matrix
            .invite(room_id, matrix_user_id)
            .await
            .map_err(BridgeError::matrix)
    }
}
