//! Writes Matrix activity to Mattermost as the acting user's ghost account.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::convert::{MatrixMedia, MessageConverter, emoji, message_text};
use crate::error::{BridgeError, BridgeResult};
use crate::events::{EventMeta, RemoteEvent};
use crate::identity::IdentityManager;
use crate::mattermost::models::{Post, Reaction, User};
use crate::mattermost::{MattermostApi, MattermostError};
use crate::portal::{ChatInfo, ChatMember, ConversationKind, PortalKey};
use crate::registry::LoginSession;
use crate::runtime::BridgeRuntime;

mod backfill;

pub use self::backfill::{BackfillMessage, DEFAULT_FETCH_COUNT, FetchResult};

const MEMBER_PAGE_SIZE: u32 = 200;

/// Display name and avatar of a Mattermost account, as shown on its Matrix puppet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub name: String,
    /// Changes whenever the profile picture does.
    pub avatar_id: Option<String>,
    pub is_ghost: bool,
}

/// A direct channel opened by [`MattermostRelay::create_chat`]. `setup` finishes once the
/// Matrix room exists and the participants have been invited, or once waiting gave up.
#[derive(Debug)]
pub struct DirectChat {
    pub key: PortalKey,
    pub channel_id: String,
    pub info: ChatInfo,
    pub setup: JoinHandle<()>,
}

#[derive(Debug)]
pub struct ResolvedIdentifier {
    pub user: User,
    /// Set when the account is a ghost of this Matrix user.
    pub matrix_user_id: Option<String>,
    pub chat: Option<DirectChat>,
}

fn not_found(what: String) -> impl FnOnce(MattermostError) -> BridgeError {
    move |err| {
        if err.is_not_found() {
            BridgeError::NotFound(what)
        } else {
            err.into()
        }
    }
}

/// Portal metadata for a channel or, when no channel has that ID, a team.
pub async fn load_chat_info(
    client: &dyn MattermostApi,
    identity: &IdentityManager,
    conversation_id: &str,
) -> BridgeResult<ChatInfo> {
    let channel = match client.get_channel(conversation_id).await {
        Ok(channel) => channel,
        Err(err) if err.is_not_found() => {
            let team = client
                .get_team(conversation_id)
                .await
                .map_err(not_found(format!("conversation {conversation_id}")))?;
            let mut info = ChatInfo::new(ConversationKind::Team);
            info.name = Some(team.display_name).filter(|name| !name.is_empty());
            info.topic = Some(team.description).filter(|topic| !topic.is_empty());
            return Ok(info);
        }
        Err(err) => return Err(err.into()),
    };

    let kind = ConversationKind::from_channel_type(&channel.channel_type).ok_or_else(|| {
        BridgeError::Conversion(format!("unknown channel type {}", channel.channel_type))
    })?;
    let mut info = ChatInfo::new(kind);
    if kind != ConversationKind::Direct {
        info.name = Some(channel.display_name).filter(|name| !name.is_empty());
    }
    info.topic = Some(channel.purpose)
        .filter(|purpose| !purpose.is_empty())
        .or_else(|| Some(channel.header).filter(|header| !header.is_empty()));
    if matches!(kind, ConversationKind::Open | ConversationKind::Private)
        && !channel.team_id.is_empty()
    {
        info.parent = Some(PortalKey::new(channel.team_id));
    }

    let mut page = 0;
    loop {
        let members = client
            .get_channel_members(conversation_id, page, MEMBER_PAGE_SIZE)
            .await?;
        for member in &members {
            info.members.push(ChatMember {
                mm_user_id: member.user_id.clone(),
                matrix_user_id: identity.matrix_id_for(&member.user_id).await?,
            });
        }
        if members.len() < MEMBER_PAGE_SIZE as usize {
            break;
        }
        page += 1;
    }
    Ok(info)
}

/// Per-login writer for Matrix-originated activity.
pub struct MattermostRelay {
    login: Arc<LoginSession>,
    identity: Arc<IdentityManager>,
    runtime: Arc<dyn BridgeRuntime>,
    converter: Arc<MessageConverter>,
    media: Arc<dyn MatrixMedia>,
    joined: Mutex<HashSet<(String, String)>>,
}

impl MattermostRelay {
    pub fn new(
        login: Arc<LoginSession>,
        identity: Arc<IdentityManager>,
        runtime: Arc<dyn BridgeRuntime>,
        converter: Arc<MessageConverter>,
        media: Arc<dyn MatrixMedia>,
    ) -> Self {
        Self {
            login,
            identity,
            runtime,
            converter,
            media,
            joined: Mutex::new(HashSet::new()),
        }
    }

    pub fn login(&self) -> &Arc<LoginSession> {
        &self.login
    }

    /// Adds the ghost to an open or private channel. Direct and group channels fix their
    /// members at creation and are left alone.
    async fn ensure_member(&self, channel_id: &str, mm_user_id: &str) -> BridgeResult<()> {
        let pair = (channel_id.to_string(), mm_user_id.to_string());
        if self.joined.lock().contains(&pair) {
            return Ok(());
        }
        let direct = self
            .runtime
            .get_portal(&PortalKey::new(channel_id))
            .await?
            .is_some_and(|portal| portal.kind.is_direct_like());
        if !direct {
            match self
                .identity
                .admin()
                .add_channel_member(channel_id, mm_user_id)
                .await
            {
                Ok(()) => debug!(channel_id, mm_user_id, "added ghost to channel"),
                Err(err) if err.is_already_member() => {}
                Err(err) => return Err(err.into()),
            }
        }
        self.joined.lock().insert(pair);
        Ok(())
    }

    /// Maps a rejected ghost token to a fresh one on the next action.
    async fn check_auth<T>(&self, sender: &str, result: Result<T, MattermostError>) -> BridgeResult<T> {
        match result {
            Ok(value) => Ok(value),
            Err(err) if err.is_unauthorized() => {
                self.identity.invalidate_token(sender).await?;
                Err(BridgeError::Unauthorized(format!("ghost token for {sender}")))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn send_message(
        &self,
        channel_id: &str,
        sender: &str,
        event_id: &str,
        content: &Value,
        thread_root: Option<&str>,
    ) -> BridgeResult<Post> {
        let (client, mm_user_id) = self.identity.get_or_issue_token(sender).await?;
        self.ensure_member(channel_id, &mm_user_id).await?;

        let mut post = self
            .converter
            .to_mattermost(content, channel_id, client.as_ref(), self.media.as_ref())
            .await?;
        if let Some(root) = thread_root {
            post.root_id = root.to_string();
        }
        post.mark_from_matrix(Some(event_id));

        let created = self.check_auth(sender, client.create_post(&post).await).await?;
        debug!(post_id = %created.id, channel_id, sender, "relayed matrix message");
        Ok(created)
    }

    pub async fn edit_message(
        &self,
        sender: &str,
        post_id: &str,
        new_content: &Value,
    ) -> BridgeResult<Post> {
        let (client, _) = self.identity.get_or_issue_token(sender).await?;
        let message = message_text(new_content);
        self.check_auth(sender, client.update_post(post_id, &message).await)
            .await
    }

    pub async fn remove_message(&self, sender: &str, post_id: &str) -> BridgeResult<()> {
        let (client, _) = self.identity.get_or_issue_token(sender).await?;
        match client.delete_post(post_id).await {
            Err(err) if err.is_not_found() => {
                debug!(post_id, "post already gone");
                Ok(())
            }
            other => self.check_auth(sender, other).await,
        }
    }

    /// Returns the reaction as stored, with the ghost as its author.
    pub async fn add_reaction(
        &self,
        channel_id: &str,
        sender: &str,
        post_id: &str,
        key: &str,
    ) -> BridgeResult<Reaction> {
        let emoji_name = emoji::to_name(key)
            .ok_or_else(|| BridgeError::Conversion(format!("no mattermost emoji for {key}")))?;
        let (client, mm_user_id) = self.identity.get_or_issue_token(sender).await?;
        self.ensure_member(channel_id, &mm_user_id).await?;
        let reaction = Reaction {
            user_id: mm_user_id,
            post_id: post_id.to_string(),
            emoji_name,
            ..Default::default()
        };
        self.check_auth(sender, client.save_reaction(&reaction).await)
            .await
    }

    pub async fn remove_reaction(
        &self,
        channel_id: &str,
        sender: &str,
        post_id: &str,
        emoji_name: &str,
    ) -> BridgeResult<()> {
        let (client, mm_user_id) = self.identity.get_or_issue_token(sender).await?;
        self.ensure_member(channel_id, &mm_user_id).await?;
        let result = client
            .delete_reaction(&mm_user_id, post_id, emoji_name)
            .await;
        self.check_auth(sender, result).await
    }

    /// Looks up a Mattermost account by Matrix ID, email or username. Matrix IDs resolve to
    /// their ghost, which is provisioned when missing.
    pub async fn resolve_identifier(
        &self,
        identifier: &str,
        create_chat: bool,
    ) -> BridgeResult<ResolvedIdentifier> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Err(BridgeError::NotFound("empty identifier".to_string()));
        }
        let admin = self.identity.admin();

        let user = if identifier.starts_with('@') && identifier.contains(':') {
            let mm_user_id = self.identity.resolve_or_provision(identifier).await?;
            admin.get_user(&mm_user_id).await?
        } else if identifier.contains('@') && !identifier.starts_with('@') {
            admin
                .get_user_by_email(identifier)
                .await
                .map_err(not_found(format!("user {identifier}")))?
        } else {
            let username = identifier.trim_start_matches('@');
            admin
                .get_user_by_username(username)
                .await
                .map_err(not_found(format!("user {identifier}")))?
        };

        let matrix_user_id = self.identity.ghost_matrix_id(&user);
        let chat = if create_chat {
            Some(self.create_chat(&user).await?)
        } else {
            None
        };
        Ok(ResolvedIdentifier {
            user,
            matrix_user_id,
            chat,
        })
    }

    /// Opens the direct channel between this login and `user` and queues its portal. Once
    /// the Matrix room exists the login owner and, for ghosts, the Matrix user behind them
    /// are invited and this login becomes the portal's relay.
    pub async fn create_chat(&self, user: &User) -> BridgeResult<DirectChat> {
        let channel = self
            .login
            .client()
            .create_direct_channel(&self.login.mm_user_id, &user.id)
            .await?;
        let key = PortalKey::new(channel.id.clone());

        let mut info = ChatInfo::new(ConversationKind::Direct);
        info.members.push(ChatMember {
            mm_user_id: self.login.mm_user_id.clone(),
            matrix_user_id: None,
        });
        let other_matrix_id = self.identity.ghost_matrix_id(user);
        if user.id != self.login.mm_user_id {
            info.members.push(ChatMember {
                mm_user_id: user.id.clone(),
                matrix_user_id: other_matrix_id.clone(),
            });
        }

        let meta = EventMeta::new(
            channel.id.clone(),
            self.login.mm_user_id.clone(),
            chrono::Utc::now().timestamp_millis(),
        );
        self.runtime
            .queue_remote_event(
                self.login.clone(),
                RemoteEvent::ChatInfoChanged {
                    meta,
                    info: info.clone(),
                },
            )
            .await?;

        let mut invitees = vec![self.login.matrix_user_id.clone()];
        invitees.extend(other_matrix_id);
        let setup = self.spawn_room_setup(key.clone(), invitees);
        info!(channel_id = %channel.id, other = %user.username, "opened direct chat");

        Ok(DirectChat {
            key,
            channel_id: channel.id,
            info,
            setup,
        })
    }

    fn spawn_room_setup(&self, key: PortalKey, invitees: Vec<String>) -> JoinHandle<()> {
        let runtime = self.runtime.clone();
        let login_id = self.login.id.clone();
        tokio::spawn(async move {
            let room_id = match runtime.wait_for_portal_room(&key).await {
                Ok(Some(room_id)) => room_id,
                Ok(None) => {
                    warn!(portal = %key, "portal room never appeared, skipping invites");
                    return;
                }
                Err(err) => {
                    warn!(portal = %key, error = %err, "waiting for portal room failed");
                    return;
                }
            };
            for invitee in &invitees {
                if let Err(err) = runtime.invite_to_room(&room_id, invitee).await {
                    warn!(room_id, invitee, error = %err, "failed to invite to direct chat");
                }
            }
            if let Err(err) = runtime.set_portal_relay(&key, &login_id).await {
                warn!(portal = %key, error = %err, "failed to set portal relay");
            }
        })
    }

    pub async fn get_chat_info(&self, conversation_id: &str) -> BridgeResult<ChatInfo> {
        load_chat_info(
            self.login.client().as_ref(),
            &self.identity,
            conversation_id,
        )
        .await
    }

    pub async fn get_user_info(&self, mm_user_id: &str) -> BridgeResult<UserInfo> {
        let user = self
            .login
            .client()
            .get_user(mm_user_id)
            .await
            .map_err(not_found(format!("user {mm_user_id}")))?;
        Ok(UserInfo {
            name: user.display_name(),
            avatar_id: (user.last_picture_update > 0)
                .then(|| user.last_picture_update.to_string()),
            is_ghost: self.identity.is_ghost_username(&user.username),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::MattermostRelay;
    use crate::convert::MessageConverter;
    use crate::error::BridgeError;
    use crate::events::RemoteEvent;
    use crate::identity::{IdentityManager, LoginMetadata};
    use crate::mattermost::testing::FakeMattermost;
    use crate::portal::{ConversationKind, Portal, PortalKey};
    use crate::registry::{LoginSession, StoredLogin};
    use crate::runtime::testing::{MemoryMedia, RecordingRuntime};

    pub(crate) struct Harness {
        pub fake: FakeMattermost,
        pub runtime: Arc<RecordingRuntime>,
        pub identity: Arc<IdentityManager>,
        pub relay: MattermostRelay,
    }

    pub(crate) fn harness() -> Harness {
        let fake = FakeMattermost::new();
        let runtime = Arc::new(RecordingRuntime::new());
        let identity = Arc::new(IdentityManager::new(
            Arc::new(fake.clone()),
            runtime.clone(),
            "mx.",
            "matrix.bridge.local",
        ));
        let owner = fake.add_user("owner");
        let login = Arc::new(LoginSession::new(
            StoredLogin {
                id: "login1".to_string(),
                matrix_user_id: "@owner:example.org".to_string(),
                metadata: LoginMetadata::new("owner-token", owner.id.clone()),
            },
            "owner",
            fake.client_for(&owner.id),
        ));
        let relay = MattermostRelay::new(
            login,
            identity.clone(),
            runtime.clone(),
            Arc::new(MessageConverter::new(1024 * 1024)),
            Arc::new(MemoryMedia::new()),
        );
        Harness {
            fake,
            runtime,
            identity,
            relay,
        }
    }

    #[tokio::test]
    async fn message_is_posted_as_the_ghost_with_loop_marker() {
        let h = harness();
        let team = h.fake.add_team("eng");
        let channel = h.fake.add_channel(&team.id, "O", "town-square");

        let post = h
            .relay
            .send_message(
                &channel.id,
                "@alice:example.org",
                "$ev1",
                &json!({"msgtype": "m.text", "body": "hello from matrix"}),
                None,
            )
            .await
            .expect("sent");

        let ghost = h.fake.user_by_username("mx.alice_example.org").expect("ghost");
        assert_eq!(post.user_id, ghost.id);
        assert!(post.is_from_matrix());
        assert_eq!(post.props["matrix_event_id"], "$ev1");
        assert!(h.fake.channel_members(&channel.id).contains(&ghost.id));
    }

    #[tokio::test]
    async fn existing_membership_is_tolerated() {
        let h = harness();
        let team = h.fake.add_team("eng");
        let channel = h.fake.add_channel(&team.id, "O", "town-square");
        let mm_id = h
            .identity
            .resolve_or_provision("@alice:example.org")
            .await
            .expect("provisioned");
        h.fake.add_member(&channel.id, &mm_id);

        let content = json!({"msgtype": "m.text", "body": "hi"});
        h.relay
            .send_message(&channel.id, "@alice:example.org", "$a", &content, None)
            .await
            .expect("first");
        h.relay
            .send_message(&channel.id, "@alice:example.org", "$b", &content, None)
            .await
            .expect("second");

        assert_eq!(h.fake.calls("add_channel_member"), 1);
        assert_eq!(h.fake.channel_posts(&channel.id).len(), 2);
    }

    #[tokio::test]
    async fn thread_replies_keep_their_root() {
        let h = harness();
        let team = h.fake.add_team("eng");
        let channel = h.fake.add_channel(&team.id, "O", "town-square");
        let human = h.fake.add_user("dave");
        let root = h.fake.add_post(&channel.id, &human.id, "root");

        let reply = h
            .relay
            .send_message(
                &channel.id,
                "@alice:example.org",
                "$reply",
                &json!({"msgtype": "m.text", "body": "in thread"}),
                Some(&root.id),
            )
            .await
            .expect("sent");
        assert_eq!(reply.root_id, root.id);
    }

    #[tokio::test]
    async fn direct_portals_skip_membership() {
        let h = harness();
        let channel = h.fake.add_channel("", "D", "a__b");
        h.runtime
            .insert_portal(Portal::new(PortalKey::new(channel.id.clone()), ConversationKind::Direct));

        h.relay
            .send_message(
                &channel.id,
                "@alice:example.org",
                "$ev",
                &json!({"msgtype": "m.text", "body": "dm"}),
                None,
            )
            .await
            .expect("sent");
        assert_eq!(h.fake.calls("add_channel_member"), 0);
    }

    #[tokio::test]
    async fn edits_deletes_and_reactions_act_as_the_ghost() {
        let h = harness();
        let team = h.fake.add_team("eng");
        let channel = h.fake.add_channel(&team.id, "O", "town-square");
        let sender = "@alice:example.org";
        let post = h
            .relay
            .send_message(&channel.id, sender, "$ev", &json!({"msgtype": "m.text", "body": "v1"}), None)
            .await
            .expect("sent");

        let edited = h
            .relay
            .edit_message(sender, &post.id, &json!({"msgtype": "m.text", "body": "v2"}))
            .await
            .expect("edited");
        assert_eq!(edited.message, "v2");

        let reaction = h
            .relay
            .add_reaction(&channel.id, sender, &post.id, "👍")
            .await
            .expect("reacted");
        assert_eq!(reaction.emoji_name, "+1");
        let name = reaction.emoji_name;
        let reactions = h.fake.reactions();
        assert_eq!(reactions.len(), 1);
        assert_eq!(reactions[0].user_id, post.user_id);

        h.relay
            .remove_reaction(&channel.id, sender, &post.id, &name)
            .await
            .expect("unreacted");
        assert!(h.fake.reactions().is_empty());

        h.relay.remove_message(sender, &post.id).await.expect("removed");
        assert!(h.fake.post(&post.id).is_none());
        h.relay
            .remove_message(sender, &post.id)
            .await
            .expect("second removal is a no-op");
    }

    #[tokio::test]
    async fn reacting_in_a_fresh_channel_joins_the_ghost_first() {
        let h = harness();
        let team = h.fake.add_team("eng");
        let channel = h.fake.add_channel(&team.id, "O", "town-square");
        let dave = h.fake.add_user("dave");
        let post = h.fake.add_post(&channel.id, &dave.id, "hello");
        let sender = "@alice:example.org";

        let reaction = h
            .relay
            .add_reaction(&channel.id, sender, &post.id, "👍")
            .await
            .expect("reacted");
        assert_eq!(h.fake.calls("add_channel_member"), 1);
        assert!(h.fake.channel_members(&channel.id).contains(&reaction.user_id));

        h.relay
            .remove_reaction(&channel.id, sender, &post.id, &reaction.emoji_name)
            .await
            .expect("unreacted");
        assert_eq!(h.fake.calls("add_channel_member"), 1);
        assert!(h.fake.reactions().is_empty());
    }

    #[tokio::test]
    async fn unmapped_reaction_is_a_conversion_error() {
        let h = harness();
        let result = h
            .relay
            .add_reaction("c1", "@alice:example.org", "p1", "🦀")
            .await;
        assert!(matches!(result, Err(BridgeError::Conversion(_))));
        assert_eq!(h.fake.calls("save_reaction"), 0);
    }

    #[tokio::test]
    async fn failed_write_leaves_no_post() {
        let h = harness();
        let team = h.fake.add_team("eng");
        let channel = h.fake.add_channel(&team.id, "O", "town-square");
        h.fake.fail("create_post");

        let result = h
            .relay
            .send_message(
                &channel.id,
                "@alice:example.org",
                "$ev",
                &json!({"msgtype": "m.text", "body": "lost"}),
                None,
            )
            .await;
        assert!(result.is_err());
        assert!(h.fake.channel_posts(&channel.id).is_empty());
    }

    #[tokio::test]
    async fn identifiers_resolve_by_username_email_and_matrix_id() {
        let h = harness();
        let dave = h.fake.add_user("dave");

        let by_name = h.relay.resolve_identifier("dave", false).await.expect("by name");
        assert_eq!(by_name.user.id, dave.id);
        assert!(by_name.matrix_user_id.is_none());

        let by_email = h
            .relay
            .resolve_identifier(&dave.email, false)
            .await
            .expect("by email");
        assert_eq!(by_email.user.id, dave.id);

        let ghost = h
            .relay
            .resolve_identifier("@carol:example.org", false)
            .await
            .expect("provisioned");
        assert_eq!(ghost.user.username, "mx.carol_example.org");
        assert_eq!(ghost.matrix_user_id.as_deref(), Some("@carol:example.org"));

        let missing = h.relay.resolve_identifier("nobody", false).await;
        assert!(matches!(missing, Err(BridgeError::NotFound(_))));
    }

    #[tokio::test]
    async fn direct_chat_invites_participants_once_the_room_exists() {
        let h = harness();
        let resolved = h
            .relay
            .resolve_identifier("@carol:example.org", true)
            .await
            .expect("resolved");
        let chat = resolved.chat.expect("chat created");

        let events = h.runtime.events();
        assert_eq!(events.len(), 1);
        match &events[0].1 {
            RemoteEvent::ChatInfoChanged { info, .. } => {
                assert_eq!(info.kind, ConversationKind::Direct);
                assert_eq!(info.members.len(), 2);
                assert_eq!(
                    info.members[1].matrix_user_id.as_deref(),
                    Some("@carol:example.org")
                );
            }
            other => panic!("unexpected event {other:?}"),
        }

        h.runtime.materialize(&chat.key, "!dm:example.org");
        chat.setup.await.expect("setup task");

        let invites = h.runtime.invites();
        assert!(invites.contains(&("!dm:example.org".to_string(), "@owner:example.org".to_string())));
        assert!(invites.contains(&("!dm:example.org".to_string(), "@carol:example.org".to_string())));
        let portal = h.runtime.portal(&chat.key).expect("portal");
        assert_eq!(portal.relay_login_id.as_deref(), Some("login1"));
    }

    #[tokio::test]
    async fn direct_chat_without_room_gives_up_quietly() {
        let h = harness();
        let dave = h.fake.add_user("dave");
        let chat = h.relay.create_chat(&dave).await.expect("created");
        chat.setup.await.expect("setup task");
        assert!(h.runtime.invites().is_empty());
    }

    #[tokio::test]
    async fn chat_info_follows_channel_type() {
        let h = harness();
        let team = h.fake.add_team("eng");
        let channel = h.fake.add_channel(&team.id, "O", "town-square");
        let dave = h.fake.add_user("dave");
        h.fake.add_member(&channel.id, &dave.id);

        let info = h.relay.get_chat_info(&channel.id).await.expect("info");
        assert_eq!(info.kind, ConversationKind::Open);
        assert_eq!(info.parent, Some(PortalKey::new(team.id.clone())));
        assert_eq!(info.members.len(), 1);

        let team_info = h.relay.get_chat_info(&team.id).await.expect("team info");
        assert_eq!(team_info.kind, ConversationKind::Team);

        let missing = h.relay.get_chat_info("nope").await;
        assert!(matches!(missing, Err(BridgeError::NotFound(_))));
    }

    #[tokio::test]
    async fn user_info_uses_full_name() {
        let h = harness();
        let dave = h.fake.add_user("dave");
        let info = h.relay.get_user_info(&dave.id).await.expect("info");
        assert_eq!(info.name, "dave");
        assert!(!info.is_ghost);
        assert!(info.avatar_id.is_none());
    }
}
