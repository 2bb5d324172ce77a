//! Turns Mattermost websocket frames into runtime events and hands them to login sessions.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::BridgeMode;
use crate::events::{EventMeta, RemoteEvent};
use crate::identity::IdentityManager;
use crate::mattermost::websocket::WsEvent;
use crate::registry::{LoginSession, SessionRegistry};
use crate::runtime::BridgeRuntime;
use crate::web::metrics::Metrics;

mod listener;

pub use self::listener::{ConnectionState, WebSocketListener, backoff_delay};

/// Maps a classified frame to the runtime's event model. Control frames and unsupported
/// events yield `None`.
pub fn normalize(event: WsEvent) -> Option<RemoteEvent> {
    match event {
        WsEvent::Posted { post, sender_name } => {
            if post.is_system() {
                debug!(post_id = %post.id, post_type = %post.post_type, "ignoring system post");
                return None;
            }
            let mut meta = EventMeta::new(&post.channel_id, &post.user_id, post.create_at);
            meta.sender_username = sender_name;
            Some(RemoteEvent::MessagePosted { meta, post })
        }
        WsEvent::PostEdited { post } => {
            let at = if post.edit_at > 0 {
                post.edit_at
            } else {
                post.update_at
            };
            let meta = EventMeta::new(&post.channel_id, &post.user_id, at);
            Some(RemoteEvent::MessageEdited { meta, post })
        }
        WsEvent::PostDeleted { post } => {
            let at = if post.delete_at > 0 {
                post.delete_at
            } else {
                chrono::Utc::now().timestamp_millis()
            };
            let meta = EventMeta::new(&post.channel_id, &post.user_id, at);
            Some(RemoteEvent::MessageRemoved {
                meta,
                post_id: post.id,
            })
        }
        WsEvent::ReactionAdded { reaction } => Some(RemoteEvent::ReactionAdded {
            meta: EventMeta::new(&reaction.channel_id, &reaction.user_id, reaction.create_at),
            post_id: reaction.post_id,
            emoji_name: reaction.emoji_name,
        }),
        WsEvent::ReactionRemoved { reaction } => Some(RemoteEvent::ReactionRemoved {
            meta: EventMeta::new(&reaction.channel_id, &reaction.user_id, reaction.create_at),
            post_id: reaction.post_id,
            emoji_name: reaction.emoji_name,
        }),
        WsEvent::Hello | WsEvent::Reply { .. } => None,
        WsEvent::Other(name) => {
            debug!(event = %name, "ignoring unsupported websocket event");
            None
        }
    }
}

/// Routes normalized events to login sessions, dropping anything the bridge wrote itself.
pub struct Dispatcher {
    sessions: Arc<SessionRegistry>,
    runtime: Arc<dyn BridgeRuntime>,
    identity: Arc<IdentityManager>,
    mode: BridgeMode,
}

impl Dispatcher {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        runtime: Arc<dyn BridgeRuntime>,
        identity: Arc<IdentityManager>,
        mode: BridgeMode,
    ) -> Self {
        Self {
            sessions,
            runtime,
            identity,
            mode,
        }
    }

    async fn is_echo(&self, event: &RemoteEvent) -> bool {
        match event {
            RemoteEvent::MessagePosted { post, .. } | RemoteEvent::MessageEdited { post, .. }
                if post.is_from_matrix() =>
            {
                return true;
            }
            // Deletions of bridged posts may come from Mattermost moderators.
            RemoteEvent::MessageRemoved { .. } => return false,
            _ => {}
        }
        let sender = &event.meta().sender_id;
        if sender.is_empty() {
            return false;
        }
        match self.identity.is_ghost_user_id(sender).await {
            Ok(is_ghost) => is_ghost,
            Err(err) => {
                warn!(sender, error = %err, "ghost lookup failed, dispatching anyway");
                false
            }
        }
    }

    fn targets(&self) -> Vec<Arc<LoginSession>> {
        match self.mode {
            BridgeMode::Mirror => self.sessions.first().into_iter().collect(),
            BridgeMode::Puppet => self.sessions.list(),
        }
    }

    /// Returns how many sessions the event was queued for.
    pub async fn dispatch(&self, event: WsEvent) -> usize {
        Metrics::mattermost_event_received();
        let Some(event) = normalize(event) else {
            return 0;
        };
        if self.is_echo(&event).await {
            debug!(kind = event.kind(), conversation = %event.meta().conversation_id, "dropping bridged echo");
            Metrics::mattermost_event_dropped();
            return 0;
        }

        let targets = self.targets();
        if targets.is_empty() {
            debug!(kind = event.kind(), "no login session to deliver to");
            return 0;
        }

        let mut delivered = 0;
        for login in targets {
            let login_id = login.id.clone();
            match self.runtime.queue_remote_event(login, event.clone()).await {
                Ok(()) => {
                    delivered += 1;
                    Metrics::mattermost_event_forwarded();
                }
                Err(err) => {
                    Metrics::mattermost_event_failed();
                    warn!(login = %login_id, kind = event.kind(), error = %err, "failed to queue event");
                }
            }
        }
        delivered
    }
}
