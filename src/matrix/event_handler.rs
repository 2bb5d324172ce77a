use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{MatrixAppservice, MatrixEvent};
use crate::db::{MessageMapping, MessageStore, ReactionMapping};
use crate::portal::Portal;
use crate::relay::MattermostRelay;
use crate::runtime::BridgeRuntime;
use crate::web::metrics::Metrics;

const AGE_LIMIT_MS: i64 = 900000;

/// Looks up the relay that writes on behalf of a login.
pub trait RelayProvider: Send + Sync {
    /// The relay of `login_id`, or any active relay when the portal has none.
    fn relay_for(&self, login_id: Option<&str>) -> Option<Arc<MattermostRelay>>;
}

/// Routes appservice events for portal rooms to the Mattermost relay.
pub struct MatrixEventProcessor {
    matrix: Arc<MatrixAppservice>,
    runtime: Arc<dyn BridgeRuntime>,
    messages: Arc<dyn MessageStore>,
    relays: Arc<dyn RelayProvider>,
}

fn relation(content: &Value) -> Option<(&str, &str)> {
    let relates_to = content.get("m.relates_to")?;
    let event_id = relates_to.get("event_id")?.as_str()?;
    let rel_type = relates_to.get("rel_type").and_then(|v| v.as_str()).unwrap_or("");
    Some((rel_type, event_id))
}

impl MatrixEventProcessor {
    pub fn new(
        matrix: Arc<MatrixAppservice>,
        runtime: Arc<dyn BridgeRuntime>,
        messages: Arc<dyn MessageStore>,
        relays: Arc<dyn RelayProvider>,
    ) -> Self {
        Self {
            matrix,
            runtime,
            messages,
            relays,
        }
    }

    fn check_event_age(event: &MatrixEvent) -> bool {
        if let Some(ts_str) = &event.timestamp
            && let Ok(ts) = ts_str.parse::<i64>()
        {
            let now = Utc::now().timestamp_millis();
            if ts > now {
                debug!(event_id = ?event.event_id, "event timestamp is in the future, allowing");
                return true;
            }
            let age = now - ts;
            if age > AGE_LIMIT_MS {
                info!(
                    age_ms = age,
                    event_id = ?event.event_id,
                    room_id = %event.room_id,
                    event_type = %event.event_type,
                    "skipping stale event"
                );
                return false;
            }
        }
        true
    }

    pub async fn process_event(&self, event: MatrixEvent) -> Result<()> {
        if !Self::check_event_age(&event) {
            return Ok(());
        }
        if self.matrix.is_bridge_user(&event.sender) {
            debug!(sender = %event.sender, event_type = %event.event_type, "ignoring bridge-sent event");
            return Ok(());
        }

        if event.event_type == "m.room.member" {
            return self.handle_room_member(&event).await;
        }
        if !matches!(
            event.event_type.as_str(),
            "m.room.message" | "m.reaction" | "m.room.redaction"
        ) {
            debug!(event_type = %event.event_type, "unhandled matrix event type");
            return Ok(());
        }

        Metrics::matrix_event_received();
        let Some(portal) = self.runtime.get_portal_by_room(&event.room_id).await? else {
            debug!(room_id = %event.room_id, "event in a room without a portal");
            return Ok(());
        };
        let Some(relay) = self.relays.relay_for(portal.relay_login_id.as_deref()) else {
            warn!(portal = %portal.key, "no login can relay this portal");
            Metrics::matrix_event_failed();
            return Ok(());
        };

        let result = match event.event_type.as_str() {
            "m.room.message" => self.handle_room_message(&relay, &portal, &event).await,
            "m.reaction" => self.handle_reaction(&relay, &portal, &event).await,
            _ => self.handle_redaction(&relay, &portal, &event).await,
        };
        match &result {
            Ok(()) => Metrics::matrix_event_forwarded(),
            Err(_) => Metrics::matrix_event_failed(),
        }
        result
    }

    async fn handle_room_member(&self, event: &MatrixEvent) -> Result<()> {
        let membership = event
            .content
            .as_ref()
            .and_then(|c| c.get("membership"))
            .and_then(|v| v.as_str());
        let bot_user_id = self.matrix.bot_user_id();
        if membership == Some("invite") && event.state_key.as_deref() == Some(bot_user_id.as_str()) {
            match self.matrix.join_as(&event.room_id, &bot_user_id).await {
                Ok(()) => info!(room_id = %event.room_id, "joined invited room"),
                Err(err) => warn!(room_id = %event.room_id, error = %err, "failed to join invited room"),
            }
        }
        Ok(())
    }

    async fn mapped_post(&self, event_id: &str) -> Result<Option<String>> {
        Ok(self
            .messages
            .get_by_matrix_event_id(event_id)
            .await?
            .map(|mapping| mapping.mm_post_id))
    }

    async fn handle_room_message(
        &self,
        relay: &MattermostRelay,
        portal: &Portal,
        event: &MatrixEvent,
    ) -> Result<()> {
        let Some(content) = &event.content else {
            return Ok(());
        };
        let Some(event_id) = event.event_id.as_deref() else {
            return Ok(());
        };

        match relation(content) {
            Some(("m.replace", target)) => {
                let Some(post_id) = self.mapped_post(target).await? else {
                    debug!(target, "edit of an unbridged event");
                    return Ok(());
                };
                let new_content = content.get("m.new_content").unwrap_or(content);
                relay.edit_message(&event.sender, &post_id, new_content).await?;
                return Ok(());
            }
            Some(("m.thread", root)) => {
                let root_post = self.mapped_post(root).await?;
                self.send(relay, portal, event, event_id, content, root_post.as_deref())
                    .await
            }
            _ => self.send(relay, portal, event, event_id, content, None).await,
        }
    }

    async fn send(
        &self,
        relay: &MattermostRelay,
        portal: &Portal,
        event: &MatrixEvent,
        event_id: &str,
        content: &Value,
        thread_root: Option<&str>,
    ) -> Result<()> {
        let post = relay
            .send_message(&portal.key.id, &event.sender, event_id, content, thread_root)
            .await?;
        self.messages
            .upsert_message_mapping(&MessageMapping {
                id: 0,
                mm_post_id: post.id,
                part_index: 0,
                mm_channel_id: portal.key.id.clone(),
                matrix_room_id: event.room_id.clone(),
                matrix_event_id: event_id.to_string(),
                created_at: Utc::now(),
            })
            .await?;
        Ok(())
    }

    async fn handle_reaction(
        &self,
        relay: &MattermostRelay,
        portal: &Portal,
        event: &MatrixEvent,
    ) -> Result<()> {
        let Some(content) = &event.content else {
            return Ok(());
        };
        let Some(("m.annotation", target)) = relation(content) else {
            return Ok(());
        };
        let Some(key) = content
            .get("m.relates_to")
            .and_then(|r| r.get("key"))
            .and_then(|v| v.as_str())
        else {
            return Ok(());
        };
        let Some(post_id) = self.mapped_post(target).await? else {
            debug!(target, "reaction to an unbridged event");
            return Ok(());
        };

        let reaction = relay
            .add_reaction(&portal.key.id, &event.sender, &post_id, key)
            .await?;
        if let Some(event_id) = &event.event_id {
            self.messages
                .upsert_reaction(&ReactionMapping {
                    id: 0,
                    mm_post_id: reaction.post_id,
                    mm_user_id: reaction.user_id,
                    emoji_name: reaction.emoji_name,
                    matrix_room_id: portal
                        .mxid
                        .clone()
                        .unwrap_or_else(|| event.room_id.clone()),
                    matrix_event_id: event_id.clone(),
                    created_at: Utc::now(),
                })
                .await?;
        }
        Ok(())
    }

    async fn handle_redaction(
        &self,
        relay: &MattermostRelay,
        portal: &Portal,
        event: &MatrixEvent,
    ) -> Result<()> {
        let Some(target) = event.redacts.as_deref() else {
            return Ok(());
        };

        if let Some(mapping) = self.messages.get_by_matrix_event_id(target).await? {
            relay.remove_message(&event.sender, &mapping.mm_post_id).await?;
            self.messages.delete_by_mm_post_id(&mapping.mm_post_id).await?;
            return Ok(());
        }

        if let Some(mapping) = self.messages.get_reaction_by_matrix_event_id(target).await? {
            relay
                .remove_reaction(
                    &portal.key.id,
                    &event.sender,
                    &mapping.mm_post_id,
                    &mapping.emoji_name,
                )
                .await?;
            self.messages
                .delete_reaction(&mapping.mm_post_id, &mapping.mm_user_id, &mapping.emoji_name)
                .await?;
            return Ok(());
        }

        debug!(target, "redaction of an unbridged event");
        Ok(())
    }
}
