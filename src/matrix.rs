use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use matrix_bot_sdk::{
    appservice::{Appservice, AppserviceHandler},
    client::{MatrixAuth, MatrixClient},
};
use reqwest::Method;
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tracing::{debug, error, info};
use url::Url;
use uuid::Uuid;

use crate::config::Config;

pub mod event_handler;

const MAX_TRACKED_TRANSACTIONS: usize = 1024;

pub use self::event_handler::{MatrixEventProcessor, RelayProvider};

pub struct BridgeAppserviceHandler {
    processor: Option<Arc<MatrixEventProcessor>>,
}

#[async_trait::async_trait]
impl AppserviceHandler for BridgeAppserviceHandler {
    async fn on_transaction(&self, txn_id: &str, body: &Value) -> Result<()> {
        let Some(processor) = &self.processor else {
            debug!(txn_id, "transaction received before the processor was attached");
            return Ok(());
        };

        let Some(events) = body.get("events").and_then(|v| v.as_array()) else {
            return Ok(());
        };
        for event in events {
            let Some(matrix_event) = MatrixEvent::from_json(event) else {
                continue;
            };
            if let Err(e) = processor.process_event(matrix_event).await {
                error!(txn_id, error = %e, "error processing matrix event");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct MatrixEvent {
    pub event_id: Option<String>,
    pub event_type: String,
    pub room_id: String,
    pub sender: String,
    pub state_key: Option<String>,
    pub content: Option<Value>,
    pub redacts: Option<String>,
    pub timestamp: Option<String>,
}

impl MatrixEvent {
    pub fn from_json(event: &Value) -> Option<Self> {
        let field = |name: &str| event.get(name).and_then(|v| v.as_str()).map(ToOwned::to_owned);
        let content = event.get("content").cloned();
        Some(Self {
            event_id: field("event_id"),
            event_type: field("type")?,
            room_id: field("room_id")?,
            sender: field("sender")?,
            state_key: field("state_key"),
            // Room v11 moved `redacts` into the content.
            redacts: field("redacts").or_else(|| {
                content
                    .as_ref()
                    .and_then(|c| c.get("redacts"))
                    .and_then(|v| v.as_str())
                    .map(ToOwned::to_owned)
            }),
            content,
            timestamp: event.get("origin_server_ts").map(|v| v.to_string()),
        })
    }
}

/// Options for a portal room or team space.
#[derive(Debug, Clone, Default)]
pub struct RoomOptions {
    pub name: Option<String>,
    pub topic: Option<String>,
    pub is_space: bool,
    pub is_direct: bool,
    pub invite: Vec<String>,
}

#[derive(Clone)]
pub struct MatrixAppservice {
    config: Arc<Config>,
    pub appservice: Appservice,
    handler: Arc<RwLock<BridgeAppserviceHandler>>,
    transactions: Arc<parking_lot::Mutex<HashSet<String>>>,
    http: reqwest::Client,
    homeserver_url: Url,
}

impl MatrixAppservice {
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        info!(domain = %config.bridge.domain, "initializing matrix appservice");

        let homeserver_url = Url::parse(&config.bridge.homeserver_url)?;
        let auth = MatrixAuth::new(&config.registration.appservice_token);
        let client = MatrixClient::new(homeserver_url.clone(), auth);

        let handler = Arc::new(RwLock::new(BridgeAppserviceHandler { processor: None }));

        struct HandlerWrapper(Arc<RwLock<BridgeAppserviceHandler>>);
        #[async_trait::async_trait]
        impl AppserviceHandler for HandlerWrapper {
            async fn on_transaction(&self, txn_id: &str, body: &Value) -> Result<()> {
                self.0.read().await.on_transaction(txn_id, body).await
            }
        }

        let appservice = Appservice::new(
            &config.registration.homeserver_token,
            &config.registration.appservice_token,
            client,
        )
        .with_appservice_id(&config.registration.bridge_id)
        .with_handler(Arc::new(HandlerWrapper(handler.clone())));

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.mattermost.request_timeout_secs))
            .build()?;

        Ok(Self {
            config,
            appservice,
            handler,
            transactions: Arc::new(parking_lot::Mutex::new(HashSet::new())),
            http,
            homeserver_url,
        })
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.clone()
    }

    pub fn bot_user_id(&self) -> String {
        format!(
            "@{}:{}",
            self.config.registration.sender_localpart, self.config.bridge.domain
        )
    }

    pub fn puppet_user_id(&self, mm_user_id: &str) -> String {
        format!(
            "@{}{}:{}",
            self.config.bridge.puppet_prefix, mm_user_id, self.config.bridge.domain
        )
    }

    /// Users in the appservice namespace: puppets and the bridge bot.
    pub fn is_bridge_user(&self, user_id: &str) -> bool {
        if user_id == self.bot_user_id() {
            return true;
        }
        user_id
            .strip_prefix('@')
            .and_then(|rest| rest.split_once(':'))
            .is_some_and(|(local, server)| {
                local.starts_with(&self.config.bridge.puppet_prefix)
                    && server == self.config.bridge.domain
            })
    }

    /// Feeds one homeserver transaction to the event processor. A retried transaction is
    /// acknowledged without being processed again.
    pub async fn handle_transaction(&self, txn_id: &str, body: &Value) -> Result<()> {
        {
            let mut seen = self.transactions.lock();
            if seen.contains(txn_id) {
                debug!(txn_id, "duplicate transaction");
                return Ok(());
            }
            if seen.len() >= MAX_TRACKED_TRANSACTIONS {
                seen.clear();
            }
            seen.insert(txn_id.to_string());
        }
        self.handler.read().await.on_transaction(txn_id, body).await
    }

    pub fn homeserver_token(&self) -> &str {
        &self.config.registration.homeserver_token
    }

    pub async fn set_processor(&self, processor: Arc<MatrixEventProcessor>) {
        self.handler.write().await.processor = Some(processor);
    }

    /// A client acting as `user_id`. Each call gets its own client so concurrent portals never
    /// share impersonation state.
    async fn client_as(&self, user_id: &str) -> MatrixClient {
        let client = MatrixClient::new(
            self.homeserver_url.clone(),
            MatrixAuth::new(&self.config.registration.appservice_token),
        );
        if user_id != self.bot_user_id() {
            client.impersonate_user_id(Some(user_id), None::<&str>).await;
        }
        client
    }

    /// Client-server API call as `user_id` for endpoints the SDK client does not expose.
    async fn request(
        &self,
        method: Method,
        path: &str,
        user_id: &str,
        body: Option<&Value>,
    ) -> Result<Value> {
        let mut url = self.homeserver_url.join(path)?;
        url.query_pairs_mut().append_pair("user_id", user_id);

        let mut request = self
            .http
            .request(method, url)
            .bearer_auth(&self.config.registration.appservice_token);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(anyhow!("{path} failed: {status} - {text}"));
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::Null))
    }

    /// Registers a puppet. An account that already exists is fine.
    pub async fn ensure_puppet_registered(&self, user_id: &str, display_name: Option<&str>) -> Result<()> {
        let localpart = user_id
            .strip_prefix('@')
            .and_then(|rest| rest.split_once(':'))
            .map(|(local, _)| local)
            .ok_or_else(|| anyhow!("invalid matrix user id {user_id}"))?;

        let client = self.client_as(user_id).await;
        if let Err(err) = client.password_register(localpart, "", display_name).await {
            debug!(user_id, error = %err, "puppet registration skipped");
        }
        if let Some(display) = display_name {
            client
                .set_display_name(display)
                .await
                .with_context(|| format!("failed to set display name of {user_id}"))?;
        }
        Ok(())
    }

    pub async fn set_display_name(&self, user_id: &str, display_name: &str) -> Result<()> {
        self.client_as(user_id).await.set_display_name(display_name).await?;
        Ok(())
    }

    pub async fn set_avatar_url(&self, user_id: &str, avatar_url: &str) -> Result<()> {
        let path = format!("/_matrix/client/v3/profile/{}/avatar_url", encode(user_id));
        self.request(
            Method::PUT,
            &path,
            user_id,
            Some(&json!({ "avatar_url": avatar_url })),
        )
        .await?;
        Ok(())
    }

    pub async fn create_room(&self, options: &RoomOptions) -> Result<String> {
        let mut body = json!({
            "preset": "private_chat",
            "visibility": "private",
            "invite": options.invite,
            "is_direct": options.is_direct,
        });
        if let Some(name) = &options.name {
            body["name"] = json!(name);
        }
        if let Some(topic) = &options.topic {
            body["topic"] = json!(topic);
        }
        if options.is_space {
            body["creation_content"] = json!({ "type": "m.space" });
        }

        let response = self
            .request(Method::POST, "/_matrix/client/v3/createRoom", &self.bot_user_id(), Some(&body))
            .await?;
        let room_id = response
            .get("room_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("no room_id in createRoom response"))?
            .to_string();
        info!(room_id, space = options.is_space, "created matrix room");
        Ok(room_id)
    }

    /// Links a room under a space in both directions.
    pub async fn add_to_space(&self, space_id: &str, room_id: &str) -> Result<()> {
        let via = json!({ "via": [self.config.bridge.domain] });
        let client = &self.appservice.client;
        client
            .send_state_event(space_id, "m.space.child", room_id, &via)
            .await?;
        let parent = json!({ "via": [self.config.bridge.domain], "canonical": true });
        client
            .send_state_event(room_id, "m.space.parent", space_id, &parent)
            .await?;
        Ok(())
    }

    pub async fn set_room_name(&self, room_id: &str, name: &str) -> Result<()> {
        self.appservice
            .client
            .send_state_event(room_id, "m.room.name", "", &json!({ "name": name }))
            .await?;
        Ok(())
    }

    pub async fn set_room_topic(&self, room_id: &str, topic: &str) -> Result<()> {
        self.appservice
            .client
            .send_state_event(room_id, "m.room.topic", "", &json!({ "topic": topic }))
            .await?;
        Ok(())
    }

    pub async fn invite(&self, room_id: &str, user_id: &str) -> Result<()> {
        let path = format!("/_matrix/client/v3/rooms/{}/invite", encode(room_id));
        self.request(
            Method::POST,
            &path,
            &self.bot_user_id(),
            Some(&json!({ "user_id": user_id })),
        )
        .await?;
        Ok(())
    }

    pub async fn join_as(&self, room_id: &str, user_id: &str) -> Result<()> {
        self.client_as(user_id).await.join_room(room_id).await?;
        Ok(())
    }

    /// Sends an event as `sender` and returns its event ID.
    pub async fn send_event_as(
        &self,
        room_id: &str,
        sender: &str,
        event_type: &str,
        content: &Value,
    ) -> Result<String> {
        let event_id = self
            .client_as(sender)
            .await
            .send_event(room_id, event_type, content)
            .await?;
        Ok(event_id)
    }

    pub async fn redact_as(&self, room_id: &str, sender: &str, event_id: &str) -> Result<()> {
        let path = format!(
            "/_matrix/client/v3/rooms/{}/redact/{}/{}",
            encode(room_id),
            encode(event_id),
            Uuid::new_v4()
        );
        self.request(Method::PUT, &path, sender, Some(&json!({})))
            .await?;
        Ok(())
    }

    pub async fn send_notice(&self, room_id: &str, content: &str) -> Result<()> {
        self.appservice.client.send_notice(room_id, content).await?;
        Ok(())
    }

    pub fn registration_preview(&self) -> Value {
        let prefix = &self.config.bridge.puppet_prefix;
        let domain = &self.config.bridge.domain;
        json!({
            "id": self.config.registration.bridge_id,
            "url": format!("http://{}:{}", self.config.bridge.bind_address, self.config.bridge.port),
            "as_token": self.config.registration.appservice_token,
            "hs_token": self.config.registration.homeserver_token,
            "sender_localpart": self.config.registration.sender_localpart,
            "rate_limited": false,
            "namespaces": {
                "users": [{
                    "exclusive": true,
                    "regex": format!("@{}.*:{}", regex::escape(prefix), regex::escape(domain))
                }],
                "aliases": [],
                "rooms": []
            }
        })
    }
}

fn encode(segment: &str) -> String {
    url::form_urlencoded::byte_serialize(segment.as_bytes()).collect()
}
