//! Homeserver administration through the Synapse admin API and the client-server API.

use std::time::Duration;

use rand::Rng;
use rand::distributions::Alphanumeric;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::error::{BridgeError, BridgeResult};

pub const PASSWORD_PREFIX: &str = "mattermost-bridge-";

/// `mattermost-bridge-` followed by 16 random alphanumerics.
pub fn generate_password() -> String {
    let tail: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    format!("{PASSWORD_PREFIX}{tail}")
}

/// The Matrix account a Mattermost user gets in mirror mode: same name, on our server.
pub fn generate_matrix_user_id(username: &str, server_name: &str) -> String {
    let localpart: String = username
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '.' | '_' | '=' | '-' | '/' => c,
            _ => '_',
        })
        .collect();
    format!("@{localpart}:{server_name}")
}

/// Server part of a room ID or alias, used as a join hint.
pub fn server_of(id: &str) -> Option<&str> {
    id.split_once(':').map(|(_, server)| server).filter(|s| !s.is_empty())
}

fn encode(segment: &str) -> String {
    url::form_urlencoded::byte_serialize(segment.as_bytes()).collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Profile {
    #[serde(default, rename = "displayname")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AliasResponse {
    room_id: String,
    #[serde(default)]
    servers: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinRule {
    Public,
    Invite,
    Knock,
    Restricted,
    Private,
}

impl JoinRule {
    fn parse(rule: &str) -> Self {
        match rule {
            "public" => Self::Public,
            "invite" => Self::Invite,
            "knock" => Self::Knock,
            "restricted" | "knock_restricted" => Self::Restricted,
            _ => Self::Private,
        }
    }
}

pub struct MatrixAdmin {
    http: Client,
    base_url: String,
    admin_token: SecretString,
    appservice_token: Option<SecretString>,
}

impl MatrixAdmin {
    pub fn new(base_url: &str, admin_token: &str, timeout: Duration) -> BridgeResult<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(BridgeError::matrix)?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            admin_token: SecretString::from(admin_token.to_string()),
            appservice_token: None,
        })
    }

    /// Appservice users are joined by impersonation with this token.
    pub fn with_appservice_token(mut self, token: &str) -> Self {
        self.appservice_token = Some(SecretString::from(token.to_string()));
        self
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{path}", self.base_url))
            .bearer_auth(self.admin_token.expose_secret())
    }

    async fn check(response: Response, what: &str) -> BridgeResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND {
            return Err(BridgeError::NotFound(what.to_string()));
        }
        Err(BridgeError::Matrix(format!("{what} failed with {status}: {body}")))
    }

    /// Resolves `#alias:server` to a room ID plus the servers the directory suggests.
    pub async fn resolve_alias(&self, alias: &str) -> BridgeResult<(String, Vec<String>)> {
        if !alias.starts_with('#') || server_of(alias).is_none() {
            return Err(BridgeError::Conversion(format!("invalid room alias {alias}")));
        }
        let response = self
            .request(
                Method::GET,
                &format!("/_matrix/client/v3/directory/room/{}", encode(alias)),
            )
            .send()
            .await
            .map_err(BridgeError::matrix)?;
        let resolved: AliasResponse = Self::check(response, &format!("room alias {alias}"))
            .await?
            .json()
            .await
            .map_err(BridgeError::matrix)?;
        debug!(alias, room_id = %resolved.room_id, servers = ?resolved.servers, "resolved alias");
        Ok((resolved.room_id, resolved.servers))
    }

    /// Joins `user_id` to a room that may live on another server. `via` servers are passed as
    /// `server_name` hints so federated rooms can be reached.
    pub async fn join_as_identity(
        &self,
        user_id: &str,
        room_id: &str,
        via: &[String],
    ) -> BridgeResult<()> {
        let query = {
            let mut query = url::form_urlencoded::Serializer::new(String::new());
            for server in via {
                query.append_pair("server_name", server);
            }
            query.append_pair("user_id", user_id);
            query.finish()
        };
        let token = self
            .appservice_token
            .as_ref()
            .unwrap_or(&self.admin_token)
            .expose_secret()
            .to_string();
        let response = self
            .http
            .post(format!(
                "{}/_matrix/client/v3/join/{}?{}",
                self.base_url,
                encode(room_id),
                query
            ))
            .bearer_auth(token)
            .json(&json!({}))
            .send()
            .await
            .map_err(BridgeError::matrix)?;
        Self::check(response, &format!("join {room_id} as {user_id}")).await?;
        info!(user_id, room_id, ?via, "joined room");
        Ok(())
    }

    /// Force-joins a local user to a room the server already participates in.
    pub async fn admin_join(&self, user_id: &str, room_id: &str) -> BridgeResult<()> {
        let response = self
            .request(
                Method::POST,
                &format!("/_synapse/admin/v1/join/{}", encode(room_id)),
            )
            .json(&json!({ "user_id": user_id }))
            .send()
            .await
            .map_err(BridgeError::matrix)?;
        Self::check(response, &format!("admin join {user_id} to {room_id}")).await?;
        Ok(())
    }

    pub async fn user_exists(&self, user_id: &str) -> BridgeResult<bool> {
        let response = self
            .request(
                Method::GET,
                &format!("/_synapse/admin/v2/users/{}", encode(user_id)),
            )
            .send()
            .await
            .map_err(BridgeError::matrix)?;
        match Self::check(response, &format!("user {user_id}")).await {
            Ok(_) => Ok(true),
            Err(BridgeError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Creates a local account with a generated password unless it exists. Returns the
    /// password only when the account was created.
    pub async fn provision_account_if_absent(
        &self,
        user_id: &str,
        display_name: &str,
    ) -> BridgeResult<Option<String>> {
        if self.user_exists(user_id).await? {
            return Ok(None);
        }
        let password = generate_password();
        let response = self
            .request(
                Method::PUT,
                &format!("/_synapse/admin/v2/users/{}", encode(user_id)),
            )
            .json(&json!({
                "password": password,
                "displayname": display_name,
                "admin": false,
                "deactivated": false,
            }))
            .send()
            .await
            .map_err(BridgeError::matrix)?;
        Self::check(response, &format!("create user {user_id}")).await?;
        info!(user_id, "created matrix account");
        Ok(Some(password))
    }

    pub async fn set_display_name(&self, user_id: &str, display_name: &str) -> BridgeResult<()> {
        let response = self
            .request(
                Method::PUT,
                &format!("/_synapse/admin/v2/users/{}", encode(user_id)),
            )
            .json(&json!({ "displayname": display_name }))
            .send()
            .await
            .map_err(BridgeError::matrix)?;
        Self::check(response, &format!("update user {user_id}")).await?;
        Ok(())
    }

    /// `None` when the user has no profile.
    pub async fn get_profile(&self, user_id: &str) -> BridgeResult<Option<Profile>> {
        let response = self
            .request(
                Method::GET,
                &format!("/_matrix/client/v3/profile/{}", encode(user_id)),
            )
            .send()
            .await
            .map_err(BridgeError::matrix)?;
        match Self::check(response, &format!("profile of {user_id}")).await {
            Ok(response) => Ok(Some(response.json().await.map_err(BridgeError::matrix)?)),
            Err(BridgeError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn room_join_rule(&self, room_id: &str) -> BridgeResult<JoinRule> {
        let response = self
            .request(
                Method::GET,
                &format!(
                    "/_matrix/client/v3/rooms/{}/state/m.room.join_rules",
                    encode(room_id)
                ),
            )
            .send()
            .await
            .map_err(BridgeError::matrix)?;
        let content: Value = Self::check(response, &format!("join rules of {room_id}"))
            .await?
            .json()
            .await
            .map_err(BridgeError::matrix)?;
        Ok(JoinRule::parse(
            content
                .get("join_rule")
                .and_then(Value::as_str)
                .unwrap_or("invite"),
        ))
    }
}
