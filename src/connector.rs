//! Login lifecycle: the personal access token flow, admin auto-provisioning and one relay
//! per loaded login.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::convert::{MatrixMedia, MessageConverter};
use crate::error::{BridgeError, BridgeResult};
use crate::identity::{IdentityManager, LoginMetadata};
use crate::matrix::RelayProvider;
use crate::mattermost::{ClientFactory, MattermostError};
use crate::registry::{LoginSession, SessionRegistry, StoredLogin};
use crate::relay::MattermostRelay;
use crate::runtime::BridgeRuntime;

pub const TOKEN_FLOW_ID: &str = "personal-access-token";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Password,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoginField {
    pub id: &'static str,
    pub kind: FieldKind,
    pub name: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoginFlow {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub fields: Vec<LoginField>,
}

/// What the Mattermost side supports, reported to the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub edits: bool,
    pub reactions: bool,
    pub threads: bool,
    pub redactions: bool,
    pub max_file_size: u64,
}

pub struct MattermostConnector {
    config: Arc<Config>,
    clients: Arc<dyn ClientFactory>,
    runtime: Arc<dyn BridgeRuntime>,
    identity: Arc<IdentityManager>,
    converter: Arc<MessageConverter>,
    media: Arc<dyn MatrixMedia>,
    sessions: Arc<SessionRegistry>,
    relays: RwLock<HashMap<String, Arc<MattermostRelay>>>,
}

impl MattermostConnector {
    pub fn new(
        config: Arc<Config>,
        clients: Arc<dyn ClientFactory>,
        runtime: Arc<dyn BridgeRuntime>,
        identity: Arc<IdentityManager>,
        converter: Arc<MessageConverter>,
        media: Arc<dyn MatrixMedia>,
        sessions: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            config,
            clients,
            runtime,
            identity,
            converter,
            media,
            sessions,
            relays: RwLock::new(HashMap::new()),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn login_flows(&self) -> Vec<LoginFlow> {
        vec![LoginFlow {
            id: TOKEN_FLOW_ID,
            name: "Personal Access Token",
            description: "Login using a Mattermost Personal Access Token",
            fields: vec![LoginField {
                id: "token",
                kind: FieldKind::Password,
                name: "Token",
            }],
        }]
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            edits: true,
            reactions: true,
            threads: true,
            redactions: true,
            max_file_size: self.config.mattermost.max_file_size,
        }
    }

    /// Loads every persisted login. A login whose token no longer works is skipped.
    pub async fn init(&self) -> BridgeResult<usize> {
        let stored = self.runtime.list_logins().await?;
        let mut loaded = 0;
        for login in stored {
            let id = login.id.clone();
            match self.load_user_login(login).await {
                Ok(_) => loaded += 1,
                Err(err) => warn!(login_id = %id, error = %err, "failed to load login"),
            }
        }
        info!(loaded, "restored logins");
        Ok(loaded)
    }

    /// Provisions a login for the admin token when nobody has logged in yet.
    pub async fn start(&self) -> BridgeResult<Option<Arc<LoginSession>>> {
        info!(mode = %self.config.mattermost.mode, "starting mattermost connector");
        if !self.sessions.is_empty() || self.config.mattermost.admin_token.is_empty() {
            return Ok(None);
        }

        let me = self
            .clients
            .admin()
            .get_me()
            .await
            .map_err(|err| unauthorized(err, "admin token"))?;
        let owner = self
            .config
            .bridge
            .admin_mxid
            .clone()
            .unwrap_or_else(|| format!("@admin:{}", self.config.bridge.domain));
        let mut metadata = LoginMetadata::new(self.config.mattermost.admin_token.clone(), me.id.clone());
        metadata.is_auto_provisioned = true;
        let stored = StoredLogin {
            id: me.id.clone(),
            matrix_user_id: owner,
            metadata,
        };
        self.runtime.save_login(&stored).await?;
        let session = self.load_user_login(stored).await?;
        info!(login_id = %session.id, owner = %session.matrix_user_id, "auto-provisioned admin login");
        Ok(Some(session))
    }

    pub fn stop(&self) {
        let dropped = self.relays.write().drain().count();
        for session in self.sessions.list() {
            self.sessions.remove(&session.id);
        }
        info!(dropped, "mattermost connector stopped");
    }

    /// Validates a personal access token with `GetMe` and persists the login for
    /// `matrix_user_id`.
    pub async fn login_with_token(&self, matrix_user_id: &str, token: &str) -> BridgeResult<Arc<LoginSession>> {
        let token = token.trim();
        if token.is_empty() {
            return Err(BridgeError::Unauthorized("empty token".to_string()));
        }
        let client = self.clients.with_token(token)?;
        let me = client
            .get_me()
            .await
            .map_err(|err| unauthorized(err, "personal access token"))?;

        let stored = StoredLogin {
            id: me.username.clone(),
            matrix_user_id: matrix_user_id.to_string(),
            metadata: LoginMetadata::new(token, me.id.clone()),
        };
        self.runtime.save_login(&stored).await?;
        info!(login_id = %stored.id, matrix_user_id, "logged in");
        self.load_user_login(stored).await
    }

    pub async fn load_user_login(&self, stored: StoredLogin) -> BridgeResult<Arc<LoginSession>> {
        let client = self.clients.with_token(&stored.metadata.token)?;
        let me = client
            .get_me()
            .await
            .map_err(|err| unauthorized(err, "stored login token"))?;
        if !stored.metadata.mm_id.is_empty() && stored.metadata.mm_id != me.id {
            warn!(login_id = %stored.id, "token belongs to a different account than recorded");
        }
        let session = Arc::new(LoginSession::new(stored, me.username, client));
        self.sessions.add(session.clone());
        self.new_network_api(session.clone());
        debug!(login_id = %session.id, "login loaded");
        Ok(session)
    }

    pub fn new_network_api(&self, login: Arc<LoginSession>) -> Arc<MattermostRelay> {
        let relay = Arc::new(MattermostRelay::new(
            login.clone(),
            self.identity.clone(),
            self.runtime.clone(),
            self.converter.clone(),
            self.media.clone(),
        ));
        self.relays.write().insert(login.id.clone(), relay.clone());
        relay
    }

    pub async fn logout(&self, login_id: &str) -> BridgeResult<()> {
        self.relays.write().remove(login_id);
        self.sessions.remove(login_id);
        self.runtime.delete_login(login_id).await
    }
}

impl RelayProvider for MattermostConnector {
    fn relay_for(&self, login_id: Option<&str>) -> Option<Arc<MattermostRelay>> {
        let relays = self.relays.read();
        if let Some(relay) = login_id.and_then(|id| relays.get(id)) {
            return Some(relay.clone());
        }
        let first = self.sessions.first()?;
        relays.get(&first.id).cloned()
    }
}

fn unauthorized(err: MattermostError, what: &str) -> BridgeError {
    if err.is_unauthorized() {
        BridgeError::Unauthorized(format!("{what} rejected"))
    } else {
        err.into()
    }
}
