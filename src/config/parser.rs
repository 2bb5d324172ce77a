use super::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub bridge: BridgeConfig,
    pub registration: RegistrationConfig,
    pub mattermost: MattermostConfig,
    #[serde(default)]
    pub mirror: MirrorConfig,
    #[serde(default)]
    pub synapse_admin: Option<SynapseAdminConfig>,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BridgeConfig {
    pub domain: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    pub homeserver_url: String,
    #[serde(default = "default_puppet_prefix")]
    pub puppet_prefix: String,
    /// Messages fetched when a room is created for a conversation seen live.
    #[serde(default = "default_initial_backfill")]
    pub initial_backfill: u32,
    /// Matrix user that owns the auto-provisioned admin login.
    #[serde(default)]
    pub admin_mxid: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegistrationConfig {
    #[serde(default = "default_bridge_id")]
    pub bridge_id: String,
    #[serde(alias = "as_token")]
    pub appservice_token: String,
    #[serde(alias = "hs_token")]
    pub homeserver_token: String,
    #[serde(default = "default_sender_localpart")]
    pub sender_localpart: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeMode {
    #[default]
    Puppet,
    Mirror,
}

impl fmt::Display for BridgeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeMode::Puppet => f.write_str("puppet"),
            BridgeMode::Mirror => f.write_str("mirror"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MattermostConfig {
    pub server_url: String,
    pub admin_token: String,
    #[serde(default)]
    pub mode: BridgeMode,
    #[serde(default = "default_ghost_prefix")]
    pub ghost_prefix: String,
    #[serde(default = "default_ghost_email_domain")]
    pub ghost_email_domain: String,
    #[serde(default)]
    pub slash_command_token: Option<String>,
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub portal_wait: PortalWaitConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl MattermostConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn websocket_url(&self) -> String {
        let base = self.server_url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{base}/api/v4/websocket")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PortalWaitConfig {
    #[serde(default = "default_portal_wait_attempts")]
    pub attempts: u32,
    #[serde(default = "default_portal_wait_interval_ms")]
    pub interval_ms: u64,
}

impl Default for PortalWaitConfig {
    fn default() -> Self {
        Self {
            attempts: default_portal_wait_attempts(),
            interval_ms: default_portal_wait_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_reconnect_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Consecutive failed attempts before the listener gives up. Zero retries forever.
    #[serde(default = "default_reconnect_max_retries")]
    pub max_retries: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_reconnect_initial_delay_ms(),
            max_delay_ms: default_reconnect_max_delay_ms(),
            max_retries: default_reconnect_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MirrorConfig {
    #[serde(default = "default_true")]
    pub sync_all_teams: bool,
    #[serde(default = "default_true")]
    pub sync_all_channels: bool,
    #[serde(default = "default_true")]
    pub sync_all_users: bool,
    #[serde(default)]
    pub auto_invite_users: bool,
    #[serde(default)]
    pub create_matrix_accounts: bool,
    #[serde(default)]
    pub sync_history: bool,
    #[serde(default = "default_history_limit")]
    pub history_limit: u32,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            sync_all_teams: true,
            sync_all_channels: true,
            sync_all_users: true,
            auto_invite_users: false,
            create_matrix_accounts: false,
            sync_history: false,
            history_limit: default_history_limit(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SynapseAdminConfig {
    pub url: String,
    pub token: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub conn_string: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub max_connections: Option<u32>,
    #[serde(default)]
    pub min_connections: Option<u32>,
}

impl DatabaseConfig {
    pub fn db_type(&self) -> DbType {
        let url = self.connection_string();
        if url.starts_with("sqlite://") {
            DbType::Sqlite
        } else {
            DbType::Postgres
        }
    }

    pub fn connection_string(&self) -> String {
        if let Some(ref url) = self.url {
            url.clone()
        } else if let Some(ref conn) = self.conn_string {
            conn.clone()
        } else if let Some(ref file) = self.filename {
            format!("sqlite://{}", file)
        } else {
            String::new()
        }
    }

    pub fn sqlite_path(&self) -> Option<String> {
        if let DbType::Sqlite = self.db_type() {
            let url = self.connection_string();
            Some(url.strip_prefix("sqlite://").unwrap_or(&url).to_string())
        } else {
            None
        }
    }

    pub fn max_connections(&self) -> Option<u32> {
        match self.db_type() {
            DbType::Postgres => self.max_connections,
            DbType::Sqlite => Some(1),
        }
    }

    pub fn min_connections(&self) -> Option<u32> {
        match self.db_type() {
            DbType::Postgres => self.min_connections,
            DbType::Sqlite => Some(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbType {
    Postgres,
    Sqlite,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(alias = "console", default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.yaml".to_string());

        Self::load_from_file(&config_path)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::load_from_str(&content)
    }

    pub fn load_from_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = serde_yaml::from_str(content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn is_mirror_mode(&self) -> bool {
        self.mattermost.mode == BridgeMode::Mirror
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("MATTERMOST_BRIDGE_SERVER_URL") {
            self.mattermost.server_url = value;
        }
        if let Ok(value) = std::env::var("MATTERMOST_BRIDGE_ADMIN_TOKEN") {
            self.mattermost.admin_token = value;
        }
        if let Ok(value) = std::env::var("MATTERMOST_BRIDGE_SLASH_TOKEN") {
            self.mattermost.slash_command_token = Some(value);
        }
        if let Ok(value) = std::env::var("MATTERMOST_BRIDGE_SYNAPSE_TOKEN")
            && let Some(admin) = self.synapse_admin.as_mut()
        {
            admin.token = value;
        }
    }
}

fn default_port() -> u16 {
    29319
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_puppet_prefix() -> String {
    "_mattermost_".to_string()
}

fn default_initial_backfill() -> u32 {
    20
}

fn default_bridge_id() -> String {
    "mattermost".to_string()
}

fn default_sender_localpart() -> String {
    "_mattermost_bot".to_string()
}

fn default_ghost_prefix() -> String {
    "mx.".to_string()
}

fn default_ghost_email_domain() -> String {
    "matrix.bridge.local".to_string()
}

fn default_max_file_size() -> u64 {
    50 * 1024 * 1024
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_portal_wait_attempts() -> u32 {
    60
}

fn default_portal_wait_interval_ms() -> u64 {
    500
}

fn default_reconnect_initial_delay_ms() -> u64 {
    2000
}

fn default_reconnect_max_delay_ms() -> u64 {
    300_000
}

fn default_reconnect_max_retries() -> u32 {
    30
}

fn default_history_limit() -> u32 {
    100
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::{BridgeMode, Config, DbType};
    use crate::config::ConfigError;

    const MINIMAL: &str = r#"
bridge:
  domain: example.org
  homeserver_url: http://localhost:8008
registration:
  as_token: as-secret
  hs_token: hs-secret
mattermost:
  server_url: https://chat.example.org/
  admin_token: admin-secret
database:
  filename: /tmp/bridge.db
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = Config::load_from_str(MINIMAL).expect("config should load");

        assert_eq!(config.bridge.port, 29319);
        assert_eq!(config.registration.appservice_token, "as-secret");
        assert_eq!(config.mattermost.mode, BridgeMode::Puppet);
        assert_eq!(config.mattermost.ghost_prefix, "mx.");
        assert_eq!(config.mattermost.max_file_size, 50 * 1024 * 1024);
        assert_eq!(config.mattermost.portal_wait.attempts, 60);
        assert_eq!(config.mattermost.portal_wait.interval_ms, 500);
        assert_eq!(config.mirror.history_limit, 100);
        assert!(config.synapse_admin.is_none());
        assert_eq!(config.database.db_type(), DbType::Sqlite);
        assert_eq!(config.database.sqlite_path().as_deref(), Some("/tmp/bridge.db"));
    }

    #[test]
    fn websocket_url_switches_scheme() {
        let config = Config::load_from_str(MINIMAL).expect("config should load");
        assert_eq!(
            config.mattermost.websocket_url(),
            "wss://chat.example.org/api/v4/websocket"
        );
    }

    #[test]
    fn mirror_mode_is_parsed_from_file() {
        let yaml = MINIMAL.replace(
            "  admin_token: admin-secret\n",
            "  admin_token: admin-secret\n  mode: mirror\n",
        );
        let mut file = NamedTempFile::new().expect("temp config file");
        file.write_all(yaml.as_bytes()).expect("write config");

        let config = Config::load_from_file(file.path()).expect("config should load");
        assert!(config.is_mirror_mode());
        assert_eq!(config.mattermost.mode.to_string(), "mirror");
    }

    #[test]
    fn empty_admin_token_is_rejected() {
        let yaml = MINIMAL.replace("admin_token: admin-secret", "admin_token: \"\"");
        let err = Config::load_from_str(&yaml).expect_err("config should be rejected");
        assert!(matches!(err, ConfigError::InvalidConfig(_)));
    }

    #[test]
    fn matrix_accounts_without_synapse_admin_are_rejected() {
        let yaml = format!(
            "{}mirror:\n  create_matrix_accounts: true\n",
            MINIMAL.replace(
                "  admin_token: admin-secret\n",
                "  admin_token: admin-secret\n  mode: mirror\n",
            )
        );
        let err = Config::load_from_str(&yaml).expect_err("config should be rejected");
        assert!(err.to_string().contains("synapse_admin"));
    }
}
