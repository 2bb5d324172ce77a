use thiserror::Error;

use super::parser::{BridgeMode, Config};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bridge.domain.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "bridge.domain cannot be empty".to_string(),
            ));
        }

        if self.bridge.port == 0 {
            return Err(ConfigError::InvalidConfig(
                "bridge.port must be between 1 and 65535".to_string(),
            ));
        }

        if url::Url::parse(&self.bridge.homeserver_url).is_err() {
            return Err(ConfigError::InvalidConfig(format!(
                "bridge.homeserver_url is not a valid URL: {:?}",
                self.bridge.homeserver_url
            )));
        }

        if self.registration.appservice_token.is_empty()
            || self.registration.homeserver_token.is_empty()
        {
            return Err(ConfigError::InvalidConfig(
                "registration.as_token and registration.hs_token are required".to_string(),
            ));
        }

        if url::Url::parse(&self.mattermost.server_url).is_err() {
            return Err(ConfigError::InvalidConfig(format!(
                "mattermost.server_url is not a valid URL: {:?}",
                self.mattermost.server_url
            )));
        }

        if self.mattermost.admin_token.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "mattermost.admin_token cannot be empty".to_string(),
            ));
        }

        if !is_valid_ghost_prefix(&self.mattermost.ghost_prefix) {
            return Err(ConfigError::InvalidConfig(format!(
                "mattermost.ghost_prefix {:?} must start with a letter and only contain a-z, 0-9, '.', '-' or '_'",
                self.mattermost.ghost_prefix
            )));
        }

        if self.mattermost.portal_wait.attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "mattermost.portal_wait.attempts must be at least 1".to_string(),
            ));
        }

        if self.mattermost.reconnect.initial_delay_ms == 0
            || self.mattermost.reconnect.initial_delay_ms > self.mattermost.reconnect.max_delay_ms
        {
            return Err(ConfigError::InvalidConfig(
                "mattermost.reconnect delays must satisfy 0 < initial_delay_ms <= max_delay_ms"
                    .to_string(),
            ));
        }

        if self.mattermost.mode == BridgeMode::Mirror
            && self.mirror.create_matrix_accounts
            && self.synapse_admin.is_none()
        {
            return Err(ConfigError::InvalidConfig(
                "mirror.create_matrix_accounts requires the synapse_admin section".to_string(),
            ));
        }

        if self.database.connection_string().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "database connection string cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

fn is_valid_ghost_prefix(prefix: &str) -> bool {
    let mut chars = prefix.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    first.is_ascii_lowercase()
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '-' | '_'))
}
