use thiserror::Error;

use crate::config::ConfigError;
use crate::db::DatabaseError;
use crate::identity::EncodingError;
use crate::mattermost::MattermostError;

pub type BridgeResult<T> = Result<T, BridgeError>;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("mattermost request failed: {0}")]
    Upstream(#[from] MattermostError),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} is ambiguous")]
    Ambiguous(String),
    #[error("message conversion failed: {0}")]
    Conversion(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error("matrix request failed: {0}")]
    Matrix(String),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

impl BridgeError {
    pub fn matrix(err: impl std::fmt::Display) -> Self {
        Self::Matrix(err.to_string())
    }

    /// Transient failures worth retrying. Resolution and validation failures never are.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Upstream(err) => err.is_transient(),
            Self::Database(DatabaseError::Connection(_)) => true,
            Self::Matrix(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::BridgeError;
    use crate::mattermost::MattermostError;

    #[test]
    fn only_transient_failures_are_retryable() {
        let server = BridgeError::from(MattermostError::Http {
            status: 502,
            id: String::new(),
            message: "bad gateway".to_string(),
        });
        assert!(server.is_retryable());

        let missing = BridgeError::from(MattermostError::Http {
            status: 404,
            id: "store.sql_user.missing".to_string(),
            message: "not found".to_string(),
        });
        assert!(!missing.is_retryable());

        assert!(!BridgeError::NotFound("user @x:y".to_string()).is_retryable());
        assert!(!BridgeError::Ambiguous("alice".to_string()).is_retryable());
    }
}
