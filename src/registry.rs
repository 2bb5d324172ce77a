use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};

use crate::db::LoginRecord;
use crate::error::BridgeError;
use crate::identity::LoginMetadata;
use crate::mattermost::MattermostApi;

/// A login as persisted by the runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredLogin {
    pub id: String,
    pub matrix_user_id: String,
    pub metadata: LoginMetadata,
}

impl StoredLogin {
    pub fn to_record(&self) -> LoginRecord {
        let now = Utc::now();
        LoginRecord {
            id: self.id.clone(),
            matrix_user_id: self.matrix_user_id.clone(),
            metadata: self.metadata.to_json(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl TryFrom<LoginRecord> for StoredLogin {
    type Error = BridgeError;

    fn try_from(record: LoginRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            metadata: LoginMetadata::load(&record.metadata)?,
            id: record.id,
            matrix_user_id: record.matrix_user_id,
        })
    }
}

/// Entities mirror sync has already handled in this process.
#[derive(Debug, Default)]
pub struct SyncedSets {
    teams: Mutex<HashSet<String>>,
    channels: Mutex<HashSet<String>>,
    users: Mutex<HashSet<String>>,
}

impl SyncedSets {
    /// Returns `true` the first time an ID is seen.
    pub fn mark_team(&self, id: &str) -> bool {
        self.teams.lock().insert(id.to_string())
    }

    pub fn mark_channel(&self, id: &str) -> bool {
        self.channels.lock().insert(id.to_string())
    }

    pub fn has_team(&self, id: &str) -> bool {
        self.teams.lock().contains(id)
    }

    pub fn has_channel(&self, id: &str) -> bool {
        self.channels.lock().contains(id)
    }

    pub fn mark_user(&self, id: &str) -> bool {
        self.users.lock().insert(id.to_string())
    }

    pub fn channels(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.channels.lock().iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn counts(&self) -> (usize, usize, usize) {
        (
            self.teams.lock().len(),
            self.channels.lock().len(),
            self.users.lock().len(),
        )
    }
}

/// One authenticated binding between a Matrix user and a Mattermost account.
pub struct LoginSession {
    pub id: String,
    pub matrix_user_id: String,
    pub mm_user_id: String,
    pub mm_username: String,
    pub metadata: LoginMetadata,
    client: Arc<dyn MattermostApi>,
    synced: SyncedSets,
}

impl LoginSession {
    pub fn new(
        stored: StoredLogin,
        mm_username: impl Into<String>,
        client: Arc<dyn MattermostApi>,
    ) -> Self {
        Self {
            id: stored.id,
            matrix_user_id: stored.matrix_user_id,
            mm_user_id: stored.metadata.mm_id.clone(),
            mm_username: mm_username.into(),
            metadata: stored.metadata,
            client,
            synced: SyncedSets::default(),
        }
    }

    pub fn client(&self) -> Arc<dyn MattermostApi> {
        self.client.clone()
    }

    pub fn synced(&self) -> &SyncedSets {
        &self.synced
    }

    pub fn stored(&self) -> StoredLogin {
        StoredLogin {
            id: self.id.clone(),
            matrix_user_id: self.matrix_user_id.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

impl std::fmt::Debug for LoginSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginSession")
            .field("id", &self.id)
            .field("matrix_user_id", &self.matrix_user_id)
            .field("mm_user_id", &self.mm_user_id)
            .finish_non_exhaustive()
    }
}

/// Active login sessions in the order they were added.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<Vec<Arc<LoginSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a session, replacing any session with the same ID.
    pub fn add(&self, session: Arc<LoginSession>) {
        let mut sessions = self.sessions.write();
        match sessions.iter_mut().find(|s| s.id == session.id) {
            Some(slot) => *slot = session,
            None => sessions.push(session),
        }
    }

    pub fn remove(&self, id: &str) -> Option<Arc<LoginSession>> {
        let mut sessions = self.sessions.write();
        let index = sessions.iter().position(|s| s.id == id)?;
        Some(sessions.remove(index))
    }

    pub fn get(&self, id: &str) -> Option<Arc<LoginSession>> {
        self.sessions.read().iter().find(|s| s.id == id).cloned()
    }

    pub fn list(&self) -> Vec<Arc<LoginSession>> {
        self.sessions.read().clone()
    }

    pub fn first(&self) -> Option<Arc<LoginSession>> {
        self.sessions.read().first().cloned()
    }

    pub fn find_by_mm_user(&self, mm_user_id: &str) -> Option<Arc<LoginSession>> {
        self.sessions
            .read()
            .iter()
            .find(|s| s.mm_user_id == mm_user_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}
