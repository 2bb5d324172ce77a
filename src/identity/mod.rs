//! Maps Matrix identities to Mattermost ghost accounts and hands out clients that act as them.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use rand::distributions::Alphanumeric;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::db::GhostRecord;
use crate::error::{BridgeError, BridgeResult};
use crate::mattermost::models::{NewUser, User, UserPatch};
use crate::mattermost::{ClientFactory, MattermostApi};
use crate::runtime::BridgeRuntime;

mod encoding;
mod metadata;

pub use self::encoding::{
    EncodingError, MAX_USERNAME_LEN, decode_username, encode_user_id, is_encoded,
};
pub use self::metadata::{GhostMetadata, LoginMetadata, METADATA_VERSION};

pub const GHOST_POSITION: &str = "Matrix Bridge Ghost";
pub const GHOST_TOKEN_DESCRIPTION: &str = "Matrix Bridge Ghost Token";

/// A Matrix user together with the Mattermost account that represents it.
#[derive(Debug, Clone, PartialEq)]
pub struct Ghost {
    pub matrix_user_id: String,
    pub mm_username: String,
    pub metadata: GhostMetadata,
}

impl Ghost {
    pub fn new(matrix_user_id: impl Into<String>, mm_username: impl Into<String>) -> Self {
        Self {
            matrix_user_id: matrix_user_id.into(),
            mm_username: mm_username.into(),
            metadata: GhostMetadata {
                version: METADATA_VERSION,
                ..Default::default()
            },
        }
    }

    pub fn mm_user_id(&self) -> Option<&str> {
        self.metadata.mm_id.as_deref()
    }

    pub fn to_record(&self) -> GhostRecord {
        let now = Utc::now();
        GhostRecord {
            id: 0,
            matrix_user_id: self.matrix_user_id.clone(),
            mm_username: self.mm_username.clone(),
            mm_user_id: self.metadata.mm_id.clone(),
            metadata: self.metadata.to_json(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl TryFrom<GhostRecord> for Ghost {
    type Error = BridgeError;

    fn try_from(record: GhostRecord) -> Result<Self, Self::Error> {
        let mut metadata = GhostMetadata::load(&record.metadata)?;
        if metadata.mm_id.is_none() {
            metadata.mm_id = record.mm_user_id;
        }
        Ok(Self {
            matrix_user_id: record.matrix_user_id,
            mm_username: record.mm_username,
            metadata,
        })
    }
}

/// Splits `@local:server` into its localpart and server name.
pub fn split_user_id(matrix_user_id: &str) -> Option<(&str, &str)> {
    matrix_user_id.strip_prefix('@')?.split_once(':')
}

fn generate_password() -> String {
    let tail: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect();
    format!("MatrixBridge_{tail}")
}

pub fn avatar_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub struct IdentityManager {
    clients: Arc<dyn ClientFactory>,
    runtime: Arc<dyn BridgeRuntime>,
    prefix: String,
    email_domain: String,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    token_clients: RwLock<HashMap<String, Arc<dyn MattermostApi>>>,
    ghost_ids: RwLock<HashMap<String, bool>>,
}

impl IdentityManager {
    pub fn new(
        clients: Arc<dyn ClientFactory>,
        runtime: Arc<dyn BridgeRuntime>,
        prefix: impl Into<String>,
        email_domain: impl Into<String>,
    ) -> Self {
        Self {
            clients,
            runtime,
            prefix: prefix.into(),
            email_domain: email_domain.into(),
            locks: Mutex::new(HashMap::new()),
            token_clients: RwLock::new(HashMap::new()),
            ghost_ids: RwLock::new(HashMap::new()),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn admin(&self) -> Arc<dyn MattermostApi> {
        self.clients.admin()
    }

    pub fn username_for(&self, matrix_user_id: &str) -> BridgeResult<String> {
        Ok(encode_user_id(&self.prefix, matrix_user_id)?)
    }

    fn identity_lock(&self, matrix_user_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(matrix_user_id.to_string())
            .or_default()
            .clone()
    }

    async fn load_ghost(&self, matrix_user_id: &str) -> BridgeResult<Ghost> {
        match self.runtime.get_ghost(matrix_user_id).await? {
            Some(ghost) => Ok(ghost),
            None => Ok(Ghost::new(
                matrix_user_id,
                self.username_for(matrix_user_id)?,
            )),
        }
    }

    /// Returns the Mattermost account ID of the ghost for `matrix_user_id`, creating the
    /// account when neither the store nor Mattermost knows it.
    pub async fn resolve_or_provision(&self, matrix_user_id: &str) -> BridgeResult<String> {
        let lock = self.identity_lock(matrix_user_id);
        let _guard = lock.lock().await;

        let mut ghost = self.load_ghost(matrix_user_id).await?;
        if let Some(mm_id) = ghost.mm_user_id() {
            return Ok(mm_id.to_string());
        }

        let username = self.username_for(matrix_user_id)?;
        let admin = self.clients.admin();
        let user = match admin.get_user_by_username(&username).await {
            Ok(user) if !user.nickname.is_empty() && user.nickname != matrix_user_id => {
                return Err(BridgeError::Ambiguous(format!(
                    "username {username} already belongs to {}",
                    user.nickname
                )));
            }
            Ok(user) => user,
            Err(err) if err.is_not_found() => {
                self.create_account(admin.as_ref(), matrix_user_id, &username)
                    .await?
            }
            Err(err) => return Err(err.into()),
        };

        ghost.mm_username = username;
        ghost.metadata.mm_id = Some(user.id.clone());
        self.runtime.save_ghost(&ghost).await?;
        self.ghost_ids.write().insert(user.id.clone(), true);
        Ok(user.id)
    }

    async fn create_account(
        &self,
        admin: &dyn MattermostApi,
        matrix_user_id: &str,
        username: &str,
    ) -> BridgeResult<User> {
        let (localpart, server) = split_user_id(matrix_user_id)
            .ok_or_else(|| EncodingError::InvalidUserId(matrix_user_id.to_string()))?;
        let new_user = NewUser {
            username: username.to_string(),
            email: format!("{username}@{}", self.email_domain),
            password: generate_password(),
            first_name: localpart.to_string(),
            last_name: format!("({server})"),
            nickname: matrix_user_id.to_string(),
            position: GHOST_POSITION.to_string(),
        };

        match admin.create_user(&new_user).await {
            Ok(user) => {
                info!(matrix_user_id, username, mm_user_id = %user.id, "created ghost account");
                Ok(user)
            }
            Err(err) if err.is_conflict() => {
                debug!(username, "ghost account already exists, fetching it");
                Ok(admin.get_user_by_username(username).await?)
            }
            Err(err) => {
                // Another writer may have won without the server reporting a conflict.
                match admin.get_user_by_username(username).await {
                    Ok(user) => Ok(user),
                    Err(_) => Err(err.into()),
                }
            }
        }
    }

    /// A client that acts as the ghost of `matrix_user_id`, plus that ghost's account ID.
    pub async fn get_or_issue_token(
        &self,
        matrix_user_id: &str,
    ) -> BridgeResult<(Arc<dyn MattermostApi>, String)> {
        let mm_id = self.resolve_or_provision(matrix_user_id).await?;
        if let Some(client) = self.token_clients.read().get(matrix_user_id).cloned() {
            return Ok((client, mm_id));
        }

        let lock = self.identity_lock(matrix_user_id);
        let _guard = lock.lock().await;
        if let Some(client) = self.token_clients.read().get(matrix_user_id).cloned() {
            return Ok((client, mm_id));
        }

        let mut ghost = self.load_ghost(matrix_user_id).await?;
        let token = match ghost.metadata.mm_token.clone() {
            Some(token) => token,
            None => {
                let issued = self
                    .clients
                    .admin()
                    .create_user_access_token(&mm_id, GHOST_TOKEN_DESCRIPTION)
                    .await?;
                ghost.metadata.mm_token = Some(issued.token.clone());
                ghost.metadata.mm_id = Some(mm_id.clone());
                self.runtime.save_ghost(&ghost).await?;
                debug!(matrix_user_id, "issued ghost access token");
                issued.token
            }
        };

        let client = self.clients.with_token(&token)?;
        self.token_clients
            .write()
            .insert(matrix_user_id.to_string(), client.clone());
        Ok((client, mm_id))
    }

    /// Drops a token Mattermost no longer accepts so the next action issues a new one.
    pub async fn invalidate_token(&self, matrix_user_id: &str) -> BridgeResult<()> {
        let lock = self.identity_lock(matrix_user_id);
        let _guard = lock.lock().await;
        self.token_clients.write().remove(matrix_user_id);
        if let Some(mut ghost) = self.runtime.get_ghost(matrix_user_id).await? {
            if ghost.metadata.mm_token.take().is_some() {
                warn!(matrix_user_id, "discarding rejected ghost token");
                self.runtime.save_ghost(&ghost).await?;
            }
        }
        Ok(())
    }

    /// Pushes the Matrix profile to the ghost account. The avatar is uploaded only when its
    /// content hash differs from the last upload, the name only when it differs.
    pub async fn sync_avatar_and_name(
        &self,
        matrix_user_id: &str,
        name: Option<&str>,
        avatar: Option<&[u8]>,
    ) -> BridgeResult<()> {
        let mm_id = self.resolve_or_provision(matrix_user_id).await?;
        let lock = self.identity_lock(matrix_user_id);
        let _guard = lock.lock().await;

        let mut ghost = self.load_ghost(matrix_user_id).await?;
        let admin = self.clients.admin();
        let mut changed = false;

        if let Some(bytes) = avatar.filter(|bytes| !bytes.is_empty()) {
            let hash = avatar_hash(bytes);
            if ghost.metadata.avatar_hash.as_deref() != Some(hash.as_str()) {
                admin.set_profile_image(&mm_id, bytes.to_vec()).await?;
                ghost.metadata.avatar_hash = Some(hash);
                changed = true;
            }
        }

        if let Some(name) = name.map(str::trim).filter(|name| !name.is_empty()) {
            if ghost.metadata.display_name.as_deref() != Some(name) {
                let user = admin.get_user(&mm_id).await?;
                if user.first_name != name || !user.last_name.is_empty() {
                    let patch = UserPatch {
                        first_name: Some(name.to_string()),
                        last_name: Some(String::new()),
                        nickname: Some(name.to_string()),
                    };
                    admin.patch_user(&mm_id, &patch).await?;
                }
                ghost.metadata.display_name = Some(name.to_string());
                changed = true;
            }
        }

        if changed {
            ghost.metadata.mm_id = Some(mm_id);
            self.runtime.save_ghost(&ghost).await?;
        }
        Ok(())
    }

    pub fn is_ghost_username(&self, username: &str) -> bool {
        is_encoded(&self.prefix, username) && decode_username(&self.prefix, username).is_ok()
    }

    /// The Matrix user a Mattermost account stands for, when it is one of our ghosts.
    pub fn ghost_matrix_id(&self, user: &User) -> Option<String> {
        if !self.is_ghost_username(&user.username) {
            return None;
        }
        decode_username(&self.prefix, &user.username).ok()
    }

    /// The Matrix user behind a ghost account, or `None` for regular Mattermost users.
    pub async fn matrix_id_for(&self, mm_user_id: &str) -> BridgeResult<Option<String>> {
        if let Some(ghost) = self.runtime.get_ghost_by_mm_id(mm_user_id).await? {
            return Ok(Some(ghost.matrix_user_id));
        }
        if self.ghost_ids.read().get(mm_user_id) == Some(&false) {
            return Ok(None);
        }
        let user = self.clients.admin().get_user(mm_user_id).await?;
        let matrix_id = self.ghost_matrix_id(&user);
        self.ghost_ids
            .write()
            .insert(mm_user_id.to_string(), matrix_id.is_some());
        Ok(matrix_id)
    }

    pub async fn is_ghost_user_id(&self, mm_user_id: &str) -> BridgeResult<bool> {
        if let Some(known) = self.ghost_ids.read().get(mm_user_id).copied() {
            return Ok(known);
        }
        let is_ghost = if self.runtime.get_ghost_by_mm_id(mm_user_id).await?.is_some() {
            true
        } else {
            let user = self.clients.admin().get_user(mm_user_id).await?;
            self.is_ghost_username(&user.username)
        };
        self.ghost_ids
            .write()
            .insert(mm_user_id.to_string(), is_ghost);
        Ok(is_ghost)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{Ghost, IdentityManager, avatar_hash, split_user_id};
    use crate::error::BridgeError;
    use crate::mattermost::models::NewUser;
    use crate::mattermost::ClientFactory;
    use crate::mattermost::testing::FakeMattermost;
    use crate::runtime::BridgeRuntime;
    use crate::runtime::testing::RecordingRuntime;

    fn manager(fake: &FakeMattermost, runtime: &Arc<RecordingRuntime>) -> IdentityManager {
        IdentityManager::new(
            Arc::new(fake.clone()),
            runtime.clone(),
            "mx.",
            "matrix.bridge.local",
        )
    }

    #[tokio::test]
    async fn a_foreign_account_holding_the_ghost_username_is_ambiguous() {
        let fake = FakeMattermost::new();
        let runtime = Arc::new(RecordingRuntime::new());
        fake.admin()
            .create_user(&NewUser {
                username: "mx.alice_example.org".to_string(),
                email: "squatter@example.com".to_string(),
                password: "pw".to_string(),
                first_name: String::new(),
                last_name: String::new(),
                nickname: "@mallory:evil.org".to_string(),
                position: String::new(),
            })
            .await
            .expect("created");

        let err = manager(&fake, &runtime)
            .resolve_or_provision("@alice:example.org")
            .await
            .expect_err("refused");
        assert!(matches!(err, BridgeError::Ambiguous(_)));
        assert!(runtime.get_ghost("@alice:example.org").await.expect("read").is_none());
    }

    #[tokio::test]
    async fn provisions_a_ghost_with_generated_profile() {
        let fake = FakeMattermost::new();
        let runtime = Arc::new(RecordingRuntime::new());
        let identity = manager(&fake, &runtime);

        let mm_id = identity
            .resolve_or_provision("@alice:example.org")
            .await
            .expect("provisioned");

        let user = fake.user(&mm_id).expect("account exists");
        assert_eq!(user.username, "mx.alice_example.org");
        assert_eq!(user.email, "mx.alice_example.org@matrix.bridge.local");
        assert_eq!(user.first_name, "alice");
        assert_eq!(user.last_name, "(example.org)");
        assert_eq!(user.nickname, "@alice:example.org");
        assert_eq!(user.position, super::GHOST_POSITION);

        let ghost = runtime
            .get_ghost("@alice:example.org")
            .await
            .expect("store works")
            .expect("ghost persisted");
        assert_eq!(ghost.mm_user_id(), Some(mm_id.as_str()));
    }

    #[tokio::test]
    async fn concurrent_provisioning_creates_one_account() {
        let fake = FakeMattermost::new();
        let runtime = Arc::new(RecordingRuntime::new());
        let identity = Arc::new(manager(&fake, &runtime));

        let (a, b) = tokio::join!(
            identity.resolve_or_provision("@alice:example.org"),
            identity.resolve_or_provision("@alice:example.org"),
        );

        assert_eq!(a.expect("first"), b.expect("second"));
        let ghosts: Vec<_> = fake
            .users()
            .into_iter()
            .filter(|u| u.username == "mx.alice_example.org")
            .collect();
        assert_eq!(ghosts.len(), 1);
        assert_eq!(fake.calls("create_user"), 1);
    }

    #[tokio::test]
    async fn separate_managers_racing_reuse_the_existing_account() {
        let fake = FakeMattermost::new();
        let first = manager(&fake, &Arc::new(RecordingRuntime::new()));
        let second = manager(&fake, &Arc::new(RecordingRuntime::new()));

        let (a, b) = tokio::join!(
            first.resolve_or_provision("@bob:example.org"),
            second.resolve_or_provision("@bob:example.org"),
        );

        assert_eq!(a.expect("first"), b.expect("second"));
        assert_eq!(
            fake.users()
                .iter()
                .filter(|u| u.username == "mx.bob_example.org")
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn cached_mapping_skips_the_server() {
        let fake = FakeMattermost::new();
        let runtime = Arc::new(RecordingRuntime::new());
        let mut ghost = Ghost::new("@carol:example.org", "mx.carol_example.org");
        ghost.metadata.mm_id = Some("user-cached".to_string());
        runtime.save_ghost(&ghost).await.expect("seeded");

        let identity = manager(&fake, &runtime);
        let mm_id = identity
            .resolve_or_provision("@carol:example.org")
            .await
            .expect("resolved");

        assert_eq!(mm_id, "user-cached");
        assert_eq!(fake.calls("get_user_by_username"), 0);
    }

    #[tokio::test]
    async fn token_is_issued_once_and_acts_as_the_ghost() {
        let fake = FakeMattermost::new();
        let runtime = Arc::new(RecordingRuntime::new());
        let identity = manager(&fake, &runtime);

        let (client, mm_id) = identity
            .get_or_issue_token("@alice:example.org")
            .await
            .expect("token issued");
        let me = client.get_me().await.expect("token works");
        assert_eq!(me.id, mm_id);

        identity
            .get_or_issue_token("@alice:example.org")
            .await
            .expect("cached");
        assert_eq!(fake.calls("create_user_access_token"), 1);

        let ghost = runtime
            .get_ghost("@alice:example.org")
            .await
            .expect("store works")
            .expect("ghost persisted");
        assert!(ghost.metadata.mm_token.is_some());
    }

    #[tokio::test]
    async fn token_failure_is_an_error_not_a_fallback() {
        let fake = FakeMattermost::new();
        fake.fail("create_user_access_token");
        let runtime = Arc::new(RecordingRuntime::new());
        let identity = manager(&fake, &runtime);

        let result = identity.get_or_issue_token("@alice:example.org").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn invalidated_token_is_reissued() {
        let fake = FakeMattermost::new();
        let runtime = Arc::new(RecordingRuntime::new());
        let identity = manager(&fake, &runtime);

        identity
            .get_or_issue_token("@alice:example.org")
            .await
            .expect("issued");
        identity
            .invalidate_token("@alice:example.org")
            .await
            .expect("invalidated");
        identity
            .get_or_issue_token("@alice:example.org")
            .await
            .expect("reissued");
        assert_eq!(fake.calls("create_user_access_token"), 2);
    }

    #[tokio::test]
    async fn avatar_upload_is_skipped_when_content_is_unchanged() {
        let fake = FakeMattermost::new();
        let runtime = Arc::new(RecordingRuntime::new());
        let identity = manager(&fake, &runtime);
        let mxid = "@alice:example.org";

        identity
            .sync_avatar_and_name(mxid, Some("Alice"), Some(b"png-bytes"))
            .await
            .expect("first sync");
        identity
            .sync_avatar_and_name(mxid, Some("Alice"), Some(b"png-bytes"))
            .await
            .expect("second sync");

        assert_eq!(fake.calls("set_profile_image"), 1);
        assert_eq!(fake.calls("patch_user"), 1);

        let mm_id = identity.resolve_or_provision(mxid).await.expect("known");
        let user = fake.user(&mm_id).expect("exists");
        assert_eq!(user.first_name, "Alice");
        assert_eq!(user.last_name, "");
        assert_eq!(fake.profile_image(&mm_id).as_deref(), Some(&b"png-bytes"[..]));

        identity
            .sync_avatar_and_name(mxid, None, Some(b"new-bytes"))
            .await
            .expect("third sync");
        assert_eq!(fake.calls("set_profile_image"), 2);
        let ghost = runtime.get_ghost(mxid).await.expect("ok").expect("ghost");
        assert_eq!(ghost.metadata.avatar_hash, Some(avatar_hash(b"new-bytes")));
    }

    #[tokio::test]
    async fn ghost_detection_by_name_and_id() {
        let fake = FakeMattermost::new();
        let runtime = Arc::new(RecordingRuntime::new());
        let identity = manager(&fake, &runtime);
        let human = fake.add_user("dave");

        let ghost_id = identity
            .resolve_or_provision("@alice:example.org")
            .await
            .expect("provisioned");

        assert!(identity.is_ghost_username("mx.alice_example.org"));
        assert!(!identity.is_ghost_username("dave"));
        assert!(identity.is_ghost_user_id(&ghost_id).await.expect("lookup"));
        assert!(!identity.is_ghost_user_id(&human.id).await.expect("lookup"));

        let admin = fake.admin();
        let ghost_user = admin.get_user(&ghost_id).await.expect("exists");
        assert_eq!(
            identity.ghost_matrix_id(&ghost_user).as_deref(),
            Some("@alice:example.org")
        );
    }

    #[test]
    fn user_ids_split_at_the_first_colon() {
        assert_eq!(
            split_user_id("@bob:example.org:8448"),
            Some(("bob", "example.org:8448"))
        );
        assert_eq!(split_user_id("bob"), None);
    }
}
