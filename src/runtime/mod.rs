//! The contract between the Mattermost-facing core and the bridge runtime that owns
//! persistence, Matrix room state and the per-portal queues.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::BridgeResult;
use crate::events::RemoteEvent;
use crate::identity::Ghost;
use crate::portal::{Portal, PortalKey};
use crate::registry::{LoginSession, StoredLogin};

pub mod local;
#[cfg(test)]
pub mod testing;

pub use self::local::LocalRuntime;

#[async_trait]
pub trait BridgeRuntime: Send + Sync {
    /// Enqueues an event on its portal's serialized queue. Delivery is at least once; the
    /// runtime drops repeats by [`RemoteEvent::dedup_key`].
    async fn queue_remote_event(
        &self,
        login: Arc<LoginSession>,
        event: RemoteEvent,
    ) -> BridgeResult<()>;

    async fn get_portal(&self, key: &PortalKey) -> BridgeResult<Option<Portal>>;
    async fn get_portal_by_room(&self, room_id: &str) -> BridgeResult<Option<Portal>>;
    async fn save_portal(&self, portal: &Portal) -> BridgeResult<()>;
    async fn list_portals(&self) -> BridgeResult<Vec<Portal>>;

    async fn get_ghost(&self, matrix_user_id: &str) -> BridgeResult<Option<Ghost>>;
    async fn get_ghost_by_mm_id(&self, mm_user_id: &str) -> BridgeResult<Option<Ghost>>;
    async fn save_ghost(&self, ghost: &Ghost) -> BridgeResult<()>;

    async fn get_login(&self, id: &str) -> BridgeResult<Option<StoredLogin>>;
    async fn save_login(&self, login: &StoredLogin) -> BridgeResult<()>;
    async fn delete_login(&self, id: &str) -> BridgeResult<()>;
    async fn list_logins(&self) -> BridgeResult<Vec<StoredLogin>>;

    /// Resolves once the portal has a Matrix room, or with `None` after the configured
    /// number of attempts.
    async fn wait_for_portal_room(&self, key: &PortalKey) -> BridgeResult<Option<String>>;
    async fn set_portal_relay(&self, key: &PortalKey, login_id: &str) -> BridgeResult<()>;
    async fn invite_to_room(&self, room_id: &str, matrix_user_id: &str) -> BridgeResult<()>;
}
