//! In-memory runtime and media store used by the async tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::BridgeRuntime;
use crate::convert::MatrixMedia;
use crate::error::{BridgeError, BridgeResult};
use crate::events::RemoteEvent;
use crate::identity::Ghost;
use crate::portal::{Portal, PortalKey};
use crate::registry::{LoginSession, StoredLogin};

#[derive(Default)]
struct Recorded {
    events: Vec<(String, RemoteEvent)>,
    portals: HashMap<PortalKey, Portal>,
    ghosts: HashMap<String, Ghost>,
    logins: Vec<StoredLogin>,
    invites: Vec<(String, String)>,
    portal_lookups_fail: bool,
}

#[derive(Default)]
pub struct RecordingRuntime {
    state: Mutex<Recorded>,
}

impl RecordingRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queued events with the ID of the login they were queued for.
    pub fn events(&self) -> Vec<(String, RemoteEvent)> {
        self.state.lock().events.clone()
    }

    pub fn invites(&self) -> Vec<(String, String)> {
        self.state.lock().invites.clone()
    }

    pub fn portal(&self, key: &PortalKey) -> Option<Portal> {
        self.state.lock().portals.get(key).cloned()
    }

    pub fn insert_portal(&self, portal: Portal) {
        self.state.lock().portals.insert(portal.key.clone(), portal);
    }

    pub fn fail_portal_lookups(&self, fail: bool) {
        self.state.lock().portal_lookups_fail = fail;
    }

    /// Gives an existing portal a Matrix room, as room creation would.
    pub fn materialize(&self, key: &PortalKey, room_id: &str) {
        let mut state = self.state.lock();
        let portal = state
            .portals
            .entry(key.clone())
            .or_insert_with(|| Portal::new(key.clone(), crate::portal::ConversationKind::Open));
        portal.mxid = Some(room_id.to_string());
    }
}

#[async_trait]
impl BridgeRuntime for RecordingRuntime {
    async fn queue_remote_event(
        &self,
        login: Arc<LoginSession>,
        event: RemoteEvent,
    ) -> BridgeResult<()> {
        self.state.lock().events.push((login.id.clone(), event));
        Ok(())
    }

    async fn get_portal(&self, key: &PortalKey) -> BridgeResult<Option<Portal>> {
        let state = self.state.lock();
        if state.portal_lookups_fail {
            return Err(BridgeError::matrix("portal store unavailable"));
        }
        Ok(state.portals.get(key).cloned())
    }

    async fn get_portal_by_room(&self, room_id: &str) -> BridgeResult<Option<Portal>> {
        Ok(self
            .state
            .lock()
            .portals
            .values()
            .find(|p| p.mxid.as_deref() == Some(room_id))
            .cloned())
    }

    async fn save_portal(&self, portal: &Portal) -> BridgeResult<()> {
        let mut state = self.state.lock();
        if let Some(existing) = state.portals.get(&portal.key)
            && existing.kind != portal.kind
        {
            return Err(BridgeError::Conversion(format!(
                "portal {} cannot change kind",
                portal.key
            )));
        }
        state.portals.insert(portal.key.clone(), portal.clone());
        Ok(())
    }

    async fn list_portals(&self) -> BridgeResult<Vec<Portal>> {
        Ok(self.state.lock().portals.values().cloned().collect())
    }

    async fn get_ghost(&self, matrix_user_id: &str) -> BridgeResult<Option<Ghost>> {
        Ok(self.state.lock().ghosts.get(matrix_user_id).cloned())
    }

    async fn get_ghost_by_mm_id(&self, mm_user_id: &str) -> BridgeResult<Option<Ghost>> {
        Ok(self
            .state
            .lock()
            .ghosts
            .values()
            .find(|g| g.mm_user_id() == Some(mm_user_id))
            .cloned())
    }

    async fn save_ghost(&self, ghost: &Ghost) -> BridgeResult<()> {
        self.state
            .lock()
            .ghosts
            .insert(ghost.matrix_user_id.clone(), ghost.clone());
        Ok(())
    }

    async fn get_login(&self, id: &str) -> BridgeResult<Option<StoredLogin>> {
        Ok(self.state.lock().logins.iter().find(|l| l.id == id).cloned())
    }

    async fn save_login(&self, login: &StoredLogin) -> BridgeResult<()> {
        let mut state = self.state.lock();
        state.logins.retain(|l| l.id != login.id);
        state.logins.push(login.clone());
        Ok(())
    }

    async fn delete_login(&self, id: &str) -> BridgeResult<()> {
        self.state.lock().logins.retain(|l| l.id != id);
        Ok(())
    }

    async fn list_logins(&self) -> BridgeResult<Vec<StoredLogin>> {
        Ok(self.state.lock().logins.clone())
    }

    async fn wait_for_portal_room(&self, key: &PortalKey) -> BridgeResult<Option<String>> {
        for _ in 0..20 {
            if let Some(room) = self
                .state
                .lock()
                .portals
                .get(key)
                .and_then(|p| p.mxid.clone())
            {
                return Ok(Some(room));
            }
            tokio::task::yield_now().await;
        }
        Ok(None)
    }

    async fn set_portal_relay(&self, key: &PortalKey, login_id: &str) -> BridgeResult<()> {
        let mut state = self.state.lock();
        let portal = state
            .portals
            .get_mut(key)
            .ok_or_else(|| BridgeError::NotFound(format!("portal {key}")))?;
        portal.relay_login_id = Some(login_id.to_string());
        Ok(())
    }

    async fn invite_to_room(&self, room_id: &str, matrix_user_id: &str) -> BridgeResult<()> {
        self.state
            .lock()
            .invites
            .push((room_id.to_string(), matrix_user_id.to_string()));
        Ok(())
    }
}

/// Media repository that keeps uploads in memory and hands out sequential `mxc://` URIs.
#[derive(Default)]
pub struct MemoryMedia {
    files: Mutex<HashMap<String, (String, String, Vec<u8>)>>,
}

impl MemoryMedia {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, mxc: &str, filename: &str, mime_type: &str, data: &[u8]) {
        self.files.lock().insert(
            mxc.to_string(),
            (filename.to_string(), mime_type.to_string(), data.to_vec()),
        );
    }

    pub fn uploads(&self) -> usize {
        self.files.lock().len()
    }

    /// Filename and MIME type recorded for an upload.
    pub fn describe(&self, mxc: &str) -> Option<(String, String)> {
        self.files
            .lock()
            .get(mxc)
            .map(|(name, mime, _)| (name.clone(), mime.clone()))
    }
}

#[async_trait]
impl MatrixMedia for MemoryMedia {
    async fn upload(&self, data: Vec<u8>, filename: &str, mime_type: &str) -> BridgeResult<String> {
        let mut files = self.files.lock();
        let mxc = format!("mxc://example.org/media{}", files.len() + 1);
        files.insert(
            mxc.clone(),
            (filename.to_string(), mime_type.to_string(), data),
        );
        Ok(mxc)
    }

    async fn download(&self, mxc_url: &str) -> BridgeResult<Vec<u8>> {
        self.files
            .lock()
            .get(mxc_url)
            .map(|(_, _, data)| data.clone())
            .ok_or_else(|| BridgeError::NotFound(format!("media {mxc_url}")))
    }
}
