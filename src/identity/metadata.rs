use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::BridgeError;

pub const METADATA_VERSION: u32 = 1;

/// Per-ghost state persisted alongside the identity mapping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GhostMetadata {
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mm_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mm_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Credential of one logged-in Mattermost account.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoginMetadata {
    pub version: u32,
    pub token: String,
    pub mm_id: String,
    #[serde(default)]
    pub is_auto_provisioned: bool,
}

fn string_field(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn parse_object(raw: &str) -> Result<Map<String, Value>, BridgeError> {
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(Value::Null) => Ok(Map::new()),
        Ok(other) => Err(BridgeError::Conversion(format!(
            "metadata is not an object: {other}"
        ))),
        Err(e) => Err(BridgeError::Conversion(format!("metadata is not JSON: {e}"))),
    }
}

impl GhostMetadata {
    /// Reads the stored document. Documents without a `version` are the legacy flat map and
    /// are migrated field by field.
    pub fn load(raw: &str) -> Result<Self, BridgeError> {
        let map = parse_object(raw)?;
        if map.contains_key("version") {
            return serde_json::from_value(Value::Object(map))
                .map_err(|e| BridgeError::Conversion(format!("ghost metadata: {e}")));
        }
        Ok(Self {
            version: METADATA_VERSION,
            mm_id: string_field(&map, "mm_id").or_else(|| string_field(&map, "user_id")),
            mm_token: string_field(&map, "mm_token").or_else(|| string_field(&map, "token")),
            avatar_hash: string_field(&map, "avatar_hash"),
            display_name: string_field(&map, "display_name"),
        })
    }

    pub fn to_json(&self) -> String {
        let mut stored = self.clone();
        stored.version = METADATA_VERSION;
        serde_json::to_string(&stored).unwrap_or_else(|_| "{}".to_string())
    }
}

impl LoginMetadata {
    pub fn new(token: impl Into<String>, mm_id: impl Into<String>) -> Self {
        Self {
            version: METADATA_VERSION,
            token: token.into(),
            mm_id: mm_id.into(),
            is_auto_provisioned: false,
        }
    }

    pub fn load(raw: &str) -> Result<Self, BridgeError> {
        let map = parse_object(raw)?;
        if map.contains_key("version") {
            return serde_json::from_value(Value::Object(map))
                .map_err(|e| BridgeError::Conversion(format!("login metadata: {e}")));
        }
        let token = string_field(&map, "token")
            .or_else(|| string_field(&map, "access_token"))
            .ok_or_else(|| BridgeError::Conversion("login metadata has no token".to_string()))?;
        Ok(Self {
            version: METADATA_VERSION,
            token,
            mm_id: string_field(&map, "mm_id")
                .or_else(|| string_field(&map, "user_id"))
                .unwrap_or_default(),
            is_auto_provisioned: map
                .get("is_auto_provisioned")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }

    pub fn to_json(&self) -> String {
        let mut stored = self.clone();
        stored.version = METADATA_VERSION;
        serde_json::to_string(&stored).unwrap_or_else(|_| "{}".to_string())
    }
}
