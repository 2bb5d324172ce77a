//! Message conversion between Mattermost posts and Matrix `m.room.message` content.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::BridgeResult;

pub mod emoji;
mod from_mattermost;
mod markdown;
mod to_mattermost;

pub use self::markdown::{escape_html, html_to_markdown, markdown_to_html};
pub use self::to_mattermost::message_text;
pub(crate) use self::from_mattermost::sniff_mime;

pub const HTML_FORMAT: &str = "org.matrix.custom.html";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartKind {
    Text,
    Image,
    File,
    Audio,
    Video,
}

impl PartKind {
    pub fn from_mime(mime_type: &str) -> Self {
        if mime_type.starts_with("image/") {
            Self::Image
        } else if mime_type.starts_with("video/") {
            Self::Video
        } else if mime_type.starts_with("audio/") {
            Self::Audio
        } else {
            Self::File
        }
    }

    pub fn from_msgtype(msgtype: &str) -> Option<Self> {
        match msgtype {
            "m.text" | "m.notice" | "m.emote" => Some(Self::Text),
            "m.image" => Some(Self::Image),
            "m.file" => Some(Self::File),
            "m.audio" => Some(Self::Audio),
            "m.video" => Some(Self::Video),
            _ => None,
        }
    }

    pub fn msgtype(&self) -> &'static str {
        match self {
            Self::Text => "m.text",
            Self::Image => "m.image",
            Self::File => "m.file",
            Self::Audio => "m.audio",
            Self::Video => "m.video",
        }
    }

    pub fn is_media(&self) -> bool {
        !matches!(self, Self::Text)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConvertedPart {
    pub kind: PartKind,
    /// `m.room.message` content, without relations.
    pub content: Value,
    pub file_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConvertedMessage {
    pub parts: Vec<ConvertedPart>,
    pub thread_root: Option<String>,
    /// The text was folded into the single attachment as its caption.
    pub merge_caption: bool,
}

impl ConvertedMessage {
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

/// Matrix media repository access used while converting attachments.
#[async_trait]
pub trait MatrixMedia: Send + Sync {
    /// Uploads bytes and returns the `mxc://` URI.
    async fn upload(&self, data: Vec<u8>, filename: &str, mime_type: &str) -> BridgeResult<String>;
    async fn download(&self, mxc_url: &str) -> BridgeResult<Vec<u8>>;
}

#[derive(Debug, Clone)]
pub struct MessageConverter {
    max_file_size: u64,
}

impl MessageConverter {
    pub fn new(max_file_size: u64) -> Self {
        Self { max_file_size }
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// Zero disables the ceiling.
    pub(crate) fn too_large(&self, size: u64) -> bool {
        self.max_file_size > 0 && size > self.max_file_size
    }
}

/// Text content for an `m.room.message`, with HTML only when the markdown carried markup.
pub fn text_content(markdown: &str) -> Value {
    let mut content = serde_json::json!({
        "msgtype": "m.text",
        "body": markdown,
    });
    if let Some(html) = markdown_to_html(markdown) {
        content["format"] = Value::from(HTML_FORMAT);
        content["formatted_body"] = Value::from(html);
    }
    content
}
