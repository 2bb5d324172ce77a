use serde_json::Value;
use tracing::{debug, warn};

use super::from_mattermost::synthesize_filename;
use super::{HTML_FORMAT, MatrixMedia, MessageConverter, PartKind, html_to_markdown};
use crate::error::{BridgeError, BridgeResult};
use crate::mattermost::MattermostApi;
use crate::mattermost::models::NewPost;

fn str_field<'a>(content: &'a Value, key: &str) -> Option<&'a str> {
    content.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// Markdown for the text of an `m.room.message` content. HTML is converted when present,
/// the plain body is used otherwise or when the conversion yields nothing.
pub fn message_text(content: &Value) -> String {
    let body = str_field(content, "body").unwrap_or_default();
    let text = match (str_field(content, "format"), str_field(content, "formatted_body")) {
        (Some(HTML_FORMAT), Some(html)) => html_to_markdown(html).unwrap_or_else(|| {
            debug!("html conversion produced nothing, using plain body");
            body.to_string()
        }),
        _ => body.to_string(),
    };
    if str_field(content, "msgtype") == Some("m.emote") {
        format!("*{text}*")
    } else {
        text
    }
}

impl MessageConverter {
    /// Builds the Mattermost post for Matrix message content. Media is downloaded from
    /// the Matrix media repository and uploaded to `channel_id` with `client`.
    pub async fn to_mattermost(
        &self,
        content: &Value,
        channel_id: &str,
        client: &dyn MattermostApi,
        media: &dyn MatrixMedia,
    ) -> BridgeResult<NewPost> {
        let msgtype = str_field(content, "msgtype").unwrap_or("m.text");
        let kind = PartKind::from_msgtype(msgtype).ok_or_else(|| {
            BridgeError::Conversion(format!("unsupported msgtype {msgtype}"))
        })?;

        let mut post = NewPost {
            channel_id: channel_id.to_string(),
            ..Default::default()
        };

        if !kind.is_media() {
            post.message = message_text(content);
            return Ok(post);
        }

        let filename = str_field(content, "filename");
        let body = str_field(content, "body");
        // A body that differs from the filename is a caption.
        if let (Some(filename), Some(body)) = (filename, body)
            && filename != body
        {
            post.message = message_text(content);
        }

        let mxc = str_field(content, "url").ok_or_else(|| {
            BridgeError::Conversion("media message without a plain url".to_string())
        })?;
        let data = media.download(mxc).await?;
        if self.max_file_size() > 0 && data.len() as u64 > self.max_file_size() {
            warn!(mxc, size = data.len(), "matrix attachment too large for mattermost");
            return Err(BridgeError::Conversion(format!(
                "attachment of {} bytes exceeds the limit",
                data.len()
            )));
        }

        let name = match filename.or(body) {
            Some(name) => name.to_string(),
            None => {
                let mime = content
                    .get("info")
                    .and_then(|info| str_field(info, "mimetype"))
                    .unwrap_or("application/octet-stream");
                synthesize_filename(mime)
            }
        };
        let info = client.upload_file(channel_id, &name, data).await?;
        debug!(file_id = %info.id, name, "uploaded matrix attachment");
        post.file_ids.push(info.id);
        Ok(post)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::message_text;
    use crate::convert::{MatrixMedia, MessageConverter};
    use crate::mattermost::models::Post;
    use crate::mattermost::{ClientFactory, MattermostApi};
    use crate::mattermost::testing::FakeMattermost;
    use crate::runtime::testing::MemoryMedia;

    #[test]
    fn html_is_preferred_over_body() {
        let content = json!({
            "msgtype": "m.text",
            "body": "Hello *world*",
            "format": "org.matrix.custom.html",
            "formatted_body": "Hello <strong>world</strong>",
        });
        assert_eq!(message_text(&content), "Hello **world**");
    }

    #[test]
    fn empty_conversion_falls_back_to_body() {
        let content = json!({
            "msgtype": "m.text",
            "body": "fallback",
            "format": "org.matrix.custom.html",
            "formatted_body": "<p></p>",
        });
        assert_eq!(message_text(&content), "fallback");
    }

    #[test]
    fn emotes_are_italic() {
        let content = json!({ "msgtype": "m.emote", "body": "waves" });
        assert_eq!(message_text(&content), "*waves*");
    }

    #[tokio::test]
    async fn plain_text_round_trips_unchanged() {
        let fake = FakeMattermost::new();
        let media = MemoryMedia::new();
        let converter = MessageConverter::new(1024);
        let source = Post {
            id: "p1".to_string(),
            message: "just some plain words".to_string(),
            ..Default::default()
        };

        let matrix = converter.to_matrix(&source, fake.admin().as_ref(), &media).await;
        let back = converter
            .to_mattermost(&matrix.parts[0].content, "chan1", fake.admin().as_ref(), &media)
            .await
            .expect("converts");
        assert_eq!(back.message, source.message);
        assert!(back.file_ids.is_empty());
    }

    #[tokio::test]
    async fn media_is_reuploaded_without_caption() {
        let fake = FakeMattermost::new();
        let media = MemoryMedia::new();
        let mxc = media
            .upload(b"\x89PNG\r\n\x1a\n".to_vec(), "cat.png", "image/png")
            .await
            .expect("uploads");
        let content = json!({ "msgtype": "m.image", "body": "cat.png", "url": mxc });

        let post = MessageConverter::new(1024)
            .to_mattermost(&content, "chan1", fake.admin().as_ref(), &media)
            .await
            .expect("converts");

        assert!(post.message.is_empty());
        assert_eq!(post.file_ids.len(), 1);
        assert_eq!(fake.calls("upload_file"), 1);
    }

    #[tokio::test]
    async fn captioned_media_keeps_its_text() {
        let fake = FakeMattermost::new();
        let media = MemoryMedia::new();
        media.insert("mxc://example.org/doc", "doc.pdf", "application/pdf", b"%PDF-1.4");
        let content = json!({
            "msgtype": "m.file",
            "body": "the report",
            "filename": "doc.pdf",
            "url": "mxc://example.org/doc",
        });

        let post = MessageConverter::new(1024)
            .to_mattermost(&content, "chan1", fake.admin().as_ref(), &media)
            .await
            .expect("converts");
        assert_eq!(post.message, "the report");
        assert_eq!(post.file_ids.len(), 1);
    }

    #[tokio::test]
    async fn unnamed_media_gets_a_name_from_its_type() {
        let fake = FakeMattermost::new();
        let media = MemoryMedia::new();
        media.insert("mxc://example.org/x", "", "image/png", b"\x89PNG\r\n\x1a\n");
        let content = json!({
            "msgtype": "m.image",
            "url": "mxc://example.org/x",
            "info": { "mimetype": "image/png" },
        });

        let post = MessageConverter::new(1024)
            .to_mattermost(&content, "chan1", fake.admin().as_ref(), &media)
            .await
            .expect("converts");
        let info = fake.admin().get_file_info(&post.file_ids[0]).await.expect("file exists");
        assert_eq!(info.name, "file.png");
    }

    #[tokio::test]
    async fn missing_media_is_an_error() {
        let fake = FakeMattermost::new();
        let media = MemoryMedia::new();
        let content = json!({ "msgtype": "m.file", "body": "x", "url": "mxc://example.org/gone" });

        let result = MessageConverter::new(1024)
            .to_mattermost(&content, "chan1", fake.admin().as_ref(), &media)
            .await;
        assert!(result.is_err());
        assert_eq!(fake.calls("upload_file"), 0);
    }
}
