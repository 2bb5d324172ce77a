use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{ConvertedMessage, ConvertedPart, MatrixMedia, MessageConverter, PartKind, text_content};
use crate::mattermost::MattermostApi;
use crate::mattermost::models::{FileInfo, Post};

const OCTET_STREAM: &str = "application/octet-stream";

/// Guesses a MIME type from the leading bytes of a file.
pub(crate) fn sniff_mime(data: &[u8]) -> &'static str {
    const SIGNATURES: &[(&[u8], &str)] = &[
        (b"\x89PNG\r\n\x1a\n", "image/png"),
        (b"\xff\xd8\xff", "image/jpeg"),
        (b"GIF87a", "image/gif"),
        (b"GIF89a", "image/gif"),
        (b"%PDF-", "application/pdf"),
        (b"OggS", "audio/ogg"),
        (b"ID3", "audio/mpeg"),
        (b"fLaC", "audio/flac"),
        (b"\x1a\x45\xdf\xa3", "video/webm"),
        (b"PK\x03\x04", "application/zip"),
    ];
    if let Some(mime) = SIGNATURES
        .iter()
        .find(|(magic, _)| data.starts_with(magic))
        .map(|(_, mime)| *mime)
    {
        return mime;
    }
    if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        return "image/webp";
    }
    if data.len() >= 12 && &data[4..8] == b"ftyp" {
        return "video/mp4";
    }
    match std::str::from_utf8(data) {
        Ok(text) if !text.chars().any(|c| c.is_control() && !c.is_whitespace()) => "text/plain",
        _ => OCTET_STREAM,
    }
}

/// `file` plus the first extension registered for the MIME type.
pub(crate) fn synthesize_filename(mime_type: &str) -> String {
    match mime_guess::get_mime_extensions_str(mime_type).and_then(|exts| exts.first()) {
        Some(ext) => format!("file.{ext}"),
        None => "file".to_string(),
    }
}

impl MessageConverter {
    /// Converts a post into Matrix message parts. Attachment failures drop the single
    /// attachment; the rest of the message is still converted.
    pub async fn to_matrix(
        &self,
        post: &Post,
        files: &dyn MattermostApi,
        media: &dyn MatrixMedia,
    ) -> ConvertedMessage {
        let mut output = ConvertedMessage {
            thread_root: post.thread_root().map(str::to_string),
            ..Default::default()
        };

        if !post.message.trim().is_empty() {
            output.parts.push(ConvertedPart {
                kind: PartKind::Text,
                content: text_content(&post.message),
                file_id: None,
            });
        }

        for file_id in &post.file_ids {
            if let Some(part) = self.file_to_matrix(&post.id, file_id, files, media).await {
                output.parts.push(part);
            }
        }

        output.merge_caption = merge_caption(&mut output.parts);
        output
    }

    async fn file_to_matrix(
        &self,
        post_id: &str,
        file_id: &str,
        files: &dyn MattermostApi,
        media: &dyn MatrixMedia,
    ) -> Option<ConvertedPart> {
        let (data, info) = match files.get_file_info(file_id).await {
            Ok(info) if self.too_large(info.size.max(0) as u64) => {
                warn!(
                    post_id,
                    file_id,
                    size = info.size,
                    max = self.max_file_size,
                    "attachment too large, skipping"
                );
                return None;
            }
            Ok(info) => match files.get_file(file_id).await {
                Ok(data) => (data, Some(info)),
                Err(err) => {
                    warn!(post_id, file_id, error = %err, "failed to download attachment");
                    return None;
                }
            },
            Err(err) => {
                debug!(post_id, file_id, error = %err, "file info unavailable, downloading bare file");
                match files.get_file(file_id).await {
                    Ok(data) => (data, None),
                    Err(err) => {
                        warn!(post_id, file_id, error = %err, "failed to download attachment");
                        return None;
                    }
                }
            }
        };

        let (filename, mime_type) = match &info {
            Some(info) => {
                let mime = if info.mime_type.is_empty() {
                    sniff_mime(&data).to_string()
                } else {
                    info.mime_type.clone()
                };
                let name = if info.name.is_empty() {
                    synthesize_filename(&mime)
                } else {
                    info.name.clone()
                };
                (name, mime)
            }
            None => {
                let mime = sniff_mime(&data);
                (synthesize_filename(mime), mime.to_string())
            }
        };

        let size = data.len() as u64;
        if self.too_large(size) {
            warn!(
                post_id,
                file_id,
                size,
                max = self.max_file_size,
                "attachment too large, skipping"
            );
            return None;
        }

        let mxc = match media.upload(data, &filename, &mime_type).await {
            Ok(mxc) => mxc,
            Err(err) => {
                warn!(post_id, file_id, error = %err, "failed to upload attachment to matrix");
                return None;
            }
        };

        let kind = PartKind::from_mime(&mime_type);
        let mut file_info = json!({ "mimetype": mime_type, "size": size });
        if let Some(FileInfo { width, height, .. }) = info.as_ref()
            && kind == PartKind::Image
            && *width > 0
            && *height > 0
        {
            file_info["w"] = Value::from(*width);
            file_info["h"] = Value::from(*height);
        }

        Some(ConvertedPart {
            kind,
            content: json!({
                "msgtype": kind.msgtype(),
                "body": filename,
                "url": mxc,
                "info": file_info,
            }),
            file_id: Some(file_id.to_string()),
        })
    }
}

/// Folds a lone text part into a lone attachment: the attachment keeps its filename in
/// `filename` and the text becomes its body.
fn merge_caption(parts: &mut Vec<ConvertedPart>) -> bool {
    if parts.len() != 2 || parts[0].kind != PartKind::Text || !parts[1].kind.is_media() {
        return false;
    }
    let text = parts.remove(0);
    let media = &mut parts[0];
    let filename = media.content["body"].clone();
    media.content["filename"] = filename;
    media.content["body"] = text.content["body"].clone();
    if let Some(html) = text.content.get("formatted_body") {
        media.content["format"] = text.content["format"].clone();
        media.content["formatted_body"] = html.clone();
    }
    true
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{sniff_mime, synthesize_filename};
    use crate::convert::{MessageConverter, PartKind};
    use crate::mattermost::testing::FakeMattermost;
    use crate::mattermost::ClientFactory;
    use crate::mattermost::models::Post;
    use crate::runtime::testing::MemoryMedia;

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

    fn post(message: &str, file_ids: Vec<String>) -> Post {
        Post {
            id: "post1".to_string(),
            channel_id: "chan1".to_string(),
            user_id: "user1".to_string(),
            message: message.to_string(),
            file_ids,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn markdown_becomes_one_html_text_part() {
        let fake = FakeMattermost::new();
        let media = MemoryMedia::new();
        let converted = MessageConverter::new(1024)
            .to_matrix(&post("Hello **world**", vec![]), fake.admin().as_ref(), &media)
            .await;

        assert_eq!(converted.parts.len(), 1);
        let part = &converted.parts[0];
        assert_eq!(part.kind, PartKind::Text);
        assert_eq!(part.content["body"], "Hello **world**");
        assert_eq!(part.content["formatted_body"], "Hello <strong>world</strong>");
        assert_eq!(converted.thread_root, None);
        assert!(!converted.merge_caption);
    }

    #[tokio::test]
    async fn image_keeps_metadata_and_dimensions() {
        let fake = FakeMattermost::new();
        let media = MemoryMedia::new();
        let file_id = fake.add_file("test.png", "image/png", PNG, Some((100, 80)));

        let converted = MessageConverter::new(1024)
            .to_matrix(&post("", vec![file_id.clone()]), fake.admin().as_ref(), &media)
            .await;

        assert_eq!(converted.parts.len(), 1);
        let part = &converted.parts[0];
        assert_eq!(part.kind, PartKind::Image);
        assert_eq!(part.file_id.as_deref(), Some(file_id.as_str()));
        assert_eq!(part.content["msgtype"], "m.image");
        assert_eq!(part.content["body"], "test.png");
        assert_eq!(part.content["info"]["w"], 100);
        assert_eq!(part.content["info"]["h"], 80);
        let mxc = part.content["url"].as_str().expect("url set");
        assert_eq!(
            media.describe(mxc),
            Some(("test.png".to_string(), "image/png".to_string()))
        );
    }

    #[tokio::test]
    async fn dimensions_are_omitted_unless_both_are_known() {
        let fake = FakeMattermost::new();
        let media = MemoryMedia::new();
        let file_id = fake.add_file("wide.png", "image/png", PNG, Some((100, 0)));

        let converted = MessageConverter::new(1024)
            .to_matrix(&post("", vec![file_id]), fake.admin().as_ref(), &media)
            .await;

        let info = &converted.parts[0].content["info"];
        assert!(info.get("w").is_none());
        assert!(info.get("h").is_none());
    }

    #[tokio::test]
    async fn oversized_file_is_skipped_but_text_survives() {
        let fake = FakeMattermost::new();
        let media = MemoryMedia::new();
        let big = vec![0u8; 10 * 1024];
        let file_id = fake.add_file("big.bin", "application/octet-stream", &big, None);

        let converted = MessageConverter::new(5 * 1024)
            .to_matrix(&post("see attached", vec![file_id]), fake.admin().as_ref(), &media)
            .await;

        assert_eq!(converted.parts.len(), 1);
        assert_eq!(converted.parts[0].kind, PartKind::Text);
        assert_eq!(converted.parts[0].content["body"], "see attached");
        assert_eq!(media.uploads(), 0);
        assert_eq!(fake.calls("get_file"), 0);
    }

    #[tokio::test]
    async fn oversized_bare_file_is_dropped_after_download() {
        let fake = FakeMattermost::new();
        let media = MemoryMedia::new();
        let file_id = fake.add_bare_file(&[0u8; 10 * 1024]);

        let converted = MessageConverter::new(5 * 1024)
            .to_matrix(&post("", vec![file_id]), fake.admin().as_ref(), &media)
            .await;

        assert!(converted.parts.is_empty());
        assert_eq!(fake.calls("get_file"), 1);
        assert_eq!(media.uploads(), 0);
    }

    #[tokio::test]
    async fn caption_merges_into_the_single_attachment() {
        let fake = FakeMattermost::new();
        let media = MemoryMedia::new();
        let file_id = fake.add_file("report.pdf", "application/pdf", b"%PDF-1.4", None);

        let converted = MessageConverter::new(1024)
            .to_matrix(&post("quarterly *numbers*", vec![file_id]), fake.admin().as_ref(), &media)
            .await;

        assert!(converted.merge_caption);
        assert_eq!(converted.parts.len(), 1);
        let content = &converted.parts[0].content;
        assert_eq!(content["msgtype"], "m.file");
        assert_eq!(content["filename"], "report.pdf");
        assert_eq!(content["body"], "quarterly *numbers*");
        assert_eq!(content["formatted_body"], "quarterly <em>numbers</em>");
    }

    #[tokio::test]
    async fn several_attachments_keep_the_text_separate() {
        let fake = FakeMattermost::new();
        let media = MemoryMedia::new();
        let a = fake.add_file("a.png", "image/png", PNG, None);
        let b = fake.add_file("b.png", "image/png", PNG, None);

        let converted = MessageConverter::new(1024)
            .to_matrix(&post("two pictures", vec![a, b]), fake.admin().as_ref(), &media)
            .await;

        assert!(!converted.merge_caption);
        let kinds: Vec<PartKind> = converted.parts.iter().map(|p| p.kind).collect();
        assert_eq!(kinds, [PartKind::Text, PartKind::Image, PartKind::Image]);
    }

    #[tokio::test]
    async fn missing_file_info_falls_back_to_sniffing() {
        let fake = FakeMattermost::new();
        let media = MemoryMedia::new();
        let file_id = fake.add_bare_file(PNG);

        let converted = MessageConverter::new(1024)
            .to_matrix(&post("", vec![file_id]), fake.admin().as_ref(), &media)
            .await;

        let content = &converted.parts[0].content;
        assert_eq!(content["body"], "file.png");
        assert_eq!(content["info"], json!({ "mimetype": "image/png", "size": PNG.len() }));
    }

    #[tokio::test]
    async fn unreadable_attachment_is_dropped() {
        let fake = FakeMattermost::new();
        let media = MemoryMedia::new();

        let converted = MessageConverter::new(1024)
            .to_matrix(&post("text", vec!["nope".to_string()]), fake.admin().as_ref(), &media)
            .await;

        assert_eq!(converted.parts.len(), 1);
        assert_eq!(converted.parts[0].kind, PartKind::Text);
    }

    #[tokio::test]
    async fn replies_point_at_their_thread_root() {
        let fake = FakeMattermost::new();
        let media = MemoryMedia::new();
        let mut reply = post("answer", vec![]);
        reply.root_id = "X".to_string();

        let converted = MessageConverter::new(1024)
            .to_matrix(&reply, fake.admin().as_ref(), &media)
            .await;
        assert_eq!(converted.thread_root.as_deref(), Some("X"));
    }

    #[test]
    fn sniffing_recognizes_common_formats() {
        assert_eq!(sniff_mime(PNG), "image/png");
        assert_eq!(sniff_mime(b"\xff\xd8\xff\xe0"), "image/jpeg");
        assert_eq!(sniff_mime(b"hello"), "text/plain");
        assert_eq!(sniff_mime(&[0, 1, 2, 3]), "application/octet-stream");
    }

    #[test]
    fn filenames_come_from_the_mime_type() {
        assert_eq!(synthesize_filename("image/png"), "file.png");
        assert_eq!(synthesize_filename("application/x-unknown-thing"), "file");
    }
}
