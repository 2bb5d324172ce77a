use serde::Deserialize;
use serde_json::{Map, Value, json};
use thiserror::Error;

use super::models::{Post, Reaction};

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed websocket frame: {0}")]
    Malformed(String),
    #[error("{event} frame is missing `{field}`")]
    MissingField { event: String, field: &'static str },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Broadcast {
    pub channel_id: String,
    pub team_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct RawFrame {
    event: String,
    data: Map<String, Value>,
    broadcast: Broadcast,
    seq: i64,
    status: String,
    seq_reply: i64,
}

/// A classified frame from `/api/v4/websocket`.
#[derive(Debug, Clone, PartialEq)]
pub enum WsEvent {
    Hello,
    /// Reply to a client action such as the authentication challenge.
    Reply { seq_reply: i64, ok: bool },
    Posted { post: Post, sender_name: Option<String> },
    PostEdited { post: Post },
    PostDeleted { post: Post },
    ReactionAdded { reaction: Reaction },
    ReactionRemoved { reaction: Reaction },
    Other(String),
}

pub fn authentication_challenge(seq: i64, token: &str) -> String {
    json!({
        "seq": seq,
        "action": "authentication_challenge",
        "data": { "token": token },
    })
    .to_string()
}

/// Mattermost double-encodes nested payloads: `data.post` and `data.reaction` are JSON
/// strings.
fn nested<T: serde::de::DeserializeOwned>(
    frame: &RawFrame,
    field: &'static str,
) -> Result<T, FrameError> {
    let raw = frame
        .data
        .get(field)
        .ok_or_else(|| FrameError::MissingField {
            event: frame.event.clone(),
            field,
        })?;
    match raw {
        Value::String(encoded) => serde_json::from_str(encoded),
        other => serde_json::from_value(other.clone()),
    }
    .map_err(|e| FrameError::Malformed(format!("{} {field}: {e}", frame.event)))
}

fn post_with_channel(frame: &RawFrame) -> Result<Post, FrameError> {
    let mut post: Post = nested(frame, "post")?;
    if post.channel_id.is_empty() {
        post.channel_id = frame.broadcast.channel_id.clone();
    }
    Ok(post)
}

fn reaction_with_channel(frame: &RawFrame) -> Result<Reaction, FrameError> {
    let mut reaction: Reaction = nested(frame, "reaction")?;
    if reaction.channel_id.is_empty() {
        reaction.channel_id = frame.broadcast.channel_id.clone();
    }
    Ok(reaction)
}

pub fn parse_frame(text: &str) -> Result<WsEvent, FrameError> {
    let frame: RawFrame =
        serde_json::from_str(text).map_err(|e| FrameError::Malformed(e.to_string()))?;

    if frame.event.is_empty() {
        if frame.seq_reply > 0 || !frame.status.is_empty() {
            return Ok(WsEvent::Reply {
                seq_reply: frame.seq_reply,
                ok: frame.status == "OK",
            });
        }
        return Err(FrameError::Malformed("frame has no event".to_string()));
    }

    match frame.event.as_str() {
        "hello" => Ok(WsEvent::Hello),
        "posted" => {
            let sender_name = frame
                .data
                .get("sender_name")
                .and_then(Value::as_str)
                .map(|name| name.trim_start_matches('@').to_string());
            Ok(WsEvent::Posted {
                post: post_with_channel(&frame)?,
                sender_name,
            })
        }
        "post_edited" => Ok(WsEvent::PostEdited {
            post: post_with_channel(&frame)?,
        }),
        "post_deleted" => Ok(WsEvent::PostDeleted {
            post: post_with_channel(&frame)?,
        }),
        "reaction_added" => Ok(WsEvent::ReactionAdded {
            reaction: reaction_with_channel(&frame)?,
        }),
        "reaction_removed" => Ok(WsEvent::ReactionRemoved {
            reaction: reaction_with_channel(&frame)?,
        }),
        other => Ok(WsEvent::Other(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{WsEvent, authentication_challenge, parse_frame};

    #[test]
    fn posted_frames_decode_the_nested_post() {
        let post = json!({
            "id": "p1",
            "channel_id": "c1",
            "user_id": "u1",
            "message": "hello",
            "create_at": 1_700_000_000_000_i64,
        });
        let frame = json!({
            "event": "posted",
            "data": { "post": post.to_string(), "sender_name": "@alice" },
            "broadcast": { "channel_id": "c1" },
            "seq": 4,
        });

        match parse_frame(&frame.to_string()).expect("frame parses") {
            WsEvent::Posted { post, sender_name } => {
                assert_eq!(post.id, "p1");
                assert_eq!(post.message, "hello");
                assert_eq!(sender_name.as_deref(), Some("alice"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn reactions_fall_back_to_broadcast_channel() {
        let reaction = json!({ "user_id": "u1", "post_id": "p1", "emoji_name": "smile" });
        let frame = json!({
            "event": "reaction_added",
            "data": { "reaction": reaction.to_string() },
            "broadcast": { "channel_id": "c9" },
        });

        match parse_frame(&frame.to_string()).expect("frame parses") {
            WsEvent::ReactionAdded { reaction } => assert_eq!(reaction.channel_id, "c9"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn replies_and_unknown_events_are_classified() {
        let reply = parse_frame(r#"{"status":"OK","seq_reply":1}"#).expect("reply");
        assert_eq!(
            reply,
            WsEvent::Reply {
                seq_reply: 1,
                ok: true
            }
        );

        let typing = parse_frame(r#"{"event":"typing","data":{}}"#).expect("typing");
        assert_eq!(typing, WsEvent::Other("typing".to_string()));
    }

    #[test]
    fn broken_payloads_are_errors() {
        assert!(parse_frame("not json").is_err());
        assert!(parse_frame(r#"{"event":"posted","data":{"post":"{oops"}}"#).is_err());
        assert!(parse_frame(r#"{"event":"posted","data":{}}"#).is_err());
    }

    #[test]
    fn challenge_carries_the_token() {
        let challenge: serde_json::Value =
            serde_json::from_str(&authentication_challenge(1, "secret")).expect("json");
        assert_eq!(challenge["action"], "authentication_challenge");
        assert_eq!(challenge["data"]["token"], "secret");
    }
}
