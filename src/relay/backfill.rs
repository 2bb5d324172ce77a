use tracing::{debug, warn};

use super::MattermostRelay;
use crate::convert::ConvertedMessage;
use crate::error::BridgeResult;
use crate::mattermost::models::{Post, Reaction};

pub const DEFAULT_FETCH_COUNT: usize = 50;

#[derive(Debug, Clone, PartialEq)]
pub struct BackfillMessage {
    pub post: Post,
    pub converted: ConvertedMessage,
    pub reactions: Vec<Reaction>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchResult {
    /// Oldest first.
    pub messages: Vec<BackfillMessage>,
    pub has_more: bool,
}

impl MattermostRelay {
    /// Pages through channel history from `anchor`, or from the newest post without one.
    /// System posts are dropped; `has_more` reflects the raw page size.
    pub async fn fetch_messages(
        &self,
        channel_id: &str,
        anchor: Option<&str>,
        forward: bool,
        count: usize,
    ) -> BridgeResult<FetchResult> {
        let count = if count == 0 { DEFAULT_FETCH_COUNT } else { count };
        let per_page = u32::try_from(count).unwrap_or(u32::MAX);
        let client = self.login.client();

        let list = match (anchor, forward) {
            (Some(anchor), true) => client.get_posts_after(channel_id, anchor, per_page).await?,
            (Some(anchor), false) => client.get_posts_before(channel_id, anchor, per_page).await?,
            (None, _) => client.get_posts_for_channel(channel_id, 0, per_page).await?,
        };
        let has_more = list.order.len() >= count;

        let mut posts = list.into_ordered();
        posts.reverse();

        let mut messages = Vec::with_capacity(posts.len());
        for post in posts {
            if post.is_system() {
                debug!(post_id = %post.id, post_type = %post.post_type, "skipping system post");
                continue;
            }
            let converted = self
                .converter
                .to_matrix(&post, client.as_ref(), self.media.as_ref())
                .await;
            let reactions = match client.get_reactions(&post.id).await {
                Ok(reactions) => reactions,
                Err(err) => {
                    warn!(post_id = %post.id, error = %err, "failed to fetch reactions");
                    Vec::new()
                }
            };
            messages.push(BackfillMessage {
                post,
                converted,
                reactions,
            });
        }

        Ok(FetchResult { messages, has_more })
    }
}
