//! Mattermost emoji names and the Unicode keys Matrix reactions carry.

const EMOJI: &[(&str, &str)] = &[
    ("+1", "👍"),
    ("-1", "👎"),
    ("thumbsup", "👍"),
    ("thumbsdown", "👎"),
    ("smile", "😄"),
    ("smiley", "😃"),
    ("grinning", "😀"),
    ("laughing", "😆"),
    ("joy", "😂"),
    ("slightly_smiling_face", "🙂"),
    ("wink", "😉"),
    ("blush", "😊"),
    ("heart_eyes", "😍"),
    ("thinking_face", "🤔"),
    ("neutral_face", "😐"),
    ("confused", "😕"),
    ("cry", "😢"),
    ("sob", "😭"),
    ("scream", "😱"),
    ("angry", "😠"),
    ("sunglasses", "😎"),
    ("heart", "❤️"),
    ("broken_heart", "💔"),
    ("fire", "🔥"),
    ("tada", "🎉"),
    ("rocket", "🚀"),
    ("eyes", "👀"),
    ("clap", "👏"),
    ("pray", "🙏"),
    ("muscle", "💪"),
    ("wave", "👋"),
    ("ok_hand", "👌"),
    ("raised_hands", "🙌"),
    ("white_check_mark", "✅"),
    ("heavy_check_mark", "✔️"),
    ("x", "❌"),
    ("warning", "⚠️"),
    ("question", "❓"),
    ("exclamation", "❗"),
    ("star", "⭐"),
    ("100", "💯"),
    ("bug", "🐛"),
    ("coffee", "☕"),
    ("beers", "🍻"),
];

fn strip_variation(key: &str) -> String {
    key.replace('\u{fe0f}', "")
}

/// The Unicode emoji for a Mattermost name. Unknown names become `:name:` so custom emoji
/// still show up as text.
pub fn to_unicode(name: &str) -> String {
    EMOJI
        .iter()
        .find(|(shortcode, _)| *shortcode == name)
        .map(|(_, unicode)| (*unicode).to_string())
        .unwrap_or_else(|| format!(":{name}:"))
}

/// The Mattermost name for a Matrix reaction key, if it has one.
pub fn to_name(key: &str) -> Option<String> {
    let trimmed = key.trim();
    if let Some(name) = trimmed
        .strip_prefix(':')
        .and_then(|rest| rest.strip_suffix(':'))
        .filter(|name| !name.is_empty())
    {
        return Some(name.to_string());
    }
    let wanted = strip_variation(trimmed);
    EMOJI
        .iter()
        .find(|(_, unicode)| strip_variation(unicode) == wanted)
        .map(|(shortcode, _)| (*shortcode).to_string())
}

#[cfg(test)]
mod tests {
    use super::{to_name, to_unicode};

    #[test]
    fn known_names_map_both_ways() {
        assert_eq!(to_unicode("+1"), "👍");
        assert_eq!(to_name("👍").as_deref(), Some("+1"));
        assert_eq!(to_name("❤").as_deref(), Some("heart"));
        assert_eq!(to_name("❤️").as_deref(), Some("heart"));
    }

    #[test]
    fn custom_emoji_pass_through_as_shortcodes() {
        assert_eq!(to_unicode("partyparrot"), ":partyparrot:");
        assert_eq!(to_name(":partyparrot:").as_deref(), Some("partyparrot"));
    }

    #[test]
    fn unknown_unicode_has_no_name() {
        assert_eq!(to_name("🦀"), None);
        assert_eq!(to_name("::"), None);
    }
}
