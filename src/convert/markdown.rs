//! Markdown and Matrix HTML conversion for the subset both sides render.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static INLINE_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"`([^`\n]+)`").expect("valid regex"));
static LINK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[([^\]\n]+)\]\((https?://[^)\s]+)\)").expect("valid regex")
});
static BOLD_STARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\*\*([^*\n]+)\*\*").expect("valid regex"));
static BOLD_UNDERSCORES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b__([^_\n]+)__\b").expect("valid regex"));
static ITALIC_STAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\*([^*\s][^*\n]*)\*").expect("valid regex"));
static ITALIC_UNDERSCORE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b_([^_\n]+)_\b").expect("valid regex"));
static STRIKE: Lazy<Regex> = Lazy::new(|| Regex::new(r"~~([^~\n]+)~~").expect("valid regex"));

static REPLY_FALLBACK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<mx-reply>.*?</mx-reply>").expect("valid regex"));
static PRE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)<pre><code(?: class="language-([\w+-]+)")?>(.*?)</code></pre>"#)
        .expect("valid regex")
});
static CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<code>(.*?)</code>").expect("valid regex"));
static ANCHOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?s)<a [^>]*href="([^"]*)"[^>]*>(.*?)</a>"#).expect("valid regex"));
static BREAK: Lazy<Regex> = Lazy::new(|| Regex::new(r"<br\s*/?>").expect("valid regex"));
static PARAGRAPH_GAP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"</p>\s*<p[^>]*>").expect("valid regex"));
static BLOCKQUOTE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<blockquote>(.*?)</blockquote>").expect("valid regex"));
static LIST_ITEM: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<li>(.*?)</li>\s*").expect("valid regex"));
static HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<h([1-6])>(.*?)</h[1-6]>").expect("valid regex"));
static ANY_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("valid regex"));

/// (open tag, close tag, markdown marker)
const EMPHASIS: &[(&str, &str, &str)] = &[
    ("<strong>", "</strong>", "**"),
    ("<b>", "</b>", "**"),
    ("<em>", "</em>", "*"),
    ("<i>", "</i>", "*"),
    ("<del>", "</del>", "~~"),
    ("<s>", "</s>", "~~"),
    ("<strike>", "</strike>", "~~"),
];

pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn unescape_html(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

fn render_inline(segment: &str) -> String {
    let text = LINK.replace_all(segment, r#"<a href="$2">$1</a>"#);
    let text = BOLD_STARS.replace_all(&text, "<strong>$1</strong>");
    let text = BOLD_UNDERSCORES.replace_all(&text, "<strong>$1</strong>");
    let text = ITALIC_STAR.replace_all(&text, "<em>$1</em>");
    let text = ITALIC_UNDERSCORE.replace_all(&text, "<em>$1</em>");
    STRIKE.replace_all(&text, "<del>$1</del>").into_owned()
}

fn render_line_block(block: &str) -> String {
    let escaped = escape_html(block);
    let mut out = String::with_capacity(escaped.len());
    let mut last = 0;
    for caps in INLINE_CODE.captures_iter(&escaped) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&render_inline(&escaped[last..whole.start()]));
        out.push_str("<code>");
        out.push_str(&caps[1]);
        out.push_str("</code>");
        last = whole.end();
    }
    out.push_str(&render_inline(&escaped[last..]));
    out.replace('\n', "<br>")
}

/// Renders Mattermost markdown as Matrix HTML. Returns `None` when the text carries no
/// markup, so the event can be sent as plain text.
pub fn markdown_to_html(markdown: &str) -> Option<String> {
    let mut html = String::new();
    let mut plain = Vec::new();
    let mut fence: Option<(String, Vec<&str>)> = None;

    for line in markdown.split('\n') {
        let trimmed = line.trim_start();
        match fence.take() {
            Some((lang, body)) if trimmed.starts_with("```") => {
                let class = if lang.is_empty() {
                    String::new()
                } else {
                    format!(r#" class="language-{lang}""#)
                };
                html.push_str(&format!(
                    "<pre><code{class}>{}\n</code></pre>",
                    escape_html(&body.join("\n"))
                ));
            }
            Some((lang, mut body)) => {
                body.push(line);
                fence = Some((lang, body));
            }
            None if trimmed.starts_with("```") => {
                if !plain.is_empty() {
                    html.push_str(&render_line_block(&plain.join("\n")));
                    plain.clear();
                }
                fence = Some((trimmed.trim_start_matches('`').trim().to_string(), Vec::new()));
            }
            None => plain.push(line),
        }
    }
    if let Some((_, body)) = fence {
        // Unterminated fence renders as text.
        plain.push("```");
        plain.extend(body);
    }
    if !plain.is_empty() {
        html.push_str(&render_line_block(&plain.join("\n")));
    }

    let unchanged = escape_html(markdown).replace('\n', "<br>");
    (html != unchanged).then_some(html)
}

fn replace_emphasis(html: &str) -> String {
    let mut out = html.to_string();
    for (open, close, marker) in EMPHASIS {
        out = out.replace(open, marker).replace(close, marker);
    }
    out
}

/// Converts Matrix HTML to Mattermost markdown. Returns `None` when nothing useful survives
/// the conversion, in which case callers use the plain body.
pub fn html_to_markdown(html: &str) -> Option<String> {
    let text = REPLY_FALLBACK.replace_all(html, "");
    let text = PRE.replace_all(&text, |caps: &Captures| {
        let lang = caps.get(1).map_or("", |m| m.as_str());
        let code = unescape_html(caps[2].trim_end_matches('\n'));
        format!("```{lang}\n{code}\n```\n")
    });
    let text = CODE.replace_all(&text, |caps: &Captures| format!("`{}`", unescape_html(&caps[1])));
    let text = ANCHOR.replace_all(&text, |caps: &Captures| {
        let href = &caps[1];
        let label = ANY_TAG.replace_all(&caps[2], "");
        if label == href || label.is_empty() {
            href.to_string()
        } else {
            format!("[{label}]({href})")
        }
    });
    let text = HEADING.replace_all(&text, |caps: &Captures| {
        let level: usize = caps[1].parse().unwrap_or(1);
        format!("{} {}\n", "#".repeat(level), &caps[2])
    });
    let text = BLOCKQUOTE.replace_all(&text, |caps: &Captures| {
        let inner = BREAK.replace_all(caps[1].trim(), "\n");
        let inner = ANY_TAG.replace_all(&inner, "");
        let quoted: Vec<String> = inner.lines().map(|line| format!("> {line}")).collect();
        format!("{}\n", quoted.join("\n"))
    });
    let text = LIST_ITEM.replace_all(&text, "- $1\n");
    let text = BREAK.replace_all(&text, "\n");
    let text = PARAGRAPH_GAP.replace_all(&text, "\n\n");
    let text = replace_emphasis(&text);
    let text = ANY_TAG.replace_all(&text, "");
    let markdown = unescape_html(text.trim());

    (!markdown.is_empty()).then_some(markdown)
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::{html_to_markdown, markdown_to_html};

    #[test]
    fn bold_renders_as_strong() {
        assert_eq!(
            markdown_to_html("Hello **world**").as_deref(),
            Some("Hello <strong>world</strong>")
        );
    }

    #[test]
    fn plain_text_has_no_html() {
        assert_eq!(markdown_to_html("just words, nothing else"), None);
        assert_eq!(markdown_to_html("a < b & c"), None);
    }

    #[test]
    fn code_spans_are_not_formatted() {
        assert_eq!(
            markdown_to_html("run `a*b*c` now").as_deref(),
            Some("run <code>a*b*c</code> now")
        );
    }

    #[test]
    fn fenced_code_keeps_language() {
        let html = markdown_to_html("look:\n```rust\nlet x = 1 < 2;\n```").expect("has markup");
        assert!(html.contains(r#"<pre><code class="language-rust">let x = 1 &lt; 2;"#));
        assert!(html.starts_with("look:"));
    }

    #[test]
    fn links_and_strike() {
        assert_eq!(
            markdown_to_html("[docs](https://example.org/a?b=1&c=2) ~~old~~").as_deref(),
            Some(r#"<a href="https://example.org/a?b=1&amp;c=2">docs</a> <del>old</del>"#)
        );
    }

    #[test]
    fn snake_case_words_are_left_alone() {
        assert_eq!(markdown_to_html("call some_function_name here"), None);
    }

    #[test_case("<strong>bold</strong> and <em>it</em>", "**bold** and *it*" ; "emphasis")]
    #[test_case("line one<br>line two", "line one\nline two" ; "breaks")]
    #[test_case("<p>first</p><p>second</p>", "first\n\nsecond" ; "paragraphs")]
    #[test_case(r#"<a href="https://example.org">site</a>"#, "[site](https://example.org)" ; "link")]
    #[test_case("<code>x &lt; y</code>", "`x < y`" ; "inline code")]
    #[test_case("<del>gone</del>", "~~gone~~" ; "strike")]
    #[test_case("<blockquote>quoted</blockquote>rest", "> quoted\nrest" ; "quote")]
    #[test_case("<ul><li>a</li><li>b</li></ul>", "- a\n- b" ; "list")]
    fn html_converts_to_markdown(html: &str, expected: &str) {
        assert_eq!(html_to_markdown(html).as_deref(), Some(expected));
    }

    #[test]
    fn reply_fallback_is_stripped() {
        let html = "<mx-reply><blockquote>old message</blockquote></mx-reply>my answer";
        assert_eq!(html_to_markdown(html).as_deref(), Some("my answer"));
    }

    #[test]
    fn empty_result_falls_back() {
        assert_eq!(html_to_markdown("<p></p>"), None);
    }

    #[test]
    fn markdown_survives_a_round_trip() {
        let source = "Hello **world**, see [docs](https://example.org)";
        let html = markdown_to_html(source).expect("has markup");
        assert_eq!(html_to_markdown(&html).as_deref(), Some(source));
    }
}
