//! Telegram HTML sanitizer.
//!
//! Model output is free text that may contain stray HTML and LaTeX display
//! delimiters. Telegram rejects messages with unsupported or unbalanced tags,
//! so every outbound text is reduced to the small tag set below:
//!
//! | Input                    | Output                          |
//! |--------------------------|---------------------------------|
//! | `\[ x \]`, `\( x \)`     | `<blockquote> x </blockquote>`  |
//! | `<b>`, `<code>`          | kept                            |
//! | `<a href="u">`           | kept, other attributes dropped  |
//! | `<blockquote>`           | kept, a newline right after it is removed |
//! | any other tag            | dropped, inner text kept        |
//! | `<`, `>`, `&` in text    | escaped                         |
//!
//! Unclosed tags are closed at the end, stray closing tags are dropped.

use regex::Regex;
use std::sync::LazyLock;

/// Telegram's message length limit, in characters.
pub const MAX_MESSAGE_LEN: usize = 4096;

const ALLOWED_TAGS: &[&str] = &["b", "a", "code", "blockquote"];

static TAG_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^<(/?)([A-Za-z][A-Za-z0-9]*)\b([^<>]*)>").unwrap());
static HREF_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\bhref\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#).unwrap()
});

// ============================================================================
// Public API
// ============================================================================

/// Reduce text to Telegram-safe HTML.
pub fn sanitize(input: &str) -> String {
    let text = truncate_chars(input, MAX_MESSAGE_LEN);
    let with_quotes = convert_latex_delimiters(text);
    filter_html(&with_quotes).replace("<blockquote>\n", "<blockquote>")
}

/// Plain-text rendition used when Telegram rejects the HTML one.
pub fn plain(input: &str) -> String {
    truncate_chars(input, MAX_MESSAGE_LEN).to_string()
}

/// Cut `s` to at most `max` characters.
pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// ============================================================================
// Conversion
// ============================================================================

fn convert_latex_delimiters(s: &str) -> String {
    s.replace(r"\[", "<blockquote>")
        .replace(r"\]", "</blockquote>")
        .replace(r"\(", "<blockquote>")
        .replace(r"\)", "</blockquote>")
}

fn allowed(name: &str) -> Option<&'static str> {
    ALLOWED_TAGS.iter().copied().find(|t| *t == name)
}

fn filter_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut open: Vec<&'static str> = Vec::new();
    let mut rest = input;

    while let Some(pos) = rest.find('<') {
        push_text(&mut out, &rest[..pos]);
        let candidate = &rest[pos..];

        let Some(caps) = TAG_PATTERN.captures(candidate) else {
            out.push_str("&lt;");
            rest = &candidate[1..];
            continue;
        };

        let len = caps[0].len();
        let closing = !caps[1].is_empty();
        let name = caps[2].to_ascii_lowercase();
        let attrs = &caps[3];

        if let Some(tag) = allowed(&name) {
            if closing {
                close_tag(&mut out, &mut open, tag);
            } else if !attrs.trim_end().ends_with('/') && open_tag(&mut out, tag, attrs) {
                open.push(tag);
            }
        }
        rest = &candidate[len..];
    }
    push_text(&mut out, rest);

    while let Some(tag) = open.pop() {
        push_close(&mut out, tag);
    }
    out
}

/// Write an opening tag; returns false when the tag had to be dropped.
fn open_tag(out: &mut String, tag: &'static str, attrs: &str) -> bool {
    if tag != "a" {
        out.push('<');
        out.push_str(tag);
        out.push('>');
        return true;
    }

    let href = HREF_PATTERN.captures(attrs).and_then(|c| {
        c.get(1)
            .or_else(|| c.get(2))
            .or_else(|| c.get(3))
            .map(|m| m.as_str().to_string())
    });
    // Telegram refuses anchors without a target.
    let Some(href) = href.filter(|h| !h.trim().is_empty()) else {
        return false;
    };
    let href = html_escape::decode_html_entities(&href);
    out.push_str("<a href=\"");
    out.push_str(&html_escape::encode_double_quoted_attribute(&href));
    out.push_str("\">");
    true
}

fn close_tag(out: &mut String, open: &mut Vec<&'static str>, tag: &'static str) {
    if !open.contains(&tag) {
        return;
    }
    while let Some(top) = open.pop() {
        push_close(out, top);
        if top == tag {
            break;
        }
    }
}

fn push_close(out: &mut String, tag: &str) {
    out.push_str("</");
    out.push_str(tag);
    out.push('>');
}

fn push_text(out: &mut String, text: &str) {
    if text.is_empty() {
        return;
    }
    let decoded = html_escape::decode_html_entities(text);
    out.push_str(&html_escape::encode_text(&decoded));
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(sanitize("Hello, world!"), "Hello, world!");
    }

    #[test]
    fn latex_delimiters_become_blockquotes() {
        assert_eq!(
            sanitize(r"Area: \[ \pi r^2 \] and \(x\)"),
            r"Area: <blockquote> \pi r^2 </blockquote> and <blockquote>x</blockquote>"
        );
    }

    #[test]
    fn newline_after_blockquote_is_removed() {
        assert_eq!(
            sanitize("\\[\nE = mc^2\n\\]"),
            "<blockquote>E = mc^2\n</blockquote>"
        );
    }

    #[test]
    fn allowed_tags_are_kept() {
        assert_eq!(
            sanitize("<b>bold</b> <code>x</code>"),
            "<b>bold</b> <code>x</code>"
        );
    }

    #[test]
    fn disallowed_tags_are_dropped_keeping_text() {
        assert_eq!(sanitize("<i>it</i> <div class=\"x\">body</div>"), "it body");
        assert_eq!(sanitize("line<br/>next"), "linenext");
    }

    #[test]
    fn tag_names_are_case_insensitive() {
        assert_eq!(sanitize("<B>x</B>"), "<b>x</b>");
    }

    #[test]
    fn anchors_keep_only_href() {
        assert_eq!(
            sanitize(r#"<a target="_blank" href="https://example.com/?a=1&amp;b=2">link</a>"#),
            r#"<a href="https://example.com/?a=1&amp;b=2">link</a>"#
        );
    }

    #[test]
    fn anchor_without_href_is_dropped() {
        assert_eq!(sanitize("<a name=\"x\">text</a>"), "text");
    }

    #[test]
    fn unclosed_tags_are_closed() {
        assert_eq!(sanitize("<b>bold <code>code"), "<b>bold <code>code</code></b>");
    }

    #[test]
    fn stray_closing_tags_are_dropped() {
        assert_eq!(sanitize("text</b> more"), "text more");
    }

    #[test]
    fn misnested_tags_are_rebalanced() {
        assert_eq!(sanitize("<b><code>x</b>y</code>"), "<b><code>x</code></b>y");
    }

    #[test]
    fn text_entities_are_escaped() {
        assert_eq!(sanitize("if a < b && c > d"), "if a &lt; b &amp;&amp; c &gt; d");
    }

    #[test]
    fn existing_entities_are_not_double_escaped() {
        assert_eq!(sanitize("fish &amp; chips"), "fish &amp; chips");
    }

    #[test]
    fn output_respects_length_limit() {
        let long = "é".repeat(MAX_MESSAGE_LEN + 100);
        let out = sanitize(&long);
        assert_eq!(out.chars().count(), MAX_MESSAGE_LEN);
        assert_eq!(plain(&long).chars().count(), MAX_MESSAGE_LEN);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("你好世界", 2), "你好");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
