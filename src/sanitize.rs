//! Reduces feed HTML to plain text.
//!
//! Only two pieces of markup survive: `<a>` (with nothing but its `href`) and
//! `<br>`. Every other element is unwrapped so its text still shows up, and
//! comments/doctypes disappear entirely. The parser is html5ever via
//! `scraper`, which recovers from any malformed input instead of failing.

use scraper::{Html, Node};

/// Maximum length, in characters, of an article summary.
pub const CONTENT_LIMIT: usize = 200;

/// What to do with the tail of text that exceeds the length limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Truncation {
    /// Cut at the limit and append nothing.
    #[default]
    Silent,
    /// Cut at the limit and append `…` when something was removed.
    Ellipsis,
}

enum Step<N> {
    Visit(N),
    CloseLink,
}

/// Sanitizes `fragment` and cuts it to `max_len` characters without a marker.
pub fn sanitize(fragment: &str, max_len: usize) -> String {
    sanitize_with(fragment, max_len, Truncation::Silent)
}

pub fn sanitize_with(fragment: &str, max_len: usize, truncation: Truncation) -> String {
    if fragment.trim().is_empty() {
        return String::new();
    }

    let document = Html::parse_fragment(fragment);
    let mut out = String::with_capacity(fragment.len());

    // Explicit stack so deeply nested markup cannot blow the call stack.
    let mut stack = vec![Step::Visit(document.tree.root())];
    while let Some(step) = stack.pop() {
        let node = match step {
            Step::Visit(node) => node,
            Step::CloseLink => {
                out.push_str("</a>");
                continue;
            }
        };

        match node.value() {
            Node::Text(text) => {
                out.extend(text.chars().filter(|c| *c != char::REPLACEMENT_CHARACTER));
            }
            Node::Element(element) if element.name() == "br" => out.push_str("<br>"),
            Node::Element(element) if element.name() == "a" => {
                out.push_str("<a");
                if let Some(href) = element.attr("href") {
                    out.push_str(" href=\"");
                    push_escaped(&mut out, href);
                    out.push('"');
                }
                out.push('>');
                stack.push(Step::CloseLink);
                stack.extend(node.children().rev().map(Step::Visit));
            }
            _ => stack.extend(node.children().rev().map(Step::Visit)),
        }
    }

    truncate(out.trim(), max_len, truncation)
}

/// Cuts `text` to at most `max_len` characters, never inside a code point.
pub fn truncate(text: &str, max_len: usize, truncation: Truncation) -> String {
    match text.char_indices().nth(max_len) {
        None => text.to_string(),
        Some((cut, _)) => {
            let mut kept = text[..cut].to_string();
            if truncation == Truncation::Ellipsis {
                kept.push('…');
            }
            kept
        }
    }
}

fn push_escaped(out: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
}
