//! Sanitize untrusted HTML bodies for display.
//!
//! Inline `cid:` images are resolved against the message's own attachment
//! map. Externally hosted images are never referenced directly from the
//! markup we emit: their URLs move to a lazy-load attribute pointing at
//! the proxy endpoint, and the caller learns about them via `ext_images`.

use crate::walk::Attachment;
use regex::{Captures, Regex};
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

pub const PREVIEW_LEN: usize = 200;

static XML_DECL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^\s*<\?xml.*?\?>").unwrap());
static IMG_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?is)<img[^>]*>").unwrap());
static DATA_SRC_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)\s+data-src\s*=\s*("[^"]*"|'[^']*'|[^\s>]+)"#).unwrap()
});
static SRC_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)\s+src\s*=\s*("[^"]*"|'[^']*'|[^\s>]+)"#).unwrap()
});
static ANY_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());
static WS_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\s\x{a0}]+").unwrap());

static SANITIZER: LazyLock<ammonia::Builder<'static>> = LazyLock::new(|| {
    let mut b = ammonia::Builder::default();
    b.link_rel(None);
    // Drop these together with their contents; everything else that is
    // not allowlisted is stripped but keeps its children.
    b.clean_content_tags(
        ["head", "title", "script", "style"]
            .into_iter()
            .collect::<HashSet<_>>(),
    );
    b.add_tag_attributes("img", &["data-src"]);
    b.url_schemes(
        ["http", "https", "mailto", "tel", "data"]
            .into_iter()
            .collect::<HashSet<_>>(),
    );
    b
});

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Cleaned {
    pub html: String,
    /// Flattened text nodes, newline-joined; raw material for the preview.
    pub text: String,
    pub ext_images: bool,
}

fn proxy_url(src: &str) -> String {
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("url", src)
        .finish();
    format!("/proxy?{query}")
}

fn rewrite_images(html: &str, embeds: &HashMap<String, String>) -> (String, bool) {
    let mut ext_images = false;
    let out = IMG_TAG.replace_all(html, |caps: &Captures| {
        let tag = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
        // stale lazy-load attributes from the sender are meaningless here
        let tag = DATA_SRC_ATTR.replace_all(tag, "").into_owned();
        let Some(src) = SRC_ATTR.captures(&tag) else {
            return tag;
        };
        let span = src.get(0).expect("group 0 is the whole match");
        let value = src
            .get(1)
            .map(|m| m.as_str())
            .unwrap_or_default()
            .trim_matches(|c| c == '"' || c == '\'');
        let lower = value.to_ascii_lowercase();

        let replacement = if lower.starts_with("cid:") {
            let cid = &value["cid:".len()..];
            match embeds.get(&format!("<{cid}>")) {
                Some(url) => format!(r#" src="{url}""#),
                None => String::new(),
            }
        } else if lower.starts_with("data:image/") {
            span.as_str().to_string()
        } else if lower.starts_with("http://")
            || lower.starts_with("https://")
            || lower.starts_with("//")
        {
            ext_images = true;
            format!(r#" data-src="{}""#, proxy_url(value))
        } else {
            String::new()
        };

        format!(
            "{}{}{}",
            &tag[..span.start()],
            replacement,
            &tag[span.end()..]
        )
    });
    (out.into_owned(), ext_images)
}

/// Flatten the text nodes of sanitized markup: entity-decoded, each node
/// right-trimmed, empties dropped, newline-joined.
fn flatten_text(html: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    for chunk in ANY_TAG.split(html) {
        let decoded = html_escape::decode_html_entities(chunk);
        let trimmed = decoded.trim_end();
        if !trimmed.is_empty() {
            lines.push(trimmed.to_string());
        }
    }
    lines.join("\n")
}

/// Sanitize an HTML body. `embeds` maps Content-ID values (in their
/// angle-bracketed header form) to retrieval URLs for inline images.
pub fn clean_html(html: &str, embeds: &HashMap<String, String>) -> Cleaned {
    let html = XML_DECL.replace(html, "");
    let html = html.trim();
    if html.is_empty() {
        return Cleaned::default();
    }

    let (rewritten, ext_images) = rewrite_images(html, embeds);
    let clean = SANITIZER.clean(&rewritten).to_string();
    let text = flatten_text(&clean);

    Cleaned {
        html: clean.trim().to_string(),
        text,
        ext_images,
    }
}

/// Derive the bounded preview line: whitespace collapsed, capped at
/// `PREVIEW_LEN` chars, extended with the attachment names when there is
/// room left for them.
pub fn preview(text: &str, files: &[Attachment]) -> String {
    let collapsed = WS_RUNS.replace_all(text, " ");
    let mut out: String = collapsed.trim().chars().take(PREVIEW_LEN).collect();
    if !files.is_empty() && out.chars().count() < PREVIEW_LEN {
        let names: Vec<&str> = files.iter().map(|f| f.filename.as_str()).collect();
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(&format!("[{}]", names.join(", ")));
        out = out.chars().take(PREVIEW_LEN).collect();
    }
    out
}
