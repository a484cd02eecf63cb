//! Recursive descent over a parsed MIME tree, accumulating the body HTML
//! and a flat attachment list.
//!
//! Part paths are dot-joined 1-based indices ("2.1" is the first child of
//! the second child of the root) and must be reproducible from identical
//! trees: they address attachments in retrieval URLs later on.

use crate::charset::{decode_bytes, CharsetHints};
use crate::encoded::decode_header;
use mailparse::{MailHeaderMap, ParsedMail};
use serde::{Deserialize, Serialize};

/// Trees nested deeper than this stop being bodies and become attachments.
const MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub path: String,
    pub filename: String,
    pub size: usize,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub content_id: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct WalkOutput {
    pub html: String,
    pub files: Vec<Attachment>,
}

/// Record every charset declared anywhere in the tree, in discovery
/// order, as decode candidates for fields with no usable declaration.
pub fn collect_charset_hints(part: &ParsedMail, hints: &mut CharsetHints) {
    if let Some(charset) = part.ctype.params.get("charset") {
        hints.note(charset);
    }
    for child in &part.subparts {
        collect_charset_hints(child, hints);
    }
}

fn part_label(path: &str) -> String {
    if path.is_empty() {
        "body".to_string()
    } else {
        format!("part {path}")
    }
}

fn declared_filename(part: &ParsedMail) -> Option<String> {
    let disposition = part.get_content_disposition();
    disposition
        .params
        .get("filename")
        .cloned()
        .or_else(|| part.ctype.params.get("name").cloned())
}

fn guess_ext(content_type: &str) -> String {
    file_type::FileType::from_media_type(content_type)
        .into_iter()
        .next()
        .and_then(|ft| ft.extensions().into_iter().next().map(|e| e.to_string()))
        .unwrap_or_else(|| "bin".to_string())
}

fn attachment(
    part: &ParsedMail,
    path: &str,
    size: usize,
    hints: &mut CharsetHints,
    errors: &mut Vec<String>,
) -> Attachment {
    let filename = match declared_filename(part) {
        Some(name) => {
            let label = format!("filename {}", part_label(path));
            decode_header(name.as_bytes(), hints, &label, errors)
        }
        None => String::new(),
    };
    let filename = if filename.is_empty() {
        let ext = guess_ext(&part.ctype.mimetype);
        if path.is_empty() {
            format!("unknown.{ext}")
        } else {
            format!("unknown-{path}.{ext}")
        }
    } else {
        filename
    };
    Attachment {
        path: path.to_string(),
        filename,
        size,
        content_id: part
            .headers
            .get_first_value("Content-ID")
            .map(|v| v.trim().to_string()),
    }
}

fn body_size(part: &ParsedMail, path: &str, errors: &mut Vec<String>) -> usize {
    match part.get_body_raw() {
        Ok(bytes) => bytes.len(),
        Err(err) => {
            errors.push(format!("{}: body decode: {err}", part_label(path)));
            0
        }
    }
}

/// Extract the body HTML and the attachment descriptors from a parsed
/// message, starting at the root part.
pub fn walk(root: &ParsedMail, hints: &mut CharsetHints, errors: &mut Vec<String>) -> WalkOutput {
    let (html, files) = walk_part(root, "", 0, hints, errors);
    WalkOutput { html, files }
}

fn walk_part(
    part: &ParsedMail,
    path: &str,
    depth: usize,
    hints: &mut CharsetHints,
    errors: &mut Vec<String>,
) -> (String, Vec<Attachment>) {
    let ctype = part.ctype.mimetype.as_str();

    // Attached messages stay opaque: their full serialized bytes are the
    // attachment content, and their bodies never leak into this message's
    // text.
    if ctype.starts_with("message/") {
        let att = attachment(part, path, part.raw_bytes.len(), hints, errors);
        return (String::new(), vec![att]);
    }

    if declared_filename(part).is_some() {
        let size = body_size(part, path, errors);
        let att = attachment(part, path, size, hints, errors);
        return (String::new(), vec![att]);
    }

    if ctype.starts_with("multipart/") && depth < MAX_DEPTH {
        let mut fragments: Vec<(String, bool)> = Vec::new();
        let mut files = Vec::new();
        for (idx, child) in part.subparts.iter().enumerate() {
            let child_path = if path.is_empty() {
                format!("{}", idx + 1)
            } else {
                format!("{path}.{}", idx + 1)
            };
            let (html, mut child_files) = walk_part(child, &child_path, depth + 1, hints, errors);
            if !html.is_empty() {
                fragments.push((html, child.ctype.mimetype == "text/html"));
            }
            files.append(&mut child_files);
        }
        let html = if ctype == "multipart/alternative" {
            fragments
                .iter()
                .find(|(_, is_html)| *is_html)
                .or_else(|| fragments.first())
                .map(|(html, _)| html.clone())
                .unwrap_or_default()
        } else {
            let parts: Vec<String> = fragments.into_iter().map(|(html, _)| html).collect();
            parts.join("<hr>")
        };
        return (html, files);
    }

    if ctype.starts_with("text/") {
        let raw = match part.get_body_raw() {
            Ok(bytes) => bytes,
            Err(err) => {
                errors.push(format!("{}: body decode: {err}", part_label(path)));
                return (String::new(), vec![]);
            }
        };
        let declared = part.ctype.params.get("charset").map(|s| s.as_str());
        let decoded = decode_bytes(&raw, declared, hints);
        if decoded.lossy {
            errors.push(format!(
                "{}: undecodable bytes (charset {})",
                part_label(path),
                decoded.charset
            ));
        }
        let html = if ctype == "text/html" {
            decoded.text
        } else {
            format!("<pre>{}</pre>", html_escape::encode_text(&decoded.text))
        };
        return (html, vec![]);
    }

    let size = body_size(part, path, errors);
    let att = attachment(part, path, size, hints, errors);
    (String::new(), vec![att])
}
