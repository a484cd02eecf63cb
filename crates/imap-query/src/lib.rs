//! Compile the user-facing search language into IMAP SEARCH criteria.
//!
//! The grammar is total: every input produces a criteria string plus a
//! set of structural modifiers. Unrecognized tokens degrade to free text
//! rather than failing. Criteria from recognized tokens are emitted in
//! scan order, the free-text criterion always comes after them, and the
//! default-exclusion suffix (which hides linking, trash and spam
//! messages unless explicitly targeted) is decided by a rule table over
//! the targeted reserved tags.

use chrono::NaiveDate;
use mailcanon::tags::{tag_id, TAG_SPAM, TAG_TRASH};
use serde::Serialize;

/// Structural modifiers accumulated while compiling a query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Modifiers {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub thread: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub threads: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub draft: Option<String>,
}

/// Whitespace-separated tokens; a quoted span inside a token (as in
/// `subj:"two words"`) does not break it.
fn tokenize(q: &str) -> Vec<(usize, usize)> {
    let mut tokens = Vec::new();
    let mut start = None;
    let mut in_quotes = false;
    for (idx, ch) in q.char_indices() {
        if ch == '"' {
            in_quotes = !in_quotes;
        }
        if ch.is_whitespace() && !in_quotes {
            if let Some(s) = start.take() {
                tokens.push((s, idx));
            }
        } else if start.is_none() {
            start = Some(idx);
        }
    }
    if let Some(s) = start {
        tokens.push((s, q.len()));
    }
    tokens
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

fn format_imap_date(date: NaiveDate) -> String {
    date.format("%d-%b-%Y").to_string()
}

/// `YYYY` and `YYYY-MM` become a since/before range, `YYYY-MM-DD` an
/// exact match. Anything that is not a real calendar date yields `None`
/// and the token degrades to free text.
fn date_criterion(value: &str) -> Option<String> {
    let mut parts = value.split('-');
    let year: i32 = parts.next()?.parse().ok()?;
    match (parts.next(), parts.next(), parts.next()) {
        (None, None, None) => {
            let since = NaiveDate::from_ymd_opt(year, 1, 1)?;
            let before = NaiveDate::from_ymd_opt(year + 1, 1, 1)?;
            Some(format!(
                "since {} before {}",
                format_imap_date(since),
                format_imap_date(before)
            ))
        }
        (Some(month), None, None) => {
            let month: u32 = month.parse().ok()?;
            let since = NaiveDate::from_ymd_opt(year, month, 1)?;
            let before = if month == 12 {
                NaiveDate::from_ymd_opt(year + 1, 1, 1)?
            } else {
                NaiveDate::from_ymd_opt(year, month + 1, 1)?
            };
            Some(format!(
                "since {} before {}",
                format_imap_date(since),
                format_imap_date(before)
            ))
        }
        (Some(month), Some(day), None) => {
            let date = NaiveDate::from_ymd_opt(year, month.parse().ok()?, day.parse().ok()?)?;
            Some(format!("on {}", format_imap_date(date)))
        }
        _ => None,
    }
}

/// Messages bearing these tags are hidden by default; explicitly
/// targeting trash or spam relaxes the matching exclusions, but linking
/// messages are never surfaced.
fn default_exclusions(tags: &[String]) -> &'static str {
    if tags.iter().any(|t| t == TAG_TRASH) {
        "unkeyword #link"
    } else if tags.iter().any(|t| t == TAG_SPAM) {
        "unkeyword #link unkeyword #trash"
    } else {
        "unkeyword #link unkeyword #trash unkeyword #spam"
    }
}

/// Compile a query string into IMAP SEARCH criteria plus modifiers.
pub fn parse_query(q: &str) -> (String, Modifiers) {
    let mut mods = Modifiers::default();
    let mut criteria: Vec<String> = Vec::new();
    let mut words: Vec<&str> = Vec::new();

    for (start, end) in tokenize(q) {
        let token = &q[start..end];

        if let Some(flag) = token.strip_prefix(':') {
            match flag.to_ascii_lowercase().as_str() {
                "threads" => mods.threads = true,
                "draft" => criteria.push("draft".to_string()),
                "unread" | "unseen" => criteria.push("unseen".to_string()),
                "seen" | "read" => criteria.push("seen".to_string()),
                "pin" | "pinned" | "flagged" => criteria.push("flagged".to_string()),
                "unpin" | "unpinned" | "unflagged" => criteria.push("unflagged".to_string()),
                "raw" => {
                    // the rest of the query is passed through verbatim
                    let rest = q[end..].trim();
                    if !rest.is_empty() {
                        criteria.push(rest.to_string());
                    }
                    break;
                }
                _ => words.push(token),
            }
            continue;
        }

        if let Some((key, value)) = token.split_once(':') {
            if !value.is_empty() {
                match key.to_ascii_lowercase().as_str() {
                    "thread" | "thr" => {
                        criteria.push(format!("uid {value}"));
                        mods.thread = true;
                        continue;
                    }
                    "in" | "tag" => {
                        let tag = tag_id(unquote(value));
                        criteria.push(format!("keyword {tag}"));
                        mods.tags.push(tag);
                        continue;
                    }
                    "uid" => {
                        criteria.push(format!("uid {value}"));
                        continue;
                    }
                    "from" => {
                        criteria.push(format!("from \"{}\"", unquote(value)));
                        continue;
                    }
                    "subj" | "subject" => {
                        criteria.push(format!("header subject \"{}\"", unquote(value)));
                        continue;
                    }
                    "mid" | "message_id" => {
                        criteria.push(format!("header message-id {value}"));
                        continue;
                    }
                    "ref" => {
                        criteria.push(format!(
                            "or header message-id {value} header references {value}"
                        ));
                        continue;
                    }
                    "date" => {
                        if let Some(range) = date_criterion(value) {
                            criteria.push(range);
                            continue;
                        }
                    }
                    "draft" => {
                        criteria.push(format!("header x-draft-id {value}"));
                        mods.draft = Some(value.to_string());
                        mods.thread = true;
                        continue;
                    }
                    _ => {}
                }
            }
        }

        words.push(token);
    }

    if !words.is_empty() {
        criteria.push(format!("text \"{}\"", words.join(" ")));
    }
    criteria.push(default_exclusions(&mods.tags).to_string());

    (criteria.join(" "), mods)
}
