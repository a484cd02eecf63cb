//! Canonicalize one raw delivered message: lenient parse, best-effort
//! decoding, thread linkage, duplicate detection, and emission of the
//! storable payload (flat JSON metadata + sanitized HTML body).
//!
//! Nothing about the message bytes can make this fail: malformed input
//! degrades to a message carrying its own `errors` list and the `#err`
//! flag. The only hard error is an unparseable mailbox arrival date,
//! which is caller-supplied protocol data, not message content.

use crate::address::{parse_addresses, Address};
use crate::charset::CharsetHints;
use crate::clean::{clean_html, preview};
use crate::encoded::decode_header;
use crate::error::MailCanonError;
use crate::ingest::MidRegistry;
use crate::tags::{TAG_DUP, TAG_ERR};
use crate::walk::{collect_charset_hints, walk, Attachment};
use chrono::DateTime;
use mailparse::{parse_mail, MailHeaderMap, ParsedMail};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Sender address reserved for synthetic thread-linking messages. Their
/// References are stored unfiltered so that linking survives re-parsing.
pub const LINK_SENDER: &str = "mailur@link";
/// Placeholder identity for messages that declare no Message-Id at all.
pub const NO_MSGID: &str = "<mailur@noid>";

/// Mailbox-protocol arrival timestamp format, e.g. `15-Jul-2017 13:31:04 +0000`.
const ARRIVED_FORMAT: &str = "%d-%b-%Y %H:%M:%S %z";

const ADDRESS_HEADERS: [&str; 6] = ["From", "Sender", "Reply-To", "To", "CC", "BCC"];

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct MessageFlags: u8 {
        const ERR = 0b01;
        const DUP = 0b10;
    }
}

impl MessageFlags {
    /// Render to the external tag strings the storage layer applies.
    pub fn tags(self) -> Vec<&'static str> {
        let mut tags = Vec::new();
        if self.contains(Self::ERR) {
            tags.push(TAG_ERR);
        }
        if self.contains(Self::DUP) {
            tags.push(TAG_DUP);
        }
        tags
    }
}

/// The canonical, de-duplicated representation of one ingested message.
/// Serializes to the flat metadata document; the sanitized body travels
/// separately in the composed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalMessage {
    pub origin_uid: String,
    pub msgid: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parent: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub references: Vec<String>,
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub from: Option<Address>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sender: Option<Address>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub reply_to: Vec<Address>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub to: Vec<Address>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub cc: Vec<Address>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub bcc: Vec<Address>,
    pub arrived: i64,
    pub date: Option<i64>,
    pub ext_images: bool,
    pub preview: String,
    pub files: Vec<Attachment>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub duplicate_of: Option<String>,
    #[serde(skip)]
    pub body_html: String,
}

/// One canonicalized message plus its flag set and storable payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Parsed {
    pub msg: CanonicalMessage,
    pub flags: MessageFlags,
    pub payload: Vec<u8>,
}

/// Generate a fresh synthetic message id, e.g. `<hex32@mailur.link>`.
pub fn gen_msgid(label: &str) -> String {
    format!("<{}@mailur.{label}>", uuid::Uuid::new_v4().simple())
}

/// Identity for a duplicate delivery. Derived from the declared id and
/// the uid so canonicalization stays a pure function of its inputs.
fn dup_msgid(declared: &str, uid: &str) -> String {
    let digest = md5::compute(format!("{declared}\u{0}{uid}").as_bytes());
    format!("<{digest:x}@mailur.dup>")
}

fn parse_arrived(arrived: &str) -> Result<i64, MailCanonError> {
    let trimmed = arrived.trim().trim_matches('"').trim();
    DateTime::parse_from_str(trimmed, ARRIVED_FORMAT)
        .map(|dt| dt.timestamp())
        .map_err(|err| MailCanonError::ArrivedDate(arrived.to_string(), err))
}

fn header_raw<'a>(mail: Option<&'a ParsedMail>, name: &str) -> Option<&'a [u8]> {
    mail?.headers.get_first_header(name).map(|h| h.get_value_raw())
}

fn header_value(mail: Option<&ParsedMail>, name: &str) -> Option<String> {
    mail?.headers.get_first_value(name)
}

/// Canonicalize one raw message against the batch registry.
pub fn canonicalize(
    raw: &[u8],
    uid: &str,
    arrived: &str,
    mids: &MidRegistry,
) -> crate::Result<Parsed> {
    let arrived_ts = parse_arrived(arrived)?;

    let mut errors: Vec<String> = Vec::new();
    let parsed_mail = match parse_mail(raw) {
        Ok(mail) => Some(mail),
        Err(err) => {
            tracing::error!(uid, "unparseable message: {err}");
            errors.push(format!("message: unparseable: {err}"));
            None
        }
    };
    let mail = parsed_mail.as_ref();

    let mut hints = CharsetHints::default();
    if let Some(mail) = mail {
        collect_charset_hints(mail, &mut hints);
    }

    let mut address_headers: Vec<(&'static str, String)> = Vec::new();
    for name in ADDRESS_HEADERS {
        let Some(raw_value) = header_raw(mail, name) else {
            continue;
        };
        let value = decode_header(raw_value, &mut hints, &name.to_ascii_lowercase(), &mut errors);
        if !value.is_empty() {
            address_headers.push((name, value));
        }
    }
    let decoded = |name: &str| {
        address_headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
            .unwrap_or("")
    };

    let from = parse_addresses(decoded("From"), "from", &mut errors)
        .into_iter()
        .next();
    let sender = parse_addresses(decoded("Sender"), "sender", &mut errors)
        .into_iter()
        .next();
    let reply_to = parse_addresses(decoded("Reply-To"), "reply-to", &mut errors);
    let to = parse_addresses(decoded("To"), "to", &mut errors);
    let cc = parse_addresses(decoded("CC"), "cc", &mut errors);
    let bcc = parse_addresses(decoded("BCC"), "bcc", &mut errors);

    let subject = header_raw(mail, "Subject")
        .map(|raw_value| decode_header(raw_value, &mut hints, "subject", &mut errors))
        .unwrap_or_default();

    // Thread linkage: the raw first reference is kept for display even
    // when unresolved; the retained list holds only ids the registry has
    // seen, so a parent chain never points outside the batch.
    let raw_references = header_value(mail, "References");
    let mut references: Vec<String> = raw_references
        .as_deref()
        .map(|value| value.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();
    if references.is_empty() {
        if let Some(in_reply_to) = header_value(mail, "In-Reply-To") {
            let in_reply_to = in_reply_to.trim().to_string();
            if !in_reply_to.is_empty() {
                references = vec![in_reply_to];
            }
        }
    }
    let parent = references.first().cloned();
    references.retain(|r| mids.contains(r));

    let declared_mid = header_value(mail, "Message-Id")
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| {
            tracing::info!(uid, "no Message-Id header, assigning placeholder");
            NO_MSGID.to_string()
        });

    let mut flags = MessageFlags::default();
    let mut msgid = declared_mid.clone();
    let mut duplicate_of = None;
    if mids
        .first_uid(&declared_mid)
        .is_some_and(|owner| owner != uid)
    {
        tracing::info!(uid, msgid = %declared_mid, "duplicate delivery of known Message-Id");
        duplicate_of = Some(declared_mid.clone());
        msgid = dup_msgid(&declared_mid, uid);
        flags |= MessageFlags::DUP;
    }

    let date_header = header_value(mail, "Date");
    let date = match date_header.as_deref() {
        None => None,
        Some(value) => match mailparse::dateparse(value) {
            Ok(ts) => Some(ts),
            Err(err) => {
                errors.push(format!("date: {err}"));
                None
            }
        },
    };

    let walked = match mail {
        Some(mail) => walk(mail, &mut hints, &mut errors),
        None => Default::default(),
    };
    let mut embeds = HashMap::new();
    for file in &walked.files {
        if let Some(cid) = &file.content_id {
            embeds.insert(cid.clone(), format!("/raw/{uid}/{}", file.path));
        }
    }
    let cleaned = clean_html(&walked.html, &embeds);
    let preview = preview(&cleaned.text, &walked.files);

    if !errors.is_empty() {
        flags |= MessageFlags::ERR;
    }

    let msg = CanonicalMessage {
        origin_uid: uid.to_string(),
        msgid,
        parent,
        references,
        subject,
        from,
        sender,
        reply_to,
        to,
        cc,
        bcc,
        arrived: arrived_ts,
        date,
        ext_images: cleaned.ext_images,
        preview,
        files: walked.files,
        errors,
        duplicate_of,
        body_html: cleaned.html,
    };
    let payload = compose(
        &msg,
        &address_headers,
        raw_references.as_deref(),
        date_header.as_deref(),
    );

    Ok(Parsed {
        msg,
        flags,
        payload,
    })
}

/// Render the storable payload: synthetic headers over a deterministic
/// multipart/mixed body carrying the JSON metadata and the sanitized
/// HTML.
fn compose(
    msg: &CanonicalMessage,
    address_headers: &[(&'static str, String)],
    raw_references: Option<&str>,
    date_header: Option<&str>,
) -> Vec<u8> {
    let boundary = format!(
        "{:x}",
        md5::compute(format!("{}\u{0}{}", msg.msgid, msg.origin_uid).as_bytes())
    );

    let mut out = String::new();
    out.push_str(&format!("X-UID: <{}>\n", msg.origin_uid));
    out.push_str(&format!("Message-Id: {}\n", msg.msgid));
    if !msg.subject.is_empty() {
        out.push_str(&format!("Subject: {}\n", msg.subject));
    }
    if let Some(date) = date_header {
        out.push_str(&format!("Date: {date}\n"));
    }
    for (name, value) in address_headers {
        out.push_str(&format!("{name}: {value}\n"));
    }
    let is_link = msg.from.as_ref().is_some_and(|a| a.addr == LINK_SENDER);
    if is_link {
        // linking messages keep their original references verbatim
        if let Some(refs) = raw_references {
            out.push_str(&format!("References: {refs}\n"));
        }
    } else if !msg.references.is_empty() {
        out.push_str(&format!("References: {}\n", msg.references.join(" ")));
    }
    out.push_str(&format!(
        "Content-Type: multipart/mixed; boundary=\"{boundary}\"\n\n"
    ));

    let meta = serde_json::to_string_pretty(msg).expect("canonical metadata serializes");
    out.push_str(&format!(
        "--{boundary}\nContent-Type: application/json\nContent-Transfer-Encoding: binary\n\n{meta}\n"
    ));
    out.push_str(&format!(
        "--{boundary}\nContent-Type: text/plain\nContent-Transfer-Encoding: binary\n\n{}\n",
        msg.body_html
    ));
    out.push_str(&format!("--{boundary}--\n"));
    out.into_bytes()
}

/// Build a synthetic message that forces the given ids into one thread
/// by referencing all of them from the reserved linking sender.
pub fn link_message(msgids: &[&str]) -> Vec<u8> {
    let mut out = String::new();
    out.push_str("Subject: Dummy: linking threads\n");
    out.push_str(&format!("References: {}\n", msgids.join(" ")));
    out.push_str(&format!("Message-Id: {}\n", gen_msgid("link")));
    out.push_str(&format!("From: {LINK_SENDER}\n"));
    out.push_str(&format!("Date: {}\n", chrono::Utc::now().to_rfc2822()));
    out.push('\n');
    out.into_bytes()
}

#[cfg(test)]
mod test {
    use super::*;

    const ARRIVED: &str = "\"15-Jul-2017 13:31:04 +0000\"";

    fn registry(entries: &[(&str, &str)]) -> MidRegistry {
        let mut mids = MidRegistry::default();
        for (mid, uid) in entries {
            mids.record(mid, uid);
        }
        mids
    }

    #[test]
    fn basic_message() {
        let raw = concat!(
            "Message-Id: <one@example.com>\n",
            "Subject: =?utf-8?B?aGVsbG8=?= there\n",
            "From: Grim <grim@example.com>\n",
            "To: a@example.com, B <b@example.com>\n",
            "Date: Sat, 15 Jul 2017 13:30:00 +0000\n",
            "Content-Type: text/plain\n",
            "\n",
            "body text\n"
        );
        let mids = registry(&[("<one@example.com>", "1")]);
        let parsed = canonicalize(raw.as_bytes(), "1", ARRIVED, &mids).unwrap();

        k9::assert_equal!(parsed.msg.msgid, "<one@example.com>");
        k9::assert_equal!(parsed.msg.subject, "hello there");
        k9::assert_equal!(parsed.msg.arrived, 1500125464);
        k9::assert_equal!(parsed.msg.date, Some(1500125400));
        k9::assert_equal!(parsed.msg.from.as_ref().unwrap().addr, "grim@example.com");
        k9::assert_equal!(parsed.msg.to.len(), 2);
        k9::assert_equal!(parsed.msg.to[1].name, "B");
        assert!(parsed.msg.body_html.contains("body text"));
        assert!(parsed.msg.preview.contains("body text"));
        k9::assert_equal!(parsed.flags, MessageFlags::default());
        assert!(parsed.msg.duplicate_of.is_none());
    }

    #[test]
    fn duplicate_delivery_gets_synthetic_identity() {
        let raw = concat!(
            "Message-Id: <one@example.com>\n",
            "Subject: s\n",
            "\n",
            "b\n"
        );
        let mids = registry(&[("<one@example.com>", "1")]);

        let first = canonicalize(raw.as_bytes(), "1", ARRIVED, &mids).unwrap();
        assert!(first.msg.duplicate_of.is_none());
        assert!(!first.flags.contains(MessageFlags::DUP));

        let second = canonicalize(raw.as_bytes(), "7", ARRIVED, &mids).unwrap();
        k9::assert_equal!(
            second.msg.duplicate_of.as_deref(),
            Some("<one@example.com>")
        );
        assert!(second.msg.msgid.ends_with("@mailur.dup>"));
        assert!(second.msg.msgid != second.msg.duplicate_of.clone().unwrap());
        assert!(second.flags.contains(MessageFlags::DUP));
        k9::assert_equal!(second.flags.tags(), vec![TAG_DUP]);
    }

    #[test]
    fn canonicalization_is_idempotent() {
        let raw = concat!(
            "Message-Id: <one@example.com>\n",
            "Subject: stable\n",
            "\n",
            "b\n"
        );
        let mids = registry(&[("<one@example.com>", "1")]);
        let a = canonicalize(raw.as_bytes(), "7", ARRIVED, &mids).unwrap();
        let b = canonicalize(raw.as_bytes(), "7", ARRIVED, &mids).unwrap();
        k9::assert_equal!(a.msg, b.msg);
        k9::assert_equal!(a.payload, b.payload);
    }

    #[test]
    fn references_filter_to_known_ids() {
        let raw = concat!(
            "Message-Id: <three@example.com>\n",
            "References: <one@example.com> <unknown@example.com>\n",
            "\n",
            "b\n"
        );
        let mids = registry(&[
            ("<one@example.com>", "1"),
            ("<three@example.com>", "3"),
        ]);
        let parsed = canonicalize(raw.as_bytes(), "3", ARRIVED, &mids).unwrap();
        k9::assert_equal!(parsed.msg.parent.as_deref(), Some("<one@example.com>"));
        k9::assert_equal!(parsed.msg.references, vec!["<one@example.com>".to_string()]);
    }

    #[test]
    fn unresolved_parent_is_kept_for_display_only() {
        let raw = concat!(
            "Message-Id: <m@example.com>\n",
            "In-Reply-To: <ghost@example.com>\n",
            "\n",
            "b\n"
        );
        let mids = registry(&[("<m@example.com>", "5")]);
        let parsed = canonicalize(raw.as_bytes(), "5", ARRIVED, &mids).unwrap();
        k9::assert_equal!(parsed.msg.parent.as_deref(), Some("<ghost@example.com>"));
        assert!(parsed.msg.references.is_empty());
    }

    #[test]
    fn missing_message_id_gets_placeholder() {
        let raw = "Subject: s\n\nb\n";
        let parsed = canonicalize(raw.as_bytes(), "9", ARRIVED, &MidRegistry::default()).unwrap();
        k9::assert_equal!(parsed.msg.msgid, NO_MSGID);
        assert!(!parsed.flags.contains(MessageFlags::DUP));
    }

    #[test]
    fn bad_date_header_is_recorded_not_fatal() {
        let raw = concat!(
            "Message-Id: <d@example.com>\n",
            "Date: not a date at all\n",
            "\n",
            "b\n"
        );
        let parsed = canonicalize(raw.as_bytes(), "2", ARRIVED, &MidRegistry::default()).unwrap();
        k9::assert_equal!(parsed.msg.date, None);
        assert!(!parsed.msg.errors.is_empty());
        assert!(parsed.flags.contains(MessageFlags::ERR));
        k9::assert_equal!(parsed.flags.tags(), vec![TAG_ERR]);
    }

    #[test]
    fn bad_arrival_date_is_the_only_hard_error() {
        let raw = "Subject: s\n\nb\n";
        let err = canonicalize(raw.as_bytes(), "1", "garbage", &MidRegistry::default());
        assert!(err.is_err());
    }

    #[test]
    fn inline_images_resolve_and_external_ones_flag() {
        let raw = concat!(
            "Message-Id: <img@example.com>\n",
            "Content-Type: multipart/related; boundary=xyz\n",
            "\n",
            "--xyz\n",
            "Content-Type: text/html\n",
            "\n",
            "<p><img src=\"cid:pic1\"><img src=\"http://x/y.png\"></p>\n",
            "--xyz\n",
            "Content-Type: image/png\n",
            "Content-ID: <pic1>\n",
            "Content-Disposition: inline; filename=\"pic.png\"\n",
            "Content-Transfer-Encoding: base64\n",
            "\n",
            "iVBORw0KGgo=\n",
            "--xyz--\n"
        );
        let parsed = canonicalize(raw.as_bytes(), "42", ARRIVED, &MidRegistry::default()).unwrap();
        assert!(parsed.msg.ext_images);
        assert!(parsed.msg.body_html.contains("/raw/42/2"));
        assert!(parsed.msg.body_html.contains("/proxy?url="));
        k9::assert_equal!(parsed.msg.files.len(), 1);
    }

    #[test]
    fn payload_carries_synthetic_headers() {
        let raw = concat!(
            "Message-Id: <p@example.com>\n",
            "Subject: payload\n",
            "From: Grim <grim@example.com>\n",
            "\n",
            "b\n"
        );
        let parsed = canonicalize(raw.as_bytes(), "11", ARRIVED, &MidRegistry::default()).unwrap();
        let payload = String::from_utf8(parsed.payload).unwrap();
        assert!(payload.starts_with("X-UID: <11>\n"));
        assert!(payload.contains("Message-Id: <p@example.com>\n"));
        assert!(payload.contains("Subject: payload\n"));
        assert!(payload.contains("From: Grim <grim@example.com>\n"));
        assert!(payload.contains("Content-Type: multipart/mixed; boundary="));
        assert!(payload.contains("\"origin_uid\": \"11\""));
    }

    #[test]
    fn link_messages_use_reserved_sender() {
        let raw = link_message(&["<a@x>", "<b@x>"]);
        let text = String::from_utf8(raw).unwrap();
        assert!(text.contains("From: mailur@link\n"));
        assert!(text.contains("References: <a@x> <b@x>\n"));
        assert!(text.contains("@mailur.link>"));
    }

    #[test]
    fn garbage_bytes_degrade_to_errors() {
        let raw: Vec<u8> = (0u8..=255).cycle().take(1024).collect();
        let parsed = canonicalize(&raw, "13", ARRIVED, &MidRegistry::default()).unwrap();
        assert!(parsed.msg.arrived > 0);
    }
}
