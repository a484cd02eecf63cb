//! RFC2047 encoded-word decoding for header values.
//!
//! Header values arrive as raw bytes that may interleave plain runs with
//! `=?charset?B|Q?payload?=` words. Each word's payload is decoded through
//! the charset resolver; runs that fail to parse as encoded words degrade
//! to literal text. Whitespace between adjacent encoded words is elided,
//! then internal whitespace runs collapse to single spaces.

use crate::charset::{decode_bytes, CharsetHints};
use regex::Regex;
use std::sync::LazyLock;

static WS_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

enum Segment {
    Plain(Vec<u8>),
    Encoded(String),
}

struct EncodedWord<'a> {
    charset: &'a str,
    encoding: u8,
    payload: &'a [u8],
    /// Total bytes consumed, including the delimiters.
    len: usize,
}

fn parse_encoded_word(bytes: &[u8]) -> Option<EncodedWord<'_>> {
    let rest = bytes.strip_prefix(b"=?")?;
    let q1 = rest.iter().position(|&b| b == b'?')?;
    let charset = std::str::from_utf8(&rest[..q1]).ok()?;
    if charset.is_empty() || charset.chars().any(|c| c.is_whitespace()) {
        return None;
    }
    let rest = &rest[q1 + 1..];
    let encoding = *rest.first()?;
    if !matches!(encoding, b'B' | b'b' | b'Q' | b'q') {
        return None;
    }
    if rest.get(1) != Some(&b'?') {
        return None;
    }
    let payload_area = &rest[2..];
    let mut end = None;
    for (i, win) in payload_area.windows(2).enumerate() {
        match win[0] {
            b' ' | b'\t' | b'\r' | b'\n' => return None,
            b'?' if win[1] == b'=' => {
                end = Some(i);
                break;
            }
            b'?' => return None,
            _ => {}
        }
    }
    let end = end?;
    let payload = &payload_area[..end];
    // RFC2231 language suffix on the charset, e.g. `utf-8*en`
    let charset = charset.split('*').next().unwrap_or(charset);
    Some(EncodedWord {
        charset,
        encoding,
        payload,
        len: 2 + q1 + 1 + 2 + end + 2,
    })
}

fn decode_payload(word: &EncodedWord) -> Option<Vec<u8>> {
    match word.encoding {
        b'B' | b'b' => data_encoding::BASE64_MIME.decode(word.payload).ok(),
        _ => {
            let unspaced: Vec<u8> = word
                .payload
                .iter()
                .map(|&b| if b == b'_' { b' ' } else { b })
                .collect();
            quoted_printable::decode(&unspaced, quoted_printable::ParseMode::Robust).ok()
        }
    }
}

fn split_segments(raw: &[u8], hints: &mut CharsetHints, label: &str, errors: &mut Vec<String>) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut plain: Vec<u8> = Vec::new();
    let mut pos = 0;
    while pos < raw.len() {
        if raw[pos..].starts_with(b"=?") {
            if let Some(word) = parse_encoded_word(&raw[pos..]) {
                if let Some(bytes) = decode_payload(&word) {
                    if !plain.is_empty() {
                        segments.push(Segment::Plain(std::mem::take(&mut plain)));
                    }
                    let decoded = decode_bytes(&bytes, Some(word.charset), hints);
                    if decoded.lossy {
                        errors.push(format!(
                            "{label}: undecodable bytes (charset {})",
                            decoded.charset
                        ));
                    }
                    segments.push(Segment::Encoded(decoded.text));
                    pos += word.len;
                    continue;
                }
            }
        }
        plain.push(raw[pos]);
        pos += 1;
    }
    if !plain.is_empty() {
        segments.push(Segment::Plain(plain));
    }
    segments
}

/// Decode a raw header value into text. Empty input yields empty text;
/// undecodable runs degrade to lossy text with an entry in `errors`.
pub fn decode_header(
    raw: &[u8],
    hints: &mut CharsetHints,
    label: &str,
    errors: &mut Vec<String>,
) -> String {
    if raw.is_empty() {
        return String::new();
    }

    let segments = split_segments(raw, hints, label, errors);

    let mut out = String::new();
    for (idx, segment) in segments.iter().enumerate() {
        match segment {
            Segment::Encoded(text) => out.push_str(text),
            Segment::Plain(bytes) => {
                // Whitespace separating two encoded words is not content
                let between_words = bytes.iter().all(|b| b.is_ascii_whitespace())
                    && idx > 0
                    && matches!(segments.get(idx - 1), Some(Segment::Encoded(_)))
                    && matches!(segments.get(idx + 1), Some(Segment::Encoded(_)));
                if between_words {
                    continue;
                }
                if bytes.is_ascii() {
                    out.push_str(std::str::from_utf8(bytes).expect("ascii is valid utf-8"));
                } else {
                    let decoded = decode_bytes(bytes, None, hints);
                    if decoded.lossy {
                        errors.push(format!(
                            "{label}: undecodable bytes (charset {})",
                            decoded.charset
                        ));
                    }
                    out.push_str(&decoded.text);
                }
            }
        }
    }

    WS_RUNS.replace_all(&out, " ").trim().to_string()
}

#[cfg(test)]
mod test {
    use super::*;

    fn decode(raw: &[u8]) -> String {
        let mut hints = CharsetHints::default();
        let mut errors = Vec::new();
        decode_header(raw, &mut hints, "test", &mut errors)
    }

    #[test]
    fn empty_is_empty() {
        k9::assert_equal!(decode(b""), "");
    }

    #[test]
    fn plain_ascii_passes_through() {
        k9::assert_equal!(decode(b"Hello there"), "Hello there");
    }

    #[test]
    fn base64_word() {
        k9::assert_equal!(decode(b"=?utf-8?B?aGVsbG8=?="), "hello");
    }

    #[test]
    fn quoted_printable_word_with_underscores() {
        k9::assert_equal!(decode(b"=?iso-8859-1?Q?Keld_J=F8rn?="), "Keld J\u{f8}rn");
    }

    #[test]
    fn whitespace_between_encoded_words_is_elided() {
        k9::assert_equal!(decode(b"=?utf-8?B?Zm9v?= =?utf-8?B?YmFy?="), "foobar");
        k9::assert_equal!(decode(b"=?utf-8?B?Zm9v?=\r\n =?utf-8?B?YmFy?="), "foobar");
    }

    #[test]
    fn mixed_plain_and_encoded() {
        k9::assert_equal!(decode(b"Hello =?utf-8?B?d29ybGQ=?= !"), "Hello world !");
    }

    #[test]
    fn folded_header_collapses_whitespace() {
        k9::assert_equal!(decode(b"a long\r\n\tfolded   value"), "a long folded value");
    }

    #[test]
    fn broken_encoded_word_degrades_to_literal() {
        k9::assert_equal!(decode(b"price =? 100"), "price =? 100");
        k9::assert_equal!(decode(b"=?utf-8?X?abc?="), "=?utf-8?X?abc?=");
    }

    #[test]
    fn raw_eight_bit_header_goes_through_resolver() {
        let (raw, _, _) = encoding_rs::WINDOWS_1251.encode("привет мир");
        let mut hints = CharsetHints::default();
        hints.note("windows-1251");
        let mut errors = Vec::new();
        let out = decode_header(&raw, &mut hints, "subject", &mut errors);
        k9::assert_equal!(out, "привет мир");
        assert!(errors.is_empty());
    }

    #[test]
    fn language_tagged_charset() {
        k9::assert_equal!(decode(b"=?utf-8*en?B?aGVsbG8=?="), "hello");
    }
}
