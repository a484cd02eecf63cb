//! Best-effort bytes→text decoding with a prioritized fallback chain.
//!
//! Real mail declares charsets that are wrong, absent or spelled in ways
//! the registry never blessed, so decoding here never fails: the chain
//! ends in a lossy decode that substitutes replacement characters and
//! reports the fact to the caller.

use charset::Charset;

/// Last-resort charset when nothing is declared, discovered or detected.
const DEFAULT_CHARSET: &str = "utf-8";

/// Labels seen in the wild that the WHATWG registry does not map where
/// the sending software intended.
const ALIASES: [(&str, &str); 2] = [
    // Google used gb2312 in subjects that actually carry gbk-only symbols
    ("gb2312", "gbk"),
    ("cp-1251", "windows-1251"),
];

/// Charsets discovered while processing a single message, in discovery
/// order. Used as decode candidates for fields that do not declare their
/// own charset.
#[derive(Debug, Default, Clone)]
pub struct CharsetHints {
    seen: Vec<String>,
}

impl CharsetHints {
    pub fn note(&mut self, label: &str) {
        let label = normalize_label(label);
        if label.is_empty() || self.seen.iter().any(|s| *s == label) {
            return;
        }
        self.seen.push(label);
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.seen.iter().map(|s| s.as_str())
    }

    pub fn first(&self) -> Option<&str> {
        self.seen.first().map(|s| s.as_str())
    }
}

/// The outcome of a decode. `lossy` is set when the guaranteed last
/// resort had to substitute replacement characters; callers record that
/// against the field or part label they were decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub text: String,
    pub charset: String,
    pub lossy: bool,
}

fn normalize_label(label: &str) -> String {
    let label = label.trim().to_ascii_lowercase();
    for (alias, canonical) in ALIASES {
        if label == alias {
            return canonical.to_string();
        }
    }
    label
}

fn decode_strict(label: &str, raw: &[u8]) -> Option<String> {
    let charset = Charset::for_label_no_replacement(label.as_bytes())?;
    let (text, malformed) = charset.decode_without_bom_handling(raw);
    if malformed {
        None
    } else {
        Some(text.into_owned())
    }
}

fn decode_lossy(label: &str, raw: &[u8]) -> String {
    let charset = Charset::for_label_no_replacement(label.as_bytes())
        .or_else(|| Charset::for_label_no_replacement(DEFAULT_CHARSET.as_bytes()))
        .expect("default charset label is always resolvable");
    let (text, _malformed) = charset.decode_without_bom_handling(raw);
    text.into_owned()
}

/// Statistical charset detection over the raw bytes.
fn detect(raw: &[u8]) -> Option<String> {
    let matches = charset_normalizer_rs::from_bytes(&raw.to_vec(), None).ok()?;
    let best = matches.get_best()?;
    Some(best.encoding().to_string())
}

/// Decode `raw` to text, trying in order: the declared charset (strict),
/// the per-message hints when nothing usable is declared, statistical
/// detection, the first hint or the fixed default, and finally a lossy
/// decode of the default that cannot fail. Successful strict decodes
/// extend `hints` for subsequent fields of the same message.
pub fn decode_bytes(raw: &[u8], declared: Option<&str>, hints: &mut CharsetHints) -> Decoded {
    if raw.is_empty() {
        return Decoded {
            text: String::new(),
            charset: declared.map(normalize_label).unwrap_or_else(|| DEFAULT_CHARSET.to_string()),
            lossy: false,
        };
    }

    let declared = declared
        .map(normalize_label)
        .filter(|c| !c.is_empty() && c != "unknown-8bit");

    if let Some(label) = &declared {
        if let Some(text) = decode_strict(label, raw) {
            hints.note(label);
            return Decoded {
                text,
                charset: label.clone(),
                lossy: false,
            };
        }
    } else {
        // Nothing usable declared: try charsets discovered elsewhere in
        // this message, in discovery order.
        for label in hints.seen.clone() {
            if let Some(text) = decode_strict(&label, raw) {
                return Decoded {
                    text,
                    charset: label,
                    lossy: false,
                };
            }
        }
    }

    if let Some(label) = detect(raw) {
        let label = normalize_label(&label);
        if let Some(text) = decode_strict(&label, raw) {
            hints.note(&label);
            return Decoded {
                text,
                charset: label,
                lossy: false,
            };
        }
    }

    let fallback = hints
        .first()
        .map(|s| s.to_string())
        .unwrap_or_else(|| DEFAULT_CHARSET.to_string());
    if let Some(text) = decode_strict(&fallback, raw) {
        return Decoded {
            text,
            charset: fallback,
            lossy: false,
        };
    }

    Decoded {
        text: decode_lossy(DEFAULT_CHARSET, raw),
        charset: declared.unwrap_or_else(|| DEFAULT_CHARSET.to_string()),
        lossy: true,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_input_is_empty_text() {
        let mut hints = CharsetHints::default();
        let out = decode_bytes(b"", None, &mut hints);
        k9::assert_equal!(out.text, "");
        assert!(!out.lossy);
    }

    #[test]
    fn declared_utf8() {
        let mut hints = CharsetHints::default();
        let out = decode_bytes("привет".as_bytes(), Some("UTF-8"), &mut hints);
        k9::assert_equal!(out.text, "привет");
        assert!(!out.lossy);
        k9::assert_equal!(hints.first(), Some("utf-8"));
    }

    #[test]
    fn declared_windows_1251() {
        let (raw, _, _) = encoding_rs::WINDOWS_1251.encode("привет");
        let mut hints = CharsetHints::default();
        let out = decode_bytes(&raw, Some("windows-1251"), &mut hints);
        k9::assert_equal!(out.text, "привет");
        assert!(!out.lossy);
    }

    #[test]
    fn aliases_are_applied() {
        let (raw, _, _) = encoding_rs::WINDOWS_1251.encode("тест");
        let mut hints = CharsetHints::default();
        let out = decode_bytes(&raw, Some("cp-1251"), &mut hints);
        k9::assert_equal!(out.text, "тест");
        k9::assert_equal!(out.charset, "windows-1251");
    }

    #[test]
    fn unknown_8bit_uses_hints() {
        let (raw, _, _) = encoding_rs::WINDOWS_1251.encode("привет");
        let mut hints = CharsetHints::default();
        hints.note("windows-1251");
        let out = decode_bytes(&raw, Some("unknown-8bit"), &mut hints);
        k9::assert_equal!(out.text, "привет");
        assert!(!out.lossy);
    }

    #[test]
    fn never_fails_on_arbitrary_bytes() {
        let mut hints = CharsetHints::default();
        let raw: Vec<u8> = (0u8..=255).collect();
        let out = decode_bytes(&raw, Some("utf-8"), &mut hints);
        assert!(!out.text.is_empty());
    }

    #[test]
    fn deterministic_for_identical_inputs() {
        let raw: Vec<u8> = vec![0xc3, 0x28, 0xa0, 0xa1, 0xff, 0x01];
        let a = decode_bytes(&raw, None, &mut CharsetHints::default());
        let b = decode_bytes(&raw, None, &mut CharsetHints::default());
        k9::assert_equal!(a, b);
    }

    #[test]
    fn hints_do_not_duplicate() {
        let mut hints = CharsetHints::default();
        hints.note("UTF-8");
        hints.note("utf-8");
        k9::assert_equal!(hints.iter().count(), 1);
    }
}
