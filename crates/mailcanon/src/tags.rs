//! Reserved tag vocabulary shared by the canonicalizer and the search
//! compiler, plus the stable id derivation for user-defined labels.

/// Default mailbox view.
pub const TAG_INBOX: &str = "#inbox";
/// Junk. Excluded from search results unless explicitly targeted.
pub const TAG_SPAM: &str = "#spam";
/// Deleted. Excluded from search results unless explicitly targeted.
pub const TAG_TRASH: &str = "#trash";
pub const TAG_SENT: &str = "#sent";
/// Synthetic thread-linking messages; never surfaced in search results.
pub const TAG_LINK: &str = "#link";

pub const RESERVED: [&str; 5] = [TAG_INBOX, TAG_SPAM, TAG_TRASH, TAG_SENT, TAG_LINK];

/// Flag tag for a message with recorded decode/structure errors.
pub const TAG_ERR: &str = "#err";
/// Flag tag for a duplicate delivery of an already-seen Message-Id.
pub const TAG_DUP: &str = "#dup";

pub fn is_reserved(tag: &str) -> bool {
    RESERVED.contains(&tag)
}

/// Map a label to its stable tag id. Values that are already in tag form
/// (`#`-prefixed: reserved tags or previously derived ids) pass through
/// unchanged; anything else becomes `#` followed by the first 8 hex digits
/// of the md5 of the lower-cased label text.
pub fn tag_id(label: &str) -> String {
    let label = label.trim();
    if label.starts_with('#') {
        return label.to_string();
    }
    let digest = format!("{:x}", md5::compute(label.to_lowercase().as_bytes()));
    format!("#{}", &digest[..8])
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reserved_pass_through() {
        for tag in RESERVED {
            k9::assert_equal!(tag_id(tag), tag);
        }
    }

    #[test]
    fn derived_ids_are_stable_and_case_insensitive() {
        let a = tag_id("Projects/Home");
        let b = tag_id("projects/home");
        k9::assert_equal!(&a, &b);
        assert!(a.starts_with('#'));
        k9::assert_equal!(a.len(), 9);
        assert!(a[1..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn existing_tag_form_is_not_rehashed() {
        k9::assert_equal!(tag_id("#work"), "#work");
        k9::assert_equal!(tag_id(" #work "), "#work");
    }
}
