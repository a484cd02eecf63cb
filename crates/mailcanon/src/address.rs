//! Address model for the canonical metadata.

use mailparse::{addrparse, MailAddr};
use serde::{Deserialize, Serialize};

/// A single parsed mailbox. `hash` is the md5 hex digest of the trimmed,
/// lower-cased address and gives address lists a stable grouping key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub addr: String,
    pub name: String,
    pub title: String,
    pub hash: String,
}

impl Address {
    pub fn new(display_name: Option<&str>, addr: &str) -> Self {
        let name = match display_name {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => match addr.find('@') {
                Some(idx) => addr[..idx].to_string(),
                None => addr.to_string(),
            },
        };
        let title = match display_name {
            Some(display) if !display.is_empty() => format!("{display} <{addr}>"),
            _ => addr.to_string(),
        };
        let hash = format!("{:x}", md5::compute(addr.trim().to_lowercase().as_bytes()));
        Self {
            addr: addr.to_string(),
            name,
            title,
            hash,
        }
    }
}

/// Parse a decoded address header into a flat address list. Groups are
/// flattened to their member mailboxes. Parse failures degrade to an
/// empty list with an entry in `errors`.
pub fn parse_addresses(value: &str, label: &str, errors: &mut Vec<String>) -> Vec<Address> {
    if value.trim().is_empty() {
        return vec![];
    }
    let parsed = match addrparse(value) {
        Ok(list) => list,
        Err(err) => {
            errors.push(format!("{label}: unparseable address list: {err}"));
            return vec![];
        }
    };
    let mut out = Vec::new();
    for addr in parsed.iter() {
        match addr {
            MailAddr::Single(info) => {
                out.push(Address::new(info.display_name.as_deref(), &info.addr));
            }
            MailAddr::Group(group) => {
                for info in &group.addrs {
                    out.push(Address::new(info.display_name.as_deref(), &info.addr));
                }
            }
        }
    }
    out
}
