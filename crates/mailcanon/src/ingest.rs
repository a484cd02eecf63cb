//! Batch ingestion driver.
//!
//! Duplicate assignment depends on which uid is first for a declared
//! Message-Id, so the registry is built in a strictly sequential pass in
//! arrival order. Canonicalization afterwards is read-only against the
//! registry and runs on a worker pool; output order is restored by uid.

use crate::canon::{canonicalize, Parsed, NO_MSGID};
use mailparse::MailHeaderMap;
use rayon::prelude::*;
use std::collections::HashMap;

/// One raw delivered message as handed over by the mailbox transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub uid: String,
    /// Quoted mailbox-protocol arrival timestamp, `DD-Mon-YYYY HH:MM:SS ±ZZZZ`.
    pub arrived: String,
    pub raw: Vec<u8>,
}

/// Append-only map from declared Message-Id to the uid of the first
/// message observed with it.
#[derive(Debug, Default, Clone)]
pub struct MidRegistry {
    by_mid: HashMap<String, String>,
}

impl MidRegistry {
    /// Record a sighting; the first writer for a given id wins.
    pub fn record(&mut self, msgid: &str, uid: &str) {
        self.by_mid
            .entry(msgid.to_string())
            .or_insert_with(|| uid.to_string());
    }

    pub fn first_uid(&self, msgid: &str) -> Option<&str> {
        self.by_mid.get(msgid).map(|uid| uid.as_str())
    }

    pub fn contains(&self, msgid: &str) -> bool {
        self.by_mid.contains_key(msgid)
    }

    pub fn len(&self) -> usize {
        self.by_mid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_mid.is_empty()
    }
}

/// The declared Message-Id of a raw message, or the placeholder when the
/// header is missing or the headers cannot be parsed at all. Must agree
/// with the canonicalizer's own extraction.
pub fn declared_msgid(raw: &[u8]) -> String {
    match mailparse::parse_headers(raw) {
        Ok((headers, _)) => headers
            .get_first_value("Message-Id")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| NO_MSGID.to_string()),
        Err(_) => NO_MSGID.to_string(),
    }
}

/// Sequential first pass: build the Message-Id registry in arrival order.
pub fn build_registry<'a>(batch: impl IntoIterator<Item = &'a RawMessage>) -> MidRegistry {
    let mut mids = MidRegistry::default();
    for msg in batch {
        mids.record(&declared_msgid(&msg.raw), &msg.uid);
    }
    mids
}

fn uid_sort_key(uid: &str) -> (u64, String) {
    (uid.parse().unwrap_or(u64::MAX), uid.to_string())
}

/// Canonicalize a whole batch: sequential registry pass, then a parallel
/// read-only pass, results restored to uid order.
pub fn ingest_batch(batch: &[RawMessage]) -> crate::Result<Vec<Parsed>> {
    let mids = build_registry(batch);
    let mut parsed = batch
        .par_iter()
        .map(|msg| canonicalize(&msg.raw, &msg.uid, &msg.arrived, &mids))
        .collect::<crate::Result<Vec<Parsed>>>()?;
    parsed.sort_by_key(|p| uid_sort_key(&p.msg.origin_uid));
    Ok(parsed)
}
