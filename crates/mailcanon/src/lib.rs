//! Canonical mail ingestion core: turn raw, often malformed RFC822/MIME
//! byte streams into sanitized, de-duplicated, thread-linked canonical
//! messages, and collapse long threads into bounded display groups.

mod address;
mod canon;
mod charset;
mod clean;
mod encoded;
mod error;
mod ingest;
pub mod tags;
mod thread;
mod walk;

pub use error::MailCanonError;
pub type Result<T> = std::result::Result<T, MailCanonError>;

pub use address::{parse_addresses, Address};
pub use canon::{
    canonicalize, gen_msgid, link_message, CanonicalMessage, MessageFlags, Parsed, LINK_SENDER,
    NO_MSGID,
};
pub use charset::{decode_bytes, CharsetHints, Decoded};
pub use clean::{clean_html, preview, Cleaned, PREVIEW_LEN};
pub use encoded::decode_header;
pub use ingest::{build_registry, declared_msgid, ingest_batch, MidRegistry, RawMessage};
pub use thread::{group_messages, ThreadGroup, DEFAULT_TAIL_SIZE};
pub use walk::{collect_charset_hints, walk, Attachment, WalkOutput};
