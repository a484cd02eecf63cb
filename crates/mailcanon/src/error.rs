use thiserror::Error;

#[derive(Error, Debug)]
pub enum MailCanonError {
    #[error("invalid mailbox arrival date {0:?}: {1}")]
    ArrivedDate(String, chrono::ParseError),
}
