//! Interfaces to the collaborators the capture engine drives but does not
//! implement: the WAL decoder and the type metadata loader.
//!
//! The engine never looks inside a decoded message. It only asks for its
//! [`MessageClass`], which decides how the fetch loop treats it.

use async_trait::async_trait;

use crate::Result;

/// How the fetch loop treats a decoded message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    /// Start of a transaction. `commit_time` is in protocol microseconds
    /// (since 2000-01-01) and is attached to every change that follows
    /// until the next begin.
    Begin { commit_time: u64 },
    /// A row or DDL change.
    Change {
        /// Dropped without being forwarded.
        ignore: bool,
        /// Type metadata must be refreshed before anything after it is decoded.
        ddl: bool,
    },
    /// Commit and any other marker; forwarded unchanged.
    Other,
}

pub trait Classify {
    fn class(&self) -> MessageClass;
}

/// Turns output-plugin bytes into structured messages.
///
/// Decoders usually share type metadata with a [`SchemaLoader`]; the fetch
/// loop guarantees a refresh completes before the message following a DDL
/// change is decoded.
pub trait Decoder: Send + 'static {
    type Message: Classify + Send + 'static;

    /// Returns `Ok(None)` for payloads the decoder filters internally.
    fn decode(&mut self, data: &[u8]) -> Result<Option<Self::Message>>;
}

/// Loads type metadata the decoder depends on.
#[async_trait]
pub trait SchemaLoader: Send + 'static {
    async fn refresh_type(&mut self) -> Result<()>;
}
