//! Internal error type for the resolver core.
//!
//! Wire-level XMPP error conditions (`item-not-found`, `jid-malformed`,
//! `service-unavailable`, …) are represented directly by
//! [`xmpp_parsers::stanza_error`] types and turned into error stanzas at the
//! router boundary — see [`crate::router`]. This enum covers failures
//! internal to the resolver itself and at its transport boundary: I/O
//! failures from the host binary's connection, malformed input it cannot
//! recover from, and failures reported by injected collaborators.

use thiserror::Error;

/// Errors internal to the resolver core and its transport boundary.
#[derive(Debug, Error)]
pub enum ResolverError {
    /// The transport connection failed (connect, read, or write).
    #[error("transport i/o error: {0}")]
    Io(String),

    /// The transport handed us a stanza that doesn't parse as XML.
    #[error("malformed stanza: {0}")]
    XmlParse(String),

    /// A collaborator (keyring, presence storage) failed.
    #[error("collaborator error: {0}")]
    Collaborator(String),

    /// Anything else that should never happen in practice.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ResolverError {
    /// Create a new transport I/O error.
    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io(msg.into())
    }

    /// Create a new XML parse error.
    pub fn xml_parse(msg: impl Into<String>) -> Self {
        Self::XmlParse(msg.into())
    }

    /// Create a new collaborator error.
    pub fn collaborator(msg: impl Into<String>) -> Self {
        Self::Collaborator(msg.into())
    }

    /// Create a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
