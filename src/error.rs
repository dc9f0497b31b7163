//! Error types shared across the crate.
//!
//! Protocol and I/O failures inside the layer stack are values (`Reply`), not errors;
//! these enums cover the places where a Rust `Result` is the natural surface.

use thiserror::Error;

/// Misuse of a [`crate::connection::Connection`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("cannot change server.{field} on open connection")]
    ChangeWhileOpen { field: &'static str },
    #[error("client connections have no {0}")]
    NotAServer(&'static str),
}

/// Failure to restore a connection from its serialized state.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("invalid connection state: {0}")]
    Invalid(#[from] serde_json::Error),
    #[error("unsupported connection state version {0}")]
    Version(u32),
}

/// Errors surfaced by a [`crate::layers::tls::TlsSession`].
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("{0}")]
    Protocol(#[from] rustls::Error),
    #[error("tls io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Config(String),
}

/// DNS wire format errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DnsError {
    #[error("unpack requires a buffer of {needed} bytes")]
    Truncated { needed: usize },
    #[error("{section} #{index}: {source}")]
    Record {
        section: &'static str,
        index: usize,
        #[source]
        source: Box<DnsError>,
    },
    #[error("unpack encountered a label of length {0}")]
    LabelLength(u8),
    #[error("unpack requires a label buffer of {0} bytes")]
    LabelTruncated(u8),
    #[error("unpack encountered domain name loop")]
    NameLoop,
    #[error("invalid domain name: {0}")]
    Name(String),
    #[error("DNS message's {field} {value} is out of bounds")]
    OutOfBounds { field: &'static str, value: u32 },
    #[error("response_code must be an error code")]
    NotAnError,
}

/// Errors from the host runtime.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("connection {0} has no address")]
    NoAddress(String),
    #[error("connect to {address} timed out")]
    ConnectTimeout { address: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
