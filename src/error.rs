//! Library-wide error type.
//!
//! Mirrors the shape of [`crate::client::error::SmppError`]: one enum, one
//! `thiserror` derive, `#[from]` on the variants that wrap another crate's
//! error type.

use thiserror::Error;

/// Errors that can cross a module boundary anywhere in the gateway core.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(String),

    #[error("message codec error: {0}")]
    Codec(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("no usable smsc connection for this message")]
    NoRoute,

    #[error("smsc connection {0} not found")]
    UnknownSmsc(String),

    #[error("box connection {0} not found")]
    UnknownBoxc(String),

    #[error("queue full")]
    QueueFull,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("toml parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
