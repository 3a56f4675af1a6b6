pub mod client;
pub mod codec;
pub mod connection;
pub mod datatypes;
pub mod frame;
mod macros;

pub mod access;
pub mod alog;
pub mod boxconn;
pub mod config;
pub mod core;
pub mod dlr;
pub mod error;
pub mod lifecycle;
pub mod listener;
pub mod message;
pub mod smsc;
pub mod store;


// Re-exports kept from the teacher so the SMPP wire toolkit's own internal
// `crate::Frame`-style paths keep resolving.
pub use client::{BindCredentials, ClientBuilder, SmppClient, SmppConnection, SmppError, SmppResult, SmppTransmitter, SmsMessage};
pub use codec::{CodecError, Decodable, Encodable, Frame, PduHeader, PduRegistry};

/// Boxed error type backing the SMPP wire toolkit (`connection.rs`,
/// `frame.rs`) kept from the teacher. The gateway core's own modules use
/// [`error::GatewayError`]/[`error::Result`] instead.
pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;
