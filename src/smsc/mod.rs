//! SMSC connection abstraction (C4): the polymorphic handle the pool and
//! the routing core treat every protocol back-end through.
//!
//! Grounded on `gw/smscconn.h`/`gw/smscconn_p.h` (the struct-of-function-
//! pointers-plus-`void*data` pattern, modeled here as a trait per §9's
//! design note) and `gw/bb_smscconn.c` for the callback semantics.

pub mod backends;
pub mod pool;
pub mod split;

use std::future::Future;

use crate::access::UnifiedPrefix;
use crate::message::Message;

/// Connection state (§3.2).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Unknown,
    Active,
    ActiveRecvOnly,
    Connecting,
    Reconnecting,
    Disconnected,
    Dead,
}

/// Terminal reason a connection died (§3.2).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WhyKilled {
    Alive,
    Shutdown,
    WrongPassword,
    CannotConnect,
}

/// Reason a send failed, passed to [`SmscCallbacks::on_send_failed`] (§6.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendFailReason {
    Shutdown,
    Temporarily,
    Rejected,
    Malformed,
    Discarded,
    QFull,
}

/// Outcome of [`SmscCallbacks::on_received`] (§6.3): `0 | -1 | rejection-code`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReceiveOutcome {
    Accepted,
    QueueFull,
    Rejected(String),
}

/// Static routing policy fields of a configured SMSC group (§3.2, §4.5).
#[derive(Clone, Debug, Default)]
pub struct SmscPolicy {
    pub allowed_smsc_id: Option<String>,
    pub denied_smsc_id: Option<String>,
    pub preferred_smsc_id: Option<String>,
    pub allowed_prefix: Option<String>,
    pub denied_prefix: Option<String>,
    pub preferred_prefix: Option<String>,
    pub unified_prefix: UnifiedPrefix,
    pub reroute: bool,
    pub reroute_to_smsc: Option<String>,
    pub reroute_by_receiver: Vec<(String, String)>,
    pub reroute_dlr: bool,
}

/// Admin status-info snapshot (§4.4 `info(out)`).
#[derive(Clone, Debug)]
pub struct SmscInfo {
    pub id: String,
    pub name: String,
    pub status: Status,
    pub why_killed: WhyKilled,
    pub is_stopped: bool,
    pub received: u64,
    pub sent: u64,
    pub failed: u64,
    pub connect_time: i64,
    pub load: i64,
    pub queued: u64,
}

/// Returned by a rejected [`SmscConnection::send`], handing the message
/// back to the caller — mirrors `tokio::sync::mpsc::error::SendError<T>`,
/// which is exactly the shape spec.md §4.5 step 10 needs ("the chosen send
/// returned -1 ... recursively retry route(msg)").
#[derive(Debug)]
pub struct SendRejected(pub Message);

/// Uniform contract every protocol back-end implements (§4.4). Native
/// async-fn-in-trait, following the teacher's client trait layering.
pub trait SmscConnection: Send + Sync {
    fn id(&self) -> &str;

    fn policy(&self) -> &SmscPolicy;

    /// Non-blocking: enqueue for sending and return immediately. The caller
    /// must not touch `msg` again after a successful call; on rejection the
    /// message is handed back via [`SendRejected`].
    fn send(&self, msg: Message) -> impl Future<Output = Result<(), SendRejected>> + Send;

    /// Current sender-side backlog; the load metric used by `route`.
    fn queued(&self) -> u64;

    fn status(&self) -> Status;

    fn why_killed(&self) -> WhyKilled;

    fn is_stopped(&self) -> bool;

    /// Flip is-stopped without touching in-flight sends.
    fn stop(&self);
    fn start(&self);

    /// Begin draining (`finish_sending`) or fail fast. Transitions through
    /// Shutdown eventually to Dead.
    fn shutdown(&self, finish_sending: bool) -> impl Future<Output = ()> + Send;

    fn info(&self) -> SmscInfo;
}

/// Object-safe wrapper so the pool can hold a heterogeneous list of
/// back-ends. `SmscConnection`'s async methods aren't dyn-compatible, so
/// the pool stores `Arc<dyn DynSmscConnection>`, implemented once below for
/// every `T: SmscConnection`.
pub trait DynSmscConnection: Send + Sync {
    fn id(&self) -> &str;
    fn policy(&self) -> &SmscPolicy;
    fn send_boxed(&self, msg: Message) -> std::pin::Pin<Box<dyn Future<Output = Result<(), SendRejected>> + Send + '_>>;
    fn queued(&self) -> u64;
    fn status(&self) -> Status;
    fn why_killed(&self) -> WhyKilled;
    fn is_stopped(&self) -> bool;
    fn stop(&self);
    fn start(&self);
    fn shutdown_boxed(&self, finish_sending: bool) -> std::pin::Pin<Box<dyn Future<Output = ()> + Send + '_>>;
    fn info(&self) -> SmscInfo;
}

impl<T: SmscConnection> DynSmscConnection for T {
    fn id(&self) -> &str {
        SmscConnection::id(self)
    }
    fn policy(&self) -> &SmscPolicy {
        SmscConnection::policy(self)
    }
    fn send_boxed(&self, msg: Message) -> std::pin::Pin<Box<dyn Future<Output = Result<(), SendRejected>> + Send + '_>> {
        Box::pin(SmscConnection::send(self, msg))
    }
    fn queued(&self) -> u64 {
        SmscConnection::queued(self)
    }
    fn status(&self) -> Status {
        SmscConnection::status(self)
    }
    fn why_killed(&self) -> WhyKilled {
        SmscConnection::why_killed(self)
    }
    fn is_stopped(&self) -> bool {
        SmscConnection::is_stopped(self)
    }
    fn stop(&self) {
        SmscConnection::stop(self)
    }
    fn start(&self) {
        SmscConnection::start(self)
    }
    fn shutdown_boxed(&self, finish_sending: bool) -> std::pin::Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(SmscConnection::shutdown(self, finish_sending))
    }
    fn info(&self) -> SmscInfo {
        SmscConnection::info(self)
    }
}

/// Callback surface the core exposes to back-ends (§6.3). Implemented once
/// by [`pool::Pool`]; back-ends hold an `Arc<dyn SmscCallbacks>`.
pub trait SmscCallbacks: Send + Sync {
    fn on_ready(&self, conn_id: &str);
    fn on_connected(&self, conn_id: &str);
    fn on_killed(&self, conn_id: &str);
    fn on_received(&self, conn_id: &str, msg: Message) -> ReceiveOutcome;
    fn on_sent(&self, conn_id: &str, msg: Message, reply: Option<String>);
    fn on_send_failed(&self, conn_id: &str, msg: Message, reason: SendFailReason, reply: Option<String>);
}
