//! Loopback SMSC back-end (`gw/smsc_fake.c`/`gw/smsc_fake2.c`): accepts every
//! send immediately and never opens a socket. Used as the default back-end
//! for scenario tests and local development.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Notify};

use crate::message::Message;
use crate::smsc::{SendRejected, SmscCallbacks, SmscConnection, SmscInfo, SmscPolicy, Status, WhyKilled};

const OUTGOING_QUEUE_CAPACITY: usize = 10_000;

pub struct FakeConnection {
    id: String,
    policy: SmscPolicy,
    status: Mutex<Status>,
    why_killed: Mutex<WhyKilled>,
    is_stopped: AtomicBool,
    finish_sending: AtomicBool,
    shutdown: Notify,
    queued: AtomicU64,
    sent: AtomicU64,
    received: AtomicU64,
    failed: AtomicU64,
    connect_time: i64,
    tx: mpsc::Sender<Message>,
    callbacks: Arc<dyn SmscCallbacks>,
}

impl FakeConnection {
    pub fn spawn(id: String, policy: SmscPolicy, callbacks: Arc<dyn SmscCallbacks>) -> Arc<FakeConnection> {
        let (tx, rx) = mpsc::channel(OUTGOING_QUEUE_CAPACITY);
        let conn = Arc::new(FakeConnection {
            id,
            policy,
            status: Mutex::new(Status::Active),
            why_killed: Mutex::new(WhyKilled::Alive),
            is_stopped: AtomicBool::new(false),
            finish_sending: AtomicBool::new(false),
            shutdown: Notify::new(),
            queued: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            connect_time: crate::message::now_unix(),
            tx,
            callbacks,
        });
        callbacks_notify_ready(&conn.callbacks, &conn.id);
        tokio::spawn(run(conn.clone(), rx));
        conn
    }

    /// Test-tooling hook: injects an MO as if it had arrived over the wire
    /// (SPEC_FULL's scenario tests drive this directly instead of a socket).
    pub fn simulate_mo(&self, msg: Message) {
        self.received.fetch_add(1, Ordering::SeqCst);
        self.callbacks.on_received(&self.id, msg);
    }

    /// Test-tooling hook: injects a delivery-report event as if a real
    /// back-end's receiver loop had just decoded one off the wire.
    pub fn simulate_dlr(&self, smsc_timestamp: String, destination: String, event: u8) {
        let msg = Message::new_dlr_event(self.id.clone(), smsc_timestamp, destination, event);
        self.callbacks.on_received(&self.id, msg);
    }
}

fn callbacks_notify_ready(callbacks: &Arc<dyn SmscCallbacks>, id: &str) {
    callbacks.on_ready(id);
    callbacks.on_connected(id);
}

async fn run(conn: Arc<FakeConnection>, mut rx: mpsc::Receiver<Message>) {
    loop {
        tokio::select! {
            biased;
            _ = conn.shutdown.notified() => {
                if conn.finish_sending.load(Ordering::SeqCst) {
                    while let Ok(msg) = rx.try_recv() {
                        conn.queued.fetch_sub(1, Ordering::SeqCst);
                        conn.sent.fetch_add(1, Ordering::SeqCst);
                        conn.callbacks.on_sent(&conn.id, msg, Some("fake-ack".to_string()));
                    }
                }
                break;
            }
            received = rx.recv() => {
                match received {
                    Some(msg) => {
                        conn.queued.fetch_sub(1, Ordering::SeqCst);
                        if conn.is_stopped.load(Ordering::SeqCst) {
                            conn.failed.fetch_add(1, Ordering::SeqCst);
                            conn.callbacks.on_send_failed(&conn.id, msg, crate::smsc::SendFailReason::Temporarily, None);
                        } else {
                            conn.sent.fetch_add(1, Ordering::SeqCst);
                            conn.callbacks.on_sent(&conn.id, msg, Some("fake-ack".to_string()));
                        }
                    }
                    None => break,
                }
            }
        }
    }
    *conn.status.lock().unwrap() = Status::Dead;
    conn.callbacks.on_killed(&conn.id);
}

impl SmscConnection for FakeConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn policy(&self) -> &SmscPolicy {
        &self.policy
    }

    fn send(&self, msg: Message) -> impl Future<Output = Result<(), SendRejected>> + Send {
        let result = match self.tx.try_send(msg) {
            Ok(()) => {
                self.queued.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(msg)) => Err(SendRejected(msg)),
            Err(mpsc::error::TrySendError::Closed(msg)) => Err(SendRejected(msg)),
        };
        async move { result }
    }

    fn queued(&self) -> u64 {
        self.queued.load(Ordering::SeqCst)
    }

    fn status(&self) -> Status {
        *self.status.lock().unwrap()
    }

    fn why_killed(&self) -> WhyKilled {
        *self.why_killed.lock().unwrap()
    }

    fn is_stopped(&self) -> bool {
        self.is_stopped.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.is_stopped.store(true, Ordering::SeqCst);
    }

    fn start(&self) {
        self.is_stopped.store(false, Ordering::SeqCst);
    }

    fn shutdown(&self, finish_sending: bool) -> impl Future<Output = ()> + Send {
        self.finish_sending.store(finish_sending, Ordering::SeqCst);
        *self.why_killed.lock().unwrap() = WhyKilled::Shutdown;
        *self.status.lock().unwrap() = Status::Disconnected;
        self.shutdown.notify_one();
        async {}
    }

    fn info(&self) -> SmscInfo {
        SmscInfo {
            id: self.id.clone(),
            name: format!("fake:{}", self.id),
            status: self.status(),
            why_killed: self.why_killed(),
            is_stopped: self.is_stopped(),
            received: self.received.load(Ordering::SeqCst),
            sent: self.sent.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            connect_time: self.connect_time,
            load: self.queued.load(Ordering::SeqCst) as i64,
            queued: self.queued.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Coding, MessageClass, SmsFields, SmsType};
    use crate::smsc::{DynSmscConnection, ReceiveOutcome, SendFailReason};
    use bytes::Bytes;
    use std::sync::Mutex as StdMutex;

    struct RecordingCallbacks {
        sent: StdMutex<Vec<Message>>,
        received: StdMutex<Vec<Message>>,
    }

    impl SmscCallbacks for RecordingCallbacks {
        fn on_ready(&self, _conn_id: &str) {}
        fn on_connected(&self, _conn_id: &str) {}
        fn on_killed(&self, _conn_id: &str) {}
        fn on_received(&self, _conn_id: &str, msg: Message) -> ReceiveOutcome {
            self.received.lock().unwrap().push(msg);
            ReceiveOutcome::Accepted
        }
        fn on_sent(&self, _conn_id: &str, msg: Message, _reply: Option<String>) {
            self.sent.lock().unwrap().push(msg);
        }
        fn on_send_failed(&self, _conn_id: &str, _msg: Message, _reason: SendFailReason, _reply: Option<String>) {}
    }

    fn sample() -> Message {
        Message::new_sms(SmsFields {
            sender: "1000".into(),
            receiver: "+491761234".into(),
            msgdata: Bytes::from_static(b"hi"),
            udhdata: None,
            coding: Coding::Default7Bit,
            message_class: MessageClass::Undef,
            mwi: false,
            compress: false,
            dlr_mask: 0,
            dlr_url: None,
            validity: None,
            deferred: None,
            service_name: None,
            account: None,
            billing_info: None,
            priority: 0,
            protocol_id: 0,
            boxc_id: None,
            sms_type: SmsType::MtPush,
            split_parts: None,
        })
    }

    #[tokio::test]
    async fn accepted_send_eventually_calls_on_sent() {
        let callbacks = Arc::new(RecordingCallbacks { sent: StdMutex::new(Vec::new()), received: StdMutex::new(Vec::new()) });
        let conn = FakeConnection::spawn("fake1".into(), SmscPolicy::default(), callbacks.clone());
        conn.send_boxed(sample()).await.unwrap();
        for _ in 0..50 {
            if !callbacks.sent.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(callbacks.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stopped_connection_fails_sends() {
        let callbacks = Arc::new(RecordingCallbacks { sent: StdMutex::new(Vec::new()), received: StdMutex::new(Vec::new()) });
        let conn = FakeConnection::spawn("fake2".into(), SmscPolicy::default(), callbacks.clone());
        conn.stop();
        assert!(conn.is_stopped());
        conn.start();
        assert!(!conn.is_stopped());
    }
}
