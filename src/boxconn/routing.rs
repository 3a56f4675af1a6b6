//! BOX routing table (C7): tracks live box connections and places inbound
//! MOs on one of them.
//!
//! Grounded on `gw/bb_boxc.c`'s `smsbox_by_id`/`smsbox_by_smsc`/
//! `smsbox_by_receiver` dicts and `route_incoming_to_boxc`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};

use super::BoxConn;
use crate::message::Message;
use crate::smsc::pool::MoSink;

const GLOBAL_INCOMING_QLEN: usize = 50_000;
const DISPATCHER_IDLE_SLEEP: Duration = Duration::from_secs(60);

pub struct RoutingTable {
    boxes: DashMap<u64, Arc<BoxConn>>,
    by_boxc_id: DashMap<String, u64>,
    by_smsc: DashMap<String, u64>,
    by_receiver: DashMap<String, u64>,
    next_id: AtomicU64,
    incoming_tx: mpsc::Sender<Message>,
    incoming_rx: AsyncMutex<Option<mpsc::Receiver<Message>>>,
    notify: Notify,
}

impl RoutingTable {
    /// `max_incoming_sms_qlength` bounds both this global park queue and
    /// (threaded separately, by the caller) each box's own incoming queue —
    /// `None` falls back to the teacher-sized default.
    pub fn new(max_incoming_sms_qlength: Option<usize>) -> Arc<RoutingTable> {
        let (incoming_tx, incoming_rx) = mpsc::channel(max_incoming_sms_qlength.unwrap_or(GLOBAL_INCOMING_QLEN).max(1));
        Arc::new(RoutingTable {
            boxes: DashMap::new(),
            by_boxc_id: DashMap::new(),
            by_smsc: DashMap::new(),
            by_receiver: DashMap::new(),
            next_id: AtomicU64::new(1),
            incoming_tx,
            incoming_rx: AsyncMutex::new(Some(incoming_rx)),
            notify: Notify::new(),
        })
    }

    pub fn next_box_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn register(&self, boxc: Arc<BoxConn>) {
        self.boxes.insert(boxc.id, boxc);
    }

    pub fn deregister(&self, id: u64) {
        self.boxes.remove(&id);
        self.by_boxc_id.retain(|_, v| *v != id);
        self.by_smsc.retain(|_, v| *v != id);
        self.by_receiver.retain(|_, v| *v != id);
    }

    /// Static shortcut directive: route every MO for `smsc_id` to `boxc_id`
    /// once that box is connected (not currently populated from config —
    /// see DESIGN.md's Open Question decision).
    pub fn bind_by_smsc(&self, smsc_id: String, boxc_id: u64) {
        self.by_smsc.insert(smsc_id, boxc_id);
    }

    pub fn bind_by_receiver(&self, receiver: String, boxc_id: u64) {
        self.by_receiver.insert(receiver, boxc_id);
    }

    pub fn wake_dispatcher(&self) {
        self.notify.notify_one();
    }

    /// A cloneable producer handle onto the global incoming-sms queue, for
    /// callers outside `boxconn` that need to park a message the same way
    /// `try_route`'s park cases do (restart-recovery replay, a box's
    /// disconnect-drain retry path).
    pub fn incoming_producer(&self) -> mpsc::Sender<Message> {
        self.incoming_tx.clone()
    }

    pub fn status(&self) -> String {
        let mut out = format!("box routing table: {} connection(s)\n", self.boxes.len());
        for entry in self.boxes.iter() {
            let boxc = entry.value();
            out.push_str(&format!(
                "  boxc#{} boxc_id={:?} is_wap={} routable={} alive={} load={}\n",
                boxc.id,
                boxc.boxc_id(),
                boxc.is_wap,
                boxc.is_routable(),
                boxc.is_alive(),
                boxc.load()
            ));
        }
        out
    }

    /// §4.7 `route_incoming_to_boxc`'s 8-step algorithm. Synchronous: every
    /// non-immediate outcome (-1 / park) lands on the global incoming-sms
    /// queue for the dispatcher fiber to retry. `Err` means even that queue
    /// is full — the caller (`Pool::receive_mo`) turns this into the §4.7
    /// queue-full return.
    fn try_route(&self, msg: Message) -> Result<(), Message> {
        if self.boxes.is_empty() {
            return self.park(msg);
        }

        if let Some(hint) = msg.sms().and_then(|f| f.boxc_id.clone()) {
            let target = self.by_boxc_id.get(&hint).map(|e| *e);
            if let Some(id) = target {
                if let Some(boxc) = self.boxes.get(&id).map(|e| e.value().clone()) {
                    return match boxc.try_enqueue(msg) {
                        Ok(()) => Ok(()),
                        Err(msg) => self.park(msg),
                    };
                }
            }
            return self.park(msg);
        }

        let receiver = msg.sms().map(|f| f.receiver.clone());
        let smsc = msg.smsc_id.clone();
        let bound_id = receiver
            .as_deref()
            .and_then(|r| self.by_receiver.get(r).map(|e| *e))
            .or_else(|| smsc.as_deref().and_then(|s| self.by_smsc.get(s).map(|e| *e)));

        if let Some(id) = bound_id {
            if let Some(boxc) = self.boxes.get(&id).map(|e| e.value().clone()) {
                return match boxc.try_enqueue(msg) {
                    Ok(()) => Ok(()),
                    Err(msg) => self.park(msg),
                };
            }
            return self.park(msg);
        }

        match self.pick_random_routable() {
            Some(boxc) => match boxc.try_enqueue(msg) {
                Ok(()) => Ok(()),
                Err(msg) => self.park(msg),
            },
            None => self.park(msg),
        }
    }

    fn park(&self, msg: Message) -> Result<(), Message> {
        match self.incoming_tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(msg)) => {
                tracing::warn!("global incoming-sms queue full, rejecting MO");
                Err(msg)
            }
            Err(mpsc::error::TrySendError::Closed(msg)) => Err(msg),
        }
    }

    /// Random routable box with no explicit smsc/receiver binding, picking
    /// the least loaded with a randomized scan start (mirrors `smsc::pool`'s
    /// sweep; see DESIGN.md's Open Question on the undocumented 60s/600s
    /// sleep split for why this fiber and the MT router don't share code).
    fn pick_random_routable(&self) -> Option<Arc<BoxConn>> {
        let bound: HashSet<u64> = self.by_smsc.iter().map(|e| *e.value()).chain(self.by_receiver.iter().map(|e| *e.value())).collect();
        let candidates: Vec<Arc<BoxConn>> =
            self.boxes.iter().filter(|e| e.value().is_routable() && e.value().is_alive() && !bound.contains(e.key())).map(|e| e.value().clone()).collect();
        if candidates.is_empty() {
            return None;
        }
        let start = rand::thread_rng().gen_range(0..candidates.len());
        let mut best = &candidates[start];
        for offset in 1..candidates.len() {
            let candidate = &candidates[(start + offset) % candidates.len()];
            if candidate.load() < best.load() {
                best = candidate;
            }
        }
        Some(best.clone())
    }

    fn take_incoming_receiver(&self) -> mpsc::Receiver<Message> {
        self.incoming_rx.try_lock().expect("incoming receiver lock contended").take().expect("mo dispatcher fiber already spawned")
    }

    /// The MO→BOX dispatcher fiber: drains the global incoming-sms queue,
    /// retrying placement. Sleeps up to 60s when idle, woken early by a
    /// box-state-change notify (§4.7's closing paragraph).
    pub fn spawn_dispatcher(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut rx = self.take_incoming_receiver();
            loop {
                tokio::select! {
                    received = rx.recv() => {
                        match received {
                            Some(msg) => {
                                if self.try_route(msg).is_err() {
                                    tracing::warn!("mo dispatcher retry dropped: queue full again");
                                }
                            }
                            None => break,
                        }
                    }
                    _ = tokio::time::sleep(DISPATCHER_IDLE_SLEEP) => {
                        tracing::debug!("mo dispatcher idle timeout, re-checking");
                    }
                    _ = self.notify.notified() => {
                        tracing::debug!("mo dispatcher woken by box state change");
                    }
                }
            }
            tracing::info!("mo dispatcher fiber exiting");
        })
    }
}

impl MoSink for RoutingTable {
    fn route_incoming_to_boxc(&self, msg: Message) -> Result<(), Message> {
        self.try_route(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::Lifecycle;
    use crate::message::{Coding, MessageClass, SmsFields, SmsType};
    use crate::store::Store;
    use bytes::Bytes;
    use tokio::net::{TcpListener, TcpStream};

    fn sample_mo() -> Message {
        Message::new_sms(SmsFields {
            sender: "+491761234".into(),
            receiver: "1000".into(),
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
            sms_type: SmsType::Mo,
            split_parts: None,
        })
    }

    async fn spawn_test_box(routing: &Arc<RoutingTable>) -> Arc<BoxConn> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let _keep_client_alive = client;
        let wire = super::super::wire::MessageConn::new(server);
        let (outgoing_tx, _outgoing_rx) = mpsc::channel(16);
        let (retry_tx, _retry_rx) = mpsc::channel(16);
        let store = Store::init(std::env::temp_dir().join(format!("routing-test-{}.store", routing.next_box_id()))).await.unwrap();
        let lifecycle = Lifecycle::new();
        let id = routing.next_box_id();
        let boxc = BoxConn::spawn(id, false, "127.0.0.1".into(), wire, 10, None, outgoing_tx, retry_tx, store, routing.clone(), lifecycle.handle());
        boxc.mark_routable();
        boxc
    }

    #[tokio::test]
    async fn routes_to_the_only_routable_box() {
        let routing = RoutingTable::new(None);
        let boxc = spawn_test_box(&routing).await;
        assert!(routing.route_incoming_to_boxc(sample_mo()).is_ok());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(boxc.is_alive());
    }

    #[tokio::test]
    async fn parks_when_no_box_is_connected() {
        let routing = RoutingTable::new(None);
        assert!(routing.route_incoming_to_boxc(sample_mo()).is_ok());
        // no panic, no box to deliver to: message lands on the global queue.
    }

    #[tokio::test]
    async fn park_rejects_once_the_global_queue_is_full() {
        let routing = RoutingTable::new(Some(1));
        assert!(routing.route_incoming_to_boxc(sample_mo()).is_ok());
        assert!(routing.route_incoming_to_boxc(sample_mo()).is_err());
    }
}
