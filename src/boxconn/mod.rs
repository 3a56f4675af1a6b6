//! BOX connection (C6): the per-smsbox-process connection bearerbox speaks
//! the length-prefixed [`crate::message::Message`] protocol over (§6.2).
//!
//! Grounded on `gw/bb_boxc.c`'s `Boxc` struct and its `boxc_receiver`/
//! `boxc_sender` thread pair. A receiver fiber dispatches inbound messages
//! by type; a sender fiber drains the per-box incoming queue and tracks
//! in-flight deliveries in a semaphore-bounded sent table.

pub mod routing;
pub mod wire;

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::{mpsc, Semaphore};
use uuid::Uuid;

use crate::lifecycle::LifecycleHandle;
use crate::message::{AdminCommand, Message, MessageBody, NackCode, SmsType};
use crate::store::Store;
use wire::{MessageReader, MessageWriter};

const INCOMING_QUEUE_CAPACITY: usize = 1_000;

/// A live connection to one smsbox process.
pub struct BoxConn {
    pub id: u64,
    pub is_wap: bool,
    pub client_ip: String,
    pub connect_time: i64,
    load: AtomicI64,
    incoming_tx: mpsc::Sender<Message>,
    sent_table: DashMap<Uuid, Message>,
    pending: Semaphore,
    alive: AtomicBool,
    boxc_id: Mutex<Option<String>>,
    routable: AtomicBool,
}

impl BoxConn {
    /// Accepts ownership of an already-connected socket and starts its
    /// receiver/sender fiber pair. Registers itself into `routing` so the
    /// MO→BOX dispatcher and admin surface can find it.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        id: u64,
        is_wap: bool,
        client_ip: String,
        wire: wire::MessageConn,
        max_pending: usize,
        incoming_qlen: Option<usize>,
        outgoing: mpsc::Sender<Message>,
        retry: mpsc::Sender<Message>,
        store: Store,
        routing: Arc<routing::RoutingTable>,
        lifecycle: LifecycleHandle,
    ) -> Arc<BoxConn> {
        let (incoming_tx, incoming_rx) = mpsc::channel(incoming_qlen.unwrap_or(INCOMING_QUEUE_CAPACITY).max(1));
        let conn = Arc::new(BoxConn {
            id,
            is_wap,
            client_ip,
            connect_time: crate::message::now_unix(),
            load: AtomicI64::new(0),
            incoming_tx,
            sent_table: DashMap::new(),
            pending: Semaphore::new(max_pending.max(1)),
            alive: AtomicBool::new(true),
            boxc_id: Mutex::new(None),
            routable: AtomicBool::new(false),
        });
        routing.register(conn.clone());

        let (reader, writer) = wire.into_split();
        tokio::spawn(receiver_fiber(conn.clone(), reader, outgoing, retry.clone(), store.clone(), routing.clone()));
        tokio::spawn(sender_fiber(conn.clone(), writer, incoming_rx, retry, routing, lifecycle));
        conn
    }

    pub fn load(&self) -> i64 {
        self.load.load(Ordering::SeqCst)
    }

    pub fn is_routable(&self) -> bool {
        self.routable.load(Ordering::SeqCst)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn boxc_id(&self) -> Option<String> {
        self.boxc_id.lock().unwrap().clone()
    }

    /// Tries to place `msg` on this box's per-connection incoming queue
    /// (§4.7 step 3's "found, has room" case). `Err` hands `msg` back.
    pub fn try_enqueue(&self, msg: Message) -> Result<(), Message> {
        match self.incoming_tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(m)) => Err(m),
            Err(mpsc::error::TrySendError::Closed(m)) => Err(m),
        }
    }

    pub(crate) fn mark_routable(&self) {
        self.routable.store(true, Ordering::SeqCst);
    }
}

/// Dispatches one inbound message by type (§4.6 receiver fiber).
async fn receiver_fiber(
    conn: Arc<BoxConn>,
    mut reader: MessageReader,
    outgoing: mpsc::Sender<Message>,
    retry: mpsc::Sender<Message>,
    store: Store,
    routing: Arc<routing::RoutingTable>,
) {
    loop {
        let msg = match reader.read_message().await {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                tracing::info!(boxc = conn.id, "box connection closed by peer");
                break;
            }
            Err(err) => {
                tracing::warn!(boxc = conn.id, error = %err, "box connection read error");
                break;
            }
        };

        match &msg.body {
            MessageBody::Sms(_) => {
                if let Err(err) = store.save(&msg).await {
                    tracing::error!(boxc = conn.id, error = %err, "failed to persist box-submitted sms");
                }
                let mut outbound = msg;
                if conn.is_wap {
                    if let Some(sms) = outbound.sms_mut() {
                        sms.sms_type = SmsType::MtPush;
                    }
                }
                let ack = Message::new_ack(&outbound, NackCode::Success);
                if outgoing.send(outbound).await.is_err() {
                    tracing::warn!(boxc = conn.id, "outgoing queue closed, dropping box-submitted sms");
                }
                conn.mark_routable();
                routing.wake_dispatcher();
                if conn.try_enqueue(ack).is_err() {
                    tracing::warn!(boxc = conn.id, "could not deliver ack, box incoming queue full or closed");
                }
            }
            MessageBody::WdpDatagram(_) => {
                if retry.send(msg).await.is_err() {
                    tracing::warn!(boxc = conn.id, "wdp retry queue closed, dropping datagram");
                }
            }
            MessageBody::Heartbeat { load } => {
                conn.load.store(*load as i64, Ordering::SeqCst);
            }
            MessageBody::Ack(ack) => {
                if let Some((_, original)) = conn.sent_table.remove(&ack.acked_id) {
                    if let Err(err) = store.save_ack(&original, ack.nack_code).await {
                        tracing::error!(boxc = conn.id, error = %err, "failed to persist box ack");
                    }
                    conn.pending.add_permits(1);
                } else {
                    tracing::debug!(boxc = conn.id, id = %ack.acked_id, "ack for unknown sent-table entry");
                }
            }
            MessageBody::Admin { command: AdminCommand::Identify, boxc_id } => {
                *conn.boxc_id.lock().unwrap() = boxc_id.clone();
                conn.mark_routable();
                routing.wake_dispatcher();
            }
            MessageBody::Admin { command, .. } => {
                tracing::debug!(boxc = conn.id, ?command, "discarding unexpected admin command from box");
            }
            MessageBody::DlrEvent { .. } => {
                tracing::debug!(boxc = conn.id, "discarding dlr-event body from a box connection");
            }
        }
    }

    conn.alive.store(false, Ordering::SeqCst);
    routing.deregister(conn.id);
}

/// Drains the per-box incoming queue to the socket, tracking in-flight SMS
/// deliveries in the semaphore-bounded sent table (§4.6 sender fiber).
async fn sender_fiber(
    conn: Arc<BoxConn>,
    mut writer: MessageWriter,
    mut incoming_rx: mpsc::Receiver<Message>,
    retry: mpsc::Sender<Message>,
    routing: Arc<routing::RoutingTable>,
    mut lifecycle: LifecycleHandle,
) {
    loop {
        lifecycle.checkpoint_egress().await;
        if lifecycle.is_shutting_down() {
            let terminal = Message {
                id: Uuid::new_v4(),
                time: crate::message::now_unix(),
                smsc_id: None,
                body: MessageBody::Admin { command: AdminCommand::Shutdown, boxc_id: None },
            };
            let _ = writer.write_message(&terminal).await;
            break;
        }

        let msg = match incoming_rx.recv().await {
            Some(msg) => msg,
            None => {
                let terminal = Message {
                    id: Uuid::new_v4(),
                    time: crate::message::now_unix(),
                    smsc_id: None,
                    body: MessageBody::Admin { command: AdminCommand::Shutdown, boxc_id: None },
                };
                let _ = writer.write_message(&terminal).await;
                break;
            }
        };

        let is_sms = matches!(msg.body, MessageBody::Sms(_));
        let permit = if is_sms { Some(conn.pending.acquire().await.expect("semaphore never closed")) } else { None };
        if is_sms {
            conn.sent_table.insert(msg.id, msg.duplicate());
        }
        // The permit is held by the sent-table entry conceptually; forget it
        // here and restore it explicitly on ack or on drain (`add_permits`).
        if let Some(permit) = permit {
            permit.forget();
        }

        if let Err(err) = writer.write_message(&msg).await {
            tracing::warn!(boxc = conn.id, error = %err, "box connection write error");
            if is_sms {
                conn.sent_table.remove(&msg.id);
                conn.pending.add_permits(1);
            }
            let _ = retry.send(msg).await;
            break;
        }
    }

    let _ = writer.shutdown().await;

    let stranded = conn.sent_table.len();
    for entry in conn.sent_table.iter() {
        let _ = retry.send(entry.value().clone()).await;
    }
    conn.sent_table.clear();
    conn.pending.add_permits(stranded);
    while let Ok(msg) = incoming_rx.try_recv() {
        let _ = retry.send(msg).await;
    }

    conn.alive.store(false, Ordering::SeqCst);
    routing.deregister(conn.id);
}
