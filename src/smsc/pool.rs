//! SMSC pool & outbound router (C5): the ordered, RWLock-guarded collection
//! of SMSC connections and the MT routing algorithm.
//!
//! Grounded on `gw/smscconn.c`, `gw/smscconn_p.h` and `gw/bb_smscconn.c`
//! (`smsc2_rout`, `smscconn_usable`, `route_incoming_to_smsc`,
//! `bb_smscconn_receive`, `sms_router`).

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, Mutex as AsyncMutex, RwLock};

use crate::access::{matches_id_list, matches_prefix_list, NumberSet, UnifiedPrefix};
use crate::alog::AccessLog;
use crate::dlr::DlrIndex;
use crate::message::{Message, NackCode, SmsType};
use crate::smsc::{DynSmscConnection, ReceiveOutcome, SendRejected, SmscCallbacks, SmscPolicy, Status};
use crate::store::Store;

/// Where a received MO ends up; implemented by the BOX routing table so
/// `smsc` doesn't need to depend on `boxconn` directly. `Err` means every
/// queue the message could land on (the chosen box's, or the global park
/// queue) is already at its configured capacity.
pub trait MoSink: Send + Sync {
    fn route_incoming_to_boxc(&self, msg: Message) -> Result<(), Message>;
}

#[derive(Debug)]
pub enum RouteOutcome {
    /// §4.5 return value 1: sent to exactly one connection.
    Sent,
    /// §4.5 return value 0: accepted and queued, or silently dropped during
    /// shutdown.
    Queued,
    /// §4.5 return value -1: caller must not discard `msg`'s effects —
    /// in this port that means the caller gets the message back.
    Failed(Message),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Usability {
    Unusable,
    Ok,
    Preferred,
}

fn usable(conn: &dyn DynSmscConnection, msg: &Message) -> Usability {
    if conn.status() == Status::Dead {
        return Usability::Unusable;
    }
    let policy = conn.policy();
    if let Some(allowed) = &policy.allowed_smsc_id {
        let ok = msg.smsc_id.as_deref().is_some_and(|id| matches_id_list(id, allowed));
        if !ok {
            return Usability::Unusable;
        }
    }
    if let Some(denied) = &policy.denied_smsc_id {
        if msg.smsc_id.as_deref().is_some_and(|id| matches_id_list(id, denied)) {
            return Usability::Unusable;
        }
    }

    let receiver = msg.sms().map(|f| f.receiver.as_str()).unwrap_or("");
    if let Some(allowed) = &policy.allowed_prefix {
        if !matches_prefix_list(receiver, allowed) {
            return Usability::Unusable;
        }
    }
    if let Some(denied) = &policy.denied_prefix {
        if matches_prefix_list(receiver, denied) {
            return Usability::Unusable;
        }
    }

    let preferred_by_id = policy
        .preferred_smsc_id
        .as_deref()
        .is_some_and(|p| msg.smsc_id.as_deref().is_some_and(|id| matches_id_list(id, p)));
    let preferred_by_prefix = policy.preferred_prefix.as_deref().is_some_and(|p| matches_prefix_list(receiver, p));
    if preferred_by_id || preferred_by_prefix {
        Usability::Preferred
    } else {
        Usability::Ok
    }
}

const OUTGOING_QUEUE_CAPACITY: usize = 100_000;
const ROUTER_IDLE_SLEEP: Duration = Duration::from_secs(600);

pub struct Pool {
    conns: RwLock<Vec<Arc<dyn DynSmscConnection>>>,
    global_unified_prefix: UnifiedPrefix,
    outgoing_tx: mpsc::Sender<Message>,
    outgoing_rx: AsyncMutex<Option<mpsc::Receiver<Message>>>,
    shutting_down: AtomicBool,
    dlr: Arc<DlrIndex>,
    store: Store,
    mo_sink: Arc<dyn MoSink>,
    white_list: NumberSet,
    black_list: NumberSet,
    alog: Arc<AccessLog>,
}

impl Pool {
    pub fn new(
        global_unified_prefix: UnifiedPrefix,
        dlr: Arc<DlrIndex>,
        store: Store,
        mo_sink: Arc<dyn MoSink>,
        white_list: NumberSet,
        black_list: NumberSet,
        alog: Arc<AccessLog>,
    ) -> Arc<Pool> {
        let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_QUEUE_CAPACITY);
        Arc::new(Pool {
            conns: RwLock::new(Vec::new()),
            global_unified_prefix,
            outgoing_tx,
            outgoing_rx: AsyncMutex::new(Some(outgoing_rx)),
            shutting_down: AtomicBool::new(false),
            dlr,
            store,
            mo_sink,
            white_list,
            black_list,
            alog,
        })
    }

    pub async fn add_connection(&self, conn: Arc<dyn DynSmscConnection>) {
        self.conns.write().await.push(conn);
    }

    pub async fn find_by_id(&self, id: &str) -> Option<Arc<dyn DynSmscConnection>> {
        self.conns.read().await.iter().find(|c| c.id() == id).cloned()
    }

    pub async fn stop_smsc(&self, id: &str) {
        for conn in self.conns.read().await.iter().filter(|c| c.id() == id) {
            conn.shutdown_boxed(true).await;
        }
    }

    pub async fn resume(&self) {
        for conn in self.conns.read().await.iter() {
            conn.start();
        }
    }

    pub async fn suspend(&self) {
        for conn in self.conns.read().await.iter() {
            conn.stop();
        }
    }

    /// §4.5 `shutdown()`: shuts every connection down in drain mode; the
    /// router fiber exits on its own once the outgoing queue empties and
    /// every producer handle (cloned `outgoing_tx`) has been dropped.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        for conn in self.conns.read().await.iter() {
            conn.shutdown_boxed(true).await;
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub async fn status(&self) -> String {
        let conns = self.conns.read().await;
        let mut out = format!("smsc pool: {} connection(s)\n", conns.len());
        for conn in conns.iter() {
            let info = conn.info();
            out.push_str(&format!(
                "  {} status={:?} stopped={} queued={} sent={} failed={}\n",
                info.id, info.status, info.is_stopped, info.queued, info.sent, info.failed
            ));
        }
        out
    }

    /// A cloneable producer handle onto the global outgoing-sms queue
    /// (§9's "refcounted producer handle" idiom — dropping every clone lets
    /// the router fiber observe end-of-stream via `recv() == None`).
    pub fn outgoing_producer(&self) -> mpsc::Sender<Message> {
        self.outgoing_tx.clone()
    }

    async fn requeue_outgoing(&self, msg: Message) -> RouteOutcome {
        match self.outgoing_tx.try_send(msg) {
            Ok(()) => RouteOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(msg)) => RouteOutcome::Failed(msg),
            Err(mpsc::error::TrySendError::Closed(msg)) => RouteOutcome::Failed(msg),
        }
    }

    /// The MT routing algorithm (§4.5 `route(msg)`).
    pub async fn route(&self, msg: Message) -> RouteOutcome {
        if msg.sms().is_none() {
            return RouteOutcome::Failed(msg);
        }

        let mut msg = msg;
        if let Some(sms) = msg.sms_mut() {
            sms.receiver = self.global_unified_prefix.apply(&sms.receiver);
        }
        let base_receiver = msg.sms().map(|f| f.receiver.clone()).unwrap_or_default();

        let mut excluded: HashSet<String> = HashSet::new();
        loop {
            let conns = self.conns.read().await;
            if conns.is_empty() {
                drop(conns);
                tracing::warn!("route: smsc pool is empty");
                return RouteOutcome::Failed(msg);
            }
            let len = conns.len();
            let start = rand::thread_rng().gen_range(0..len);

            let mut best_preferred: Option<(usize, i64)> = None;
            let mut best_ok: Option<(usize, i64)> = None;
            let mut bad_found = false;

            for offset in 0..len {
                let idx = (start + offset) % len;
                let conn = conns[idx].as_ref();
                if excluded.contains(conn.id()) {
                    continue;
                }
                match usable(conn, &msg) {
                    Usability::Unusable => continue,
                    usability => {
                        if conn.status() != Status::Active {
                            bad_found = true;
                            continue;
                        }
                        let load = conn.queued() as i64;
                        match usability {
                            Usability::Preferred => {
                                if best_preferred.map_or(true, |(_, l)| load < l) {
                                    best_preferred = Some((idx, load));
                                }
                            }
                            Usability::Ok => {
                                if best_ok.map_or(true, |(_, l)| load < l) {
                                    best_ok = Some((idx, load));
                                }
                            }
                            Usability::Unusable => unreachable!(),
                        }
                    }
                }
            }

            let chosen = best_preferred.or(best_ok).map(|(idx, _)| idx);
            let Some(idx) = chosen else {
                drop(conns);
                if bad_found && !self.is_shutting_down() {
                    return self.requeue_outgoing(msg).await;
                }
                if self.is_shutting_down() {
                    tracing::debug!("route: shutting down, dropping message");
                    return RouteOutcome::Queued;
                }
                tracing::warn!("route: no usable smsc connection for this message");
                return RouteOutcome::Failed(msg);
            };

            let conn = conns[idx].clone();
            drop(conns);

            // §3.1: normalized global-then-local for MT, mirroring
            // `smscconn_send`'s `conn->unified_prefix` pass right before the
            // actual send, once the connection is chosen.
            if let Some(sms) = msg.sms_mut() {
                sms.receiver = conn.policy().unified_prefix.apply(&base_receiver);
            }

            match conn.send_boxed(msg).await {
                Ok(()) => return RouteOutcome::Sent,
                Err(SendRejected(returned)) => {
                    excluded.insert(conn.id().to_string());
                    msg = returned;
                    if excluded.len() >= len {
                        tracing::warn!("route: every connection rejected the send");
                        return RouteOutcome::Failed(msg);
                    }
                }
            }
        }
    }

    /// Handles an MO (or DLR) decoded by a back-end (`bb_smscconn_receive`).
    /// The black/white-list gate runs *before* `store.save`, so a rejected
    /// MO is never written to the durable log. A [`MessageBody::DlrEvent`]
    /// short-circuits straight to the DLR index: it isn't a real SMS, so
    /// none of the list/store/sms-type handling below applies to it.
    pub async fn receive_mo(&self, conn_id: &str, mut msg: Message) -> ReceiveOutcome {
        if let crate::message::MessageBody::DlrEvent { smsc_timestamp, destination, event } = &msg.body {
            let report = self.dlr.find(conn_id, smsc_timestamp, destination, *event);
            return match report {
                Some(report) => {
                    self.alog.log(&report, "Receive SMS");
                    match self.mo_sink.route_incoming_to_boxc(report) {
                        Ok(()) => ReceiveOutcome::Accepted,
                        Err(_) => ReceiveOutcome::QueueFull,
                    }
                }
                None => {
                    tracing::debug!(smsc = conn_id, "dlr event matched no pending entry");
                    ReceiveOutcome::Accepted
                }
            };
        }

        let conn = self.find_by_id(conn_id).await;

        if let (Some(conn), Some(sms)) = (&conn, msg.sms_mut()) {
            sms.sender = conn.policy().unified_prefix.apply(&sms.sender);
        }
        if let Some(sms) = msg.sms_mut() {
            sms.sender = self.global_unified_prefix.apply(&sms.sender);
        }

        let sender = msg.sms().map(|f| f.sender.clone()).unwrap_or_default();
        if !self.white_list.is_empty() && !self.white_list.contains(&sender) {
            self.alog.log(&msg, "REJECTED (not in white list)");
            return ReceiveOutcome::Rejected("not in white list".into());
        }
        if self.black_list.contains(&sender) {
            self.alog.log(&msg, "REJECTED (in black list)");
            return ReceiveOutcome::Rejected("in black list".into());
        }

        if let Some(sms) = msg.sms_mut() {
            if !matches!(sms.sms_type, SmsType::ReportMo | SmsType::ReportMt) {
                sms.sms_type = SmsType::Mo;
            }
        }

        if let Err(err) = self.store.save(&msg).await {
            tracing::error!(error = %err, "store save failed for MO");
            return ReceiveOutcome::QueueFull;
        }
        self.alog.log(&msg, "Receive SMS");

        if let Some(conn) = &conn {
            if let Some(rerouted) = apply_rerouting(conn.policy(), msg.clone()) {
                let _ = self.route(rerouted).await;
                return ReceiveOutcome::Accepted;
            }
        }

        match self.mo_sink.route_incoming_to_boxc(msg) {
            Ok(()) => ReceiveOutcome::Accepted,
            Err(_) => ReceiveOutcome::QueueFull,
        }
    }

    /// Finalizes a message `route` could not place: persists a DISCARDED
    /// nack and surfaces it to the originator via the access log.
    async fn finalize_discarded(&self, msg: Message) {
        self.alog.log(&msg, "DISCARDED");
        if let Err(err) = self.store.save_ack(&msg, NackCode::Failed).await {
            tracing::error!(error = %err, "failed to persist discard ack");
        }
    }

    /// Takes ownership of the receiving half so the router fiber can run.
    /// Panics if called twice — there is exactly one router fiber.
    fn take_outgoing_receiver(&self) -> mpsc::Receiver<Message> {
        self.outgoing_rx
            .try_lock()
            .expect("outgoing receiver lock contended")
            .take()
            .expect("mt router fiber already spawned")
    }

    /// The MT router fiber (`sms_router`): consumes `outgoing_sms`, calls
    /// `route`, and emits a DISCARDED nack when routing fails outright.
    /// Sleeps up to 600s when idle, woken early by a push.
    pub fn spawn_router(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut rx = self.take_outgoing_receiver();
            loop {
                tokio::select! {
                    received = rx.recv() => {
                        match received {
                            Some(msg) => {
                                if let RouteOutcome::Failed(msg) = self.route(msg).await {
                                    self.finalize_discarded(msg).await;
                                }
                            }
                            None => break,
                        }
                    }
                    _ = tokio::time::sleep(ROUTER_IDLE_SLEEP) => {
                        tracing::debug!("mt router idle timeout, re-checking outgoing queue");
                    }
                }
            }
            tracing::info!("mt router fiber exiting");
        })
    }

    pub fn dlr_index(&self) -> &DlrIndex {
        &self.dlr
    }
}

/// Rerouting precedence from `bb_smscconn.c::route_incoming_to_smsc`:
/// plain `reroute` first, then `reroute_to_smsc`, then `reroute_by_receiver`
/// (exact match only — see DESIGN.md's Open Question decision on wildcards).
fn apply_rerouting(policy: &SmscPolicy, mut msg: Message) -> Option<Message> {
    let is_report = matches!(msg.sms().map(|f| f.sms_type), Some(SmsType::ReportMo) | Some(SmsType::ReportMt));
    if is_report && !policy.reroute_dlr {
        return None;
    }
    if policy.reroute {
        if let Some(sms) = msg.sms_mut() {
            sms.sms_type = SmsType::MtPush;
        }
        return Some(msg);
    }
    if let Some(target) = &policy.reroute_to_smsc {
        if let Some(sms) = msg.sms_mut() {
            sms.sms_type = SmsType::MtPush;
        }
        msg.smsc_id = Some(target.clone());
        return Some(msg);
    }
    if !policy.reroute_by_receiver.is_empty() {
        let receiver = msg.sms().map(|f| f.receiver.clone()).unwrap_or_default();
        for (pattern, target) in &policy.reroute_by_receiver {
            if *pattern == receiver {
                if let Some(sms) = msg.sms_mut() {
                    sms.sms_type = SmsType::MtPush;
                }
                msg.smsc_id = Some(target.clone());
                return Some(msg);
            }
        }
    }
    None
}

/// No-op callback implementation, handy for wiring up a pool in isolation
/// (tests, a back-end that drives `receive_mo` directly).
pub struct NullCallbacks;

impl SmscCallbacks for NullCallbacks {
    fn on_ready(&self, _conn_id: &str) {}
    fn on_connected(&self, _conn_id: &str) {}
    fn on_killed(&self, _conn_id: &str) {}
    fn on_received(&self, _conn_id: &str, _msg: Message) -> ReceiveOutcome {
        ReceiveOutcome::Accepted
    }
    fn on_sent(&self, _conn_id: &str, _msg: Message, _reply: Option<String>) {}
    fn on_send_failed(&self, _conn_id: &str, _msg: Message, _reason: crate::smsc::SendFailReason, _reply: Option<String>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Coding, MessageClass, SmsFields};
    use bytes::Bytes;
    use std::sync::atomic::AtomicU64;

    struct NullMoSink;
    impl MoSink for NullMoSink {
        fn route_incoming_to_boxc(&self, _msg: Message) -> Result<(), Message> {
            Ok(())
        }
    }

    fn sample_sms(receiver: &str) -> Message {
        Message::new_sms(SmsFields {
            sender: "1000".into(),
            receiver: receiver.into(),
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

    async fn test_pool() -> Arc<Pool> {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::init(dir.path().join("store.log")).await.unwrap();
        Pool::new(
            UnifiedPrefix::empty(),
            Arc::new(DlrIndex::new()),
            store,
            Arc::new(NullMoSink),
            NumberSet::new(),
            NumberSet::new(),
            Arc::new(AccessLog::default_template()),
        )
    }

    #[tokio::test]
    async fn route_fails_on_empty_pool() {
        let pool = test_pool().await;
        match pool.route(sample_sms("+491761234")).await {
            RouteOutcome::Failed(_) => {}
            _ => panic!("expected Failed"),
        }
    }

    struct FakeConn {
        id: String,
        policy: SmscPolicy,
        status: Status,
        queued: AtomicU64,
        sent: AtomicU64,
    }

    impl crate::smsc::SmscConnection for FakeConn {
        fn id(&self) -> &str {
            &self.id
        }
        fn policy(&self) -> &SmscPolicy {
            &self.policy
        }
        fn send(&self, _msg: Message) -> impl std::future::Future<Output = Result<(), SendRejected>> + Send {
            self.sent.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        }
        fn queued(&self) -> u64 {
            self.queued.load(Ordering::SeqCst)
        }
        fn status(&self) -> Status {
            self.status
        }
        fn why_killed(&self) -> crate::smsc::WhyKilled {
            crate::smsc::WhyKilled::Alive
        }
        fn is_stopped(&self) -> bool {
            false
        }
        fn stop(&self) {}
        fn start(&self) {}
        fn shutdown(&self, _finish_sending: bool) -> impl std::future::Future<Output = ()> + Send {
            async {}
        }
        fn info(&self) -> crate::smsc::SmscInfo {
            crate::smsc::SmscInfo {
                id: self.id.clone(),
                name: "fake".into(),
                status: self.status,
                why_killed: crate::smsc::WhyKilled::Alive,
                is_stopped: false,
                received: 0,
                sent: self.sent.load(Ordering::SeqCst),
                failed: 0,
                connect_time: 0,
                load: 0,
                queued: self.queued.load(Ordering::SeqCst),
            }
        }
    }

    #[tokio::test]
    async fn preferred_prefix_wins_over_lower_load() {
        let pool = test_pool().await;
        let preferred = Arc::new(FakeConn {
            id: "s1".into(),
            policy: SmscPolicy { preferred_prefix: Some("+49".into()), ..Default::default() },
            status: Status::Active,
            queued: AtomicU64::new(10),
            sent: AtomicU64::new(0),
        });
        let busy_generic = Arc::new(FakeConn {
            id: "s2".into(),
            policy: SmscPolicy::default(),
            status: Status::Active,
            queued: AtomicU64::new(0),
            sent: AtomicU64::new(0),
        });
        pool.add_connection(preferred.clone()).await;
        pool.add_connection(busy_generic.clone()).await;

        let outcome = pool.route(sample_sms("+491761234")).await;
        assert!(matches!(outcome, RouteOutcome::Sent));
        assert_eq!(preferred.sent.load(Ordering::SeqCst), 1);
        assert_eq!(busy_generic.sent.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn denied_prefix_yields_failed_route() {
        let pool = test_pool().await;
        let denier = Arc::new(FakeConn {
            id: "s1".into(),
            policy: SmscPolicy { denied_prefix: Some("+49176".into()), ..Default::default() },
            status: Status::Active,
            queued: AtomicU64::new(0),
            sent: AtomicU64::new(0),
        });
        pool.add_connection(denier).await;
        let outcome = pool.route(sample_sms("+491761234")).await;
        assert!(matches!(outcome, RouteOutcome::Failed(_)));
    }
}
