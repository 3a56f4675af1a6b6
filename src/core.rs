//! Main dispatch wiring (C10): assembles every component into one running
//! gateway and exposes the admin surface of §6.1.
//!
//! Grounded on `gw/bearerbox.h` — the global lists `incoming_sms`/
//! `outgoing_sms`/`incoming_wdp`/`outgoing_wdp` become `Pool`'s outgoing
//! queue and `RoutingTable`'s incoming queue; `Core` itself plays the role
//! of `bearerbox.c`'s `main` held together as a struct instead of a pile of
//! file-scope globals.

use std::sync::Arc;

use crate::access::{NumberSet, UnifiedPrefix};
use crate::alog::AccessLog;
use crate::boxconn::routing::RoutingTable;
use crate::config::{Config, SmscConfig};
use crate::dlr::DlrIndex;
use crate::error::{GatewayError, Result};
use crate::lifecycle::{Lifecycle, LifecycleHandle};
use crate::message::{Message, MessageBody, NackCode, SmsFields, SmsType};
use crate::smsc::backends;
use crate::smsc::pool::Pool;
use crate::smsc::split::SplitTracker;
use crate::smsc::{ReceiveOutcome, SendFailReason, SmscCallbacks};
use crate::store::{RestoreDirection, Store};

/// Everything a running gateway needs, wired once at startup.
pub struct Core {
    pub config: Config,
    pub store: Store,
    pub dlr: Arc<DlrIndex>,
    pub alog: Arc<AccessLog>,
    pub pool: Arc<Pool>,
    pub routing: Arc<RoutingTable>,
    pub split_tracker: Arc<SplitTracker>,
    pub lifecycle: Lifecycle,
}

impl Core {
    /// Builds every component, registers the configured SMSC back-ends, and
    /// replays the persistent store's survivors onto the right queue before
    /// returning. Does not spawn the listener accept loops or the router/
    /// dispatcher/compactor background fibers — the caller (`bearerboxd`)
    /// does that once it holds the `Arc<Core>`.
    pub async fn init(config: Config) -> Result<Arc<Core>> {
        let store = Store::init(&config.core.store_path).await?;
        let dlr = Arc::new(DlrIndex::new());
        let alog = Arc::new(AccessLog::default_template());
        let routing = RoutingTable::new(config.core.max_incoming_sms_qlength);
        let global_unified_prefix =
            config.core.unified_prefix.as_deref().map(UnifiedPrefix::parse).unwrap_or_default();
        let white_list = NumberSet::from_numbers(config.core.white_list.clone());
        let black_list = NumberSet::from_numbers(config.core.black_list.clone());

        let pool = Pool::new(
            global_unified_prefix,
            dlr.clone(),
            store.clone(),
            routing.clone(),
            white_list,
            black_list,
            alog.clone(),
        );

        let split_tracker = Arc::new(SplitTracker::new());
        let core = Arc::new(Core { config, store, dlr, alog, pool, routing, split_tracker, lifecycle: Lifecycle::new() });

        for smsc in &core.config.smsc {
            core.register_smsc(smsc).await?;
        }

        let restore_pool = core.pool.clone();
        let restore_routing = core.routing.clone();
        core.store
            .load(|direction, msg| match direction {
                RestoreDirection::Incoming => {
                    if restore_routing.route_incoming_to_boxc(msg).is_err() {
                        tracing::warn!("restart recovery: incoming queue full, dropping a restored message");
                    }
                }
                RestoreDirection::Outgoing => {
                    if restore_pool.outgoing_producer().try_send(msg).is_err() {
                        tracing::warn!("restart recovery: outgoing queue full, dropping a restored message");
                    }
                }
            })
            .await?;

        Ok(core)
    }

    async fn register_smsc(self: &Arc<Self>, smsc: &SmscConfig) -> Result<()> {
        let callbacks: Arc<dyn SmscCallbacks> = Arc::new(PoolCallbacks { core: self.clone(), smsc_id: smsc.id.clone() });
        let conn = backends::create(smsc, callbacks)?;
        self.pool.add_connection(conn).await;
        Ok(())
    }

    pub fn lifecycle_handle(&self) -> LifecycleHandle {
        self.lifecycle.handle()
    }

    // -- admin surface (§6.1) --------------------------------------------

    pub fn shutdown(&self) {
        self.lifecycle.shutdown();
    }

    pub fn isolate(&self) {
        self.lifecycle.isolate();
    }

    pub fn suspend(&self) {
        self.lifecycle.suspend();
    }

    pub fn resume(&self) {
        self.lifecycle.resume();
    }

    pub async fn stop_smsc(&self, id: &str) -> Result<()> {
        if self.config.smsc.iter().all(|c| c.id != id) {
            return Err(GatewayError::UnknownSmsc(id.to_string()));
        }
        self.pool.stop_smsc(id).await;
        Ok(())
    }

    /// Recreates one SMSC connection from its config group (§6.1
    /// `restart_smsc`). The old connection is shut down first; it stays in
    /// the pool's connection list as a dead, unusable entry — `Pool` has no
    /// removal primitive, matching `usable()`'s Dead-status exclusion rather
    /// than needing one.
    pub async fn restart_smsc(self: &Arc<Self>, id: &str) -> Result<()> {
        let smsc = self.config.smsc.iter().find(|c| c.id == id).ok_or_else(|| GatewayError::UnknownSmsc(id.to_string()))?.clone();
        self.pool.stop_smsc(id).await;
        self.register_smsc(&smsc).await
    }

    /// Restarts every configured SMSC connection (§6.1 `restart`). This
    /// port doesn't re-read the config file from disk — `Config` is already
    /// held in memory and there's no supplemental grounding for a live
    /// file-watch/reload path — so "reload config" here means re-applying
    /// the config this process was started with.
    pub async fn restart(self: &Arc<Self>) -> Result<()> {
        for smsc in self.config.smsc.clone() {
            self.restart_smsc(&smsc.id).await?;
        }
        Ok(())
    }

    pub fn flush_dlr(&self) {
        self.dlr.flush();
    }

    pub async fn status(&self) -> String {
        let dlr_line = format!("dlr index: {} pending entries", self.dlr.len());
        format!(
            "lifecycle: {:?}\n{}\n{}\n{}\n{}",
            self.lifecycle.state(),
            self.store.status(),
            self.pool.status().await,
            self.routing.status(),
            dlr_line,
        )
    }

    /// Drains the pool, forces a final store compaction, and marks the
    /// lifecycle dead. Called once the listener accept loops and background
    /// fibers have been told to stop.
    pub async fn drain_and_finalize(&self) -> Result<()> {
        self.pool.shutdown().await;
        self.store.shutdown().await?;
        self.lifecycle.mark_dead();
        Ok(())
    }
}

/// Bridges the synchronous [`SmscCallbacks`] surface back-ends call into the
/// async [`Pool`]/[`DlrIndex`] methods. `on_received` needs `Pool::receive_mo`
/// (async) from a non-async trait method, so it's dispatched onto its own
/// task rather than blocked on — the caller (a back-end's receiver loop)
/// gets an immediate `Accepted` and any later rejection only shows up in the
/// access log, mirroring `bb_smscconn_receive`'s own fire-and-forget handoff
/// to the router.
struct PoolCallbacks {
    core: Arc<Core>,
    smsc_id: String,
}

impl SmscCallbacks for PoolCallbacks {
    fn on_ready(&self, conn_id: &str) {
        tracing::info!(smsc = conn_id, "smsc connection ready");
    }

    fn on_connected(&self, conn_id: &str) {
        tracing::info!(smsc = conn_id, "smsc connection up");
        self.core.routing.wake_dispatcher();
    }

    fn on_killed(&self, conn_id: &str) {
        tracing::info!(smsc = conn_id, "smsc connection killed");
    }

    fn on_received(&self, conn_id: &str, msg: Message) -> ReceiveOutcome {
        let pool = self.core.pool.clone();
        let conn_id = conn_id.to_string();
        tokio::spawn(async move {
            pool.receive_mo(&conn_id, msg).await;
        });
        ReceiveOutcome::Accepted
    }

    /// Writes the store-ack, and — grounded on `gw/smsc_emi2.c`'s `dlr_add`
    /// call right after a successful submission — registers a pending DLR
    /// entry keyed on the SMSC's own submission reply, so a later delivery
    /// receipt carrying that same id correlates back to it
    /// (`PoolCallbacks::on_received`/`Pool::receive_mo`'s `DlrEvent`
    /// branch runs the `find` half). When the mask asks for an immediate
    /// smsc-success report (§8 scenario 2's "ACK/<reply>" message), that one
    /// is synthesized here directly rather than through `dlr.find`, since
    /// `find`'s retention rule would otherwise drop the entry before the
    /// real delivery receipt arrives.
    fn on_sent(&self, conn_id: &str, msg: Message, reply: Option<String>) {
        let store = self.core.store.clone();
        let dlr = self.core.dlr.clone();
        let routing = self.core.routing.clone();
        let split_tracker = self.core.split_tracker.clone();
        let alog = self.core.alog.clone();
        let smsc_id = self.smsc_id.clone();
        let conn_id = conn_id.to_string();
        tokio::spawn(async move {
            if let Err(err) = store.save_ack(&msg, NackCode::Success).await {
                tracing::error!(smsc = conn_id, error = %err, "failed to persist smsc send ack");
            }

            if let MessageBody::Sms(sms) = &msg.body {
                let reply_id = reply.clone().unwrap_or_else(|| msg.time.to_string());
                if sms.dlr_mask != 0 {
                    if let Some(dlr_url) = &sms.dlr_url {
                        dlr.add(smsc_id.clone(), reply_id.clone(), sms.receiver.clone(), sms.service_name.clone(), dlr_url.clone(), sms.dlr_mask);
                    }
                    if sms.dlr_mask & crate::message::dlr_mask::SMSC_SUCCESS != 0 {
                        let ack_report = Message::new_sms(SmsFields {
                            sender: sms.receiver.clone(),
                            receiver: "000".to_string(),
                            msgdata: bytes::Bytes::from(format!("ACK/{reply_id}").into_bytes()),
                            udhdata: None,
                            coding: crate::message::Coding::Default7Bit,
                            message_class: crate::message::MessageClass::Undef,
                            mwi: false,
                            compress: false,
                            dlr_mask: crate::message::dlr_mask::SMSC_SUCCESS,
                            dlr_url: None,
                            validity: None,
                            deferred: None,
                            service_name: sms.service_name.clone(),
                            account: None,
                            billing_info: None,
                            priority: 0,
                            protocol_id: 0,
                            boxc_id: None,
                            sms_type: SmsType::ReportMo,
                            split_parts: None,
                        });
                        alog.log(&ack_report, "Receive SMS");
                        if routing.route_incoming_to_boxc(ack_report).is_err() {
                            tracing::warn!(smsc = conn_id, "box incoming queue full, dropping smsc-success dlr");
                        }
                    }
                }

                if let Some(split) = &sms.split_parts {
                    split_tracker.register(split.parent_id, split.total_parts);
                    if let Some(rollup) = split_tracker.child_done(split.parent_id, crate::message::SplitStatus::Success) {
                        finalize_split_parent(&store, &alog, split, msg.smsc_id.clone(), rollup).await;
                    }
                }
            }
        });
    }

    fn on_send_failed(&self, conn_id: &str, msg: Message, reason: SendFailReason, _reply: Option<String>) {
        match reason {
            SendFailReason::Shutdown | SendFailReason::Temporarily => {
                let outgoing = self.core.pool.outgoing_producer();
                tokio::spawn(async move {
                    if outgoing.send(msg).await.is_err() {
                        tracing::warn!(smsc = conn_id, "outgoing queue closed, dropping requeued sms");
                    }
                });
            }
            SendFailReason::Rejected | SendFailReason::Malformed | SendFailReason::Discarded | SendFailReason::QFull => {
                let store = self.core.store.clone();
                let alog = self.core.alog.clone();
                let split_tracker = self.core.split_tracker.clone();
                let conn_id = conn_id.to_string();
                let split_status = match reason {
                    SendFailReason::Rejected => crate::message::SplitStatus::Rejected,
                    SendFailReason::Malformed => crate::message::SplitStatus::Malformed,
                    SendFailReason::Discarded => crate::message::SplitStatus::Discarded,
                    _ => crate::message::SplitStatus::OtherFailure,
                };
                tokio::spawn(async move {
                    alog.log(&msg, "DISCARDED");
                    if let Err(err) = store.save_ack(&msg, NackCode::Failed).await {
                        tracing::error!(smsc = conn_id, error = %err, "failed to persist smsc send-failure nack");
                    }
                    if let Some(split) = msg.sms().and_then(|f| f.split_parts.clone()) {
                        split_tracker.register(split.parent_id, split.total_parts);
                        if let Some(rollup) = split_tracker.child_done(split.parent_id, split_status) {
                            finalize_split_parent(&store, &alog, &split, msg.smsc_id.clone(), rollup).await;
                        }
                    }
                });
            }
        }
    }
}

/// Emits the single consolidated ack/log line for a split parent once every
/// child has reported (§4.4). There's no surviving `Message` for the
/// pre-split parent record at this point — `parent_id`/`parent_time` (copied
/// onto every child) are enough to build a stand-in for `save_ack`, which
/// only reads `id`/`time`/`smsc_id` off it.
async fn finalize_split_parent(
    store: &Store,
    alog: &AccessLog,
    split: &crate::message::SplitParts,
    smsc_id: Option<String>,
    rollup: crate::message::SplitStatus,
) {
    let parent_stub = Message {
        id: split.parent_id,
        time: split.parent_time,
        smsc_id,
        body: MessageBody::Sms(SmsFields {
            sender: String::new(),
            receiver: String::new(),
            msgdata: bytes::Bytes::new(),
            udhdata: None,
            coding: crate::message::Coding::Default7Bit,
            message_class: crate::message::MessageClass::Undef,
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
        }),
    };
    let nack_code = if rollup == crate::message::SplitStatus::Success { NackCode::Success } else { NackCode::Failed };
    alog.log(&parent_stub, if nack_code == NackCode::Success { "Sent SMS (split consolidated)" } else { "DISCARDED (split consolidated)" });
    if let Err(err) = store.save_ack(&parent_stub, nack_code).await {
        tracing::error!(error = %err, "failed to persist consolidated split-parent ack");
    }
}
