//! Accept loops (C10): the smsbox/wapbox listener and the admin listener.
//!
//! Grounded on `bb_boxc.c`'s listener setup (`smsbox_receiver_thread` is
//! spawned once per accepted connection) for the BOX listener, and on the
//! `bearerbox.h` admin surface (§6.1) for the admin listener — the original
//! exposes this over HTTP; this port has no HTTP crate anywhere in the
//! example pack, so the admin surface here is a line-based TCP protocol
//! read with `tokio::io::AsyncBufReadExt`, one command per line, one
//! `serde_json` response line back.

use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use crate::boxconn::wire::MessageConn;
use crate::boxconn::BoxConn;
use crate::core::Core;

/// Accepts smsbox (or, with `is_wap`, wapbox) connections on `port` and
/// spawns a [`BoxConn`] for each. Runs until the lifecycle reaches
/// Shutdown/Dead, at which point the listener stops taking new connections
/// — in-flight boxes are drained by `Core::drain_and_finalize`, not here.
pub async fn run_box_listener(core: Arc<Core>, port: u16, is_wap: bool) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, is_wap, "box listener bound");
    let mut lifecycle = core.lifecycle_handle();

    loop {
        lifecycle.checkpoint_ingress().await;
        if lifecycle.is_shutting_down() {
            tracing::info!(port, "box listener stopping, lifecycle is shutting down");
            return Ok(());
        }

        let (socket, addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(error = %err, "box listener accept failed");
                continue;
            }
        };
        tracing::info!(%addr, is_wap, "box connected");

        let wire = MessageConn::new(socket);
        let id = core.routing.next_box_id();
        let outgoing = core.pool.outgoing_producer();
        let retry = core.routing.incoming_producer();
        BoxConn::spawn(
            id,
            is_wap,
            addr.ip().to_string(),
            wire,
            core.config.core.smsbox_max_pending,
            core.config.core.max_incoming_sms_qlength,
            outgoing,
            retry,
            core.store.clone(),
            core.routing.clone(),
            core.lifecycle_handle(),
        );
    }
}

#[derive(Serialize)]
struct AdminResponse {
    ok: bool,
    message: String,
}

/// Accepts admin connections and dispatches one newline-terminated command
/// per line (§6.1). Unlike the box listener this keeps accepting even while
/// isolated/suspended/shutting down, since `shutdown`/`resume` themselves
/// must reach the core through this same listener.
pub async fn run_admin_listener(core: Arc<Core>, port: u16) -> std::io::Result<()> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    tracing::info!(port, "admin listener bound");

    loop {
        let (socket, addr) = listener.accept().await?;
        tracing::debug!(%addr, "admin connection accepted");
        let core = core.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_admin_connection(core, socket).await {
                tracing::warn!(%addr, error = %err, "admin connection error");
            }
        });
    }
}

async fn serve_admin_connection(core: Arc<Core>, socket: TcpStream) -> std::io::Result<()> {
    let (read_half, mut write_half) = socket.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        let response = dispatch_admin_command(&core, line.trim()).await;
        let mut body = serde_json::to_vec(&response).unwrap_or_else(|_| b"{\"ok\":false,\"message\":\"encode error\"}".to_vec());
        body.push(b'\n');
        write_half.write_all(&body).await?;
        write_half.flush().await?;
    }
    Ok(())
}

async fn dispatch_admin_command(core: &Arc<Core>, line: &str) -> AdminResponse {
    let mut parts = line.split_whitespace();
    let command = parts.next().unwrap_or("");
    let arg = parts.next();

    match command {
        "shutdown" => {
            core.shutdown();
            ok("shutdown requested")
        }
        "isolate" => {
            core.isolate();
            ok("isolated")
        }
        "suspend" => {
            core.suspend();
            ok("suspended")
        }
        "resume" => {
            core.resume();
            ok("resumed")
        }
        "restart" => match core.restart().await {
            Ok(()) => ok("restarted"),
            Err(err) => err_response(err.to_string()),
        },
        "stop_smsc" => match arg {
            Some(id) => match core.stop_smsc(id).await {
                Ok(()) => ok(&format!("smsc {id} stopped")),
                Err(err) => err_response(err.to_string()),
            },
            None => err_response("stop_smsc requires an id argument".into()),
        },
        "restart_smsc" => match arg {
            Some(id) => match core.restart_smsc(id).await {
                Ok(()) => ok(&format!("smsc {id} restarted")),
                Err(err) => err_response(err.to_string()),
            },
            None => err_response("restart_smsc requires an id argument".into()),
        },
        "status" => ok(&core.status().await),
        "flush_dlr" => {
            core.flush_dlr();
            ok("dlr index flushed")
        }
        other => err_response(format!("unknown admin command: {other}")),
    }
}

fn ok(message: &str) -> AdminResponse {
    AdminResponse { ok: true, message: message.to_string() }
}

fn err_response(message: String) -> AdminResponse {
    AdminResponse { ok: false, message }
}
