//! End-to-end scenarios driving a full [`Core`] the way a real smsbox and
//! a real SMSC back-end would: a raw TCP client speaks the BOX wire
//! protocol (§6.2) for the MT half, and `Pool::receive_mo` is exercised
//! directly for the MO half (§4.4's `bb_smscconn_receive` boundary — the
//! fake back-end has no socket to push bytes down).

use std::time::Duration;

use bearerbox_core::boxconn::wire::MessageConn;
use bearerbox_core::config::{Backend, Config, CoreConfig, SmscConfig};
use bearerbox_core::core::Core;
use bearerbox_core::listener;
use bearerbox_core::message::{Coding, Message, MessageBody, MessageClass, NackCode, SmsFields, SmsType};
use tokio::net::TcpStream;

fn smsc_config(id: &str) -> SmscConfig {
    SmscConfig {
        id: id.to_string(),
        backend: Backend::Fake,
        allowed_smsc_id: None,
        denied_smsc_id: None,
        preferred_smsc_id: None,
        allowed_prefix: None,
        denied_prefix: None,
        preferred_prefix: None,
        unified_prefix: None,
        reconnect_delay: 1,
        throughput: None,
        reroute: false,
        reroute_to_smsc: None,
        reroute_by_receiver: Vec::new(),
        reroute_dlr: true,
        host: None,
        port: None,
        system_id: None,
        password: None,
    }
}

async fn test_core(smsc: Vec<SmscConfig>, white_list: Vec<String>, black_list: Vec<String>) -> (std::sync::Arc<Core>, tempfile::TempDir) {
    test_core_with_qlen(smsc, white_list, black_list, None).await
}

async fn test_core_with_qlen(
    smsc: Vec<SmscConfig>,
    white_list: Vec<String>,
    black_list: Vec<String>,
    max_incoming_sms_qlength: Option<usize>,
) -> (std::sync::Arc<Core>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        core: CoreConfig {
            store_path: dir.path().join("store.log"),
            store_dump_interval: 10,
            max_incoming_sms_qlength,
            smsbox_port: 0,
            wapbox_port: None,
            admin_port: 0,
            unified_prefix: None,
            white_list,
            black_list,
            smsbox_max_pending: 10,
        },
        smsc,
    };
    let core = Core::init(config).await.unwrap();
    (core, dir)
}

fn sample_sms(receiver: &str) -> SmsFields {
    SmsFields {
        sender: "1000".into(),
        receiver: receiver.into(),
        msgdata: bytes::Bytes::from_static(b"hello"),
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
    }
}

/// A smsbox submits an SMS over the wire; the gateway routes it to the only
/// connected (fake) SMSC and the box gets an ack back on the same socket.
#[tokio::test]
async fn smsbox_submit_is_routed_and_acked() {
    let (core, _dir) = test_core(vec![smsc_config("s1")], Vec::new(), Vec::new()).await;
    core.pool.clone().spawn_router();
    core.routing.clone().spawn_dispatcher();

    let listener_port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let core = core.clone();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let wire = MessageConn::new(socket);
            let id = core.routing.next_box_id();
            bearerbox_core::boxconn::BoxConn::spawn(
                id,
                false,
                "127.0.0.1".into(),
                wire,
                10,
                None,
                core.pool.outgoing_producer(),
                core.routing.incoming_producer(),
                core.store.clone(),
                core.routing.clone(),
                core.lifecycle_handle(),
            );
        });
        addr.port()
    };

    let stream = TcpStream::connect(("127.0.0.1", listener_port)).await.unwrap();
    let mut wire = MessageConn::new(stream);
    let submitted = Message::new_sms(sample_sms("+491761234"));
    wire.write_message(&submitted).await.unwrap();

    let ack = tokio::time::timeout(Duration::from_secs(2), wire.read_message()).await.unwrap().unwrap().unwrap();
    match ack.body {
        MessageBody::Ack(fields) => {
            assert_eq!(fields.acked_id, submitted.id);
            assert_eq!(fields.nack_code, NackCode::Success);
        }
        other => panic!("expected an ack, got {other:?}"),
    }

    for _ in 0..50 {
        if core.store.messages() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// An MO decoded by a back-end is persisted and, since no box is connected,
/// parked on the global incoming queue rather than dropped.
#[tokio::test]
async fn mo_with_no_box_connected_is_persisted_and_parked() {
    let (core, _dir) = test_core(vec![smsc_config("s1")], Vec::new(), Vec::new()).await;

    let outcome = core.pool.receive_mo("s1", Message::new_sms(sample_sms("1000"))).await;
    assert!(matches!(outcome, bearerbox_core::smsc::ReceiveOutcome::Accepted));
    assert_eq!(core.store.messages(), 1);
}

/// A sender absent from a non-empty white list is rejected before the
/// message ever reaches durable storage.
#[tokio::test]
async fn mo_from_unlisted_sender_is_rejected_before_store() {
    let (core, _dir) = test_core(vec![smsc_config("s1")], vec!["+49".into()], Vec::new()).await;

    let mut fields = sample_sms("1000");
    fields.sender = "+1555".into();
    let outcome = core.pool.receive_mo("s1", Message::new_sms(fields)).await;
    assert!(matches!(outcome, bearerbox_core::smsc::ReceiveOutcome::Rejected(_)));
    assert_eq!(core.store.messages(), 0);
}

/// `stop_smsc` followed by `restart_smsc` leaves exactly one live (Active)
/// connection for that id in the pool.
#[tokio::test]
async fn restart_smsc_replaces_the_connection() {
    let (core, _dir) = test_core(vec![smsc_config("s1")], Vec::new(), Vec::new()).await;

    core.restart_smsc("s1").await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let status = core.status().await;
    assert!(status.contains("smsc pool: 2 connection(s)"));
}

/// Restart-recovery: messages saved to the store before a restart are
/// replayed through `Core::init` on the next startup.
#[tokio::test]
async fn restart_recovers_outgoing_messages_from_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("store.log");

    {
        let config = Config {
            core: CoreConfig {
                store_path: store_path.clone(),
                store_dump_interval: 10,
                max_incoming_sms_qlength: None,
                smsbox_port: 0,
                wapbox_port: None,
                admin_port: 0,
                unified_prefix: None,
                white_list: Vec::new(),
                black_list: Vec::new(),
                smsbox_max_pending: 10,
            },
            smsc: vec![smsc_config("s1")],
        };
        let core = Core::init(config).await.unwrap();
        core.store.save(&Message::new_sms(sample_sms("+491761234"))).await.unwrap();
        core.drain_and_finalize().await.unwrap();
    }

    let config = Config {
        core: CoreConfig {
            store_path,
            store_dump_interval: 10,
            max_incoming_sms_qlength: None,
            smsbox_port: 0,
            wapbox_port: None,
            admin_port: 0,
            unified_prefix: None,
            white_list: Vec::new(),
            black_list: Vec::new(),
            smsbox_max_pending: 10,
        },
        smsc: vec![smsc_config("s1")],
    };
    let core = Core::init(config).await.unwrap();
    core.pool.clone().spawn_router();

    for _ in 0..50 {
        if core.pool.status().await.contains("sent=1") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(core.pool.status().await.contains("sent=1"));
}

/// §8 scenario 3: once the global incoming-sms queue is at its configured
/// capacity, a further MO is rejected with queue-full rather than silently
/// dropped or wrongly accepted. Once a box connects and drains the queue,
/// the MOs that *did* get parked are delivered to it.
#[tokio::test]
async fn mo_receive_reports_queue_full_once_parked_queue_is_saturated() {
    let (core, _dir) = test_core_with_qlen(vec![smsc_config("s1")], Vec::new(), Vec::new(), Some(2)).await;

    let first = core.pool.receive_mo("s1", Message::new_sms(sample_sms("1000"))).await;
    let second = core.pool.receive_mo("s1", Message::new_sms(sample_sms("1001"))).await;
    let third = core.pool.receive_mo("s1", Message::new_sms(sample_sms("1002"))).await;

    assert!(matches!(first, bearerbox_core::smsc::ReceiveOutcome::Accepted));
    assert!(matches!(second, bearerbox_core::smsc::ReceiveOutcome::Accepted));
    assert!(matches!(third, bearerbox_core::smsc::ReceiveOutcome::QueueFull));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let core_for_accept = core.clone();
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let wire = MessageConn::new(socket);
        let id = core_for_accept.routing.next_box_id();
        bearerbox_core::boxconn::BoxConn::spawn(
            id,
            false,
            "127.0.0.1".into(),
            wire,
            10,
            None,
            core_for_accept.pool.outgoing_producer(),
            core_for_accept.routing.incoming_producer(),
            core_for_accept.store.clone(),
            core_for_accept.routing.clone(),
            core_for_accept.lifecycle_handle(),
        );
    });

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut wire = MessageConn::new(stream);
    wire.write_message(&Message {
        id: uuid::Uuid::new_v4(),
        time: 0,
        smsc_id: None,
        body: MessageBody::Admin { command: bearerbox_core::message::AdminCommand::Identify, boxc_id: Some("sb1".into()) },
    })
    .await
    .unwrap();
    core.routing.clone().spawn_dispatcher();

    for _ in 0..2 {
        let delivered = tokio::time::timeout(Duration::from_secs(2), wire.read_message()).await.unwrap().unwrap().unwrap();
        assert!(matches!(delivered.body, MessageBody::Sms(_)));
    }
}

/// §8 scenario 2: the SMSC acks a submission, and later delivers a terminal
/// delivery report for the same correlation id. Expect two DLR messages
/// routed back to the originating box: an immediate smsc-success report
/// with body `ACK/<reply>`, then a delivered-success report carrying the
/// original DLR URL.
#[tokio::test]
async fn dlr_round_trip_produces_two_reports_back_to_the_box() {
    let (core, _dir) = test_core(vec![smsc_config("s1")], Vec::new(), Vec::new()).await;
    core.pool.clone().spawn_router();
    core.routing.clone().spawn_dispatcher();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let core_for_accept = core.clone();
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let wire = MessageConn::new(socket);
        let id = core_for_accept.routing.next_box_id();
        bearerbox_core::boxconn::BoxConn::spawn(
            id,
            false,
            "127.0.0.1".into(),
            wire,
            10,
            None,
            core_for_accept.pool.outgoing_producer(),
            core_for_accept.routing.incoming_producer(),
            core_for_accept.store.clone(),
            core_for_accept.routing.clone(),
            core_for_accept.lifecycle_handle(),
        );
    });

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut wire = MessageConn::new(stream);
    wire.write_message(&Message {
        id: uuid::Uuid::new_v4(),
        time: 0,
        smsc_id: None,
        body: MessageBody::Admin { command: bearerbox_core::message::AdminCommand::Identify, boxc_id: Some("sb1".into()) },
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut mt = sample_sms("+491761234");
    mt.dlr_mask = bearerbox_core::message::dlr_mask::SMSC_SUCCESS | bearerbox_core::message::dlr_mask::DELIVERED_SUCCESS;
    mt.dlr_url = Some("http://example.test/dlr".into());
    core.pool.route(Message::new_sms(mt)).await;

    let first = tokio::time::timeout(Duration::from_secs(2), wire.read_message()).await.unwrap().unwrap().unwrap();
    let ack_body = match &first.body {
        MessageBody::Sms(f) => String::from_utf8_lossy(&f.msgdata).to_string(),
        other => panic!("expected the smsc-success report, got {other:?}"),
    };
    assert!(ack_body.starts_with("ACK/"), "unexpected ack body: {ack_body}");
    let reply_id = ack_body.trim_start_matches("ACK/").to_string();

    let dlr_event = bearerbox_core::message::Message::new_dlr_event(
        "s1",
        reply_id,
        "+491761234".to_string(),
        bearerbox_core::message::dlr_mask::DELIVERED_SUCCESS,
    );
    let outcome = core.pool.receive_mo("s1", dlr_event).await;
    assert!(matches!(outcome, bearerbox_core::smsc::ReceiveOutcome::Accepted));

    let second = tokio::time::timeout(Duration::from_secs(2), wire.read_message()).await.unwrap().unwrap().unwrap();
    match &second.body {
        MessageBody::Sms(f) => assert_eq!(f.msgdata.as_ref(), b"http://example.test/dlr"),
        other => panic!("expected the delivered-success report, got {other:?}"),
    }
}

/// §4.4: three split children of the same parent roll up into one
/// consolidated ack once the last child reports, instead of three.
#[tokio::test]
async fn split_children_consolidate_into_one_ack() {
    let (core, _dir) = test_core(vec![smsc_config("s1")], Vec::new(), Vec::new()).await;
    core.pool.clone().spawn_router();

    let parent_id = uuid::Uuid::new_v4();
    let parent_time = bearerbox_core::message::now_unix();
    for _ in 0..3 {
        let mut fields = sample_sms("+491761234");
        fields.split_parts = Some(bearerbox_core::message::SplitParts { parent_id, parent_time, total_parts: 3 });
        core.pool.route(Message::new_sms(fields)).await;
    }

    for _ in 0..50 {
        if core.pool.status().await.contains("sent=3") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(core.pool.status().await.contains("sent=3"));
    assert_eq!(core.split_tracker.child_done(parent_id, bearerbox_core::message::SplitStatus::Success), None);
}

/// The admin listener accepts line-based commands and replies with a JSON
/// line per §6.1.
#[tokio::test]
async fn admin_listener_answers_status_command() {
    let (core, _dir) = test_core(vec![smsc_config("s1")], Vec::new(), Vec::new()).await;

    let admin_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let admin_port = admin_listener.local_addr().unwrap().port();
    drop(admin_listener);
    let core_for_listener = core.clone();
    tokio::spawn(async move {
        let _ = listener::run_admin_listener(core_for_listener, admin_port).await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    let mut stream = TcpStream::connect(("127.0.0.1", admin_port)).await.unwrap();
    stream.write_all(b"status\n").await.unwrap();
    let (read_half, _write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let line = tokio::time::timeout(Duration::from_secs(2), lines.next_line()).await.unwrap().unwrap().unwrap();
    assert!(line.contains("\"ok\":true"));
}
