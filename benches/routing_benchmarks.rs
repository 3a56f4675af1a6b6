// ABOUTME: Benchmark suite for the gateway routing core
// ABOUTME: Measures message pack/unpack round-trips and the pool's route() hot path

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bearerbox_core::access::{NumberSet, UnifiedPrefix};
use bearerbox_core::alog::AccessLog;
use bearerbox_core::dlr::DlrIndex;
use bearerbox_core::message::{Coding, Message, MessageClass, SmsFields, SmsType};
use bearerbox_core::smsc::pool::{MoSink, Pool};
use bearerbox_core::smsc::{SendRejected, SmscConnection, SmscInfo, SmscPolicy, Status, WhyKilled};
use bearerbox_core::store::Store;
use bytes::Bytes;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

fn sample_sms(receiver: &str) -> Message {
    Message::new_sms(SmsFields {
        sender: "1000".into(),
        receiver: receiver.into(),
        msgdata: Bytes::from(vec![b'A'; 140]),
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

fn bench_message_pack_unpack(c: &mut Criterion) {
    let msg = sample_sms("+491761234567");

    let mut group = c.benchmark_group("message_codec");
    group.bench_function("pack", |b| b.iter(|| std::hint::black_box(&msg).pack()));

    let packed = msg.pack();
    group.bench_function("unpack", |b| b.iter(|| Message::unpack(std::hint::black_box(&packed)).unwrap()));
    group.finish();
}

struct NullMoSink;
impl MoSink for NullMoSink {
    fn route_incoming_to_boxc(&self, _msg: Message) -> Result<(), Message> {
        Ok(())
    }
}

struct BenchConn {
    id: String,
    policy: SmscPolicy,
    queued: AtomicU64,
}

impl SmscConnection for BenchConn {
    fn id(&self) -> &str {
        &self.id
    }
    fn policy(&self) -> &SmscPolicy {
        &self.policy
    }
    fn send(&self, _msg: Message) -> impl std::future::Future<Output = Result<(), SendRejected>> + Send {
        self.queued.fetch_add(1, Ordering::Relaxed);
        async { Ok(()) }
    }
    fn queued(&self) -> u64 {
        self.queued.load(Ordering::Relaxed)
    }
    fn status(&self) -> Status {
        Status::Active
    }
    fn why_killed(&self) -> WhyKilled {
        WhyKilled::Alive
    }
    fn is_stopped(&self) -> bool {
        false
    }
    fn stop(&self) {}
    fn start(&self) {}
    fn shutdown(&self, _finish_sending: bool) -> impl std::future::Future<Output = ()> + Send {
        async {}
    }
    fn info(&self) -> SmscInfo {
        SmscInfo {
            id: self.id.clone(),
            name: "bench".into(),
            status: Status::Active,
            why_killed: WhyKilled::Alive,
            is_stopped: false,
            received: 0,
            sent: self.queued.load(Ordering::Relaxed),
            failed: 0,
            connect_time: 0,
            load: 0,
            queued: self.queued.load(Ordering::Relaxed),
        }
    }
}

fn build_pool(rt: &tokio::runtime::Runtime, connections: usize) -> Arc<Pool> {
    rt.block_on(async {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::init(dir.path().join("bench.log")).await.unwrap();
        std::mem::forget(dir);
        let pool = Pool::new(
            UnifiedPrefix::empty(),
            Arc::new(DlrIndex::new()),
            store,
            Arc::new(NullMoSink),
            NumberSet::new(),
            NumberSet::new(),
            Arc::new(AccessLog::default_template()),
        );
        for i in 0..connections {
            pool.add_connection(Arc::new(BenchConn { id: format!("s{i}"), policy: SmscPolicy::default(), queued: AtomicU64::new(0) })).await;
        }
        pool
    })
}

fn bench_pool_route(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("pool_route");
    group.measurement_time(Duration::from_secs(5));

    for &connections in &[1usize, 8, 64] {
        let pool = build_pool(&rt, connections);
        group.bench_with_input(BenchmarkId::new("uniform_policy", connections), &pool, |b, pool| {
            b.to_async(&rt).iter(|| {
                let pool = pool.clone();
                async move {
                    pool.route(std::hint::black_box(sample_sms("+491761234567"))).await;
                }
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_message_pack_unpack, bench_pool_route);
criterion_main!(benches);
