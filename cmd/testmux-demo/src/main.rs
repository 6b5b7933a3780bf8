//! gvstream end-to-end demo
//!
//! Runs without any network access:
//!   Part A - Fused router: two typed broadcast managers behind one router
//!   Part B - Test reactor: doorman, accepted connection, echo broker
//!   Part C - Coordinator: scoped action queue with a watched flag
//!
//! Run: GVS_LOG_LEVEL=debug ./target/release/testmux-demo

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use gvstream_core::{
    kinfo, ActorAddr, BroadcastManager, Disposable, DisposableFlag, DownstreamManager,
    DownstreamMsg, FusedDownstreamManager, OutboundPath, Outbox, ScopedCoordinator, StreamConfig,
    StreamSlot,
};
use gvstream_testmux::{
    AcceptHandle, Broker, ConnectionHandle, DatagramSink, DatagramSource, Doorman, Endpoint,
    FnResumable, InjectorScheduler, MuxConfig, ReceivePolicy, Scribe, TestMultiplexer,
};

// ── Test harness ──

struct TestRunner {
    total: usize,
    passed: usize,
    failed: usize,
}

const LINE: &str = "────────────────────────────────────────────────────────────";

impl TestRunner {
    fn new() -> Self {
        Self { total: 0, passed: 0, failed: 0 }
    }

    fn section(&self, name: &str) {
        println!("\n{}", LINE);
        println!("  {}", name);
        println!("{}", LINE);
    }

    fn check(&mut self, name: &str, ok: bool, reason: &str) {
        self.total += 1;
        if ok {
            self.passed += 1;
            println!("  [{:2}] {:<52} PASS", self.total, name);
        } else {
            self.failed += 1;
            println!("  [{:2}] {:<52} FAIL: {}", self.total, name, reason);
        }
    }

    fn summary(&self) {
        println!("\n{}", LINE);
        println!(
            "  Total: {}  Passed: {}  Failed: {}",
            self.total, self.passed, self.failed
        );
        println!("{}", LINE);
    }
}

// ── Echo broker: writes every chunk straight back ──

#[derive(Default)]
struct EchoBroker {
    scribes: Mutex<Vec<Arc<dyn Scribe>>>,
    doormen: Mutex<Vec<Arc<dyn Doorman>>>,
    accepted: AtomicUsize,
}

impl Broker for EchoBroker {
    fn add_scribe(&self, scribe: Arc<dyn Scribe>) {
        self.scribes.lock().unwrap_or_else(|e| e.into_inner()).push(scribe);
    }

    fn add_doorman(&self, doorman: Arc<dyn Doorman>) {
        self.doormen.lock().unwrap_or_else(|e| e.into_inner()).push(doorman);
    }

    fn add_endpoint(&self, endpoint: Arc<dyn Endpoint>) {
        kinfo!("ignoring endpoint {}", endpoint.hdl());
    }

    fn add_datagram_sink(&self, sink: Arc<dyn DatagramSink>) {
        kinfo!("ignoring sink {}", sink.hdl());
    }

    fn add_datagram_source(&self, source: Arc<dyn DatagramSource>) {
        kinfo!("ignoring source {}", source.hdl());
    }

    fn new_data(&self, hdl: ConnectionHandle, buf: &[u8]) -> bool {
        let scribe = self
            .scribes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|s| s.hdl() == hdl)
            .cloned();
        match scribe {
            Some(s) => s.write(buf).is_ok(),
            None => false,
        }
    }

    fn new_connection(&self, acceptor: AcceptHandle, hdl: ConnectionHandle) -> bool {
        kinfo!("{} accepted {}", acceptor, hdl);
        self.accepted.fetch_add(1, Ordering::Relaxed);
        true
    }
}

// ════════════════════════════════════════════════════════════
// Part A: Fused router
// ════════════════════════════════════════════════════════════

fn test_fused(t: &mut TestRunner) {
    t.section("Part A: Fused router");

    let outbox = Outbox::new();
    let cfg = StreamConfig::from_env();
    let numbers = BroadcastManager::<u32>::new(outbox.clone(), &cfg);
    let words = BroadcastManager::<String>::new(outbox.clone(), &cfg);
    let mut fused = FusedDownstreamManager::new(vec![Box::new(numbers), Box::new(words)]);

    let s1 = StreamSlot::new(1);
    let s2 = StreamSlot::new(2);
    let registered = fused
        .register_path(Box::new(OutboundPath::new(s1, ActorAddr(10))))
        .and_then(|_| fused.register_path(Box::new(OutboundPath::new(s2, ActorAddr(20)))));
    t.check("register two paths", registered.is_ok(), "register_path failed");
    t.check("both unassigned", fused.num_unassigned() == 2, "unexpected count");

    let dup = fused.register_path(Box::new(OutboundPath::new(s1, ActorAddr(11))));
    t.check("duplicate slot rejected", dup.is_err(), "duplicate accepted");

    let assigned = match fused.select_for::<u32>() {
        Some(id) => fused.assign(s1, id),
        None => Err(gvstream_core::RouteError::UnknownManagerType("u32")),
    };
    t.check("assign by element type", assigned.is_ok(), &format!("{:?}", assigned));
    let assigned = fused.assign_to::<BroadcastManager<String>>(s2);
    t.check("assign by manager type", assigned.is_ok(), &format!("{:?}", assigned));
    t.check("router tracks both paths", fused.num_paths() == 2, "num_paths != 2");

    if let Some(m) = fused.get_mut::<BroadcastManager<u32>>() {
        m.handle_open_ack(s1, StreamSlot::new(100), 10, 2);
        for i in 1..=5 {
            m.push(i);
        }
    }
    fused.emit_batches();
    let full: Vec<_> = outbox.drain();
    t.check("two full batches", full.len() == 2, &format!("got {}", full.len()));

    fused.force_emit_batches();
    let rest = outbox.drain();
    let tail = rest.first().and_then(|env| match &env.msg {
        DownstreamMsg::Batch(b) => b.items::<u32>().cloned(),
        _ => None,
    });
    t.check("forced underfull batch", tail == Some(vec![5]), &format!("{:?}", tail));

    fused.close();
    let closes = outbox
        .drain()
        .into_iter()
        .filter(|env| matches!(env.msg, DownstreamMsg::Close))
        .count();
    t.check("close reaches every path", closes == 2, &format!("got {}", closes));
    t.check("router empty after close", fused.num_paths() == 0, "paths left");
}

// ════════════════════════════════════════════════════════════
// Part B: Test reactor
// ════════════════════════════════════════════════════════════

fn test_reactor(t: &mut TestRunner) {
    t.section("Part B: Test reactor");

    let mux = TestMultiplexer::new(MuxConfig::from_env(), Arc::new(InjectorScheduler::new()));
    let broker = Arc::new(EchoBroker::default());
    let dyn_broker: Arc<dyn Broker> = broker.clone();

    let missing = mux.add_tcp_scribe(&dyn_broker, "example.org", 80);
    t.check("unprovided address fails", missing.is_err(), "got a handle");

    mux.provide_acceptor(7000, AcceptHandle::from_int(1));
    let acc = match mux.add_tcp_doorman(&dyn_broker, 7000) {
        Ok((acc, _)) => acc,
        Err(e) => {
            t.check("add doorman", false, &e.to_string());
            return;
        }
    };
    t.check("doorman installed", mux.has_impl(acc), "no adapter");

    let conn = ConnectionHandle::from_int(2);
    t.check("nothing to accept yet", !mux.accept_connection(acc), "accepted");
    mux.add_pending_connect(acc, conn);
    t.check("accept pending connection", mux.accept_connection(acc), "not accepted");
    t.check(
        "broker saw the connection",
        broker.accepted.load(Ordering::Relaxed) == 1,
        "no new_connection",
    );

    mux.set_read_config(conn, ReceivePolicy::exactly(4));
    mux.virtual_send(conn, b"pingpong!");
    t.check(
        "echoed full chunks",
        mux.output_buffer(conn) == b"pingpong".to_vec(),
        &format!("{:?}", mux.output_buffer(conn)),
    );
    t.check(
        "partial chunk stays on the wire",
        mux.virtual_network_buffer(conn) == b"!".to_vec(),
        "wrong remainder",
    );

    let runs = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let runs = runs.clone();
        mux.exec_later(FnResumable::new(move |_: &TestMultiplexer| {
            runs.fetch_add(1, Ordering::Relaxed);
        }));
    }
    mux.flush_runnables();
    t.check(
        "flush runs every resumable",
        runs.load(Ordering::Relaxed) == 3 && mux.queued() == 0,
        "queue not drained",
    );
}

// ════════════════════════════════════════════════════════════
// Part C: Coordinator
// ════════════════════════════════════════════════════════════

fn test_coordinator(t: &mut TestRunner) {
    t.section("Part C: Coordinator");

    let coord = ScopedCoordinator::new();
    let flag = Arc::new(DisposableFlag::new());
    coord.watch(flag.clone());

    let hits = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let hits = hits.clone();
        coord.schedule(Box::new(move || {
            hits.fetch_add(1, Ordering::Relaxed);
        }));
    }
    let f = flag.clone();
    coord.schedule(Box::new(move || f.dispose()));
    coord.run();

    t.check("all actions ran", hits.load(Ordering::Relaxed) == 3, "missing actions");
    t.check("run ends once disposed", coord.watched() == 0, "still watching");
}

// ════════════════════════════════════════════════════════════

fn main() {
    println!("=== gvstream demo ===");

    let mut t = TestRunner::new();

    test_fused(&mut t);
    test_reactor(&mut t);
    test_coordinator(&mut t);

    t.summary();
    std::process::exit(if t.failed > 0 { 1 } else { 0 });
}
