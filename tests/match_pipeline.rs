//! End-to-end matching scenarios: a simulated timing stream on one side,
//! injected side-channel updates on the other, contributions collected
//! from a channel-backed event-builder sink.

use std::net::{Ipv4Addr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use drp_sidecar::bld::{Bld, BldSource};
use drp_sidecar::dgram::names::{Name, NamesRegistry, ScalarKind, VarDef};
use drp_sidecar::dgram::{DamageFlag, Timestamp, TransitionId, DGRAM_HEADER_SIZE};
use drp_sidecar::eb::{ChannelSink, Contribution};
use drp_sidecar::matcher::{
    BldWorker, MatchDegree, MatchStats, MatchWorker, SideMode, WorkerConfig,
};
use drp_sidecar::pgp::{PgpReader, SimDmaDriver, TIMING_HEADER_SIZE};
use drp_sidecar::pool::{MemPool, PoolCounters, SideChannel, TransitionPool};
use drp_sidecar::queue::SpscQueue;
use drp_sidecar::udp::{encode_frame, parse_frame, EncoderFrame, FRAME_SIZE};

const BUF_SIZE: usize = 512;
const NBUFFERS: usize = 16;
const RECV_TMO: Duration = Duration::from_secs(2);

struct Pipeline {
    driver: SimDmaDriver,
    side: Arc<SideChannel>,
    terminate: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    stats: Arc<MatchStats>,
    counters: Arc<PoolCounters>,
    transitions: Arc<TransitionPool>,
    transition_payload: Arc<Mutex<Vec<u8>>>,
    rx: mpsc::Receiver<Contribution>,
    worker: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Build a two-queue pipeline but do not start the worker yet, so
    /// scenarios can stage updates and triggers deterministically.
    fn new(mode: SideMode, degree: MatchDegree, match_tmo: Duration) -> (Self, PipelineStart) {
        let driver = SimDmaDriver::new(64, TIMING_HEADER_SIZE);
        let mut pool = MemPool::new(NBUFFERS, BUF_SIZE, 8, 4096);
        let counters = pool.counters();
        let transitions = pool.transitions();

        let mut reader = PgpReader::new(Box::new(driver.clone()), 0x1, 0, 1);
        pool.set_mask_bytes(reader.driver_mut(), 0x1, 0)
            .expect("driver handshake");

        let side = Arc::new(SideChannel::new(8, BUF_SIZE - DGRAM_HEADER_SIZE));
        side.startup();
        let evt_queue = Arc::new(SpscQueue::new(NBUFFERS));
        evt_queue.startup();

        let (tx, rx) = mpsc::channel();
        let sink = Box::new(ChannelSink::new(NBUFFERS, tx));

        let terminate = Arc::new(AtomicBool::new(false));
        let running = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(MatchStats::default());
        let transition_payload = Arc::new(Mutex::new(Vec::new()));

        let cfg = WorkerConfig {
            pebble_buf_size: BUF_SIZE,
            max_tr_size: 4096,
            match_tmo,
            degree,
            idle_flush: Duration::from_millis(5),
        };
        let worker = MatchWorker::new(
            pool,
            reader,
            evt_queue,
            Arc::clone(&side),
            sink,
            None,
            Arc::clone(&terminate),
            Arc::clone(&running),
            Arc::clone(&transition_payload),
            Arc::clone(&stats),
            cfg,
            mode,
        );

        (
            Self {
                driver,
                side,
                terminate,
                running,
                stats,
                counters,
                transitions,
                transition_payload,
                rx,
                worker: None,
            },
            PipelineStart { worker },
        )
    }

    fn start(&mut self, start: PipelineStart) {
        let worker = start.worker;
        self.worker = Some(
            std::thread::Builder::new()
                .name("test_worker".to_string())
                .spawn(move || worker.run())
                .expect("spawn worker"),
        );
    }

    fn push_update(&self, seconds: u32, payload: &[u8]) {
        assert!(self.side.push_update(|buf| {
            buf.time = Timestamp::new(seconds, 0);
            buf.payload.extend_from_slice(payload);
        }));
    }

    fn recv(&self) -> Contribution {
        self.rx.recv_timeout(RECV_TMO).expect("contribution")
    }

    fn stop(&mut self) {
        self.transitions.shutdown();
        self.terminate.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            worker.join().expect("worker exits");
        }
    }
}

struct PipelineStart {
    worker: MatchWorker,
}

#[test]
fn test_s1_perfect_match() {
    let (mut p, start) = Pipeline::new(
        SideMode::Pv,
        MatchDegree::Strict,
        Duration::from_millis(1500),
    );
    p.push_update(1000, &[7]);
    p.push_update(2000, &[9]);
    p.driver.push_l1(Timestamp::new(1000, 0), 0xa);
    p.driver.push_l1(Timestamp::new(2000, 0), 0xb);
    p.start(start);

    let first = p.recv();
    assert_eq!(first.time, Timestamp::new(1000, 0));
    assert!(first.damage.is_clean());
    assert_eq!(first.payload, vec![7]);

    let second = p.recv();
    assert_eq!(second.time, Timestamp::new(2000, 0));
    assert!(second.damage.is_clean());
    assert_eq!(second.payload, vec![9]);

    assert_eq!(p.stats.n_match.load(Ordering::Relaxed), 2);
    p.stop();
}

#[test]
fn test_s2_update_too_young() {
    let (mut p, start) = Pipeline::new(
        SideMode::Pv,
        MatchDegree::Strict,
        Duration::from_millis(1500),
    );
    p.push_update(2000, &[9]);
    p.driver.push_l1(Timestamp::new(1000, 0), 0xa);
    p.driver.push_l1(Timestamp::new(2000, 0), 0xb);
    p.start(start);

    let first = p.recv();
    assert_eq!(first.time, Timestamp::new(1000, 0));
    assert!(first.damage.contains(DamageFlag::MissingData));
    assert!(first.payload.is_empty());

    let second = p.recv();
    assert_eq!(second.time, Timestamp::new(2000, 0));
    assert!(second.damage.is_clean());
    assert_eq!(second.payload, vec![9]);

    assert_eq!(p.stats.n_empty.load(Ordering::Relaxed), 1);
    p.stop();
}

#[test]
fn test_s3_update_too_old_then_match() {
    let (mut p, start) = Pipeline::new(
        SideMode::Pv,
        MatchDegree::Strict,
        Duration::from_millis(1500),
    );
    p.push_update(1000, &[7]);
    p.push_update(2000, &[9]);
    p.driver.push_l1(Timestamp::new(2000, 0), 0xb);
    p.start(start);

    let only = p.recv();
    assert_eq!(only.time, Timestamp::new(2000, 0));
    assert!(only.damage.is_clean());
    assert_eq!(only.payload, vec![9]);

    assert_eq!(p.stats.n_too_old.load(Ordering::Relaxed), 1);
    assert_eq!(p.stats.n_match.load(Ordering::Relaxed), 1);
    p.stop();
}

#[test]
fn test_s6_timeout_flushes_dataless_trigger() {
    let (mut p, start) = Pipeline::new(
        SideMode::Pv,
        MatchDegree::Strict,
        Duration::from_millis(100),
    );
    p.driver.push_l1(Timestamp::new(5000, 0), 0xa);
    p.start(start);

    let out = p.recv();
    assert_eq!(out.time, Timestamp::new(5000, 0));
    assert!(out.damage.contains(DamageFlag::TimedOut));
    assert_eq!(p.stats.n_timed_out.load(Ordering::Relaxed), 1);
    p.stop();
}

#[test]
fn test_transitions_pass_through_with_phase1_payload() {
    let (mut p, start) = Pipeline::new(
        SideMode::Pv,
        MatchDegree::Strict,
        Duration::from_millis(1500),
    );
    *p.transition_payload.lock() = b"configure-names".to_vec();
    p.driver
        .push_service(TransitionId::Configure, Timestamp::new(10, 0), 1);
    p.driver
        .push_service(TransitionId::Enable, Timestamp::new(11, 0), 2);
    p.start(start);

    let configure = p.recv();
    assert_eq!(configure.service, TransitionId::Configure);
    assert_eq!(configure.payload, b"configure-names".to_vec());

    let enable = p.recv();
    assert_eq!(enable.service, TransitionId::Enable);
    // The Enable transition switched the running flag on.
    assert!(p.running.load(Ordering::Relaxed));
    p.stop();
}

#[test]
fn test_emission_timestamps_monotone() {
    let (mut p, start) = Pipeline::new(
        SideMode::Pv,
        MatchDegree::Strict,
        Duration::from_millis(1500),
    );
    p.push_update(2, &[2]);
    p.push_update(4, &[4]);
    p.driver
        .push_service(TransitionId::Configure, Timestamp::new(1, 0), 1);
    p.driver.push_l1(Timestamp::new(2, 0), 2);
    p.driver
        .push_service(TransitionId::SlowUpdate, Timestamp::new(3, 0), 3);
    p.driver.push_l1(Timestamp::new(4, 0), 4);
    p.start(start);

    let mut last = Timestamp::default();
    for _ in 0..4 {
        let c = p.recv();
        assert!(c.time >= last, "{} < {last}", c.time);
        last = c.time;
    }
    p.stop();
}

#[test]
fn test_one_contribution_per_trigger_and_pool_drains() {
    let (mut p, start) = Pipeline::new(
        SideMode::Pv,
        MatchDegree::Strict,
        Duration::from_millis(100),
    );
    for i in 1..=5u32 {
        p.push_update(i, &[i as u8]);
        p.driver.push_l1(Timestamp::new(i, 0), u64::from(i));
    }
    p.start(start);

    for _ in 0..5 {
        p.recv();
    }
    assert!(p.rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert_eq!(p.stats.n_events.load(Ordering::Relaxed), 5);

    p.stop();
    // After shutdown every pebble slot and side buffer is back home.
    assert_eq!(p.counters.in_use(), 0);
    assert_eq!(p.counters.dma_in_use(), 0);
    assert!(p.side.queue.guess_size() == 0);
}

#[test]
fn test_s5_udp_stuck_counter_end_to_end() {
    let (mut p, start) = Pipeline::new(SideMode::Udp, MatchDegree::None, Duration::from_millis(100));

    // Frames 5, 6, 6, 7 as the encoder receiver would park them: the
    // duplicate carries OutOfOrder damage, later frames keep the latch.
    let clean = |count: u16, value: u32| {
        let mut f = EncoderFrame::synthesized(count);
        f.channel.encoder_value = value;
        f
    };
    for (count, value, out_of_order) in
        [(5u16, 50u32, false), (6, 60, false), (6, 60, true), (7, 70, true)]
    {
        assert!(p.side.push_update(|buf| {
            buf.time = Timestamp::default();
            buf.payload
                .extend_from_slice(&encode_frame(&clean(count, value)));
            if out_of_order {
                buf.damage.raise(DamageFlag::OutOfOrder);
            }
        }));
    }
    for i in 1..=4u32 {
        p.driver.push_l1(Timestamp::new(1000 + i, 0), u64::from(i));
    }
    p.start(start);

    let mut damages = Vec::new();
    for _ in 0..4 {
        let c = p.recv();
        let frame = parse_frame(&c.payload).expect("encoder frame payload");
        damages.push((frame.frame_count, c.damage));
    }
    assert_eq!(damages[0].0, 5);
    assert!(damages[0].1.is_clean());
    assert_eq!(damages[1].0, 6);
    assert!(damages[1].1.is_clean());
    assert_eq!(damages[2].0, 6);
    assert!(damages[2].1.contains(DamageFlag::OutOfOrder));
    assert_eq!(damages[3].0, 7);
    p.stop();
}

#[test]
fn test_udp_disable_sweeps_pending_triggers() {
    let (mut p, start) = Pipeline::new(SideMode::Udp, MatchDegree::None, Duration::from_secs(3600));

    // Two triggers with no encoder data, then Disable: both are swept out
    // with TimedOut damage before the Disable transition itself.
    p.driver.push_l1(Timestamp::new(100, 0), 1);
    p.driver.push_l1(Timestamp::new(101, 0), 2);
    p.driver
        .push_service(TransitionId::Disable, Timestamp::new(102, 0), 3);
    p.start(start);

    let a = p.recv();
    assert!(a.damage.contains(DamageFlag::TimedOut));
    let b = p.recv();
    assert!(b.damage.contains(DamageFlag::TimedOut));
    let disable = p.recv();
    assert_eq!(disable.service, TransitionId::Disable);
    assert_eq!(p.stats.n_timed_out.load(Ordering::Relaxed), 2);
    p.stop();
}

// ---------------------------------------------------------------------------
// BLD worker end to end
// ---------------------------------------------------------------------------

fn bld_packet(pulse_id: u64, timestamp: u64, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&pulse_id.to_le_bytes());
    buf.extend_from_slice(&timestamp.to_le_bytes());
    buf.extend_from_slice(&0xb1du32.to_le_bytes());
    buf.extend_from_slice(&0u64.to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

#[test]
fn test_s4_bld_pulse_id_jump_still_emits() {
    let payload_size = 8usize;
    let jumps = Arc::new(AtomicU64::new(0));

    // Local socket pair standing in for the multicast group.
    let probe = UdpSocket::bind("127.0.0.1:0").expect("probe");
    let port = probe.local_addr().expect("addr").port();
    drop(probe);
    let receiver = Bld::open(
        Ipv4Addr::LOCALHOST,
        port,
        Ipv4Addr::LOCALHOST,
        payload_size,
        0,
        Arc::clone(&jumps),
    )
    .expect("bld receiver");
    let sender = UdpSocket::bind("127.0.0.1:0").expect("sender");
    sender.connect(("127.0.0.1", port)).expect("connect");

    // Base pulseId 100, then a jump to 105 where +1 was expected.
    sender
        .send(&bld_packet(100, 1000, &[1u8; 8]))
        .expect("send");
    sender
        .send(&bld_packet(105, 2000, &[2u8; 8]))
        .expect("send");
    std::thread::sleep(Duration::from_millis(30));

    let mut var_def = VarDef::default();
    var_def.push(Name::scalar("value", ScalarKind::F64));
    let sources = vec![BldSource {
        det_name: "gmd".to_string(),
        det_type: "gmd".to_string(),
        det_id: "gmd".to_string(),
        var_def,
        receiver,
    }];

    let driver = SimDmaDriver::new(64, TIMING_HEADER_SIZE);
    let mut pool = MemPool::new(NBUFFERS, BUF_SIZE, 8, 4096);
    let counters = pool.counters();
    let mut reader = PgpReader::new(Box::new(driver.clone()), 0x1, 0, 1);
    pool.set_mask_bytes(reader.driver_mut(), 0x1, 0)
        .expect("driver handshake");

    let (tx, rx) = mpsc::channel();
    let terminate = Arc::new(AtomicBool::new(false));
    let stats = Arc::new(MatchStats::default());
    let names = Arc::new(Mutex::new(NamesRegistry::default()));

    driver.push_l1(Timestamp::from_value(1000), 100);
    driver.push_l1(Timestamp::from_value(2000), 105);

    let worker = BldWorker::new(
        pool,
        reader,
        sources,
        Box::new(ChannelSink::new(NBUFFERS, tx)),
        None,
        Arc::clone(&terminate),
        Arc::new(AtomicBool::new(true)),
        Arc::new(Mutex::new(Vec::new())),
        Arc::clone(&names),
        Arc::clone(&stats),
        WorkerConfig {
            pebble_buf_size: BUF_SIZE,
            max_tr_size: 4096,
            match_tmo: Duration::from_millis(1500),
            degree: MatchDegree::Strict,
            idle_flush: Duration::from_millis(5),
        },
    );
    let handle = std::thread::spawn(move || worker.run());

    let first = rx.recv_timeout(RECV_TMO).expect("first contribution");
    assert_eq!(first.time.value(), 1000);
    assert!(first.damage.is_clean());
    assert_eq!(first.payload, vec![1u8; 8]);

    let second = rx.recv_timeout(RECV_TMO).expect("second contribution");
    assert_eq!(second.time.value(), 2000);
    assert!(second.damage.is_clean());
    assert_eq!(second.payload, vec![2u8; 8]);

    // The pulse-id deviation was observed (baseline 100, then +5).
    assert!(jumps.load(Ordering::Relaxed) >= 1);
    assert_eq!(stats.n_match.load(Ordering::Relaxed), 2);

    terminate.store(true, Ordering::Release);
    handle.join().expect("worker exits");
    assert_eq!(counters.in_use(), 0);
    assert_eq!(counters.dma_in_use(), 0);
}

#[test]
fn test_udp_frame_payload_fits_pebble() {
    // Guard on the geometry the UDP pipeline assumes.
    assert!(FRAME_SIZE + DGRAM_HEADER_SIZE <= BUF_SIZE);
}

// ---------------------------------------------------------------------------
// Full lifecycle through the control state machine
// ---------------------------------------------------------------------------

#[test]
fn test_pv_detector_full_lifecycle_drains_to_zero() {
    use drp_sidecar::config::{Mode, Parameters};
    use drp_sidecar::control::detectors::{DriverFactory, PvDetector, SinkFactory};
    use drp_sidecar::control::{App, ControlRequest, Notifier};
    use drp_sidecar::dgram::names::ScalarKind as SK;
    use drp_sidecar::eb::EbSink;
    use drp_sidecar::pgp::DmaDriver;
    use drp_sidecar::pv::{PvParams, SimPvClient};

    let para = Parameters::build(
        Mode::Pv,
        3,
        0x1,
        "/dev/datadev_0",
        "tst_gauge_0",
        "localhost",
        "tst",
        "",
        std::collections::HashMap::new(),
        0,
    )
    .expect("parameters");

    let driver = SimDmaDriver::new(64, TIMING_HEADER_SIZE);
    let driver_handle = driver.clone();
    let driver_factory: DriverFactory =
        Box::new(move || Box::new(driver_handle.clone()) as Box<dyn DmaDriver>);

    let (tx, rx) = mpsc::channel();
    let sink_factory: SinkFactory =
        Box::new(move || Box::new(ChannelSink::new(16, tx.clone())) as Box<dyn EbSink>);

    let client = SimPvClient::new(
        "TST:GAUGE:01",
        Some(PvParams {
            scalar: SK::I32,
            nelem: 1,
            rank: 0,
        }),
    );

    let det = PvDetector::new(
        para,
        client.clone(),
        Notifier::disabled(),
        driver_factory,
        sink_factory,
        Box::new(|| None),
    )
    .expect("detector");
    let mut app = App::new(det);

    let req = |key: &str| ControlRequest {
        key: key.to_string(),
        msg_id: "1".to_string(),
        body: serde_json::Value::Null,
    };
    assert!(app.handle(&req("connect")).is_ok());
    assert!(app.handle(&req("configure")).is_ok());

    // Enable crosses the timing stream and arms the update path.
    let t0 = Timestamp::now();
    driver.push_service(TransitionId::Enable, t0, 1);
    let enable = rx.recv_timeout(RECV_TMO).expect("enable transition");
    assert_eq!(enable.service, TransitionId::Enable);

    // One update, one trigger, one clean contribution.
    let t1 = Timestamp::now();
    client.set_value(&7i32.to_le_bytes());
    client.update(t1);
    std::thread::sleep(Duration::from_millis(10));
    driver.push_l1(t1, 2);

    let event = rx.recv_timeout(RECV_TMO).expect("event contribution");
    assert_eq!(event.service, TransitionId::L1Accept);
    assert_eq!(event.time, t1);
    assert!(event.damage.is_clean());
    assert_eq!(event.payload, 7i32.to_le_bytes().to_vec());

    assert!(app.handle(&req("unconfigure")).is_ok());
    assert!(app.handle(&req("disconnect")).is_ok());

    // Every buffer returned home.
    assert_eq!(app.detector().in_use(), 0);
}
