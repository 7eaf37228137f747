//! Per-mode detector lifecycles: what Connect/Configure/Enable actually do
//! for the BLD, PV and UDP-encoder contributors.
//!
//! Each Configure builds the buffer pool and the timing reader, spawns the
//! matching thread, and starts a metrics snapshot thread; Unconfigure
//! tears all of it down and drains every queue.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::bld::{BldDescriptorSource, BldSource, BldSpec};
use crate::config::Parameters;
use crate::control::{ChunkInfo, Detector, Notifier, RunInfo};
use crate::dgram::names::{names_index, Name, NamesEntry, NamesRegistry, ScalarKind, VarDef};
use crate::eb::{EbSink, TriggerPrimitive};
use crate::matcher::{
    idle_flush_period, BldWorker, MatchStats, MatchWorker, SideMode, WorkerConfig,
};
use crate::metrics::{DrpMetrics, MetricSources};
use crate::pgp::{DmaDriver, PgpReader};
use crate::pool::{MemPool, PoolCounters, SideChannel, TransitionPool};
use crate::pv::{PvClient, PvMonitor};
use crate::queue::SpscQueue;
use crate::udp::{LoopbackSender, UdpReceiver};

/// Builds the DMA driver at Configure; the production driver is opaque.
pub type DriverFactory = Box<dyn FnMut() -> Box<dyn DmaDriver> + Send>;

/// Builds the event-builder sink at Configure.
pub type SinkFactory = Box<dyn FnMut() -> Box<dyn EbSink> + Send>;

/// Builds the optional trigger primitive at Configure.
pub type TriggerFactory = Box<dyn FnMut() -> Option<Box<dyn TriggerPrimitive>> + Send>;

/// Resolves the multicast parameters of a PV-described BLD service.
pub type DescriptorFactory =
    Box<dyn FnMut(&str, &str, &str) -> Box<dyn BldDescriptorSource> + Send>;

const METRICS_PERIOD: Duration = Duration::from_secs(1);

fn spawn_metrics_updater(
    metrics: Arc<DrpMetrics>,
    sources: MetricSources,
    terminate: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("drp_metrics".to_string())
        .spawn(move || {
            while !terminate.load(Ordering::Relaxed) {
                metrics.update(&sources);
                std::thread::sleep(METRICS_PERIOD);
            }
            // One final snapshot so post-shutdown gauges are accurate.
            metrics.update(&sources);
        })
        .expect("spawning metrics thread")
}

fn connect_info(para: &Parameters) -> Value {
    json!({
        "nic_ip": para.nic_ip(),
        "buf_count": para.pebble_buf_count().unwrap_or(0),
        "buf_size": para.pebble_buf_size().unwrap_or(0),
        "max_tr_size": para.max_tr_size,
    })
}

/// State shared by the three detector flavors.
struct Common {
    para: Parameters,
    notifier: Notifier,
    metrics: Arc<DrpMetrics>,
    terminate: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    transition_payload: Arc<Mutex<Vec<u8>>>,
    names: Arc<Mutex<NamesRegistry>>,
    driver_factory: DriverFactory,
    sink_factory: SinkFactory,
    trigger_factory: TriggerFactory,
    stats: Arc<MatchStats>,
    pool_counters: Option<Arc<PoolCounters>>,
    transitions: Option<Arc<TransitionPool>>,
    worker: Option<JoinHandle<()>>,
    metrics_worker: Option<JoinHandle<()>>,
}

impl Common {
    fn new(
        para: Parameters,
        notifier: Notifier,
        driver_factory: DriverFactory,
        sink_factory: SinkFactory,
        trigger_factory: TriggerFactory,
    ) -> anyhow::Result<Self> {
        let metrics = Arc::new(DrpMetrics::new(
            &para.instrument,
            para.partition,
            &para.det_name,
            para.det_segment,
            &para.alias,
        )?);
        Ok(Self {
            para,
            notifier,
            metrics,
            terminate: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            transition_payload: Arc::new(Mutex::new(Vec::new())),
            names: Arc::new(Mutex::new(NamesRegistry::default())),
            driver_factory,
            sink_factory,
            trigger_factory,
            stats: Arc::new(MatchStats::default()),
            pool_counters: None,
            transitions: None,
            worker: None,
            metrics_worker: None,
        })
    }

    /// Build pool + reader and run the driver handshake.
    fn build_pool_and_reader(&mut self) -> Result<(MemPool, PgpReader), String> {
        let nbuffers = self.para.pebble_buf_count().map_err(|e| e.to_string())?;
        let buf_size = self.para.pebble_buf_size().map_err(|e| e.to_string())?;
        let mut pool = MemPool::new(
            nbuffers,
            buf_size,
            self.para.n_tr_buffers(),
            self.para.max_tr_size,
        );
        self.pool_counters = Some(pool.counters());
        self.transitions = Some(pool.transitions());

        let driver = (self.driver_factory)();
        let mut reader = PgpReader::new(
            driver,
            self.para.lane_mask,
            self.para.det_segment,
            self.para.rog_mask,
        );
        pool.set_mask_bytes(reader.driver_mut(), self.para.lane_mask, 0)
            .map_err(|e| format!("failed to allocate lane/vc: {e}"))?;

        Ok((pool, reader))
    }

    fn worker_config(&self, max_entries: usize) -> Result<WorkerConfig, String> {
        Ok(WorkerConfig {
            pebble_buf_size: self.para.pebble_buf_size().map_err(|e| e.to_string())?,
            max_tr_size: self.para.max_tr_size,
            match_tmo: self.para.match_tmo().map_err(|e| e.to_string())?,
            degree: self.para.match_degree,
            idle_flush: idle_flush_period(max_entries),
        })
    }

    /// Stop the worker and metrics threads; blocked transition allocators
    /// are released first so the join cannot hang.
    fn stop_threads(&mut self) {
        if let Some(tr) = &self.transitions {
            tr.shutdown();
        }
        self.terminate.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        if let Some(metrics) = self.metrics_worker.take() {
            let _ = metrics.join();
        }
        self.names.lock().clear();
        self.running.store(false, Ordering::Relaxed);
    }

    fn in_use(&self) -> i64 {
        self.pool_counters.as_ref().map(|c| c.in_use()).unwrap_or(0)
    }

    /// Stage the phase-1 payload the worker copies into the next
    /// transition datagram.
    fn set_transition_payload(&self, bytes: Vec<u8>) {
        *self.transition_payload.lock() = bytes;
    }

    fn stage_run_info(&self, run_info: &RunInfo) {
        self.set_transition_payload(serde_json::to_vec(run_info).unwrap_or_default());
    }

    fn stage_chunk_info(&self, chunk: Option<&ChunkInfo>) {
        match chunk {
            Some(chunk) => {
                debug!(filename = %chunk.filename, chunk_id = chunk.chunk_id, "chunk rotation");
                self.set_transition_payload(serde_json::to_vec(chunk).unwrap_or_default());
            }
            None => self.set_transition_payload(Vec::new()),
        }
    }
}

// ---------------------------------------------------------------------------
// PV mode
// ---------------------------------------------------------------------------

/// Contributor fronting one EPICS process variable.
pub struct PvDetector {
    common: Common,
    client: Arc<dyn PvClient>,
    monitor: Option<Arc<PvMonitor>>,
    side: Option<Arc<SideChannel>>,
    evt_queue: Option<Arc<SpscQueue<u32>>>,
}

impl PvDetector {
    pub fn new(
        para: Parameters,
        client: Arc<dyn PvClient>,
        notifier: Notifier,
        driver_factory: DriverFactory,
        sink_factory: SinkFactory,
        trigger_factory: TriggerFactory,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            common: Common::new(para, notifier, driver_factory, sink_factory, trigger_factory)?,
            client,
            monitor: None,
            side: None,
            evt_queue: None,
        })
    }

    pub fn metrics(&self) -> Arc<DrpMetrics> {
        Arc::clone(&self.common.metrics)
    }

    pub fn in_use(&self) -> i64 {
        self.common.in_use()
    }

    pub fn side_channel(&self) -> Option<Arc<SideChannel>> {
        self.side.clone()
    }
}

impl Detector for PvDetector {
    fn connect(&mut self) -> Result<Value, String> {
        let para = &self.common.para;
        let nbuffers = para.pebble_buf_count().map_err(|e| e.to_string())?;
        let buf_size = para.pebble_buf_size().map_err(|e| e.to_string())?;
        let first_dim = para.first_dim().map_err(|e| e.to_string())?;

        // Update buffers hold what the pebble slot can carry as payload.
        let payload_capacity = buf_size.saturating_sub(crate::dgram::DGRAM_HEADER_SIZE);
        let side = Arc::new(SideChannel::new(nbuffers, payload_capacity));
        let monitor = PvMonitor::new(
            Arc::clone(&self.client),
            Arc::clone(&side),
            Arc::clone(&self.common.running),
            self.common.notifier.clone(),
            &para.alias,
            "value",
            first_dim,
            payload_capacity,
        );
        monitor
            .start()
            .map_err(|e| format!("failed to create PV monitor for {}: {e}", self.client.name()))?;

        self.side = Some(side);
        self.monitor = Some(monitor);
        Ok(connect_info(para))
    }

    fn disconnect(&mut self) {
        self.monitor = None;
        self.side = None;
    }

    fn configure(&mut self) -> Result<(), String> {
        info!("PV configure");
        let monitor = self.monitor.as_ref().ok_or("configure before connect")?;
        let side = self.side.as_ref().ok_or("configure before connect")?.clone();

        // Resolve the payload schema (3 s budget) and build the dictionary.
        let (var_def, payload_size) = monitor.get_var_def().map_err(|e| e.to_string())?;
        let buf_size = self
            .common
            .para
            .pebble_buf_size()
            .map_err(|e| e.to_string())?;
        if payload_size > buf_size {
            tracing::warn!(
                payload_size,
                buf_size,
                pv = monitor.name(),
                "pebble buffer smaller than PV payload, data will be truncated",
            );
        }
        {
            let mut names = self.common.names.lock();
            names.insert(
                names_index::BASE,
                NamesEntry {
                    det_name: self.common.para.det_name.clone(),
                    det_type: self.common.para.det_type.clone(),
                    det_id: self.common.para.serial.clone(),
                    var_def,
                },
            );
            // Dictionary of PV identity, keyed per detector name.
            let mut info_def = VarDef::default();
            info_def.push(Name::array("keys", ScalarKind::CharStr, 1));
            info_def.push(Name::array(&self.common.para.det_name, ScalarKind::CharStr, 1));
            names.insert(
                names_index::BASE + 1,
                NamesEntry {
                    det_name: "epicsinfo".to_string(),
                    det_type: "epicsinfo".to_string(),
                    det_id: monitor.name().to_string(),
                    var_def: info_def,
                },
            );
        }

        self.common
            .set_transition_payload(self.common.names.lock().dump());

        let (pool, reader) = self.common.build_pool_and_reader()?;
        let nbuffers = pool.nbuffers();

        side.startup();
        let evt_queue = Arc::new(SpscQueue::new(nbuffers));
        evt_queue.startup();
        self.evt_queue = Some(Arc::clone(&evt_queue));

        let sink = (self.common.sink_factory)();
        let cfg = self.common.worker_config(sink.max_entries())?;
        let trigger = (self.common.trigger_factory)();

        self.common.terminate.store(false, Ordering::Release);
        let pgp_counters = reader.counters();
        let worker = MatchWorker::new(
            pool,
            reader,
            Arc::clone(&evt_queue),
            Arc::clone(&side),
            sink,
            trigger,
            Arc::clone(&self.common.terminate),
            Arc::clone(&self.common.running),
            Arc::clone(&self.common.transition_payload),
            Arc::clone(&self.common.stats),
            cfg,
            SideMode::Pv,
        );
        self.common.worker = Some(
            std::thread::Builder::new()
                .name("drp_worker".to_string())
                .spawn(move || worker.run())
                .expect("spawning worker thread"),
        );

        let sources = MetricSources {
            stats: Some(Arc::clone(&self.common.stats)),
            pgp: Some(pgp_counters),
            pool: self.common.pool_counters.clone(),
            side: Some(side),
            evt_queue: Some(evt_queue),
            bld_jumps: None,
        };
        self.common.metrics_worker = Some(spawn_metrics_updater(
            Arc::clone(&self.common.metrics),
            sources,
            Arc::clone(&self.common.terminate),
        ));

        Ok(())
    }

    fn unconfigure(&mut self) {
        self.common.stop_threads();
        if let Some(q) = self.evt_queue.take() {
            q.shutdown();
        }
        if let Some(side) = &self.side {
            side.shutdown();
        }
        if let Some(monitor) = &self.monitor {
            monitor.clear();
        }
    }

    fn begin_run(&mut self, run_info: &RunInfo) -> Result<(), String> {
        info!(
            experiment = %run_info.experiment,
            run = run_info.run_number,
            "begin run",
        );
        self.common.stage_run_info(run_info);
        Ok(())
    }

    fn end_run(&mut self) -> Result<(), String> {
        self.common.set_transition_payload(Vec::new());
        Ok(())
    }

    fn enable(&mut self, chunk: Option<&ChunkInfo>) -> Result<(), String> {
        self.common.stage_chunk_info(chunk);
        Ok(())
    }

    fn disable(&mut self) {}
}

// ---------------------------------------------------------------------------
// UDP encoder mode
// ---------------------------------------------------------------------------

/// Contributor fronting one UDP encoder box.
pub struct UdpDetector {
    common: Common,
    side: Option<Arc<SideChannel>>,
    evt_queue: Option<Arc<SpscQueue<u32>>>,
    receiver: Option<UdpReceiver>,
    receiver_thread: Option<JoinHandle<UdpReceiver>>,
    loopback: Arc<Mutex<Option<LoopbackSender>>>,
}

impl UdpDetector {
    pub fn new(
        para: Parameters,
        notifier: Notifier,
        driver_factory: DriverFactory,
        sink_factory: SinkFactory,
        trigger_factory: TriggerFactory,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            common: Common::new(para, notifier, driver_factory, sink_factory, trigger_factory)?,
            side: None,
            evt_queue: None,
            receiver: None,
            receiver_thread: None,
            loopback: Arc::new(Mutex::new(None)),
        })
    }

    pub fn metrics(&self) -> Arc<DrpMetrics> {
        Arc::clone(&self.common.metrics)
    }

    pub fn in_use(&self) -> i64 {
        self.common.in_use()
    }
}

impl Detector for UdpDetector {
    fn connect(&mut self) -> Result<Value, String> {
        let para = &self.common.para;
        let nbuffers = para.pebble_buf_count().map_err(|e| e.to_string())?;
        let side = Arc::new(SideChannel::new(nbuffers.min(8), crate::udp::FRAME_SIZE));

        let (receiver, loopback) = UdpReceiver::new(
            para.loopback_port,
            Arc::clone(&side),
            Arc::clone(&self.common.terminate),
            self.common.notifier.clone(),
            &para.alias,
        )
        .map_err(|e| format!("failed to create UDP receiver: {e}"))?;

        *self.loopback.lock() = loopback;
        self.receiver = Some(receiver);
        self.side = Some(side);
        Ok(connect_info(para))
    }

    fn disconnect(&mut self) {
        self.receiver = None;
        self.side = None;
        *self.loopback.lock() = None;
    }

    fn configure(&mut self) -> Result<(), String> {
        info!("UDP encoder configure");
        let mut receiver = self.receiver.take().ok_or("configure before connect")?;
        let side = self.side.as_ref().ok_or("configure before connect")?.clone();

        {
            let mut names = self.common.names.lock();
            names.insert(
                names_index::BASE,
                NamesEntry {
                    det_name: self.common.para.det_name.clone(),
                    det_type: self.common.para.det_type.clone(),
                    det_id: self.common.para.serial.clone(),
                    var_def: crate::udp::raw_var_def(),
                },
            );
        }
        self.common
            .set_transition_payload(self.common.names.lock().dump());

        let (pool, reader) = self.common.build_pool_and_reader()?;
        let nbuffers = pool.nbuffers();

        side.startup();
        let evt_queue = Arc::new(SpscQueue::new(nbuffers));
        evt_queue.startup();
        self.evt_queue = Some(Arc::clone(&evt_queue));

        self.common.terminate.store(false, Ordering::Release);

        // Drop anything queued while unconfigured, then start receiving.
        receiver
            .reset()
            .map_err(|e| format!("failed to drain UDP socket: {e}"))?;
        self.receiver_thread = Some(receiver.spawn());

        let sink = (self.common.sink_factory)();
        let cfg = self.common.worker_config(sink.max_entries())?;
        let trigger = (self.common.trigger_factory)();

        let pgp_counters = reader.counters();
        let mut worker = MatchWorker::new(
            pool,
            reader,
            Arc::clone(&evt_queue),
            Arc::clone(&side),
            sink,
            trigger,
            Arc::clone(&self.common.terminate),
            Arc::clone(&self.common.running),
            Arc::clone(&self.common.transition_payload),
            Arc::clone(&self.common.stats),
            cfg,
            SideMode::Udp,
        );
        if self.common.para.loopback_port.is_some() {
            let loopback = Arc::clone(&self.loopback);
            worker.set_on_l1(Box::new(move || {
                if let Some(lb) = loopback.lock().as_mut() {
                    lb.send();
                }
            }));
        }
        self.common.worker = Some(
            std::thread::Builder::new()
                .name("drp_worker".to_string())
                .spawn(move || worker.run())
                .expect("spawning worker thread"),
        );

        let sources = MetricSources {
            stats: Some(Arc::clone(&self.common.stats)),
            pgp: Some(pgp_counters),
            pool: self.common.pool_counters.clone(),
            side: Some(side),
            evt_queue: Some(evt_queue),
            bld_jumps: None,
        };
        self.common.metrics_worker = Some(spawn_metrics_updater(
            Arc::clone(&self.common.metrics),
            sources,
            Arc::clone(&self.common.terminate),
        ));

        Ok(())
    }

    fn unconfigure(&mut self) {
        self.common.stop_threads();
        if let Some(handle) = self.receiver_thread.take() {
            if let Ok(receiver) = handle.join() {
                self.receiver = Some(receiver);
            }
        }
        if let Some(q) = self.evt_queue.take() {
            q.shutdown();
        }
        if let Some(side) = &self.side {
            side.shutdown();
        }
    }

    fn begin_run(&mut self, run_info: &RunInfo) -> Result<(), String> {
        info!(
            experiment = %run_info.experiment,
            run = run_info.run_number,
            "begin run",
        );
        self.common.stage_run_info(run_info);
        Ok(())
    }

    fn end_run(&mut self) -> Result<(), String> {
        self.common.set_transition_payload(Vec::new());
        Ok(())
    }

    fn enable(&mut self, chunk: Option<&ChunkInfo>) -> Result<(), String> {
        self.common.stage_chunk_info(chunk);
        Ok(())
    }

    fn disable(&mut self) {
        // Pending L1Accepts are swept with TimedOut damage by the worker
        // when the Disable transition crosses the timing stream.
    }
}

// ---------------------------------------------------------------------------
// BLD mode
// ---------------------------------------------------------------------------

/// Contributor fronting a set of beam-line data multicast services.
pub struct BldDetector {
    common: Common,
    specs: Vec<BldSpec>,
    descriptor_factory: Option<DescriptorFactory>,
    interface: Option<Ipv4Addr>,
    jumps: Arc<AtomicU64>,
}

impl BldDetector {
    pub fn new(
        para: Parameters,
        specs: Vec<BldSpec>,
        notifier: Notifier,
        driver_factory: DriverFactory,
        sink_factory: SinkFactory,
        trigger_factory: TriggerFactory,
        descriptor_factory: Option<DescriptorFactory>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            common: Common::new(para, notifier, driver_factory, sink_factory, trigger_factory)?,
            specs,
            descriptor_factory,
            interface: None,
            jumps: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn metrics(&self) -> Arc<DrpMetrics> {
        Arc::clone(&self.common.metrics)
    }

    pub fn in_use(&self) -> i64 {
        self.common.in_use()
    }
}

impl Detector for BldDetector {
    fn connect(&mut self) -> Result<Value, String> {
        let interface = self
            .common
            .para
            .interface_addr()
            .map_err(|e| e.to_string())?;
        self.interface = Some(interface);
        Ok(connect_info(&self.common.para))
    }

    fn disconnect(&mut self) {
        self.interface = None;
    }

    fn configure(&mut self) -> Result<(), String> {
        info!("BLD configure");
        let interface = self.interface.ok_or("configure before connect")?;
        // The per-source dictionary is built when the Configure transition
        // crosses the timing stream; the staged payload starts empty.
        self.common.set_transition_payload(Vec::new());

        let mut sources = Vec::with_capacity(self.specs.len());
        for spec in &self.specs {
            let source = match spec {
                BldSpec::Named(name) => {
                    BldSource::from_name(name, interface, Arc::clone(&self.jumps))
                        .map_err(|e| e.to_string())?
                }
                BldSpec::Pva {
                    det_name,
                    det_type,
                    det_id,
                } => {
                    let factory = self
                        .descriptor_factory
                        .as_mut()
                        .ok_or("no descriptor source available for PV-described BLD")?;
                    let descriptor = factory(det_name, det_type, det_id);
                    BldSource::from_descriptor(
                        det_name,
                        det_type,
                        det_id,
                        descriptor.as_ref(),
                        interface,
                        Arc::clone(&self.jumps),
                    )
                    .map_err(|e| e.to_string())?
                }
            };
            sources.push(source);
        }

        let (pool, reader) = self.common.build_pool_and_reader()?;
        let sink = (self.common.sink_factory)();
        let cfg = self.common.worker_config(sink.max_entries())?;
        let trigger = (self.common.trigger_factory)();

        self.common.terminate.store(false, Ordering::Release);
        let pgp_counters = reader.counters();
        let worker = BldWorker::new(
            pool,
            reader,
            sources,
            sink,
            trigger,
            Arc::clone(&self.common.terminate),
            Arc::clone(&self.common.running),
            Arc::clone(&self.common.transition_payload),
            Arc::clone(&self.common.names),
            Arc::clone(&self.common.stats),
            cfg,
        );
        self.common.worker = Some(
            std::thread::Builder::new()
                .name("drp_worker".to_string())
                .spawn(move || worker.run())
                .expect("spawning worker thread"),
        );

        let sources = MetricSources {
            stats: Some(Arc::clone(&self.common.stats)),
            pgp: Some(pgp_counters),
            pool: self.common.pool_counters.clone(),
            side: None,
            evt_queue: None,
            bld_jumps: Some(Arc::clone(&self.jumps)),
        };
        self.common.metrics_worker = Some(spawn_metrics_updater(
            Arc::clone(&self.common.metrics),
            sources,
            Arc::clone(&self.common.terminate),
        ));

        Ok(())
    }

    fn unconfigure(&mut self) {
        self.common.stop_threads();
    }

    fn begin_run(&mut self, run_info: &RunInfo) -> Result<(), String> {
        info!(
            experiment = %run_info.experiment,
            run = run_info.run_number,
            "begin run",
        );
        self.common.stage_run_info(run_info);
        Ok(())
    }

    fn end_run(&mut self) -> Result<(), String> {
        self.common.set_transition_payload(Vec::new());
        Ok(())
    }

    fn enable(&mut self, chunk: Option<&ChunkInfo>) -> Result<(), String> {
        self.common.stage_chunk_info(chunk);
        Ok(())
    }

    fn disable(&mut self) {}
}
