//! Prometheus registry for the contributor's operational metrics.
//!
//! Exposition (HTTP scrape endpoint) belongs to the deployment; this
//! module owns the registry and a snapshot updater that mirrors the data
//! path's atomic counters into it.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Result;
use prometheus::{Gauge, Opts, Registry};

use crate::matcher::MatchStats;
use crate::pgp::PgpCounters;
use crate::pool::{PoolCounters, SideChannel};
use crate::queue::SpscQueue;

/// Everything the updater samples. Fields are optional because the modes
/// differ (BLD has no event queue, PV/UDP have one side channel).
#[derive(Default, Clone)]
pub struct MetricSources {
    pub stats: Option<Arc<MatchStats>>,
    pub pgp: Option<Arc<PgpCounters>>,
    pub pool: Option<Arc<PoolCounters>>,
    pub side: Option<Arc<SideChannel>>,
    pub evt_queue: Option<Arc<SpscQueue<u32>>>,
    /// BLD pulse-id jumps, folded into the sequence-jump gauge.
    pub bld_jumps: Option<Arc<std::sync::atomic::AtomicU64>>,
}

/// Metric handles, one struct field per exported series.
pub struct DrpMetrics {
    registry: Registry,

    /// Triggers consumed from the timing stream.
    pub events: Gauge,
    /// Side-channel updates received.
    pub updates: Gauge,
    /// Contributions whose side-channel data matched.
    pub match_count: Gauge,
    /// Contributions emitted without data (MissingData).
    pub empty_count: Gauge,
    /// Side-channel updates dropped for lack of a buffer.
    pub miss_count: Gauge,
    /// Side-channel updates older than every pending trigger.
    pub too_old_count: Gauge,
    /// Contributions flushed by the match timeout.
    pub timeout_count: Gauge,
    /// Trigger minus side-channel timestamp at the queue heads (ns).
    pub time_diff: Gauge,
    /// Depth of the trigger queue.
    pub worker_input_queue: Gauge,
    /// Depth of the side-channel queue.
    pub worker_output_queue: Gauge,
    /// DMA indices returned by the last driver read.
    pub num_dma_ret: Gauge,
    /// Bytes drained from the DMA ring.
    pub dma_bytes: Gauge,
    /// Pebble slots currently in flight.
    pub in_use: Gauge,
    /// DMA blocks currently held.
    pub dma_in_use: Gauge,
    /// Age of the newest timing header (ms).
    pub th_latency: Gauge,
    /// Timing headers that failed validation.
    pub num_th_error: Gauge,
    /// Event-counter / pulse-id sequence jumps.
    pub num_pgp_jump: Gauge,
    /// Transitions that found the buffer freelist empty.
    pub num_no_tr_dgram: Gauge,
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<Gauge> {
    let g = Gauge::with_opts(Opts::new(name, help).namespace("drp"))?;
    registry.register(Box::new(g.clone()))?;
    Ok(g)
}

impl DrpMetrics {
    /// Build the registry with the standard label set.
    pub fn new(
        instrument: &str,
        partition: u32,
        det_name: &str,
        det_segment: u32,
        alias: &str,
    ) -> Result<Self> {
        let labels = std::collections::HashMap::from([
            ("instrument".to_string(), instrument.to_string()),
            ("partition".to_string(), partition.to_string()),
            ("detname".to_string(), det_name.to_string()),
            ("detseg".to_string(), det_segment.to_string()),
            ("alias".to_string(), alias.to_string()),
        ]);
        let registry = Registry::new_custom(None, Some(labels))?;

        Ok(Self {
            events: gauge(&registry, "event_count", "Triggers consumed from the timing stream.")?,
            updates: gauge(&registry, "update_count", "Side-channel updates received.")?,
            match_count: gauge(&registry, "match_count", "Contributions with matched data.")?,
            empty_count: gauge(&registry, "empty_count", "Contributions emitted without data.")?,
            miss_count: gauge(&registry, "miss_count", "Updates dropped for lack of a buffer.")?,
            too_old_count: gauge(&registry, "tooOld_count", "Stale updates discarded.")?,
            timeout_count: gauge(&registry, "timeout_count", "Contributions flushed by timeout.")?,
            time_diff: gauge(&registry, "time_diff", "Trigger minus side-channel time (ns).")?,
            worker_input_queue: gauge(&registry, "worker_input_queue", "Trigger queue depth.")?,
            worker_output_queue: gauge(&registry, "worker_output_queue", "Side queue depth.")?,
            num_dma_ret: gauge(&registry, "num_dma_ret", "DMA indices from the last read.")?,
            dma_bytes: gauge(&registry, "pgp_byte_count", "Bytes drained from the DMA ring.")?,
            in_use: gauge(&registry, "in_use", "Pebble slots in flight.")?,
            dma_in_use: gauge(&registry, "dma_in_use", "DMA blocks held.")?,
            th_latency: gauge(&registry, "th_latency", "Age of the newest timing header (ms).")?,
            num_th_error: gauge(&registry, "num_th_error", "Invalid timing headers.")?,
            num_pgp_jump: gauge(&registry, "num_pgp_jump", "Sequence jumps observed.")?,
            num_no_tr_dgram: gauge(&registry, "num_no_tr_dgram", "Transition buffer misses.")?,
            registry,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Mirror one snapshot of the data-path counters into the registry.
    pub fn update(&self, src: &MetricSources) {
        if let Some(stats) = &src.stats {
            self.events
                .set(stats.n_events.load(Ordering::Relaxed) as f64);
            self.match_count
                .set(stats.n_match.load(Ordering::Relaxed) as f64);
            self.empty_count
                .set(stats.n_empty.load(Ordering::Relaxed) as f64);
            self.too_old_count
                .set(stats.n_too_old.load(Ordering::Relaxed) as f64);
            self.timeout_count
                .set(stats.n_timed_out.load(Ordering::Relaxed) as f64);
            self.time_diff
                .set(stats.time_diff_ns.load(Ordering::Relaxed) as f64);
        }
        if let Some(pgp) = &src.pgp {
            self.num_dma_ret
                .set(pgp.n_dma_ret.load(Ordering::Relaxed) as f64);
            self.dma_bytes
                .set(pgp.dma_bytes.load(Ordering::Relaxed) as f64);
            self.th_latency
                .set(pgp.latency_ms.load(Ordering::Relaxed) as f64);
            self.num_th_error
                .set(pgp.n_tmg_hdr_error.load(Ordering::Relaxed) as f64);
            let mut jumps = pgp.n_pgp_jumps.load(Ordering::Relaxed);
            if let Some(bld) = &src.bld_jumps {
                jumps += bld.load(Ordering::Relaxed);
            }
            self.num_pgp_jump.set(jumps as f64);
            self.num_no_tr_dgram
                .set(pgp.n_no_tr_dgrams.load(Ordering::Relaxed) as f64);
        }
        if let Some(pool) = &src.pool {
            self.in_use.set(pool.in_use() as f64);
            self.dma_in_use.set(pool.dma_in_use() as f64);
        }
        if let Some(side) = &src.side {
            self.updates.set(side.n_updates() as f64);
            self.miss_count.set(side.n_missed() as f64);
            self.worker_output_queue.set(side.queue.guess_size() as f64);
        }
        if let Some(q) = &src.evt_queue {
            self.worker_input_queue.set(q.guess_size() as f64);
        }
    }
}
