//! BLD matching: walks several timestamp-ordered multicast sources against
//! the timing stream, emitting one contribution per trigger with the
//! payloads of every source that produced data for it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::bld::BldSource;
use crate::dgram::names::{names_index, NamesEntry, NamesRegistry};
use crate::dgram::{DamageFlag, Timestamp, TransitionId};
use crate::eb::{send_to_teb, EbSink, TriggerPrimitive};
use crate::matcher::{MatchStats, WorkerConfig};
use crate::pgp::PgpReader;
use crate::pool::MemPool;

/// How long one iteration waits for timing data before skipping ahead.
const PGP_WAIT: Duration = Duration::from_millis(10);

/// Fast-forward window applied after a timing wait expires.
const SKIP_INTERVAL_NS: u64 = 20_000_000;

/// How long a trigger may lead the side channel before MissingData.
const LEAD_TMO: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TmoState {
    None,
    Started,
    Finished,
}

/// The matching thread body for BLD mode.
pub struct BldWorker {
    pool: MemPool,
    pgp: PgpReader,
    sources: Vec<BldSource>,
    sink: Box<dyn EbSink>,
    trigger: Option<Box<dyn TriggerPrimitive>>,
    terminate: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    transition_payload: Arc<Mutex<Vec<u8>>>,
    names: Arc<Mutex<NamesRegistry>>,
    stats: Arc<MatchStats>,
    cfg: WorkerConfig,
    next_ts: Timestamp,
    tmo_state: TmoState,
    t_initial: Instant,
}

impl BldWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: MemPool,
        pgp: PgpReader,
        sources: Vec<BldSource>,
        sink: Box<dyn EbSink>,
        trigger: Option<Box<dyn TriggerPrimitive>>,
        terminate: Arc<AtomicBool>,
        running: Arc<AtomicBool>,
        transition_payload: Arc<Mutex<Vec<u8>>>,
        names: Arc<Mutex<NamesRegistry>>,
        stats: Arc<MatchStats>,
        cfg: WorkerConfig,
    ) -> Self {
        Self {
            pool,
            pgp,
            sources,
            sink,
            trigger,
            terminate,
            running,
            transition_payload,
            names,
            stats,
            cfg,
            next_ts: Timestamp::default(),
            tmo_state: TmoState::None,
            t_initial: Instant::now(),
        }
    }

    pub fn run(mut self) {
        info!(sources = self.sources.len(), "worker thread started");

        let n = self.sources.len();
        let mut timestamps: Vec<Timestamp> = Vec::with_capacity(n);
        for (i, src) in self.sources.iter_mut().enumerate() {
            let ts = src.receiver.next();
            info!(source = i, %ts, "initial side-channel timestamp");
            timestamps.push(ts);
        }
        let mut next_id = timestamps.iter().copied().min().unwrap_or_default();
        let mut l_missing = false;

        loop {
            if self.terminate.load(Ordering::Relaxed) {
                break;
            }

            let result = self.pgp_next(next_id);
            let mut l_hold = false;
            let mut emitted_time = None;

            if let Some(index) = result {
                self.stats.n_events.fetch_add(1, Ordering::Relaxed);
                let (time, service, damaged) = {
                    let dgram = self.pool.pebble.get(index);
                    (dgram.time, dgram.service, !dgram.xtc.damage.is_clean())
                };
                debug!(pgp = %time, bld = %next_id, "trigger vs side channel");

                if damaged {
                    // Timing got ahead of the side channel.
                    self.stats.n_missed.fetch_add(1, Ordering::Relaxed);
                    if time < next_id {
                        l_hold = true;
                    }
                    if !l_missing {
                        l_missing = true;
                        debug!(pgp = %time, bld = %next_id, "missed next bld");
                    }
                    self.send(index);
                } else if service.is_event() {
                    let mut l_missed_any = false;
                    for i in 0..n {
                        if timestamps[i] == next_id {
                            let dgram = self.pool.pebble.get_mut(index);
                            let payload = self.sources[i].receiver.payload();
                            let dst = dgram
                                .xtc
                                .alloc(payload.len())
                                .expect("side payloads bounded by pebble budget");
                            dst.copy_from_slice(payload);
                        } else {
                            l_missed_any = true;
                            if !l_missing {
                                debug!(
                                    source = i,
                                    bld = %next_id,
                                    source_ts = %timestamps[i],
                                    "missed bld source",
                                );
                            }
                        }
                    }
                    if l_missed_any {
                        l_missing = true;
                        self.pool
                            .pebble
                            .get_mut(index)
                            .xtc
                            .damage
                            .raise(DamageFlag::DroppedContribution);
                        self.stats.n_missed.fetch_add(1, Ordering::Relaxed);
                    } else {
                        if l_missing {
                            debug!(bld = %next_id, "found bld again");
                        }
                        l_missing = false;
                        self.stats.n_match.fetch_add(1, Ordering::Relaxed);
                    }
                    self.send(index);
                } else {
                    // Hold off the side channel across transitions.
                    l_hold = true;
                    self.emit_transition(index);
                }

                emitted_time = Some(time);
                self.pool.free_pebble();
            }

            if !l_hold {
                // Advance every source past what was just emitted (or
                // skipped) and recompute the rolling minimum.
                let floor = Timestamp::from_value(next_id.value().saturating_add(1));
                for i in 0..n {
                    if let Some(t) = emitted_time {
                        self.sources[i].receiver.clear(t);
                    }
                    if timestamps[i] < floor {
                        timestamps[i] = self.sources[i].receiver.next();
                    }
                }
                next_id = timestamps.iter().copied().min().unwrap_or_default();
            }
        }

        self.pgp.flush(&self.pool);
        info!("worker thread finished");
    }

    /// Ask the timing stream for the trigger matching `bld_ts`.
    ///
    /// Emits the trigger when it matches the side channel or is a
    /// transition; emits with MissingData once the side channel is known
    /// to be late; otherwise returns None (and arms the lead timeout).
    fn pgp_next(&mut self, bld_ts: Timestamp) -> Option<u32> {
        // Fast forward: while the side channel lags a trigger we already
        // emitted, don't read more timing data.
        if bld_ts.value() != 0 && bld_ts < self.next_ts {
            return None;
        }

        if self.pgp.exhausted() {
            let start = Instant::now();
            loop {
                if self.terminate.load(Ordering::Relaxed) {
                    return None;
                }
                if self.pgp.fill(&self.pool) > 0 {
                    break;
                }
                if start.elapsed() >= PGP_WAIT {
                    self.next_ts = Timestamp::from_ns(bld_ts.to_ns() + SKIP_INTERVAL_NS);
                    if self.running.load(Ordering::Relaxed) {
                        debug!("pgp timeout");
                    }
                    return None;
                }
            }
        }

        let th = self.pgp.peek_header(&self.pool)?;

        if bld_ts == th.timestamp || !th.service.is_event() {
            let index = self.pgp.consume(&mut self.pool, &th);
            self.next_ts = th.timestamp;
            self.tmo_state = TmoState::None;
            return Some(index);
        }

        if bld_ts > th.timestamp || self.tmo_state == TmoState::Finished {
            // The side channel is late (or stopped): emit without data.
            let index = self.pgp.consume(&mut self.pool, &th);
            self.pool
                .pebble
                .get_mut(index)
                .xtc
                .damage
                .raise(DamageFlag::MissingData);
            self.next_ts = th.timestamp;
            self.tmo_state = TmoState::None;
            return Some(index);
        }

        // Timing leads the side channel; wait a bounded while before
        // declaring the data missing.
        match self.tmo_state {
            TmoState::None => {
                self.tmo_state = TmoState::Started;
                self.t_initial = Instant::now();
            }
            TmoState::Started => {
                if self.t_initial.elapsed() > LEAD_TMO {
                    self.tmo_state = TmoState::Finished;
                }
            }
            TmoState::Finished => {}
        }
        None
    }

    fn emit_transition(&mut self, index: u32) {
        let Some(mut tr) = self.pool.transition_dgrams[index as usize].take() else {
            // Can happen during shutdown.
            return;
        };
        tr.copy_header(self.pool.pebble.get(index));

        if tr.service != TransitionId::SlowUpdate {
            let payload = self.transition_payload.lock();
            let dst = tr
                .xtc
                .alloc(payload.len())
                .expect("phase-1 payload bounded by transition budget");
            dst.copy_from_slice(&payload);
        }

        match tr.service {
            TransitionId::Configure => {
                info!("BLD configure");
                let mut names = self.names.lock();
                for (i, src) in self.sources.iter().enumerate() {
                    names.insert(
                        names_index::BASE + i as u32,
                        NamesEntry {
                            det_name: src.det_name.clone(),
                            det_type: src.det_type.clone(),
                            det_id: src.det_id.clone(),
                            var_def: src.var_def.clone(),
                        },
                    );
                }
            }
            TransitionId::Enable => self.running.store(true, Ordering::Relaxed),
            TransitionId::Disable => self.running.store(false, Ordering::Relaxed),
            _ => {}
        }

        send_to_teb(
            self.sink.as_mut(),
            self.trigger.as_deref_mut(),
            &tr,
            index,
            self.cfg.pebble_buf_size,
            self.cfg.max_tr_size,
        );
        self.pool.free_tr(tr);
    }

    fn send(&mut self, index: u32) {
        let dgram = self.pool.pebble.get(index);
        send_to_teb(
            self.sink.as_mut(),
            self.trigger.as_deref_mut(),
            dgram,
            index,
            self.cfg.pebble_buf_size,
            self.cfg.max_tr_size,
        );
    }
}
