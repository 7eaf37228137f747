//! Two-queue matching: triggers on one queue, side-channel updates (PV or
//! encoder frames) on the other, paired at the heads.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::dgram::{DamageFlag, Timestamp, TransitionId};
use crate::eb::{send_to_teb, EbSink, TriggerPrimitive};
use crate::matcher::{compare, MatchStats, WorkerConfig};
use crate::pgp::PgpReader;
use crate::pool::{MemPool, SideChannel};
use crate::queue::SpscQueue;

/// Which receiver feeds the side-channel queue. The differences are small:
/// the encoder path queues SlowUpdates with L1Accepts to keep time order,
/// sweeps per trigger, and sweeps everything out on Disable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideMode {
    Pv,
    Udp,
}

enum IdleState {
    Active,
    Started(Instant),
    Flushed,
}

/// The matching thread body for PV and UDP modes.
pub struct MatchWorker {
    pool: MemPool,
    pgp: PgpReader,
    evt_queue: Arc<SpscQueue<u32>>,
    side: Arc<SideChannel>,
    sink: Box<dyn EbSink>,
    trigger: Option<Box<dyn TriggerPrimitive>>,
    terminate: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    transition_payload: Arc<Mutex<Vec<u8>>>,
    stats: Arc<MatchStats>,
    cfg: WorkerConfig,
    mode: SideMode,
    on_l1: Option<Box<dyn FnMut() + Send>>,
}

impl MatchWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: MemPool,
        pgp: PgpReader,
        evt_queue: Arc<SpscQueue<u32>>,
        side: Arc<SideChannel>,
        sink: Box<dyn EbSink>,
        trigger: Option<Box<dyn TriggerPrimitive>>,
        terminate: Arc<AtomicBool>,
        running: Arc<AtomicBool>,
        transition_payload: Arc<Mutex<Vec<u8>>>,
        stats: Arc<MatchStats>,
        cfg: WorkerConfig,
        mode: SideMode,
    ) -> Self {
        Self {
            pool,
            pgp,
            evt_queue,
            side,
            sink,
            trigger,
            terminate,
            running,
            transition_payload,
            stats,
            cfg,
            mode,
            on_l1: None,
        }
    }

    /// Hook fired per L1Accept before matching (loopback self-test).
    pub fn set_on_l1(&mut self, hook: Box<dyn FnMut() + Send>) {
        self.on_l1 = Some(hook);
    }

    pub fn run(mut self) {
        info!("worker thread started");
        let tmo_ns = self.cfg.match_tmo.as_nanos() as u64;
        let mut idle = IdleState::Active;

        loop {
            if self.terminate.load(Ordering::Relaxed) {
                break;
            }

            match self.pgp.next(&mut self.pool) {
                Some(index) => {
                    idle = IdleState::Active;
                    self.stats.n_events.fetch_add(1, Ordering::Relaxed);
                    let service = self.pool.pebble.get(index).service;
                    let time = self.pool.pebble.get(index).time;

                    match self.mode {
                        SideMode::Udp => {
                            if service.is_event() {
                                if let Some(hook) = self.on_l1.as_mut() {
                                    hook();
                                }
                            }
                            if service.is_event() || service == TransitionId::SlowUpdate {
                                self.evt_queue.push(index);
                                self.match_up();
                                // Keep triggers from stacking up behind a
                                // silent encoder; the cutoff stays below the
                                // event-builder build timeout so prompt
                                // contributions don't expire before latent
                                // ones arrive.
                                let cutoff = Timestamp::from_ns(time.to_ns().saturating_sub(tmo_ns));
                                self.sweep_triggers(cutoff);
                            } else {
                                self.emit_transition(index, false);
                                self.pool.free_pebble();
                            }
                        }
                        SideMode::Pv => {
                            self.evt_queue.push(index);
                            self.match_up();
                        }
                    }
                }
                None => {
                    // Triggers may have stacked up; pair them with whatever
                    // updates arrived meanwhile, then time out stragglers.
                    self.match_up();
                    let cutoff =
                        Timestamp::from_ns(Timestamp::now().to_ns().saturating_sub(tmo_ns));
                    if self.mode == SideMode::Pv {
                        // Encoder frames carry no wall-clock time; only PV
                        // updates can go stale by themselves.
                        self.sweep_side(cutoff);
                    }
                    self.sweep_triggers(cutoff);

                    idle = match idle {
                        IdleState::Active => IdleState::Started(Instant::now()),
                        IdleState::Started(since) if since.elapsed() > self.cfg.idle_flush => {
                            self.sink.timeout();
                            IdleState::Flushed
                        }
                        other => other,
                    };
                }
            }
        }

        self.drain();
        info!("worker thread finished");
    }

    /// Pair queue heads until one side runs dry.
    fn match_up(&mut self) {
        loop {
            let Some(index) = self.evt_queue.peek() else {
                break;
            };
            let service = self.pool.pebble.get(index).service;
            if !service.is_event() {
                // PV-mode transitions and UDP-mode SlowUpdates pass through
                // in queue order without touching the side channel.
                self.evt_queue.try_pop();
                self.emit_transition(index, service == TransitionId::SlowUpdate);
                self.pool.free_pebble();
                continue;
            }

            let Some(side_time) = self.side.peek_time() else {
                break;
            };
            let time = self.pool.pebble.get(index).time;
            self.stats.time_diff_ns.store(
                time.to_ns() as i64 - side_time.to_ns() as i64,
                Ordering::Relaxed,
            );

            let result = compare(time, side_time, self.cfg.degree);
            debug!(
                pgp = %time,
                side = %side_time,
                result = ?result,
                "matching",
            );
            match result {
                CmpOrdering::Equal => self.handle_match(index),
                CmpOrdering::Less => self.handle_younger(index),
                CmpOrdering::Greater => self.handle_older(),
            }
        }
    }

    /// Heads agree: fold the update into the trigger's contribution.
    fn handle_match(&mut self, index: u32) {
        self.evt_queue.try_pop();

        let dgram = self.pool.pebble.get_mut(index);
        self.side
            .with_head(|buf| {
                dgram.xtc.damage.increase(buf.damage);
                let dst = dgram
                    .xtc
                    .alloc(buf.payload.len())
                    .expect("side payload bounded by pebble budget");
                dst.copy_from_slice(&buf.payload);
            })
            .expect("peeked above");
        self.side.consume_head();

        self.stats.n_match.fetch_add(1, Ordering::Relaxed);
        self.send(index, false);
        self.pool.free_pebble();
    }

    /// The update is younger than the trigger: the trigger goes out
    /// without data.
    fn handle_younger(&mut self, index: u32) {
        self.evt_queue.try_pop();
        self.pool
            .pebble
            .get_mut(index)
            .xtc
            .damage
            .raise(DamageFlag::MissingData);
        self.stats.n_empty.fetch_add(1, Ordering::Relaxed);
        self.send(index, false);
        self.pool.free_pebble();
    }

    /// The update predates every pending trigger: drop it.
    fn handle_older(&mut self) {
        self.stats.n_too_old.fetch_add(1, Ordering::Relaxed);
        self.side.consume_head();
    }

    /// Flush pending triggers at or below the cutoff with TimedOut damage.
    fn sweep_triggers(&mut self, cutoff: Timestamp) {
        loop {
            let Some(index) = self.evt_queue.peek() else {
                break;
            };
            let (time, service) = {
                let dgram = self.pool.pebble.get(index);
                (dgram.time, dgram.service)
            };
            if time > cutoff {
                break;
            }
            self.evt_queue.try_pop();

            if service.is_event() {
                self.pool
                    .pebble
                    .get_mut(index)
                    .xtc
                    .damage
                    .raise(DamageFlag::TimedOut);
                self.stats.n_timed_out.fetch_add(1, Ordering::Relaxed);
                debug!(%time, %cutoff, "event timed out");
                self.send(index, false);
            } else {
                self.emit_transition(index, service == TransitionId::SlowUpdate);
            }
            self.pool.free_pebble();
        }
    }

    /// Drop one stale side-channel head at or below the cutoff.
    fn sweep_side(&mut self, cutoff: Timestamp) {
        if let Some(t) = self.side.peek_time() {
            if t <= cutoff {
                self.side.consume_head();
            }
        }
    }

    /// Pass a transition through, attaching the phase-1 payload (except
    /// for SlowUpdates, which carry none).
    fn emit_transition(&mut self, index: u32, slow_update: bool) {
        let Some(mut tr) = self.pool.transition_dgrams[index as usize].take() else {
            // Can happen during shutdown.
            return;
        };
        tr.copy_header(self.pool.pebble.get(index));

        if !slow_update {
            let payload = self.transition_payload.lock();
            let dst = tr
                .xtc
                .alloc(payload.len())
                .expect("phase-1 payload bounded by transition budget");
            dst.copy_from_slice(&payload);
            drop(payload);

            match tr.service {
                TransitionId::Enable => self.running.store(true, Ordering::Relaxed),
                TransitionId::Disable => {
                    self.running.store(false, Ordering::Relaxed);
                    if self.mode == SideMode::Udp {
                        // Sweep out pending L1Accepts and SlowUpdates.
                        debug!("sweeping out L1Accepts and SlowUpdates");
                        self.sweep_triggers(Timestamp::MAX);
                    }
                }
                _ => {}
            }
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

    fn send(&mut self, index: u32, _transition: bool) {
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

    /// Drop anything still queued without emitting and release the DMA
    /// ring, so buffer accounting returns to zero after Unconfigure.
    fn drain(&mut self) {
        self.pgp.flush(&self.pool);
        while let Some(index) = self.evt_queue.try_pop() {
            if let Some(tr) = self.pool.transition_dgrams[index as usize].take() {
                self.pool.free_tr(tr);
            }
            self.pool.free_pebble();
        }
    }
}
