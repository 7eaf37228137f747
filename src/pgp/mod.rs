//! Timing stream reader.
//!
//! Drains DMA blocks from the (opaque) driver, validates each block as a
//! timing header, and turns completed triggers into stamped pebble slots.
//! Trigger order follows `evt_counter`, which is the authoritative global
//! sequence.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::dgram::{PulseId, Timestamp, TimingHeader, TransitionId};
use crate::pool::MemPool;

/// Maximum DMA indices returned by one driver read.
pub const MAX_RET_CNT: usize = 100;

/// Timing header size on the wire.
pub const TIMING_HEADER_SIZE: usize = 24;

/// Errors raised while validating a DMA block as a timing header.
#[derive(Error, Debug)]
pub enum TimingParseError {
    #[error("timing header too short: {size} bytes")]
    Truncated { size: usize },

    #[error("unknown service: {raw}")]
    UnknownService { raw: u8 },
}

#[inline]
fn read_u64_le(data: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

#[inline]
fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

/// Parse one DMA block as a timing header.
///
/// Layout (little endian): word 0 packs the 40-bit pulse id with the
/// service in bits 56..60, word 1 is the timestamp, then the environment
/// word (readout-group mask in the low byte) and the event counter.
pub fn parse_timing_header(data: &[u8]) -> Result<TimingHeader, TimingParseError> {
    if data.len() < TIMING_HEADER_SIZE {
        return Err(TimingParseError::Truncated { size: data.len() });
    }

    let word0 = read_u64_le(data, 0);
    let raw_service = ((word0 >> 56) & 0xf) as u8;
    let service = TransitionId::from_u8(raw_service)
        .ok_or(TimingParseError::UnknownService { raw: raw_service })?;

    Ok(TimingHeader {
        pulse_id: PulseId::new(word0),
        service,
        timestamp: Timestamp::from_value(read_u64_le(data, 8)),
        rog_mask: (read_u32_le(data, 16) & 0xff) as u8,
        evt_counter: read_u32_le(data, 20) & 0x00ff_ffff,
    })
}

/// Encode a timing header into a DMA block. Inverse of
/// [`parse_timing_header`]; used by the simulated driver and tests.
pub fn encode_timing_header(th: &TimingHeader) -> [u8; TIMING_HEADER_SIZE] {
    let mut buf = [0u8; TIMING_HEADER_SIZE];
    let word0 = th.pulse_id.value() | (u64::from(th.service as u8) << 56);
    buf[0..8].copy_from_slice(&word0.to_le_bytes());
    buf[8..16].copy_from_slice(&th.timestamp.value().to_le_bytes());
    buf[16..20].copy_from_slice(&u32::from(th.rog_mask).to_le_bytes());
    buf[20..24].copy_from_slice(&(th.evt_counter & 0x00ff_ffff).to_le_bytes());
    buf
}

/// Opaque DMA driver seam. The production driver lives outside this crate;
/// [`SimDmaDriver`] stands in for it under `sim_length` and in tests.
pub trait DmaDriver: Send {
    /// Return up to `indices.len()` fresh block indices. Blocks up to the
    /// driver's internal timeout; 0 means the timeout elapsed.
    fn read(&mut self, indices: &mut [u32]) -> usize;

    /// Copy the block's bytes into `out`.
    fn block(&self, index: u32, out: &mut Vec<u8>);

    /// Release blocks back to the driver ring.
    fn free(&mut self, indices: &[u32]);

    /// Enable DMA on the masked lanes / virtual channel.
    fn set_mask_bytes(&mut self, lane_mask: u8, virt_chan: u8) -> anyhow::Result<()>;

    fn dma_size(&self) -> usize;

    fn block_count(&self) -> usize;
}

struct SimInner {
    blocks: Vec<Vec<u8>>,
    free: VecDeque<u32>,
    pending: VecDeque<u32>,
    evt_counter: u32,
    mask_set: bool,
}

/// Deterministic in-memory driver. Injected headers come back out of
/// `read` in order; cloned handles share the same ring so a test thread
/// can feed the reader thread.
#[derive(Clone)]
pub struct SimDmaDriver {
    inner: Arc<Mutex<SimInner>>,
    dma_size: usize,
    read_timeout: Duration,
}

impl SimDmaDriver {
    pub fn new(n_blocks: usize, dma_size: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimInner {
                blocks: vec![Vec::new(); n_blocks],
                free: (0..n_blocks as u32).collect(),
                pending: VecDeque::new(),
                evt_counter: 0,
                mask_set: false,
            })),
            dma_size,
            read_timeout: Duration::from_millis(1),
        }
    }

    /// Queue a timing header with an explicit event counter.
    pub fn inject(&self, th: &TimingHeader) -> bool {
        let mut g = self.inner.lock();
        let Some(idx) = g.free.pop_front() else {
            return false;
        };
        let bytes = encode_timing_header(th);
        g.blocks[idx as usize].clear();
        g.blocks[idx as usize].extend_from_slice(&bytes);
        g.pending.push_back(idx);
        true
    }

    /// Queue a raw (possibly malformed) block.
    pub fn inject_raw(&self, bytes: &[u8]) -> bool {
        let mut g = self.inner.lock();
        let Some(idx) = g.free.pop_front() else {
            return false;
        };
        g.blocks[idx as usize].clear();
        g.blocks[idx as usize].extend_from_slice(bytes);
        g.pending.push_back(idx);
        true
    }

    /// Queue a trigger with the next sequential event counter.
    pub fn push_service(&self, service: TransitionId, timestamp: Timestamp, pulse_id: u64) -> bool {
        let counter = {
            let mut g = self.inner.lock();
            g.evt_counter = (g.evt_counter + 1) & 0x00ff_ffff;
            g.evt_counter
        };
        self.inject(&TimingHeader {
            timestamp,
            pulse_id: PulseId::new(pulse_id),
            service,
            evt_counter: counter,
            rog_mask: 1,
        })
    }

    pub fn push_l1(&self, timestamp: Timestamp, pulse_id: u64) -> bool {
        self.push_service(TransitionId::L1Accept, timestamp, pulse_id)
    }

    /// Force the next sequential counter, for jump scenarios.
    pub fn skip_counters(&self, n: u32) {
        let mut g = self.inner.lock();
        g.evt_counter = (g.evt_counter + n) & 0x00ff_ffff;
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().pending.len()
    }
}

impl DmaDriver for SimDmaDriver {
    fn read(&mut self, indices: &mut [u32]) -> usize {
        let n = {
            let mut g = self.inner.lock();
            let n = g.pending.len().min(indices.len());
            for slot in indices.iter_mut().take(n) {
                *slot = g.pending.pop_front().expect("counted above");
            }
            n
        };
        if n == 0 {
            // Stand-in for the driver's internal read timeout.
            std::thread::sleep(self.read_timeout);
        }
        n
    }

    fn block(&self, index: u32, out: &mut Vec<u8>) {
        let g = self.inner.lock();
        out.clear();
        out.extend_from_slice(&g.blocks[index as usize]);
    }

    fn free(&mut self, indices: &[u32]) {
        let mut g = self.inner.lock();
        for &idx in indices {
            g.free.push_back(idx);
        }
    }

    fn set_mask_bytes(&mut self, _lane_mask: u8, _virt_chan: u8) -> anyhow::Result<()> {
        self.inner.lock().mask_set = true;
        Ok(())
    }

    fn dma_size(&self) -> usize {
        self.dma_size
    }

    fn block_count(&self) -> usize {
        self.inner.lock().blocks.len()
    }
}

/// Shared counters the metrics registry snapshots while the reader runs.
#[derive(Default)]
pub struct PgpCounters {
    pub n_dma_ret: AtomicU64,
    pub dma_bytes: AtomicU64,
    pub n_tmg_hdr_error: AtomicU64,
    pub n_pgp_jumps: AtomicU64,
    pub n_no_tr_dgrams: AtomicU64,
    pub latency_ms: AtomicI64,
}

/// Wraps the DMA driver and produces ordered, stamped pebble slots.
pub struct PgpReader {
    driver: Box<dyn DmaDriver>,
    lane_mask: u8,
    src: u32,
    rog_mask: u8,
    indices: [u32; MAX_RET_CNT],
    available: usize,
    current: usize,
    last_counter: Option<u32>,
    jump_logged: bool,
    counters: Arc<PgpCounters>,
    scratch: Vec<u8>,
}

impl PgpReader {
    pub fn new(driver: Box<dyn DmaDriver>, lane_mask: u8, src: u32, rog_mask: u8) -> Self {
        Self {
            driver,
            lane_mask,
            src,
            rog_mask,
            indices: [0; MAX_RET_CNT],
            available: 0,
            current: 0,
            last_counter: None,
            jump_logged: false,
            counters: Arc::new(PgpCounters::default()),
            scratch: Vec::with_capacity(TIMING_HEADER_SIZE),
        }
    }

    pub fn counters(&self) -> Arc<PgpCounters> {
        Arc::clone(&self.counters)
    }

    pub fn driver_mut(&mut self) -> &mut dyn DmaDriver {
        self.driver.as_mut()
    }

    pub fn dma_size(&self) -> usize {
        self.driver.dma_size()
    }

    /// True when every block from the last driver read has been consumed.
    pub fn exhausted(&self) -> bool {
        self.current == self.available
    }

    /// Pull a fresh batch of DMA indices. Returns the number available.
    pub fn fill(&mut self, pool: &MemPool) -> usize {
        self.current = 0;
        self.available = self.driver.read(&mut self.indices);
        self.counters
            .n_dma_ret
            .store(self.available as u64, Ordering::Relaxed);
        if self.available > 0 {
            pool.count_dma(self.available);
        }
        self.available
    }

    /// Parse the block at the cursor as a timing header without consuming
    /// it. A malformed block is counted, released, and skipped.
    pub fn peek_header(&mut self, pool: &MemPool) -> Option<TimingHeader> {
        while self.current < self.available {
            let index = self.indices[self.current];
            self.driver.block(index, &mut self.scratch);
            match parse_timing_header(&self.scratch) {
                Ok(th) => return Some(th),
                Err(e) => {
                    self.counters.n_tmg_hdr_error.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "bad timing header, dropping DMA block");
                    self.driver.free(&[index]);
                    pool.free_dma(1);
                    self.current += 1;
                }
            }
        }
        None
    }

    /// Consume the block at the cursor as trigger `th`, completing its
    /// mailbox and stamping a pebble slot. Returns the pebble index.
    pub fn consume(&mut self, pool: &mut MemPool, th: &TimingHeader) -> u32 {
        let dma_index = self.indices[self.current];
        self.current += 1;

        self.counters
            .dma_bytes
            .fetch_add(self.scratch.len() as u64, Ordering::Relaxed);
        self.check_jump(th);
        self.counters
            .latency_ms
            .store(th.timestamp.age_ms(), Ordering::Relaxed);

        let pgp_index = th.evt_counter as usize & (pool.n_dma_buffers() - 1);
        let lane = self.lane_mask.trailing_zeros() as usize;
        {
            let event = &mut pool.pgp_events[pgp_index];
            event.mask |= 1 << lane;
            event.buffers[lane].index = dma_index;
            event.buffers[lane].size = self.scratch.len() as i32;
        }

        // All lanes expected by the mask have arrived (a single lane here,
        // so the first block completes the event).
        debug_assert_eq!(pool.pgp_events[pgp_index].mask, self.lane_mask);

        let pebble_index = pool.allocate();
        pool.pgp_events[pgp_index].pebble_index = pebble_index;
        pool.pebble
            .get_mut(pebble_index)
            .init_from(th, self.src, self.rog_mask);

        if !th.service.is_event() {
            match pool.allocate_tr() {
                Some(mut tr) => {
                    tr.copy_header(pool.pebble.get(pebble_index));
                    pool.transition_dgrams[pebble_index as usize] = Some(tr);
                }
                None => {
                    // Happens during shutdown; the worker skips the slot.
                    self.counters.n_no_tr_dgrams.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        // Recycle the mailbox's DMA indices.
        let indices = [dma_index];
        self.driver.free(&indices);
        pool.free_dma(indices.len());
        pool.pgp_events[pgp_index].mask = 0;

        debug!(
            ts = %th.timestamp,
            pulse_id = %th.pulse_id,
            service = %th.service,
            evt_counter = th.evt_counter,
            pebble_index,
            "trigger ready",
        );

        pebble_index
    }

    /// Read the next ordered trigger; `None` when the driver timed out.
    pub fn next(&mut self, pool: &mut MemPool) -> Option<u32> {
        if self.exhausted() && self.fill(pool) == 0 {
            return None;
        }
        let th = self.peek_header(pool)?;
        Some(self.consume(pool, &th))
    }

    /// Release any undelivered DMA blocks; the shutdown path always runs
    /// this so the driver ring returns to empty.
    pub fn flush(&mut self, pool: &MemPool) {
        let remaining = &self.indices[self.current..self.available];
        if !remaining.is_empty() {
            let count = remaining.len();
            let tmp: Vec<u32> = remaining.to_vec();
            self.driver.free(&tmp);
            pool.free_dma(count);
        }
        self.current = 0;
        self.available = 0;
    }

    pub fn latency_ms(&self) -> i64 {
        self.counters.latency_ms.load(Ordering::Relaxed)
    }

    fn check_jump(&mut self, th: &TimingHeader) {
        if let Some(last) = self.last_counter {
            let jump = th.evt_counter.wrapping_sub(last) & 0x00ff_ffff;
            if jump != 1 {
                self.counters.n_pgp_jumps.fetch_add(1, Ordering::Relaxed);
                if !self.jump_logged {
                    self.jump_logged = true;
                    warn!(
                        jump,
                        evt_counter = th.evt_counter,
                        pulse_id = %th.pulse_id,
                        "event counter jump",
                    );
                }
            }
        }
        self.last_counter = Some(th.evt_counter);
    }
}
