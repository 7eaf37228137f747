//! Buffer ownership: the pebble slab of contribution slots, per-trigger DMA
//! mailboxes, the transition-buffer freelist, and the freelist-backed
//! side-channel buffer pool.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::dgram::{Damage, EbDgram, Timestamp, DGRAM_HEADER_SIZE};
use crate::queue::SpscQueue;

/// Hardware lane count of the DMA engine. This contributor drives exactly
/// one lane; the mask width is fixed by the driver interface.
pub const PGP_MAX_LANES: usize = 8;

/// One DMA block reference held by a trigger mailbox.
#[derive(Debug, Clone, Copy, Default)]
pub struct DmaBuffer {
    pub size: i32,
    pub index: u32,
}

/// Per-trigger mailbox: DMA indices per lane plus the pebble slot assigned
/// once all expected lanes have arrived. Created when DMA completes,
/// retired when `free_dma` releases its indices.
#[derive(Debug, Clone, Copy)]
pub struct PgpEvent {
    pub buffers: [DmaBuffer; PGP_MAX_LANES],
    pub mask: u8,
    pub pebble_index: u32,
}

impl Default for PgpEvent {
    fn default() -> Self {
        Self {
            buffers: [DmaBuffer::default(); PGP_MAX_LANES],
            mask: 0,
            pebble_index: 0,
        }
    }
}

/// Fixed-capacity slab of contribution slots, exclusively owned by the
/// pool. Index `i` in `[0, nbuffers)` addresses one datagram.
pub struct Pebble {
    slots: Vec<EbDgram>,
    buffer_size: usize,
}

impl Pebble {
    fn create(nbuffers: usize, buffer_size: usize) -> Self {
        // Each slot holds header + payload within buffer_size.
        let payload_capacity = buffer_size.saturating_sub(DGRAM_HEADER_SIZE);
        let slots = (0..nbuffers)
            .map(|_| EbDgram::with_capacity(payload_capacity))
            .collect();
        Self { slots, buffer_size }
    }

    /// Per-slot budget: header plus payload of an L1Accept must fit here.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn nbuffers(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, index: u32) -> &EbDgram {
        &self.slots[index as usize]
    }

    pub fn get_mut(&mut self, index: u32) -> &mut EbDgram {
        &mut self.slots[index as usize]
    }
}

/// Allocation counters, atomic so the metrics thread can snapshot them
/// while the matching thread allocates.
#[derive(Default)]
pub struct PoolCounters {
    pub allocs: AtomicU64,
    pub frees: AtomicU64,
    pub dma_allocs: AtomicU64,
    pub dma_frees: AtomicU64,
}

impl PoolCounters {
    pub fn in_use(&self) -> i64 {
        self.allocs.load(Ordering::Relaxed) as i64 - self.frees.load(Ordering::Relaxed) as i64
    }

    pub fn dma_in_use(&self) -> i64 {
        self.dma_allocs.load(Ordering::Relaxed) as i64
            - self.dma_frees.load(Ordering::Relaxed) as i64
    }

    pub fn reset(&self) {
        self.allocs.store(0, Ordering::Relaxed);
        self.frees.store(0, Ordering::Relaxed);
        self.dma_allocs.store(0, Ordering::Relaxed);
        self.dma_frees.store(0, Ordering::Relaxed);
    }
}

struct TrInner {
    free: Vec<Box<EbDgram>>,
    shutdown: bool,
}

/// Mutex+condvar guarded freelist of transition buffers. `allocate` blocks
/// while empty; `shutdown` wakes every waiter with a `None` sentinel.
pub struct TransitionPool {
    inner: Mutex<TrInner>,
    available: Condvar,
}

impl TransitionPool {
    fn new(count: usize, buffer_size: usize) -> Self {
        let payload_capacity = buffer_size.saturating_sub(DGRAM_HEADER_SIZE);
        let free = (0..count)
            .map(|_| Box::new(EbDgram::with_capacity(payload_capacity)))
            .collect();
        Self {
            inner: Mutex::new(TrInner {
                free,
                shutdown: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Take a transition buffer, blocking until one is freed. Returns
    /// `None` once the pool has been shut down.
    pub fn allocate(&self) -> Option<Box<EbDgram>> {
        let mut g = self.inner.lock();
        loop {
            if g.shutdown {
                return None;
            }
            if let Some(buf) = g.free.pop() {
                return Some(buf);
            }
            self.available.wait(&mut g);
        }
    }

    pub fn free(&self, buf: Box<EbDgram>) {
        let mut g = self.inner.lock();
        g.free.push(buf);
        self.available.notify_one();
    }

    /// Wake all blocked allocators and refuse further allocations.
    pub fn shutdown(&self) {
        let mut g = self.inner.lock();
        g.shutdown = true;
        self.available.notify_all();
    }

    /// Re-arm after shutdown, for the next Configure.
    pub fn startup(&self) {
        self.inner.lock().shutdown = false;
    }

    pub fn free_count(&self) -> usize {
        self.inner.lock().free.len()
    }
}

/// All buffers backing one contributor: the pebble, the trigger mailboxes,
/// the per-slot transition buffers and the DMA accounting.
///
/// Owned and mutated by the matching thread; only the transition freelist
/// and the counters are shared.
pub struct MemPool {
    pub pebble: Pebble,
    pub pgp_events: Vec<PgpEvent>,
    pub transition_dgrams: Vec<Option<Box<EbDgram>>>,
    transitions: Arc<TransitionPool>,
    counters: Arc<PoolCounters>,
    n_dma_buffers: usize,
    set_mask_done: bool,
}

impl MemPool {
    /// Allocate every buffer up front from the configured geometry.
    /// `nbuffers` must be a power of two (index arithmetic is a mask).
    pub fn new(nbuffers: usize, buf_size: usize, n_tr_buffers: usize, tr_buf_size: usize) -> Self {
        let nbuffers = nbuffers.next_power_of_two();
        Self {
            pebble: Pebble::create(nbuffers, buf_size),
            pgp_events: vec![PgpEvent::default(); nbuffers],
            transition_dgrams: (0..nbuffers).map(|_| None).collect(),
            transitions: Arc::new(TransitionPool::new(n_tr_buffers, tr_buf_size)),
            counters: Arc::new(PoolCounters::default()),
            n_dma_buffers: nbuffers,
            set_mask_done: false,
        }
    }

    pub fn nbuffers(&self) -> usize {
        self.pebble.nbuffers()
    }

    pub fn n_dma_buffers(&self) -> usize {
        self.n_dma_buffers
    }

    pub fn buffer_size(&self) -> usize {
        self.pebble.buffer_size()
    }

    pub fn counters(&self) -> Arc<PoolCounters> {
        Arc::clone(&self.counters)
    }

    pub fn transitions(&self) -> Arc<TransitionPool> {
        Arc::clone(&self.transitions)
    }

    /// Claim the next pebble slot for a completed trigger.
    pub fn allocate(&mut self) -> u32 {
        let allocs = self.counters.allocs.fetch_add(1, Ordering::Relaxed);
        debug_assert!(
            self.counters.in_use() <= self.nbuffers() as i64,
            "pebble exhausted: allocate without matching free"
        );
        (allocs as usize & (self.nbuffers() - 1)) as u32
    }

    /// Release a pebble slot after its contribution left the process.
    pub fn free_pebble(&self) {
        self.counters.frees.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a transition buffer; blocks, `None` after shutdown.
    pub fn allocate_tr(&self) -> Option<Box<EbDgram>> {
        self.transitions.allocate()
    }

    pub fn free_tr(&self, dgram: Box<EbDgram>) {
        self.transitions.free(dgram);
    }

    pub fn count_dma(&self, n: usize) {
        self.counters.dma_allocs.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Release DMA indices collected from a completed trigger mailbox.
    pub fn free_dma(&self, count: usize) {
        self.counters.dma_frees.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn in_use(&self) -> i64 {
        self.counters.in_use()
    }

    pub fn dma_in_use(&self) -> i64 {
        self.counters.dma_in_use()
    }

    pub fn reset_counters(&self) {
        self.counters.reset();
    }

    /// One-shot driver handshake enabling DMA on the configured lane.
    /// Repeat calls are no-ops.
    pub fn set_mask_bytes(
        &mut self,
        driver: &mut dyn crate::pgp::DmaDriver,
        lane_mask: u8,
        virt_chan: u8,
    ) -> anyhow::Result<()> {
        if self.set_mask_done {
            return Ok(());
        }
        driver.set_mask_bytes(lane_mask, virt_chan)?;
        self.set_mask_done = true;
        Ok(())
    }

    /// Wake any blocked transition allocators, then refuse further
    /// allocations. Part of the Unconfigure path.
    pub fn shutdown(&self) {
        self.transitions.shutdown();
    }
}

/// One parked side-channel update: the detector's own timestamp, damage
/// accumulated while receiving, and the raw payload blob.
#[derive(Debug)]
pub struct SideBuffer {
    pub time: Timestamp,
    pub damage: Damage,
    pub payload: Vec<u8>,
}

/// Freelist-backed queue of side-channel updates between a receiver thread
/// and the matching thread. Buffers cycle freelist → receiver → queue →
/// matcher → freelist; when the freelist is empty the update is dropped
/// and counted.
pub struct SideChannel {
    pub queue: SpscQueue<u32>,
    pub freelist: SpscQueue<u32>,
    buffers: Vec<Mutex<SideBuffer>>,
    pub n_updates: AtomicU64,
    pub n_missed: AtomicU64,
}

impl SideChannel {
    pub fn new(nbuffers: usize, buf_capacity: usize) -> Self {
        let nbuffers = nbuffers.max(2).next_power_of_two();
        let buffers = (0..nbuffers)
            .map(|_| {
                Mutex::new(SideBuffer {
                    time: Timestamp::default(),
                    damage: Damage::default(),
                    payload: Vec::with_capacity(buf_capacity),
                })
            })
            .collect();
        Self {
            queue: SpscQueue::new(nbuffers),
            freelist: SpscQueue::new(nbuffers),
            buffers,
            n_updates: AtomicU64::new(0),
            n_missed: AtomicU64::new(0),
        }
    }

    /// Open both queues and seed the freelist with every buffer.
    pub fn startup(&self) {
        self.queue.startup();
        self.freelist.startup();
        for i in 0..self.buffers.len() {
            self.freelist.push(i as u32);
        }
    }

    pub fn shutdown(&self) {
        self.queue.shutdown();
        self.freelist.shutdown();
    }

    /// Draw a buffer from the freelist, fill it through `write`, and park
    /// it on the update queue. Returns false (counting the miss) when no
    /// buffer is available.
    pub fn push_update<F>(&self, write: F) -> bool
    where
        F: FnOnce(&mut SideBuffer),
    {
        self.n_updates.fetch_add(1, Ordering::Relaxed);
        match self.freelist.try_pop() {
            Some(idx) => {
                {
                    let mut buf = self.buffers[idx as usize].lock();
                    buf.damage = Damage::default();
                    buf.payload.clear();
                    write(&mut buf);
                }
                self.queue.push(idx)
            }
            None => {
                self.n_missed.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Timestamp of the parked head update, without consuming it.
    pub fn peek_time(&self) -> Option<Timestamp> {
        let idx = self.queue.peek()?;
        Some(self.buffers[idx as usize].lock().time)
    }

    /// Run `f` against the head update without consuming it.
    pub fn with_head<R>(&self, f: impl FnOnce(&SideBuffer) -> R) -> Option<R> {
        let idx = self.queue.peek()?;
        Some(f(&self.buffers[idx as usize].lock()))
    }

    /// Consume the head update and return its buffer to the freelist.
    pub fn consume_head(&self) {
        if let Some(idx) = self.queue.try_pop() {
            self.freelist.push(idx);
        }
    }

    pub fn n_missed(&self) -> u64 {
        self.n_missed.load(Ordering::Relaxed)
    }

    pub fn n_updates(&self) -> u64 {
        self.n_updates.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dgram::{DamageFlag, PulseId, TimingHeader, TransitionId};
    use std::thread;
    use std::time::Duration;

    fn timing_header(sec: u32) -> TimingHeader {
        TimingHeader {
            timestamp: Timestamp::new(sec, 0),
            pulse_id: PulseId::new(u64::from(sec)),
            service: TransitionId::L1Accept,
            evt_counter: sec,
            rog_mask: 1,
        }
    }

    #[test]
    fn test_pebble_allocation_cycles_indices() {
        let mut pool = MemPool::new(4, 256, 2, 512);
        let a = pool.allocate();
        let b = pool.allocate();
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(pool.in_use(), 2);

        pool.free_pebble();
        pool.free_pebble();
        assert_eq!(pool.in_use(), 0);

        // Indices wrap modulo nbuffers.
        for _ in 0..4 {
            pool.allocate();
            pool.free_pebble();
        }
        assert_eq!(pool.allocate(), 2);
    }

    #[test]
    fn test_pebble_slot_stamped_from_timing_header() {
        let mut pool = MemPool::new(4, 256, 2, 512);
        let idx = pool.allocate();
        pool.pebble.get_mut(idx).init_from(&timing_header(9), 3, 1);
        let dgram = pool.pebble.get(idx);
        assert_eq!(dgram.time, Timestamp::new(9, 0));
        assert!(dgram.is_event());
    }

    #[test]
    fn test_transition_pool_blocks_until_free() {
        let pool = MemPool::new(4, 256, 1, 512);
        let transitions = pool.transitions();
        transitions.startup();

        let buf = transitions.allocate().expect("one buffer available");

        let waiter = {
            let transitions = Arc::clone(&transitions);
            thread::spawn(move || transitions.allocate().is_some())
        };

        thread::sleep(Duration::from_millis(50));
        transitions.free(buf);
        assert!(waiter.join().expect("waiter panicked"));
    }

    #[test]
    fn test_transition_pool_shutdown_returns_sentinel() {
        let pool = MemPool::new(4, 256, 1, 512);
        let transitions = pool.transitions();
        transitions.startup();
        let _held = transitions.allocate().expect("buffer");

        let waiter = {
            let transitions = Arc::clone(&transitions);
            thread::spawn(move || transitions.allocate())
        };

        thread::sleep(Duration::from_millis(50));
        pool.shutdown();
        assert!(waiter.join().expect("waiter panicked").is_none());
    }

    #[test]
    fn test_dma_accounting() {
        let pool = MemPool::new(8, 128, 2, 256);
        pool.count_dma(3);
        assert_eq!(pool.dma_in_use(), 3);
        pool.free_dma(3);
        assert_eq!(pool.dma_in_use(), 0);
    }

    #[test]
    fn test_side_channel_freelist_cycle() {
        let side = SideChannel::new(2, 16);
        side.startup();

        assert!(side.push_update(|buf| {
            buf.time = Timestamp::new(1, 0);
            buf.payload.extend_from_slice(&[7]);
        }));
        assert_eq!(side.peek_time(), Some(Timestamp::new(1, 0)));
        assert_eq!(side.with_head(|b| b.payload[0]), Some(7));

        side.consume_head();
        assert!(side.peek_time().is_none());
        assert_eq!(side.n_missed(), 0);
    }

    #[test]
    fn test_side_channel_drops_when_freelist_empty() {
        let side = SideChannel::new(2, 16);
        side.startup();

        assert!(side.push_update(|b| b.time = Timestamp::new(1, 0)));
        assert!(side.push_update(|b| b.time = Timestamp::new(2, 0)));
        // Freelist exhausted: the update is dropped and counted.
        assert!(!side.push_update(|b| b.time = Timestamp::new(3, 0)));
        assert_eq!(side.n_missed(), 1);
        assert_eq!(side.n_updates(), 3);
    }

    #[test]
    fn test_side_channel_damage_reset_between_uses() {
        let side = SideChannel::new(2, 16);
        side.startup();
        side.push_update(|b| {
            b.time = Timestamp::new(1, 0);
            b.damage.raise(DamageFlag::OutOfOrder);
        });
        side.consume_head();
        side.push_update(|b| b.time = Timestamp::new(2, 0));
        assert_eq!(side.with_head(|b| b.damage.is_clean()), Some(true));
    }
}
