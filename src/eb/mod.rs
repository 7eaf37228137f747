//! Contribution emission toward the event builder.
//!
//! The contribution transport is an external collaborator; this module owns
//! only the seam ([`EbSink`]), the trigger-primitive hook, and the size
//! discipline every emitted datagram must satisfy.

use std::sync::mpsc::Sender;

use tracing::error;

use crate::dgram::{Damage, EbDgram, PulseId, Timestamp, TransitionId, DGRAM_HEADER_SIZE};

/// A contribution as handed to the event-builder transport.
#[derive(Debug, Clone)]
pub struct Contribution {
    pub time: Timestamp,
    pub pulse_id: PulseId,
    pub service: TransitionId,
    pub src: u32,
    pub rog_mask: u8,
    pub damage: Damage,
    pub payload: Vec<u8>,
}

impl Contribution {
    fn empty() -> Self {
        Self {
            time: Timestamp::default(),
            pulse_id: PulseId::default(),
            service: TransitionId::ClearReadout,
            src: 0,
            rog_mask: 0,
            damage: Damage::default(),
            payload: Vec::new(),
        }
    }

    fn fill_from(&mut self, dgram: &EbDgram) {
        self.time = dgram.time;
        self.pulse_id = dgram.pulse_id;
        self.service = dgram.service;
        self.src = dgram.src;
        self.rog_mask = dgram.rog_mask;
        self.damage = dgram.xtc.damage;
        self.payload.clear();
        self.payload.extend_from_slice(dgram.xtc.payload());
    }

    pub fn total_size(&self) -> usize {
        DGRAM_HEADER_SIZE + self.payload.len()
    }
}

/// Event-builder input seam: fetch a slot, populate it, hand it over.
pub trait EbSink: Send {
    /// Input slot paired with the given pebble/transition index.
    fn fetch(&mut self, index: u32) -> &mut Contribution;

    /// Transfer ownership of the populated slot to the event builder.
    fn process(&mut self, index: u32);

    /// Flush any partially built batch.
    fn timeout(&mut self);

    /// Batch depth of the downstream builder, sizing the idle-flush timer.
    fn max_entries(&self) -> usize;
}

/// Per-contribution input to the global trigger decision, appended to
/// L1Accept contributions when configured.
pub trait TriggerPrimitive: Send {
    /// Bytes this primitive appends.
    fn size(&self) -> usize;

    /// Append the primitive for the event held at `index`.
    fn emit(&mut self, index: u32, payload: &mut Vec<u8>);
}

/// Test/loopback sink: slots are plain buffers and `process` forwards a
/// copy over a channel.
pub struct ChannelSink {
    slots: Vec<Contribution>,
    tx: Sender<Contribution>,
    max_entries: usize,
    pub n_timeouts: u64,
}

impl ChannelSink {
    pub fn new(nslots: usize, tx: Sender<Contribution>) -> Self {
        Self {
            slots: (0..nslots.max(1)).map(|_| Contribution::empty()).collect(),
            tx,
            max_entries: 64,
            n_timeouts: 0,
        }
    }
}

impl EbSink for ChannelSink {
    fn fetch(&mut self, index: u32) -> &mut Contribution {
        let n = self.slots.len();
        &mut self.slots[index as usize % n]
    }

    fn process(&mut self, index: u32) {
        let n = self.slots.len();
        let slot = &self.slots[index as usize % n];
        // The receiver may already be gone during shutdown.
        let _ = self.tx.send(slot.clone());
    }

    fn timeout(&mut self) {
        self.n_timeouts += 1;
    }

    fn max_entries(&self) -> usize {
        self.max_entries
    }
}

/// Size-check, build, and hand one datagram to the event builder.
///
/// Panics on a payload that exceeds the per-service buffer budget: the
/// producers are bounds-checked, so an oversized datagram is programmer
/// error and the process is not safe to continue.
pub fn send_to_teb(
    sink: &mut dyn EbSink,
    trigger: Option<&mut (dyn TriggerPrimitive + 'static)>,
    dgram: &EbDgram,
    index: u32,
    pebble_buf_size: usize,
    max_tr_size: usize,
) {
    let size = dgram.total_size();
    let max_size = if dgram.is_event() {
        pebble_buf_size
    } else {
        max_tr_size
    };
    if size > max_size {
        error!(
            service = %dgram.service,
            size,
            max_size,
            "datagram overflowed buffer",
        );
        panic!(
            "{} dgram of size {size} overflowed buffer of size {max_size}",
            dgram.service
        );
    }

    let slot = sink.fetch(index);
    slot.fill_from(dgram);
    if dgram.is_event() {
        if let Some(tp) = trigger {
            tp.emit(index, &mut slot.payload);
        }
    }
    sink.process(index);
}
