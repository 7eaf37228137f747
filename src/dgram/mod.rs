//! Time and datagram model shared by every pipeline stage.

pub mod names;

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Seconds between the POSIX epoch (1970-01-01) and the EPICS epoch
/// (1990-01-01), used to convert hardware timestamps to wall clock.
pub const POSIX_TIME_AT_EPICS_EPOCH: u64 = 631_152_000;

/// Fixed size of the contribution header preceding the payload section.
/// Counts toward the per-service buffer budget (see `buffer_size`).
pub const DGRAM_HEADER_SIZE: usize = 24;

/// 64-bit composite timestamp: high 32 bits are seconds since the EPICS
/// epoch, low 32 bits are nanoseconds.
///
/// Ordering and deltas use the full 64-bit value. The timing hardware emits
/// these in monotone non-strict increasing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Sentinel greater than every real timestamp, used for sweep timeouts.
    pub const MAX: Timestamp = Timestamp(u64::MAX);

    /// Build from a seconds/nanoseconds pair.
    pub fn new(seconds: u32, nanoseconds: u32) -> Self {
        Self((u64::from(seconds) << 32) | u64::from(nanoseconds))
    }

    /// Build from the raw 64-bit value.
    pub fn from_value(value: u64) -> Self {
        Self(value)
    }

    /// The raw 64-bit value used for ordering and matching.
    pub fn value(self) -> u64 {
        self.0
    }

    pub fn seconds(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn nanoseconds(self) -> u32 {
        self.0 as u32
    }

    /// Total nanoseconds since the EPICS epoch.
    pub fn to_ns(self) -> u64 {
        u64::from(self.seconds()) * 1_000_000_000 + u64::from(self.nanoseconds())
    }

    /// Inverse of [`to_ns`](Self::to_ns).
    pub fn from_ns(ns: u64) -> Self {
        Self::new((ns / 1_000_000_000) as u32, (ns % 1_000_000_000) as u32)
    }

    /// The current wall clock expressed on the EPICS epoch.
    pub fn now() -> Self {
        let since_posix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        let epics = since_posix
            .checked_sub(Duration::from_secs(POSIX_TIME_AT_EPICS_EPOCH))
            .unwrap_or(Duration::ZERO);
        Self::new(epics.as_secs() as u32, epics.subsec_nanos())
    }

    /// Milliseconds elapsed between this timestamp and now; negative when
    /// the timestamp lies in the future.
    pub fn age_ms(self) -> i64 {
        let now = Self::now().to_ns() as i64;
        (now - self.to_ns() as i64) / 1_000_000
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.seconds(), self.nanoseconds())
    }
}

/// 40-bit monotonic identifier assigned per accelerator shot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PulseId(u64);

impl PulseId {
    pub const MASK: u64 = (1 << 40) - 1;

    pub fn new(value: u64) -> Self {
        Self(value & Self::MASK)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PulseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:014x}", self.0)
    }
}

/// Service carried by a timing header. `L1Accept` is the triggered event
/// requiring a payload; everything else is a run-lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TransitionId {
    ClearReadout = 0,
    Reset = 1,
    Configure = 2,
    Unconfigure = 3,
    BeginRun = 4,
    EndRun = 5,
    BeginStep = 6,
    EndStep = 7,
    Enable = 8,
    Disable = 9,
    SlowUpdate = 10,
    L1Accept = 12,
}

/// Maximum raw TransitionId value, used for array sizing.
pub const MAX_TRANSITION_ID: usize = 12;

impl TransitionId {
    /// Returns the canonical metric/log label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ClearReadout => "ClearReadout",
            Self::Reset => "Reset",
            Self::Configure => "Configure",
            Self::Unconfigure => "Unconfigure",
            Self::BeginRun => "BeginRun",
            Self::EndRun => "EndRun",
            Self::BeginStep => "BeginStep",
            Self::EndStep => "EndStep",
            Self::Enable => "Enable",
            Self::Disable => "Disable",
            Self::SlowUpdate => "SlowUpdate",
            Self::L1Accept => "L1Accept",
        }
    }

    /// Convert from a raw u8 value.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::ClearReadout),
            1 => Some(Self::Reset),
            2 => Some(Self::Configure),
            3 => Some(Self::Unconfigure),
            4 => Some(Self::BeginRun),
            5 => Some(Self::EndRun),
            6 => Some(Self::BeginStep),
            7 => Some(Self::EndStep),
            8 => Some(Self::Enable),
            9 => Some(Self::Disable),
            10 => Some(Self::SlowUpdate),
            12 => Some(Self::L1Accept),
            _ => None,
        }
    }

    /// True for the event service, false for transitions.
    pub fn is_event(self) -> bool {
        matches!(self, Self::L1Accept)
    }
}

impl fmt::Display for TransitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single damage condition. Bit positions are stable; they appear in the
/// recorded data stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum DamageFlag {
    DroppedContribution = 1 << 0,
    OutOfOrder = 1 << 1,
    UserDefined = 1 << 2,
    MissingData = 1 << 3,
    TimedOut = 1 << 4,
    Truncated = 1 << 5,
}

/// Accumulated damage bits for one contribution. Monotone: bits are only
/// ever set, never cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Damage(u16);

impl Damage {
    pub fn raise(&mut self, flag: DamageFlag) {
        self.0 |= flag as u16;
    }

    /// Merge another damage word in (e.g. side-channel damage onto the
    /// trigger's contribution).
    pub fn increase(&mut self, other: Damage) {
        self.0 |= other.0;
    }

    pub fn contains(self, flag: DamageFlag) -> bool {
        self.0 & (flag as u16) != 0
    }

    pub fn value(self) -> u16 {
        self.0
    }

    pub fn is_clean(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Damage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// One entry of the hardware timing stream, produced per accepted trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingHeader {
    pub timestamp: Timestamp,
    pub pulse_id: PulseId,
    pub service: TransitionId,
    pub evt_counter: u32,
    /// Readout-group mask from the trigger environment word.
    pub rog_mask: u8,
}

/// Bounds-checked payload section of a contribution. The on-the-wire tree
/// layout is supplied by the serialization library; here it is an opaque
/// byte region with a damage word.
#[derive(Debug, Clone)]
pub struct Xtc {
    pub damage: Damage,
    payload: Vec<u8>,
    capacity: usize,
}

impl Xtc {
    /// An empty payload region that can grow to `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            damage: Damage::default(),
            payload: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Reset for reuse. Damage is cleared here because the slot is being
    /// recycled for a new trigger, not because damage was healed.
    pub fn reset(&mut self) {
        self.damage = Damage::default();
        self.payload.clear();
    }

    /// Reserve `len` zeroed bytes at the end of the payload and return the
    /// writable slice, or `None` when the region would exceed capacity.
    pub fn alloc(&mut self, len: usize) -> Option<&mut [u8]> {
        let start = self.payload.len();
        if start + len > self.capacity {
            return None;
        }
        self.payload.resize(start + len, 0);
        Some(&mut self.payload[start..])
    }

    /// Append bytes, truncating at capacity. Returns the number of bytes
    /// actually written.
    pub fn append_truncating(&mut self, data: &[u8]) -> usize {
        let room = self.capacity - self.payload.len();
        let n = data.len().min(room);
        self.payload.extend_from_slice(&data[..n]);
        n
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn sizeof_payload(&self) -> usize {
        self.payload.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A contribution datagram: fixed header plus an opaque payload tree.
///
/// Lives in a pebble slot (L1Accepts) or a transition buffer (everything
/// else) and is copied into the event-builder input slot on emission.
#[derive(Debug, Clone)]
pub struct EbDgram {
    pub time: Timestamp,
    pub pulse_id: PulseId,
    pub service: TransitionId,
    pub src: u32,
    pub rog_mask: u8,
    pub env: u32,
    pub xtc: Xtc,
}

impl EbDgram {
    /// An empty datagram with the given payload capacity, ready to be
    /// stamped by [`init_from`](Self::init_from).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            time: Timestamp::default(),
            pulse_id: PulseId::default(),
            service: TransitionId::ClearReadout,
            src: 0,
            rog_mask: 0,
            env: 0,
            xtc: Xtc::with_capacity(capacity),
        }
    }

    /// Stamp this slot from a timing header, clearing any previous payload.
    pub fn init_from(&mut self, th: &TimingHeader, src: u32, rog_mask: u8) {
        self.time = th.timestamp;
        self.pulse_id = th.pulse_id;
        self.service = th.service;
        self.src = src;
        self.rog_mask = rog_mask;
        self.env = u32::from(th.rog_mask);
        self.xtc.reset();
    }

    /// Copy header fields (not the payload) from another datagram.
    pub fn copy_header(&mut self, other: &EbDgram) {
        self.time = other.time;
        self.pulse_id = other.pulse_id;
        self.service = other.service;
        self.src = other.src;
        self.rog_mask = other.rog_mask;
        self.env = other.env;
        self.xtc.reset();
        self.xtc.damage = other.xtc.damage;
    }

    pub fn is_event(&self) -> bool {
        self.service.is_event()
    }

    /// Header plus payload size, checked against the per-service budget
    /// before emission.
    pub fn total_size(&self) -> usize {
        DGRAM_HEADER_SIZE + self.xtc.sizeof_payload()
    }
}
