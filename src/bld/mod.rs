//! Beam-line data (BLD) receiver: UDP-multicast packets carrying one base
//! event plus delta-encoded followers, decoded through a cursor over the
//! currently held datagram.

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use crate::dgram::names::{Name, ScalarKind, VarDef};
use crate::dgram::Timestamp;

/// Default multicast port for BLD services.
pub const BLD_PORT: u16 = 10148;

/// Largest datagram a BLD service can send; payload copies are bounded by
/// this.
pub const MTU: usize = 65535;

/// Base header: pulseId(8) + timestamp(8) + id(4) + severity(8).
pub const BLD_HEADER_SIZE: usize = 28;

/// Packed delta word preceding each follower event:
/// `(pulseIdDelta:12) << 20 | (timestampDelta:20)`.
pub const BLD_DELTA_SIZE: usize = 4;

/// Socket receive buffer; the services burst faster than the matcher
/// drains during transitions.
const RCVBUF_SIZE: usize = 0x0100_0000;

/// Timestamp correction for services that publish on the older epoch.
const TSCORR_DEFAULT: u64 = 0x259e_9d80 << 32;

/// One side-channel detector flavor. The four LCLS1-style services carry
/// hard-coded field lists; newer services describe themselves through
/// process variables.
#[derive(Debug, Clone, PartialEq)]
pub enum BldKind {
    Ebeam { hxr: bool },
    PCav { hxr: bool },
    Gmd,
    XGmd,
    PvaDescribed(VarDef),
}

impl BldKind {
    /// Resolve a hard-coded service name. A leading `<prefix>:` is ignored,
    /// as the control system qualifies names per hutch.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.rsplit(':').next().unwrap_or(name);
        if let Some(rest) = name.strip_prefix("ebeam") {
            return Some(Self::Ebeam { hxr: rest == "h" });
        }
        if let Some(rest) = name.strip_prefix("pcav") {
            return Some(Self::PCav { hxr: rest == "h" });
        }
        match name {
            "gmd" => Some(Self::Gmd),
            "xgmd" => Some(Self::XGmd),
            _ => None,
        }
    }

    /// Multicast group for the hard-coded services.
    pub fn mcaddr(&self) -> Option<Ipv4Addr> {
        let raw: u32 = match self {
            Self::Ebeam { hxr: true } => 0xefff_1800,
            Self::Ebeam { hxr: false } => 0xefff_1900,
            Self::PCav { hxr: true } => 0xefff_1801,
            Self::PCav { hxr: false } => 0xefff_1901,
            Self::Gmd => 0xefff_1902,
            Self::XGmd => 0xefff_1903,
            Self::PvaDescribed(_) => return None,
        };
        Some(Ipv4Addr::from(raw))
    }

    /// Epoch correction added to the packet timestamp.
    pub fn tscorr(&self) -> u64 {
        match self {
            Self::Ebeam { .. } | Self::PvaDescribed(_) => 0,
            _ => TSCORR_DEFAULT,
        }
    }

    pub fn var_def(&self) -> VarDef {
        let mut vd = VarDef::default();
        match self {
            Self::Ebeam { .. } => {
                vd.push(Name::scalar("damageMask", ScalarKind::U32));
                vd.push(Name::scalar("ebeamCharge", ScalarKind::F64));
                vd.push(Name::scalar("ebeamL3Energy", ScalarKind::F64));
                vd.push(Name::scalar("ebeamLTUPosX", ScalarKind::F64));
                vd.push(Name::scalar("ebeamLTUPosY", ScalarKind::F64));
                vd.push(Name::scalar("ebeamLTUAngX", ScalarKind::F64));
                vd.push(Name::scalar("ebeamLTUAngY", ScalarKind::F64));
                vd.push(Name::scalar("ebeamPkCurrBC2", ScalarKind::F64));
            }
            Self::PCav { .. } => {
                vd.push(Name::scalar("fitTime1", ScalarKind::F64));
                vd.push(Name::scalar("fitTime2", ScalarKind::F64));
                vd.push(Name::scalar("charge1", ScalarKind::F64));
                vd.push(Name::scalar("charge2", ScalarKind::F64));
            }
            Self::Gmd | Self::XGmd => {
                vd.push(Name::scalar("energy", ScalarKind::F64));
                vd.push(Name::scalar("xpos", ScalarKind::F64));
                vd.push(Name::scalar("ypos", ScalarKind::F64));
                vd.push(Name::scalar("avgIntensity", ScalarKind::F64));
                vd.push(Name::scalar("rmsElectronSum", ScalarKind::I64));
                vd.push(Name::scalar("electron1BkgNoiseAvg", ScalarKind::I16));
                vd.push(Name::scalar("electron2BkgNoiseAvg", ScalarKind::I16));
            }
            Self::PvaDescribed(def) => return def.clone(),
        }
        vd
    }
}

/// Multicast parameters for a PV-described service, published through the
/// `<id>:ADDR` / `<id>:PORT` / `<id>:PAYLOAD` process variables. The PV
/// transport itself lives outside this crate.
pub trait BldDescriptorSource: Send {
    /// True once all three variables have resolved.
    fn ready(&self) -> bool;
    fn addr(&self) -> Ipv4Addr;
    fn port(&self) -> u16;
    fn var_def(&self) -> VarDef;
}

/// Block until a descriptor source resolves, polling every 10 ms.
pub fn wait_for_descriptor(src: &dyn BldDescriptorSource) -> (Ipv4Addr, u16, VarDef) {
    while !src.ready() {
        std::thread::sleep(Duration::from_millis(10));
    }
    (src.addr(), src.port(), src.var_def())
}

/// One entry of the `-D` detector list: a hard-coded name, or
/// `name+type+id` for PV-driven discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BldSpec {
    Named(String),
    Pva {
        det_name: String,
        det_type: String,
        det_id: String,
    },
}

/// Split a comma-separated `-D` list into specs.
pub fn parse_detector_list(s: &str) -> Result<Vec<BldSpec>> {
    let mut specs = Vec::new();
    for part in s.split(',').filter(|p| !p.is_empty() && *p != ".") {
        if part.contains('+') {
            let mut it = part.splitn(3, '+');
            let det_name = it.next().unwrap_or_default();
            let det_type = it.next().unwrap_or_default();
            let det_id = it.next().unwrap_or_default();
            if det_name.is_empty() || det_type.is_empty() || det_id.is_empty() {
                bail!("malformed BLD spec '{part}', expected name+type+id");
            }
            specs.push(BldSpec::Pva {
                det_name: det_name.to_string(),
                det_type: det_type.to_string(),
                det_id: det_id.to_string(),
            });
        } else {
            if BldKind::from_name(part).is_none() {
                bail!("BLD name '{part}' not recognized");
            }
            specs.push(BldSpec::Named(part.to_string()));
        }
    }
    if specs.is_empty() {
        bail!("empty BLD detector list");
    }
    Ok(specs)
}

fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64_le(data: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

/// Receiver for one BLD service. Holds the current datagram and a cursor
/// describing where the next event sits; `position <= buffer_size` always,
/// and a follower's payload lies at `position + 4`.
pub struct Bld {
    sock: UdpSocket,
    payload_size: usize,
    ts_corr: u64,
    buffer: Vec<u8>,
    buffer_size: usize,
    position: usize,
    payload_off: usize,
    pulse_id: u64,
    pulse_id_jump: u64,
    jumps: Arc<AtomicU64>,
}

impl Bld {
    /// Bind to `group:port` with a 16 MiB receive buffer, joining the
    /// multicast group on `interface` when `group` is a multicast address.
    pub fn open(
        group: Ipv4Addr,
        port: u16,
        interface: Ipv4Addr,
        payload_size: usize,
        ts_corr: u64,
        jumps: Arc<AtomicU64>,
    ) -> Result<Self> {
        let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .context("opening BLD socket")?;
        sock.set_recv_buffer_size(RCVBUF_SIZE)
            .context("setting SO_RCVBUF")?;
        sock.set_reuse_address(true).context("setting SO_REUSEADDR")?;
        sock.bind(&SocketAddrV4::new(group, port).into())
            .with_context(|| format!("binding {group}:{port}"))?;

        let sock: UdpSocket = sock.into();
        if group.is_multicast() {
            sock.join_multicast_v4(&group, &interface)
                .with_context(|| format!("joining multicast {group} on {interface}"))?;
        }
        sock.set_nonblocking(true)
            .context("setting BLD socket nonblocking")?;

        info!(%group, port, payload_size, "BLD listening");

        Ok(Self {
            sock,
            payload_size,
            ts_corr,
            buffer: vec![0u8; MTU],
            buffer_size: 0,
            position: 0,
            payload_off: 0,
            pulse_id: 0,
            pulse_id_jump: 0,
            jumps,
        })
    }

    fn header_timestamp(&self) -> u64 {
        read_u64_le(&self.buffer, 8).wrapping_add(self.ts_corr)
    }

    fn header_pulse_id(&self) -> u64 {
        read_u64_le(&self.buffer, 0)
    }

    fn delta_word(&self) -> u32 {
        read_u32_le(&self.buffer, self.position)
    }

    /// Payload bytes of the event the cursor last produced.
    pub fn payload(&self) -> &[u8] {
        &self.buffer[self.payload_off..self.payload_off + self.payload_size]
    }

    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    fn recv_packet(&mut self) -> bool {
        match self.sock.recv(&mut self.buffer) {
            Ok(n) => {
                if n < BLD_HEADER_SIZE + self.payload_size {
                    // Short reads are fatal for the packet, not the stream.
                    warn!(bytes = n, "short BLD packet dropped");
                    return false;
                }
                self.buffer_size = n;
                true
            }
            Err(_) => false,
        }
    }

    fn record_jump(&mut self, pulse_id: u64) {
        let jump = pulse_id.wrapping_sub(self.pulse_id);
        self.pulse_id = pulse_id;
        if jump != self.pulse_id_jump {
            self.pulse_id_jump = jump;
            self.jumps.fetch_add(1, Ordering::Relaxed);
            warn!(jump, pulse_id, "BLD pulseId jump");
        }
    }

    /// Advance the cursor to the next event, reading a fresh datagram when
    /// the current one is spent. Returns the event timestamp, or the zero
    /// timestamp when nothing is available.
    pub fn next(&mut self) -> Timestamp {
        let (timestamp, pulse_id);

        if self.position + self.payload_size + BLD_DELTA_SIZE > self.buffer_size {
            if !self.recv_packet() {
                return Timestamp::default();
            }
            timestamp = self.header_timestamp();
            pulse_id = self.header_pulse_id();
            self.payload_off = BLD_HEADER_SIZE;
            self.position = BLD_HEADER_SIZE + self.payload_size;
        } else if self.position == 0 {
            // A packet parked by clear(); its base event is still unread.
            timestamp = self.header_timestamp();
            pulse_id = self.header_pulse_id();
            self.payload_off = BLD_HEADER_SIZE;
            self.position = BLD_HEADER_SIZE + self.payload_size;
        } else {
            let delta = self.delta_word();
            timestamp = self.header_timestamp() + u64::from(delta & 0xfffff);
            pulse_id = self.header_pulse_id() + u64::from((delta >> 20) & 0xfff);
            self.payload_off = self.position + BLD_DELTA_SIZE;
            self.position += BLD_DELTA_SIZE + self.payload_size;
        }

        debug!(timestamp, pulse_id, "BLD next");
        self.record_jump(pulse_id);
        Timestamp::from_value(timestamp)
    }

    /// Read ahead, discarding every event older than `ts`. Stops at the
    /// first event with `timestamp >= ts`, leaving it unconsumed.
    pub fn clear(&mut self, ts: Timestamp) {
        loop {
            let (timestamp, pulse_id);

            if self.position + self.payload_size + BLD_DELTA_SIZE > self.buffer_size {
                if !self.recv_packet() {
                    break;
                }
                timestamp = self.header_timestamp();
                if timestamp >= ts.value() {
                    // Park the packet; next() re-reads its base event.
                    self.position = 0;
                    break;
                }
                pulse_id = self.header_pulse_id();
                self.payload_off = BLD_HEADER_SIZE;
                self.position = BLD_HEADER_SIZE + self.payload_size;
            } else if self.position == 0 {
                timestamp = self.header_timestamp();
                if timestamp >= ts.value() {
                    break;
                }
                pulse_id = self.header_pulse_id();
                self.payload_off = BLD_HEADER_SIZE;
                self.position = BLD_HEADER_SIZE + self.payload_size;
            } else {
                let delta = self.delta_word();
                timestamp = self.header_timestamp() + u64::from(delta & 0xfffff);
                if timestamp >= ts.value() {
                    break;
                }
                pulse_id = self.header_pulse_id() + u64::from((delta >> 20) & 0xfff);
                self.payload_off = self.position + BLD_DELTA_SIZE;
                self.position += BLD_DELTA_SIZE + self.payload_size;
            }

            self.record_jump(pulse_id);
        }
    }
}

/// A fully resolved BLD source: identity, schema, and its receiver.
pub struct BldSource {
    pub det_name: String,
    pub det_type: String,
    pub det_id: String,
    pub var_def: VarDef,
    pub receiver: Bld,
}

impl BldSource {
    /// Build a hard-coded source on the given interface.
    pub fn from_name(name: &str, interface: Ipv4Addr, jumps: Arc<AtomicU64>) -> Result<Self> {
        let kind =
            BldKind::from_name(name).with_context(|| format!("BLD name '{name}' not recognized"))?;
        let var_def = kind.var_def();
        let group = kind.mcaddr().expect("hard-coded kinds carry a group");
        let receiver = Bld::open(
            group,
            BLD_PORT,
            interface,
            var_def.payload_size(),
            kind.tscorr(),
            jumps,
        )?;
        Ok(Self {
            det_name: name.to_string(),
            det_type: name.to_string(),
            det_id: name.to_string(),
            var_def,
            receiver,
        })
    }

    /// Build a PV-described source, blocking until its descriptor PVs
    /// resolve.
    pub fn from_descriptor(
        det_name: &str,
        det_type: &str,
        det_id: &str,
        src: &dyn BldDescriptorSource,
        interface: Ipv4Addr,
        jumps: Arc<AtomicU64>,
    ) -> Result<Self> {
        info!(det_name, det_type, det_id, "looking up multicast parameters");
        let (group, port, var_def) = wait_for_descriptor(src);
        let receiver = Bld::open(group, port, interface, var_def.payload_size(), 0, jumps)?;
        Ok(Self {
            det_name: det_name.to_string(),
            det_type: det_type.to_string(),
            det_id: det_id.to_string(),
            var_def,
            receiver,
        })
    }
}
