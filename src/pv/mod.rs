//! Process-variable monitor: subscribes to one named PV, normalizes its
//! payload and EPICS timestamp, and parks each update for the matcher.
//!
//! The PV access protocol (pva/ca) is an external collaborator behind
//! [`PvClient`]; this module owns schema resolution, the freelist-backed
//! update path, and disconnect reporting.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::control::Notifier;
use crate::dgram::names::{Name, ScalarKind, VarDef};
use crate::dgram::{DamageFlag, Timestamp};
use crate::pool::SideChannel;

/// How long Configure waits for the payload schema to resolve.
const SCHEMA_TMO: Duration = Duration::from_secs(3);

/// PV transport flavor. `pva` is the newer transport, `ca` the legacy one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Pva,
    Ca,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pva => "pva",
            Self::Ca => "ca",
        }
    }
}

/// Parsed `[<provider>/]<name>[.<field>]` descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PvDescriptor {
    pub provider: Provider,
    pub name: String,
    pub field: String,
}

impl PvDescriptor {
    pub fn parse(s: &str) -> Result<Self> {
        let mut provider = Provider::Pva;
        let mut rest = s;

        if let Some((p, r)) = s.split_once('/') {
            provider = match p {
                "pva" => Provider::Pva,
                "ca" => Provider::Ca,
                other => bail!("unknown PV provider '{other}'"),
            };
            rest = r;
        }

        let (name, field) = match rest.split_once('.') {
            Some((n, f)) => (n, f),
            None => (rest, "value"),
        };
        if name.is_empty() {
            bail!("empty PV name in '{s}'");
        }

        Ok(Self {
            provider,
            name: name.to_string(),
            field: field.to_string(),
        })
    }

    /// Subscription request string for the transport layer.
    pub fn request(&self) -> &'static str {
        match self.provider {
            Provider::Pva => "field(value,timeStamp,dimension)",
            Provider::Ca => "field(value,timeStamp)",
        }
    }
}

/// Payload schema of a connected PV.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PvParams {
    pub scalar: ScalarKind,
    pub nelem: usize,
    pub rank: u32,
}

/// Callbacks a PV client fires from its own thread.
pub trait PvSink: Send + Sync {
    fn connected(&self);
    fn disconnected(&self);
    /// A value update carrying its EPICS timestamp.
    fn updated(&self, timestamp: Timestamp);
}

/// Facade over the PV transport. Implementations live outside this crate;
/// [`SimPvClient`] stands in for tests.
pub trait PvClient: Send + Sync {
    fn name(&self) -> &str;

    /// Begin monitoring; callbacks target `sink` from the client's thread.
    fn subscribe(&self, sink: Arc<dyn PvSink>) -> Result<()>;

    /// Introspected payload schema, `None` until the first update reveals
    /// it.
    fn params(&self) -> Option<PvParams>;

    /// Copy the latest value verbatim into `buf` (replacing its contents).
    fn copy_data(&self, buf: &mut Vec<u8>);
}

struct SchemaState {
    params: Option<PvParams>,
}

/// Bridges a [`PvClient`] to the side-channel queue feeding the matcher.
pub struct PvMonitor {
    client: Arc<dyn PvClient>,
    side: Arc<SideChannel>,
    running: Arc<AtomicBool>,
    notifier: Notifier,
    alias: String,
    field: String,
    first_dim: u32,
    buf_capacity: usize,
    schema: Mutex<SchemaState>,
    schema_ready: Condvar,
}

impl PvMonitor {
    pub fn new(
        client: Arc<dyn PvClient>,
        side: Arc<SideChannel>,
        running: Arc<AtomicBool>,
        notifier: Notifier,
        alias: &str,
        field: &str,
        first_dim: u32,
        buf_capacity: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            side,
            running,
            notifier,
            alias: alias.to_string(),
            field: field.to_string(),
            first_dim,
            buf_capacity,
            schema: Mutex::new(SchemaState { params: None }),
            schema_ready: Condvar::new(),
        })
    }

    /// Start monitoring the PV.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let sink: Arc<dyn PvSink> = Arc::clone(self) as Arc<dyn PvSink>;
        self.client.subscribe(sink)
    }

    /// Forget the resolved schema so the next Configure starts afresh.
    pub fn clear(&self) {
        self.schema.lock().params = None;
    }

    /// Resolve the payload schema, waiting up to 3 s for the client.
    /// Failure is reported on the async error channel and returned.
    pub fn get_var_def(&self) -> Result<(VarDef, usize)> {
        let mut g = self.schema.lock();
        if g.params.is_none() {
            if let Some(p) = self.client.params() {
                g.params = Some(p);
            } else {
                self.schema_ready.wait_for(&mut g, SCHEMA_TMO);
                if g.params.is_none() {
                    let msg = format!("Failed to get parameters for PV {}", self.client.name());
                    warn!("{msg}");
                    self.notifier.error(&self.alias, &msg);
                    bail!(msg);
                }
            }
        }
        let params = g.params.expect("checked above");
        drop(g);

        let mut rank = params.rank;
        if self.first_dim != 0 {
            rank = 2;
            warn!(
                pv = self.client.name(),
                from = params.rank,
                to = rank,
                "rank overridden by firstdim",
            );
        }

        let mut var_def = VarDef::default();
        var_def.push(Name::array(&self.field, params.scalar, rank));
        let payload_size = params.nelem * params.scalar.size();
        Ok((var_def, payload_size))
    }

    pub fn name(&self) -> &str {
        self.client.name()
    }

    fn process(&self, timestamp: Timestamp) {
        debug!(pv = self.client.name(), %timestamp, "PV updated");
        let client = &self.client;
        let capacity = self.buf_capacity;
        self.side.push_update(|buf| {
            buf.time = timestamp;
            client.copy_data(&mut buf.payload);
            if buf.payload.len() > capacity {
                // The value is copied verbatim; an oversized one is cut at
                // the pebble budget and flagged.
                buf.payload.truncate(capacity);
                buf.damage.raise(DamageFlag::Truncated);
            }
        });
    }
}

impl PvSink for PvMonitor {
    fn connected(&self) {
        info!(pv = self.client.name(), "PV connected");
    }

    fn disconnected(&self) {
        let msg = format!("PV {} disconnected", self.client.name());
        warn!("{msg}");
        self.notifier.error(&self.alias, &msg);
    }

    fn updated(&self, timestamp: Timestamp) {
        let ready = self.schema.lock().params.is_some();
        if ready {
            // Guard against the dictionary not being stable before Enable.
            if self.running.load(Ordering::Relaxed) {
                self.process(timestamp);
            }
        } else if let Some(p) = self.client.params() {
            self.schema.lock().params = Some(p);
            self.schema_ready.notify_one();
        }
    }
}

/// In-memory PV client used by tests and the descriptor-discovery stub.
pub struct SimPvClient {
    name: String,
    params: Mutex<Option<PvParams>>,
    value: Mutex<Vec<u8>>,
    sink: Mutex<Option<Arc<dyn PvSink>>>,
}

impl SimPvClient {
    pub fn new(name: &str, params: Option<PvParams>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            params: Mutex::new(params),
            value: Mutex::new(Vec::new()),
            sink: Mutex::new(None),
        })
    }

    pub fn set_params(&self, params: PvParams) {
        *self.params.lock() = Some(params);
    }

    pub fn set_value(&self, bytes: &[u8]) {
        let mut v = self.value.lock();
        v.clear();
        v.extend_from_slice(bytes);
    }

    /// Fire one value update at the subscribed sink.
    pub fn update(&self, timestamp: Timestamp) {
        if let Some(sink) = self.sink.lock().clone() {
            sink.updated(timestamp);
        }
    }

    pub fn fire_disconnect(&self) {
        if let Some(sink) = self.sink.lock().clone() {
            sink.disconnected();
        }
    }
}

impl PvClient for SimPvClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn subscribe(&self, sink: Arc<dyn PvSink>) -> Result<()> {
        sink.connected();
        *self.sink.lock() = Some(sink);
        Ok(())
    }

    fn params(&self) -> Option<PvParams> {
        *self.params.lock()
    }

    fn copy_data(&self, buf: &mut Vec<u8>) {
        let v = self.value.lock();
        buf.clear();
        buf.extend_from_slice(&v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor_with_sim(
        params: Option<PvParams>,
        capacity: usize,
    ) -> (Arc<PvMonitor>, Arc<SimPvClient>, Arc<SideChannel>, Arc<AtomicBool>) {
        let client = SimPvClient::new("TST:PV:01", params);
        let side = Arc::new(SideChannel::new(4, capacity));
        side.startup();
        let running = Arc::new(AtomicBool::new(true));
        let monitor = PvMonitor::new(
            Arc::clone(&client) as Arc<dyn PvClient>,
            Arc::clone(&side),
            Arc::clone(&running),
            Notifier::disabled(),
            "tst_0",
            "value",
            0,
            capacity,
        );
        monitor.start().expect("subscribe");
        (monitor, client, side, running)
    }

    #[test]
    fn test_descriptor_defaults() {
        let d = PvDescriptor::parse("TST:GAUGE:01").expect("valid");
        assert_eq!(d.provider, Provider::Pva);
        assert_eq!(d.name, "TST:GAUGE:01");
        assert_eq!(d.field, "value");
        assert_eq!(d.request(), "field(value,timeStamp,dimension)");
    }

    #[test]
    fn test_descriptor_provider_and_field() {
        let d = PvDescriptor::parse("ca/TST:GAUGE:01.RBV").expect("valid");
        assert_eq!(d.provider, Provider::Ca);
        assert_eq!(d.name, "TST:GAUGE:01");
        assert_eq!(d.field, "RBV");
        assert_eq!(d.request(), "field(value,timeStamp)");
    }

    #[test]
    fn test_descriptor_rejects_unknown_provider() {
        assert!(PvDescriptor::parse("http/TST:PV").is_err());
    }

    #[test]
    fn test_var_def_from_resolved_schema() {
        let params = PvParams {
            scalar: ScalarKind::F64,
            nelem: 3,
            rank: 1,
        };
        let (monitor, _client, _side, _running) = monitor_with_sim(Some(params), 64);
        let (var_def, payload_size) = monitor.get_var_def().expect("schema ready");
        assert_eq!(var_def.fields.len(), 1);
        assert_eq!(var_def.fields[0].kind, ScalarKind::F64);
        assert_eq!(var_def.fields[0].rank, 1);
        assert_eq!(payload_size, 24);
    }

    #[test]
    fn test_var_def_fails_when_schema_never_resolves() {
        let (monitor, _client, _side, _running) = monitor_with_sim(None, 64);
        // 3 s wait, then reported failure.
        assert!(monitor.get_var_def().is_err());
    }

    #[test]
    fn test_update_parks_value_with_timestamp() {
        let params = PvParams {
            scalar: ScalarKind::I32,
            nelem: 1,
            rank: 0,
        };
        let (_monitor, client, side, _running) = monitor_with_sim(Some(params), 64);

        client.set_value(&7i32.to_le_bytes());
        client.update(Timestamp::new(1000, 0));

        assert_eq!(side.peek_time(), Some(Timestamp::new(1000, 0)));
        assert_eq!(
            side.with_head(|b| b.payload.clone()),
            Some(7i32.to_le_bytes().to_vec())
        );
    }

    #[test]
    fn test_update_ignored_until_running() {
        let params = PvParams {
            scalar: ScalarKind::I32,
            nelem: 1,
            rank: 0,
        };
        let (_monitor, client, side, running) = monitor_with_sim(Some(params), 64);
        running.store(false, Ordering::Relaxed);

        client.set_value(&[1, 2, 3, 4]);
        client.update(Timestamp::new(1000, 0));
        assert!(side.peek_time().is_none());
    }

    #[test]
    fn test_oversized_value_truncated_and_flagged() {
        let params = PvParams {
            scalar: ScalarKind::U8,
            nelem: 16,
            rank: 1,
        };
        let (_monitor, client, side, _running) = monitor_with_sim(Some(params), 8);

        client.set_value(&[0xff; 16]);
        client.update(Timestamp::new(5, 0));

        side.with_head(|b| {
            assert_eq!(b.payload.len(), 8);
            assert!(b.damage.contains(DamageFlag::Truncated));
        })
        .expect("update parked");
    }

    #[test]
    fn test_dropped_update_counted_when_freelist_empty() {
        let params = PvParams {
            scalar: ScalarKind::U8,
            nelem: 1,
            rank: 0,
        };
        let (_monitor, client, side, _running) = monitor_with_sim(Some(params), 8);

        client.set_value(&[1]);
        for i in 0..6 {
            client.update(Timestamp::new(i, 0));
        }
        // Four buffers, six updates: two dropped.
        assert_eq!(side.n_missed(), 2);
    }
}
