//! Process parameters: CLI-level settings plus the `-k key=value` map with
//! its closed set of recognized options. Any unrecognized key is fatal at
//! startup.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::matcher::MatchDegree;

/// Which side-channel flavor this process fronts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Bld,
    Pv,
    Udp,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bld => "bld",
            Self::Pv => "pv",
            Self::Udp => "udp",
        }
    }
}

/// Options every mode recognizes.
const COMMON_KWARGS: &[&str] = &[
    "forceEnet",
    "ep_fabric",
    "ep_domain",
    "ep_provider",
    "sim_length",
    "timebase",
    "pebbleBufSize",
    "pebbleBufCount",
    "batching",
    "directIO",
];

fn default_pebble_buf_count() -> usize {
    1024
}

fn default_pebble_buf_size() -> usize {
    4096
}

fn default_max_tr_size() -> usize {
    256 * 1024
}

fn default_n_tr_buffers() -> usize {
    18
}

/// Fully validated process parameters.
#[derive(Debug, Clone)]
pub struct Parameters {
    pub partition: u32,
    pub lane_mask: u8,
    pub device: String,
    pub alias: String,
    pub det_name: String,
    pub det_segment: u32,
    pub det_type: String,
    pub serial: String,
    pub collection_host: String,
    pub instrument: String,
    pub prometheus_dir: String,
    pub kwargs: HashMap<String, String>,
    pub rog_mask: u8,
    pub loopback_port: Option<u16>,
    pub verbose: u8,
    pub max_tr_size: usize,
    pub mode: Mode,
    pub match_degree: MatchDegree,
}

impl Parameters {
    /// Validate the raw CLI values and derive the detector identity.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        mode: Mode,
        partition: u32,
        lane_mask: u8,
        device: &str,
        alias: &str,
        collection_host: &str,
        instrument: &str,
        prometheus_dir: &str,
        kwargs: HashMap<String, String>,
        verbose: u8,
    ) -> Result<Self> {
        if device.is_empty() {
            bail!("-d: device is mandatory");
        }
        if alias.is_empty() {
            bail!("-u: alias is mandatory");
        }
        // Only one hardware lane is supported by this contributor.
        if lane_mask.count_ones() != 1 {
            bail!("-l: lane mask must have only 1 bit set");
        }

        let (det_name, det_segment) = parse_alias(alias)?;
        let det_name = match mode {
            Mode::Bld => "bld".to_string(),
            _ => det_name,
        };

        let para = Self {
            partition,
            lane_mask,
            device: device.to_string(),
            alias: alias.to_string(),
            det_name,
            det_segment,
            det_type: mode.as_str().to_string(),
            serial: String::new(),
            collection_host: collection_host.to_string(),
            instrument: instrument.to_string(),
            prometheus_dir: prometheus_dir.to_string(),
            kwargs,
            rog_mask: 1,
            loopback_port: None,
            verbose,
            max_tr_size: default_max_tr_size(),
            mode,
            match_degree: MatchDegree::Strict,
        };
        para.validate_kwargs()?;
        Ok(para)
    }

    /// Reject any kwarg outside the closed per-mode option set.
    pub fn validate_kwargs(&self) -> Result<()> {
        for key in self.kwargs.keys() {
            let known = COMMON_KWARGS.contains(&key.as_str())
                || match self.mode {
                    Mode::Bld => key == "interface",
                    Mode::Pv => key == "firstdim" || key == "match_tmo_ms",
                    Mode::Udp => key == "match_tmo_ms",
                };
            if !known {
                bail!(
                    "unrecognized kwarg '{key}={}'",
                    self.kwargs.get(key).map(String::as_str).unwrap_or("")
                );
            }
        }
        Ok(())
    }

    pub fn kwarg(&self, key: &str) -> Option<&str> {
        self.kwargs.get(key).map(String::as_str)
    }

    fn kwarg_usize(&self, key: &str, default: usize) -> Result<usize> {
        match self.kwarg(key) {
            Some(v) => v.parse().with_context(|| format!("kwarg {key}={v}")),
            None => Ok(default),
        }
    }

    pub fn pebble_buf_count(&self) -> Result<usize> {
        let n = self.kwarg_usize("pebbleBufCount", default_pebble_buf_count())?;
        if n == 0 {
            bail!("pebbleBufCount must be positive");
        }
        Ok(n.next_power_of_two())
    }

    pub fn pebble_buf_size(&self) -> Result<usize> {
        let n = self.kwarg_usize("pebbleBufSize", default_pebble_buf_size())?;
        if n == 0 {
            bail!("pebbleBufSize must be positive");
        }
        Ok(n)
    }

    pub fn n_tr_buffers(&self) -> usize {
        default_n_tr_buffers()
    }

    /// Simulated timing-stream ring length; zero means a real driver.
    pub fn sim_length(&self) -> Result<usize> {
        self.kwarg_usize("sim_length", 0)
    }

    /// How long the matcher waits before flushing a dataless trigger.
    pub fn match_tmo(&self) -> Result<Duration> {
        let default_ms: u64 = match self.mode {
            Mode::Udp => 100,
            _ => 1500,
        };
        let ms = match self.kwarg("match_tmo_ms") {
            Some(v) => v.parse().with_context(|| format!("kwarg match_tmo_ms={v}"))?,
            None => default_ms,
        };
        Ok(Duration::from_millis(ms))
    }

    /// Rank override for array PVs (`firstdim`); zero means none.
    pub fn first_dim(&self) -> Result<u32> {
        match self.kwarg("firstdim") {
            Some(v) => v.parse().with_context(|| format!("kwarg firstdim={v}")),
            None => Ok(0),
        }
    }

    /// Multicast interface address (BLD only). The control system hands us
    /// a dotted quad.
    pub fn interface_addr(&self) -> Result<Ipv4Addr> {
        let raw = self
            .kwarg("interface")
            .context("no multicast interface specified")?;
        raw.parse()
            .with_context(|| format!("failed to lookup multicast interface {raw}"))
    }

    /// IP published on connect for event-builder traffic.
    pub fn nic_ip(&self) -> String {
        if let Some(domain) = self.kwarg("ep_domain") {
            if domain.parse::<Ipv4Addr>().is_ok() {
                return domain.to_string();
            }
        }
        "127.0.0.1".to_string()
    }
}

/// Split an alias of the form `<detName>_<digits>`.
fn parse_alias(alias: &str) -> Result<(String, u32)> {
    let (name, segment) = alias
        .rsplit_once('_')
        .context("-u: alias must have _N suffix")?;
    let segment: u32 = segment.parse().context("-u: alias must have _N suffix")?;
    if name.is_empty() {
        bail!("-u: alias must have _N suffix");
    }
    Ok((name.to_string(), segment))
}

/// Parse repeated `-k key=value[,key=value...]` arguments.
pub fn parse_kwargs(args: &[String]) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    for arg in args {
        for pair in arg.split(',').filter(|p| !p.trim().is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .with_context(|| format!("malformed kwarg '{pair}', expected key=value"))?;
            map.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    Ok(map)
}
