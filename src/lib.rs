//! Side-channel data receiver pipeline (DRP) contributor.
//!
//! Each process fronts one side-channel detector (beam-line diagnostics via
//! UDP multicast, an EPICS process variable, or a UDP encoder box) and pairs
//! its unsynchronized updates with the hardware timing stream, emitting one
//! time-stamped contribution per trigger to the downstream event builder.

pub mod bld;
pub mod config;
pub mod control;
pub mod dgram;
pub mod eb;
pub mod matcher;
pub mod metrics;
pub mod pgp;
pub mod pool;
pub mod pv;
pub mod queue;
pub mod udp;
