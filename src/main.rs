//! CLI entry point: one contributor process per side-channel detector.
//!
//! The collection bus is an external collaborator; this binary bridges it
//! as JSON lines on stdin/stdout so the process can be driven by the
//! cluster manager's adapter or by hand.

use std::process::ExitCode;
use std::sync::mpsc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use drp_sidecar::bld::parse_detector_list;
use drp_sidecar::config::{parse_kwargs, Mode, Parameters};
use drp_sidecar::control::detectors::{BldDetector, PvDetector, UdpDetector};
use drp_sidecar::control::{App, ControlReply, ControlRequest, Detector, Notifier};
use drp_sidecar::eb::{ChannelSink, Contribution, EbSink};
use drp_sidecar::matcher::MatchDegree;
use drp_sidecar::pgp::{DmaDriver, SimDmaDriver, TIMING_HEADER_SIZE};
use drp_sidecar::pv::{PvDescriptor, SimPvClient};

/// Side-channel data receiver pipeline contributor.
#[derive(Parser)]
#[command(name = "drp-sidecar", about)]
struct Cli {
    /// DAQ partition number.
    #[arg(short = 'p', long)]
    partition: u32,

    /// DMA lane mask; exactly one bit must be set.
    #[arg(short = 'l', long, default_value = "1", value_parser = parse_lane_mask)]
    lane_mask: u8,

    /// Timing DMA device node.
    #[arg(short = 'd', long)]
    device: String,

    /// Process alias; must end in `_<digits>`.
    #[arg(short = 'u', long)]
    alias: String,

    /// Collection manager host.
    #[arg(short = 'C', long, default_value = "localhost")]
    collection_host: String,

    /// Instrument name.
    #[arg(short = 'P', long, default_value = "")]
    instrument: String,

    /// Prometheus discovery directory.
    #[arg(short = 'M', long, default_value = "")]
    prometheus_dir: String,

    /// Additional options as key=value[,key=value...]; repeatable.
    #[arg(short = 'k', long = "kwargs")]
    kwargs: Vec<String>,

    /// Logging verbosity (repeat for more).
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    mode: ModeCommand,
}

#[derive(Subcommand)]
enum ModeCommand {
    /// Front a set of beam-line data multicast services.
    Bld {
        /// Comma-separated detectors: a known name, or name+type+id for
        /// PV-driven discovery.
        #[arg(short = 'D', long)]
        detectors: String,
    },
    /// Front one EPICS process variable.
    Pv {
        /// PV descriptor: [<provider>/]<name>[.<field>].
        pv: String,

        /// Detector serial number.
        #[arg(short = 'S', long, default_value = "")]
        ser_no: String,

        /// Match degree 0: pair updates with triggers regardless of time.
        #[arg(short = '0')]
        degree0: bool,

        /// Match degree 1: fiducial-masked comparison with a 10 ms window.
        #[arg(short = '1')]
        degree1: bool,

        /// Permit the fragile degree-1 comparison.
        #[arg(long)]
        allow_fiducial_match: bool,
    },
    /// Front a UDP encoder box.
    Udp {
        /// Receive on this local port and arm the loopback self-test.
        #[arg(short = 'L', long)]
        loopback_port: Option<u16>,
    },
}

fn parse_lane_mask(s: &str) -> Result<u8, String> {
    let raw = s.strip_prefix("0x").unwrap_or(s);
    let radix = if raw.len() < s.len() { 16 } else { 10 };
    u8::from_str_radix(raw, radix).map_err(|e| e.to_string())
}

fn main() -> ExitCode {
    // CLI errors exit 1, matching configuration errors; --help and
    // --version stay clean exits.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code: u8 = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_new(level).expect("static level strings are valid");
    fmt().with_env_filter(filter).with_target(true).init();
    info!("logging configured");

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    if cli.instrument.is_empty() {
        warn!("-P: instrument name is missing");
    }

    let mode = match cli.mode {
        ModeCommand::Bld { .. } => Mode::Bld,
        ModeCommand::Pv { .. } => Mode::Pv,
        ModeCommand::Udp { .. } => Mode::Udp,
    };

    let kwargs = parse_kwargs(&cli.kwargs)?;
    let mut para = Parameters::build(
        mode,
        cli.partition,
        cli.lane_mask,
        &cli.device,
        &cli.alias,
        &cli.collection_host,
        &cli.instrument,
        &cli.prometheus_dir,
        kwargs,
        cli.verbose,
    )?;

    let notifier = Notifier::connect(&para.collection_host, para.partition);
    let driver_factory = make_driver_factory(&para)?;
    let sink_factory = make_sink_factory();
    let trigger_factory: drp_sidecar::control::detectors::TriggerFactory = Box::new(|| None);

    let det: Box<dyn Detector> = match cli.mode {
        ModeCommand::Bld { detectors } => {
            let specs = parse_detector_list(&detectors)?;
            Box::new(BldDetector::new(
                para,
                specs,
                notifier,
                driver_factory,
                sink_factory,
                trigger_factory,
                None,
            )?)
        }
        ModeCommand::Pv {
            pv,
            ser_no,
            degree0,
            degree1,
            allow_fiducial_match,
        } => {
            if degree1 && !allow_fiducial_match {
                // The fiducial comparison breaks once clock drift exceeds
                // its 10 ms window; it stays off without the override.
                bail!("-1 is disabled; pass --allow-fiducial-match to override");
            }
            para.match_degree = if degree0 {
                MatchDegree::None
            } else if degree1 {
                MatchDegree::Fiducial
            } else {
                MatchDegree::Strict
            };
            para.serial = ser_no;

            let descriptor = PvDescriptor::parse(&pv)?;
            info!(
                provider = descriptor.provider.as_str(),
                pv = %descriptor.name,
                field = %descriptor.field,
                request = descriptor.request(),
                "monitoring PV",
            );
            // The PV transport is wired by the deployment; without one the
            // process still exercises the full pipeline against a
            // simulated client.
            let client = SimPvClient::new(&descriptor.name, None);
            Box::new(PvDetector::new(
                para,
                client,
                notifier,
                driver_factory,
                sink_factory,
                trigger_factory,
            )?)
        }
        ModeCommand::Udp { loopback_port } => {
            para.loopback_port = loopback_port;
            para.match_degree = MatchDegree::None;
            Box::new(UdpDetector::new(
                para,
                notifier,
                driver_factory,
                sink_factory,
                trigger_factory,
            )?)
        }
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;
    rt.block_on(serve(det))
}

/// Simulated DMA ring unless a production driver is wired in.
fn make_driver_factory(
    para: &Parameters,
) -> Result<drp_sidecar::control::detectors::DriverFactory> {
    let sim_length = para.sim_length()?;
    let n_blocks = if sim_length > 0 { sim_length } else { 1024 };
    info!(n_blocks, device = %para.device, "using simulated DMA driver");
    Ok(Box::new(move || {
        Box::new(SimDmaDriver::new(n_blocks, TIMING_HEADER_SIZE)) as Box<dyn DmaDriver>
    }))
}

/// Contributions drain to a logger thread; the event-builder transport is
/// wired by the deployment.
fn make_sink_factory() -> drp_sidecar::control::detectors::SinkFactory {
    Box::new(|| {
        let (tx, rx) = mpsc::channel::<Contribution>();
        std::thread::Builder::new()
            .name("eb_drain".to_string())
            .spawn(move || {
                for c in rx {
                    debug!(
                        time = %c.time,
                        pulse_id = %c.pulse_id,
                        service = %c.service,
                        damage = %c.damage,
                        payload = c.payload.len(),
                        "contribution",
                    );
                }
            })
            .expect("spawning sink drain thread");
        Box::new(ChannelSink::new(64, tx)) as Box<dyn EbSink>
    })
}

/// Bridge the control bus as JSON lines on stdin/stdout and run the
/// transition dispatcher until the bus closes or a signal arrives.
async fn serve(det: Box<dyn Detector>) -> Result<()> {
    let cancel = CancellationToken::new();

    // Signal handling: first signal initiates a clean teardown.
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => info!("received SIGINT, shutting down"),
                _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            }
            cancel.cancel();
        });
    }

    let (req_tx, req_rx) = tokio::sync::mpsc::channel::<ControlRequest>(16);
    let (rep_tx, mut rep_rx) = tokio::sync::mpsc::channel::<ControlReply>(16);

    // stdin → requests.
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    line = lines.next_line() => {
                        match line {
                            Ok(Some(line)) if !line.trim().is_empty() => {
                                match serde_json::from_str::<ControlRequest>(&line) {
                                    Ok(req) => {
                                        if req_tx.send(req).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(e) => warn!(error = %e, "bad control request"),
                                }
                            }
                            Ok(Some(_)) => {}
                            _ => break,
                        }
                    }
                }
            }
            cancel.cancel();
        });
    }

    // Replies → stdout.
    tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(reply) = rep_rx.recv().await {
            let Ok(mut line) = serde_json::to_vec(&reply) else {
                continue;
            };
            line.push(b'\n');
            if stdout.write_all(&line).await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    App::new(det).run(req_rx, rep_tx, cancel).await;
    info!("drp-sidecar stopped");
    Ok(())
}
