//! Run-lifecycle control: the transition state machine, the control-bus
//! request dispatcher, and the async error/warning notifier.
//!
//! The cluster bus transport is an external collaborator; requests and
//! replies cross process boundaries as JSON and reach the dispatcher over
//! channels (with an optional JSON-lines TCP bridge for deployment).

pub mod detectors;

use std::io::Write;
use std::net::TcpStream;
use std::sync::mpsc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Async notifications land at `tcp://<host>:<NOTIFY_BASE_PORT + partition>`.
pub const NOTIFY_BASE_PORT: u16 = 29980;

/// One control-plane request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    pub key: String,
    pub msg_id: String,
    #[serde(default)]
    pub body: Value,
}

/// Reply to a request. An empty body means success; failures carry
/// `err_info` and leave the state machine where it was.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlReply {
    pub key: String,
    pub msg_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err_info: Option<String>,
    #[serde(default)]
    pub body: Value,
}

impl ControlReply {
    fn ok(req: &ControlRequest) -> Self {
        Self {
            key: req.key.clone(),
            msg_id: req.msg_id.clone(),
            err_info: None,
            body: Value::Null,
        }
    }

    fn with_body(req: &ControlRequest, body: Value) -> Self {
        Self {
            key: req.key.clone(),
            msg_id: req.msg_id.clone(),
            err_info: None,
            body,
        }
    }

    fn err(req: &ControlRequest, msg: impl Into<String>) -> Self {
        Self {
            key: req.key.clone(),
            msg_id: req.msg_id.clone(),
            err_info: Some(msg.into()),
            body: Value::Null,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.err_info.is_none()
    }
}

/// Fire-and-forget publisher for asynchronous operator notifications.
///
/// Messages are JSON lines pushed to the collection host from a dedicated
/// thread, so receiver threads never block on the network.
#[derive(Clone)]
pub struct Notifier {
    tx: Option<mpsc::Sender<String>>,
}

impl Notifier {
    /// Connect to the collection host's notification port. Connection
    /// failures are logged and further messages are dropped.
    pub fn connect(host: &str, partition: u32) -> Self {
        let addr = format!("{host}:{}", NOTIFY_BASE_PORT + partition as u16);
        let (tx, rx) = mpsc::channel::<String>();

        std::thread::Builder::new()
            .name("notifier".to_string())
            .spawn(move || {
                let mut stream = match TcpStream::connect(&addr) {
                    Ok(s) => Some(s),
                    Err(e) => {
                        warn!(%addr, error = %e, "notifier connect failed, dropping messages");
                        None
                    }
                };
                for line in rx {
                    if let Some(s) = stream.as_mut() {
                        if writeln!(s, "{line}").is_err() {
                            warn!(%addr, "notifier stream broken, dropping messages");
                            stream = None;
                        }
                    }
                }
            })
            .expect("spawning notifier thread");

        Self { tx: Some(tx) }
    }

    /// A notifier that swallows everything (tests, standalone runs).
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    fn publish(&self, severity: &str, alias: &str, msg: &str) {
        let Some(tx) = &self.tx else { return };
        let body = json!({
            "header": {"key": severity},
            "body": {"alias": alias, "err_info": msg},
        });
        let _ = tx.send(body.to_string());
    }

    pub fn error(&self, alias: &str, msg: &str) {
        self.publish("error", alias, msg);
    }

    pub fn warning(&self, alias: &str, msg: &str) {
        self.publish("warning", alias, msg);
    }
}

/// Run metadata delivered with `beginrun`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunInfo {
    #[serde(default)]
    pub experiment: String,
    #[serde(default)]
    pub run_number: u32,
}

/// File-chunk rotation metadata optionally delivered with `enable`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkInfo {
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub chunk_id: u32,
}

/// Per-mode lifecycle hooks driven by the state machine.
pub trait Detector: Send {
    /// Validate connection prerequisites; on success return the
    /// `connect_info` payload (NIC IP, buffer geometry).
    fn connect(&mut self) -> Result<Value, String>;

    fn disconnect(&mut self);

    /// Spawn the matching thread, register metrics and dictionaries.
    fn configure(&mut self) -> Result<(), String>;

    /// Stop the matching thread and drain every queue.
    fn unconfigure(&mut self);

    fn begin_run(&mut self, _run_info: &RunInfo) -> Result<(), String> {
        Ok(())
    }

    fn end_run(&mut self) -> Result<(), String> {
        Ok(())
    }

    fn enable(&mut self, _chunk: Option<&ChunkInfo>) -> Result<(), String>;

    fn disable(&mut self);
}

impl Detector for Box<dyn Detector> {
    fn connect(&mut self) -> Result<Value, String> {
        (**self).connect()
    }

    fn disconnect(&mut self) {
        (**self).disconnect()
    }

    fn configure(&mut self) -> Result<(), String> {
        (**self).configure()
    }

    fn unconfigure(&mut self) {
        (**self).unconfigure()
    }

    fn begin_run(&mut self, run_info: &RunInfo) -> Result<(), String> {
        (**self).begin_run(run_info)
    }

    fn end_run(&mut self) -> Result<(), String> {
        (**self).end_run()
    }

    fn enable(&mut self, chunk: Option<&ChunkInfo>) -> Result<(), String> {
        (**self).enable(chunk)
    }

    fn disable(&mut self) {
        (**self).disable()
    }
}

/// Lifecycle position of the contributor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrpState {
    Reset,
    Connected,
    Configured,
    Enabled,
}

/// Dispatches control requests into detector hooks, enforcing the allowed
/// transition graph. A rejected or failed transition replies with
/// `err_info` and leaves the state untouched; nothing here ever takes the
/// process down.
pub struct App<D: Detector> {
    det: D,
    state: DrpState,
    queued_unconfigure: bool,
    in_run: bool,
}

impl<D: Detector> App<D> {
    pub fn new(det: D) -> Self {
        info!("ready for transitions");
        Self {
            det,
            state: DrpState::Reset,
            queued_unconfigure: false,
            in_run: false,
        }
    }

    pub fn state(&self) -> DrpState {
        self.state
    }

    pub fn detector(&self) -> &D {
        &self.det
    }

    pub fn detector_mut(&mut self) -> &mut D {
        &mut self.det
    }

    /// Handle one request, returning the reply to put on the bus.
    pub fn handle(&mut self, req: &ControlRequest) -> ControlReply {
        debug!(key = %req.key, state = ?self.state, "control request");
        match req.key.as_str() {
            "connect" => self.handle_connect(req),
            "disconnect" => self.handle_disconnect(req),
            "configure" => self.handle_configure(req),
            "unconfigure" => self.handle_unconfigure(req),
            "beginrun" => self.handle_beginrun(req),
            "endrun" => self.handle_endrun(req),
            "enable" => self.handle_enable(req),
            "disable" => self.handle_disable(req),
            "reset" => self.handle_reset(req),
            other => ControlReply::err(req, format!("unknown transition '{other}'")),
        }
    }

    fn handle_connect(&mut self, req: &ControlRequest) -> ControlReply {
        if self.state != DrpState::Reset {
            return ControlReply::err(req, format!("connect not allowed in {:?}", self.state));
        }
        match self.det.connect() {
            Ok(info) => {
                self.state = DrpState::Connected;
                ControlReply::with_body(req, json!({ "connect_info": info }))
            }
            Err(e) => {
                error!("connect failed: {e}");
                ControlReply::err(req, e)
            }
        }
    }

    fn handle_disconnect(&mut self, req: &ControlRequest) -> ControlReply {
        if self.state == DrpState::Enabled {
            return ControlReply::err(req, "disconnect not allowed while enabled");
        }
        // Carry out the queued Unconfigure, if there was one.
        if self.queued_unconfigure || self.state == DrpState::Configured {
            self.run_unconfigure();
        }
        if self.state == DrpState::Connected {
            self.det.disconnect();
        }
        self.state = DrpState::Reset;
        ControlReply::ok(req)
    }

    fn handle_configure(&mut self, req: &ControlRequest) -> ControlReply {
        if self.queued_unconfigure {
            self.run_unconfigure();
        }
        if self.state != DrpState::Connected {
            return ControlReply::err(req, format!("configure not allowed in {:?}", self.state));
        }
        match self.det.configure() {
            Ok(()) => {
                self.state = DrpState::Configured;
                ControlReply::ok(req)
            }
            Err(e) => {
                error!("configure failed: {e}");
                ControlReply::err(req, format!("Phase 1 error: {e}"))
            }
        }
    }

    fn handle_unconfigure(&mut self, req: &ControlRequest) -> ControlReply {
        if self.state != DrpState::Configured {
            return ControlReply::err(req, format!("unconfigure not allowed in {:?}", self.state));
        }
        // Queued until the next disconnect or configure, so in-flight
        // phase-2 activity settles first.
        self.queued_unconfigure = true;
        ControlReply::ok(req)
    }

    fn handle_beginrun(&mut self, req: &ControlRequest) -> ControlReply {
        if self.state != DrpState::Configured {
            return ControlReply::err(req, format!("beginrun not allowed in {:?}", self.state));
        }
        let run_info: RunInfo = req
            .body
            .get("phase1Info")
            .and_then(|p| p.get("run_info"))
            .and_then(|r| serde_json::from_value(r.clone()).ok())
            .unwrap_or_default();
        match self.det.begin_run(&run_info) {
            Ok(()) => {
                self.in_run = true;
                ControlReply::ok(req)
            }
            Err(e) => ControlReply::err(req, e),
        }
    }

    fn handle_endrun(&mut self, req: &ControlRequest) -> ControlReply {
        if !self.in_run {
            return ControlReply::err(req, "endrun without beginrun");
        }
        match self.det.end_run() {
            Ok(()) => {
                self.in_run = false;
                ControlReply::ok(req)
            }
            Err(e) => ControlReply::err(req, e),
        }
    }

    fn handle_enable(&mut self, req: &ControlRequest) -> ControlReply {
        if self.state != DrpState::Configured {
            return ControlReply::err(req, format!("enable not allowed in {:?}", self.state));
        }
        let chunk: Option<ChunkInfo> = req
            .body
            .get("phase1Info")
            .and_then(|p| p.get("chunk_info"))
            .and_then(|c| serde_json::from_value(c.clone()).ok());
        match self.det.enable(chunk.as_ref()) {
            Ok(()) => {
                self.state = DrpState::Enabled;
                ControlReply::ok(req)
            }
            Err(e) => ControlReply::err(req, e),
        }
    }

    fn handle_disable(&mut self, req: &ControlRequest) -> ControlReply {
        if self.state != DrpState::Enabled {
            return ControlReply::err(req, format!("disable not allowed in {:?}", self.state));
        }
        self.det.disable();
        self.state = DrpState::Configured;
        ControlReply::ok(req)
    }

    /// Reset forces Unconfigure + Disconnect from any state; it is the
    /// idempotent cleanup path.
    fn handle_reset(&mut self, req: &ControlRequest) -> ControlReply {
        if self.state == DrpState::Enabled {
            self.det.disable();
            self.state = DrpState::Configured;
        }
        if self.state == DrpState::Configured || self.queued_unconfigure {
            self.run_unconfigure();
        }
        if self.state == DrpState::Connected {
            self.det.disconnect();
        }
        self.state = DrpState::Reset;
        self.in_run = false;
        ControlReply::ok(req)
    }

    fn run_unconfigure(&mut self) {
        self.det.unconfigure();
        self.queued_unconfigure = false;
        if self.state == DrpState::Configured {
            self.state = DrpState::Connected;
        }
    }

    /// Serve requests until the bus closes or cancellation fires.
    pub async fn run(
        mut self,
        mut requests: tokio::sync::mpsc::Receiver<ControlRequest>,
        replies: tokio::sync::mpsc::Sender<ControlReply>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                req = requests.recv() => {
                    let Some(req) = req else { break };
                    let reply = self.handle(&req);
                    if replies.send(reply).await.is_err() {
                        break;
                    }
                }
            }
        }
        // Cleanup mirrors an explicit reset so buffers and threads are
        // released even when the bus just vanishes.
        let reset = ControlRequest {
            key: "reset".to_string(),
            msg_id: "shutdown".to_string(),
            body: Value::Null,
        };
        self.handle(&reset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct MockDetector {
        connects: u32,
        configures: u32,
        unconfigures: u32,
        enables: u32,
        disables: u32,
        disconnects: u32,
        fail_connect: bool,
    }

    impl Detector for MockDetector {
        fn connect(&mut self) -> Result<Value, String> {
            if self.fail_connect {
                return Err("no interface".to_string());
            }
            self.connects += 1;
            Ok(json!({"nic_ip": "127.0.0.1"}))
        }

        fn disconnect(&mut self) {
            self.disconnects += 1;
        }

        fn configure(&mut self) -> Result<(), String> {
            self.configures += 1;
            Ok(())
        }

        fn unconfigure(&mut self) {
            self.unconfigures += 1;
        }

        fn enable(&mut self, _chunk: Option<&ChunkInfo>) -> Result<(), String> {
            self.enables += 1;
            Ok(())
        }

        fn disable(&mut self) {
            self.disables += 1;
        }
    }

    fn req(key: &str) -> ControlRequest {
        ControlRequest {
            key: key.to_string(),
            msg_id: "1".to_string(),
            body: Value::Null,
        }
    }

    #[test]
    fn test_full_lifecycle() {
        let mut app = App::new(MockDetector::default());
        for key in [
            "connect",
            "configure",
            "beginrun",
            "enable",
            "disable",
            "endrun",
            "unconfigure",
            "disconnect",
        ] {
            let reply = app.handle(&req(key));
            assert!(reply.is_ok(), "{key} failed: {:?}", reply.err_info);
        }
        assert_eq!(app.state(), DrpState::Reset);
        let det = app.detector();
        assert_eq!(det.configures, 1);
        assert_eq!(det.unconfigures, 1);
        assert_eq!(det.enables, 1);
        assert_eq!(det.disables, 1);
    }

    #[test]
    fn test_disable_enable_cycle_is_legal() {
        let mut app = App::new(MockDetector::default());
        assert!(app.handle(&req("connect")).is_ok());
        assert!(app.handle(&req("configure")).is_ok());
        for _ in 0..3 {
            assert!(app.handle(&req("enable")).is_ok());
            assert!(app.handle(&req("disable")).is_ok());
        }
        assert_eq!(app.detector().enables, 3);
    }

    #[test]
    fn test_out_of_order_transition_rejected_without_state_change() {
        let mut app = App::new(MockDetector::default());
        let reply = app.handle(&req("configure"));
        assert!(!reply.is_ok());
        assert_eq!(app.state(), DrpState::Reset);
        assert_eq!(app.detector().configures, 0);
    }

    #[test]
    fn test_connect_failure_reports_err_info() {
        let mut app = App::new(MockDetector {
            fail_connect: true,
            ..Default::default()
        });
        let reply = app.handle(&req("connect"));
        assert_eq!(reply.err_info.as_deref(), Some("no interface"));
        assert_eq!(app.state(), DrpState::Reset);
    }

    #[test]
    fn test_unconfigure_queued_until_disconnect() {
        let mut app = App::new(MockDetector::default());
        app.handle(&req("connect"));
        app.handle(&req("configure"));
        assert!(app.handle(&req("unconfigure")).is_ok());
        // Still configured: the unconfigure only ran when disconnect came.
        assert_eq!(app.detector().unconfigures, 0);
        assert!(app.handle(&req("disconnect")).is_ok());
        assert_eq!(app.detector().unconfigures, 1);
        assert_eq!(app.detector().disconnects, 1);
    }

    #[test]
    fn test_queued_unconfigure_runs_before_reconfigure() {
        let mut app = App::new(MockDetector::default());
        app.handle(&req("connect"));
        app.handle(&req("configure"));
        app.handle(&req("unconfigure"));
        assert!(app.handle(&req("configure")).is_ok());
        assert_eq!(app.detector().unconfigures, 1);
        assert_eq!(app.detector().configures, 2);
    }

    #[test]
    fn test_reset_is_idempotent_cleanup() {
        let mut app = App::new(MockDetector::default());
        app.handle(&req("connect"));
        app.handle(&req("configure"));
        app.handle(&req("enable"));

        assert!(app.handle(&req("reset")).is_ok());
        assert_eq!(app.state(), DrpState::Reset);
        let det = app.detector();
        assert_eq!(det.disables, 1);
        assert_eq!(det.unconfigures, 1);
        assert_eq!(det.disconnects, 1);

        // A second reset does nothing further.
        assert!(app.handle(&req("reset")).is_ok());
        assert_eq!(app.detector().disconnects, 1);
    }

    #[test]
    fn test_endrun_requires_beginrun() {
        let mut app = App::new(MockDetector::default());
        app.handle(&req("connect"));
        app.handle(&req("configure"));
        assert!(!app.handle(&req("endrun")).is_ok());
        assert!(app.handle(&req("beginrun")).is_ok());
        assert!(app.handle(&req("endrun")).is_ok());
    }

    #[test]
    fn test_beginrun_parses_run_info() {
        struct RunCheck(Option<RunInfo>);
        impl Detector for RunCheck {
            fn connect(&mut self) -> Result<Value, String> {
                Ok(Value::Null)
            }
            fn disconnect(&mut self) {}
            fn configure(&mut self) -> Result<(), String> {
                Ok(())
            }
            fn unconfigure(&mut self) {}
            fn begin_run(&mut self, run_info: &RunInfo) -> Result<(), String> {
                self.0 = Some(run_info.clone());
                Ok(())
            }
            fn enable(&mut self, _chunk: Option<&ChunkInfo>) -> Result<(), String> {
                Ok(())
            }
            fn disable(&mut self) {}
        }

        let mut app = App::new(RunCheck(None));
        app.handle(&req("connect"));
        app.handle(&req("configure"));
        let mut breq = req("beginrun");
        breq.body = json!({"phase1Info": {"run_info": {"experiment": "xpptut15", "run_number": 42}}});
        assert!(app.handle(&breq).is_ok());
        let run = app.detector().0.as_ref().expect("run info captured");
        assert_eq!(run.experiment, "xpptut15");
        assert_eq!(run.run_number, 42);
    }
}
