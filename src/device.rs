//! Single-device communication engine: TCP transport, session
//! establishment, command dispatch with retry, heartbeat and reconnect.
//!
//! One cooperative background task per device owns the socket, every timer
//! and the DP snapshot; the `Device` handle talks to it over a command
//! channel and observes it through broadcast events and the snapshot guard.

use crate::config::DeviceConfig;
use crate::dps::{DpSnapshot, DpValue};
use crate::error::{ErrorClass, Result, TuyaError};
use crate::protocol::{
    FrameDecoder, FrameType, TuyaFrame, Version, decode_payload, encode_payload, pack_frame,
};
use crate::session::Session;
use futures_core::stream::Stream;
use log::{debug, error, info, warn};
use rand::Rng;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Duration, Instant, Interval, MissedTickBehavior, interval_at, timeout, timeout_at};
use tokio_util::sync::CancellationToken;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_STEP_TIMEOUT: Duration = Duration::from_millis(750);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);
const RESPONSE_RETRIES: u8 = 5;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);
const IDLE_WATCHDOG: Duration = Duration::from_secs(30);
const RECONNECT_MIN: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// Events published by the device task.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// Session established (TCP connect, plus key negotiation on v3.4)
    Connected,
    /// Session torn down
    Disconnected,
    /// One DP changed value
    Dp { dp: u32, value: DpValue },
}

/// Commands for the background task.
enum EngineCommand {
    Query {
        resp: oneshot::Sender<Result<DpSnapshot>>,
    },
    Set {
        dps: Value,
        resp: oneshot::Sender<Result<()>>,
    },
    Heartbeat {
        resp: oneshot::Sender<Result<()>>,
    },
    /// Scheduled refresh; nobody waits on it
    Refresh,
    Disconnect,
}

impl EngineCommand {
    fn respond_err(self, err: TuyaError) {
        match self {
            EngineCommand::Query { resp } => {
                let _ = resp.send(Err(err));
            }
            EngineCommand::Set { resp, .. } | EngineCommand::Heartbeat { resp } => {
                let _ = resp.send(Err(err));
            }
            EngineCommand::Refresh | EngineCommand::Disconnect => {}
        }
    }
}

/// Reply channel of the in-flight request.
enum PendingResp {
    Snapshot(oneshot::Sender<Result<DpSnapshot>>),
    Unit(oneshot::Sender<Result<()>>),
    None,
}

/// The single in-flight request.
struct Pending {
    cmd: u32,
    cleartext: Vec<u8>,
    seq: u16,
    deadline: Instant,
    retries_left: u8,
    resp: PendingResp,
}

impl Pending {
    fn fail(self, err: TuyaError) {
        match self.resp {
            PendingResp::Snapshot(tx) => {
                let _ = tx.send(Err(err));
            }
            PendingResp::Unit(tx) => {
                let _ = tx.send(Err(err));
            }
            PendingResp::None => {}
        }
    }

    fn succeed(self, snapshot: DpSnapshot) {
        match self.resp {
            PendingResp::Snapshot(tx) => {
                let _ = tx.send(Ok(snapshot));
            }
            PendingResp::Unit(tx) => {
                let _ = tx.send(Ok(()));
            }
            PendingResp::None => {}
        }
    }
}

/// How a connection ended.
enum ConnectionEnd {
    /// Task is shutting down
    Stopped,
    /// Explicit disconnect; wait for the next trigger before redialing
    Idle,
    /// Transport/protocol/timeout loss; redial if auto_reconnect
    Lost(TuyaError),
}

/// Builder for [`Device`].
pub struct DeviceBuilder {
    config: DeviceConfig,
}

impl DeviceBuilder {
    pub fn new(device_id: &str, local_key: &str) -> Self {
        Self {
            config: DeviceConfig::new("", device_id, local_key),
        }
    }

    pub fn from_config(config: DeviceConfig) -> Self {
        Self { config }
    }

    pub fn ip(mut self, ip: &str) -> Self {
        self.config.ip = ip.to_string();
        self
    }

    /// Override the TCP control port (devices listen on 6668).
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Protocol dialect code: 31, 33 or 34.
    pub fn protocol(mut self, code: u8) -> Self {
        self.config.protocol = code;
        self
    }

    pub fn poll_interval(mut self, secs: u16) -> Self {
        self.config.poll_interval_sec = secs;
        self
    }

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.config.auto_reconnect = enabled;
        self
    }

    pub fn use_heartbeat(mut self, enabled: bool) -> Self {
        self.config.use_heartbeat = enabled;
        self
    }

    /// Validates the binding and spawns the background task.
    pub fn build(self) -> Result<Device> {
        self.config.validate()?;
        Ok(Device::spawn(self.config))
    }
}

/// Handle to one Pioneer WYT unit on the LAN. Cheap to clone; all clones
/// share the background task.
#[derive(Clone)]
pub struct Device {
    id: String,
    version: Version,
    tx: mpsc::Sender<EngineCommand>,
    snapshot: Arc<RwLock<DpSnapshot>>,
    events_tx: broadcast::Sender<DeviceEvent>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl Device {
    fn spawn(config: DeviceConfig) -> Self {
        let version = config.version().expect("config validated");
        let local_key = config.key_bytes().expect("config validated");

        let (tx, rx) = mpsc::channel(32);
        let (events_tx, _) = broadcast::channel(32);
        let snapshot = Arc::new(RwLock::new(DpSnapshot::new()));
        let connected = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        let engine = Engine {
            id: config.device_id.clone(),
            ip: config.ip.clone(),
            port: config.port,
            version,
            local_key,
            auto_reconnect: config.auto_reconnect,
            use_heartbeat: config.use_heartbeat,
            poll_interval: (config.poll_interval_sec > 0)
                .then(|| Duration::from_secs(config.poll_interval_sec as u64)),
            snapshot: snapshot.clone(),
            events_tx: events_tx.clone(),
            connected: connected.clone(),
            cancel: cancel.clone(),
        };
        tokio::spawn(engine.run(rx));

        Self {
            id: config.device_id,
            version,
            tx,
            snapshot,
            events_tx,
            connected,
            cancel,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Last known DP state. Never blocks on the network.
    pub fn snapshot(&self) -> DpSnapshot {
        self.snapshot.read().expect("snapshot lock poisoned").clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events_tx.subscribe()
    }

    /// Returns a Stream of events from the device.
    pub fn events(&self) -> impl Stream<Item = DeviceEvent> + Send + 'static {
        let mut rx = self.events_tx.subscribe();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
        }
    }

    /// Query the device and return the refreshed snapshot.
    pub async fn query(&self) -> Result<DpSnapshot> {
        let (resp, rx) = oneshot::channel();
        self.send(EngineCommand::Query { resp }).await?;
        match rx.await {
            Ok(result) => result,
            // Superseded by a later command; the caller gets the state we
            // have, not an error.
            Err(_) => Ok(self.snapshot()),
        }
    }

    /// Write one or more DPs: `{"1": true, "4": "cold"}`.
    pub async fn set_dps(&self, dps: Value) -> Result<()> {
        let valid = dps.as_object().is_some_and(|m| !m.is_empty());
        if !valid {
            return Err(TuyaError::BadValue(format!(
                "dps must be a non-empty object, got {}",
                dps
            )));
        }
        let (resp, rx) = oneshot::channel();
        self.send(EngineCommand::Set { dps, resp }).await?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Ok(()),
        }
    }

    /// Write a single DP value.
    pub async fn set_value(&self, dp: u32, value: Value) -> Result<()> {
        self.set_dps(json!({ dp.to_string(): value })).await
    }

    /// Explicit heartbeat; resolves on the device's HEART_BEAT reply.
    pub async fn heartbeat(&self) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.send(EngineCommand::Heartbeat { resp }).await?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Ok(()),
        }
    }

    /// Close the socket and clear session state. The next command dials
    /// again.
    pub async fn disconnect(&self) {
        let _ = self.tx.send(EngineCommand::Disconnect).await;
    }

    /// Permanently stop the background task.
    pub async fn stop(&self) {
        info!("Stopping device {}", self.id);
        self.cancel.cancel();
    }

    async fn send(&self, cmd: EngineCommand) -> Result<()> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| TuyaError::NotConnected)
    }
}

// -------------------------------------------------------------------------
// Command payload builders, one shape per dialect
// -------------------------------------------------------------------------

fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub(crate) fn build_status_payload(version: Version, device_id: &str) -> (u32, Vec<u8>) {
    match version {
        Version::V3_4 => (FrameType::DpQueryNew as u32, Vec::new()),
        _ => {
            let payload = json!({
                "gwId": device_id,
                "devId": device_id,
                "uid": device_id,
                "t": unix_time().to_string(),
            });
            (
                FrameType::DpQuery as u32,
                serde_json::to_vec(&payload).unwrap_or_default(),
            )
        }
    }
}

pub(crate) fn build_set_payload(version: Version, device_id: &str, dps: &Value) -> (u32, Vec<u8>) {
    match version {
        Version::V3_4 => {
            let payload = json!({
                "protocol": 5,
                "t": unix_time(),
                "data": { "dps": dps },
            });
            (
                FrameType::ControlNew as u32,
                serde_json::to_vec(&payload).unwrap_or_default(),
            )
        }
        _ => {
            let payload = json!({
                "devId": device_id,
                "uid": device_id,
                "t": unix_time().to_string(),
                "dps": dps,
            });
            (
                FrameType::Control as u32,
                serde_json::to_vec(&payload).unwrap_or_default(),
            )
        }
    }
}

pub(crate) fn build_heartbeat_payload(device_id: &str) -> (u32, Vec<u8>) {
    let payload = json!({
        "gwId": device_id,
        "devId": device_id,
    });
    (
        FrameType::HeartBeat as u32,
        serde_json::to_vec(&payload).unwrap_or_default(),
    )
}

// -------------------------------------------------------------------------
// Background engine
// -------------------------------------------------------------------------

struct Engine {
    id: String,
    ip: String,
    port: u16,
    version: Version,
    local_key: [u8; 16],
    auto_reconnect: bool,
    use_heartbeat: bool,
    poll_interval: Option<Duration>,
    snapshot: Arc<RwLock<DpSnapshot>>,
    events_tx: broadcast::Sender<DeviceEvent>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
}

fn next_seq(seq: &mut u16) -> u16 {
    let current = *seq;
    *seq = seq.wrapping_add(1);
    current
}

fn backoff_duration(failure_count: u32) -> Duration {
    let base = RECONNECT_MIN
        .saturating_mul(2u32.saturating_pow(failure_count.min(5)))
        .min(RECONNECT_MAX);
    let jitter = Duration::from_millis(rand::rng().random_range(0..1000));
    base + jitter
}

async fn tick_opt(interval: Option<&mut Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

impl Engine {
    async fn run(self, mut rx: mpsc::Receiver<EngineCommand>) {
        debug!("Starting background task for device {}", self.id);
        let mut failure_count: u32 = 0;
        let mut poll = self.poll_interval.map(|period| {
            let mut i = interval_at(Instant::now() + period, period);
            i.set_missed_tick_behavior(MissedTickBehavior::Skip);
            i
        });

        'outer: loop {
            // Idle until something needs the session: the first command, a
            // scheduled refresh, or (after a loss) the reconnect backoff.
            let mut trigger: Option<EngineCommand> = None;
            if failure_count == 0 || !self.auto_reconnect {
                tokio::select! {
                    _ = self.cancel.cancelled() => break 'outer,
                    cmd = rx.recv() => match cmd {
                        None => break 'outer,
                        Some(EngineCommand::Disconnect) => continue 'outer,
                        Some(cmd) => trigger = Some(cmd),
                    },
                    _ = tick_opt(poll.as_mut()) => trigger = Some(EngineCommand::Refresh),
                }
            } else {
                let backoff = backoff_duration(failure_count - 1);
                warn!(
                    "Waiting {:?} before reconnecting to {} (failures: {})",
                    backoff, self.id, failure_count
                );
                if !self.wait_backoff(&mut rx, backoff).await {
                    break 'outer;
                }
            }

            let mut seq: u16 = 1;
            let mut session = Session::new(self.version, self.local_key);
            let mut decoder = FrameDecoder::new();

            match self
                .connect_and_establish(&mut session, &mut seq, &mut decoder)
                .await
            {
                Ok(stream) => {
                    failure_count = 0;
                    info!("Session established with {} ({})", self.id, self.version);
                    self.connected.store(true, Ordering::SeqCst);
                    let _ = self.events_tx.send(DeviceEvent::Connected);

                    let end = self
                        .run_connection(stream, session, decoder, seq, &mut rx, trigger, &mut poll)
                        .await;

                    self.connected.store(false, Ordering::SeqCst);
                    let _ = self.events_tx.send(DeviceEvent::Disconnected);

                    match end {
                        ConnectionEnd::Stopped => break 'outer,
                        ConnectionEnd::Idle => {
                            debug!("Connection to {} closed on request", self.id);
                        }
                        ConnectionEnd::Lost(e) => {
                            if e.class() == ErrorClass::Handshake {
                                warn!(
                                    "Key negotiation with {} failed: {} (check local key and version)",
                                    self.id, e
                                );
                            } else {
                                warn!("Connection to {} lost: {}", self.id, e);
                            }
                            failure_count += 1;
                        }
                    }
                }
                Err(e) => {
                    warn!("Connecting to {} failed: {}", self.id, e);
                    if let Some(cmd) = trigger.take() {
                        cmd.respond_err(TuyaError::NotConnected);
                    }
                    failure_count += 1;
                }
            }
        }

        rx.close();
        while let Ok(cmd) = rx.try_recv() {
            cmd.respond_err(TuyaError::NotConnected);
        }
        debug!("Background task for {} exited", self.id);
    }

    /// Sleep out the reconnect backoff, rejecting commands that arrive in
    /// the meantime. Returns false when the task should stop.
    async fn wait_backoff(&self, rx: &mut mpsc::Receiver<EngineCommand>, backoff: Duration) -> bool {
        let deadline = Instant::now() + backoff;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep_until(deadline) => return true,
                cmd = rx.recv() => match cmd {
                    None => return false,
                    Some(cmd) => {
                        debug!("Rejecting command during backoff for {}", self.id);
                        cmd.respond_err(TuyaError::NotConnected);
                    }
                },
            }
        }
    }

    async fn connect_and_establish(
        &self,
        session: &mut Session,
        seq: &mut u16,
        decoder: &mut FrameDecoder,
    ) -> Result<TcpStream> {
        info!("Connecting to {} at {}:{}", self.id, self.ip, self.port);
        let mut stream = timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect((self.ip.as_str(), self.port)),
        )
        .await
        .map_err(|_| TuyaError::ConnectionFailed)?
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::ConnectionRefused => TuyaError::ConnectionFailed,
            _ => TuyaError::Io(e.to_string()),
        })?;

        let Some(nonce_payload) = session.on_connected() else {
            return Ok(stream); // v3.1 / v3.3: established on connect
        };

        // v3.4 three-step negotiation, all under the device local key.
        debug!("Starting session key negotiation with {}", self.id);
        self.send_frame(
            &mut stream,
            session,
            next_seq(seq),
            FrameType::KeyStart as u32,
            &nonce_payload,
        )
        .await?;

        let deadline = Instant::now() + HANDSHAKE_STEP_TIMEOUT;
        let resp = match self.await_key_resp(&mut stream, session, decoder, deadline).await {
            Ok(frame) => frame,
            Err(e) => {
                session.reset();
                return Err(e);
            }
        };

        let final_payload = match session.on_key_resp(&resp.payload) {
            Ok(p) => p,
            Err(e) => {
                session.reset();
                return Err(e);
            }
        };
        self.send_frame(
            &mut stream,
            session,
            next_seq(seq),
            FrameType::KeyFinal as u32,
            &final_payload,
        )
        .await?;
        session.finalize()?;
        Ok(stream)
    }

    async fn await_key_resp(
        &self,
        stream: &mut TcpStream,
        session: &Session,
        decoder: &mut FrameDecoder,
        deadline: Instant,
    ) -> Result<TuyaFrame> {
        let mut buf = [0u8; 1024];
        loop {
            let hmac_key = session.hmac_key();
            while let Some(frame) =
                decoder.next_frame(hmac_key.as_ref().map(|k| k.as_slice()), Some(false))?
            {
                if frame.frame_type() == Some(FrameType::KeyResp) {
                    return Ok(frame);
                }
                debug!("Ignoring cmd 0x{:02X} during handshake", frame.cmd);
            }
            let n = timeout_at(deadline, stream.read(&mut buf))
                .await
                .map_err(|_| TuyaError::HandshakeFailed)??;
            if n == 0 {
                return Err(TuyaError::HandshakeFailed);
            }
            decoder.extend(&buf[..n]);
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_connection(
        &self,
        mut stream: TcpStream,
        session: Session,
        mut decoder: FrameDecoder,
        mut seq: u16,
        rx: &mut mpsc::Receiver<EngineCommand>,
        trigger: Option<EngineCommand>,
        poll: &mut Option<Interval>,
    ) -> ConnectionEnd {
        let mut pending: Option<Pending> = None;
        let mut last_rx = Instant::now();
        let mut protocol_errors: u32 = 0;
        let mut read_buf = vec![0u8; 4096];
        let mut hb = self.use_heartbeat.then(|| {
            let mut i = interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
            i.set_missed_tick_behavior(MissedTickBehavior::Skip);
            i
        });

        if let Some(cmd) = trigger {
            if let Err(e) = self
                .dispatch(&mut stream, &session, &mut seq, &mut pending, cmd)
                .await
            {
                return self.lost(pending, e);
            }
        }

        loop {
            let retry_deadline = pending.as_ref().map(|p| p.deadline);
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    if let Some(p) = pending.take() {
                        p.fail(TuyaError::NotConnected);
                    }
                    return ConnectionEnd::Stopped;
                }

                cmd = rx.recv() => match cmd {
                    None => {
                        if let Some(p) = pending.take() {
                            p.fail(TuyaError::NotConnected);
                        }
                        return ConnectionEnd::Stopped;
                    }
                    Some(EngineCommand::Disconnect) => {
                        // Abandoned silently, timer included
                        pending = None;
                        return ConnectionEnd::Idle;
                    }
                    Some(cmd) => {
                        if let Err(e) = self
                            .dispatch(&mut stream, &session, &mut seq, &mut pending, cmd)
                            .await
                        {
                            return self.lost(pending, e);
                        }
                    }
                },

                res = stream.read(&mut read_buf) => match res {
                    Ok(0) => {
                        return self.lost(pending, TuyaError::Io("connection closed by device".into()));
                    }
                    Ok(n) => {
                        decoder.extend(&read_buf[..n]);
                        loop {
                            let hmac_key = session.hmac_key();
                            match decoder.next_frame(hmac_key.as_ref().map(|k| k.as_slice()), Some(false)) {
                                Ok(Some(frame)) => {
                                    last_rx = Instant::now();
                                    if let Err(e) =
                                        self.handle_frame(&session, &mut pending, frame)
                                    {
                                        protocol_errors += 1;
                                        if protocol_errors > 1 {
                                            return self.lost(pending, e);
                                        }
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    warn!(
                                        "Dropping unverifiable frame from {} (key {}): {}",
                                        self.id,
                                        self.key_fingerprint(&session),
                                        e
                                    );
                                    protocol_errors += 1;
                                    if protocol_errors > 1 {
                                        return self.lost(pending, e);
                                    }
                                }
                            }
                        }
                    }
                    Err(e) => {
                        return self.lost(pending, e.into());
                    }
                },

                _ = sleep_opt(retry_deadline) => {
                    let expired = pending.as_mut().expect("deadline implies pending");
                    expired.retries_left -= 1;
                    if expired.retries_left == 0 {
                        let p = pending.take().expect("checked above");
                        error!("Request to {} timed out after {} attempts", self.id, RESPONSE_RETRIES);
                        p.fail(TuyaError::Timeout);
                        return ConnectionEnd::Lost(TuyaError::Timeout);
                    }
                    // Same command and payload, fresh sequence number
                    let new_seq = next_seq(&mut seq);
                    debug!(
                        "No response from {}, resending cmd 0x{:02X} as seq {} ({} retries left)",
                        self.id, expired.cmd, new_seq, expired.retries_left
                    );
                    expired.seq = new_seq;
                    expired.deadline = Instant::now() + RESPONSE_TIMEOUT;
                    let cmd = expired.cmd;
                    let cleartext = expired.cleartext.clone();
                    if let Err(e) = self
                        .send_frame(&mut stream, &session, new_seq, cmd, &cleartext)
                        .await
                    {
                        return self.lost(pending, e);
                    }
                }

                _ = tick_opt(hb.as_mut()) => {
                    if pending.is_none() {
                        let (cmd, payload) = build_heartbeat_payload(&self.id);
                        if let Err(e) = self
                            .send_frame(&mut stream, &session, next_seq(&mut seq), cmd, &payload)
                            .await
                        {
                            return self.lost(pending, e);
                        }
                    }
                }

                _ = tick_opt(poll.as_mut()) => {
                    if pending.is_none() {
                        if let Err(e) = self
                            .dispatch(&mut stream, &session, &mut seq, &mut pending, EngineCommand::Refresh)
                            .await
                        {
                            return self.lost(pending, e);
                        }
                    }
                }

                _ = sleep_opt(Some(last_rx + IDLE_WATCHDOG)) => {
                    return self.lost(
                        pending,
                        TuyaError::Io("no traffic within the watchdog window".into()),
                    );
                }
            }
        }
    }

    fn lost(&self, pending: Option<Pending>, err: TuyaError) -> ConnectionEnd {
        if let Some(p) = pending {
            p.fail(TuyaError::NotConnected);
        }
        ConnectionEnd::Lost(err)
    }

    fn key_fingerprint(&self, session: &Session) -> String {
        hex::encode(&session.active_key()[..4])
    }

    async fn dispatch(
        &self,
        stream: &mut TcpStream,
        session: &Session,
        seq: &mut u16,
        pending: &mut Option<Pending>,
        cmd: EngineCommand,
    ) -> Result<()> {
        let (wire_cmd, cleartext, resp) = match cmd {
            EngineCommand::Query { resp } => {
                let (c, p) = build_status_payload(self.version, &self.id);
                (c, p, PendingResp::Snapshot(resp))
            }
            EngineCommand::Refresh => {
                let (c, p) = build_status_payload(self.version, &self.id);
                (c, p, PendingResp::None)
            }
            EngineCommand::Set { dps, resp } => {
                let (c, p) = build_set_payload(self.version, &self.id, &dps);
                (c, p, PendingResp::Unit(resp))
            }
            EngineCommand::Heartbeat { resp } => {
                let (c, p) = build_heartbeat_payload(&self.id);
                (c, p, PendingResp::Unit(resp))
            }
            EngineCommand::Disconnect => unreachable!("handled by the caller"),
        };

        if pending.is_some() {
            // Supersession: the old op is abandoned, its reply channel
            // dropped without an error.
            debug!("Superseding in-flight request to {}", self.id);
        }

        let s = next_seq(seq);
        self.send_frame(stream, session, s, wire_cmd, &cleartext).await?;
        *pending = Some(Pending {
            cmd: wire_cmd,
            cleartext,
            seq: s,
            deadline: Instant::now() + RESPONSE_TIMEOUT,
            retries_left: RESPONSE_RETRIES,
            resp,
        });
        Ok(())
    }

    async fn send_frame(
        &self,
        stream: &mut TcpStream,
        session: &Session,
        seq: u16,
        cmd: u32,
        cleartext: &[u8],
    ) -> Result<()> {
        let cipher = session.cipher()?;
        let wire_payload = encode_payload(self.version, cmd, cleartext, &cipher)?;
        let frame = TuyaFrame {
            seq: seq as u32,
            cmd,
            retcode: None,
            payload: wire_payload,
        };
        let hmac_key = session.hmac_key();
        let packed = pack_frame(&frame, hmac_key.as_ref().map(|k| k.as_slice()))?;
        debug!(
            "Sending cmd 0x{:02X} seq {} to {} ({} bytes)",
            cmd,
            seq,
            self.id,
            packed.len()
        );
        stream.write_all(&packed).await?;
        Ok(())
    }

    fn handle_frame(
        &self,
        session: &Session,
        pending: &mut Option<Pending>,
        frame: TuyaFrame,
    ) -> Result<()> {
        let Some(frame_type) = frame.frame_type() else {
            debug!("Dropping unknown cmd 0x{:02X} from {}", frame.cmd, self.id);
            return Ok(());
        };

        let cipher = session.cipher()?;
        let cleartext = match decode_payload(self.version, &frame.payload, &cipher) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "Payload decode failed for cmd 0x{:02X} from {} (key {}): {}",
                    frame.cmd,
                    self.id,
                    self.key_fingerprint(session),
                    e
                );
                return Err(e);
            }
        };
        debug!(
            "Received {} seq {} from {} ({} bytes)",
            frame_type,
            frame.seq,
            self.id,
            cleartext.len()
        );

        // DP map first, events second, pending resolution last: status
        // updates always reach subscribers before the response they ride on.
        if !cleartext.is_empty() {
            match serde_json::from_slice::<Value>(&cleartext) {
                Ok(body) => {
                    if let Some(dps) = body
                        .get("dps")
                        .or_else(|| body.get("data").and_then(|d| d.get("dps")))
                    {
                        let deltas = self
                            .snapshot
                            .write()
                            .expect("snapshot lock poisoned")
                            .apply(dps);
                        for (dp, value) in deltas {
                            let _ = self.events_tx.send(DeviceEvent::Dp { dp, value });
                        }
                    }
                }
                Err(_) => {
                    debug!(
                        "Non-JSON payload on cmd 0x{:02X} from {}: {}",
                        frame.cmd,
                        self.id,
                        hex::encode(&cleartext)
                    );
                }
            }
        }

        if pending
            .as_ref()
            .is_some_and(|p| p.seq as u32 == frame.seq)
        {
            let p = pending.take().expect("checked above");
            p.succeed(self.snapshot.read().expect("snapshot lock poisoned").clone());
        }

        Ok(())
    }
}
