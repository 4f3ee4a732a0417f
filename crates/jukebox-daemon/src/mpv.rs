/// mpv IPC driver with separated reader/writer tasks, plus the
/// `PlaybackController` the dispatcher drives.
///
/// Architecture:
///
/// ```text
///   MpvDriver::spawn_and_connect()
///         │
///         ├── writer_task   ← receives MpvRequest via mpsc, serialises → socket
///         └── reader_task   ← reads JSON lines from socket
///                                ├── response (has request_id) → matched oneshot::Sender
///                                └── event / property-change   → event_pump
///
///   event_pump  ── time-pos / duration / pause → Observed
///               ── end-file eof / error        → PlaybackSignals
/// ```
///
/// The controller side never waits on mpv: commands are queued with
/// `MpvHandle::fire` and whatever mpv reports back lands in `Observed`.
///
/// Platform notes:
/// - Unix:   Unix domain sockets
/// - Windows: Named pipes  \\.\pipe\<name>
use jukebox_core::collab::{PlaybackController, PlaybackSignals};
use jukebox_core::config::MpvConfig;
use jukebox_core::{platform, Error, Track};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

// ── global request-id counter ─────────────────────────────────────────────────

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

// ── observation property IDs ──────────────────────────────────────────────────

pub const OBS_PAUSE: u64 = 1;
pub const OBS_TIME_POS: u64 = 2;
pub const OBS_DURATION: u64 = 3;

// ── internal channel types ────────────────────────────────────────────────────

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line (already has '\n')
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

fn encode_request(command: &Value) -> anyhow::Result<(u64, String)> {
    let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
    let msg = json!({ "command": command, "request_id": req_id });
    let mut raw = serde_json::to_string(&msg)?;
    raw.push('\n');
    Ok((req_id, raw))
}

/// An mpv event / property-change that arrived unsolicited (no request_id).
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    /// Returns `Some((obs_id, data))` if this is a property-change event.
    pub fn as_property_change(&self) -> Option<(u64, &Value)> {
        if self.raw.get("event")?.as_str()? == "property-change" {
            let id = self.raw.get("id")?.as_u64()?;
            let data = self.raw.get("data").unwrap_or(&Value::Null);
            Some((id, data))
        } else {
            None
        }
    }

    /// Returns the event name, e.g. "end-file", "start-file", "file-loaded".
    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }
}

// ── public handle ─────────────────────────────────────────────────────────────

/// Cloneable handle to the mpv writer task.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    /// Send a command and await mpv's response.
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let (req_id, raw) = encode_request(&command)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(tokio::time::Duration::from_secs(5), reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    /// Queue a command without waiting for the response.  Usable from sync
    /// code; fails only when the writer is gone or backed up.
    pub fn fire(&self, command: Value) -> anyhow::Result<()> {
        let (req_id, raw) = encode_request(&command)?;
        let (reply, _) = oneshot::channel();
        self.tx
            .try_send(PendingRequest {
                req_id,
                payload: raw,
                reply,
            })
            .map_err(|e| anyhow::anyhow!("mpv writer unavailable: {}", e))
    }

    /// Register observe_property for all properties we care about.
    /// Must be called after every fresh connection.
    pub async fn observe_all_properties(&self) {
        let props = [
            (OBS_PAUSE, "pause"),
            (OBS_TIME_POS, "time-pos"),
            (OBS_DURATION, "duration"),
        ];
        for (id, name) in &props {
            match self.send(json!(["observe_property", id, name])).await {
                Ok(_) => debug!("mpv: observe_property id={} name={}", id, name),
                Err(e) => warn!("mpv: observe_property {} failed: {}", name, e),
            }
        }
    }

    /// Handle whose requests land in the returned receiver instead of mpv.
    #[cfg(test)]
    fn detached() -> (Self, mpsc::Receiver<PendingRequest>) {
        let (tx, rx) = mpsc::channel(64);
        (Self { tx }, rx)
    }
}

// ── driver ────────────────────────────────────────────────────────────────────

/// Owns the mpv child process.
pub struct MpvDriver {
    socket_name: String,
    binary: Option<PathBuf>,
    process: Option<tokio::process::Child>,
    pub volume: f32,
}

impl MpvDriver {
    pub fn new(config: &MpvConfig) -> Self {
        Self {
            socket_name: platform::mpv_socket_name(),
            binary: config.binary.clone(),
            process: None,
            volume: config.volume,
        }
    }

    /// Kill the process if running.
    pub async fn kill(&mut self) {
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }
    }

    fn spawn_process(&mut self) -> anyhow::Result<()> {
        info!("mpv: spawning new process");
        let mpv_binary = self
            .binary
            .clone()
            .or_else(platform::find_mpv_binary)
            .ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;

        let vol_arg = format!(
            "--volume={}",
            (self.volume * 100.0).clamp(0.0, 100.0).round() as i64
        );
        let ipc_arg = platform::mpv_socket_arg();

        let child = tokio::process::Command::new(mpv_binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg("--keep-open=no")
            .arg(&ipc_arg)
            .arg("--quiet")
            .arg(vol_arg)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        self.process = Some(child);
        Ok(())
    }

    // ── spawn ─────────────────────────────────────────────────────────────────

    #[cfg(unix)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        // Kill stale process
        self.kill().await;

        let socket_path = PathBuf::from(&self.socket_name);
        let _ = tokio::fs::remove_file(&socket_path).await;

        self.spawn_process()?;

        // Wait for socket to appear
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if socket_path.exists() {
                break;
            }
        }
        if !socket_path.exists() {
            anyhow::bail!("mpv IPC socket did not appear");
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;

        let stream = UnixStream::connect(&socket_path).await?;
        info!("mpv: connected to IPC socket");
        let (read_half, write_half) = stream.into_split();
        Ok(start_io_tasks(read_half, write_half, event_tx))
    }

    #[cfg(windows)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        self.kill().await;
        self.spawn_process()?;

        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            match ClientOptions::new().open(&pipe_path) {
                Ok(client) => {
                    info!("mpv: connected to named pipe");
                    let (read_half, write_half) = tokio::io::split(client);
                    return Ok(start_io_tasks(read_half, write_half, event_tx));
                }
                Err(_) => continue,
            }
        }
        anyhow::bail!("mpv named pipe did not appear")
    }
}

fn start_io_tasks<R, W>(read_half: R, write_half: W, event_tx: mpsc::Sender<MpvEvent>) -> MpvHandle
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let reader = BufReader::new(read_half);

    // pending map: req_id → reply channel.  Shared between writer (inserts) and reader (resolves).
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

    tokio::spawn(writer_task(write_half, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(reader, pending, event_tx));

    MpvHandle { tx: cmd_tx }
}

// ── reader task ───────────────────────────────────────────────────────────────

async fn reader_task<R>(mut reader: BufReader<R>, pending: PendingMap, event_tx: mpsc::Sender<MpvEvent>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                let mut map = pending.lock().await;
                for (_, tx) in map.drain() {
                    let _ = tx.send(Err(anyhow::anyhow!("mpv IPC connection closed")));
                }
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                if let Some(req_id) = val.get("request_id").and_then(|v| v.as_u64()) {
                    let mut map = pending.lock().await;
                    if let Some(tx) = map.remove(&req_id) {
                        let result = if val["error"].as_str() == Some("success") {
                            Ok(val)
                        } else {
                            let err = val["error"]
                                .as_str()
                                .unwrap_or("unknown error")
                                .to_string();
                            debug!("mpv reader: response req={} err={}", req_id, err);
                            Err(anyhow::anyhow!("mpv error: {}", err))
                        };
                        let _ = tx.send(result);
                    }
                } else {
                    let _ = event_tx.send(MpvEvent { raw: val }).await;
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                let mut map = pending.lock().await;
                for (_, tx) in map.drain() {
                    let _ = tx.send(Err(anyhow::anyhow!("mpv IPC read error: {}", e)));
                }
                break;
            }
        }
    }
}

// ── writer task ───────────────────────────────────────────────────────────────

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: PendingMap)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register reply channel before writing so reader can match it
        {
            let mut map = pending.lock().await;
            map.insert(req.req_id, req.reply);
        }
        debug!("mpv writer: send req={} payload={}", req.req_id, req.payload.trim());
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            let mut map = pending.lock().await;
            if let Some(tx) = map.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}

// ── observed playback state ───────────────────────────────────────────────────

/// What mpv last told us about the loaded file.
#[derive(Debug, Default)]
pub struct Observed {
    pub position_ms: u32,
    pub duration_ms: u32,
    pub playing: bool,
    pub loaded: bool,
    /// Seek requested before the file finished loading.
    pub pending_seek_ms: Option<u32>,
}

pub type SharedObserved = Arc<std::sync::Mutex<Observed>>;

fn observe(observed: &SharedObserved) -> std::sync::MutexGuard<'_, Observed> {
    observed.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The subset of mpv events playback cares about.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    Position(u32),
    Duration(u32),
    Paused(bool),
    FileLoaded,
    Finished,
    Failed(String),
}

fn secs_to_ms(data: &Value) -> Option<u32> {
    let secs = data.as_f64()?;
    Some((secs.max(0.0) * 1000.0).round().min(u32::MAX as f64) as u32)
}

pub fn classify(event: &MpvEvent) -> Option<PlayerEvent> {
    if let Some((id, data)) = event.as_property_change() {
        return match id {
            OBS_TIME_POS => secs_to_ms(data).map(PlayerEvent::Position),
            OBS_DURATION => secs_to_ms(data).map(PlayerEvent::Duration),
            OBS_PAUSE => data.as_bool().map(PlayerEvent::Paused),
            _ => None,
        };
    }
    match event.event_name()? {
        "file-loaded" => Some(PlayerEvent::FileLoaded),
        "end-file" => match event.raw.get("reason").and_then(|r| r.as_str()) {
            Some("eof") => Some(PlayerEvent::Finished),
            Some("error") => {
                let reason = event
                    .raw
                    .get("file_error")
                    .and_then(|e| e.as_str())
                    .unwrap_or("unknown error");
                Some(PlayerEvent::Failed(reason.to_string()))
            }
            // stop / quit / redirect: we replaced or closed the file ourselves.
            _ => None,
        },
        _ => None,
    }
}

fn apply(event: PlayerEvent, observed: &SharedObserved, mpv: &MpvHandle, signals: &PlaybackSignals) {
    match event {
        PlayerEvent::Position(ms) => observe(observed).position_ms = ms,
        PlayerEvent::Duration(ms) => observe(observed).duration_ms = ms,
        PlayerEvent::Paused(paused) => observe(observed).playing = !paused,
        PlayerEvent::FileLoaded => {
            let seek = {
                let mut o = observe(observed);
                o.loaded = true;
                o.pending_seek_ms.take()
            };
            if let Some(ms) = seek {
                debug!("mpv: applying deferred seek to {}ms", ms);
                if let Err(e) = mpv.fire(seek_command(ms)) {
                    warn!("mpv: deferred seek failed: {}", e);
                }
            }
        }
        PlayerEvent::Finished => {
            observe(observed).loaded = false;
            signals.completed();
        }
        PlayerEvent::Failed(reason) => {
            observe(observed).loaded = false;
            signals.failed(&reason);
        }
    }
}

/// Feed mpv events into `observed` and completion callbacks until mpv goes away.
pub async fn event_pump(
    mut events: mpsc::Receiver<MpvEvent>,
    mpv: MpvHandle,
    observed: SharedObserved,
    signals: PlaybackSignals,
) {
    while let Some(event) = events.recv().await {
        if let Some(event) = classify(&event) {
            apply(event, &observed, &mpv, &signals);
        }
    }
    warn!("mpv: event stream ended");
}

fn seek_command(position_ms: u32) -> Value {
    json!(["seek", position_ms as f64 / 1000.0, "absolute"])
}

fn is_url(location: &str) -> bool {
    location.contains("://")
}

// ── controller ────────────────────────────────────────────────────────────────

pub struct MpvPlayer {
    mpv: MpvHandle,
    observed: SharedObserved,
}

impl MpvPlayer {
    pub fn new(mpv: MpvHandle) -> Self {
        Self {
            mpv,
            observed: SharedObserved::default(),
        }
    }

    pub fn observed(&self) -> SharedObserved {
        self.observed.clone()
    }

    fn fire(&self, command: Value) -> jukebox_core::Result<()> {
        self.mpv
            .fire(command)
            .map_err(|e| Error::Playback(e.to_string()))
    }
}

impl PlaybackController for MpvPlayer {
    fn load(&mut self, track: &Track) -> jukebox_core::Result<()> {
        let location = track.info.location.as_str();
        if location.is_empty() {
            return Err(Error::Load {
                track: track.id,
                reason: "no location in catalog".into(),
            });
        }
        if !is_url(location) && !Path::new(location).exists() {
            return Err(Error::Load {
                track: track.id,
                reason: format!("{} does not exist", location),
            });
        }

        *observe(&self.observed) = Observed::default();
        self.fire(json!(["set_property", "pause", true]))?;
        self.fire(json!(["loadfile", location, "replace"]))
            .map_err(|e| Error::Load {
                track: track.id,
                reason: e.to_string(),
            })?;
        debug!("mpv: loading {}", location);
        Ok(())
    }

    fn start(&mut self) -> jukebox_core::Result<()> {
        self.fire(json!(["set_property", "pause", false]))?;
        observe(&self.observed).playing = true;
        Ok(())
    }

    fn pause(&mut self) -> jukebox_core::Result<()> {
        self.fire(json!(["set_property", "pause", true]))?;
        observe(&self.observed).playing = false;
        Ok(())
    }

    fn seek_ms(&mut self, position_ms: u32) -> jukebox_core::Result<()> {
        let mut o = observe(&self.observed);
        if !o.loaded {
            o.pending_seek_ms = Some(position_ms);
            return Ok(());
        }
        o.position_ms = position_ms;
        drop(o);
        self.fire(seek_command(position_ms))
    }

    fn position_ms(&self) -> u32 {
        observe(&self.observed).position_ms
    }

    fn duration_ms(&self) -> u32 {
        observe(&self.observed).duration_ms
    }

    fn is_playing(&self) -> bool {
        observe(&self.observed).playing
    }
}
