/// mpv IPC driver with separated reader/writer tasks.
///
/// Architecture (one per mpv process / playback channel):
///
/// ```text
///   MpvProcess::spawn_and_connect()
///         │
///         ├── writer_task   ← receives MpvRequest via mpsc, serialises → socket
///         └── reader_task   ← reads JSON lines from socket
///                                ├── response (has request_id) → matched oneshot::Sender
///                                └── event (end-file, ...)     → event_tx channel
/// ```
///
/// Public API:
///   - `MpvHandle`: cheaply cloneable.  `send(cmd)` awaits the reply,
///     `post(cmd)` queues without waiting.
///   - `MpvProcess`: owns the child process.
///
/// Platform notes:
/// - Unix:   Unix domain sockets
/// - Windows: Named pipes  \\.\pipe\<name>
use serde_json::{json, Value};
use std::collections::HashMap;
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

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;

// ── internal channel types ────────────────────────────────────────────────────

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line (already has '\n')
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// An mpv event that arrived unsolicited (no request_id).
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    /// Returns the event name, e.g. "end-file", "start-file", "file-loaded".
    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }

    /// For `end-file`: "eof", "stop", "quit", "error" or "redirect".
    pub fn end_reason(&self) -> Option<&str> {
        if self.event_name()? != "end-file" {
            return None;
        }
        self.raw.get("reason")?.as_str()
    }
}

/// mpv's `volume` property is cubic: playback gain is `(volume/100)^3`.
/// Convert a linear 0..1 gain into the property value.
pub fn gain_to_mpv_volume(gain: f32) -> f64 {
    let gain = gain.clamp(0.0, 1.0) as f64;
    (gain.cbrt() * 100.0).clamp(0.0, 100.0)
}

// ── public handle ─────────────────────────────────────────────────────────────

/// Cloneable handle to the mpv writer task.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    fn encode(command: Value) -> anyhow::Result<(u64, String)> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg)?;
        raw.push('\n');
        Ok((req_id, raw))
    }

    /// Fire a command and await mpv's reply (5 s limit).
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let (req_id, raw) = Self::encode(command)?;
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

    /// Queue a command without waiting for the reply.  Never blocks: if the
    /// writer queue is full the command is dropped and `false` returned.
    pub fn post(&self, command: Value) -> bool {
        let Ok((req_id, raw)) = Self::encode(command) else {
            return false;
        };
        let (reply_tx, _reply_rx) = oneshot::channel();
        match self.tx.try_send(PendingRequest {
            req_id,
            payload: raw,
            reply: reply_tx,
        }) {
            Ok(()) => true,
            Err(e) => {
                debug!("mpv: dropped req={} ({})", req_id, e);
                false
            }
        }
    }

    /// True once the writer task has exited (connection lost).
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// ── process ───────────────────────────────────────────────────────────────────

/// Owns one mpv child process.
pub struct MpvProcess {
    socket_name: String,
    process: Option<tokio::process::Child>,
}

impl MpvProcess {
    pub fn new(player_id: u64) -> Self {
        Self {
            socket_name: dial_proto::platform::mpv_socket_name(player_id),
            process: None,
        }
    }

    pub fn process_alive(&mut self) -> bool {
        if let Some(ref mut child) = self.process {
            child.try_wait().ok().flatten().is_none()
        } else {
            false
        }
    }

    /// Kill the process if running.
    pub async fn kill(&mut self) {
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }
        #[cfg(unix)]
        {
            let _ = tokio::fs::remove_file(&self.socket_name).await;
        }
    }

    fn spawn_process(&mut self, ipc_arg: String) -> anyhow::Result<()> {
        let mpv_binary = dial_proto::platform::find_mpv_binary()
            .ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;

        let child = tokio::process::Command::new(mpv_binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg(ipc_arg)
            .arg("--quiet")
            .arg("--no-terminal")
            .arg("--volume=0")
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        self.process = Some(child);
        Ok(())
    }

    // ── spawn / connect ───────────────────────────────────────────────────────

    #[cfg(unix)]
    pub async fn spawn_and_connect(
        &mut self,
        player_id: u64,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        self.kill().await;
        self.socket_name = dial_proto::platform::mpv_socket_name(player_id);

        let socket_path = std::path::PathBuf::from(&self.socket_name);
        let _ = tokio::fs::remove_file(&socket_path).await;

        debug!("mpv: spawning player {}", player_id);
        self.spawn_process(dial_proto::platform::mpv_socket_arg(player_id))?;

        // Wait for socket to appear
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
            if socket_path.exists() {
                break;
            }
        }
        if !socket_path.exists() {
            anyhow::bail!("mpv IPC socket did not appear");
        }

        let mut last_err = None;
        for _ in 0..10 {
            match UnixStream::connect(&socket_path).await {
                Ok(stream) => {
                    info!("mpv: player {} connected", player_id);
                    return Ok(Self::start_io_tasks(stream, event_tx));
                }
                Err(e) => {
                    last_err = Some(e);
                    tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
                }
            }
        }
        Err(anyhow::anyhow!(
            "mpv IPC connect failed: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        ))
    }

    #[cfg(unix)]
    fn start_io_tasks(stream: UnixStream, event_tx: mpsc::Sender<MpvEvent>) -> MpvHandle {
        let (read_half, write_half) = stream.into_split();
        Self::spawn_io(BufReader::new(read_half), write_half, event_tx)
    }

    // ── Windows ───────────────────────────────────────────────────────────────

    #[cfg(windows)]
    pub async fn spawn_and_connect(
        &mut self,
        player_id: u64,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        self.kill().await;
        self.socket_name = dial_proto::platform::mpv_socket_name(player_id);

        debug!("mpv: spawning player {}", player_id);
        self.spawn_process(dial_proto::platform::mpv_socket_arg(player_id))?;

        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
            if let Ok(client) = ClientOptions::new().open(&pipe_path) {
                info!("mpv: player {} connected", player_id);
                let (read_half, write_half) = tokio::io::split(client);
                return Ok(Self::spawn_io(BufReader::new(read_half), write_half, event_tx));
            }
        }
        anyhow::bail!("mpv named pipe did not appear")
    }

    fn spawn_io<R, W>(
        reader: BufReader<R>,
        writer: W,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> MpvHandle
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
        W: tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        // pending map: req_id → reply channel.  Shared between writer (inserts) and reader (resolves).
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

        tokio::spawn(writer_task(writer, cmd_rx, pending.clone()));
        tokio::spawn(reader_task(reader, pending, event_tx));

        MpvHandle { tx: cmd_tx }
    }
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
                // Fail all pending requests
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
                    debug!("mpv reader: event {}", trimmed);
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

// ── convenience wrappers ──────────────────────────────────────────────────────

impl MpvHandle {
    pub async fn load_file(&self, media: &str) -> anyhow::Result<()> {
        self.send(json!(["loadfile", media, "replace"])).await?;
        Ok(())
    }

    pub fn post_volume(&self, gain: f32) -> bool {
        self.post(json!(["set_property", "volume", gain_to_mpv_volume(gain)]))
    }

    pub async fn set_volume(&self, gain: f32) -> anyhow::Result<()> {
        self.send(json!(["set_property", "volume", gain_to_mpv_volume(gain)]))
            .await?;
        Ok(())
    }

    pub fn post_stop(&self) -> bool {
        self.post(json!(["stop"]))
    }

    /// Health-check: returns Ok(()) if mpv is responsive.
    pub async fn ping(&self) -> anyhow::Result<()> {
        self.send(json!(["get_property", "volume"])).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_reason() {
        let eof = MpvEvent {
            raw: json!({"event": "end-file", "reason": "eof", "playlist_entry_id": 1}),
        };
        assert_eq!(eof.end_reason(), Some("eof"));

        let started = MpvEvent {
            raw: json!({"event": "start-file", "playlist_entry_id": 2}),
        };
        assert_eq!(started.event_name(), Some("start-file"));
        assert_eq!(started.end_reason(), None);
    }

    #[test]
    fn test_gain_to_mpv_volume_is_cubic() {
        assert_eq!(gain_to_mpv_volume(0.0), 0.0);
        assert!((gain_to_mpv_volume(1.0) - 100.0).abs() < 1e-9);
        assert!((gain_to_mpv_volume(0.125) - 50.0).abs() < 1e-4);
        assert_eq!(gain_to_mpv_volume(3.0), 100.0);
    }

    #[tokio::test]
    async fn test_io_tasks_route_replies_and_events() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client);
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let handle = MpvProcess::spawn_io(BufReader::new(client_read), client_write, event_tx);

        let (server_read, mut server_write) = tokio::io::split(server);
        let fake_mpv = tokio::spawn(async move {
            let mut lines = BufReader::new(server_read).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            let req: Value = serde_json::from_str(&line).unwrap();
            assert_eq!(req["command"][0], "get_property");
            let id = req["request_id"].as_u64().unwrap();
            let event = json!({"event": "end-file", "reason": "eof"}).to_string();
            let reply = json!({"request_id": id, "error": "success", "data": 0.0}).to_string();
            server_write
                .write_all(format!("{}\n{}\n", event, reply).as_bytes())
                .await
                .unwrap();
        });

        handle.ping().await.unwrap();
        let event = event_rx.recv().await.unwrap();
        assert_eq!(event.end_reason(), Some("eof"));
        fake_mpv.await.unwrap();
    }
}
