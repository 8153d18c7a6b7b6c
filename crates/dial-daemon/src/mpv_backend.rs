//! [`PlaybackBackend`] over a pool of mpv processes, one per channel.
//!
//! Each player runs `loop-file=inf` so a channel only stops on its own when
//! mpv reports an error or the process goes away.  End-of-file and error
//! notifications are folded into per-player atomic flags by a watcher task
//! that is spawned once per IPC connection.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dial_proto::config::PlaybackConfig;
use dial_proto::model::MediaRef;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::backend::{resolve_media, HandleId, PlaybackBackend};
use crate::mpv::{MpvEvent, MpvHandle, MpvProcess};

/// Written by the watcher task, read by the scheduler.
#[derive(Default)]
struct PlayerFlags {
    ended: AtomicBool,
    failed: AtomicBool,
    disconnected: AtomicBool,
}

impl PlayerFlags {
    fn reset(&self) {
        self.ended.store(false, Ordering::Relaxed);
        self.failed.store(false, Ordering::Relaxed);
    }
}

struct Player {
    process: MpvProcess,
    ipc: Option<MpvHandle>,
    flags: Arc<PlayerFlags>,
    media: MediaRef,
    volume: f32,
    /// Last volume actually handed to mpv.
    sent_volume: Option<f32>,
    /// Set for the duration of a restart; a restart cut short by its time
    /// limit leaves the player reading as dead.
    restarting: bool,
}

impl Player {
    fn is_alive(&mut self) -> bool {
        let Some(ipc) = &self.ipc else {
            return false;
        };
        !self.restarting
            && !ipc.is_closed()
            && self.process.process_alive()
            && !self.flags.ended.load(Ordering::Relaxed)
            && !self.flags.failed.load(Ordering::Relaxed)
            && !self.flags.disconnected.load(Ordering::Relaxed)
    }

    fn push_volume(&mut self) {
        if self.sent_volume == Some(self.volume) {
            return;
        }
        if let Some(ipc) = &self.ipc {
            if ipc.post_volume(self.volume) {
                self.sent_volume = Some(self.volume);
            }
        }
    }
}

pub struct MpvBackend {
    fallback: MediaRef,
    max_spares: usize,
    next_handle: u64,
    next_process: u64,
    players: HashMap<HandleId, Player>,
    /// Idle players kept for reuse by the next `acquire`.
    spares: Vec<Player>,
}

impl MpvBackend {
    pub fn new(config: &PlaybackConfig) -> Self {
        Self {
            fallback: config.fallback(),
            max_spares: config.spare_players,
            next_handle: 0,
            next_process: 0,
            players: HashMap::new(),
            spares: Vec::new(),
        }
    }

    /// Start a fresh mpv process.  On failure the player is returned without
    /// an IPC handle so it reports dead and the watchdog retries later.
    async fn spawn_player(&mut self, media: MediaRef) -> Player {
        self.next_process += 1;
        let process_id = self.next_process;
        let mut player = Player {
            process: MpvProcess::new(process_id),
            ipc: None,
            flags: Arc::new(PlayerFlags::default()),
            media,
            volume: 0.0,
            sent_volume: Some(0.0),
            restarting: false,
        };
        Self::connect(&mut player, process_id).await;
        player
    }

    async fn connect(player: &mut Player, process_id: u64) {
        let (event_tx, event_rx) = mpsc::channel::<MpvEvent>(32);
        match player.process.spawn_and_connect(process_id, event_tx).await {
            Ok(ipc) => {
                if let Err(e) = ipc.send(json!(["set_property", "loop-file", "inf"])).await {
                    warn!("mpv: player {} rejected loop-file: {}", process_id, e);
                }
                player.flags = Arc::new(PlayerFlags::default());
                tokio::spawn(watch_events(process_id, event_rx, player.flags.clone()));
                player.ipc = Some(ipc);
                player.sent_volume = Some(0.0);
            }
            Err(e) => {
                warn!("mpv: could not start player {}: {}", process_id, e);
                player.process.kill().await;
                player.ipc = None;
            }
        }
    }

    async fn load(player: &mut Player) {
        let Some(ipc) = &player.ipc else {
            return;
        };
        player.flags.reset();
        if let Err(e) = ipc.load_file(player.media.as_str()).await {
            warn!("mpv: loadfile {} failed: {}", player.media.label(), e);
            player.flags.failed.store(true, Ordering::Relaxed);
        }
    }
}

impl PlaybackBackend for MpvBackend {
    async fn acquire(&mut self, media: &MediaRef) -> HandleId {
        let media = resolve_media(media, &self.fallback);
        let mut player = match self.spares.pop() {
            Some(mut spare) => {
                spare.media = media;
                spare.volume = 0.0;
                if let Some(ipc) = &spare.ipc {
                    if let Err(e) = ipc.set_volume(0.0).await {
                        debug!("mpv: spare volume reset failed: {}", e);
                    }
                }
                spare.sent_volume = Some(0.0);
                spare
            }
            None => self.spawn_player(media).await,
        };
        Self::load(&mut player).await;

        self.next_handle += 1;
        let handle = HandleId(self.next_handle);
        info!("mpv: {} playing {}", handle, player.media.label());
        self.players.insert(handle, player);
        handle
    }

    fn set_volume(&mut self, handle: HandleId, volume: f32) {
        if let Some(player) = self.players.get_mut(&handle) {
            player.volume = volume.clamp(0.0, 1.0);
            player.push_volume();
        }
    }

    fn volume(&self, handle: HandleId) -> f32 {
        self.players.get(&handle).map(|p| p.volume).unwrap_or(0.0)
    }

    fn is_alive(&mut self, handle: HandleId) -> bool {
        self.players
            .get_mut(&handle)
            .map(Player::is_alive)
            .unwrap_or(false)
    }

    async fn restart(&mut self, handle: HandleId) {
        let Some(player) = self.players.get_mut(&handle) else {
            return;
        };
        player.restarting = true;
        let failed = player.flags.failed.load(Ordering::Relaxed);

        let connection_lost = match &player.ipc {
            Some(ipc) => {
                ipc.is_closed()
                    || !player.process.process_alive()
                    || player.flags.disconnected.load(Ordering::Relaxed)
                    || ipc.ping().await.is_err()
            }
            None => true,
        };
        if connection_lost {
            info!("mpv: {} lost its player, respawning", handle);
            player.process.kill().await;
            self.next_process += 1;
            let process_id = self.next_process;
            player.process = MpvProcess::new(process_id);
            Self::connect(player, process_id).await;
        }

        if failed && player.media != self.fallback {
            warn!(
                "mpv: {} failed on {}, switching to {}",
                handle,
                player.media.label(),
                self.fallback.label()
            );
            player.media = self.fallback.clone();
        }

        Self::load(player).await;
        player.sent_volume = None;
        player.push_volume();
        player.restarting = false;
        debug!("mpv: {} restarted", handle);
    }

    async fn release(&mut self, handle: HandleId) {
        let Some(mut player) = self.players.remove(&handle) else {
            return;
        };
        debug!("mpv: releasing {}", handle);
        let reusable = player.is_alive() && self.spares.len() < self.max_spares;
        if reusable {
            if let Some(ipc) = &player.ipc {
                ipc.post_stop();
            }
            player.volume = 0.0;
            self.spares.push(player);
        } else {
            player.process.kill().await;
        }
    }

    async fn shutdown(&mut self) {
        info!(
            "mpv: stopping {} players and {} spares",
            self.players.len(),
            self.spares.len()
        );
        for (_, mut player) in self.players.drain() {
            player.process.kill().await;
        }
        for mut player in self.spares.drain(..) {
            player.process.kill().await;
        }
    }
}

/// Fold one player's event stream into its flags.  Exits when the IPC
/// connection closes.
async fn watch_events(
    process_id: u64,
    mut rx: mpsc::Receiver<MpvEvent>,
    flags: Arc<PlayerFlags>,
) {
    while let Some(event) = rx.recv().await {
        match event.end_reason() {
            Some("eof") => {
                debug!("mpv: player {} reached end of file", process_id);
                flags.ended.store(true, Ordering::Relaxed);
            }
            Some("error") => {
                warn!("mpv: player {} reported a playback error", process_id);
                flags.failed.store(true, Ordering::Relaxed);
            }
            _ => {}
        }
    }
    debug!("mpv: player {} event stream closed", process_id);
    flags.disconnected.store(true, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_watcher_sets_flags() {
        let flags = Arc::new(PlayerFlags::default());
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(watch_events(1, rx, flags.clone()));

        tx.send(MpvEvent {
            raw: json!({"event": "end-file", "reason": "stop"}),
        })
        .await
        .unwrap();
        tx.send(MpvEvent {
            raw: json!({"event": "end-file", "reason": "error"}),
        })
        .await
        .unwrap();
        drop(tx);
        task.await.unwrap();

        assert!(!flags.ended.load(Ordering::Relaxed));
        assert!(flags.failed.load(Ordering::Relaxed));
        assert!(flags.disconnected.load(Ordering::Relaxed));

        flags.reset();
        assert!(!flags.failed.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_unknown_handles_are_ignored() {
        let mut backend = MpvBackend::new(&PlaybackConfig::default());
        let ghost = HandleId(99);
        backend.set_volume(ghost, 0.5);
        assert_eq!(backend.volume(ghost), 0.0);
        assert!(!backend.is_alive(ghost));
        backend.restart(ghost).await;
        backend.release(ghost).await;
        backend.shutdown().await;
    }
}
