use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serenity::model::id::{ChannelId, GuildId};
use songbird::{
    error::JoinError,
    input::File,
    tracks::{PlayMode, TrackHandle},
    Event, EventContext, EventHandler as VoiceEventHandler, Songbird, TrackEvent,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::{debug, error, info, warn};

use super::backend::{AudioSubsystem, PlaybackStats, StreamEnd, StreamRequest, VoiceClient};
use crate::error::PlayerError;

struct ActiveTrack {
    handle: TrackHandle,
    request: StreamRequest,
}

/// Songbird implementation of [`AudioSubsystem`] and [`VoiceClient`].
///
/// Drives a single guild's call: the player actor connects it to one channel
/// at a time and streams one local file at a time into it.
pub struct SongbirdBackend {
    manager: Arc<Songbird>,
    guild: RwLock<Option<GuildId>>,
    current: Mutex<Option<ActiveTrack>>,
}

impl SongbirdBackend {
    pub fn new(manager: Arc<Songbird>) -> Self {
        Self {
            manager,
            guild: RwLock::new(None),
            current: Mutex::new(None),
        }
    }

    fn current_handle(&self) -> Option<TrackHandle> {
        self.current.lock().as_ref().map(|track| track.handle.clone())
    }
}

#[async_trait]
impl AudioSubsystem for SongbirdBackend {
    async fn start(&self, request: StreamRequest) -> Result<(), PlayerError> {
        let guild = (*self.guild.read()).ok_or(PlayerError::NotConnected)?;
        let call = self.manager.get(guild).ok_or(PlayerError::NotConnected)?;

        if tokio::fs::metadata(&request.path).await.is_err() {
            return Err(PlayerError::Stream(format!(
                "archivo no encontrado: {}",
                request.path.display()
            )));
        }

        let handle = {
            let mut call = call.lock().await;
            call.play_input(File::new(request.path.clone()).into())
        };

        let notifier = TrackOutcomeNotifier {
            request: request.clone(),
            reported: Arc::new(AtomicBool::new(false)),
        };
        for event in [TrackEvent::End, TrackEvent::Error] {
            if let Err(e) = handle.add_event(Event::Track(event), notifier.clone()) {
                // el track ya terminó antes de registrar los eventos
                let _ = handle.stop();
                return Err(PlayerError::Stream(e.to_string()));
            }
        }

        debug!("▶️ Track iniciado: {}", request.path.display());
        *self.current.lock() = Some(ActiveTrack { handle, request });
        Ok(())
    }

    async fn stop(&self) {
        let Some(handle) = self.current_handle() else {
            return;
        };
        if let Err(e) = handle.stop() {
            debug!("Track ya detenido: {}", e);
        }
    }

    async fn is_playing(&self) -> bool {
        let Some(handle) = self.current_handle() else {
            return false;
        };
        match handle.get_info().await {
            Ok(info) => !matches!(
                info.playing,
                PlayMode::Stop | PlayMode::End | PlayMode::Errored(_)
            ),
            Err(_) => false,
        }
    }

    async fn stats(&self) -> Option<PlaybackStats> {
        let (handle, duration) = {
            let current = self.current.lock();
            let track = current.as_ref()?;
            (track.handle.clone(), track.request.song.duration)
        };
        let info = handle.get_info().await.ok()?;
        Some(PlaybackStats {
            position: info.position,
            duration,
        })
    }
}

#[async_trait]
impl VoiceClient for SongbirdBackend {
    async fn connect(&self, guild_id: u64, channel_id: u64) -> Result<(), PlayerError> {
        if guild_id == 0 || channel_id == 0 {
            return Err(PlayerError::ConnectFailed("invalid id".into()));
        }
        let guild = GuildId::new(guild_id);

        let previous = self.guild.write().replace(guild);
        if let Some(previous) = previous.filter(|previous| *previous != guild) {
            // un solo guild a la vez
            if let Err(e) = self.manager.remove(previous).await {
                warn!("Error saliendo del guild {}: {}", previous, e);
            }
        }

        match self.manager.join(guild, ChannelId::new(channel_id)).await {
            Ok(_) => {
                info!("🔊 Llamada activa en guild {}", guild);
                Ok(())
            }
            Err(e) => {
                error!("❌ Error al unirse al canal {}: {}", channel_id, e);
                *self.guild.write() = None;
                let _ = self.manager.remove(guild).await;
                Err(PlayerError::ConnectFailed(e.to_string()))
            }
        }
    }

    async fn is_connected(&self) -> bool {
        self.current_channel().await.is_some()
    }

    async fn current_channel(&self) -> Option<(u64, u64)> {
        let guild = (*self.guild.read())?;
        let call = self.manager.get(guild)?;
        let channel = call.lock().await.current_channel()?;
        Some((guild.get(), channel.0.get()))
    }

    async fn disconnect(&self) -> Result<(), PlayerError> {
        self.current.lock().take();
        let Some(guild) = self.guild.write().take() else {
            return Ok(());
        };

        match self.manager.remove(guild).await {
            Ok(()) | Err(JoinError::NoCall) => {
                info!("👋 Llamada cerrada en guild {}", guild);
                Ok(())
            }
            Err(e) => Err(PlayerError::ConnectFailed(e.to_string())),
        }
    }
}

/// Reports a track's single terminal outcome back to the player actor.
#[derive(Clone)]
struct TrackOutcomeNotifier {
    request: StreamRequest,
    reported: Arc<AtomicBool>,
}

#[async_trait]
impl VoiceEventHandler for TrackOutcomeNotifier {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        let EventContext::Track(tracks) = ctx else {
            return None;
        };
        let (state, _) = tracks.first()?;

        let end = match &state.playing {
            PlayMode::End => StreamEnd::Natural,
            PlayMode::Stop => StreamEnd::ManualStop,
            PlayMode::Errored(e) => StreamEnd::Failed(format!("{:?}", e)),
            other => StreamEnd::Failed(format!("estado inesperado: {:?}", other)),
        };

        // End y Error pueden llegar ambos para el mismo track
        if !self.reported.swap(true, Ordering::SeqCst) {
            debug!("🎵 Track {} terminó: {:?}", self.request.id, end);
            self.request.finish(end);
        }
        Some(Event::Cancel)
    }
}
