//! Seams between the player actor and the voice platform.
//!
//! [`AudioSubsystem`] streams local files into the active voice connection and
//! reports exactly one [`StreamOutcome`] per [`StreamRequest`]. [`VoiceClient`]
//! owns joining and leaving voice channels.

use async_trait::async_trait;
use std::{path::PathBuf, time::Duration};
use tokio::sync::mpsc;

use crate::{error::PlayerError, sources::Song};

/// Why a stream stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    /// El archivo se reprodujo completo
    Natural,
    /// Detenido con [`AudioSubsystem::stop`]
    ManualStop,
    /// Decode or transport failure
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOutcome {
    pub request_id: u64,
    pub end: StreamEnd,
}

/// Sender half the subsystem uses to report a request's terminal outcome.
pub type OutcomeSender = mpsc::UnboundedSender<StreamOutcome>;

#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub id: u64,
    pub song: Song,
    pub path: PathBuf,
    pub done: OutcomeSender,
}

impl StreamRequest {
    /// Reporta el resultado final; si el actor ya no escucha se ignora
    pub fn finish(&self, end: StreamEnd) {
        let _ = self.done.send(StreamOutcome {
            request_id: self.id,
            end,
        });
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    pub position: Duration,
    pub duration: Duration,
}

#[async_trait]
pub trait AudioSubsystem: Send + Sync {
    /// Starts streaming `request`. An `Err` means nothing was started and no
    /// outcome will be reported for it.
    async fn start(&self, request: StreamRequest) -> Result<(), PlayerError>;

    /// Stops the current stream; its outcome is reported as [`StreamEnd::ManualStop`].
    async fn stop(&self);

    async fn is_playing(&self) -> bool;

    async fn stats(&self) -> Option<PlaybackStats>;
}

#[async_trait]
pub trait VoiceClient: Send + Sync {
    async fn connect(&self, guild_id: u64, channel_id: u64) -> Result<(), PlayerError>;

    async fn is_connected(&self) -> bool;

    /// `(guild_id, channel_id)` de la conexión actual
    async fn current_channel(&self) -> Option<(u64, u64)>;

    async fn disconnect(&self) -> Result<(), PlayerError>;
}
