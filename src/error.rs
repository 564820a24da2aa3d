//! # Errors
//!
//! Error taxonomy shared by the player actor, the song cache and the
//! orchestration layer.
//!
//! Only real faults live here. The two benign stream outcomes (natural end
//! and manual stop) are modelled as [`StreamEnd`](crate::audio::backend::StreamEnd)
//! variants and reach subscribers as non-error
//! [`PlayerEvent`](crate::audio::player::PlayerEvent)s.

use thiserror::Error;

/// Errors produced by the player actor and reported to subscribers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlayerError {
    #[error("not connected to a voice channel")]
    NotConnected,
    #[error("failed to join voice channel: {0}")]
    ConnectFailed(String),
    #[error("storage query failed: {0}")]
    StorageQueryFailed(String),
    #[error("stream failed: {0}")]
    Stream(String),
    #[error("player is shutting down")]
    Shutdown,
}

/// Errors from the persistent song store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for PlayerError {
    fn from(e: StoreError) -> Self {
        Self::StorageQueryFailed(e.to_string())
    }
}

/// Errors returned to chat command handlers.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("you need to be in a voice channel")]
    NoVoiceChannel,
    #[error("no results for: {0}")]
    SongNotFound(String),
    #[error("could not prepare song: {0}")]
    Resolve(String),
    #[error("radio has no songs to pick from yet")]
    RadioEmpty,
    #[error(transparent)]
    Player(#[from] PlayerError),
}
