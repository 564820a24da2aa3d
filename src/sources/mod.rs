pub mod ytdlp;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

pub use ytdlp::YtDlpResolver;

/// Resolución de canciones: búsqueda y preparación del archivo reproducible
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SongResolver: Send + Sync {
    /// Busca una canción por URL o texto libre
    async fn find_song(&self, query: &str) -> Result<Song>;

    /// Asegura que `stream_url` apunte a un archivo reproducible.
    ///
    /// Registers one reference on the file with the
    /// [`LoadMaster`](crate::audio::load_master::LoadMaster); the player
    /// releases it once the song leaves the queue.
    async fn ensure_stream_info(&self, song: Song) -> Result<Song>;
}

/// Song metadata as stored, cached and queued.
///
/// Identity is `service` + `id`. `playbacks` and `last_play` are counters
/// owned by the store; see [`Song::merge_missing_from`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Song {
    pub service: String,
    pub id: String,
    pub title: String,
    pub artist: String,
    pub artwork_url: String,
    pub thumbnail_url: String,
    /// Página de origen; de aquí se vuelve a descargar el audio
    pub page_url: String,
    /// Ruta local (o URL) reproducible
    pub stream_url: String,
    pub playbacks: u64,
    pub last_play: Option<DateTime<Utc>>,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
}

impl Song {
    pub fn new(service: impl Into<String>, id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            id: id.into(),
            title: title.into(),
            ..Default::default()
        }
    }

    /// Clave estable usada por la caché, el almacenamiento y el índice
    pub fn key(&self) -> String {
        song_key(&self.service, &self.id)
    }

    /// Archivo local detrás de `stream_url`, si no es una URL remota
    pub fn local_path(&self) -> Option<PathBuf> {
        if self.stream_url.is_empty() || self.stream_url.contains("://") {
            None
        } else {
            Some(PathBuf::from(&self.stream_url))
        }
    }

    /// Copies every empty/zero field of `self` from `old`.
    ///
    /// Fields already set on `self` are never overwritten, so merging a sparse
    /// record into a complete one cannot lose metadata.
    pub fn merge_missing_from(&mut self, old: &Song) {
        fn fill(field: &mut String, old: &str) {
            if field.is_empty() {
                field.push_str(old);
            }
        }

        fill(&mut self.service, &old.service);
        fill(&mut self.id, &old.id);
        fill(&mut self.title, &old.title);
        fill(&mut self.artist, &old.artist);
        fill(&mut self.artwork_url, &old.artwork_url);
        fill(&mut self.thumbnail_url, &old.thumbnail_url);
        fill(&mut self.page_url, &old.page_url);
        fill(&mut self.stream_url, &old.stream_url);
        if self.playbacks == 0 {
            self.playbacks = old.playbacks;
        }
        if self.last_play.is_none() {
            self.last_play = old.last_play;
        }
        if self.duration.is_zero() {
            self.duration = old.duration;
        }
    }
}

pub fn song_key(service: &str, id: &str) -> String {
    // los separadores de ruta no pueden llegar al nombre de archivo
    format!("{}_{}", service, id).replace(['/', '\\'], "_")
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
