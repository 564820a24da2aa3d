use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tokio::{fs, sync::Mutex};
use tracing::{debug, info, warn};

use crate::{error::StoreError, sources::Song};

/// Read-modify-write step for [`SongStore::update_song`].
pub type SongUpdate = Box<dyn FnOnce(Option<Song>) -> Song + Send>;

/// Peticiones acumuladas de un usuario para una canción
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRequest {
    pub user_id: u64,
    pub song_key: String,
    pub count: u64,
}

/// Long-lived owner of canonical song records.
#[async_trait]
pub trait SongStore: Send + Sync {
    async fn get_song(&self, key: &str) -> Result<Option<Song>, StoreError>;

    /// Writes up to [`max_batch_size`](Self::max_batch_size) songs.
    ///
    /// Each record is merged into the stored one with [`merge_stored`], so a
    /// stale buffered copy never rolls counters back.
    async fn set_songs(&self, songs: Vec<Song>) -> Result<(), StoreError>;

    /// Transactional read-modify-write of a single song.
    async fn update_song(&self, key: &str, update: SongUpdate) -> Result<Song, StoreError>;

    async fn list_song_ids(&self) -> Result<Vec<String>, StoreError>;

    /// Adds request counts per user; also bounded by `max_batch_size`.
    ///
    /// All or nothing: on error no count of the batch is applied, so the
    /// caller can retry the whole batch without counting twice.
    async fn add_user_requests(&self, requests: Vec<UserRequest>) -> Result<(), StoreError>;

    fn max_batch_size(&self) -> usize;
}

/// Merges an incoming record into the stored one.
///
/// Metadata: the incoming value wins unless empty. Counters: the larger
/// value wins, so they never decrease.
pub fn merge_stored(new: Song, stored: Option<Song>) -> Song {
    let Some(old) = stored else {
        return new;
    };

    let playbacks = new.playbacks.max(old.playbacks);
    let last_play = new.last_play.max(old.last_play);
    let mut merged = new;
    merged.merge_missing_from(&old);
    merged.playbacks = playbacks;
    merged.last_play = last_play;
    merged
}

/// Almacenamiento de canciones basado en archivos JSON
///
/// Layout: `songs/<key>.json` (one document per song) and
/// `users/user_<id>.json` (song key → request count).
pub struct JsonSongStore {
    data_dir: PathBuf,
    batch_size: usize,
    // serializa las escrituras: cada lectura-modificación-escritura es atómica
    write_lock: Mutex<()>,
}

impl JsonSongStore {
    pub async fn new(data_dir: PathBuf, batch_size: usize) -> Result<Self, StoreError> {
        fs::create_dir_all(data_dir.join("songs")).await?;
        fs::create_dir_all(data_dir.join("users")).await?;

        info!("📁 Storage inicializado en: {}", data_dir.display());

        Ok(Self {
            data_dir,
            batch_size: batch_size.max(1),
            write_lock: Mutex::new(()),
        })
    }

    /// Peticiones registradas de un usuario
    pub async fn user_requests(&self, user_id: u64) -> Result<HashMap<String, u64>, StoreError> {
        Ok(read_json(&self.user_path(user_id)).await?.unwrap_or_default())
    }

    fn song_path(&self, key: &str) -> PathBuf {
        self.data_dir.join("songs").join(format!("{}.json", key))
    }

    fn user_path(&self, user_id: u64) -> PathBuf {
        self.data_dir
            .join("users")
            .join(format!("user_{}.json", user_id))
    }

    fn check_batch(&self, len: usize) -> Result<(), StoreError> {
        if len > self.batch_size {
            return Err(StoreError::Unavailable(format!(
                "batch of {} exceeds the limit of {}",
                len, self.batch_size
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SongStore for JsonSongStore {
    async fn get_song(&self, key: &str) -> Result<Option<Song>, StoreError> {
        read_json(&self.song_path(key)).await
    }

    async fn set_songs(&self, songs: Vec<Song>) -> Result<(), StoreError> {
        self.check_batch(songs.len())?;
        let _guard = self.write_lock.lock().await;

        let count = songs.len();
        for song in songs {
            let path = self.song_path(&song.key());
            let merged = merge_stored(song, read_json(&path).await?);
            write_json(&path, &merged).await?;
        }

        debug!("💾 Lote de {} canciones guardado", count);
        Ok(())
    }

    async fn update_song(&self, key: &str, update: SongUpdate) -> Result<Song, StoreError> {
        let _guard = self.write_lock.lock().await;

        let path = self.song_path(key);
        let song = update(read_json(&path).await?);
        write_json(&path, &song).await?;
        Ok(song)
    }

    async fn list_song_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut files = fs::read_dir(self.data_dir.join("songs")).await?;
        let mut ids = Vec::new();

        while let Some(entry) = files.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(false, |ext| ext == "json") {
                if let Some(stem) = path.file_stem().and_then(|n| n.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }

        Ok(ids)
    }

    async fn add_user_requests(&self, requests: Vec<UserRequest>) -> Result<(), StoreError> {
        self.check_batch(requests.len())?;
        let _guard = self.write_lock.lock().await;

        let mut by_user: HashMap<u64, Vec<UserRequest>> = HashMap::new();
        for request in requests {
            by_user.entry(request.user_id).or_default().push(request);
        }

        // todo el lote se prepara en temporales antes de tocar un solo archivo
        let mut staged = Vec::with_capacity(by_user.len());
        for (user_id, requests) in by_user {
            let path = self.user_path(user_id);
            match stage_user_counts(&path, requests).await {
                Ok(tmp) => staged.push((tmp, path)),
                Err(e) => {
                    discard_staged(&staged).await;
                    return Err(e);
                }
            }
        }

        for (tmp, path) in &staged {
            fs::rename(tmp, path).await?;
        }

        Ok(())
    }

    fn max_batch_size(&self) -> usize {
        self.batch_size
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match fs::read_to_string(path).await {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => {
            warn!("Error leyendo {}: {}", path.display(), e);
            Err(e.into())
        }
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let tmp = stage_json(path, value).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

/// Writes `value` next to `path` and returns the temporary file.
///
/// Renaming it over `path` publishes the document in one step, so a reader
/// never sees half of it.
async fn stage_json<T: Serialize>(path: &Path, value: &T) -> Result<PathBuf, StoreError> {
    let tmp = path.with_extension("json.tmp");
    let content = serde_json::to_string_pretty(value)?;
    fs::write(&tmp, content).await?;
    Ok(tmp)
}

/// Suma `requests` a las cuentas del usuario en un archivo temporal
async fn stage_user_counts(path: &Path, requests: Vec<UserRequest>) -> Result<PathBuf, StoreError> {
    let mut counts: HashMap<String, u64> = read_json(path).await?.unwrap_or_default();
    for request in requests {
        *counts.entry(request.song_key).or_insert(0) += request.count;
    }
    stage_json(path, &counts).await
}

async fn discard_staged(staged: &[(PathBuf, PathBuf)]) {
    for (tmp, _) in staged {
        if let Err(e) = fs::remove_file(tmp).await {
            debug!("No se pudo borrar {}: {}", tmp.display(), e);
        }
    }
}
