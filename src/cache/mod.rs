//! # Cache Module
//!
//! Write-behind cache in front of the [`SongStore`].
//!
//! - **Song buffer**: [`SongCache::set_song`] stages a record in memory; a
//!   ticker drains the whole buffer into batched store writes.
//! - **Request buffer**: per-user request counts, flushed on a slower ticker.
//! - **Read cache**: [`SongCache::get_song`] serves from memory and falls back
//!   to the store; idle entries expire after a TTL.
//! - **Short index**: every known song key, refreshed wholesale when writes
//!   have happened since the last refresh; backs [`SongCache::random_songs`].
//!
//! Drains take the buffer under its lock and leave a fresh one behind, so
//! writes that arrive during a flush land in the next one.

pub mod read_cache;
pub mod short_index;

use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    error::StoreError,
    sources::Song,
    storage::{merge_stored, SongStore, UserRequest},
};
use read_cache::ReadCache;
use short_index::{ShortIndex, DEFAULT_DRAW_FACTOR};

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub song_flush_interval: Duration,
    pub request_flush_interval: Duration,
    pub index_refresh_interval: Duration,
    pub ttl: Duration,
    pub sweep_interval: Duration,
    /// Sorteos por canción pedida en [`SongCache::random_songs`]
    pub draw_factor: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            song_flush_interval: Duration::from_secs(30),
            request_flush_interval: Duration::from_secs(60),
            index_refresh_interval: Duration::from_secs(6 * 60 * 60),
            ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(300),
            draw_factor: DEFAULT_DRAW_FACTOR,
        }
    }
}

/// Cheap to clone; all clones share the same buffers.
#[derive(Clone)]
pub struct SongCache {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn SongStore>,
    songs: ReadCache<String, Song>,
    pending_songs: Mutex<HashMap<String, Song>>,
    pending_requests: Mutex<HashMap<u64, HashMap<String, u64>>>,
    index: ShortIndex,
    index_dirty: AtomicBool,
    config: CacheConfig,
}

impl SongCache {
    pub fn new(store: Arc<dyn SongStore>, config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                songs: ReadCache::new(config.ttl),
                pending_songs: Mutex::new(HashMap::new()),
                pending_requests: Mutex::new(HashMap::new()),
                index: ShortIndex::new(),
                // el primer refresco siempre carga el índice
                index_dirty: AtomicBool::new(true),
                config,
            }),
        }
    }

    /// Arranca los tickers de escritura, índice y expiración.
    ///
    /// On cancellation both write buffers are flushed one last time.
    pub fn spawn_workers(&self, token: CancellationToken) -> Vec<JoinHandle<()>> {
        let config = &self.inner.config;
        vec![
            self.spawn_ticker("songs", config.song_flush_interval, token.clone(), true, |cache| {
                async move {
                    let _ = cache.flush_songs().await;
                }
            }),
            self.spawn_ticker("requests", config.request_flush_interval, token.clone(), true, |cache| {
                async move {
                    let _ = cache.flush_requests().await;
                }
            }),
            self.spawn_ticker("index", config.index_refresh_interval, token.clone(), false, |cache| {
                async move {
                    let _ = cache.refresh_index().await;
                }
            }),
            self.spawn_ticker("sweep", config.sweep_interval, token, false, |cache| async move {
                cache.sweep_expired();
            }),
        ]
    }

    fn spawn_ticker<F, Fut>(
        &self,
        name: &'static str,
        period: Duration,
        token: CancellationToken,
        run_on_shutdown: bool,
        mut task: F,
    ) -> JoinHandle<()>
    where
        F: FnMut(SongCache) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        if run_on_shutdown {
                            task(cache.clone()).await;
                        }
                        break;
                    }
                    _ = ticker.tick() => task(cache.clone()).await,
                }
            }
            debug!("Tarea de caché '{}' detenida", name);
        })
    }

    /// Stages `song` for the next batch write. Never touches the store.
    pub fn set_song(&self, song: Song) {
        let key = song.key();
        let mut staged = merge_stored(song, self.inner.songs.get(&key));

        {
            let mut pending = self.inner.pending_songs.lock();
            if let Some(older) = pending.remove(&key) {
                staged = merge_stored(staged, Some(older));
            }
            pending.insert(key.clone(), staged.clone());
        }

        self.inner.songs.insert(key, staged);
    }

    /// Memoria primero; si falla, el almacenamiento
    pub async fn get_song(&self, key: &str) -> Result<Option<Song>, StoreError> {
        if let Some(song) = self.inner.songs.get(key) {
            return Ok(Some(song));
        }

        let staged = self.inner.pending_songs.lock().get(key).cloned();
        let song = match staged {
            Some(song) => Some(song),
            None => self.inner.store.get_song(key).await?,
        };

        if let Some(song) = &song {
            self.inner.songs.insert(key.to_string(), song.clone());
        }
        Ok(song)
    }

    /// Merges `song` into the stored record and bumps `playbacks`.
    ///
    /// Runs as one transactional read-modify-write on the store, so
    /// concurrent upserts of the same song each count. Fields left empty in
    /// `song` keep their stored values.
    pub async fn upsert_song_inc_playbacks(&self, song: Song) -> Result<Song, StoreError> {
        let key = song.key();
        let mut incoming = song;
        if let Some(staged) = self.inner.pending_songs.lock().get(&key) {
            incoming.merge_missing_from(staged);
        }

        let now = Utc::now();
        let updated = self
            .inner
            .store
            .update_song(
                &key,
                Box::new(move |stored| {
                    let mut merged = incoming;
                    let base = match &stored {
                        Some(stored) => stored.playbacks.max(merged.playbacks),
                        None => merged.playbacks,
                    };
                    if let Some(stored) = &stored {
                        merged.merge_missing_from(stored);
                    }
                    merged.playbacks = base + 1;
                    merged.last_play = Some(now);
                    merged
                }),
            )
            .await?;

        self.inner.songs.insert(key, updated.clone());
        self.mark_dirty();
        Ok(updated)
    }

    pub fn add_user_request(&self, user_id: u64, song_key: &str) {
        let mut pending = self.inner.pending_requests.lock();
        *pending
            .entry(user_id)
            .or_default()
            .entry(song_key.to_string())
            .or_insert(0) += 1;
    }

    /// Drains the song buffer into batches of at most `max_batch_size`.
    ///
    /// On failure the unwritten records go back into the buffer, behind any
    /// newer staged versions.
    pub async fn flush_songs(&self) -> Result<usize, StoreError> {
        let drained: Vec<Song> = self
            .inner
            .pending_songs
            .lock()
            .drain()
            .map(|(_, song)| song)
            .collect();
        if drained.is_empty() {
            return Ok(0);
        }

        let batch_size = self.inner.store.max_batch_size().max(1);
        let mut remaining = drained.into_iter();
        let mut written = 0;

        loop {
            let chunk: Vec<Song> = remaining.by_ref().take(batch_size).collect();
            if chunk.is_empty() {
                break;
            }
            let len = chunk.len();
            if let Err(e) = self.inner.store.set_songs(chunk.clone()).await {
                error!("❌ Error guardando canciones: {}", e);
                self.restage_songs(chunk.into_iter().chain(remaining));
                if written > 0 {
                    self.mark_dirty();
                }
                return Err(e);
            }
            written += len;
        }

        self.mark_dirty();
        info!("💾 {} canciones guardadas", written);
        Ok(written)
    }

    /// Same drain-and-batch cycle for per-user request counts.
    pub async fn flush_requests(&self) -> Result<usize, StoreError> {
        let drained: Vec<UserRequest> = self
            .inner
            .pending_requests
            .lock()
            .drain()
            .flat_map(|(user_id, songs)| {
                songs.into_iter().map(move |(song_key, count)| UserRequest {
                    user_id,
                    song_key,
                    count,
                })
            })
            .collect();
        if drained.is_empty() {
            return Ok(0);
        }

        let batch_size = self.inner.store.max_batch_size().max(1);
        let mut remaining = drained.into_iter();
        let mut written = 0;

        loop {
            let chunk: Vec<UserRequest> = remaining.by_ref().take(batch_size).collect();
            if chunk.is_empty() {
                break;
            }
            let len = chunk.len();
            if let Err(e) = self.inner.store.add_user_requests(chunk.clone()).await {
                error!("❌ Error guardando peticiones de usuarios: {}", e);
                let mut pending = self.inner.pending_requests.lock();
                for request in chunk.into_iter().chain(remaining) {
                    *pending
                        .entry(request.user_id)
                        .or_default()
                        .entry(request.song_key)
                        .or_insert(0) += request.count;
                }
                return Err(e);
            }
            written += len;
        }

        debug!("💾 {} peticiones de usuarios guardadas", written);
        Ok(written)
    }

    /// Re-lists every key from the store, only if writes happened since the
    /// last refresh. Returns whether a refresh ran.
    pub async fn refresh_index(&self) -> Result<bool, StoreError> {
        if !self.inner.index_dirty.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }

        match self.inner.store.list_song_ids().await {
            Ok(ids) => {
                info!("🗂️ Índice actualizado: {} canciones", ids.len());
                self.inner.index.replace(ids);
                Ok(true)
            }
            Err(e) => {
                // el próximo tick lo reintenta
                self.mark_dirty();
                warn!("Error actualizando el índice: {}", e);
                Err(e)
            }
        }
    }

    /// Up to `n` distinct random songs; see [`ShortIndex::sample`] for why
    /// the result may be shorter.
    ///
    /// An index that was never loaded is refreshed first.
    pub async fn random_songs(&self, n: usize) -> Result<Vec<Song>, StoreError> {
        if self.inner.index.is_empty() {
            self.refresh_index().await?;
        }

        let keys = {
            let mut rng = rand::thread_rng();
            self.inner
                .index
                .sample(n, self.inner.config.draw_factor, &mut rng)
        };

        let mut songs = Vec::with_capacity(keys.len());
        for result in join_all(keys.iter().map(|key| self.get_song(key))).await {
            match result? {
                Some(song) => songs.push(song),
                None => debug!("Clave del índice sin canción, se omite"),
            }
        }
        Ok(songs)
    }

    pub fn sweep_expired(&self) -> usize {
        self.inner.songs.cleanup_expired()
    }

    pub fn index_len(&self) -> usize {
        self.inner.index.len()
    }

    pub fn pending_songs(&self) -> usize {
        self.inner.pending_songs.lock().len()
    }

    fn mark_dirty(&self) {
        self.inner.index_dirty.store(true, Ordering::SeqCst);
    }

    fn restage_songs(&self, songs: impl Iterator<Item = Song>) {
        let mut pending = self.inner.pending_songs.lock();
        for song in songs {
            let key = song.key();
            let restaged = match pending.remove(&key) {
                Some(newer) => merge_stored(newer, Some(song)),
                None => song,
            };
            pending.insert(key, restaged);
        }
    }
}
