//! Test doubles shared by the actor and cache tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};

use crate::{
    audio::backend::{AudioSubsystem, PlaybackStats, StreamEnd, StreamRequest, VoiceClient},
    error::{PlayerError, StoreError},
    sources::Song,
    storage::{merge_stored, SongStore, SongUpdate, UserRequest},
};

/// Lets spawned actors drain their inboxes.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// Audio subsystem that records requests; tests decide when streams end.
#[derive(Default)]
pub struct FakeAudio {
    requests: Mutex<Vec<StreamRequest>>,
    playing: AtomicBool,
    stops: AtomicUsize,
    fail_next: AtomicBool,
}

impl FakeAudio {
    /// Ids of the songs started so far, in order.
    pub fn started(&self) -> Vec<String> {
        self.requests
            .lock()
            .iter()
            .map(|request| request.song.id.clone())
            .collect()
    }

    /// Ends the latest stream with `end`.
    pub fn finish(&self, end: StreamEnd) {
        self.playing.store(false, Ordering::SeqCst);
        if let Some(request) = self.requests.lock().last() {
            request.finish(end);
        }
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn fail_next_start(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl AudioSubsystem for FakeAudio {
    async fn start(&self, request: StreamRequest) -> Result<(), PlayerError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(PlayerError::Stream("cannot open file".into()));
        }
        self.requests.lock().push(request);
        self.playing.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if self.playing.swap(false, Ordering::SeqCst) {
            if let Some(request) = self.requests.lock().last() {
                request.finish(StreamEnd::ManualStop);
            }
        }
    }

    async fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    async fn stats(&self) -> Option<PlaybackStats> {
        if !self.playing.load(Ordering::SeqCst) {
            return None;
        }
        self.requests.lock().last().map(|request| PlaybackStats {
            position: Duration::ZERO,
            duration: request.song.duration,
        })
    }
}

/// Voice client that tracks a single channel in memory.
#[derive(Default)]
pub struct FakeVoice {
    channel: Mutex<Option<(u64, u64)>>,
    refuse: bool,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
}

impl FakeVoice {
    pub fn connected(guild_id: u64, channel_id: u64) -> Self {
        Self {
            channel: Mutex::new(Some((guild_id, channel_id))),
            ..Self::default()
        }
    }

    /// Every connect attempt fails.
    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::default()
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VoiceClient for FakeVoice {
    async fn connect(&self, guild_id: u64, channel_id: u64) -> Result<(), PlayerError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse {
            return Err(PlayerError::ConnectFailed("missing permissions".into()));
        }
        *self.channel.lock() = Some((guild_id, channel_id));
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.channel.lock().is_some()
    }

    async fn current_channel(&self) -> Option<(u64, u64)> {
        *self.channel.lock()
    }

    async fn disconnect(&self) -> Result<(), PlayerError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        *self.channel.lock() = None;
        Ok(())
    }
}

/// In-memory [`SongStore`] with call accounting and a failure switch.
pub struct MemoryStore {
    batch_size: usize,
    songs: Mutex<HashMap<String, Song>>,
    requests: Mutex<HashMap<(u64, String), u64>>,
    batches: Mutex<Vec<usize>>,
    gets: AtomicUsize,
    list_calls: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            songs: Mutex::new(HashMap::new()),
            requests: Mutex::new(HashMap::new()),
            batches: Mutex::new(Vec::new()),
            gets: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }

    pub fn insert(&self, song: Song) {
        self.songs.lock().insert(song.key(), song);
    }

    pub fn get(&self, key: &str) -> Option<Song> {
        self.songs.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.songs.lock().len()
    }

    /// Sizes of the song batches written so far.
    pub fn batches(&self) -> Vec<usize> {
        self.batches.lock().clone()
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self, user_id: u64, song_key: &str) -> u64 {
        self.requests
            .lock()
            .get(&(user_id, song_key.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self, len: usize) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store offline".into()));
        }
        if len > self.batch_size {
            return Err(StoreError::Unavailable(format!(
                "batch of {} exceeds {}",
                len, self.batch_size
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SongStore for MemoryStore {
    async fn get_song(&self, key: &str) -> Result<Option<Song>, StoreError> {
        self.check(0)?;
        self.gets.fetch_add(1, Ordering::SeqCst);
        Ok(self.get(key))
    }

    async fn set_songs(&self, songs: Vec<Song>) -> Result<(), StoreError> {
        self.check(songs.len())?;
        self.batches.lock().push(songs.len());
        let mut stored = self.songs.lock();
        for song in songs {
            let key = song.key();
            let merged = merge_stored(song, stored.remove(&key));
            stored.insert(key, merged);
        }
        Ok(())
    }

    async fn update_song(&self, key: &str, update: SongUpdate) -> Result<Song, StoreError> {
        self.check(0)?;
        let mut stored = self.songs.lock();
        let song = update(stored.get(key).cloned());
        stored.insert(key.to_string(), song.clone());
        Ok(song)
    }

    async fn list_song_ids(&self) -> Result<Vec<String>, StoreError> {
        self.check(0)?;
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.songs.lock().keys().cloned().collect())
    }

    async fn add_user_requests(&self, requests: Vec<UserRequest>) -> Result<(), StoreError> {
        self.check(requests.len())?;
        let mut stored = self.requests.lock();
        for request in requests {
            *stored
                .entry((request.user_id, request.song_key))
                .or_insert(0) += request.count;
        }
        Ok(())
    }

    fn max_batch_size(&self) -> usize {
        self.batch_size
    }
}
