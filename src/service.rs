//! # Music Service
//!
//! Orchestration between chat commands and the playback core: resolves
//! songs, records playbacks and requests in the [`SongCache`], and drives the
//! [`PlayerHandle`]. Also runs radio mode, which refills the queue with
//! random known songs whenever it drains.

use parking_lot::RwLock;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
};
use tracing::{debug, info, warn};

use crate::{
    audio::{
        backend::PlaybackStats,
        player::{PlayerEvent, PlayerHandle},
    },
    cache::SongCache,
    error::{PlayerError, ServiceError},
    sources::{Song, SongResolver},
};

/// Candidatos por sorteo de radio; uno puede ser la canción recién terminada
const RADIO_CANDIDATES: usize = 3;

/// Point-in-time view for the `status` command.
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub looping: bool,
    pub radio: bool,
    pub now: Option<Song>,
    pub song: Option<PlaybackStats>,
}

/// Cheap to clone; all clones drive the same player.
#[derive(Clone)]
pub struct MusicService {
    inner: Arc<Inner>,
}

struct Inner {
    player: PlayerHandle,
    cache: SongCache,
    resolver: Arc<dyn SongResolver>,
    radio: AtomicBool,
    // clave de la última canción terminada, para no repetirla en radio
    last_finished: RwLock<Option<String>>,
}

impl MusicService {
    pub fn new(player: PlayerHandle, cache: SongCache, resolver: Arc<dyn SongResolver>) -> Self {
        let inner = Arc::new(Inner {
            player,
            cache,
            resolver,
            radio: AtomicBool::new(false),
            last_finished: RwLock::new(None),
        });

        let weak = Arc::downgrade(&inner);
        inner
            .player
            .subscribe_on_errors(move |event| on_player_event(&weak, event));

        Self { inner }
    }

    /// Resolves `query`, joins the caller's channel and queues the song.
    ///
    /// Returns the song and its playback count. A failed playback upsert does
    /// not block playback: the metadata is staged for the next flush and the
    /// fault goes to subscribers.
    pub async fn play(
        &self,
        query: &str,
        user_id: u64,
        guild_id: u64,
        channel_id: u64,
    ) -> Result<(Song, u64), ServiceError> {
        let inner = &self.inner;
        let song = inner.resolver.find_song(query).await.map_err(|e| {
            warn!("🔍 Sin resultados para '{}': {}", query, e);
            ServiceError::SongNotFound(query.to_string())
        })?;

        inner.player.connect(guild_id, channel_id).await?;

        let song = match inner.resolver.ensure_stream_info(song).await {
            Ok(song) => song,
            Err(e) => {
                // arma la espera de inactividad si no hay nada en cola
                if let Err(next_err) = inner.player.next().await {
                    debug!("No se pudo revisar la cola: {}", next_err);
                }
                return Err(ServiceError::Resolve(e.to_string()));
            }
        };

        let playbacks = inner.record_playback(&song).await;
        inner.cache.add_user_request(user_id, &song.key());

        inner.player.play(song.clone()).await?;
        info!("🎵 {} pidió: {} ({} reproducciones)", user_id, song.title, playbacks);
        Ok((song, playbacks))
    }

    pub async fn skip(&self) -> Result<(), ServiceError> {
        Ok(self.inner.player.skip().await?)
    }

    pub async fn set_loop(&self, enabled: bool) -> Result<(), ServiceError> {
        Ok(self.inner.player.set_loop(enabled).await?)
    }

    pub fn loop_status(&self) -> bool {
        self.inner.player.is_looping()
    }

    /// Turns radio mode on or off.
    ///
    /// Enabling joins the given channel and, when nothing is playing, starts
    /// a random song right away. If there is nothing to pick from, radio
    /// stays off.
    pub async fn set_radio(
        &self,
        enabled: bool,
        guild_id: u64,
        channel_id: u64,
    ) -> Result<(), ServiceError> {
        let inner = &self.inner;
        if !enabled {
            inner.radio.store(false, Ordering::SeqCst);
            info!("📻 Radio desactivada");
            return Ok(());
        }

        inner.player.connect(guild_id, channel_id).await?;
        inner.radio.store(true, Ordering::SeqCst);
        info!("📻 Radio activada");

        if inner.player.now_playing().is_none() {
            if let Err(e) = inner.play_radio_song().await {
                inner.radio.store(false, Ordering::SeqCst);
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn radio_status(&self) -> bool {
        self.inner.radio.load(Ordering::SeqCst)
    }

    /// Sale del canal de voz; la radio se apaga con el evento de desconexión
    pub async fn leave(&self) -> Result<(), ServiceError> {
        Ok(self.inner.player.disconnect().await?)
    }

    pub fn now_playing(&self) -> Option<Song> {
        self.inner.player.now_playing()
    }

    pub async fn song_status(&self) -> Option<PlaybackStats> {
        self.inner.player.song_status().await
    }

    pub async fn status(&self) -> Status {
        Status {
            looping: self.loop_status(),
            radio: self.radio_status(),
            now: self.now_playing(),
            song: self.song_status().await,
        }
    }

    /// Registers `handler` for player faults only; lifecycle notices such as
    /// natural ends and skips are filtered out.
    pub fn subscribe_on_errors(&self, handler: impl Fn(&PlayerError) + Send + Sync + 'static) {
        self.inner.player.subscribe_on_errors(move |event| {
            if let PlayerEvent::Error(e) = event {
                handler(e);
            }
        });
    }
}

impl Inner {
    async fn record_playback(&self, song: &Song) -> u64 {
        match self.cache.upsert_song_inc_playbacks(song.clone()).await {
            Ok(stored) => stored.playbacks,
            Err(e) => {
                warn!("💾 No se pudo registrar la reproducción de {}: {}", song.title, e);
                self.cache.set_song(song.clone());
                self.player.publish(PlayerEvent::Error(e.into()));
                song.playbacks
            }
        }
    }

    async fn pick_radio_song(&self) -> Result<Song, ServiceError> {
        let avoid = self.last_finished.read().clone();

        let mut candidates = self
            .cache
            .random_songs(RADIO_CANDIDATES)
            .await
            .map_err(PlayerError::from)?;
        if candidates.is_empty() {
            return Err(ServiceError::RadioEmpty);
        }
        // con una sola canción conocida se repite igual
        let position = candidates
            .iter()
            .position(|song| Some(song.key()) != avoid)
            .unwrap_or(0);
        Ok(candidates.swap_remove(position))
    }

    async fn play_radio_song(&self) -> Result<Song, ServiceError> {
        let song = self.pick_radio_song().await?;
        let song = self
            .resolver
            .ensure_stream_info(song)
            .await
            .map_err(|e| ServiceError::Resolve(e.to_string()))?;

        self.record_playback(&song).await;
        self.player.play(song.clone()).await?;
        info!("📻 Radio: {}", song.title);
        Ok(song)
    }
}

fn on_player_event(inner: &Weak<Inner>, event: &PlayerEvent) {
    let Some(inner) = inner.upgrade() else {
        return;
    };

    match event {
        PlayerEvent::Finished(song) | PlayerEvent::Stopped(song) => {
            *inner.last_finished.write() = Some(song.key());
        }
        PlayerEvent::QueueEmpty if inner.radio.load(Ordering::SeqCst) => {
            debug!("📻 Cola vacía con radio activa, buscando canción");
            // los handlers corren en el actor: el trabajo va a otra tarea
            tokio::spawn(async move {
                if let Err(e) = inner.play_radio_song().await {
                    warn!("📻 La radio no pudo continuar: {}", e);
                }
            });
        }
        PlayerEvent::Disconnected => {
            if inner.radio.swap(false, Ordering::SeqCst) {
                info!("📻 Radio desactivada por desconexión");
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::{
            backend::StreamEnd,
            load_master::{LoadMaster, LoadMasterConfig},
            player::{PlayerActor, PlayerConfig},
        },
        cache::CacheConfig,
        sources::MockSongResolver,
        test_utils::{settle, FakeAudio, FakeVoice, MemoryStore},
    };
    use pretty_assertions::assert_eq;
    use tokio_util::sync::CancellationToken;

    struct Harness {
        service: MusicService,
        audio: Arc<FakeAudio>,
        voice: Arc<FakeVoice>,
        store: Arc<MemoryStore>,
        errors: Arc<parking_lot::Mutex<Vec<PlayerError>>>,
        _token: CancellationToken,
    }

    fn song(id: &str) -> Song {
        let mut song = Song::new("youtube", id, format!("Song {id}"));
        song.stream_url = format!("https://www.youtube.com/watch?v={id}");
        song
    }

    /// Resolver that finds `song(query)` and "downloads" to a fixed path.
    fn resolver() -> MockSongResolver {
        let mut resolver = MockSongResolver::new();
        resolver
            .expect_find_song()
            .returning(|query: &str| Ok(song(query)));
        resolver.expect_ensure_stream_info().returning(|mut song: Song| {
            song.stream_url = format!("/tmp/radio-bot-test/{}.m4a", song.id);
            Ok(song)
        });
        resolver
    }

    impl Harness {
        fn new(resolver: MockSongResolver, voice: FakeVoice) -> Self {
            let token = CancellationToken::new();
            let (files, _) = LoadMaster::spawn(LoadMasterConfig::default(), token.clone());
            let audio = Arc::new(FakeAudio::default());
            let voice = Arc::new(voice);
            let (player, _) = PlayerActor::spawn(
                PlayerConfig::default(),
                audio.clone(),
                voice.clone(),
                files,
                token.clone(),
            );
            let store = Arc::new(MemoryStore::new(50));
            let cache = SongCache::new(store.clone(), CacheConfig::default());
            let service = MusicService::new(player, cache, Arc::new(resolver));

            let errors = Arc::new(parking_lot::Mutex::new(Vec::new()));
            let sink = errors.clone();
            service.subscribe_on_errors(move |e| sink.lock().push(e.clone()));

            Self {
                service,
                audio,
                voice,
                store,
                errors,
                _token: token,
            }
        }

        fn errors(&self) -> Vec<PlayerError> {
            self.errors.lock().clone()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn play_joins_counts_and_starts_the_song() {
        let h = Harness::new(resolver(), FakeVoice::default());

        let (first, playbacks) = h.service.play("a", 7, 1, 10).await.unwrap();

        assert_eq!(playbacks, 1);
        assert_eq!(first.stream_url, "/tmp/radio-bot-test/a.m4a");
        assert_eq!(h.voice.connects(), 1);
        assert_eq!(h.audio.started(), vec!["a"]);
        assert_eq!(h.service.now_playing().map(|s| s.id), Some("a".into()));

        let (_, playbacks) = h.service.play("a", 7, 1, 10).await.unwrap();
        assert_eq!(playbacks, 2);
        assert_eq!(h.voice.connects(), 1);
        assert_eq!(h.store.get("youtube_a").unwrap().playbacks, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_songs_fail_before_joining() {
        let mut resolver = MockSongResolver::new();
        resolver
            .expect_find_song()
            .returning(|_| Err(anyhow::anyhow!("no results")));
        let h = Harness::new(resolver, FakeVoice::default());

        let result = h.service.play("nothing", 1, 1, 10).await;

        assert!(matches!(result, Err(ServiceError::SongNotFound(q)) if q == "nothing"));
        assert_eq!(h.voice.connects(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn download_failures_are_reported_as_resolve_errors() {
        let mut resolver = MockSongResolver::new();
        resolver
            .expect_find_song()
            .returning(|query: &str| Ok(song(query)));
        resolver
            .expect_ensure_stream_info()
            .returning(|_| Err(anyhow::anyhow!("HTTP 403")));
        let h = Harness::new(resolver, FakeVoice::default());

        let result = h.service.play("a", 1, 1, 10).await;

        assert!(matches!(result, Err(ServiceError::Resolve(_))));
        assert!(h.audio.started().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_download_keeps_the_idle_window() {
        let mut resolver = MockSongResolver::new();
        resolver
            .expect_find_song()
            .returning(|query: &str| Ok(song(query)));
        resolver
            .expect_ensure_stream_info()
            .returning(|mut song: Song| {
                if song.id == "b" {
                    return Err(anyhow::anyhow!("HTTP 403"));
                }
                song.stream_url = format!("/tmp/radio-bot-test/{}.m4a", song.id);
                Ok(song)
            });
        let h = Harness::new(resolver, FakeVoice::default());
        h.service.play("a", 1, 1, 10).await.unwrap();
        h.audio.finish(StreamEnd::Natural);
        settle().await;

        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        let result = h.service.play("b", 1, 1, 10).await;
        settle().await;

        assert!(matches!(result, Err(ServiceError::Resolve(_))));
        assert_eq!(h.voice.disconnects(), 0);

        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        assert_eq!(h.voice.disconnects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_failures_reach_the_caller() {
        let h = Harness::new(resolver(), FakeVoice::refusing());

        let result = h.service.play("a", 1, 1, 10).await;

        assert!(matches!(
            result,
            Err(ServiceError::Player(PlayerError::ConnectFailed(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn storage_failures_do_not_block_playback() {
        let h = Harness::new(resolver(), FakeVoice::default());
        h.store.set_failing(true);

        let (song, playbacks) = h.service.play("a", 1, 1, 10).await.unwrap();

        assert_eq!(playbacks, 0);
        assert_eq!(song.id, "a");
        assert_eq!(h.audio.started(), vec!["a"]);
        assert!(matches!(
            h.errors().as_slice(),
            [PlayerError::StorageQueryFailed(_)]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn benign_events_are_not_forwarded_as_errors() {
        let h = Harness::new(resolver(), FakeVoice::default());
        h.service.play("a", 1, 1, 10).await.unwrap();
        h.service.play("b", 1, 1, 10).await.unwrap();

        h.service.skip().await.unwrap();
        settle().await;
        h.audio.finish(StreamEnd::Natural);
        settle().await;

        assert!(h.errors().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn radio_refills_with_a_different_song() {
        let h = Harness::new(resolver(), FakeVoice::default());
        h.store.insert(song("a"));
        h.store.insert(song("b"));

        h.service.set_radio(true, 1, 10).await.unwrap();
        let first = h.audio.started();
        assert_eq!(first.len(), 1);

        h.audio.finish(StreamEnd::Natural);
        settle().await;
        settle().await;

        let started = h.audio.started();
        assert_eq!(started.len(), 2);
        assert_ne!(started[1], started[0]);
        assert!(h.service.radio_status());
    }

    #[tokio::test(start_paused = true)]
    async fn radio_without_songs_stays_off() {
        let h = Harness::new(resolver(), FakeVoice::default());

        let result = h.service.set_radio(true, 1, 10).await;

        assert!(matches!(result, Err(ServiceError::RadioEmpty)));
        assert!(!h.service.radio_status());
    }

    #[tokio::test(start_paused = true)]
    async fn leaving_turns_radio_off() {
        let h = Harness::new(resolver(), FakeVoice::default());
        h.store.insert(song("a"));
        h.service.set_radio(true, 1, 10).await.unwrap();

        h.service.leave().await.unwrap();

        assert!(!h.service.radio_status());
        assert_eq!(h.voice.disconnects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn status_reports_every_field() {
        let h = Harness::new(resolver(), FakeVoice::default());
        h.service.play("a", 1, 1, 10).await.unwrap();
        h.service.set_loop(true).await.unwrap();

        let status = h.service.status().await;

        assert!(status.looping);
        assert!(!status.radio);
        assert_eq!(status.now.map(|s| s.id), Some("a".into()));
        assert!(status.song.is_some());
    }
}
