use parking_lot::RwLock;
use std::{fmt, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    audio::{
        backend::{
            AudioSubsystem, OutcomeSender, PlaybackStats, StreamEnd, StreamOutcome, StreamRequest,
            VoiceClient,
        },
        load_master::{LoadMaster, LoadMode},
        queue::{LoopFlag, Queue},
    },
    error::PlayerError,
    sources::Song,
};

#[derive(Debug, Clone)]
pub struct PlayerConfig {
    /// Espera con la cola vacía antes de salir del canal
    pub idle_timeout: Duration,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
        }
    }
}

/// Everything the player reports to subscribers.
///
/// Only [`PlayerEvent::Error`] is a fault; the rest are lifecycle notices
/// that a forwarding layer usually filters with [`PlayerEvent::is_benign`].
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    Finished(Song),
    Stopped(Song),
    QueueEmpty,
    Disconnected,
    Error(PlayerError),
}

impl PlayerEvent {
    pub fn is_benign(&self) -> bool {
        !matches!(self, Self::Error(_))
    }
}

type EventHandler = Arc<dyn Fn(&PlayerEvent) + Send + Sync>;

/// Handlers registered with [`PlayerHandle::subscribe_on_errors`].
#[derive(Clone, Default)]
pub struct Subscribers(Arc<RwLock<Vec<EventHandler>>>);

impl Subscribers {
    fn subscribe(&self, handler: EventHandler) {
        self.0.write().push(handler);
    }

    fn emit(&self, event: PlayerEvent) {
        // se copia la lista para no llamar handlers con el lock tomado
        let handlers = self.0.read().clone();
        for handler in handlers.iter() {
            handler(&event);
        }
    }
}

impl fmt::Debug for Subscribers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Subscribers({})", self.0.read().len())
    }
}

type Reply<T> = oneshot::Sender<Result<T, PlayerError>>;

/// Commands processed one at a time by the player actor.
#[derive(Debug)]
enum PlayerCommand {
    Play(Song, Reply<()>),
    Next,
    Skip(Reply<()>),
    SetLoop(bool, Reply<()>),
    Connect {
        guild_id: u64,
        channel_id: u64,
        reply: Reply<()>,
    },
    Disconnect(Reply<()>),
}

impl PlayerCommand {
    fn reject(self) {
        match self {
            Self::Play(_, reply)
            | Self::Skip(reply)
            | Self::SetLoop(_, reply)
            | Self::Connect { reply, .. }
            | Self::Disconnect(reply) => {
                let _ = reply.send(Err(PlayerError::Shutdown));
            }
            Self::Next => {}
        }
    }
}

/// Debounce before leaving the channel on an empty queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Standby {
    Off,
    /// La cola se encontró vacía una vez; al vencer se vuelve a revisar
    Armed(Instant),
}

impl Standby {
    fn deadline(self) -> Option<Instant> {
        match self {
            Self::Off => None,
            Self::Armed(deadline) => Some(deadline),
        }
    }
}

/// Cloneable front end of the player actor.
///
/// Every mutating call is a command on a capacity-1 channel, so callers are
/// throttled to the actor's pace. Reads (`now_playing`, `is_looping`,
/// `song_status`) bypass the actor.
#[derive(Clone)]
pub struct PlayerHandle {
    tx: mpsc::Sender<PlayerCommand>,
    token: CancellationToken,
    now_playing: Arc<RwLock<Option<Song>>>,
    looping: LoopFlag,
    audio: Arc<dyn AudioSubsystem>,
    subscribers: Subscribers,
}

impl PlayerHandle {
    /// Encola `song` y, si no suena nada, la reproduce de inmediato.
    ///
    /// Fails synchronously only with [`PlayerError::NotConnected`] or
    /// [`PlayerError::Shutdown`]; stream failures arrive through subscribers.
    pub async fn play(&self, song: Song) -> Result<(), PlayerError> {
        self.request(|reply| PlayerCommand::Play(song, reply)).await
    }

    /// Re-checks the queue and advances if nothing is playing.
    pub async fn next(&self) -> Result<(), PlayerError> {
        self.send(PlayerCommand::Next).await
    }

    pub async fn skip(&self) -> Result<(), PlayerError> {
        self.request(PlayerCommand::Skip).await
    }

    /// Returns once the actor has applied the flag, so [`Self::is_looping`]
    /// reads the new value right after.
    pub async fn set_loop(&self, enabled: bool) -> Result<(), PlayerError> {
        self.request(|reply| PlayerCommand::SetLoop(enabled, reply)).await
    }

    pub async fn connect(&self, guild_id: u64, channel_id: u64) -> Result<(), PlayerError> {
        self.request(|reply| PlayerCommand::Connect {
            guild_id,
            channel_id,
            reply,
        })
        .await
    }

    pub async fn disconnect(&self) -> Result<(), PlayerError> {
        self.request(PlayerCommand::Disconnect).await
    }

    pub fn now_playing(&self) -> Option<Song> {
        self.now_playing.read().clone()
    }

    pub async fn song_status(&self) -> Option<PlaybackStats> {
        self.audio.stats().await
    }

    pub fn is_looping(&self) -> bool {
        self.looping.get()
    }

    /// Registers `handler` for every player event, benign ones included.
    ///
    /// Handlers run on the actor task and must not block.
    pub fn subscribe_on_errors(&self, handler: impl Fn(&PlayerEvent) + Send + Sync + 'static) {
        self.subscribers.subscribe(Arc::new(handler));
    }

    /// Publica un evento externo (p. ej. fallos de persistencia) a los suscriptores
    pub fn publish(&self, event: PlayerEvent) {
        self.subscribers.emit(event);
    }

    async fn send(&self, command: PlayerCommand) -> Result<(), PlayerError> {
        if self.token.is_cancelled() {
            return Err(PlayerError::Shutdown);
        }
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(PlayerError::Shutdown),
            res = self.tx.send(command) => res.map_err(|_| PlayerError::Shutdown),
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> PlayerCommand,
    ) -> Result<T, PlayerError> {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx)).await?;
        rx.await.unwrap_or(Err(PlayerError::Shutdown))
    }
}

/// Single consumer of [`PlayerCommand`]s; owns the queue and drives the
/// audio subsystem.
pub struct PlayerActor {
    audio: Arc<dyn AudioSubsystem>,
    voice: Arc<dyn VoiceClient>,
    files: LoadMaster,
    queue: Queue,
    now_playing: Arc<RwLock<Option<Song>>>,
    commands: mpsc::Receiver<PlayerCommand>,
    outcomes: mpsc::UnboundedReceiver<StreamOutcome>,
    outcome_tx: OutcomeSender,
    subscribers: Subscribers,
    token: CancellationToken,
    idle_timeout: Duration,
    last_request: u64,
    active: Option<u64>,
    standby: Standby,
}

impl PlayerActor {
    pub fn spawn(
        config: PlayerConfig,
        audio: Arc<dyn AudioSubsystem>,
        voice: Arc<dyn VoiceClient>,
        files: LoadMaster,
        token: CancellationToken,
    ) -> (PlayerHandle, JoinHandle<()>) {
        let (tx, commands) = mpsc::channel(1);
        let (outcome_tx, outcomes) = mpsc::unbounded_channel();
        let queue = Queue::new();
        let now_playing = Arc::new(RwLock::new(None));
        let subscribers = Subscribers::default();

        let handle = PlayerHandle {
            tx,
            token: token.clone(),
            now_playing: now_playing.clone(),
            looping: queue.loop_flag(),
            audio: audio.clone(),
            subscribers: subscribers.clone(),
        };

        let actor = Self {
            audio,
            voice,
            files,
            queue,
            now_playing,
            commands,
            outcomes,
            outcome_tx,
            subscribers,
            token,
            idle_timeout: config.idle_timeout,
            last_request: 0,
            active: None,
            standby: Standby::Off,
        };

        (handle, tokio::spawn(actor.run()))
    }

    async fn run(mut self) {
        info!("🎛️ Player iniciado");

        loop {
            let deadline = self.standby.deadline();
            tokio::select! {
                _ = self.token.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                Some(outcome) = self.outcomes.recv() => self.on_stream_end(outcome).await,
                _ = standby_elapsed(deadline) => {
                    debug!("⏰ Fin de la espera, revisando la cola");
                    self.recheck().await;
                }
            }
        }

        self.shutdown().await;
    }

    async fn handle(&mut self, command: PlayerCommand) {
        match command {
            PlayerCommand::Play(song, reply) => {
                let result = self.play(song).await;
                let _ = reply.send(result);
            }
            PlayerCommand::Next => self.recheck().await,
            PlayerCommand::Skip(reply) => {
                self.skip().await;
                let _ = reply.send(Ok(()));
            }
            PlayerCommand::SetLoop(enabled, reply) => {
                self.queue.set_loop(enabled);
                let _ = reply.send(Ok(()));
            }
            PlayerCommand::Connect {
                guild_id,
                channel_id,
                reply,
            } => {
                let result = self.connect(guild_id, channel_id).await;
                let _ = reply.send(result);
            }
            PlayerCommand::Disconnect(reply) => {
                let result = self.leave().await;
                let _ = reply.send(result);
            }
        }
    }

    async fn play(&mut self, song: Song) -> Result<(), PlayerError> {
        if !self.voice.is_connected().await {
            warn!("🔇 Sin conexión de voz, descartando: {}", song.title);
            self.release(&song).await;
            self.subscribers
                .emit(PlayerEvent::Error(PlayerError::NotConnected));
            return Err(PlayerError::NotConnected);
        }

        self.queue.add(song);
        if self.is_idle().await {
            self.advance().await;
        } else {
            debug!("📋 En cola, {} pendientes", self.queue.len());
        }
        Ok(())
    }

    async fn skip(&mut self) {
        if self.active.is_some() {
            info!("⏭️ Saltando canción actual");
            // el ManualStop resultante sigue el camino normal de avance
            self.audio.stop().await;
        }
    }

    async fn connect(&mut self, guild_id: u64, channel_id: u64) -> Result<(), PlayerError> {
        if self.voice.is_connected().await
            && self.voice.current_channel().await == Some((guild_id, channel_id))
        {
            debug!("Ya conectado al canal {} en guild {}", channel_id, guild_id);
            return Ok(());
        }

        self.reset().await;
        info!("🔗 Conectando al canal {} en guild {}", channel_id, guild_id);

        if let Err(e) = self.voice.connect(guild_id, channel_id).await {
            let e = match e {
                PlayerError::ConnectFailed(_) => e,
                other => PlayerError::ConnectFailed(other.to_string()),
            };
            error!("❌ Error al unirse al canal: {}", e);
            self.subscribers.emit(PlayerEvent::Error(e.clone()));
            return Err(e);
        }

        info!("✅ Conectado al canal {} en guild {}", channel_id, guild_id);
        Ok(())
    }

    async fn leave(&mut self) -> Result<(), PlayerError> {
        // la tabla queda congelada mientras se pone a cero
        self.files.set_mode(LoadMode::Frozen).await;
        self.reset().await;
        self.files.delete_all().await;
        self.files.set_mode(LoadMode::Active).await;

        let result = if self.voice.is_connected().await {
            self.voice.disconnect().await
        } else {
            Ok(())
        };

        info!("👋 Desconectado del canal de voz");
        self.subscribers.emit(PlayerEvent::Disconnected);
        result
    }

    async fn on_stream_end(&mut self, outcome: StreamOutcome) {
        if self.active != Some(outcome.request_id) {
            debug!("Resultado de stream obsoleto ignorado: {:?}", outcome);
            return;
        }
        self.active = None;

        let finished = self.now_playing.read().clone();
        match (outcome.end, finished) {
            (StreamEnd::Natural, Some(song)) => {
                debug!("🎵 Terminó: {}", song.title);
                self.subscribers.emit(PlayerEvent::Finished(song));
            }
            (StreamEnd::ManualStop, Some(song)) => {
                self.subscribers.emit(PlayerEvent::Stopped(song));
            }
            (StreamEnd::Failed(reason), _) => {
                error!("❌ Error en el stream: {}", reason);
                if self.queue.is_looping() {
                    // repetir un archivo roto sólo volvería a fallar
                    warn!("🔂 Repetición desactivada tras un fallo");
                    self.queue.set_loop(false);
                }
                self.subscribers
                    .emit(PlayerEvent::Error(PlayerError::Stream(reason)));
            }
            _ => {}
        }

        self.advance().await;
    }

    /// Re-evaluates the queue when nothing is playing.
    async fn recheck(&mut self) {
        if self.active.is_some() {
            return;
        }
        if !self.voice.is_connected().await {
            self.standby = Standby::Off;
            return;
        }
        self.advance().await;
    }

    async fn advance(&mut self) {
        let looping = self.queue.is_looping();
        let previous = self.queue.current().cloned();
        let next = self.queue.next();

        if !looping {
            if let Some(previous) = previous {
                self.release(&previous).await;
            }
        }

        match next {
            Some(song) => {
                self.standby = Standby::Off;
                if self.audio.is_playing().await {
                    debug!("Ya hay un stream activo, {} queda en cola", song.title);
                    if !looping {
                        self.queue.unpop();
                    }
                    return;
                }
                self.dispatch(song).await;
            }
            None => {
                *self.now_playing.write() = None;
                self.on_queue_empty().await;
            }
        }
    }

    async fn on_queue_empty(&mut self) {
        match self.standby {
            Standby::Off => {
                info!(
                    "⏳ Cola vacía, esperando {:?} antes de desconectar",
                    self.idle_timeout
                );
                self.standby = Standby::Armed(Instant::now() + self.idle_timeout);
                self.subscribers.emit(PlayerEvent::QueueEmpty);
            }
            Standby::Armed(deadline) if Instant::now() < deadline => {
                // sólo el vencimiento del plazo desconecta
                debug!("Cola vacía, la espera de inactividad sigue en curso");
            }
            Standby::Armed(_) => {
                info!("📭 La cola sigue vacía, saliendo del canal");
                if let Err(e) = self.leave().await {
                    error!("Error al desconectar: {}", e);
                }
            }
        }
    }

    async fn dispatch(&mut self, song: Song) {
        self.last_request += 1;
        let id = self.last_request;
        self.active = Some(id);
        *self.now_playing.write() = Some(song.clone());

        info!("🎵 Reproduciendo: {}", song.title);
        let request = StreamRequest {
            id,
            path: song.stream_url.clone().into(),
            song,
            done: self.outcome_tx.clone(),
        };

        if let Err(e) = self.audio.start(request.clone()).await {
            // mismo camino que un fallo de transporte
            request.finish(StreamEnd::Failed(e.to_string()));
        }
    }

    async fn is_idle(&self) -> bool {
        self.active.is_none() && !self.audio.is_playing().await
    }

    /// Stops audio, empties the queue and releases every held file.
    async fn reset(&mut self) {
        self.standby = Standby::Off;
        if self.active.take().is_some() || self.audio.is_playing().await {
            self.audio.stop().await;
        }
        *self.now_playing.write() = None;
        for song in self.queue.clear() {
            self.release(&song).await;
        }
    }

    async fn release(&self, song: &Song) {
        if let Some(path) = song.local_path() {
            self.files.remove(path).await;
        }
    }

    async fn shutdown(&mut self) {
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            command.reject();
        }

        if !self.queue.is_empty() {
            info!("🧹 Descartando {} canciones en cola", self.queue.len());
        }

        self.reset().await;
        if self.voice.is_connected().await {
            if let Err(e) = self.voice.disconnect().await {
                warn!("Error al desconectar durante el apagado: {}", e);
            }
        }
        info!("🛑 Player detenido");
    }
}

async fn standby_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
