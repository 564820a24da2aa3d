//! Reference counting for downloaded audio files.
//!
//! Every queued or replaying song holds one reference on its file. Files are
//! only removed from disk by the periodic soft clear, and only once their
//! count has dropped to zero. All table mutations go through a single task.

use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct LoadMasterConfig {
    pub sweep_interval: Duration,
}

impl Default for LoadMasterConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(600),
        }
    }
}

/// Whether `Add`/`Remove` are applied.
///
/// While `Frozen`, modifications are dropped, not deferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    Active,
    Frozen,
}

#[derive(Debug)]
enum LoadCommand {
    Add(PathBuf),
    Remove(PathBuf),
    DeleteAll,
    SetMode(LoadMode),
    Sweep(oneshot::Sender<Vec<PathBuf>>),
    Count(PathBuf, oneshot::Sender<Option<u32>>),
}

/// Handle to the file refcount actor.
#[derive(Debug, Clone)]
pub struct LoadMaster {
    tx: mpsc::Sender<LoadCommand>,
    token: CancellationToken,
}

impl LoadMaster {
    /// Arranca el actor; termina cuando `token` se cancela
    pub fn spawn(config: LoadMasterConfig, token: CancellationToken) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(1);
        let actor = LoadActor {
            refs: HashMap::new(),
            mode: LoadMode::Active,
            rx,
            token: token.clone(),
            sweep_interval: config.sweep_interval,
        };
        let handle = tokio::spawn(actor.run());
        (Self { tx, token }, handle)
    }

    pub async fn add(&self, path: impl Into<PathBuf>) {
        self.send(LoadCommand::Add(path.into())).await;
    }

    pub async fn remove(&self, path: impl Into<PathBuf>) {
        self.send(LoadCommand::Remove(path.into())).await;
    }

    /// Pone a cero todas las referencias; la próxima limpieza borra todo
    pub async fn delete_all(&self) {
        self.send(LoadCommand::DeleteAll).await;
    }

    pub async fn set_mode(&self, mode: LoadMode) {
        self.send(LoadCommand::SetMode(mode)).await;
    }

    /// Runs a soft clear now and returns the paths that were released.
    pub async fn sweep(&self) -> Vec<PathBuf> {
        let (tx, rx) = oneshot::channel();
        self.send(LoadCommand::Sweep(tx)).await;
        rx.await.unwrap_or_default()
    }

    /// Current refcount for `path`, `None` if untracked.
    pub async fn count(&self, path: impl Into<PathBuf>) -> Option<u32> {
        let (tx, rx) = oneshot::channel();
        self.send(LoadCommand::Count(path.into(), tx)).await;
        rx.await.ok().flatten()
    }

    async fn send(&self, command: LoadCommand) {
        if self.token.is_cancelled() {
            debug!("LoadMaster detenido, comando descartado: {:?}", command);
            return;
        }
        tokio::select! {
            biased;
            _ = self.token.cancelled() => debug!("LoadMaster detenido durante el envío"),
            res = self.tx.send(command) => {
                if let Err(e) = res {
                    debug!("LoadMaster cerrado, comando descartado: {:?}", e.0);
                }
            }
        }
    }
}

struct LoadActor {
    refs: HashMap<PathBuf, u32>,
    mode: LoadMode,
    rx: mpsc::Receiver<LoadCommand>,
    token: CancellationToken,
    sweep_interval: Duration,
}

impl LoadActor {
    async fn run(mut self) {
        let mut ticker = interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // el primer tick de `interval` es inmediato
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = ticker.tick() => {
                    self.soft_clear().await;
                }
                command = self.rx.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
            }
        }

        // al apagar ninguna referencia pendiente es confiable
        self.rx.close();
        self.zero_all();
        let released = self.soft_clear().await;
        info!("🧹 LoadMaster detenido, {} archivos liberados", released.len());
    }

    async fn handle(&mut self, command: LoadCommand) {
        match command {
            LoadCommand::Add(path) => self.modify(path, 1),
            LoadCommand::Remove(path) => self.modify(path, -1),
            LoadCommand::DeleteAll => self.zero_all(),
            LoadCommand::SetMode(mode) => {
                if self.mode != mode {
                    info!("🔒 LoadMaster en modo {:?}", mode);
                }
                self.mode = mode;
            }
            LoadCommand::Sweep(reply) => {
                let released = self.soft_clear().await;
                let _ = reply.send(released);
            }
            LoadCommand::Count(path, reply) => {
                let _ = reply.send(self.refs.get(&path).copied());
            }
        }
    }

    fn modify(&mut self, path: PathBuf, delta: i8) {
        if self.mode == LoadMode::Frozen {
            debug!("LoadMaster congelado, ignorando cambio en {}", path.display());
            return;
        }
        // una clave ausente se crea en cero en lugar de quedar negativa
        let count = self.refs.entry(path).or_insert(0);
        *count = if delta > 0 {
            count.saturating_add(1)
        } else {
            count.saturating_sub(1)
        };
    }

    fn zero_all(&mut self) {
        for count in self.refs.values_mut() {
            *count = 0;
        }
    }

    async fn soft_clear(&mut self) -> Vec<PathBuf> {
        let unused: Vec<PathBuf> = self
            .refs
            .iter()
            .filter(|(_, &count)| count == 0)
            .map(|(path, _)| path.clone())
            .collect();

        let mut released = Vec::with_capacity(unused.len());
        for path in unused {
            match delete_file(&path).await {
                Ok(()) => {
                    self.refs.remove(&path);
                    released.push(path);
                }
                Err(e) => {
                    // se reintenta en la próxima limpieza
                    warn!("No se pudo borrar {}: {}", path.display(), e);
                }
            }
        }

        if !released.is_empty() {
            debug!("🗑️ Limpieza de archivos: {} borrados", released.len());
        }
        released
    }
}

async fn delete_file(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
