use parking_lot::RwLock;
use std::{collections::VecDeque, sync::Arc};
use tracing::{debug, info};

use crate::sources::Song;

/// Shared view of the queue's loop flag.
///
/// Lives behind its own lock so status reads never wait on queue mutation.
#[derive(Debug, Clone, Default)]
pub struct LoopFlag(Arc<RwLock<bool>>);

impl LoopFlag {
    pub fn get(&self) -> bool {
        *self.0.read()
    }

    fn set(&self, enabled: bool) {
        *self.0.write() = enabled;
    }
}

/// Cola de reproducción FIFO con repetición de la canción actual.
///
/// Owned by the player actor; only the loop flag is shared.
#[derive(Debug, Default)]
pub struct Queue {
    items: VecDeque<Song>,
    current: Option<Song>,
    looping: LoopFlag,
}

impl Queue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Agrega una canción al final
    pub fn add(&mut self, song: Song) {
        info!("➕ Agregado a la cola: {}", song.title);
        self.items.push_back(song);
    }

    /// Undoes the last non-loop `next()`: the current song goes back to the head.
    pub fn unpop(&mut self) {
        if let Some(song) = self.current.take() {
            self.items.push_front(song);
        }
    }

    /// Next song to play. Never blocks.
    ///
    /// With loop enabled the current song is returned again and the backing
    /// sequence is untouched. Otherwise the head is popped and remembered as
    /// current so enabling loop later still replays it.
    pub fn next(&mut self) -> Option<Song> {
        if self.looping.get() {
            if let Some(current) = &self.current {
                debug!("🔂 Repitiendo: {}", current.title);
                return Some(current.clone());
            }
        }

        self.current = self.items.pop_front();
        if let Some(song) = &self.current {
            info!("➡️ Siguiente en cola: {}", song.title);
        }
        self.current.clone()
    }

    /// Vacía la cola; la repetición no sobrevive a un reinicio
    pub fn clear(&mut self) -> Vec<Song> {
        self.looping.set(false);
        let mut dropped: Vec<Song> = self.current.take().into_iter().collect();
        dropped.extend(self.items.drain(..));
        info!("🗑️ Cola limpiada");
        dropped
    }

    pub fn set_loop(&self, enabled: bool) {
        self.looping.set(enabled);
        if enabled {
            info!("🔂 Repetir canción activado");
        } else {
            info!("➡️ Repetición desactivada");
        }
    }

    pub fn is_looping(&self) -> bool {
        self.looping.get()
    }

    pub fn loop_flag(&self) -> LoopFlag {
        self.looping.clone()
    }

    pub fn current(&self) -> Option<&Song> {
        self.current.as_ref()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
