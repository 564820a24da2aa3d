//! # Audio Module
//!
//! Playback core for a single guild.
//!
//! ## Architecture
//!
//! ### [`player`] - Player actor
//! - Owns the [`queue::Queue`] and processes one command at a time
//! - Decides between replay, next song, idle wait and disconnect
//! - Republishes stream outcomes and faults to subscribers
//!
//! ### [`queue`] - Queue
//! - FIFO with loop-replay of the current song
//! - Loop flag readable without touching the queue
//!
//! ### [`load_master`] - Downloaded files
//! - Reference counts per file, periodic soft clear of unreferenced ones
//!
//! ### [`backend`] / [`songbird_backend`] - Voice platform
//! - Traits the actor drives, and their songbird implementation
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use radio_bot::audio::{
//!     load_master::{LoadMaster, LoadMasterConfig},
//!     player::{PlayerActor, PlayerConfig},
//!     songbird_backend::SongbirdBackend,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(manager: Arc<songbird::Songbird>, song: radio_bot::sources::Song) -> anyhow::Result<()> {
//! let token = CancellationToken::new();
//! let (files, _) = LoadMaster::spawn(LoadMasterConfig::default(), token.clone());
//! let backend = Arc::new(SongbirdBackend::new(manager));
//! let (player, _) = PlayerActor::spawn(
//!     PlayerConfig::default(),
//!     backend.clone(),
//!     backend,
//!     files,
//!     token,
//! );
//!
//! player.connect(123456789, 987654321).await?;
//! player.play(song).await?;
//! player.skip().await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod load_master;
pub mod player;
pub mod queue;
pub mod songbird_backend;
