//! # Radio Bot
//!
//! Discord music bot built around three cooperating pieces:
//!
//! - [`audio::player`]: a single-consumer player actor owning the queue
//! - [`cache`]: a write-behind song cache with a random-sampling index
//! - [`audio::load_master`]: reference counting for downloaded audio files
//!
//! [`service::MusicService`] ties them to a [`sources::SongResolver`], and
//! [`bot`] exposes it through chat commands.

pub mod audio;
pub mod bot;
pub mod cache;
pub mod config;
pub mod error;
pub mod service;
pub mod sources;
pub mod storage;

#[cfg(test)]
mod test_utils;
