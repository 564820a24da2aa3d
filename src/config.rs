use anyhow::{Context, Result};
use std::{path::PathBuf, str::FromStr, time::Duration};

use crate::{
    audio::{load_master::LoadMasterConfig, player::PlayerConfig},
    cache::{short_index::DEFAULT_DRAW_FACTOR, CacheConfig},
};

#[derive(Debug, Clone)]
pub struct Config {
    // Discord
    pub discord_token: String,
    pub command_prefix: String,

    // Paths
    pub data_dir: PathBuf,
    pub cache_dir: PathBuf,

    // Player
    pub idle_timeout: Duration,

    // Caché de canciones
    pub song_flush_interval: Duration,
    pub request_flush_interval: Duration,
    pub index_refresh_interval: Duration,
    pub cache_ttl: Duration,
    pub cache_sweep_interval: Duration,
    pub store_batch_size: usize,
    pub sampler_draw_factor: usize,

    // Archivos descargados
    pub file_sweep_interval: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; [`Config::load`] uses the
    /// process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let secs = |key: &str, default: Duration| -> Result<Duration> {
            Ok(Duration::from_secs(parse_or(&lookup, key, default.as_secs())?))
        };

        let config = Self {
            // Discord
            discord_token: lookup("DISCORD_TOKEN").context("DISCORD_TOKEN no definido")?,
            command_prefix: lookup("COMMAND_PREFIX").unwrap_or(defaults.command_prefix),

            // Paths
            data_dir: lookup("DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            cache_dir: lookup("CACHE_DIR").map_or(defaults.cache_dir, PathBuf::from),

            idle_timeout: secs("IDLE_TIMEOUT", defaults.idle_timeout)?,

            song_flush_interval: secs("SONG_FLUSH_INTERVAL", defaults.song_flush_interval)?,
            request_flush_interval: secs("REQUEST_FLUSH_INTERVAL", defaults.request_flush_interval)?,
            index_refresh_interval: secs("INDEX_REFRESH_INTERVAL", defaults.index_refresh_interval)?,
            cache_ttl: secs("CACHE_TTL", defaults.cache_ttl)?,
            cache_sweep_interval: secs("CACHE_SWEEP_INTERVAL", defaults.cache_sweep_interval)?,
            store_batch_size: parse_or(&lookup, "STORE_BATCH_SIZE", defaults.store_batch_size)?,
            sampler_draw_factor: parse_or(&lookup, "SAMPLER_DRAW_FACTOR", defaults.sampler_draw_factor)?,

            file_sweep_interval: secs("FILE_SWEEP_INTERVAL", defaults.file_sweep_interval)?,
        };

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - The token and the command prefix must not be empty
    /// - Every interval must be greater than zero
    /// - Batch size and sampler draw factor must be greater than zero
    pub fn validate(&self) -> Result<()> {
        if self.discord_token.trim().is_empty() {
            anyhow::bail!("DISCORD_TOKEN must not be empty");
        }

        if self.command_prefix.trim().is_empty() {
            anyhow::bail!("Command prefix must not be empty");
        }

        let intervals = [
            ("IDLE_TIMEOUT", self.idle_timeout),
            ("SONG_FLUSH_INTERVAL", self.song_flush_interval),
            ("REQUEST_FLUSH_INTERVAL", self.request_flush_interval),
            ("INDEX_REFRESH_INTERVAL", self.index_refresh_interval),
            ("CACHE_TTL", self.cache_ttl),
            ("CACHE_SWEEP_INTERVAL", self.cache_sweep_interval),
            ("FILE_SWEEP_INTERVAL", self.file_sweep_interval),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                anyhow::bail!("{} must be greater than 0", name);
            }
        }

        if self.store_batch_size == 0 {
            anyhow::bail!("Store batch size must be greater than 0");
        }

        if self.sampler_draw_factor == 0 {
            anyhow::bail!("Sampler draw factor must be greater than 0");
        }

        Ok(())
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// Never includes the token.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Prefix: {}\n  \
            Paths: data={} cache={}\n  \
            Player: idle {}\n  \
            Cache: flush songs/requests {}/{}, index {}, ttl {}, batch {}\n  \
            Files: sweep {}",
            self.command_prefix,
            self.data_dir.display(),
            self.cache_dir.display(),
            humantime::format_duration(self.idle_timeout),
            humantime::format_duration(self.song_flush_interval),
            humantime::format_duration(self.request_flush_interval),
            humantime::format_duration(self.index_refresh_interval),
            humantime::format_duration(self.cache_ttl),
            self.store_batch_size,
            humantime::format_duration(self.file_sweep_interval),
        )
    }

    pub fn player_config(&self) -> PlayerConfig {
        PlayerConfig {
            idle_timeout: self.idle_timeout,
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            song_flush_interval: self.song_flush_interval,
            request_flush_interval: self.request_flush_interval,
            index_refresh_interval: self.index_refresh_interval,
            ttl: self.cache_ttl,
            sweep_interval: self.cache_sweep_interval,
            draw_factor: self.sampler_draw_factor,
        }
    }

    pub fn load_master_config(&self) -> LoadMasterConfig {
        LoadMasterConfig {
            sweep_interval: self.file_sweep_interval,
        }
    }
}

fn parse_or<T>(lookup: impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .with_context(|| format!("valor inválido para {}: {}", key, value)),
        _ => Ok(default),
    }
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Discord (el token no tiene valor por defecto)
            discord_token: String::new(),
            command_prefix: "!".to_string(),

            // Path defaults
            data_dir: "/app/data".into(),
            cache_dir: "/app/cache".into(),

            idle_timeout: Duration::from_secs(60),

            song_flush_interval: Duration::from_secs(30),
            request_flush_interval: Duration::from_secs(60),
            index_refresh_interval: Duration::from_secs(6 * 60 * 60),
            cache_ttl: Duration::from_secs(3600),
            cache_sweep_interval: Duration::from_secs(300),
            store_batch_size: 500,
            sampler_draw_factor: DEFAULT_DRAW_FACTOR,

            file_sweep_interval: Duration::from_secs(600),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_only_the_token_is_set() {
        let config = config(&[("DISCORD_TOKEN", "secret")]).unwrap();

        assert_eq!(config.command_prefix, "!");
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.store_batch_size, 500);
        assert_eq!(config.cache_config().draw_factor, DEFAULT_DRAW_FACTOR);
        assert_eq!(config.load_master_config().sweep_interval, Duration::from_secs(600));
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config(&[
            ("DISCORD_TOKEN", "secret"),
            ("IDLE_TIMEOUT", "5"),
            ("STORE_BATCH_SIZE", " 20 "),
            ("DATA_DIR", "/tmp/data"),
        ])
        .unwrap();

        assert_eq!(config.player_config().idle_timeout, Duration::from_secs(5));
        assert_eq!(config.store_batch_size, 20);
        assert_eq!(config.data_dir, PathBuf::from("/tmp/data"));
    }

    #[test]
    fn missing_token_is_an_error() {
        assert!(config(&[]).is_err());
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(config(&[("DISCORD_TOKEN", "t"), ("IDLE_TIMEOUT", "soon")]).is_err());
        assert!(config(&[("DISCORD_TOKEN", "t"), ("STORE_BATCH_SIZE", "0")]).is_err());
    }

    #[test]
    fn summary_hides_the_token() {
        let config = config(&[("DISCORD_TOKEN", "very-secret")]).unwrap();
        assert!(!config.summary().contains("very-secret"));
    }
}
