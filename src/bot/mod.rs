//! # Bot Module
//!
//! Discord front end: a serenity [`EventHandler`] that parses prefix
//! commands from chat and forwards them to the [`MusicService`].
//!
//! | Command | Effect |
//! |---|---|
//! | `play <query>` | resolve and queue a song in the caller's voice channel |
//! | `skip` | stop the current song |
//! | `loop [on\|off]` | toggle replay of the current song |
//! | `radio [on\|off]` | toggle random refills when the queue drains |
//! | `np` | current song and position |
//! | `status` | loop, radio and playback state |
//! | `leave` | leave the voice channel |

use serenity::{
    all::{ChannelId, Context, EventHandler, GuildId, Message, Ready},
    async_trait,
};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::{
    audio::backend::PlaybackStats,
    error::{PlayerError, ServiceError},
    service::{MusicService, Status},
    sources::Song,
};

/// A parsed chat command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotCommand {
    Play(String),
    Skip,
    /// `None` alterna el estado actual
    Loop(Option<bool>),
    Radio(Option<bool>),
    NowPlaying,
    Status,
    Leave,
}

impl BotCommand {
    /// Parses `content` if it starts with `prefix`.
    ///
    /// Unknown commands and `play` without a query yield `None`.
    pub fn parse(prefix: &str, content: &str) -> Option<Self> {
        let rest = content.trim().strip_prefix(prefix)?;
        let (name, args) = match rest.split_once(char::is_whitespace) {
            Some((name, args)) => (name, args.trim()),
            None => (rest, ""),
        };

        let command = match name.to_lowercase().as_str() {
            "play" | "p" if !args.is_empty() => Self::Play(args.to_string()),
            "skip" | "s" => Self::Skip,
            "loop" => Self::Loop(parse_toggle(args)?),
            "radio" => Self::Radio(parse_toggle(args)?),
            "np" | "nowplaying" => Self::NowPlaying,
            "status" => Self::Status,
            "leave" | "stop" => Self::Leave,
            _ => return None,
        };
        Some(command)
    }
}

/// `Some(None)` sin argumento, `None` si el argumento no es válido
fn parse_toggle(args: &str) -> Option<Option<bool>> {
    match args.to_lowercase().as_str() {
        "" => Some(None),
        "on" | "true" | "1" => Some(Some(true)),
        "off" | "false" | "0" => Some(Some(false)),
        _ => None,
    }
}

/// Serenity event handler for the radio bot.
pub struct RadioBot {
    service: MusicService,
    prefix: String,
}

impl RadioBot {
    pub fn new(service: MusicService, prefix: impl Into<String>) -> Self {
        Self {
            service,
            prefix: prefix.into(),
        }
    }

    async fn execute(
        &self,
        ctx: &Context,
        msg: &Message,
        command: BotCommand,
    ) -> Result<String, ServiceError> {
        let service = &self.service;
        match command {
            BotCommand::Play(query) => {
                let (guild_id, channel_id) = voice_channel_of(ctx, msg)?;
                let (song, playbacks) = service
                    .play(&query, msg.author.id.get(), guild_id.get(), channel_id.get())
                    .await?;
                Ok(format!(
                    "🎵 En cola: **{}** ({} reproducciones)",
                    song_label(&song),
                    playbacks
                ))
            }
            BotCommand::Skip => {
                service.skip().await?;
                Ok("⏭️ Saltando".to_string())
            }
            BotCommand::Loop(toggle) => {
                let enabled = toggle.unwrap_or(!service.loop_status());
                service.set_loop(enabled).await?;
                Ok(if enabled {
                    "🔂 Repetición activada".to_string()
                } else {
                    "➡️ Repetición desactivada".to_string()
                })
            }
            BotCommand::Radio(toggle) => {
                let enabled = toggle.unwrap_or(!service.radio_status());
                if enabled {
                    let (guild_id, channel_id) = voice_channel_of(ctx, msg)?;
                    service
                        .set_radio(true, guild_id.get(), channel_id.get())
                        .await?;
                    Ok("📻 Radio activada".to_string())
                } else {
                    service.set_radio(false, 0, 0).await?;
                    Ok("📻 Radio desactivada".to_string())
                }
            }
            BotCommand::NowPlaying => Ok(match service.now_playing() {
                Some(song) => format_now_playing(&song, service.song_status().await),
                None => "🔇 No suena nada".to_string(),
            }),
            BotCommand::Status => Ok(format_status(&service.status().await)),
            BotCommand::Leave => {
                service.leave().await?;
                Ok("👋 Hasta luego".to_string())
            }
        }
    }
}

#[async_trait]
impl EventHandler for RadioBot {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!("🤖 {} está en línea!", ready.user.name);
        info!("📊 Conectado a {} servidores", ready.guilds.len());
    }

    async fn message(&self, ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }
        let Some(command) = BotCommand::parse(&self.prefix, &msg.content) else {
            return;
        };
        debug!("Comando de {}: {:?}", msg.author.name, command);

        let reply = match self.execute(&ctx, &msg, command).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Comando fallido para {}: {}", msg.author.name, e);
                user_message(&e)
            }
        };

        if let Err(e) = msg.channel_id.say(&ctx.http, reply).await {
            error!("Error al responder: {:?}", e);
        }
    }
}

/// Canal de voz del autor según la caché de serenity
fn voice_channel_of(ctx: &Context, msg: &Message) -> Result<(GuildId, ChannelId), ServiceError> {
    let guild = msg.guild(&ctx.cache).ok_or(ServiceError::NoVoiceChannel)?;
    let channel = guild
        .voice_states
        .get(&msg.author.id)
        .and_then(|state| state.channel_id)
        .ok_or(ServiceError::NoVoiceChannel)?;
    Ok((guild.id, channel))
}

fn song_label(song: &Song) -> String {
    if song.artist.is_empty() {
        song.title.clone()
    } else {
        format!("{} - {}", song.title, song.artist)
    }
}

fn whole_secs(duration: Duration) -> humantime::FormattedDuration {
    humantime::format_duration(Duration::from_secs(duration.as_secs()))
}

fn format_now_playing(song: &Song, stats: Option<PlaybackStats>) -> String {
    match stats {
        Some(stats) if !stats.duration.is_zero() => format!(
            "🎵 **{}** [{} / {}]",
            song_label(song),
            whole_secs(stats.position),
            whole_secs(stats.duration)
        ),
        Some(stats) => format!("🎵 **{}** [{}]", song_label(song), whole_secs(stats.position)),
        None => format!("🎵 **{}**", song_label(song)),
    }
}

fn format_status(status: &Status) -> String {
    let on_off = |flag: bool| if flag { "on" } else { "off" };
    let now = match &status.now {
        Some(song) => format_now_playing(song, status.song),
        None => "🔇 No suena nada".to_string(),
    };
    format!(
        "🔂 loop: {} | 📻 radio: {}\n{}",
        on_off(status.looping),
        on_off(status.radio),
        now
    )
}

/// Mensaje para el usuario a partir de un error del servicio
fn user_message(error: &ServiceError) -> String {
    match error {
        ServiceError::NoVoiceChannel => "❌ Debes estar en un canal de voz".to_string(),
        ServiceError::SongNotFound(query) => format!("❌ No se encontraron resultados para: {}", query),
        ServiceError::Resolve(_) => "❌ No se pudo preparar la canción".to_string(),
        ServiceError::RadioEmpty => "📻 Aún no hay canciones para la radio".to_string(),
        ServiceError::Player(PlayerError::ConnectFailed(_)) => {
            "❌ No pude unirme al canal de voz".to_string()
        }
        ServiceError::Player(PlayerError::NotConnected) => {
            "❌ No estoy conectado a un canal de voz".to_string()
        }
        ServiceError::Player(e) => format!("❌ Error: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_commands_with_and_without_arguments() {
        assert_eq!(
            BotCommand::parse("!", "!play  daft punk "),
            Some(BotCommand::Play("daft punk".into()))
        );
        assert_eq!(BotCommand::parse("!", "!SKIP"), Some(BotCommand::Skip));
        assert_eq!(BotCommand::parse("!", "!loop"), Some(BotCommand::Loop(None)));
        assert_eq!(BotCommand::parse("!", "!radio off"), Some(BotCommand::Radio(Some(false))));
        assert_eq!(BotCommand::parse("!", "!np"), Some(BotCommand::NowPlaying));
        assert_eq!(BotCommand::parse("?", "?status"), Some(BotCommand::Status));
    }

    #[test]
    fn ignores_foreign_and_malformed_messages() {
        assert_eq!(BotCommand::parse("!", "play something"), None);
        assert_eq!(BotCommand::parse("!", "!play"), None);
        assert_eq!(BotCommand::parse("!", "!loop maybe"), None);
        assert_eq!(BotCommand::parse("!", "!dance"), None);
    }

    #[test]
    fn now_playing_shows_position_and_length() {
        let mut song = Song::new("youtube", "a", "Track");
        song.artist = "Artist".into();
        let stats = PlaybackStats {
            position: Duration::from_millis(65_400),
            duration: Duration::from_secs(200),
        };

        assert_eq!(
            format_now_playing(&song, Some(stats)),
            "🎵 **Track - Artist** [1m 5s / 3m 20s]"
        );
        assert_eq!(format_now_playing(&song, None), "🎵 **Track - Artist**");
    }

    #[test]
    fn status_lists_flags() {
        let status = Status {
            looping: true,
            radio: false,
            now: None,
            song: None,
        };
        assert_eq!(
            format_status(&status),
            "🔂 loop: on | 📻 radio: off\n🔇 No suena nada"
        );
    }
}
