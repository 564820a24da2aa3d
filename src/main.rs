use anyhow::Result;
use radio_bot::{
    audio::{load_master::LoadMaster, player::PlayerActor, songbird_backend::SongbirdBackend},
    bot::RadioBot,
    cache::SongCache,
    config::Config,
    service::MusicService,
    sources::YtDlpResolver,
    storage::JsonSongStore,
};
use serenity::{model::gateway::GatewayIntents, Client};
use songbird::{SerenityInit, Songbird};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("radio_bot=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando Radio Bot v{}", env!("CARGO_PKG_VERSION"));

    // Manejar health check si es necesario
    if std::env::args().any(|arg| arg == "--health-check") {
        YtDlpResolver::verify_dependencies().await?;
        println!("OK");
        return Ok(());
    }

    // Cargar configuración
    let config = Config::load()?;
    info!("{}", config.summary());

    let token = CancellationToken::new();

    // Almacenamiento y caché de canciones
    let store = Arc::new(JsonSongStore::new(config.data_dir.clone(), config.store_batch_size).await?);
    let cache = SongCache::new(store, config.cache_config());
    let mut tasks = cache.spawn_workers(token.clone());

    // Archivos descargados
    let (files, files_task) = LoadMaster::spawn(config.load_master_config(), token.clone());
    tasks.push(files_task);

    if let Err(e) = YtDlpResolver::verify_dependencies().await {
        warn!("⚠️ {}; las búsquedas fallarán", e);
    }
    let resolver = YtDlpResolver::new(config.cache_dir.clone(), files.clone()).await?;

    // Player sobre songbird
    let songbird = Songbird::serenity();
    let backend = Arc::new(SongbirdBackend::new(songbird.clone()));
    let (player, player_task) = PlayerActor::spawn(
        config.player_config(),
        backend.clone(),
        backend,
        files,
        token.clone(),
    );
    tasks.push(player_task);

    let service = MusicService::new(player, cache, Arc::new(resolver));
    service.subscribe_on_errors(|e| warn!("⚠️ Error del reproductor: {}", e));

    // Configurar intents mínimos necesarios
    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_VOICE_STATES
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT;

    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(RadioBot::new(service, config.command_prefix.clone()))
        .register_songbird_with(songbird)
        .await?;

    // Manejar shutdown graceful
    let shard_manager = client.shard_manager.clone();
    let shutdown = token.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Error al registrar Ctrl+C: {}", e);
            return;
        }
        info!("⚠️ Señal de shutdown recibida, cerrando...");
        shutdown.cancel();
        shard_manager.shutdown_all().await;
    });

    // Iniciar bot
    info!("🚀 Bot iniciado exitosamente");
    if let Err(why) = client.start().await {
        error!("Error al ejecutar cliente: {:?}", why);
    }

    // vacía cachés, cola y archivos antes de salir
    token.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            warn!("Tarea terminada con error: {}", e);
        }
    }

    info!("👋 Radio Bot detenido");
    Ok(())
}
