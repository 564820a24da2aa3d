use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::{
    path::{Path, PathBuf},
    sync::LazyLock,
    time::Duration,
};
use tokio::{fs, process::Command};
use tracing::{debug, error, info, warn};
use url::Url;

use super::{Song, SongResolver};
use crate::audio::load_master::LoadMaster;

/// Formatos que Symphonia decodifica sin ffmpeg
const AUDIO_FORMAT: &str = "bestaudio[ext=m4a]/bestaudio[ext=mp3]/bestaudio";

static YOUTUBE_VIDEO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:https?://)?(?:www\.|m\.|music\.)?(?:youtube\.com/(?:watch\?(?:.*&)?v=|embed/|v/|shorts/)|youtu\.be/)([A-Za-z0-9_-]{11})",
    )
    .expect("static regex is valid")
});

#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    id: String,
    title: String,
    duration: Option<f64>,
    uploader: Option<String>,
    artist: Option<String>,
    thumbnail: Option<String>,
    webpage_url: String,
    extractor_key: Option<String>,
    is_live: Option<bool>,
}

impl YtDlpInfo {
    fn into_song(self) -> Song {
        let service = self
            .extractor_key
            .map(|key| key.to_lowercase())
            .unwrap_or_else(|| "youtube".to_string());
        let thumbnail = self.thumbnail.unwrap_or_default();

        Song {
            service,
            id: self.id,
            title: self.title,
            artist: self.artist.or(self.uploader).unwrap_or_default(),
            artwork_url: thumbnail.clone(),
            thumbnail_url: thumbnail,
            // la página queda como origen hasta que se descargue el audio
            stream_url: self.webpage_url.clone(),
            page_url: self.webpage_url,
            duration: self
                .duration
                .map(Duration::from_secs_f64)
                .unwrap_or_default(),
            ..Default::default()
        }
    }
}

/// Resolver que usa yt-dlp para buscar y descargar audio
///
/// Downloads land in `cache_dir/<song key>.<ext>`; an existing file for the
/// same key is reused instead of downloading again.
pub struct YtDlpResolver {
    cache_dir: PathBuf,
    files: LoadMaster,
}

impl YtDlpResolver {
    pub async fn new(cache_dir: PathBuf, files: LoadMaster) -> Result<Self> {
        fs::create_dir_all(&cache_dir)
            .await
            .with_context(|| format!("no se pudo crear {}", cache_dir.display()))?;
        Ok(Self { cache_dir, files })
    }

    /// Verifica que yt-dlp esté disponible
    pub async fn verify_dependencies() -> Result<()> {
        match Command::new("yt-dlp").arg("--version").output().await {
            Ok(output) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout);
                info!("✅ yt-dlp versión: {}", version.trim());
                Ok(())
            }
            _ => {
                error!("❌ yt-dlp no encontrado. Instala con: pip install yt-dlp");
                anyhow::bail!("yt-dlp no disponible")
            }
        }
    }

    /// ID de video si `url` apunta a un video de YouTube
    pub fn youtube_video_id(url: &str) -> Option<&str> {
        YOUTUBE_VIDEO
            .captures(url.trim())
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
    }

    /// Turns user input into the argument handed to yt-dlp.
    ///
    /// YouTube links are reduced to the bare video so playlist parameters
    /// never expand into a playlist dump; free text becomes a single search.
    fn search_target(query: &str) -> String {
        let query = query.trim();
        if let Some(id) = Self::youtube_video_id(query) {
            return format!("https://www.youtube.com/watch?v={}", id);
        }
        match Url::parse(query) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => url.to_string(),
            _ => format!("ytsearch1:{}", query),
        }
    }

    /// Where yt-dlp should fetch `song` from.
    ///
    /// `page_url` survives the download, so records whose `stream_url` is a
    /// swept cache file can still be fetched again.
    fn source_url(song: &Song) -> Option<String> {
        if !song.page_url.is_empty() {
            return Some(song.page_url.clone());
        }
        if song.stream_url.contains("://") {
            return Some(song.stream_url.clone());
        }
        (song.service == "youtube" && !song.id.is_empty())
            .then(|| format!("https://www.youtube.com/watch?v={}", song.id))
    }

    async fn cached_file(&self, key: &str) -> Result<Option<PathBuf>> {
        let mut entries = fs::read_dir(&self.cache_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if is_download_of(&path, key) {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }

    async fn download(&self, song: &Song) -> Result<PathBuf> {
        let source = Self::source_url(song)
            .with_context(|| format!("sin origen descargable para {}", song.key()))?;
        let template = self.cache_dir.join(format!("{}.%(ext)s", song.key()));

        info!("⬇️ Descargando: {}", song.title);
        let output = Command::new("yt-dlp")
            .args([
                "-f",
                AUDIO_FORMAT,
                "--no-playlist",
                "--quiet",
                "--no-warnings",
                "--socket-timeout",
                "15",
                "--retries",
                "2",
                "--print",
                "after_move:filepath",
                "-o",
            ])
            .arg(&template)
            .arg(&source)
            .output()
            .await
            .context("no se pudo ejecutar yt-dlp")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("yt-dlp download failed: {}", stderr.trim());
            anyhow::bail!("yt-dlp download failed: {}", stderr.trim());
        }

        let printed = String::from_utf8_lossy(&output.stdout);
        if let Some(path) = printed.lines().rev().map(str::trim).find(|l| !l.is_empty()) {
            let path = PathBuf::from(path);
            if fs::metadata(&path).await.is_ok() {
                return Ok(path);
            }
        }

        // algunas versiones no imprimen la ruta final
        self.cached_file(&song.key())
            .await?
            .with_context(|| format!("yt-dlp no dejó archivo para {}", song.key()))
    }
}

#[async_trait]
impl SongResolver for YtDlpResolver {
    async fn find_song(&self, query: &str) -> Result<Song> {
        let target = Self::search_target(query);
        info!("🔍 Buscando con yt-dlp: {}", target);

        let output = Command::new("yt-dlp")
            .args([
                "--dump-json",
                "--skip-download",
                "--no-playlist",
                "--quiet",
                "--no-warnings",
                "--socket-timeout",
                "15",
            ])
            .arg(&target)
            .output()
            .await
            .context("no se pudo ejecutar yt-dlp")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("yt-dlp search failed: {}", stderr.trim());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout
            .lines()
            .find(|line| !line.trim().is_empty())
            .with_context(|| format!("sin resultados para: {}", query))?;
        let info: YtDlpInfo = serde_json::from_str(line).context("salida de yt-dlp inválida")?;

        if info.is_live.unwrap_or(false) {
            anyhow::bail!("las transmisiones en vivo no se pueden descargar: {}", info.title);
        }

        let song = info.into_song();
        debug!("Encontrado: {} ({})", song.title, song.key());
        Ok(song)
    }

    async fn ensure_stream_info(&self, mut song: Song) -> Result<Song> {
        let existing = match song.local_path() {
            Some(path) if fs::metadata(&path).await.is_ok() => Some(path),
            _ => self.cached_file(&song.key()).await?,
        };

        let path = match existing {
            Some(path) => {
                debug!("♻️ Reutilizando archivo: {}", path.display());
                path
            }
            None => self.download(&song).await?,
        };

        // referencia antes de que la canción llegue a la cola
        self.files.add(path.clone()).await;
        song.stream_url = path.to_string_lossy().into_owned();
        Ok(song)
    }
}

/// `<key>.<ext>` written by yt-dlp, excluding partial downloads.
fn is_download_of(path: &Path, key: &str) -> bool {
    let stem_matches = path.file_stem().and_then(|s| s.to_str()) == Some(key);
    let partial = path
        .extension()
        .and_then(|e| e.to_str())
        .map_or(true, |ext| matches!(ext, "part" | "ytdl" | "tmp"));
    stem_matches && !partial
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::load_master::LoadMasterConfig;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn youtube_ids_are_extracted_from_common_links() {
        for url in [
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "https://youtube.com/watch?list=PL1&v=dQw4w9WgXcQ&t=3",
            "https://youtu.be/dQw4w9WgXcQ",
            "https://music.youtube.com/watch?v=dQw4w9WgXcQ",
            "youtube.com/shorts/dQw4w9WgXcQ",
        ] {
            assert_eq!(YtDlpResolver::youtube_video_id(url), Some("dQw4w9WgXcQ"), "{url}");
        }
        assert_eq!(YtDlpResolver::youtube_video_id("https://vimeo.com/1234"), None);
    }

    #[test]
    fn search_targets() {
        assert_eq!(
            YtDlpResolver::search_target("https://youtu.be/dQw4w9WgXcQ?list=PL1"),
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ"
        );
        assert_eq!(
            YtDlpResolver::search_target("https://soundcloud.com/artist/track"),
            "https://soundcloud.com/artist/track"
        );
        assert_eq!(
            YtDlpResolver::search_target("  daft punk around the world "),
            "ytsearch1:daft punk around the world"
        );
    }

    #[test]
    fn dump_json_maps_onto_song() {
        let info: YtDlpInfo = serde_json::from_str(
            r#"{"id":"abc","title":"Track","duration":201.6,"uploader":"Channel",
                "thumbnail":"https://i.ytimg.com/abc.jpg","webpage_url":"https://www.youtube.com/watch?v=abc",
                "extractor_key":"Youtube","is_live":false,"formats":[]}"#,
        )
        .unwrap();

        let song = info.into_song();

        assert_eq!(song.key(), "youtube_abc");
        assert_eq!(song.artist, "Channel");
        assert_eq!(song.duration, Duration::from_secs_f64(201.6));
        assert_eq!(song.stream_url, "https://www.youtube.com/watch?v=abc");
        assert_eq!(song.page_url, "https://www.youtube.com/watch?v=abc");
        assert_eq!(song.local_path(), None);
    }

    #[test]
    fn swept_songs_download_again_from_their_page() {
        let mut song = Song::new("soundcloud", "123", "Track");
        song.page_url = "https://soundcloud.com/artist/track".into();
        song.stream_url = "/app/cache/soundcloud_123.mp3".into();

        assert_eq!(
            YtDlpResolver::source_url(&song).as_deref(),
            Some("https://soundcloud.com/artist/track")
        );

        // registros antiguos sin página siguen funcionando para YouTube
        let mut legacy = Song::new("youtube", "abc", "Track");
        legacy.stream_url = "/app/cache/youtube_abc.m4a".into();
        assert_eq!(
            YtDlpResolver::source_url(&legacy).as_deref(),
            Some("https://www.youtube.com/watch?v=abc")
        );
    }

    #[test]
    fn partial_downloads_are_not_reused() {
        assert!(is_download_of(Path::new("/c/youtube_abc.m4a"), "youtube_abc"));
        assert!(!is_download_of(Path::new("/c/youtube_abc.m4a.part"), "youtube_abc"));
        assert!(!is_download_of(Path::new("/c/youtube_abcd.m4a"), "youtube_abc"));
        assert!(!is_download_of(Path::new("/c/youtube_abc"), "youtube_abc"));
    }

    #[tokio::test]
    async fn cached_files_are_reused_and_referenced() {
        let dir = TempDir::new().unwrap();
        let token = CancellationToken::new();
        let (files, _) = LoadMaster::spawn(LoadMasterConfig::default(), token.clone());
        let resolver = YtDlpResolver::new(dir.path().to_path_buf(), files.clone())
            .await
            .unwrap();
        let cached = dir.path().join("youtube_abc.m4a");
        std::fs::write(&cached, b"audio").unwrap();

        let song = resolver
            .ensure_stream_info(Song::new("youtube", "abc", "Track"))
            .await
            .unwrap();

        assert_eq!(song.local_path(), Some(cached.clone()));
        assert_eq!(files.count(&cached).await, Some(1));
        token.cancel();
    }
}
