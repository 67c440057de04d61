use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server_port: u16,
    pub log_level: String,
    /// Working directory for in-flight media files and sidecar progress
    /// files. Swept at startup, so it must be dedicated to this service.
    pub temp_dir: PathBuf,
    pub ytdlp_bin: String,
    /// Browser to source cookies from (e.g. "chrome"). Leave unset in
    /// production deployments.
    pub cookies_from_browser: Option<String>,
    /// Value for the downloader's `-N` parallel-fragment flag.
    pub concurrent_fragments: u32,
    /// ffmpeg video encoder for the re-encode path (4K sources).
    pub video_encoder: String,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let default_temp = std::env::temp_dir().join("grabtube");

        let builder = Config::builder()
            // Default settings
            .set_default("server_port", 3000)?
            .set_default("log_level", "info")?
            .set_default("temp_dir", default_temp.to_string_lossy().as_ref())?
            .set_default("ytdlp_bin", "yt-dlp")?
            .set_default("concurrent_fragments", 32)?
            .set_default("video_encoder", "libx264")?
            // Config file (optional)
            .add_source(File::with_name("config").required(false))
            // Environment variables (e.g. GRABTUBE_SERVER_PORT=8080)
            .add_source(Environment::with_prefix("GRABTUBE"));

        builder.build()?.try_deserialize()
    }
}
