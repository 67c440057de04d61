use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::Settings;
use crate::errors::DownloadError;
use crate::lines::LineDemuxer;
use crate::parser::{Classifier, LineUpdate, is_error_line, parse_clock_seconds};
use crate::sessions::{Phase, ProgressRecord, SessionStore};
use crate::sidecar;
use crate::smoothing::DownloadSmoother;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatKind {
    #[default]
    Video,
    Audio,
}

impl FormatKind {
    pub fn extension(self) -> &'static str {
        match self {
            FormatKind::Video => "mp4",
            FormatKind::Audio => "mp3",
        }
    }
}

pub struct Downloaded {
    pub file_path: PathBuf,
    pub file_name: String,
}

/// 2160p sources are usually VP9; prefer H.264/HEVC streams that remux
/// instantly, fall back to anything 2160p+ and re-encode. Strictly 2160p,
/// no silent drop to lower resolutions.
const SELECTOR_4K: &str = "bestvideo[height=2160][vcodec^=avc1]+bestaudio[ext=m4a]/bestvideo[height=2160][vcodec^=hev1]+bestaudio[ext=m4a]/bestvideo[height=2160]+bestaudio/bestvideo[height>=2160]+bestaudio";

fn is_4k(quality: &str, kind: FormatKind) -> bool {
    kind == FormatKind::Video && (quality == "best" || quality == "2160p")
}

/// Maps the requested (quality, kind) pair onto a format-selector
/// expression. The expression itself is opaque to us; the downloader
/// interprets it.
pub fn format_selector(quality: &str, kind: FormatKind) -> String {
    if kind == FormatKind::Audio {
        return "bestaudio".to_string();
    }
    if is_4k(quality, kind) {
        return SELECTOR_4K.to_string();
    }
    // Height-capped H.264, native stream copy.
    let height = quality.trim_end_matches('p');
    format!(
        "bestvideo[height<={h}][ext=mp4]+bestaudio[ext=m4a]/best[height<={h}][ext=mp4]/best[height<={h}]",
        h = height
    )
}

/// Post-processor expression handed to the muxer: always points it at the
/// sidecar progress file; 4K sources additionally re-encode to H.264,
/// everything else is a stream copy.
fn postprocessor_args(settings: &Settings, quality: &str, kind: FormatKind, progress_path: &Path) -> String {
    let progress = progress_path.display();
    match kind {
        FormatKind::Audio => format!("ffmpeg:-progress \"{}\"", progress),
        FormatKind::Video if is_4k(quality, kind) => format!(
            "ffmpeg:-progress \"{}\" -c:v {} -b:v 20M -pix_fmt yuv420p -c:a aac -b:a 192k",
            progress, settings.video_encoder
        ),
        FormatKind::Video => {
            format!("ffmpeg:-progress \"{}\" -c copy -bsf:a aac_adtstoasc", progress)
        }
    }
}

pub fn build_args(
    settings: &Settings,
    url: &str,
    quality: &str,
    kind: FormatKind,
    file_path: &Path,
    progress_path: &Path,
) -> Vec<String> {
    let mut args = vec!["-f".to_string(), format_selector(quality, kind)];

    match kind {
        FormatKind::Video => {
            args.push("--merge-output-format".to_string());
            args.push("mp4".to_string());
        }
        FormatKind::Audio => {
            args.extend(
                ["-x", "--audio-format", "mp3", "--audio-quality", "192K"]
                    .map(str::to_string),
            );
        }
    }

    args.push("-N".to_string());
    args.push(settings.concurrent_fragments.to_string());

    if let Some(browser) = &settings.cookies_from_browser {
        args.push("--cookies-from-browser".to_string());
        args.push(browser.clone());
    }

    args.push("--postprocessor-args".to_string());
    args.push(postprocessor_args(settings, quality, kind, progress_path));

    args.push("-o".to_string());
    args.push(file_path.to_string_lossy().into_owned());
    // --newline is required for line-wise parsing of the progress stream.
    args.extend(["--newline", "--no-warnings", "--progress"].map(str::to_string));
    args.push(url.to_string());

    args
}

/// Runs one download to completion: spawns the subprocess, feeds its
/// output through the demuxer/classifier/smoother into the session
/// record, polls the sidecar file, and reacts to the cancellation token
/// with an immediate kill. Returns the produced file on clean exit.
pub async fn run(
    settings: &Settings,
    sessions: &SessionStore,
    id: &str,
    url: &str,
    quality: &str,
    kind: FormatKind,
    token: CancellationToken,
) -> Result<Downloaded, DownloadError> {
    let file_name = format!("{}.{}", id, kind.extension());
    let file_path = settings.temp_dir.join(&file_name);
    let progress_path = sidecar::progress_file_path(&settings.temp_dir, id);

    if let Err(e) = sidecar::create(&progress_path).await {
        warn!("[{}] Failed to create sidecar file: {}", id, e);
    }

    let mut finalizer = Finalizer {
        sessions: sessions.clone(),
        token: token.clone(),
        id: id.to_string(),
        temp_dir: settings.temp_dir.clone(),
        progress_path: progress_path.clone(),
        keep_output: false,
        keep_session: false,
    };

    let args = build_args(settings, url, quality, kind, &file_path, &progress_path);
    debug!("[{}] Spawning {} {:?}", id, settings.ytdlp_bin, args);

    // kill_on_drop: if this future is dropped mid-flight (client gone),
    // the subprocess must not outlive it.
    let spawned = Command::new(&settings.ytdlp_bin)
        .args(&args)
        .env("PYTHONUNBUFFERED", "1")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();
    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            finalizer.keep_session = true;
            return Err(e.into());
        }
    };

    let (line_tx, line_rx) = mpsc::channel::<String>(256);
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(pump_lines(stdout, line_tx.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(pump_lines(stderr, line_tx.clone())));
    }
    drop(line_tx);

    let consumer = tokio::spawn(consume_lines(line_rx, sessions.clone(), id.to_string()));
    let poller = sidecar::spawn_poller(
        sessions.clone(),
        id.to_string(),
        progress_path.clone(),
        token.clone(),
    );

    let status = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => status,
            Err(e) => {
                finalizer.keep_session = true;
                return Err(e.into());
            }
        },
        _ = token.cancelled() => {
            info!("[{}] Cancel signal received, force killing downloader", id);
            let _ = child.start_kill();
            let _ = child.wait().await;
            poller.abort();
            finalizer.keep_session = true;
            return Err(DownloadError::Cancelled);
        }
    };

    for reader in readers {
        let _ = reader.await;
    }
    let last_error = consumer.await.unwrap_or_default();
    poller.abort();

    if !status.success() {
        finalizer.keep_session = true;
        return Err(DownloadError::Process {
            code: status.code().unwrap_or(-1),
            detail: if last_error.is_empty() { "Unknown error".to_string() } else { last_error },
        });
    }

    info!("[{}] Download complete: {:?}", id, file_path);
    finalizer.keep_output = true;
    finalizer.keep_session = true;
    Ok(Downloaded { file_path, file_name })
}

/// Reads raw chunks from one output pipe and forwards complete lines.
/// Each pipe gets its own demuxer; lines interleave downstream by arrival.
async fn pump_lines<R: AsyncRead + Unpin>(mut stream: R, tx: mpsc::Sender<String>) {
    let mut demux = LineDemuxer::new();
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                for line in demux.push(&buf[..n]) {
                    if tx.send(line).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
    if let Some(tail) = demux.finish() {
        let _ = tx.send(tail).await;
    }
}

/// Single ordered consumer of both output pipes: classifies each line,
/// smooths downloading-phase samples, pushes session updates, and keeps
/// the last error-like line as the failure diagnostic (its return value).
async fn consume_lines(mut rx: mpsc::Receiver<String>, sessions: SessionStore, id: String) -> String {
    let mut classifier = Classifier::new();
    let mut smoother = DownloadSmoother::new();
    let mut last_error = String::new();

    while let Some(line) = rx.recv().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if is_error_line(line) {
            last_error = line.to_string();
        }

        // The muxer announces itself before it reports any progress.
        if line.contains("[Merger]") || line.contains("[Fixup") {
            sessions.push(&id, merge_started());
        }

        match classifier.classify(line) {
            Some(LineUpdate::Download { percent, downloaded, total, speed, eta }) => {
                let speed = smoother.speed_label(&speed);
                let eta = smoother.eta_label(&eta);
                sessions.push(&id, downloading(percent, downloaded, total, speed, eta));
            }
            Some(LineUpdate::Parallel { percent, downloaded, total, speed, eta }) => {
                sessions.push(&id, downloading(percent, downloaded, total, speed, eta));
            }
            Some(LineUpdate::MuxProgress { fps, out_time, speed, .. }) => {
                let clock = out_time.split('.').next().unwrap_or(&out_time);
                sessions.push(&id, ProgressRecord {
                    phase: Phase::Merging,
                    percent: 100.0,
                    downloaded: "Merging".to_string(),
                    total: format!("{} @ {}", clock, speed),
                    speed: format!("{} fps", fps),
                    eta: "Merging...".to_string(),
                    merged_seconds: Some(parse_clock_seconds(&out_time) as u64),
                    message: None,
                });
            }
            None => debug!("[{}] {}", id, line),
        }
    }

    last_error
}

fn downloading(percent: f64, downloaded: String, total: String, speed: String, eta: String) -> ProgressRecord {
    ProgressRecord {
        phase: Phase::Downloading,
        percent,
        downloaded,
        total,
        speed,
        eta,
        merged_seconds: None,
        message: None,
    }
}

fn merge_started() -> ProgressRecord {
    ProgressRecord {
        phase: Phase::Merging,
        percent: 100.0,
        downloaded: "Merging".to_string(),
        total: "Processing...".to_string(),
        speed: "-".to_string(),
        eta: "...".to_string(),
        merged_seconds: None,
        message: None,
    }
}

/// Deletes every file in the temp dir whose name contains the download
/// id: the output file, its `.part`/fragment leftovers, the sidecar file.
pub fn cleanup_artifacts(temp_dir: &Path, id: &str) {
    if id.is_empty() {
        return;
    }
    for entry in WalkDir::new(temp_dir).min_depth(1).max_depth(1).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_file() && entry.file_name().to_string_lossy().contains(id) {
            match std::fs::remove_file(entry.path()) {
                Ok(()) => info!("[{}] Cleaned up artifact {:?}", id, entry.path()),
                Err(e) => warn!("[{}] Failed to delete {:?}: {}", id, entry.path(), e),
            }
        }
    }
}

/// Runs on every exit path of `run`, including the future being dropped
/// mid-flight: removes the sidecar file, sweeps partial artifacts unless
/// the output was handed off, and drops the session entry unless a later
/// stage (delivery, error reporting, cancel) owns its removal.
struct Finalizer {
    sessions: SessionStore,
    token: CancellationToken,
    id: String,
    temp_dir: PathBuf,
    progress_path: PathBuf,
    keep_output: bool,
    keep_session: bool,
}

impl Drop for Finalizer {
    fn drop(&mut self) {
        sidecar::cleanup(&self.progress_path);
        if !self.keep_output {
            cleanup_artifacts(&self.temp_dir, &self.id);
        }
        if !self.keep_session {
            // Abandoned mid-flight: stop the poller and drop the entry.
            self.token.cancel();
            self.sessions.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(temp: &Path) -> Settings {
        Settings {
            server_port: 0,
            log_level: "info".to_string(),
            temp_dir: temp.to_path_buf(),
            ytdlp_bin: "yt-dlp".to_string(),
            cookies_from_browser: None,
            concurrent_fragments: 32,
            video_encoder: "libx264".to_string(),
        }
    }

    #[test]
    fn selector_for_capped_video() {
        let s = format_selector("1080p", FormatKind::Video);
        assert_eq!(
            s,
            "bestvideo[height<=1080][ext=mp4]+bestaudio[ext=m4a]/best[height<=1080][ext=mp4]/best[height<=1080]"
        );
    }

    #[test]
    fn selector_for_best_is_strict_4k() {
        for quality in ["best", "2160p"] {
            let s = format_selector(quality, FormatKind::Video);
            assert!(s.contains("height=2160"));
            assert!(s.contains("vcodec^=avc1"));
        }
        assert_eq!(format_selector("best", FormatKind::Audio), "bestaudio");
    }

    #[test]
    fn video_args_use_stream_copy_and_sidecar() {
        let tmp = std::env::temp_dir();
        let s = settings(&tmp);
        let args = build_args(
            &s,
            "https://youtu.be/abc",
            "720p",
            FormatKind::Video,
            &tmp.join("dl_1.mp4"),
            &tmp.join("progress_dl_1.txt"),
        );
        assert_eq!(args[0], "-f");
        assert!(args.contains(&"--merge-output-format".to_string()));
        assert!(args.contains(&"--newline".to_string()));
        assert!(args.contains(&"--progress".to_string()));
        assert!(args.contains(&"--no-warnings".to_string()));
        let post = &args[args.iter().position(|a| a == "--postprocessor-args").unwrap() + 1];
        assert!(post.starts_with("ffmpeg:-progress"));
        assert!(post.contains("progress_dl_1.txt"));
        assert!(post.contains("-c copy -bsf:a aac_adtstoasc"));
        assert_eq!(args.last().unwrap(), "https://youtu.be/abc");
        assert!(!args.contains(&"--cookies-from-browser".to_string()));
    }

    #[test]
    fn four_k_args_re_encode_with_configured_encoder() {
        let tmp = std::env::temp_dir();
        let s = settings(&tmp);
        let args = build_args(
            &s,
            "u",
            "best",
            FormatKind::Video,
            &tmp.join("dl_1.mp4"),
            &tmp.join("progress_dl_1.txt"),
        );
        let post = &args[args.iter().position(|a| a == "--postprocessor-args").unwrap() + 1];
        assert!(post.contains("-c:v libx264 -b:v 20M"));
        assert!(post.contains("-c:a aac -b:a 192k"));
    }

    #[test]
    fn audio_args_extract_mp3() {
        let tmp = std::env::temp_dir();
        let s = settings(&tmp);
        let args = build_args(
            &s,
            "u",
            "best",
            FormatKind::Audio,
            &tmp.join("dl_1.mp3"),
            &tmp.join("progress_dl_1.txt"),
        );
        for expected in ["-x", "--audio-format", "mp3", "--audio-quality", "192K"] {
            assert!(args.contains(&expected.to_string()), "missing {}", expected);
        }
        assert!(!args.contains(&"--merge-output-format".to_string()));
    }

    #[test]
    fn cookie_sourcing_is_config_gated() {
        let tmp = std::env::temp_dir();
        let mut s = settings(&tmp);
        s.cookies_from_browser = Some("chrome".to_string());
        let args = build_args(&s, "u", "best", FormatKind::Video, &tmp.join("a"), &tmp.join("b"));
        let idx = args.iter().position(|a| a == "--cookies-from-browser").unwrap();
        assert_eq!(args[idx + 1], "chrome");
    }

    #[test]
    fn artifact_sweep_matches_by_id() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("dl_9.mp4"), b"x").unwrap();
        std::fs::write(tmp.path().join("dl_9.mp4.part"), b"x").unwrap();
        std::fs::write(tmp.path().join("progress_dl_9.txt"), b"x").unwrap();
        std::fs::write(tmp.path().join("unrelated.txt"), b"x").unwrap();

        cleanup_artifacts(tmp.path(), "dl_9");

        let remaining: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(remaining, vec!["unrelated.txt"]);
    }

    #[tokio::test]
    async fn consumer_tracks_standard_progress_line() {
        let sessions = SessionStore::new();
        sessions.insert("dl_1", None);
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(consume_lines(rx, sessions.clone(), "dl_1".to_string()));

        tx.send("[download]  45.2% of  320.10MiB at   25.04MiB/s ETA 00:12".to_string())
            .await
            .unwrap();
        drop(tx);
        let last_error = task.await.unwrap();

        assert!(last_error.is_empty());
        let progress = sessions.get_progress("dl_1").unwrap();
        assert_eq!(progress.phase, Phase::Downloading);
        assert_eq!(progress.percent, 45.2);
        assert_eq!(progress.total, "320.10MiB");
        assert_eq!(progress.speed, "25.04MiB/s");
        assert_eq!(progress.eta, "00:12");
    }

    #[tokio::test]
    async fn consumer_emits_merge_update_from_key_value_channel() {
        let sessions = SessionStore::new();
        sessions.insert("dl_1", None);
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(consume_lines(rx, sessions.clone(), "dl_1".to_string()));

        for line in ["frame=10", "fps=30", "out_time=00:00:05.00", "speed=2.0x", "progress=continue"] {
            tx.send(line.to_string()).await.unwrap();
        }
        drop(tx);
        task.await.unwrap();

        let progress = sessions.get_progress("dl_1").unwrap();
        assert_eq!(progress.phase, Phase::Merging);
        assert_eq!(progress.total, "00:00:05 @ 2.0x");
        assert_eq!(progress.speed, "30 fps");
        assert_eq!(progress.merged_seconds, Some(5));
    }

    #[tokio::test]
    async fn consumer_keeps_last_diagnostic_without_terminating() {
        let sessions = SessionStore::new();
        sessions.insert("dl_1", None);
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(consume_lines(rx, sessions.clone(), "dl_1".to_string()));

        tx.send("ERROR: unable to download video data".to_string()).await.unwrap();
        tx.send("[download]  10.0% of 1.00MiB at 1.00MiB/s ETA 00:01".to_string()).await.unwrap();
        drop(tx);
        let last_error = task.await.unwrap();

        assert_eq!(last_error, "ERROR: unable to download video data");
        // The session kept updating; only the exit code decides failure.
        assert_eq!(sessions.get_progress("dl_1").unwrap().phase, Phase::Downloading);
    }
}
