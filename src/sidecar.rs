use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::parser::parse_clock_seconds;
use crate::sessions::{Phase, ProgressRecord, SessionStore};
use crate::smoothing::{MergeStats, speed_multiplier};

/// Some tool configurations suppress the muxer's stdout entirely, so the
/// muxer is pointed at a per-session file it writes `key=value` progress
/// lines to, and that file is polled instead.
pub fn progress_file_path(temp_dir: &Path, id: &str) -> PathBuf {
    temp_dir.join(format!("progress_{}.txt", id))
}

/// Create/truncate the sidecar file before the subprocess is spawned.
pub async fn create(path: &Path) -> std::io::Result<()> {
    tokio::fs::write(path, b"").await
}

/// All `key=value` lines of one read; later lines overwrite earlier ones
/// for the same key, so the result is the latest complete state.
pub fn parse_progress_file(content: &str) -> HashMap<String, String> {
    let mut stats = HashMap::new();
    for line in content.lines() {
        if let Some((key, value)) = line.split_once('=') {
            let (key, value) = (key.trim(), value.trim());
            if !key.is_empty() && !value.is_empty() {
                stats.insert(key.to_string(), value.to_string());
            }
        }
    }
    stats
}

/// Builds a merge-phase update from polled stats. Requires `out_time`;
/// with a known media duration the percent is duration-relative and the
/// ETA comes from the smoothed realtime multiplier, otherwise the fixed
/// "Merging" presentation is used.
pub fn merge_record(
    stats: &HashMap<String, String>,
    duration: Option<f64>,
    merge: &mut MergeStats,
) -> Option<ProgressRecord> {
    let out_time = stats.get("out_time")?;
    let clock = out_time.split('.').next().unwrap_or(out_time);
    let seconds = parse_clock_seconds(out_time);
    let speed = stats.get("speed").map(String::as_str).unwrap_or("1x");
    let fps = stats.get("fps").map(String::as_str).unwrap_or("0");

    let (percent, eta) = match duration {
        Some(d) if d > 0.0 => {
            let est = merge.estimate(seconds, d, speed_multiplier(speed).unwrap_or(1.0));
            (est.percent, est.eta)
        }
        _ => (100.0, "Merging...".to_string()),
    };

    Some(ProgressRecord {
        phase: Phase::Merging,
        percent,
        downloaded: "Merging".to_string(),
        total: format!("{} @ {}", clock, speed),
        speed: format!("{} fps", fps),
        eta,
        merged_seconds: Some(seconds as u64),
        message: None,
    })
}

/// Polls the sidecar file once a second for the session's lifetime,
/// pushing a merge update whenever the muxer has reported output time.
/// Stops when the session's token fires or the handle is aborted.
pub fn spawn_poller(
    store: SessionStore,
    id: String,
    path: PathBuf,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let duration = store.duration(&id);
        let mut merge = MergeStats::new();
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    let Ok(content) = tokio::fs::read_to_string(&path).await else {
                        continue;
                    };
                    let stats = parse_progress_file(&content);
                    if let Some(record) = merge_record(&stats, duration, &mut merge) {
                        store.push(&id, record);
                    }
                }
            }
        }
    })
}

/// Best-effort removal at session end; a leftover file is only noise.
pub fn cleanup(path: &Path) {
    if let Err(e) = std::fs::remove_file(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        debug!("Failed to delete sidecar file {:?}: {}", path, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_lines_win_per_key() {
        let stats = parse_progress_file("out_time=00:00:01.00\nspeed=0.9x\nout_time=00:00:02.00\n");
        assert_eq!(stats.get("out_time").map(String::as_str), Some("00:00:02.00"));
        assert_eq!(stats.get("speed").map(String::as_str), Some("0.9x"));
    }

    #[test]
    fn halfway_through_a_three_minute_video() {
        let stats = parse_progress_file("out_time=00:01:30.50\nspeed=1.5x\n");
        let mut merge = MergeStats::new();
        let record = merge_record(&stats, Some(180.0), &mut merge).unwrap();
        assert_eq!(record.merged_seconds, Some(90));
        assert!((record.percent - 50.0).abs() < 1e-9);
        assert_eq!(record.phase, Phase::Merging);
        assert_eq!(record.total, "00:01:30 @ 1.5x");
        // 90 seconds of output left at 1.5x realtime
        assert_eq!(record.eta, "1:00");
    }

    #[test]
    fn unknown_duration_keeps_fixed_presentation() {
        let stats = parse_progress_file("out_time=00:00:10.00\nfps=30\nspeed=2.0x\n");
        let mut merge = MergeStats::new();
        let record = merge_record(&stats, None, &mut merge).unwrap();
        assert_eq!(record.percent, 100.0);
        assert_eq!(record.eta, "Merging...");
        assert_eq!(record.speed, "30 fps");
    }

    #[test]
    fn no_out_time_means_no_update() {
        let stats = parse_progress_file("frame=12\nfps=30\n");
        let mut merge = MergeStats::new();
        assert!(merge_record(&stats, Some(60.0), &mut merge).is_none());
    }
}
