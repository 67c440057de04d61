use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

/// One ffmpeg `key=value` pair, loose spacing around `=` allowed. The
/// value must be a single token; a multi-token tail means the line is the
/// single-line muxer format and belongs to that matcher instead.
static MUX_KEY_VALUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\w+)\s*=\s*(\S+)$").unwrap());

/// Standard yt-dlp progress:
/// `[download]  45.2% of  320.10MiB at   25.04MiB/s ETA 00:12`
static STD_PROGRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[download\]\s+(\d+\.?\d*)%\s+of\s+~?([\d.]+\s?\w+)\s+at\s+([\d.]+\s?\w+/s)(?:\s+ETA\s+([\d:]+))?")
        .unwrap()
});

/// Connection-based parallel downloader progress, relayed by yt-dlp:
/// `[#20aa3b 26MiB/320MiB(8%) CN:16 DL:23MiB ETA:12s]`
static PARALLEL_PROGRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[#\w+\s+([\d.]+\w+)/([\d.]+\w+)\(([\d.]+)%\)\s+CN:\d+\s+DL:([\d.]+\w+)(?:\s+ETA:([\w:]+))?")
        .unwrap()
});

/// Single-line ffmpeg progress, used when the key=value channel is absent:
/// `frame= 1234 fps=60 q=28.0 size=... time=00:00:41.23 bitrate=... speed=2.0x`
static MUX_SINGLE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"frame=\s*(\d+)\s+fps=\s*([\d.]+)\s+.*?time=\s*([\d:.]+)\s+.*?speed=\s*([\d.]+)x")
        .unwrap()
});

static SIZE_WITH_UNIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)([\d.]+)\s*([KMG]i?B)").unwrap());

/// A typed partial progress update extracted from one output line.
#[derive(Debug, Clone, PartialEq)]
pub enum LineUpdate {
    /// Standard downloader progress with tool-reported percent.
    Download {
        percent: f64,
        /// Derived as `percent/100 * total`; the tool does not report it.
        downloaded: String,
        total: String,
        speed: String,
        eta: String,
    },
    /// Parallel-downloader progress; percent recomputed from byte counts
    /// when both sides parse to nonzero (the tool rounds its own figure).
    Parallel {
        percent: f64,
        downloaded: String,
        total: String,
        speed: String,
        eta: String,
    },
    /// Muxer progress, from a completed key=value record or the
    /// single-line fallback.
    MuxProgress {
        frame: String,
        fps: String,
        out_time: String,
        speed: String,
    },
}

/// Priority-ordered matcher set with the per-session key=value accumulator.
///
/// Matchers run in a fixed order, first match wins, unmatched lines return
/// `None` and are treated as plain log output by the caller.
#[derive(Debug, Default)]
pub struct Classifier {
    mux_buffer: HashMap<String, String>,
}

impl Classifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn classify(&mut self, line: &str) -> Option<LineUpdate> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }

        // 1. Muxer key=value channel. `progress` is the end-of-record key:
        //    `continue` completes a set, `end` closes the stream.
        if let Some(caps) = MUX_KEY_VALUE.captures(trimmed) {
            let key = caps[1].to_string();
            let value = caps[2].trim().to_string();
            if key == "progress" {
                let update = if value == "continue" {
                    Some(LineUpdate::MuxProgress {
                        frame: self.mux_buffer.get("frame").cloned().unwrap_or_else(|| "0".into()),
                        fps: self.mux_buffer.get("fps").cloned().unwrap_or_else(|| "0".into()),
                        out_time: self
                            .mux_buffer
                            .get("out_time")
                            .cloned()
                            .unwrap_or_else(|| "00:00:00".into()),
                        speed: self.mux_buffer.get("speed").cloned().unwrap_or_else(|| "0".into()),
                    })
                } else {
                    None
                };
                self.mux_buffer.clear();
                return update;
            }
            self.mux_buffer.insert(key, value);
            return None;
        }

        // 2. Standard downloader progress.
        if let Some(caps) = STD_PROGRESS.captures(trimmed) {
            let percent: f64 = caps[1].parse().unwrap_or(0.0);
            let total = caps[2].replace('~', "");
            let speed = caps[3].to_string();
            let eta = caps.get(4).map_or("00:00", |m| m.as_str()).to_string();

            let downloaded = SIZE_WITH_UNIT
                .captures(&total)
                .and_then(|m| {
                    let num: f64 = m[1].parse().ok()?;
                    Some(format!("{:.2}{}", percent / 100.0 * num, &m[2]))
                })
                .unwrap_or_else(|| "0".to_string());

            return Some(LineUpdate::Download { percent, downloaded, total, speed, eta });
        }

        // 3. Parallel-downloader progress.
        if let Some(caps) = PARALLEL_PROGRESS.captures(trimmed) {
            let downloaded = caps[1].to_string();
            let total = caps[2].to_string();
            let mut percent: f64 = caps[3].parse().unwrap_or(0.0);
            let speed = format!("{}/s", &caps[4]);
            let eta = caps.get(5).map_or("unknown", |m| m.as_str()).to_string();

            let down_bytes = parse_size_bytes(&downloaded);
            let total_bytes = parse_size_bytes(&total);
            if down_bytes > 0.0 && total_bytes > 0.0 {
                percent = down_bytes / total_bytes * 100.0;
            }

            return Some(LineUpdate::Parallel { percent, downloaded, total, speed, eta });
        }

        // 4. Single-line muxer fallback. The multiplier suffix is part of
        //    the match here but not of the capture; restore it so both
        //    muxer matchers report speed in the same `1.5x` shape.
        if let Some(caps) = MUX_SINGLE_LINE.captures(trimmed) {
            return Some(LineUpdate::MuxProgress {
                frame: caps[1].to_string(),
                fps: caps[2].to_string(),
                out_time: caps[3].to_string(),
                speed: format!("{}x", &caps[4]),
            });
        }

        None
    }
}

/// `"23.5MiB"` → bytes. KiB/MiB/GiB are binary (1024-based) and matched
/// case-insensitively; anything unparsable yields 0.
pub fn parse_size_bytes(s: &str) -> f64 {
    let Some(caps) = SIZE_WITH_UNIT.captures(s) else {
        return 0.0;
    };
    let val: f64 = caps[1].parse().unwrap_or(0.0);
    match caps[2].to_uppercase().chars().next() {
        Some('K') => val * 1024.0,
        Some('M') => val * 1024.0 * 1024.0,
        Some('G') => val * 1024.0 * 1024.0 * 1024.0,
        _ => val,
    }
}

/// `"HH:MM:SS"`, `"MM:SS"` or a bare number of seconds. Fractional parts
/// (`00:01:30.50`) are truncated.
pub fn parse_clock_seconds(s: &str) -> f64 {
    let whole = s.split('.').next().unwrap_or(s);
    let parts: Vec<f64> = whole.split(':').map(|p| p.trim().parse().unwrap_or(0.0)).collect();
    match parts.len() {
        3 => parts[0] * 3600.0 + parts[1] * 60.0 + parts[2],
        2 => parts[0] * 60.0 + parts[1],
        1 => parts[0],
        _ => 0.0,
    }
}

/// Seconds → `"MM:SS"`, or `"H:MM:SS"` once an hour is exceeded.
pub fn format_clock(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    if h > 0 {
        format!("{}:{:02}:{:02}", h, m, s)
    } else {
        format!("{:02}:{:02}", m, s)
    }
}

/// Lines that look error-like are kept as the latest diagnostic for
/// failure reporting; they never terminate a session by themselves.
pub fn is_error_line(line: &str) -> bool {
    line.to_lowercase().contains("error") || line.trim_start().starts_with("ERROR:")
}
