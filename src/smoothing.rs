use once_cell::sync::Lazy;
use regex::Regex;

use crate::parser::{format_clock, parse_clock_seconds};

static SPEED_MULTIPLIER: Lazy<Regex> = Lazy::new(|| Regex::new(r"([\d.]+)x").unwrap());
static NUMERIC_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[\d.]+").unwrap());

/// Exponential blend that seeds itself from the first sample.
#[derive(Debug, Clone, Copy)]
pub struct Ewma {
    alpha: f64,
    value: Option<f64>,
}

impl Ewma {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let next = match self.value {
            Some(prev) if prev.is_finite() => self.alpha * sample + (1.0 - self.alpha) * prev,
            _ => sample,
        };
        self.value = Some(next);
        next
    }
}

/// Smooths the noisy per-line speed/ETA samples of the downloading phase.
/// Samples arrive on every output line, hence the slow 0.1 blend.
#[derive(Debug)]
pub struct DownloadSmoother {
    speed: Ewma,
    eta: Ewma,
}

impl DownloadSmoother {
    pub fn new() -> Self {
        Self { speed: Ewma::new(0.1), eta: Ewma::new(0.1) }
    }

    /// `"25.04MiB/s"` → smoothed `"24.87MiB/s"` (numeric prefix blended,
    /// unit suffix carried through).
    pub fn speed_label(&mut self, raw: &str) -> String {
        let Some(m) = NUMERIC_PREFIX.find(raw) else {
            return raw.to_string();
        };
        let sample: f64 = m.as_str().parse().unwrap_or(0.0);
        let smoothed = self.speed.update(sample);
        format!("{:.2}{}", smoothed, &raw[m.end()..])
    }

    /// `"00:12"` → smoothed clock label.
    pub fn eta_label(&mut self, raw: &str) -> String {
        let sample = parse_clock_seconds(raw);
        format_clock(self.eta.update(sample))
    }
}

/// Duration-relative merge progress. The muxer only reports elapsed output
/// time and a realtime multiplier; percent and ETA come from the media's
/// known total duration. Samples arrive once per second (file poll), hence
/// the faster 0.2 blend.
#[derive(Debug)]
pub struct MergeStats {
    speed: Ewma,
    eta: Ewma,
}

pub struct MergeEstimate {
    pub percent: f64,
    pub eta: String,
}

impl MergeStats {
    pub fn new() -> Self {
        Self { speed: Ewma::new(0.2), eta: Ewma::new(0.2) }
    }

    pub fn estimate(&mut self, merged_seconds: f64, duration: f64, multiplier: f64) -> MergeEstimate {
        let percent = if duration > 0.0 {
            (merged_seconds / duration * 100.0).clamp(0.0, 100.0)
        } else {
            100.0
        };

        let mut eta = "...".to_string();
        if duration > 0.0 && merged_seconds > 0.0 {
            let speed = self.speed.update(if multiplier > 0.0 { multiplier } else { 1.0 });
            if speed > 0.0 {
                let remaining = (duration - merged_seconds).max(0.0) / speed;
                let smoothed = self.eta.update(remaining);
                eta = format!("{}:{:02}", (smoothed / 60.0) as u64, (smoothed % 60.0) as u64);
            }
        }

        MergeEstimate { percent, eta }
    }
}

/// Extracts the realtime multiplier from a muxer speed report, either a
/// bare `"1.5x"` key or the `"00:05:00 @ 2.0x"` composite label.
pub fn speed_multiplier(label: &str) -> Option<f64> {
    SPEED_MULTIPLIER.captures(label).and_then(|c| c[1].parse().ok())
}
