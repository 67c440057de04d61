use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Where a download currently is. Transitions only move forward through
/// this ordering; `Cancelled` and `Error` are absorbing and reachable from
/// any non-terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Starting,
    Downloading,
    Merging,
    Streaming,
    Complete,
    Cancelled,
    Error,
}

impl Phase {
    fn rank(self) -> u8 {
        match self {
            Phase::Starting => 0,
            Phase::Downloading => 1,
            Phase::Merging => 2,
            Phase::Streaming => 3,
            Phase::Complete => 4,
            Phase::Cancelled | Phase::Error => 5,
        }
    }

    fn accepts(self, next: Phase) -> bool {
        if matches!(self, Phase::Complete | Phase::Cancelled | Phase::Error) {
            return false;
        }
        matches!(next, Phase::Cancelled | Phase::Error) || next.rank() >= self.rank()
    }
}

/// The value pushed to the browser on every progress tick. Size/rate/time
/// fields are display labels parsed out of free-text tool output, not
/// exact byte counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    pub phase: Phase,
    pub percent: f64,
    pub downloaded: String,
    pub total: String,
    pub speed: String,
    pub eta: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ProgressRecord {
    pub fn starting() -> Self {
        Self {
            phase: Phase::Starting,
            percent: 0.0,
            downloaded: "0MB".to_string(),
            total: "0MB".to_string(),
            speed: "0MB/s".to_string(),
            eta: "00:00".to_string(),
            merged_seconds: None,
            message: None,
        }
    }
}

struct DownloadSession {
    token: CancellationToken,
    progress: ProgressRecord,
    duration: Option<f64>,
}

/// In-memory table of in-flight downloads, keyed by download id. Injected
/// into handlers through `AppState` so tests get isolated instances.
#[derive(Clone, Default)]
pub struct SessionStore {
    inner: Arc<Mutex<HashMap<String, DownloadSession>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new session and returns its cancellation token. If the
    /// id is already active the old session is cancelled first, then
    /// overwritten; a replaced entry must never leave an orphaned
    /// subprocess behind.
    pub fn insert(&self, id: &str, duration: Option<f64>) -> CancellationToken {
        let token = CancellationToken::new();
        let session = DownloadSession {
            token: token.clone(),
            progress: ProgressRecord::starting(),
            duration,
        };
        let mut sessions = self.inner.lock().unwrap();
        if let Some(old) = sessions.insert(id.to_string(), session) {
            info!("Replacing active session {}, cancelling previous process", id);
            old.token.cancel();
        }
        token
    }

    pub fn get_progress(&self, id: &str) -> Option<ProgressRecord> {
        self.inner.lock().unwrap().get(id).map(|s| s.progress.clone())
    }

    pub fn duration(&self, id: &str) -> Option<f64> {
        self.inner.lock().unwrap().get(id).and_then(|s| s.duration)
    }

    /// Merges a new record into the session, holding the two invariants:
    /// the phase never moves backward, and percent never regresses while
    /// downloading. Updates for unknown or terminal sessions are dropped.
    pub fn push(&self, id: &str, mut record: ProgressRecord) {
        let mut sessions = self.inner.lock().unwrap();
        let Some(session) = sessions.get_mut(id) else {
            return;
        };
        let current = &session.progress;
        if !current.phase.accepts(record.phase) {
            debug!("Dropping {:?} update for {} in phase {:?}", record.phase, id, current.phase);
            return;
        }
        if current.phase == Phase::Downloading
            && record.phase == Phase::Downloading
            && record.percent < current.percent
        {
            record.percent = current.percent;
        }
        session.progress = record;
    }

    /// Marks the file-ready hand-off state once the subprocess has exited
    /// cleanly: the byte work is done, delivery is about to begin.
    pub fn mark_streaming(&self, id: &str) {
        let mut sessions = self.inner.lock().unwrap();
        if let Some(session) = sessions.get_mut(id) {
            let p = &mut session.progress;
            if !p.phase.accepts(Phase::Streaming) {
                return;
            }
            p.phase = Phase::Streaming;
            p.percent = 100.0;
            if p.total != "0MB" {
                p.downloaded = p.total.clone();
            }
            p.eta = "00:00".to_string();
            p.merged_seconds = None;
        }
    }

    pub fn mark_error(&self, id: &str, message: &str) {
        let mut sessions = self.inner.lock().unwrap();
        if let Some(session) = sessions.get_mut(id) {
            let p = &mut session.progress;
            if !p.phase.accepts(Phase::Error) {
                return;
            }
            p.phase = Phase::Error;
            p.message = Some(message.to_string());
        }
    }

    /// Cancels the session's subprocess (hard kill via the shared token)
    /// and removes the entry. Returns false for an unknown id.
    pub fn cancel(&self, id: &str) -> bool {
        let removed = self.inner.lock().unwrap().remove(id);
        match removed {
            Some(session) => {
                session.token.cancel();
                info!("Cancelled session {}", id);
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: &str) {
        self.inner.lock().unwrap().remove(id);
    }

    /// Removes the session after a short delay, leaving the terminal
    /// record visible to a concurrently polling progress stream.
    pub fn remove_after_grace(&self, id: &str) {
        let store = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
            store.remove(&id);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(phase: Phase, percent: f64) -> ProgressRecord {
        ProgressRecord { phase, percent, ..ProgressRecord::starting() }
    }

    #[test]
    fn phases_only_move_forward() {
        let store = SessionStore::new();
        store.insert("dl_1", None);

        store.push("dl_1", record(Phase::Merging, 100.0));
        assert_eq!(store.get_progress("dl_1").unwrap().phase, Phase::Merging);

        // A late downloading line must not pull the session backward.
        store.push("dl_1", record(Phase::Downloading, 55.0));
        assert_eq!(store.get_progress("dl_1").unwrap().phase, Phase::Merging);
    }

    #[test]
    fn cancelled_and_error_are_absorbing() {
        let store = SessionStore::new();
        store.insert("dl_1", None);
        store.push("dl_1", record(Phase::Downloading, 10.0));
        store.mark_error("dl_1", "boom");

        store.push("dl_1", record(Phase::Downloading, 50.0));
        store.mark_streaming("dl_1");
        let progress = store.get_progress("dl_1").unwrap();
        assert_eq!(progress.phase, Phase::Error);
        assert_eq!(progress.message.as_deref(), Some("boom"));
    }

    #[test]
    fn percent_is_monotone_while_downloading() {
        let store = SessionStore::new();
        store.insert("dl_1", None);
        store.push("dl_1", record(Phase::Downloading, 40.0));
        store.push("dl_1", record(Phase::Downloading, 38.5));
        assert_eq!(store.get_progress("dl_1").unwrap().percent, 40.0);

        store.push("dl_1", record(Phase::Downloading, 41.0));
        assert_eq!(store.get_progress("dl_1").unwrap().percent, 41.0);
    }

    #[test]
    fn cancel_unknown_id_reports_not_found() {
        let store = SessionStore::new();
        assert!(!store.cancel("nope"));
    }

    #[test]
    fn cancel_removes_session_and_fires_token() {
        let store = SessionStore::new();
        let token = store.insert("dl_1", None);
        assert!(store.cancel("dl_1"));
        assert!(token.is_cancelled());
        assert!(store.get_progress("dl_1").is_none());
    }

    #[test]
    fn duplicate_insert_cancels_previous_session() {
        let store = SessionStore::new();
        let first = store.insert("dl_1", None);
        let second = store.insert("dl_1", Some(180.0));
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(store.duration("dl_1"), Some(180.0));
    }

    #[test]
    fn progress_record_round_trips_through_json() {
        let record = ProgressRecord {
            phase: Phase::Merging,
            percent: 45.2,
            downloaded: "Merging".to_string(),
            total: "00:00:05 @ 2.0x".to_string(),
            speed: "30 fps".to_string(),
            eta: "Merging...".to_string(),
            merged_seconds: Some(5),
            message: None,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"mergedSeconds\":5"));
        assert!(json.contains("\"phase\":\"merging\""));
        let back: ProgressRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
