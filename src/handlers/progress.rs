use std::time::{Duration, Instant};

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::{Stream, StreamExt};
use tokio_stream::wrappers::IntervalStream;

use crate::sessions::{Phase, SessionStore};
use crate::state::AppState;

const TICK: Duration = Duration::from_millis(500);

/// How long an unknown id is tolerated after stream open: the start
/// request and the progress stream race, and the browser usually opens
/// this stream first.
const NOT_FOUND_GRACE: Duration = Duration::from_secs(10);

struct Feed {
    sessions: SessionStore,
    id: String,
    opened: Instant,
    done: bool,
}

/// Long-lived push stream of one session's progress: a JSON record every
/// 500 ms, closed after a terminal success state has been pushed, or once
/// the grace window confirms the session is gone. Client disconnect drops
/// the stream, taking its interval with it.
pub async fn progress_stream(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let feed = Feed {
        sessions: state.sessions.clone(),
        id,
        opened: Instant::now(),
        done: false,
    };

    let stream = IntervalStream::new(tokio::time::interval(TICK)).scan(feed, |feed, _tick| {
        futures::future::ready(next_event(feed))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn next_event(feed: &mut Feed) -> Option<Result<Event, axum::Error>> {
    if feed.done {
        return None;
    }
    match feed.sessions.get_progress(&feed.id) {
        Some(record) => {
            if matches!(record.phase, Phase::Streaming | Phase::Complete) {
                // Push the terminal record, then end the stream.
                feed.done = true;
            }
            Some(Event::default().json_data(&record))
        }
        None if feed.opened.elapsed() < NOT_FOUND_GRACE => {
            Some(Ok(Event::default().comment("waiting")))
        }
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::ProgressRecord;

    fn feed_for(sessions: SessionStore, id: &str) -> Feed {
        Feed { sessions, id: id.to_string(), opened: Instant::now(), done: false }
    }

    #[test]
    fn active_session_keeps_streaming_events() {
        let sessions = SessionStore::new();
        sessions.insert("dl_1", None);
        let mut feed = feed_for(sessions, "dl_1");

        assert!(next_event(&mut feed).is_some());
        assert!(next_event(&mut feed).is_some());
        assert!(!feed.done);
    }

    #[test]
    fn terminal_record_is_pushed_once_then_stream_ends() {
        let sessions = SessionStore::new();
        sessions.insert("dl_1", None);
        sessions.push(
            "dl_1",
            ProgressRecord { phase: Phase::Downloading, percent: 99.0, ..ProgressRecord::starting() },
        );
        sessions.mark_streaming("dl_1");
        let mut feed = feed_for(sessions, "dl_1");

        let event = next_event(&mut feed);
        assert!(event.is_some());
        assert!(feed.done);
        assert!(next_event(&mut feed).is_none());
    }

    #[test]
    fn unknown_session_gets_grace_then_closes() {
        let sessions = SessionStore::new();
        let mut feed = feed_for(sessions, "dl_missing");

        // Inside the grace window: keep-alive comments, not closure.
        assert!(next_event(&mut feed).is_some());

        feed.opened = Instant::now() - NOT_FOUND_GRACE - Duration::from_secs(1);
        assert!(next_event(&mut feed).is_none());
    }
}
