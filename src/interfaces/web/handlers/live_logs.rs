use axum::{
    extract::{
        Path, Query, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code},
    },
    response::Response,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast::{Receiver, error::RecvError};
use tracing::debug;

use crate::core::engine::{ExecutionGuard, LiveEvent};
use crate::interfaces::web::{AppState, auth};

/// Upper bound on how long a watcher waits without a wake-up before it
/// re-reads the buffer.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LiveFrame {
    Logs { data: Vec<String>, is_running: bool },
    Done { is_running: bool },
}

/// One watcher's view of a job's live buffer. Each feed keeps its own
/// cursor and never mutates the shared buffer.
pub struct LiveFeed {
    guard: ExecutionGuard,
    job_id: String,
    cursor: u64,
    events: Option<Receiver<LiveEvent>>,
    done: bool,
}

impl LiveFeed {
    pub fn new(guard: ExecutionGuard, job_id: impl Into<String>) -> Self {
        let job_id = job_id.into();
        // Subscribe before the first read so no wake-up falls in between.
        let events = guard.subscribe(&job_id);
        Self {
            guard,
            job_id,
            cursor: 0,
            events,
            done: false,
        }
    }

    /// Waits for the next frame. After a `Done` frame it returns `None`.
    pub async fn next_frame(&mut self) -> Option<LiveFrame> {
        if self.done {
            return None;
        }
        loop {
            let snapshot = self.guard.snapshot(&self.job_id, self.cursor);
            self.cursor = snapshot.cursor;
            if !snapshot.lines.is_empty() {
                return Some(LiveFrame::Logs {
                    data: snapshot.lines,
                    is_running: snapshot.is_running,
                });
            }
            if !snapshot.is_running {
                self.done = true;
                return Some(LiveFrame::Done { is_running: false });
            }
            self.wait().await;
        }
    }

    async fn wait(&mut self) {
        let Some(events) = self.events.as_mut() else {
            self.events = self.guard.subscribe(&self.job_id);
            if self.events.is_none() {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
            return;
        };
        match tokio::time::timeout(POLL_INTERVAL, events.recv()).await {
            Ok(Ok(_)) | Ok(Err(RecvError::Lagged(_))) | Err(_) => {}
            Ok(Err(RecvError::Closed)) => self.events = None,
        }
    }
}

#[derive(Deserialize, Default)]
pub struct StreamQuery {
    pub token: Option<String>,
}

/// `GET /api/ws/runs/{job_id}?token=...`
pub async fn run_logs_ws(
    ws: WebSocketUpgrade,
    Path(job_id): Path<String>,
    Query(query): Query<StreamQuery>,
    State(state): State<AppState>,
) -> Response {
    let verdict = auth::authorize(&state, query.token.as_deref()).await;
    let guard = state.engine.guard().clone();
    ws.on_upgrade(move |socket| async move {
        match verdict {
            Ok(()) => stream_live(socket, LiveFeed::new(guard, job_id)).await,
            Err(denied) => {
                debug!("Live log watcher for {} refused: {:?}", job_id, denied);
                close(socket, close_code::POLICY, "unauthorized").await;
            }
        }
    })
}

async fn stream_live(mut socket: WebSocket, mut feed: LiveFeed) {
    loop {
        tokio::select! {
            frame = feed.next_frame() => {
                let Some(frame) = frame else {
                    break;
                };
                let finished = matches!(frame, LiveFrame::Done { .. });
                let Ok(text) = serde_json::to_string(&frame) else {
                    break;
                };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    return;
                }
                if finished {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    close(socket, close_code::NORMAL, "done").await;
}

async fn close(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::engine::RunState;

    fn guard() -> ExecutionGuard {
        ExecutionGuard::new(100, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn unknown_job_is_done_immediately() {
        let mut feed = LiveFeed::new(guard(), "sign-nothing");
        assert_eq!(
            feed.next_frame().await,
            Some(LiveFrame::Done { is_running: false })
        );
        assert_eq!(feed.next_frame().await, None);
    }

    #[tokio::test]
    async fn finished_run_replays_buffer_then_done() {
        let guard = guard();
        let permit = guard.try_begin("sign-daily").unwrap();
        permit.push_line("hello");
        permit.push_line("world");
        permit.finish(RunState::Succeeded);

        let mut feed = LiveFeed::new(guard, "sign-daily");
        assert_eq!(
            feed.next_frame().await,
            Some(LiveFrame::Logs {
                data: vec!["hello".to_string(), "world".to_string()],
                is_running: false
            })
        );
        assert_eq!(
            feed.next_frame().await,
            Some(LiveFrame::Done { is_running: false })
        );
    }

    #[tokio::test]
    async fn running_feed_wakes_on_new_lines() {
        let guard = guard();
        let permit = guard.try_begin("sign-daily").unwrap();
        permit.push_line("one");

        let mut feed = LiveFeed::new(guard.clone(), "sign-daily");
        assert_eq!(
            feed.next_frame().await,
            Some(LiveFrame::Logs {
                data: vec!["one".to_string()],
                is_running: true
            })
        );

        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            permit.push_line("two");
            permit.finish(RunState::Failed);
        });

        let mut seen = Vec::new();
        while let Some(frame) = feed.next_frame().await {
            seen.push(frame);
        }
        writer.await.unwrap();

        let lines: Vec<String> = seen
            .iter()
            .filter_map(|f| match f {
                LiveFrame::Logs { data, .. } => Some(data.clone()),
                LiveFrame::Done { .. } => None,
            })
            .flatten()
            .collect();
        assert_eq!(lines, vec!["two".to_string()]);
        assert_eq!(seen.last(), Some(&LiveFrame::Done { is_running: false }));
    }

    #[tokio::test]
    async fn watchers_hold_independent_cursors() {
        let guard = guard();
        let permit = guard.try_begin("db-1").unwrap();
        permit.push_line("a");

        let mut first = LiveFeed::new(guard.clone(), "db-1");
        first.next_frame().await;
        permit.push_line("b");

        let mut second = LiveFeed::new(guard.clone(), "db-1");
        assert_eq!(
            second.next_frame().await,
            Some(LiveFrame::Logs {
                data: vec!["a".to_string(), "b".to_string()],
                is_running: true
            })
        );
        assert_eq!(
            first.next_frame().await,
            Some(LiveFrame::Logs {
                data: vec!["b".to_string()],
                is_running: true
            })
        );
        permit.finish(RunState::Succeeded);
    }

    #[test]
    fn frames_serialize_to_wire_shape() {
        let logs = LiveFrame::Logs {
            data: vec!["x".to_string()],
            is_running: true,
        };
        assert_eq!(
            serde_json::to_value(&logs).unwrap(),
            serde_json::json!({ "type": "logs", "data": ["x"], "is_running": true })
        );
        assert_eq!(
            serde_json::to_value(LiveFrame::Done { is_running: false }).unwrap(),
            serde_json::json!({ "type": "done", "is_running": false })
        );
    }
}
