use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

/// Wake-up sent to watchers of one job id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveEvent {
    Appended,
    Finished,
}

/// Bounded line buffer. `appended` counts every line ever pushed into this
/// slot, so a cursor stays meaningful after old lines are evicted.
#[derive(Debug)]
struct LiveBuffer {
    lines: VecDeque<String>,
    capacity: usize,
    appended: u64,
}

impl LiveBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            appended: 0,
        }
    }

    fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
        self.appended += 1;
    }

    /// Drops the lines of a previous run but keeps the counter.
    fn clear(&mut self) {
        self.lines.clear();
    }

    fn since(&self, cursor: u64) -> (Vec<String>, u64) {
        let first = self.appended - self.lines.len() as u64;
        let skip = cursor.clamp(first, self.appended) - first;
        let lines = self.lines.iter().skip(skip as usize).cloned().collect();
        (lines, self.appended)
    }
}

struct Slot {
    state: RunState,
    buffer: LiveBuffer,
    expires_at: Option<Instant>,
    events: broadcast::Sender<LiveEvent>,
}

struct GuardInner {
    slots: Mutex<HashMap<String, Slot>>,
    capacity: usize,
    grace: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct LiveSnapshot {
    pub lines: Vec<String>,
    pub cursor: u64,
    pub is_running: bool,
    pub state: RunState,
}

/// Per-job mutual exclusion plus the live output of the current or most
/// recent run. Unrelated job ids never contend beyond a short map lock.
#[derive(Clone)]
pub struct ExecutionGuard {
    inner: Arc<GuardInner>,
}

impl ExecutionGuard {
    pub fn new(capacity: usize, grace: Duration) -> Self {
        Self {
            inner: Arc::new(GuardInner {
                slots: Mutex::new(HashMap::new()),
                capacity,
                grace,
            }),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Claims `key` for a new run. `None` when a run is already in flight;
    /// the caller must not queue or wait.
    pub fn try_begin(&self, key: &str) -> Option<RunPermit> {
        let mut slots = self.slots();
        match slots.get_mut(key) {
            Some(slot) if slot.state == RunState::Running => return None,
            Some(slot) => {
                slot.state = RunState::Running;
                slot.buffer.clear();
                slot.expires_at = None;
            }
            None => {
                let (events, _) = broadcast::channel(64);
                slots.insert(
                    key.to_string(),
                    Slot {
                        state: RunState::Running,
                        buffer: LiveBuffer::new(self.inner.capacity),
                        expires_at: None,
                        events,
                    },
                );
            }
        }
        Some(RunPermit {
            guard: self.clone(),
            key: key.to_string(),
            finished: false,
        })
    }

    pub fn state(&self, key: &str) -> RunState {
        self.slots()
            .get(key)
            .map(|slot| slot.state)
            .unwrap_or(RunState::Idle)
    }

    pub fn is_running(&self, key: &str) -> bool {
        self.state(key) == RunState::Running
    }

    pub fn running(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .slots()
            .iter()
            .filter(|(_, slot)| slot.state == RunState::Running)
            .map(|(key, _)| key.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Lines appended after `cursor`, and the cursor to pass next time.
    pub fn snapshot(&self, key: &str, cursor: u64) -> LiveSnapshot {
        match self.slots().get(key) {
            Some(slot) => {
                let (lines, cursor) = slot.buffer.since(cursor);
                LiveSnapshot {
                    lines,
                    cursor,
                    is_running: slot.state == RunState::Running,
                    state: slot.state,
                }
            }
            None => LiveSnapshot {
                lines: Vec::new(),
                cursor,
                is_running: false,
                state: RunState::Idle,
            },
        }
    }

    /// `None` when nothing is known about `key`.
    pub fn subscribe(&self, key: &str) -> Option<broadcast::Receiver<LiveEvent>> {
        self.slots().get(key).map(|slot| slot.events.subscribe())
    }

    /// Forgets finished runs whose grace period has passed. Returns how many
    /// slots went back to idle.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut slots = self.slots();
        let before = slots.len();
        slots.retain(|_, slot| {
            slot.state == RunState::Running || slot.expires_at.is_none_or(|at| at > now)
        });
        before - slots.len()
    }

    fn push_line(&self, key: &str, line: String) {
        if let Some(slot) = self.slots().get_mut(key) {
            slot.buffer.push(line);
            let _ = slot.events.send(LiveEvent::Appended);
        }
    }

    fn finish(&self, key: &str, state: RunState) {
        if let Some(slot) = self.slots().get_mut(key) {
            slot.state = state;
            slot.expires_at = Some(Instant::now() + self.inner.grace);
            let _ = slot.events.send(LiveEvent::Finished);
        }
    }
}

/// Exclusive right to run one job id. Dropping it without `finish` records
/// the run as failed so the id cannot stay stuck in `Running`.
pub struct RunPermit {
    guard: ExecutionGuard,
    key: String,
    finished: bool,
}

impl RunPermit {
    pub fn push_line(&self, line: impl Into<String>) {
        self.guard.push_line(&self.key, line.into());
    }

    pub fn finish(mut self, state: RunState) {
        self.guard.finish(&self.key, state);
        self.finished = true;
    }
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        if !self.finished {
            self.guard.finish(&self.key, RunState::Failed);
        }
    }
}
