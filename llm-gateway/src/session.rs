//! The session entity: identity, lifecycle state, metering
//! counters, and the kill signal. all counter mutations and
//! state transitions on a single session are serialized by a per-session
//! reader/writer lock; readers take a read lock just long enough to copy
//! every relevant field into a [`SessionSnapshot`], mirroring the design
//! note "Mutex copying" — callers never touch live state.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tokio::sync::{Notify, RwLock};

pub type SessionId = String;

const REQUEST_TIME_WINDOW: Duration = Duration::minutes(2);
const TOOL_CALL_HISTORY_CAP: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Active,
    Completed,
    Killed,
    #[serde(rename = "timeout")]
    TimedOut,
}

impl SessionState {
    pub fn is_active(self) -> bool {
        matches!(self, SessionState::Active)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub tool_name: String,
    pub tool_type: String,
    pub request_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// A single-fire, broadcast-to-all-waiters primitive (design note "Kill-signal
/// exactly-once closure"). Closing is idempotent: concurrent `Kill` and
/// `Terminate` calls racing on [`close_once`](Self::close_once) must never
/// double-close, guarded here by a double-check on the atomic flag.
#[derive(Clone, Debug)]
pub struct KillSignal {
    notify: Arc<Notify>,
    fired: Arc<AtomicBool>,
}

impl Default for KillSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl KillSignal {
    pub fn new() -> Self {
        Self {
            notify: Arc::new(Notify::new()),
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// An already-fired signal, used when materializing a session whose
    /// persisted state is `Killed` (.1: "the local kill event is
    /// created already fired").
    pub fn already_fired() -> Self {
        let signal = Self::new();
        signal.fired.store(true, Ordering::SeqCst);
        signal
    }

    pub fn close_once(&self) {
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        self.notify.notify_waiters();
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Resolves immediately if already fired; otherwise waits for the next
    /// [`close_once`](Self::close_once) call, racing the registration
    /// against a concurrent close per the classic `Notify` double-check.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();

            if self.is_fired() {
                return;
            }

            notified.await;

            if self.is_fired() {
                return;
            }
        }
    }
}

/// The JSON-safe projection of a session (.1, §6). `request_times`
/// is intentionally excluded from (de)serialization — the shared store
/// never persists request-time history — and always starts empty when a
/// session is materialized from storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionData {
    pub id: SessionId,
    pub state: SessionState,
    pub terminated: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_activity: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end_time: Option<OffsetDateTime>,
    pub request_count: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub tool_calls: u64,
    pub backend: Option<String>,
    pub client_address: String,
    pub metadata: HashMap<String, String>,
    pub backends_used: HashMap<String, u64>,
    pub tool_call_counts: HashMap<String, u64>,
    pub tool_call_history: VecDeque<ToolCallRecord>,
    pub is_websocket: bool,
    pub frame_count: u64,
    pub text_frames: u64,
    pub binary_frames: u64,
    #[serde(skip)]
    pub request_times: Vec<OffsetDateTime>,
}

impl SessionData {
    pub fn new(id: SessionId, backend: Option<String>, client_address: String) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id,
            state: SessionState::Active,
            terminated: false,
            start_time: now,
            last_activity: now,
            end_time: None,
            request_count: 0,
            bytes_in: 0,
            bytes_out: 0,
            tokens_in: 0,
            tokens_out: 0,
            tool_calls: 0,
            backend,
            client_address,
            metadata: HashMap::new(),
            backends_used: HashMap::new(),
            tool_call_counts: HashMap::new(),
            tool_call_history: VecDeque::new(),
            is_websocket: false,
            frame_count: 0,
            text_frames: 0,
            binary_frames: 0,
            request_times: Vec::new(),
        }
    }

    pub fn idle_time(&self, now: OffsetDateTime) -> Duration {
        now - self.last_activity
    }

    pub fn duration(&self, now: OffsetDateTime) -> Duration {
        self.end_time.unwrap_or(now) - self.start_time
    }

    pub fn bytes_total(&self) -> u64 {
        self.bytes_in + self.bytes_out
    }

    pub fn requests_per_minute(&self, now: OffsetDateTime) -> u64 {
        self.request_times
            .iter()
            .filter(|t| now - **t <= Duration::seconds(60))
            .count() as u64
    }

    fn touch(&mut self, now: OffsetDateTime) {
        self.last_activity = now;
    }

    fn append_request_time(&mut self, now: OffsetDateTime) {
        self.request_times.push(now);
        self.request_times.retain(|t| now - *t <= REQUEST_TIME_WINDOW);
    }

    fn record_tool_call(&mut self, now: OffsetDateTime, tool_name: String, tool_type: String, request_id: String) {
        *self.tool_call_counts.entry(tool_name.clone()).or_insert(0) += 1;
        self.tool_calls += 1;

        self.tool_call_history.push_back(ToolCallRecord {
            timestamp: now,
            tool_name,
            tool_type,
            request_id,
        });

        while self.tool_call_history.len() > TOOL_CALL_HISTORY_CAP {
            self.tool_call_history.pop_front();
        }
    }
}

struct SessionInner {
    data: SessionData,
    kill: KillSignal,
}

/// A cheaply-cloneable handle to a session's live, lock-guarded state.
#[derive(Clone)]
pub struct Session(Arc<RwLock<SessionInner>>);

impl Session {
    pub fn new(id: SessionId, backend: Option<String>, client_address: String) -> Self {
        Self::from_data(SessionData::new(id, backend, client_address))
    }

    /// Materializes a session from its persisted projection:
    /// the kill signal starts fired iff the persisted state is `Killed`.
    pub fn from_data(data: SessionData) -> Self {
        let kill = if data.state == SessionState::Killed {
            KillSignal::already_fired()
        } else {
            KillSignal::new()
        };

        Self(Arc::new(RwLock::new(SessionInner { data, kill })))
    }

    /// Materializes a session using an existing (possibly already-fired)
    /// local kill signal instead of deriving one from `data.state` — used
    /// by the shared store, which keeps kill signals in a separate local
    /// map keyed by ID.
    pub fn from_data_with_kill(data: SessionData, kill: KillSignal) -> Self {
        Self(Arc::new(RwLock::new(SessionInner { data, kill })))
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let inner = self.0.read().await;
        SessionSnapshot {
            data: inner.data.clone(),
            killed: inner.kill.is_fired(),
        }
    }

    pub async fn data(&self) -> SessionData {
        self.0.read().await.data.clone()
    }

    pub async fn kill_signal(&self) -> KillSignal {
        self.0.read().await.kill.clone()
    }

    pub async fn id(&self) -> SessionId {
        self.0.read().await.data.id.clone()
    }

    pub async fn is_active(&self) -> bool {
        self.0.read().await.data.state.is_active()
    }

    pub async fn touch(&self) {
        let now = OffsetDateTime::now_utc();
        self.0.write().await.data.touch(now);
    }

    pub async fn record_request(&self, backend: &str) {
        let now = OffsetDateTime::now_utc();
        let mut inner = self.0.write().await;
        inner.data.touch(now);
        inner.data.append_request_time(now);
        inner.data.request_count += 1;
        inner.data.backend = Some(backend.to_owned());
        *inner.data.backends_used.entry(backend.to_owned()).or_insert(0) += 1;
    }

    pub async fn add_bytes(&self, direction: Direction, n: u64) {
        let now = OffsetDateTime::now_utc();
        let mut inner = self.0.write().await;
        inner.data.touch(now);
        match direction {
            Direction::In => inner.data.bytes_in += n,
            Direction::Out => inner.data.bytes_out += n,
        }
    }

    pub async fn add_tokens(&self, usage: ModelUsage) {
        let mut inner = self.0.write().await;
        inner.data.tokens_in += usage.prompt_tokens;
        inner.data.tokens_out += usage.completion_tokens;
    }

    pub async fn record_tool_call(&self, tool_name: impl Into<String>, tool_type: impl Into<String>, request_id: impl Into<String>) {
        let now = OffsetDateTime::now_utc();
        let mut inner = self.0.write().await;
        inner
            .data
            .record_tool_call(now, tool_name.into(), tool_type.into(), request_id.into());
    }

    pub async fn set_metadata(&self, key: impl Into<String>, value: impl Into<String>) {
        self.0.write().await.data.metadata.insert(key.into(), value.into());
    }

    pub async fn mark_websocket(&self) {
        self.0.write().await.data.is_websocket = true;
    }

    pub async fn record_frame(&self, is_text: bool) {
        let mut inner = self.0.write().await;
        inner.data.frame_count += 1;
        if is_text {
            inner.data.text_frames += 1;
        } else {
            inner.data.binary_frames += 1;
        }
    }

    /// Active → Killed. Returns `false` if the session was not Active.
    pub async fn kill(&self) -> bool {
        let now = OffsetDateTime::now_utc();
        let mut inner = self.0.write().await;

        if !inner.data.state.is_active() {
            return false;
        }

        inner.data.state = SessionState::Killed;
        inner.data.end_time = Some(now);
        inner.kill.close_once();
        true
    }

    /// Upgrades Active or Killed to Killed+Terminated. Idempotent.
    pub async fn terminate(&self) {
        let now = OffsetDateTime::now_utc();
        let mut inner = self.0.write().await;

        if inner.data.state.is_active() {
            inner.data.end_time = Some(now);
        }

        inner.data.state = SessionState::Killed;
        inner.data.terminated = true;
        inner.kill.close_once();
    }

    pub async fn complete(&self) -> bool {
        let now = OffsetDateTime::now_utc();
        let mut inner = self.0.write().await;

        if !inner.data.state.is_active() {
            return false;
        }

        inner.data.state = SessionState::Completed;
        inner.data.end_time = Some(now);
        true
    }

    pub async fn mark_timed_out(&self) -> bool {
        let now = OffsetDateTime::now_utc();
        let mut inner = self.0.write().await;

        if !inner.data.state.is_active() {
            return false;
        }

        inner.data.state = SessionState::TimedOut;
        inner.data.end_time = Some(now);
        true
    }

    /// Resume is only valid when state = Killed and not Terminated.
    pub async fn resume(&self) -> bool {
        let now = OffsetDateTime::now_utc();
        let mut inner = self.0.write().await;

        if inner.data.state != SessionState::Killed || inner.data.terminated {
            return false;
        }

        inner.data.state = SessionState::Active;
        inner.data.end_time = None;
        inner.data.touch(now);
        inner.kill = KillSignal::new();
        true
    }
}

/// A detached, lock-free copy of a session's state (design note "Mutex
/// copying"): never shares the live lock or kill signal with the source.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    #[serde(flatten)]
    pub data: SessionData,
    pub killed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn kill_fires_signal_and_sets_end_time() {
        let session = Session::new("s1".to_owned(), None, "127.0.0.1".to_owned());
        let kill = session.kill_signal().await;
        assert!(!kill.is_fired());

        assert!(session.kill().await);

        let snap = session.snapshot().await;
        assert_eq!(snap.data.state, SessionState::Killed);
        assert!(snap.data.end_time.is_some());
        assert!(snap.killed);
        assert!(kill.is_fired());
    }

    #[tokio::test]
    async fn kill_is_a_noop_on_non_active_session() {
        let session = Session::new("s1".to_owned(), None, "127.0.0.1".to_owned());
        assert!(session.kill().await);
        assert!(!session.kill().await);
    }

    #[tokio::test]
    async fn terminate_then_resume_fails() {
        let session = Session::new("s1".to_owned(), None, "127.0.0.1".to_owned());
        session.terminate().await;

        assert!(!session.resume().await);
        let snap = session.snapshot().await;
        assert!(snap.data.terminated);
        assert_eq!(snap.data.state, SessionState::Killed);
    }

    #[tokio::test]
    async fn resume_replaces_kill_signal() {
        let session = Session::new("s1".to_owned(), None, "127.0.0.1".to_owned());
        let old_kill = session.kill_signal().await;
        session.kill().await;
        assert!(old_kill.is_fired());

        assert!(session.resume().await);

        let new_kill = session.kill_signal().await;
        assert!(!new_kill.is_fired());
        // The old handle observed the original termination and stays fired.
        assert!(old_kill.is_fired());
    }

    #[tokio::test]
    async fn request_times_trimmed_to_two_minutes() {
        let session = Session::new("s1".to_owned(), None, "127.0.0.1".to_owned());
        {
            let mut inner = session.0.write().await;
            let now = OffsetDateTime::now_utc();
            inner.data.append_request_time(now - Duration::minutes(5));
            inner.data.append_request_time(now - Duration::seconds(30));
        }
        let data = session.data().await;
        assert_eq!(data.request_times.len(), 1);
    }

    #[tokio::test]
    async fn record_request_keeps_backends_used_in_sync_with_request_count() {
        let session = Session::new("s1".to_owned(), None, "127.0.0.1".to_owned());
        session.record_request("openai").await;
        session.record_request("openai").await;
        session.record_request("anthropic").await;

        let data = session.data().await;
        let sum: u64 = data.backends_used.values().sum();
        assert_eq!(sum, data.request_count);
        assert_eq!(data.request_count, 3);
    }

    #[tokio::test]
    async fn materializing_killed_data_starts_fired() {
        let mut data = SessionData::new("s1".to_owned(), None, "127.0.0.1".to_owned());
        data.state = SessionState::Killed;
        data.end_time = Some(OffsetDateTime::now_utc());

        let session = Session::from_data(data);
        assert!(session.kill_signal().await.is_fired());
    }
}
