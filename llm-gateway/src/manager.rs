//! The session manager: owns lifecycle transitions
//! (create/resume/kill/terminate/timeout/cleanup) and kill-block windows.
//! Implemented as a single-owner actor task — an mpsc command channel
//! plus a `tokio::select!` loop that also drives the cleanup interval.
//! The store keeps its own internal reader/writer lock for concurrent
//! `get`/`put` from request-handling tasks, while the actor serializes
//! only the manager-level decisions (kill-block windows, ID derivation,
//! lifecycle transitions) that must be linearized, so no component ever
//! blocks indefinitely while holding a lock.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use gateway_task::{ShutdownSignal, Task};
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};
use tokio::sync::{mpsc, oneshot};

use crate::error::GatewayError;
use crate::session::{Session, SessionId, SessionSnapshot, SessionState};
use crate::store::SessionStore;

/// Fired exactly once when a session reaches a terminal state, whichever
/// path gets there first — natural completion/kill/timeout, or the
/// retention sweep's defensive fallback.
#[async_trait]
pub trait EndOfSessionHook: Send + Sync {
    async fn on_session_end(&self, snapshot: SessionSnapshot);
}

/// How long a killed session's ID stays refused to `getOrCreate`/`resume`.
#[derive(Debug, Clone, Copy)]
pub enum KillBlockSpec {
    Duration(Duration),
    UntilHourChange,
    Permanent,
}

/// Parses a kill-block mode name; anything unrecognized blocks permanently
/// rather than failing open.
pub fn parse_kill_block_spec(mode: &str, duration: Option<Duration>) -> KillBlockSpec {
    match mode {
        "duration" => duration.map_or(KillBlockSpec::Permanent, KillBlockSpec::Duration),
        "untilHourChange" => KillBlockSpec::UntilHourChange,
        "permanent" => KillBlockSpec::Permanent,
        _ => KillBlockSpec::Permanent,
    }
}

#[derive(Debug, Clone, Copy)]
enum KillBlockState {
    Until(OffsetDateTime),
    UntilHourChange(u8),
    Permanent,
}

impl KillBlockState {
    fn resolve(spec: KillBlockSpec, now: OffsetDateTime) -> Self {
        match spec {
            KillBlockSpec::Duration(d) => KillBlockState::Until(now + d),
            KillBlockSpec::UntilHourChange => KillBlockState::UntilHourChange(now.hour()),
            KillBlockSpec::Permanent => KillBlockState::Permanent,
        }
    }

    fn is_blocked(self, now: OffsetDateTime) -> bool {
        match self {
            KillBlockState::Until(t) => now < t,
            KillBlockState::UntilHourChange(hour) => now.hour() == hour,
            KillBlockState::Permanent => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    pub idle_timeout: Duration,
    pub kill_resume_timeout: Duration,
    pub retention_period: Duration,
    pub cleanup_interval: std::time::Duration,
    pub default_kill_block: KillBlockSpec,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::minutes(30),
            kill_resume_timeout: Duration::minutes(5),
            retention_period: Duration::hours(24),
            cleanup_interval: std::time::Duration::from_secs(30),
            default_kill_block: KillBlockSpec::Duration(Duration::minutes(5)),
        }
    }
}

/// `hash(clientIp, backendName, currentHour) -> "client-<8hex>-<backend>"`:
/// sessions derived from client address roll over hourly so a long-lived
/// client doesn't pin a single session forever.
fn derive_client_session_id(client_address: &str, backend_name: &str, now: OffsetDateTime) -> SessionId {
    let mut hasher = Sha256::new();
    hasher.update(client_address.as_bytes());
    hasher.update(b"|");
    hasher.update(backend_name.as_bytes());
    hasher.update(b"|");
    hasher.update(now.hour().to_string().as_bytes());
    let digest = hasher.finalize();
    format!("client-{}-{backend_name}", hex::encode(&digest[..4]))
}

enum Command {
    GetOrCreate {
        id: SessionId,
        backend: Option<String>,
        client_address: String,
        reply: oneshot::Sender<Result<Session, GatewayError>>,
    },
    GetOrCreateByClient {
        client_address: String,
        backend_name: String,
        reply: oneshot::Sender<Result<Session, GatewayError>>,
    },
    Kill {
        id: SessionId,
        block: Option<KillBlockSpec>,
        reply: oneshot::Sender<Result<(), GatewayError>>,
    },
    Terminate {
        id: SessionId,
        reply: oneshot::Sender<Result<(), GatewayError>>,
    },
    Resume {
        id: SessionId,
        reply: oneshot::Sender<Result<(), GatewayError>>,
    },
    Complete {
        id: SessionId,
        reply: oneshot::Sender<Result<(), GatewayError>>,
    },
}

/// A cheaply-cloneable handle to the manager actor.
#[derive(Clone)]
pub struct SessionManager {
    sender: mpsc::Sender<Command>,
}

impl SessionManager {
    pub async fn get_or_create(&self, id: SessionId, backend: Option<String>, client_address: String) -> Result<Session, GatewayError> {
        let (reply, recv) = oneshot::channel();
        let _ = self.sender.send(Command::GetOrCreate { id, backend, client_address, reply }).await;
        recv.await.map_err(|_| GatewayError::StoreUnavailable(anyhow::anyhow!("manager task is gone")))?
    }

    pub async fn get_or_create_by_client(&self, client_address: String, backend_name: String) -> Result<Session, GatewayError> {
        let (reply, recv) = oneshot::channel();
        let _ = self.sender.send(Command::GetOrCreateByClient { client_address, backend_name, reply }).await;
        recv.await.map_err(|_| GatewayError::StoreUnavailable(anyhow::anyhow!("manager task is gone")))?
    }

    pub async fn kill(&self, id: SessionId, block: Option<KillBlockSpec>) -> Result<(), GatewayError> {
        let (reply, recv) = oneshot::channel();
        let _ = self.sender.send(Command::Kill { id, block, reply }).await;
        recv.await.map_err(|_| GatewayError::StoreUnavailable(anyhow::anyhow!("manager task is gone")))?
    }

    pub async fn terminate(&self, id: SessionId) -> Result<(), GatewayError> {
        let (reply, recv) = oneshot::channel();
        let _ = self.sender.send(Command::Terminate { id, reply }).await;
        recv.await.map_err(|_| GatewayError::StoreUnavailable(anyhow::anyhow!("manager task is gone")))?
    }

    pub async fn resume(&self, id: SessionId) -> Result<(), GatewayError> {
        let (reply, recv) = oneshot::channel();
        let _ = self.sender.send(Command::Resume { id, reply }).await;
        recv.await.map_err(|_| GatewayError::StoreUnavailable(anyhow::anyhow!("manager task is gone")))?
    }

    pub async fn complete(&self, id: SessionId) -> Result<(), GatewayError> {
        let (reply, recv) = oneshot::channel();
        let _ = self.sender.send(Command::Complete { id, reply }).await;
        recv.await.map_err(|_| GatewayError::StoreUnavailable(anyhow::anyhow!("manager task is gone")))?
    }
}

/// The actor body, spawned via [`gateway_task::spawn_task`]. Owns the
/// kill-block ledger and the end-of-session callback-fired ledger, both
/// local to this single-owner task so no additional locking is needed.
pub struct SessionManagerTask {
    receiver: mpsc::Receiver<Command>,
    store: Arc<dyn SessionStore>,
    config: SessionManagerConfig,
    hook: Option<Arc<dyn EndOfSessionHook>>,
    kill_blocks: HashMap<SessionId, KillBlockState>,
    callback_fired: HashMap<SessionId, bool>,
}

pub fn new_manager(store: Arc<dyn SessionStore>, config: SessionManagerConfig, hook: Option<Arc<dyn EndOfSessionHook>>) -> (SessionManager, SessionManagerTask) {
    let (sender, receiver) = mpsc::channel(256);
    let manager = SessionManager { sender };
    let task = SessionManagerTask {
        receiver,
        store,
        config,
        hook,
        kill_blocks: HashMap::new(),
        callback_fired: HashMap::new(),
    };
    (manager, task)
}

impl SessionManagerTask {
    async fn handle(&mut self, command: Command) {
        match command {
            Command::GetOrCreate { id, backend, client_address, reply } => {
                let result = self.get_or_create(id, backend, client_address).await;
                let _ = reply.send(result);
            }
            Command::GetOrCreateByClient { client_address, backend_name, reply } => {
                let result = self.get_or_create_by_client(client_address, backend_name).await;
                let _ = reply.send(result);
            }
            Command::Kill { id, block, reply } => {
                let result = self.kill(id, block).await;
                let _ = reply.send(result);
            }
            Command::Terminate { id, reply } => {
                let result = self.terminate(id).await;
                let _ = reply.send(result);
            }
            Command::Resume { id, reply } => {
                let result = self.resume(id).await;
                let _ = reply.send(result);
            }
            Command::Complete { id, reply } => {
                let result = self.complete(id).await;
                let _ = reply.send(result);
            }
        }
    }

    /// §4.3 `getOrCreate`: Active sessions are returned as-is, Killed
    /// sessions are unconditionally rejected (no kill-block consultation —
    /// that window only gates the client-derived path below), and
    /// TimedOut/Completed sessions are deleted and recreated.
    async fn get_or_create(&mut self, id: SessionId, backend: Option<String>, client_address: String) -> Result<Session, GatewayError> {
        let id = if id.is_empty() { uuid::Uuid::new_v4().to_string() } else { id };

        if let Some(session) = self.store.get(&id).await? {
            let state = session.data().await.state;
            match state {
                SessionState::Active => return Ok(session),
                SessionState::Killed => return Err(GatewayError::Rejected("session is killed")),
                SessionState::TimedOut | SessionState::Completed => {
                    self.store.delete(&id).await?;
                }
            }
        }

        let session = Session::new(id, backend, client_address);
        self.store.put(&session).await?;
        Ok(session)
    }

    /// §4.3 `getOrCreateByClient`: the ID is deterministically derived from
    /// `(clientAddress, backendName, currentHour)`. Unlike plain
    /// `getOrCreate`, a Killed record here consults the kill-block window —
    /// once it expires the record is deleted and a fresh session created.
    async fn get_or_create_by_client(&mut self, client_address: String, backend_name: String) -> Result<Session, GatewayError> {
        let now = OffsetDateTime::now_utc();
        let id = derive_client_session_id(&client_address, &backend_name, now);

        if let Some(session) = self.store.get(&id).await? {
            let state = session.data().await.state;
            match state {
                SessionState::Active => return Ok(session),
                SessionState::Killed => {
                    let blocked = self.kill_blocks.get(&id).is_some_and(|s| s.is_blocked(now));
                    if blocked {
                        return Err(GatewayError::Rejected("session is within its kill-block window"));
                    }
                    self.store.delete(&id).await?;
                    self.kill_blocks.remove(&id);
                }
                SessionState::TimedOut | SessionState::Completed => {
                    self.store.delete(&id).await?;
                }
            }
        }

        let session = Session::new(id, Some(backend_name), client_address);
        self.store.put(&session).await?;
        Ok(session)
    }

    async fn kill(&mut self, id: SessionId, block: Option<KillBlockSpec>) -> Result<(), GatewayError> {
        let Some(session) = self.store.get(&id).await? else {
            return Err(GatewayError::NotFound);
        };

        if session.kill().await {
            self.store.put(&session).await?;
            self.store.publish_kill(&id).await?;
            self.fire_hook_if_unfired(&id, &session).await;
        }

        let now = OffsetDateTime::now_utc();
        let spec = block.unwrap_or(self.config.default_kill_block);
        self.kill_blocks.insert(id, KillBlockState::resolve(spec, now));

        Ok(())
    }

    async fn terminate(&mut self, id: SessionId) -> Result<(), GatewayError> {
        let Some(session) = self.store.get(&id).await? else {
            return Err(GatewayError::NotFound);
        };

        session.terminate().await;
        self.store.put(&session).await?;
        self.store.publish_kill(&id).await?;
        self.fire_hook_if_unfired(&id, &session).await;

        Ok(())
    }

    async fn resume(&mut self, id: SessionId) -> Result<(), GatewayError> {
        let now = OffsetDateTime::now_utc();

        if let Some(state) = self.kill_blocks.get(&id) {
            if state.is_blocked(now) {
                return Err(GatewayError::Rejected("session is within its kill-block window"));
            }
        }

        let Some(session) = self.store.get(&id).await? else {
            return Err(GatewayError::NotFound);
        };

        if !session.resume().await {
            return Err(GatewayError::Rejected("session cannot be resumed"));
        }

        self.store.put(&session).await?;
        self.kill_blocks.remove(&id);
        self.callback_fired.remove(&id);

        Ok(())
    }

    async fn complete(&mut self, id: SessionId) -> Result<(), GatewayError> {
        let Some(session) = self.store.get(&id).await? else {
            return Err(GatewayError::NotFound);
        };

        if session.complete().await {
            self.store.put(&session).await?;
            self.fire_hook_if_unfired(&id, &session).await;
        }

        Ok(())
    }

    async fn fire_hook_if_unfired(&mut self, id: &str, session: &Session) {
        if self.callback_fired.get(id).copied().unwrap_or(false) {
            return;
        }

        self.callback_fired.insert(id.to_owned(), true);

        if let Some(hook) = &self.hook {
            hook.on_session_end(session.snapshot().await).await;
        }
    }

    /// One cleanup pass: idle-timeout sweep, kill-resume-timeout
    /// sweep, then retention-period deletion with the exactly-once
    /// end-of-session callback as a defensive fallback for any session
    /// that never passed through one of the explicit lifecycle commands.
    async fn run_cleanup(&mut self) -> Result<(), GatewayError> {
        let now = OffsetDateTime::now_utc();

        let idle_ids: Vec<String> = self
            .store
            .list(&|d| d.state.is_active() && d.idle_time(now) > self.config.idle_timeout)
            .await
            .into_iter()
            .map(|d| d.id)
            .collect();

        for id in idle_ids {
            if let Some(session) = self.store.get(&id).await? {
                if session.mark_timed_out().await {
                    self.store.put(&session).await?;
                    self.fire_hook_if_unfired(&id, &session).await;
                }
            }
        }

        if self.config.kill_resume_timeout > Duration::ZERO {
            let stale_kill_ids: Vec<String> = self
                .store
                .list(&|d| d.state == crate::session::SessionState::Killed && !d.terminated && d.end_time.is_some_and(|t| now - t > self.config.kill_resume_timeout))
                .await
                .into_iter()
                .map(|d| d.id)
                .collect();

            for id in stale_kill_ids {
                if let Some(session) = self.store.get(&id).await? {
                    session.terminate().await;
                    self.store.put(&session).await?;
                    self.fire_hook_if_unfired(&id, &session).await;
                }
            }
        }

        let expired_ids: Vec<String> = self
            .store
            .list(&|d| d.end_time.is_some_and(|t| now - t > self.config.retention_period))
            .await
            .into_iter()
            .map(|d| d.id)
            .collect();

        for id in expired_ids {
            if let Some(session) = self.store.get(&id).await? {
                self.fire_hook_if_unfired(&id, &session).await;
            }
            self.store.delete(&id).await?;
            self.kill_blocks.remove(&id);
            self.callback_fired.remove(&id);
        }

        Ok(())
    }
}

#[async_trait]
impl Task for SessionManagerTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "session manager";

    async fn run(mut self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        // Jitter the first tick so a fleet of instances restarted together
        // doesn't hammer the store with synchronized cleanup sweeps.
        let jitter = rand::Rng::gen_range(&mut rand::thread_rng(), 0..self.config.cleanup_interval.as_millis() as u64);
        tokio::time::sleep(std::time::Duration::from_millis(jitter)).await;

        let mut ticker = tokio::time::interval(self.config.cleanup_interval);

        loop {
            tokio::select! {
                command = self.receiver.recv() => {
                    let Some(command) = command else { break };
                    self.handle(command).await;
                }
                _ = ticker.tick() => {
                    if let Err(error) = self.run_cleanup().await {
                        warn!(%error, "session manager cleanup pass failed");
                    }
                }
                () = shutdown_signal.wait() => break,
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionData;
    use crate::store::memory::MemoryStore;

    fn test_config() -> SessionManagerConfig {
        SessionManagerConfig {
            idle_timeout: Duration::minutes(30),
            kill_resume_timeout: Duration::minutes(5),
            retention_period: Duration::hours(24),
            cleanup_interval: std::time::Duration::from_secs(30),
            default_kill_block: KillBlockSpec::Duration(Duration::minutes(5)),
        }
    }

    fn test_task() -> SessionManagerTask {
        let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
        let (_manager, task) = new_manager(store, test_config(), None);
        task
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let mut task = test_task();
        let s1 = task.get_or_create("s1".to_owned(), None, "127.0.0.1".to_owned()).await.unwrap();
        let s2 = task.get_or_create("s1".to_owned(), None, "127.0.0.1".to_owned()).await.unwrap();
        assert_eq!(s1.id().await, s2.id().await);
    }

    #[tokio::test]
    async fn get_or_create_rejects_killed_session_even_after_its_block_window_expires() {
        let mut task = test_task();
        task.get_or_create("s1".to_owned(), None, "127.0.0.1".to_owned()).await.unwrap();
        task.kill("s1".to_owned(), None).await.unwrap();

        // `getOrCreate` (unlike `getOrCreateByClient`) never consults the
        // kill-block window: a killed record is always rejected until an
        // explicit Resume, so removing the block must not let it through.
        task.kill_blocks.remove("s1");
        let result = task.get_or_create("s1".to_owned(), None, "127.0.0.1".to_owned()).await;
        assert!(matches!(result, Err(GatewayError::Rejected(_))));
    }

    #[tokio::test]
    async fn get_or_create_recreates_timed_out_and_completed_sessions() {
        let mut task = test_task();
        let session = task.get_or_create("s1".to_owned(), None, "127.0.0.1".to_owned()).await.unwrap();
        session.complete().await;
        task.store.put(&session).await.unwrap();

        let recreated = task.get_or_create("s1".to_owned(), None, "127.0.0.1".to_owned()).await.unwrap();
        assert_eq!(recreated.data().await.state, SessionState::Active);
    }

    #[tokio::test]
    async fn get_or_create_by_client_honors_kill_block_then_recreates_once_expired() {
        let mut task = test_task();
        let client = "10.0.0.5".to_owned();
        let backend = "openai".to_owned();

        let first = task.get_or_create_by_client(client.clone(), backend.clone()).await.unwrap();
        let first_id = first.id().await;

        task.kill(first_id.clone(), Some(KillBlockSpec::Duration(Duration::minutes(5)))).await.unwrap();

        let blocked = task.get_or_create_by_client(client.clone(), backend.clone()).await;
        assert!(matches!(blocked, Err(GatewayError::Rejected(_))));

        // Once the block is lifted the same derived ID is recreated fresh.
        task.kill_blocks.remove(&first_id);
        let recreated = task.get_or_create_by_client(client, backend).await.unwrap();
        assert_eq!(recreated.id().await, first_id);
        assert_eq!(recreated.data().await.state, SessionState::Active);
    }

    #[tokio::test]
    async fn kill_then_get_or_create_is_rejected_during_block_window() {
        let mut task = test_task();
        task.get_or_create("s1".to_owned(), None, "127.0.0.1".to_owned()).await.unwrap();
        task.kill("s1".to_owned(), Some(KillBlockSpec::Duration(Duration::minutes(5)))).await.unwrap();

        let result = task.get_or_create("s1".to_owned(), None, "127.0.0.1".to_owned()).await;
        assert!(matches!(result, Err(GatewayError::Rejected(_))));
    }

    #[tokio::test]
    async fn resume_fails_while_blocked_succeeds_after_explicit_unblock() {
        let mut task = test_task();
        task.get_or_create("s1".to_owned(), None, "127.0.0.1".to_owned()).await.unwrap();
        task.kill("s1".to_owned(), Some(KillBlockSpec::Duration(Duration::minutes(5)))).await.unwrap();

        assert!(task.resume("s1".to_owned()).await.is_err());

        task.kill_blocks.remove("s1");
        task.resume("s1".to_owned()).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_kill_block_mode_blocks_permanently() {
        assert!(matches!(parse_kill_block_spec("bogus", None), KillBlockSpec::Permanent));
        assert!(matches!(parse_kill_block_spec("duration", None), KillBlockSpec::Permanent));
    }

    #[tokio::test]
    async fn client_derived_session_id_is_stable_within_the_same_hour() {
        let now = OffsetDateTime::now_utc();
        let a = derive_client_session_id("10.0.0.5", "openai", now);
        let b = derive_client_session_id("10.0.0.5", "openai", now);
        assert_eq!(a, b);
        assert!(a.starts_with("client-"));
        assert!(a.ends_with("-openai"));
    }

    #[tokio::test]
    async fn run_cleanup_times_out_sessions_idle_past_the_configured_timeout() {
        let mut task = test_task();
        let mut data = SessionData::new("s1".to_owned(), None, "127.0.0.1".to_owned());
        data.last_activity = OffsetDateTime::now_utc() - Duration::minutes(31);
        task.store.put(&Session::from_data(data)).await.unwrap();

        task.run_cleanup().await.unwrap();

        let session = task.store.get("s1").await.unwrap().expect("session still present");
        assert_eq!(session.data().await.state, SessionState::TimedOut);
    }

    #[tokio::test]
    async fn run_cleanup_never_auto_terminates_killed_sessions_when_kill_resume_timeout_is_zero() {
        let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
        let mut config = test_config();
        config.kill_resume_timeout = Duration::ZERO;
        let (_manager, mut task) = new_manager(store, config, None);

        let mut data = SessionData::new("s1".to_owned(), None, "127.0.0.1".to_owned());
        data.state = SessionState::Killed;
        data.end_time = Some(OffsetDateTime::now_utc() - Duration::hours(1));
        task.store.put(&Session::from_data(data)).await.unwrap();

        task.run_cleanup().await.unwrap();

        let session = task.store.get("s1").await.unwrap().expect("session still present");
        let data = session.data().await;
        assert_eq!(data.state, SessionState::Killed);
        assert!(!data.terminated);
    }

    /// Killing at 13:59:30 with `untilHourChange` blocks at 13:59:45 but
    /// is clear again at 14:00:05, once the hour has rolled over.
    #[test]
    fn kill_block_until_hour_change_clears_on_the_hour_boundary() {
        use time::macros::datetime;

        let kill_time = datetime!(2024-01-01 13:59:30 UTC);
        let state = KillBlockState::resolve(KillBlockSpec::UntilHourChange, kill_time);

        let still_same_hour = datetime!(2024-01-01 13:59:45 UTC);
        assert!(state.is_blocked(still_same_hour));

        let next_hour = datetime!(2024-01-01 14:00:05 UTC);
        assert!(!state.is_blocked(next_hour));
    }

    #[tokio::test]
    async fn complete_fires_end_of_session_callback_exactly_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct CountingHook(Arc<AtomicUsize>);

        #[async_trait]
        impl EndOfSessionHook for CountingHook {
            async fn on_session_end(&self, _snapshot: SessionSnapshot) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let count = Arc::new(AtomicUsize::new(0));
        let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
        let hook: Arc<dyn EndOfSessionHook> = Arc::new(CountingHook(Arc::clone(&count)));
        let (_manager, mut task) = new_manager(store, test_config(), Some(hook));

        task.get_or_create("s1".to_owned(), None, "127.0.0.1".to_owned()).await.unwrap();
        task.complete("s1".to_owned()).await.unwrap();
        // A defensive re-fire attempt (as the retention sweep would do) must not double-count.
        let session = task.store.get("s1").await.unwrap().unwrap();
        task.fire_hook_if_unfired("s1", &session).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
