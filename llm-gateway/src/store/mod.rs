//! The session store abstraction: a keyed, enumerable
//! collection of sessions plus kill signaling, with two backends —
//! [`memory::MemoryStore`] for a single process and [`shared::SharedStore`]
//! for a horizontally scaled fleet.

pub mod memory;
pub mod shared;

use async_trait::async_trait;

use crate::error::GatewayError;
use crate::session::{KillSignal, Session, SessionData};

/// A predicate over a session's serializable projection, used by `list`
/// and `count`. Boxed so both backends can share the same trait object
/// signature without generic parameters leaking into [`SessionStore`].
pub type Predicate<'a> = &'a (dyn Fn(&SessionData) -> bool + Send + Sync);

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Session>, GatewayError>;

    async fn put(&self, session: &Session) -> Result<(), GatewayError>;

    async fn delete(&self, id: &str) -> Result<(), GatewayError>;

    async fn list(&self, predicate: Predicate<'_>) -> Vec<SessionData>;

    async fn count(&self, predicate: Predicate<'_>) -> usize;

    /// Returns the kill channel for `id`, creating an empty (unfired) one
    /// if the ID is unknown — a kill message may arrive before the local
    /// record is ever read.
    async fn get_kill_channel(&self, id: &str) -> KillSignal;

    /// Must be called by the manager *after* the Killed state has been
    /// persisted, so a recipient instance materializing the
    /// session from storage observes the correct state.
    async fn publish_kill(&self, id: &str) -> Result<(), GatewayError>;
}
