use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use parley_core::domain::catalog::ProductCandidate;
use parley_core::domain::conversation::{ConversationRecord, DeadLetterRecord};
use parley_core::domain::inbound::{
    ConversationKey, CorrelationId, InboundEventRecord, InboundStatus,
};
use parley_core::domain::message::StoredMessage;
use parley_core::domain::session::{SessionId, SessionMemory, WorkspaceId};

pub mod catalog;
mod codec;
pub mod conversation;
pub mod dead_letter;
pub mod inbound;
pub mod lock;
pub mod memory;
pub mod message;
pub mod session;

pub use catalog::SqlCatalogRepository;
pub use conversation::SqlConversationRepository;
pub use dead_letter::SqlDeadLetterRepository;
pub use inbound::SqlInboundEventRepository;
pub use lock::SqlConversationLockRepository;
pub use memory::{
    InMemoryCatalogRepository, InMemoryConversationLockRepository, InMemoryConversationRepository,
    InMemoryDeadLetterRepository, InMemoryInboundEventRepository, InMemoryMessageRepository,
    InMemorySessionRepository,
};
pub use message::SqlMessageRepository;
pub use session::SqlSessionRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

/// Session aggregate together with the instant it stops being readable.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredSession {
    pub memory: SessionMemory,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn find(&self, session_id: &SessionId) -> Result<Option<StoredSession>, RepositoryError>;
    async fn save(
        &self,
        memory: &SessionMemory,
        expires_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;
    async fn delete(&self, session_id: &SessionId) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait InboundEventRepository: Send + Sync {
    /// Returns `false` when the correlation id is already recorded.
    async fn insert_if_absent(&self, record: &InboundEventRecord) -> Result<bool, RepositoryError>;

    async fn find(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<Option<InboundEventRecord>, RepositoryError>;

    async fn save(&self, record: &InboundEventRecord) -> Result<(), RepositoryError>;

    /// Compare-and-set on `(status, updated_at)`; `false` means another worker
    /// moved the row first.
    async fn save_if_unchanged(
        &self,
        record: &InboundEventRecord,
        expected_status: InboundStatus,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    /// Pending or failed rows due by `now`, plus processing rows claimed
    /// before `stale_before`, oldest first.
    async fn list_claimable(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<InboundEventRecord>, RepositoryError>;

    /// Pending rows of one conversation received within the window, in
    /// arrival order.
    async fn list_pending_for_conversation(
        &self,
        key: &ConversationKey,
        received_from: DateTime<Utc>,
        received_until: DateTime<Utc>,
    ) -> Result<Vec<InboundEventRecord>, RepositoryError>;

    /// Earliest-received event of the conversation that is not completed or
    /// dead-lettered.
    async fn oldest_open(
        &self,
        key: &ConversationKey,
    ) -> Result<Option<InboundEventRecord>, RepositoryError>;

    async fn count_by_status(&self) -> Result<Vec<(InboundStatus, u64)>, RepositoryError>;
}

#[async_trait]
pub trait ConversationLockRepository: Send + Sync {
    /// Takes the lock when it is free, expired, or already held by `owner`.
    async fn try_acquire(
        &self,
        key: &ConversationKey,
        owner: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    /// Pushes the lease end out while `owner` still holds the row. `false`
    /// means the lease was released or taken over.
    async fn renew(
        &self,
        key: &ConversationKey,
        owner: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    async fn release(&self, key: &ConversationKey, owner: &str) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn find(
        &self,
        key: &ConversationKey,
    ) -> Result<Option<ConversationRecord>, RepositoryError>;
    async fn save(&self, record: &ConversationRecord) -> Result<(), RepositoryError>;
    async fn list_handoffs(&self) -> Result<Vec<ConversationRecord>, RepositoryError>;
}

#[async_trait]
pub trait DeadLetterRepository: Send + Sync {
    async fn insert(&self, record: &DeadLetterRecord) -> Result<(), RepositoryError>;
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterRecord>, RepositoryError>;
    /// Removes and returns the entry, e.g. before requeueing it.
    async fn take(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<Option<DeadLetterRecord>, RepositoryError>;
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Returns `false` when a message with the same external id exists.
    async fn append(&self, message: &StoredMessage) -> Result<bool, RepositoryError>;

    /// Most recent `limit` messages created after `since`, oldest first.
    async fn recent(
        &self,
        session_id: &SessionId,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, RepositoryError>;
}

#[async_trait]
pub trait CatalogRepository: Send + Sync {
    async fn snapshot(
        &self,
        workspace_id: &WorkspaceId,
    ) -> Result<Vec<ProductCandidate>, RepositoryError>;
    async fn upsert(
        &self,
        workspace_id: &WorkspaceId,
        product: &ProductCandidate,
    ) -> Result<(), RepositoryError>;
}
