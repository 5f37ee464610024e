use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use parley_core::domain::catalog::ProductCandidate;
use parley_core::domain::conversation::{ConversationRecord, DeadLetterRecord};
use parley_core::domain::inbound::{
    ConversationKey, CorrelationId, InboundEventRecord, InboundStatus,
};
use parley_core::domain::message::StoredMessage;
use parley_core::domain::session::{SessionId, SessionMemory, WorkspaceId};

use super::{
    CatalogRepository, ConversationLockRepository, ConversationRepository, DeadLetterRepository,
    InboundEventRepository, MessageRepository, RepositoryError, SessionRepository, StoredSession,
};

#[derive(Default)]
pub struct InMemorySessionRepository {
    sessions: RwLock<HashMap<String, StoredSession>>,
}

#[async_trait::async_trait]
impl SessionRepository for InMemorySessionRepository {
    async fn find(&self, session_id: &SessionId) -> Result<Option<StoredSession>, RepositoryError> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(&session_id.0).cloned())
    }

    async fn save(
        &self,
        memory: &SessionMemory,
        expires_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(
            memory.session_id.0.clone(),
            StoredSession { memory: memory.clone(), expires_at },
        );
        Ok(())
    }

    async fn delete(&self, session_id: &SessionId) -> Result<(), RepositoryError> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(&session_id.0);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryInboundEventRepository {
    events: RwLock<HashMap<String, InboundEventRecord>>,
}

fn arrival_order(left: &InboundEventRecord, right: &InboundEventRecord) -> std::cmp::Ordering {
    left.received_at
        .cmp(&right.received_at)
        .then_with(|| left.correlation_id.0.cmp(&right.correlation_id.0))
}

#[async_trait::async_trait]
impl InboundEventRepository for InMemoryInboundEventRepository {
    async fn insert_if_absent(&self, record: &InboundEventRecord) -> Result<bool, RepositoryError> {
        let mut events = self.events.write().await;
        if events.contains_key(&record.correlation_id.0) {
            return Ok(false);
        }
        events.insert(record.correlation_id.0.clone(), record.clone());
        Ok(true)
    }

    async fn find(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<Option<InboundEventRecord>, RepositoryError> {
        let events = self.events.read().await;
        Ok(events.get(&correlation_id.0).cloned())
    }

    async fn save(&self, record: &InboundEventRecord) -> Result<(), RepositoryError> {
        let mut events = self.events.write().await;
        if let Some(existing) = events.get_mut(&record.correlation_id.0) {
            *existing = record.clone();
        }
        Ok(())
    }

    async fn save_if_unchanged(
        &self,
        record: &InboundEventRecord,
        expected_status: InboundStatus,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut events = self.events.write().await;
        match events.get_mut(&record.correlation_id.0) {
            Some(existing)
                if existing.status == expected_status
                    && existing.updated_at == expected_updated_at =>
            {
                *existing = record.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_claimable(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<InboundEventRecord>, RepositoryError> {
        let events = self.events.read().await;
        let mut claimable: Vec<InboundEventRecord> = events
            .values()
            .filter(|record| match record.status {
                InboundStatus::Pending | InboundStatus::Failed => record.available_at <= now,
                InboundStatus::Processing => {
                    record.claimed_at.is_some_and(|claimed_at| claimed_at <= stale_before)
                }
                InboundStatus::Completed | InboundStatus::DeadLettered => false,
            })
            .cloned()
            .collect();
        claimable.sort_by(arrival_order);
        claimable.truncate(limit);
        Ok(claimable)
    }

    async fn list_pending_for_conversation(
        &self,
        key: &ConversationKey,
        received_from: DateTime<Utc>,
        received_until: DateTime<Utc>,
    ) -> Result<Vec<InboundEventRecord>, RepositoryError> {
        let events = self.events.read().await;
        let mut pending: Vec<InboundEventRecord> = events
            .values()
            .filter(|record| {
                &record.conversation_key == key
                    && record.status == InboundStatus::Pending
                    && record.received_at >= received_from
                    && record.received_at <= received_until
            })
            .cloned()
            .collect();
        pending.sort_by(arrival_order);
        Ok(pending)
    }

    async fn oldest_open(
        &self,
        key: &ConversationKey,
    ) -> Result<Option<InboundEventRecord>, RepositoryError> {
        let events = self.events.read().await;
        Ok(events
            .values()
            .filter(|record| &record.conversation_key == key && !record.status.is_terminal())
            .min_by(|left, right| arrival_order(left, right))
            .cloned())
    }

    async fn count_by_status(&self) -> Result<Vec<(InboundStatus, u64)>, RepositoryError> {
        let events = self.events.read().await;
        let mut counts: BTreeMap<&'static str, (InboundStatus, u64)> = BTreeMap::new();
        for record in events.values() {
            counts.entry(record.status.as_str()).or_insert((record.status, 0)).1 += 1;
        }
        Ok(counts.into_values().collect())
    }
}

#[derive(Default)]
pub struct InMemoryConversationLockRepository {
    locks: RwLock<HashMap<String, (String, DateTime<Utc>)>>,
}

#[async_trait::async_trait]
impl ConversationLockRepository for InMemoryConversationLockRepository {
    async fn try_acquire(
        &self,
        key: &ConversationKey,
        owner: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut locks = self.locks.write().await;
        let available = match locks.get(&key.as_key()) {
            Some((holder, lease_end)) => *lease_end <= now || holder == owner,
            None => true,
        };
        if available {
            locks.insert(key.as_key(), (owner.to_string(), expires_at));
        }
        Ok(available)
    }

    async fn renew(
        &self,
        key: &ConversationKey,
        owner: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut locks = self.locks.write().await;
        match locks.get_mut(&key.as_key()) {
            Some((holder, lease_end)) if holder == owner => {
                *lease_end = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &ConversationKey, owner: &str) -> Result<(), RepositoryError> {
        let mut locks = self.locks.write().await;
        if locks.get(&key.as_key()).is_some_and(|(holder, _)| holder == owner) {
            locks.remove(&key.as_key());
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryConversationRepository {
    conversations: RwLock<HashMap<String, ConversationRecord>>,
}

#[async_trait::async_trait]
impl ConversationRepository for InMemoryConversationRepository {
    async fn find(
        &self,
        key: &ConversationKey,
    ) -> Result<Option<ConversationRecord>, RepositoryError> {
        let conversations = self.conversations.read().await;
        Ok(conversations.get(&key.as_key()).cloned())
    }

    async fn save(&self, record: &ConversationRecord) -> Result<(), RepositoryError> {
        let mut conversations = self.conversations.write().await;
        conversations.insert(record.conversation_key.as_key(), record.clone());
        Ok(())
    }

    async fn list_handoffs(&self) -> Result<Vec<ConversationRecord>, RepositoryError> {
        let conversations = self.conversations.read().await;
        let mut handoffs: Vec<ConversationRecord> =
            conversations.values().filter(|record| record.in_handoff()).cloned().collect();
        handoffs.sort_by(|left, right| right.updated_at.cmp(&left.updated_at));
        Ok(handoffs)
    }
}

#[derive(Default)]
pub struct InMemoryDeadLetterRepository {
    entries: RwLock<HashMap<String, DeadLetterRecord>>,
}

#[async_trait::async_trait]
impl DeadLetterRepository for InMemoryDeadLetterRepository {
    async fn insert(&self, record: &DeadLetterRecord) -> Result<(), RepositoryError> {
        let mut entries = self.entries.write().await;
        entries.insert(record.correlation_id.0.clone(), record.clone());
        Ok(())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterRecord>, RepositoryError> {
        let entries = self.entries.read().await;
        let mut listed: Vec<DeadLetterRecord> = entries.values().cloned().collect();
        listed.sort_by(|left, right| right.dead_lettered_at.cmp(&left.dead_lettered_at));
        listed.truncate(limit);
        Ok(listed)
    }

    async fn take(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<Option<DeadLetterRecord>, RepositoryError> {
        let mut entries = self.entries.write().await;
        Ok(entries.remove(&correlation_id.0))
    }
}

#[derive(Default)]
pub struct InMemoryMessageRepository {
    messages: RwLock<Vec<StoredMessage>>,
}

#[async_trait::async_trait]
impl MessageRepository for InMemoryMessageRepository {
    async fn append(&self, message: &StoredMessage) -> Result<bool, RepositoryError> {
        let mut messages = self.messages.write().await;
        if messages.iter().any(|existing| existing.external_id == message.external_id) {
            return Ok(false);
        }
        messages.push(message.clone());
        Ok(true)
    }

    async fn recent(
        &self,
        session_id: &SessionId,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, RepositoryError> {
        let messages = self.messages.read().await;
        let mut matching: Vec<StoredMessage> = messages
            .iter()
            .filter(|message| &message.session_id == session_id && message.created_at >= since)
            .cloned()
            .collect();
        matching.sort_by(|left, right| left.created_at.cmp(&right.created_at));
        let skip = matching.len().saturating_sub(limit);
        Ok(matching.split_off(skip))
    }
}

#[derive(Default)]
pub struct InMemoryCatalogRepository {
    products: RwLock<HashMap<String, Vec<ProductCandidate>>>,
}

impl InMemoryCatalogRepository {
    pub fn with_products(workspace_id: &WorkspaceId, products: Vec<ProductCandidate>) -> Self {
        let mut by_workspace = HashMap::new();
        by_workspace.insert(workspace_id.0.clone(), products);
        Self { products: RwLock::new(by_workspace) }
    }
}

#[async_trait::async_trait]
impl CatalogRepository for InMemoryCatalogRepository {
    async fn snapshot(
        &self,
        workspace_id: &WorkspaceId,
    ) -> Result<Vec<ProductCandidate>, RepositoryError> {
        let products = self.products.read().await;
        Ok(products.get(&workspace_id.0).cloned().unwrap_or_default())
    }

    async fn upsert(
        &self,
        workspace_id: &WorkspaceId,
        product: &ProductCandidate,
    ) -> Result<(), RepositoryError> {
        let mut products = self.products.write().await;
        let entries = products.entry(workspace_id.0.clone()).or_default();
        match entries.iter_mut().find(|existing| existing.same_line(product)) {
            Some(existing) => *existing = product.clone(),
            None => entries.push(product.clone()),
        }
        Ok(())
    }
}
