//! Load/mutate/save access to the per-conversation [`SessionMemory`].
//!
//! Every helper is a read-modify-write against the backing repository. The
//! store does not lock; callers serialize access per conversation.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use parley_core::domain::cart::{Cart, CartItem};
use parley_core::domain::catalog::{ProductId, VariantId};
use parley_core::domain::confirmation::PendingConfirmation;
use parley_core::domain::session::{CustomerId, SessionId, SessionMemory, WorkspaceId};
use parley_core::flows::ConversationState;

use crate::repositories::{RepositoryError, SessionRepository};

pub const DEFAULT_SESSION_TTL_HOURS: i64 = 24;

#[derive(Debug, Error)]
pub enum SessionStoreError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("session `{0}` not found")]
    NotFound(String),
}

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Clone)]
pub struct SessionStore {
    repository: Arc<dyn SessionRepository>,
    ttl: Duration,
    clock: Clock,
}

impl SessionStore {
    pub fn new(repository: Arc<dyn SessionRepository>) -> Self {
        Self {
            repository,
            ttl: Duration::hours(DEFAULT_SESSION_TTL_HOURS),
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Expired sessions read as absent and are removed.
    pub async fn get(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<SessionMemory>, SessionStoreError> {
        let Some(stored) = self.repository.find(session_id).await? else {
            return Ok(None);
        };

        if stored.expires_at <= self.now() {
            tracing::debug!(
                event_name = "session.expired",
                session_id = %session_id.0,
                "session expired; discarding"
            );
            self.repository.delete(session_id).await?;
            return Ok(None);
        }

        Ok(Some(stored.memory))
    }

    pub async fn init(
        &self,
        session_id: SessionId,
        workspace_id: WorkspaceId,
        customer_id: Option<CustomerId>,
    ) -> Result<SessionMemory, SessionStoreError> {
        let mut memory = SessionMemory::new(session_id, workspace_id, customer_id, self.now());
        self.save(&mut memory).await?;
        tracing::info!(
            event_name = "session.initialized",
            session_id = %memory.session_id.0,
            workspace_id = %memory.workspace_id.0,
            "session initialized"
        );
        Ok(memory)
    }

    /// Loads the session, creating it when absent or expired. A session bound
    /// to another customer is reset.
    pub async fn get_or_init(
        &self,
        session_id: &SessionId,
        workspace_id: &WorkspaceId,
        customer_id: Option<&CustomerId>,
    ) -> Result<SessionMemory, SessionStoreError> {
        match self.get(session_id).await? {
            Some(memory) => {
                let reassigned = match (&memory.customer_id, customer_id) {
                    (Some(current), Some(incoming)) => current != incoming,
                    _ => false,
                };
                if reassigned {
                    return self
                        .reset(session_id.clone(), workspace_id.clone(), customer_id.cloned())
                        .await;
                }
                Ok(memory)
            }
            None => {
                self.init(session_id.clone(), workspace_id.clone(), customer_id.cloned()).await
            }
        }
    }

    /// Overwrites the aggregate and refreshes its TTL.
    pub async fn save(&self, memory: &mut SessionMemory) -> Result<(), SessionStoreError> {
        let now = self.now();
        memory.touch(now);
        self.repository.save(memory, now + self.ttl).await?;
        Ok(())
    }

    /// Applies `state` through the state machine; returns whether it moved.
    pub async fn update_state(
        &self,
        session_id: &SessionId,
        state: ConversationState,
    ) -> Result<bool, SessionStoreError> {
        let mut memory = self.require(session_id).await?;
        let applied = memory.transition(state);
        if applied {
            self.save(&mut memory).await?;
        }
        Ok(applied)
    }

    pub async fn add_item(
        &self,
        session_id: &SessionId,
        item: CartItem,
    ) -> Result<Cart, SessionStoreError> {
        let mut memory = self.require(session_id).await?;
        memory.cart_mut().add_item(item);
        self.save(&mut memory).await?;
        Ok(memory.cart())
    }

    /// Quantity `<= 0` removes the line. Returns whether the line existed.
    pub async fn set_quantity(
        &self,
        session_id: &SessionId,
        product_id: &ProductId,
        variant_id: Option<&VariantId>,
        quantity: i64,
    ) -> Result<bool, SessionStoreError> {
        let mut memory = self.require(session_id).await?;
        let changed = memory.cart_mut().set_quantity(product_id, variant_id, quantity);
        if changed {
            self.save(&mut memory).await?;
        }
        Ok(changed)
    }

    pub async fn clear_cart(&self, session_id: &SessionId) -> Result<(), SessionStoreError> {
        let mut memory = self.require(session_id).await?;
        memory.cart = None;
        self.save(&mut memory).await
    }

    pub async fn set_pending(
        &self,
        session_id: &SessionId,
        pending: PendingConfirmation,
    ) -> Result<(), SessionStoreError> {
        let mut memory = self.require(session_id).await?;
        memory.pending_confirmation = Some(pending);
        self.save(&mut memory).await
    }

    /// Expired proposals are cleared and read as absent.
    pub async fn get_pending(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<PendingConfirmation>, SessionStoreError> {
        let mut memory = self.require(session_id).await?;
        match memory.pending_confirmation.clone() {
            Some(pending) if pending.is_expired(self.now()) => {
                tracing::info!(
                    event_name = "confirmation.expired",
                    session_id = %session_id.0,
                    tool_name = %pending.tool_name,
                    "pending confirmation expired"
                );
                memory.pending_confirmation = None;
                self.save(&mut memory).await?;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    pub async fn clear_pending(&self, session_id: &SessionId) -> Result<(), SessionStoreError> {
        let mut memory = self.require(session_id).await?;
        if memory.pending_confirmation.take().is_some() {
            self.save(&mut memory).await?;
        }
        Ok(())
    }

    /// Replaces the session with a fresh IDLE aggregate, e.g. when the
    /// conversation is reassigned to a different customer.
    pub async fn reset(
        &self,
        session_id: SessionId,
        workspace_id: WorkspaceId,
        customer_id: Option<CustomerId>,
    ) -> Result<SessionMemory, SessionStoreError> {
        tracing::info!(
            event_name = "session.reset",
            session_id = %session_id.0,
            "session reset"
        );
        self.repository.delete(&session_id).await?;
        self.init(session_id, workspace_id, customer_id).await
    }

    /// Operator release out of HANDOFF. Returns `false` when the session was
    /// not in handoff.
    pub async fn release_handoff(&self, session_id: &SessionId) -> Result<bool, SessionStoreError> {
        let Some(mut memory) = self.get(session_id).await? else {
            return Ok(false);
        };
        if !memory.is_handoff() {
            return Ok(false);
        }
        memory.pending_confirmation = None;
        memory.context = Default::default();
        let released = memory.transition(ConversationState::Idle);
        self.save(&mut memory).await?;
        Ok(released)
    }

    async fn require(&self, session_id: &SessionId) -> Result<SessionMemory, SessionStoreError> {
        self.get(session_id).await?.ok_or_else(|| SessionStoreError::NotFound(session_id.0.clone()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use chrono::{DateTime, Duration, Utc};
    use rust_decimal::Decimal;
    use serde_json::json;

    use parley_core::domain::cart::CartItem;
    use parley_core::domain::catalog::ProductId;
    use parley_core::domain::confirmation::PendingConfirmation;
    use parley_core::domain::session::{CustomerId, SessionId, WorkspaceId};
    use parley_core::flows::ConversationState;

    use super::{SessionStore, SessionStoreError};
    use crate::repositories::InMemorySessionRepository;

    struct TestClock(Arc<Mutex<DateTime<Utc>>>);

    impl TestClock {
        fn start() -> Self {
            Self(Arc::new(Mutex::new(
                DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z")
                    .expect("valid rfc3339")
                    .with_timezone(&Utc),
            )))
        }

        fn advance(&self, by: Duration) {
            let mut now = self.0.lock().expect("clock lock");
            *now += by;
        }

        fn store(&self) -> SessionStore {
            let handle = Arc::clone(&self.0);
            SessionStore::new(Arc::new(InMemorySessionRepository::default()))
                .with_ttl(Duration::hours(1))
                .with_clock(Arc::new(move || *handle.lock().expect("clock lock")))
        }
    }

    fn session() -> SessionId {
        SessionId("ws-1:sms:+1".to_string())
    }

    fn workspace() -> WorkspaceId {
        WorkspaceId("ws-1".to_string())
    }

    fn soda(quantity: u32) -> CartItem {
        CartItem::new(ProductId("soda".to_string()), None, "Soda", quantity, Decimal::new(450, 2))
    }

    #[tokio::test]
    async fn init_starts_idle_with_empty_cart() {
        let clock = TestClock::start();
        let store = clock.store();

        let memory = store.init(session(), workspace(), None).await.expect("init");
        assert_eq!(memory.state, ConversationState::Idle);
        assert!(memory.cart.is_none());
        assert!(memory.pending_confirmation.is_none());

        assert_eq!(store.get(&session()).await.expect("get"), Some(memory));
    }

    #[tokio::test]
    async fn expired_session_reads_as_absent_and_saves_refresh_ttl() {
        let clock = TestClock::start();
        let store = clock.store();
        store.init(session(), workspace(), None).await.expect("init");

        clock.advance(Duration::minutes(50));
        store.add_item(&session(), soda(1)).await.expect("add refreshes ttl");

        clock.advance(Duration::minutes(50));
        assert!(store.get(&session()).await.expect("get").is_some());

        clock.advance(Duration::minutes(61));
        assert!(store.get(&session()).await.expect("get").is_none());
        assert!(matches!(
            store.add_item(&session(), soda(1)).await,
            Err(SessionStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn cart_helpers_merge_update_and_clear() {
        let clock = TestClock::start();
        let store = clock.store();
        store.init(session(), workspace(), None).await.expect("init");

        store.add_item(&session(), soda(2)).await.expect("add");
        let cart = store.add_item(&session(), soda(1)).await.expect("merge");
        assert_eq!(cart.items.len(), 1);
        assert_eq!(cart.items[0].quantity, 3);
        assert_eq!(cart.total, Decimal::new(1350, 2));

        let soda_id = ProductId("soda".to_string());
        assert!(store.set_quantity(&session(), &soda_id, None, 0).await.expect("remove"));
        let memory = store.get(&session()).await.expect("get").expect("present");
        assert!(!memory.has_items());

        store.add_item(&session(), soda(1)).await.expect("add");
        store.clear_cart(&session()).await.expect("clear");
        let memory = store.get(&session()).await.expect("get").expect("present");
        assert!(memory.cart.is_none());
    }

    #[tokio::test]
    async fn update_state_goes_through_the_state_machine() {
        let clock = TestClock::start();
        let store = clock.store();
        store.init(session(), workspace(), None).await.expect("init");

        assert!(!store.update_state(&session(), ConversationState::Executing).await.expect("bad"));
        assert!(store
            .update_state(&session(), ConversationState::CollectingOrder)
            .await
            .expect("good"));

        let memory = store.get(&session()).await.expect("get").expect("present");
        assert_eq!(memory.state, ConversationState::CollectingOrder);
        assert_eq!(memory.state_history.len(), 1);
    }

    #[tokio::test]
    async fn pending_confirmation_expires_after_its_ttl() {
        let clock = TestClock::start();
        let store = clock.store();
        let memory = store.init(session(), workspace(), None).await.expect("init");

        let now = memory.created_at;
        store
            .set_pending(
                &session(),
                PendingConfirmation {
                    tool_name: "cancel_order".to_string(),
                    tool_input: json!({"order_id": "ORD-7"}),
                    message: "Cancel order ORD-7?".to_string(),
                    created_at: now,
                    expires_at: now + Duration::minutes(15),
                },
            )
            .await
            .expect("set pending");

        clock.advance(Duration::minutes(14));
        assert!(store.get_pending(&session()).await.expect("pending").is_some());

        clock.advance(Duration::minutes(2));
        assert!(store.get_pending(&session()).await.expect("pending").is_none());
        let memory = store.get(&session()).await.expect("get").expect("present");
        assert!(memory.pending_confirmation.is_none());
    }

    #[tokio::test]
    async fn customer_reassignment_resets_the_session() {
        let clock = TestClock::start();
        let store = clock.store();
        let alice = CustomerId("alice".to_string());
        let bob = CustomerId("bob".to_string());

        store.init(session(), workspace(), Some(alice.clone())).await.expect("init");
        store.add_item(&session(), soda(2)).await.expect("add");

        let same =
            store.get_or_init(&session(), &workspace(), Some(&alice)).await.expect("same customer");
        assert!(same.has_items());

        let reset =
            store.get_or_init(&session(), &workspace(), Some(&bob)).await.expect("reassigned");
        assert_eq!(reset.customer_id, Some(bob));
        assert!(!reset.has_items());
    }

    #[tokio::test]
    async fn release_handoff_returns_to_idle() {
        let clock = TestClock::start();
        let store = clock.store();
        store.init(session(), workspace(), None).await.expect("init");

        assert!(!store.release_handoff(&session()).await.expect("not in handoff"));

        store.update_state(&session(), ConversationState::Handoff).await.expect("handoff");
        assert!(!store
            .update_state(&session(), ConversationState::CollectingOrder)
            .await
            .expect("handoff is sticky"));

        assert!(store.release_handoff(&session()).await.expect("release"));
        let memory = store.get(&session()).await.expect("get").expect("present");
        assert_eq!(memory.state, ConversationState::Idle);
    }
}
