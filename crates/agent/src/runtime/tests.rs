use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};

use parley_core::domain::message::{ContentBlock, MessageRole, StoredMessage};
use parley_core::domain::reply::OutboundReply;
use parley_core::domain::session::{
    ActiveSubflow, ConversationMode, PaymentStage, SessionId, SessionMemory, WorkspaceId,
};
use parley_core::flows::ConversationState;
use parley_core::{ConfirmationGate, InMemoryAuditSink};
use parley_db::repositories::{
    InMemoryCatalogRepository, InMemoryMessageRepository, InMemorySessionRepository,
    MessageRepository,
};
use parley_db::{DemoCatalog, SessionStore};

use super::{
    Orchestrator, OrchestratorSettings, TurnError, TurnInput, TurnLease, TurnOutcome,
    UnboundedLease, APOLOGY_REPLY, ITERATION_FALLBACK_REPLY, OFFLINE_REPLY,
};
use crate::llm::{
    DisabledReasoningClient, ReasoningClient, ReasoningError, ReasoningRequest, ReasoningResponse,
    ScriptedReasoningClient, ToolDefinition,
};
use crate::tools::{Tool, ToolContext, ToolError, ToolOutcome, ToolRegistry};

const WORKSPACE: &str = "demo";
const SESSION: &str = "whatsapp:5511999990000";

/// Order-service stand-in that counts how often each call really ran.
struct FakeOrderTool {
    name: &'static str,
    risky: bool,
    response: ToolOutcome,
    executions: Arc<AtomicUsize>,
}

impl FakeOrderTool {
    fn new(name: &'static str, risky: bool, response: ToolOutcome) -> (Self, Arc<AtomicUsize>) {
        let executions = Arc::new(AtomicUsize::new(0));
        (Self { name, risky, response, executions: Arc::clone(&executions) }, executions)
    }
}

#[async_trait]
impl Tool for FakeOrderTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.to_string(),
            description: format!("fake {}", self.name),
            input_schema: json!({"type": "object"}),
        }
    }

    fn modes(&self) -> &[ConversationMode] {
        &[ConversationMode::Ordering, ConversationMode::Payment]
    }

    fn requires_confirmation(&self) -> bool {
        self.risky
    }

    async fn execute(
        &self,
        _input: Value,
        _context: &mut ToolContext<'_>,
    ) -> Result<ToolOutcome, ToolError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        Ok(self.response.clone())
    }
}

/// Answers the first call, then never answers again within any timeout.
struct StallsAfterFirstCall {
    first: Mutex<Option<ReasoningResponse>>,
}

#[async_trait]
impl ReasoningClient for StallsAfterFirstCall {
    async fn complete(
        &self,
        _request: ReasoningRequest,
    ) -> Result<ReasoningResponse, ReasoningError> {
        let first = self.first.lock().expect("script lock").take();
        match first {
            Some(response) => Ok(response),
            None => {
                tokio::time::sleep(StdDuration::from_secs(120)).await;
                Ok(ReasoningResponse::text("too late"))
            }
        }
    }
}

/// Lease that another worker has already taken over.
struct LostLease;

#[async_trait]
impl TurnLease for LostLease {
    async fn renew(&self) -> bool {
        false
    }
}

struct Harness {
    orchestrator: Orchestrator,
    messages: Arc<InMemoryMessageRepository>,
    clock: Arc<Mutex<DateTime<Utc>>>,
    cancels: Arc<AtomicUsize>,
    creates: Arc<AtomicUsize>,
    audit: Arc<InMemoryAuditSink>,
}

fn harness_with(reasoning: Arc<dyn ReasoningClient>, create_response: ToolOutcome) -> Harness {
    let workspace = WorkspaceId(WORKSPACE.to_string());
    let clock = Arc::new(Mutex::new(
        DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z")
            .expect("valid rfc3339")
            .with_timezone(&Utc),
    ));
    let handle = Arc::clone(&clock);
    let sessions = SessionStore::new(Arc::new(InMemorySessionRepository::default()))
        .with_clock(Arc::new(move || *handle.lock().expect("clock lock")));

    let mut tools = ToolRegistry::with_cart_tools();
    let (list_orders, _) = FakeOrderTool::new(
        "list_orders",
        false,
        ToolOutcome::ok(json!({
            "orders": [
                {"order_id": "ORD-7", "label": "ORD-7 (2 items)"},
                {"order_id": "ORD-8", "label": "ORD-8 (1 item)"}
            ]
        })),
    );
    let (cancel_order, cancels) = FakeOrderTool::new(
        "cancel_order",
        true,
        ToolOutcome::ok(json!({"message": "Order ORD-7 was cancelled."})),
    );
    let (create_order, creates) = FakeOrderTool::new("create_order", false, create_response);
    tools.register(list_orders);
    tools.register(cancel_order);
    tools.register(create_order);

    let audit = Arc::new(InMemoryAuditSink::default());
    let messages = Arc::new(InMemoryMessageRepository::default());
    let orchestrator = Orchestrator::new(
        sessions,
        messages.clone(),
        Arc::new(InMemoryCatalogRepository::with_products(&workspace, DemoCatalog::products())),
        reasoning,
        Arc::new(tools),
        ConfirmationGate::new().expect("gate"),
    )
    .with_audit(audit.clone());

    Harness { orchestrator, messages, clock, cancels, creates, audit }
}

fn harness(reasoning: Arc<dyn ReasoningClient>) -> Harness {
    harness_with(reasoning, ToolOutcome::ok(json!({"order_id": "ORD-100"})))
}

impl Harness {
    async fn send(&self, correlation_id: &str, text: &str) -> TurnOutcome {
        self.try_send(correlation_id, text, Arc::new(UnboundedLease)).await.expect("turn")
    }

    async fn try_send(
        &self,
        correlation_id: &str,
        text: &str,
        lease: Arc<dyn TurnLease>,
    ) -> Result<TurnOutcome, TurnError> {
        let input = TurnInput {
            session_id: SessionId(SESSION.to_string()),
            workspace_id: WorkspaceId(WORKSPACE.to_string()),
            customer_id: None,
            correlation_id: correlation_id.to_string(),
            text: text.to_string(),
        };
        self.orchestrator.process_turn_with_lease(input, lease).await
    }

    async fn stored_session(&self) -> Option<SessionMemory> {
        self.orchestrator.sessions().get(&SessionId(SESSION.to_string())).await.expect("load")
    }

    async fn history(&self) -> Vec<StoredMessage> {
        let since = *self.clock.lock().expect("clock lock") - Duration::days(1);
        self.messages
            .recent(&SessionId(SESSION.to_string()), since, 100)
            .await
            .expect("history")
    }

    async fn memory(&self) -> SessionMemory {
        self.orchestrator
            .sessions()
            .get(&SessionId(SESSION.to_string()))
            .await
            .expect("load")
            .expect("session exists")
    }

    async fn store(&self, mut memory: SessionMemory) {
        self.orchestrator.sessions().save(&mut memory).await.expect("save");
    }

    fn advance(&self, by: Duration) {
        let mut now = self.clock.lock().expect("clock lock");
        *now += by;
    }
}

fn text_of(message: &StoredMessage) -> String {
    message
        .content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn has_tool_blocks(message: &StoredMessage) -> bool {
    message.content.iter().any(|block| {
        matches!(block, ContentBlock::ToolUse { .. } | ContentBlock::ToolResult { .. })
    })
}

fn body(outcome: &TurnOutcome) -> String {
    outcome.reply.as_ref().map(|reply| reply.body().to_string()).unwrap_or_default()
}

fn is_confirm_prompt(outcome: &TurnOutcome) -> bool {
    matches!(
        &outcome.reply,
        Some(OutboundReply::QuickReplies { options, .. })
            if options.iter().map(|option| option.id.as_str()).eq(["yes", "no"])
    )
}

#[tokio::test]
async fn plain_order_list_skips_reasoning_and_asks_for_review() {
    let reasoning = Arc::new(ScriptedReasoningClient::default());
    let h = harness(reasoning.clone());

    let outcome = h.send("m-1", "2 sodas, 1 water").await;

    assert_eq!(reasoning.calls(), 0);
    assert_eq!(outcome.new_state, ConversationState::AwaitingConfirmation);
    assert!(is_confirm_prompt(&outcome));
    assert!(body(&outcome).contains("2x Soda Can 350ml"));
    assert!(body(&outcome).contains("1x Mineral Water"));
    assert_eq!(outcome.tools_invoked, vec!["add_to_cart", "add_to_cart"]);

    let cart = h.memory().await.cart();
    assert_eq!(cart.item_count(), 3);
}

#[tokio::test]
async fn checkout_yes_places_the_order_once() {
    let reasoning = Arc::new(ScriptedReasoningClient::default());
    let h = harness(reasoning.clone());

    h.send("m-1", "2 sodas, 1 water").await;
    let placed = h.send("m-2", "yes").await;

    assert_eq!(h.creates.load(Ordering::SeqCst), 1);
    assert_eq!(placed.new_state, ConversationState::Done);
    assert!(body(&placed).contains("Order ORD-100 confirmed"));
    let memory = h.memory().await;
    assert!(!memory.has_items());
    assert_eq!(h.audit.events_of_type("order.placed").len(), 1);
}

#[tokio::test]
async fn checkout_no_reopens_the_cart() {
    let reasoning = Arc::new(ScriptedReasoningClient::default());
    let h = harness(reasoning.clone());

    h.send("m-1", "2 sodas").await;
    let declined = h.send("m-2", "no").await;

    assert_eq!(h.creates.load(Ordering::SeqCst), 0);
    assert_eq!(declined.new_state, ConversationState::CollectingOrder);
    assert!(h.memory().await.has_items());
}

#[tokio::test]
async fn rejected_order_keeps_the_cart() {
    let reasoning = Arc::new(ScriptedReasoningClient::default());
    let h = harness_with(reasoning, ToolOutcome::failure("The store is closed."));

    h.send("m-1", "2 sodas").await;
    let rejected = h.send("m-2", "yes").await;

    assert_eq!(rejected.new_state, ConversationState::Idle);
    assert!(body(&rejected).contains("The store is closed."));
    assert!(h.memory().await.has_items());
}

#[tokio::test]
async fn payment_required_opens_the_payment_subflow() {
    let reasoning = Arc::new(ScriptedReasoningClient::default());
    let h = harness_with(
        reasoning,
        ToolOutcome::ok(json!({"order_id": "ORD-200", "payment_required": true})),
    );

    h.send("m-1", "1 water").await;
    let placed = h.send("m-2", "yes").await;
    assert!(body(&placed).contains("How would you like to pay?"));

    let pix = h.send("m-3", "pix").await;
    assert!(body(&pix).contains("Pix"));
    assert_eq!(
        h.memory().await.context.subflow,
        Some(ActiveSubflow::Payment {
            order_id: "ORD-200".to_string(),
            stage: PaymentStage::AwaitingProof,
        })
    );

    let proof = h.send("m-4", "[attachment:image/jpeg] receipt").await;
    assert!(body(&proof).contains("received the payment receipt"));
    assert_eq!(h.memory().await.context.subflow, None);
}

#[tokio::test]
async fn cancel_order_waits_for_explicit_yes_and_runs_once() {
    let reasoning = Arc::new(ScriptedReasoningClient::new(vec![ReasoningResponse::text(
        "Anything else I can help with?",
    )]));
    let h = harness(reasoning.clone());

    let proposed = h.send("m-1", "cancel order ORD-7").await;
    assert!(is_confirm_prompt(&proposed));
    assert!(body(&proposed).contains("Cancel order ORD-7?"));
    assert_eq!(proposed.new_state, ConversationState::AwaitingConfirmation);
    assert_eq!(h.cancels.load(Ordering::SeqCst), 0);

    let unclear = h.send("m-2", "hmm let me think").await;
    assert!(body(&unclear).contains("Cancel order ORD-7?"));
    assert_eq!(h.cancels.load(Ordering::SeqCst), 0);

    let declined = h.send("m-3", "no").await;
    assert_eq!(declined.new_state, ConversationState::Idle);
    assert_eq!(h.cancels.load(Ordering::SeqCst), 0);
    assert!(h.memory().await.pending_confirmation.is_none());

    h.send("m-4", "cancel order ORD-7").await;
    let confirmed = h.send("m-5", "yes").await;
    assert_eq!(h.cancels.load(Ordering::SeqCst), 1);
    assert_eq!(confirmed.new_state, ConversationState::Done);
    assert_eq!(body(&confirmed), "Order ORD-7 was cancelled.");

    h.send("m-6", "yes").await;
    assert_eq!(h.cancels.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn expired_proposal_is_not_executed() {
    let reasoning = Arc::new(ScriptedReasoningClient::new(vec![ReasoningResponse::text(
        "What can I do for you?",
    )]));
    let h = harness(reasoning.clone());

    h.send("m-1", "cancel order ORD-7").await;
    h.advance(Duration::minutes(20));
    let late = h.send("m-2", "yes").await;

    assert_eq!(h.cancels.load(Ordering::SeqCst), 0);
    assert_eq!(late.new_state, ConversationState::Idle);
    assert_eq!(body(&late), "What can I do for you?");
    assert_eq!(h.audit.events_of_type("confirmation.expired").len(), 1);
}

#[tokio::test]
async fn several_matching_orders_offer_a_list() {
    let reasoning = Arc::new(ScriptedReasoningClient::default());
    let h = harness(reasoning);

    let listed = h.send("m-1", "cancel my order").await;
    assert!(matches!(&listed.reply, Some(OutboundReply::List { items, .. }) if items.len() == 2));

    let picked = h.send("m-2", "2").await;
    assert!(body(&picked).contains("Cancel order ORD-8?"));
    assert!(h.memory().await.pending_confirmation.is_some());
}

#[tokio::test]
async fn ambiguous_name_asks_and_numbered_reply_selects() {
    let reasoning = Arc::new(ScriptedReasoningClient::default());
    let h = harness(reasoning.clone());

    let asked = h.send("m-1", "2 juice").await;
    assert_eq!(asked.new_state, ConversationState::NeedsDetails);
    match &asked.reply {
        Some(OutboundReply::List { items, .. }) => {
            let ids: Vec<&str> = items.iter().map(|item| item.id.as_str()).collect();
            assert_eq!(ids, vec!["juice:orange", "juice:grape"]);
        }
        other => panic!("expected a list reply, got {other:?}"),
    }

    let chosen = h.send("m-2", "2").await;
    assert_eq!(chosen.new_state, ConversationState::AwaitingConfirmation);
    assert!(body(&chosen).contains("2x Grape Juice"));
    assert_eq!(reasoning.calls(), 0);
}

#[tokio::test]
async fn shortage_offers_the_available_quantity() {
    let reasoning = Arc::new(ScriptedReasoningClient::default());
    let h = harness(reasoning);

    let offered = h.send("m-1", "5 orange juice").await;
    assert!(body(&offered).contains("We only have 3 of Orange Juice"));
    assert!(matches!(
        h.memory().await.context.subflow,
        Some(ActiveSubflow::ShortageResolution { .. })
    ));

    let accepted = h.send("m-2", "yes").await;
    assert_eq!(accepted.new_state, ConversationState::AwaitingConfirmation);
    assert!(body(&accepted).contains("3x Orange Juice"));
}

#[tokio::test]
async fn reasoning_loop_runs_tools_and_reports_denials() {
    let reasoning = Arc::new(ScriptedReasoningClient::new(vec![
        ReasoningResponse::tool_use(
            "call-1",
            "add_to_cart",
            json!({"product_id": "chips", "quantity": 2, "price": "0.01"}),
        ),
        ReasoningResponse::tool_use(
            "call-2",
            "add_to_cart",
            json!({"product_id": "chips", "quantity": 2}),
        ),
        ReasoningResponse::text("Added 2 Potato Chips. Anything else?"),
    ]));
    let h = harness(reasoning.clone());

    let outcome = h.send("m-1", "something salty for the party").await;

    assert_eq!(reasoning.calls(), 3);
    assert_eq!(body(&outcome), "Added 2 Potato Chips. Anything else?");
    assert_eq!(outcome.tools_invoked, vec!["add_to_cart"]);
    assert_eq!(outcome.new_state, ConversationState::CollectingOrder);

    let cart = h.memory().await.cart();
    assert_eq!(cart.items.len(), 1);
    assert_eq!(cart.items[0].unit_price.to_string(), "5.50");

    let requests = reasoning.requests();
    assert!(requests[0].system.contains("Potato Chips"));
    assert!(requests[0].tools.iter().any(|tool| tool.name == "add_to_cart"));
    let denial = requests[1].messages.last().expect("tool result message");
    assert!(matches!(
        denial.content.first(),
        Some(ContentBlock::ToolResult { is_error: true, content, .. })
            if content.contains("price_override_disallowed")
    ));
}

#[tokio::test]
async fn risky_tool_from_reasoning_is_proposed_not_run() {
    let reasoning = Arc::new(ScriptedReasoningClient::new(vec![ReasoningResponse::tool_use(
        "call-1",
        "cancel_order",
        json!({"order_id": "ORD-8"}),
    )]));
    let h = harness(reasoning.clone());

    let outcome = h.send("m-1", "please drop the second one from yesterday").await;

    assert_eq!(h.cancels.load(Ordering::SeqCst), 0);
    assert!(is_confirm_prompt(&outcome));
    assert!(body(&outcome).contains("Cancel order ORD-8?"));
    assert_eq!(reasoning.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn slow_reasoning_gets_an_apology_and_nothing_is_saved() {
    let reasoning = Arc::new(
        ScriptedReasoningClient::new(vec![ReasoningResponse::text("too late")])
            .with_delay(StdDuration::from_secs(60)),
    );
    let h = harness(reasoning.clone());
    let settings = OrchestratorSettings {
        reasoning_timeout: StdDuration::from_secs(5),
        ..OrchestratorSettings::default()
    };
    let h = Harness { orchestrator: h.orchestrator.with_settings(settings), ..h };

    let outcome = h.send("m-1", "what do you recommend").await;

    assert_eq!(body(&outcome), APOLOGY_REPLY);
    assert_eq!(outcome.new_state, ConversationState::Idle);
}

#[tokio::test]
async fn iteration_cap_returns_the_fallback() {
    let reasoning = Arc::new(ScriptedReasoningClient::new(vec![
        ReasoningResponse::tool_use("call-1", "view_cart", json!({})),
        ReasoningResponse::tool_use("call-2", "view_cart", json!({})),
        ReasoningResponse::tool_use("call-3", "view_cart", json!({})),
    ]));
    let h = harness(reasoning.clone());
    let settings = OrchestratorSettings { max_iterations: 2, ..OrchestratorSettings::default() };
    let h = Harness { orchestrator: h.orchestrator.with_settings(settings), ..h };

    let outcome = h.send("m-1", "show me what I have").await;

    assert_eq!(reasoning.calls(), 2);
    assert_eq!(body(&outcome), ITERATION_FALLBACK_REPLY);
}

#[tokio::test]
async fn disabled_reasoning_answers_with_the_offline_hint() {
    let h = harness(Arc::new(DisabledReasoningClient));

    let outcome = h.send("m-1", "hello there").await;

    assert_eq!(body(&outcome), OFFLINE_REPLY);
}

#[tokio::test]
async fn handoff_conversation_gets_no_automated_reply() {
    let reasoning = Arc::new(ScriptedReasoningClient::default());
    let h = harness(reasoning.clone());

    h.send("m-1", "2 sodas").await;
    let mut memory = h.memory().await;
    assert!(memory.transition(ConversationState::Handoff));
    h.store(memory).await;

    let outcome = h.send("m-2", "hello? anyone?").await;

    assert!(outcome.reply.is_none());
    assert!(outcome.is_handoff());
    assert_eq!(reasoning.calls(), 0);
}

#[tokio::test]
async fn turn_that_finds_execution_in_flight_hands_off() {
    let reasoning = Arc::new(ScriptedReasoningClient::default());
    let h = harness(reasoning);

    h.send("m-1", "2 sodas").await;
    let mut memory = h.memory().await;
    assert!(memory.transition(ConversationState::Executing));
    h.store(memory).await;

    let outcome = h.send("m-2", "yes").await;

    assert!(outcome.is_handoff());
    assert_eq!(h.creates.load(Ordering::SeqCst), 0);
    assert_eq!(h.audit.events_of_type("turn.execution_interrupted").len(), 1);
}

#[tokio::test]
async fn order_list_while_collecting_extends_the_cart() {
    let reasoning = Arc::new(ScriptedReasoningClient::default());
    let h = harness(reasoning.clone());
    let mut memory = h
        .orchestrator
        .sessions()
        .get_or_init(&SessionId(SESSION.to_string()), &WorkspaceId(WORKSPACE.to_string()), None)
        .await
        .expect("init");
    assert!(memory.transition(ConversationState::CollectingOrder));
    h.store(memory).await;

    let outcome = h.send("m-1", "2 sodas, 1 water").await;

    assert_eq!(reasoning.calls(), 0);
    assert_eq!(outcome.new_state, ConversationState::AwaitingConfirmation);
    assert!(is_confirm_prompt(&outcome));
    assert!(body(&outcome).contains("2x Soda Can 350ml"));
    assert!(body(&outcome).contains("1x Mineral Water"));
    assert_eq!(h.memory().await.cart().item_count(), 3);
}

#[tokio::test]
async fn cancel_command_during_cart_review_targets_the_order() {
    let reasoning = Arc::new(ScriptedReasoningClient::default());
    let h = harness(reasoning.clone());

    h.send("m-1", "2 sodas").await;
    let proposed = h.send("m-2", "cancel order ORD-7").await;

    assert!(is_confirm_prompt(&proposed));
    assert!(body(&proposed).contains("Cancel order ORD-7?"));
    assert_eq!(h.cancels.load(Ordering::SeqCst), 0);
    assert_eq!(h.creates.load(Ordering::SeqCst), 0);
    assert!(h.memory().await.has_items());
    assert!(h.audit.events_of_type("checkout.declined").is_empty());

    h.send("m-3", "yes").await;
    assert_eq!(h.cancels.load(Ordering::SeqCst), 1);
    assert_eq!(h.creates.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn reasoning_outage_gets_an_apology_that_stays_in_history() {
    let reasoning = Arc::new(ScriptedReasoningClient::default());
    reasoning.push_error(ReasoningError::RateLimited);
    let h = harness(reasoning.clone());

    let outcome = h.send("m-1", "hello there").await;

    assert_eq!(body(&outcome), APOLOGY_REPLY);
    assert_eq!(outcome.new_state, ConversationState::Idle);

    let history = h.history().await;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, MessageRole::User);
    assert_eq!(history[1].role, MessageRole::Assistant);
    assert_eq!(text_of(&history[1]), APOLOGY_REPLY);

    let retry = h.send("m-2", "hello again").await;
    assert_eq!(body(&retry), APOLOGY_REPLY);
}

#[tokio::test]
async fn misconfigured_reasoning_fails_the_turn() {
    let reasoning = Arc::new(ScriptedReasoningClient::default());
    reasoning.push_error(ReasoningError::Authentication("invalid x-api-key".to_string()));
    let h = harness(reasoning);

    let result = h.try_send("m-1", "hello there", Arc::new(UnboundedLease)).await;

    assert!(matches!(result, Err(TurnError::Reasoning(ReasoningError::Authentication(_)))));
}

#[tokio::test(start_paused = true)]
async fn timeout_after_a_tool_step_leaves_no_trace_of_the_step() {
    let reasoning = Arc::new(StallsAfterFirstCall {
        first: Mutex::new(Some(ReasoningResponse::tool_use(
            "call-1",
            "add_to_cart",
            json!({"product_id": "chips", "quantity": 2}),
        ))),
    });
    let h = harness(reasoning);
    let settings = OrchestratorSettings {
        reasoning_timeout: StdDuration::from_secs(5),
        ..OrchestratorSettings::default()
    };
    let h = Harness { orchestrator: h.orchestrator.with_settings(settings), ..h };

    let outcome = h.send("m-1", "something salty").await;

    assert_eq!(body(&outcome), APOLOGY_REPLY);
    assert_eq!(outcome.new_state, ConversationState::Idle);
    assert!(!h.stored_session().await.is_some_and(|memory| memory.has_items()));

    let history = h.history().await;
    assert!(history.iter().all(|message| !has_tool_blocks(message)));
    assert_eq!(history.last().map(text_of).as_deref(), Some(APOLOGY_REPLY));
}

#[tokio::test]
async fn lost_lease_abandons_the_turn_before_anything_is_saved() {
    let reasoning = Arc::new(ScriptedReasoningClient::default());
    let h = harness(reasoning);

    let result = h.try_send("m-1", "2 sodas", Arc::new(LostLease)).await;

    assert!(matches!(result, Err(TurnError::LeaseLost { checkpoint: "commit" })));
    let stored = h.stored_session().await.expect("session initialized");
    assert_eq!(stored.state, ConversationState::Idle);
    assert!(!stored.has_items());
    let history = h.history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].role, MessageRole::User);
}
