//! End-to-end tests for the automation orchestrator.
//!
//! Each test builds an in-memory database, a recording sender and a manual
//! clock, seeds flows/rules the way the flow builder would, and drives the
//! orchestrator with inbound events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;

use autoflow::automation::ai::{AiRequest, AiResponder};
use autoflow::automation::delivery::{DeliveryReceipt, MessageSender, OutboundMessage, SendIntent};
use autoflow::automation::executor::PassStop;
use autoflow::automation::matcher::{FaqAnswer, KnowledgeBase};
use autoflow::automation::rules::{AutomationRule, RuleResponse};
use autoflow::automation::scheduler::resume_due_delays;
use autoflow::automation::trigger::{MatchMode, TriggerConfig, TriggerKind};
use autoflow::automation::window::AccountSettings;
use autoflow::automation::{AutomationOutcome, Clock, InboundEvent, ManualClock, Orchestrator};
use autoflow::config::AutomationConfig;
use autoflow::error::{AutomationError, DeliveryError};
use autoflow::flows::{ButtonOption, Edge, FlowDefinition, FlowStatus, Node};
use autoflow::store::{Database, LibSqlBackend};

const PHONE: &str = "+5511999990000";

// ── Stubs ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct RecordingSender {
    sent: Mutex<Vec<SendIntent>>,
    failing: AtomicBool,
}

impl RecordingSender {
    fn sent(&self) -> Vec<SendIntent> {
        self.sent.lock().unwrap().clone()
    }

    fn texts(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|i| match i.message {
                OutboundMessage::Text { body } => Some(body),
                OutboundMessage::Buttons { body, .. } => Some(body),
                _ => None,
            })
            .collect()
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageSender for RecordingSender {
    async fn send(&self, intent: &SendIntent) -> Result<DeliveryReceipt, DeliveryError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DeliveryError::Rejected {
                status: 503,
                reason: "provider unavailable".into(),
            });
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push(intent.clone());
        Ok(DeliveryReceipt {
            provider_message_id: Some(format!("wamid.{}", sent.len())),
        })
    }
}

struct StubKb;

#[async_trait]
impl KnowledgeBase for StubKb {
    async fn lookup(
        &self,
        _workspace_id: &str,
        _account_id: &str,
        question: &str,
    ) -> Result<Option<FaqAnswer>, AutomationError> {
        if question.contains("opening hours") {
            Ok(Some(FaqAnswer {
                question: "When are you open?".into(),
                answer: "We open at 9am.".into(),
                score: 0.92,
            }))
        } else {
            Ok(None)
        }
    }
}

struct StubAi;

#[async_trait]
impl AiResponder for StubAi {
    async fn respond(&self, request: &AiRequest) -> Result<Option<String>, AutomationError> {
        Ok(Some(format!("AI: {}", request.message)))
    }
}

// ── Harness ─────────────────────────────────────────────────────────────

struct Harness {
    db: Arc<dyn Database>,
    orchestrator: Arc<Orchestrator>,
    sender: Arc<RecordingSender>,
    clock: Arc<ManualClock>,
}

fn t0() -> DateTime<Utc> {
    // A Monday, 12:00 UTC.
    DateTime::parse_from_rfc3339("2026-03-02T12:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

async fn harness_with(configure: impl FnOnce(Orchestrator) -> Orchestrator) -> Harness {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let sender = Arc::new(RecordingSender::default());
    let clock = Arc::new(ManualClock::new(t0()));
    let orchestrator = Orchestrator::new(db.clone(), sender.clone(), &AutomationConfig::default())
        .with_clock(clock.clone());
    Harness {
        db,
        orchestrator: Arc::new(configure(orchestrator)),
        sender,
        clock,
    }
}

async fn harness() -> Harness {
    harness_with(|o| o).await
}

impl Harness {
    fn event(&self, text: &str) -> InboundEvent {
        self.event_from(PHONE, text)
    }

    fn event_from(&self, phone: &str, text: &str) -> InboundEvent {
        InboundEvent {
            workspace_id: "ws".into(),
            account_id: "acc".into(),
            conversation_id: format!("conv-{phone}"),
            phone_number: phone.into(),
            text: text.into(),
            is_first_message: false,
            is_button_reply: false,
            button_payload: None,
            message_id: Some(format!("wamid.in.{text}")),
            received_at: self.clock.now(),
        }
    }

    fn click(&self, button_id: &str, title: &str) -> InboundEvent {
        InboundEvent {
            is_button_reply: true,
            button_payload: Some(button_id.into()),
            ..self.event(title)
        }
    }

    async fn send(&self, event: InboundEvent) -> AutomationOutcome {
        self.orchestrator.handle_inbound(&event).await
    }

    async fn active_count(&self) -> u64 {
        self.db.count_active_states("ws", PHONE).await.unwrap()
    }
}

fn keyword(words: &[&str]) -> TriggerConfig {
    TriggerConfig::keywords(words.iter().copied(), MatchMode::Contains)
}

fn single_message_flow(name: &str, trigger: TriggerKind, text: &str) -> FlowDefinition {
    FlowDefinition::new("ws", "acc", name, trigger).with_graph(
        vec![Node::trigger("start"), Node::message("reply", text)],
        vec![Edge::new("start", "reply")],
    )
}

fn menu_flow() -> FlowDefinition {
    FlowDefinition::new("ws", "acc", "Menu", TriggerKind::Keyword)
        .with_trigger_config(keyword(&["menu"]))
        .with_graph(
            vec![
                Node::trigger("start"),
                Node::buttons(
                    "menu",
                    "How can we help?",
                    vec![ButtonOption::new("a", "Sales"), ButtonOption::new("b", "Support")],
                ),
                Node::message("n1", "Sales here"),
                Node::message("n2", "Support here"),
                Node::end("done", Some("Bye")),
            ],
            vec![
                Edge::new("start", "menu"),
                Edge::from_button("menu", "a", "n1"),
                Edge::from_button("menu", "b", "n2"),
                Edge::new("n1", "done"),
                Edge::new("n2", "done"),
            ],
        )
}

fn delay_flow(seconds: u64) -> FlowDefinition {
    FlowDefinition::new("ws", "acc", "Follow-up", TriggerKind::Keyword)
        .with_trigger_config(keyword(&["later"]))
        .with_graph(
            vec![
                Node::trigger("start"),
                Node::delay("wait", seconds),
                Node::message("after", "done waiting"),
            ],
            vec![Edge::new("start", "wait"), Edge::new("wait", "after")],
        )
}

fn signup_flow() -> FlowDefinition {
    FlowDefinition::new("ws", "acc", "Signup", TriggerKind::Keyword)
        .with_trigger_config(keyword(&["signup"]))
        .with_graph(
            vec![
                Node::trigger("start"),
                Node::subflow("form", "signup_form"),
                Node::end("thanks", Some("Thanks {{name}}!")),
            ],
            vec![Edge::new("start", "form"), Edge::new("form", "thanks")],
        )
}

fn text_rule(name: &str, trigger: TriggerKind, text: &str) -> AutomationRule {
    AutomationRule::new(
        "ws",
        "acc",
        name,
        trigger,
        RuleResponse::Text { text: text.into() },
    )
}

// ── Scenario A: welcome vs keyword ──────────────────────────────────────

async fn first_hi_winner(welcome_priority: i64, keyword_priority: i64) -> (Harness, String) {
    let h = harness().await;
    let welcome = single_message_flow("Welcome", TriggerKind::Welcome, "Welcome aboard")
        .with_priority(welcome_priority);
    let greeting = single_message_flow("Greeting", TriggerKind::Keyword, "Hi to you too")
        .with_trigger_config(keyword(&["hi"]))
        .with_priority(keyword_priority);
    h.db.upsert_flow(&greeting).await.unwrap();
    h.db.upsert_flow(&welcome).await.unwrap();

    let outcome = h
        .send(InboundEvent {
            is_first_message: true,
            ..h.event("hi")
        })
        .await;
    let AutomationOutcome::FlowStarted { flow_id, .. } = outcome else {
        panic!("expected a flow to start, got {outcome:?}");
    };
    let winner = if flow_id == welcome.id {
        "welcome"
    } else if flow_id == greeting.id {
        "keyword"
    } else {
        "unknown"
    };
    (h, winner.to_string())
}

#[tokio::test]
async fn scenario_a_welcome_wins_with_lower_priority_number() {
    let (h, winner) = first_hi_winner(10, 20).await;
    assert_eq!(winner, "welcome");
    assert_eq!(h.sender.texts(), vec!["Welcome aboard".to_string()]);
}

#[tokio::test]
async fn scenario_a_keyword_wins_with_lower_priority_number() {
    let (h, winner) = first_hi_winner(20, 10).await;
    assert_eq!(winner, "keyword");
    assert_eq!(h.sender.texts(), vec!["Hi to you too".to_string()]);
}

// ── Scenario B: button routing ──────────────────────────────────────────

#[tokio::test]
async fn scenario_b_button_a_always_routes_to_n1() {
    for _ in 0..3 {
        let h = harness().await;
        h.db.upsert_flow(&menu_flow()).await.unwrap();

        let started = h.send(h.event("menu")).await;
        assert!(matches!(
            started,
            AutomationOutcome::FlowStarted { ref pass, .. }
                if pass.stop == PassStop::Waiting { node_id: "menu".into() }
        ));

        let advanced = h.send(h.click("a", "Sales")).await;
        assert!(matches!(advanced, AutomationOutcome::FlowAdvanced { .. }));
        let texts = h.sender.texts();
        assert!(texts.contains(&"Sales here".to_string()));
        assert!(!texts.contains(&"Support here".to_string()));
        assert_eq!(texts.last().map(String::as_str), Some("Bye"));
        assert_eq!(h.active_count().await, 0);
    }
}

#[tokio::test]
async fn free_text_matching_a_title_counts_as_click() {
    let h = harness().await;
    h.db.upsert_flow(&menu_flow()).await.unwrap();
    h.send(h.event("menu")).await;

    h.send(h.event("  support ")).await;
    assert!(h.sender.texts().contains(&"Support here".to_string()));
}

#[tokio::test]
async fn unmatched_click_completes_state_and_sends_recovery() {
    let h = harness().await;
    h.db.upsert_flow(&menu_flow()).await.unwrap();
    h.db
        .set_account_settings(
            "ws",
            "acc",
            &AccountSettings {
                recovery_message: Some("Let's start over.".into()),
                ..AccountSettings::default()
            },
        )
        .await
        .unwrap();

    let AutomationOutcome::FlowStarted { state_id, .. } = h.send(h.event("menu")).await else {
        panic!("expected flow start");
    };
    let outcome = h.send(h.click("zzz", "Unknown")).await;
    assert_eq!(
        outcome,
        AutomationOutcome::Recovered {
            state_id,
            node_id: "menu".into()
        }
    );

    let state = h.db.get_state(state_id).await.unwrap().unwrap();
    assert!(!state.is_active);
    assert!(state.completed_at.is_some());
    assert_eq!(h.sender.texts().last().map(String::as_str), Some("Let's start over."));
}

// ── Scenario C: delays ──────────────────────────────────────────────────

#[tokio::test]
async fn scenario_c_delay_sets_resume_at_and_sends_nothing() {
    let h = harness().await;
    h.db.upsert_flow(&delay_flow(5)).await.unwrap();

    let outcome = h.send(h.event("later")).await;
    let AutomationOutcome::FlowStarted { state_id, pass, .. } = outcome else {
        panic!("expected flow start, got {outcome:?}");
    };
    assert_eq!(
        pass.stop,
        PassStop::Delayed {
            node_id: "wait".into(),
            resume_at: t0() + Duration::seconds(5)
        }
    );
    assert_eq!(pass.messages_sent, 0);
    assert!(h.sender.sent().is_empty());

    // Not due yet.
    h.clock.advance(Duration::seconds(4));
    assert!(matches!(
        h.orchestrator.resume(state_id).await,
        AutomationOutcome::Ignored { .. }
    ));

    // An inbound message while waiting only resets the window.
    let waiting = h.send(h.event("are you there?")).await;
    assert!(matches!(waiting, AutomationOutcome::Waiting { .. }));
    assert!(h.sender.sent().is_empty());

    h.clock.advance(Duration::seconds(1));
    assert!(matches!(
        h.orchestrator.resume(state_id).await,
        AutomationOutcome::FlowAdvanced { .. }
    ));
    assert_eq!(h.sender.texts(), vec!["done waiting".to_string()]);

    // Resuming again is a no-op.
    assert!(matches!(
        h.orchestrator.resume(state_id).await,
        AutomationOutcome::Ignored { .. }
    ));
    assert_eq!(h.sender.sent().len(), 1);
}

#[tokio::test]
async fn delay_ticker_resumes_due_states() {
    let h = harness().await;
    h.db.upsert_flow(&delay_flow(30)).await.unwrap();
    h.send(h.event("later")).await;

    assert_eq!(
        resume_due_delays(&h.orchestrator, h.db.as_ref(), h.clock.as_ref()).await,
        0
    );
    h.clock.advance(Duration::seconds(31));
    assert_eq!(
        resume_due_delays(&h.orchestrator, h.db.as_ref(), h.clock.as_ref()).await,
        1
    );
    assert_eq!(h.sender.texts(), vec!["done waiting".to_string()]);
    assert_eq!(h.active_count().await, 0);
}

// ── Scenario D: staleness ───────────────────────────────────────────────

#[tokio::test]
async fn scenario_d_stale_state_expires_before_matching() {
    let h = harness().await;
    h.db.upsert_flow(&menu_flow()).await.unwrap();
    h.db
        .upsert_rule(&text_rule("fallback", TriggerKind::AnyMessage, "Hello again"))
        .await
        .unwrap();

    let AutomationOutcome::FlowStarted { state_id, .. } = h.send(h.event("menu")).await else {
        panic!("expected flow start");
    };

    h.clock.advance(Duration::hours(25));
    let outcome = h.send(h.event("Sales")).await;

    let old = h.db.get_state(state_id).await.unwrap().unwrap();
    assert!(!old.is_active);
    assert!(old.completed_at.is_some());
    // "Sales" was not treated as a click on the expired menu.
    assert!(!h.sender.texts().contains(&"Sales here".to_string()));
    assert!(matches!(outcome, AutomationOutcome::Responded { .. }));
    assert_eq!(h.sender.texts().last().map(String::as_str), Some("Hello again"));
}

#[tokio::test]
async fn delay_longer_than_window_expires_state_on_resume() {
    let h = harness().await;
    h.db.upsert_flow(&delay_flow(30 * 3600)).await.unwrap();
    let AutomationOutcome::FlowStarted { state_id, .. } = h.send(h.event("later")).await else {
        panic!("expected flow start");
    };

    h.clock.advance(Duration::hours(31));
    assert!(matches!(
        h.orchestrator.resume(state_id).await,
        AutomationOutcome::Ignored { .. }
    ));

    let state = h.db.get_state(state_id).await.unwrap().unwrap();
    assert!(!state.is_active);
    assert!(state.completed_at.is_some());
    assert_eq!(state.current_node_id, "wait");
    assert!(h.sender.sent().is_empty());
    // The ticker has nothing left to pick up.
    assert_eq!(
        resume_due_delays(&h.orchestrator, h.db.as_ref(), h.clock.as_ref()).await,
        0
    );
}

#[tokio::test]
async fn form_completed_after_window_expires_state() {
    let h = harness().await;
    h.db.upsert_flow(&signup_flow()).await.unwrap();
    let AutomationOutcome::FlowStarted { state_id, .. } = h.send(h.event("signup")).await else {
        panic!("expected flow start");
    };

    h.clock.advance(Duration::hours(25));
    let mut fields = serde_json::Map::new();
    fields.insert("name".into(), serde_json::json!("Ana"));
    assert!(matches!(
        h.orchestrator.complete_subflow(state_id, fields).await,
        AutomationOutcome::Ignored { .. }
    ));

    let state = h.db.get_state(state_id).await.unwrap().unwrap();
    assert!(!state.is_active);
    assert!(!state.collected_variables.contains_key("name"));
    assert_eq!(h.sender.sent().len(), 1);
}

// ── Priority & rate limiting ────────────────────────────────────────────

#[tokio::test]
async fn lower_priority_number_wins_regardless_of_storage_order() {
    let h = harness().await;
    let low = text_rule("p20", TriggerKind::Keyword, "from p20")
        .with_trigger_config(keyword(&["price"]))
        .with_priority(20);
    let high = text_rule("p10", TriggerKind::Keyword, "from p10")
        .with_trigger_config(keyword(&["price"]))
        .with_priority(10);
    h.db.upsert_rule(&low).await.unwrap();
    h.db.upsert_rule(&high).await.unwrap();

    let outcome = h.send(h.event("what is the price?")).await;
    assert!(matches!(outcome, AutomationOutcome::Responded { rule_id, .. } if rule_id == high.id));
    assert_eq!(h.sender.texts(), vec!["from p10".to_string()]);
}

#[tokio::test]
async fn cooldown_blocks_at_59_and_allows_at_61() {
    let h = harness().await;
    let rule = text_rule("price", TriggerKind::Keyword, "It costs 10")
        .with_trigger_config(keyword(&["price"]))
        .with_cooldown(60);
    h.db.upsert_rule(&rule).await.unwrap();

    assert!(matches!(h.send(h.event("price")).await, AutomationOutcome::Responded { .. }));

    h.clock.advance(Duration::seconds(59));
    assert!(matches!(
        h.send(h.event("price")).await,
        AutomationOutcome::RateLimited { rule_id, .. } if rule_id == rule.id
    ));

    h.clock.advance(Duration::seconds(2));
    assert!(matches!(h.send(h.event("price")).await, AutomationOutcome::Responded { .. }));
    assert_eq!(h.sender.sent().len(), 2);

    let stored = h.db.get_rule(rule.id).await.unwrap().unwrap();
    assert_eq!(stored.trigger_count, 2);
    let log = h.db.list_rule_triggers(rule.id).await.unwrap();
    assert_eq!(log.len(), 2);
    assert!(log.iter().all(|e| e.response_success));
    assert_eq!(log[0].matched_keyword.as_deref(), Some("price"));
}

#[tokio::test]
async fn daily_cap_stops_after_max() {
    let h = harness().await;
    let rule = text_rule("promo", TriggerKind::Keyword, "Promo!")
        .with_trigger_config(keyword(&["promo"]))
        .with_daily_cap(2);
    h.db.upsert_rule(&rule).await.unwrap();

    for _ in 0..2 {
        assert!(matches!(h.send(h.event("promo")).await, AutomationOutcome::Responded { .. }));
        h.clock.advance(Duration::minutes(1));
    }
    assert!(matches!(h.send(h.event("promo")).await, AutomationOutcome::RateLimited { .. }));

    // Another conversation has its own budget.
    let other = h.send(h.event_from("+5511888880000", "promo")).await;
    assert!(matches!(other, AutomationOutcome::Responded { .. }));
}

// ── Idempotence & delivery failures ─────────────────────────────────────

#[tokio::test]
async fn delivery_failure_leaves_state_for_retry() {
    let h = harness().await;
    let flow = single_message_flow("Hello", TriggerKind::Keyword, "Hello there")
        .with_trigger_config(keyword(&["hello"]));
    h.db.upsert_flow(&flow).await.unwrap();

    h.sender.set_failing(true);
    let outcome = h.send(h.event("hello")).await;
    assert!(matches!(
        outcome,
        AutomationOutcome::Degraded { ref kind, .. } if kind == "delivery_failure"
    ));
    let state = h.db.get_active_state("ws", PHONE).await.unwrap().unwrap();
    assert_eq!(state.current_node_id, "reply");

    // Replaying the event delivers exactly once.
    h.sender.set_failing(false);
    let retried = h.send(h.event("hello")).await;
    assert!(matches!(retried, AutomationOutcome::FlowAdvanced { .. }));
    assert_eq!(h.sender.texts(), vec!["Hello there".to_string()]);
    assert_eq!(h.active_count().await, 0);
}

#[tokio::test]
async fn failed_send_after_delay_is_retried_by_resume() {
    let h = harness().await;
    h.db.upsert_flow(&delay_flow(5)).await.unwrap();
    let AutomationOutcome::FlowStarted { state_id, .. } = h.send(h.event("later")).await else {
        panic!("expected flow start");
    };

    h.clock.advance(Duration::seconds(6));
    h.sender.set_failing(true);
    let failed = h.orchestrator.resume(state_id).await;
    assert!(matches!(
        failed,
        AutomationOutcome::Degraded { ref kind, .. } if kind == "delivery_failure"
    ));
    let state = h.db.get_state(state_id).await.unwrap().unwrap();
    assert_eq!(state.current_node_id, "wait");
    assert_eq!(state.resume_at, Some(t0() + Duration::seconds(5)));

    h.sender.set_failing(false);
    assert!(matches!(
        h.orchestrator.resume(state_id).await,
        AutomationOutcome::FlowAdvanced { .. }
    ));
    assert_eq!(h.sender.texts(), vec!["done waiting".to_string()]);
    assert_eq!(h.active_count().await, 0);
}

#[tokio::test]
async fn delay_ticker_picks_up_failed_send_again() {
    let h = harness().await;
    h.db.upsert_flow(&delay_flow(5)).await.unwrap();
    h.send(h.event("later")).await;
    h.clock.advance(Duration::seconds(6));

    h.sender.set_failing(true);
    assert_eq!(
        resume_due_delays(&h.orchestrator, h.db.as_ref(), h.clock.as_ref()).await,
        0
    );
    h.sender.set_failing(false);
    assert_eq!(
        resume_due_delays(&h.orchestrator, h.db.as_ref(), h.clock.as_ref()).await,
        1
    );
    assert_eq!(h.sender.texts(), vec!["done waiting".to_string()]);
    // Nothing left for the next tick.
    assert_eq!(
        resume_due_delays(&h.orchestrator, h.db.as_ref(), h.clock.as_ref()).await,
        0
    );
    assert_eq!(h.sender.sent().len(), 1);
}

#[tokio::test]
async fn failed_send_after_form_is_retried_by_same_callback() {
    let h = harness().await;
    h.db.upsert_flow(&signup_flow()).await.unwrap();
    let AutomationOutcome::FlowStarted { state_id, .. } = h.send(h.event("signup")).await else {
        panic!("expected flow start");
    };

    let mut fields = serde_json::Map::new();
    fields.insert("name".into(), serde_json::json!("Ana"));

    h.sender.set_failing(true);
    let failed = h.orchestrator.complete_subflow(state_id, fields.clone()).await;
    assert!(matches!(
        failed,
        AutomationOutcome::Degraded { ref kind, .. } if kind == "delivery_failure"
    ));
    let state = h.db.get_state(state_id).await.unwrap().unwrap();
    assert_eq!(state.current_node_id, "form");
    assert!(state.is_active);

    h.sender.set_failing(false);
    assert!(matches!(
        h.orchestrator.complete_subflow(state_id, fields).await,
        AutomationOutcome::FlowAdvanced { .. }
    ));
    assert_eq!(h.sender.texts(), vec!["Thanks Ana!".to_string()]);
    assert_eq!(h.active_count().await, 0);
}

#[tokio::test]
async fn failed_rule_delivery_is_logged_but_not_counted() {
    let h = harness().await;
    let rule = text_rule("price", TriggerKind::Keyword, "It costs 10")
        .with_trigger_config(keyword(&["price"]))
        .with_cooldown(60);
    h.db.upsert_rule(&rule).await.unwrap();

    h.sender.set_failing(true);
    assert!(matches!(h.send(h.event("price")).await, AutomationOutcome::Degraded { .. }));
    h.sender.set_failing(false);
    // The failed attempt does not start the cooldown.
    assert!(matches!(h.send(h.event("price")).await, AutomationOutcome::Responded { .. }));

    let log = h.db.list_rule_triggers(rule.id).await.unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log.iter().filter(|e| e.response_success).count(), 1);
    assert_eq!(h.db.get_rule(rule.id).await.unwrap().unwrap().trigger_count, 1);
}

#[tokio::test]
async fn replayed_click_does_not_double_send() {
    let h = harness().await;
    h.db.upsert_flow(&menu_flow()).await.unwrap();
    h.send(h.event("menu")).await;
    h.send(h.click("a", "Sales")).await;
    let sent = h.sender.sent().len();

    let replay = h.send(h.click("a", "Sales")).await;
    assert_eq!(replay, AutomationOutcome::NoMatch);
    assert_eq!(h.sender.sent().len(), sent);
}

// ── Window ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn free_form_reply_outside_window_is_refused() {
    let h = harness().await;
    h.db
        .upsert_rule(&text_rule("any", TriggerKind::AnyMessage, "hi"))
        .await
        .unwrap();

    let late = InboundEvent {
        received_at: h.clock.now() - Duration::hours(25),
        ..h.event("hello")
    };
    assert_eq!(
        h.send(late).await,
        AutomationOutcome::WindowClosed {
            phone_number: PHONE.into()
        }
    );
    assert!(h.sender.sent().is_empty());
}

#[tokio::test]
async fn template_reply_ignores_window() {
    let h = harness().await;
    let rule = AutomationRule::new(
        "ws",
        "acc",
        "reengage",
        TriggerKind::AnyMessage,
        RuleResponse::Template {
            name: "reengage_v1".into(),
            language: "pt_BR".into(),
            parameters: vec![],
        },
    );
    h.db.upsert_rule(&rule).await.unwrap();

    let late = InboundEvent {
        received_at: h.clock.now() - Duration::hours(30),
        ..h.event("hello")
    };
    assert!(matches!(h.send(late).await, AutomationOutcome::Responded { .. }));
    assert!(matches!(
        h.sender.sent()[0].message,
        OutboundMessage::Template { ref name, .. } if name == "reengage_v1"
    ));
}

// ── Collaborators ───────────────────────────────────────────────────────

#[tokio::test]
async fn faq_rule_answers_from_knowledge_base() {
    let h = harness_with(|o| o.with_knowledge_base(Arc::new(StubKb))).await;
    let rule = text_rule("faq", TriggerKind::Faq, "unused");
    h.db.upsert_rule(&rule).await.unwrap();

    let outcome = h.send(h.event("what are your opening hours?")).await;
    assert!(matches!(outcome, AutomationOutcome::Responded { .. }));
    assert_eq!(h.sender.texts(), vec!["We open at 9am.".to_string()]);

    assert_eq!(h.send(h.event("do you deliver?")).await, AutomationOutcome::NoMatch);
}

#[tokio::test]
async fn ai_rule_uses_responder() {
    let h = harness_with(|o| o.with_ai(Arc::new(StubAi))).await;
    let rule = AutomationRule::new(
        "ws",
        "acc",
        "assistant",
        TriggerKind::AiChat,
        RuleResponse::Ai { instructions: None },
    );
    h.db.upsert_rule(&rule).await.unwrap();

    assert!(matches!(h.send(h.event("tell me more")).await, AutomationOutcome::Responded { .. }));
    assert_eq!(h.sender.texts(), vec!["AI: tell me more".to_string()]);
}

#[tokio::test]
async fn ai_rule_without_responder_degrades() {
    let h = harness().await;
    let rule = AutomationRule::new(
        "ws",
        "acc",
        "assistant",
        TriggerKind::AiChat,
        RuleResponse::Ai { instructions: None },
    );
    h.db.upsert_rule(&rule).await.unwrap();

    let outcome = h.send(h.event("tell me more")).await;
    assert!(matches!(
        outcome,
        AutomationOutcome::Degraded { ref kind, .. } if kind == "collaborator"
    ));
    let log = h.db.list_rule_triggers(rule.id).await.unwrap();
    assert_eq!(log.len(), 1);
    assert!(!log[0].response_success);
}

#[tokio::test]
async fn start_flow_rule_hands_over_to_flow() {
    let h = harness().await;
    let flow = menu_flow().with_trigger_config(keyword(&["never-matches-anything"]));
    h.db.upsert_flow(&flow).await.unwrap();
    let rule = AutomationRule::new(
        "ws",
        "acc",
        "open menu",
        TriggerKind::Command,
        RuleResponse::StartFlow { flow_id: flow.id },
    )
    .with_trigger_config(TriggerConfig::command("/menu", ["/m"]));
    h.db.upsert_rule(&rule).await.unwrap();

    let outcome = h.send(h.event("/m")).await;
    assert!(matches!(outcome, AutomationOutcome::FlowStarted { flow_id, .. } if flow_id == flow.id));
    assert_eq!(h.db.get_flow(flow.id).await.unwrap().unwrap().trigger_count, 1);
}

// ── Subflow forms ───────────────────────────────────────────────────────

#[tokio::test]
async fn form_completion_merges_fields_and_advances() {
    let h = harness().await;
    h.db.upsert_flow(&signup_flow()).await.unwrap();

    let AutomationOutcome::FlowStarted { state_id, .. } = h.send(h.event("signup")).await else {
        panic!("expected flow start");
    };
    assert!(matches!(
        h.sender.sent()[0].message,
        OutboundMessage::Form { state_id: id, .. } if id == state_id
    ));

    let mut fields = serde_json::Map::new();
    fields.insert("name".into(), serde_json::json!("Ana"));
    fields.insert("age".into(), serde_json::json!(31));
    let outcome = h.orchestrator.complete_subflow(state_id, fields.clone()).await;
    assert!(matches!(outcome, AutomationOutcome::FlowAdvanced { .. }));
    assert_eq!(h.sender.texts(), vec!["Thanks Ana!".to_string()]);

    let state = h.db.get_state(state_id).await.unwrap().unwrap();
    assert_eq!(state.collected_variables["age"], "31");
    assert!(!state.is_active);

    // A second callback for the same form does nothing.
    assert!(matches!(
        h.orchestrator.complete_subflow(state_id, fields).await,
        AutomationOutcome::Ignored { .. }
    ));
}

// ── Lifecycle & concurrency ─────────────────────────────────────────────

#[tokio::test]
async fn paused_flow_releases_its_states() {
    let h = harness().await;
    let flow = menu_flow();
    h.db.upsert_flow(&flow).await.unwrap();
    h.send(h.event("menu")).await;
    assert_eq!(h.active_count().await, 1);

    h.db.set_flow_status(flow.id, FlowStatus::Paused).await.unwrap();
    assert_eq!(h.send(h.event("Sales")).await, AutomationOutcome::NoMatch);
    assert_eq!(h.active_count().await, 0);
}

#[tokio::test]
async fn concurrent_events_keep_one_active_state_per_phone() {
    let h = harness().await;
    h.db.upsert_flow(&delay_flow(600)).await.unwrap();

    let events: Vec<InboundEvent> = (0..10).map(|_| h.event("later")).collect();
    let outcomes = join_all(events.iter().map(|e| h.orchestrator.handle_inbound(e))).await;

    let started = outcomes
        .iter()
        .filter(|o| matches!(o, AutomationOutcome::FlowStarted { .. }))
        .count();
    assert_eq!(started, 1);
    assert_eq!(h.active_count().await, 1);
}

#[tokio::test]
async fn different_phones_run_independently() {
    let h = harness().await;
    h.db.upsert_flow(&delay_flow(600)).await.unwrap();

    let phones: Vec<String> = (0..5).map(|i| format!("+55110000000{i}")).collect();
    let events: Vec<InboundEvent> = phones.iter().map(|p| h.event_from(p, "later")).collect();
    let tasks = events.into_iter().map(|event| {
        let orchestrator = h.orchestrator.clone();
        tokio::spawn(async move { orchestrator.handle_inbound(&event).await })
    });
    for outcome in join_all(tasks).await {
        assert!(matches!(outcome.unwrap(), AutomationOutcome::FlowStarted { .. }));
    }
    for phone in &phones {
        assert_eq!(h.db.count_active_states("ws", phone).await.unwrap(), 1);
    }
}
