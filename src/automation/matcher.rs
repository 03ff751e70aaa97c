//! Trigger matcher: picks the single flow or rule that answers a message.
//!
//! Candidates come from an [`AutomationSnapshot`] loaded once per inbound
//! event. They are ordered by ascending priority, then by trigger specificity,
//! then by creation time; the first one whose trigger matches wins and
//! evaluation stops. No match is a normal outcome.

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::automation::rules::AutomationRule;
use crate::automation::trigger::{TriggerConfig, TriggerKind};
use crate::automation::window::AccountSettings;
use crate::error::{AutomationError, DatabaseError};
use crate::flows::FlowDefinition;
use crate::store::Database;

/// Knowledge-base answer for an FAQ trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaqAnswer {
    pub question: String,
    pub answer: String,
    /// Similarity in 0.0..=1.0.
    pub score: f32,
}

/// FAQ lookup collaborator.
#[async_trait]
pub trait KnowledgeBase: Send + Sync {
    async fn lookup(
        &self,
        workspace_id: &str,
        account_id: &str,
        question: &str,
    ) -> Result<Option<FaqAnswer>, AutomationError>;
}

/// Everything the automation layer needs to know about one account, fetched
/// once per invocation and never cached across events.
#[derive(Debug, Clone)]
pub struct AutomationSnapshot {
    pub workspace_id: String,
    pub account_id: String,
    pub flows: Vec<FlowDefinition>,
    pub rules: Vec<AutomationRule>,
    pub settings: AccountSettings,
}

impl AutomationSnapshot {
    /// Build a snapshot, keeping only active entries and dropping flows whose
    /// graph is invalid.
    pub fn new(
        workspace_id: &str,
        account_id: &str,
        flows: Vec<FlowDefinition>,
        rules: Vec<AutomationRule>,
        settings: AccountSettings,
    ) -> Self {
        let flows = flows
            .into_iter()
            .filter(|f| f.is_active())
            .filter(|f| match f.validate() {
                Ok(()) => true,
                Err(e) => {
                    warn!(flow_id = %f.id, error = %e, "Skipping invalid flow");
                    false
                }
            })
            .collect();
        let rules = rules.into_iter().filter(|r| r.is_active).collect();

        Self {
            workspace_id: workspace_id.into(),
            account_id: account_id.into(),
            flows,
            rules,
            settings,
        }
    }

    pub async fn load(
        db: &dyn Database,
        workspace_id: &str,
        account_id: &str,
    ) -> Result<Self, DatabaseError> {
        let flows = db.list_active_flows(workspace_id, account_id).await?;
        let rules = db.list_active_rules(workspace_id, account_id).await?;
        let settings = db
            .get_account_settings(workspace_id, account_id)
            .await?
            .unwrap_or_default();
        Ok(Self::new(workspace_id, account_id, flows, rules, settings))
    }

    /// An active, valid flow from this snapshot.
    pub fn flow(&self, id: Uuid) -> Option<&FlowDefinition> {
        self.flows.iter().find(|f| f.id == id)
    }

    /// All candidates in evaluation order.
    pub fn candidates(&self) -> Vec<Candidate<'_>> {
        let mut candidates: Vec<Candidate<'_>> = self
            .flows
            .iter()
            .map(Candidate::Flow)
            .chain(self.rules.iter().map(Candidate::Rule))
            .collect();
        candidates.sort_by(Candidate::precedence);
        candidates
    }
}

/// A flow or rule competing for a message.
#[derive(Debug, Clone, Copy)]
pub enum Candidate<'a> {
    Flow(&'a FlowDefinition),
    Rule(&'a AutomationRule),
}

impl<'a> Candidate<'a> {
    pub fn id(&self) -> Uuid {
        match self {
            Candidate::Flow(f) => f.id,
            Candidate::Rule(r) => r.id,
        }
    }

    pub fn name(&self) -> &'a str {
        match self {
            Candidate::Flow(f) => &f.name,
            Candidate::Rule(r) => &r.name,
        }
    }

    pub fn priority(&self) -> i64 {
        match self {
            Candidate::Flow(f) => f.priority,
            Candidate::Rule(r) => r.priority,
        }
    }

    pub fn trigger(&self) -> TriggerKind {
        match self {
            Candidate::Flow(f) => f.trigger,
            Candidate::Rule(r) => r.trigger,
        }
    }

    pub fn trigger_config(&self) -> &'a TriggerConfig {
        match self {
            Candidate::Flow(f) => &f.trigger_config,
            Candidate::Rule(r) => &r.trigger_config,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Candidate::Flow(f) => f.created_at,
            Candidate::Rule(r) => r.created_at,
        }
    }

    fn kind_order(&self) -> u8 {
        match self {
            Candidate::Flow(_) => 0,
            Candidate::Rule(_) => 1,
        }
    }

    /// Priority first, trigger specificity as tie-break, then creation order.
    pub fn precedence(a: &Self, b: &Self) -> Ordering {
        a.priority()
            .cmp(&b.priority())
            .then_with(|| a.trigger().semantic_rank().cmp(&b.trigger().semantic_rank()))
            .then_with(|| a.created_at().cmp(&b.created_at()))
            .then_with(|| a.kind_order().cmp(&b.kind_order()))
    }
}

/// The winning candidate and what matched.
#[derive(Debug, Clone)]
pub struct MatchResult<'a> {
    pub candidate: Candidate<'a>,
    pub matched_keyword: Option<String>,
    pub faq: Option<FaqAnswer>,
}

impl<'a> MatchResult<'a> {
    fn plain(candidate: Candidate<'a>) -> Self {
        Self {
            candidate,
            matched_keyword: None,
            faq: None,
        }
    }

    fn keyword(candidate: Candidate<'a>, keyword: String) -> Self {
        Self {
            candidate,
            matched_keyword: Some(keyword),
            faq: None,
        }
    }
}

/// Evaluates trigger conditions against an inbound message.
pub struct TriggerMatcher {
    knowledge_base: Option<Arc<dyn KnowledgeBase>>,
    default_faq_threshold: f32,
}

impl TriggerMatcher {
    pub fn new(default_faq_threshold: f32) -> Self {
        Self {
            knowledge_base: None,
            default_faq_threshold,
        }
    }

    pub fn with_knowledge_base(mut self, kb: Arc<dyn KnowledgeBase>) -> Self {
        self.knowledge_base = Some(kb);
        self
    }

    /// Select the first candidate, in precedence order, whose trigger matches.
    pub async fn select<'a>(
        &self,
        snapshot: &'a AutomationSnapshot,
        text: &str,
        is_first_message: bool,
        now: DateTime<Utc>,
    ) -> Option<MatchResult<'a>> {
        for candidate in snapshot.candidates() {
            if let Some(result) = self
                .evaluate(snapshot, candidate, text, is_first_message, now)
                .await
            {
                debug!(
                    candidate_id = %candidate.id(),
                    name = %candidate.name(),
                    trigger = %candidate.trigger(),
                    priority = candidate.priority(),
                    matched_keyword = ?result.matched_keyword,
                    "Trigger matched"
                );
                return Some(result);
            }
        }
        debug!(workspace_id = %snapshot.workspace_id, "No trigger matched");
        None
    }

    async fn evaluate<'a>(
        &self,
        snapshot: &AutomationSnapshot,
        candidate: Candidate<'a>,
        text: &str,
        is_first_message: bool,
        now: DateTime<Utc>,
    ) -> Option<MatchResult<'a>> {
        let config = candidate.trigger_config();
        match candidate.trigger() {
            TriggerKind::Welcome => is_first_message.then(|| MatchResult::plain(candidate)),
            TriggerKind::Away => (!snapshot.settings.within_business_hours(now))
                .then(|| MatchResult::plain(candidate)),
            TriggerKind::Command => config
                .match_command(text)
                .map(|k| MatchResult::keyword(candidate, k)),
            TriggerKind::ExactMatch => config
                .match_exact(text)
                .map(|k| MatchResult::keyword(candidate, k)),
            TriggerKind::Keyword => config
                .match_keyword(text)
                .map(|k| MatchResult::keyword(candidate, k)),
            TriggerKind::Faq => {
                let threshold = config.threshold.unwrap_or(self.default_faq_threshold);
                self.lookup_faq(snapshot, text, threshold)
                    .await
                    .map(|answer| MatchResult {
                        candidate,
                        matched_keyword: None,
                        faq: Some(answer),
                    })
            }
            TriggerKind::AnyMessage | TriggerKind::AiChat | TriggerKind::Default => {
                Some(MatchResult::plain(candidate))
            }
        }
    }

    /// Knowledge-base failures skip the candidate rather than the message.
    async fn lookup_faq(
        &self,
        snapshot: &AutomationSnapshot,
        text: &str,
        threshold: f32,
    ) -> Option<FaqAnswer> {
        let kb = self.knowledge_base.as_ref()?;
        if text.trim().is_empty() {
            return None;
        }
        match kb
            .lookup(&snapshot.workspace_id, &snapshot.account_id, text)
            .await
        {
            Ok(Some(answer)) if answer.score >= threshold => Some(answer),
            Ok(_) => None,
            Err(e) => {
                warn!(workspace_id = %snapshot.workspace_id, error = %e, "Knowledge base lookup failed");
                None
            }
        }
    }
}
