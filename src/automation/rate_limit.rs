//! Per-rule, per-conversation rate limiting backed by the append-only
//! trigger log.
//!
//! Two independent caps, each disabled at 0: a cooldown measured from the most
//! recent successful trigger, and a daily cap counting successful triggers
//! since local midnight in the account's time zone.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tracing::{debug, info};
use uuid::Uuid;

use crate::automation::rules::{AutomationRule, RuleTriggerLogEntry};
use crate::automation::window::local_midnight;
use crate::error::DatabaseError;
use crate::store::Database;

/// Why a rule may not fire right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitHit {
    Cooldown { retry_after_secs: i64 },
    DailyCap { count: u64, max: u32 },
}

impl fmt::Display for RateLimitHit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitHit::Cooldown { retry_after_secs } => {
                write!(f, "cooldown active, retry in {retry_after_secs}s")
            }
            RateLimitHit::DailyCap { count, max } => {
                write!(f, "daily cap reached ({count}/{max})")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitOutcome {
    Allowed,
    Limited(RateLimitHit),
}

impl RateLimitOutcome {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitOutcome::Allowed)
    }
}

/// What triggered a rule, for the audit log.
#[derive(Debug, Clone, Default)]
pub struct TriggerRecord<'a> {
    pub conversation_id: &'a str,
    pub trigger_message_id: Option<&'a str>,
    pub text: &'a str,
    pub matched_keyword: Option<&'a str>,
}

pub struct RateLimiter {
    db: Arc<dyn Database>,
}

impl RateLimiter {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Check both caps for `rule` in `conversation_id`.
    pub async fn check(
        &self,
        rule: &AutomationRule,
        conversation_id: &str,
        now: DateTime<Utc>,
        tz: Tz,
    ) -> Result<RateLimitOutcome, DatabaseError> {
        if rule.cooldown_seconds > 0 {
            if let Some(last) = self.db.last_rule_trigger_at(rule.id, conversation_id).await? {
                let elapsed = now.signed_duration_since(last).num_seconds();
                let cooldown = rule.cooldown_seconds as i64;
                if elapsed < cooldown {
                    let hit = RateLimitHit::Cooldown {
                        retry_after_secs: cooldown - elapsed,
                    };
                    debug!(rule_id = %rule.id, conversation_id, %hit, "Rule rate limited");
                    return Ok(RateLimitOutcome::Limited(hit));
                }
            }
        }

        if rule.max_triggers_per_day > 0 {
            let since = local_midnight(now, tz);
            let count = self
                .db
                .count_rule_triggers_since(rule.id, conversation_id, since)
                .await?;
            if count >= u64::from(rule.max_triggers_per_day) {
                let hit = RateLimitHit::DailyCap {
                    count,
                    max: rule.max_triggers_per_day,
                };
                debug!(rule_id = %rule.id, conversation_id, %hit, "Rule rate limited");
                return Ok(RateLimitOutcome::Limited(hit));
            }
        }

        Ok(RateLimitOutcome::Allowed)
    }

    pub async fn can_trigger(
        &self,
        rule: &AutomationRule,
        conversation_id: &str,
        now: DateTime<Utc>,
        tz: Tz,
    ) -> Result<bool, DatabaseError> {
        Ok(self.check(rule, conversation_id, now, tz).await?.is_allowed())
    }

    /// Append a log entry; successful ones bump the rule's statistics in the
    /// same transaction.
    pub async fn log_trigger(
        &self,
        rule_id: Uuid,
        record: &TriggerRecord<'_>,
        response_success: bool,
        now: DateTime<Utc>,
    ) -> Result<RuleTriggerLogEntry, DatabaseError> {
        let entry = RuleTriggerLogEntry {
            id: Uuid::new_v4(),
            rule_id,
            conversation_id: record.conversation_id.to_string(),
            trigger_message_id: record.trigger_message_id.map(String::from),
            trigger_text: record.text.to_string(),
            matched_keyword: record.matched_keyword.map(String::from),
            response_success,
            created_at: now,
        };
        self.db.log_rule_trigger(&entry).await?;
        info!(
            rule_id = %rule_id,
            conversation_id = %entry.conversation_id,
            success = response_success,
            "Rule trigger logged"
        );
        Ok(entry)
    }
}
