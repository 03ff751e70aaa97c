//! Conversation state: the durable execution pointer of one phone number
//! inside one flow instance.
//!
//! At most one state per (workspace, phone number) is active. The store
//! guarantees this three ways: callers serialize on a per-key async lock,
//! creation deactivates the previous state in the same transaction as the
//! insert, and a partial unique index rejects anything that slips through.
//! Every mutation is a compare-and-set on `version`, so a stale copy can never
//! overwrite a newer pointer.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::Database;

/// Lock map size above which idle entries are dropped.
const LOCK_PRUNE_THRESHOLD: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    pub id: Uuid,
    pub workspace_id: String,
    pub account_id: String,
    pub phone_number: String,
    pub flow_id: Uuid,
    pub current_node_id: String,
    pub last_button_clicked: Option<String>,
    pub collected_variables: BTreeMap<String, String>,
    pub last_inbound_at: Option<DateTime<Utc>>,
    /// Set while the pointer sits on a delay node, or on a sending node whose
    /// callback delivery failed and is due for another attempt.
    pub resume_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    /// Bumped on every write.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ConversationState {
    pub fn new(
        workspace_id: &str,
        account_id: &str,
        phone_number: &str,
        flow_id: Uuid,
        start_node_id: &str,
        last_inbound_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workspace_id: workspace_id.into(),
            account_id: account_id.into(),
            phone_number: phone_number.into(),
            flow_id,
            current_node_id: start_node_id.into(),
            last_button_clicked: None,
            collected_variables: BTreeMap::new(),
            last_inbound_at,
            resume_at: None,
            is_active: true,
            version: 1,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Whole hours since the last inbound message (or since creation).
    pub fn idle_hours(&self, now: DateTime<Utc>) -> i64 {
        now.signed_duration_since(self.last_inbound_at.unwrap_or(self.created_at))
            .num_hours()
    }
}

/// Conversation state persistence with per-(workspace, phone) serialization.
pub struct StateStore {
    db: Arc<dyn Database>,
    locks: Mutex<HashMap<(String, String), Arc<tokio::sync::Mutex<()>>>>,
}

impl StateStore {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            db,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the mutual-exclusion guard for one (workspace, phone) key.
    /// Hold it across every read-modify-write of that key's state.
    pub async fn lock(&self, workspace_id: &str, phone_number: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            if locks.len() > LOCK_PRUNE_THRESHOLD {
                locks.retain(|_, l| Arc::strong_count(l) > 1);
            }
            locks
                .entry((workspace_id.to_string(), phone_number.to_string()))
                .or_default()
                .clone()
        };
        lock.lock_owned().await
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<ConversationState>, DatabaseError> {
        self.db.get_state(id).await
    }

    pub async fn get_active(
        &self,
        workspace_id: &str,
        phone_number: &str,
    ) -> Result<Option<ConversationState>, DatabaseError> {
        self.db.get_active_state(workspace_id, phone_number).await
    }

    /// Start a new pointer at `start_node_id`, deactivating any previous
    /// active state for the same phone number.
    pub async fn create(
        &self,
        workspace_id: &str,
        account_id: &str,
        phone_number: &str,
        flow_id: Uuid,
        start_node_id: &str,
        last_inbound_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<ConversationState, DatabaseError> {
        let state = ConversationState::new(
            workspace_id,
            account_id,
            phone_number,
            flow_id,
            start_node_id,
            last_inbound_at,
            now,
        );
        self.db.create_state(&state).await?;
        info!(
            state_id = %state.id,
            workspace_id = %workspace_id,
            phone_number = %phone_number,
            flow_id = %flow_id,
            "Conversation state created"
        );
        Ok(state)
    }

    /// Move the pointer to `node_id`. Clears any pending delay.
    pub async fn advance(
        &self,
        state: &mut ConversationState,
        node_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        debug!(state_id = %state.id, from = %state.current_node_id, to = %node_id, "Advancing state");
        self.persist(state, now, |s| {
            s.current_node_id = node_id.to_string();
            s.resume_at = None;
        })
        .await
    }

    /// Put the pointer back on a waiting node after a callback pass failed
    /// before delivering anything, restoring its pending deadline.
    pub async fn rewind(
        &self,
        state: &mut ConversationState,
        node_id: &str,
        resume_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        debug!(state_id = %state.id, from = %state.current_node_id, to = %node_id, "Rewinding state");
        self.persist(state, now, |s| {
            s.current_node_id = node_id.to_string();
            s.resume_at = resume_at;
        })
        .await
    }

    /// Reset the messaging-window clock.
    pub async fn record_inbound(
        &self,
        state: &mut ConversationState,
        at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.persist(state, now, |s| {
            if s.last_inbound_at.is_none_or(|prev| at > prev) {
                s.last_inbound_at = Some(at);
            }
        })
        .await
    }

    pub async fn record_button(
        &self,
        state: &mut ConversationState,
        button_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.persist(state, now, |s| {
            s.last_button_clicked = Some(button_id.to_string())
        })
        .await
    }

    pub async fn merge_variables<I>(
        &self,
        state: &mut ConversationState,
        vars: I,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.persist(state, now, |s| s.collected_variables.extend(vars))
            .await
    }

    /// Park the pointer on its current node until `resume_at`.
    pub async fn schedule_resume(
        &self,
        state: &mut ConversationState,
        resume_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.persist(state, now, |s| s.resume_at = Some(resume_at))
            .await
    }

    /// Record that the current node's prompt went out. Bumps the version so
    /// a replay of the same execution is recognised.
    pub async fn mark_waiting(
        &self,
        state: &mut ConversationState,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.persist(state, now, |_| {}).await
    }

    pub async fn clear_resume(
        &self,
        state: &mut ConversationState,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.persist(state, now, |s| s.resume_at = None).await
    }

    /// Terminate the state. Completing an inactive state is a no-op.
    pub async fn complete(
        &self,
        state: &mut ConversationState,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        if !state.is_active {
            return Ok(());
        }
        self.persist(state, now, |s| {
            s.is_active = false;
            s.resume_at = None;
            s.completed_at = Some(now);
        })
        .await?;
        info!(state_id = %state.id, flow_id = %state.flow_id, "Conversation state completed");
        Ok(())
    }

    /// Apply `mutate` to a copy, write it with a version check and only then
    /// replace the caller's copy.
    async fn persist<F>(
        &self,
        state: &mut ConversationState,
        now: DateTime<Utc>,
        mutate: F,
    ) -> Result<(), DatabaseError>
    where
        F: FnOnce(&mut ConversationState),
    {
        let mut next = state.clone();
        mutate(&mut next);
        next.version = state.version + 1;
        next.updated_at = now;

        if !self.db.update_state(&next, state.version).await? {
            return Err(DatabaseError::Constraint(format!(
                "conversation state {} was modified concurrently (expected version {})",
                state.id, state.version
            )));
        }
        *state = next;
        Ok(())
    }
}
