//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::automation::rules::{AutomationRule, RuleResponse, RuleTriggerLogEntry};
use crate::automation::state::ConversationState;
use crate::automation::trigger::TriggerKind;
use crate::automation::window::AccountSettings;
use crate::error::DatabaseError;
use crate::flows::{FlowDefinition, FlowStatus};
use crate::store::migrations;
use crate::store::traits::Database;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations. Writes and
/// transactions take `write_lock` so a transaction never interleaves with
/// statements from another task on the shared connection.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        })
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format: fixed-width UTC so text comparison orders correctly.
fn fmt_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn opt_datetime(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(fmt_datetime(dt)),
        None => libsql::Value::Null,
    }
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn text(row: &libsql::Row, idx: i32) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Query(format!("column {idx}: {e}")))
}

fn opt_text_col(row: &libsql::Row, idx: i32) -> Option<String> {
    row.get::<String>(idx).ok()
}

fn int(row: &libsql::Row, idx: i32) -> i64 {
    row.get::<i64>(idx).unwrap_or(0)
}

fn uuid_col(row: &libsql::Row, idx: i32) -> Result<Uuid, DatabaseError> {
    let raw = text(row, idx)?;
    Uuid::parse_str(&raw)
        .map_err(|e| DatabaseError::Serialization(format!("invalid uuid '{raw}': {e}")))
}

fn json_col<T: DeserializeOwned>(row: &libsql::Row, idx: i32) -> Result<T, DatabaseError> {
    let raw = text(row, idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| DatabaseError::Serialization(format!("column {idx}: {e}")))
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

/// Map a write failure, keeping unique-index violations distinguishable.
fn write_err(op: &str, e: libsql::Error) -> DatabaseError {
    let message = e.to_string();
    if message.contains("UNIQUE constraint failed") {
        DatabaseError::Constraint(format!("{op}: {message}"))
    } else {
        DatabaseError::Query(format!("{op}: {message}"))
    }
}

const FLOW_COLUMNS: &str = "id, workspace_id, account_id, name, trigger_type, trigger_config, nodes, edges, status, priority, version, trigger_count, last_triggered_at, created_at, updated_at";

fn row_to_flow(row: &libsql::Row) -> Result<FlowDefinition, DatabaseError> {
    let trigger: TriggerKind = text(row, 4)?
        .parse()
        .map_err(DatabaseError::Serialization)?;
    let status: FlowStatus = text(row, 8)?
        .parse()
        .map_err(DatabaseError::Serialization)?;

    Ok(FlowDefinition {
        id: uuid_col(row, 0)?,
        workspace_id: text(row, 1)?,
        account_id: text(row, 2)?,
        name: text(row, 3)?,
        trigger,
        trigger_config: json_col(row, 5)?,
        nodes: json_col(row, 6)?,
        edges: json_col(row, 7)?,
        status,
        priority: int(row, 9),
        version: int(row, 10),
        trigger_count: int(row, 11).max(0) as u64,
        last_triggered_at: opt_text_col(row, 12).map(|s| parse_datetime(&s)),
        created_at: parse_datetime(&text(row, 13)?),
        updated_at: parse_datetime(&text(row, 14)?),
    })
}

const RULE_COLUMNS: &str = "id, workspace_id, account_id, name, rule_type, trigger_config, response_type, response_config, is_active, priority, cooldown_seconds, max_triggers_per_day, trigger_count, last_triggered_at, created_at, updated_at";

fn row_to_rule(row: &libsql::Row) -> Result<AutomationRule, DatabaseError> {
    let trigger: TriggerKind = text(row, 4)?
        .parse()
        .map_err(DatabaseError::Serialization)?;
    let response_config: serde_json::Value = json_col(row, 7)?;
    let response = RuleResponse::from_db(&text(row, 6)?, response_config)
        .map_err(DatabaseError::Serialization)?;

    Ok(AutomationRule {
        id: uuid_col(row, 0)?,
        workspace_id: text(row, 1)?,
        account_id: text(row, 2)?,
        name: text(row, 3)?,
        trigger,
        trigger_config: json_col(row, 5)?,
        response,
        is_active: int(row, 8) != 0,
        priority: int(row, 9),
        cooldown_seconds: int(row, 10).max(0) as u64,
        max_triggers_per_day: int(row, 11).clamp(0, i64::from(u32::MAX)) as u32,
        trigger_count: int(row, 12).max(0) as u64,
        last_triggered_at: opt_text_col(row, 13).map(|s| parse_datetime(&s)),
        created_at: parse_datetime(&text(row, 14)?),
        updated_at: parse_datetime(&text(row, 15)?),
    })
}

const LOG_COLUMNS: &str = "id, rule_id, conversation_id, trigger_message_id, trigger_text, matched_keyword, response_success, created_at";

fn row_to_log_entry(row: &libsql::Row) -> Result<RuleTriggerLogEntry, DatabaseError> {
    Ok(RuleTriggerLogEntry {
        id: uuid_col(row, 0)?,
        rule_id: uuid_col(row, 1)?,
        conversation_id: text(row, 2)?,
        trigger_message_id: opt_text_col(row, 3),
        trigger_text: text(row, 4)?,
        matched_keyword: opt_text_col(row, 5),
        response_success: int(row, 6) != 0,
        created_at: parse_datetime(&text(row, 7)?),
    })
}

const STATE_COLUMNS: &str = "id, workspace_id, account_id, phone_number, flow_id, current_node_id, last_button_clicked, collected_variables, last_inbound_at, resume_at, is_active, version, created_at, updated_at, completed_at";

fn row_to_state(row: &libsql::Row) -> Result<ConversationState, DatabaseError> {
    Ok(ConversationState {
        id: uuid_col(row, 0)?,
        workspace_id: text(row, 1)?,
        account_id: text(row, 2)?,
        phone_number: text(row, 3)?,
        flow_id: uuid_col(row, 4)?,
        current_node_id: text(row, 5)?,
        last_button_clicked: opt_text_col(row, 6),
        collected_variables: json_col(row, 7)?,
        last_inbound_at: opt_text_col(row, 8).map(|s| parse_datetime(&s)),
        resume_at: opt_text_col(row, 9).map(|s| parse_datetime(&s)),
        is_active: int(row, 10) != 0,
        version: int(row, 11),
        created_at: parse_datetime(&text(row, 12)?),
        updated_at: parse_datetime(&text(row, 13)?),
        completed_at: opt_text_col(row, 14).map(|s| parse_datetime(&s)),
    })
}

/// Drain a result set, skipping rows that fail to map.
async fn collect_rows<T>(
    mut rows: libsql::Rows,
    what: &str,
    map: fn(&libsql::Row) -> Result<T, DatabaseError>,
) -> Result<Vec<T>, DatabaseError> {
    let mut out = Vec::new();
    loop {
        match rows.next().await {
            Ok(Some(row)) => match map(&row) {
                Ok(item) => out.push(item),
                Err(e) => warn!("Skipping {what} row: {e}"),
            },
            Ok(None) => break,
            Err(e) => return Err(DatabaseError::Query(format!("{what}: {e}"))),
        }
    }
    Ok(out)
}

async fn first_row<T>(
    mut rows: libsql::Rows,
    what: &str,
    map: fn(&libsql::Row) -> Result<T, DatabaseError>,
) -> Result<Option<T>, DatabaseError> {
    match rows.next().await {
        Ok(Some(row)) => Ok(Some(map(&row)?)),
        Ok(None) => Ok(None),
        Err(e) => Err(DatabaseError::Query(format!("{what}: {e}"))),
    }
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Flows ───────────────────────────────────────────────────────

    async fn upsert_flow(&self, flow: &FlowDefinition) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let conn = self.conn();

        // Statistics are core-managed and survive content updates.
        conn.execute(
            "INSERT INTO flows (id, workspace_id, account_id, name, trigger_type, trigger_config, nodes, edges, status, priority, version, trigger_count, last_triggered_at, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT(id) DO UPDATE SET name=excluded.name, trigger_type=excluded.trigger_type, trigger_config=excluded.trigger_config, nodes=excluded.nodes, edges=excluded.edges, status=excluded.status, priority=excluded.priority, version=excluded.version, updated_at=excluded.updated_at",
            params![
                flow.id.to_string(),
                flow.workspace_id.clone(),
                flow.account_id.clone(),
                flow.name.clone(),
                flow.trigger.type_tag(),
                to_json(&flow.trigger_config)?,
                to_json(&flow.nodes)?,
                to_json(&flow.edges)?,
                flow.status.to_string(),
                flow.priority,
                flow.version,
                flow.trigger_count as i64,
                opt_datetime(flow.last_triggered_at),
                fmt_datetime(flow.created_at),
                fmt_datetime(flow.updated_at),
            ],
        )
        .await
        .map_err(|e| write_err("upsert_flow", e))?;

        Ok(())
    }

    async fn get_flow(&self, id: Uuid) -> Result<Option<FlowDefinition>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {FLOW_COLUMNS} FROM flows WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_flow: {e}")))?;
        first_row(rows, "get_flow", row_to_flow).await
    }

    async fn list_active_flows(
        &self,
        workspace_id: &str,
        account_id: &str,
    ) -> Result<Vec<FlowDefinition>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {FLOW_COLUMNS} FROM flows WHERE workspace_id = ?1 AND account_id = ?2 AND status = 'active' ORDER BY priority ASC, created_at ASC"
                ),
                params![workspace_id, account_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_active_flows: {e}")))?;
        collect_rows(rows, "flow", row_to_flow).await
    }

    async fn set_flow_status(&self, id: Uuid, status: FlowStatus) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let count = self
            .conn()
            .execute(
                "UPDATE flows SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.to_string(), fmt_datetime(Utc::now()), id.to_string()],
            )
            .await
            .map_err(|e| write_err("set_flow_status", e))?;
        if count == 0 {
            return Err(DatabaseError::NotFound {
                entity: "flow".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn record_flow_triggered(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "UPDATE flows SET trigger_count = trigger_count + 1, last_triggered_at = ?1 WHERE id = ?2",
                params![fmt_datetime(at), id.to_string()],
            )
            .await
            .map_err(|e| write_err("record_flow_triggered", e))?;
        Ok(())
    }

    // ── Rules ───────────────────────────────────────────────────────

    async fn upsert_rule(&self, rule: &AutomationRule) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "INSERT INTO automation_rules (id, workspace_id, account_id, name, rule_type, trigger_config, response_type, response_config, is_active, priority, cooldown_seconds, max_triggers_per_day, trigger_count, last_triggered_at, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                 ON CONFLICT(id) DO UPDATE SET name=excluded.name, rule_type=excluded.rule_type, trigger_config=excluded.trigger_config, response_type=excluded.response_type, response_config=excluded.response_config, is_active=excluded.is_active, priority=excluded.priority, cooldown_seconds=excluded.cooldown_seconds, max_triggers_per_day=excluded.max_triggers_per_day, updated_at=excluded.updated_at",
                params![
                    rule.id.to_string(),
                    rule.workspace_id.clone(),
                    rule.account_id.clone(),
                    rule.name.clone(),
                    rule.trigger.type_tag(),
                    to_json(&rule.trigger_config)?,
                    rule.response.type_tag(),
                    to_json(&rule.response.to_config_json())?,
                    rule.is_active as i64,
                    rule.priority,
                    rule.cooldown_seconds as i64,
                    i64::from(rule.max_triggers_per_day),
                    rule.trigger_count as i64,
                    opt_datetime(rule.last_triggered_at),
                    fmt_datetime(rule.created_at),
                    fmt_datetime(rule.updated_at),
                ],
            )
            .await
            .map_err(|e| write_err("upsert_rule", e))?;
        Ok(())
    }

    async fn get_rule(&self, id: Uuid) -> Result<Option<AutomationRule>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {RULE_COLUMNS} FROM automation_rules WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_rule: {e}")))?;
        first_row(rows, "get_rule", row_to_rule).await
    }

    async fn list_active_rules(
        &self,
        workspace_id: &str,
        account_id: &str,
    ) -> Result<Vec<AutomationRule>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RULE_COLUMNS} FROM automation_rules WHERE workspace_id = ?1 AND account_id = ?2 AND is_active = 1 ORDER BY priority ASC, created_at ASC"
                ),
                params![workspace_id, account_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_active_rules: {e}")))?;
        collect_rows(rows, "rule", row_to_rule).await
    }

    // ── Rule trigger log ────────────────────────────────────────────

    async fn log_rule_trigger(&self, entry: &RuleTriggerLogEntry) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("log_rule_trigger begin: {e}")))?;

        let result = async {
            tx.execute(
                &format!("INSERT INTO rule_trigger_log ({LOG_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
                params![
                    entry.id.to_string(),
                    entry.rule_id.to_string(),
                    entry.conversation_id.clone(),
                    opt_text(entry.trigger_message_id.as_deref()),
                    entry.trigger_text.clone(),
                    opt_text(entry.matched_keyword.as_deref()),
                    entry.response_success as i64,
                    fmt_datetime(entry.created_at),
                ],
            )
            .await
            .map_err(|e| write_err("log_rule_trigger insert", e))?;

            if entry.response_success {
                tx.execute(
                    "UPDATE automation_rules SET trigger_count = trigger_count + 1, last_triggered_at = ?1 WHERE id = ?2",
                    params![fmt_datetime(entry.created_at), entry.rule_id.to_string()],
                )
                .await
                .map_err(|e| write_err("log_rule_trigger stats", e))?;
            }
            Ok::<(), DatabaseError>(())
        }
        .await;

        match result {
            Ok(()) => tx
                .commit()
                .await
                .map_err(|e| DatabaseError::Query(format!("log_rule_trigger commit: {e}"))),
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!("log_rule_trigger rollback failed: {rollback}");
                }
                Err(e)
            }
        }
    }

    async fn last_rule_trigger_at(
        &self,
        rule_id: Uuid,
        conversation_id: &str,
    ) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT created_at FROM rule_trigger_log WHERE rule_id = ?1 AND conversation_id = ?2 AND response_success = 1 ORDER BY created_at DESC LIMIT 1",
                params![rule_id.to_string(), conversation_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("last_rule_trigger_at: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(parse_datetime(&text(&row, 0)?))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("last_rule_trigger_at: {e}"))),
        }
    }

    async fn count_rule_triggers_since(
        &self,
        rule_id: Uuid,
        conversation_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM rule_trigger_log WHERE rule_id = ?1 AND conversation_id = ?2 AND response_success = 1 AND created_at >= ?3",
                params![rule_id.to_string(), conversation_id, fmt_datetime(since)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_rule_triggers_since: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(int(&row, 0).max(0) as u64),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_rule_triggers_since: {e}"))),
        }
    }

    async fn list_rule_triggers(
        &self,
        rule_id: Uuid,
    ) -> Result<Vec<RuleTriggerLogEntry>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {LOG_COLUMNS} FROM rule_trigger_log WHERE rule_id = ?1 ORDER BY created_at DESC"
                ),
                params![rule_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_rule_triggers: {e}")))?;
        collect_rows(rows, "rule trigger log", row_to_log_entry).await
    }

    // ── Conversation states ─────────────────────────────────────────

    async fn create_state(&self, state: &ConversationState) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("create_state begin: {e}")))?;

        let result = async {
            let now = fmt_datetime(state.created_at);
            let deactivated = tx
                .execute(
                    "UPDATE conversation_states SET is_active = 0, resume_at = NULL, completed_at = ?1, updated_at = ?1, version = version + 1 WHERE workspace_id = ?2 AND phone_number = ?3 AND is_active = 1",
                    params![now, state.workspace_id.clone(), state.phone_number.clone()],
                )
                .await
                .map_err(|e| write_err("create_state deactivate", e))?;
            if deactivated > 0 {
                debug!(
                    phone_number = %state.phone_number,
                    count = deactivated,
                    "Deactivated previous conversation state"
                );
            }

            tx.execute(
                &format!("INSERT INTO conversation_states ({STATE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"),
                params![
                    state.id.to_string(),
                    state.workspace_id.clone(),
                    state.account_id.clone(),
                    state.phone_number.clone(),
                    state.flow_id.to_string(),
                    state.current_node_id.clone(),
                    opt_text(state.last_button_clicked.as_deref()),
                    to_json(&state.collected_variables)?,
                    opt_datetime(state.last_inbound_at),
                    opt_datetime(state.resume_at),
                    state.is_active as i64,
                    state.version,
                    fmt_datetime(state.created_at),
                    fmt_datetime(state.updated_at),
                    opt_datetime(state.completed_at),
                ],
            )
            .await
            .map_err(|e| write_err("create_state insert", e))?;
            Ok::<(), DatabaseError>(())
        }
        .await;

        match result {
            Ok(()) => tx
                .commit()
                .await
                .map_err(|e| DatabaseError::Query(format!("create_state commit: {e}"))),
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!("create_state rollback failed: {rollback}");
                }
                Err(e)
            }
        }
    }

    async fn get_state(&self, id: Uuid) -> Result<Option<ConversationState>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {STATE_COLUMNS} FROM conversation_states WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_state: {e}")))?;
        first_row(rows, "get_state", row_to_state).await
    }

    async fn get_active_state(
        &self,
        workspace_id: &str,
        phone_number: &str,
    ) -> Result<Option<ConversationState>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {STATE_COLUMNS} FROM conversation_states WHERE workspace_id = ?1 AND phone_number = ?2 AND is_active = 1"
                ),
                params![workspace_id, phone_number],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_active_state: {e}")))?;
        first_row(rows, "get_active_state", row_to_state).await
    }

    async fn update_state(
        &self,
        state: &ConversationState,
        expected_version: i64,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let count = self
            .conn()
            .execute(
                "UPDATE conversation_states SET current_node_id = ?1, last_button_clicked = ?2, collected_variables = ?3, last_inbound_at = ?4, resume_at = ?5, is_active = ?6, version = ?7, updated_at = ?8, completed_at = ?9 WHERE id = ?10 AND version = ?11",
                params![
                    state.current_node_id.clone(),
                    opt_text(state.last_button_clicked.as_deref()),
                    to_json(&state.collected_variables)?,
                    opt_datetime(state.last_inbound_at),
                    opt_datetime(state.resume_at),
                    state.is_active as i64,
                    state.version,
                    fmt_datetime(state.updated_at),
                    opt_datetime(state.completed_at),
                    state.id.to_string(),
                    expected_version,
                ],
            )
            .await
            .map_err(|e| write_err("update_state", e))?;
        Ok(count == 1)
    }

    async fn list_due_delays(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ConversationState>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {STATE_COLUMNS} FROM conversation_states WHERE is_active = 1 AND resume_at IS NOT NULL AND resume_at <= ?1 ORDER BY resume_at ASC"
                ),
                params![fmt_datetime(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_due_delays: {e}")))?;
        collect_rows(rows, "due delay", row_to_state).await
    }

    async fn count_active_states(
        &self,
        workspace_id: &str,
        phone_number: &str,
    ) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM conversation_states WHERE workspace_id = ?1 AND phone_number = ?2 AND is_active = 1",
                params![workspace_id, phone_number],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_active_states: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(int(&row, 0).max(0) as u64),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_active_states: {e}"))),
        }
    }

    // ── Account settings ────────────────────────────────────────────

    async fn get_account_settings(
        &self,
        workspace_id: &str,
        account_id: &str,
    ) -> Result<Option<AccountSettings>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT settings FROM account_settings WHERE workspace_id = ?1 AND account_id = ?2",
                params![workspace_id, account_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_account_settings: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(json_col(&row, 0)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_account_settings: {e}"))),
        }
    }

    async fn set_account_settings(
        &self,
        workspace_id: &str,
        account_id: &str,
        settings: &AccountSettings,
    ) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "INSERT INTO account_settings (workspace_id, account_id, settings, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(workspace_id, account_id) DO UPDATE SET settings = excluded.settings, updated_at = excluded.updated_at",
                params![workspace_id, account_id, to_json(settings)?, fmt_datetime(Utc::now())],
            )
            .await
            .map_err(|e| write_err("set_account_settings", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::trigger::{MatchMode, TriggerConfig};
    use crate::automation::window::{BusinessHours, WeeklySchedule};
    use crate::flows::{ButtonOption, Edge, Node};
    use chrono::Duration;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn make_flow(name: &str, priority: i64) -> FlowDefinition {
        FlowDefinition::new("ws1", "acc1", name, TriggerKind::Keyword)
            .with_priority(priority)
            .with_trigger_config(TriggerConfig::keywords(["hi"], MatchMode::Contains))
            .with_graph(
                vec![
                    Node::trigger("start"),
                    Node::buttons("menu", "Pick", vec![ButtonOption::new("a", "A")]),
                    Node::end("done", Some("bye")),
                ],
                vec![
                    Edge::new("start", "menu"),
                    Edge::from_button("menu", "a", "done"),
                ],
            )
    }

    fn make_rule(priority: i64) -> AutomationRule {
        AutomationRule::new(
            "ws1",
            "acc1",
            "price",
            TriggerKind::Keyword,
            RuleResponse::Text {
                text: "It costs 10".into(),
            },
        )
        .with_priority(priority)
        .with_cooldown(60)
    }

    fn log_entry(rule_id: Uuid, at: DateTime<Utc>, success: bool) -> RuleTriggerLogEntry {
        RuleTriggerLogEntry {
            id: Uuid::new_v4(),
            rule_id,
            conversation_id: "conv1".into(),
            trigger_message_id: Some("wamid.1".into()),
            trigger_text: "price?".into(),
            matched_keyword: Some("price".into()),
            response_success: success,
            created_at: at,
        }
    }

    // ── Flow tests ──────────────────────────────────────────────────

    #[tokio::test]
    async fn flow_roundtrip() {
        let db = test_db().await;
        let flow = make_flow("Menu", 10);
        db.upsert_flow(&flow).await.unwrap();

        let fetched = db.get_flow(flow.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "Menu");
        assert_eq!(fetched.nodes, flow.nodes);
        assert_eq!(fetched.edges, flow.edges);
        assert_eq!(fetched.trigger_config, flow.trigger_config);
        assert_eq!(fetched.status, FlowStatus::Active);
        assert!(db.get_flow(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn active_flows_ordered_by_priority_and_filtered() {
        let db = test_db().await;
        let low = make_flow("low", 20);
        let high = make_flow("high", 10);
        let paused = make_flow("paused", 1).with_status(FlowStatus::Paused);
        let other_account = FlowDefinition::new("ws1", "acc2", "other", TriggerKind::Welcome);
        for flow in [&low, &high, &paused, &other_account] {
            db.upsert_flow(flow).await.unwrap();
        }

        let flows = db.list_active_flows("ws1", "acc1").await.unwrap();
        let names: Vec<_> = flows.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["high", "low"]);

        db.set_flow_status(high.id, FlowStatus::Paused).await.unwrap();
        assert_eq!(db.list_active_flows("ws1", "acc1").await.unwrap().len(), 1);
        assert!(db.set_flow_status(Uuid::new_v4(), FlowStatus::Active).await.is_err());
    }

    #[tokio::test]
    async fn flow_stats_survive_upsert() {
        let db = test_db().await;
        let mut flow = make_flow("Menu", 10);
        db.upsert_flow(&flow).await.unwrap();
        let at = Utc::now();
        db.record_flow_triggered(flow.id, at).await.unwrap();
        db.record_flow_triggered(flow.id, at).await.unwrap();

        flow.name = "Renamed".into();
        db.upsert_flow(&flow).await.unwrap();

        let fetched = db.get_flow(flow.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "Renamed");
        assert_eq!(fetched.trigger_count, 2);
        assert!(fetched.last_triggered_at.is_some());
    }

    // ── Rule tests ──────────────────────────────────────────────────

    #[tokio::test]
    async fn rule_roundtrip_and_ordering() {
        let db = test_db().await;
        let a = make_rule(20);
        let b = make_rule(10);
        let mut inactive = make_rule(1);
        inactive.is_active = false;
        for rule in [&a, &b, &inactive] {
            db.upsert_rule(rule).await.unwrap();
        }

        let rules = db.list_active_rules("ws1", "acc1").await.unwrap();
        assert_eq!(rules.iter().map(|r| r.id).collect::<Vec<_>>(), vec![b.id, a.id]);

        let fetched = db.get_rule(a.id).await.unwrap().unwrap();
        assert_eq!(fetched.response, a.response);
        assert_eq!(fetched.cooldown_seconds, 60);
        assert_eq!(fetched.max_triggers_per_day, 0);
    }

    #[tokio::test]
    async fn trigger_log_counts_only_successful_entries() {
        let db = test_db().await;
        let rule = make_rule(10);
        db.upsert_rule(&rule).await.unwrap();

        let t0 = Utc::now() - Duration::minutes(10);
        db.log_rule_trigger(&log_entry(rule.id, t0, true)).await.unwrap();
        db.log_rule_trigger(&log_entry(rule.id, t0 + Duration::minutes(5), false))
            .await
            .unwrap();

        assert_eq!(db.last_rule_trigger_at(rule.id, "conv1").await.unwrap(), Some(parse_datetime(&fmt_datetime(t0))));
        assert_eq!(
            db.count_rule_triggers_since(rule.id, "conv1", t0 - Duration::seconds(1))
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            db.count_rule_triggers_since(rule.id, "conv1", t0 + Duration::seconds(1))
                .await
                .unwrap(),
            0
        );
        assert!(db.last_rule_trigger_at(rule.id, "conv2").await.unwrap().is_none());

        let fetched = db.get_rule(rule.id).await.unwrap().unwrap();
        assert_eq!(fetched.trigger_count, 1);
        assert_eq!(db.list_rule_triggers(rule.id).await.unwrap().len(), 2);
    }

    // ── State tests ─────────────────────────────────────────────────

    #[tokio::test]
    async fn state_timestamps_keep_full_precision() {
        let db = test_db().await;
        let now = DateTime::parse_from_rfc3339("2026-03-02T12:00:00.672575177Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut state = ConversationState::new("ws1", "acc1", "+5511", Uuid::new_v4(), "start", Some(now), now);
        state.resume_at = Some(now + Duration::nanoseconds(1));
        db.create_state(&state).await.unwrap();

        let stored = db.get_state(state.id).await.unwrap().unwrap();
        assert_eq!(stored, state);
        // Fixed-width text still orders by instant.
        assert!(db.list_due_delays(now).await.unwrap().is_empty());
        assert_eq!(db.list_due_delays(now + Duration::nanoseconds(1)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_state_checks_version() {
        let db = test_db().await;
        let now = Utc::now();
        let state = ConversationState::new("ws1", "acc1", "+5511", Uuid::new_v4(), "start", Some(now), now);
        db.create_state(&state).await.unwrap();

        let mut next = state.clone();
        next.current_node_id = "menu".into();
        next.version = 2;
        assert!(db.update_state(&next, 1).await.unwrap());
        // Same expected version again: row has moved on.
        assert!(!db.update_state(&next, 1).await.unwrap());

        let stored = db.get_active_state("ws1", "+5511").await.unwrap().unwrap();
        assert_eq!(stored.current_node_id, "menu");
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn create_state_keeps_one_active_per_phone() {
        let db = test_db().await;
        let now = Utc::now();
        for _ in 0..3 {
            let state = ConversationState::new("ws1", "acc1", "+5511", Uuid::new_v4(), "start", None, now);
            db.create_state(&state).await.unwrap();
        }
        let other = ConversationState::new("ws2", "acc1", "+5511", Uuid::new_v4(), "start", None, now);
        db.create_state(&other).await.unwrap();

        assert_eq!(db.count_active_states("ws1", "+5511").await.unwrap(), 1);
        assert_eq!(db.count_active_states("ws2", "+5511").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn due_delays_listed_in_order() {
        let db = test_db().await;
        let now = Utc::now();
        let mut due = ConversationState::new("ws1", "acc1", "+1", Uuid::new_v4(), "wait", None, now);
        due.resume_at = Some(now - Duration::seconds(1));
        let mut later = ConversationState::new("ws1", "acc1", "+2", Uuid::new_v4(), "wait", None, now);
        later.resume_at = Some(now + Duration::seconds(30));
        let idle = ConversationState::new("ws1", "acc1", "+3", Uuid::new_v4(), "menu", None, now);
        for state in [&due, &later, &idle] {
            db.create_state(state).await.unwrap();
        }

        let listed = db.list_due_delays(now).await.unwrap();
        assert_eq!(listed.iter().map(|s| s.id).collect::<Vec<_>>(), vec![due.id]);
    }

    // ── Settings tests ──────────────────────────────────────────────

    #[tokio::test]
    async fn account_settings_roundtrip() {
        let db = test_db().await;
        assert!(db.get_account_settings("ws1", "acc1").await.unwrap().is_none());

        let settings = AccountSettings {
            timezone: Some("America/Sao_Paulo".into()),
            business_hours: Some(BusinessHours {
                weekly: WeeklySchedule::weekdays("09:00", "18:00"),
                exceptions: vec![],
            }),
            recovery_message: Some("Let's start over".into()),
        };
        db.set_account_settings("ws1", "acc1", &settings).await.unwrap();
        db.set_account_settings("ws1", "acc1", &settings).await.unwrap();
        assert_eq!(db.get_account_settings("ws1", "acc1").await.unwrap(), Some(settings));
    }

    #[tokio::test]
    async fn local_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("autoflow.db");
        let flow = make_flow("Menu", 10);
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.upsert_flow(&flow).await.unwrap();
        }
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert!(db.get_flow(flow.id).await.unwrap().is_some());
    }

    #[test]
    fn datetime_format_is_fixed_width() {
        let a = fmt_datetime(Utc::now());
        let b = fmt_datetime(Utc::now() + Duration::days(1));
        assert_eq!(a.len(), b.len());
        assert!(a.ends_with('Z'));
        assert!(parse_datetime("not a date") == DateTime::<Utc>::MIN_UTC);
    }
}
