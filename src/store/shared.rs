//! Shared store — the durable card queue all agents work against.
//!
//! This is the single source of truth for claim ownership. Claiming wraps
//! the select-then-update in an immediate (write-locking) transaction on a
//! dedicated connection, so two concurrent claimers can never select the
//! same row; everything else is a single-statement write.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use libsql::{Connection, TransactionBehavior, params};
use tracing::{debug, info};

use crate::cards::model::{Card, CardStatus, NewCard};
use crate::error::DatabaseError;
use crate::store::migrations;

/// Presence state of an agent in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Online,
    Offline,
    Ready,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "ONLINE",
            Self::Offline => "OFFLINE",
            Self::Ready => "READY",
        }
    }
}

/// A row in the agent registry.
#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub agent_id: String,
    pub status: String,
    pub updated_at: DateTime<Utc>,
    pub coding_id: Option<String>,
}

/// A named long-running plan an agent can resume after restart.
#[derive(Debug, Clone)]
pub struct ActivePlan {
    pub plan_name: String,
    pub content: String,
    pub current_step: i64,
}

/// An experience entry as written to the shared log.
///
/// `id` is derived from `(agent_id, local_id, timestamp)` so repeated sync
/// attempts are idempotent: re-inserting an already-present id is a no-op.
#[derive(Debug, Clone)]
pub struct SharedExperience {
    pub id: String,
    pub agent_id: String,
    pub event_type: String,
    pub context: String,
    pub success: bool,
    pub details: String,
    pub timestamp: String,
}

const JOB_COLUMNS: &str = "correlation_id, idempotency_key, priority, cost_center, \
                           payload, status, result, worker, created_at, updated_at";

/// The shared card queue.
pub struct JobStore {
    db: Arc<libsql::Database>,
    conn: Connection,
}

impl JobStore {
    /// Open (or create) the shared store file and run migrations.
    pub async fn open(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Open(format!("Failed to create store directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Open(format!("Failed to open shared store: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Open(format!("Failed to create connection: {e}")))?;
        configure(&conn).await?;

        migrations::run_shared(&conn).await?;
        info!(path = %path.display(), "Shared store opened");

        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Insert a new card as PENDING.
    pub async fn submit(&self, card: NewCard) -> Result<(), DatabaseError> {
        self.insert(card, CardStatus::Pending).await
    }

    /// Insert a new card as NEEDS_CODING, to be promoted by a planning stage.
    pub async fn submit_for_coding(&self, card: NewCard) -> Result<(), DatabaseError> {
        self.insert(card, CardStatus::NeedsCoding).await
    }

    async fn insert(&self, card: NewCard, status: CardStatus) -> Result<(), DatabaseError> {
        let payload = serde_json::to_string(&card.payload)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let now = Utc::now().to_rfc3339();

        let result = self
            .conn
            .execute(
                "INSERT INTO jobs (correlation_id, idempotency_key, priority, cost_center, \
                                   payload, status, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![
                    card.correlation_id.as_str(),
                    card.idempotency_key.as_str(),
                    card.priority,
                    card.cost_center.as_str(),
                    payload,
                    status.as_str(),
                    now
                ],
            )
            .await;

        match result {
            Ok(_) => {
                debug!(card_id = %card.correlation_id, %status, "Card submitted");
                Ok(())
            }
            Err(e) if is_unique_violation(&e) => Err(DatabaseError::DuplicateIdempotencyKey(
                card.idempotency_key,
            )),
            Err(e) => Err(DatabaseError::Query(e.to_string())),
        }
    }

    /// Atomically claim the next eligible card for `agent_id`.
    ///
    /// Eligible: status PENDING and worker unset or already equal to this
    /// agent (affinity filter). Order: priority descending, then insertion
    /// order. Selection and the PROCESSING/worker update happen inside one
    /// immediate transaction on a fresh connection.
    pub async fn claim(&self, agent_id: &str) -> Result<Option<Card>, DatabaseError> {
        let conn = self
            .db
            .connect()
            .map_err(|e| DatabaseError::Open(format!("Failed to create connection: {e}")))?;
        configure(&conn).await?;

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to begin claim: {e}")))?;

        let mut rows = tx
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs \
                     WHERE status = 'PENDING' AND (worker IS NULL OR worker = ?1) \
                     ORDER BY priority DESC, created_at ASC LIMIT 1"
                ),
                params![agent_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        else {
            drop(rows);
            tx.commit()
                .await
                .map_err(|e| DatabaseError::Query(e.to_string()))?;
            return Ok(None);
        };

        let mut card = row_to_card(&row)?;
        drop(rows);

        let now = Utc::now().to_rfc3339();
        tx.execute(
            "UPDATE jobs SET status = 'PROCESSING', worker = ?1, updated_at = ?2 \
             WHERE correlation_id = ?3",
            params![agent_id, now, card.correlation_id.as_str()],
        )
        .await
        .map_err(|e| DatabaseError::Query(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        card.status = CardStatus::Processing;
        card.worker = Some(agent_id.to_string());

        info!(card_id = %card.correlation_id, priority = card.priority, "Card claimed");
        Ok(Some(card))
    }

    /// Set a card's status and result text.
    ///
    /// Enforces the status state machine; terminal cards are never rewritten.
    pub async fn update_status(
        &self,
        correlation_id: &str,
        status: CardStatus,
        result: &str,
    ) -> Result<(), DatabaseError> {
        let current = self
            .get(correlation_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(correlation_id.to_string()))?;

        if !current.status.can_transition_to(status) {
            return Err(DatabaseError::InvalidTransition {
                id: correlation_id.to_string(),
                from: current.status.to_string(),
                to: status.to_string(),
            });
        }

        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE jobs SET status = ?1, result = ?2, updated_at = ?3 \
                 WHERE correlation_id = ?4",
                params![status.as_str(), result, now, correlation_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        debug!(card_id = %correlation_id, %status, "Card status updated");
        Ok(())
    }

    /// Get a card by correlation id.
    pub async fn get(&self, correlation_id: &str) -> Result<Option<Card>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE correlation_id = ?1"),
                params![correlation_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            Some(row) => Ok(Some(row_to_card(&row)?)),
            None => Ok(None),
        }
    }

    /// List cards, most recent first, optionally filtered by status.
    pub async fn query(
        &self,
        status: Option<CardStatus>,
        limit: usize,
    ) -> Result<Vec<Card>, DatabaseError> {
        let mut rows = match status {
            Some(status) => self
                .conn
                .query(
                    &format!(
                        "SELECT {JOB_COLUMNS} FROM jobs WHERE status = ?1 \
                         ORDER BY created_at DESC LIMIT ?2"
                    ),
                    params![status.as_str(), limit as i64],
                )
                .await,
            None => self
                .conn
                .query(
                    &format!(
                        "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC LIMIT ?1"
                    ),
                    params![limit as i64],
                )
                .await,
        }
        .map_err(|e| DatabaseError::Query(e.to_string()))?;

        let mut cards = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            cards.push(row_to_card(&row)?);
        }
        Ok(cards)
    }

    /// Promote a NEEDS_CODING card to PENDING with its executable payload.
    ///
    /// This is the planning handoff: an upstream stage has turned the intent
    /// card into something a worker can run.
    pub async fn promote(
        &self,
        correlation_id: &str,
        new_payload: serde_json::Value,
    ) -> Result<(), DatabaseError> {
        let payload = serde_json::to_string(&new_payload)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let now = Utc::now().to_rfc3339();

        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET status = 'PENDING', payload = ?1, updated_at = ?2 \
                 WHERE correlation_id = ?3 AND status = 'NEEDS_CODING'",
                params![payload, now, correlation_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        if changed == 0 {
            return match self.get(correlation_id).await? {
                None => Err(DatabaseError::NotFound(correlation_id.to_string())),
                Some(card) => Err(DatabaseError::InvalidTransition {
                    id: correlation_id.to_string(),
                    from: card.status.to_string(),
                    to: CardStatus::Pending.to_string(),
                }),
            };
        }

        info!(card_id = %correlation_id, "Card promoted to PENDING");
        Ok(())
    }

    /// Administrative requeue: put all PENDING/PROCESSING cards back to
    /// PENDING with the worker cleared. Does not interrupt in-flight work.
    pub async fn reset_backlog(&self) -> Result<usize, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET status = 'PENDING', worker = NULL, updated_at = ?1 \
                 WHERE status IN ('PENDING', 'PROCESSING')",
                params![now],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        info!(count = changed, "Backlog reset to PENDING");
        Ok(changed as usize)
    }

    /// Administrative purge: delete terminal cards older than `keep_days`.
    pub async fn purge_terminal(&self, keep_days: u32) -> Result<usize, DatabaseError> {
        let cutoff = (Utc::now() - chrono::Duration::days(i64::from(keep_days))).to_rfc3339();
        let deleted = self
            .conn
            .execute(
                "DELETE FROM jobs WHERE status IN ('COMPLETE', 'FAILED') AND updated_at < ?1",
                params![cutoff],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        if deleted > 0 {
            info!(count = deleted, "Purged terminal cards");
        }
        Ok(deleted as usize)
    }

    // ── Agent registry ──────────────────────────────────────────────

    /// Idempotent presence upsert. Agents are never hard-deleted.
    pub async fn upsert_agent(
        &self,
        agent_id: &str,
        status: AgentStatus,
        coding_id: &str,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO agents (agent_id, status, updated_at, coding_id) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(agent_id) DO UPDATE SET status = ?2, updated_at = ?3",
                params![agent_id, status.as_str(), now, coding_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(())
    }

    /// Read an agent's presence row.
    pub async fn get_agent(&self, agent_id: &str) -> Result<Option<AgentRecord>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT agent_id, status, updated_at, coding_id FROM agents WHERE agent_id = ?1",
                params![agent_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            Some(row) => {
                let updated: String = row.get(2).map_err(|e| DatabaseError::Query(e.to_string()))?;
                Ok(Some(AgentRecord {
                    agent_id: row.get(0).map_err(|e| DatabaseError::Query(e.to_string()))?,
                    status: row.get(1).map_err(|e| DatabaseError::Query(e.to_string()))?,
                    updated_at: parse_datetime(&updated),
                    coding_id: row.get::<String>(3).ok(),
                }))
            }
            None => Ok(None),
        }
    }

    // ── Continuity state ────────────────────────────────────────────

    /// Save (overwrite) an agent's active plan.
    pub async fn save_plan(&self, agent_id: &str, plan: &ActivePlan) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT OR REPLACE INTO active_plans \
                 (agent_id, plan_name, content, current_step, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    agent_id,
                    plan.plan_name.as_str(),
                    plan.content.as_str(),
                    plan.current_step,
                    now
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(())
    }

    /// Read an agent's active plan, if any.
    pub async fn get_plan(&self, agent_id: &str) -> Result<Option<ActivePlan>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT plan_name, content, current_step FROM active_plans WHERE agent_id = ?1",
                params![agent_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            Some(row) => Ok(Some(ActivePlan {
                plan_name: row.get(0).map_err(|e| DatabaseError::Query(e.to_string()))?,
                content: row.get(1).map_err(|e| DatabaseError::Query(e.to_string()))?,
                current_step: row.get(2).map_err(|e| DatabaseError::Query(e.to_string()))?,
            })),
            None => Ok(None),
        }
    }

    /// Remove an agent's active plan.
    pub async fn clear_plan(&self, agent_id: &str) -> Result<(), DatabaseError> {
        self.conn
            .execute(
                "DELETE FROM active_plans WHERE agent_id = ?1",
                params![agent_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(())
    }

    /// Save (overwrite) an agent's memory snapshot.
    pub async fn save_snapshot(
        &self,
        agent_id: &str,
        memory: &serde_json::Value,
    ) -> Result<(), DatabaseError> {
        let dump = serde_json::to_string(memory)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT OR REPLACE INTO cognitive_snapshots (agent_id, memory_dump, timestamp) \
                 VALUES (?1, ?2, ?3)",
                params![agent_id, dump, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(())
    }

    /// Read an agent's latest memory snapshot.
    pub async fn load_snapshot(
        &self,
        agent_id: &str,
    ) -> Result<Option<(serde_json::Value, DateTime<Utc>)>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT memory_dump, timestamp FROM cognitive_snapshots WHERE agent_id = ?1",
                params![agent_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            Some(row) => {
                let dump: String = row.get(0).map_err(|e| DatabaseError::Query(e.to_string()))?;
                let ts: String = row.get(1).map_err(|e| DatabaseError::Query(e.to_string()))?;
                let memory = serde_json::from_str(&dump)
                    .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
                Ok(Some((memory, parse_datetime(&ts))))
            }
            None => Ok(None),
        }
    }

    // ── Experience log ──────────────────────────────────────────────

    /// Insert experience entries under their deterministic global ids.
    ///
    /// `INSERT OR IGNORE`: an id that is already present is skipped, so a
    /// repeated sync after a partial failure cannot duplicate rows. Returns
    /// the number of rows actually inserted.
    pub async fn insert_experience(
        &self,
        entries: &[SharedExperience],
    ) -> Result<usize, DatabaseError> {
        let mut inserted = 0usize;
        for entry in entries {
            let n = self
                .conn
                .execute(
                    "INSERT OR IGNORE INTO experience_log \
                     (id, agent_id, event_type, context, success, details, timestamp) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        entry.id.as_str(),
                        entry.agent_id.as_str(),
                        entry.event_type.as_str(),
                        entry.context.as_str(),
                        entry.success as i64,
                        entry.details.as_str(),
                        entry.timestamp.as_str()
                    ],
                )
                .await
                .map_err(|e| DatabaseError::Query(e.to_string()))?;
            inserted += n as usize;
        }
        Ok(inserted)
    }

    /// Count shared experience rows for an agent.
    pub async fn experience_count(&self, agent_id: &str) -> Result<usize, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM experience_log WHERE agent_id = ?1",
                params![agent_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            Some(row) => {
                let n: i64 = row.get(0).map_err(|e| DatabaseError::Query(e.to_string()))?;
                Ok(n as usize)
            }
            None => Ok(0),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Per-connection setup. Concurrent claimers contend for the write lock;
/// without a busy timeout a second `BEGIN IMMEDIATE` fails instead of
/// waiting its turn.
pub(crate) async fn configure(conn: &Connection) -> Result<(), DatabaseError> {
    let mut rows = conn
        .query("PRAGMA busy_timeout = 5000", ())
        .await
        .map_err(|e| DatabaseError::Open(e.to_string()))?;
    // PRAGMA replies with the applied value
    let _ = rows.next().await;
    Ok(())
}

fn is_unique_violation(e: &libsql::Error) -> bool {
    e.to_string().contains("UNIQUE constraint failed")
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

/// Map a libsql row to a Card. Column order matches JOB_COLUMNS.
fn row_to_card(row: &libsql::Row) -> Result<Card, DatabaseError> {
    let payload_str: String = row.get(4).map_err(|e| DatabaseError::Query(e.to_string()))?;
    let status_str: String = row.get(5).map_err(|e| DatabaseError::Query(e.to_string()))?;
    let created_str: String = row.get(8).map_err(|e| DatabaseError::Query(e.to_string()))?;
    let updated_str: String = row.get(9).map_err(|e| DatabaseError::Query(e.to_string()))?;

    // Payload text that isn't valid JSON is preserved as a string so the
    // policy layer can reject it instead of the store guessing.
    let payload = serde_json::from_str(&payload_str)
        .unwrap_or_else(|_| serde_json::Value::String(payload_str.clone()));

    Ok(Card {
        correlation_id: row.get(0).map_err(|e| DatabaseError::Query(e.to_string()))?,
        idempotency_key: row.get(1).map_err(|e| DatabaseError::Query(e.to_string()))?,
        priority: row.get(2).map_err(|e| DatabaseError::Query(e.to_string()))?,
        cost_center: row.get(3).map_err(|e| DatabaseError::Query(e.to_string()))?,
        payload,
        status: CardStatus::parse(&status_str),
        result: row.get::<String>(6).ok(),
        worker: row.get::<String>(7).ok(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}
