//! Local cache — a per-agent durable buffer over the shared store.
//!
//! Every claim is mirrored locally before the card is handed to the caller,
//! and every observation lands in a local event log first. The shared store
//! stays authoritative for ownership; the cache exists so a crash or a
//! temporarily unreachable store never loses what this agent saw or did.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use libsql::{Connection, params};
use tracing::{debug, info, warn};

use crate::cards::model::{Card, CardStatus};
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::shared::{AgentStatus, JobStore, SharedExperience};

/// An entry in the agent's local experience log.
#[derive(Debug, Clone)]
pub struct ExperienceLogEntry {
    pub local_id: i64,
    pub event_type: String,
    pub context: String,
    pub success: bool,
    pub details: String,
    pub timestamp: String,
    pub synced: bool,
}

/// Per-agent durable cache and sync endpoint.
pub struct LocalCache {
    agent_id: String,
    coding_id: String,
    #[allow(dead_code)]
    db: Arc<libsql::Database>,
    conn: Connection,
    store: Arc<JobStore>,
}

impl LocalCache {
    /// Open (or create) the agent's local database and run migrations.
    pub async fn open(
        agent_id: &str,
        coding_id: &str,
        path: &Path,
        store: Arc<JobStore>,
    ) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Open(format!("Failed to create cache directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Open(format!("Failed to open local cache: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Open(format!("Failed to create connection: {e}")))?;
        crate::store::shared::configure(&conn).await?;

        migrations::run_local(&conn).await?;
        info!(agent_id, path = %path.display(), "Local cache opened");

        Ok(Self {
            agent_id: agent_id.to_string(),
            coding_id: coding_id.to_string(),
            db: Arc::new(db),
            conn,
            store,
        })
    }

    /// Claim the next eligible card and mirror it locally before returning.
    ///
    /// The mirror write happens before the caller sees the card, so a crash
    /// right after claiming leaves a durable record of ownership.
    pub async fn get_job(&self) -> Result<Option<Card>, DatabaseError> {
        let Some(card) = self.store.claim(&self.agent_id).await? else {
            return Ok(None);
        };

        let payload = serde_json::to_string(&card.payload)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let now = Utc::now().to_rfc3339();

        self.conn
            .execute(
                "INSERT OR REPLACE INTO local_jobs (id, status, payload, result, updated_at) \
                 VALUES (?1, ?2, ?3, NULL, ?4)",
                params![
                    card.correlation_id.as_str(),
                    card.status.as_str(),
                    payload,
                    now
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        Ok(Some(card))
    }

    /// Record a card's outcome locally, then best-effort propagate to the
    /// shared store. A shared-store failure is logged, not returned: the
    /// local record survives and the operator can reconcile.
    pub async fn update_job(
        &self,
        correlation_id: &str,
        status: CardStatus,
        result: &str,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE local_jobs SET status = ?1, result = ?2, updated_at = ?3 WHERE id = ?4",
                params![status.as_str(), result, now, correlation_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        if let Err(e) = self.store.update_status(correlation_id, status, result).await {
            warn!(card_id = %correlation_id, error = %e, "Shared store update failed; outcome kept locally");
        }

        Ok(())
    }

    /// Append an experience entry locally, then attempt a sync.
    ///
    /// The local append is the durability point; the sync is opportunistic
    /// and its failure is not an error here.
    pub async fn log_experience(
        &self,
        event_type: &str,
        context: &str,
        success: bool,
        details: serde_json::Value,
    ) -> Result<(), DatabaseError> {
        let details = serde_json::to_string(&details)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let now = Utc::now().to_rfc3339();

        self.conn
            .execute(
                "INSERT INTO event_log (event_type, context, success, details, timestamp) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![event_type, context, success as i64, details, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        if let Err(e) = self.sync().await {
            debug!(error = %e, "Deferred experience sync; entries stay buffered");
        }

        Ok(())
    }

    /// Push all unsynced experience entries to the shared store and refresh
    /// this agent's presence row.
    ///
    /// Entries are marked synced locally only after the shared write
    /// succeeds; shared ids are derived from `(agent, local id, timestamp)`
    /// so a repeat after partial failure inserts nothing twice. Returns the
    /// number of entries pushed.
    pub async fn sync(&self) -> Result<usize, DatabaseError> {
        let unsynced = self.unsynced_entries().await?;

        if !unsynced.is_empty() {
            let entries: Vec<SharedExperience> = unsynced
                .iter()
                .map(|e| SharedExperience {
                    id: format!("{}-{}-{}", self.agent_id, e.local_id, e.timestamp),
                    agent_id: self.agent_id.clone(),
                    event_type: e.event_type.clone(),
                    context: e.context.clone(),
                    success: e.success,
                    details: e.details.clone(),
                    timestamp: e.timestamp.clone(),
                })
                .collect();

            self.store.insert_experience(&entries).await?;

            for entry in &unsynced {
                self.conn
                    .execute(
                        "UPDATE event_log SET synced = 1 WHERE id = ?1",
                        params![entry.local_id],
                    )
                    .await
                    .map_err(|e| DatabaseError::Query(e.to_string()))?;
            }

            debug!(count = unsynced.len(), "Experience entries synced");
        }

        self.store
            .upsert_agent(&self.agent_id, AgentStatus::Online, &self.coding_id)
            .await?;

        Ok(unsynced.len())
    }

    /// All local entries not yet pushed to the shared log, oldest first.
    pub async fn unsynced_entries(&self) -> Result<Vec<ExperienceLogEntry>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, event_type, context, success, details, timestamp, synced \
                 FROM event_log WHERE synced = 0 ORDER BY id ASC",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        let mut entries = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            let success: i64 = row.get(3).map_err(|e| DatabaseError::Query(e.to_string()))?;
            let synced: i64 = row.get(6).map_err(|e| DatabaseError::Query(e.to_string()))?;
            entries.push(ExperienceLogEntry {
                local_id: row.get(0).map_err(|e| DatabaseError::Query(e.to_string()))?,
                event_type: row.get(1).map_err(|e| DatabaseError::Query(e.to_string()))?,
                context: row.get(2).map_err(|e| DatabaseError::Query(e.to_string()))?,
                success: success != 0,
                details: row.get(4).map_err(|e| DatabaseError::Query(e.to_string()))?,
                timestamp: row.get(5).map_err(|e| DatabaseError::Query(e.to_string()))?,
                synced: synced != 0,
            });
        }
        Ok(entries)
    }

    /// Read a mirrored card's local status/result (diagnostics).
    pub async fn local_job(
        &self,
        correlation_id: &str,
    ) -> Result<Option<(String, Option<String>)>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT status, result FROM local_jobs WHERE id = ?1",
                params![correlation_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            Some(row) => Ok(Some((
                row.get(0).map_err(|e| DatabaseError::Query(e.to_string()))?,
                row.get::<String>(1).ok(),
            ))),
            None => Ok(None),
        }
    }

    /// The agent id this cache belongs to.
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cards::model::NewCard;
    use serde_json::json;
    use tempfile::TempDir;

    async fn fixture(dir: &TempDir) -> (Arc<JobStore>, LocalCache) {
        let store = Arc::new(JobStore::open(&dir.path().join("deck.db")).await.unwrap());
        let cache = LocalCache::open(
            "smith",
            "SMITH",
            &dir.path().join("agent_smith.db"),
            Arc::clone(&store),
        )
        .await
        .unwrap();
        (store, cache)
    }

    #[tokio::test]
    async fn get_job_mirrors_claim_locally() {
        let dir = TempDir::new().unwrap();
        let (store, cache) = fixture(&dir).await;

        let card = NewCard::new("m-1", 50, "TEST", json!({"instruction": "SLEEP"}));
        let id = card.correlation_id.clone();
        store.submit(card).await.unwrap();

        let claimed = cache.get_job().await.unwrap().unwrap();
        assert_eq!(claimed.correlation_id, id);

        let (status, result) = cache.local_job(&id).await.unwrap().unwrap();
        assert_eq!(status, "PROCESSING");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn update_job_writes_both_sides() {
        let dir = TempDir::new().unwrap();
        let (store, cache) = fixture(&dir).await;

        let card = NewCard::new("u-1", 50, "TEST", json!({"instruction": "SLEEP"}));
        let id = card.correlation_id.clone();
        store.submit(card).await.unwrap();
        cache.get_job().await.unwrap().unwrap();

        cache
            .update_job(&id, CardStatus::Complete, "ok")
            .await
            .unwrap();

        let (status, result) = cache.local_job(&id).await.unwrap().unwrap();
        assert_eq!(status, "COMPLETE");
        assert_eq!(result.as_deref(), Some("ok"));

        let shared = store.get(&id).await.unwrap().unwrap();
        assert_eq!(shared.status, CardStatus::Complete);
        assert_eq!(shared.result.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn log_experience_syncs_to_shared_log() {
        let dir = TempDir::new().unwrap();
        let (store, cache) = fixture(&dir).await;

        cache
            .log_experience("JOB_COMPLETE", "m-1", true, json!({"out": "hi"}))
            .await
            .unwrap();

        assert_eq!(store.experience_count("smith").await.unwrap(), 1);
        assert!(cache.unsynced_entries().await.unwrap().is_empty());

        // Presence was refreshed as part of the sync
        let agent = store.get_agent("smith").await.unwrap().unwrap();
        assert_eq!(agent.status, "ONLINE");
    }

    #[tokio::test]
    async fn sync_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (store, cache) = fixture(&dir).await;

        cache
            .log_experience("BOOT_SEQUENCE", "boot", true, json!({}))
            .await
            .unwrap();

        // No new entries: repeated syncs push nothing and duplicate nothing
        assert_eq!(cache.sync().await.unwrap(), 0);
        assert_eq!(cache.sync().await.unwrap(), 0);
        assert_eq!(store.experience_count("smith").await.unwrap(), 1);
    }
}
