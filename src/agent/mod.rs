//! Agent — claim, execute, report, repeat.
//!
//! One agent process owns one in-flight card at a time. The poll loop is the
//! only scheduler: claim through the local cache, gate the payload, dispatch,
//! write the outcome back, sleep with backoff when the queue is empty.
//! Execution problems become FAILED cards; only the operator stops the loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::json;
use tracing::{error, info, warn};

use crate::cards::model::{Card, CardPayload, CardStatus};
use crate::cards::policy::PayloadPolicy;
use crate::config::AgentConfig;
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::error::{Error, Result};
use crate::store::local::LocalCache;
use crate::store::shared::{AgentStatus, JobStore};

/// A worker agent bound to one shared store.
pub struct Agent {
    config: AgentConfig,
    store: Arc<JobStore>,
    cache: LocalCache,
    policy: PayloadPolicy,
    dispatcher: Dispatcher,
}

impl Agent {
    /// Open the shared store and this agent's local cache.
    pub async fn connect(config: AgentConfig) -> Result<Self> {
        let store = Arc::new(JobStore::open(&config.shared_db_path).await?);
        let cache = LocalCache::open(
            &config.agent_id,
            &config.coding_id(),
            &config.local_db_path(),
            Arc::clone(&store),
        )
        .await?;

        Ok(Self {
            policy: PayloadPolicy::new(config.max_payload_bytes),
            dispatcher: Dispatcher::new(&config),
            config,
            store,
            cache,
        })
    }

    /// Idempotent boot: register presence, resume continuity state, log it.
    pub async fn boot(&self) -> Result<()> {
        self.store
            .upsert_agent(
                &self.config.agent_id,
                AgentStatus::Ready,
                &self.config.coding_id(),
            )
            .await?;

        if let Some(plan) = self.store.get_plan(&self.config.agent_id).await? {
            info!(
                plan = %plan.plan_name,
                step = plan.current_step,
                "Resuming active plan"
            );
        }

        match self.store.load_snapshot(&self.config.agent_id).await? {
            Some((_, ts)) => info!(snapshot = %ts, "Restored memory snapshot"),
            None => info!("No continuity state; waiting for work"),
        }

        self.cache
            .log_experience(
                "BOOT_SEQUENCE",
                "boot",
                true,
                json!({
                    "agent": self.config.agent_id,
                    "coding_id": self.config.coding_id(),
                }),
            )
            .await?;

        info!(agent_id = %self.config.agent_id, "Agent online");
        Ok(())
    }

    /// Process at most one card. Returns whether a card was processed.
    ///
    /// Everything past the claim is converted into a card outcome: a policy
    /// violation, a malformed payload, or an executor error all end as
    /// FAILED with a diagnosable result, and the loop stays alive.
    pub async fn process_one(&self) -> Result<bool> {
        let Some(card) = self.cache.get_job().await? else {
            return Ok(false);
        };

        let card_id = card.correlation_id.clone();
        info!(card_id = %card_id, priority = card.priority, "Processing card");

        let outcome = self.handle(&card).await;
        let succeeded = outcome.status == CardStatus::Complete;

        self.cache
            .update_job(&card_id, outcome.status, &outcome.result)
            .await?;

        let event = if succeeded { "JOB_COMPLETE" } else { "JOB_FAILED" };
        if let Err(e) = self
            .cache
            .log_experience(
                event,
                &card_id,
                succeeded,
                json!({"result": snippet(&outcome.result)}),
            )
            .await
        {
            warn!(card_id = %card_id, error = %e, "Experience log write failed");
        }

        if let Err(e) = self
            .store
            .save_snapshot(
                &self.config.agent_id,
                &json!({"last_job": card_id, "status": outcome.status.as_str()}),
            )
            .await
        {
            warn!(error = %e, "Snapshot save failed");
        }

        info!(card_id = %card_id, status = %outcome.status, "Card finished");
        Ok(true)
    }

    /// Gate and dispatch one claimed card. Never returns an error.
    async fn handle(&self, card: &Card) -> DispatchOutcome {
        if let Err(violation) = self.policy.validate(&card.payload) {
            warn!(card_id = %card.correlation_id, %violation, "Payload rejected");
            return DispatchOutcome {
                status: CardStatus::Failed,
                result: violation.to_string(),
            };
        }

        let payload = match CardPayload::from_value(&card.payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(card_id = %card.correlation_id, error = %e, "Payload rejected");
                return DispatchOutcome {
                    status: CardStatus::Failed,
                    result: e.to_string(),
                };
            }
        };

        self.dispatcher.execute(card, &payload).await
    }

    /// Poll until the shutdown flag is set.
    ///
    /// Busy queue: claim again immediately. Empty queue: sleep, doubling up
    /// to the configured backoff cap. Store errors are logged and retried on
    /// the next cycle; they never kill the process.
    pub async fn run(&self, shutdown: Arc<AtomicBool>) -> Result<()> {
        info!(
            agent_id = %self.config.agent_id,
            interval = ?self.config.poll_interval,
            "Poll loop started"
        );

        let mut idle = self.config.poll_interval;

        while !shutdown.load(Ordering::Relaxed) {
            match self.process_one().await {
                Ok(true) => {
                    idle = self.config.poll_interval;
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    error!(error = %e, "Poll cycle failed; retrying next cycle");
                }
            }

            tokio::time::sleep(idle).await;
            idle = (idle * 2).min(self.config.poll_backoff_max);
        }

        info!(agent_id = %self.config.agent_id, "Poll loop stopped");
        if let Err(e) = self
            .store
            .upsert_agent(
                &self.config.agent_id,
                AgentStatus::Offline,
                &self.config.coding_id(),
            )
            .await
        {
            warn!(error = %e, "Failed to mark agent offline");
        }
        Ok(())
    }

    /// The shared store this agent works against.
    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    /// This agent's local cache.
    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    /// Submit a card, treating a duplicate idempotency key as already queued.
    pub async fn submit_quiet(&self, card: crate::cards::model::NewCard) -> Result<()> {
        match self.store.submit(card).await {
            Ok(()) => Ok(()),
            Err(crate::error::DatabaseError::DuplicateIdempotencyKey(key)) => {
                info!(key = %key, "Card already queued");
                Ok(())
            }
            Err(e) => Err(Error::Database(e)),
        }
    }
}

fn snippet(s: &str) -> String {
    s.chars().take(200).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cards::model::NewCard;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> AgentConfig {
        AgentConfig {
            agent_id: "smith".into(),
            data_dir: dir.path().join("data"),
            shared_db_path: dir.path().join("data/deck.db"),
            workspace_root: dir.path().join("work"),
            poll_interval: Duration::from_millis(10),
            poll_backoff_max: Duration::from_millis(50),
            sleep_pause: Duration::from_millis(5),
            command_timeout: Duration::from_secs(30),
            ..Default::default()
        }
    }

    async fn connect(dir: &TempDir) -> Agent {
        std::fs::create_dir_all(dir.path().join("work")).unwrap();
        Agent::connect(test_config(dir)).await.unwrap()
    }

    #[tokio::test]
    async fn boot_registers_presence() {
        let dir = TempDir::new().unwrap();
        let agent = connect(&dir).await;
        agent.boot().await.unwrap();

        let record = agent.store().get_agent("smith").await.unwrap().unwrap();
        // Boot marks READY; the experience sync that follows flips it ONLINE
        assert!(record.status == "READY" || record.status == "ONLINE");
        assert!(agent.store().experience_count("smith").await.unwrap() >= 1);

        // Boot twice: still one presence row
        agent.boot().await.unwrap();
        assert!(agent.store().get_agent("smith").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn processes_in_priority_order() {
        let dir = TempDir::new().unwrap();
        let agent = connect(&dir).await;

        let low = NewCard::new("low", 10, "TEST", serde_json::json!({"instruction": "SLEEP"}));
        let high = NewCard::new("high", 99, "TEST", serde_json::json!({"instruction": "SLEEP"}));
        let low_id = low.correlation_id.clone();
        let high_id = high.correlation_id.clone();
        agent.store().submit(low).await.unwrap();
        agent.store().submit(high).await.unwrap();

        // First pass completes the high-priority card while the low one is
        // still untouched
        assert!(agent.process_one().await.unwrap());
        let high_card = agent.store().get(&high_id).await.unwrap().unwrap();
        let low_card = agent.store().get(&low_id).await.unwrap().unwrap();
        assert_eq!(high_card.status, CardStatus::Complete);
        assert_eq!(low_card.status, CardStatus::Pending);

        assert!(agent.process_one().await.unwrap());
        let low_card = agent.store().get(&low_id).await.unwrap().unwrap();
        assert_eq!(low_card.status, CardStatus::Complete);

        // Queue drained
        assert!(!agent.process_one().await.unwrap());
    }

    #[tokio::test]
    async fn fail_instruction_ends_failed_with_result() {
        let dir = TempDir::new().unwrap();
        let agent = connect(&dir).await;

        let card = NewCard::new("f-1", 50, "TEST", serde_json::json!({"instruction": "FAIL"}));
        let id = card.correlation_id.clone();
        agent.store().submit(card).await.unwrap();

        agent.process_one().await.unwrap();

        let card = agent.store().get(&id).await.unwrap().unwrap();
        assert_eq!(card.status, CardStatus::Failed);
        assert!(!card.result.unwrap().is_empty());
    }

    #[tokio::test]
    async fn oversized_payload_fails_without_side_effects() {
        let dir = TempDir::new().unwrap();
        let agent = connect(&dir).await;

        // A SYSTEM_OP that would create a file, padded past the size limit
        let marker = dir.path().join("work/should-not-exist");
        let card = NewCard::new(
            "big-1",
            50,
            "TEST",
            serde_json::json!({
                "instruction": "SYSTEM_OP",
                "details": format!("touch {}", marker.display()),
                "context": "x".repeat(5000),
                "format": "shell"
            }),
        );
        let id = card.correlation_id.clone();
        agent.store().submit(card).await.unwrap();

        agent.process_one().await.unwrap();

        let card = agent.store().get(&id).await.unwrap().unwrap();
        assert_eq!(card.status, CardStatus::Failed);
        assert!(card.result.unwrap().contains("too large"));
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn malformed_payload_fails_cleanly() {
        let dir = TempDir::new().unwrap();
        let agent = connect(&dir).await;

        let card = NewCard::new("bad-1", 50, "TEST", serde_json::json!("not an object"));
        let id = card.correlation_id.clone();
        agent.store().submit(card).await.unwrap();

        agent.process_one().await.unwrap();

        let card = agent.store().get(&id).await.unwrap().unwrap();
        assert_eq!(card.status, CardStatus::Failed);
        assert!(card.result.unwrap().contains("payload"));
    }

    #[tokio::test]
    async fn submit_quiet_tolerates_duplicates() {
        let dir = TempDir::new().unwrap();
        let agent = connect(&dir).await;

        let payload = serde_json::json!({"instruction": "SLEEP"});
        agent
            .submit_quiet(NewCard::new("dup", 50, "TEST", payload.clone()))
            .await
            .unwrap();
        agent
            .submit_quiet(NewCard::new("dup", 50, "TEST", payload))
            .await
            .unwrap();

        assert_eq!(agent.store().query(None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn run_loop_stops_on_shutdown_flag() {
        let dir = TempDir::new().unwrap();
        let agent = Arc::new(connect(&dir).await);

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let runner = {
            let agent = Arc::clone(&agent);
            tokio::spawn(async move { agent.run(flag).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.store(true, Ordering::Relaxed);

        tokio::time::timeout(Duration::from_secs(2), runner)
            .await
            .expect("loop should stop promptly")
            .unwrap()
            .unwrap();

        let record = agent.store().get_agent("smith").await.unwrap().unwrap();
        assert_eq!(record.status, "OFFLINE");
    }
}
