//! End-to-end queue behavior across concurrent claimers and full agents.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use workdeck::agent::Agent;
use workdeck::cards::model::{CardStatus, NewCard};
use workdeck::config::AgentConfig;
use workdeck::store::JobStore;

fn agent_config(dir: &TempDir, agent_id: &str) -> AgentConfig {
    AgentConfig {
        agent_id: agent_id.into(),
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

#[tokio::test]
async fn one_card_many_claimers_exactly_one_winner() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(JobStore::open(&dir.path().join("deck.db")).await.unwrap());

    store
        .submit(NewCard::new(
            "contested",
            50,
            "TEST",
            json!({"instruction": "SLEEP"}),
        ))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for n in 0..8 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store.claim(&format!("worker-{n}")).await.unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1, "exactly one claimer must receive the card");
}

#[tokio::test]
async fn higher_priority_completes_before_lower_is_claimed() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("work")).unwrap();
    let agent = Agent::connect(agent_config(&dir, "solo")).await.unwrap();

    let urgent = NewCard::new("urgent", 99, "OPS", json!({"instruction": "SLEEP"}));
    let routine = NewCard::new("routine", 10, "MKT", json!({"instruction": "SLEEP"}));
    let urgent_id = urgent.correlation_id.clone();
    let routine_id = routine.correlation_id.clone();
    agent.store().submit(urgent).await.unwrap();
    agent.store().submit(routine).await.unwrap();

    assert!(agent.process_one().await.unwrap());

    let urgent_card = agent.store().get(&urgent_id).await.unwrap().unwrap();
    let routine_card = agent.store().get(&routine_id).await.unwrap().unwrap();
    assert_eq!(urgent_card.status, CardStatus::Complete);
    assert_eq!(routine_card.status, CardStatus::Pending);
    assert!(routine_card.worker.is_none());
}

#[tokio::test]
async fn two_agents_share_one_store() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("work")).unwrap();
    let a = Agent::connect(agent_config(&dir, "alpha")).await.unwrap();
    let b = Agent::connect(agent_config(&dir, "beta")).await.unwrap();
    a.boot().await.unwrap();
    b.boot().await.unwrap();

    for n in 0..4 {
        a.store()
            .submit(NewCard::new(
                format!("card-{n}"),
                50,
                "TEST",
                json!({"instruction": "SLEEP"}),
            ))
            .await
            .unwrap();
    }

    let (ra, rb) = tokio::join!(
        async {
            let mut done = 0;
            while a.process_one().await.unwrap() {
                done += 1;
            }
            done
        },
        async {
            let mut done = 0;
            while b.process_one().await.unwrap() {
                done += 1;
            }
            done
        }
    );

    // Every card processed exactly once between the two agents
    assert_eq!(ra + rb, 4);
    let complete = a
        .store()
        .query(Some(CardStatus::Complete), 10)
        .await
        .unwrap();
    assert_eq!(complete.len(), 4);

    // Both agents registered
    assert!(a.store().get_agent("alpha").await.unwrap().is_some());
    assert!(a.store().get_agent("beta").await.unwrap().is_some());
}

#[tokio::test]
async fn planning_handoff_roundtrip() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("work")).unwrap();
    let agent = Agent::connect(agent_config(&dir, "solo")).await.unwrap();

    // Intent card: not claimable until a planner promotes it
    let intent = NewCard::new(
        "intent-1",
        80,
        "OPS",
        json!({
            "instruction": "WAIT_FOR_PLANNER",
            "description": "create the widget module",
        }),
    );
    let id = intent.correlation_id.clone();
    agent.store().submit_for_coding(intent).await.unwrap();

    assert!(!agent.process_one().await.unwrap());

    // Planner produced an executable payload
    agent
        .store()
        .promote(
            &id,
            json!({
                "instruction": "SYSTEM_OP",
                "details": "echo widget built",
                "format": "shell",
            }),
        )
        .await
        .unwrap();

    assert!(agent.process_one().await.unwrap());
    let card = agent.store().get(&id).await.unwrap().unwrap();
    assert_eq!(card.status, CardStatus::Complete);
    assert!(card.result.unwrap().contains("widget built"));
}

#[tokio::test]
async fn outcome_lands_in_both_stores_and_experience_log() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("work")).unwrap();
    let agent = Agent::connect(agent_config(&dir, "solo")).await.unwrap();

    let card = NewCard::new("audit-1", 50, "TEST", json!({"instruction": "FAIL"}));
    let id = card.correlation_id.clone();
    agent.store().submit(card).await.unwrap();
    agent.process_one().await.unwrap();

    // Shared store: terminal status with a non-empty audit result
    let shared = agent.store().get(&id).await.unwrap().unwrap();
    assert_eq!(shared.status, CardStatus::Failed);
    assert!(!shared.result.as_deref().unwrap().is_empty());

    // Local cache mirrors the outcome
    let (status, result) = agent.cache().local_job(&id).await.unwrap().unwrap();
    assert_eq!(status, "FAILED");
    assert!(result.is_some());

    // Experience was synced to the shared log
    assert!(agent.store().experience_count("solo").await.unwrap() >= 1);
    assert!(agent.cache().unsynced_entries().await.unwrap().is_empty());
}
