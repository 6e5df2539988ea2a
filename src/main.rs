use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use workdeck::agent::Agent;
use workdeck::cards::model::NewCard;
use workdeck::config::AgentConfig;

const USAGE: &str = "Usage: workdeck <command>\n\
    \n\
    Commands:\n\
      boot | init        register presence and resume continuity state\n\
      work               process exactly one available card and exit\n\
      run                poll for cards until interrupted\n\
      submit <msg> [prio] queue an ops-cycle card from the command line\n\
      queue [status]     list recent cards";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AgentConfig::from_env()?;

    // Console log plus a non-blocking rolling file in the data dir
    std::fs::create_dir_all(&config.data_dir)?;
    let file_appender = tracing_appender::rolling::daily(&config.data_dir, "workdeck.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    let command = std::env::args().nth(1).unwrap_or_else(|| "boot".to_string());

    match command.as_str() {
        "boot" | "init" => {
            let agent = Agent::connect(config).await?;
            agent.boot().await?;
            println!("{}: ONLINE", agent.cache().agent_id());
        }
        "work" => {
            let agent = Agent::connect(config).await?;
            agent.boot().await?;
            if agent.process_one().await? {
                println!("processed one card");
            } else {
                println!("no cards available");
            }
        }
        "run" => {
            let agent = Agent::connect(config).await?;
            agent.boot().await?;

            let shutdown = Arc::new(AtomicBool::new(false));
            let flag = Arc::clone(&shutdown);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("\nshutting down after current card...");
                    flag.store(true, Ordering::Relaxed);
                }
            });

            agent.run(shutdown).await?;
        }
        "submit" => {
            let message = std::env::args()
                .nth(2)
                .ok_or_else(|| anyhow::anyhow!("submit needs a message argument"))?;
            let priority: i64 = std::env::args()
                .nth(3)
                .map(|p| p.parse())
                .transpose()
                .map_err(|_| anyhow::anyhow!("priority must be an integer"))?
                .unwrap_or(50);

            let agent = Agent::connect(config).await?;
            let card = NewCard::new(
                format!("ops-{:016x}", stable_hash(&message)),
                priority,
                "OPS",
                serde_json::json!({
                    "instruction": "OPS_CYCLE",
                    "details": message,
                    "description": format!("CLI: {message}"),
                }),
            );
            let id = card.correlation_id.clone();
            agent.submit_quiet(card).await?;
            println!("queued {id}");
        }
        "queue" => {
            let status = std::env::args()
                .nth(2)
                .map(|s| workdeck::cards::CardStatus::parse(&s.to_uppercase()));

            let agent = Agent::connect(config).await?;
            let cards = agent.store().query(status, 10).await?;
            if cards.is_empty() {
                println!("queue is empty");
            }
            for card in cards {
                println!(
                    "{:<12} p{:<4} {}  {}",
                    card.status,
                    card.priority,
                    card.correlation_id,
                    card.result.as_deref().unwrap_or("-")
                );
            }
        }
        other => {
            eprintln!("unknown command: {other}\n{USAGE}");
            std::process::exit(2);
        }
    }

    Ok(())
}

fn stable_hash(s: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}
