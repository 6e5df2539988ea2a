//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Agent configuration. Constructed once at startup and passed by reference
/// into each component; nothing reads ambient globals.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Agent id. Also the `worker` value written on claimed cards.
    pub agent_id: String,
    /// Directory holding the per-agent local cache databases and logs.
    pub data_dir: PathBuf,
    /// Path to the shared store database file.
    pub shared_db_path: PathBuf,
    /// Working root for shell commands, file writes, and git operations.
    pub workspace_root: PathBuf,
    /// Sleep between empty polls.
    pub poll_interval: Duration,
    /// Upper bound for the poll backoff (doubles from `poll_interval`).
    pub poll_backoff_max: Duration,
    /// Timeout applied to every dispatched subprocess.
    pub command_timeout: Duration,
    /// Interpreter used to execute recipe payloads.
    pub recipe_interpreter: String,
    /// Maximum serialized payload size admitted for execution.
    pub max_payload_bytes: usize,
    /// Main line branch name for the change lifecycle.
    pub main_branch: String,
    /// Remote name for the change lifecycle.
    pub git_remote: String,
    /// Duration of the SLEEP test instruction.
    pub sleep_pause: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: "worker-0".to_string(),
            data_dir: PathBuf::from("./data"),
            shared_db_path: PathBuf::from("./data/workdeck.db"),
            workspace_root: PathBuf::from("."),
            poll_interval: Duration::from_secs(2),
            poll_backoff_max: Duration::from_secs(30),
            command_timeout: Duration::from_secs(120),
            recipe_interpreter: "python3".to_string(),
            max_payload_bytes: 4096,
            main_branch: "main".to_string(),
            git_remote: "origin".to_string(),
            sleep_pause: Duration::from_millis(500),
        }
    }
}

impl AgentConfig {
    /// Build a configuration from `WORKDECK_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(id) = std::env::var("WORKDECK_AGENT_ID") {
            config.agent_id = id;
        }
        if let Ok(dir) = std::env::var("WORKDECK_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
            config.shared_db_path = config.data_dir.join("workdeck.db");
        }
        if let Ok(path) = std::env::var("WORKDECK_DB_PATH") {
            config.shared_db_path = PathBuf::from(path);
        }
        if let Ok(root) = std::env::var("WORKDECK_WORKSPACE") {
            config.workspace_root = PathBuf::from(root);
        }
        if let Ok(secs) = std::env::var("WORKDECK_POLL_SECS") {
            config.poll_interval = Duration::from_secs(parse_u64("WORKDECK_POLL_SECS", &secs)?);
        }
        if let Ok(secs) = std::env::var("WORKDECK_CMD_TIMEOUT_SECS") {
            config.command_timeout =
                Duration::from_secs(parse_u64("WORKDECK_CMD_TIMEOUT_SECS", &secs)?);
        }
        if let Ok(bytes) = std::env::var("WORKDECK_MAX_PAYLOAD_BYTES") {
            config.max_payload_bytes =
                parse_u64("WORKDECK_MAX_PAYLOAD_BYTES", &bytes)? as usize;
        }
        if let Ok(interp) = std::env::var("WORKDECK_RECIPE_INTERPRETER") {
            config.recipe_interpreter = interp;
        }
        if let Ok(branch) = std::env::var("WORKDECK_MAIN_BRANCH") {
            config.main_branch = branch;
        }
        if let Ok(remote) = std::env::var("WORKDECK_GIT_REMOTE") {
            config.git_remote = remote;
        }

        Ok(config)
    }

    /// Path of this agent's local cache database.
    pub fn local_db_path(&self) -> PathBuf {
        self.data_dir.join(format!("agent_{}.db", self.agent_id))
    }

    /// Short uppercase handle recorded in the agent registry.
    pub fn coding_id(&self) -> String {
        self.agent_id
            .split(['-', '_'])
            .next()
            .unwrap_or(&self.agent_id)
            .to_uppercase()
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("expected an integer, got {value:?}"),
    })
}
