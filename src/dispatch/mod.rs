//! Dispatcher — routes a claimed card to the right executor.
//!
//! Every branch converts its outcome into a terminal `(status, result)`
//! pair; nothing here may propagate an error past the dispatch boundary, and
//! no branch may swallow subprocess output.

pub mod exec;

use std::path::{Component, Path};
use std::time::Duration;

use tracing::{info, warn};

use crate::cards::model::{Card, CardPayload, CardStatus, Instruction, PayloadFormat};
use crate::config::AgentConfig;
use crate::lifecycle::{ChangeLifecycle, has_conventional_prefix};

/// Terminal outcome of dispatching one card.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub status: CardStatus,
    pub result: String,
}

impl DispatchOutcome {
    fn complete(result: impl Into<String>) -> Self {
        Self {
            status: CardStatus::Complete,
            result: result.into(),
        }
    }

    fn failed(result: impl Into<String>) -> Self {
        Self {
            status: CardStatus::Failed,
            result: result.into(),
        }
    }
}

/// Executes cards according to their normalized payload.
pub struct Dispatcher {
    workspace_root: std::path::PathBuf,
    command_timeout: Duration,
    recipe_interpreter: String,
    sleep_pause: Duration,
    lifecycle: ChangeLifecycle,
}

impl Dispatcher {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            workspace_root: config.workspace_root.clone(),
            command_timeout: config.command_timeout,
            recipe_interpreter: config.recipe_interpreter.clone(),
            sleep_pause: config.sleep_pause,
            lifecycle: ChangeLifecycle::new(config),
        }
    }

    /// Execute a card. Always returns a terminal outcome.
    pub async fn execute(&self, card: &Card, payload: &CardPayload) -> DispatchOutcome {
        info!(
            card_id = %card.correlation_id,
            instruction = ?payload.instruction,
            description = %payload.description,
            "Dispatching card"
        );

        // Recipe payloads execute as code regardless of which change
        // instruction carried them.
        if payload.format == Some(PayloadFormat::Recipe) {
            return self.run_recipe(payload).await;
        }

        match payload.instruction {
            Instruction::OpsCycle | Instruction::CodeChange => {
                self.run_change(card, payload).await
            }
            Instruction::SystemOp => self.run_system_op(payload).await,
            Instruction::Sleep => {
                tokio::time::sleep(self.sleep_pause).await;
                DispatchOutcome::complete("slept")
            }
            Instruction::Fail => DispatchOutcome::failed("forced failure (FAIL instruction)"),
            Instruction::Unknown => {
                warn!(card_id = %card.correlation_id, "Unknown instruction; treating as no-op");
                DispatchOutcome::complete("ignored unrecognized instruction")
            }
        }
    }

    /// Materialize the payload's code to a temp file and run it under the
    /// configured interpreter. The temp file is removed regardless of
    /// outcome (dropped with the guard).
    async fn run_recipe(&self, payload: &CardPayload) -> DispatchOutcome {
        let tmp = match tempfile::NamedTempFile::new() {
            Ok(tmp) => tmp,
            Err(e) => return DispatchOutcome::failed(format!("recipe temp file: {e}")),
        };
        if let Err(e) = tokio::fs::write(tmp.path(), &payload.details).await {
            return DispatchOutcome::failed(format!("recipe write: {e}"));
        }

        let path = tmp.path().to_string_lossy().to_string();
        let run = exec::run_argv(
            &self.recipe_interpreter,
            &[&path],
            &self.workspace_root,
            self.command_timeout,
        )
        .await;

        match run {
            Ok(out) if out.success() => DispatchOutcome::complete(out.result_text()),
            Ok(out) => DispatchOutcome::failed(format!(
                "exit {}: {}",
                out.exit_code,
                out.result_text()
            )),
            Err(e) => DispatchOutcome::failed(e.to_string()),
        }
    }

    /// Run the payload's command text through the shell in the workspace
    /// root. This is the one intentionally shell-mode path.
    async fn run_system_op(&self, payload: &CardPayload) -> DispatchOutcome {
        if payload.details.trim().is_empty() {
            return DispatchOutcome::failed("SYSTEM_OP payload has no command text");
        }

        let run = exec::run_shell(
            &payload.details,
            &self.workspace_root,
            self.command_timeout,
        )
        .await;

        match run {
            Ok(out) if out.success() => DispatchOutcome::complete(out.result_text()),
            Ok(out) => DispatchOutcome::failed(format!(
                "exit {}: {}",
                out.exit_code,
                out.result_text()
            )),
            Err(e) => DispatchOutcome::failed(e.to_string()),
        }
    }

    /// Change cards: an optional file write, then the full change lifecycle.
    ///
    /// A CODE_CHANGE whose `context` names a path carries that file's
    /// contents in `details`; the commit message is generated. Otherwise
    /// `details` is the commit message itself, defaulted to `chore:` here if
    /// it lacks a conventional prefix.
    async fn run_change(&self, card: &Card, payload: &CardPayload) -> DispatchOutcome {
        let message = if payload.instruction == Instruction::CodeChange
            && !payload.context.is_empty()
            && !payload.details.is_empty()
        {
            let Some(target) = workspace_path(&self.workspace_root, &payload.context) else {
                return DispatchOutcome::failed(format!(
                    "refusing to write outside the workspace: {}",
                    payload.context
                ));
            };
            if let Some(parent) = target.parent() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    return DispatchOutcome::failed(format!("create {}: {e}", parent.display()));
                }
            }
            if let Err(e) = tokio::fs::write(&target, &payload.details).await {
                return DispatchOutcome::failed(format!("write {}: {e}", target.display()));
            }
            format!("feat: update {}", payload.context)
        } else {
            let details = payload.details.trim();
            if details.is_empty() {
                return DispatchOutcome::failed("change card has neither contents nor a message");
            }
            if has_conventional_prefix(details) {
                details.to_string()
            } else {
                format!("chore: {details}")
            }
        };

        match self.lifecycle.run(&card.correlation_id, &message).await {
            Ok(summary) => DispatchOutcome::complete(summary),
            Err(e) => DispatchOutcome::failed(e.to_string()),
        }
    }
}

/// Resolve a payload-supplied relative path inside the workspace root,
/// rejecting absolute paths and parent traversal.
fn workspace_path(root: &Path, relative: &str) -> Option<std::path::PathBuf> {
    let rel = Path::new(relative);
    if rel.is_absolute() {
        return None;
    }
    if rel
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return None;
    }
    Some(root.join(rel))
}
