//! Card data model — the unit of queued work and its lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PolicyError;

/// Lifecycle status of a card.
///
/// `NEEDS_CODING` cards are invisible to claimers until a planning stage
/// promotes them to `PENDING`. `COMPLETE` and `FAILED` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CardStatus {
    /// Waiting for an upstream planner to attach an executable payload.
    NeedsCoding,
    /// Eligible for claiming.
    Pending,
    /// Claimed by a worker; execution in flight.
    Processing,
    /// Finished successfully.
    Complete,
    /// Finished unsuccessfully. Terminal; no automatic retry.
    Failed,
}

impl CardStatus {
    /// The database string for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NeedsCoding => "NEEDS_CODING",
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
        }
    }

    /// Parse a status string from the store. Accepts the legacy spellings
    /// `ASSIGNED` and `COMPLETED`; anything unrecognized reads as `Pending`.
    pub fn parse(s: &str) -> Self {
        match s {
            "NEEDS_CODING" => Self::NeedsCoding,
            "PROCESSING" | "ASSIGNED" => Self::Processing,
            "COMPLETE" | "COMPLETED" => Self::Complete,
            "FAILED" => Self::Failed,
            _ => Self::Pending,
        }
    }

    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: CardStatus) -> bool {
        use CardStatus::*;

        matches!(
            (self, target),
            (NeedsCoding, Pending)
                | (Pending, Processing)
                // Policy rejection at claim time, no dispatch
                | (Pending, Failed)
                | (Processing, Complete)
                | (Processing, Failed)
                // Administrative requeue
                | (Processing, Pending)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl std::fmt::Display for CardStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A card as stored: one unit of queued work.
///
/// `payload` is kept raw here; `CardPayload::from_value` normalizes it at the
/// dispatch boundary so a malformed payload fails the card instead of the
/// process.
#[derive(Debug, Clone)]
pub struct Card {
    pub correlation_id: String,
    pub idempotency_key: String,
    pub priority: i64,
    pub cost_center: String,
    pub payload: serde_json::Value,
    pub status: CardStatus,
    pub result: Option<String>,
    pub worker: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A card submission. `submit` inserts it as `PENDING`; `submit_for_coding`
/// as `NEEDS_CODING`.
#[derive(Debug, Clone)]
pub struct NewCard {
    pub correlation_id: String,
    pub idempotency_key: String,
    pub priority: i64,
    pub cost_center: String,
    pub payload: serde_json::Value,
}

impl NewCard {
    /// Create a submission with a generated correlation id.
    pub fn new(
        idempotency_key: impl Into<String>,
        priority: i64,
        cost_center: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            idempotency_key: idempotency_key.into(),
            priority,
            cost_center: cost_center.into(),
            payload,
        }
    }
}

/// Execution mode selector inside a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Instruction {
    OpsCycle,
    CodeChange,
    SystemOp,
    Sleep,
    Fail,
    /// Anything we don't recognize. Dispatched as a logged no-op so future
    /// instruction types cannot wedge the queue.
    #[serde(other)]
    Unknown,
}

/// Payload body format for executable payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadFormat {
    #[serde(rename = "shell")]
    Shell,
    #[serde(rename = "recipe", alias = "recipe.py")]
    Recipe,
}

/// The normalized payload of a card.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardPayload {
    pub instruction: Instruction,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub details: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub format: Option<PayloadFormat>,
}

impl CardPayload {
    /// Normalize a raw payload value into the canonical single-object form.
    ///
    /// Accepts a bare object or a singleton list wrapping one object; any
    /// other shape is rejected rather than guessed at.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, PolicyError> {
        let obj = match value {
            serde_json::Value::Object(_) => value,
            serde_json::Value::Array(items) if items.len() == 1 && items[0].is_object() => {
                &items[0]
            }
            serde_json::Value::Array(items) => {
                return Err(PolicyError::Malformed(format!(
                    "expected a single payload object, got a list of {}",
                    items.len()
                )));
            }
            other => {
                return Err(PolicyError::Malformed(format!(
                    "expected a payload object, got {}",
                    json_type_name(other)
                )));
            }
        };

        serde_json::from_value(obj.clone()).map_err(|e| PolicyError::Malformed(e.to_string()))
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "a list",
        serde_json::Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_transitions_valid() {
        assert!(CardStatus::NeedsCoding.can_transition_to(CardStatus::Pending));
        assert!(CardStatus::Pending.can_transition_to(CardStatus::Processing));
        assert!(CardStatus::Pending.can_transition_to(CardStatus::Failed));
        assert!(CardStatus::Processing.can_transition_to(CardStatus::Complete));
        assert!(CardStatus::Processing.can_transition_to(CardStatus::Failed));
        assert!(CardStatus::Processing.can_transition_to(CardStatus::Pending));
    }

    #[test]
    fn status_transitions_invalid() {
        assert!(!CardStatus::Complete.can_transition_to(CardStatus::Pending));
        assert!(!CardStatus::Failed.can_transition_to(CardStatus::Processing));
        assert!(!CardStatus::Pending.can_transition_to(CardStatus::Complete));
        assert!(!CardStatus::NeedsCoding.can_transition_to(CardStatus::Processing));
    }

    #[test]
    fn terminal_states() {
        assert!(CardStatus::Complete.is_terminal());
        assert!(CardStatus::Failed.is_terminal());
        assert!(!CardStatus::Pending.is_terminal());
        assert!(!CardStatus::Processing.is_terminal());
    }

    #[test]
    fn status_parse_roundtrip() {
        for status in [
            CardStatus::NeedsCoding,
            CardStatus::Pending,
            CardStatus::Processing,
            CardStatus::Complete,
            CardStatus::Failed,
        ] {
            assert_eq!(CardStatus::parse(status.as_str()), status);
        }
        // Legacy spellings
        assert_eq!(CardStatus::parse("ASSIGNED"), CardStatus::Processing);
        assert_eq!(CardStatus::parse("COMPLETED"), CardStatus::Complete);
    }

    #[test]
    fn payload_from_bare_object() {
        let payload = CardPayload::from_value(&json!({
            "instruction": "SYSTEM_OP",
            "details": "echo hi",
            "format": "shell"
        }))
        .unwrap();
        assert_eq!(payload.instruction, Instruction::SystemOp);
        assert_eq!(payload.format, Some(PayloadFormat::Shell));
    }

    #[test]
    fn payload_from_singleton_list() {
        let payload = CardPayload::from_value(&json!([{
            "instruction": "SLEEP",
            "description": "fixture"
        }]))
        .unwrap();
        assert_eq!(payload.instruction, Instruction::Sleep);
        assert_eq!(payload.description, "fixture");
    }

    #[test]
    fn payload_rejects_other_shapes() {
        assert!(CardPayload::from_value(&json!("just a string")).is_err());
        assert!(CardPayload::from_value(&json!([1, 2, 3])).is_err());
        assert!(
            CardPayload::from_value(&json!([
                {"instruction": "SLEEP"},
                {"instruction": "SLEEP"}
            ]))
            .is_err()
        );
        assert!(CardPayload::from_value(&json!(null)).is_err());
    }

    #[test]
    fn unknown_instruction_is_tolerated() {
        let payload = CardPayload::from_value(&json!({
            "instruction": "WAIT_FOR_PLANNER"
        }))
        .unwrap();
        assert_eq!(payload.instruction, Instruction::Unknown);
    }

    #[test]
    fn recipe_format_accepts_legacy_alias() {
        let payload = CardPayload::from_value(&json!({
            "instruction": "OPS_CYCLE",
            "details": "print('hi')",
            "format": "recipe.py"
        }))
        .unwrap();
        assert_eq!(payload.format, Some(PayloadFormat::Recipe));
    }
}
