//! Payload admission policy.
//!
//! One card is one atomic unit of work; a payload that needs more than a few
//! kilobytes should have been split upstream. The check runs at claim time
//! rather than submission time so a policy change applies to backlog too.

use crate::error::PolicyError;

/// Default serialized-size ceiling for a card payload.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 4096;

/// Size/shape gate applied to every claimed card before dispatch.
#[derive(Debug, Clone)]
pub struct PayloadPolicy {
    max_bytes: usize,
}

impl PayloadPolicy {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }

    /// Validate a raw payload value. A violating card transitions straight
    /// to FAILED with the violation text as its result.
    pub fn validate(&self, payload: &serde_json::Value) -> Result<(), PolicyError> {
        let size = serde_json::to_string(payload)
            .map_err(|e| PolicyError::Malformed(e.to_string()))?
            .len();
        if size > self.max_bytes {
            return Err(PolicyError::PayloadTooLarge {
                size,
                max: self.max_bytes,
            });
        }
        Ok(())
    }
}

impl Default for PayloadPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn small_payload_passes() {
        let policy = PayloadPolicy::default();
        assert!(policy.validate(&json!({"instruction": "SLEEP"})).is_ok());
    }

    #[test]
    fn oversized_payload_rejected() {
        let policy = PayloadPolicy::new(64);
        let payload = json!({"instruction": "SYSTEM_OP", "details": "x".repeat(200)});
        let err = policy.validate(&payload).unwrap_err();
        assert!(matches!(err, PolicyError::PayloadTooLarge { .. }));
    }

    #[test]
    fn limit_is_inclusive() {
        let payload = json!({"d": "xx"});
        let size = serde_json::to_string(&payload).unwrap().len();
        assert!(PayloadPolicy::new(size).validate(&payload).is_ok());
        assert!(PayloadPolicy::new(size - 1).validate(&payload).is_err());
    }
}
