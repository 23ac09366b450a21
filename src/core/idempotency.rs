//! Idempotency keys for step execution.
//!
//! Executors receive a key that is stable across retries and re-invocations
//! of the same step with the same input, so side effects can be de-duplicated
//! downstream.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Generate the idempotency key for one step of one intent
///
/// Format: `{intent_id}:{sequence}:{hash(action, input)}`
pub fn generate_idempotency_key(
    intent_id: Uuid,
    sequence: u32,
    action: &str,
    input: &serde_json::Value,
) -> String {
    let material = format!("{}\n{}", action, input);
    format!("{}:{}:{}", intent_id, sequence, hash_input(&material))
}

/// Hash input content (first 16 chars of SHA256)
pub fn hash_input(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_idempotency_key_generation() {
        let intent_id = Uuid::new_v4();
        let input = json!({"service": "billing"});

        let key1 = generate_idempotency_key(intent_id, 2, "deployment:execute", &input);
        let key2 = generate_idempotency_key(intent_id, 2, "deployment:execute", &input);
        assert_eq!(key1, key2);

        let key3 = generate_idempotency_key(intent_id, 2, "deployment:execute", &json!({}));
        assert_ne!(key1, key3);

        let key4 = generate_idempotency_key(intent_id, 3, "deployment:execute", &input);
        assert_ne!(key1, key4);

        assert!(key1.starts_with(&format!("{}:2:", intent_id)));
    }

    #[test]
    fn test_hash_input() {
        let hash = hash_input("test input");
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
