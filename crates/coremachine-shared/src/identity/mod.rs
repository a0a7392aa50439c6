//! # Identity & hashing (spec.md §4.1)
//!
//! Deterministic job/task IDs from canonicalized parameters. Two callers
//! ever need this: submission (`compute_job_id`) and stage planning
//! (`compute_task_id`). Both are pure functions — no I/O, no clock.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// A 256-bit identifier, displayed as 64 lowercase hex characters.
///
/// Newtype over a fixed-size array rather than a bare `String` so that
/// `JobId` and `TaskId` can't be swapped at a call site by accident.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest256([u8; 32]);

impl Digest256 {
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let mut out = [0u8; 32];
        if bytes.len() != 32 {
            // hex::decode doesn't validate length; reuse its error type for
            // the "wrong length" case via an invalid-char sentinel is wrong,
            // so we just fall back to a manual length check below.
            return Err(hex::FromHexError::InvalidStringLength);
        }
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Digest256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Digest256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest256({})", hex::encode(self.0))
    }
}

impl serde::Serialize for Digest256 {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for Digest256 {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest256::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Serialize `value` to canonical JSON: object keys sorted lexicographically,
/// no insignificant whitespace. `serde_json::Value`'s `Map` is a `BTreeMap`
/// by default (the `preserve_order` feature is not enabled anywhere in this
/// workspace), so `to_string` on a `Value` already yields sorted keys at
/// every nesting level.
fn canonical_json(value: &Value) -> String {
    value.to_string()
}

/// Filter parameter keys beginning with `_` (reserved for internal flags)
/// before canonicalization, per spec.md §4.1 step 1.
fn strip_reserved_keys(params: &Value) -> Value {
    match params {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !k.starts_with('_'))
                .map(|(k, v)| (k.clone(), strip_reserved_keys(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(strip_reserved_keys).collect()),
        other => other.clone(),
    }
}

/// `compute_job_id(job_type, parameters)` — spec.md §4.1.
pub fn compute_job_id(job_type: &str, parameters: &Value) -> Digest256 {
    let filtered = strip_reserved_keys(parameters);
    let canonical = canonical_json(&filtered);
    let input = format!("{job_type}:{canonical}");
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    Digest256(hasher.finalize().into())
}

/// `compute_task_id(job_id, stage_number, discriminator)` — spec.md §4.1.
pub fn compute_task_id(job_id: Digest256, stage_number: i32, discriminator: &str) -> Digest256 {
    let input = format!("{job_id}:stage{stage_number}:{discriminator}");
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    Digest256(hasher.finalize().into())
}

/// Advisory lock key for `hash(job_id, stage)` (spec.md §4.3 step 1),
/// namespaced into the high 32 bits per `advisory_lock_namespace` (spec.md
/// §6 configuration table) so this engine's locks can't collide with an
/// unrelated use of the same Postgres instance's advisory lock space.
pub fn stage_completion_lock_key(job_id: Digest256, stage_number: i32, namespace: u32) -> i64 {
    let mut hasher = Sha256::new();
    hasher.update(job_id.as_bytes());
    hasher.update(stage_number.to_be_bytes());
    let digest = hasher.finalize();
    let low32 = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    ((namespace as i64) << 32) | (low32 as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn job_id_is_deterministic() {
        let params = json!({"b": 2, "a": 1});
        let id1 = compute_job_id("echo", &params);
        let id2 = compute_job_id("echo", &params);
        assert_eq!(id1, id2);
    }

    #[test]
    fn job_id_ignores_key_order() {
        let params_a = json!({"a": 1, "b": 2});
        let params_b = json!({"b": 2, "a": 1});
        assert_eq!(
            compute_job_id("echo", &params_a),
            compute_job_id("echo", &params_b)
        );
    }

    #[test]
    fn job_id_ignores_reserved_keys() {
        let with_reserved = json!({"a": 1, "_trace": "xyz"});
        let without_reserved = json!({"a": 1});
        assert_eq!(
            compute_job_id("echo", &with_reserved),
            compute_job_id("echo", &without_reserved)
        );
    }

    #[test]
    fn job_id_differs_by_job_type() {
        let params = json!({"a": 1});
        assert_ne!(
            compute_job_id("echo", &params),
            compute_job_id("fanout", &params)
        );
    }

    #[test]
    fn task_id_is_deterministic_and_scoped_to_stage() {
        let job_id = compute_job_id("echo", &json!({"a": 1}));
        let t1 = compute_task_id(job_id, 1, "only");
        let t2 = compute_task_id(job_id, 1, "only");
        let t3 = compute_task_id(job_id, 2, "only");
        assert_eq!(t1, t2);
        assert_ne!(t1, t3);
    }

    #[test]
    fn digest_round_trips_through_hex() {
        let id = compute_job_id("echo", &json!({"a": 1}));
        let s = id.to_string();
        assert_eq!(s.len(), 64);
        assert_eq!(Digest256::from_hex(&s).unwrap(), id);
    }

    #[test]
    fn lock_key_is_namespaced() {
        let job_id = compute_job_id("echo", &json!({"a": 1}));
        let k1 = stage_completion_lock_key(job_id, 1, 0x434F5245);
        let k2 = stage_completion_lock_key(job_id, 1, 0x11111111);
        assert_ne!(k1, k2);
        assert_eq!((k1 >> 32) as u32, 0x434F5245);
    }
}
