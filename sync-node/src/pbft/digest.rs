//! Canonical-JSON request digests and placeholder message signatures.
//!
//! `serde_json::Value` doesn't sort map keys on its own, so canonicalizing
//! means walking the tree and rebuilding every object with a `BTreeMap`
//! before hashing with sha256.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: std::collections::BTreeMap<String, Value> =
                map.iter().map(|(k, v)| (k.clone(), canonicalize(v))).collect();
            let mut out = Map::new();
            for (k, v) in sorted {
                out.insert(k, v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// sha256 hex digest of `request`'s canonical JSON form.
pub fn compute_digest(request: &Value) -> String {
    let canonical = canonicalize(request);
    let bytes = serde_json::to_vec(&canonical).expect("canonicalized value always serializes");
    hex::encode(Sha256::digest(bytes))
}

/// Sign the identifying fields of a protocol message. This is not a real
/// cryptographic signature (no private key, no asymmetric verification);
/// it exists to let `/pbft/simulate-byzantine` demonstrate
/// signature-mismatch detection.
pub fn sign_message(msg_type: &str, view: u64, sequence: u64, digest: &str, node_id: &str) -> String {
    let material = format!("{msg_type}:{view}:{sequence}:{digest}:{node_id}");
    hex::encode(Sha256::digest(material.as_bytes()))
}

pub fn verify_signature(msg_type: &str, view: u64, sequence: u64, digest: &str, node_id: &str, signature: &str) -> bool {
    sign_message(msg_type, view, sequence, digest, node_id) == signature
}
