//! Layered YAML configuration loading, canonicalization/hashing, and the
//! tuning knobs named in the platform's external-interfaces contract.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;

pub mod secrets;

/// Load + merge YAML files in order, then canonicalize to JSON and hash.
/// Later files override earlier files via deep-merge (e.g. `base.yaml` then
/// an environment overlay).
pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Default::default());

    for p in paths {
        let s = fs::read_to_string(p).with_context(|| format!("read config: {p}"))?;
        let yaml_val: serde_yaml::Value =
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml: {p}"))?;
        let json_val = serde_json::to_value(yaml_val).context("yaml->json conversion failed")?;
        deep_merge(&mut merged, json_val);
    }

    let canonical = canonicalize_json(&merged);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let hash = hex::encode(hasher.finalize());

    Ok(LoadedConfig {
        config_json: serde_json::from_str(&canonical).context("canonical json parse failed")?,
        canonical_json: canonical,
        config_hash: hash,
    })
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_json: Value,
    pub canonical_json: String,
    pub config_hash: String,
}

/// Deep-merge: objects merge recursively; arrays replaced; scalars overwritten.
fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        dst_map.insert(k, v);
                    }
                }
            }
        }
        (dst_slot, src_val) => {
            *dst_slot = src_val;
        }
    }
}

/// Canonicalize JSON by sorting all object keys recursively and emitting
/// compact JSON, so two configs with the same content but different key
/// order hash identically.
pub fn canonicalize_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).expect("json serialization must not fail")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

/// Tuning knobs named in the external-interfaces contract: tier selection,
/// publisher behavior, and drain-watcher behavior. Populated from
/// `config_json` by [`PlatformConfig::from_config_json`]; any field absent
/// from the loaded config falls back to its `Default`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// `in-memory | embedded | relational | streams | partitioned-log | auto`.
    pub tier: String,
    pub publisher_poll_interval_ms: u64,
    pub publisher_batch_size: i64,
    pub publisher_max_attempts: i32,
    pub publisher_lease_seconds: i64,
    pub publisher_soft_time_limit_ms: u64,
    pub publisher_hard_time_limit_ms: u64,
    pub drain_watcher_interval_ms: u64,
    pub drain_watcher_auto_complete: bool,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            tier: "auto".to_string(),
            publisher_poll_interval_ms: 1_000,
            publisher_batch_size: 50,
            publisher_max_attempts: 5,
            publisher_lease_seconds: 30,
            publisher_soft_time_limit_ms: 55_000,
            publisher_hard_time_limit_ms: 60_000,
            drain_watcher_interval_ms: 5_000,
            drain_watcher_auto_complete: true,
        }
    }
}

impl PlatformConfig {
    pub fn from_config_json(config_json: &Value) -> Self {
        match serde_json::from_value(config_json.clone()) {
            Ok(cfg) => cfg,
            Err(_) => Self::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn later_file_overrides_earlier_and_hash_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.yaml");
        let overlay = dir.path().join("prod.yaml");

        writeln!(
            fs::File::create(&base).unwrap(),
            "tier: in-memory\npublisher:\n  batch_size: 10\n"
        )
        .unwrap();
        writeln!(
            fs::File::create(&overlay).unwrap(),
            "tier: relational\n"
        )
        .unwrap();

        let loaded = load_layered_yaml(&[base.to_str().unwrap(), overlay.to_str().unwrap()])
            .unwrap();
        assert_eq!(loaded.config_json["tier"], "relational");
        assert_eq!(loaded.config_json["publisher"]["batch_size"], 10);

        let loaded_again =
            load_layered_yaml(&[base.to_str().unwrap(), overlay.to_str().unwrap()]).unwrap();
        assert_eq!(loaded.config_hash, loaded_again.config_hash);
    }

    #[test]
    fn platform_config_defaults_when_absent() {
        let cfg = PlatformConfig::from_config_json(&serde_json::json!({}));
        assert_eq!(cfg.tier, "auto");
        assert_eq!(cfg.publisher_batch_size, 50);
    }
}
