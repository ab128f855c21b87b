//! Cluster configuration document (§6), shaped after
//! `original_source/bin/create_config.go`'s `Config`/`Benchmark` structs.
//! Configuration loading itself (file I/O, CLI merging) is the binary
//! crate's job; this module only owns the JSON shape and parsing.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{PigpaxosError, Result};
use crate::id::Id;

/// The cluster-wide configuration document (§6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// `"Z.N"` -> transport URL, e.g. `"tcp://host:port"`.
    pub address: HashMap<String, String>,
    /// `"Z.N"` -> admin URL.
    #[serde(default)]
    pub http_address: HashMap<String, String>,
    #[serde(default = "default_policy")]
    pub policy: String,
    #[serde(default)]
    pub threshold: i32,
    #[serde(default)]
    pub thrifty: bool,
    #[serde(default)]
    pub chan_buffer_size: i32,
    #[serde(default)]
    pub buffer_size: i32,
    #[serde(default)]
    pub multiversion: bool,
    #[serde(default)]
    pub use_retro_log: bool,
    #[serde(default)]
    pub benchmark: Benchmark,
}

fn default_policy() -> String {
    "majority".to_string()
}

/// Benchmark-driver parameters. The driver itself is an external
/// collaborator (§1); this struct only preserves its configuration shape.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Benchmark {
    #[serde(default)]
    pub t: i32,
    #[serde(default)]
    pub n: i32,
    #[serde(default)]
    pub k: i32,
    #[serde(default)]
    pub w: f64,
    #[serde(default)]
    pub throttle: i32,
    #[serde(default)]
    pub concurrency: i32,
    #[serde(default)]
    pub distribution: String,
    #[serde(default)]
    pub linearizability_check: bool,
    #[serde(default)]
    pub conflicts: i32,
    #[serde(default)]
    pub min: i32,
    #[serde(default)]
    pub mu: i32,
    #[serde(default)]
    pub sigma: i32,
    #[serde(rename = "Move", default)]
    pub move_keys: bool,
    #[serde(default)]
    pub speed: i32,
    #[serde(rename = "Zipfian_s", default)]
    pub zipfian_s: f64,
    #[serde(rename = "Zipfian_v", default)]
    pub zipfian_v: i32,
    #[serde(default)]
    pub lambda: f64,
    #[serde(default)]
    pub size: i32,
}

impl Config {
    /// Parses a configuration document from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(PigpaxosError::Serialization)
    }

    /// Resolves every configured address into a parsed [`Id`], dropping
    /// entries whose key is not a valid `"Z.N"` string.
    pub fn known_ids(&self) -> Vec<Id> {
        let mut ids: Vec<Id> = self
            .address
            .keys()
            .filter_map(|s| s.parse::<Id>().ok())
            .collect();
        crate::id::sort_ids(&mut ids);
        ids
    }

    /// The transport URL configured for `id`, if any.
    pub fn address_of(&self, id: Id) -> Option<&str> {
        self.address.get(&id.to_string()).map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_document() {
        let json = r#"{
            "address": {"1.1": "tcp://127.0.0.1:3001", "1.2": "tcp://127.0.0.1:3002"},
            "http_address": {},
            "policy": "majority",
            "threshold": 3,
            "thrifty": false,
            "chan_buffer_size": 1024,
            "buffer_size": 1024,
            "multiversion": false,
            "use_retro_log": false,
            "benchmark": {}
        }"#;
        let cfg = Config::from_json(json).unwrap();
        assert_eq!(cfg.known_ids().len(), 2);
        assert_eq!(cfg.address_of(Id::new(1, 1)), Some("tcp://127.0.0.1:3001"));
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(Config::from_json("not json").is_err());
    }
}
