//! Lambda schema: per-event-type JSON Schema registry for inbound CloudEvent payloads

#![forbid(unsafe_code)]

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use jsonschema::{Draft, JSONSchema};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::debug;

pub mod event_types;
mod schemas;

pub use schemas::builtin_schemas;

/// A payload did not match the schema registered for its event type.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
#[error("schema validation failed for {event_type} (event {event_id}): {}", .errors.join("; "))]
pub struct SchemaValidationError {
    pub event_id: String,
    pub event_type: String,
    pub errors: SmallVec<[String; 4]>,
}

/// Compiled schemas keyed by exact event type, plus `prefix.*` wildcards.
pub struct SchemaRegistry {
    exact: HashMap<String, JSONSchema>,
    wildcards: Vec<(String, JSONSchema)>,
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self { exact: HashMap::new(), wildcards: Vec::new() }
    }

    /// Registry preloaded with every command and response schema.
    pub fn with_builtin() -> Result<Self> {
        let mut reg = Self::new();
        for (event_type, schema) in builtin_schemas() {
            reg.register(event_type, &schema)?;
        }
        Ok(reg)
    }

    /// Register `schema` for an exact type, or for every type under `prefix` when given `prefix.*`.
    pub fn register(&mut self, event_type: &str, schema: &serde_json::Value) -> Result<()> {
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(schema)
            .map_err(|e| anyhow!("compiling schema for {}: {}", event_type, e))?;
        match event_type.strip_suffix(".*") {
            Some(prefix) => {
                self.wildcards.retain(|(p, _)| p != prefix);
                self.wildcards.push((prefix.to_string(), compiled));
                // Longest prefix first so the most specific wildcard wins.
                self.wildcards.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
            }
            None => {
                self.exact.insert(event_type.to_string(), compiled);
            }
        }
        debug!(event_type, "schema registered");
        Ok(())
    }

    fn lookup(&self, event_type: &str) -> Option<&JSONSchema> {
        if let Some(s) = self.exact.get(event_type) {
            return Some(s);
        }
        self.wildcards
            .iter()
            .find(|(prefix, _)| event_type.len() > prefix.len() && event_type.starts_with(prefix.as_str()) && event_type.as_bytes()[prefix.len()] == b'.')
            .map(|(_, s)| s)
    }

    pub fn has_schema(&self, event_type: &str) -> bool {
        self.lookup(event_type).is_some()
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.wildcards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Validate a decoded payload. Types without a registered schema pass.
    pub fn validate(&self, event_id: &str, event_type: &str, payload: &serde_json::Value) -> Result<(), SchemaValidationError> {
        let schema = match self.lookup(event_type) {
            Some(s) => s,
            None => return Ok(()),
        };
        let result = schema.validate(payload);
        if let Err(errors) = result {
            let mut out: SmallVec<[String; 4]> = SmallVec::new();
            for err in errors {
                let path = err.instance_path.to_string();
                if path.is_empty() {
                    out.push(err.to_string());
                } else {
                    out.push(format!("{}: {}", path, err));
                }
            }
            return Err(SchemaValidationError { event_id: event_id.to_string(), event_type: event_type.to_string(), errors: out });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::with_builtin().unwrap_or_else(|e| panic!("builtin schemas must compile: {e}"))
    }

    #[test]
    fn unknown_types_have_no_schema_and_pass() {
        let reg = registry();
        assert!(!reg.has_schema("io.example.something.else"));
        assert!(reg.validate("e1", "io.example.something.else", &json!("anything")).is_ok());
    }

    #[test]
    fn wildcard_matches_whole_segments_only() {
        let mut reg = SchemaRegistry::new();
        reg.register("io.acme.build.*", &json!({"type": "object", "required": ["name"]})).unwrap_or_else(|e| panic!("{e}"));
        assert!(reg.has_schema("io.acme.build.start"));
        assert!(!reg.has_schema("io.acme.buildx.start"));
        assert!(!reg.has_schema("io.acme.build"));
        let err = reg.validate("e2", "io.acme.build.start", &json!({}));
        assert!(err.is_err());
    }

    #[test]
    fn exact_schema_beats_wildcard() {
        let mut reg = SchemaRegistry::new();
        reg.register("io.acme.*", &json!({"type": "object", "required": ["never"]})).unwrap_or_else(|e| panic!("{e}"));
        reg.register("io.acme.ping", &json!({"type": "object"})).unwrap_or_else(|e| panic!("{e}"));
        assert!(reg.validate("e3", "io.acme.ping", &json!({})).is_ok());
        assert!(reg.validate("e3", "io.acme.pong", &json!({})).is_err());
    }

    #[test]
    fn error_carries_event_identity() {
        let reg = registry();
        let err = reg.validate("evt-9", event_types::FUNCTION_DEPLOY, &json!({"spec": {}}));
        match err {
            Err(e) => {
                assert_eq!(e.event_id, "evt-9");
                assert_eq!(e.event_type, event_types::FUNCTION_DEPLOY);
                assert!(e.to_string().contains("metadata"));
            }
            Ok(()) => panic!("payload without metadata must fail"),
        }
    }
}
