//! JSON Schema validation contract consumed by the protocol engine
//!
//! The engine never interprets schemas itself; it asks a [`SchemaValidator`]
//! to compile one into a reusable [`CompiledSchema`] and checks inputs
//! against that. The default implementation wraps the `jsonschema` crate
//! and memoizes compilation per schema document.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use crate::{Error, Result};

/// A compiled, reusable schema check.
pub trait CompiledSchema: Send + Sync {
    /// Validate `input`, returning a joined human-readable message on
    /// failure.
    fn validate(&self, input: &Value) -> std::result::Result<(), String>;
}

/// Compiles JSON Schemas into reusable validators.
pub trait SchemaValidator: Send + Sync {
    /// Compile `schema`. Implementations are expected to memoize: the engine
    /// calls this on every tool-list refresh and every elicitation round.
    fn get_validator(&self, schema: &Value) -> Result<Arc<dyn CompiledSchema>>;
}

struct CompiledJsonSchema {
    validator: jsonschema::Validator,
}

impl CompiledSchema for CompiledJsonSchema {
    fn validate(&self, input: &Value) -> std::result::Result<(), String> {
        if self.validator.is_valid(input) {
            return Ok(());
        }

        let message = self
            .validator
            .iter_errors(input)
            .take(5)
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        if message.is_empty() {
            return Err("input does not match schema".to_string());
        }
        Err(message)
    }
}

/// Default validator backed by the `jsonschema` crate, with compilation
/// memoized on the serialized schema document.
#[derive(Default)]
pub struct JsonSchemaValidator {
    cache: DashMap<String, Arc<dyn CompiledSchema>>,
}

impl JsonSchemaValidator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SchemaValidator for JsonSchemaValidator {
    fn get_validator(&self, schema: &Value) -> Result<Arc<dyn CompiledSchema>> {
        let key = schema.to_string();
        if let Some(compiled) = self.cache.get(&key) {
            return Ok(compiled.clone());
        }

        let validator = jsonschema::validator_for(schema)
            .map_err(|e| Error::Validation(e.to_string()))?;
        let compiled: Arc<dyn CompiledSchema> = Arc::new(CompiledJsonSchema { validator });
        self.cache.insert(key, compiled.clone());
        Ok(compiled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_valid_input_passes() {
        let validator = JsonSchemaValidator::new();
        let schema = json!({
            "type": "object",
            "properties": {"x": {"type": "integer"}},
            "required": ["x"]
        });

        let compiled = validator.get_validator(&schema).unwrap();
        assert!(compiled.validate(&json!({"x": 3})).is_ok());
    }

    #[test]
    fn test_invalid_input_reports_message() {
        let validator = JsonSchemaValidator::new();
        let schema = json!({
            "type": "object",
            "properties": {"x": {"type": "integer"}},
            "required": ["x"]
        });

        let compiled = validator.get_validator(&schema).unwrap();
        let message = compiled.validate(&json!({"x": "not-an-int"})).unwrap_err();
        assert!(!message.is_empty());
    }

    #[test]
    fn test_compilation_is_memoized() {
        let validator = JsonSchemaValidator::new();
        let schema = json!({"type": "object"});

        let first = validator.get_validator(&schema).unwrap();
        let second = validator.get_validator(&schema).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_enum_and_format_surface() {
        let validator = JsonSchemaValidator::new();
        let schema = json!({
            "type": "object",
            "properties": {
                "color": {"type": "string", "enum": ["red", "green"]},
                "count": {"type": "integer", "minimum": 0, "maximum": 10}
            },
            "required": ["color"]
        });

        let compiled = validator.get_validator(&schema).unwrap();
        assert!(compiled.validate(&json!({"color": "red", "count": 3})).is_ok());
        assert!(compiled.validate(&json!({"color": "blue"})).is_err());
        assert!(compiled.validate(&json!({"color": "red", "count": 42})).is_err());
    }
}
