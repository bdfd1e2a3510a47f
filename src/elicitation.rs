//! Elicitation helpers: requested-schema default injection
//!
//! Servers asking for structured input attach a restricted JSON Schema to
//! the request. Clients that declared `elicitation.form.applyDefaults` fill
//! any missing field whose schema carries a `default` before returning an
//! accepted result, so handlers can return sparse content.

use serde_json::{Map, Value};

/// Fill missing defaulted fields of `content` from `schema`.
///
/// Walks the schema's `properties`, inserting each absent field that carries
/// a `default`, and recurses into nested object schemas and into every
/// `oneOf`/`anyOf`/`allOf` branch. Branch defaults are applied
/// unconditionally, whether or not the content would select that branch.
pub fn apply_schema_defaults(schema: &Value, content: &mut Map<String, Value>) {
    for key in ["allOf", "anyOf", "oneOf"] {
        if let Some(branches) = schema.get(key).and_then(Value::as_array) {
            for branch in branches {
                apply_schema_defaults(branch, content);
            }
        }
    }

    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return;
    };

    for (name, property) in properties {
        if !content.contains_key(name) {
            if let Some(default) = property.get("default") {
                content.insert(name.clone(), default.clone());
            }
        }

        // Recurse into nested objects the handler did return.
        if let Some(nested) = content.get_mut(name).and_then(Value::as_object_mut) {
            apply_schema_defaults(property, nested);
        } else if content.get(name).is_none() {
            // The field is still absent; combinator branches below it may
            // carry object defaults of their own.
            for key in ["allOf", "anyOf", "oneOf"] {
                if let Some(branches) = property.get(key).and_then(Value::as_array) {
                    for branch in branches {
                        if let Some(default) = branch.get("default") {
                            content.insert(name.clone(), default.clone());
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// Apply defaults to an elicitation result's content value in place. Creates
/// the content object when the handler returned none.
pub fn apply_defaults_to_content(schema: &Value, content: &mut Option<Value>) {
    let target = content.get_or_insert_with(|| Value::Object(Map::new()));
    if let Some(object) = target.as_object_mut() {
        apply_schema_defaults(schema, object);
    }
}
