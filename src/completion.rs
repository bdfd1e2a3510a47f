//! Completable metadata for prompt arguments
//!
//! Autocompletion callbacks attach to argument slots through a side-channel
//! registry keyed by (prompt, argument); attaching one never alters how the
//! argument itself is parsed or validated. The server's
//! `completion/complete` handler consults the registry via
//! [`CompletableRegistry::get_completer`].

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::protocol::{CompleteResult, Completion, CompletionContext};
use crate::Result;

/// Completion results are truncated to this many suggestions
pub const MAX_COMPLETION_VALUES: usize = 100;

/// An async completion callback: current argument value in, suggestions out
pub type CompleterFn = Arc<
    dyn Fn(String, Option<CompletionContext>) -> BoxFuture<'static, Result<Vec<String>>>
        + Send
        + Sync,
>;

/// An argument-slot schema with an attached completer
#[derive(Clone)]
pub struct Completable {
    schema: Value,
    completer: CompleterFn,
}

impl Completable {
    pub fn new<F>(schema: Value, completer: F) -> Self
    where
        F: Fn(String, Option<CompletionContext>) -> BoxFuture<'static, Result<Vec<String>>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            schema,
            completer: Arc::new(completer),
        }
    }

    /// The argument schema, unchanged by the attachment
    pub fn schema(&self) -> &Value {
        &self.schema
    }

    pub fn completer(&self) -> CompleterFn {
        self.completer.clone()
    }
}

/// Side table mapping (prompt, argument) to completable metadata
#[derive(Default)]
pub struct CompletableRegistry {
    entries: DashMap<(String, String), Completable>,
}

impl CompletableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a completable to a prompt argument slot
    pub fn register(&self, prompt: &str, argument: &str, completable: Completable) {
        self.entries
            .insert((prompt.to_string(), argument.to_string()), completable);
    }

    /// Whether the slot has a completer attached
    pub fn is_completable(&self, prompt: &str, argument: &str) -> bool {
        self.entries
            .contains_key(&(prompt.to_string(), argument.to_string()))
    }

    /// The completer attached to the slot, if any
    pub fn get_completer(&self, prompt: &str, argument: &str) -> Option<CompleterFn> {
        self.entries
            .get(&(prompt.to_string(), argument.to_string()))
            .map(|entry| entry.completer())
    }

    /// Drop every completer attached to a prompt
    pub fn remove_prompt(&self, prompt: &str) {
        self.entries.retain(|(name, _), _| name != prompt);
    }
}

/// Build a wire completion result from raw suggestions, truncating to
/// [`MAX_COMPLETION_VALUES`] and reporting the pre-truncation total.
pub fn completion_result(values: Vec<String>) -> CompleteResult {
    let total = values.len();
    let truncated: Vec<String> = values.into_iter().take(MAX_COMPLETION_VALUES).collect();
    let has_more = total > truncated.len();
    CompleteResult {
        completion: Completion {
            values: truncated,
            total: Some(total),
            has_more: Some(has_more),
        },
    }
}

/// The empty completion set, returned for slots with no completer
pub fn empty_completion() -> CompleteResult {
    CompleteResult {
        completion: Completion {
            values: Vec::new(),
            total: Some(0),
            has_more: Some(false),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn static_completable(values: Vec<&'static str>) -> Completable {
        Completable::new(json!({"type": "string"}), move |value, _context| {
            let values = values.clone();
            Box::pin(async move {
                Ok(values
                    .into_iter()
                    .filter(|v| v.starts_with(&value))
                    .map(String::from)
                    .collect())
            })
        })
    }

    #[tokio::test]
    async fn test_registry_lookup_and_invoke() {
        let registry = CompletableRegistry::new();
        registry.register("greet", "language", static_completable(vec!["en", "es", "de"]));

        assert!(registry.is_completable("greet", "language"));
        assert!(!registry.is_completable("greet", "other"));
        assert!(!registry.is_completable("other", "language"));

        let completer = registry.get_completer("greet", "language").unwrap();
        let values = completer("e".to_string(), None).await.unwrap();
        assert_eq!(values, vec!["en", "es"]);
    }

    #[test]
    fn test_attachment_preserves_schema() {
        let schema = json!({"type": "string", "enum": ["a", "b"]});
        let completable = Completable::new(schema.clone(), |_value, _context| {
            Box::pin(async { Ok(Vec::new()) })
        });
        assert_eq!(completable.schema(), &schema);
    }

    #[test]
    fn test_truncation_to_limit() {
        let values: Vec<String> = (0..250).map(|i| format!("v{}", i)).collect();
        let result = completion_result(values);
        assert_eq!(result.completion.values.len(), MAX_COMPLETION_VALUES);
        assert_eq!(result.completion.total, Some(250));
        assert_eq!(result.completion.has_more, Some(true));
    }

    #[test]
    fn test_small_result_not_marked_has_more() {
        let result = completion_result(vec!["one".to_string()]);
        assert_eq!(result.completion.values.len(), 1);
        assert_eq!(result.completion.total, Some(1));
        assert_eq!(result.completion.has_more, Some(false));
    }

    #[test]
    fn test_remove_prompt_drops_all_slots() {
        let registry = CompletableRegistry::new();
        registry.register("p", "a", static_completable(vec![]));
        registry.register("p", "b", static_completable(vec![]));
        registry.register("q", "a", static_completable(vec![]));

        registry.remove_prompt("p");
        assert!(!registry.is_completable("p", "a"));
        assert!(!registry.is_completable("p", "b"));
        assert!(registry.is_completable("q", "a"));
    }
}
