// ABOUTME: Model name resolution - maps unified model identifiers to backend-native strings
// ABOUTME: Exact match, then reverse value match, then pass-through with a warning

use crate::types::BackendType;
use tracing::{debug, warn};

/// Unified name -> backend-native name. Keys a caller may send, values the
/// string the backend actually accepts. Values appear as their own keys so a
/// backend-native name resolves to itself.
const CLAUDE_MODELS: &[(&str, &str)] = &[
    ("opus-4.1", "claude-opus-4-1-20250805"),
    ("sonnet-4", "claude-sonnet-4-20250514"),
    ("opus-4", "claude-opus-4-20250514"),
    ("haiku-3.5", "claude-3-5-haiku-20241022"),
    ("claude-sonnet-4", "claude-sonnet-4-20250514"),
    ("claude-opus-4.1", "claude-opus-4-1-20250805"),
    ("claude-opus-4", "claude-opus-4-20250514"),
    ("claude-haiku-3.5", "claude-3-5-haiku-20241022"),
    ("claude-opus-4-1-20250805", "claude-opus-4-1-20250805"),
    ("claude-sonnet-4-20250514", "claude-sonnet-4-20250514"),
    ("claude-opus-4-20250514", "claude-opus-4-20250514"),
    ("claude-3-5-haiku-20241022", "claude-3-5-haiku-20241022"),
];

const CURSOR_MODELS: &[(&str, &str)] = &[
    ("gpt-5", "gpt-5"),
    ("sonnet-4", "sonnet-4"),
    ("opus-4.1", "opus-4.1"),
    ("sonnet-4-thinking", "sonnet-4-thinking"),
    ("claude-sonnet-4", "sonnet-4"),
    ("claude-opus-4.1", "opus-4.1"),
    ("claude-sonnet-4-20250514", "sonnet-4"),
    ("claude-opus-4-1-20250805", "opus-4.1"),
];

fn mapping(backend: BackendType) -> &'static [(&'static str, &'static str)] {
    match backend {
        BackendType::Claude => CLAUDE_MODELS,
        BackendType::Cursor => CURSOR_MODELS,
    }
}

/// Resolve a unified model name to the backend-native string.
///
/// Resolution order: exact key match, then "already a backend-native value"
/// pass-through, then unchanged with a warning. An unknown model never fails
/// the run; the backend rejects it itself if truly invalid.
pub fn resolve(backend: BackendType, model: &str) -> String {
    let table = mapping(backend);

    if let Some((_, mapped)) = table.iter().find(|(key, _)| *key == model) {
        debug!(backend = %backend, model, mapped, "Mapped model name");
        return (*mapped).to_string();
    }

    if table.iter().any(|(_, value)| *value == model) {
        debug!(backend = %backend, model, "Using backend-native model name directly");
        return model.to_string();
    }

    warn!(backend = %backend, model, "Model not found in mapping, passing through as-is");
    model.to_string()
}

/// Resolve an optional caller-supplied model. No stickiness: an absent model
/// stays absent rather than inheriting anything from earlier runs.
pub fn resolve_opt(backend: BackendType, model: Option<&str>) -> Option<String> {
    model.map(|m| resolve(backend, m))
}

/// All names this backend accepts: mapping keys plus their output values.
pub fn supported_models(backend: BackendType) -> Vec<String> {
    let table = mapping(backend);
    let mut names: Vec<String> = Vec::with_capacity(table.len() * 2);
    for (key, value) in table {
        if !names.iter().any(|n| n == key) {
            names.push((*key).to_string());
        }
        if !names.iter().any(|n| n == value) {
            names.push((*value).to_string());
        }
    }
    names
}

pub fn is_supported(backend: BackendType, model: &str) -> bool {
    mapping(backend)
        .iter()
        .any(|(key, value)| *key == model || *value == model)
}

/// Models surfaced as sensible defaults in availability responses.
pub fn default_models(backend: BackendType) -> Vec<String> {
    let defaults: &[&str] = match backend {
        BackendType::Claude => &["claude-sonnet-4-20250514", "claude-opus-4-1-20250805"],
        BackendType::Cursor => &["gpt-5", "sonnet-4"],
    };
    defaults.iter().map(|s| (*s).to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_maps_to_native_name() {
        assert_eq!(
            resolve(BackendType::Claude, "sonnet-4"),
            "claude-sonnet-4-20250514"
        );
        assert_eq!(resolve(BackendType::Cursor, "claude-opus-4.1"), "opus-4.1");
    }

    #[test]
    fn native_name_passes_through_unchanged() {
        assert_eq!(
            resolve(BackendType::Claude, "claude-opus-4-1-20250805"),
            "claude-opus-4-1-20250805"
        );
        assert_eq!(
            resolve(BackendType::Cursor, "sonnet-4-thinking"),
            "sonnet-4-thinking"
        );
    }

    #[test]
    fn unknown_model_passes_through_as_is() {
        assert_eq!(
            resolve(BackendType::Claude, "gpt-99-experimental"),
            "gpt-99-experimental"
        );
    }

    #[test]
    fn resolve_opt_keeps_absence_absent() {
        assert_eq!(resolve_opt(BackendType::Claude, None), None);
        assert_eq!(
            resolve_opt(BackendType::Cursor, Some("gpt-5")),
            Some("gpt-5".to_string())
        );
    }

    #[test]
    fn supported_models_contains_keys_and_values() {
        let models = supported_models(BackendType::Claude);
        assert!(models.iter().any(|m| m == "sonnet-4"));
        assert!(models.iter().any(|m| m == "claude-sonnet-4-20250514"));
    }

    #[test]
    fn is_supported_checks_both_columns() {
        assert!(is_supported(BackendType::Cursor, "claude-sonnet-4"));
        assert!(is_supported(BackendType::Cursor, "sonnet-4"));
        assert!(!is_supported(BackendType::Cursor, "made-up-model"));
    }
}
