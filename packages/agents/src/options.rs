// ABOUTME: Normalizes backend-specific prompt option encodings into {id, label, value}
// ABOUTME: Accepts plain strings, scalar values, keyed maps and several object spellings

use crate::events::PromptOption;
use serde_json::{Map, Value};
use std::collections::HashSet;

const ID_KEYS: [&str; 4] = ["id", "optionId", "option_id", "key"];
const LABEL_KEYS: [&str; 5] = ["label", "name", "title", "text", "description"];

/// Convert a free-form option list into canonical options with unique ids.
///
/// Anything that is not a list or a map yields no options.
pub fn normalize_options(raw: &Value) -> Vec<PromptOption> {
    let candidates: Vec<PromptOption> = match raw {
        Value::Array(items) => items
            .iter()
            .enumerate()
            .filter_map(|(index, item)| normalize_item(index, item))
            .collect(),
        Value::Object(map) => map
            .iter()
            .map(|(key, value)| PromptOption {
                id: key.clone(),
                label: value
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| key.clone()),
                value: Value::String(key.clone()),
            })
            .collect(),
        _ => Vec::new(),
    };

    dedupe_ids(candidates)
}

fn normalize_item(index: usize, item: &Value) -> Option<PromptOption> {
    match item {
        Value::String(s) => {
            let text = s.trim();
            (!text.is_empty()).then(|| PromptOption {
                id: text.to_string(),
                label: text.to_string(),
                value: Value::String(text.to_string()),
            })
        }
        Value::Number(_) | Value::Bool(_) => {
            let text = item.to_string();
            Some(PromptOption {
                id: text.clone(),
                label: text,
                value: item.clone(),
            })
        }
        Value::Object(map) => Some(normalize_object(index, map)),
        Value::Null | Value::Array(_) => None,
    }
}

fn normalize_object(index: usize, map: &Map<String, Value>) -> PromptOption {
    let first_string = |keys: &[&str]| {
        keys.iter()
            .filter_map(|k| map.get(*k))
            .find_map(scalar_text)
    };

    let value = map
        .get("value")
        .or_else(|| map.get("kind"))
        .cloned();

    let id = first_string(&ID_KEYS[..])
        .or_else(|| value.as_ref().and_then(scalar_text))
        .unwrap_or_else(|| format!("option-{}", index + 1));

    let label = first_string(&LABEL_KEYS[..])
        .or_else(|| value.as_ref().and_then(scalar_text))
        .unwrap_or_else(|| id.clone());

    PromptOption {
        value: value.unwrap_or_else(|| Value::String(id.clone())),
        id,
        label,
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn dedupe_ids(options: Vec<PromptOption>) -> Vec<PromptOption> {
    let mut seen = HashSet::new();
    options
        .into_iter()
        .map(|mut option| {
            if !seen.insert(option.id.clone()) {
                let base = option.id.clone();
                let mut n = 2;
                while !seen.insert(format!("{}-{}", base, n)) {
                    n += 1;
                }
                option.id = format!("{}-{}", base, n);
            }
            option
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn ids(options: &[PromptOption]) -> Vec<&str> {
        options.iter().map(|o| o.id.as_str()).collect()
    }

    #[test]
    fn test_plain_strings() {
        let options = normalize_options(&json!(["Yes", " No ", ""]));
        assert_eq!(ids(&options), vec!["Yes", "No"]);
        assert_eq!(options[1].label, "No");
        assert_eq!(options[1].value, json!("No"));
    }

    #[test]
    fn test_permission_style_objects() {
        let options = normalize_options(&json!([
            {"optionId": "allow", "name": "Allow once", "kind": "allow_once"},
            {"optionId": "reject", "name": "Reject", "kind": "reject_once"},
        ]));
        assert_eq!(
            options[0],
            PromptOption {
                id: "allow".to_string(),
                label: "Allow once".to_string(),
                value: json!("allow_once"),
            }
        );
        assert_eq!(options[1].id, "reject");
    }

    #[test]
    fn test_value_only_objects_and_scalars() {
        let options = normalize_options(&json!([{"value": 3}, {"title": "Skip"}, true, 7]));
        assert_eq!(ids(&options), vec!["3", "option-2", "true", "7"]);
        assert_eq!(options[0].label, "3");
        assert_eq!(options[1].label, "Skip");
        assert_eq!(options[1].value, json!("option-2"));
        assert_eq!(options[3].value, json!(7));
    }

    #[test]
    fn test_keyed_map() {
        let options = normalize_options(&json!({"y": "Proceed", "n": "Abort"}));
        let mut found = ids(&options);
        found.sort();
        assert_eq!(found, vec!["n", "y"]);
        assert!(options.iter().any(|o| o.label == "Proceed"));
    }

    #[test]
    fn test_duplicate_ids_are_suffixed() {
        let options = normalize_options(&json!(["ok", "ok", {"id": "ok"}]));
        assert_eq!(ids(&options), vec!["ok", "ok-2", "ok-3"]);
    }

    #[test]
    fn test_unsupported_shapes_are_empty() {
        assert!(normalize_options(&json!("yes/no")).is_empty());
        assert!(normalize_options(&Value::Null).is_empty());
        assert!(normalize_options(&json!([null, []])).is_empty());
    }
}
