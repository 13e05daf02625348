//! Configuration merge logic
//!
//! Layers are merged as JSON values:
//! - Objects: deep-merge by key
//! - Arrays: REPLACE (last wins)
//! - Scalars: override (last wins)

use serde_json::{Map, Value};

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "LOCALSIGN_";

/// Separator between nested keys in an environment override name.
pub const ENV_NESTING: &str = "__";

/// Deep merge two JSON values.
///
/// Merge semantics:
/// - Objects: deep-merge by key (recursive)
/// - Arrays: REPLACE (second wins entirely)
/// - Scalars: override (second wins)
/// - Null: override (null can override any value)
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged = if let Some(base_value) = base_map.remove(&key) {
                    deep_merge(base_value, overlay_value)
                } else {
                    overlay_value
                };
                base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }

        (Value::Array(_), overlay @ Value::Array(_)) => overlay,

        (_, overlay) => overlay,
    }
}

/// Merge multiple config layers in order (first is base, last has highest precedence)
pub fn merge_layers(layers: Vec<Value>) -> Value {
    layers.into_iter().fold(Value::Null, deep_merge)
}

/// Build an override layer from `LOCALSIGN_*` variables.
///
/// `LOCALSIGN_BUILDER__INTEGRATED__JOB_TIMEOUT_MINS=30` becomes
/// `{"builder": {"integrated": {"job_timeout_mins": 30}}}`. Values are typed
/// after the value found at the same path in `template`; anything without a
/// typed counterpart stays a string. Returns `None` when no variable applies.
pub fn env_layer<I>(vars: I, template: &Value) -> Option<Value>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut layer = Map::new();

    for (name, raw) in vars {
        let Some(rest) = name.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let path: Vec<String> = rest
            .split(ENV_NESTING)
            .map(|part| part.to_ascii_lowercase())
            .collect();
        if path.iter().any(String::is_empty) {
            continue;
        }

        let typed = typed_like(lookup(template, &path), raw);
        insert_path(&mut layer, &path, typed);
    }

    if layer.is_empty() {
        None
    } else {
        Some(Value::Object(layer))
    }
}

fn lookup<'a>(value: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, key| current.get(key))
}

fn typed_like(template: Option<&Value>, raw: String) -> Value {
    match template {
        Some(Value::Bool(_)) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Value::Bool(true),
            "false" | "0" | "no" => Value::Bool(false),
            _ => Value::String(raw),
        },
        Some(Value::Number(_)) => raw
            .trim()
            .parse::<u64>()
            .map(Value::from)
            .unwrap_or(Value::String(raw)),
        _ => Value::String(raw),
    }
}

fn insert_path(map: &mut Map<String, Value>, path: &[String], value: Value) {
    match path {
        [] => {}
        [last] => {
            map.insert(last.clone(), value);
        }
        [head, tail @ ..] => {
            let child = map
                .entry(head.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            if let Value::Object(child_map) = child {
                insert_path(child_map, tail, value);
            }
        }
    }
}
