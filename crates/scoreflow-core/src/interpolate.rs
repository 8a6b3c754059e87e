// Variable interpolation: string-in/string-out over a flat namespace map.
//
// Placeholders are exactly `${a.b.c}`. Unresolved placeholders are preserved
// as literal text; the receiving adapter fails later if the value was
// required. `$VAR` and `{VAR}` are never treated as placeholders.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z0-9_][A-Za-z0-9_.\-]*)\}").unwrap());

/// Expand `${...}` placeholders found in `input` against the flat variable
/// map, leaving unknown placeholders untouched
pub fn interpolate(input: &str, vars: &BTreeMap<String, String>) -> String {
    PLACEHOLDER
        .replace_all(input, |caps: &Captures| match vars.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Walk a JSON value and interpolate every string leaf in place
pub fn interpolate_value(value: &mut serde_json::Value, vars: &BTreeMap<String, String>) {
    match value {
        serde_json::Value::String(s) => {
            let expanded = interpolate(s, vars);
            if expanded != *s {
                *s = expanded;
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                interpolate_value(item, vars);
            }
        }
        serde_json::Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                interpolate_value(v, vars);
            }
        }
        _ => {}
    }
}

/// Interpolate every string leaf of a config mapping, returning the expanded
/// copy
pub fn interpolate_config(
    config: &serde_json::Map<String, serde_json::Value>,
    vars: &BTreeMap<String, String>,
) -> serde_json::Map<String, serde_json::Value> {
    let mut expanded = config.clone();
    for (_, v) in expanded.iter_mut() {
        interpolate_value(v, vars);
    }
    expanded
}
