//! Normalization of loosely-typed requests into engine types.
//!
//! Requests arrive as JSON in several historical shapes:
//!
//! | Shape | Meaning |
//! |-------|---------|
//! | `"Firefox"` | include nodes whose `node.name` is `Firefox` |
//! | `{"key": .., "value": .., "mode": "include"}` | one predicate, include or exclude |
//! | `{"props": [{"key": .., "value": ..}, ..], "mode": ..}` | several predicates, one mode |
//! | `{"include": [..], "exclude": [..], "ignore_devices": .., ..}` | full filter set |
//!
//! Entries of `props`, `include` and `exclude` are either a `{key, value}`
//! pair or an object of string values that must all match.
//!
//! Shape and type errors become [`Error::InvalidArgument`]. Content checks
//! (empty lists, empty keys) are left to [`FilterSet::validate`].

use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::filter::{FilterSet, PropertyPredicate, RoutingMode, Target};
use crate::graph::NODE_NAME;

/// Turn any supported request shape into a [`FilterSet`].
///
/// # Errors
/// Returns [`Error::InvalidArgument`] for unknown shapes and wrongly typed fields.
pub fn parse_filter(request: &Value) -> Result<FilterSet> {
    match request {
        Value::String(name) => Ok(FilterSet::including(vec![Target::single(NODE_NAME, name.as_str())])),
        Value::Object(map) if map.contains_key("include") || map.contains_key("exclude") => parse_targets(map),
        Value::Object(map) if map.contains_key("props") => {
            let targets = parse_target_list(map, "props")?;
            Ok(with_mode(targets, parse_mode(map)?))
        }
        Value::Object(map) if map.contains_key("key") => {
            let target = parse_pair(map)?;
            Ok(with_mode(vec![target], parse_mode(map)?))
        }
        Value::Object(_) => Err(Error::InvalidArgument("neither include nor exclude given".into())),
        other => Err(Error::InvalidArgument(format!("unsupported request type: {}", type_name(other)))),
    }
}

/// Parse the optional key list of a `list` request.
///
/// `null` and a missing value mean the default projection.
///
/// # Errors
/// Returns [`Error::InvalidArgument`] unless the value is an array of strings.
pub fn parse_list_props(request: Option<&Value>) -> Result<Option<Vec<String>>> {
    let Some(value) = request.filter(|v| !v.is_null()) else {
        return Ok(None);
    };

    let Value::Array(items) = value else {
        return Err(Error::InvalidArgument(format!("props must be an array, got {}", type_name(value))));
    };

    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| Error::InvalidArgument(format!("props entries must be strings, got {}", type_name(item))))
        })
        .collect::<Result<Vec<_>>>()
        .map(Some)
}

fn with_mode(targets: Vec<Target>, mode: RoutingMode) -> FilterSet {
    match mode {
        RoutingMode::Include => FilterSet::including(targets),
        RoutingMode::Exclude => FilterSet::excluding(targets),
    }
}

fn parse_targets(map: &Map<String, Value>) -> Result<FilterSet> {
    Ok(FilterSet {
        include: parse_optional_list(map, "include")?,
        exclude: parse_optional_list(map, "exclude")?,
        ignore_devices: parse_flag(map, "ignore_devices")?,
        only_default_speakers: parse_flag(map, "only_default_speakers")?,
        ignore_input_media: parse_flag(map, "ignore_input_media")?,
    })
}

fn parse_optional_list(map: &Map<String, Value>, field: &str) -> Result<Vec<Target>> {
    match map.get(field) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(_) => parse_target_list(map, field),
    }
}

fn parse_target_list(map: &Map<String, Value>, field: &str) -> Result<Vec<Target>> {
    let Some(Value::Array(items)) = map.get(field) else {
        return Err(Error::InvalidArgument(format!("{field} must be an array")));
    };

    items
        .iter()
        .map(|item| match item {
            Value::Object(entry) => parse_entry(entry),
            other => Err(Error::InvalidArgument(format!(
                "{field} entries must be objects, got {}",
                type_name(other)
            ))),
        })
        .collect()
}

/// A `{key, value}` pair, or a map whose entries must all match.
fn parse_entry(entry: &Map<String, Value>) -> Result<Target> {
    if entry.contains_key("key") && entry.contains_key("value") && entry.len() == 2 {
        return parse_pair(entry);
    }

    let predicates = entry
        .iter()
        .map(|(key, value)| {
            value
                .as_str()
                .map(|v| PropertyPredicate::new(key.as_str(), v))
                .ok_or_else(|| Error::InvalidArgument(format!("value of {key} must be a string")))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Target::all(predicates))
}

fn parse_pair(map: &Map<String, Value>) -> Result<Target> {
    let key = string_field(map, "key")?;
    let value = string_field(map, "value")?;
    Ok(Target::single(key, value))
}

fn string_field<'a>(map: &'a Map<String, Value>, field: &str) -> Result<&'a str> {
    match map.get(field) {
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(Error::InvalidArgument(format!("{field} must be a string, got {}", type_name(other)))),
        None => Err(Error::InvalidArgument(format!("missing {field}"))),
    }
}

fn parse_mode(map: &Map<String, Value>) -> Result<RoutingMode> {
    match map.get("mode") {
        None | Some(Value::Null) => Ok(RoutingMode::Include),
        Some(Value::String(mode)) => match mode.as_str() {
            "include" => Ok(RoutingMode::Include),
            "exclude" => Ok(RoutingMode::Exclude),
            other => Err(Error::InvalidArgument(format!("unknown mode: {other}"))),
        },
        Some(other) => Err(Error::InvalidArgument(format!("mode must be a string, got {}", type_name(other)))),
    }
}

fn parse_flag(map: &Map<String, Value>, field: &str) -> Result<bool> {
    match map.get(field) {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(other) => Err(Error::InvalidArgument(format!("{field} must be a boolean, got {}", type_name(other)))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    #[test]
    fn test_bare_string_includes_by_name() {
        let filter = parse_filter(&json!("Firefox")).expect("Failed to parse");

        assert_eq!(filter.include, vec![Target::single("node.name", "Firefox")]);
        assert!(filter.exclude.is_empty());
    }

    #[test]
    fn test_key_value_mode_triple() {
        let filter = parse_filter(&json!({
            "key": "application.process.id",
            "value": "4242",
            "mode": "exclude"
        }))
        .expect("Failed to parse");

        assert_eq!(filter.mode(), RoutingMode::Exclude);
        assert_eq!(filter.exclude, vec![Target::single("application.process.id", "4242")]);
    }

    #[test]
    fn test_props_list_defaults_to_include() {
        let filter = parse_filter(&json!({
            "props": [
                {"key": "node.name", "value": "a"},
                {"key": "node.name", "value": "b"}
            ]
        }))
        .expect("Failed to parse");

        assert_eq!(filter.mode(), RoutingMode::Include);
        assert_eq!(filter.include.len(), 2);
    }

    #[test]
    fn test_full_filter_set() {
        let filter = parse_filter(&json!({
            "include": [],
            "exclude": [{"key": "application.process.id", "value": "1"}],
            "ignore_devices": true,
            "only_default_speakers": true
        }))
        .expect("Failed to parse");

        assert!(filter.ignore_devices);
        assert!(filter.only_default_speakers);
        assert!(!filter.ignore_input_media);
        assert_eq!(filter.mode(), RoutingMode::Exclude);
    }

    #[test]
    fn test_group_entry_becomes_conjunction() {
        let filter = parse_filter(&json!({
            "include": [{"application.name": "Chromium", "media.name": "Tab audio"}]
        }))
        .expect("Failed to parse");

        assert_eq!(filter.include.len(), 1);
        assert_eq!(filter.include[0].predicates.len(), 2);
    }

    #[test]
    fn test_wrong_types_are_invalid_argument() {
        let cases = [
            json!(42),
            json!(null),
            json!({}),
            json!({"include": "Firefox"}),
            json!({"include": [["node.name", "Firefox"]]}),
            json!({"include": [{"key": "node.name", "value": 3}]}),
            json!({"key": "node.name", "value": "a", "mode": "sometimes"}),
            json!({"key": "node.name", "value": "a", "mode": true}),
            json!({"exclude": [], "ignore_devices": "yes"}),
            json!({"props": {"key": "node.name", "value": "a"}}),
        ];

        for case in cases {
            assert_matches!(parse_filter(&case), Err(Error::InvalidArgument(_)), "case: {case}");
        }
    }

    #[test]
    fn test_empty_lists_parse_but_fail_validation() {
        let filter = parse_filter(&json!({"include": [], "exclude": []})).expect("Failed to parse");
        assert_matches!(filter.validate(), Err(Error::InvalidFilter(_)));
    }

    #[test]
    fn test_empty_key_fails_validation() {
        let filter = parse_filter(&json!({"key": "", "value": "x"})).expect("Failed to parse");
        assert_matches!(filter.validate(), Err(Error::InvalidFilter(_)));
    }

    #[test]
    fn test_list_props() {
        assert_eq!(parse_list_props(None).expect("Failed to parse"), None);
        assert_eq!(parse_list_props(Some(&Value::Null)).expect("Failed to parse"), None);
        assert_eq!(
            parse_list_props(Some(&json!(["node.name"]))).expect("Failed to parse"),
            Some(vec!["node.name".to_string()])
        );

        assert_matches!(parse_list_props(Some(&json!("node.name"))), Err(Error::InvalidArgument(_)));
        assert_matches!(parse_list_props(Some(&json!(["node.name", 1]))), Err(Error::InvalidArgument(_)));
    }
}
