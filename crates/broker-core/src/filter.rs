//! Inventory filter expressions of the form `key<op>value[,key<op>value...]`.
//!
//! | op   | passes when                  |
//! |------|------------------------------|
//! | `=`  | value equals needle          |
//! | `!=` | value differs from needle    |
//! | `<`  | value contains needle        |
//! | `!<` | value does not contain needle|
//! | `{`  | value starts with needle     |
//! | `!{` | value does not start with it |
//! | `}`  | value ends with needle       |
//! | `!}` | value does not end with it   |
//!
//! Keys address a handle flattened with `.` separators, e.g. `reference.name`.

use crate::resource::ResourceHandle;
use crate::{CoreError, CoreResult};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    NotStartsWith,
    EndsWith,
    NotEndsWith,
}

// Two-character operators must be tried before their one-character suffixes.
const OPERATORS: [(&str, FilterOp); 8] = [
    ("!<", FilterOp::NotContains),
    ("<", FilterOp::Contains),
    ("!=", FilterOp::NotEquals),
    ("=", FilterOp::Equals),
    ("!{", FilterOp::NotStartsWith),
    ("{", FilterOp::StartsWith),
    ("!}", FilterOp::NotEndsWith),
    ("}", FilterOp::EndsWith),
];

impl FilterOp {
    fn test(self, haystack: &str, needle: &str) -> bool {
        match self {
            FilterOp::Equals => haystack == needle,
            FilterOp::NotEquals => haystack != needle,
            FilterOp::Contains => haystack.contains(needle),
            FilterOp::NotContains => !haystack.contains(needle),
            FilterOp::StartsWith => haystack.starts_with(needle),
            FilterOp::NotStartsWith => !haystack.starts_with(needle),
            FilterOp::EndsWith => haystack.ends_with(needle),
            FilterOp::NotEndsWith => !haystack.ends_with(needle),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterTerm {
    pub key: String,
    pub op: FilterOp,
    pub needle: String,
}

impl FilterTerm {
    fn parse(raw: &str) -> CoreResult<Self> {
        for (symbol, op) in OPERATORS {
            if let Some((key, needle)) = raw.split_once(symbol) {
                let key = key.trim();
                if key.is_empty() {
                    return Err(CoreError::InvalidFilter(format!(
                        "missing key in filter term '{raw}'"
                    )));
                }
                return Ok(Self {
                    key: key.to_string(),
                    op,
                    needle: needle.trim().to_string(),
                });
            }
        }
        Err(CoreError::InvalidFilter(format!(
            "no operator found in filter term '{raw}'"
        )))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    terms: Vec<FilterTerm>,
}

impl Filter {
    pub fn parse(expression: &str) -> CoreResult<Self> {
        let terms = expression
            .split(',')
            .map(str::trim)
            .filter(|term| !term.is_empty())
            .map(FilterTerm::parse)
            .collect::<CoreResult<Vec<_>>>()?;

        if terms.is_empty() {
            return Err(CoreError::InvalidFilter("empty filter expression".to_string()));
        }
        Ok(Self { terms })
    }

    pub fn terms(&self) -> &[FilterTerm] {
        &self.terms
    }

    /// Terms whose key is absent are skipped; at least one term must apply.
    pub fn matches(&self, fields: &BTreeMap<String, String>) -> bool {
        let mut applied = false;
        for term in &self.terms {
            if let Some(haystack) = fields.get(&term.key) {
                applied = true;
                if !term.op.test(haystack, &term.needle) {
                    return false;
                }
            }
        }
        applied
    }

    pub fn matches_handle(&self, handle: &ResourceHandle) -> bool {
        match serde_json::to_value(handle) {
            Ok(value) => self.matches(&flatten(&value)),
            Err(_) => false,
        }
    }
}

/// Flattens nested objects into dotted keys. Objects nested inside arrays are
/// flattened under the array's key; the remaining scalars keep the array key.
pub fn flatten(value: &Value) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if let Value::Object(map) = value {
        for (key, value) in map {
            flatten_into(key, value, &mut out);
        }
    }
    out
}

fn flatten_into(key: &str, value: &Value, out: &mut BTreeMap<String, String>) {
    match value {
        Value::Object(map) => {
            for (child, value) in map {
                flatten_into(&format!("{key}.{child}"), value, out);
            }
        }
        Value::Array(items) => {
            let mut scalars = Vec::new();
            for item in items {
                if item.is_object() {
                    flatten_into(key, item, out);
                } else {
                    scalars.push(item.clone());
                }
            }
            out.insert(key.to_string(), Value::Array(scalars).to_string());
        }
        Value::String(s) => {
            out.insert(key.to_string(), s.clone());
        }
        Value::Null => {}
        other => {
            out.insert(key.to_string(), other.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;
    use serde_json::json;

    #[test]
    fn test_parse_operators() {
        let filter = Filter::parse("name!=web, provider=Container,reference.name{rhel").unwrap();
        let ops: Vec<FilterOp> = filter.terms().iter().map(|t| t.op).collect();
        assert_eq!(
            ops,
            vec![FilterOp::NotEquals, FilterOp::Equals, FilterOp::StartsWith]
        );
        assert_eq!(filter.terms()[2].key, "reference.name");
        assert_eq!(filter.terms()[2].needle, "rhel");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            Filter::parse("no-operator-here"),
            Err(CoreError::InvalidFilter(_))
        ));
        assert!(Filter::parse("").is_err());
        assert!(Filter::parse("=value").is_err());
    }

    #[test]
    fn test_flatten_nested_and_arrays() {
        let flat = flatten(&json!({
            "key": "value1",
            "another": {"nested": "value2", "nested2": [1, 2, {"deep": "value3"}]}
        }));

        assert_eq!(flat.get("key").map(String::as_str), Some("value1"));
        assert_eq!(flat.get("another.nested").map(String::as_str), Some("value2"));
        assert_eq!(flat.get("another.nested2").map(String::as_str), Some("[1,2]"));
        assert_eq!(
            flat.get("another.nested2.deep").map(String::as_str),
            Some("value3")
        );
    }

    #[test]
    fn test_matches_requires_present_key() {
        let filter = Filter::parse("missing=x").unwrap();
        assert!(!filter.matches(&BTreeMap::new()));
    }

    #[test]
    fn test_matches_handle() {
        let handle = ResourceHandle::new(ProviderKind::Container, "docker", "c0ffee")
            .with_reference(json!({"name": "broker-ubi9", "image": "ubi9:latest"}));

        assert!(Filter::parse("provider=Container").unwrap().matches_handle(&handle));
        assert!(Filter::parse("reference.image<ubi9").unwrap().matches_handle(&handle));
        assert!(Filter::parse("reference.name}ubi9,instance=docker")
            .unwrap()
            .matches_handle(&handle));
        assert!(!Filter::parse("instance!=docker").unwrap().matches_handle(&handle));
        assert!(!Filter::parse("reference.name!{broker")
            .unwrap()
            .matches_handle(&handle));
    }
}
