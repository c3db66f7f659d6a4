use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{fmt, str::FromStr};

use crate::DocumentError;

/// Dotted path into the structured fields of a document, e.g. `assumptions.revenue`.
///
/// Always has at least one segment and no empty segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    pub fn parse(raw: &str) -> Result<Self, DocumentError> {
        let segments: Vec<String> = raw.split('.').map(str::to_string).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(DocumentError::InvalidPath(raw.to_string()));
        }
        Ok(Self(segments))
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when `self` equals `other` or is one of its ancestors.
    pub fn is_prefix_of(&self, other: &FieldPath) -> bool {
        other.0.starts_with(&self.0)
    }

    /// Two paths overlap when one is a prefix of the other.
    pub fn overlaps(&self, other: &FieldPath) -> bool {
        self.is_prefix_of(other) || other.is_prefix_of(self)
    }

    /// Segments of `self` below `ancestor`, if `ancestor` is a prefix.
    pub fn strip_prefix(&self, ancestor: &FieldPath) -> Option<&[String]> {
        if ancestor.is_prefix_of(self) {
            Some(&self.0[ancestor.0.len()..])
        } else {
            None
        }
    }

    fn truncated(&self, depth: usize) -> FieldPath {
        FieldPath(self.0[..=depth].to_vec())
    }

    pub fn get<'a>(&self, fields: &'a Map<String, Value>) -> Option<&'a Value> {
        let (head, rest) = self.0.split_first()?;
        value_at(fields.get(head)?, rest)
    }

    /// Writes `value` at this path (`None` clears it) and returns the write
    /// that would undo it.
    ///
    /// Missing or non-object intermediates are replaced by objects. The undo
    /// target is then the shallowest replaced ancestor so that reverting also
    /// removes the intermediates that were created.
    pub fn set(
        &self,
        fields: &mut Map<String, Value>,
        value: Option<Value>,
    ) -> (FieldPath, Option<Value>) {
        match value {
            Some(value) => {
                let (depth, previous) = assign(fields, &self.0, 0, value);
                (self.truncated(depth), previous)
            }
            None => (self.clone(), remove(fields, &self.0)),
        }
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

impl FromStr for FieldPath {
    type Err = DocumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for FieldPath {
    type Error = DocumentError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<FieldPath> for String {
    fn from(path: FieldPath) -> Self {
        path.to_string()
    }
}

/// Looks up `rest` below `value`, walking through objects only.
pub fn value_at<'a>(value: &'a Value, rest: &[String]) -> Option<&'a Value> {
    rest.iter()
        .try_fold(value, |current, segment| current.as_object()?.get(segment))
}

/// Returns `base` with `rest` overwritten by `value`, using the same rules as
/// [`FieldPath::set`] so that patching a value and writing into the document
/// always agree.
pub fn patch_value(base: Option<Value>, rest: &[String], value: Option<Value>) -> Option<Value> {
    if rest.is_empty() {
        return value;
    }
    match value {
        Some(value) => {
            let mut map = match base {
                Some(Value::Object(map)) => map,
                _ => Map::new(),
            };
            assign(&mut map, rest, 0, value);
            Some(Value::Object(map))
        }
        None => match base {
            Some(Value::Object(mut map)) => {
                remove(&mut map, rest);
                Some(Value::Object(map))
            }
            other => other,
        },
    }
}

fn assign(
    map: &mut Map<String, Value>,
    segments: &[String],
    depth: usize,
    value: Value,
) -> (usize, Option<Value>) {
    let Some((head, rest)) = segments.split_first() else {
        return (depth, None);
    };
    if rest.is_empty() {
        return (depth, map.insert(head.clone(), value));
    }
    match map.get_mut(head) {
        Some(Value::Object(child)) => assign(child, rest, depth + 1, value),
        _ => {
            let mut child = Map::new();
            assign(&mut child, rest, depth + 1, value);
            let previous = map.insert(head.clone(), Value::Object(child));
            (depth, previous)
        }
    }
}

fn remove(map: &mut Map<String, Value>, segments: &[String]) -> Option<Value> {
    let (head, rest) = segments.split_first()?;
    if rest.is_empty() {
        return map.remove(head);
    }
    match map.get_mut(head) {
        Some(Value::Object(child)) => remove(child, rest),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_parse_rejects_empty_segments() {
        assert!(FieldPath::parse("a..b").is_err());
        assert!(FieldPath::parse("").is_err());
        assert_eq!(FieldPath::parse("a.b").unwrap().len(), 2);
    }

    #[test]
    fn test_prefix_relations() {
        let parent = FieldPath::parse("dcf").unwrap();
        let child = FieldPath::parse("dcf.wacc").unwrap();
        let sibling = FieldPath::parse("dcfx").unwrap();

        assert!(parent.is_prefix_of(&child));
        assert!(child.overlaps(&parent));
        assert!(!parent.overlaps(&sibling));
        assert_eq!(child.strip_prefix(&parent).unwrap(), &["wacc".to_string()]);
    }

    #[test]
    fn test_set_returns_inverse_for_created_intermediates() {
        let mut map = fields(json!({ "revenue": 10 }));
        let path = FieldPath::parse("dcf.wacc.base").unwrap();

        let (undo_path, previous) = path.set(&mut map, Some(json!(0.08)));
        assert_eq!(undo_path.to_string(), "dcf");
        assert_eq!(previous, None);
        assert_eq!(path.get(&map), Some(&json!(0.08)));

        undo_path.set(&mut map, previous);
        assert_eq!(Value::Object(map), json!({ "revenue": 10 }));
    }

    #[test]
    fn test_clear_through_scalar_is_noop() {
        let mut map = fields(json!({ "dcf": 5 }));
        let path = FieldPath::parse("dcf.wacc").unwrap();
        let (_, previous) = path.set(&mut map, None);
        assert_eq!(previous, None);
        assert_eq!(Value::Object(map), json!({ "dcf": 5 }));
    }

    #[test]
    fn test_patch_value_matches_set() {
        let rest = vec!["wacc".to_string()];
        let patched = patch_value(Some(json!(3)), &rest, Some(json!(0.1)));
        assert_eq!(patched, Some(json!({ "wacc": 0.1 })));

        let cleared = patch_value(Some(json!({ "wacc": 1, "g": 2 })), &rest, None);
        assert_eq!(cleared, Some(json!({ "g": 2 })));
    }
}
