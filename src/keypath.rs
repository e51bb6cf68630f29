use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::key::Key;
use crate::value::Value;

/// Dotted field locator, or a list of them, used to derive keys from values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPath {
    Single(String),
    Multiple(Vec<String>),
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
}

fn is_valid_path(path: &str) -> bool {
    path.is_empty() || path.split('.').all(is_identifier)
}

fn evaluate_path(value: &Value, path: &str) -> Option<Value> {
    if path.is_empty() {
        return Some(value.clone());
    }
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = value;
    for (i, segment) in segments.iter().enumerate() {
        let last = i + 1 == segments.len();
        match (current, *segment) {
            (Value::String(s), "length") if last => {
                return Some(Value::Number(s.encode_utf16().count() as f64))
            }
            (Value::Array(items), "length") if last => {
                return Some(Value::Number(items.len() as f64))
            }
            (Value::Object(map), field) => current = map.get(field)?,
            _ => return None,
        }
    }
    Some(current.clone())
}

impl KeyPath {
    pub fn validate(&self) -> Result<()> {
        let valid = match self {
            KeyPath::Single(path) => is_valid_path(path),
            KeyPath::Multiple(paths) => {
                !paths.is_empty() && paths.iter().all(|p| is_valid_path(p))
            }
        };
        if valid {
            Ok(())
        } else {
            Err(Error::syntax())
        }
    }

    pub fn is_multiple(&self) -> bool {
        matches!(self, KeyPath::Multiple(_))
    }

    pub fn is_empty_path(&self) -> bool {
        matches!(self, KeyPath::Single(p) if p.is_empty())
    }

    /// Resolve the path against a value without converting to a key
    pub fn evaluate(&self, value: &Value) -> Option<Value> {
        match self {
            KeyPath::Single(path) => evaluate_path(value, path),
            KeyPath::Multiple(paths) => paths
                .iter()
                .map(|p| evaluate_path(value, p))
                .collect::<Option<Vec<_>>>()
                .map(Value::Array),
        }
    }

    /// `Ok(None)` when the path does not resolve, `DataError` when it resolves
    /// to something that is not a key
    pub fn extract_key(&self, value: &Value) -> Result<Option<Key>> {
        match self.evaluate(value) {
            Some(v) => Key::try_from(&v).map(Some),
            None => Ok(None),
        }
    }

    /// Whether a generated key could be written into `value` at this path
    pub fn can_inject(&self, value: &Value) -> bool {
        let KeyPath::Single(path) = self else {
            return false;
        };
        if path.is_empty() {
            return false;
        }
        let segments: Vec<&str> = path.split('.').collect();
        let mut current = value;
        for segment in &segments[..segments.len() - 1] {
            match current {
                Value::Object(map) => match map.get(*segment) {
                    Some(next) => current = next,
                    None => return true,
                },
                _ => return false,
            }
        }
        current.is_object()
    }

    pub fn inject_key(&self, value: &mut Value, key: &Key) -> Result<()> {
        if !self.can_inject(value) {
            return Err(Error::data());
        }
        let KeyPath::Single(path) = self else {
            return Err(Error::data());
        };
        let mut segments = path.split('.').peekable();
        let mut current = value;
        while let Some(segment) = segments.next() {
            let Value::Object(map) = current else {
                return Err(Error::data());
            };
            if segments.peek().is_none() {
                map.insert(segment.to_string(), Value::from(key.clone()));
                return Ok(());
            }
            current = map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(BTreeMap::new()));
        }
        Ok(())
    }
}

impl From<&str> for KeyPath {
    fn from(path: &str) -> Self {
        KeyPath::Single(path.to_string())
    }
}

impl From<Vec<&str>> for KeyPath {
    fn from(paths: Vec<&str>) -> Self {
        KeyPath::Multiple(paths.into_iter().map(str::to_string).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> Value {
        Value::object([
            ("id", Value::from(7)),
            ("title", Value::from("Dune")),
            ("meta", Value::object([("isbn", Value::from("978"))])),
        ])
    }

    #[test]
    fn validation() {
        assert!(KeyPath::from("").validate().is_ok());
        assert!(KeyPath::from("a.b_c.$d").validate().is_ok());
        assert!(KeyPath::from("a..b").validate().is_err());
        assert!(KeyPath::from("1a").validate().is_err());
        assert!(KeyPath::Multiple(vec![]).validate().is_err());
        assert!(KeyPath::from(vec!["a", "b.c"]).validate().is_ok());
    }

    #[test]
    fn extraction() {
        let value = book();
        assert_eq!(KeyPath::from("id").extract_key(&value).unwrap(), Some(Key::from(7)));
        assert_eq!(
            KeyPath::from("meta.isbn").extract_key(&value).unwrap(),
            Some(Key::from("978"))
        );
        assert_eq!(
            KeyPath::from("title.length").extract_key(&value).unwrap(),
            Some(Key::from(4))
        );
        assert_eq!(KeyPath::from("missing").extract_key(&value).unwrap(), None);
        assert_eq!(
            KeyPath::from(vec!["id", "title"]).extract_key(&value).unwrap(),
            Some(Key::Array(vec![Key::from(7), Key::from("Dune")]))
        );
        assert!(KeyPath::from("meta").extract_key(&value).is_err());
    }

    #[test]
    fn injection_creates_intermediate_objects() {
        let mut value = Value::object([("name", Value::from("a"))]);
        let path = KeyPath::from("ids.primary");
        assert!(path.can_inject(&value));
        path.inject_key(&mut value, &Key::from(3)).unwrap();
        assert_eq!(path.extract_key(&value).unwrap(), Some(Key::from(3)));

        let scalar = Value::from(1);
        assert!(!KeyPath::from("id").can_inject(&scalar));
        assert!(KeyPath::from("id").inject_key(&mut Value::from(1), &Key::from(1)).is_err());
    }
}
