use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::value::{number, Value};

/// A valid key. Variants are declared in their sort order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum Key {
    Number(#[serde(with = "number")] f64),
    Date(#[serde(with = "number")] f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Key>),
}

impl Key {
    fn rank(&self) -> u8 {
        match self {
            Key::Number(_) => 0,
            Key::Date(_) => 1,
            Key::String(_) => 2,
            Key::Bytes(_) => 3,
            Key::Array(_) => 4,
        }
    }

    /// Reject keys that could not have come out of a value conversion
    pub fn validate(&self) -> Result<()> {
        match self {
            Key::Number(n) | Key::Date(n) if n.is_nan() => Err(Error::data()),
            Key::Array(items) => items.iter().try_for_each(Key::validate),
            _ => Ok(()),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Key::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Key::Number(a), Key::Number(b)) | (Key::Date(a), Key::Date(b)) => {
                a.partial_cmp(b).unwrap_or(Ordering::Equal)
            }
            // strings order by UTF-16 code units
            (Key::String(a), Key::String(b)) => a.encode_utf16().cmp(b.encode_utf16()),
            (Key::Bytes(a), Key::Bytes(b)) => a.cmp(b),
            (Key::Array(a), Key::Array(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl TryFrom<&Value> for Key {
    type Error = Error;

    fn try_from(value: &Value) -> Result<Key> {
        match value {
            Value::Number(n) if !n.is_nan() => Ok(Key::Number(*n)),
            Value::Date(t) if !t.is_nan() => Ok(Key::Date(*t)),
            Value::String(s) => Ok(Key::String(s.clone())),
            Value::Bytes(b) => Ok(Key::Bytes(b.clone())),
            Value::Array(items) => items
                .iter()
                .map(Key::try_from)
                .collect::<Result<Vec<_>>>()
                .map(Key::Array),
            _ => Err(Error::data()),
        }
    }
}

impl From<Key> for Value {
    fn from(key: Key) -> Value {
        match key {
            Key::Number(n) => Value::Number(n),
            Key::Date(t) => Value::Date(t),
            Key::String(s) => Value::String(s),
            Key::Bytes(b) => Value::Bytes(b),
            Key::Array(items) => Value::Array(items.into_iter().map(Value::from).collect()),
        }
    }
}

impl From<f64> for Key {
    fn from(n: f64) -> Self {
        Key::Number(n)
    }
}

impl From<i32> for Key {
    fn from(n: i32) -> Self {
        Key::Number(n as f64)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::String(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::String(s)
    }
}

/// Compare two arbitrary values as keys.
///
/// A missing argument is a `TypeError`; a value that is not a valid key is a
/// `DataError`.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Result<Ordering> {
    let (Some(a), Some(b)) = (a, b) else {
        return Err(Error::Type("cmp requires two arguments".into()));
    };
    Ok(Key::try_from(a)?.cmp(&Key::try_from(b)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn any_key() -> impl Strategy<Value = Key> {
        let leaf = prop_oneof![
            (-1.0e6..1.0e6f64).prop_map(Key::Number),
            (0.0..1.0e12f64).prop_map(Key::Date),
            "[a-c\u{e9}\u{1f600}]{0,4}".prop_map(Key::String),
            prop::collection::vec(any::<u8>(), 0..4).prop_map(Key::Bytes),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop::collection::vec(inner, 0..4).prop_map(Key::Array)
        })
    }

    #[test]
    fn cross_type_order() {
        let ordered = vec![
            Key::Number(f64::INFINITY),
            Key::Date(-1.0),
            Key::String(String::new()),
            Key::Bytes(vec![]),
            Key::Array(vec![]),
        ];
        for pair in ordered.windows(2) {
            assert!(pair[0] < pair[1], "{:?} < {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn strings_compare_by_code_units() {
        // U+FF61 sorts after a surrogate pair in UTF-16 but before it in UTF-8
        let bmp = Key::from("\u{ff61}");
        let astral = Key::from("\u{1f600}");
        assert!(astral < bmp);
    }

    #[test]
    fn arrays_and_bytes_compare_prefix_first() {
        let short = Key::Array(vec![Key::from(1), Key::from(2)]);
        let long = Key::Array(vec![Key::from(1), Key::from(2), Key::from(0)]);
        let bigger = Key::Array(vec![Key::from(2)]);
        assert!(short < long);
        assert!(long < bigger);
        assert!(Key::Bytes(vec![1, 2]) < Key::Bytes(vec![1, 2, 0]));
        assert!(Key::Bytes(vec![1, 3]) > Key::Bytes(vec![1, 2, 0]));
    }

    #[test]
    fn conversion_rejects_invalid_values() {
        assert!(Key::try_from(&Value::Number(f64::NAN)).is_err());
        assert!(Key::try_from(&Value::Date(f64::NAN)).is_err());
        assert!(Key::try_from(&Value::Bool(true)).is_err());
        assert!(Key::try_from(&Value::Array(vec![Value::Null])).is_err());
        assert!(Key::try_from(&Value::object([("a", Value::from(1))])).is_err());

        let bytes = Value::bytes(&[1, 2, 3]);
        assert_eq!(Key::try_from(&bytes).unwrap(), Key::Bytes(vec![1, 2, 3]));
        assert_eq!(Key::Number(-0.0), Key::Number(0.0));
    }

    #[test]
    fn compare_values_reports_missing_arguments() {
        let one = Value::from(1);
        assert!(matches!(compare_values(Some(&one), None), Err(Error::Type(_))));
        assert!(matches!(
            compare_values(Some(&one), Some(&Value::Null)),
            Err(Error::Data(_))
        ));
        assert_eq!(
            compare_values(Some(&one), Some(&Value::from("1"))).unwrap(),
            Ordering::Less
        );
    }

    #[test]
    fn infinite_keys_survive_json() {
        let keys = vec![
            Key::Number(f64::NEG_INFINITY),
            Key::Array(vec![Key::Date(f64::INFINITY), Key::Number(2.5)]),
        ];
        let text = serde_json::to_string(&keys).unwrap();
        let back: Vec<Key> = serde_json::from_str(&text).unwrap();
        assert_eq!(back, keys);
    }

    proptest! {
        #[test]
        fn compare_is_antisymmetric(a in any_key(), b in any_key()) {
            prop_assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
        }

        #[test]
        fn compare_is_transitive(a in any_key(), b in any_key(), c in any_key()) {
            if a <= b && b <= c {
                prop_assert!(a <= c);
            }
            if a == b && b == c {
                prop_assert_eq!(a.cmp(&c), Ordering::Equal);
            }
        }

        #[test]
        fn rank_decides_mixed_types(a in any_key(), b in any_key()) {
            if a.rank() != b.rank() {
                prop_assert_eq!(a.cmp(&b), a.rank().cmp(&b.rank()));
            }
        }
    }
}
