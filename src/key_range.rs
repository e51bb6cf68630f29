use std::cmp::Ordering;
use std::ops::Bound;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::key::Key;

/// Interval over the key space with optional open/closed bounds
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lower: Option<Key>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    upper: Option<Key>,
    #[serde(default)]
    lower_open: bool,
    #[serde(default)]
    upper_open: bool,
}

impl KeyRange {
    /// Range that contains every key
    pub fn unbounded() -> Self {
        KeyRange::default()
    }

    pub fn only(key: Key) -> Result<Self> {
        key.validate()?;
        Ok(KeyRange {
            lower: Some(key.clone()),
            upper: Some(key),
            lower_open: false,
            upper_open: false,
        })
    }

    pub fn lower_bound(lower: Key, open: bool) -> Result<Self> {
        lower.validate()?;
        Ok(KeyRange {
            lower: Some(lower),
            upper: None,
            lower_open: open,
            upper_open: false,
        })
    }

    pub fn upper_bound(upper: Key, open: bool) -> Result<Self> {
        upper.validate()?;
        Ok(KeyRange {
            lower: None,
            upper: Some(upper),
            lower_open: false,
            upper_open: open,
        })
    }

    pub fn bound(lower: Key, upper: Key, lower_open: bool, upper_open: bool) -> Result<Self> {
        let range = KeyRange {
            lower: Some(lower),
            upper: Some(upper),
            lower_open,
            upper_open,
        };
        range.validate()?;
        Ok(range)
    }

    pub fn lower(&self) -> Option<&Key> {
        self.lower.as_ref()
    }

    pub fn upper(&self) -> Option<&Key> {
        self.upper.as_ref()
    }

    pub fn lower_open(&self) -> bool {
        self.lower_open
    }

    pub fn upper_open(&self) -> bool {
        self.upper_open
    }

    /// Check bound keys and ordering; ranges arriving over the wire go through here too
    pub fn validate(&self) -> Result<()> {
        if let Some(lower) = &self.lower {
            lower.validate()?;
        }
        if let Some(upper) = &self.upper {
            upper.validate()?;
        }
        if let (Some(lower), Some(upper)) = (&self.lower, &self.upper) {
            match lower.cmp(upper) {
                Ordering::Greater => return Err(Error::data()),
                Ordering::Equal if self.lower_open || self.upper_open => {
                    return Err(Error::data())
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn includes(&self, key: &Key) -> bool {
        if let Some(lower) = &self.lower {
            match key.cmp(lower) {
                Ordering::Less => return false,
                Ordering::Equal if self.lower_open => return false,
                _ => {}
            }
        }
        if let Some(upper) = &self.upper {
            match key.cmp(upper) {
                Ordering::Greater => return false,
                Ordering::Equal if self.upper_open => return false,
                _ => {}
            }
        }
        true
    }

    /// Bounds in the shape `BTreeMap::range` expects
    pub fn bounds(&self) -> (Bound<&Key>, Bound<&Key>) {
        let lower = match &self.lower {
            Some(k) if self.lower_open => Bound::Excluded(k),
            Some(k) => Bound::Included(k),
            None => Bound::Unbounded,
        };
        let upper = match &self.upper {
            Some(k) if self.upper_open => Bound::Excluded(k),
            Some(k) => Bound::Included(k),
            None => Bound::Unbounded,
        };
        (lower, upper)
    }
}

impl From<Key> for KeyRange {
    fn from(key: Key) -> Self {
        KeyRange {
            lower: Some(key.clone()),
            upper: Some(key),
            lower_open: false,
            upper_open: false,
        }
    }
}
