//! Field Paths
//!
//! Pre-parsed accessors into a JSON snapshot, e.g. `prices.EURUSD.bid` or
//! `positions[0].pnl`. Parsing happens once when a rule is loaded; resolving
//! is a walk over the segments with no allocation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::RuleError;

/// One step of a field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Object key.
    Key(String),
    /// Array index. On an object, the decimal string is used as a key.
    Index(usize),
}

/// Parsed dot/bracket path into a JSON value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldPath {
    raw: String,
    segments: Vec<Segment>,
}

impl FieldPath {
    /// Parse a path.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::InvalidFieldPath`] for empty paths, empty
    /// segments and unbalanced brackets.
    pub fn parse(raw: &str) -> Result<Self, RuleError> {
        let invalid = |reason: &str| RuleError::InvalidFieldPath {
            path: raw.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(invalid("path is empty"));
        }

        let mut segments = Vec::new();
        for part in trimmed.split('.') {
            let (head, mut rest) = match part.find('[') {
                Some(pos) => part.split_at(pos),
                None => (part, ""),
            };

            if head.is_empty() && rest.is_empty() {
                return Err(invalid("empty segment"));
            }
            if !head.is_empty() {
                segments.push(Self::classify(head));
            }

            while let Some(open) = rest.strip_prefix('[') {
                let Some(close) = open.find(']') else {
                    return Err(invalid("unclosed bracket"));
                };
                let inner = open[..close].trim();
                if inner.is_empty() {
                    return Err(invalid("empty index"));
                }
                segments.push(Self::classify(inner));
                rest = &open[close + 1..];
            }

            if !rest.is_empty() {
                return Err(invalid("unexpected characters after index"));
            }
        }

        Ok(Self {
            raw: trimmed.to_string(),
            segments,
        })
    }

    fn classify(segment: &str) -> Segment {
        segment
            .parse::<usize>()
            .map_or_else(|_| Segment::Key(segment.to_string()), Segment::Index)
    }

    /// Parsed segments.
    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Original path text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Walk the path through `root`. Returns `None` if any step is missing.
    #[must_use]
    pub fn resolve<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        self.segments
            .iter()
            .try_fold(root, |current, segment| match (segment, current) {
                (Segment::Key(key), Value::Object(map)) => map.get(key),
                (Segment::Index(index), Value::Array(items)) => items.get(*index),
                (Segment::Index(index), Value::Object(map)) => map.get(&index.to_string()),
                _ => None,
            })
    }
}

impl FromStr for FieldPath {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for FieldPath {
    type Error = RuleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<FieldPath> for String {
    fn from(path: FieldPath) -> Self {
        path.raw
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use test_case::test_case;

    use super::*;

    fn snapshot() -> Value {
        json!({
            "prices": { "EURUSD": { "bid": 1.1052, "ask": 1.1054 } },
            "positions": [ { "symbol": "EURUSD", "pnl": -12.5 } ],
            "buckets": { "0": "zero" }
        })
    }

    #[test]
    fn parses_dotted_path() {
        let path = FieldPath::parse("prices.EURUSD.bid").unwrap();
        assert_eq!(
            path.segments(),
            &[
                Segment::Key("prices".into()),
                Segment::Key("EURUSD".into()),
                Segment::Key("bid".into())
            ]
        );
    }

    #[test]
    fn bracket_and_dot_indices_are_equivalent() {
        let bracket = FieldPath::parse("positions[0].pnl").unwrap();
        let dotted = FieldPath::parse("positions.0.pnl").unwrap();
        assert_eq!(bracket.segments(), dotted.segments());
    }

    #[test_case("prices.EURUSD.bid", Some(json!(1.1052)) ; "nested key")]
    #[test_case("positions[0].pnl", Some(json!(-12.5)) ; "array index")]
    #[test_case("buckets.0", Some(json!("zero")) ; "numeric key on object")]
    #[test_case("prices.GBPUSD.bid", None ; "missing symbol")]
    #[test_case("positions[3].pnl", None ; "index out of range")]
    #[test_case("prices.EURUSD.bid.value", None ; "descend into number")]
    fn resolves_against_snapshot(path: &str, expected: Option<Value>) {
        let root = snapshot();
        let path = FieldPath::parse(path).unwrap();
        assert_eq!(path.resolve(&root).cloned(), expected);
    }

    #[test_case("" ; "empty")]
    #[test_case("prices..bid" ; "empty segment")]
    #[test_case("positions[0" ; "unclosed bracket")]
    #[test_case("positions[]" ; "empty index")]
    #[test_case("positions[0]x" ; "trailing garbage")]
    fn rejects_malformed_paths(path: &str) {
        assert!(matches!(
            FieldPath::parse(path),
            Err(RuleError::InvalidFieldPath { .. })
        ));
    }

    #[test]
    fn serde_uses_plain_string() {
        let path: FieldPath = serde_json::from_value(json!("prices.EURUSD.bid")).unwrap();
        assert_eq!(serde_json::to_value(&path).unwrap(), json!("prices.EURUSD.bid"));
        assert!(serde_json::from_value::<FieldPath>(json!("a..b")).is_err());
    }
}
