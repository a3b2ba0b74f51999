//! Condition Operators
//!
//! Comparison semantics between a resolved snapshot field and a rule value.
//! Numeric operators require a numeric field; the rule value may be a number
//! or a numeric string. String comparisons ignore case.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Comparison operator of a rule condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    /// Field equals value.
    Equals,
    /// Field differs from value.
    NotEquals,
    /// Field is numerically greater than value.
    GreaterThan,
    /// Field is numerically less than value.
    LessThan,
    /// Field is numerically greater than or equal to value.
    GreaterEqual,
    /// Field is numerically less than or equal to value.
    LessEqual,
    /// String field contains value, or array field contains an equal element.
    Contains,
    /// String field starts with value.
    StartsWith,
    /// String field ends with value.
    EndsWith,
    /// Field equals one element of the value array.
    In,
    /// Field equals no element of the value array.
    NotIn,
}

impl Operator {
    /// Wire name of the operator.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Equals => "equals",
            Self::NotEquals => "not_equals",
            Self::GreaterThan => "greater_than",
            Self::LessThan => "less_than",
            Self::GreaterEqual => "greater_equal",
            Self::LessEqual => "less_equal",
            Self::Contains => "contains",
            Self::StartsWith => "starts_with",
            Self::EndsWith => "ends_with",
            Self::In => "in",
            Self::NotIn => "not_in",
        }
    }

    /// Apply the operator to a resolved field and the rule value.
    #[must_use]
    pub fn apply(self, field: &Value, value: &Value) -> bool {
        match self {
            Self::Equals => loose_eq(field, value),
            Self::NotEquals => !loose_eq(field, value),
            Self::GreaterThan => compare(field, value, |a, b| a > b),
            Self::LessThan => compare(field, value, |a, b| a < b),
            Self::GreaterEqual => compare(field, value, |a, b| a >= b),
            Self::LessEqual => compare(field, value, |a, b| a <= b),
            Self::Contains => match (field, value) {
                (Value::String(haystack), Value::String(needle)) => {
                    haystack.to_lowercase().contains(&needle.to_lowercase())
                }
                (Value::Array(items), needle) => items.iter().any(|item| loose_eq(item, needle)),
                _ => false,
            },
            Self::StartsWith => strings(field, value, |f, v| f.starts_with(v)),
            Self::EndsWith => strings(field, value, |f, v| f.ends_with(v)),
            Self::In => match value {
                Value::Array(items) => items.iter().any(|item| loose_eq(field, item)),
                _ => false,
            },
            Self::NotIn => match value {
                Value::Array(items) => !items.iter().any(|item| loose_eq(field, item)),
                _ => false,
            },
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numbers compare numerically, strings case-insensitively, everything else structurally.
fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => (x - y).abs() < f64::EPSILON,
            _ => x == y,
        },
        (Value::String(x), Value::String(y)) => x.to_lowercase() == y.to_lowercase(),
        _ => a == b,
    }
}

fn compare(field: &Value, value: &Value, op: impl Fn(f64, f64) -> bool) -> bool {
    let Some(lhs) = field.as_f64() else {
        return false;
    };
    let rhs = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    rhs.is_some_and(|rhs| op(lhs, rhs))
}

fn strings(field: &Value, value: &Value, op: impl Fn(&str, &str) -> bool) -> bool {
    match (field, value) {
        (Value::String(f), Value::String(v)) => op(&f.to_lowercase(), &v.to_lowercase()),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use test_case::test_case;

    use super::*;

    #[test_case(Operator::Equals, json!(1.5), json!(1.5), true ; "equals numbers")]
    #[test_case(Operator::Equals, json!(2), json!(2.0), true ; "equals int and float")]
    #[test_case(Operator::Equals, json!("BUY"), json!("buy"), true ; "equals ignores case")]
    #[test_case(Operator::Equals, json!(true), json!(true), true ; "equals booleans")]
    #[test_case(Operator::Equals, json!("1"), json!(1), false ; "equals string and number")]
    #[test_case(Operator::NotEquals, json!("y"), json!("x"), true ; "not equals strings")]
    #[test_case(Operator::NotEquals, json!(3), json!(3), false ; "not equals same number")]
    #[test_case(Operator::GreaterThan, json!(10), json!(5), true ; "greater than")]
    #[test_case(Operator::GreaterThan, json!(1.1052), json!("1.10"), true ; "greater than numeric string")]
    #[test_case(Operator::GreaterThan, json!("10"), json!(5), false ; "greater than string field")]
    #[test_case(Operator::GreaterThan, json!(5), json!(5), false ; "greater than equal values")]
    #[test_case(Operator::LessThan, json!(5), json!(2), false ; "less than false")]
    #[test_case(Operator::LessThan, json!(1), json!("abc"), false ; "less than non numeric value")]
    #[test_case(Operator::GreaterEqual, json!(5), json!(5), true ; "greater equal")]
    #[test_case(Operator::LessEqual, json!(4.99), json!(5), true ; "less equal")]
    #[test_case(Operator::Contains, json!("Breakout Signal"), json!("breakout"), true ; "contains substring")]
    #[test_case(Operator::Contains, json!(["a", "b"]), json!("B"), true ; "contains array element")]
    #[test_case(Operator::Contains, json!(42), json!("4"), false ; "contains on number")]
    #[test_case(Operator::StartsWith, json!("EURUSD"), json!("eur"), true ; "starts with")]
    #[test_case(Operator::EndsWith, json!("EURUSD"), json!("usd"), true ; "ends with")]
    #[test_case(Operator::EndsWith, json!("EURUSD"), json!("eur"), false ; "ends with false")]
    #[test_case(Operator::In, json!("GBPUSD"), json!(["eurusd", "gbpusd"]), true ; "in list")]
    #[test_case(Operator::In, json!("USDJPY"), json!(["EURUSD"]), false ; "not in list")]
    #[test_case(Operator::In, json!("EURUSD"), json!("EURUSD"), false ; "in non array")]
    #[test_case(Operator::NotIn, json!("USDJPY"), json!(["EURUSD"]), true ; "not in list true")]
    #[test_case(Operator::NotIn, json!(1), json!([1, 2]), false ; "not in list false")]
    fn operator_table(op: Operator, field: Value, value: Value, expected: bool) {
        assert_eq!(op.apply(&field, &value), expected);
    }

    #[test]
    fn operator_wire_names() {
        let op: Operator = serde_json::from_value(json!("greater_equal")).unwrap();
        assert_eq!(op, Operator::GreaterEqual);
        assert_eq!(serde_json::to_value(Operator::NotIn).unwrap(), json!("not_in"));
    }
}
