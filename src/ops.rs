//! # Clause Operators
//!
//! Scalar matching for targeting-rule clauses: equality, string prefixes and
//! substrings, regular expressions, numeric and date ordering, and semantic
//! versions. `segmentMatch` is not handled here; it needs store access and
//! lives with the evaluator.
//!
//! Semantic versions are parsed with a tolerant grammar: missing minor and
//! patch components are padded with zeros, so `"2"` compares like `"2.0.0"`.

use chrono::DateTime;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::schema::Operator;
use crate::value::Value;

/// Apply an operator to one user attribute value and one clause value.
/// Anything type-mismatched simply does not match.
pub fn match_values(op: Operator, user_value: &Value, clause_value: &Value) -> bool {
    match op {
        Operator::In => user_value == clause_value,
        Operator::StartsWith => {
            string_op(user_value, clause_value, |u, c| u.starts_with(c))
        }
        Operator::EndsWith => string_op(user_value, clause_value, |u, c| u.ends_with(c)),
        Operator::Contains => string_op(user_value, clause_value, |u, c| u.contains(c)),
        Operator::Matches => string_op(user_value, clause_value, regex_match),
        Operator::LessThan => number_op(user_value, clause_value, |u, c| u < c),
        Operator::LessThanOrEqual => number_op(user_value, clause_value, |u, c| u <= c),
        Operator::GreaterThan => number_op(user_value, clause_value, |u, c| u > c),
        Operator::GreaterThanOrEqual => number_op(user_value, clause_value, |u, c| u >= c),
        Operator::Before => date_op(user_value, clause_value, |u, c| u < c),
        Operator::After => date_op(user_value, clause_value, |u, c| u > c),
        Operator::SemVerEqual => semver_op(user_value, clause_value, |ord| ord.is_eq()),
        Operator::SemVerLessThan => semver_op(user_value, clause_value, |ord| ord.is_lt()),
        Operator::SemVerGreaterThan => {
            semver_op(user_value, clause_value, |ord| ord.is_gt())
        }
        // Needs the store; handled by the evaluator before we get here.
        Operator::SegmentMatch => false,
        Operator::Unknown => false,
    }
}

fn string_op(user_value: &Value, clause_value: &Value, f: impl Fn(&str, &str) -> bool) -> bool {
    match (user_value.as_str(), clause_value.as_str()) {
        (Some(u), Some(c)) => f(u, c),
        _ => false,
    }
}

fn number_op(user_value: &Value, clause_value: &Value, f: impl Fn(f64, f64) -> bool) -> bool {
    match (user_value.as_f64(), clause_value.as_f64()) {
        (Some(u), Some(c)) => f(u, c),
        _ => false,
    }
}

fn regex_match(user_value: &str, pattern: &str) -> bool {
    match Regex::new(pattern) {
        Ok(re) => re.is_match(user_value),
        Err(_) => {
            log::error!("failed to compile clause regex: {:?}", pattern);
            false
        }
    }
}

/// Interpret a value as a timestamp in Unix milliseconds: either an RFC 3339
/// string or a number.
fn parse_date(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => Some(*n),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.timestamp_millis() as f64),
        _ => None,
    }
}

fn date_op(user_value: &Value, clause_value: &Value, f: impl Fn(f64, f64) -> bool) -> bool {
    match (parse_date(user_value), parse_date(clause_value)) {
        (Some(u), Some(c)) => f(u, c),
        _ => false,
    }
}

fn semver_op(
    user_value: &Value,
    clause_value: &Value,
    f: impl Fn(std::cmp::Ordering) -> bool,
) -> bool {
    match (
        user_value.as_str().and_then(SemVer::parse),
        clause_value.as_str().and_then(SemVer::parse),
    ) {
        (Some(u), Some(c)) => f(u.cmp(&c)),
        _ => false,
    }
}

static SEMVER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(\d+)(?:\.(\d+))?(?:\.(\d+))?(?:-([0-9A-Za-z\-.]+))?(?:\+[0-9A-Za-z\-.]+)?$",
    )
    .unwrap()
});

/// A parsed semantic version. Build metadata is parsed but ignored for
/// comparison, per the semver specification.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SemVer {
    major: u64,
    minor: u64,
    patch: u64,
    prerelease: Option<String>,
}

impl SemVer {
    fn parse(input: &str) -> Option<SemVer> {
        let caps = SEMVER_RE.captures(input)?;
        let component = |i: usize| -> Option<u64> {
            match caps.get(i) {
                Some(m) => m.as_str().parse().ok(),
                None => Some(0),
            }
        };
        Some(SemVer {
            major: component(1)?,
            minor: component(2)?,
            patch: component(3)?,
            prerelease: caps.get(4).map(|m| m.as_str().to_owned()),
        })
    }
}

impl Ord for SemVer {
    fn cmp(&self, other: &SemVer) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (&self.prerelease, &other.prerelease) {
                (None, None) => Ordering::Equal,
                // A release outranks any of its prereleases.
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => compare_prerelease(a, b),
            })
    }
}

impl PartialOrd for SemVer {
    fn partial_cmp(&self, other: &SemVer) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Dot-separated prerelease identifiers: numeric identifiers compare
/// numerically and rank below alphanumeric ones; a shorter list that is a
/// prefix of a longer one ranks lower.
fn compare_prerelease(a: &str, b: &str) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(nx), Ok(ny)) => nx.cmp(&ny),
                    (Ok(_), Err(_)) => Ordering::Less,
                    (Err(_), Ok(_)) => Ordering::Greater,
                    (Err(_), Err(_)) => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}
