//! # Flag Evaluation Engine
//!
//! Given a flag, a user, and the data store, produce a variation value, its
//! index, and the reason it was chosen. Evaluation is pure except for store
//! reads (prerequisites and segments), and it never fails outward: every
//! path yields either a concrete variation or "no value" with an error
//! reason, leaving fallback substitution to the caller.
//!
//! The order of checks is fixed: off state, prerequisites, individual
//! targets, rules, then the fallthrough. Prerequisite evaluations are
//! recursive and report a feature event for every prerequisite flag they
//! touch, tagged with the key of the flag that required it.
//!
//! ## Bucketing
//!
//! Rollouts assign users deterministically: SHA-1 over
//! `"<key>.<salt>.<attr>"` (or `"<seed>.<attr>"` when a seed is set), first
//! 15 hex digits taken as an integer, scaled into [0, 1). The same user,
//! salt, and key always land in the same bucket, which is what makes
//! percentage rollouts stable across processes and SDKs.

use std::sync::Arc;

use sha1::{Digest, Sha1};

use crate::error::{EvalErrorKind, StoreError};
use crate::ops;
use crate::schema::{
    Clause, FeatureFlag, Operator, Rollout, RolloutKind, Rule, Segment, SegmentRule,
    VariationOrRollout,
};
use crate::store::{self, DataStore};
use crate::user::User;
use crate::value::Value;

/// Scale constant: 15 hex digits of SHA-1 output span [0, 0xFFFFFFFFFFFFFFF].
const LONG_SCALE: f64 = 0xFFF_FFFF_FFFF_FFFF_u64 as f64;

/// Why an evaluation produced its result.
#[derive(Debug, Clone, PartialEq)]
pub enum Reason {
    /// The flag was off and served its off variation (or nothing).
    Off,
    /// The user key was listed in one of the flag's targets.
    TargetMatch,
    /// A rule matched.
    RuleMatch {
        rule_index: usize,
        rule_id: String,
        in_experiment: bool,
    },
    /// A prerequisite flag was off or served the wrong variation.
    PrerequisiteFailed { prerequisite_key: String },
    /// No target or rule matched; the fallthrough applied.
    Fallthrough { in_experiment: bool },
    /// Evaluation could not happen; the caller's fallback stands in.
    Error { kind: EvalErrorKind },
}

impl Reason {
    pub fn kind_str(&self) -> &'static str {
        match self {
            Reason::Off => "OFF",
            Reason::TargetMatch => "TARGET_MATCH",
            Reason::RuleMatch { .. } => "RULE_MATCH",
            Reason::PrerequisiteFailed { .. } => "PREREQUISITE_FAILED",
            Reason::Fallthrough { .. } => "FALLTHROUGH",
            Reason::Error { .. } => "ERROR",
        }
    }

    /// The JSON form used in event payloads and detail output.
    pub fn to_json(&self) -> Value {
        let mut entries = vec![(
            "kind".to_owned(),
            Value::String(self.kind_str().to_owned()),
        )];
        match self {
            Reason::Error { kind } => {
                entries.push((
                    "errorKind".to_owned(),
                    Value::String(kind.as_str().to_owned()),
                ));
            }
            Reason::PrerequisiteFailed { prerequisite_key } => {
                entries.push((
                    "prerequisiteKey".to_owned(),
                    Value::String(prerequisite_key.clone()),
                ));
            }
            Reason::RuleMatch {
                rule_index,
                rule_id,
                in_experiment,
            } => {
                if !rule_id.is_empty() {
                    entries.push(("id".to_owned(), Value::String(rule_id.clone())));
                }
                entries.push(("ruleIndex".to_owned(), Value::Number(*rule_index as f64)));
                if *in_experiment {
                    entries.push(("inExperiment".to_owned(), Value::Bool(true)));
                }
            }
            Reason::Fallthrough { in_experiment } => {
                if *in_experiment {
                    entries.push(("inExperiment".to_owned(), Value::Bool(true)));
                }
            }
            _ => {}
        }
        Value::Object(entries)
    }
}

/// The outcome of one evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Detail {
    /// The served value, or `None` when the caller's fallback applies.
    pub value: Option<Value>,
    /// Index of the served variation, when one was selected.
    pub variation_index: Option<usize>,
    pub reason: Reason,
}

impl Detail {
    pub fn error(kind: EvalErrorKind) -> Detail {
        Detail {
            value: None,
            variation_index: None,
            reason: Reason::Error { kind },
        }
    }
}

/// A prerequisite evaluation that the event processor must record as a
/// feature event with `prereqOf` set.
#[derive(Debug, Clone)]
pub struct PrereqEvent {
    /// The prerequisite flag that was evaluated.
    pub flag: Arc<FeatureFlag>,
    /// Key of the flag that declared the prerequisite.
    pub prereq_of: String,
    pub detail: Detail,
}

/// Evaluate `flag` for `user`, appending one entry to `prereq_events` per
/// prerequisite flag visited.
pub fn evaluate(
    flag: &FeatureFlag,
    user: &User,
    data_store: &dyn DataStore,
    prereq_events: &mut Vec<PrereqEvent>,
) -> Detail {
    if user.key().is_empty() {
        return Detail::error(EvalErrorKind::UserNotSpecified);
    }

    if !flag.on {
        return off_value(flag, Reason::Off);
    }

    for prerequisite in &flag.prerequisites {
        let prereq_flag = match store::get_flag(data_store, &prerequisite.key) {
            Ok(found) => found,
            Err(_) => return Detail::error(EvalErrorKind::StoreError),
        };

        let failed_key = || Reason::PrerequisiteFailed {
            prerequisite_key: prerequisite.key.clone(),
        };

        let prereq_flag = match prereq_flag {
            Some(found) => found,
            None => return off_value(flag, failed_key()),
        };

        let detail = evaluate(&prereq_flag, user, data_store, prereq_events);
        let passed = prereq_flag.on
            && detail.variation_index == Some(prerequisite.variation)
            && !matches!(detail.reason, Reason::Error { .. });

        prereq_events.push(PrereqEvent {
            flag: prereq_flag,
            prereq_of: flag.key.clone(),
            detail,
        });

        if !passed {
            return off_value(flag, failed_key());
        }
    }

    for target in &flag.targets {
        if target.values.contains(user.key()) {
            return value_for_index(flag, target.variation, Reason::TargetMatch);
        }
    }

    for (rule_index, rule) in flag.rules.iter().enumerate() {
        match rule_matches_user(rule, user, data_store) {
            Err(_) => return Detail::error(EvalErrorKind::StoreError),
            Ok(false) => continue,
            Ok(true) => {
                let (index, in_experiment) =
                    match variation_index_for_user(flag, &rule.variation_or_rollout, user) {
                        Some(selected) => selected,
                        None => return Detail::error(EvalErrorKind::MalformedFlag),
                    };
                return value_for_index(
                    flag,
                    index,
                    Reason::RuleMatch {
                        rule_index,
                        rule_id: rule.id.clone(),
                        in_experiment,
                    },
                );
            }
        }
    }

    let (index, in_experiment) = match variation_index_for_user(flag, &flag.fallthrough, user)
    {
        Some(selected) => selected,
        None => return Detail::error(EvalErrorKind::MalformedFlag),
    };
    value_for_index(flag, index, Reason::Fallthrough { in_experiment })
}

/// Serve the off variation, or no value if the flag does not define one.
fn off_value(flag: &FeatureFlag, reason: Reason) -> Detail {
    match flag.off_variation {
        Some(index) => value_for_index(flag, index, reason),
        None => Detail {
            value: None,
            variation_index: None,
            reason,
        },
    }
}

fn value_for_index(flag: &FeatureFlag, index: usize, reason: Reason) -> Detail {
    match flag.variation_value(index) {
        Some(value) => Detail {
            value: Some(value.clone()),
            variation_index: Some(index),
            reason,
        },
        None => Detail::error(EvalErrorKind::MalformedFlag),
    }
}

/// Resolve a variation-or-rollout to a concrete index plus the experiment
/// bit. `None` means the flag is malformed (no variation, no rollout, or an
/// empty rollout).
fn variation_index_for_user(
    flag: &FeatureFlag,
    vor: &VariationOrRollout,
    user: &User,
) -> Option<(usize, bool)> {
    if let Some(index) = vor.variation {
        return Some((index, false));
    }
    let rollout = vor.rollout.as_ref()?;
    rollout_variation(rollout, &flag.key, &flag.salt, user)
}

fn rollout_variation(
    rollout: &Rollout,
    key: &str,
    salt: &str,
    user: &User,
) -> Option<(usize, bool)> {
    let bucket_by = rollout.bucket_by.as_deref().unwrap_or("key");
    let bucket = bucket_user(user, key, bucket_by, salt, rollout.seed);

    let experiment = rollout.kind == RolloutKind::Experiment;
    let mut cumulative = 0.0;
    for weighted in &rollout.variations {
        cumulative += weighted.weight as f64 / 100_000.0;
        if bucket < cumulative {
            return Some((weighted.variation, experiment && !weighted.untracked));
        }
    }
    // Floating-point shortfall at the top of the range: the last slice wins.
    rollout
        .variations
        .last()
        .map(|last| (last.variation, experiment && !last.untracked))
}

/// Deterministically place a user in [0, 1) for a rollout or weighted
/// segment rule.
pub fn bucket_user(
    user: &User,
    key: &str,
    attribute: &str,
    salt: &str,
    seed: Option<i64>,
) -> f64 {
    let attr_value = match user.attribute_value(attribute) {
        Some(value) => value,
        None => return 0.0,
    };
    let bucketable = match bucketable_string(&attr_value) {
        Some(text) => text,
        None => return 0.0,
    };

    let input = match seed {
        Some(seed) => format!("{}.{}", seed, bucketable),
        None => {
            let mut suffixed = bucketable;
            if let Some(secondary) = user.secondary() {
                suffixed = format!("{}.{}", suffixed, secondary);
            }
            format!("{}.{}.{}", key, salt, suffixed)
        }
    };

    let digest = Sha1::digest(input.as_bytes());
    let encoded = hex::encode(digest);
    // 15 hex digits = 60 bits, always within u64 range.
    let hash = u64::from_str_radix(&encoded[..15], 16).unwrap_or(0);
    hash as f64 / LONG_SCALE
}

/// Strings bucket as themselves; numbers bucket as their integer form;
/// anything else is not bucketable.
fn bucketable_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(format!("{}", *n as i64)),
        _ => None,
    }
}

fn rule_matches_user(
    rule: &Rule,
    user: &User,
    data_store: &dyn DataStore,
) -> Result<bool, StoreError> {
    for clause in &rule.clauses {
        if !clause_matches_user(clause, user, data_store)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn clause_matches_user(
    clause: &Clause,
    user: &User,
    data_store: &dyn DataStore,
) -> Result<bool, StoreError> {
    if clause.op == Operator::SegmentMatch {
        for value in &clause.values {
            if let Some(segment_key) = value.as_str() {
                if let Some(segment) = store::get_segment(data_store, segment_key)? {
                    if segment_matches_user(&segment, user) {
                        return Ok(maybe_negate(clause, true));
                    }
                }
            }
        }
        return Ok(maybe_negate(clause, false));
    }
    Ok(clause_matches_user_no_segments(clause, user))
}

fn clause_matches_user_no_segments(clause: &Clause, user: &User) -> bool {
    let attr_value = match user.attribute_value(&clause.attribute) {
        Some(value) => value,
        // Absent attribute: no match, and negation does not apply.
        None => return false,
    };

    match &attr_value {
        Value::Array(elements) => {
            let matched = elements.iter().any(|element| {
                !matches!(element, Value::Array(_) | Value::Object(_))
                    && clause_value_matches(clause, element)
            });
            maybe_negate(clause, matched)
        }
        Value::Object(_) => false,
        scalar => maybe_negate(clause, clause_value_matches(clause, scalar)),
    }
}

fn clause_value_matches(clause: &Clause, attr_value: &Value) -> bool {
    clause
        .values
        .iter()
        .any(|clause_value| ops::match_values(clause.op, attr_value, clause_value))
}

fn maybe_negate(clause: &Clause, matched: bool) -> bool {
    if clause.negate {
        !matched
    } else {
        matched
    }
}

/// Included beats excluded beats rules.
fn segment_matches_user(segment: &Segment, user: &User) -> bool {
    if segment.included.contains(user.key()) {
        return true;
    }
    if segment.excluded.contains(user.key()) {
        return false;
    }
    segment
        .rules
        .iter()
        .any(|rule| segment_rule_matches_user(rule, &segment.key, user, &segment.salt))
}

fn segment_rule_matches_user(
    rule: &SegmentRule,
    segment_key: &str,
    user: &User,
    salt: &str,
) -> bool {
    for clause in &rule.clauses {
        if !clause_matches_user_no_segments(clause, user) {
            return false;
        }
    }

    match rule.weight {
        None => true,
        Some(weight) => {
            let bucket_by = rule.bucket_by.as_deref().unwrap_or("key");
            let bucket = bucket_user(user, segment_key, bucket_by, salt, None);
            bucket < weight as f64 / 100_000.0
        }
    }
}
