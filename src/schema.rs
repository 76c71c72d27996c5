//! # Flag & Segment Data Model
//!
//! Serde models for the flag and segment documents delivered by the service,
//! plus the streaming `put`/`patch`/`delete` payloads and the polling
//! document. Field names follow the wire schema (camelCase); almost every
//! field is defaulted so that partially-populated documents from older
//! service versions still deserialize.
//!
//! Unknown clause operators parse to [`Operator::Unknown`], which never
//! matches, so a single unrecognized construct disables one clause instead of
//! poisoning the whole dataset.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// A feature flag definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlag {
    pub key: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub on: bool,
    #[serde(default)]
    pub salt: String,
    #[serde(default)]
    pub track_events: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_events_until_date: Option<u64>,
    #[serde(default)]
    pub client_side: bool,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub off_variation: Option<usize>,
    #[serde(default)]
    pub fallthrough: VariationOrRollout,
    #[serde(default)]
    pub variations: Vec<Value>,
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub prerequisites: Vec<Prerequisite>,
}

impl FeatureFlag {
    /// The variation value at `index`, if the index is in range.
    pub fn variation_value(&self, index: usize) -> Option<&Value> {
        self.variations.get(index)
    }
}

/// A prerequisite: another flag that must be on and serving the given
/// variation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prerequisite {
    pub key: String,
    pub variation: usize,
}

/// Individual user keys pinned to a variation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub variation: usize,
    #[serde(default)]
    pub values: HashSet<String>,
}

/// A targeting rule: all clauses must match, then the variation or rollout
/// applies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub clauses: Vec<Clause>,
    #[serde(flatten)]
    pub variation_or_rollout: VariationOrRollout,
    #[serde(default)]
    pub track_events: bool,
}

/// One condition over a user attribute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Clause {
    pub attribute: String,
    pub op: Operator,
    #[serde(default)]
    pub values: Vec<Value>,
    #[serde(default)]
    pub negate: bool,
}

/// Clause operators. Anything the service sends that this SDK does not know
/// parses as `Unknown` and never matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    In,
    EndsWith,
    StartsWith,
    Matches,
    Contains,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Before,
    After,
    SemVerEqual,
    SemVerLessThan,
    SemVerGreaterThan,
    SegmentMatch,
    #[serde(other)]
    Unknown,
}

/// Either a fixed variation index or a weighted rollout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariationOrRollout {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variation: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout: Option<Rollout>,
}

/// Weighted assignment of users to variations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rollout {
    #[serde(default)]
    pub variations: Vec<WeightedVariation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default)]
    pub kind: RolloutKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RolloutKind {
    #[default]
    Rollout,
    Experiment,
    #[serde(other)]
    Unknown,
}

/// One slice of a rollout. Weights are in units of 1/100000.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightedVariation {
    pub variation: usize,
    #[serde(default)]
    pub weight: i64,
    #[serde(default)]
    pub untracked: bool,
}

/// A reusable user segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub key: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub included: HashSet<String>,
    #[serde(default)]
    pub excluded: HashSet<String>,
    #[serde(default)]
    pub salt: String,
    #[serde(default)]
    pub rules: Vec<SegmentRule>,
    #[serde(default)]
    pub deleted: bool,
}

/// A segment rule: clauses plus an optional weighted membership.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub clauses: Vec<Clause>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_by: Option<String>,
}

/// The full dataset: the polling document and the `put` event body share
/// this shape. Both collections are required; a document missing either is
/// malformed.
#[derive(Debug, Clone, Deserialize)]
pub struct AllData {
    pub flags: HashMap<String, FeatureFlag>,
    pub segments: HashMap<String, Segment>,
}

/// Body of a streaming `put` event.
#[derive(Debug, Clone, Deserialize)]
pub struct PutPayload {
    #[serde(default)]
    pub path: Option<String>,
    pub data: AllData,
}

/// Body of a streaming `patch` event. The item is parsed after the path has
/// told us which kind it is.
#[derive(Debug, Clone, Deserialize)]
pub struct PatchPayload {
    pub path: String,
    pub data: serde_json::Value,
}

/// Body of a streaming `delete` event.
#[derive(Debug, Clone, Deserialize)]
pub struct DeletePayload {
    pub path: String,
    pub version: u64,
}

/// What a patch/delete path points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchTarget {
    Flag(String),
    Segment(String),
    /// A namespace this SDK does not track; the update is skipped without
    /// error.
    Ignored,
}

/// Map a `patch`/`delete` path to its kind and key.
pub fn parse_patch_path(path: &str) -> PatchTarget {
    if let Some(key) = path.strip_prefix("/flags/") {
        PatchTarget::Flag(key.to_owned())
    } else if let Some(key) = path.strip_prefix("/segments/") {
        PatchTarget::Segment(key.to_owned())
    } else {
        PatchTarget::Ignored
    }
}
