//! Recall filter parsing and predicate evaluation.
//!
//! The recognised filter keys are a closed set: `tags`, `source`,
//! `session_id`, `text_like`, `min_importance`, `since`, `before`. Any
//! other key is a validation error. Time bounds accept ISO-8601
//! (`2026-01-01T00:00:00Z`, `2026-01-01`) or relative specs (`"30m"`,
//! `"24h"`, `"7d"`, `"2w"`). Filters are applied to hydrated rows after
//! vector search so scoring stays dense-vector-driven.

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;

use super::types::{Memory, RecallOptions};
use crate::error::{Error, Result};

const ALLOWED_KEYS: &[&str] = &[
    "tags",
    "source",
    "session_id",
    "text_like",
    "min_importance",
    "since",
    "before",
];

/// The composed predicate `P(row)` for one recall.
#[derive(Debug, Default, Clone)]
pub struct CompiledFilters {
    pub collection: Option<String>,
    /// Match-any tag set.
    pub tags: Vec<String>,
    pub source: Option<String>,
    pub session_id: Option<String>,
    /// Lowercased needle for case-insensitive substring match.
    text_like: Option<String>,
    pub min_importance: Option<f64>,
    pub since_ts: Option<i64>,
    pub before_ts: Option<i64>,
}

impl CompiledFilters {
    /// Parse and validate the filters of a recall call.
    pub fn compile(opts: &RecallOptions) -> Result<Self> {
        let now = Utc::now().timestamp();
        let mut compiled = CompiledFilters {
            collection: opts.collection.clone(),
            min_importance: opts.min_importance,
            ..Default::default()
        };

        if let Some(ref spec) = opts.since {
            compiled.since_ts = Some(parse_time_bound(spec, now)?);
        }
        if let Some(ref spec) = opts.before {
            compiled.before_ts = Some(parse_time_bound(spec, now)?);
        }

        let Some(ref map) = opts.filters else {
            return Ok(compiled);
        };

        for (key, value) in map {
            match key.as_str() {
                "tags" => compiled.tags = parse_tags(value)?,
                "source" => compiled.source = Some(parse_str(key, value)?),
                "session_id" => compiled.session_id = Some(parse_str(key, value)?),
                "text_like" => compiled.text_like = Some(parse_str(key, value)?.to_lowercase()),
                "min_importance" => {
                    let v = value.as_f64().ok_or_else(|| {
                        Error::Validation("filter min_importance must be a number".to_string())
                    })?;
                    // Top-level option wins over the filters map
                    if compiled.min_importance.is_none() {
                        compiled.min_importance = Some(v);
                    }
                }
                "since" => {
                    if compiled.since_ts.is_none() {
                        compiled.since_ts = Some(parse_time_bound(&parse_str(key, value)?, now)?);
                    }
                }
                "before" => {
                    if compiled.before_ts.is_none() {
                        compiled.before_ts = Some(parse_time_bound(&parse_str(key, value)?, now)?);
                    }
                }
                other => {
                    return Err(Error::Validation(format!(
                        "unknown filter key: {other} (allowed: {})",
                        ALLOWED_KEYS.join(", ")
                    )));
                }
            }
        }

        Ok(compiled)
    }

    /// True when anything beyond the collection scope constrains results —
    /// the signal for candidate over-fetch in the pipeline.
    pub fn is_restrictive(&self) -> bool {
        !self.tags.is_empty()
            || self.source.is_some()
            || self.session_id.is_some()
            || self.text_like.is_some()
            || self.min_importance.is_some()
            || self.since_ts.is_some()
            || self.before_ts.is_some()
    }

    /// Evaluate the predicate against a hydrated row.
    pub fn matches(&self, memory: &Memory) -> bool {
        if let Some(ref collection) = self.collection {
            if &memory.collection != collection {
                return false;
            }
        }
        if let Some(since) = self.since_ts {
            if memory.timestamp < since {
                return false;
            }
        }
        if let Some(before) = self.before_ts {
            if memory.timestamp > before {
                return false;
            }
        }
        if let Some(min) = self.min_importance {
            if memory.importance < min {
                return false;
            }
        }
        if let Some(ref source) = self.source {
            if &memory.source != source {
                return false;
            }
        }
        if let Some(ref session) = self.session_id {
            if &memory.session_id != session {
                return false;
            }
        }
        if !self.tags.is_empty() {
            let any = self.tags.iter().any(|t| memory.tags.iter().any(|m| m == t));
            if !any {
                return false;
            }
        }
        if let Some(ref needle) = self.text_like {
            if !memory.text.to_lowercase().contains(needle.as_str()) {
                return false;
            }
        }
        true
    }
}

fn parse_str(key: &str, value: &Value) -> Result<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| Error::Validation(format!("filter {key} must be a string")))
}

fn parse_tags(value: &Value) -> Result<Vec<String>> {
    match value {
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| Error::Validation("filter tags must be strings".to_string()))
            })
            .collect(),
        _ => Err(Error::Validation(
            "filter tags must be a string or array of strings".to_string(),
        )),
    }
}

/// Parse a time bound into epoch seconds.
///
/// Relative specs (`"30m"`, `"24h"`, `"7d"`, `"2w"`) count back from `now`;
/// absolute specs are RFC 3339 timestamps or plain dates (midnight UTC).
pub fn parse_time_bound(spec: &str, now: i64) -> Result<i64> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Err(Error::Validation("empty time bound".to_string()));
    }

    // Relative: digits followed by a unit suffix
    if let Some(unit) = spec.chars().last() {
        let body = &spec[..spec.len() - unit.len_utf8()];
        if !body.is_empty() && body.chars().all(|c| c.is_ascii_digit()) {
            let value: i64 = body
                .parse()
                .map_err(|_| Error::Validation(format!("invalid time bound: {spec}")))?;
            let seconds = match unit {
                'm' => value * 60,
                'h' => value * 3600,
                'd' => value * 86_400,
                'w' => value * 604_800,
                _ => {
                    return Err(Error::Validation(format!(
                        "invalid time unit in {spec:?} (expected m, h, d, or w)"
                    )))
                }
            };
            return Ok(now - seconds);
        }
    }

    // Absolute: RFC 3339, then plain date
    if let Ok(dt) = DateTime::parse_from_rfc3339(spec) {
        return Ok(dt.timestamp());
    }
    if let Ok(date) = NaiveDate::parse_from_str(spec, "%Y-%m-%d") {
        let midnight = date
            .and_hms_opt(0, 0, 0)
            .expect("midnight is always a valid time");
        return Ok(midnight.and_utc().timestamp());
    }

    Err(Error::Validation(format!(
        "invalid time bound: {spec:?} (expected ISO-8601 or relative like \"7d\")"
    )))
}
