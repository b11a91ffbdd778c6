//! Sync document codec
//!
//! Three JSON shapes are accepted on read and resolved here, once, into a
//! [`ProfilesConfig`]:
//!
//! | Shape | Recognized by | Profiles | Active pointer |
//! |---|---|---|---|
//! | Legacy | bare array | the array | none |
//! | Versioned | object with integer `schemaVersion` | `profiles` | optional `activeProfileId` |
//! | Canonical | object with array `list` | `list` | optional `activeProfileId` |
//!
//! Shapes are checked in that order. Writes always produce the canonical shape, except
//! [`encode_bundle`] which produces the versioned envelope for manual exports.
//!
//! Validation is all-or-nothing: one bad profile rejects the whole document. Topic
//! names are case-folded on the way in, and entries that collide after folding are
//! collapsed into one. The topic cap is not known here; the engine applies it.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

use crate::error::SyncError;
use crate::profile::{Profile, ProfilesConfig};
use crate::types::Timestamp;

/// Schema version written by [`encode_bundle`]
pub const CURRENT_SCHEMA_VERSION: i64 = 1;

/// Which shape a document was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentFormat {
    Legacy,
    Versioned { schema_version: i64 },
    Canonical,
}

/// Raw document shape, before validation
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentShape {
    Legacy(Vec<Value>),
    Versioned {
        schema_version: i64,
        profiles: Vec<Value>,
        active: Option<Value>,
    },
    Canonical {
        list: Vec<Value>,
        active: Option<Value>,
    },
}

impl DocumentShape {
    pub fn format(&self) -> DocumentFormat {
        match self {
            Self::Legacy(_) => DocumentFormat::Legacy,
            Self::Versioned { schema_version, .. } => DocumentFormat::Versioned {
                schema_version: *schema_version,
            },
            Self::Canonical { .. } => DocumentFormat::Canonical,
        }
    }

    fn into_parts(self) -> (Vec<Value>, Option<Value>) {
        match self {
            Self::Legacy(profiles) => (profiles, None),
            Self::Versioned {
                profiles, active, ..
            } => (profiles, active),
            Self::Canonical { list, active } => (list, active),
        }
    }
}

/// A validated document
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedDocument {
    pub format: DocumentFormat,
    pub config: ProfilesConfig,
}

/// Versioned envelope written by manual exports
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportBundle {
    pub schema_version: i64,
    pub exported_at: Timestamp,
    pub profiles: Vec<Profile>,
    pub active_profile_id: Option<String>,
}

/// Classify a parsed JSON value
pub fn detect(value: Value) -> Result<DocumentShape, SyncError> {
    match value {
        Value::Array(profiles) => Ok(DocumentShape::Legacy(profiles)),
        Value::Object(mut object) => {
            if let Some(schema_version) = object.get("schemaVersion").and_then(Value::as_i64) {
                return match object.remove("profiles") {
                    Some(Value::Array(profiles)) => Ok(DocumentShape::Versioned {
                        schema_version,
                        profiles,
                        active: object.remove("activeProfileId"),
                    }),
                    _ => Err(SyncError::Format(format!(
                        "versioned document (schemaVersion {}) has no `profiles` array",
                        schema_version
                    ))),
                };
            }
            if let Some(Value::Array(_)) = object.get("list") {
                let list = match object.remove("list") {
                    Some(Value::Array(list)) => list,
                    _ => Vec::new(),
                };
                return Ok(DocumentShape::Canonical {
                    list,
                    active: object.remove("activeProfileId"),
                });
            }
            Err(SyncError::Format(
                "object has neither an integer `schemaVersion` nor a `list` array".to_string(),
            ))
        }
        other => Err(SyncError::Format(format!(
            "expected an array or object, found {}",
            json_type(&other)
        ))),
    }
}

/// Parse, detect and validate a document
pub fn decode(bytes: &[u8]) -> Result<DecodedDocument, SyncError> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| SyncError::Format(format!("not valid JSON: {}", e)))?;
    let shape = detect(value)?;
    let format = shape.format();
    let (raw_profiles, raw_active) = shape.into_parts();

    let mut list = Vec::with_capacity(raw_profiles.len());
    let mut seen = HashSet::with_capacity(raw_profiles.len());
    for (index, raw) in raw_profiles.into_iter().enumerate() {
        let profile = validate_profile(index, raw)?;
        if !seen.insert(profile.id.clone()) {
            return Err(SyncError::invalid_profile(
                index,
                "id",
                format!("duplicate id `{}`", profile.id),
            ));
        }
        list.push(profile);
    }

    let active_profile_id = match raw_active {
        None | Some(Value::Null) => None,
        Some(Value::String(id)) if id.is_empty() => None,
        Some(Value::String(id)) => {
            if !seen.contains(&id) {
                return Err(SyncError::invalid_document(
                    "activeProfileId",
                    format!("`{}` does not match any profile", id),
                ));
            }
            Some(id)
        }
        Some(other) => {
            return Err(SyncError::invalid_document(
                "activeProfileId",
                format!("must be a string or null, found {}", json_type(&other)),
            ))
        }
    };

    Ok(DecodedDocument {
        format,
        config: ProfilesConfig::new(list, active_profile_id),
    })
}

/// Canonical `{ list, activeProfileId }` bytes
pub fn encode(config: &ProfilesConfig) -> Result<Vec<u8>, SyncError> {
    serde_json::to_vec_pretty(config).map_err(SyncError::Encode)
}

/// Versioned envelope bytes for manual exports
pub fn encode_bundle(config: &ProfilesConfig, exported_at: Timestamp) -> Result<Vec<u8>, SyncError> {
    let bundle = ExportBundle {
        schema_version: CURRENT_SCHEMA_VERSION,
        exported_at,
        profiles: config.list.clone(),
        active_profile_id: config.active_profile_id.clone(),
    };
    serde_json::to_vec_pretty(&bundle).map_err(SyncError::Encode)
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn require_object<'a>(
    index: usize,
    field: &str,
    value: Option<&'a Value>,
) -> Result<&'a Map<String, Value>, SyncError> {
    match value {
        Some(Value::Object(map)) => Ok(map),
        Some(other) => Err(SyncError::invalid_profile(
            index,
            field,
            format!("must be an object, found {}", json_type(other)),
        )),
        None => Err(SyncError::invalid_profile(index, field, "missing")),
    }
}

fn require_text(
    index: usize,
    field: &str,
    value: Option<&Value>,
    non_empty: bool,
) -> Result<(), SyncError> {
    match value {
        Some(Value::String(s)) if non_empty && s.trim().is_empty() => {
            Err(SyncError::invalid_profile(index, field, "must not be empty"))
        }
        Some(Value::String(_)) => Ok(()),
        Some(other) => Err(SyncError::invalid_profile(
            index,
            field,
            format!("must be a string, found {}", json_type(other)),
        )),
        None => Err(SyncError::invalid_profile(index, field, "missing")),
    }
}

fn require_timestamp(index: usize, field: &str, value: Option<&Value>) -> Result<(), SyncError> {
    require_text(index, field, value, false)?;
    let text = value.and_then(Value::as_str).unwrap_or_default();
    DateTime::parse_from_rfc3339(text)
        .map(|_| ())
        .map_err(|e| SyncError::invalid_profile(index, field, format!("not an RFC 3339 timestamp: {}", e)))
}

fn require_count(index: usize, field: &str, value: Option<&Value>) -> Result<(), SyncError> {
    match value {
        Some(Value::Number(n)) if n.is_u64() => Ok(()),
        Some(Value::Number(_)) => Err(SyncError::invalid_profile(
            index,
            field,
            "must be a non-negative integer",
        )),
        Some(other) => Err(SyncError::invalid_profile(
            index,
            field,
            format!("must be a number, found {}", json_type(other)),
        )),
        None => Err(SyncError::invalid_profile(index, field, "missing")),
    }
}

fn require_array<'a>(
    index: usize,
    field: &str,
    value: Option<&'a Value>,
) -> Result<&'a Vec<Value>, SyncError> {
    match value {
        Some(Value::Array(items)) => Ok(items),
        Some(other) => Err(SyncError::invalid_profile(
            index,
            field,
            format!("must be an array, found {}", json_type(other)),
        )),
        None => Err(SyncError::invalid_profile(index, field, "missing")),
    }
}

/// Field-level checks for one candidate profile, then typed conversion
fn validate_profile(index: usize, raw: Value) -> Result<Profile, SyncError> {
    let profile = match &raw {
        Value::Object(map) => map,
        other => {
            return Err(SyncError::invalid_profile(
                index,
                "profile",
                format!("must be an object, found {}", json_type(other)),
            ))
        }
    };

    for field in ["id", "name", "persona", "tone"] {
        require_text(index, field, profile.get(field), true)?;
    }

    let guidelines = require_array(index, "styleGuidelines", profile.get("styleGuidelines"))?;
    for (i, guideline) in guidelines.iter().enumerate() {
        require_text(index, &format!("styleGuidelines[{}]", i), Some(guideline), false)?;
    }

    let evolving = require_object(index, "evolvingProfile", profile.get("evolvingProfile"))?;
    let topics = require_array(index, "evolvingProfile.topics", evolving.get("topics"))?;
    for (i, topic) in topics.iter().enumerate() {
        let prefix = format!("evolvingProfile.topics[{}]", i);
        let topic = require_object(index, &prefix, Some(topic))?;
        require_text(index, &format!("{}.name", prefix), topic.get("name"), true)?;
        require_count(index, &format!("{}.count", prefix), topic.get("count"))?;
        require_timestamp(index, &format!("{}.lastUsed", prefix), topic.get("lastUsed"))?;
    }
    require_count(index, "evolvingProfile.usageCount", evolving.get("usageCount"))?;
    require_timestamp(index, "evolvingProfile.lastUpdated", evolving.get("lastUpdated"))?;
    require_text(index, "evolvingProfile.lastPrompt", evolving.get("lastPrompt"), false)?;

    let mut profile: Profile = serde_json::from_value(raw)
        .map_err(|e| SyncError::invalid_profile(index, "profile", e.to_string()))?;
    profile.evolving_profile.fold_topics();
    Ok(profile)
}
