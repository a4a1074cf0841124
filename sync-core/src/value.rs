//! The dynamically-typed property value (§9 Design Notes: "every property
//! value is a JSON-like union").

use std::collections::BTreeSet;

use serde_json::Value as Json;
use uuid::Uuid;

use crate::error::SyncError;
use crate::registry::ValueKind;

/// A single property value. Distinct from the wire's `serde_json::Value` —
/// this is the in-memory, type-checked representation; [`Value::to_json`]
/// and [`Value::from_json`] cross the fragment boundary (§6 AMBIENT).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    String(String),
    /// Milliseconds since epoch.
    Timestamp(i64),
    Enum(String),
    Ref(Uuid),
    RefList(Vec<Uuid>),
}

impl Value {
    pub fn to_json(&self) -> Json {
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int64(n) => Json::Number((*n).into()),
            Value::Float64(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::String(s) => Json::String(s.clone()),
            Value::Timestamp(ms) => Json::Number((*ms).into()),
            Value::Enum(s) => Json::String(s.clone()),
            Value::Ref(u) => Json::String(u.to_string()),
            Value::RefList(us) => Json::Array(
                us.iter()
                    .map(|u| Json::String(u.to_string()))
                    .collect(),
            ),
        }
    }

    /// Validate and coerce a raw JSON value into a typed [`Value`] per the
    /// property's declared `value_kind` (§4.B).
    pub fn coerce(property: &str, kind: &ValueKind, raw: &Json) -> Result<Value, SyncError> {
        if raw.is_null() {
            return Ok(Value::Null);
        }
        match kind {
            ValueKind::Bool => Ok(Value::Bool(truthy(raw))),
            ValueKind::Int64 => Ok(Value::Int64(numeric(property, raw)?.round() as i64)),
            ValueKind::Float64 => Ok(Value::Float64(numeric(property, raw)?)),
            ValueKind::String => Ok(Value::String(stringify(raw))),
            ValueKind::Timestamp => Ok(Value::Timestamp(parse_timestamp(property, raw)?)),
            ValueKind::Enum(e) => {
                let s = match raw {
                    Json::String(s) => s.clone(),
                    Json::Number(n) => n.to_string(),
                    other => stringify(other),
                };
                if !e.contains(&s) {
                    return Err(SyncError::EnumInvalid {
                        enum_name: e.name.clone(),
                        value: s,
                    });
                }
                Ok(Value::Enum(s))
            }
            ValueKind::Ref(_) => {
                let s = raw.as_str().ok_or_else(|| SyncError::ValueInvalid {
                    property: property.to_string(),
                    reason: "reference value must be a UUID string".to_string(),
                })?;
                let uuid = parse_lower_uuid(property, s)?;
                Ok(Value::Ref(uuid))
            }
        }
    }

    /// Coerce a raw JSON array into a list of references (collection-of-
    /// reference property, §3).
    pub fn coerce_ref_list(property: &str, raw: &Json) -> Result<Vec<Uuid>, SyncError> {
        let arr = raw.as_array().ok_or_else(|| SyncError::ValueInvalid {
            property: property.to_string(),
            reason: "collection value must be an array".to_string(),
        })?;
        arr.iter()
            .map(|item| {
                let s = item.as_str().ok_or_else(|| SyncError::ValueInvalid {
                    property: property.to_string(),
                    reason: "reference collection elements must be UUID strings".to_string(),
                })?;
                parse_lower_uuid(property, s)
            })
            .collect()
    }

    pub fn as_ref_uuid(&self) -> Option<Uuid> {
        match self {
            Value::Ref(u) => Some(*u),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

fn parse_lower_uuid(property: &str, s: &str) -> Result<Uuid, SyncError> {
    Uuid::parse_str(s).map_err(|_| SyncError::ValueInvalid {
        property: property.to_string(),
        reason: format!("'{s}' is not a valid UUID"),
    })
}

fn truthy(raw: &Json) -> bool {
    match raw {
        Json::Bool(b) => *b,
        Json::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Json::String(s) => !s.is_empty() && s != "0" && s != "false",
        Json::Array(a) => !a.is_empty(),
        Json::Object(o) => !o.is_empty(),
        Json::Null => false,
    }
}

fn numeric(property: &str, raw: &Json) -> Result<f64, SyncError> {
    let n = match raw {
        Json::Number(n) => n.as_f64().ok_or_else(|| SyncError::ValueInvalid {
            property: property.to_string(),
            reason: "number out of range".to_string(),
        })?,
        Json::String(s) => s.trim().parse::<f64>().map_err(|_| SyncError::ValueInvalid {
            property: property.to_string(),
            reason: format!("'{s}' is not numeric"),
        })?,
        Json::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        other => {
            return Err(SyncError::ValueInvalid {
                property: property.to_string(),
                reason: format!("cannot coerce {other} to a number"),
            })
        }
    };
    if n.is_nan() {
        return Err(SyncError::ValueInvalid {
            property: property.to_string(),
            reason: "NaN is not a valid numeric value".to_string(),
        });
    }
    Ok(n)
}

fn stringify(raw: &Json) -> String {
    match raw {
        Json::String(s) => s.clone(),
        Json::Number(n) => n.to_string(),
        Json::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

fn parse_timestamp(property: &str, raw: &Json) -> Result<i64, SyncError> {
    match raw {
        Json::Number(n) => n.as_i64().ok_or_else(|| SyncError::ValueInvalid {
            property: property.to_string(),
            reason: "timestamp must be an integer number of milliseconds".to_string(),
        }),
        Json::String(s) => chrono::DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp_millis())
            .map_err(|_| SyncError::ValueInvalid {
                property: property.to_string(),
                reason: format!("'{s}' is not a parseable timestamp"),
            }),
        other => Err(SyncError::ValueInvalid {
            property: property.to_string(),
            reason: format!("cannot coerce {other} to a timestamp"),
        }),
    }
}

/// Membership set for a string-valued enum, or the key set of an
/// integer-valued one (§4.A).
#[derive(Debug, Clone)]
pub struct EnumDescriptor {
    pub name: String,
    members: BTreeSet<String>,
}

impl EnumDescriptor {
    pub fn string_valued(name: impl Into<String>, values: impl IntoIterator<Item = String>) -> Self {
        Self {
            name: name.into(),
            members: values.into_iter().collect(),
        }
    }

    pub fn int_valued(name: impl Into<String>, values: impl IntoIterator<Item = (String, i64)>) -> Self {
        Self {
            name: name.into(),
            members: values.into_iter().map(|(k, _)| k).collect(),
        }
    }

    pub fn contains(&self, value: &str) -> bool {
        self.members.contains(value)
    }
}
