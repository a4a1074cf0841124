//! Sync Fragment (§4.C): the wire-shaped delta for one object, either an
//! `Add` (full properties) or a `Change` (mutated subset only).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use uuid::Uuid;

use crate::error::SyncError;
use crate::registry::{TypeDescriptor, TypeRegistry, ValueKind};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FragmentType {
    Add,
    Change,
}

/// A property map as it appears on the wire: scalars, arrays, and nulls
/// only (§4.C).
pub type PropertyMap = BTreeMap<String, Json>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncFragment {
    #[serde(rename = "type")]
    pub fragment_type: FragmentType,
    pub uuid: Uuid,
    #[serde(rename = "clsName")]
    pub cls_name: String,
    /// Present for `Add` (full snapshot) and `Change` (mutated subset).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<PropertyMap>,
    /// Pre-mutation value of every key touched so far, seeded on first
    /// touch only (§4.C `update_value_from_model`). Never sent on the wire
    /// (§6 wire encoding is `{type, uuid, clsName, properties}` only) —
    /// it is local bookkeeping `touches` is built from.
    #[serde(skip)]
    pub original_properties: PropertyMap,
}

impl SyncFragment {
    /// Construct an `Add` fragment by snapshotting every declared property
    /// of `values` (§4.C: "snapshots every property").
    pub fn new_add(uuid: Uuid, cls_name: impl Into<String>, values: &BTreeMap<String, Value>) -> Self {
        let properties = values
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        Self {
            fragment_type: FragmentType::Add,
            uuid,
            cls_name: cls_name.into(),
            properties: Some(properties),
            original_properties: BTreeMap::new(),
        }
    }

    /// Construct an empty `Change` fragment, to be filled in by repeated
    /// calls to [`SyncFragment::update_value_from_model`] as the scope
    /// coalesces successive mutations (§4.D).
    pub fn new_change(uuid: Uuid, cls_name: impl Into<String>) -> Self {
        Self {
            fragment_type: FragmentType::Change,
            uuid,
            cls_name: cls_name.into(),
            properties: Some(PropertyMap::new()),
            original_properties: BTreeMap::new(),
        }
    }

    /// Construct a raw `Change` fragment directly from wire data (no
    /// `original_properties` — used when applying a remote fragment, which
    /// never needs to revert itself).
    pub fn from_raw(uuid: Uuid, cls_name: impl Into<String>, properties: PropertyMap) -> Self {
        Self {
            fragment_type: FragmentType::Change,
            uuid,
            cls_name: cls_name.into(),
            properties: Some(properties),
            original_properties: BTreeMap::new(),
        }
    }

    pub fn is_add(&self) -> bool {
        self.fragment_type == FragmentType::Add
    }

    /// Record a coalesced mutation (§4.C). The *first* change to `key`
    /// within this fragment's lifetime records `prev`; subsequent changes
    /// only overwrite the current value.
    pub fn update_value_from_model(&mut self, key: &str, new: &Value, prev: &Value) {
        self.original_properties
            .entry(key.to_string())
            .or_insert_with(|| prev.to_json());
        self.properties
            .get_or_insert_with(PropertyMap::new)
            .insert(key.to_string(), new.to_json());
    }

    /// Prior value for `key`, coercing "never recorded" to `null` (§4.C).
    pub fn original_value(&self, key: &str) -> Json {
        self.original_properties
            .get(key)
            .cloned()
            .unwrap_or(Json::Null)
    }

    pub fn keys(&self) -> Vec<String> {
        self.properties
            .as_ref()
            .map(|p| p.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.as_ref().map(|p| p.is_empty()).unwrap_or(true)
    }

    /// Validate and normalize this fragment's properties against `type_desc`
    /// (§4.C `verify_properties_for_type`). `known_uuids` is the set of
    /// object UUIDs visible within the current apply batch (for forward
    /// references to concurrently-added objects) or scope; reference
    /// properties whose target is absent from both are reported via
    /// [`SyncError::RefNotFound`].
    pub fn verify_properties_for_type(
        &mut self,
        registry: &TypeRegistry,
        type_desc: &TypeDescriptor,
        known_uuids: Option<&std::collections::HashSet<Uuid>>,
    ) -> Result<(), SyncError> {
        let Some(properties) = self.properties.as_mut() else {
            return Ok(());
        };
        let mut missing_refs = Vec::new();
        for (key, raw) in properties.iter_mut() {
            let prop = type_desc
                .property(key)
                .ok_or_else(|| SyncError::UnknownProperty(key.clone()))?;

            if prop.is_collection && prop.value_kind.is_reference() {
                let mut uuids = Value::coerce_ref_list(key, raw)?;
                for u in &mut uuids {
                    check_ref_known(registry, *u, known_uuids, &mut missing_refs);
                }
                *raw = Json::Array(uuids.iter().map(|u| Json::String(u.to_string())).collect());
                continue;
            }

            if prop.is_collection {
                if !raw.is_array() {
                    return Err(SyncError::ValueInvalid {
                        property: key.clone(),
                        reason: "collection property must be an array".to_string(),
                    });
                }
                continue;
            }

            let value = Value::coerce(key, &prop.value_kind, raw)?;
            if let Value::Ref(u) = value {
                check_ref_known(registry, u, known_uuids, &mut missing_refs);
                *raw = Json::String(u.to_string());
            }
        }
        if !missing_refs.is_empty() {
            return Err(SyncError::RefNotFound(missing_refs));
        }
        Ok(())
    }

    pub fn verify_add_defaults(&mut self, type_desc: &TypeDescriptor) {
        let properties = self.properties.get_or_insert_with(PropertyMap::new);
        for prop in type_desc.properties() {
            properties
                .entry(prop.name.clone())
                .or_insert_with(|| prop.default.clone());
        }
    }
}

fn check_ref_known(
    _registry: &TypeRegistry,
    uuid: Uuid,
    known_uuids: Option<&std::collections::HashSet<Uuid>>,
    missing: &mut Vec<Uuid>,
) {
    if let Some(known) = known_uuids {
        if !known.contains(&uuid) {
            missing.push(uuid);
        }
    }
}
