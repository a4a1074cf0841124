//! Type & Property Registry (§4.A). Declares model types, their properties,
//! enumerations, inheritance, and subtype lookup.

use std::collections::{HashMap, HashSet};

use crate::error::SyncError;
use crate::value::EnumDescriptor;

/// The admissible shape of a property's value (§3).
#[derive(Debug, Clone)]
pub enum ValueKind {
    Bool,
    Int64,
    Float64,
    String,
    Timestamp,
    Enum(EnumDescriptor),
    /// Target type name a reference property admits (itself or a subtype).
    Ref(String),
}

impl ValueKind {
    pub fn is_reference(&self) -> bool {
        matches!(self, ValueKind::Ref(_))
    }
}

#[derive(Debug, Clone)]
pub struct PropertyDescriptor {
    pub name: String,
    pub value_kind: ValueKind,
    pub is_collection: bool,
    pub default: serde_json::Value,
    /// Declaration order, stable across inheritance merges (§3).
    pub order: usize,
}

#[derive(Debug, Clone)]
pub struct ProcedureDescriptor {
    pub name: String,
    pub argument_kinds: Vec<ValueKindName>,
}

/// Lightweight descriptor name for a procedure argument — procedures never
/// execute inside the core (§4.A SUPPLEMENT), so arguments are described by
/// kind name only, not by a full `ValueKind` (which would require resolving
/// enum/ref targets that may not exist yet at procedure-declaration time).
pub type ValueKindName = String;

#[derive(Debug, Clone)]
pub struct TypeDescriptor {
    pub name: String,
    pub supertype: Option<String>,
    /// Properties by name, in stable declaration order (supertype
    /// properties first, per inheritance merge rule, §4.A).
    properties: HashMap<String, PropertyDescriptor>,
    property_order: Vec<String>,
    procedures: HashMap<String, ProcedureDescriptor>,
    /// Direct and transitively-inherited subtypes (children DAG).
    subtypes: Vec<String>,
}

impl TypeDescriptor {
    fn new(name: impl Into<String>, supertype: Option<String>) -> Self {
        Self {
            name: name.into(),
            supertype,
            properties: HashMap::new(),
            property_order: Vec::new(),
            procedures: HashMap::new(),
            subtypes: Vec::new(),
        }
    }

    pub fn properties(&self) -> impl Iterator<Item = &PropertyDescriptor> {
        self.property_order.iter().map(move |n| &self.properties[n])
    }

    pub fn property(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.properties.get(name)
    }

    pub fn procedure(&self, name: &str) -> Option<&ProcedureDescriptor> {
        self.procedures.get(name)
    }

    pub fn subtypes(&self) -> &[String] {
        &self.subtypes
    }
}

/// Declares model types and resolves subtype relationships. One registry
/// per process; shared (read-mostly) across every [`crate::scope::Scope`].
#[derive(Debug, Default)]
pub struct TypeRegistry {
    types: HashMap<String, TypeDescriptor>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a root type (no supertype). Fails with [`SyncError::DuplicateType`]
    /// if the name is already registered.
    pub fn declare_type(&mut self, name: &str) -> Result<(), SyncError> {
        self.declare_type_with_supertype(name, None)
    }

    /// Register a type that inherits from `supertype`. Inheritance copies
    /// all of the supertype's current property descriptors into the
    /// subtype and registers the subtype as a child so that properties
    /// declared on the supertype *afterwards* propagate too (§4.A).
    pub fn declare_subtype(&mut self, name: &str, supertype: &str) -> Result<(), SyncError> {
        if !self.types.contains_key(supertype) {
            return Err(SyncError::UnknownType(supertype.to_string()));
        }
        self.declare_type_with_supertype(name, Some(supertype.to_string()))
    }

    fn declare_type_with_supertype(
        &mut self,
        name: &str,
        supertype: Option<String>,
    ) -> Result<(), SyncError> {
        if self.types.contains_key(name) {
            return Err(SyncError::DuplicateType(name.to_string()));
        }
        let mut descriptor = TypeDescriptor::new(name, supertype.clone());
        if let Some(super_name) = &supertype {
            let parent = &self.types[super_name];
            for prop in parent.properties() {
                descriptor.property_order.push(prop.name.clone());
                descriptor.properties.insert(prop.name.clone(), prop.clone());
            }
            for (pname, proc) in &parent.procedures {
                descriptor.procedures.insert(pname.clone(), proc.clone());
            }
        }
        self.types.insert(name.to_string(), descriptor);
        if let Some(super_name) = supertype {
            self.register_subtype_everywhere(&super_name, name);
        }
        Ok(())
    }

    /// Push `child` onto `ancestor`'s subtype list and every type that
    /// transitively has `ancestor` as a subtype — later additions on any
    /// ancestor in the chain are visible from the root (§4.A: "pushes the
    /// subtype onto the supertype's children list").
    fn register_subtype_everywhere(&mut self, ancestor: &str, child: &str) {
        let mut frontier = vec![ancestor.to_string()];
        let mut visited = HashSet::new();
        while let Some(current) = frontier.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            if let Some(t) = self.types.get_mut(&current) {
                t.subtypes.push(child.to_string());
                if let Some(super_name) = t.supertype.clone() {
                    frontier.push(super_name);
                }
            }
        }
    }

    pub fn declare_property(
        &mut self,
        type_name: &str,
        descriptor_builder: impl FnOnce(usize) -> PropertyDescriptor,
    ) -> Result<(), SyncError> {
        let type_desc = self
            .types
            .get_mut(type_name)
            .ok_or_else(|| SyncError::UnknownType(type_name.to_string()))?;
        let order = type_desc.property_order.len();
        let descriptor = descriptor_builder(order);
        if type_desc.properties.contains_key(&descriptor.name) {
            return Err(SyncError::DuplicateProperty {
                type_name: type_name.to_string(),
                property: descriptor.name,
            });
        }
        let new_prop = descriptor.clone();
        type_desc.property_order.push(descriptor.name.clone());
        type_desc.properties.insert(descriptor.name.clone(), descriptor);
        let subtypes = type_desc.subtypes.clone();

        // Propagate the new property to every subtype already registered,
        // matching the "later-added supertype properties propagate" rule.
        for sub in subtypes {
            if let Some(sub_desc) = self.types.get_mut(&sub) {
                if !sub_desc.properties.contains_key(&new_prop.name) {
                    sub_desc.property_order.push(new_prop.name.clone());
                    sub_desc.properties.insert(new_prop.name.clone(), new_prop.clone());
                }
            }
        }
        Ok(())
    }

    pub fn declare_procedure(
        &mut self,
        type_name: &str,
        procedure: ProcedureDescriptor,
    ) -> Result<(), SyncError> {
        let type_desc = self
            .types
            .get_mut(type_name)
            .ok_or_else(|| SyncError::UnknownType(type_name.to_string()))?;
        type_desc.procedures.insert(procedure.name.clone(), procedure);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&TypeDescriptor> {
        self.types.get(name)
    }

    pub fn require(&self, name: &str) -> Result<&TypeDescriptor, SyncError> {
        self.get(name)
            .ok_or_else(|| SyncError::UnknownType(name.to_string()))
    }

    /// Walk `root`'s children DAG and return the first type named `name`,
    /// or `root` itself if it matches (§4.A).
    pub fn get_subtype_with_name(&self, root: &str, name: &str) -> Option<&TypeDescriptor> {
        if root == name {
            return self.types.get(root);
        }
        let root_desc = self.types.get(root)?;
        if root_desc.subtypes.iter().any(|s| s == name) {
            return self.types.get(name);
        }
        None
    }

    /// `candidate` is `target` itself or reachable in `target`'s subtype
    /// DAG — used to validate reference assignment (§4.A: TypeMismatch).
    pub fn is_instance_of(&self, candidate: &str, target: &str) -> bool {
        if candidate == target {
            return true;
        }
        self.types
            .get(target)
            .map(|t| t.subtypes.iter().any(|s| s == candidate))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::EnumDescriptor;

    fn prop(name: &str, kind: ValueKind, order: usize) -> PropertyDescriptor {
        PropertyDescriptor {
            name: name.to_string(),
            value_kind: kind,
            is_collection: false,
            default: serde_json::Value::Null,
            order,
        }
    }

    #[test]
    fn duplicate_type_rejected() {
        let mut reg = TypeRegistry::new();
        reg.declare_type("Model").unwrap();
        let err = reg.declare_type("Model").unwrap_err();
        assert!(matches!(err, SyncError::DuplicateType(_)));
    }

    #[test]
    fn inheritance_copies_then_propagates_properties() {
        let mut reg = TypeRegistry::new();
        reg.declare_type("Base").unwrap();
        reg.declare_property("Base", |o| prop("name", ValueKind::String, o))
            .unwrap();
        reg.declare_subtype("Child", "Base").unwrap();

        assert!(reg.get("Child").unwrap().property("name").is_some());

        // A property added to Base *after* Child was declared must still
        // propagate to Child.
        reg.declare_property("Base", |o| prop("age", ValueKind::Int64, o))
            .unwrap();
        assert!(reg.get("Child").unwrap().property("age").is_some());
    }

    #[test]
    fn duplicate_property_rejected() {
        let mut reg = TypeRegistry::new();
        reg.declare_type("Model").unwrap();
        reg.declare_property("Model", |o| prop("name", ValueKind::String, o))
            .unwrap();
        let err = reg
            .declare_property("Model", |o| prop("name", ValueKind::Int64, o))
            .unwrap_err();
        assert!(matches!(err, SyncError::DuplicateProperty { .. }));
    }

    #[test]
    fn subtype_lookup_walks_dag() {
        let mut reg = TypeRegistry::new();
        reg.declare_type("Base").unwrap();
        reg.declare_subtype("Mid", "Base").unwrap();
        reg.declare_subtype("Leaf", "Mid").unwrap();

        assert!(reg.get_subtype_with_name("Base", "Leaf").is_some());
        assert!(reg.is_instance_of("Leaf", "Base"));
        assert!(reg.is_instance_of("Base", "Base"));
        assert!(!reg.is_instance_of("Base", "Leaf"));
    }

    #[test]
    fn enum_membership() {
        let e = EnumDescriptor::string_valued(
            "Color",
            ["red".to_string(), "blue".to_string()],
        );
        assert!(e.contains("red"));
        assert!(!e.contains("green"));
    }
}
