//! Object & Collection (§4.B). Arena-style ownership per §9 Design Notes:
//! the scope owns every [`ObjectData`] by UUID; "references" are UUIDs, not
//! Rust references, so the object graph may be cyclic without `Rc`/`RefCell`
//! cycles. Mutation is exposed through [`crate::scope::Scope`], which is
//! the only place that can see both sides of a reference assignment.

use std::collections::{BTreeMap, BTreeSet};

use uuid::Uuid;

use crate::events::{CollectionChanged, KeyChanged};
use crate::value::Value;

pub type ChangeListener = Box<dyn FnMut(&KeyChanged) + Send>;
pub type CollectionListener = Box<dyn FnMut(&CollectionChanged) + Send>;

/// Per-object, per-key typed callback slots (§9: "typed callback slot",
/// not a string-keyed event registry).
#[derive(Default)]
pub struct ListenerRegistry {
    change: BTreeMap<String, Vec<ChangeListener>>,
    add: BTreeMap<String, Vec<CollectionListener>>,
    remove: BTreeMap<String, Vec<CollectionListener>>,
}

impl ListenerRegistry {
    pub fn on_change(&mut self, key: &str, listener: ChangeListener) {
        self.change.entry(key.to_string()).or_default().push(listener);
    }

    pub fn on_add(&mut self, key: &str, listener: CollectionListener) {
        self.add.entry(key.to_string()).or_default().push(listener);
    }

    pub fn on_remove(&mut self, key: &str, listener: CollectionListener) {
        self.remove.entry(key.to_string()).or_default().push(listener);
    }

    pub fn fire_change(&mut self, event: &KeyChanged) {
        if let Some(listeners) = self.change.get_mut(&event.key) {
            for listener in listeners {
                listener(event);
            }
        }
    }

    pub fn fire_add(&mut self, event: &CollectionChanged) {
        if let Some(listeners) = self.add.get_mut(&event.key) {
            for listener in listeners {
                listener(event);
            }
        }
    }

    pub fn fire_remove(&mut self, event: &CollectionChanged) {
        if let Some(listeners) = self.remove.get_mut(&event.key) {
            for listener in listeners {
                listener(event);
            }
        }
    }
}

/// The per-instance state described in §3. Lives inside
/// [`crate::scope::ScopeInner::models`]; never referenced by `Rc`.
pub struct ObjectData {
    pub uuid: Uuid,
    pub type_name: String,
    pub scope: Option<Uuid>,
    pub is_scope_root: bool,
    /// `(parent_uuid, key)` pairs — §3 invariant: exactly one entry per
    /// live reference pointing at this object.
    pub parents: BTreeSet<(Uuid, String)>,
    scalars: BTreeMap<String, Value>,
    /// Reference and scalar collection properties, each an ordered
    /// sequence of [`Value`] (§3: "collection properties hold homogeneous
    /// sequences").
    collections: BTreeMap<String, Vec<Value>>,
    pub listeners: ListenerRegistry,
}

impl ObjectData {
    pub fn new(uuid: Uuid, type_name: impl Into<String>) -> Self {
        Self {
            uuid,
            type_name: type_name.into(),
            scope: None,
            is_scope_root: false,
            parents: BTreeSet::new(),
            scalars: BTreeMap::new(),
            collections: BTreeMap::new(),
            listeners: ListenerRegistry::default(),
        }
    }

    pub fn get_scalar(&self, key: &str) -> Value {
        self.scalars.get(key).cloned().unwrap_or(Value::Null)
    }

    pub fn set_scalar_raw(&mut self, key: &str, value: Value) {
        self.scalars.insert(key.to_string(), value);
    }

    pub fn get_collection(&self, key: &str) -> &[Value] {
        self.collections.get(key).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn collection_mut(&mut self, key: &str) -> &mut Vec<Value> {
        self.collections.entry(key.to_string()).or_default()
    }

    /// An object is only orphan-swept once it has actually joined the
    /// scope's object graph (`scope.is_some()`) and then lost its last
    /// parent. A freshly `create_object`-ed object that was never attached
    /// to anything (`scope == None`) is not orphaned — it simply hasn't
    /// been reached yet.
    pub fn is_orphaned(&self) -> bool {
        self.scope.is_some() && self.parents.is_empty() && !self.is_scope_root
    }

    pub fn snapshot_scalars(&self) -> &BTreeMap<String, Value> {
        &self.scalars
    }

    pub fn snapshot_collections(&self) -> &BTreeMap<String, Vec<Value>> {
        &self.collections
    }
}

/// Computes the add/remove pair for [`crate::scope::Scope::reset_collection`]
/// (§4.B `Collection::reset`): exactly one event per distinct element that
/// differs between `prior` and `next`. An element present in both (by
/// value/by-UUID-for-refs) is treated as unchanged — neither added nor
/// removed — which is the intentional clarification of the ambiguous
/// "added and removed in the same reset" corner noted in §9.
pub fn diff_collection(prior: &[Value], next: &[Value]) -> (Vec<Value>, Vec<Value>) {
    let prior_keys: BTreeSet<CollectionKey> = prior.iter().map(CollectionKey::of).collect();
    let next_keys: BTreeSet<CollectionKey> = next.iter().map(CollectionKey::of).collect();

    let added = next
        .iter()
        .filter(|v| !prior_keys.contains(&CollectionKey::of(v)))
        .cloned()
        .collect();
    let removed = prior
        .iter()
        .filter(|v| !next_keys.contains(&CollectionKey::of(v)))
        .cloned()
        .collect();
    (added, removed)
}

/// Value equality key usable in an ordered set — `Value` itself carries an
/// `f64` variant, so we key on the serialized form for comparison.
#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct CollectionKey(String);

impl CollectionKey {
    fn of(v: &Value) -> Self {
        Self(v.to_json().to_string())
    }
}
