//! Scope (§4.D): the root-anchored index of objects in a session. Observes
//! local mutation, coalesces it into fragments, flushes on a timer, and
//! applies remote fragments transactionally.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value as Json;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::events::{
    CollectionChanged, KeyChanged, ScopeChanges, ScopeMembership, ScopeMembershipChanged,
};
use crate::fragment::{FragmentType, SyncFragment};
use crate::object::{diff_collection, ChangeListener, CollectionListener, ObjectData};
use crate::registry::TypeRegistry;
use crate::value::Value;

pub type ChangesListener = Box<dyn FnMut(&ScopeChanges) + Send>;
pub type MembershipListener = Box<dyn FnMut(&ScopeMembershipChanged) + Send>;

struct PendingFragments {
    order: Vec<Uuid>,
    by_uuid: HashMap<Uuid, SyncFragment>,
}

impl PendingFragments {
    fn new() -> Self {
        Self {
            order: Vec::new(),
            by_uuid: HashMap::new(),
        }
    }

    fn get_or_create(&mut self, uuid: Uuid, make: impl FnOnce() -> SyncFragment) -> &mut SyncFragment {
        if !self.by_uuid.contains_key(&uuid) {
            self.order.push(uuid);
            self.by_uuid.insert(uuid, make());
        }
        self.by_uuid.get_mut(&uuid).unwrap()
    }

    fn drop_pending(&mut self, uuid: &Uuid) {
        if self.by_uuid.remove(uuid).is_some() {
            self.order.retain(|u| u != uuid);
        }
    }

    fn drain_in_order(&mut self) -> Vec<SyncFragment> {
        let order = std::mem::take(&mut self.order);
        let mut by_uuid = std::mem::take(&mut self.by_uuid);
        order
            .into_iter()
            .filter_map(|u| by_uuid.remove(&u))
            .collect()
    }

    fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

pub struct ScopeInner {
    pub uuid: Uuid,
    pub name: String,
    pub root_uuid: Option<Uuid>,
    pub root_type: Option<String>,
    models: HashMap<Uuid, ObjectData>,
    /// Objects swept out of `models` as orphans. Not destroyed: §3's
    /// "leave scope when they become orphaned" means leaving *this*
    /// residency, not ceasing to exist. A later reference assignment
    /// resurrects the same UUID here with a fresh Add fragment (§8 S3:
    /// "Add child re-created because it became orphaned and was removed
    /// in between").
    detached: HashMap<Uuid, ObjectData>,
    pending_fragments: PendingFragments,
    removed_models: HashSet<Uuid>,
    syncing_models: HashSet<Uuid>,
    orphans: HashSet<Uuid>,
    applying_remote: bool,
    poisoned: bool,
    pub change_interval_ms: u64,
    change_timer_armed: bool,
    /// Set by [`arm_timer_locked`] the instant it transitions the timer
    /// from unarmed to armed; consumed (and reset) by
    /// [`Scope::spawn_timer_if_newly_armed`] once the caller has dropped
    /// the lock, so the background sleep task is spawned exactly once per
    /// coalescing window rather than once per mutation.
    pending_timer_spawn: bool,
    timer_generation: u64,
    changes_listeners: BTreeMap<u64, ChangesListener>,
    next_changes_listener_id: u64,
    membership_listeners: Vec<MembershipListener>,
}

impl ScopeInner {
    fn new(name: impl Into<String>, change_interval_ms: u64) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: name.into(),
            root_uuid: None,
            root_type: None,
            models: HashMap::new(),
            detached: HashMap::new(),
            pending_fragments: PendingFragments::new(),
            removed_models: HashSet::new(),
            syncing_models: HashSet::new(),
            orphans: HashSet::new(),
            applying_remote: false,
            poisoned: false,
            change_interval_ms,
            change_timer_armed: false,
            pending_timer_spawn: false,
            timer_generation: 0,
            changes_listeners: BTreeMap::new(),
            next_changes_listener_id: 0,
            membership_listeners: Vec::new(),
        }
    }

    fn require_not_poisoned(&self) -> SyncResult<()> {
        if self.poisoned {
            return Err(SyncError::ScopeIntegrityLost(self.uuid));
        }
        Ok(())
    }
}

/// A cheap, cloneable handle onto shared scope state. §5 AMBIENT: plain
/// `std::sync::Mutex` rather than an async one, since no lock is ever held
/// across an `.await` — every public method here is synchronous.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<Mutex<ScopeInner>>,
    registry: Arc<TypeRegistry>,
}

impl Scope {
    pub fn new(registry: Arc<TypeRegistry>, name: impl Into<String>, change_interval_ms: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ScopeInner::new(name, change_interval_ms))),
            registry,
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.inner.lock().unwrap().uuid
    }

    pub fn root_uuid(&self) -> Option<Uuid> {
        self.inner.lock().unwrap().root_uuid
    }

    pub fn name(&self) -> String {
        self.inner.lock().unwrap().name.clone()
    }

    /// Subscribe to flushed change batches; returns an id for
    /// [`Scope::remove_changes_listener`] so a caller whose own lifetime
    /// ends before the scope's (e.g. a closed [`crate::session::Session`])
    /// can unsubscribe instead of leaking a callback that keeps firing.
    pub fn on_changes(&self, listener: ChangesListener) -> u64 {
        let mut guard = self.inner.lock().unwrap();
        let id = guard.next_changes_listener_id;
        guard.next_changes_listener_id += 1;
        guard.changes_listeners.insert(id, listener);
        id
    }

    pub fn remove_changes_listener(&self, id: u64) {
        self.inner.lock().unwrap().changes_listeners.remove(&id);
    }

    pub fn on_membership_changed(&self, listener: MembershipListener) {
        self.inner.lock().unwrap().membership_listeners.push(listener);
    }

    /// Per-key `change` listener (§4.B). "Invalid listener registration
    /// (unknown key, wrong action for kind) logs and is ignored" — an
    /// unknown object/property, or a collection property (which only
    /// supports `add`/`remove`), is a warned no-op rather than an error,
    /// since registration happens from observer code that has no natural
    /// `Result` to propagate to.
    pub fn on_key_changed(&self, uuid: Uuid, key: &str, listener: ChangeListener) {
        let mut guard = self.inner.lock().unwrap();
        if !self.listener_registration_is_valid(&guard, uuid, key, false) {
            return;
        }
        guard.models.get_mut(&uuid).unwrap().listeners.on_change(key, listener);
    }

    /// Per-key `add` listener — collection properties only (§4.B).
    pub fn on_collection_add(&self, uuid: Uuid, key: &str, listener: CollectionListener) {
        let mut guard = self.inner.lock().unwrap();
        if !self.listener_registration_is_valid(&guard, uuid, key, true) {
            return;
        }
        guard.models.get_mut(&uuid).unwrap().listeners.on_add(key, listener);
    }

    /// Per-key `remove` listener — collection properties only (§4.B).
    pub fn on_collection_remove(&self, uuid: Uuid, key: &str, listener: CollectionListener) {
        let mut guard = self.inner.lock().unwrap();
        if !self.listener_registration_is_valid(&guard, uuid, key, true) {
            return;
        }
        guard.models.get_mut(&uuid).unwrap().listeners.on_remove(key, listener);
    }

    /// Shared validation for the three `on_*` listener registration
    /// methods above: the object must be in scope, `key` must be a
    /// declared property, and its `is_collection` flag must match the
    /// requested action kind.
    fn listener_registration_is_valid(&self, guard: &ScopeInner, uuid: Uuid, key: &str, wants_collection: bool) -> bool {
        let Some(type_name) = guard.models.get(&uuid).map(|o| o.type_name.clone()) else {
            tracing::warn!(%uuid, key, "listener registration on object not in scope, ignoring");
            return false;
        };
        let Ok(type_desc) = self.registry.require(&type_name) else {
            tracing::warn!(%uuid, key, %type_name, "listener registration on unknown type, ignoring");
            return false;
        };
        let Some(prop) = type_desc.property(key) else {
            tracing::warn!(%uuid, key, "listener registration on unknown property, ignoring");
            return false;
        };
        if prop.is_collection != wants_collection {
            tracing::warn!(
                %uuid, key, is_collection = prop.is_collection, wants_collection,
                "listener registration action does not match property kind, ignoring"
            );
            return false;
        }
        true
    }

    pub fn contains(&self, uuid: Uuid) -> bool {
        self.inner.lock().unwrap().models.contains_key(&uuid)
    }

    pub fn model_count(&self) -> usize {
        self.inner.lock().unwrap().models.len()
    }

    pub fn orphan_count(&self) -> usize {
        self.inner.lock().unwrap().orphans.len()
    }

    /// Create a fresh, scope-less object of `type_name`; caller attaches it
    /// via [`Scope::set`] or [`Scope::make_root`].
    pub fn create_object(&self, type_name: &str) -> SyncResult<Uuid> {
        self.registry.require(type_name)?;
        let uuid = Uuid::new_v4();
        let mut guard = self.inner.lock().unwrap();
        guard.models.insert(uuid, ObjectData::new(uuid, type_name));
        Ok(uuid)
    }

    /// Make `uuid` the scope's root object (§3: "or when made root").
    pub fn make_root(&self, uuid: Uuid) -> SyncResult<()> {
        let mut guard = self.inner.lock().unwrap();
        guard.require_not_poisoned()?;
        let type_name = {
            let obj = guard
                .models
                .get_mut(&uuid)
                .ok_or_else(|| SyncError::UnknownProperty("object not found in scope".into()))?;
            obj.is_scope_root = true;
            obj.scope = Some(guard.uuid);
            obj.type_name.clone()
        };
        guard.root_uuid = Some(uuid);
        guard.root_type = Some(type_name);
        if !guard.applying_remote {
            stage_add(&mut guard, uuid);
            arm_timer_locked(&mut guard);
        }
        drop(guard);
        self.spawn_timer_if_newly_armed();
        Ok(())
    }

    pub fn get(&self, uuid: Uuid, key: &str) -> SyncResult<Value> {
        let guard = self.inner.lock().unwrap();
        let obj = guard
            .models
            .get(&uuid)
            .ok_or_else(|| SyncError::UnknownProperty(format!("object {uuid} not in scope")))?;
        let type_desc = self.registry.require(&obj.type_name)?;
        let prop = type_desc
            .property(key)
            .ok_or_else(|| SyncError::UnknownProperty(key.to_string()))?;
        if prop.is_collection {
            return Err(SyncError::ValueInvalid {
                property: key.to_string(),
                reason: "use get_collection for collection properties".to_string(),
            });
        }
        Ok(obj.get_scalar(key))
    }

    pub fn get_collection(&self, uuid: Uuid, key: &str) -> SyncResult<Vec<Value>> {
        let guard = self.inner.lock().unwrap();
        let obj = guard
            .models
            .get(&uuid)
            .ok_or_else(|| SyncError::UnknownProperty(format!("object {uuid} not in scope")))?;
        Ok(obj.get_collection(key).to_vec())
    }

    /// §4.B `set`: validate, coerce, update parent sets on reference
    /// change, no-op if unchanged, emit `key_changed`, coalesce into the
    /// scope's pending fragment.
    pub fn set(&self, uuid: Uuid, key: &str, raw: &Json) -> SyncResult<()> {
        let mut guard = self.inner.lock().unwrap();
        let result = self.set_locked(&mut guard, uuid, key, raw);
        drop(guard);
        self.spawn_timer_if_newly_armed();
        result
    }

    /// §4.E `update_value_on_model`: write `key` on `uuid` the way an
    /// incoming remote apply does — under `applying_remote`, so the write
    /// still fires local listeners but does not stage an outgoing fragment
    /// or arm the flush timer. Change-set revert and fragment-reply
    /// application use this instead of [`Scope::set`] so restoring a prior
    /// value, or writing a server-supplied modification, never echoes back
    /// out as a brand-new client change.
    pub(crate) fn update_value_on_model(&self, uuid: Uuid, key: &str, raw: &Json) -> SyncResult<()> {
        let mut guard = self.inner.lock().unwrap();
        guard.require_not_poisoned()?;
        let was_applying_remote = guard.applying_remote;
        guard.applying_remote = true;
        let result = self.set_locked(&mut guard, uuid, key, raw);
        guard.applying_remote = was_applying_remote;
        result
    }

    /// Core of [`Scope::set`], taking an already-locked guard. Pass 2 of
    /// [`Scope::apply_locked`] calls this directly — it already holds the
    /// lock, and `set` re-acquiring it would deadlock on the non-reentrant
    /// mutex.
    fn set_locked(&self, guard: &mut ScopeInner, uuid: Uuid, key: &str, raw: &Json) -> SyncResult<()> {
        guard.require_not_poisoned()?;
        let type_name = guard
            .models
            .get(&uuid)
            .ok_or_else(|| SyncError::UnknownProperty(format!("object {uuid} not in scope")))?
            .type_name
            .clone();
        let type_desc = self.registry.require(&type_name)?.clone();
        let prop = type_desc
            .property(key)
            .ok_or_else(|| SyncError::UnknownProperty(key.to_string()))?
            .clone();

        if prop.is_collection {
            let new_values = if prop.value_kind.is_reference() {
                Value::coerce_ref_list(key, raw)?
                    .into_iter()
                    .map(Value::Ref)
                    .collect::<Vec<_>>()
            } else {
                let arr = raw.as_array().ok_or_else(|| SyncError::ValueInvalid {
                    property: key.to_string(),
                    reason: "collection property must be an array".to_string(),
                })?;
                arr.iter()
                    .map(|item| Value::coerce(key, &prop.value_kind, item))
                    .collect::<Result<Vec<_>, _>>()?
            };
            return self.reset_collection_locked(guard, uuid, key, new_values);
        }

        let new_value = Value::coerce(key, &prop.value_kind, raw)?;
        let prev_value = guard.models[&uuid].get_scalar(key);

        if let Value::Ref(target) = &new_value {
            self.resurrect_if_detached(guard, *target);
            self.registry.require(target_type_name(&prop.value_kind))?;
            if let Some(target_type) = as_ref_target(&prop.value_kind) {
                self.validate_ref_target(guard, key, target_type, *target)?;
            }
        }

        if new_value == prev_value {
            return Ok(());
        }
        if let (Value::Ref(a), Value::Ref(b)) = (&new_value, &prev_value) {
            if a == b {
                return Ok(());
            }
        }

        if let Value::Ref(new_target) = &new_value {
            self.check_cross_scope(guard, uuid, *new_target)?;
        }

        // Update parent bookkeeping: drop old reference's parent entry,
        // add the new one.
        if let Value::Ref(old_target) = &prev_value {
            remove_parent(guard, *old_target, uuid, key);
        }
        if let Value::Ref(new_target) = &new_value {
            add_parent(guard, *new_target, uuid, key);
            self.propagate_scope_into(guard, *new_target);
        }

        guard.models.get_mut(&uuid).unwrap().set_scalar_raw(key, new_value.clone());

        let event = KeyChanged {
            object: uuid,
            key: key.to_string(),
            new: new_value.clone(),
            prev: prev_value.clone(),
        };
        guard
            .models
            .get_mut(&uuid)
            .unwrap()
            .listeners
            .fire_change(&event);

        if !guard.applying_remote {
            stage_change(&mut guard, uuid, &type_name, key, &new_value, &prev_value);
            arm_timer_locked(&mut guard);
        }

        Ok(())
    }

    /// §4.B "Ref(T): must be instance of T or subtype" — checked against
    /// the already-resolved target object's actual type. Shared by the
    /// scalar path (`set_locked`) and both collection-of-reference paths
    /// (`reset_collection_locked`, `collection_splice`) so a `Ref(Child)`
    /// property can't accept a reference to an unrelated type through any
    /// of the three mutators.
    fn validate_ref_target(
        &self,
        guard: &ScopeInner,
        key: &str,
        target_type: &str,
        target: Uuid,
    ) -> SyncResult<()> {
        let target_obj_type = guard
            .models
            .get(&target)
            .map(|o| o.type_name.clone())
            .ok_or_else(|| SyncError::RefNotFound(vec![target]))?;
        if !self.registry.is_instance_of(&target_obj_type, target_type) {
            return Err(SyncError::TypeMismatch {
                property: key.to_string(),
                expected: target_type.to_string(),
                actual: target_obj_type,
            });
        }
        Ok(())
    }

    fn check_cross_scope(&self, guard: &ScopeInner, uuid: Uuid, target: Uuid) -> SyncResult<()> {
        let self_scope = guard.models.get(&uuid).and_then(|o| o.scope);
        let target_scope = guard.models.get(&target).and_then(|o| o.scope);
        if let (Some(a), Some(b)) = (self_scope, target_scope) {
            if a != b {
                return Err(SyncError::CrossScope { a: uuid, b: target });
            }
        }
        Ok(())
    }

    /// Bring a previously-orphaned-and-swept object back into `models` so a
    /// fresh reference to its UUID resolves. Idempotent no-op if `target`
    /// was never detached (§8 S3).
    fn resurrect_if_detached(&self, guard: &mut ScopeInner, target: Uuid) {
        if let Some(obj) = guard.detached.remove(&target) {
            guard.models.insert(target, obj);
        }
    }

    /// If `target` has no scope yet and `self`'s owning scope does, the
    /// reference assignment pulls it in (§3 Lifecycles: "they enter a scope
    /// when a reference to them is set on an in-scope parent").
    fn propagate_scope_into(&self, guard: &mut ScopeInner, target: Uuid) {
        let this_scope = guard.uuid;
        let already_scoped = guard.models.get(&target).and_then(|o| o.scope).is_some();
        if already_scoped {
            return;
        }
        if let Some(obj) = guard.models.get_mut(&target) {
            obj.scope = Some(this_scope);
        } else {
            return;
        }
        let membership = ScopeMembershipChanged {
            object: target,
            membership: ScopeMembership::Attached,
        };
        for l in &mut guard.membership_listeners {
            l(&membership);
        }
        if !guard.applying_remote {
            stage_add(guard, target);
            arm_timer_locked(guard);
        }
    }

    fn reset_collection_locked(
        &self,
        guard: &mut ScopeInner,
        uuid: Uuid,
        key: &str,
        new_values: Vec<Value>,
    ) -> SyncResult<()> {
        let type_name = guard.models[&uuid].type_name.clone();
        let target_type = self
            .registry
            .get(&type_name)
            .and_then(|t| t.property(key).cloned())
            .and_then(|p| as_ref_target(&p.value_kind).map(str::to_string));
        let prior: Vec<Value> = guard.models[&uuid].get_collection(key).to_vec();
        let (added, removed) = diff_collection(&prior, &new_values);

        for v in &added {
            if let Value::Ref(target) = v {
                self.resurrect_if_detached(guard, *target);
            }
        }
        if let Some(target_type) = &target_type {
            for v in &added {
                if let Value::Ref(target) = v {
                    self.validate_ref_target(guard, key, target_type, *target)?;
                }
            }
        }

        for v in &removed {
            if let Value::Ref(target) = v {
                remove_parent(guard, *target, uuid, key);
            }
        }
        for v in &added {
            if let Value::Ref(target) = v {
                add_parent(guard, *target, uuid, key);
                self.propagate_scope_into(guard, *target);
            }
        }

        *guard.models.get_mut(&uuid).unwrap().collection_mut(key) = new_values.clone();

        if !added.is_empty() {
            let ev = CollectionChanged {
                object: uuid,
                key: key.to_string(),
                added: added.clone(),
                removed: Vec::new(),
            };
            guard.models.get_mut(&uuid).unwrap().listeners.fire_add(&ev);
        }
        if !removed.is_empty() {
            let ev = CollectionChanged {
                object: uuid,
                key: key.to_string(),
                added: Vec::new(),
                removed: removed.clone(),
            };
            guard.models.get_mut(&uuid).unwrap().listeners.fire_remove(&ev);
        }

        if !guard.applying_remote && (!added.is_empty() || !removed.is_empty()) {
            let prev_json = Json::Array(prior.iter().map(Value::to_json).collect());
            let new_json = Json::Array(new_values.iter().map(Value::to_json).collect());
            stage_change_raw(guard, uuid, &type_name, key, new_json, prev_json);
            arm_timer_locked(guard);
        }

        Ok(())
    }

    pub fn collection_push(&self, uuid: Uuid, key: &str, raw: &Json) -> SyncResult<()> {
        self.collection_splice(uuid, key, usize::MAX, 0, vec![raw.clone()])
    }

    pub fn collection_unshift(&self, uuid: Uuid, key: &str, raw: &Json) -> SyncResult<()> {
        self.collection_splice(uuid, key, 0, 0, vec![raw.clone()])
    }

    pub fn collection_pop(&self, uuid: Uuid, key: &str) -> SyncResult<Option<Value>> {
        let len = {
            let guard = self.inner.lock().unwrap();
            guard.models.get(&uuid).map(|o| o.get_collection(key).len()).unwrap_or(0)
        };
        if len == 0 {
            return Ok(None);
        }
        let removed = {
            let guard = self.inner.lock().unwrap();
            guard.models[&uuid].get_collection(key)[len - 1].clone()
        };
        self.collection_splice(uuid, key, len - 1, 1, vec![])?;
        Ok(Some(removed))
    }

    pub fn collection_shift(&self, uuid: Uuid, key: &str) -> SyncResult<Option<Value>> {
        let first = {
            let guard = self.inner.lock().unwrap();
            guard.models.get(&uuid).and_then(|o| o.get_collection(key).first().cloned())
        };
        if first.is_none() {
            return Ok(None);
        }
        self.collection_splice(uuid, key, 0, 1, vec![])?;
        Ok(first)
    }

    /// `splice(start, delete_count, inserted)` — the general-purpose
    /// mutator `push`/`pop`/`shift`/`unshift` all reduce to (§4.B).
    pub fn collection_splice(
        &self,
        uuid: Uuid,
        key: &str,
        start: usize,
        delete_count: usize,
        inserted_raw: Vec<Json>,
    ) -> SyncResult<()> {
        let mut guard = self.inner.lock().unwrap();
        guard.require_not_poisoned()?;
        let type_name = guard
            .models
            .get(&uuid)
            .ok_or_else(|| SyncError::UnknownProperty(format!("object {uuid} not in scope")))?
            .type_name
            .clone();
        let type_desc = self.registry.require(&type_name)?.clone();
        let prop = type_desc
            .property(key)
            .ok_or_else(|| SyncError::UnknownProperty(key.to_string()))?
            .clone();
        if !prop.is_collection {
            return Err(SyncError::ValueInvalid {
                property: key.to_string(),
                reason: "splice requires a collection property".to_string(),
            });
        }
        let inserted: Vec<Value> = inserted_raw
            .iter()
            .map(|raw| {
                if prop.value_kind.is_reference() {
                    let s = raw.as_str().ok_or_else(|| SyncError::ValueInvalid {
                        property: key.to_string(),
                        reason: "reference collection elements must be UUID strings".to_string(),
                    })?;
                    Uuid::parse_str(s)
                        .map(Value::Ref)
                        .map_err(|_| SyncError::ValueInvalid {
                            property: key.to_string(),
                            reason: format!("'{s}' is not a valid UUID"),
                        })
                } else {
                    Value::coerce(key, &prop.value_kind, raw)
                }
            })
            .collect::<Result<_, _>>()?;

        for v in &inserted {
            if let Value::Ref(target) = v {
                self.resurrect_if_detached(&mut guard, *target);
            }
        }
        if let Some(target_type) = as_ref_target(&prop.value_kind) {
            for v in &inserted {
                if let Value::Ref(target) = v {
                    self.validate_ref_target(&guard, key, target_type, *target)?;
                }
            }
        }

        let mut current = guard.models[&uuid].get_collection(key).to_vec();
        let start = start.min(current.len());
        let end = (start + delete_count).min(current.len());
        let removed: Vec<Value> = current.splice(start..end, inserted.clone()).collect();

        for v in &removed {
            if let Value::Ref(target) = v {
                remove_parent(&mut guard, *target, uuid, key);
            }
        }
        for v in &inserted {
            if let Value::Ref(target) = v {
                add_parent(&mut guard, *target, uuid, key);
                self.propagate_scope_into(&mut guard, *target);
            }
        }

        let prior_json = Json::Array(
            guard.models[&uuid]
                .get_collection(key)
                .iter()
                .map(Value::to_json)
                .collect(),
        );
        *guard.models.get_mut(&uuid).unwrap().collection_mut(key) = current.clone();
        let new_json = Json::Array(current.iter().map(Value::to_json).collect());

        if !inserted.is_empty() {
            let ev = CollectionChanged {
                object: uuid,
                key: key.to_string(),
                added: inserted.clone(),
                removed: Vec::new(),
            };
            guard.models.get_mut(&uuid).unwrap().listeners.fire_add(&ev);
        }
        if !removed.is_empty() {
            let ev = CollectionChanged {
                object: uuid,
                key: key.to_string(),
                added: Vec::new(),
                removed: removed.clone(),
            };
            guard.models.get_mut(&uuid).unwrap().listeners.fire_remove(&ev);
        }

        if !guard.applying_remote && (!inserted.is_empty() || !removed.is_empty()) {
            stage_change_raw(&mut guard, uuid, &type_name, key, new_json, prior_json);
            arm_timer_locked(&mut guard);
        }

        drop(guard);
        self.spawn_timer_if_newly_armed();
        Ok(())
    }

    /// §4.B `detach()`: remove `self` from every parent. Leaves physical
    /// eviction to the next flush/apply boundary (§4.D) — only moves the
    /// object into `orphans` if it has no parents left.
    pub fn detach(&self, uuid: Uuid) -> SyncResult<()> {
        let mut guard = self.inner.lock().unwrap();
        guard.require_not_poisoned()?;
        let result = self.detach_locked(&mut guard, uuid);
        drop(guard);
        self.spawn_timer_if_newly_armed();
        result
    }

    /// Core of [`Scope::detach`], taking an already-locked guard — used by
    /// [`Scope::apply_sync_fragments_with_root`] so the pre-apply detach
    /// pass runs under the same `applying_remote` guard as the rest of the
    /// incoming batch, instead of re-entering as a local mutation.
    fn detach_locked(&self, guard: &mut ScopeInner, uuid: Uuid) -> SyncResult<()> {
        let parents: Vec<(Uuid, String)> = guard
            .models
            .get(&uuid)
            .map(|o| o.parents.iter().cloned().collect())
            .unwrap_or_default();
        for (parent_uuid, key) in parents {
            self.clear_reference_from_parent(guard, parent_uuid, &key, uuid)?;
        }
        Ok(())
    }

    fn clear_reference_from_parent(
        &self,
        guard: &mut ScopeInner,
        parent_uuid: Uuid,
        key: &str,
        child_uuid: Uuid,
    ) -> SyncResult<()> {
        let Some(parent) = guard.models.get(&parent_uuid) else {
            return Ok(());
        };
        let type_name = parent.type_name.clone();
        let type_desc = self.registry.require(&type_name)?.clone();
        let Some(prop) = type_desc.property(key) else {
            return Ok(());
        };
        if prop.is_collection {
            let current = guard.models[&parent_uuid].get_collection(key).to_vec();
            let retained: Vec<Value> = current
                .into_iter()
                .filter(|v| v.as_ref_uuid() != Some(child_uuid))
                .collect();
            drop(type_desc);
            return self.reset_collection_locked(guard, parent_uuid, key, retained);
        }
        remove_parent(guard, child_uuid, parent_uuid, key);
        let prev_value = Value::Ref(child_uuid);
        guard
            .models
            .get_mut(&parent_uuid)
            .unwrap()
            .set_scalar_raw(key, Value::Null);
        let event = KeyChanged {
            object: parent_uuid,
            key: key.to_string(),
            new: Value::Null,
            prev: prev_value.clone(),
        };
        guard
            .models
            .get_mut(&parent_uuid)
            .unwrap()
            .listeners
            .fire_change(&event);
        if !guard.applying_remote {
            stage_change(guard, parent_uuid, &type_name, key, &Value::Null, &prev_value);
            arm_timer_locked(guard);
        }
        Ok(())
    }

    /// Physically evict every still-orphaned object from `models` into
    /// `detached`, cascading to former children. Called only at batch
    /// boundaries (flush, or the end of an incoming apply) rather than
    /// after each individual mutation — a child that gets re-referenced
    /// before the next boundary is simply un-orphaned and never leaves
    /// scope (§8 S3).
    fn physically_sweep_orphans_locked(&self, guard: &mut ScopeInner) {
        let mut frontier: Vec<Uuid> = guard
            .models
            .iter()
            .filter(|(_, o)| o.is_orphaned())
            .map(|(u, _)| *u)
            .collect();
        frontier.extend(guard.orphans.drain());
        let mut seen = HashSet::new();
        while let Some(uuid) = frontier.pop() {
            if !seen.insert(uuid) {
                continue;
            }
            let Some(obj) = guard.models.get(&uuid) else {
                continue;
            };
            if !obj.is_orphaned() {
                continue;
            }
            let Some(obj) = guard.models.remove(&uuid) else {
                continue;
            };
            guard.removed_models.insert(uuid);
            guard.pending_fragments.drop_pending(&uuid);

            // Cascade: removing this object drops its own outgoing
            // references, which may orphan its former children in turn
            // (§4.D: "re-emits its own orphan notifications upward").
            for (k, v) in obj.snapshot_scalars() {
                if let Value::Ref(target) = v {
                    remove_parent(guard, *target, uuid, k);
                    if guard.models.get(target).map(|o| o.is_orphaned()).unwrap_or(false) {
                        frontier.push(*target);
                    }
                }
            }
            for (k, values) in obj.snapshot_collections() {
                for v in values {
                    if let Value::Ref(target) = v {
                        remove_parent(guard, *target, uuid, k);
                        if guard.models.get(target).map(|o| o.is_orphaned()).unwrap_or(false) {
                            frontier.push(*target);
                        }
                    }
                }
            }

            let ev = ScopeMembershipChanged {
                object: uuid,
                membership: ScopeMembership::Detached,
            };
            for l in &mut guard.membership_listeners {
                l(&ev);
            }

            // The object itself survives the sweep — only its scope
            // residency ends. Parking it in `detached` rather than
            // dropping it lets a later reference to the same UUID
            // resurrect it with its prior values intact (§8 S3: "Add
            // child re-created because it became orphaned and was
            // removed in between"). Clearing `scope` here is what makes
            // `propagate_scope_into` treat the resurrection as a fresh
            // entry and stage a new Add fragment rather than a no-op.
            let mut obj = obj;
            obj.scope = None;
            guard.detached.insert(uuid, obj);
        }
    }

    /// Consume `pending_timer_spawn` and, if it was set, actually spawn the
    /// timer's expiry task. Every local-mutation entry point calls this
    /// once it has dropped its lock, so §4.D's "flushes on a change timer"
    /// is the scope's own responsibility rather than something an external
    /// driver has to remember to pump.
    fn spawn_timer_if_newly_armed(&self) {
        let should_spawn = {
            let mut guard = self.inner.lock().unwrap();
            std::mem::take(&mut guard.pending_timer_spawn)
        };
        if should_spawn {
            self.spawn_change_timer();
        }
    }

    /// Arm (or leave armed) the change timer and spawn its expiry task.
    /// Exposed so a caller may also drive it directly (§5 AMBIENT); local
    /// mutations no longer need to, see [`Scope::spawn_timer_if_newly_armed`].
    pub fn spawn_change_timer(&self) -> Option<tokio::task::JoinHandle<()>> {
        let (due, generation, interval_ms) = {
            let guard = self.inner.lock().unwrap();
            (guard.change_timer_armed, guard.timer_generation, guard.change_interval_ms)
        };
        if !due {
            return None;
        }
        let scope = self.clone();
        Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(interval_ms)).await;
            scope.fire_timer(generation);
        }))
    }

    fn fire_timer(&self, generation: u64) {
        let mut guard = self.inner.lock().unwrap();
        if guard.timer_generation != generation || !guard.change_timer_armed {
            return;
        }
        guard.change_timer_armed = false;
        self.flush_locked(&mut guard);
    }

    /// Force an immediate flush, bypassing the timer (useful for tests and
    /// for callers that want synchronous control over batching).
    pub fn flush_now(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.change_timer_armed = false;
        self.flush_locked(&mut guard);
    }

    fn flush_locked(&self, guard: &mut ScopeInner) {
        self.physically_sweep_orphans_locked(guard);
        if guard.pending_fragments.is_empty() {
            return;
        }
        let fragments: Vec<SyncFragment> = guard
            .pending_fragments
            .drain_in_order()
            .into_iter()
            .filter(|f| f.is_add() || !f.is_empty())
            .collect();
        if fragments.is_empty() {
            return;
        }
        let notification = ScopeChanges {
            scope: guard.uuid,
            fragments,
            atomic: false,
        };
        for l in guard.changes_listeners.values_mut() {
            l(&notification);
        }
    }

    /// §4.D incoming apply, guarded by `applying_remote`.
    pub fn apply_sync_fragments(
        &self,
        fragments: Vec<SyncFragment>,
        apply_defaults: bool,
    ) -> SyncResult<()> {
        let mut guard = self.inner.lock().unwrap();
        guard.require_not_poisoned()?;
        guard.applying_remote = true;
        let result = self.apply_locked(&mut guard, fragments, apply_defaults);
        guard.syncing_models.clear();
        guard.applying_remote = false;
        result
    }

    /// §4.D `apply_sync_fragments_with_root`: reset the root, detach every
    /// currently in-scope non-root object also named in the incoming
    /// batch, then apply normally with defaults.
    pub fn apply_sync_fragments_with_root(
        &self,
        new_root_uuid: Uuid,
        fragments: Vec<SyncFragment>,
    ) -> SyncResult<()> {
        let incoming: HashSet<Uuid> = fragments.iter().map(|f| f.uuid).collect();
        {
            let mut guard = self.inner.lock().unwrap();
            guard.applying_remote = true;
            let to_detach: Vec<Uuid> = guard
                .models
                .values()
                .filter(|o| !o.is_scope_root && incoming.contains(&o.uuid))
                .map(|o| o.uuid)
                .collect();
            for uuid in to_detach {
                self.detach_locked(&mut guard, uuid)?;
            }
            guard.applying_remote = false;
        }
        {
            let mut guard = self.inner.lock().unwrap();
            guard.root_uuid = Some(new_root_uuid);
        }
        self.apply_sync_fragments(fragments, true)
    }

    /// §4.B `set_scope(s, recursive=true)`: move `uuid`, currently owned by
    /// `self`, into `target`. A no-op if `uuid` is already in `target`.
    /// When `recursive`, every reference the moved object holds (scalar or
    /// collection) is moved along with it, so a whole subtree changes
    /// scope as a unit rather than leaving dangling cross-scope refs.
    pub fn set_scope(&self, uuid: Uuid, target: &Scope, recursive: bool) -> SyncResult<()> {
        if self.uuid() == target.uuid() {
            return Ok(());
        }
        if target.inner.lock().unwrap().models.contains_key(&uuid) {
            return Ok(());
        }
        let mut seen = HashSet::new();
        self.move_object_into(uuid, target, recursive, &mut seen)
    }

    fn move_object_into(
        &self,
        uuid: Uuid,
        target: &Scope,
        recursive: bool,
        seen: &mut HashSet<Uuid>,
    ) -> SyncResult<()> {
        if !seen.insert(uuid) {
            return Ok(());
        }
        let obj = {
            let mut guard = self.inner.lock().unwrap();
            guard.orphans.remove(&uuid);
            guard.pending_fragments.drop_pending(&uuid);
            guard.models.remove(&uuid)
        };
        let Some(mut obj) = obj else {
            return Ok(());
        };

        let children: Vec<Uuid> = obj
            .snapshot_scalars()
            .values()
            .chain(obj.snapshot_collections().values().flatten())
            .filter_map(Value::as_ref_uuid)
            .collect();

        obj.scope = Some(target.uuid());

        {
            let mut guard = self.inner.lock().unwrap();
            let ev = ScopeMembershipChanged {
                object: uuid,
                membership: ScopeMembership::Detached,
            };
            for l in &mut guard.membership_listeners {
                l(&ev);
            }
        }

        {
            let mut tguard = target.inner.lock().unwrap();
            tguard.models.insert(uuid, obj);
            let ev = ScopeMembershipChanged {
                object: uuid,
                membership: ScopeMembership::Attached,
            };
            for l in &mut tguard.membership_listeners {
                l(&ev);
            }
            if !tguard.applying_remote {
                stage_add(&mut tguard, uuid);
                arm_timer_locked(&mut tguard);
            }
        }
        target.spawn_timer_if_newly_armed();

        if recursive {
            for child in children {
                self.move_object_into(child, target, recursive, seen)?;
            }
        }
        Ok(())
    }

    /// §4.B `set_scope_and_make_root(s)`: detach every parent first (so the
    /// object enters `s` with no inherited parent links), then move it
    /// (recursively) and mark it `s`'s root.
    pub fn set_scope_and_make_root(&self, uuid: Uuid, target: &Scope) -> SyncResult<()> {
        self.detach(uuid)?;
        self.set_scope(uuid, target, true)?;
        target.make_root(uuid)
    }

    fn apply_locked(
        &self,
        guard: &mut ScopeInner,
        mut fragments: Vec<SyncFragment>,
        apply_defaults: bool,
    ) -> SyncResult<()> {
        // Pass 1: create-or-reuse every Add target so forward references
        // within the same batch resolve (§5 ordering guarantee).
        for fragment in &fragments {
            if fragment.fragment_type == FragmentType::Add {
                if !guard.models.contains_key(&fragment.uuid) {
                    guard
                        .models
                        .insert(fragment.uuid, ObjectData::new(fragment.uuid, fragment.cls_name.clone()));
                }
                guard.syncing_models.insert(fragment.uuid);
            }
        }

        let known: HashSet<Uuid> = guard.models.keys().copied().collect();
        for fragment in &mut fragments {
            let type_desc = match self.registry.require(&fragment.cls_name) {
                Ok(t) => t.clone(),
                Err(_) => {
                    tracing::warn!(uuid = %fragment.uuid, cls = %fragment.cls_name, "unknown type in fragment, skipping");
                    continue;
                }
            };
            if fragment.fragment_type == FragmentType::Add && apply_defaults {
                fragment.verify_add_defaults(&type_desc);
            }
            if let Err(e) = fragment.verify_properties_for_type(&self.registry, &type_desc, Some(&known)) {
                tracing::warn!(uuid = %fragment.uuid, error = %e, "fragment failed validation, skipping");
                continue;
            }
        }

        // Pass 2: assign properties.
        for fragment in &fragments {
            let exists = guard.models.contains_key(&fragment.uuid) || guard.syncing_models.contains(&fragment.uuid);
            if !exists {
                tracing::warn!(uuid = %fragment.uuid, "change fragment for unknown object, skipping");
                continue;
            }
            let Some(properties) = &fragment.properties else {
                continue;
            };
            for (key, raw) in properties {
                if let Err(e) = self.set_locked(guard, fragment.uuid, key, raw) {
                    tracing::warn!(uuid = %fragment.uuid, key, error = %e, "remote property assignment failed, skipping key");
                }
            }
        }

        self.physically_sweep_orphans_locked(guard);
        Ok(())
    }
}

fn target_type_name(kind: &crate::registry::ValueKind) -> &str {
    match kind {
        crate::registry::ValueKind::Ref(t) => t.as_str(),
        _ => "",
    }
}

fn as_ref_target(kind: &crate::registry::ValueKind) -> Option<&str> {
    match kind {
        crate::registry::ValueKind::Ref(t) => Some(t.as_str()),
        _ => None,
    }
}

fn remove_parent(guard: &mut ScopeInner, target: Uuid, parent: Uuid, key: &str) {
    if let Some(obj) = guard.models.get_mut(&target) {
        obj.parents.remove(&(parent, key.to_string()));
        if obj.is_orphaned() {
            // Schedule, don't evict: the object stays resolvable until the
            // next physical sweep (flush time / apply-batch end), so a
            // re-reference before then just cancels the orphaning (§8 S3's
            // "1 fragment" case — no Add needed if it was never actually
            // removed from scope). Its pending fragment is dropped now,
            // per §4.D: "schedules orphan removal and drops any pending
            // fragment for that UUID".
            guard.orphans.insert(target);
            guard.pending_fragments.drop_pending(&target);
        }
    }
}

fn add_parent(guard: &mut ScopeInner, target: Uuid, parent: Uuid, key: &str) {
    if let Some(obj) = guard.models.get_mut(&target) {
        obj.parents.insert((parent, key.to_string()));
        guard.orphans.remove(&target);
    }
}

/// Stage (or reuse) an Add fragment for an object that just entered scope
/// (§4.D: "Parent-add events for an in-scope object produce an Add
/// fragment (once)").
fn stage_add(guard: &mut ScopeInner, uuid: Uuid) {
    let Some(obj) = guard.models.get(&uuid) else {
        return;
    };
    let type_name = obj.type_name.clone();
    let scalars = obj.snapshot_scalars().clone();
    let collections = obj.snapshot_collections().clone();
    guard.pending_fragments.get_or_create(uuid, || {
        let mut values: BTreeMap<String, Value> = scalars;
        for (k, v) in collections {
            values.insert(
                k,
                Value::String(Json::Array(v.iter().map(Value::to_json).collect()).to_string()),
            );
        }
        SyncFragment::new_add(uuid, type_name.clone(), &values)
    });
    // Collections must be encoded as JSON arrays, not stringified — patch
    // them in directly since `SyncFragment::new_add` only knows `Value`.
    if let Some(frag) = guard.pending_fragments.by_uuid.get_mut(&uuid) {
        if let Some(props) = frag.properties.as_mut() {
            if let Some(obj) = guard.models.get(&uuid) {
                for (k, v) in obj.snapshot_collections() {
                    props.insert(k.clone(), Json::Array(v.iter().map(Value::to_json).collect()));
                }
            }
        }
    }
}

fn stage_change(
    guard: &mut ScopeInner,
    uuid: Uuid,
    type_name: &str,
    key: &str,
    new: &Value,
    prev: &Value,
) {
    stage_change_raw(guard, uuid, type_name, key, new.to_json(), prev.to_json())
}

fn stage_change_raw(
    guard: &mut ScopeInner,
    uuid: Uuid,
    type_name: &str,
    key: &str,
    new_json: Json,
    prev_json: Json,
) {
    let type_name = type_name.to_string();
    let fragment = guard
        .pending_fragments
        .get_or_create(uuid, || SyncFragment::new_change(uuid, type_name.clone()));
    if fragment.is_add() {
        // Still un-flushed Add: update the snapshot directly, no
        // `original_properties` bookkeeping (there is no prior sent state
        // to revert to).
        fragment
            .properties
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), new_json);
    } else {
        fragment.original_properties.entry(key.to_string()).or_insert(prev_json);
        fragment
            .properties
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), new_json);
    }
}

fn arm_timer_locked(guard: &mut ScopeInner) {
    if !guard.change_timer_armed {
        guard.change_timer_armed = true;
        guard.timer_generation += 1;
        guard.pending_timer_spawn = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{PropertyDescriptor, ValueKind};
    use serde_json::json;
    use std::collections::BTreeSet;

    fn registry_with_model_and_child() -> Arc<TypeRegistry> {
        let mut reg = TypeRegistry::new();
        reg.declare_type("Model").unwrap();
        reg.declare_type("Child").unwrap();
        reg.declare_property("Model", |o| PropertyDescriptor {
            name: "m".to_string(),
            value_kind: ValueKind::Ref("Child".to_string()),
            is_collection: false,
            default: Json::Null,
            order: o,
        })
        .unwrap();
        reg.declare_property("Model", |o| PropertyDescriptor {
            name: "mTwo".to_string(),
            value_kind: ValueKind::Ref("Child".to_string()),
            is_collection: false,
            default: Json::Null,
            order: o,
        })
        .unwrap();
        reg.declare_property("Child", |o| PropertyDescriptor {
            name: "name".to_string(),
            value_kind: ValueKind::String,
            is_collection: false,
            default: Json::Null,
            order: o,
        })
        .unwrap();
        Arc::new(reg)
    }

    #[test]
    fn reference_assignment_maintains_parent_invariant() {
        let scope = Scope::new(registry_with_model_and_child(), "test", 50);
        let model = scope.create_object("Model").unwrap();
        scope.make_root(model).unwrap();
        let child = scope.create_object("Child").unwrap();

        scope.set(model, "m", &json!(child.to_string())).unwrap();
        assert!(scope.contains(child));
        let parents = scope.inner.lock().unwrap().models[&child].parents.clone();
        assert_eq!(parents, BTreeSet::from([(model, "m".to_string())]));

        scope.set(model, "m", &Json::Null).unwrap();
        // The last parent was removed: child is orphaned immediately (§8
        // invariant 1), but physical eviction from `models` is deferred to
        // the next batch boundary (flush or incoming-apply sweep, §4.D) so
        // that a re-reference arriving before then is a cheap cancellation
        // rather than a remove-then-recreate (see `move_child_fragment_counts`
        // for why that deferral matters).
        assert!(scope.contains(child));
        assert_eq!(scope.orphan_count(), 1);
        scope.flush_now();
        assert!(!scope.contains(child));
    }

    // S3 — move child: fragment counts across three reference moves.
    #[test]
    fn move_child_fragment_counts() {
        let scope = Scope::new(registry_with_model_and_child(), "test", 50);
        let model = scope.create_object("Model").unwrap();
        scope.make_root(model).unwrap();
        scope.flush_now(); // drop the root's own Add fragment

        let child = scope.create_object("Child").unwrap();
        scope.set(model, "m", &json!(child.to_string())).unwrap();
        let batch = std::sync::Arc::new(Mutex::new(Vec::new()));
        {
            let batch = batch.clone();
            scope.on_changes(Box::new(move |c| batch.lock().unwrap().push(c.clone())));
        }
        scope.flush_now();
        {
            let mut notifications = batch.lock().unwrap();
            assert_eq!(notifications.len(), 1);
            let fragments = notifications.remove(0).fragments;
            assert_eq!(fragments.len(), 2, "expected Add child + Change model");
            assert!(fragments.iter().any(|f| f.is_add() && f.uuid == child));
            assert!(fragments.iter().any(|f| !f.is_add() && f.uuid == model));
        }

        scope.set(model, "m", &Json::Null).unwrap();
        scope.set(model, "mTwo", &json!(child.to_string())).unwrap();
        scope.flush_now();
        {
            let mut notifications = batch.lock().unwrap();
            assert_eq!(notifications.len(), 1);
            let fragments = notifications.remove(0).fragments;
            assert_eq!(fragments.len(), 1, "expected a single Change model fragment");
            assert!(!fragments[0].is_add());
            assert_eq!(fragments[0].uuid, model);
        }

        // Unlike the m=null/mTwo=child pair above, this time a flush falls
        // *in between* the unset and the re-set — so the orphan sweep at
        // that flush physically evicts `child` before it gets re-referenced.
        scope.set(model, "mTwo", &Json::Null).unwrap();
        scope.flush_now();
        assert!(!scope.contains(child), "child orphaned and swept at the intervening flush");
        {
            let mut notifications = batch.lock().unwrap();
            assert_eq!(notifications.len(), 1);
            let fragments = notifications.remove(0).fragments;
            assert_eq!(fragments.len(), 1, "expected a single Change model fragment (mTwo=null)");
            assert!(!fragments[0].is_add());
            assert_eq!(fragments[0].uuid, model);
        }

        scope.set(model, "m", &json!(child.to_string())).unwrap();
        scope.flush_now();
        {
            let mut notifications = batch.lock().unwrap();
            assert_eq!(notifications.len(), 1);
            let fragments = notifications.remove(0).fragments;
            assert_eq!(
                fragments.len(),
                2,
                "child re-created as a fresh Add after being swept as an orphan"
            );
            assert!(fragments.iter().any(|f| f.is_add() && f.uuid == child));
            assert!(fragments.iter().any(|f| !f.is_add() && f.uuid == model));
        }
    }

    // S6 — orphan sweep.
    #[test]
    fn orphan_sweep_clears_parents_and_orphan_set() {
        let scope = Scope::new(registry_with_model_and_child(), "test", 50);
        let model = scope.create_object("Model").unwrap();
        scope.make_root(model).unwrap();
        let child = scope.create_object("Child").unwrap();
        scope.set(model, "m", &json!(child.to_string())).unwrap();
        assert!(scope.contains(child));

        scope
            .apply_sync_fragments(
                vec![SyncFragment::from_raw(
                    model,
                    "Model",
                    BTreeMap::from([("m".to_string(), Json::Null)]),
                )],
                false,
            )
            .unwrap();

        assert!(!scope.contains(child));
        assert_eq!(scope.orphan_count(), 0);
    }

    #[test]
    fn collection_reset_no_ops_on_identical_element() {
        let (added, removed) = diff_collection(
            &[Value::Int64(1), Value::Int64(2)],
            &[Value::Int64(2), Value::Int64(1)],
        );
        assert!(added.is_empty());
        assert!(removed.is_empty());
    }

    // §4.B set_scope: moving an object (and, recursively, its referenced
    // child) from one scope into another.
    #[test]
    fn set_scope_moves_object_and_recursive_child_between_scopes() {
        let registry = registry_with_model_and_child();
        let source = Scope::new(registry.clone(), "source", 50);
        let dest = Scope::new(registry, "dest", 50);

        let model = source.create_object("Model").unwrap();
        source.make_root(model).unwrap();
        let child = source.create_object("Child").unwrap();
        source.set(model, "m", &json!(child.to_string())).unwrap();
        assert!(source.contains(model));
        assert!(source.contains(child));

        source.set_scope(model, &dest, true).unwrap();

        assert!(!source.contains(model));
        assert!(!source.contains(child), "recursive move carries the referenced child along");
        assert!(dest.contains(model));
        assert!(dest.contains(child));
    }

    #[test]
    fn set_scope_and_make_root_detaches_parents_first() {
        let registry = registry_with_model_and_child();
        let source = Scope::new(registry.clone(), "source", 50);
        let dest = Scope::new(registry, "dest", 50);

        let model = source.create_object("Model").unwrap();
        source.make_root(model).unwrap();
        let child = source.create_object("Child").unwrap();
        source.set(model, "m", &json!(child.to_string())).unwrap();

        source.set_scope_and_make_root(child, &dest).unwrap();

        assert!(dest.contains(child));
        assert_eq!(dest.root_uuid(), Some(child));
        // The model→child reference was cleared by the pre-move detach.
        assert_eq!(source.get(model, "m").unwrap(), Value::Null);
    }

    #[test]
    fn per_key_listener_fires_on_change_and_ignores_invalid_registration() {
        let scope = Scope::new(registry_with_model_and_child(), "test", 50);
        let model = scope.create_object("Model").unwrap();
        scope.make_root(model).unwrap();
        let child = scope.create_object("Child").unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            scope.on_key_changed(
                model,
                "m",
                Box::new(move |e| seen.lock().unwrap().push((e.new.clone(), e.prev.clone()))),
            );
        }

        // Invalid registrations: unknown property, and registering a
        // scalar-only action on a kind that doesn't support it. Both must
        // log and be silently ignored rather than panicking.
        scope.on_key_changed(model, "does-not-exist", Box::new(|_| {}));
        scope.on_collection_add(model, "m", Box::new(|_| {}));

        scope.set(model, "m", &json!(child.to_string())).unwrap();

        let recorded = seen.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].0, Value::Ref(child));
        assert_eq!(recorded[0].1, Value::Null);
    }

    // §4.B "Ref(T): must be instance of T or subtype" applies to
    // collection-of-reference properties the same way it does to scalar
    // ones, via both `set` (whole-collection reset) and `collection_push`
    // (splice-based mutation).
    fn registry_with_children_collection_and_other() -> Arc<TypeRegistry> {
        let mut reg = TypeRegistry::new();
        reg.declare_type("Model").unwrap();
        reg.declare_type("Child").unwrap();
        reg.declare_type("Other").unwrap();
        reg.declare_property("Model", |o| PropertyDescriptor {
            name: "children".to_string(),
            value_kind: ValueKind::Ref("Child".to_string()),
            is_collection: true,
            default: Json::Array(vec![]),
            order: o,
        })
        .unwrap();
        Arc::new(reg)
    }

    #[test]
    fn collection_reset_rejects_reference_of_wrong_type() {
        let scope = Scope::new(registry_with_children_collection_and_other(), "test", 50);
        let model = scope.create_object("Model").unwrap();
        scope.make_root(model).unwrap();
        let other = scope.create_object("Other").unwrap();

        let err = scope
            .set(model, "children", &json!([other.to_string()]))
            .unwrap_err();
        assert!(matches!(err, SyncError::TypeMismatch { .. }));
        assert!(scope.get_collection(model, "children").unwrap().is_empty());
    }

    #[test]
    fn collection_push_rejects_reference_of_wrong_type() {
        let scope = Scope::new(registry_with_children_collection_and_other(), "test", 50);
        let model = scope.create_object("Model").unwrap();
        scope.make_root(model).unwrap();
        let other = scope.create_object("Other").unwrap();

        let err = scope
            .collection_push(model, "children", &json!(other.to_string()))
            .unwrap_err();
        assert!(matches!(err, SyncError::TypeMismatch { .. }));
        assert!(scope.get_collection(model, "children").unwrap().is_empty());
    }
}
