//! Change-Set (§4.E): a flushed batch of fragments tracked as a unit from
//! dispatch until it resolves. Mirrors the `Arc<Mutex<Inner>>` handle shape
//! of [`crate::scope::Scope`] so a `ChangeSet` can be cloned cheaply and
//! shared between the [`crate::queue::ChangeSetQueue`] and the
//! [`crate::session::Session`] that dispatches its reply.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value as Json;
use uuid::Uuid;

use crate::events::ChangeSetStateChanged;
use crate::fragment::{FragmentType, SyncFragment};
use crate::message::FragmentReply;
use crate::queue::ChangeSetQueue;
use crate::scope::Scope;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSetState {
    Syncing,
    Completed,
    Reverted,
    PartiallyReverted,
}

impl ChangeSetState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ChangeSetState::Completed | ChangeSetState::Reverted)
    }
}

/// Prior values recorded for one touched object (§4.E). The object's own
/// `Uuid` is kept alongside so revert/rebase never need to re-resolve it
/// through a scope or session lookup.
#[derive(Debug, Clone, Default)]
pub struct TouchedObject {
    pub object_ref: Uuid,
    pub properties: BTreeMap<String, Json>,
}

pub type StateListener = Box<dyn FnMut(&ChangeSetStateChanged) + Send>;

struct ChangeSetInner {
    scope: Scope,
    fragments: Vec<SyncFragment>,
    atomic: bool,
    touches: BTreeMap<Uuid, TouchedObject>,
    state: ChangeSetState,
    listeners: Vec<StateListener>,
}

#[derive(Clone)]
pub struct ChangeSet {
    inner: Arc<Mutex<ChangeSetInner>>,
}

/// A non-owning handle to a [`ChangeSet`]. [`ChangeSetQueue`] closes over
/// one of these (rather than a `ChangeSet`, which would hold a strong
/// `Arc`) when it subscribes to state transitions at enqueue time, so a
/// change-set's own listener list never keeps itself alive (§9: the same
/// "no `Arc` cycles" discipline the object graph uses).
#[derive(Clone)]
pub struct WeakChangeSet {
    inner: Weak<Mutex<ChangeSetInner>>,
}

impl WeakChangeSet {
    pub fn upgrade(&self) -> Option<ChangeSet> {
        self.inner.upgrade().map(|inner| ChangeSet { inner })
    }
}

impl ChangeSet {
    /// Construct from a flushed batch (§4.E): seeds `touches` from every
    /// `Change` fragment's `original_properties`, coercing "never
    /// recorded" to `null`. `Add` fragments do not populate `touches`.
    pub fn new(scope: Scope, fragments: Vec<SyncFragment>, atomic: bool) -> Self {
        let mut touches: BTreeMap<Uuid, TouchedObject> = BTreeMap::new();
        for fragment in &fragments {
            if fragment.fragment_type != FragmentType::Change {
                continue;
            }
            let entry = touches.entry(fragment.uuid).or_insert_with(|| TouchedObject {
                object_ref: fragment.uuid,
                properties: BTreeMap::new(),
            });
            for key in fragment.keys() {
                entry
                    .properties
                    .entry(key.clone())
                    .or_insert_with(|| fragment.original_value(&key));
            }
        }
        Self {
            inner: Arc::new(Mutex::new(ChangeSetInner {
                scope,
                fragments,
                atomic,
                touches,
                state: ChangeSetState::Syncing,
                listeners: Vec::new(),
            })),
        }
    }

    pub fn ptr_eq(&self, other: &ChangeSet) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn downgrade(&self) -> WeakChangeSet {
        WeakChangeSet {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn state(&self) -> ChangeSetState {
        self.inner.lock().unwrap().state
    }

    pub fn fragment_count(&self) -> usize {
        self.inner.lock().unwrap().fragments.len()
    }

    pub fn scope(&self) -> Scope {
        self.inner.lock().unwrap().scope.clone()
    }

    pub fn atomic(&self) -> bool {
        self.inner.lock().unwrap().atomic
    }

    pub fn touches(&self, uuid: Uuid, key: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .touches
            .get(&uuid)
            .map(|t| t.properties.contains_key(key))
            .unwrap_or(false)
    }

    pub fn on_state_changed(&self, listener: StateListener) {
        self.inner.lock().unwrap().listeners.push(listener);
    }

    /// Sets the new state and fires listeners with the lock released —
    /// a listener reacting to this transition (e.g. the queue rebasing a
    /// successor onto `self`) may need to lock `self.inner` again, which
    /// would deadlock a `std::sync::Mutex` if held across the callback.
    fn transition(&self, new_state: ChangeSetState) {
        let mut listeners = {
            let mut guard = self.inner.lock().unwrap();
            guard.state = new_state;
            std::mem::take(&mut guard.listeners)
        };
        let event = ChangeSetStateChanged { new_state };
        for l in &mut listeners {
            l(&event);
        }
        self.inner.lock().unwrap().listeners = listeners;
    }

    /// §4.E `revert_on_scope`: write every touched prior value back onto
    /// its object, unless a later change-set in `queue` also touches that
    /// (object, key) — in which case the later set owns the restore when
    /// *it* reverts.
    pub fn revert_on_scope(&self, queue: &ChangeSetQueue) {
        let (scope, touches) = {
            let guard = self.inner.lock().unwrap();
            (guard.scope.clone(), guard.touches.clone())
        };
        for (uuid, touched) in &touches {
            for (key, prior) in &touched.properties {
                if queue.is_touched_by_later(self, *uuid, key) {
                    continue;
                }
                if let Err(e) = scope.update_value_on_model(*uuid, key, prior) {
                    tracing::warn!(object = %uuid, key, error = %e, "revert write failed, skipping key");
                }
            }
        }
        self.transition(ChangeSetState::Reverted);
    }

    /// §4.E `apply_fragment_replies`. `replies.len()` must equal the
    /// fragment count; a mismatch reverts the whole set.
    pub fn apply_fragment_replies(&self, replies: Vec<FragmentReply>, queue: &ChangeSetQueue) {
        let (scope, fragments) = {
            let guard = self.inner.lock().unwrap();
            (guard.scope.clone(), guard.fragments.clone())
        };
        if replies.len() != fragments.len() {
            tracing::warn!(
                fragments = fragments.len(),
                replies = replies.len(),
                "fragment/reply count mismatch, reverting whole change-set"
            );
            self.revert_on_scope(queue);
            return;
        }

        let mut accepted_count = 0usize;
        let mut rejected_count = 0usize;

        for (fragment, reply) in fragments.iter().zip(replies.iter()) {
            if reply.accepted {
                accepted_count += 1;
            } else {
                rejected_count += 1;
                if fragment.fragment_type == FragmentType::Change {
                    let touched = {
                        let guard = self.inner.lock().unwrap();
                        guard.touches.get(&fragment.uuid).cloned()
                    };
                    if let Some(touched) = touched {
                        for key in fragment.keys() {
                            let Some(prior) = touched.properties.get(&key) else {
                                continue;
                            };
                            if queue.is_touched_by_later(self, fragment.uuid, &key) {
                                continue;
                            }
                            if let Err(e) = scope.update_value_on_model(fragment.uuid, &key, prior) {
                                tracing::warn!(object = %fragment.uuid, key, error = %e, "reject-restore failed, skipping key");
                            }
                        }
                    }
                }
            }

            // §9 Open Question: `modifications` writes unconditionally,
            // regardless of acceptance or later-touch status — the source
            // never consults the queue-aware check here, and we preserve
            // that asymmetry rather than "fixing" it.
            if let Some(modifications) = &reply.modifications {
                for (key, value) in modifications {
                    if let Err(e) = scope.update_value_on_model(fragment.uuid, key, value) {
                        tracing::warn!(object = %fragment.uuid, key, error = %e, "modification write failed, skipping key");
                    }
                }
            }
        }

        let final_state = if rejected_count == 0 {
            ChangeSetState::Completed
        } else if accepted_count == 0 {
            ChangeSetState::Reverted
        } else {
            ChangeSetState::PartiallyReverted
        };
        self.transition(final_state);
    }

    /// §4.F `rebase_on_change_set`: absorb `other`'s recorded prior values
    /// for every (object, key) both sets touch, so that when `self`
    /// reverts later it restores the baseline that preceded `other` too.
    pub fn rebase_on_change_set(&self, other: &ChangeSet) {
        let other_touches = other.inner.lock().unwrap().touches.clone();
        let mut guard = self.inner.lock().unwrap();
        for (uuid, other_touched) in &other_touches {
            let Some(mine) = guard.touches.get_mut(uuid) else {
                continue;
            };
            for (key, prior) in &other_touched.properties {
                if mine.properties.contains_key(key) {
                    mine.properties.insert(key.clone(), prior.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{PropertyDescriptor, TypeRegistry, ValueKind};
    use serde_json::json;
    use std::sync::Arc as StdArc;

    fn test_scope() -> (Scope, Uuid) {
        let mut reg = TypeRegistry::new();
        reg.declare_type("Model").unwrap();
        for (name, kind) in [
            ("number", ValueKind::Int64),
            ("numberTwo", ValueKind::Int64),
            ("string", ValueKind::String),
        ] {
            reg.declare_property("Model", |o| PropertyDescriptor {
                name: name.to_string(),
                value_kind: kind,
                is_collection: false,
                default: Json::Null,
                order: o,
            })
            .unwrap();
        }
        let scope = Scope::new(StdArc::new(reg), "test", 50);
        let uuid = scope.create_object("Model").unwrap();
        scope.make_root(uuid).unwrap();
        scope.set(uuid, "number", &json!(1)).unwrap();
        scope.set(uuid, "numberTwo", &json!(10)).unwrap();
        scope.set(uuid, "string", &json!("one")).unwrap();
        scope.flush_now();
        (scope, uuid)
    }

    // S1 — simple revert.
    #[test]
    fn simple_revert_restores_pre_mutation_values() {
        let (scope, uuid) = test_scope();
        scope.set(uuid, "number", &json!(2)).unwrap();
        scope.set(uuid, "numberTwo", &json!(20)).unwrap();
        scope.set(uuid, "string", &json!("two")).unwrap();
        scope.flush_now();

        // flush_now fires the `changes` listener synchronously only if one
        // is registered; build the ChangeSet directly from the pending
        // fragment instead for this unit test.
        let fragment = SyncFragment::new_change(uuid, "Model");
        let mut fragment = fragment;
        fragment.update_value_from_model("number", &crate::value::Value::Int64(2), &crate::value::Value::Int64(1));
        fragment.update_value_from_model("numberTwo", &crate::value::Value::Int64(20), &crate::value::Value::Int64(10));
        fragment.update_value_from_model("string", &crate::value::Value::String("two".into()), &crate::value::Value::String("one".into()));

        let cs = ChangeSet::new(scope.clone(), vec![fragment], false);
        let queue = ChangeSetQueue::new();
        queue.enqueue(cs.clone()).unwrap();
        cs.revert_on_scope(&queue);

        assert_eq!(scope.get(uuid, "number").unwrap(), crate::value::Value::Int64(1));
        assert_eq!(scope.get(uuid, "numberTwo").unwrap(), crate::value::Value::Int64(10));
        assert_eq!(scope.get(uuid, "string").unwrap(), crate::value::Value::String("one".into()));
        assert_eq!(queue.len(), 0);
    }

    fn change_fragment(
        uuid: Uuid,
        changes: &[(&str, Json, Json)],
    ) -> SyncFragment {
        let mut fragment = SyncFragment::new_change(uuid, "Model");
        for (key, new, prev) in changes {
            let new_v = match new {
                Json::Number(n) if n.is_i64() => crate::value::Value::Int64(n.as_i64().unwrap()),
                Json::String(s) => crate::value::Value::String(s.clone()),
                other => crate::value::Value::String(other.to_string()),
            };
            let prev_v = match prev {
                Json::Number(n) if n.is_i64() => crate::value::Value::Int64(n.as_i64().unwrap()),
                Json::String(s) => crate::value::Value::String(s.clone()),
                other => crate::value::Value::String(other.to_string()),
            };
            fragment.update_value_from_model(key, &new_v, &prev_v);
        }
        fragment
    }

    // S2 — superset rebase.
    #[test]
    fn superset_rebase_restores_pre_queue_baseline() {
        let (scope, uuid) = test_scope();

        let f1 = change_fragment(
            uuid,
            &[
                ("number", json!(2), json!(1)),
                ("numberTwo", json!(20), json!(10)),
                ("string", json!("two"), json!("one")),
            ],
        );
        let f2 = change_fragment(uuid, &[("number", json!(3), json!(2)), ("numberTwo", json!(30), json!(20))]);
        let f3 = change_fragment(uuid, &[("number", json!(4), json!(3))]);

        scope.set(uuid, "number", &json!(4)).unwrap();
        scope.set(uuid, "numberTwo", &json!(30)).unwrap();
        scope.set(uuid, "string", &json!("two")).unwrap();

        let cs1 = ChangeSet::new(scope.clone(), vec![f1], false);
        let cs2 = ChangeSet::new(scope.clone(), vec![f2], false);
        let cs3 = ChangeSet::new(scope.clone(), vec![f3], false);

        let queue = ChangeSetQueue::new();
        queue.enqueue(cs1.clone()).unwrap();
        queue.enqueue(cs2.clone()).unwrap();
        queue.enqueue(cs3.clone()).unwrap();

        cs1.revert_on_scope(&queue);
        cs2.revert_on_scope(&queue);
        cs3.revert_on_scope(&queue);

        assert_eq!(scope.get(uuid, "number").unwrap(), crate::value::Value::Int64(1));
        assert_eq!(scope.get(uuid, "numberTwo").unwrap(), crate::value::Value::Int64(10));
        assert_eq!(scope.get(uuid, "string").unwrap(), crate::value::Value::String("one".into()));
        assert_eq!(queue.len(), 0);
    }

    // S5 — partial acceptance.
    #[test]
    fn partial_acceptance_restores_only_rejected_fragment() {
        let mut reg = TypeRegistry::new();
        reg.declare_type("Model").unwrap();
        reg.declare_property("Model", |o| PropertyDescriptor {
            name: "a".to_string(),
            value_kind: ValueKind::Int64,
            is_collection: false,
            default: Json::Null,
            order: o,
        })
        .unwrap();
        reg.declare_property("Model", |o| PropertyDescriptor {
            name: "b".to_string(),
            value_kind: ValueKind::Int64,
            is_collection: false,
            default: Json::Null,
            order: o,
        })
        .unwrap();
        let scope = Scope::new(StdArc::new(reg), "test", 50);
        let obj_a = scope.create_object("Model").unwrap();
        scope.make_root(obj_a).unwrap();
        let obj_b = scope.create_object("Model").unwrap();
        scope.set(obj_a, "a", &json!(100)).unwrap();
        scope.set(obj_b, "b", &json!(200)).unwrap();
        scope.flush_now();

        scope.set(obj_a, "a", &json!(111)).unwrap();
        scope.set(obj_b, "b", &json!(222)).unwrap();

        let fa = change_fragment(obj_a, &[("a", json!(111), json!(100))]);
        let fb = change_fragment(obj_b, &[("b", json!(222), json!(200))]);
        let cs = ChangeSet::new(scope.clone(), vec![fa, fb], false);
        let queue = ChangeSetQueue::new();
        queue.enqueue(cs.clone()).unwrap();

        cs.apply_fragment_replies(
            vec![
                FragmentReply { accepted: true, modifications: None, error: None },
                FragmentReply { accepted: false, modifications: None, error: None },
            ],
            &queue,
        );

        assert_eq!(cs.state(), ChangeSetState::PartiallyReverted);
        assert_eq!(scope.get(obj_a, "a").unwrap(), crate::value::Value::Int64(111));
        assert_eq!(scope.get(obj_b, "b").unwrap(), crate::value::Value::Int64(200));
    }
}
