//! Change-Set Queue (§4.F): the FIFO of outstanding change-sets and the
//! rebase-on-revert reaction that keeps a later change-set's `touches`
//! correct once an earlier one in front of it reverts.

use std::sync::{Arc, Mutex};

use crate::change_set::{ChangeSet, ChangeSetState};
use crate::error::{SyncError, SyncResult};
use crate::events::ChangeSetStateChanged;

pub type AddedListener = Box<dyn FnMut(&ChangeSet) + Send>;
pub type RemovedListener = Box<dyn FnMut(&ChangeSet) + Send>;
pub type StateChangedListener = Box<dyn FnMut(&ChangeSet, &ChangeSetStateChanged) + Send>;

struct QueueInner {
    entries: Vec<ChangeSet>,
    added_listeners: Vec<AddedListener>,
    removed_listeners: Vec<RemovedListener>,
    state_changed_listeners: Vec<StateChangedListener>,
}

/// FIFO of outstanding change-sets (§4.F). Cloneable handle; the reaction
/// to a member's state transition is wired once, at [`ChangeSetQueue::enqueue`]
/// time, via a listener that holds only a [`crate::change_set::WeakChangeSet`]
/// and a `Weak<Mutex<QueueInner>>` — no strong cycle between a queue and
/// the change-sets it holds.
#[derive(Clone)]
pub struct ChangeSetQueue {
    inner: Arc<Mutex<QueueInner>>,
}

impl Default for ChangeSetQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeSetQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueInner {
                entries: Vec::new(),
                added_listeners: Vec::new(),
                removed_listeners: Vec::new(),
                state_changed_listeners: Vec::new(),
            })),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn first(&self) -> Option<ChangeSet> {
        self.inner.lock().unwrap().entries.first().cloned()
    }

    pub fn on_added(&self, listener: AddedListener) {
        self.inner.lock().unwrap().added_listeners.push(listener);
    }

    pub fn on_removed(&self, listener: RemovedListener) {
        self.inner.lock().unwrap().removed_listeners.push(listener);
    }

    pub fn on_state_changed(&self, listener: StateChangedListener) {
        self.inner
            .lock()
            .unwrap()
            .state_changed_listeners
            .push(listener);
    }

    /// §4.F enqueue: reject a change-set already in this queue, append it,
    /// subscribe to its `state_changed`, emit `added`.
    pub fn enqueue(&self, cs: ChangeSet) -> SyncResult<()> {
        {
            let mut guard = self.inner.lock().unwrap();
            if guard.entries.iter().any(|e| e.ptr_eq(&cs)) {
                return Err(SyncError::DuplicateChangeSet);
            }
            guard.entries.push(cs.clone());
            for l in &mut guard.added_listeners {
                l(&cs);
            }
        }

        let weak_cs = cs.downgrade();
        let weak_queue = Arc::downgrade(&self.inner);
        cs.on_state_changed(Box::new(move |event| {
            let (Some(cs), Some(inner)) = (weak_cs.upgrade(), weak_queue.upgrade()) else {
                return;
            };
            let queue = ChangeSetQueue { inner };
            queue.react_to_state_change(&cs, event);
        }));
        Ok(())
    }

    fn position_of(&self, cs: &ChangeSet) -> Option<usize> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .iter()
            .position(|e| e.ptr_eq(cs))
    }

    /// §4.E `revert_on_scope` / `apply_fragment_replies` consult this
    /// before restoring a touched (object, key): if a later change-set in
    /// this queue also touches it, suppress the write — the later set
    /// will carry the authoritative prior value when *it* reverts.
    pub fn is_touched_by_later(&self, cs: &ChangeSet, uuid: uuid::Uuid, key: &str) -> bool {
        let guard = self.inner.lock().unwrap();
        let Some(pos) = guard.entries.iter().position(|e| e.ptr_eq(cs)) else {
            return false;
        };
        guard.entries[pos + 1..].iter().any(|later| later.touches(uuid, key))
    }

    fn react_to_state_change(&self, cs: &ChangeSet, event: &ChangeSetStateChanged) {
        {
            let mut guard = self.inner.lock().unwrap();
            for l in &mut guard.state_changed_listeners {
                l(cs, event);
            }
        }

        match event.new_state {
            ChangeSetState::Completed => {
                self.remove(cs);
            }
            ChangeSetState::Reverted => {
                let successor = self.position_of(cs).and_then(|pos| {
                    self.inner.lock().unwrap().entries.get(pos + 1).cloned()
                });
                if let (Some(successor), Some(baseline)) = (successor, self.first()) {
                    successor.rebase_on_change_set(&baseline);
                }
                self.remove(cs);
            }
            ChangeSetState::PartiallyReverted | ChangeSetState::Syncing => {}
        }
    }

    fn remove(&self, cs: &ChangeSet) {
        let mut guard = self.inner.lock().unwrap();
        let before = guard.entries.len();
        guard.entries.retain(|e| !e.ptr_eq(cs));
        if guard.entries.len() != before {
            for l in &mut guard.removed_listeners {
                l(cs);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::SyncFragment;
    use crate::registry::{PropertyDescriptor, TypeRegistry, ValueKind};
    use crate::scope::Scope;
    use crate::value::Value;
    use serde_json::json;
    use std::sync::Arc as StdArc;

    fn scope_with_root() -> (Scope, uuid::Uuid) {
        let mut reg = TypeRegistry::new();
        reg.declare_type("Model").unwrap();
        reg.declare_property("Model", |o| PropertyDescriptor {
            name: "n".to_string(),
            value_kind: ValueKind::Int64,
            is_collection: false,
            default: json!(null),
            order: o,
        })
        .unwrap();
        let scope = Scope::new(StdArc::new(reg), "test", 50);
        let uuid = scope.create_object("Model").unwrap();
        scope.make_root(uuid).unwrap();
        (scope, uuid)
    }

    #[test]
    fn duplicate_enqueue_rejected() {
        let (scope, uuid) = scope_with_root();
        let mut fragment = SyncFragment::new_change(uuid, "Model");
        fragment.update_value_from_model("n", &Value::Int64(2), &Value::Int64(1));
        let cs = ChangeSet::new(scope, vec![fragment], false);
        let queue = ChangeSetQueue::new();
        queue.enqueue(cs.clone()).unwrap();
        let err = queue.enqueue(cs).unwrap_err();
        assert!(matches!(err, SyncError::DuplicateChangeSet));
    }

    #[test]
    fn completed_change_set_is_removed() {
        let (scope, uuid) = scope_with_root();
        let mut fragment = SyncFragment::new_change(uuid, "Model");
        fragment.update_value_from_model("n", &Value::Int64(2), &Value::Int64(1));
        let cs = ChangeSet::new(scope, vec![fragment], false);
        let queue = ChangeSetQueue::new();
        queue.enqueue(cs.clone()).unwrap();
        assert_eq!(queue.len(), 1);
        cs.apply_fragment_replies(
            vec![crate::message::FragmentReply { accepted: true, modifications: None, error: None }],
            &queue,
        );
        assert_eq!(queue.len(), 0);
    }
}
