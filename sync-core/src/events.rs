//! Typed notification payloads for the event-emitter points the spec calls
//! out in §9: "give each observable a typed callback slot" rather than a
//! string-keyed event registry.

use uuid::Uuid;

use crate::change_set::ChangeSetState;
use crate::value::Value;

/// Emitted synchronously by [`crate::scope::Scope`] whenever a property of
/// an in-scope object changes (§4.B: "every effective mutation emits a
/// `key_changed` event").
#[derive(Debug, Clone)]
pub struct KeyChanged {
    pub object: Uuid,
    pub key: String,
    pub new: Value,
    pub prev: Value,
}

/// Emitted when a reference collection gains or loses an element (§4.B).
#[derive(Debug, Clone)]
pub struct CollectionChanged {
    pub object: Uuid,
    pub key: String,
    pub added: Vec<Value>,
    pub removed: Vec<Value>,
}

#[derive(Debug, Clone, Copy)]
pub enum ScopeMembership {
    Attached,
    Detached,
}

#[derive(Debug, Clone)]
pub struct ScopeMembershipChanged {
    pub object: Uuid,
    pub membership: ScopeMembership,
}

/// Emitted by a [`crate::scope::Scope`] when its change timer flushes a
/// non-empty pending batch (§4.D).
#[derive(Debug, Clone)]
pub struct ScopeChanges {
    pub scope: Uuid,
    pub fragments: Vec<crate::fragment::SyncFragment>,
    pub atomic: bool,
}

/// Emitted by a [`crate::change_set::ChangeSet`] on every state transition
/// (§4.E).
#[derive(Debug, Clone)]
pub struct ChangeSetStateChanged {
    pub new_state: ChangeSetState,
}
