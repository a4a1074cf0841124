//! sync-core: the typed object tree, scope change tracker, change-set
//! queue, session reconciliation loop, and wire protocol for bidirectional
//! model synchronization. No network I/O lives here — see `sync-transport`
//! for concrete `Transport` implementations and `sync-authority` for the
//! server-side write-concern contract.

pub mod change_set;
pub mod error;
pub mod events;
pub mod fragment;
pub mod message;
pub mod object;
pub mod queue;
pub mod registry;
pub mod scope;
pub mod session;
pub mod value;

pub use change_set::{ChangeSet, ChangeSetState, WeakChangeSet};
pub use error::{ErrorKind, SyncError, SyncResult};
pub use events::{
    ChangeSetStateChanged, CollectionChanged, KeyChanged, ScopeChanges, ScopeMembership,
    ScopeMembershipChanged,
};
pub use fragment::{FragmentType, PropertyMap, SyncFragment};
pub use message::{Envelope, FragmentReply, MessageBody, Transport, WireError};
pub use object::{ChangeListener, CollectionListener};
pub use queue::ChangeSetQueue;
pub use registry::{
    PropertyDescriptor, ProcedureDescriptor, TypeDescriptor, TypeRegistry, ValueKind,
};
pub use scope::Scope;
pub use session::Session;
pub use value::{EnumDescriptor, Value};
