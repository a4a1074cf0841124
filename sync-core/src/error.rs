//! Error taxonomy for the sync core (§7).
//!
//! Every fallible path returns [`SyncError`]. [`SyncError::kind`] buckets a
//! variant into the four families the spec distinguishes — validation,
//! protocol, reconciliation, fatal — so callers can act on the bucket
//! without matching every variant by hand.

use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Protocol,
    Reconciliation,
    Fatal,
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    // ── Validation ──
    #[error("type mismatch on property '{property}': expected {expected}, got {actual}")]
    TypeMismatch {
        property: String,
        expected: String,
        actual: String,
    },

    #[error("invalid value for property '{property}': {reason}")]
    ValueInvalid { property: String, reason: String },

    #[error("'{value}' is not a member of enum '{enum_name}'")]
    EnumInvalid { enum_name: String, value: String },

    #[error("reference(s) not found: {0:?}")]
    RefNotFound(Vec<Uuid>),

    #[error("'{0}' is not a declared property")]
    UnknownProperty(String),

    #[error("'{0}' is not a declared type")]
    UnknownType(String),

    #[error("type '{0}' is already registered")]
    DuplicateType(String),

    #[error("property '{property}' is already declared on type '{type_name}'")]
    DuplicateProperty { type_name: String, property: String },

    #[error("object {a} and object {b} belong to different scopes")]
    CrossScope { a: Uuid, b: Uuid },

    // ── Protocol ──
    #[error("message index {got} out of order, expected {expected}")]
    OutOfOrderMessage { expected: u64, got: u64 },

    #[error("failed to parse message: {0}")]
    MessageParse(String),

    #[error("session is closed")]
    SessionClosed,

    #[error("scope at index {0} is not attached to this session")]
    ScopeNotAttached(u32),

    // ── Reconciliation ──
    #[error("change-set carried {fragments} fragments but the reply had {replies}")]
    FragmentMismatch { fragments: usize, replies: usize },

    #[error("authority rejected the change: {0}")]
    ServerRejected(String),

    #[error("change-set is already enqueued")]
    DuplicateChangeSet,

    // ── Fatal ──
    #[error("scope {0} integrity lost after apply — further operations refused")]
    ScopeIntegrityLost(Uuid),

    #[error("internal: {0}")]
    Internal(#[from] anyhow::Error),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        use SyncError::*;
        match self {
            TypeMismatch { .. }
            | ValueInvalid { .. }
            | EnumInvalid { .. }
            | RefNotFound(_)
            | UnknownProperty(_)
            | UnknownType(_)
            | DuplicateType(_)
            | DuplicateProperty { .. }
            | CrossScope { .. } => ErrorKind::Validation,

            OutOfOrderMessage { .. }
            | MessageParse(_)
            | SessionClosed
            | ScopeNotAttached(_) => ErrorKind::Protocol,

            FragmentMismatch { .. } | ServerRejected(_) | DuplicateChangeSet => {
                ErrorKind::Reconciliation
            }

            ScopeIntegrityLost(_) => ErrorKind::Fatal,

            Internal(_) => ErrorKind::Fatal,
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
