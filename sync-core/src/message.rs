//! Wire protocol: the `Message` sum type transport implementations frame
//! and deliver, plus the [`Transport`] boundary [`crate::session::Session`]
//! sends through. Physically defined here (not in `sync-transport`)
//! because `Session` is the only component that constructs and dispatches
//! messages; `sync-transport` depends on this crate and supplies concrete
//! `Transport` impls, the trait defined next to the engine that calls it
//! rather than next to any one backend.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use uuid::Uuid;

use crate::error::SyncResult;
use crate::fragment::SyncFragment;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub message: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
}

impl WireError {
    pub fn new(message: impl Into<String>, error_type: Option<&str>) -> Self {
        Self {
            message: message.into(),
            error_type: error_type.map(str::to_string),
        }
    }
}

/// One verdict per fragment in a `ScopeSyncReply` (§4.H contract).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FragmentReply {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modifications: Option<std::collections::BTreeMap<String, Json>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

/// The body of a wire message, externally tagged by `type` (§9: "replace
/// `util.inherits`-style subclassing with a single `Message` sum type").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MessageBody {
    SessionCreate {
        version: String,
    },
    SessionCreateReply {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<WireError>,
    },
    ScopeFetch {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Json>,
    },
    ScopeFetchReply {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scope_index: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<WireError>,
    },
    ScopeState {
        #[serde(rename = "scopeIndex")]
        scope_index: u32,
        #[serde(rename = "rootUUID")]
        root_uuid: Uuid,
        fragments: Vec<SyncFragment>,
    },
    ScopeSync {
        #[serde(rename = "scopeIndex")]
        scope_index: u32,
        atomic: bool,
        fragments: Vec<SyncFragment>,
    },
    ScopeSyncReply {
        fragment_replies: Vec<FragmentReply>,
    },
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resend_missing: Option<bool>,
    },
}

/// The full wire envelope: every message carries `index`; replies
/// additionally carry `replyTo` (§6). `index == 0` on a server-originated
/// message means "not ordered" and bypasses the `server_index` gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub index: u64,
    #[serde(rename = "replyTo", default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<u64>,
    #[serde(flatten)]
    pub body: MessageBody,
}

impl Envelope {
    pub fn new(index: u64, body: MessageBody) -> Self {
        Self {
            index,
            reply_to: None,
            body,
        }
    }

    pub fn reply(index: u64, reply_to: u64, body: MessageBody) -> Self {
        Self {
            index,
            reply_to: Some(reply_to),
            body,
        }
    }
}

/// The transport boundary the core consumes (§1: "treated as an external
/// collaborator, specified only by the interface the core consumes from
/// it"). Framing, reconnect policy, and keepalive all live on the other
/// side of this trait, in `sync-transport`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one envelope. Resolves once the transport has accepted the
    /// envelope for delivery — not once a reply has arrived; reply
    /// correlation happens at the [`crate::session::Session`] layer via
    /// `replyTo`.
    async fn send(&self, envelope: Envelope) -> SyncResult<()>;

    /// Signal that the session detected a protocol violation (§4.G,
    /// `OutOfOrderMessage`) and the transport should drop and re-establish
    /// its connection. Fire-and-forget: the core does not wait on
    /// reconnection completing.
    fn reconnect(&self);
}
