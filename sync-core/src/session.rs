//! Session (§4.G): mints monotonically increasing outgoing message
//! indices, orders incoming server messages, routes them by scope index,
//! and dispatches authority replies to the [`crate::change_set::ChangeSet`]
//! they answer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::change_set::ChangeSet;
use crate::error::{SyncError, SyncResult};
use crate::events::ScopeChanges;
use crate::message::{Envelope, FragmentReply, MessageBody, Transport, WireError};
use crate::queue::ChangeSetQueue;
use crate::scope::Scope;

struct SessionInner {
    token: Option<String>,
    server_index: u64,
    next_message_index: u64,
    scopes: HashMap<u32, Scope>,
    scope_index_by_uuid: HashMap<Uuid, u32>,
    /// `changes` subscription id per attached scope (§4.G item 5), so
    /// `close` can unsubscribe rather than leaving the scope holding a
    /// callback into a dead session.
    changes_subscriptions: HashMap<u32, u64>,
    pending_fetch: HashMap<u64, oneshot::Sender<SyncResult<u32>>>,
    pending_create: HashMap<u64, oneshot::Sender<SyncResult<String>>>,
    pending_sync: HashMap<u64, ChangeSet>,
    closed: bool,
}

impl SessionInner {
    fn next_index(&mut self) -> u64 {
        self.next_message_index += 1;
        self.next_message_index
    }
}

/// Cloneable handle over the session's state; cheap to move into the
/// `tokio::spawn`ed tasks that drive scope-change flushes and awaited
/// replies (§5 AMBIENT: `Arc<Mutex<Inner>>`, no lock held across an
/// `.await`).
#[derive(Clone)]
pub struct Session {
    inner: Arc<Mutex<SessionInner>>,
    transport: Arc<dyn Transport>,
    queue: ChangeSetQueue,
}

impl Session {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SessionInner {
                token: None,
                server_index: 0,
                next_message_index: 0,
                scopes: HashMap::new(),
                scope_index_by_uuid: HashMap::new(),
                changes_subscriptions: HashMap::new(),
                pending_fetch: HashMap::new(),
                pending_create: HashMap::new(),
                pending_sync: HashMap::new(),
                closed: false,
            })),
            transport,
            queue: ChangeSetQueue::new(),
        }
    }

    pub fn queue(&self) -> &ChangeSetQueue {
        &self.queue
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    pub fn token(&self) -> Option<String> {
        self.inner.lock().unwrap().token.clone()
    }

    pub fn server_index(&self) -> u64 {
        self.inner.lock().unwrap().server_index
    }

    /// Send `SessionCreate` and await the token (§6). Session creation and
    /// authentication themselves are out of scope (§1); this just wires
    /// the one message pair the core's `Session` needs to move past it.
    pub async fn open(&self, version: impl Into<String>) -> SyncResult<String> {
        let (tx, rx) = oneshot::channel();
        let index = {
            let mut guard = self.inner.lock().unwrap();
            if guard.closed {
                return Err(SyncError::SessionClosed);
            }
            let idx = guard.next_index();
            guard.pending_create.insert(idx, tx);
            idx
        };
        self.transport
            .send(Envelope::new(
                index,
                MessageBody::SessionCreate { version: version.into() },
            ))
            .await?;
        let token = rx.await.map_err(|_| SyncError::SessionClosed)??;
        self.inner.lock().unwrap().token = Some(token.clone());
        Ok(token)
    }

    /// §4.G `fetch(scope)`: send `ScopeFetch`, and on a successful reply
    /// record `scope_index` and subscribe to the scope's `changes`
    /// notification so future local mutations sync automatically.
    pub async fn fetch(&self, scope: Scope) -> SyncResult<u32> {
        let (tx, rx) = oneshot::channel();
        let index = {
            let mut guard = self.inner.lock().unwrap();
            if guard.closed {
                return Err(SyncError::SessionClosed);
            }
            let idx = guard.next_index();
            guard.pending_fetch.insert(idx, tx);
            idx
        };
        self.transport
            .send(Envelope::new(
                index,
                MessageBody::ScopeFetch {
                    name: scope.name(),
                    params: None,
                },
            ))
            .await?;
        let scope_index = rx.await.map_err(|_| SyncError::SessionClosed)??;

        {
            let mut guard = self.inner.lock().unwrap();
            guard.scopes.insert(scope_index, scope.clone());
            guard.scope_index_by_uuid.insert(scope.uuid(), scope_index);
        }
        self.attach_scope(scope_index, scope);
        Ok(scope_index)
    }

    fn attach_scope(&self, scope_index: u32, scope: Scope) {
        let session = self.clone();
        let subscription = scope.on_changes(Box::new(move |changes: &ScopeChanges| {
            let session = session.clone();
            let changes = changes.clone();
            tokio::spawn(async move {
                session.dispatch_local_change_set(scope_index, changes).await;
            });
        }));
        self.inner
            .lock()
            .unwrap()
            .changes_subscriptions
            .insert(scope_index, subscription);
    }

    /// Data flow step "D builds a change-set → G wraps it in a sync
    /// message → transport" (§2). The change-set is enqueued *before* the
    /// transport send (§5 ordering guarantee), so concurrent local edits
    /// that follow land behind it in the queue. Checked against `closed`
    /// before either happens, so a flush that lands after `close()` never
    /// leaves an orphan change-set in the queue.
    async fn dispatch_local_change_set(&self, scope_index: u32, changes: ScopeChanges) {
        let scope = {
            let guard = self.inner.lock().unwrap();
            if guard.closed {
                return;
            }
            guard.scopes.get(&scope_index).cloned()
        };
        let Some(scope) = scope else {
            tracing::warn!(scope_index, "change-set for unattached scope, dropping");
            return;
        };

        let cs = ChangeSet::new(scope, changes.fragments.clone(), changes.atomic);
        if let Err(e) = self.queue.enqueue(cs.clone()) {
            tracing::warn!(error = %e, "failed to enqueue local change-set");
            return;
        }

        let index = {
            let mut guard = self.inner.lock().unwrap();
            if guard.closed {
                return;
            }
            let idx = guard.next_index();
            guard.pending_sync.insert(idx, cs.clone());
            idx
        };

        let envelope = Envelope::new(
            index,
            MessageBody::ScopeSync {
                scope_index,
                atomic: changes.atomic,
                fragments: changes.fragments,
            },
        );
        if let Err(e) = self.transport.send(envelope).await {
            tracing::warn!(error = %e, "failed to send sync message, reverting change-set");
            self.inner.lock().unwrap().pending_sync.remove(&index);
            cs.revert_on_scope(&self.queue);
        }
    }

    /// §4.G incoming dispatch. Enforces the `server_index` ordering gate
    /// (§8 property 4) before routing by message type.
    pub fn handle_incoming(&self, envelope: Envelope) -> SyncResult<()> {
        {
            let mut guard = self.inner.lock().unwrap();
            if guard.closed {
                return Err(SyncError::SessionClosed);
            }
            if envelope.index != 0 {
                if envelope.index <= guard.server_index {
                    return Ok(());
                }
                if envelope.index != guard.server_index + 1 {
                    let expected = guard.server_index + 1;
                    drop(guard);
                    self.transport.reconnect();
                    return Err(SyncError::OutOfOrderMessage {
                        expected,
                        got: envelope.index,
                    });
                }
                guard.server_index = envelope.index;
            }
        }

        match envelope.body {
            MessageBody::SessionCreateReply { session_token, error } => {
                self.resolve_create(envelope.reply_to, session_token, error);
            }
            MessageBody::ScopeFetchReply { scope_index, error } => {
                self.resolve_fetch(envelope.reply_to, scope_index, error);
            }
            MessageBody::ScopeSyncReply { fragment_replies } => {
                self.resolve_sync(envelope.reply_to, fragment_replies);
            }
            MessageBody::ScopeState {
                scope_index,
                root_uuid,
                fragments,
            } => {
                self.apply_to_scope(scope_index, |scope| {
                    scope.apply_sync_fragments_with_root(root_uuid, fragments)
                });
            }
            MessageBody::ScopeSync {
                scope_index,
                fragments,
                ..
            } => {
                self.apply_to_scope(scope_index, |scope| {
                    scope.apply_sync_fragments(fragments, true)
                });
            }
            MessageBody::Ping { .. } => {}
            MessageBody::SessionCreate { .. } | MessageBody::ScopeFetch { .. } => {
                tracing::warn!("client-originated message type received by client session, ignoring");
            }
        }
        Ok(())
    }

    fn apply_to_scope(&self, scope_index: u32, f: impl FnOnce(&Scope) -> SyncResult<()>) {
        let scope = {
            let guard = self.inner.lock().unwrap();
            guard.scopes.get(&scope_index).cloned()
        };
        let Some(scope) = scope else {
            tracing::warn!(scope_index, "message for unattached scope index, dropping");
            return;
        };
        if let Err(e) = f(&scope) {
            tracing::warn!(scope_index, error = %e, "remote apply failed");
        }
    }

    fn resolve_create(&self, reply_to: Option<u64>, token: Option<String>, error: Option<WireError>) {
        let Some(reply_to) = reply_to else { return };
        let Some(tx) = self.inner.lock().unwrap().pending_create.remove(&reply_to) else {
            return;
        };
        let result = match (token, error) {
            (Some(token), _) => Ok(token),
            (None, Some(e)) => Err(SyncError::ServerRejected(e.message)),
            (None, None) => Err(SyncError::ServerRejected("missing sessionToken".to_string())),
        };
        let _ = tx.send(result);
    }

    fn resolve_fetch(&self, reply_to: Option<u64>, scope_index: Option<u32>, error: Option<WireError>) {
        let Some(reply_to) = reply_to else { return };
        let Some(tx) = self.inner.lock().unwrap().pending_fetch.remove(&reply_to) else {
            return;
        };
        let result = match (scope_index, error) {
            (Some(idx), _) => Ok(idx),
            (None, Some(e)) => Err(SyncError::ServerRejected(e.message)),
            (None, None) => Err(SyncError::ServerRejected("missing scopeIndex".to_string())),
        };
        let _ = tx.send(result);
    }

    fn resolve_sync(&self, reply_to: Option<u64>, fragment_replies: Vec<FragmentReply>) {
        let Some(reply_to) = reply_to else { return };
        let Some(cs) = self.inner.lock().unwrap().pending_sync.remove(&reply_to) else {
            return;
        };
        cs.apply_fragment_replies(fragment_replies, &self.queue);
    }

    /// §4.G `close`: subsequent fetches/opens fail with `SessionClosed`;
    /// in-flight pending replies are resolved as closed rather than left
    /// to hang; every scope's `changes` subscription from `fetch` is torn
    /// down so a scope outliving the session doesn't keep dispatching
    /// local edits into it (item 5).
    pub fn close(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.closed = true;
        for (_, tx) in guard.pending_fetch.drain() {
            let _ = tx.send(Err(SyncError::SessionClosed));
        }
        for (_, tx) in guard.pending_create.drain() {
            let _ = tx.send(Err(SyncError::SessionClosed));
        }
        for (scope_index, subscription) in guard.changes_subscriptions.drain() {
            if let Some(scope) = guard.scopes.get(&scope_index) {
                scope.remove_changes_listener(subscription);
            }
        }
        // In-flight change-sets remain queued (§5 Cancellation): the
        // transport is responsible for signalling their loss, at which
        // point the caller reverts them explicitly.
    }
}
