//! Cross-component scenarios (§8) that need a full `Session` + `Transport`
//! wiring rather than a single module's unit tests. S1/S2/S3/S5/S6 live
//! inline next to the code they exercise (`change_set.rs`, `scope.rs`); this
//! suite covers the scenarios that only make sense at the session boundary.

use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use sync_core::{
    Envelope, FragmentReply, MessageBody, PropertyDescriptor, Scope, Session, SyncFragment,
    SyncResult, Transport, TypeRegistry, ValueKind,
};

/// A `Transport` double that records every envelope it was asked to send
/// and counts `reconnect()` calls, without going through a socket or an
/// mpsc channel — scenarios here only care about what `Session` decided to
/// do, not about delivery.
#[derive(Default)]
struct RecordingTransport {
    sent: std::sync::Mutex<Vec<Envelope>>,
    reconnects: std::sync::atomic::AtomicUsize,
}

#[async_trait::async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, envelope: Envelope) -> SyncResult<()> {
        self.sent.lock().unwrap().push(envelope);
        Ok(())
    }

    fn reconnect(&self) {
        self.reconnects.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}

fn model_registry() -> Arc<TypeRegistry> {
    let mut reg = TypeRegistry::new();
    reg.declare_type("Model").unwrap();
    reg.declare_property("Model", |o| PropertyDescriptor {
        name: "name".to_string(),
        value_kind: ValueKind::String,
        is_collection: false,
        default: json!(null),
        order: o,
    })
    .unwrap();
    Arc::new(reg)
}

// S4 — out-of-order server message triggers exactly one reconnect and
// leaves server_index unchanged.
#[tokio::test]
async fn out_of_order_server_message_triggers_one_reconnect() {
    let transport: Arc<RecordingTransport> = Arc::new(RecordingTransport::default());
    let session = Session::new(transport.clone());

    // Prime server_index to 10 via a sequence of well-ordered pings.
    for i in 1..=10u64 {
        session
            .handle_incoming(Envelope::new(
                i,
                MessageBody::Ping { ack: None, resend_missing: None },
            ))
            .unwrap();
    }
    assert_eq!(session.server_index(), 10);

    let err = session
        .handle_incoming(Envelope::new(
            12,
            MessageBody::Ping { ack: None, resend_missing: None },
        ))
        .unwrap_err();
    assert!(matches!(err, sync_core::SyncError::OutOfOrderMessage { .. }));

    assert_eq!(session.server_index(), 10, "server_index must not advance on a gap");
    assert_eq!(
        transport.reconnects.load(std::sync::atomic::Ordering::SeqCst),
        1,
        "exactly one reconnect for the gap"
    );

    // A duplicate (index <= server_index) is silently discarded, not a
    // second reconnect.
    session
        .handle_incoming(Envelope::new(
            5,
            MessageBody::Ping { ack: None, resend_missing: None },
        ))
        .unwrap();
    assert_eq!(transport.reconnects.load(std::sync::atomic::Ordering::SeqCst), 1);
}

// S7 — idempotence: applying the same ScopeState twice (same index) is a
// duplicate per the message-order gate and dropped, so scope state is
// unchanged by the second delivery.
#[tokio::test]
async fn duplicate_scope_state_message_is_dropped() {
    let transport: Arc<RecordingTransport> = Arc::new(RecordingTransport::default());
    let session = Session::new(transport.clone());

    let registry = model_registry();
    let scope = Scope::new(registry, "root-scope", 50);
    let root = Uuid::new_v4();

    // Wire the scope into the session under index 1 the way `fetch` would,
    // without going through the full open/fetch round-trip (no server
    // double in this test).
    session.handle_incoming(Envelope::reply(
        0,
        0,
        MessageBody::Ping { ack: None, resend_missing: None },
    )).unwrap();

    // Attach manually via a ScopeFetchReply-shaped flow substitute: drive
    // fetch() against a transport that we answer inline.
    let fetch_task = {
        let session = session.clone();
        let scope = scope.clone();
        tokio::spawn(async move { session.fetch(scope).await })
    };
    // The fetch's ScopeFetch envelope is now sitting in `transport.sent`.
    tokio::task::yield_now().await;
    let sent = transport.sent.lock().unwrap().clone();
    let fetch_envelope = sent
        .iter()
        .find(|e| matches!(e.body, MessageBody::ScopeFetch { .. }))
        .expect("fetch envelope sent");
    session
        .handle_incoming(Envelope::reply(
            1,
            fetch_envelope.index,
            MessageBody::ScopeFetchReply { scope_index: Some(1), error: None },
        ))
        .unwrap();
    let scope_index = fetch_task.await.unwrap().unwrap();
    assert_eq!(scope_index, 1);

    let fragment = SyncFragment::new_add(
        root,
        "Model",
        &std::collections::BTreeMap::from([(
            "name".to_string(),
            sync_core::Value::String("first".to_string()),
        )]),
    );

    session
        .handle_incoming(Envelope::new(
            2,
            MessageBody::ScopeState {
                scope_index: 1,
                root_uuid: root,
                fragments: vec![fragment.clone()],
            },
        ))
        .unwrap();
    assert_eq!(scope.get(root, "name").unwrap(), sync_core::Value::String("first".to_string()));

    // Mutate locally in a way the second (duplicate) ScopeState would have
    // clobbered if it were re-applied.
    scope.set(root, "name", &json!("second")).unwrap();

    // Redeliver the *same* index: the session's ordering gate treats this
    // as a duplicate and drops it without touching the scope.
    session
        .handle_incoming(Envelope::new(
            2,
            MessageBody::ScopeState {
                scope_index: 1,
                root_uuid: root,
                fragments: vec![fragment],
            },
        ))
        .unwrap();

    assert_eq!(scope.get(root, "name").unwrap(), sync_core::Value::String("second".to_string()));
}

// End-to-end: a local mutation flows through Session::dispatch into a
// sent ScopeSync, and a ScopeSyncReply rejecting the fragment reverts the
// value on the scope.
#[tokio::test]
async fn local_mutation_round_trips_to_revert_on_rejection() {
    let transport: Arc<RecordingTransport> = Arc::new(RecordingTransport::default());
    let session = Session::new(transport.clone());

    let registry = model_registry();
    let scope = Scope::new(registry, "root-scope", 50);
    let root = scope.create_object("Model").unwrap();
    scope.make_root(root).unwrap();
    scope.flush_now(); // drop the root's own Add, out of band for this test

    let fetch_task = {
        let session = session.clone();
        let scope = scope.clone();
        tokio::spawn(async move { session.fetch(scope).await })
    };
    tokio::task::yield_now().await;
    let fetch_envelope = {
        let sent = transport.sent.lock().unwrap();
        sent.iter()
            .find(|e| matches!(e.body, MessageBody::ScopeFetch { .. }))
            .unwrap()
            .clone()
    };
    session
        .handle_incoming(Envelope::reply(
            1,
            fetch_envelope.index,
            MessageBody::ScopeFetchReply { scope_index: Some(7), error: None },
        ))
        .unwrap();
    fetch_task.await.unwrap().unwrap();

    scope.set(root, "name", &json!("mutated")).unwrap();
    scope.flush_now();
    // The scope-changes listener spawns a task to dispatch the change-set;
    // give it a turn to run.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    assert_eq!(session.queue().len(), 1, "local change-set enqueued before send");

    let sync_envelope = {
        let sent = transport.sent.lock().unwrap();
        sent.iter()
            .find(|e| matches!(e.body, MessageBody::ScopeSync { .. }))
            .unwrap()
            .clone()
    };

    session
        .handle_incoming(Envelope::reply(
            2,
            sync_envelope.index,
            MessageBody::ScopeSyncReply {
                fragment_replies: vec![FragmentReply { accepted: false, modifications: None, error: None }],
            },
        ))
        .unwrap();

    assert_eq!(
        scope.get(root, "name").unwrap(),
        sync_core::Value::Null,
        "rejection reverts to the pre-mutation value"
    );
    assert_eq!(session.queue().len(), 0, "reverted change-set leaves the queue");
}
