//! An in-memory duplex `Transport` (§2 AMBIENT: "an in-memory duplex
//! implementation for tests"). Two halves exchange envelopes over a pair
//! of `tokio::mpsc` channels with no serialization round-trip, so tests
//! that only care about ordering/reconciliation semantics don't pay for
//! JSON encode/decode or a real socket.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use sync_core::{Envelope, SyncError, SyncResult, Transport};

/// One end of an in-memory duplex. Construct a connected pair with
/// [`MemoryTransport::pair`].
pub struct MemoryTransport {
    outgoing: mpsc::Sender<Envelope>,
    reconnect_count: Arc<AtomicUsize>,
}

impl MemoryTransport {
    /// Build a connected pair: `(client, client_inbox, server, server_inbox)`.
    /// Messages sent through `client` arrive on `server_inbox`, and vice
    /// versa — the caller drives its own receive loop, typically calling
    /// `Session::handle_incoming` per received envelope (§4.G).
    pub fn pair() -> (Self, mpsc::Receiver<Envelope>, Self, mpsc::Receiver<Envelope>) {
        let (client_to_server, server_inbox) = mpsc::channel(256);
        let (server_to_client, client_inbox) = mpsc::channel(256);
        let client = Self {
            outgoing: client_to_server,
            reconnect_count: Arc::new(AtomicUsize::new(0)),
        };
        let server = Self {
            outgoing: server_to_client,
            reconnect_count: Arc::new(AtomicUsize::new(0)),
        };
        (client, client_inbox, server, server_inbox)
    }

    /// Number of times [`Transport::reconnect`] has been called on this
    /// half — tests assert on this for scenario S4 (out-of-order server
    /// message triggers exactly one reconnect).
    pub fn reconnect_count(&self) -> usize {
        self.reconnect_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, envelope: Envelope) -> SyncResult<()> {
        self.outgoing
            .send(envelope)
            .await
            .map_err(|_| SyncError::SessionClosed)
    }

    fn reconnect(&self) {
        self.reconnect_count.fetch_add(1, Ordering::SeqCst);
        tracing::warn!("in-memory transport reconnect requested");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_core::MessageBody;

    #[tokio::test]
    async fn pair_delivers_in_both_directions() {
        let (client, mut client_inbox, server, mut server_inbox) = MemoryTransport::pair();

        client
            .send(Envelope::new(1, MessageBody::Ping { ack: None, resend_missing: None }))
            .await
            .unwrap();
        let received = server_inbox.recv().await.unwrap();
        assert_eq!(received.index, 1);

        server
            .send(Envelope::new(0, MessageBody::Ping { ack: Some(1), resend_missing: None }))
            .await
            .unwrap();
        let received = client_inbox.recv().await.unwrap();
        assert_eq!(received.index, 0);
    }

    #[test]
    fn reconnect_is_counted() {
        let (client, _client_inbox, _server, _server_inbox) = MemoryTransport::pair();
        client.reconnect();
        client.reconnect();
        assert_eq!(client.reconnect_count(), 2);
    }
}
