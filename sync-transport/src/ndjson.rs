//! Newline-delimited-JSON-over-TCP `Transport` (§6: "JSON messages over an
//! ordered bidirectional transport; newline or length-prefixed framing is
//! transport-defined"). One envelope per line.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};

use sync_core::{Envelope, SyncError, SyncResult, Transport};

/// One side of a newline-delimited-JSON TCP connection. [`NdjsonTransport::connect`]
/// spawns a background read loop that forwards parsed envelopes to the
/// returned channel; the caller drives its own loop over that channel,
/// typically calling `Session::handle_incoming` per envelope, keeping the
/// socket-handling code separate from the pure reconciliation engine it
/// feeds.
pub struct NdjsonTransport {
    writer: AsyncMutex<BufWriter<OwnedWriteHalf>>,
    reconnect_signal: Arc<Notify>,
}

impl NdjsonTransport {
    /// Connect to `addr` and spawn the read loop. Returns the transport
    /// handle plus a channel of successfully-parsed incoming envelopes;
    /// lines that fail to parse are logged and dropped (§7: `MessageParse`
    /// "drops the message").
    pub async fn connect(addr: impl ToSocketAddrs) -> std::io::Result<(Self, mpsc::Receiver<Envelope>)> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already-accepted stream (the server side of a listener
    /// loop uses this directly; `connect` is the client-side convenience).
    pub fn from_stream(stream: TcpStream) -> (Self, mpsc::Receiver<Envelope>) {
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(read_loop(read_half, tx));
        let transport = Self {
            writer: AsyncMutex::new(BufWriter::new(write_half)),
            reconnect_signal: Arc::new(Notify::new()),
        };
        (transport, rx)
    }

    /// A handle a supervising task can `.notified().await` on to learn
    /// that [`Transport::reconnect`] was called, and redial (§5: "the
    /// transport may inject synthetic failure replies"; reconnection
    /// policy itself is the transport's business, not the core's).
    pub fn reconnect_signal(&self) -> Arc<Notify> {
        self.reconnect_signal.clone()
    }
}

async fn read_loop(read_half: tokio::net::tcp::OwnedReadHalf, tx: mpsc::Sender<Envelope>) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Envelope>(&line) {
                    Ok(envelope) => {
                        if tx.send(envelope).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to parse incoming envelope, dropping line");
                    }
                }
            }
            Ok(None) => {
                tracing::info!("transport connection closed by peer");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "transport read error, closing");
                return;
            }
        }
    }
}

#[async_trait]
impl Transport for NdjsonTransport {
    async fn send(&self, envelope: Envelope) -> SyncResult<()> {
        let line = serde_json::to_string(&envelope).map_err(|e| SyncError::MessageParse(e.to_string()))?;
        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| SyncError::Internal(e.into()))?;
        writer.write_all(b"\n").await.map_err(|e| SyncError::Internal(e.into()))?;
        writer.flush().await.map_err(|e| SyncError::Internal(e.into()))?;
        Ok(())
    }

    fn reconnect(&self) {
        tracing::warn!("ndjson transport reconnect requested");
        self.reconnect_signal.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_core::MessageBody;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn round_trips_an_envelope_over_a_real_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            NdjsonTransport::from_stream(stream)
        });

        let (client, _client_rx) = NdjsonTransport::connect(addr).await.unwrap();
        let (_server, mut server_rx) = accept.await.unwrap();

        client
            .send(Envelope::new(
                1,
                MessageBody::ScopeFetch {
                    name: "root".to_string(),
                    params: None,
                },
            ))
            .await
            .unwrap();

        let received = server_rx.recv().await.unwrap();
        assert_eq!(received.index, 1);
        assert!(matches!(received.body, MessageBody::ScopeFetch { .. }));
    }

    #[tokio::test]
    async fn reconnect_notifies_waiters() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            NdjsonTransport::from_stream(stream)
        });
        let (client, _rx) = NdjsonTransport::connect(addr).await.unwrap();
        let _server = accept.await.unwrap();

        let signal = client.reconnect_signal();
        let waiter = tokio::spawn(async move {
            signal.notified().await;
        });
        client.reconnect();
        waiter.await.unwrap();
    }
}
