//! A minimal authority-side demo server, wiring `NdjsonTransport` to a
//! `sync_authority::ConcernRegistry` with an accept-everything default
//! concern: parse a CLI arg, set up `tracing_subscriber`, accept-loop,
//! hand each connection to the pure engine. Not part of the library
//! surface — a demonstration that the three crates compose into a
//! working process, nothing more.

use std::sync::Arc;

use sync_authority::{ConcernRegistry, DefaultVerdict, FragmentWriter};
use sync_core::{Envelope, MessageBody, Transport};
use sync_transport::NdjsonTransport;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let addr = parse_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "sync demo authority listening");

    let registry = Arc::new(ConcernRegistry::new(DefaultVerdict::Accept));

    loop {
        let (stream, peer) = listener.accept().await?;
        tracing::info!(%peer, "accepted connection");
        let registry = registry.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, registry).await {
                tracing::warn!(error = %e, %peer, "connection ended with error");
            }
        });
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    registry: Arc<ConcernRegistry>,
) -> anyhow::Result<()> {
    let (transport, mut inbox) = NdjsonTransport::from_stream(stream);
    let mut next_index: u64 = 0;
    let mut scope_index_counter: u32 = 0;
    let scope_uuid = Uuid::new_v4();

    while let Some(envelope) = inbox.recv().await {
        let reply = match envelope.body {
            MessageBody::SessionCreate { .. } => {
                next_index += 1;
                Some(Envelope::reply(
                    next_index,
                    envelope.index,
                    MessageBody::SessionCreateReply {
                        session_token: Some(Uuid::new_v4().to_string()),
                        error: None,
                    },
                ))
            }
            MessageBody::ScopeFetch { name, .. } => {
                scope_index_counter += 1;
                tracing::info!(scope = %name, index = scope_index_counter, "scope fetched");
                next_index += 1;
                Some(Envelope::reply(
                    next_index,
                    envelope.index,
                    MessageBody::ScopeFetchReply {
                        scope_index: Some(scope_index_counter),
                        error: None,
                    },
                ))
            }
            MessageBody::ScopeSync { fragments, .. } => {
                let fragment_replies = registry
                    .apply_sync_fragments_for_scope(scope_uuid, &fragments)
                    .await;
                next_index += 1;
                Some(Envelope::reply(
                    next_index,
                    envelope.index,
                    MessageBody::ScopeSyncReply { fragment_replies },
                ))
            }
            MessageBody::Ping { .. } => None,
            other => {
                tracing::warn!(?other, "unhandled message type in demo authority");
                None
            }
        };

        if let Some(reply) = reply {
            transport.send(reply).await?;
        }
    }
    Ok(())
}

fn parse_addr() -> String {
    std::env::args()
        .collect::<Vec<_>>()
        .windows(2)
        .find(|w| w[0] == "--addr")
        .map(|w| w[1].clone())
        .or_else(|| std::env::var("SYNC_DEMO_ADDR").ok())
        .unwrap_or_else(|| "127.0.0.1:7878".to_string())
}
