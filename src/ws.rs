//! NIP-01 WebSocket endpoint.

use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{relay::Relay, session::Session};

/// Router serving the relay protocol at `path`.
pub fn router(path: &str, relay: Arc<Relay>) -> Router {
    Router::new().route(path, get(handler)).with_state(relay)
}

/// Start a WebSocket server speaking the relay protocol at `path`.
pub async fn serve_ws(
    addr: SocketAddr,
    path: &str,
    relay: Arc<Relay>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, path, "websocket listening");
    axum::serve(listener, router(path, relay).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Handle the HTTP upgrade and spawn the connection processor.
async fn handler(ws: WebSocketUpgrade, State(relay): State<Arc<Relay>>) -> impl IntoResponse {
    ws.on_upgrade(|socket| async move { process(socket, relay).await })
}

/// Run one connection: a read/dispatch loop on this task and a writer task
/// that owns the socket's sending half.
async fn process(socket: WebSocket, relay: Arc<Relay>) {
    let (mut sink, mut stream) = socket.split();
    let (mut session, mut outbound) = relay.connect();
    let span = info_span!("conn", id = session.id());

    let writer = tokio::spawn(
        async move {
            while let Some(msg) = outbound.recv().await {
                if let Err(e) = sink.send(Message::Text(msg.encode())).await {
                    debug!(error = %e, "write failed");
                    break;
                }
            }
        }
        .instrument(span.clone()),
    );

    async {
        debug!("connected");
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    if session.handle_frame(&text).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "read failed");
                    break;
                }
            }
        }
        teardown(&mut session, writer).await;
    }
    .instrument(span)
    .await;
}

/// Stop the writer before closing the session so nothing reaches the socket
/// once teardown has begun.
async fn teardown(session: &mut Session, writer: JoinHandle<()>) {
    writer.abort();
    let _ = writer.await;
    session.close();
}
