// WebSocket server: one task per client connection, each running a session
// that answers commands and forwards subscribed events.

use std::sync::Arc;

use futures_util::stream::Stream;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use roundbid_core::events::ScopedEvent;

use crate::app::AppState;
use crate::protocol::ServerMessage;
use crate::session::Session;

/// Frames queued for a single client before the session stalls.
const OUTBOUND_CAPACITY: usize = 256;

/// Bind `127.0.0.1:{port}` and serve clients until the task is cancelled.
pub async fn run(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(format!("127.0.0.1:{port}")).await?;
    serve(listener, state).await
}

/// Accept connections on an already bound listener. Every connection gets
/// its own task, so a slow client never holds up the others.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> anyhow::Result<()> {
    let local_addr = listener.local_addr()?;
    info!("WebSocket server listening on {local_addr}");

    loop {
        let (stream, addr) = listener.accept().await?;
        let addr_str = addr.to_string();
        info!("Accepted TCP connection from {addr_str}");
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            handle_connection(stream, addr_str, state).await;
        });
    }
}

async fn handle_connection(stream: TcpStream, addr: String, state: Arc<AppState>) {
    let ws_stream = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake failed for {addr}: {e}");
            return;
        }
    };

    let (mut write, read) = ws_stream.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_CAPACITY);

    let writer_addr = addr.clone();
    let writer = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if let Err(e) = write.send(Message::Text(text.into())).await {
                warn!("Failed to write to {writer_addr}: {e}");
                break;
            }
        }
        let _ = write.close().await;
    });

    // Subscribe before reading so no event published after the first
    // SUBSCRIBE can slip past this connection.
    let events = state.engine.events().subscribe();
    let _ = process_session(read, &out_tx, &state, events, &addr).await;

    drop(out_tx);
    let _ = writer.await;
    info!("Client {addr} disconnected");
}

/// Drive one client session: answer each text frame in order and forward
/// events whose scope the client subscribed to.
///
/// Generic over the incoming stream so it can be tested with in-memory
/// streams. Returns `Err(())` when the outbound channel is closed.
pub async fn process_session<St>(
    mut incoming: St,
    out: &mpsc::Sender<String>,
    state: &AppState,
    mut events: broadcast::Receiver<ScopedEvent>,
    addr: &str,
) -> Result<(), ()>
where
    St: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let mut session = Session::new();
    let mut events_open = true;

    loop {
        tokio::select! {
            msg = incoming.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let reply = state.handle_text(&mut session, text.as_str());
                    if out.send(reply.to_json()).await.is_err() {
                        return Err(());
                    }
                }
                Some(Ok(Message::Close(_))) => {
                    info!("Client {addr} sent close frame");
                    break;
                }
                Some(Err(e)) => {
                    warn!("WebSocket error from {addr}: {e}");
                    break;
                }
                None => break,
                Some(Ok(_)) => {
                    // Ignore Binary, Ping, Pong, Frame variants.
                }
            },
            event = events.recv(), if events_open => match event {
                Ok(event) => {
                    if !session.is_subscribed(&event.scope) {
                        continue;
                    }
                    debug!("Forwarding {} event to {addr}", event.scope);
                    let frame = ServerMessage::Event { payload: event }.to_json();
                    if out.send(frame).await.is_err() {
                        return Err(());
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!("Client {addr} fell behind and missed {missed} event(s)");
                }
                Err(RecvError::Closed) => events_open = false,
            },
        }
    }
    Ok(())
}
