//! WebSocket session lifecycle: one connected client from upgrade through
//! disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, instrument, warn};

use agora_core::protocol::{parse_client_frame, ClientFrame};
use agora_relay::transport::DEFAULT_WRITE_TIMEOUT;
use agora_relay::{ChannelTransport, Connection, OutboundFrame, TransportKind};

use crate::metrics::{
    WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL, WS_FRAMES_IN_TOTAL,
    WS_HEARTBEAT_TIMEOUTS_TOTAL,
};
use crate::server::AppState;

/// Outbound frames queued per connection before the write timeout applies.
const SEND_QUEUE_CAPACITY: usize = 1024;

/// Run a WebSocket session for a connected client.
///
/// 1. Attaches to the hub, which sends the `connection.established` greeting
/// 2. Forwards relay output: control frames as text, batches as binary
/// 3. Dispatches inbound text frames to the hub
/// 4. Pings on the heartbeat interval and closes unresponsive clients
/// 5. Detaches from the hub on any exit path
#[instrument(skip_all)]
pub async fn run_ws_session(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (transport, outbound_rx) =
        ChannelTransport::new(TransportKind::Native, SEND_QUEUE_CAPACITY, DEFAULT_WRITE_TIMEOUT);
    let id = match state.hub.attach(transport).await {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, "attach refused");
            let _ = ws_tx.send(Message::Close(None)).await;
            return;
        }
    };
    // Attach just registered the handle, so the lookup cannot miss.
    let Some(conn) = state.hub.registry().lookup(&id).await else {
        return;
    };

    info!(connection_id = %id, "client connected");
    metrics::counter!(WS_CONNECTIONS_TOTAL).increment(1);
    metrics::gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    let outbound = tokio::spawn(forward_outbound(
        ws_tx,
        outbound_rx,
        conn.clone(),
        Duration::from_secs(state.config.heartbeat_interval_secs),
        state.config.heartbeat_missed_limit,
    ));

    while let Some(Ok(msg)) = ws_rx.next().await {
        metrics::counter!(WS_FRAMES_IN_TOTAL).increment(1);
        let text = match msg {
            Message::Text(t) => Some(t.to_string()),
            Message::Binary(data) => match std::str::from_utf8(&data) {
                Ok(s) => Some(s.to_owned()),
                Err(_) => {
                    debug!(connection_id = %id, len = data.len(), "non-UTF8 binary frame ignored");
                    None
                }
            },
            Message::Close(_) => {
                info!(connection_id = %id, "client sent close frame");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                conn.mark_alive();
                None
            }
        };
        let Some(text) = text else { continue };

        match parse_client_frame(&text) {
            Ok(ClientFrame::Connect { token }) => {
                match state.authenticator.authenticate(token.as_deref()).await {
                    Some(identity) => {
                        conn.mark_alive();
                        state.hub.authenticate(&id, identity).await;
                    }
                    None => {
                        warn!(connection_id = %id, "authentication rejected");
                        break;
                    }
                }
            }
            Ok(frame) => state.hub.handle_frame(&id, frame).await,
            Err(e) => state.hub.reject_frame(&id, &e).await,
        }
    }

    info!(connection_id = %id, "client disconnected");
    metrics::counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    metrics::gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    outbound.abort();
    state.hub.detach(&id).await;
}

/// Pump relay output to the socket and drive the heartbeat.
///
/// Control frames go out as text, batches as binary. A client silent for
/// `missed_limit` consecutive ping intervals is disconnected. Generic over
/// the sink so the heartbeat can be driven without a live socket.
async fn forward_outbound<S>(
    mut ws_tx: S,
    mut outbound_rx: tokio::sync::mpsc::Receiver<OutboundFrame>,
    conn: Arc<Connection>,
    ping_interval: Duration,
    missed_limit: u32,
) where
    S: futures::Sink<Message> + Unpin,
{
    let mut interval = tokio::time::interval(ping_interval);
    // Skip the immediate first tick
    let _ = interval.tick().await;
    let mut missed: u32 = 0;

    loop {
        tokio::select! {
            frame = outbound_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if ws_tx.send(to_ws_message(frame)).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        // Relay side closed the transport
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            _ = interval.tick() => {
                if conn.check_alive() {
                    missed = 0;
                } else {
                    missed += 1;
                    if missed >= missed_limit {
                        warn!(connection_id = %conn.id, missed, "heartbeat missed, disconnecting");
                        metrics::counter!(WS_HEARTBEAT_TIMEOUTS_TOTAL).increment(1);
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                }
                if ws_tx.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Control frames go out as text, batches as binary.
fn to_ws_message(frame: OutboundFrame) -> Message {
    match frame {
        OutboundFrame::Control(text) => Message::Text(text.into()),
        OutboundFrame::Batch(bytes) => Message::Binary(bytes.into()),
    }
}

#[cfg(test)]
mod tests {
    // Full session behavior needs a live socket and is covered end to end
    // in tests/integration.rs; the frame mapping and heartbeat rules are
    // pinned here against an in-memory sink.

    use super::*;

    use futures::channel::mpsc as sink_mpsc;
    use tokio::sync::mpsc;

    use agora_core::ids::ConnectionId;
    use agora_relay::transport::DEFAULT_WRITE_TIMEOUT;
    use agora_relay::{ChannelTransport, TransportKind};

    const PING_INTERVAL: Duration = Duration::from_secs(30);

    fn forwarder_fixture() -> (
        Arc<Connection>,
        mpsc::Receiver<OutboundFrame>,
        sink_mpsc::UnboundedSender<Message>,
        sink_mpsc::UnboundedReceiver<Message>,
    ) {
        let (transport, outbound_rx) =
            ChannelTransport::new(TransportKind::Native, 16, DEFAULT_WRITE_TIMEOUT);
        let conn = Arc::new(Connection::new(ConnectionId::from("session"), transport));
        // Consume the alive flag set at construction so the first interval
        // starts from a silent peer.
        let _ = conn.check_alive();
        let (ws_tx, ws_rx) = sink_mpsc::unbounded();
        (conn, outbound_rx, ws_tx, ws_rx)
    }

    #[test]
    fn control_frames_are_text_batches_are_binary() {
        let control = to_ws_message(OutboundFrame::Control("{\"type\":\"pong\"}".into()));
        assert!(matches!(control, Message::Text(_)));
        let batch = to_ws_message(OutboundFrame::Batch(vec![0, 91, 93]));
        assert!(matches!(batch, Message::Binary(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_is_closed_after_missed_limit() {
        let (conn, outbound_rx, ws_tx, mut ws_rx) = forwarder_fixture();
        let task = tokio::spawn(forward_outbound(ws_tx, outbound_rx, conn, PING_INTERVAL, 2));

        // First interval: one miss, ping goes out
        assert!(matches!(ws_rx.next().await.unwrap(), Message::Ping(_)));
        // Second interval: the missed limit is reached, the socket closes
        assert!(matches!(ws_rx.next().await.unwrap(), Message::Close(_)));
        assert!(ws_rx.next().await.is_none(), "nothing sent after the close");
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_activity_resets_the_missed_counter() {
        let (conn, outbound_rx, ws_tx, mut ws_rx) = forwarder_fixture();
        let task = tokio::spawn(forward_outbound(
            ws_tx,
            outbound_rx,
            conn.clone(),
            PING_INTERVAL,
            2,
        ));

        // One interval missed
        assert!(matches!(ws_rx.next().await.unwrap(), Message::Ping(_)));
        // A pong lands before the next tick and resets the counter
        conn.mark_alive();
        assert!(matches!(ws_rx.next().await.unwrap(), Message::Ping(_)));
        // Silence again: one miss, then the limit closes the socket
        assert!(matches!(ws_rx.next().await.unwrap(), Message::Ping(_)));
        assert!(matches!(ws_rx.next().await.unwrap(), Message::Close(_)));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn relay_side_close_sends_ws_close() {
        let (conn, outbound_rx, ws_tx, mut ws_rx) = forwarder_fixture();
        let task = tokio::spawn(forward_outbound(
            ws_tx,
            outbound_rx,
            conn.clone(),
            PING_INTERVAL,
            2,
        ));

        conn.transport().close();
        assert!(matches!(ws_rx.next().await.unwrap(), Message::Close(_)));
        task.await.unwrap();
    }
}
