//! Per-connection task pair.
//!
//! Each accepted WebSocket is split into a writer task, which drains the
//! connection's outbound queue into frames, and the reader loop running on
//! the accepting task, which decodes client frames and hands them to the
//! router. When the reader stops for any reason, the connection leaves every
//! session it joined. A request rejected by the Auth Guard is answered with an
//! error and then ends the connection.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use protocol::codec::{decode_binary, decode_text};
use protocol::messages::ErrorMessage;
use protocol::{ClientMessage, Encoded, ErrorCode, ServerMessage, WireFormat};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::handshake::Handshake;
use super::GatewaySettings;
use crate::router::{target_session, ConnectionContext, MessageRouter};
use crate::session::{ConnectionId, SessionManagerImpl};

/// How long a closing connection keeps flushing queued messages.
const FLUSH_GRACE: Duration = Duration::from_millis(500);

/// Serves one upgraded connection until the client goes away or `cancel`
/// fires.
pub async fn serve<S>(
    ws: WebSocketStream<S>,
    handshake: Handshake,
    router: Arc<MessageRouter<SessionManagerImpl>>,
    settings: GatewaySettings,
    cancel: CancellationToken,
    connection_id: ConnectionId,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let span = tracing::info_span!(
        "connection",
        connection_id = %connection_id,
        user = %handshake.identity.user_id
    );
    run(ws, handshake, router, settings, cancel, connection_id)
        .instrument(span)
        .await
}

async fn run<S>(
    ws: WebSocketStream<S>,
    handshake: Handshake,
    router: Arc<MessageRouter<SessionManagerImpl>>,
    settings: GatewaySettings,
    cancel: CancellationToken,
    connection_id: String,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, mut stream) = ws.split();
    let (outbound_tx, outbound_rx) = mpsc::channel(settings.connection_queue_capacity);
    tracing::info!("Connection established");

    let writer_stop = CancellationToken::new();
    let writer = tokio::spawn(write_loop(
        sink,
        outbound_rx,
        handshake.format,
        writer_stop.clone(),
        connection_id.clone(),
    ));

    let mut ctx = ConnectionContext::new(handshake.identity, connection_id.clone(), outbound_tx);

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(connection_id = %connection_id, "Connection cancelled, closing");
                break;
            }
            frame = stream.next() => frame,
        };

        let message = match frame {
            Some(Ok(WsMessage::Text(text))) => {
                decode_text::<ClientMessage>(&text, settings.max_message_bytes)
            }
            Some(Ok(WsMessage::Binary(bytes))) => {
                decode_binary::<ClientMessage>(&bytes, settings.max_message_bytes)
            }
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::debug!(connection_id = %connection_id, error = %e, "Transport error");
                break;
            }
        };

        let (reply, fatal) = match message {
            Ok(message) => {
                let session_id = target_session(&message).map(str::to_string);
                match router.route(message, &mut ctx).await {
                    Ok(reply) => (reply, false),
                    Err(e) => {
                        tracing::debug!(
                            connection_id = %connection_id,
                            session_id = ?session_id,
                            error = %e,
                            "Request failed"
                        );
                        let fatal = e.is_fatal();
                        (Some(ServerMessage::Error(e.to_error_message(session_id))), fatal)
                    }
                }
            }
            Err(e) => {
                tracing::debug!(connection_id = %connection_id, error = %e, "Undecodable frame");
                let error = ErrorMessage {
                    code: ErrorCode::InvalidRequest,
                    message: e.to_string(),
                    session_id: None,
                    recoverable: false,
                };
                (Some(ServerMessage::Error(error)), false)
            }
        };

        if let Some(reply) = reply {
            if ctx.outbound.send(reply).await.is_err() {
                break;
            }
        }
        if fatal {
            tracing::info!(connection_id = %connection_id, "Closing connection with invalid credentials");
            break;
        }
    }

    router.disconnect(&mut ctx).await;
    drop(ctx);
    writer_stop.cancel();
    if let Err(e) = writer.await {
        tracing::warn!(connection_id = %connection_id, error = %e, "Writer task failed");
    }
    tracing::info!("Connection closed");
}

async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, WsMessage>,
    mut outbound: mpsc::Receiver<ServerMessage>,
    format: WireFormat,
    stop: CancellationToken,
    connection_id: String,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let message = tokio::select! {
            biased;
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
            _ = stop.cancelled() => {
                // Flush notices still in flight, typically session_closed.
                while let Ok(Some(message)) = tokio::time::timeout(FLUSH_GRACE, outbound.recv()).await {
                    if send(&mut sink, &message, format, &connection_id).await.is_err() {
                        return;
                    }
                }
                break;
            }
        };

        if send(&mut sink, &message, format, &connection_id).await.is_err() {
            return;
        }
    }

    let _ = sink.send(WsMessage::Close(None)).await;
    let _ = sink.close().await;
}

async fn send<S>(
    sink: &mut SplitSink<WebSocketStream<S>, WsMessage>,
    message: &ServerMessage,
    format: WireFormat,
    connection_id: &str,
) -> Result<(), ()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = match format.encode(message) {
        Ok(Encoded::Text(text)) => WsMessage::Text(text),
        Ok(Encoded::Binary(bytes)) => WsMessage::Binary(bytes),
        Err(e) => {
            tracing::error!(connection_id = %connection_id, error = %e, "Failed to encode message");
            return Ok(());
        }
    };

    sink.send(frame).await.map_err(|e| {
        tracing::debug!(connection_id = %connection_id, error = %e, "Failed to send frame");
    })
}
