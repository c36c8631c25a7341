//! `/ws` observer sessions
//!
//! One task per socket: it announces the session, then interleaves frames
//! queued by the hub with replies to the observer's own messages until
//! either side goes away.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{info_span, Instrument};

use super::hub::NotificationHub;
use super::messages::{ClientMessage, Frame, ServerMessage};
use crate::api::AppState;

/// Upgrade to an alert stream
pub async fn alert_stream(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let hub = Arc::clone(&state.hub);
    ws.on_upgrade(move |socket| observe(socket, hub))
}

type Outbound = SplitSink<WebSocket, Message>;

async fn push(sink: &mut Outbound, frame: Frame) -> Result<(), axum::Error> {
    sink.send(Message::Text(frame.to_string())).await
}

async fn observe(socket: WebSocket, hub: Arc<NotificationHub>) {
    let (mut sink, mut incoming) = socket.split();

    let (session_id, mut frames) = match hub.register().await {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!(error = %e, "Rejected observer session");
            let refusal = ServerMessage::Error {
                message: e.to_string(),
            };
            let _ = push(&mut sink, refusal.to_frame()).await;
            let _ = sink.close().await;
            return;
        }
    };

    let span = info_span!("observer", session_id = %session_id);
    async {
        let hello = ServerMessage::Connected {
            session_id: session_id.clone(),
        };
        if push(&mut sink, hello.to_frame()).await.is_err() {
            return;
        }

        loop {
            tokio::select! {
                frame = frames.recv() => {
                    // None: the hub pruned this session
                    let Some(frame) = frame else { break };
                    if push(&mut sink, frame).await.is_err() {
                        break;
                    }
                }
                message = incoming.next() => {
                    let message = match message {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => {
                            tracing::debug!(error = %e, "WebSocket receive error");
                            break;
                        }
                        None => break,
                    };
                    match reply_to(message) {
                        Reply::Send(frame) => {
                            if push(&mut sink, frame).await.is_err() {
                                break;
                            }
                        }
                        Reply::Nothing => {}
                        Reply::Close => break,
                    }
                }
            }
        }
    }
    .instrument(span)
    .await;

    hub.unregister(&session_id).await;
}

#[derive(Debug)]
enum Reply {
    Send(Frame),
    Nothing,
    Close,
}

/// Answer an observer message; observers only ever ping
fn reply_to(message: Message) -> Reply {
    match message {
        Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Ping) => Reply::Send(ServerMessage::Pong.to_frame()),
            Err(e) => {
                tracing::debug!(error = %e, "Invalid observer message");
                Reply::Send(
                    ServerMessage::Error {
                        message: format!("Invalid message format: {}", e),
                    }
                    .to_frame(),
                )
            }
        },
        Message::Binary(_) => Reply::Send(
            ServerMessage::Error {
                message: "Binary messages not supported".to_string(),
            }
            .to_frame(),
        ),
        // Protocol pings are answered by axum
        Message::Ping(_) | Message::Pong(_) => Reply::Nothing,
        Message::Close(_) => Reply::Close,
    }
}
