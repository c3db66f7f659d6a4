use collaboration::{
    CollaborationError, DocumentId, Envelope, Result, SessionHandle, SessionRegistry, SyncMessage,
    UserId,
};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// The session and user a connection speaks for, fixed by its `join`
struct Attached {
    handle: SessionHandle,
    document_id: DocumentId,
    user_id: UserId,
}

pub async fn handle_connection(stream: TcpStream, addr: SocketAddr, registry: Arc<SessionRegistry>) {
    let ws_stream = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };
    debug!(%addr, "websocket connection established");

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (control_tx, mut control_rx) = mpsc::unbounded_channel::<Message>();
    let (peer_tx, mut peer_rx) = mpsc::unbounded_channel::<Envelope>();

    // Session messages and control frames share the socket
    let send_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                Some(envelope) = peer_rx.recv() => match envelope.to_json() {
                    Ok(json) => Message::Text(json),
                    Err(e) => {
                        error!("Failed to serialize message: {}", e);
                        continue;
                    }
                },
                Some(msg) = control_rx.recv() => msg,
                else => break,
            };
            if let Err(e) = ws_sender.send(msg).await {
                debug!("Failed to send message to WebSocket: {}", e);
                break;
            }
        }
    });

    let mut peer_tx = Some(peer_tx);
    let mut attached: Option<Attached> = None;
    let mut closed_cleanly = false;

    while let Some(msg) = ws_receiver.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                warn!(%addr, "WebSocket error: {}", e);
                break;
            }
        };

        match msg {
            Message::Text(text) => match &attached {
                None => match attach(&text, &registry, &mut peer_tx).await {
                    Ok(session) => {
                        info!(
                            %addr,
                            document = %session.document_id,
                            user = %session.user_id,
                            "connection attached"
                        );
                        attached = Some(session);
                    }
                    Err(e) => {
                        warn!(%addr, "join refused: {}", e);
                        let _ = control_tx.send(Message::Close(None));
                        break;
                    }
                },
                Some(session) => {
                    if let Err(e) = forward(session, &text).await {
                        warn!(%addr, "message dropped: {}", e);
                        if matches!(e, CollaborationError::SessionClosed(_)) {
                            break;
                        }
                        let reply = Envelope::from_server(
                            session.document_id,
                            SyncMessage::Error {
                                message: e.to_string(),
                            },
                        );
                        if let Ok(json) = reply.to_json() {
                            let _ = control_tx.send(Message::Text(json));
                        }
                    }
                }
            },
            Message::Ping(data) => {
                let _ = control_tx.send(Message::Pong(data));
            }
            Message::Close(_) => {
                closed_cleanly = true;
                break;
            }
            _ => {}
        }
    }

    if let Some(session) = attached {
        // A dropped connection keeps presence until the heartbeat expires
        let result = if closed_cleanly {
            session
                .handle
                .receive(Envelope::new(
                    session.document_id,
                    session.user_id,
                    SyncMessage::Leave,
                ))
                .await
        } else {
            session.handle.detach(session.user_id).await
        };
        if let Err(e) = result {
            debug!("session already stopped: {}", e);
        }
    }

    send_task.abort();
    debug!(%addr, clean = closed_cleanly, "connection closed");
}

/// The first message must be a `join`
async fn attach(
    text: &str,
    registry: &SessionRegistry,
    peer_tx: &mut Option<mpsc::UnboundedSender<Envelope>>,
) -> Result<Attached> {
    let envelope = Envelope::from_json(text)?;
    let (user, next_seq) = match envelope.message {
        SyncMessage::Join { user, next_seq } => (user, next_seq),
        other => {
            return Err(CollaborationError::InvalidOp(format!(
                "expected join, got {}",
                other.name()
            )))
        }
    };
    if user.id != envelope.sender_id {
        return Err(CollaborationError::Malformed(format!(
            "join for {} sent by {}",
            user.id, envelope.sender_id
        )));
    }
    let peer = peer_tx
        .take()
        .ok_or_else(|| CollaborationError::InvalidOp("connection already joined".to_string()))?;

    let handle = registry.get_or_create(envelope.document_id).await?;
    let user_id = user.id;
    handle.join(user, next_seq, peer).await?;
    Ok(Attached {
        handle,
        document_id: envelope.document_id,
        user_id,
    })
}

async fn forward(session: &Attached, text: &str) -> Result<()> {
    let envelope = Envelope::from_json(text)?;
    if envelope.document_id != session.document_id || envelope.sender_id != session.user_id {
        return Err(CollaborationError::Malformed(format!(
            "connection speaks for {} on {}",
            session.user_id, session.document_id
        )));
    }
    if matches!(envelope.message, SyncMessage::Join { .. }) {
        return Err(CollaborationError::InvalidOp(
            "connection already joined".to_string(),
        ));
    }
    session.handle.receive(envelope).await
}
