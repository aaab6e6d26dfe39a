//! Live connection endpoint.
//!
//! `GET /ws` upgrades an authenticated request to a WebSocket carrying JSON
//! [`ClientFrame`]s in and [`ServerFrame`]s out. Messages are never stored
//! here: a client persists through `POST /messages` first and then asks
//! the server to relay the stored record.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use carechat_shared::protocol::{
    ClientFrame, DeliveryReceipt, ErrorNotice, MessageRecord, ReadyInfo, ReceiptStatus,
    ServerFrame, StatusUpdate, TypingNotice, TypingUpdate,
};
use carechat_store::{StoreError, User};

use crate::api::AppState;
use crate::auth::AuthUser;

pub async fn ws_handler(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, user))
}

async fn handle_socket(socket: WebSocket, state: AppState, user: User) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();

    let (conn_id, others) = state.hub.register(&user.id, tx.clone()).await;
    info!(user = %user.id, conn = conn_id, "WebSocket session opened");

    let _ = tx.send(ServerFrame::Ready(ReadyInfo {
        user_id: user.id.clone(),
    }));
    for other in others {
        let _ = tx.send(ServerFrame::UserStatusChange(other));
    }

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match frame.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Failed to encode server frame");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = &mut writer => break,
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => match ClientFrame::from_json(&text) {
                    Ok(frame) => handle_client_frame(&state, &user, &tx, frame).await,
                    Err(e) => {
                        debug!(user = %user.id, error = %e, "Unparseable client frame");
                        reply_error(&tx, "Malformed frame");
                    }
                },
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                // Ping/pong are answered by axum.
                Some(Ok(_)) => {}
            },
        }
    }

    state.hub.unregister(&user.id, conn_id).await;
    writer.abort();
    info!(user = %user.id, conn = conn_id, "WebSocket session closed");
}

fn reply_error(tx: &mpsc::UnboundedSender<ServerFrame>, message: impl Into<String>) {
    let _ = tx.send(ServerFrame::Error(ErrorNotice {
        message: message.into(),
    }));
}

/// Act on one frame from `user`. Problems are answered on `tx` and never
/// close the connection.
pub(crate) async fn handle_client_frame(
    state: &AppState,
    user: &User,
    tx: &mpsc::UnboundedSender<ServerFrame>,
    frame: ClientFrame,
) {
    match frame {
        ClientFrame::SendMessage(record) => relay_message(state, user, tx, record).await,
        ClientFrame::Typing(TypingUpdate {
            recipient_id,
            is_typing,
        }) => {
            if recipient_id == user.id {
                return;
            }
            state
                .hub
                .send_to(
                    &recipient_id,
                    ServerFrame::TypingIndicator(TypingNotice {
                        sender_id: user.id.clone(),
                        is_typing,
                    }),
                )
                .await;
        }
        ClientFrame::MessageDelivered(receipt) => relay_receipt(state, user, tx, receipt).await,
        ClientFrame::UserAway => state.hub.set_away(&user.id, true).await,
        ClientFrame::UserBack => state.hub.set_away(&user.id, false).await,
    }
}

/// Fan a stored message out to its recipient and to the sender's own
/// connections. The stored copy wins over whatever the client sent.
async fn relay_message(
    state: &AppState,
    user: &User,
    tx: &mpsc::UnboundedSender<ServerFrame>,
    record: MessageRecord,
) {
    let stored = match state.db.lock().await.get_message(&record.id) {
        Ok(stored) => stored,
        Err(StoreError::NotFound) => {
            warn!(user = %user.id, msg_id = %record.id, "Broadcast of unknown message");
            reply_error(tx, "Message not found");
            return;
        }
        Err(e) => {
            warn!(error = %e, "Lookup for broadcast failed");
            reply_error(tx, "Message could not be broadcast");
            return;
        }
    };
    if stored.sender_id != user.id {
        warn!(user = %user.id, msg_id = %stored.id, "Broadcast of someone else's message");
        reply_error(tx, "Message not found");
        return;
    }

    let recipient = stored.recipient_id.clone();
    let reached = state
        .hub
        .send_to(&recipient, ServerFrame::NewMessage(stored.clone()))
        .await;
    state
        .hub
        .send_to(&user.id, ServerFrame::NewMessage(stored.clone()))
        .await;
    debug!(msg_id = %stored.id, recipient = %recipient, connections = reached, "Message relayed");
}

async fn relay_receipt(
    state: &AppState,
    user: &User,
    tx: &mpsc::UnboundedSender<ServerFrame>,
    receipt: DeliveryReceipt,
) {
    let stored = match state.db.lock().await.get_message(&receipt.message_id) {
        Ok(stored) => stored,
        Err(e) => {
            debug!(msg_id = %receipt.message_id, error = %e, "Receipt for unknown message");
            reply_error(tx, "Message not found");
            return;
        }
    };
    if stored.recipient_id != user.id {
        reply_error(tx, "Message not found");
        return;
    }

    state
        .hub
        .send_to(
            &stored.sender_id,
            ServerFrame::MessageStatus(StatusUpdate {
                message_id: stored.id,
                status: ReceiptStatus::Delivered,
            }),
        )
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use carechat_shared::protocol::PresenceUpdate;
    use carechat_shared::types::{MessageKind, PresenceStatus, Role, ServerMessageId, UserId};

    use crate::api::tests::test_state;
    use crate::config::ServerConfig;

    struct Peer {
        user: User,
        tx: mpsc::UnboundedSender<ServerFrame>,
        rx: mpsc::UnboundedReceiver<ServerFrame>,
    }

    async fn connect(state: &AppState, id: &str) -> Peer {
        let user = state.db.lock().await.get_user(&UserId::from(id)).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        state.hub.register(&user.id, tx.clone()).await;
        Peer { user, tx, rx }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerFrame>) -> Vec<ServerFrame> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    async fn stored_message(state: &AppState, id: &str, from: &str, to: &str) -> MessageRecord {
        let record = MessageRecord {
            id: ServerMessageId::new(id),
            sender_id: UserId::from(from),
            sender_name: from.to_string(),
            sender_role: Role::Mom,
            recipient_id: UserId::from(to),
            content: "Is the clinic open tomorrow?".into(),
            message_type: MessageKind::Text,
            attachment: None,
            reply_to: None,
            client_ref: None,
            created_at: Utc::now(),
            read: false,
        };
        state.db.lock().await.insert_message(&record).unwrap();
        state.db.lock().await.get_message(&record.id).unwrap()
    }

    #[tokio::test]
    async fn stored_message_reaches_recipient_and_sender() {
        let state = test_state(ServerConfig::default());
        let mut mom = connect(&state, "mom-1").await;
        let mut doc = connect(&state, "doc-1").await;
        drain(&mut mom.rx);

        let stored = stored_message(&state, "m-1", "mom-1", "doc-1").await;
        let mut tampered = stored.clone();
        tampered.content = "something else".into();

        handle_client_frame(&state, &mom.user, &mom.tx, ClientFrame::SendMessage(tampered)).await;

        assert_eq!(drain(&mut doc.rx), vec![ServerFrame::NewMessage(stored.clone())]);
        assert_eq!(drain(&mut mom.rx), vec![ServerFrame::NewMessage(stored)]);
    }

    #[tokio::test]
    async fn unknown_or_foreign_message_is_refused() {
        let state = test_state(ServerConfig::default());
        let mut mom = connect(&state, "mom-1").await;
        let mut doc = connect(&state, "doc-1").await;
        drain(&mut mom.rx);

        let stored = stored_message(&state, "m-2", "doc-1", "mom-1").await;
        handle_client_frame(&state, &mom.user, &mom.tx, ClientFrame::SendMessage(stored.clone()))
            .await;

        let mut ghost = stored;
        ghost.id = ServerMessageId::new("never-stored");
        handle_client_frame(&state, &mom.user, &mom.tx, ClientFrame::SendMessage(ghost)).await;

        let replies = drain(&mut mom.rx);
        assert_eq!(replies.len(), 2);
        assert!(replies.iter().all(|f| matches!(f, ServerFrame::Error(_))));
        assert!(drain(&mut doc.rx).is_empty());
    }

    #[tokio::test]
    async fn typing_is_forwarded_with_the_sender() {
        let state = test_state(ServerConfig::default());
        let mom = connect(&state, "mom-1").await;
        let mut doc = connect(&state, "doc-1").await;

        let frame = ClientFrame::Typing(TypingUpdate {
            recipient_id: UserId::from("doc-1"),
            is_typing: true,
        });
        handle_client_frame(&state, &mom.user, &mom.tx, frame).await;

        assert_eq!(
            drain(&mut doc.rx),
            vec![ServerFrame::TypingIndicator(TypingNotice {
                sender_id: UserId::from("mom-1"),
                is_typing: true,
            })]
        );
    }

    #[tokio::test]
    async fn delivery_receipt_goes_to_the_stored_sender() {
        let state = test_state(ServerConfig::default());
        let mut mom = connect(&state, "mom-1").await;
        let doc = connect(&state, "doc-1").await;
        drain(&mut mom.rx);

        stored_message(&state, "m-3", "mom-1", "doc-1").await;
        let receipt = ClientFrame::MessageDelivered(DeliveryReceipt {
            message_id: ServerMessageId::new("m-3"),
            // Claimed sender is ignored in favour of the stored one.
            sender_id: UserId::from("mw-1"),
        });
        handle_client_frame(&state, &doc.user, &doc.tx, receipt).await;

        assert_eq!(
            drain(&mut mom.rx),
            vec![ServerFrame::MessageStatus(StatusUpdate {
                message_id: ServerMessageId::new("m-3"),
                status: ReceiptStatus::Delivered,
            })]
        );
    }

    #[tokio::test]
    async fn only_the_recipient_may_confirm_delivery() {
        let state = test_state(ServerConfig::default());
        let mut mom = connect(&state, "mom-1").await;
        let mut mw = connect(&state, "mw-1").await;
        drain(&mut mom.rx);
        drain(&mut mw.rx);

        stored_message(&state, "m-4", "mom-1", "doc-1").await;
        let receipt = ClientFrame::MessageDelivered(DeliveryReceipt {
            message_id: ServerMessageId::new("m-4"),
            sender_id: UserId::from("mom-1"),
        });
        handle_client_frame(&state, &mw.user, &mw.tx, receipt).await;

        assert!(drain(&mut mom.rx).is_empty());
        assert!(matches!(drain(&mut mw.rx).as_slice(), [ServerFrame::Error(_)]));
    }

    #[tokio::test]
    async fn away_and_back_reach_other_users() {
        let state = test_state(ServerConfig::default());
        let mut doc = connect(&state, "doc-1").await;
        let mom = connect(&state, "mom-1").await;
        drain(&mut doc.rx);

        handle_client_frame(&state, &mom.user, &mom.tx, ClientFrame::UserAway).await;
        handle_client_frame(&state, &mom.user, &mom.tx, ClientFrame::UserBack).await;

        let status = |status| {
            ServerFrame::UserStatusChange(PresenceUpdate {
                user_id: UserId::from("mom-1"),
                status,
            })
        };
        assert_eq!(
            drain(&mut doc.rx),
            vec![status(PresenceStatus::Away), status(PresenceStatus::Online)]
        );
    }
}
