use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{Method, StatusCode},
    routing::{delete, get, patch, post},
    Json, Router,
};
use chrono::{SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use carechat_shared::constants::{API_PREFIX, DEFAULT_HISTORY_PAGE, WS_PATH};
use carechat_shared::protocol::{
    ApiResponse, ConversationSummary, Counterparty, DeletedMessage, MessageRecord,
    SendMessageRequest, ServerFrame, UnreadCounts,
};
use carechat_shared::types::{ConversationKey, Role, ServerMessageId, UserId};
use carechat_store::{Database, StoreError};

use crate::auth::AuthUser;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::hub::Hub;
use crate::rate_limit::RateLimiter;
use crate::ws;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Mutex<Database>>,
    pub hub: Hub,
    pub rate_limiter: RateLimiter,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(db: Database, config: ServerConfig) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            hub: Hub::new(),
            rate_limiter: RateLimiter::new(config.message_rate, config.message_burst),
            config: Arc::new(config),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    let chat = Router::new()
        .route("/conversations", get(list_conversations))
        .route(
            "/conversations/:counterparty_id/messages",
            get(conversation_messages),
        )
        .route("/conversations/:counterparty_id/read", patch(mark_read))
        .route("/messages", post(send_message))
        .route("/messages/:message_id", delete(delete_message))
        .route("/unread-count", get(unread_count))
        .route("/users", get(list_users));

    Router::new()
        .route("/health", get(health_check))
        .route(WS_PATH, get(ws::ws_handler))
        .nest(API_PREFIX, chat)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ServerError>;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<u32>,
    offset: Option<u32>,
}

#[derive(Deserialize)]
struct UsersQuery {
    roles: Option<String>,
}

#[derive(Serialize)]
struct ReadResponse {
    updated: usize,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn list_conversations(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> ApiResult<Vec<ConversationSummary>> {
    let summaries = state.db.lock().await.conversation_summaries(&user.id)?;
    Ok(Json(ApiResponse::ok(summaries)))
}

/// Resolve the path counterparty, rejecting the caller themselves.
fn counterparty(db: &Database, me: &UserId, raw: String) -> Result<UserId, ServerError> {
    let id = UserId::new(raw);
    if &id == me {
        return Err(ServerError::BadRequest("Cannot open a conversation with yourself".into()));
    }
    match db.get_user(&id) {
        Ok(_) => Ok(id),
        Err(StoreError::NotFound) => Err(ServerError::NotFound("User not found".into())),
        Err(e) => Err(e.into()),
    }
}

async fn conversation_messages(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(counterparty_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Vec<MessageRecord>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_PAGE)
        .min(state.config.history_max_page)
        .max(1);
    let offset = query.offset.unwrap_or(0);

    let db = state.db.lock().await;
    let other = counterparty(&db, &user.id, counterparty_id)?;
    let key = ConversationKey::between(&user.id, &other);
    let records = db.conversation_history(&key, limit, offset)?;
    debug!(conversation = %key, limit, offset, returned = records.len(), "History served");
    Ok(Json(ApiResponse::ok(records)))
}

async fn mark_read(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(counterparty_id): Path<String>,
) -> ApiResult<ReadResponse> {
    let db = state.db.lock().await;
    let other = counterparty(&db, &user.id, counterparty_id)?;
    let updated = db.mark_conversation_read(&user.id, &other, Utc::now())?;
    debug!(reader = %user.id, counterparty = %other, updated, "Conversation marked read");
    Ok(Json(ApiResponse::ok(ReadResponse { updated })))
}

fn validate_content(request: &SendMessageRequest, max_len: usize) -> Result<(), ServerError> {
    if request.message_type.needs_attachment() {
        if request.attachment.is_none() {
            return Err(ServerError::BadRequest(format!(
                "A {} message needs an attachment",
                request.message_type.as_str()
            )));
        }
    } else if request.content.trim().is_empty() {
        return Err(ServerError::BadRequest("Message content is empty".into()));
    }
    let len = request.content.chars().count();
    if len > max_len {
        return Err(ServerError::BadRequest(format!(
            "Message content is too long: {len} characters (max {max_len})"
        )));
    }
    Ok(())
}

async fn send_message(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(request): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<ApiResponse<MessageRecord>>), ServerError> {
    if !state.rate_limiter.check(&user.id).await {
        warn!(user = %user.id, "Send rate limit exceeded");
        return Err(ServerError::RateLimited);
    }
    validate_content(&request, state.config.max_content_len)?;
    if request.recipient_id == user.id {
        return Err(ServerError::BadRequest("Cannot message yourself".into()));
    }

    let db = state.db.lock().await;

    if let Some(client_ref) = &request.client_ref {
        if let Some(existing) = db.find_by_client_ref(&user.id, client_ref)? {
            debug!(msg_id = %existing.id, client_ref = %client_ref, "Repeated send, returning stored message");
            return Ok((StatusCode::OK, Json(ApiResponse::ok(existing))));
        }
    }

    let recipient = match db.get_user(&request.recipient_id) {
        Ok(recipient) if recipient.is_active => recipient,
        Ok(_) | Err(StoreError::NotFound) => {
            return Err(ServerError::NotFound("Recipient not found".into()))
        }
        Err(e) => return Err(e.into()),
    };

    let key = ConversationKey::between(&user.id, &recipient.id);
    if let Some(target) = &request.reply_to {
        match db.get_message(target) {
            Ok(original) if original.conversation_key() == key => {}
            Ok(_) | Err(StoreError::NotFound) => {
                return Err(ServerError::BadRequest(
                    "Reply target is not part of this conversation".into(),
                ))
            }
            Err(e) => return Err(e.into()),
        }
    }

    let record = MessageRecord {
        id: ServerMessageId::new(Uuid::new_v4().to_string()),
        sender_id: user.id.clone(),
        sender_name: user.display_name.clone(),
        sender_role: user.role,
        recipient_id: recipient.id,
        content: request.content,
        message_type: request.message_type,
        attachment: request.attachment,
        reply_to: request.reply_to,
        client_ref: request.client_ref,
        // Stored precision, so the ack and later history reads agree.
        created_at: Utc::now().trunc_subsecs(6),
        read: false,
    };
    db.insert_message(&record)?;

    info!(
        msg_id = %record.id,
        sender = %record.sender_id,
        recipient = %record.recipient_id,
        "Message stored"
    );
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(record))))
}

/// Only the sender may delete. Both sides' live connections are told.
async fn delete_message(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(message_id): Path<String>,
) -> ApiResult<DeletedMessage> {
    let id = ServerMessageId::new(message_id);
    let stored = {
        let db = state.db.lock().await;
        let stored = match db.get_message(&id) {
            Ok(stored) => stored,
            Err(StoreError::NotFound) => {
                return Err(ServerError::NotFound("Message not found".into()))
            }
            Err(e) => return Err(e.into()),
        };
        if stored.sender_id != user.id {
            warn!(user = %user.id, msg_id = %id, "Delete of someone else's message");
            return Err(ServerError::Forbidden(
                "You can only delete your own messages".into(),
            ));
        }
        db.delete_message(&id)?;
        stored
    };

    let deleted = DeletedMessage {
        message_id: stored.id,
        sender_id: stored.sender_id,
        recipient_id: stored.recipient_id,
    };
    let notice = ServerFrame::MessageDeleted(deleted.clone());
    state.hub.send_to(&deleted.recipient_id, notice.clone()).await;
    state.hub.send_to(&deleted.sender_id, notice).await;

    info!(msg_id = %deleted.message_id, sender = %deleted.sender_id, "Message deleted");
    Ok(Json(ApiResponse::ok(deleted)))
}

async fn unread_count(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> ApiResult<UnreadCounts> {
    let counts = state.db.lock().await.unread_counts(&user.id)?;
    Ok(Json(ApiResponse::ok(counts)))
}

async fn list_users(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Query(query): Query<UsersQuery>,
) -> ApiResult<Vec<Counterparty>> {
    let roles: Vec<Role> = match query.roles.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => raw
            .split(',')
            .map(str::parse::<Role>)
            .collect::<Result<_, _>>()
            .map_err(ServerError::BadRequest)?,
        _ => Role::ALL
            .into_iter()
            .filter(|r| *r != Role::Admin)
            .collect(),
    };

    let users = state.db.lock().await.list_users_by_roles(&roles, &user.id)?;
    Ok(Json(ApiResponse::ok(
        users.iter().map(|u| u.to_counterparty()).collect(),
    )))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting chat server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use carechat_store::User;

    pub(crate) fn test_state(config: ServerConfig) -> AppState {
        let db = Database::open_in_memory().unwrap();
        for (user, token) in [
            (User::new("mom-1", "Amaya", Role::Mom), "tok-mom"),
            (User::new("doc-1", "Dr. Perera", Role::Doctor).with_specialty("Obstetrics"), "tok-doc"),
            (User::new("mw-1", "Nimali", Role::Midwife), "tok-mw"),
        ] {
            db.upsert_user(&user).unwrap();
            db.register_token(token, &user.id).unwrap();
        }
        AppState::new(db, config)
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            req = req.header("authorization", format!("Bearer {token}"));
        }
        let req = match body {
            Some(body) => req
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn app() -> Router {
        build_router(test_state(ServerConfig::default()))
    }

    #[tokio::test]
    async fn health_needs_no_token() {
        let (status, body) = call(&app(), "GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn chat_routes_require_a_known_token() {
        let app = app();
        let (status, body) = call(&app, "GET", "/api/chat/conversations", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);

        let (status, _) = call(&app, "GET", "/api/chat/conversations", Some("nope"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = call(&app, "GET", "/ws", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn send_then_read_history() {
        let app = app();
        let (status, body) = call(
            &app,
            "POST",
            "/api/chat/messages",
            Some("tok-mom"),
            Some(json!({"recipientId": "doc-1", "content": "Hello doctor", "messageType": "text"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["senderName"], "Amaya");
        assert_eq!(body["data"]["senderRole"], "mom");
        let id = body["data"]["id"].as_str().unwrap().to_string();

        let (status, body) = call(
            &app,
            "POST",
            "/api/chat/messages",
            Some("tok-doc"),
            Some(json!({"recipientId": "mom-1", "content": "Hello Amaya", "replyTo": id})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["replyTo"], id.as_str());

        let (status, body) = call(
            &app,
            "GET",
            "/api/chat/conversations/doc-1/messages?limit=10",
            Some("tok-mom"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let contents: Vec<_> = body["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["content"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(contents, vec!["Hello doctor", "Hello Amaya"]);

        let (_, body) = call(
            &app,
            "GET",
            "/api/chat/conversations/doc-1/messages?limit=1",
            Some("tok-mom"),
            None,
        )
        .await;
        assert_eq!(body["data"][0]["content"], "Hello Amaya");
    }

    #[tokio::test]
    async fn repeated_client_ref_returns_the_stored_message() {
        let app = app();
        let payload = json!({
            "recipientId": "doc-1",
            "content": "once",
            "clientRef": "6f1c3c1e-58d4-4b39-9a39-0d0cf8f2d1a1"
        });
        let (status, first) =
            call(&app, "POST", "/api/chat/messages", Some("tok-mom"), Some(payload.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, second) =
            call(&app, "POST", "/api/chat/messages", Some("tok-mom"), Some(payload)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["data"]["id"], second["data"]["id"]);
        assert_eq!(second["data"]["clientRef"], "6f1c3c1e-58d4-4b39-9a39-0d0cf8f2d1a1");
    }

    #[tokio::test]
    async fn invalid_sends_are_rejected() {
        let app = app();
        let cases = [
            (json!({"recipientId": "doc-1", "content": "   "}), StatusCode::BAD_REQUEST),
            (json!({"recipientId": "mom-1", "content": "me"}), StatusCode::BAD_REQUEST),
            (json!({"recipientId": "ghost", "content": "boo"}), StatusCode::NOT_FOUND),
            (
                json!({"recipientId": "doc-1", "content": "x".repeat(5001)}),
                StatusCode::BAD_REQUEST,
            ),
            (
                json!({"recipientId": "doc-1", "content": "", "messageType": "image"}),
                StatusCode::BAD_REQUEST,
            ),
        ];
        for (payload, expected) in cases {
            let (status, body) =
                call(&app, "POST", "/api/chat/messages", Some("tok-mom"), Some(payload)).await;
            assert_eq!(status, expected, "{body}");
            assert_eq!(body["success"], false);
        }
    }

    #[tokio::test]
    async fn reply_must_stay_in_the_conversation() {
        let app = app();
        let (_, body) = call(
            &app,
            "POST",
            "/api/chat/messages",
            Some("tok-mw"),
            Some(json!({"recipientId": "doc-1", "content": "midwife to doctor"})),
        )
        .await;
        let foreign = body["data"]["id"].as_str().unwrap().to_string();

        let (status, _) = call(
            &app,
            "POST",
            "/api/chat/messages",
            Some("tok-mom"),
            Some(json!({"recipientId": "doc-1", "content": "hi", "replyTo": foreign})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn sends_are_rate_limited_per_user() {
        let config = ServerConfig {
            message_rate: 0.001,
            message_burst: 2.0,
            ..ServerConfig::default()
        };
        let app = build_router(test_state(config));
        let payload = json!({"recipientId": "doc-1", "content": "spam"});

        for _ in 0..2 {
            let (status, _) =
                call(&app, "POST", "/api/chat/messages", Some("tok-mom"), Some(payload.clone())).await;
            assert_eq!(status, StatusCode::CREATED);
        }
        let (status, _) =
            call(&app, "POST", "/api/chat/messages", Some("tok-mom"), Some(payload)).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

        let (status, _) = call(
            &app,
            "POST",
            "/api/chat/messages",
            Some("tok-doc"),
            Some(json!({"recipientId": "mom-1", "content": "not me"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    #[tokio::test]
    async fn summaries_track_unread_until_marked_read() {
        let app = app();
        for text in ["one", "two"] {
            call(
                &app,
                "POST",
                "/api/chat/messages",
                Some("tok-doc"),
                Some(json!({"recipientId": "mom-1", "content": text})),
            )
            .await;
        }

        let (_, body) = call(&app, "GET", "/api/chat/conversations", Some("tok-mom"), None).await;
        assert_eq!(body["data"][0]["counterparty"]["id"], "doc-1");
        assert_eq!(body["data"][0]["unreadCount"], 2);
        assert_eq!(body["data"][0]["lastMessage"]["content"], "two");

        let (status, body) = call(
            &app,
            "PATCH",
            "/api/chat/conversations/doc-1/read",
            Some("tok-mom"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["updated"], 2);

        let (_, body) = call(&app, "GET", "/api/chat/conversations", Some("tok-mom"), None).await;
        assert_eq!(body["data"][0]["unreadCount"], 0);

        let (status, _) = call(
            &app,
            "PATCH",
            "/api/chat/conversations/ghost/read",
            Some("tok-mom"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn users_are_filtered_by_role() {
        let app = app();
        let (status, body) = call(
            &app,
            "GET",
            "/api/chat/users?roles=doctor,midwife",
            Some("tok-mom"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let ids: Vec<_> = body["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|u| u["id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["doc-1", "mw-1"]);
        assert_eq!(body["data"][0]["specialty"], "Obstetrics");

        let (status, _) = call(&app, "GET", "/api/chat/users?roles=pilot", Some("tok-mom"), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn only_the_sender_may_delete_and_both_sides_are_told() {
        let state = test_state(ServerConfig::default());
        let app = build_router(state.clone());
        let (_, body) = call(
            &app,
            "POST",
            "/api/chat/messages",
            Some("tok-mom"),
            Some(json!({"recipientId": "doc-1", "content": "sent by mistake"})),
        )
        .await;
        let id = body["data"]["id"].as_str().unwrap().to_string();
        let uri = format!("/api/chat/messages/{id}");

        let (doc_tx, mut doc_rx) = tokio::sync::mpsc::unbounded_channel();
        state.hub.register(&UserId::from("doc-1"), doc_tx).await;
        let (mom_tx, mut mom_rx) = tokio::sync::mpsc::unbounded_channel();
        state.hub.register(&UserId::from("mom-1"), mom_tx).await;
        while doc_rx.try_recv().is_ok() {}

        let (status, body) = call(&app, "DELETE", &uri, Some("tok-doc"), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["success"], false);

        let (status, body) = call(&app, "DELETE", &uri, Some("tok-mom"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["messageId"], id.as_str());

        let expected = ServerFrame::MessageDeleted(DeletedMessage {
            message_id: ServerMessageId::new(id.clone()),
            sender_id: UserId::from("mom-1"),
            recipient_id: UserId::from("doc-1"),
        });
        assert_eq!(doc_rx.try_recv().unwrap(), expected);
        assert_eq!(mom_rx.try_recv().unwrap(), expected);

        let (status, _) = call(&app, "DELETE", &uri, Some("tok-mom"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, body) = call(
            &app,
            "GET",
            "/api/chat/conversations/doc-1/messages",
            Some("tok-mom"),
            None,
        )
        .await;
        assert_eq!(body["data"], json!([]));
    }

    #[tokio::test]
    async fn unread_count_spans_conversations() {
        let app = app();
        for (token, to) in [("tok-doc", "mom-1"), ("tok-doc", "mom-1"), ("tok-mw", "mom-1")] {
            call(
                &app,
                "POST",
                "/api/chat/messages",
                Some(token),
                Some(json!({"recipientId": to, "content": "check in"})),
            )
            .await;
        }

        let (status, body) = call(&app, "GET", "/api/chat/unread-count", Some("tok-mom"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["totalUnread"], 3);
        assert_eq!(body["data"]["unreadByConversation"]["doc-1_mom-1"], 2);
        assert_eq!(body["data"]["unreadByConversation"]["mom-1_mw-1"], 1);

        let (_, body) = call(&app, "GET", "/api/chat/unread-count", Some("tok-doc"), None).await;
        assert_eq!(body["data"]["totalUnread"], 0);
    }
}
