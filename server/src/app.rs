use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    desk::{Desk, InboundAck},
    error::ChatError,
    hub::ClientAction,
    provider::provider_from_config,
    types::{ChatStatus, InboundDelivery},
};

#[derive(Debug, Deserialize)]
struct WhatsappWebhookForm {
    #[serde(rename = "From")]
    from: Option<String>,
    #[serde(rename = "Body")]
    body: Option<String>,
    #[serde(rename = "ProfileName")]
    profile_name: Option<String>,
    #[serde(rename = "MessageSid")]
    message_sid: Option<String>,
    #[serde(rename = "SmsSid")]
    sms_sid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatsQuery {
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartConversationBody {
    phone_number: String,
    message: String,
}

pub fn router(desk: Arc<Desk>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/webhook/whatsapp",
            get(whatsapp_webhook_verify).post(whatsapp_webhook_event),
        )
        .route("/api/chats", get(get_chats))
        .route("/api/start-conversation", post(start_conversation))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(desk)
}

async fn health(State(desk): State<Arc<Desk>>) -> impl IntoResponse {
    Json(desk.health().await)
}

async fn whatsapp_webhook_verify() -> impl IntoResponse {
    (StatusCode::OK, "Webhook configured")
}

async fn whatsapp_webhook_event(
    State(desk): State<Arc<Desk>>,
    Form(form): Form<WhatsappWebhookForm>,
) -> Response {
    let (Some(from), Some(body)) = (form.from, form.body) else {
        warn!("webhook delivery missing From or Body");
        return (StatusCode::BAD_REQUEST, "missing From or Body").into_response();
    };

    let delivery = InboundDelivery {
        address: from,
        body,
        display_name: form.profile_name,
        provider_message_id: form.message_sid.or(form.sms_sid),
    };

    match desk.handle_inbound(delivery).await {
        Ok(InboundAck::Admitted { .. }) => (StatusCode::OK, "OK").into_response(),
        Ok(InboundAck::Duplicate) => (StatusCode::OK, "Duplicate ignored").into_response(),
        Err(err) => {
            warn!(error = %err, "webhook delivery rejected");
            err.into_response()
        }
    }
}

async fn get_chats(
    State(desk): State<Arc<Desk>>,
    Query(query): Query<ChatsQuery>,
) -> Result<impl IntoResponse, ChatError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<ChatStatus>)
        .transpose()
        .map_err(ChatError::Validation)?;
    let chats = desk.conversations(status).await;
    Ok(Json(json!({ "chats": chats })))
}

async fn start_conversation(
    State(desk): State<Arc<Desk>>,
    Json(body): Json<StartConversationBody>,
) -> Response {
    match desk.start_conversation(&body.phone_number, &body.message).await {
        Ok(conversation_id) => (
            StatusCode::CREATED,
            Json(json!({ "ok": true, "conversationId": conversation_id })),
        )
            .into_response(),
        Err(ChatError::Duplicate) => {
            (StatusCode::OK, Json(json!({ "ok": true, "duplicate": true }))).into_response()
        }
        Err(err) => err.into_response(),
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(desk): State<Arc<Desk>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, desk))
}

async fn handle_socket(socket: WebSocket, desk: Arc<Desk>) {
    let (client_id, mut rx) = desk.hub().subscribe().await;
    info!(client_id, "agent session connected");

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = ws_receiver.next().await {
        let text = match message {
            Message::Text(text) => text.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };

        let Some(action) = ClientAction::parse(&text) else {
            debug!(client_id, "ignoring unrecognized client event");
            continue;
        };

        desk.dispatch(client_id, action).await;
    }

    desk.hub().unsubscribe(client_id).await;
    send_task.abort();
    info!(client_id, "agent session disconnected");
}

pub async fn run() {
    let _ = dotenvy::dotenv();
    let config = Config::from_env();

    if !config.provider_configured() {
        warn!("TWILIO_ACCOUNT_SID, TWILIO_AUTH_TOKEN or TWILIO_PHONE_NUMBER missing; outbound sends will fail");
    }

    let provider = provider_from_config(config.twilio.as_ref());
    let desk = Arc::new(Desk::new(&config, provider));
    let app = router(desk);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind TCP listener");

    info!(
        port = config.port,
        environment = %config.environment,
        "support desk server running at http://localhost:{}",
        config.port
    );
    axum::serve(listener, app)
        .await
        .expect("server runtime failure");
}
