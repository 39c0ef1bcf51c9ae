use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use harmony_core::{ChatId, ChatMessage};
use serde::{Deserialize, Serialize};

use crate::{chat::ChatError, session::AuthenticatedUser, AppState};

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
}

impl ErrorBody {
    pub fn new(error: &'static str, message: impl Into<String>) -> Self {
        Self {
            error,
            message: message.into(),
        }
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ChatError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            ChatError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ChatError::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
            ChatError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            ChatError::Internal(err) => {
                tracing::error!(?err, "chat operation failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "server_error")
            }
            ChatError::FatalStartup(err) => {
                tracing::error!(?err, "chat service unavailable");
                (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
            }
        };
        let message = match &self {
            ChatError::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        };
        (status, Json(ErrorBody::new(code, message))).into_response()
    }
}

pub(crate) fn parse_chat_id(raw: &str) -> Result<ChatId, ChatError> {
    raw.parse()
        .map_err(|_| ChatError::Validation(format!("invalid chat id '{raw}'")))
}

#[derive(Debug, Deserialize)]
pub struct UserListRequest {
    pub user_id_list: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateChatResponse {
    pub chat_id: ChatId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatListResponse {
    pub chat_id_list: Vec<ChatId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MemberListResponse {
    pub user_id_list: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(default)]
    pub client_uuid: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub message_id: String,
}

impl From<&ChatMessage> for SendMessageResponse {
    fn from(message: &ChatMessage) -> Self {
        Self {
            status: "Message sent".to_string(),
            timestamp: message.created_at,
            message_id: message.message_id.to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub messages: Vec<ChatMessage>,
    pub next_cursor: Option<String>,
}

pub async fn create_chat(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Json(request): Json<UserListRequest>,
) -> Result<Json<CreateChatResponse>, ChatError> {
    let max = state.chat().settings().max_users_per_operation;
    if request.user_id_list.is_empty() || request.user_id_list.len() > max {
        return Err(ChatError::Validation(format!(
            "user_id_list must hold between 1 and {max} entries"
        )));
    }
    let chat_id = state
        .chat()
        .create_chat(&user.user_id, &request.user_id_list)
        .await?;
    Ok(Json(CreateChatResponse { chat_id }))
}

pub async fn list_chats(
    user: AuthenticatedUser,
    State(state): State<AppState>,
) -> Result<Json<ChatListResponse>, ChatError> {
    let chat_id_list = state.chat().list_chats(&user.user_id).await?;
    Ok(Json(ChatListResponse { chat_id_list }))
}

pub async fn send_message(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Json(request): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<SendMessageResponse>), ChatError> {
    let chat_id = parse_chat_id(&chat_id)?;
    let message = state
        .chat()
        .send_message(&chat_id, &user.user_id, &request.content, request.client_uuid)
        .await?;
    Ok((StatusCode::CREATED, Json(SendMessageResponse::from(&message))))
}

pub async fn chat_history(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ChatError> {
    let chat_id = parse_chat_id(&chat_id)?;
    let page = state
        .chat()
        .get_chat_history(&user.user_id, &chat_id, query.limit, query.cursor.as_deref())
        .await?;
    Ok(Json(HistoryResponse {
        messages: page.messages,
        next_cursor: page.next_cursor,
    }))
}

pub async fn delete_chat(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> Result<StatusCode, ChatError> {
    let chat_id = parse_chat_id(&chat_id)?;
    state.chat().delete_chat(&user.user_id, &chat_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn add_members(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Json(request): Json<UserListRequest>,
) -> Result<StatusCode, ChatError> {
    let chat_id = parse_chat_id(&chat_id)?;
    state
        .chat()
        .add_users_to_chat(&user.user_id, &chat_id, &request.user_id_list)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_members(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> Result<Json<MemberListResponse>, ChatError> {
    let chat_id = parse_chat_id(&chat_id)?;
    let user_id_list = state.chat().list_members(&user.user_id, &chat_id).await?;
    Ok(Json(MemberListResponse { user_id_list }))
}

pub async fn leave_chat(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> Result<StatusCode, ChatError> {
    let chat_id = parse_chat_id(&chat_id)?;
    state.chat().leave_chat(&user.user_id, &chat_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
