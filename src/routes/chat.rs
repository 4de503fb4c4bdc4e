use std::collections::HashMap;

use axum::extract::{Json, Path, State};
use axum::http::StatusCode;
use chrono::Utc;
use diesel::prelude::*;
use diesel::PgConnection;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::error::{AppError, AppResult};
use crate::llm::{fallback_title, HistoryMessage};
use crate::models::{
    ChatMessage, Conversation, ConversationStatus, Document, NewChatMessage, NewConversation,
    ROLE_ASSISTANT, ROLE_USER,
};
use crate::schema::{chat_messages, conversations, documents};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

#[derive(Serialize)]
pub struct ChatMessageResponse {
    pub role: String,
    pub content: String,
    pub created_at: String,
}

impl From<ChatMessage> for ChatMessageResponse {
    fn from(message: ChatMessage) -> Self {
        Self {
            role: message.role,
            content: message.content,
            created_at: message.created_at.and_utc().to_rfc3339(),
        }
    }
}

#[derive(Serialize)]
pub struct StartConversationResponse {
    pub conversation_uuid: Uuid,
    pub title: String,
    pub messages: Vec<ChatMessageResponse>,
}

#[derive(Serialize)]
pub struct ContinueConversationResponse {
    pub conversation_uuid: Uuid,
    pub reply: ChatMessageResponse,
}

#[derive(Serialize)]
pub struct ConversationListItem {
    pub conversation_uuid: Uuid,
    pub title: String,
    pub document_uuid: Uuid,
    pub document_filename: String,
    pub message_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Serialize)]
pub struct ConversationListResponse {
    pub conversations: Vec<ConversationListItem>,
}

#[derive(Serialize)]
pub struct ConversationDetailResponse {
    pub conversation_uuid: Uuid,
    pub title: String,
    pub document_uuid: Uuid,
    pub document_filename: String,
    pub messages: Vec<ChatMessageResponse>,
}

#[derive(Serialize)]
pub struct MessageResponse {
    pub message: String,
}

fn validated_message(payload: ChatRequest) -> AppResult<String> {
    let message = payload.message.trim().to_string();
    if message.is_empty() {
        return Err(AppError::bad_request("message must not be empty"));
    }
    Ok(message)
}

/// Deleted conversations are indistinguishable from missing ones.
fn find_active_conversation(
    conn: &mut PgConnection,
    owner_id: Uuid,
    conversation_uuid: Uuid,
) -> AppResult<Conversation> {
    let conversation = conversations::table
        .filter(conversations::user_id.eq(owner_id))
        .filter(conversations::conversation_uuid.eq(conversation_uuid))
        .filter(conversations::status.eq(ConversationStatus::Active.as_str()))
        .first(conn)?;
    Ok(conversation)
}

fn append_message(
    conn: &mut PgConnection,
    conversation_id: Uuid,
    role: &str,
    content: &str,
) -> AppResult<ChatMessage> {
    let new_message = NewChatMessage {
        id: Uuid::new_v4(),
        conversation_id,
        role: role.to_string(),
        content: content.to_string(),
    };

    let message = diesel::insert_into(chat_messages::table)
        .values(&new_message)
        .get_result(conn)?;
    Ok(message)
}

fn touch_conversation(conn: &mut PgConnection, conversation_id: Uuid) -> AppResult<()> {
    diesel::update(conversations::table.find(conversation_id))
        .set(conversations::updated_at.eq(Utc::now().naive_utc()))
        .execute(conn)?;
    Ok(())
}

pub async fn start_conversation(
    State(state): State<AppState>,
    Path(document_uuid): Path<Uuid>,
    user: AuthenticatedUser,
    Json(payload): Json<ChatRequest>,
) -> AppResult<(StatusCode, Json<StartConversationResponse>)> {
    let message = validated_message(payload)?;

    let mut conn = state.db()?;
    let document: Document = documents::table
        .filter(documents::user_id.eq(user.user_id))
        .filter(documents::doc_uuid.eq(document_uuid))
        .first(&mut conn)?;
    drop(conn);

    // Title generation is the one gateway call allowed to fail quietly.
    let title = match state.llm.title_for(&message).await {
        Ok(title) => title.trim().to_string(),
        Err(err) => {
            warn!(document_uuid = %document_uuid, error = %err, "title generation failed");
            fallback_title(&message)
        }
    };

    let new_conversation = NewConversation {
        id: Uuid::new_v4(),
        conversation_uuid: Uuid::new_v4(),
        title: title.clone(),
        user_id: user.user_id,
        document_id: document.id,
        status: ConversationStatus::Active.as_str().to_string(),
    };

    let mut conn = state.db()?;
    let conversation: Conversation = diesel::insert_into(conversations::table)
        .values(&new_conversation)
        .get_result(&mut conn)?;

    let user_message = append_message(&mut conn, conversation.id, ROLE_USER, &message)?;
    drop(conn);

    // If this call fails the conversation keeps its unanswered user
    // message; there is no compensating rollback.
    let reply = state.llm.answer(&document.extracted_text, &message).await?;

    let mut conn = state.db()?;
    let assistant_message = append_message(&mut conn, conversation.id, ROLE_ASSISTANT, &reply)?;
    touch_conversation(&mut conn, conversation.id)?;

    info!(
        conversation_uuid = %conversation.conversation_uuid,
        document_uuid = %document_uuid,
        "conversation started"
    );

    Ok((
        StatusCode::CREATED,
        Json(StartConversationResponse {
            conversation_uuid: conversation.conversation_uuid,
            title,
            messages: vec![user_message.into(), assistant_message.into()],
        }),
    ))
}

pub async fn continue_conversation(
    State(state): State<AppState>,
    Path(conversation_uuid): Path<Uuid>,
    user: AuthenticatedUser,
    Json(payload): Json<ChatRequest>,
) -> AppResult<Json<ContinueConversationResponse>> {
    let message = validated_message(payload)?;

    let mut conn = state.db()?;
    let conversation = find_active_conversation(&mut conn, user.user_id, conversation_uuid)?;

    let document: Document = documents::table
        .find(conversation.document_id)
        .first(&mut conn)?;

    let history: Vec<ChatMessage> = chat_messages::table
        .filter(chat_messages::conversation_id.eq(conversation.id))
        .order(chat_messages::created_at.asc())
        .load(&mut conn)?;

    append_message(&mut conn, conversation.id, ROLE_USER, &message)?;
    drop(conn);

    let history: Vec<HistoryMessage> = history
        .into_iter()
        .map(|entry| HistoryMessage {
            role: entry.role,
            content: entry.content,
        })
        .collect();

    let reply = state
        .llm
        .answer_with_history(&document.extracted_text, &history, &message)
        .await?;

    let mut conn = state.db()?;
    let assistant_message = append_message(&mut conn, conversation.id, ROLE_ASSISTANT, &reply)?;
    touch_conversation(&mut conn, conversation.id)?;

    Ok(Json(ContinueConversationResponse {
        conversation_uuid,
        reply: assistant_message.into(),
    }))
}

pub async fn list_conversations(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<ConversationListResponse>> {
    let mut conn = state.db()?;

    let convs: Vec<Conversation> = conversations::table
        .filter(conversations::user_id.eq(user.user_id))
        .filter(conversations::status.eq(ConversationStatus::Active.as_str()))
        .order(conversations::updated_at.desc())
        .load(&mut conn)?;

    let conversation_ids: Vec<Uuid> = convs.iter().map(|c| c.id).collect();
    let document_ids: Vec<Uuid> = convs.iter().map(|c| c.document_id).collect();

    let counts: Vec<(Uuid, i64)> = chat_messages::table
        .filter(chat_messages::conversation_id.eq_any(&conversation_ids))
        .group_by(chat_messages::conversation_id)
        .select((chat_messages::conversation_id, diesel::dsl::count_star()))
        .load(&mut conn)?;
    let counts: HashMap<Uuid, i64> = counts.into_iter().collect();

    let docs: Vec<Document> = documents::table
        .filter(documents::id.eq_any(&document_ids))
        .load(&mut conn)?;
    let docs: HashMap<Uuid, Document> = docs.into_iter().map(|doc| (doc.id, doc)).collect();

    let mut conversations_out = Vec::with_capacity(convs.len());
    for conv in convs {
        let Some(doc) = docs.get(&conv.document_id) else {
            continue;
        };
        conversations_out.push(ConversationListItem {
            conversation_uuid: conv.conversation_uuid,
            title: conv.title,
            document_uuid: doc.doc_uuid,
            document_filename: doc.filename.clone(),
            message_count: counts.get(&conv.id).copied().unwrap_or(0),
            created_at: conv.created_at.and_utc().to_rfc3339(),
            updated_at: conv.updated_at.and_utc().to_rfc3339(),
        });
    }

    Ok(Json(ConversationListResponse {
        conversations: conversations_out,
    }))
}

pub async fn get_conversation(
    State(state): State<AppState>,
    Path(conversation_uuid): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<Json<ConversationDetailResponse>> {
    let mut conn = state.db()?;
    let conversation = find_active_conversation(&mut conn, user.user_id, conversation_uuid)?;

    let document: Document = documents::table
        .find(conversation.document_id)
        .first(&mut conn)?;

    let messages: Vec<ChatMessage> = chat_messages::table
        .filter(chat_messages::conversation_id.eq(conversation.id))
        .order(chat_messages::created_at.asc())
        .load(&mut conn)?;

    Ok(Json(ConversationDetailResponse {
        conversation_uuid,
        title: conversation.title,
        document_uuid: document.doc_uuid,
        document_filename: document.filename,
        messages: messages.into_iter().map(Into::into).collect(),
    }))
}

pub async fn delete_conversation(
    State(state): State<AppState>,
    Path(conversation_uuid): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<Json<MessageResponse>> {
    let mut conn = state.db()?;

    // Lookup ignores status: deleting an already-deleted conversation is
    // allowed and idempotent.
    let conversation: Conversation = conversations::table
        .filter(conversations::user_id.eq(user.user_id))
        .filter(conversations::conversation_uuid.eq(conversation_uuid))
        .first(&mut conn)?;

    if conversation.is_active() {
        diesel::update(conversations::table.find(conversation.id))
            .set((
                conversations::status.eq(ConversationStatus::Deleted.as_str()),
                conversations::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(&mut conn)?;
        info!(conversation_uuid = %conversation_uuid, "conversation soft-deleted");
    }

    Ok(Json(MessageResponse {
        message: format!("Conversation {conversation_uuid} deleted successfully."),
    }))
}
