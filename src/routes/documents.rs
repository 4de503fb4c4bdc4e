use axum::extract::{Json, Multipart, Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use chrono::Utc;
use diesel::dsl::exists;
use diesel::prelude::*;
use diesel::{select, PgConnection};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::error::{AppError, AppResult};
use crate::models::{Document, NewDocument};
use crate::schema::documents;
use crate::state::AppState;

pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;
pub const MAX_PAGE_COUNT: usize = 100;
const MAX_QUERY_CHARS: usize = 1000;

#[derive(Serialize)]
pub struct UploadResponse {
    pub message: String,
    pub uuid: Uuid,
}

#[derive(Serialize)]
pub struct DocumentSummary {
    pub uuid: Uuid,
    pub filename: String,
    pub uploaded_at: String,
}

#[derive(Serialize)]
pub struct ListDocumentsResponse {
    pub documents: Vec<DocumentSummary>,
}

#[derive(Deserialize)]
pub struct QueryParams {
    pub query: String,
}

#[derive(Serialize)]
pub struct QueryResponse {
    pub uuid: Uuid,
    pub query: String,
    pub llm_response: String,
}

#[derive(Serialize)]
pub struct SummaryResponse {
    pub uuid: Uuid,
    pub summary: String,
    pub generated_at: String,
}

#[derive(Serialize)]
pub struct MessageResponse {
    pub message: String,
}

struct PdfUpload {
    bytes: Vec<u8>,
    filename: String,
}

/// Pulls the `file` field out of the multipart body and applies the
/// boundary checks: PDF content type, non-empty, size and page limits.
async fn read_pdf_upload(state: &AppState, mut multipart: Multipart) -> AppResult<PdfUpload> {
    let mut file_bytes: Option<Vec<u8>> = None;
    let mut filename: Option<String> = None;
    let mut content_type: Option<String> = None;

    while let Some(field) = multipart.next_field().await.map_err(|err| {
        error!(error = %err, "invalid multipart data");
        AppError::bad_request(format!("invalid multipart data: {err}"))
    })? {
        if field.name() == Some("file") {
            filename = field.file_name().map(|n| n.to_string());
            content_type = field.content_type().map(|mime| mime.to_string());
            let data = field.bytes().await.map_err(|err| {
                error!(error = %err, "failed to read file bytes");
                AppError::bad_request(format!("failed to read file bytes: {err}"))
            })?;
            file_bytes = Some(data.to_vec());
        }
    }

    let bytes = file_bytes.ok_or_else(|| AppError::bad_request("file field is required"))?;
    let filename = filename.ok_or_else(|| AppError::bad_request("filename is required"))?;

    match content_type.as_deref() {
        Some(mime) if mime.eq_ignore_ascii_case("application/pdf") => {}
        _ => {
            return Err(AppError::bad_request(
                "Invalid file type. Please upload a PDF file.",
            ))
        }
    }

    if bytes.is_empty() {
        return Err(AppError::bad_request("file must not be empty"));
    }

    if bytes.len() > MAX_UPLOAD_BYTES {
        return Err(AppError::bad_request("file exceeds the 10 MiB upload limit"));
    }

    let pages = state
        .pdf
        .page_count(&bytes)
        .map_err(|err| AppError::bad_request(err.to_string()))?;
    if pages > MAX_PAGE_COUNT {
        return Err(AppError::bad_request(format!(
            "PDF has {pages} pages; the limit is {MAX_PAGE_COUNT}"
        )));
    }

    Ok(PdfUpload { bytes, filename })
}

fn find_owned_document(
    conn: &mut PgConnection,
    owner_id: Uuid,
    doc_uuid: Uuid,
) -> AppResult<Document> {
    // Scoping by owner means a foreign document looks identical to a
    // missing one.
    let doc = documents::table
        .filter(documents::user_id.eq(owner_id))
        .filter(documents::doc_uuid.eq(doc_uuid))
        .first(conn)?;
    Ok(doc)
}

fn attachment_content_disposition(filename: &str) -> Option<HeaderValue> {
    let sanitized: String = filename
        .chars()
        .map(|ch| match ch {
            '"' | '\\' => '_',
            _ => ch,
        })
        .collect();

    let encoded =
        percent_encoding::utf8_percent_encode(&sanitized, percent_encoding::NON_ALPHANUMERIC);
    HeaderValue::from_str(&format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        sanitized, encoded
    ))
    .ok()
}

pub async fn upload_document(
    State(state): State<AppState>,
    Path(doc_uuid): Path<Uuid>,
    user: AuthenticatedUser,
    multipart: Multipart,
) -> AppResult<(StatusCode, Json<UploadResponse>)> {
    let upload = read_pdf_upload(&state, multipart).await?;

    let mut conn = state.db()?;
    let taken: bool = select(exists(
        documents::table
            .filter(documents::user_id.eq(user.user_id))
            .filter(documents::doc_uuid.eq(doc_uuid)),
    ))
    .get_result(&mut conn)?;
    if taken {
        return Err(AppError::conflict(format!(
            "UUID {doc_uuid} already exists. Use PUT to update the PDF."
        )));
    }

    // Keys are prefixed with the owner id: document UUIDs are only unique
    // per owner, so the UUID alone cannot name the backing file.
    let file_path = state
        .storage
        .save(
            &format!("{}_{doc_uuid}_{}", user.user_id, upload.filename),
            &upload.bytes,
        )
        .await
        .map_err(AppError::from)?;

    let extracted_text = state
        .pdf
        .extract_text(&upload.bytes)
        .map_err(|err| AppError::bad_request(err.to_string()))?;
    if extracted_text.trim().is_empty() {
        error!(document_uuid = %doc_uuid, "extraction produced no text");
        return Err(AppError::internal("Error extracting text from PDF."));
    }

    let new_document = NewDocument {
        id: Uuid::new_v4(),
        doc_uuid,
        user_id: user.user_id,
        filename: upload.filename.clone(),
        extracted_text,
        file_path,
    };

    diesel::insert_into(documents::table)
        .values(&new_document)
        .execute(&mut conn)?;

    info!(document_uuid = %doc_uuid, filename = %upload.filename, "document uploaded");

    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            message: format!(
                "PDF {} uploaded and text extracted successfully.",
                upload.filename
            ),
            uuid: doc_uuid,
        }),
    ))
}

pub async fn update_document(
    State(state): State<AppState>,
    Path(doc_uuid): Path<Uuid>,
    user: AuthenticatedUser,
    multipart: Multipart,
) -> AppResult<Json<UploadResponse>> {
    let upload = read_pdf_upload(&state, multipart).await?;

    let mut conn = state.db()?;
    let doc = find_owned_document(&mut conn, user.user_id, doc_uuid)?;

    let file_path = state
        .storage
        .save(
            &format!("{}_{doc_uuid}_update_{}", user.user_id, upload.filename),
            &upload.bytes,
        )
        .await
        .map_err(AppError::from)?;

    let new_text = state
        .pdf
        .extract_text(&upload.bytes)
        .map_err(|err| AppError::bad_request(err.to_string()))?;
    if new_text.trim().is_empty() {
        error!(document_uuid = %doc_uuid, "extraction produced no text");
        return Err(AppError::internal("Error extracting text from PDF."));
    }

    // Text accumulates across updates; each new extraction is appended
    // after a blank line, never replacing what is already there.
    let combined = format!("{}\n\n{}", doc.extracted_text, new_text);

    diesel::update(documents::table.find(doc.id))
        .set((
            documents::extracted_text.eq(combined),
            documents::filename.eq(&upload.filename),
            documents::file_path.eq(&file_path),
            documents::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(&mut conn)?;

    info!(document_uuid = %doc_uuid, filename = %upload.filename, "document updated");

    Ok(Json(UploadResponse {
        message: format!(
            "PDF {} updated and text extracted successfully.",
            upload.filename
        ),
        uuid: doc_uuid,
    }))
}

pub async fn query_document(
    State(state): State<AppState>,
    Path(doc_uuid): Path<Uuid>,
    Query(params): Query<QueryParams>,
    user: AuthenticatedUser,
) -> AppResult<Json<QueryResponse>> {
    let query = params.query;
    let chars = query.chars().count();
    if chars == 0 || chars > MAX_QUERY_CHARS {
        return Err(AppError::bad_request(format!(
            "query must be between 1 and {MAX_QUERY_CHARS} characters"
        )));
    }

    let mut conn = state.db()?;
    let doc = find_owned_document(&mut conn, user.user_id, doc_uuid)?;
    drop(conn);

    let llm_response = state.llm.answer(&doc.extracted_text, &query).await?;

    Ok(Json(QueryResponse {
        uuid: doc_uuid,
        query,
        llm_response,
    }))
}

pub async fn delete_document(
    State(state): State<AppState>,
    Path(doc_uuid): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<Json<MessageResponse>> {
    let mut conn = state.db()?;
    let doc = find_owned_document(&mut conn, user.user_id, doc_uuid)?;

    diesel::delete(documents::table.find(doc.id)).execute(&mut conn)?;
    drop(conn);

    // File removal is best effort; the row is already gone.
    if let Err(err) = state.storage.remove(&doc.file_path).await {
        warn!(document_uuid = %doc_uuid, error = %err, "failed to remove backing file");
    }

    info!(document_uuid = %doc_uuid, "document deleted");

    Ok(Json(MessageResponse {
        message: format!("Data for UUID {doc_uuid} deleted successfully."),
    }))
}

pub async fn list_uuids(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<ListDocumentsResponse>> {
    let mut conn = state.db()?;

    let docs: Vec<Document> = documents::table
        .filter(documents::user_id.eq(user.user_id))
        .order(documents::uploaded_at.desc())
        .load(&mut conn)?;

    let documents = docs
        .into_iter()
        .map(|doc| DocumentSummary {
            uuid: doc.doc_uuid,
            filename: doc.filename,
            uploaded_at: doc.uploaded_at.and_utc().to_rfc3339(),
        })
        .collect();

    Ok(Json(ListDocumentsResponse { documents }))
}

pub async fn download_document(
    State(state): State<AppState>,
    Path(doc_uuid): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<(HeaderMap, Vec<u8>)> {
    let mut conn = state.db()?;
    let doc = find_owned_document(&mut conn, user.user_id, doc_uuid)?;
    drop(conn);

    let bytes = state.storage.read(&doc.file_path).await.map_err(|err| {
        warn!(document_uuid = %doc_uuid, error = %err, "backing file missing");
        AppError::not_found()
    })?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/pdf"),
    );
    if let Some(disposition) = attachment_content_disposition(&doc.filename) {
        headers.insert(header::CONTENT_DISPOSITION, disposition);
    }

    Ok((headers, bytes))
}

pub async fn generate_summary(
    State(state): State<AppState>,
    Path(doc_uuid): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<Json<SummaryResponse>> {
    let mut conn = state.db()?;
    let doc = find_owned_document(&mut conn, user.user_id, doc_uuid)?;
    drop(conn);

    let summary = state
        .llm
        .summarize(&doc.extracted_text, &doc.filename)
        .await?;

    let generated_at = Utc::now();
    let mut conn = state.db()?;
    diesel::update(documents::table.find(doc.id))
        .set((
            documents::summary.eq(&summary),
            documents::summary_generated_at.eq(generated_at.naive_utc()),
        ))
        .execute(&mut conn)?;

    info!(document_uuid = %doc_uuid, "summary generated");

    Ok(Json(SummaryResponse {
        uuid: doc_uuid,
        summary,
        generated_at: generated_at.to_rfc3339(),
    }))
}

pub async fn get_summary(
    State(state): State<AppState>,
    Path(doc_uuid): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<Json<SummaryResponse>> {
    let mut conn = state.db()?;
    let doc = find_owned_document(&mut conn, user.user_id, doc_uuid)?;

    let (summary, generated_at) = match (doc.summary, doc.summary_generated_at) {
        (Some(summary), Some(generated_at)) => (summary, generated_at),
        _ => return Err(AppError::not_found()),
    };

    Ok(Json(SummaryResponse {
        uuid: doc_uuid,
        summary,
        generated_at: generated_at.and_utc().to_rfc3339(),
    }))
}
