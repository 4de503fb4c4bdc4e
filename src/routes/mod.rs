use axum::http::HeaderValue;
use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post, put},
    Router,
};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::state::AppState;

pub mod auth;
pub mod chat;
pub mod documents;
pub mod health;

// Uploads are rejected by our own 10 MiB check; the transport limit only
// needs headroom for multipart framing.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

pub fn create_router(state: AppState) -> Router<()> {
    let cors = if let Some(origins) = state.config.cors_allowed_origin.as_ref() {
        let headers: Vec<HeaderValue> = origins
            .split(',')
            .filter_map(|value| {
                let trimmed = value.trim();
                (!trimmed.is_empty()).then(|| {
                    trimmed
                        .parse::<HeaderValue>()
                        .expect("invalid CORS allowed origin")
                })
            })
            .collect();

        CorsLayer::new()
            .allow_origin(AllowOrigin::list(headers))
            .allow_methods(tower_http::cors::AllowMethods::mirror_request())
            .allow_headers(tower_http::cors::AllowHeaders::mirror_request())
            .allow_credentials(true)
    } else {
        CorsLayer::new()
            .allow_origin(AllowOrigin::mirror_request())
            .allow_methods(tower_http::cors::AllowMethods::mirror_request())
            .allow_headers(tower_http::cors::AllowHeaders::mirror_request())
            .allow_credentials(true)
    };

    let auth_routes = Router::new()
        .route("/register", post(auth::register))
        .route("/login", post(auth::login));

    let document_routes = Router::new()
        .route("/upload/:uuid", post(documents::upload_document))
        .route("/update/:uuid", put(documents::update_document))
        .route("/query/:uuid", get(documents::query_document))
        .route("/delete/:uuid", delete(documents::delete_document))
        .route("/list_uuids", get(documents::list_uuids))
        .route("/download/:uuid", get(documents::download_document))
        .route("/summarize/:uuid", post(documents::generate_summary))
        .route("/summary/:uuid", get(documents::get_summary));

    let chat_routes = Router::new()
        .route("/start/:document_uuid", post(chat::start_conversation))
        .route(
            "/continue/:conversation_uuid",
            post(chat::continue_conversation),
        )
        .route("/conversations", get(chat::list_conversations))
        .route(
            "/conversation/:conversation_uuid",
            get(chat::get_conversation).delete(chat::delete_conversation),
        );

    Router::new()
        .nest("/api/v1", document_routes)
        .nest("/api/v1/chat", chat_routes)
        .nest("/api/v1/auth", auth_routes)
        .route("/api/v1/health", get(health::health_check))
        .with_state(state)
        .layer(cors)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
}
