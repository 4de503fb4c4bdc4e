use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, ensure, Context, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use diesel::connection::SimpleConnection;
use diesel::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use docuchat::auth::jwt::JwtService;
use docuchat::config::AppConfig;
use docuchat::db::{self, PgPool};
use docuchat::llm::{GatewayError, HistoryMessage, LlmGateway};
use docuchat::pdf::{PdfError, PdfExtractor};
use docuchat::routes;
use docuchat::state::AppState;
use docuchat::storage::LocalStorage;
use http_body_util::BodyExt;
use once_cell::sync::Lazy;
use serde::Serialize;
use tempfile::TempDir;
use tokio::sync::Mutex;
use tower::util::ServiceExt;
use uuid::Uuid;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

static DB_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Scripted stand-in for the generative-text collaborator. Responses
/// encode their inputs so tests can assert the right call was made.
#[derive(Default)]
pub struct FakeLlm {
    fail_titles: AtomicBool,
    fail_answers: AtomicBool,
}

impl FakeLlm {
    #[allow(dead_code)]
    pub fn fail_titles(&self) {
        self.fail_titles.store(true, Ordering::SeqCst);
    }

    #[allow(dead_code)]
    pub fn fail_answers(&self) {
        self.fail_answers.store(true, Ordering::SeqCst);
    }

    fn answers_failing(&self) -> Result<(), GatewayError> {
        if self.fail_answers.load(Ordering::SeqCst) {
            return Err(GatewayError::Status {
                status: 503,
                body: "model overloaded".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl LlmGateway for FakeLlm {
    async fn answer(&self, _context: &str, query: &str) -> Result<String, GatewayError> {
        self.answers_failing()?;
        Ok(format!("Answer: {query}"))
    }

    async fn answer_with_history(
        &self,
        _context: &str,
        history: &[HistoryMessage],
        query: &str,
    ) -> Result<String, GatewayError> {
        self.answers_failing()?;
        Ok(format!("Answer ({} prior): {query}", history.len()))
    }

    async fn summarize(&self, _context: &str, label: &str) -> Result<String, GatewayError> {
        self.answers_failing()?;
        Ok(format!("Summary of {label}"))
    }

    async fn title_for(&self, first_message: &str) -> Result<String, GatewayError> {
        if self.fail_titles.load(Ordering::SeqCst) {
            return Err(GatewayError::EmptyResponse);
        }
        let prefix: String = first_message.chars().take(20).collect();
        Ok(format!("Title: {prefix}"))
    }
}

/// Fake PDF introspection: bytes must start with `%PDF`, pages are
/// separated by form feeds, and everything after the first newline is
/// the extractable text.
pub struct FakeExtractor;

impl PdfExtractor for FakeExtractor {
    fn page_count(&self, bytes: &[u8]) -> Result<usize, PdfError> {
        if !bytes.starts_with(b"%PDF") {
            return Err(PdfError::Invalid("missing PDF header".to_string()));
        }
        Ok(bytes.iter().filter(|b| **b == b'\x0c').count() + 1)
    }

    fn extract_text(&self, bytes: &[u8]) -> Result<String, PdfError> {
        if !bytes.starts_with(b"%PDF") {
            return Err(PdfError::Invalid("missing PDF header".to_string()));
        }
        let body = bytes
            .splitn(2, |b| *b == b'\n')
            .nth(1)
            .unwrap_or_default();
        Ok(String::from_utf8_lossy(body).replace('\x0c', ""))
    }
}

/// Builds fake PDF bytes whose extracted text is exactly `text`.
#[allow(dead_code)]
pub fn pdf_bytes(text: &str) -> Vec<u8> {
    format!("%PDF\n{text}").into_bytes()
}

/// Builds fake PDF bytes reporting `pages` pages.
#[allow(dead_code)]
pub fn pdf_bytes_with_pages(text: &str, pages: usize) -> Vec<u8> {
    let mut bytes = format!("%PDF{}", "\x0c".repeat(pages.saturating_sub(1))).into_bytes();
    bytes.extend(format!("\n{text}").as_bytes());
    bytes
}

pub struct TestApp {
    pub state: AppState,
    router: Router,
    llm: Arc<FakeLlm>,
    // Held so the upload directory outlives the test.
    _upload_dir: TempDir,
}

impl TestApp {
    pub async fn new() -> Result<Self> {
        let database_url = env::var("TEST_DATABASE_URL")
            .context("TEST_DATABASE_URL must be set for integration tests")?;

        let upload_dir = tempfile::tempdir().context("failed to create upload tempdir")?;

        let config = AppConfig {
            database_url: database_url.clone(),
            database_max_pool_size: db::DEFAULT_MAX_POOL_SIZE,
            server_host: "127.0.0.1".to_string(),
            server_port: 0,
            jwt_secret: "test-secret".to_string(),
            jwt_issuer: "test-issuer".to_string(),
            jwt_audience: "test-audience".to_string(),
            jwt_expiry_minutes: 60,
            upload_dir: upload_dir.path().to_string_lossy().into_owned(),
            cors_allowed_origin: None,
            gemini_api_key: "test-key".to_string(),
            gemini_model: "test-model".to_string(),
            gemini_api_base: "http://127.0.0.1:1".to_string(),
        };

        let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
        prepare_database(&pool).await?;

        let storage = LocalStorage::new(upload_dir.path());
        let llm = Arc::new(FakeLlm::default());
        let jwt = JwtService::from_config(&config)?;
        let state = AppState::new(
            pool,
            config,
            Arc::new(storage),
            Arc::new(FakeExtractor),
            llm.clone(),
            jwt,
        );
        let router = routes::create_router(state.clone());

        Ok(Self {
            state,
            router,
            llm,
            _upload_dir: upload_dir,
        })
    }

    #[allow(dead_code)]
    pub fn llm(&self) -> Arc<FakeLlm> {
        self.llm.clone()
    }

    pub async fn cleanup(&self) -> Result<()> {
        let pool = self.state.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("failed to get cleanup connection: {err}"))?;
            truncate_all(&mut conn)?;
            Ok(())
        })
        .await
        .context("cleanup task panicked")?
    }

    pub async fn register(&self, username: &str, password: &str) -> Result<StatusCode> {
        #[derive(Serialize)]
        struct RegisterPayload<'a> {
            username: &'a str,
            password: &'a str,
        }

        let response = self
            .post_json(
                "/api/v1/auth/register",
                &RegisterPayload { username, password },
                None,
            )
            .await?;
        Ok(response.status())
    }

    pub async fn login_token(&self, username: &str, password: &str) -> Result<String> {
        #[derive(Serialize)]
        struct LoginPayload<'a> {
            username: &'a str,
            password: &'a str,
        }

        let response = self
            .post_json(
                "/api/v1/auth/login",
                &LoginPayload { username, password },
                None,
            )
            .await?;

        ensure!(
            response.status() == StatusCode::OK,
            "login failed with status {}",
            response.status()
        );

        let body = body_to_vec(response.into_body()).await?;
        #[derive(serde::Deserialize)]
        struct LoginResponse {
            access_token: String,
        }
        let parsed: LoginResponse = serde_json::from_slice(&body)?;
        Ok(parsed.access_token)
    }

    /// Registers a fresh user and returns a bearer token for it.
    pub async fn user_token(&self, username: &str) -> Result<String> {
        let status = self.register(username, "s3cret").await?;
        ensure!(
            status == StatusCode::CREATED,
            "registration failed with status {status}"
        );
        self.login_token(username, "s3cret").await
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        let body = serde_json::to_vec(payload)?;
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = builder.body(Body::from(body))?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    pub async fn get(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        let mut builder = Request::builder().method(Method::GET).uri(path);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = builder.body(Body::empty())?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    #[allow(dead_code)]
    pub async fn delete(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        let builder = Request::builder().method(Method::DELETE).uri(path);
        let builder = if let Some(token) = token {
            builder.header("authorization", format!("Bearer {token}"))
        } else {
            builder
        };
        let request = builder.body(Body::empty())?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    #[allow(dead_code)]
    pub async fn send_pdf(
        &self,
        method: Method,
        path: &str,
        filename: &str,
        content_type: &str,
        data: &[u8],
        token: &str,
    ) -> Result<hyper::Response<Body>> {
        let boundary = format!("boundary-{}", Uuid::new_v4());
        let mut body = Vec::new();
        body.extend(format!("--{boundary}\r\n").as_bytes());
        body.extend(
            format!(
                "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\n",
                filename
            )
            .as_bytes(),
        );
        body.extend(format!("Content-Type: {}\r\n\r\n", content_type).as_bytes());
        body.extend(data);
        body.extend(b"\r\n");
        body.extend(format!("--{boundary}--\r\n").as_bytes());

        let request = Request::builder()
            .method(method)
            .uri(path)
            .header(
                "content-type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .header("authorization", format!("Bearer {token}"))
            .body(Body::from(body))?;

        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    #[allow(dead_code)]
    pub async fn upload_pdf(
        &self,
        doc_uuid: Uuid,
        filename: &str,
        data: &[u8],
        token: &str,
    ) -> Result<hyper::Response<Body>> {
        self.send_pdf(
            Method::POST,
            &format!("/api/v1/upload/{doc_uuid}"),
            filename,
            "application/pdf",
            data,
            token,
        )
        .await
    }

    #[allow(dead_code)]
    pub async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut PgConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.state.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("failed to get database connection: {err}"))?;
            f(&mut conn)
        })
        .await
        .context("connection task panicked")?
    }
}

pub async fn acquire_db_lock() -> tokio::sync::MutexGuard<'static, ()> {
    DB_LOCK.lock().await
}

pub async fn body_to_vec(body: Body) -> Result<Vec<u8>> {
    let collected = body
        .collect()
        .await
        .map_err(|err| anyhow!("failed to read response body: {err}"))?;
    Ok(collected.to_bytes().to_vec())
}

#[allow(dead_code)]
pub async fn body_to_json(body: Body) -> Result<serde_json::Value> {
    let bytes = body_to_vec(body).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

async fn prepare_database(pool: &PgPool) -> Result<()> {
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut conn = pool
            .get()
            .map_err(|err| anyhow!("failed to acquire connection: {err}"))?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|err| anyhow!("failed to run migrations: {err}"))?;
        truncate_all(&mut conn)?;
        Ok(())
    })
    .await
    .context("migration task panicked")?
}

fn truncate_all(conn: &mut PgConnection) -> Result<()> {
    conn.batch_execute(
        "TRUNCATE TABLE chat_messages, conversations, documents, users RESTART IDENTITY CASCADE;",
    )
    .context("failed to truncate tables")?;
    Ok(())
}
