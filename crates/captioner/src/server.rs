//! HTTP front for the captioning service.
//!
//! | Route            | Behavior                                            |
//! |------------------|-----------------------------------------------------|
//! | `POST /post`     | multipart upload → `{"response": {...}}`, always 200 |
//! | `GET /`          | redirect to `/home`                                 |
//! | `/home`, `/assets` | static front end from `server.static_dir`         |
//! | anything else    | redirect to `/home`                                 |
//!
//! Missing static files and wrong-method requests redirect to `/home` too,
//! the same as unknown routes.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::handler::HandlerWithoutStateExt;
use axum::response::Redirect;
use axum::routing::{any, get, post};
use axum::{Json, Router};
use captioner_core::{
    CaptionResponse, Captioner, Config, PipelineError, PipelineResult, UploadedFile,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;

/// Multipart framing allowance on top of the upload limit.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    captioner: Captioner,
    upload_field: Arc<str>,
}

impl AppState {
    pub fn new(captioner: Captioner, config: &Config) -> Self {
        Self {
            captioner,
            upload_field: Arc::from(config.server.upload_field.as_str()),
        }
    }
}

/// Build the application router.
pub fn router(state: AppState, config: &Config) -> Router {
    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_headers(Any)
        .allow_origin(Any);

    let mut app = Router::new()
        .route("/", any(redirect_home))
        .route("/post", post(caption_upload).fallback(redirect_home));

    let static_dir = &config.server.static_dir;
    if static_dir.is_dir() {
        let serve = |dir: PathBuf| {
            ServeDir::new(dir)
                .call_fallback_on_method_not_allowed(true)
                .fallback(redirect_home.into_service())
        };
        app = app
            .nest_service("/home", serve(static_dir.clone()))
            .nest_service("/assets", serve(static_dir.join("assets")));
    } else {
        tracing::warn!(
            "Static front end not found at {:?}; serving the API only",
            static_dir
        );
        app = app.route(
            "/home",
            get(|| async { "Captioner is running. POST an image to /post." })
                .fallback(redirect_home),
        );
    }

    app.fallback(redirect_home)
        .layer(DefaultBodyLimit::max(
            config.max_upload_bytes() + MULTIPART_OVERHEAD,
        ))
        .layer(cors)
        .with_state(state)
}

async fn redirect_home() -> Redirect {
    Redirect::temporary("/home")
}

/// Bind and serve until ctrl-c.
pub async fn serve(captioner: Captioner, config: &Config) -> anyhow::Result<()> {
    let app = router(AppState::new(captioner, config), config);

    let listener =
        tokio::net::TcpListener::bind((config.server.host.as_str(), config.server.port)).await?;
    tracing::info!("Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

async fn caption_upload(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Json<CaptionResponse> {
    let response = match read_upload(multipart, &state.upload_field).await {
        Ok(file) => state.captioner.respond(file).await,
        Err(e) => {
            tracing::warn!("Rejected request: {}", e);
            CaptionResponse::from_result(Err(e))
        }
    };
    Json(response)
}

/// Pull the configured file field out of a multipart body.
async fn read_upload(mut multipart: Multipart, field_name: &str) -> PipelineResult<UploadedFile> {
    loop {
        let field = multipart
            .next_field()
            .await
            .map_err(|e| PipelineError::Read {
                filename: "<multipart>".to_string(),
                message: e.body_text(),
            })?;
        let Some(field) = field else {
            return Err(PipelineError::Read {
                filename: "<multipart>".to_string(),
                message: format!("missing form field '{field_name}'"),
            });
        };
        if field.name() != Some(field_name) {
            continue;
        }

        let filename = field.file_name().unwrap_or_default().to_string();
        let content_type = field.content_type().map(str::to_string);
        let bytes = field.bytes().await.map_err(|e| PipelineError::Read {
            filename: filename.clone(),
            message: e.body_text(),
        })?;
        return Ok(UploadedFile::new(filename, content_type, bytes.to_vec()));
    }
}
