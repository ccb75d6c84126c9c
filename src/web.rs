use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::signal;

use crate::profile::LocateError;
use crate::semantic::{IndexStatus, RefreshReport, SearchError, SearchHit, SearchPipeline};

const INDEX_HTML: &str = r#"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<title>marksearch</title>
<style>
  body { font-family: sans-serif; max-width: 48rem; margin: 2rem auto; }
  input { width: 100%; font-size: 1.2rem; padding: .4rem; }
  li { margin: .5rem 0; }
  .score { color: #888; font-size: .8rem; }
</style>
</head>
<body>
<h1>marksearch</h1>
<form id="search">
  <input id="query" placeholder="What are you looking for?" autofocus>
</form>
<p id="message"></p>
<ol id="results"></ol>
<script>
document.getElementById("search").addEventListener("submit", async (event) => {
  event.preventDefault();
  const query = document.getElementById("query").value;
  const results = document.getElementById("results");
  const message = document.getElementById("message");
  results.innerHTML = "";
  message.textContent = "";
  const response = await fetch("/api/search", {
    method: "POST",
    headers: { "content-type": "application/json" },
    body: JSON.stringify({ query }),
  });
  const isJson = (response.headers.get("content-type") || "").includes("application/json");
  const body = isJson ? await response.json() : await response.text();
  if (!response.ok) {
    message.textContent = isJson ? body.error : body;
    return;
  }
  for (const hit of body) {
    const item = document.createElement("li");
    const link = document.createElement("a");
    link.href = hit.url;
    link.textContent = hit.title || hit.url;
    const score = document.createElement("span");
    score.className = "score";
    score.textContent = " " + hit.score.toFixed(3);
    item.append(link, score);
    results.append(item);
  }
});
</script>
</body>
</html>
"#;

#[derive(Clone)]
pub struct SharedState {
    pipeline: Arc<Mutex<SearchPipeline>>,
    default_k: usize,
}

impl SharedState {
    pub fn new(pipeline: SearchPipeline, default_k: usize) -> Self {
        Self {
            pipeline: Arc::new(Mutex::new(pipeline)),
            default_k,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SearchPipeline> {
        self.pipeline.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` against the pipeline on a thread that may block.
    fn with_pipeline<T>(&self, f: impl FnOnce(&mut SearchPipeline) -> T) -> T {
        tokio::task::block_in_place(|| f(&mut *self.lock()))
    }
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/search", post(search))
        .route("/api/status", get(status))
        .route("/api/refresh", post(refresh))
        .route("/api/rebuild", post(rebuild))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(state)
}

async fn start_app(state: SharedState, addr: &str) -> anyhow::Result<()> {
    // bring the index up to date in the background; it holds the pipeline,
    // so requests arriving meanwhile wait for it to finish
    let refresher = state.clone();
    tokio::task::spawn_blocking(move || {
        if let Err(err) = refresher.lock().ensure_index_fresh() {
            log::error!("startup refresh failed: {err}");
        }
    });

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    log::info!("listening on {addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                log::error!("failed to install signal handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::warn!("shutting down");
}

pub fn start_daemon(pipeline: SearchPipeline, default_k: usize, addr: &str) -> anyhow::Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?
        .block_on(start_app(SharedState::new(pipeline, default_k), addr))
}

#[derive(Debug)]
struct HttpError(SearchError);

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self.0 {
            SearchError::EmptyIndex => StatusCode::CONFLICT,
            SearchError::Locate(LocateError::ProfileNotFound { .. }) => StatusCode::NOT_FOUND,
            _ => {
                log::error!("{self:?}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(json!({"error": self.0.to_string()}))).into_response()
    }
}

impl From<SearchError> for HttpError {
    fn from(err: SearchError) -> Self {
        Self(err)
    }
}

#[derive(Debug, Deserialize)]
struct SearchRequest {
    query: String,
    k: Option<usize>,
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn search(
    State(state): State<SharedState>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<Vec<SearchHit>>, HttpError> {
    let k = request.k.unwrap_or(state.default_k);
    let hits = state.with_pipeline(|pipeline| pipeline.search(&request.query, k))?;
    Ok(Json(hits))
}

async fn status(State(state): State<SharedState>) -> Result<Json<IndexStatus>, HttpError> {
    let status = state.with_pipeline(|pipeline| {
        pipeline.load_index()?;
        Ok::<_, SearchError>(pipeline.status())
    })?;
    Ok(Json(status))
}

async fn refresh(State(state): State<SharedState>) -> Result<Json<RefreshReport>, HttpError> {
    let report = state.with_pipeline(|pipeline| pipeline.ensure_index_fresh())?;
    Ok(Json(report))
}

async fn rebuild(State(state): State<SharedState>) -> Result<Json<RefreshReport>, HttpError> {
    let report = state.with_pipeline(|pipeline| pipeline.rebuild(&mut |_, _| {}))?;
    Ok(Json(report))
}
