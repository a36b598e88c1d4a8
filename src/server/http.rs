//! HTTP surface for the installer wizard.
//!
//! Every `/api/install/*` route sits behind [`gate_layer`], which runs
//! the [`AccessGate`] and only lets `Granted` requests through. Wizard
//! sessions are tracked by an `install_session` cookie that maps to an
//! in-memory [`MemorySession`].

use anyhow::Result;
use axum::{
    Router,
    extract::{ConnectInfo, DefaultBodyLimit, Path, Query, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::actions::{ActionResult, ErrorKind, Installer};
use crate::config::Config;
use crate::gate::{
    AccessGate, GateDecision, GateRequest, MemorySession, client_ip, resolve_client_ip,
};
use crate::security::UploadedFile;

/// Cookie carrying the wizard session id.
pub const SESSION_COOKIE: &str = "install_session";

/// Header carrying the access token.
pub const TOKEN_HEADER: &str = "x-install-token";

/// Maximum number of live wizard sessions kept in memory.
const MAX_SESSIONS: usize = 100;

pub struct Server {
    config: Config,
}

struct SessionEntry {
    session: MemorySession,
    last_accessed: Instant,
}

pub struct AppState {
    gate: AccessGate,
    installer: Installer,
    sessions: Mutex<HashMap<String, SessionEntry>>,
    trust_proxy_headers: bool,
    session_ttl: Duration,
}

impl AppState {
    pub fn new(gate: AccessGate, installer: Installer) -> Self {
        let trust_proxy_headers = gate.config().trust_proxy_headers;
        let session_ttl = Duration::from_secs(gate.config().session_timeout_minutes * 60);
        Self {
            gate,
            installer: installer.with_source("http"),
            sessions: Mutex::new(HashMap::new()),
            trust_proxy_headers,
            session_ttl,
        }
    }
}

impl Server {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            config: config.clone(),
        })
    }

    pub async fn run(&self) -> Result<()> {
        let gate = AccessGate::new(&self.config.paths, self.config.gate.clone())?;
        let installer = Installer::from_config(&self.config);
        let state = Arc::new(AppState::new(gate, installer));

        // Drop sessions idle for well past the gate timeout
        let cleanup_state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                cleanup_expired_sessions(&cleanup_state).await;
            }
        });

        let body_limit = upload_body_limit(self.config.secrets.max_upload_bytes);
        let app = router(state).layer(DefaultBodyLimit::max(body_limit));

        let addr: SocketAddr =
            format!("{}:{}", self.config.server.bind, self.config.server.port).parse()?;

        info!("Starting installer on http://{}", addr);
        info!(
            app_root = %self.config.app_root().display(),
            "Run `install-guard token show` to read the access token"
        );

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;

        Ok(())
    }
}

/// Routes with the gate applied to the installer API.
pub fn router(state: Arc<AppState>) -> Router {
    let gated = Router::new()
        .route("/api/install/status", get(status))
        .route("/api/install/key", post(generate_key))
        .route("/api/install/certificate", post(upload_certificate))
        .route("/api/install/certificate/{name}", delete(delete_certificate))
        .route("/api/install/commands", get(list_commands))
        .route("/api/install/commands/run", post(run_command))
        .route_layer(middleware::from_fn_with_state(state.clone(), gate_layer));

    Router::new()
        .route("/health", get(health_check))
        .merge(gated)
        .layer(TraceLayer::new_for_http().make_span_with(request_span))
        .with_state(state)
}

/// Request span without the query string, which may carry the token.
fn request_span(request: &Request) -> tracing::Span {
    tracing::debug_span!(
        "request",
        method = %request.method(),
        path = %request.uri().path(),
        version = ?request.version(),
    )
}

/// Base64 inflates uploads by 4/3; leave room for the JSON around it.
fn upload_body_limit(max_upload_bytes: u64) -> usize {
    (max_upload_bytes as usize / 3 + 1) * 4 + 64 * 1024
}

async fn cleanup_expired_sessions(state: &Arc<AppState>) {
    let mut sessions = state.sessions.lock().await;
    let before_count = sessions.len();
    let ttl = state.session_ttl * 2;

    sessions.retain(|id, entry| {
        let expired = entry.last_accessed.elapsed() > ttl;
        if expired {
            debug!("Expiring wizard session: {}", id);
        }
        !expired
    });

    let removed = before_count - sessions.len();
    if removed > 0 {
        info!("Cleaned up {} idle wizard sessions", removed);
    }
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

async fn gate_layer(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TokenQuery>,
    request: Request,
    next: Next,
) -> Response {
    let gate_request = gate_request(&request, query.token, state.trust_proxy_headers);

    let (session_id, is_new) = match session_cookie(request.headers()) {
        Some(id) => (id, false),
        None => (uuid::Uuid::new_v4().to_string(), true),
    };

    let session = {
        let mut sessions = state.sessions.lock().await;
        if !sessions.contains_key(&session_id) && sessions.len() >= MAX_SESSIONS {
            evict_oldest(&mut sessions);
        }
        let entry = sessions
            .entry(session_id.clone())
            .or_insert_with(|| SessionEntry {
                session: MemorySession::new(),
                last_accessed: Instant::now(),
            });
        entry.last_accessed = Instant::now();
        entry.session.clone()
    };

    // The gate reads state files under a blocking flock
    let gate_state = state.clone();
    let checked = tokio::task::spawn_blocking(move || {
        let mut session = session;
        gate_state
            .gate
            .check_access(&gate_request, &mut session)
            .map(|decision| (decision, session))
    })
    .await;

    let decision = match checked {
        Ok(Ok((decision, session))) => {
            if let Some(entry) = state.sessions.lock().await.get_mut(&session_id) {
                entry.session = session;
            }
            Ok(decision)
        }
        Ok(Err(e)) => Err(e),
        Err(e) => Err(anyhow::Error::new(e)),
    };

    let mut response = match decision {
        Ok(GateDecision::Granted) => next.run(request).await,
        Ok(decision) => gate_refusal(decision),
        Err(e) => {
            tracing::error!(error = %e, "Access gate failed; refusing request");
            let result = ActionResult::failure(ErrorKind::Internal, e.to_string()).for_client();
            (StatusCode::INTERNAL_SERVER_ERROR, Json(result)).into_response()
        }
    };

    if is_new
        && let Ok(cookie) = HeaderValue::from_str(&format!(
            "{SESSION_COOKIE}={session_id}; Path=/; HttpOnly; SameSite=Strict"
        ))
    {
        response.headers_mut().append(header::SET_COOKIE, cookie);
    }
    response
}

fn gate_request(request: &Request, query_token: Option<String>, trust_proxy: bool) -> GateRequest {
    let headers = request.headers();
    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    GateRequest {
        token: headers
            .get(TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or(query_token),
        client_ip: resolve_client_ip(headers, remote, trust_proxy),
        user_agent: client_ip::user_agent(headers),
    }
}

fn evict_oldest(sessions: &mut HashMap<String, SessionEntry>) {
    if let Some(oldest) = sessions
        .iter()
        .min_by_key(|(_, entry)| entry.last_accessed)
        .map(|(id, _)| id.clone())
    {
        sessions.remove(&oldest);
    }
}

fn session_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.to_string())
        .filter(|value| uuid::Uuid::parse_str(value).is_ok())
}

fn gate_refusal(decision: GateDecision) -> Response {
    let (code, message) = match decision {
        GateDecision::Blocked => (
            StatusCode::TOO_MANY_REQUESTS,
            "Too many failed attempts. Try again later.",
        ),
        GateDecision::TokenRequired => (
            StatusCode::UNAUTHORIZED,
            "An installer access token is required.",
        ),
        GateDecision::TokenInvalid(_) => (StatusCode::FORBIDDEN, "Invalid installer access token."),
        GateDecision::SessionExpired => (
            StatusCode::UNAUTHORIZED,
            "Your installer session has expired.",
        ),
        GateDecision::Granted => (StatusCode::OK, ""),
    };
    (
        code,
        Json(json!({ "status": decision.status(), "message": message })),
    )
        .into_response()
}

/// ActionResult with the HTTP status its error kind implies.
struct ApiResult(ActionResult);

impl IntoResponse for ApiResult {
    fn into_response(self) -> Response {
        let code = match self.0.error_kind() {
            None => StatusCode::OK,
            Some(kind) => match kind.public() {
                ErrorKind::SecretUnavailable => StatusCode::NOT_FOUND,
                ErrorKind::NotWhitelisted => StatusCode::FORBIDDEN,
                ErrorKind::KeyAlreadyExists => StatusCode::CONFLICT,
                ErrorKind::PrerequisiteMissing | ErrorKind::InvalidKey => {
                    StatusCode::PRECONDITION_FAILED
                }
                ErrorKind::InvalidUpload | ErrorKind::UnsupportedType | ErrorKind::InvalidName => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                ErrorKind::CommandFailed
                | ErrorKind::WriteFailure
                | ErrorKind::PersistenceError
                | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                _ => StatusCode::BAD_REQUEST,
            },
        };
        (code, Json(self.0.for_client())).into_response()
    }
}

async fn health_check() -> &'static str {
    "OK"
}

async fn status(State(state): State<Arc<AppState>>) -> ApiResult {
    ApiResult(state.installer.status())
}

#[derive(Deserialize)]
struct GenerateKeyRequest {
    #[serde(default)]
    force: bool,
}

async fn generate_key(
    State(state): State<Arc<AppState>>,
    Json(request): Json<GenerateKeyRequest>,
) -> ApiResult {
    ApiResult(state.installer.generate_key(request.force))
}

#[derive(Deserialize)]
struct CertificateUpload {
    /// Name to store under; defaults to the uploaded filename.
    name: Option<String>,
    filename: String,
    /// File content, standard base64.
    content: String,
    password: Option<String>,
}

async fn upload_certificate(
    State(state): State<Arc<AppState>>,
    Json(upload): Json<CertificateUpload>,
) -> ApiResult {
    let bytes = match BASE64.decode(upload.content.trim()) {
        Ok(bytes) => bytes,
        Err(e) => {
            return ApiResult(ActionResult::failure(
                ErrorKind::InvalidUpload,
                format!("content is not valid base64: {e}"),
            ));
        }
    };

    let name = upload.name.unwrap_or_else(|| upload.filename.clone());
    let file = UploadedFile {
        original_name: upload.filename,
        bytes,
    };
    let password = upload.password.as_deref().filter(|p| !p.is_empty());
    ApiResult(state.installer.store_certificate(&file, &name, password))
}

async fn delete_certificate(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult {
    ApiResult(state.installer.delete_secret(&name))
}

async fn list_commands(State(state): State<Arc<AppState>>) -> ApiResult {
    ApiResult(state.installer.list_commands())
}

#[derive(Deserialize)]
struct RunCommandRequest {
    binary: String,
    #[serde(default)]
    args: Vec<String>,
}

async fn run_command(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RunCommandRequest>,
) -> ApiResult {
    ApiResult(
        state
            .installer
            .run_command(&request.binary, &request.args)
            .await,
    )
}
