//! HTTP control server
//!
//! Remote start/stop/status for board recordings. Every route answers HTTP 200
//! with the same JSON envelope; failures set `status: "error"`, list their
//! messages in `details` and carry the error kind tag.
//!
//! ```text
//! GET /start/:board?bidsroot=&sub=&ses=&task=&run=&data_type=&modality=&...
//! GET /stop/:board?serial_port=&ip_address=&...
//! GET /status/:board?serial_port=&ip_address=&...
//! GET /boards
//! GET /health
//! ```

use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    http::{Method, StatusCode},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use senserecord_core::session::BoardStatus;
use senserecord_core::{
    AppConfig, BoardDescriptor, BoardKind, ConflictPolicy, ConnectionParams, IdentifierInput,
    RecordError, SessionController, StartParams,
};

/// Shared state for the HTTP handlers
#[derive(Clone)]
pub struct ApiState {
    pub controller: Arc<SessionController>,
    pub config: Arc<AppConfig>,
}

/// Response envelope shared by every route
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub status: String,
    pub result: serde_json::Value,
    pub details: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

impl Envelope {
    fn ok(result: serde_json::Value, details: Vec<String>) -> Self {
        Self {
            status: "ok".to_string(),
            result,
            details,
            error_kind: None,
        }
    }

    fn error(result: serde_json::Value, error: &RecordError) -> Self {
        Self {
            status: "error".to_string(),
            result,
            details: vec![error.to_string()],
            error_kind: Some(error.kind().to_string()),
        }
    }
}

fn board_result(status: &BoardStatus) -> serde_json::Value {
    serde_json::json!({ "board": status })
}

/// Query parameters of `/start/:board`
///
/// Everything arrives as text so malformed values are reported in the envelope
/// rather than rejected by the extractor.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartQuery {
    pub bidsroot: Option<String>,
    pub sub: Option<String>,
    pub ses: Option<String>,
    pub task: Option<String>,
    pub run: Option<String>,
    pub data_type: Option<String>,
    pub modality: Option<String>,
    pub acq: Option<String>,
    pub serial_port: Option<String>,
    pub ip_address: Option<String>,
    pub ip_port: Option<String>,
    pub ip_protocol: Option<String>,
    pub timeout: Option<String>,
    pub mac_address: Option<String>,
    pub serial_number: Option<String>,
    pub other_info: Option<String>,
    pub file: Option<String>,
    pub on_conflict: Option<String>,
}

impl StartQuery {
    fn into_params(self, board: &str) -> Result<StartParams, RecordError> {
        let connection = BoardQuery {
            task: None,
            serial_port: self.serial_port,
            ip_address: self.ip_address,
            ip_port: self.ip_port,
            ip_protocol: self.ip_protocol,
            timeout: self.timeout,
            mac_address: self.mac_address,
            serial_number: self.serial_number,
            other_info: self.other_info,
            file: self.file,
        }
        .into_connection()?;
        let on_conflict = non_empty(self.on_conflict)
            .map(|value| value.parse::<ConflictPolicy>())
            .transpose()?;

        Ok(StartParams {
            board_name: board.to_string(),
            identifiers: IdentifierInput {
                sub: non_empty(self.sub),
                ses: non_empty(self.ses),
                task: non_empty(self.task),
                run: non_empty(self.run),
                data_type: non_empty(self.data_type),
                modality: non_empty(self.modality),
                acq: non_empty(self.acq),
            },
            root: non_empty(self.bidsroot).map(PathBuf::from),
            connection,
            on_conflict,
        })
    }
}

/// Query parameters of `/stop/:board` and `/status/:board`
///
/// The connection fields pick out one device when boards are identified by
/// name and connection; config defaults fill the gaps as they do for `/start`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BoardQuery {
    pub task: Option<String>,
    pub serial_port: Option<String>,
    pub ip_address: Option<String>,
    pub ip_port: Option<String>,
    pub ip_protocol: Option<String>,
    pub timeout: Option<String>,
    pub mac_address: Option<String>,
    pub serial_number: Option<String>,
    pub other_info: Option<String>,
    pub file: Option<String>,
}

impl BoardQuery {
    fn into_connection(self) -> Result<ConnectionParams, RecordError> {
        Ok(ConnectionParams {
            serial_port: non_empty(self.serial_port),
            ip_address: non_empty(self.ip_address),
            ip_port: parse_number("ip_port", self.ip_port)?,
            ip_protocol: parse_number("ip_protocol", self.ip_protocol)?,
            timeout: parse_number("timeout", self.timeout)?,
            mac_address: non_empty(self.mac_address),
            serial_number: non_empty(self.serial_number),
            other_info: non_empty(self.other_info),
            file: non_empty(self.file),
        })
    }

    /// Descriptor of `board` with config connection defaults applied
    fn descriptor(self, config: &AppConfig, board: &str) -> Result<BoardDescriptor, RecordError> {
        let task = non_empty(self.task.clone());
        let connection = self.into_connection()?;
        let defaults = config.defaults_for(task.as_deref(), board)?;
        Ok(BoardDescriptor::new(board).with_connection(connection.or(&defaults.connection)))
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_number<T: std::str::FromStr>(
    field: &str,
    value: Option<String>,
) -> Result<Option<T>, RecordError> {
    match non_empty(value) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| RecordError::InvalidIdentifier {
                field: field.to_string(),
                reason: format!("'{raw}' is not a valid number"),
            }),
    }
}

/// Build the control router
pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/boards", get(boards_handler))
        .route("/start/:board", get(start_handler))
        .route("/stop/:board", get(stop_handler))
        .route("/status/:board", get(status_handler))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Serve until `shutdown` resolves, then release every board
pub async fn run_server(
    state: ApiState,
    host: &str,
    port: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), String> {
    let controller = Arc::clone(&state.controller);
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| format!("Failed to bind to {addr}: {e}"))?;

    eprintln!("[SENSERECORD] Listening on http://{addr}");
    info!("Control server listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| format!("Server error: {e}"))?;

    info!("Control server stopped, releasing boards");
    controller
        .shutdown()
        .await
        .map_err(|e| format!("Failed to release boards: {e}"))
}

/// Health check endpoint
async fn health_handler() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn start_handler(
    State(state): State<ApiState>,
    Path(board): Path<String>,
    query: Result<Query<StartQuery>, QueryRejection>,
) -> Json<Envelope> {
    if let Some(rejected) = reject_unknown(&board) {
        return rejected;
    }
    let bare = BoardDescriptor::new(board.as_str());
    let params = match extracted(query).and_then(|query| query.into_params(&board)) {
        Ok(params) => params,
        Err(e) => return Json(Envelope::error(current_status(&state, &bare).await, &e)),
    };

    let defaults = match state
        .config
        .defaults_for(params.identifiers.task.as_deref(), &board)
    {
        Ok(defaults) => defaults,
        Err(e) => return Json(Envelope::error(current_status(&state, &bare).await, &e)),
    };
    let descriptor = BoardDescriptor::new(board.as_str())
        .with_connection(params.connection.clone().or(&defaults.connection));

    let missing = params.missing_fields(&defaults);
    if !missing.is_empty() {
        let mut envelope = Envelope::error(
            current_status(&state, &descriptor).await,
            &RecordError::InvalidIdentifier {
                field: missing[0].to_string(),
                reason: "value is required".to_string(),
            },
        );
        envelope.details = missing
            .iter()
            .map(|field| format!("Missing required query parameter: {field}"))
            .collect();
        return Json(envelope);
    }

    let request = match params.resolve(&defaults) {
        Ok(request) => request,
        Err(e) => return Json(Envelope::error(current_status(&state, &descriptor).await, &e)),
    };
    let identity = state.controller.identity_for(&request.descriptor);

    let controller = Arc::clone(&state.controller);
    match detached(async move { controller.start_recording(request).await }).await {
        Ok(handle) => Json(Envelope::ok(
            board_result(&handle.status),
            vec![format!("Now recording to {}", handle.data_path().display())],
        )),
        Err(e) => {
            let status = state.controller.query_status(&identity).await;
            Json(Envelope::error(board_result(&status), &e))
        }
    }
}

async fn stop_handler(
    State(state): State<ApiState>,
    Path(board): Path<String>,
    query: Result<Query<BoardQuery>, QueryRejection>,
) -> Json<Envelope> {
    let descriptor = match extracted(query).and_then(|query| query.descriptor(&state.config, &board)) {
        Ok(descriptor) => descriptor,
        Err(e) => {
            let bare = BoardDescriptor::new(board.as_str());
            return Json(Envelope::error(current_status(&state, &bare).await, &e));
        }
    };
    let identity = state.controller.identity_for(&descriptor);

    let controller = Arc::clone(&state.controller);
    let stopping = identity.clone();
    match detached(async move { controller.stop_recording(&stopping).await }).await {
        Ok(status) => Json(Envelope::ok(
            board_result(&status),
            vec![format!("{identity} stopped recording")],
        )),
        Err(e) => {
            let status = state.controller.query_status(&identity).await;
            Json(Envelope::error(board_result(&status), &e))
        }
    }
}

async fn status_handler(
    State(state): State<ApiState>,
    Path(board): Path<String>,
    query: Result<Query<BoardQuery>, QueryRejection>,
) -> Json<Envelope> {
    if let Some(rejected) = reject_unknown(&board) {
        return rejected;
    }
    match extracted(query).and_then(|query| query.descriptor(&state.config, &board)) {
        Ok(descriptor) => Json(Envelope::ok(current_status(&state, &descriptor).await, Vec::new())),
        Err(e) => {
            let bare = BoardDescriptor::new(board.as_str());
            Json(Envelope::error(current_status(&state, &bare).await, &e))
        }
    }
}

async fn boards_handler(State(state): State<ApiState>) -> Json<Envelope> {
    let boards: Vec<serde_json::Value> = state
        .controller
        .list()
        .await
        .into_iter()
        .map(|(identity, status)| serde_json::json!({ "identity": identity, "board": status }))
        .collect();
    Json(Envelope::ok(serde_json::json!({ "boards": boards }), Vec::new()))
}

fn reject_unknown(board: &str) -> Option<Json<Envelope>> {
    board.parse::<BoardKind>().err().map(|e| {
        Json(Envelope::error(
            board_result(&BoardStatus::not_connected(board)),
            &e,
        ))
    })
}

async fn current_status(state: &ApiState, descriptor: &BoardDescriptor) -> serde_json::Value {
    let identity = state.controller.identity_for(descriptor);
    board_result(&state.controller.query_status(&identity).await)
}

/// Unwrap a query, reporting a malformed one as an envelope error
fn extracted<T>(query: Result<Query<T>, QueryRejection>) -> Result<T, RecordError> {
    query
        .map(|Query(query)| query)
        .map_err(|rejection| RecordError::InvalidIdentifier {
            field: "query".to_string(),
            reason: rejection.body_text(),
        })
}

/// Run a controller call on its own task
///
/// A client that disconnects drops the handler future; the recording
/// lifecycle must not be dropped with it.
async fn detached<T, F>(call: F) -> Result<T, RecordError>
where
    T: Send + 'static,
    F: std::future::Future<Output = Result<T, RecordError>> + Send + 'static,
{
    tokio::spawn(call)
        .await
        .map_err(|e| RecordError::IoError(format!("Request task failed: {e}")))?
}
