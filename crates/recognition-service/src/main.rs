use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use recognition_api::{
    load_weight_config, AddRecognitionRequest, AddRecognitionResult, CreateProfileRequest,
    MigrateResult, RecognitionApi, RegisterUserRequest, RequestMetadata, API_CONTRACT_VERSION,
};
use recognition_core::{
    ChainVerification, ProfileId, ProfileRecord, ProfileStatus, RecognitionAggregate,
    RecognitionError, RecognitionType, RecognitionView, UserId, UserRecord, VerificationStatus,
    WeightConfig,
};
use recognition_store_sqlite::SchemaStatus;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: RecognitionApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    kind: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct VerificationRequest {
    verification: VerificationStatus,
}

#[derive(Debug, Clone, Deserialize)]
struct ProfileStatusRequest {
    status: ProfileStatus,
}

#[derive(Debug, Clone, Deserialize)]
struct RecognitionBody {
    recognizer_id: UserId,
    recognition_type: RecognitionType,
    #[serde(default)]
    relationship: Option<String>,
    #[serde(default)]
    notes: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct AsOfQuery {
    as_of: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "recognition-service")]
#[command(about = "Local HTTP service for the recognition ledger")]
struct Args {
    #[arg(long, env = "RECOGNITION_DB", default_value = "./recognition.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "RECOGNITION_BIND", default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    /// YAML weight table; built-in defaults apply when omitted.
    #[arg(long, env = "RECOGNITION_WEIGHTS")]
    weights: Option<PathBuf>,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self { status, service_contract_version: SERVICE_CONTRACT_VERSION, kind, error: message.into() }
    }

    fn internal() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", "internal error")
    }

    fn from_domain(err: &RecognitionError) -> Self {
        let status = match err {
            RecognitionError::NotFound(_) => StatusCode::NOT_FOUND,
            RecognitionError::Forbidden(_) => StatusCode::FORBIDDEN,
            RecognitionError::Conflict(_) => StatusCode::CONFLICT,
            RecognitionError::Validation(_) | RecognitionError::InvalidConfig(_) => {
                StatusCode::BAD_REQUEST
            }
        };
        Self::new(status, err.kind(), err.to_string())
    }

    fn from_anyhow(err: &anyhow::Error) -> Self {
        if let Some(domain) = err.downcast_ref::<RecognitionError>() {
            return Self::from_domain(domain);
        }
        tracing::error!(error = %format!("{err:#}"), "request failed");
        Self::internal()
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn parse_id<T>(raw: &str) -> Result<T, ServiceError>
where
    T: FromStr<Err = RecognitionError>,
{
    T::from_str(raw).map_err(|err| ServiceError::from_domain(&err))
}

fn parse_as_of(query: &AsOfQuery) -> Result<Option<OffsetDateTime>, ServiceError> {
    query
        .as_of
        .as_deref()
        .map(|raw| OffsetDateTime::parse(raw, &Rfc3339))
        .transpose()
        .map_err(|err| {
            ServiceError::new(
                StatusCode::BAD_REQUEST,
                "validation",
                format!("as_of MUST be an RFC3339 timestamp: {err}"),
            )
        })
}

fn request_metadata(headers: &HeaderMap) -> RequestMetadata {
    let header = |name: &str| {
        headers.get(name).and_then(|value| value.to_str().ok()).map(ToString::to_string)
    };
    RequestMetadata {
        ip_address: header("x-forwarded-for")
            .and_then(|forwarded| forwarded.split(',').next().map(|ip| ip.trim().to_string())),
        user_agent: header("user-agent"),
    }
}

/// Run a blocking `SQLite`-backed API call off the async executor.
async fn run_api<T, F>(state: &ServiceState, job: F) -> Result<Json<ServiceEnvelope<T>>, ServiceError>
where
    T: Serialize + Send + 'static,
    F: FnOnce(RecognitionApi) -> Result<T> + Send + 'static,
{
    let api = state.api.clone();
    match tokio::task::spawn_blocking(move || job(api)).await {
        Ok(Ok(data)) => Ok(Json(envelope(data))),
        Ok(Err(err)) => Err(ServiceError::from_anyhow(&err)),
        Err(err) => {
            tracing::error!(error = %err, "api task did not complete");
            Err(ServiceError::internal())
        }
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/users", post(user_register))
        .route("/v1/users/:user_id/verification", post(user_verification))
        .route("/v1/profiles", post(profile_create))
        .route("/v1/profiles/:profile_id", get(profile_show))
        .route("/v1/profiles/:profile_id/status", post(profile_status))
        .route(
            "/v1/profiles/:profile_id/recognitions",
            post(recognition_add).get(recognition_list),
        )
        .route("/v1/profiles/:profile_id/aggregate", get(aggregate_show))
        .route("/v1/profiles/:profile_id/aggregate/rebuild", post(aggregate_rebuild))
        .route("/v1/profiles/:profile_id/chain", get(chain_verify))
        .route("/v1/weights", get(weights_show))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("recognition_service=info".parse()?)
                .add_directive("recognition_api=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let weights = load_weight_config(args.weights.as_deref())?;
    let api = RecognitionApi::new(args.db.clone()).with_weights(weights)?;
    api.migrate(false)?;

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, db = %args.db.display(), "recognition service listening");
    axum::serve(listener, app(ServiceState { api })).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    run_api(&state, |api| api.schema_status()).await
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    run_api(&state, move |api| api.migrate(request.dry_run)).await
}

async fn user_register(
    State(state): State<ServiceState>,
    Json(request): Json<RegisterUserRequest>,
) -> Result<Json<ServiceEnvelope<UserRecord>>, ServiceError> {
    run_api(&state, move |api| api.register_user(request)).await
}

async fn user_verification(
    State(state): State<ServiceState>,
    Path(user_id): Path<String>,
    Json(request): Json<VerificationRequest>,
) -> Result<Json<ServiceEnvelope<UserRecord>>, ServiceError> {
    let user_id = parse_id::<UserId>(&user_id)?;
    run_api(&state, move |api| api.set_user_verification(user_id, request.verification)).await
}

async fn profile_create(
    State(state): State<ServiceState>,
    Json(request): Json<CreateProfileRequest>,
) -> Result<Json<ServiceEnvelope<ProfileRecord>>, ServiceError> {
    run_api(&state, move |api| api.create_profile(request)).await
}

async fn profile_show(
    State(state): State<ServiceState>,
    Path(profile_id): Path<String>,
) -> Result<Json<ServiceEnvelope<ProfileRecord>>, ServiceError> {
    let profile_id = parse_id::<ProfileId>(&profile_id)?;
    run_api(&state, move |api| api.get_profile(profile_id)).await
}

async fn profile_status(
    State(state): State<ServiceState>,
    Path(profile_id): Path<String>,
    Json(request): Json<ProfileStatusRequest>,
) -> Result<Json<ServiceEnvelope<ProfileRecord>>, ServiceError> {
    let profile_id = parse_id::<ProfileId>(&profile_id)?;
    run_api(&state, move |api| api.set_profile_status(profile_id, request.status)).await
}

async fn recognition_add(
    State(state): State<ServiceState>,
    Path(profile_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<RecognitionBody>,
) -> Result<Json<ServiceEnvelope<AddRecognitionResult>>, ServiceError> {
    let request = AddRecognitionRequest {
        profile_id: parse_id::<ProfileId>(&profile_id)?,
        recognizer_id: body.recognizer_id,
        recognition_type: body.recognition_type,
        relationship: body.relationship,
        notes: body.notes,
        metadata: request_metadata(&headers),
    };
    run_api(&state, move |api| api.add_recognition(request)).await
}

async fn recognition_list(
    State(state): State<ServiceState>,
    Path(profile_id): Path<String>,
) -> Result<Json<ServiceEnvelope<Vec<RecognitionView>>>, ServiceError> {
    let profile_id = parse_id::<ProfileId>(&profile_id)?;
    run_api(&state, move |api| api.list_recognitions(profile_id)).await
}

async fn aggregate_show(
    State(state): State<ServiceState>,
    Path(profile_id): Path<String>,
    Query(query): Query<AsOfQuery>,
) -> Result<Json<ServiceEnvelope<RecognitionAggregate>>, ServiceError> {
    let profile_id = parse_id::<ProfileId>(&profile_id)?;
    let as_of = parse_as_of(&query)?;
    run_api(&state, move |api| api.get_aggregate(profile_id, as_of)).await
}

async fn aggregate_rebuild(
    State(state): State<ServiceState>,
    Path(profile_id): Path<String>,
    Query(query): Query<AsOfQuery>,
) -> Result<Json<ServiceEnvelope<RecognitionAggregate>>, ServiceError> {
    let profile_id = parse_id::<ProfileId>(&profile_id)?;
    let as_of = parse_as_of(&query)?;
    run_api(&state, move |api| api.rebuild_aggregate(profile_id, as_of)).await
}

async fn chain_verify(
    State(state): State<ServiceState>,
    Path(profile_id): Path<String>,
) -> Result<Json<ServiceEnvelope<ChainVerification>>, ServiceError> {
    let profile_id = parse_id::<ProfileId>(&profile_id)?;
    run_api(&state, move |api| api.verify_chain(profile_id)).await
}

async fn weights_show(State(state): State<ServiceState>) -> Json<ServiceEnvelope<WeightConfig>> {
    Json(envelope(state.api.weights().clone()))
}
