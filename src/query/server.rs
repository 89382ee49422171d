use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::core::field::{FieldDefinition, WORKSPACE_FIELDS};
use crate::core::identity::{StaticIdentity, User, UserDirectory, UserId};
use crate::core::revision::Revision;
use crate::core::validate::Violation;
use crate::core::workspace::{Workspace, WorkspaceId};
use crate::index::registry::{NewWorkspace, RegistryError, WorkspaceRegistry};
use crate::index::sequence::{Change, SequenceId, SequenceRecord};
use crate::query::matcher::create_matcher;
use crate::stats::RegistryReport;

pub const USER_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<WorkspaceRegistry>,
    pub users: Arc<dyn UserDirectory>,
    pub anonymous: UserId,
}

#[derive(Deserialize)]
pub struct ListParams {
    pub machine_name: Option<String>,
}

#[derive(Deserialize)]
pub struct ChangesParams {
    pub since: Option<SequenceId>,
    pub limit: Option<usize>,
}

/// PATCH body；只改出现的字段
#[derive(Debug, Default, Deserialize)]
pub struct WorkspacePatch {
    pub label: Option<String>,
    pub machine_name: Option<String>,
    pub owner_id: Option<UserId>,
    pub published: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkspaceView {
    pub id: Option<u64>,
    pub revision_id: Option<u64>,
    #[serde(rename = "type")]
    pub workspace_type: String,
    pub uuid: String,
    pub label: String,
    pub machine_name: String,
    pub owner_id: Option<UserId>,
    pub owner: Option<User>,
    pub created: i64,
    pub changed: i64,
    pub published: bool,
    pub is_default: bool,
    pub update_seq: SequenceId,
}

impl WorkspaceView {
    fn build(ws: &Workspace, state: &AppState) -> Self {
        Self {
            id: ws.id().map(|v| v.0),
            revision_id: ws.revision_id().map(|v| v.0),
            workspace_type: ws.workspace_type().0.clone(),
            uuid: ws.uuid().to_string(),
            label: ws.label().to_string(),
            machine_name: ws.machine_name().to_string(),
            owner_id: ws.owner_id(),
            owner: ws.owner(state.users.as_ref()),
            created: ws.start_time(),
            changed: ws.changed_time(),
            published: ws.is_published(),
            is_default: ws.is_default_workspace(state.registry.default_workspace()),
            update_seq: ws.update_seq(state.registry.sequences()),
        }
    }
}

#[derive(Serialize)]
struct UpdateSeqResponse {
    update_seq: SequenceId,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    violations: Vec<Violation>,
}

pub struct ApiError(RegistryError);

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error = self.0.to_string();
        let (status, violations) = match self.0 {
            RegistryError::Validation(v) => (StatusCode::UNPROCESSABLE_ENTITY, v.violations),
            RegistryError::NotFound(_) => (StatusCode::NOT_FOUND, Vec::new()),
            RegistryError::Storage(e) => {
                tracing::error!("Storage failure while serving request: {:#}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, Vec::new())
            }
        };
        (status, Json(ErrorBody { error, violations })).into_response()
    }
}

fn acting_user(headers: &HeaderMap, anonymous: UserId) -> StaticIdentity {
    let uid = headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(UserId)
        .unwrap_or(anonymous);
    StaticIdentity(uid)
}

pub struct QueryServer {
    pub state: AppState,
}

impl QueryServer {
    pub fn new(
        registry: Arc<WorkspaceRegistry>,
        users: Arc<dyn UserDirectory>,
        anonymous: UserId,
    ) -> Self {
        Self {
            state: AppState {
                registry,
                users,
                anonymous,
            },
        }
    }

    pub fn router(self) -> Router {
        Router::new()
            .route("/status", get(status_handler))
            .route("/schema", get(schema_handler))
            .route("/workspaces", get(list_handler).post(create_handler))
            .route("/workspaces/:id", get(get_handler).patch(patch_handler))
            .route("/workspaces/:id/revisions", get(revisions_handler))
            .route("/workspaces/:id/update_seq", get(update_seq_handler))
            .route(
                "/workspaces/:id/changes",
                get(changes_handler).post(record_change_handler),
            )
            .with_state(self.state)
    }

    pub async fn serve(self, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
        let app = self.router();
        axum::serve(listener, app).await?;
        Ok(())
    }

    pub async fn run(self, port: u16) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
        tracing::info!("HTTP Workspace Server listening on port {}", port);
        self.serve(listener).await
    }
}

async fn status_handler(State(state): State<AppState>) -> Json<RegistryReport> {
    Json(state.registry.report())
}

async fn schema_handler() -> Json<&'static [FieldDefinition]> {
    Json(WORKSPACE_FIELDS)
}

async fn list_handler(
    Query(params): Query<ListParams>,
    State(state): State<AppState>,
) -> Json<Vec<WorkspaceView>> {
    let workspaces = match params.machine_name.as_deref() {
        Some(p) if !p.is_empty() => state.registry.list_matching(create_matcher(p).as_ref()),
        _ => state.registry.list(),
    };
    Json(
        workspaces
            .iter()
            .map(|w| WorkspaceView::build(w, &state))
            .collect(),
    )
}

async fn create_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<NewWorkspace>,
) -> Result<(StatusCode, Json<WorkspaceView>), ApiError> {
    let identity = acting_user(&headers, state.anonymous);
    let mut ws = state.registry.create(body, &identity);
    state.registry.save(&mut ws)?;
    Ok((StatusCode::CREATED, Json(WorkspaceView::build(&ws, &state))))
}

async fn get_handler(
    Path(id): Path<u64>,
    State(state): State<AppState>,
) -> Result<Json<WorkspaceView>, ApiError> {
    let ws = state
        .registry
        .load(WorkspaceId(id))
        .ok_or(RegistryError::NotFound(WorkspaceId(id)))?;
    Ok(Json(WorkspaceView::build(&ws, &state)))
}

async fn patch_handler(
    Path(id): Path<u64>,
    State(state): State<AppState>,
    Json(patch): Json<WorkspacePatch>,
) -> Result<Json<WorkspaceView>, ApiError> {
    let mut ws = state
        .registry
        .load(WorkspaceId(id))
        .ok_or(RegistryError::NotFound(WorkspaceId(id)))?;
    if let Some(label) = &patch.label {
        ws.set_label(label);
    }
    if let Some(name) = &patch.machine_name {
        ws.set_machine_name(name);
    }
    if let Some(uid) = patch.owner_id {
        ws.set_owner_id(uid);
    }
    if let Some(published) = patch.published {
        ws.set_published(published);
    }
    state.registry.save(&mut ws)?;
    Ok(Json(WorkspaceView::build(&ws, &state)))
}

async fn revisions_handler(
    Path(id): Path<u64>,
    State(state): State<AppState>,
) -> Result<Json<Vec<Revision>>, ApiError> {
    Ok(Json(state.registry.revisions(WorkspaceId(id))?))
}

async fn update_seq_handler(
    Path(id): Path<u64>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let update_seq = state.registry.update_seq(WorkspaceId(id))?;
    Ok(Json(UpdateSeqResponse { update_seq }))
}

async fn changes_handler(
    Path(id): Path<u64>,
    Query(params): Query<ChangesParams>,
    State(state): State<AppState>,
) -> Result<Json<Vec<SequenceRecord>>, ApiError> {
    let records = state.registry.changes(
        WorkspaceId(id),
        params.since.unwrap_or(0),
        params.limit,
    )?;
    Ok(Json(records))
}

async fn record_change_handler(
    Path(id): Path<u64>,
    State(state): State<AppState>,
    Json(change): Json<Change>,
) -> Result<(StatusCode, Json<SequenceRecord>), ApiError> {
    let rec = state.registry.record_change(WorkspaceId(id), change)?;
    Ok((StatusCode::CREATED, Json(rec)))
}
