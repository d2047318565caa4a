//! Machine CRUD and the command queue. Ownership-checked, no algorithmic
//! depth; the interesting state transitions live in the heartbeat checker.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};

use crate::model::{Command, CommandStatus, Machine, MachineStatus, MetricSet};
use crate::store::Store;

use super::auth::CurrentUser;
use super::{ApiError, AppState};

/// Machine as rendered to API clients.
#[derive(Debug, Serialize)]
pub struct MachineResponse {
    pub id: String,
    pub name: String,
    pub description: String,
    pub is_public: bool,
    pub status: MachineStatus,
    pub retry_count: u32,
    pub last_seen: Option<String>,
    pub metrics: MetricSet,
    pub created_at: String,
    pub updated_at: String,
}

impl From<Machine> for MachineResponse {
    fn from(machine: Machine) -> Self {
        Self {
            id: machine.id,
            name: machine.name,
            description: machine.description,
            is_public: machine.is_public,
            status: machine.status,
            retry_count: machine.retry_count,
            last_seen: machine.last_seen.map(|t| t.to_rfc3339()),
            metrics: machine.metrics,
            created_at: machine.created_at.to_rfc3339(),
            updated_at: machine.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CommandResponse {
    pub id: String,
    pub machine_id: String,
    pub command: String,
    pub args: Vec<String>,
    pub status: CommandStatus,
    pub output: String,
    pub exit_code: i32,
    pub error: String,
    pub created_at: String,
}

impl From<Command> for CommandResponse {
    fn from(command: Command) -> Self {
        Self {
            id: command.id,
            machine_id: command.machine_id,
            command: command.command,
            args: command.args,
            status: command.status,
            output: command.output,
            exit_code: command.exit_code,
            error: command.error,
            created_at: command.created_at.to_rfc3339(),
        }
    }
}

/// Loads a machine and enforces ownership; foreign machines read as missing.
async fn owned_machine(store: &Store, user_id: &str, machine_id: &str) -> Result<Machine, ApiError> {
    let machine = store.machine(machine_id).await?;
    if machine.user_id != user_id {
        return Err(ApiError::NotFound);
    }
    Ok(machine)
}

/// GET /machines
pub async fn list(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> Result<Json<Vec<MachineResponse>>, ApiError> {
    let mut machines = state.store.machines_for_user(&user.id).await?;
    machines.sort_by(|a, b| a.created_at.cmp(&b.created_at));

    Ok(Json(machines.into_iter().map(Into::into).collect()))
}

#[derive(Debug, Deserialize)]
pub struct CreateMachineRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_public: bool,
}

/// POST /machines
pub async fn create(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(body): Json<CreateMachineRequest>,
) -> Result<(StatusCode, Json<MachineResponse>), ApiError> {
    if body.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name is required".to_string()));
    }

    let mut machine = Machine::new(&user.id, body.name.trim(), &body.description);
    machine.is_public = body.is_public;
    state.store.create_machine(&machine).await?;

    Ok((StatusCode::CREATED, Json(machine.into())))
}

/// GET /machines/:id
pub async fn get_one(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(machine_id): Path<String>,
) -> Result<Json<MachineResponse>, ApiError> {
    let machine = owned_machine(&state.store, &user.id, &machine_id).await?;
    Ok(Json(machine.into()))
}

/// DELETE /machines/:id
pub async fn remove(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(machine_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    owned_machine(&state.store, &user.id, &machine_id).await?;

    // Close any live stream before the record goes away.
    if let Some(conn) = state.registry.get(&machine_id) {
        conn.close();
    }

    state.store.delete_machine(&machine_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /machines/:id/re-enable — the owner's path out of `dead`.
pub async fn re_enable(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(machine_id): Path<String>,
) -> Result<Json<MachineResponse>, ApiError> {
    owned_machine(&state.store, &user.id, &machine_id).await?;

    if !state.store.re_enable_machine(&machine_id).await? {
        return Err(ApiError::BadRequest("machine is not dead".to_string()));
    }

    let machine = state.store.machine(&machine_id).await?;
    Ok(Json(machine.into()))
}

#[derive(Debug, Deserialize)]
pub struct QueueCommandRequest {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// POST /machines/:id/commands
pub async fn queue_command(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(machine_id): Path<String>,
    Json(body): Json<QueueCommandRequest>,
) -> Result<(StatusCode, Json<CommandResponse>), ApiError> {
    owned_machine(&state.store, &user.id, &machine_id).await?;

    if body.command.trim().is_empty() {
        return Err(ApiError::BadRequest("command is required".to_string()));
    }

    let command = Command::new(&machine_id, body.command.trim(), body.args, body.env);
    state.store.create_command(&command).await?;

    Ok((StatusCode::CREATED, Json(command.into())))
}

/// GET /machines/:id/commands
pub async fn list_commands(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(machine_id): Path<String>,
) -> Result<Json<Vec<CommandResponse>>, ApiError> {
    owned_machine(&state.store, &user.id, &machine_id).await?;

    let commands = state.store.commands_for_machine(&machine_id).await?;
    Ok(Json(commands.into_iter().map(Into::into).collect()))
}
