//! Task CRUD plus the run/pause/rewind/finalize control endpoints (spec
//! §6). Generalizes the teacher's `factory::api` issue-CRUD handlers
//! (`create_issue`, `update_issue`, `move_issue`) from a Kanban board
//! model onto the task/phase/gate model this crate drives.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use orc_common::task::{Task, TaskState, TaskStatus, Weight};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::{default_workflow_for, PlaceholderMaterials};
use crate::{ApiError, SharedState};

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub title: String,
    pub description: String,
    #[serde(default = "default_weight")]
    pub weight: Weight,
    pub category: Option<String>,
    #[serde(default)]
    pub priority: i32,
    pub queue: Option<String>,
    pub initiative_id: Option<Uuid>,
    #[serde(default)]
    pub blocked_by: Vec<Uuid>,
    #[serde(default)]
    pub related_to: Vec<Uuid>,
}

fn default_weight() -> Weight {
    Weight::Medium
}

#[derive(Debug, Deserialize)]
pub struct UpdateTaskRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub weight: Option<Weight>,
    pub category: Option<String>,
    pub priority: Option<i32>,
    pub queue: Option<String>,
    pub blocked_by: Option<Vec<Uuid>>,
    pub related_to: Option<Vec<Uuid>>,
}

#[derive(Debug, Deserialize)]
pub struct RunQuery {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Deserialize)]
pub struct RewindRequest {
    pub to_phase: String,
}

#[derive(Debug, Serialize)]
pub struct RunAccepted {
    pub task_id: Uuid,
    pub status: TaskStatus,
}

pub async fn list(State(state): State<SharedState>) -> Result<Json<Vec<Task>>, ApiError> {
    Ok(Json(state.store.list_tasks()?))
}

pub async fn create(
    State(state): State<SharedState>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<Json<Task>, ApiError> {
    let mut task = Task::new(req.title, req.description, req.weight);
    task.category = req.category;
    task.priority = req.priority;
    task.queue = req.queue;
    task.initiative_id = req.initiative_id;
    task.blocked_by = req.blocked_by.into_iter().collect();
    task.related_to = req.related_to.into_iter().collect();

    let task = state.store.create_task(&task)?;
    state.bus.publish(orc_common::Event::new(
        Some(task.id),
        orc_common::EventType::TaskCreated,
        serde_json::json!({"task_id": task.id}),
        "orc-api",
    ));
    Ok(Json(task))
}

pub async fn get(State(state): State<SharedState>, Path(id): Path<Uuid>) -> Result<Json<Task>, ApiError> {
    let task = state.store.get_task(id)?.ok_or_else(|| ApiError::NotFound(id.to_string()))?;
    Ok(Json(task))
}

pub async fn state(State(state): State<SharedState>, Path(id): Path<Uuid>) -> Result<Json<TaskState>, ApiError> {
    state.store.get_task(id)?.ok_or_else(|| ApiError::NotFound(id.to_string()))?;
    Ok(Json(state.store.get_task_state(id)?))
}

/// Rejects edits to a running task (spec §6: "update refuses to modify
/// running tasks except via the executor's own helpers"). Weight changes
/// are safe to apply directly: the default workflow keyed by weight reuses
/// the same phase ids across weights, so existing per-phase sub-state
/// survives the swap without any special migration step.
pub async fn update(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateTaskRequest>,
) -> Result<Json<Task>, ApiError> {
    let mut task = state.store.get_task(id)?.ok_or_else(|| ApiError::NotFound(id.to_string()))?;
    if task.status == TaskStatus::Running {
        return Err(ApiError::Conflict("task is running; use pause/rewind instead".to_string()));
    }

    if let Some(title) = req.title {
        task.title = title;
    }
    if let Some(description) = req.description {
        task.description = description;
    }
    if let Some(weight) = req.weight {
        task.weight = weight;
    }
    if req.category.is_some() {
        task.category = req.category;
    }
    if let Some(priority) = req.priority {
        task.priority = priority;
    }
    if req.queue.is_some() {
        task.queue = req.queue;
    }
    if let Some(blocked_by) = req.blocked_by {
        task.blocked_by = blocked_by.into_iter().collect();
    }
    if let Some(related_to) = req.related_to {
        task.related_to = related_to.into_iter().collect();
    }
    task.updated_at = chrono::Utc::now();

    let task = state.store.update_task(&task)?;
    state.bus.publish(orc_common::Event::new(
        Some(task.id),
        orc_common::EventType::TaskUpdated,
        serde_json::json!({"task_id": task.id}),
        "orc-api",
    ));
    Ok(Json(task))
}

pub async fn delete(State(state): State<SharedState>, Path(id): Path<Uuid>) -> Result<(), ApiError> {
    state.store.delete_task(id)?;
    state.bus.publish(orc_common::Event::new(
        Some(id),
        orc_common::EventType::TaskDeleted,
        serde_json::json!({"task_id": id}),
        "orc-api",
    ));
    Ok(())
}

/// `Run(taskID, force)`: admits past the concurrency cap and `blocked_by`
/// check (or bypasses the latter with `force`), creates the task's
/// worktree on first run, and spawns the phase pipeline in the
/// background. Returns immediately once admitted rather than blocking on
/// the whole run — callers watch progress over `/ws` or by polling
/// `/tasks/:id`.
pub async fn run(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Query(q): Query<RunQuery>,
) -> Result<Json<RunAccepted>, ApiError> {
    let mut task = state.store.get_task(id)?.ok_or_else(|| ApiError::NotFound(id.to_string()))?;
    state.supervisor.check_blockers(&task, q.force)?;
    state.supervisor.ensure_not_orphaned(id)?;

    if task.worktree_path.is_none() {
        let initiative_prefix = task.initiative_id.map(|i| i.to_string());
        let created = state.phase_runner.worktree_manager().create(
            task.id,
            initiative_prefix.as_deref(),
            &state.target_branch,
        )?;
        task.worktree_path = Some(created.path.to_string_lossy().into_owned());
        task.branch = Some(created.branch);
        task = state.store.update_task(&task)?;
    }

    let executor = Arc::new(orc_runtime::task_executor::TaskExecutor::new(
        state.store.clone(),
        state.bus.clone(),
        state.phase_runner.clone(),
    ));
    state.running.insert(id, executor.clone());

    let workflow = default_workflow_for(task.weight);
    let worktree_path = std::path::PathBuf::from(
        task.worktree_path.clone().expect("just created or already present"),
    );
    let status = task.status;

    let run_state = state.clone();
    let run_task = task.clone();
    tokio::spawn(async move {
        let permit = run_state.supervisor.admit(id, run_task.priority).await;
        let materials = PlaceholderMaterials;
        let result = executor.run(run_task, &workflow, &materials, &worktree_path).await;
        drop(permit);
        run_state.running.remove(&id);
        match result {
            // Finalize runs detached: the server process stays up, so it
            // doesn't need this handle to keep the work alive.
            Ok((_, _finalize_handle)) => {}
            Err(e) => tracing::warn!(task_id = %id, error = %e, "task run ended in error"),
        }
    });

    Ok(Json(RunAccepted { task_id: id, status }))
}

/// Cooperative pause (spec §4.8): signals the in-flight executor's
/// cancellation token, takes effect at the next phase/iteration boundary.
/// A no-op if the task isn't currently running under this process.
pub async fn pause(State(state): State<SharedState>, Path(id): Path<Uuid>) -> Result<(), ApiError> {
    if let Some(executor) = state.running.get(&id) {
        executor.request_pause();
    }
    Ok(())
}

pub async fn rewind(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(req): Json<RewindRequest>,
) -> Result<Json<Task>, ApiError> {
    let task = state.store.get_task(id)?.ok_or_else(|| ApiError::NotFound(id.to_string()))?;
    if task.status == TaskStatus::Running {
        return Err(ApiError::Conflict("cannot rewind a running task; pause it first".to_string()));
    }
    let ordered = default_workflow_for(task.weight).topological_order().map_err(|e| {
        ApiError::BadRequest(format!("invalid workflow: {e}"))
    })?;

    let executor = orc_runtime::task_executor::TaskExecutor::new(
        state.store.clone(),
        state.bus.clone(),
        state.phase_runner.clone(),
    );
    executor.rewind(id, &req.to_phase, &ordered)?;
    let task = state.store.get_task(id)?.ok_or_else(|| ApiError::NotFound(id.to_string()))?;
    Ok(Json(task))
}

#[derive(Debug, Serialize)]
pub struct FinalizeAccepted {
    pub task_id: Uuid,
}

/// Finalize trigger (spec §4.9): dispatches the tracked async finalize
/// pipeline — sync, test, risk-assess, record `FinalizeResult` — and
/// returns immediately. Progress is observable as `finalize` events over
/// `/ws` (step-labeled `pending`/`running`/`completed`/`failed`), not in
/// this response; the last `completed` event's payload carries the
/// `FinalizeResult` itself.
pub async fn finalize(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<FinalizeAccepted>, ApiError> {
    let mut task = state.store.get_task(id)?.ok_or_else(|| ApiError::NotFound(id.to_string()))?;
    let worktree_path = task
        .worktree_path
        .clone()
        .ok_or_else(|| ApiError::BadRequest("task has no worktree yet".to_string()))?;

    task.status = TaskStatus::Finalizing;
    let task = state.store.update_task(&task)?;
    let task_state = state.store.get_task_state(id)?;

    orc_runtime::sync_finalize::spawn_finalize(
        state.store.clone(),
        state.bus.clone(),
        task,
        task_state,
        std::path::PathBuf::from(worktree_path),
        state.target_branch.clone(),
        None,
    );

    Ok(Json(FinalizeAccepted { task_id: id }))
}
