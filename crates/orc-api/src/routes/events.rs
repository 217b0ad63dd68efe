//! Paginated event query (spec §4.1, §6).

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use orc_common::EventType;
use orc_store::EventFilter;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{ApiError, SharedState};

#[derive(Debug, Deserialize)]
pub struct EventQuery {
    pub task_id: Option<Uuid>,
    pub initiative_id: Option<Uuid>,
    #[serde(default)]
    pub types: Vec<EventType>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 {
    100
}

#[derive(Debug, Serialize)]
pub struct EventPageBody {
    pub events: Vec<orc_common::Event>,
    pub has_more: bool,
}

fn to_filter(q: EventQuery) -> EventFilter {
    EventFilter {
        task_id: q.task_id,
        initiative_id: q.initiative_id,
        types: q.types,
        since: q.since,
        until: q.until,
        limit: q.limit,
        offset: q.offset,
    }
}

pub async fn query(
    State(state): State<SharedState>,
    Query(q): Query<EventQuery>,
) -> Result<Json<EventPageBody>, ApiError> {
    let page = state.store.list_events(&to_filter(q))?;
    Ok(Json(EventPageBody { events: page.events, has_more: page.has_more }))
}

pub async fn for_task(
    State(state): State<SharedState>,
    Path(task_id): Path<Uuid>,
    Query(mut q): Query<EventQuery>,
) -> Result<Json<EventPageBody>, ApiError> {
    q.task_id = Some(task_id);
    let page = state.store.list_events(&to_filter(q))?;
    Ok(Json(EventPageBody { events: page.events, has_more: page.has_more }))
}
