//! Row <-> domain struct conversions. Every write goes through a plain
//! `Connection` or `Transaction` so [`crate::Store::atomic_task_and_state`]
//! can share the same functions inside and outside a transaction.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use orc_common::{
    Artifact, ArtifactType, Event, EventType, GateDecision, GateSource, Task, TaskState,
    TaskStatus, Weight,
};
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params};
use uuid::Uuid;

use crate::error::StoreError;
use crate::{EventFilter, EventPage};

fn weight_to_str(w: Weight) -> &'static str {
    match w {
        Weight::Trivial => "trivial",
        Weight::Small => "small",
        Weight::Medium => "medium",
        Weight::Large => "large",
        Weight::Greenfield => "greenfield",
    }
}

fn weight_from_str(s: &str) -> Result<Weight, StoreError> {
    Ok(match s {
        "trivial" => Weight::Trivial,
        "small" => Weight::Small,
        "medium" => Weight::Medium,
        "large" => Weight::Large,
        "greenfield" => Weight::Greenfield,
        other => return Err(StoreError::Corrupt(format!("unknown weight {other}"))),
    })
}

fn status_to_str(s: TaskStatus) -> &'static str {
    match s {
        TaskStatus::Created => "created",
        TaskStatus::Planned => "planned",
        TaskStatus::Running => "running",
        TaskStatus::Paused => "paused",
        TaskStatus::Blocked => "blocked",
        TaskStatus::Failed => "failed",
        TaskStatus::Completed => "completed",
        TaskStatus::Finalizing => "finalizing",
        TaskStatus::Interrupted => "interrupted",
    }
}

fn status_from_str(s: &str) -> Result<TaskStatus, StoreError> {
    Ok(match s {
        "created" => TaskStatus::Created,
        "planned" => TaskStatus::Planned,
        "running" => TaskStatus::Running,
        "paused" => TaskStatus::Paused,
        "blocked" => TaskStatus::Blocked,
        "failed" => TaskStatus::Failed,
        "completed" => TaskStatus::Completed,
        "finalizing" => TaskStatus::Finalizing,
        "interrupted" => TaskStatus::Interrupted,
        other => return Err(StoreError::Corrupt(format!("unknown status {other}"))),
    })
}

fn uuid_set_to_json(set: &BTreeSet<Uuid>) -> String {
    serde_json::to_string(&set.iter().map(|u| u.to_string()).collect::<Vec<_>>()).unwrap()
}

fn uuid_set_from_json(s: &str) -> Result<BTreeSet<Uuid>, StoreError> {
    let raw: Vec<String> = serde_json::from_str(s).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    raw.into_iter()
        .map(|s| Uuid::parse_str(&s).map_err(|e| StoreError::Corrupt(e.to_string())))
        .collect()
}

/// Builds a fully-populated, validated `Task` from a row, surfacing parse
/// errors instead of silently defaulting (spec §7: schema/parse failures
/// are hard errors, never silent fallbacks).
fn build_task(row: &Row) -> Result<Task, StoreError> {
    let id: String = row.get("id").map_err(StoreError::Sqlite)?;
    let weight: String = row.get("weight").map_err(StoreError::Sqlite)?;
    let status: String = row.get("status").map_err(StoreError::Sqlite)?;
    let blocked_by: String = row.get("blocked_by").map_err(StoreError::Sqlite)?;
    let related_to: String = row.get("related_to").map_err(StoreError::Sqlite)?;
    let execution_info: String = row.get("execution_info").map_err(StoreError::Sqlite)?;
    let counters: String = row.get("counters").map_err(StoreError::Sqlite)?;
    let initiative_id: Option<String> = row.get("initiative_id").map_err(StoreError::Sqlite)?;
    let created_at: String = row.get("created_at").map_err(StoreError::Sqlite)?;
    let updated_at: String = row.get("updated_at").map_err(StoreError::Sqlite)?;

    Ok(Task {
        id: Uuid::parse_str(&id).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        title: row.get("title").map_err(StoreError::Sqlite)?,
        description: row.get("description").map_err(StoreError::Sqlite)?,
        weight: weight_from_str(&weight)?,
        category: row.get("category").map_err(StoreError::Sqlite)?,
        priority: row.get("priority").map_err(StoreError::Sqlite)?,
        queue: row.get("queue").map_err(StoreError::Sqlite)?,
        initiative_id: initiative_id
            .map(|s| Uuid::parse_str(&s).map_err(|e| StoreError::Corrupt(e.to_string())))
            .transpose()?,
        blocked_by: uuid_set_from_json(&blocked_by)?,
        related_to: uuid_set_from_json(&related_to)?,
        status: status_from_str(&status)?,
        current_phase: row.get("current_phase").map_err(StoreError::Sqlite)?,
        execution_info: serde_json::from_str(&execution_info)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        branch: row.get("branch").map_err(StoreError::Sqlite)?,
        worktree_path: row.get("worktree_path").map_err(StoreError::Sqlite)?,
        pr_reference: row.get("pr_reference").map_err(StoreError::Sqlite)?,
        counters: serde_json::from_str(&counters).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        created_at: created_at
            .parse()
            .map_err(|_| StoreError::Corrupt("bad created_at".into()))?,
        updated_at: updated_at
            .parse()
            .map_err(|_| StoreError::Corrupt("bad updated_at".into()))?,
    })
}

const TASK_COLUMNS: &str = "id, title, description, weight, category, priority, queue, \
    initiative_id, blocked_by, related_to, status, current_phase, execution_info, branch, \
    worktree_path, pr_reference, counters, created_at, updated_at";

pub fn insert_task(conn: &Connection, task: &Task) -> Result<(), StoreError> {
    let owned = task_params(task);
    let refs: Vec<&dyn rusqlite::ToSql> = owned.iter().map(|b| b.as_ref()).collect();
    conn.execute(
        &format!(
            "INSERT INTO tasks ({TASK_COLUMNS}) VALUES \
             (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19)"
        ),
        refs.as_slice(),
    )
    .map_err(StoreError::Sqlite)?;
    Ok(())
}

pub fn update_task(conn: &Connection, task: &Task) -> Result<(), StoreError> {
    update_task_inner(conn, task)
}

pub fn update_task_tx(tx: &Transaction, task: &Task) -> Result<(), StoreError> {
    update_task_inner(tx, task)
}

fn update_task_inner(conn: &Connection, task: &Task) -> Result<(), StoreError> {
    let mut task = task.clone();
    task.updated_at = Utc::now();
    let owned = task_params(&task);
    let refs: Vec<&dyn rusqlite::ToSql> = owned.iter().map(|b| b.as_ref()).collect();
    conn.execute(
        "UPDATE tasks SET title=?2, description=?3, weight=?4, category=?5, priority=?6, \
         queue=?7, initiative_id=?8, blocked_by=?9, related_to=?10, status=?11, \
         current_phase=?12, execution_info=?13, branch=?14, worktree_path=?15, \
         pr_reference=?16, counters=?17, updated_at=?19 WHERE id = ?1",
        refs.as_slice(),
    )
    .map_err(StoreError::Sqlite)?;
    Ok(())
}

fn task_params(task: &Task) -> Vec<Box<dyn rusqlite::ToSql>> {
    vec![
        Box::new(task.id.to_string()),
        Box::new(task.title.clone()),
        Box::new(task.description.clone()),
        Box::new(weight_to_str(task.weight).to_string()),
        Box::new(task.category.clone()),
        Box::new(task.priority),
        Box::new(task.queue.clone()),
        Box::new(task.initiative_id.map(|u| u.to_string())),
        Box::new(uuid_set_to_json(&task.blocked_by)),
        Box::new(uuid_set_to_json(&task.related_to)),
        Box::new(status_to_str(task.status).to_string()),
        Box::new(task.current_phase.clone()),
        Box::new(serde_json::to_string(&task.execution_info).unwrap()),
        Box::new(task.branch.clone()),
        Box::new(task.worktree_path.clone()),
        Box::new(task.pr_reference.clone()),
        Box::new(serde_json::to_string(&task.counters).unwrap()),
        Box::new(task.created_at.to_rfc3339()),
        Box::new(task.updated_at.to_rfc3339()),
    ]
}

pub fn get_task(conn: &Connection, id: Uuid) -> Result<Option<Task>, StoreError> {
    conn.query_row(
        &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
        params![id.to_string()],
        build_task,
    )
    .optional()
    .map_err(StoreError::Sqlite)?
    .transpose()
}

pub fn list_tasks(conn: &Connection) -> Result<Vec<Task>, StoreError> {
    let mut stmt = conn
        .prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at"))
        .map_err(StoreError::Sqlite)?;
    let rows = stmt.query_map([], build_task).map_err(StoreError::Sqlite)?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(StoreError::Sqlite)?
        .into_iter()
        .collect::<Result<Vec<_>, _>>()
}

/// Rejects a candidate task write that would introduce a `blocked_by`
/// self-reference or cycle (spec §3 invariant, testable property 5).
/// Builds the full `blocked_by` graph from every other task currently in
/// the store plus the candidate's own edges, then walks from the
/// candidate looking for a path back to itself.
pub fn check_blocked_by_acyclic(conn: &Connection, candidate: &Task) -> Result<(), StoreError> {
    if candidate.blocked_by.contains(&candidate.id) {
        return Err(StoreError::SelfReference(candidate.id));
    }

    let mut edges: std::collections::HashMap<Uuid, BTreeSet<Uuid>> = std::collections::HashMap::new();
    for task in list_tasks(conn)? {
        if task.id != candidate.id {
            edges.insert(task.id, task.blocked_by);
        }
    }

    for dep in &candidate.blocked_by {
        if *dep != candidate.id && !edges.contains_key(dep) {
            return Err(StoreError::UnknownBlockedBy(*dep));
        }
    }

    edges.insert(candidate.id, candidate.blocked_by.clone());

    fn find_path_back(
        node: Uuid,
        origin: Uuid,
        edges: &std::collections::HashMap<Uuid, BTreeSet<Uuid>>,
        seen: &mut std::collections::HashSet<Uuid>,
    ) -> Option<Uuid> {
        let Some(deps) = edges.get(&node) else { return None };
        for &dep in deps {
            if dep == origin {
                return Some(node);
            }
            if seen.insert(dep) && let Some(found) = find_path_back(dep, origin, edges, seen) {
                return Some(found);
            }
        }
        None
    }

    let mut seen = std::collections::HashSet::from([candidate.id]);
    if let Some(from) = find_path_back(candidate.id, candidate.id, &edges, &mut seen) {
        return Err(StoreError::CyclicDependency { from, to: candidate.id });
    }
    Ok(())
}

pub fn get_task_state(conn: &Connection, task_id: Uuid) -> Result<Option<TaskState>, StoreError> {
    conn.query_row(
        "SELECT state_json FROM task_states WHERE task_id = ?1",
        params![task_id.to_string()],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .map_err(StoreError::Sqlite)?
    .map(|json| serde_json::from_str(&json).map_err(|e| StoreError::Corrupt(e.to_string())))
    .transpose()
}

pub fn put_task_state(conn: &Connection, task_id: Uuid, state: &TaskState) -> Result<(), StoreError> {
    put_task_state_inner(conn, task_id, state)
}

pub fn put_task_state_tx(tx: &Transaction, task_id: Uuid, state: &TaskState) -> Result<(), StoreError> {
    put_task_state_inner(tx, task_id, state)
}

fn put_task_state_inner(conn: &Connection, task_id: Uuid, state: &TaskState) -> Result<(), StoreError> {
    let json = serde_json::to_string(state).unwrap();
    conn.execute(
        "INSERT INTO task_states (task_id, state_json) VALUES (?1, ?2)
         ON CONFLICT(task_id) DO UPDATE SET state_json = excluded.state_json",
        params![task_id.to_string(), json],
    )
    .map_err(StoreError::Sqlite)?;
    Ok(())
}

fn artifact_type_to_str(t: &ArtifactType) -> &'static str {
    match t {
        ArtifactType::Spec => "spec",
        ArtifactType::Design => "design",
        ArtifactType::Breakdown => "breakdown",
        ArtifactType::TddTests => "tdd_tests",
        ArtifactType::ReviewFindings => "review_findings",
        ArtifactType::FinalizeReport => "finalize_report",
    }
}

fn artifact_type_from_str(s: &str) -> Result<ArtifactType, StoreError> {
    Ok(match s {
        "spec" => ArtifactType::Spec,
        "design" => ArtifactType::Design,
        "breakdown" => ArtifactType::Breakdown,
        "tdd_tests" => ArtifactType::TddTests,
        "review_findings" => ArtifactType::ReviewFindings,
        "finalize_report" => ArtifactType::FinalizeReport,
        other => return Err(StoreError::Corrupt(format!("unknown artifact type {other}"))),
    })
}

pub fn put_artifact(conn: &Connection, artifact: &Artifact) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO artifacts (task_id, phase_id, artifact_type, content, created_at)
         VALUES (?1,?2,?3,?4,?5)
         ON CONFLICT(task_id, phase_id, artifact_type) DO UPDATE SET
            content = excluded.content, created_at = excluded.created_at",
        params![
            artifact.task_id.to_string(),
            artifact.phase_id,
            artifact_type_to_str(&artifact.artifact_type),
            artifact.content,
            artifact.created_at.to_rfc3339(),
        ],
    )
    .map_err(StoreError::Sqlite)?;
    Ok(())
}

pub fn get_artifact(
    conn: &Connection,
    task_id: Uuid,
    phase_id: &str,
    artifact_type: &ArtifactType,
) -> Result<Option<Artifact>, StoreError> {
    conn.query_row(
        "SELECT task_id, phase_id, artifact_type, content, created_at FROM artifacts
         WHERE task_id = ?1 AND phase_id = ?2 AND artifact_type = ?3",
        params![task_id.to_string(), phase_id, artifact_type_to_str(artifact_type)],
        |row| {
            let task_id: String = row.get(0)?;
            let phase_id: String = row.get(1)?;
            let artifact_type: String = row.get(2)?;
            let content: String = row.get(3)?;
            let created_at: String = row.get(4)?;
            Ok((task_id, phase_id, artifact_type, content, created_at))
        },
    )
    .optional()
    .map_err(StoreError::Sqlite)?
    .map(|(task_id, phase_id, artifact_type, content, created_at)| {
        Ok(Artifact {
            task_id: Uuid::parse_str(&task_id).map_err(|e| StoreError::Corrupt(e.to_string()))?,
            phase_id,
            artifact_type: artifact_type_from_str(&artifact_type)?,
            content,
            created_at: created_at
                .parse()
                .map_err(|_| StoreError::Corrupt("bad created_at".into()))?,
        })
    })
    .transpose()
}

fn event_type_to_str(t: EventType) -> &'static str {
    match t {
        EventType::State => "state",
        EventType::Phase => "phase",
        EventType::Transcript => "transcript",
        EventType::Tokens => "tokens",
        EventType::Complete => "complete",
        EventType::Error => "error",
        EventType::Activity => "activity",
        EventType::Heartbeat => "heartbeat",
        EventType::Warning => "warning",
        EventType::Finalize => "finalize",
        EventType::FilesChanged => "files_changed",
        EventType::DecisionRequired => "decision_required",
        EventType::DecisionResolved => "decision_resolved",
        EventType::SessionUpdate => "session_update",
        EventType::TaskCreated => "task_created",
        EventType::TaskUpdated => "task_updated",
        EventType::TaskDeleted => "task_deleted",
        EventType::InitiativeCreated => "initiative_created",
        EventType::InitiativeUpdated => "initiative_updated",
        EventType::InitiativeDeleted => "initiative_deleted",
    }
}

fn event_type_from_str(s: &str) -> Result<EventType, StoreError> {
    Ok(match s {
        "state" => EventType::State,
        "phase" => EventType::Phase,
        "transcript" => EventType::Transcript,
        "tokens" => EventType::Tokens,
        "complete" => EventType::Complete,
        "error" => EventType::Error,
        "activity" => EventType::Activity,
        "heartbeat" => EventType::Heartbeat,
        "warning" => EventType::Warning,
        "finalize" => EventType::Finalize,
        "files_changed" => EventType::FilesChanged,
        "decision_required" => EventType::DecisionRequired,
        "decision_resolved" => EventType::DecisionResolved,
        "session_update" => EventType::SessionUpdate,
        "task_created" => EventType::TaskCreated,
        "task_updated" => EventType::TaskUpdated,
        "task_deleted" => EventType::TaskDeleted,
        "initiative_created" => EventType::InitiativeCreated,
        "initiative_updated" => EventType::InitiativeUpdated,
        "initiative_deleted" => EventType::InitiativeDeleted,
        other => return Err(StoreError::Corrupt(format!("unknown event type {other}"))),
    })
}

pub fn insert_event(conn: &Connection, event: &Event) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO events (id, task_id, phase_id, iteration, event_type, data, source, created_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
        params![
            event.id.to_string(),
            event.task_id.map(|u| u.to_string()),
            event.phase_id,
            event.iteration,
            event_type_to_str(event.event_type),
            event.data.to_string(),
            event.source,
            event.created_at.to_rfc3339(),
        ],
    )
    .map_err(StoreError::Sqlite)?;
    Ok(())
}

fn event_from_row(row: &Row) -> Result<Event, StoreError> {
    let id: String = row.get(0).map_err(StoreError::Sqlite)?;
    let task_id: Option<String> = row.get(1).map_err(StoreError::Sqlite)?;
    let phase_id: Option<String> = row.get(2).map_err(StoreError::Sqlite)?;
    let iteration: Option<u32> = row.get(3).map_err(StoreError::Sqlite)?;
    let event_type: String = row.get(4).map_err(StoreError::Sqlite)?;
    let data: String = row.get(5).map_err(StoreError::Sqlite)?;
    let source: String = row.get(6).map_err(StoreError::Sqlite)?;
    let created_at: String = row.get(7).map_err(StoreError::Sqlite)?;

    Ok(Event {
        id: Uuid::parse_str(&id).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        task_id: task_id
            .map(|s| Uuid::parse_str(&s).map_err(|e| StoreError::Corrupt(e.to_string())))
            .transpose()?,
        phase_id,
        iteration,
        event_type: event_type_from_str(&event_type)?,
        data: serde_json::from_str(&data).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        source,
        created_at: created_at
            .parse()
            .map_err(|_| StoreError::Corrupt("bad created_at".into()))?,
    })
}

pub fn list_events(conn: &Connection, filter: &EventFilter) -> Result<EventPage, StoreError> {
    let mut sql = String::from(
        "SELECT id, task_id, phase_id, iteration, event_type, data, source, created_at FROM events WHERE 1=1",
    );
    let mut binds: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(task_id) = filter.task_id {
        sql.push_str(" AND task_id = ?");
        binds.push(Box::new(task_id.to_string()));
    }
    if let Some(initiative_id) = filter.initiative_id {
        sql.push_str(" AND task_id IN (SELECT id FROM tasks WHERE initiative_id = ?)");
        binds.push(Box::new(initiative_id.to_string()));
    }
    if let Some(since) = filter.since {
        sql.push_str(" AND created_at >= ?");
        binds.push(Box::new(since.to_rfc3339()));
    }
    if let Some(until) = filter.until {
        sql.push_str(" AND created_at <= ?");
        binds.push(Box::new(until.to_rfc3339()));
    }
    if !filter.types.is_empty() {
        let placeholders = filter.types.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        sql.push_str(&format!(" AND event_type IN ({placeholders})"));
        for t in &filter.types {
            binds.push(Box::new(event_type_to_str(*t).to_string()));
        }
    }
    sql.push_str(" ORDER BY created_at DESC");

    let limit = if filter.limit == 0 { 50 } else { filter.limit };
    sql.push_str(&format!(" LIMIT {} OFFSET {}", limit as i64 + 1, filter.offset));

    let mut stmt = conn.prepare(&sql).map_err(StoreError::Sqlite)?;
    let param_refs: Vec<&dyn rusqlite::ToSql> = binds.iter().map(|b| b.as_ref()).collect();
    let mapped = stmt
        .query_map(param_refs.as_slice(), |row| Ok(event_from_row(row)))
        .map_err(StoreError::Sqlite)?;

    let mut events: Vec<Event> = Vec::new();
    for item in mapped {
        events.push(item.map_err(StoreError::Sqlite)??);
    }

    let has_more = events.len() as u32 > limit;
    events.truncate(limit as usize);
    Ok(EventPage { events, has_more })
}

fn gate_source_to_str(s: GateSource) -> &'static str {
    match s {
        GateSource::Auto => "auto",
        GateSource::Ai => "ai",
        GateSource::Human => "human",
        GateSource::Api => "api",
        GateSource::Cli => "cli",
    }
}

fn gate_source_from_str(s: &str) -> Result<GateSource, StoreError> {
    Ok(match s {
        "auto" => GateSource::Auto,
        "ai" => GateSource::Ai,
        "human" => GateSource::Human,
        "api" => GateSource::Api,
        "cli" => GateSource::Cli,
        other => return Err(StoreError::Corrupt(format!("unknown gate source {other}"))),
    })
}

pub fn put_decision(
    conn: &Connection,
    task_id: Uuid,
    phase_id: &str,
    decision: &GateDecision,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO decisions (task_id, phase_id, approved, reason, questions, source)
         VALUES (?1,?2,?3,?4,?5,?6)
         ON CONFLICT(task_id, phase_id) DO UPDATE SET
            approved=excluded.approved, reason=excluded.reason,
            questions=excluded.questions, source=excluded.source",
        params![
            task_id.to_string(),
            phase_id,
            decision.approved,
            decision.reason,
            serde_json::to_string(&decision.questions).unwrap(),
            gate_source_to_str(decision.source),
        ],
    )
    .map_err(StoreError::Sqlite)?;
    Ok(())
}

pub fn get_decision(
    conn: &Connection,
    task_id: Uuid,
    phase_id: &str,
) -> Result<Option<GateDecision>, StoreError> {
    conn.query_row(
        "SELECT approved, reason, questions, source FROM decisions WHERE task_id=?1 AND phase_id=?2",
        params![task_id.to_string(), phase_id],
        |row| {
            let approved: bool = row.get(0)?;
            let reason: String = row.get(1)?;
            let questions: String = row.get(2)?;
            let source: String = row.get(3)?;
            Ok((approved, reason, questions, source))
        },
    )
    .optional()
    .map_err(StoreError::Sqlite)?
    .map(|(approved, reason, questions, source)| {
        Ok(GateDecision {
            approved,
            reason,
            questions: serde_json::from_str(&questions).map_err(|e| StoreError::Corrupt(e.to_string()))?,
            source: gate_source_from_str(&source)?,
        })
    })
    .transpose()
}
