//! Single-writer, multi-reader persistent store per project (spec §4.1).
//!
//! Modeled on the teacher's `factory/db.rs`: a `rusqlite::Connection`
//! wrapped for interior mutability, `execute_batch` migrations run once at
//! open time, and a strict "mutate then re-read by id" pattern on every
//! write path so API handlers never hand back the object they just sent in
//! (spec §4.1: "returning the input object is forbidden").
//!
//! Everything that is not a plain column is kept as a `TEXT` JSON blob
//! (`blocked_by`, `counters`, `questions`, event `data`, ...) rather than
//! normalized into further tables — the Store's job is durable round-trip
//! persistence of domain types, not relational querying of their insides.

mod error;
mod migrations;
mod rows;

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use orc_common::{
    Artifact, ArtifactType, Event, EventType, GateDecision, Task, TaskState, TaskStatus,
};
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

pub use error::StoreError;

/// A page of events plus a `has_more` flag (spec §4.1, §6 event query).
pub struct EventPage {
    pub events: Vec<Event>,
    pub has_more: bool,
}

/// Aggregate cost summary (ambient-stack supplement, SPEC_FULL §0).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct CostSummary {
    pub total: f64,
    pub by_kind: std::collections::BTreeMap<String, f64>,
}

/// Filters accepted by [`Store::list_events`].
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub task_id: Option<Uuid>,
    pub initiative_id: Option<Uuid>,
    pub types: Vec<EventType>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: u32,
    pub offset: u32,
}

/// The per-project Store. `Connection` is not `Sync`; callers share a
/// `Store` behind an `Arc` and every method takes `&self`, serializing
/// writes through an internal mutex — this is the single-writer contract
/// from spec §4.1 made concrete, not a performance optimization.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(StoreError::Io)?;
        }
        let conn = Connection::open(path).map_err(StoreError::Sqlite)?;
        migrations::run(&conn)?;
        Ok(Store { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(StoreError::Sqlite)?;
        migrations::run(&conn)?;
        Ok(Store { conn: Mutex::new(conn) })
    }

    // ---- Task CRUD ----------------------------------------------------

    pub fn create_task(&self, task: &Task) -> Result<Task, StoreError> {
        let conn = self.conn.lock().unwrap();
        rows::check_blocked_by_acyclic(&conn, task)?;
        rows::insert_task(&conn, task)?;
        rows::get_task(&conn, task.id)?.ok_or(StoreError::NotFound)
    }

    /// `UpdateTask` always re-reads after write (spec §4.1 contract).
    pub fn update_task(&self, task: &Task) -> Result<Task, StoreError> {
        let conn = self.conn.lock().unwrap();
        rows::check_blocked_by_acyclic(&conn, task)?;
        rows::update_task(&conn, task)?;
        rows::get_task(&conn, task.id)?.ok_or(StoreError::NotFound)
    }

    pub fn get_task(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        let conn = self.conn.lock().unwrap();
        rows::get_task(&conn, id)
    }

    pub fn list_tasks(&self) -> Result<Vec<Task>, StoreError> {
        let conn = self.conn.lock().unwrap();
        rows::list_tasks(&conn)
    }

    pub fn delete_task(&self, id: Uuid) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM tasks WHERE id = ?1", params![id.to_string()])
            .map_err(StoreError::Sqlite)?;
        Ok(())
    }

    // ---- TaskState CRUD -------------------------------------------------

    pub fn get_task_state(&self, task_id: Uuid) -> Result<TaskState, StoreError> {
        let conn = self.conn.lock().unwrap();
        Ok(rows::get_task_state(&conn, task_id)?.unwrap_or_default())
    }

    pub fn put_task_state(&self, task_id: Uuid, state: &TaskState) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        rows::put_task_state(&conn, task_id, state)
    }

    /// The only sanctioned path (along with [`Store::interrupt_task`] and
    /// [`Store::complete_task`]) to mark abnormal termination: writes
    /// `task.status` and `state.error` atomically in one transaction (spec
    /// §4.1, §4.8, §7).
    pub fn fail_task(
        &self,
        mut task: Task,
        mut state: TaskState,
        err: impl Into<String>,
    ) -> Result<(Task, TaskState), StoreError> {
        task.status = TaskStatus::Failed;
        state.error = err.into();
        self.atomic_task_and_state(task, state)
    }

    pub fn interrupt_task(
        &self,
        mut task: Task,
        mut state: TaskState,
        reason: impl Into<String>,
    ) -> Result<(Task, TaskState), StoreError> {
        task.status = TaskStatus::Interrupted;
        task.execution_info = Default::default();
        state.error = reason.into();
        self.atomic_task_and_state(task, state)
    }

    pub fn complete_task(&self, mut task: Task, state: TaskState) -> Result<(Task, TaskState), StoreError> {
        task.status = TaskStatus::Completed;
        self.atomic_task_and_state(task, state)
    }

    /// The fourth sanctioned transition alongside [`Store::fail_task`],
    /// [`Store::interrupt_task`], and [`Store::complete_task`]: parks a
    /// task pending a decision (a blocking gate, or clarification needed),
    /// writing `task.status` and `state.error` atomically. Unlike
    /// `interrupt_task`, execution info is left untouched — the executor
    /// is still alive and waiting, not orphaned (spec §4.1, §4.6, §7).
    pub fn block_task(
        &self,
        mut task: Task,
        mut state: TaskState,
        reason: impl Into<String>,
    ) -> Result<(Task, TaskState), StoreError> {
        task.status = TaskStatus::Blocked;
        state.error = reason.into();
        self.atomic_task_and_state(task, state)
    }

    fn atomic_task_and_state(
        &self,
        task: Task,
        state: TaskState,
    ) -> Result<(Task, TaskState), StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(StoreError::Sqlite)?;
        rows::update_task_tx(&tx, &task)?;
        rows::put_task_state_tx(&tx, task.id, &state)?;
        tx.commit().map_err(StoreError::Sqlite)?;
        let reloaded_task = rows::get_task(&conn, task.id)?.ok_or(StoreError::NotFound)?;
        let reloaded_state = rows::get_task_state(&conn, task.id)?.unwrap_or_default();
        Ok((reloaded_task, reloaded_state))
    }

    // ---- Artifacts -------------------------------------------------------

    pub fn put_artifact(&self, artifact: &Artifact) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        rows::put_artifact(&conn, artifact)
    }

    pub fn get_artifact(
        &self,
        task_id: Uuid,
        phase_id: &str,
        artifact_type: &ArtifactType,
    ) -> Result<Option<Artifact>, StoreError> {
        let conn = self.conn.lock().unwrap();
        rows::get_artifact(&conn, task_id, phase_id, artifact_type)
    }

    // ---- Events ------------------------------------------------------

    pub fn append_event(&self, event: &Event) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        rows::insert_event(&conn, event)
    }

    pub fn list_events(&self, filter: &EventFilter) -> Result<EventPage, StoreError> {
        let conn = self.conn.lock().unwrap();
        rows::list_events(&conn, filter)
    }

    // ---- Decisions ------------------------------------------------------

    pub fn put_decision(
        &self,
        task_id: Uuid,
        phase_id: &str,
        decision: &GateDecision,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        rows::put_decision(&conn, task_id, phase_id, decision)
    }

    pub fn get_decision(
        &self,
        task_id: Uuid,
        phase_id: &str,
    ) -> Result<Option<GateDecision>, StoreError> {
        let conn = self.conn.lock().unwrap();
        rows::get_decision(&conn, task_id, phase_id)
    }

    // ---- Cost ledger ------------------------------------------------------

    pub fn append_cost(
        &self,
        task_id: Uuid,
        phase_id: &str,
        kind: &str,
        amount: f64,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO cost_ledger (task_id, phase_id, kind, amount, recorded_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![task_id.to_string(), phase_id, kind, amount, Utc::now().to_rfc3339()],
        )
        .map_err(StoreError::Sqlite)?;
        Ok(())
    }

    pub fn cost_summary(&self, task_id: Uuid) -> Result<CostSummary, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT kind, amount FROM cost_ledger WHERE task_id = ?1")
            .map_err(StoreError::Sqlite)?;
        let rows = stmt
            .query_map(params![task_id.to_string()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
            })
            .map_err(StoreError::Sqlite)?;
        let mut summary = CostSummary::default();
        for row in rows {
            let (kind, amount) = row.map_err(StoreError::Sqlite)?;
            summary.total += amount;
            *summary.by_kind.entry(kind).or_insert(0.0) += amount;
        }
        Ok(summary)
    }

    // ---- Budgets ------------------------------------------------------

    pub fn get_budget(&self, key: &str) -> Result<Option<f64>, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT value FROM budgets WHERE key = ?1",
            params![key],
            |row| row.get::<_, f64>(0),
        )
        .optional()
        .map_err(StoreError::Sqlite)
    }

    pub fn set_budget(&self, key: &str, value: f64) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO budgets (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .map_err(StoreError::Sqlite)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orc_common::{GateSource, TaskStatus, Weight};

    #[test]
    fn create_then_get_round_trips() {
        let store = Store::open_in_memory().unwrap();
        let task = Task::new("t1", "desc", Weight::Small);
        let created = store.create_task(&task).unwrap();
        assert_eq!(created.id, task.id);
        let fetched = store.get_task(task.id).unwrap().unwrap();
        assert_eq!(fetched.title, "t1");
    }

    #[test]
    fn update_task_reloads_from_store_not_input() {
        let store = Store::open_in_memory().unwrap();
        let mut task = Task::new("t1", "desc", Weight::Small);
        store.create_task(&task).unwrap();

        task.title = "renamed".into();
        let updated = store.update_task(&task).unwrap();
        assert_eq!(updated.title, "renamed");

        // A stale in-memory copy must not be what callers see.
        let reloaded = store.get_task(task.id).unwrap().unwrap();
        assert_eq!(reloaded.title, "renamed");
    }

    #[test]
    fn fail_task_writes_status_and_error_atomically() {
        let store = Store::open_in_memory().unwrap();
        let task = Task::new("t1", "desc", Weight::Small);
        store.create_task(&task).unwrap();
        let state = TaskState::default();

        let (task, state) = store.fail_task(task, state, "turn timed out").unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(state.error, "turn timed out");

        let reloaded_task = store.get_task(task.id).unwrap().unwrap();
        let reloaded_state = store.get_task_state(task.id).unwrap();
        assert_eq!(reloaded_task.status, TaskStatus::Failed);
        assert_eq!(reloaded_state.error, "turn timed out");
    }

    #[test]
    fn block_task_writes_status_and_error_atomically_without_clearing_execution_info() {
        let store = Store::open_in_memory().unwrap();
        let mut task = Task::new("t1", "desc", Weight::Small);
        task.execution_info.pid = Some(4242);
        store.create_task(&task).unwrap();
        let state = TaskState::default();

        let (task, state) = store.block_task(task, state, "awaiting human decision").unwrap();
        assert_eq!(task.status, TaskStatus::Blocked);
        assert_eq!(state.error, "awaiting human decision");
        assert_eq!(task.execution_info.pid, Some(4242));

        let reloaded_task = store.get_task(task.id).unwrap().unwrap();
        assert_eq!(reloaded_task.status, TaskStatus::Blocked);
        assert_eq!(reloaded_task.execution_info.pid, Some(4242));
    }

    #[test]
    fn missing_artifact_returns_empty_not_error() {
        let store = Store::open_in_memory().unwrap();
        let result = store
            .get_artifact(Uuid::new_v4(), "spec", &ArtifactType::Spec)
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn artifact_round_trips_bytes_exactly() {
        let store = Store::open_in_memory().unwrap();
        let task_id = Uuid::new_v4();
        let artifact = Artifact {
            task_id,
            phase_id: "spec".into(),
            artifact_type: ArtifactType::Spec,
            content: "# Spec\n\nSome unicode: caf\u{e9}".into(),
            created_at: Utc::now(),
        };
        store.put_artifact(&artifact).unwrap();
        let fetched = store
            .get_artifact(task_id, "spec", &ArtifactType::Spec)
            .unwrap()
            .unwrap();
        assert_eq!(fetched.content, artifact.content);
    }

    #[test]
    fn event_append_and_query_by_task() {
        let store = Store::open_in_memory().unwrap();
        let task_id = Uuid::new_v4();
        for i in 0..3 {
            let event = Event::new(
                Some(task_id),
                EventType::Phase,
                serde_json::json!({"i": i}),
                "phase_runner",
            );
            store.append_event(&event).unwrap();
        }
        let page = store
            .list_events(&EventFilter {
                task_id: Some(task_id),
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.events.len(), 3);
        assert!(!page.has_more);
    }

    #[test]
    fn event_query_paginates_with_has_more() {
        let store = Store::open_in_memory().unwrap();
        let task_id = Uuid::new_v4();
        for i in 0..5 {
            let event = Event::new(Some(task_id), EventType::Activity, serde_json::json!(i), "x");
            store.append_event(&event).unwrap();
        }
        let page = store
            .list_events(&EventFilter {
                task_id: Some(task_id),
                limit: 2,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.events.len(), 2);
        assert!(page.has_more);
    }

    #[test]
    fn event_query_by_initiative_only_returns_events_for_that_initiatives_tasks() {
        let store = Store::open_in_memory().unwrap();
        let mut task_a = Task::new("a", "d", Weight::Small);
        let initiative_id = Uuid::new_v4();
        task_a.initiative_id = Some(initiative_id);
        let task_a = store.create_task(&task_a).unwrap();

        let task_b = Task::new("b", "d", Weight::Small);
        let task_b = store.create_task(&task_b).unwrap();

        store
            .append_event(&Event::new(Some(task_a.id), EventType::Phase, serde_json::json!({}), "x"))
            .unwrap();
        store
            .append_event(&Event::new(Some(task_b.id), EventType::Phase, serde_json::json!({}), "x"))
            .unwrap();

        let page = store
            .list_events(&EventFilter {
                initiative_id: Some(initiative_id),
                limit: 10,
                ..Default::default()
            })
            .unwrap();

        assert_eq!(page.events.len(), 1);
        assert_eq!(page.events[0].task_id, Some(task_a.id));
    }

    #[test]
    fn decision_resolves_exactly_once() {
        let store = Store::open_in_memory().unwrap();
        let task_id = Uuid::new_v4();
        assert!(store.get_decision(task_id, "review").unwrap().is_none());

        let decision = GateDecision::approve(GateSource::Human, "LGTM");
        store.put_decision(task_id, "review", &decision).unwrap();
        let fetched = store.get_decision(task_id, "review").unwrap().unwrap();
        assert!(fetched.approved);
    }

    #[test]
    fn cost_summary_aggregates_by_kind() {
        let store = Store::open_in_memory().unwrap();
        let task_id = Uuid::new_v4();
        store.append_cost(task_id, "implement", "input_tokens", 10.0).unwrap();
        store.append_cost(task_id, "implement", "input_tokens", 5.0).unwrap();
        store.append_cost(task_id, "implement", "output_tokens", 2.0).unwrap();

        let summary = store.cost_summary(task_id).unwrap();
        assert_eq!(summary.total, 17.0);
        assert_eq!(summary.by_kind["input_tokens"], 15.0);
    }

    #[test]
    fn create_task_rejects_self_reference() {
        let store = Store::open_in_memory().unwrap();
        let mut task = Task::new("t1", "desc", Weight::Small);
        task.blocked_by.insert(task.id);
        let err = store.create_task(&task).unwrap_err();
        assert!(matches!(err, StoreError::SelfReference(id) if id == task.id));
    }

    #[test]
    fn create_task_rejects_blocked_by_referencing_a_nonexistent_task() {
        let store = Store::open_in_memory().unwrap();
        let mut task = Task::new("t1", "desc", Weight::Small);
        task.blocked_by.insert(Uuid::new_v4());
        let err = store.create_task(&task).unwrap_err();
        assert!(matches!(err, StoreError::UnknownBlockedBy(_)));
    }

    #[test]
    fn update_task_rejects_a_cycle_through_another_task() {
        let store = Store::open_in_memory().unwrap();
        let a = store.create_task(&Task::new("a", "d", Weight::Small)).unwrap();
        let mut b = Task::new("b", "d", Weight::Small);
        b.blocked_by.insert(a.id);
        let b = store.create_task(&b).unwrap();

        let mut a = a;
        a.blocked_by.insert(b.id);
        let err = store.update_task(&a).unwrap_err();
        assert!(matches!(err, StoreError::CyclicDependency { .. }));
    }

    #[test]
    fn budget_get_set_round_trip() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.get_budget("monthly_usd").unwrap().is_none());
        store.set_budget("monthly_usd", 500.0).unwrap();
        assert_eq!(store.get_budget("monthly_usd").unwrap(), Some(500.0));
        store.set_budget("monthly_usd", 750.0).unwrap();
        assert_eq!(store.get_budget("monthly_usd").unwrap(), Some(750.0));
    }
}
