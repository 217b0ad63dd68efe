//! Supervisor (C10, spec §4.10).
//!
//! Process-local admission control: orphan sweep at startup, blocker
//! validation before admitting a run request, a per-project concurrency cap
//! enforced with a `tokio::sync::Semaphore` (same primitive the teacher's
//! `dag::executor` uses for `max_parallel`), and an LRU of open per-project
//! [`Store`]s so a long-lived process doesn't keep every project's sqlite
//! connection open forever.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use orc_common::task::{Task, TaskStatus};
use orc_store::Store;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

/// One entry in the `task_blocked` response shape (spec §6, testable
/// property 6).
#[derive(Debug, Clone, serde::Serialize)]
pub struct BlockerInfo {
    pub id: Uuid,
    pub title: String,
    pub status: TaskStatus,
}

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("task blocked by incomplete dependencies")]
    Blocked { blockers: Vec<BlockerInfo> },
    #[error("store error: {0}")]
    Store(#[from] orc_store::StoreError),
}

impl orc_common::error::Classify for AdmissionError {
    fn kind(&self) -> orc_common::error::ErrorKind {
        use orc_common::error::ErrorKind;
        match self {
            AdmissionError::Blocked { .. } => ErrorKind::Precondition,
            AdmissionError::Store(e) => e.kind(),
        }
    }
}

/// Result of an orphan sweep: tasks whose recorded PID was not live and
/// were transitioned to `interrupted`.
#[derive(Debug, Default)]
pub struct OrphanSweepReport {
    pub interrupted: Vec<Uuid>,
}

/// Whether a PID is live. A trait so tests don't need a real process; the
/// production impl shells out to `kill(pid, 0)`, the standard POSIX
/// liveness probe (no signal delivered, just existence + permission
/// checked).
pub trait PidLiveness: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

pub struct OsPidLiveness;
impl PidLiveness for OsPidLiveness {
    #[cfg(unix)]
    fn is_alive(&self, pid: u32) -> bool {
        // kill(pid, 0): no signal sent, just existence/permission check.
        // ESRCH means "no such process"; any other outcome (success, or
        // EPERM because it's owned by another user) counts as alive.
        unsafe { libc::kill(pid as i32, 0) == 0 || *libc::__errno_location() != libc::ESRCH }
    }

    #[cfg(not(unix))]
    fn is_alive(&self, _pid: u32) -> bool {
        // No POSIX liveness probe off unix; conservatively assume alive so
        // we never falsely orphan a task that's actually still running.
        true
    }
}

/// Runs the orphan sweep across a single project's store: any task with
/// status=running whose recorded PID is not live is interrupted (spec
/// §4.8, §4.10, testable property 3 — heartbeat age alone never qualifies).
pub fn sweep_orphans(store: &Store, liveness: &dyn PidLiveness) -> Result<OrphanSweepReport, orc_store::StoreError> {
    let mut report = OrphanSweepReport::default();
    for task in store.list_tasks()? {
        if task.status != TaskStatus::Running {
            continue;
        }
        let alive = task.execution_info.pid.is_some_and(|pid| liveness.is_alive(pid));
        if alive {
            continue;
        }
        let state = store.get_task_state(task.id)?;
        let (interrupted, _) = store.interrupt_task(
            task,
            state,
            "executor process not found at startup orphan sweep".to_string(),
        )?;
        warn!(task_id = %interrupted.id, "orphan sweep: task interrupted, no live executor PID");
        report.interrupted.push(interrupted.id);
    }
    Ok(report)
}

/// A resource snapshot sampled on `diagnostics.resource_tracking`'s
/// interval (SPEC_FULL §0 supplement).
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ResourceSnapshot {
    pub process_count: usize,
    pub memory_bytes: u64,
    pub matched_patterns: Vec<String>,
}

impl ResourceSnapshot {
    /// Whether this snapshot should be emitted as a `warning` Event: only
    /// when a configured pattern matched AND the memory threshold was
    /// crossed (SPEC_FULL §0).
    pub fn should_warn(&self, memory_threshold_mb: u64) -> bool {
        !self.matched_patterns.is_empty() && self.memory_bytes >= memory_threshold_mb * 1_000_000
    }
}

/// FIFO-within-priority admission queue. Higher priority preempts queue
/// position (it's inserted ahead of equal-or-lower-priority entries) but
/// never preempts an already-running executor (spec §4.10).
#[derive(Default)]
struct AdmissionQueue {
    entries: VecDeque<(i32, Uuid)>,
}

impl AdmissionQueue {
    fn push(&mut self, priority: i32, task_id: Uuid) {
        let pos = self
            .entries
            .iter()
            .position(|(p, _)| *p < priority)
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, (priority, task_id));
    }

    fn pop(&mut self) -> Option<Uuid> {
        self.entries.pop_front().map(|(_, id)| id)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// A small fixed-capacity LRU so a long-lived supervisor process doesn't
/// keep unbounded per-project sqlite connections open. Evicts the
/// least-recently-touched project when `capacity` is exceeded.
pub struct ProjectStoreCache {
    capacity: usize,
    order: VecDeque<String>,
    stores: std::collections::HashMap<String, Arc<Store>>,
}

impl ProjectStoreCache {
    pub fn new(capacity: usize) -> Self {
        ProjectStoreCache {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            stores: std::collections::HashMap::new(),
        }
    }

    /// Returns an open store for `project_id`, opening it at `db_path` if
    /// not already cached, and touches its recency.
    pub fn get_or_open(&mut self, project_id: &str, db_path: &std::path::Path) -> Result<Arc<Store>, orc_store::StoreError> {
        if let Some(store) = self.stores.get(project_id).cloned() {
            self.touch(project_id);
            return Ok(store);
        }

        let store = Arc::new(Store::open(db_path)?);
        if self.stores.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.stores.remove(&evicted);
            }
        }
        self.stores.insert(project_id.to_string(), store.clone());
        self.order.push_back(project_id.to_string());
        Ok(store)
    }

    fn touch(&mut self, project_id: &str) {
        if let Some(pos) = self.order.iter().position(|id| id == project_id) {
            self.order.remove(pos);
        }
        self.order.push_back(project_id.to_string());
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }
}

/// Process-local admission controller for a single project. Holds the
/// concurrency-cap semaphore and the FIFO-within-priority admission queue;
/// one `Supervisor` per open project, held by whatever process-scoped
/// "Runtime" value owns the whole fleet (spec §9's re-architecture note).
pub struct Supervisor {
    store: Arc<Store>,
    semaphore: Arc<Semaphore>,
    queue: std::sync::Mutex<AdmissionQueue>,
}

impl Supervisor {
    pub fn new(store: Arc<Store>, max_concurrent: usize) -> Self {
        Supervisor {
            store,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            queue: std::sync::Mutex::new(AdmissionQueue::default()),
        }
    }

    /// Startup orphan sweep (spec §4.10).
    pub fn sweep_orphans_at_startup(&self) -> Result<OrphanSweepReport, orc_store::StoreError> {
        sweep_orphans(&self.store, &OsPidLiveness)
    }

    /// Re-checks a single task's PID liveness on a resume attempt (spec
    /// §4.8: "on startup OR on a resume attempt, a task in running whose
    /// recorded PID is not live is considered orphaned"). Returns `true` if
    /// the task was found orphaned and interrupted; resume callers should
    /// reload the task afterward and resume from its last incomplete phase
    /// rather than treating this as a failure.
    pub fn ensure_not_orphaned(&self, task_id: Uuid) -> Result<bool, orc_store::StoreError> {
        let Some(task) = self.store.get_task(task_id)? else {
            return Ok(false);
        };
        if task.status != TaskStatus::Running {
            return Ok(false);
        }
        if task.execution_info.pid.is_some_and(|pid| OsPidLiveness.is_alive(pid)) {
            return Ok(false);
        }
        let state = self.store.get_task_state(task_id)?;
        let (interrupted, _) = self.store.interrupt_task(
            task,
            state,
            "executor process not found on resume attempt".to_string(),
        )?;
        warn!(task_id = %interrupted.id, "resume attempt found orphaned task, interrupted");
        Ok(true)
    }

    /// Validates `blocked_by` is satisfied, unless `force` is set. Returns
    /// the structured `task_blocked` error enumerating blockers otherwise
    /// (spec §6, §10 testable property 6).
    pub fn check_blockers(&self, task: &Task, force: bool) -> Result<(), AdmissionError> {
        if force || task.blocked_by.is_empty() {
            return Ok(());
        }
        let mut blockers = Vec::new();
        for blocker_id in &task.blocked_by {
            if let Some(blocker) = self.store.get_task(*blocker_id)?
                && blocker.status != TaskStatus::Completed
            {
                blockers.push(BlockerInfo {
                    id: blocker.id,
                    title: blocker.title,
                    status: blocker.status,
                });
            }
        }
        if blockers.is_empty() {
            Ok(())
        } else {
            Err(AdmissionError::Blocked { blockers })
        }
    }

    /// Acquires a concurrency-cap permit, queuing FIFO-within-priority if
    /// the cap is already saturated (spec §4.10). Returns a permit whose
    /// drop releases the slot for the next queued task.
    pub async fn admit(&self, task_id: Uuid, priority: i32) -> tokio::sync::OwnedSemaphorePermit {
        {
            let mut queue = self.queue.lock().unwrap();
            queue.push(priority, task_id);
        }
        let permit = self.semaphore.clone().acquire_owned().await.expect("semaphore never closed");
        {
            let mut queue = self.queue.lock().unwrap();
            queue.pop();
        }
        info!(task_id = %task_id, "admitted for execution");
        permit
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

/// Per-project filesystem layout helper (spec §6): `<root>/.orc/orc.db`.
pub fn project_db_path(project_root: &std::path::Path) -> PathBuf {
    project_root.join(".orc").join("orc.db")
}
