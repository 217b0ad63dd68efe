use rusqlite::Connection;

use crate::error::StoreError;

/// Forward-only migrations, applied with `CREATE TABLE IF NOT EXISTS` the
/// same way the teacher's `FactoryDb::run_migrations` does. No down
/// migrations, no migration-version table yet — a single batch is
/// idempotent and sufficient until the schema needs to evolve in place.
pub fn run(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT NOT NULL,
            weight TEXT NOT NULL,
            category TEXT,
            priority INTEGER NOT NULL DEFAULT 0,
            queue TEXT,
            initiative_id TEXT,
            blocked_by TEXT NOT NULL DEFAULT '[]',
            related_to TEXT NOT NULL DEFAULT '[]',
            status TEXT NOT NULL,
            current_phase TEXT,
            execution_info TEXT NOT NULL DEFAULT '{}',
            branch TEXT,
            worktree_path TEXT,
            pr_reference TEXT,
            counters TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
        CREATE INDEX IF NOT EXISTS idx_tasks_initiative ON tasks(initiative_id);

        CREATE TABLE IF NOT EXISTS task_states (
            task_id TEXT PRIMARY KEY REFERENCES tasks(id),
            state_json TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS artifacts (
            task_id TEXT NOT NULL,
            phase_id TEXT NOT NULL,
            artifact_type TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (task_id, phase_id, artifact_type)
        );

        CREATE TABLE IF NOT EXISTS events (
            id TEXT PRIMARY KEY,
            task_id TEXT,
            phase_id TEXT,
            iteration INTEGER,
            event_type TEXT NOT NULL,
            data TEXT NOT NULL,
            source TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_events_task ON events(task_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type);

        CREATE TABLE IF NOT EXISTS decisions (
            task_id TEXT NOT NULL,
            phase_id TEXT NOT NULL,
            approved INTEGER NOT NULL,
            reason TEXT NOT NULL,
            questions TEXT NOT NULL DEFAULT '[]',
            source TEXT NOT NULL,
            PRIMARY KEY (task_id, phase_id)
        );

        CREATE TABLE IF NOT EXISTS cost_ledger (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL,
            phase_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            amount REAL NOT NULL,
            recorded_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_cost_task ON cost_ledger(task_id);

        CREATE TABLE IF NOT EXISTS budgets (
            key TEXT PRIMARY KEY,
            value REAL NOT NULL
        );
        "#,
    )
    .map_err(StoreError::Sqlite)
}
