//! `Event` — the persistent log row the Event Bus publishes and the Store
//! appends (spec §3, §4.2).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    State,
    Phase,
    Transcript,
    Tokens,
    Complete,
    Error,
    Activity,
    Heartbeat,
    Warning,
    Finalize,
    FilesChanged,
    DecisionRequired,
    DecisionResolved,
    SessionUpdate,
    TaskCreated,
    TaskUpdated,
    TaskDeleted,
    InitiativeCreated,
    InitiativeUpdated,
    InitiativeDeleted,
}

impl EventType {
    /// Global ("*") subscribers receive these regardless of task ID (spec
    /// §4.2).
    pub fn is_global(self) -> bool {
        matches!(
            self,
            EventType::TaskCreated
                | EventType::TaskUpdated
                | EventType::TaskDeleted
                | EventType::InitiativeCreated
                | EventType::InitiativeUpdated
                | EventType::InitiativeDeleted
                | EventType::SessionUpdate
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub task_id: Option<Uuid>,
    pub phase_id: Option<String>,
    pub iteration: Option<u32>,
    pub event_type: EventType,
    pub data: serde_json::Value,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn new(
        task_id: Option<Uuid>,
        event_type: EventType,
        data: serde_json::Value,
        source: impl Into<String>,
    ) -> Self {
        Event {
            id: Uuid::new_v4(),
            task_id,
            phase_id: None,
            iteration: None,
            event_type,
            data,
            source: source.into(),
            created_at: Utc::now(),
        }
    }

    pub fn with_phase(mut self, phase_id: impl Into<String>) -> Self {
        self.phase_id = Some(phase_id.into());
        self
    }

    pub fn with_iteration(mut self, iteration: u32) -> Self {
        self.iteration = Some(iteration);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_created_is_global() {
        assert!(EventType::TaskCreated.is_global());
        assert!(!EventType::Phase.is_global());
    }

    #[test]
    fn event_round_trips_through_json() {
        let event = Event::new(
            Some(Uuid::new_v4()),
            EventType::Phase,
            serde_json::json!({"phase": "implement"}),
            "phase_runner",
        )
        .with_phase("implement")
        .with_iteration(2);
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back.phase_id.as_deref(), Some("implement"));
        assert_eq!(back.iteration, Some(2));
    }
}
