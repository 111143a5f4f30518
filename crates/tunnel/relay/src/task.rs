//! Task correlation table.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::trace;
use tunnel_session::ContextProbe;
use tunnel_types::{DeviceId, TaskId};

use crate::error::RelayError;

/// Per-request state machine:
/// `received → dispatched → (streaming)* → completed | failed | cancelled`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Received,
    Dispatched,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Tracked state for one inference request.
#[derive(Clone, Debug)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub device_id: DeviceId,
    pub model: String,
    pub streaming: bool,
    pub created_at: DateTime<Utc>,
    pub state: TaskState,
    pub finished_at: Option<DateTime<Utc>>,
}

/// All tracked tasks, owned by the relay.
///
/// Terminal records linger for a bounded retention window so duplicate
/// deliveries of late chunks can be recognized, then [`TaskTable::purge_expired`]
/// drops them. A terminal record never blocks reuse of its id.
#[derive(Default)]
pub struct TaskTable {
    tasks: DashMap<TaskId, TaskRecord>,
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a task. Fails if the id is already tracked in a
    /// non-terminal state; a terminal record is replaced.
    pub fn begin(
        &self,
        task_id: TaskId,
        device_id: DeviceId,
        model: String,
        streaming: bool,
    ) -> Result<(), RelayError> {
        match self.tasks.entry(task_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if !occupied.get().state.is_terminal() {
                    return Err(RelayError::DuplicateTask(task_id));
                }
                occupied.insert(TaskRecord {
                    task_id,
                    device_id,
                    model,
                    streaming,
                    created_at: Utc::now(),
                    state: TaskState::Received,
                    finished_at: None,
                });
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(TaskRecord {
                    task_id,
                    device_id,
                    model,
                    streaming,
                    created_at: Utc::now(),
                    state: TaskState::Received,
                    finished_at: None,
                });
            }
        }
        Ok(())
    }

    /// Apply a state transition. Terminal states are absorbing: exactly one
    /// transition into a terminal state wins, later attempts return `false`.
    pub fn transition(&self, task_id: &TaskId, next: TaskState) -> bool {
        let mut entry = match self.tasks.get_mut(task_id) {
            Some(entry) => entry,
            None => return false,
        };
        if entry.state.is_terminal() {
            return false;
        }
        trace!(task_id = %task_id, from = ?entry.state, to = ?next, "task transition");
        entry.state = next;
        if next.is_terminal() {
            entry.finished_at = Some(Utc::now());
        }
        true
    }

    pub fn get(&self, task_id: &TaskId) -> Option<TaskRecord> {
        self.tasks.get(task_id).map(|t| t.clone())
    }

    /// Tracked and non-terminal.
    pub fn is_active(&self, task_id: &TaskId) -> bool {
        self.tasks
            .get(task_id)
            .map(|t| !t.state.is_terminal())
            .unwrap_or(false)
    }

    /// Drop terminal records older than the retention window. Returns how
    /// many were removed.
    pub fn purge_expired(&self, retention: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::zero());
        let before = self.tasks.len();
        self.tasks.retain(|_, record| match record.finished_at {
            Some(finished_at) => finished_at > cutoff,
            None => true,
        });
        before - self.tasks.len()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl ContextProbe for TaskTable {
    fn is_live(&self, task_id: &TaskId) -> bool {
        self.is_active(task_id)
    }
}
