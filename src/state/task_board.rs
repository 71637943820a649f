use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use crate::scheduler::spec::TaskKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Idle,
    Due,
    Running,
    Succeeded,
    Failed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Idle => "idle",
            TaskStatus::Due => "due",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// What the read API shows for one task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    /// Position in the resolved run order.
    pub order: usize,
    pub name: String,
    pub kind: TaskKind,
    pub interval_secs: u64,
    pub depends_on: Option<String>,
    pub status: TaskStatus,
    /// Unix seconds of the last execution start.
    pub last_run_at: Option<i64>,
    pub last_result: Option<bool>,
    pub last_error: Option<String>,
    pub last_duration_ms: Option<u64>,
    pub runs: u64,
    pub failures: u64,
}

/// Latest state of every scheduled task. The scheduler writes, the API reads.
#[derive(Default)]
pub struct TaskBoard {
    tasks: DashMap<String, TaskSnapshot>,
}

impl TaskBoard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn publish(&self, snapshot: TaskSnapshot) {
        self.tasks.insert(snapshot.name.clone(), snapshot);
    }

    pub fn set_status(&self, name: &str, status: TaskStatus) {
        if let Some(mut entry) = self.tasks.get_mut(name) {
            entry.status = status;
        }
    }

    #[cfg(test)]
    pub fn get(&self, name: &str) -> Option<TaskSnapshot> {
        self.tasks.get(name).map(|t| t.clone())
    }

    /// All tasks in run order.
    pub fn snapshot(&self) -> Vec<TaskSnapshot> {
        let mut all: Vec<TaskSnapshot> = self.tasks.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|t| t.order);
        all
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }
}
