// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use serde::Serialize;
use time::{Duration, OffsetDateTime};

/// Identifier handed out by the task queue. Never reused within one process.
pub type TaskId = u64;

/// Opaque job descriptor. The runner only passes it to the data source and
/// into the template context.
pub type Payload = serde_json::Value;

/// One publish request, tracked from enqueue until its export finished.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    pub id: TaskId,
    pub payload: Payload,
    pub return_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub start_time: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end_time: Option<OffsetDateTime>,
}

impl Task {
    pub fn new(id: TaskId, payload: Payload) -> Self {
        Self {
            id,
            payload,
            return_code: None,
            stdout: None,
            stderr: None,
            start_time: None,
            end_time: None,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed_at(OffsetDateTime::now_utc())
    }

    /// `now - start` while running, `end - start` once finished, zero before start.
    pub fn elapsed_at(&self, now: OffsetDateTime) -> Duration {
        match (self.start_time, self.end_time) {
            (None, _) => Duration::ZERO,
            (Some(start), None) => now - start,
            (Some(start), Some(end)) => end - start,
        }
    }

    pub fn report(&self) -> TaskReport<'_> {
        TaskReport {
            elapsed: self.elapsed().as_seconds_f64(),
            task: self,
        }
    }
}

/// Serialized view of a task including its derived elapsed time in seconds.
#[derive(Debug, Serialize)]
pub struct TaskReport<'a> {
    #[serde(flatten)]
    pub task: &'a Task,
    pub elapsed: f64,
}
