// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use serde::{Deserialize, Serialize};

use crate::job_engine::publisher::{PublisherStatus, QueuedTask};
use crate::job_engine::task::{Payload, TaskId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum Request {
    #[serde(rename = "publish")]
    Publish { payload: Payload },

    #[serde(rename = "list")]
    List,

    #[serde(rename = "remove")]
    Remove { task_id: TaskId },

    #[serde(rename = "remove-all")]
    RemoveAll,

    #[serde(rename = "terminate-current")]
    TerminateCurrent,

    #[serde(rename = "status")]
    Status,

    #[serde(rename = "log-lines")]
    LogLines,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result")]
pub enum Response {
    #[serde(rename = "created")]
    Created { task_id: TaskId },

    #[serde(rename = "tasks")]
    Tasks { tasks: Vec<QueuedTask> },

    #[serde(rename = "removed")]
    Removed,

    #[serde(rename = "not-found")]
    NotFound,

    #[serde(rename = "terminated")]
    Terminated,

    #[serde(rename = "status")]
    Status {
        publisher: PublisherStatus,
        loglines: Vec<String>,
    },

    #[serde(rename = "log-lines")]
    LogLines { lines: Vec<String> },

    #[serde(rename = "error")]
    Error { error: String },
}
