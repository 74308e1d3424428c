// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use log::{debug, warn};

use super::request::{Request, Response};
use crate::job_engine::publisher::PublisherHandle;
use crate::tailer::observer::TailerHandle;

/// Parses one request line and answers it. Malformed input becomes an
/// `error` response, never a failure of the connection.
pub fn handle_line(line: &str, publisher: &PublisherHandle, tailer: &TailerHandle) -> Response {
    match serde_json::from_str::<Request>(line) {
        Ok(request) => handle_request(request, publisher, tailer),
        Err(e) => {
            warn!("Rejecting malformed control request: {e}");
            Response::Error {
                error: format!("invalid request: {e}"),
            }
        }
    }
}

pub fn handle_request(
    request: Request,
    publisher: &PublisherHandle,
    tailer: &TailerHandle,
) -> Response {
    debug!("Handling control request {request:?}");
    match request {
        Request::Publish { payload } => match publisher.publish(payload) {
            Ok(task_id) => Response::Created { task_id },
            Err(e) => Response::Error {
                error: e.to_string(),
            },
        },
        Request::List => Response::Tasks {
            tasks: publisher.enqueued(),
        },
        Request::Remove { task_id } => {
            if publisher.remove(task_id) {
                Response::Removed
            } else {
                Response::NotFound
            }
        }
        Request::RemoveAll => {
            publisher.remove_all();
            Response::Removed
        }
        Request::TerminateCurrent => {
            if publisher.terminate_current() {
                Response::Terminated
            } else {
                Response::NotFound
            }
        }
        Request::Status => Response::Status {
            publisher: publisher.status(),
            loglines: tailer.lines(),
        },
        Request::LogLines => Response::LogLines {
            lines: tailer.lines(),
        },
    }
}
