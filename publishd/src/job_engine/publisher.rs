// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::Child;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Context};
use async_io::Async;
use async_pidfd::AsyncPidFd;
use futures::{AsyncRead, AsyncReadExt};
use log::{debug, error, info, warn};
use serde::{Serialize, Serializer};
use serde_json::{json, Value};
use time::OffsetDateTime;

use crate::collaborators::data_source::DataSource;
use crate::collaborators::template::Renderer;
use crate::config::PublisherConfig;
use crate::job_engine::process_group::{spawn_in_new_session, ExportCommand, ProcessGroup};
use crate::job_engine::queue::{QueueError, TaskQueue};
use crate::job_engine::task::{Payload, Task, TaskId};

const PARAMETER_FILE_NAME: &str = "project.properties";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PublisherState {
    Init,
    Idle,
    Refreshing,
    Running,
}

/// Where the publisher loop currently is. The current task lives inside the
/// variant, so "current" can never disagree with the state.
#[derive(Debug)]
enum Phase {
    Init,
    Idle,
    Refreshing { task: Task, cancelled: bool },
    Running { task: Task, group: ProcessGroup },
}

impl Phase {
    fn state(&self) -> PublisherState {
        match self {
            Phase::Init => PublisherState::Init,
            Phase::Idle => PublisherState::Idle,
            Phase::Refreshing { .. } => PublisherState::Refreshing,
            Phase::Running { .. } => PublisherState::Running,
        }
    }

    fn task(&self) -> Option<&Task> {
        match self {
            Phase::Init | Phase::Idle => None,
            Phase::Refreshing { task, .. } | Phase::Running { task, .. } => Some(task),
        }
    }
}

#[derive(Debug)]
struct Slots {
    phase: Phase,
    last: Option<Task>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueuedTask {
    pub task_id: TaskId,
    pub task: Task,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublisherStatus {
    pub state: PublisherState,
    #[serde(serialize_with = "serialize_report")]
    pub last_task: Option<Task>,
    #[serde(serialize_with = "serialize_report")]
    pub current_task: Option<Task>,
    pub queue: Vec<QueuedTask>,
}

fn serialize_report<S: Serializer>(task: &Option<Task>, serializer: S) -> Result<S::Ok, S::Error> {
    task.as_ref().map(Task::report).serialize(serializer)
}

/// Cloneable front door to a [`Publisher`]: enqueueing, removal, termination
/// and status. Safe to use while the publisher loop is running.
#[derive(Debug, Clone)]
pub struct PublisherHandle {
    queue: Arc<TaskQueue<Task>>,
    slots: Arc<Mutex<Slots>>,
}

impl PublisherHandle {
    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn publish(&self, payload: Payload) -> Result<TaskId, QueueError> {
        let id = self.queue.push_with(|id| Task::new(id, payload))?;
        info!("Enqueued task {id} ({} pending)", self.queue.len());
        Ok(id)
    }

    pub fn remove(&self, id: TaskId) -> bool {
        match self.queue.remove(id) {
            Ok(_) => {
                info!("Removed task {id} from the queue");
                true
            }
            Err(e) => {
                debug!("Cannot remove task: {e}");
                false
            }
        }
    }

    pub fn remove_all(&self) {
        info!("Removing all {} queued tasks", self.queue.len());
        self.queue.clear();
    }

    /// Stops the active job, if any. A running export gets SIGTERM on its
    /// whole process group; a job still refreshing is abandoned before spawn.
    pub fn terminate_current(&self) -> bool {
        let mut slots = self.lock();
        match &mut slots.phase {
            Phase::Init | Phase::Idle => false,
            Phase::Refreshing { task, cancelled } => {
                info!("Cancelling task {} before its export starts", task.id);
                *cancelled = true;
                true
            }
            Phase::Running { task, group } => {
                info!("Terminating current task {}", task.id);
                if let Err(e) = group.terminate() {
                    warn!("Failed to signal process group {}: {e}", group.id());
                }
                true
            }
        }
    }

    pub fn state(&self) -> PublisherState {
        self.lock().phase.state()
    }

    pub fn enqueued(&self) -> Vec<QueuedTask> {
        self.queue
            .snapshot()
            .into_iter()
            .map(|(task_id, task)| QueuedTask { task_id, task })
            .collect()
    }

    pub fn status(&self) -> PublisherStatus {
        let slots = self.lock();
        PublisherStatus {
            state: slots.phase.state(),
            last_task: slots.last.clone(),
            current_task: slots.phase.task().cloned(),
            queue: self.enqueued(),
        }
    }
}

struct ExportOutput {
    return_code: i32,
    stdout: String,
    stderr: String,
}

/// The single consumer of the task queue. Runs one export at a time.
pub struct Publisher<S, R> {
    handle: PublisherHandle,
    source: S,
    renderer: R,
    export: ExportCommand,
    auth: Value,
}

impl<S: DataSource, R: Renderer> Publisher<S, R> {
    pub fn new(config: &PublisherConfig, auth: Value, source: S, renderer: R) -> Self {
        Self {
            handle: PublisherHandle {
                queue: Arc::new(TaskQueue::new(config.queue_maxsize)),
                slots: Arc::new(Mutex::new(Slots {
                    phase: Phase::Init,
                    last: None,
                })),
            },
            source,
            renderer,
            export: ExportCommand {
                script: config.script.clone(),
                argument_prefix: config.argument_prefix.clone(),
                env: config.env.clone(),
            },
            auth,
        }
    }

    pub fn handle(&self) -> PublisherHandle {
        self.handle.clone()
    }

    /// Publishes queued tasks forever. Only ends when the future is dropped.
    pub async fn run(self) {
        self.handle.lock().phase = Phase::Idle;
        info!(
            "Publisher ready for {} (queue capacity {})",
            self.export.script.display(),
            self.handle.queue.capacity()
        );

        loop {
            let (id, task) = self.handle.queue.pop().await;
            debug!("Dequeued task {id}");

            if let Err(e) = self.publish(task).await {
                error!("Error while attempting to publish task {id}: {e:#}");
            }

            // a failed task is dropped here, `last` keeps the previous result
            self.handle.lock().phase = Phase::Idle;
        }
    }

    async fn publish(&self, task: Task) -> anyhow::Result<()> {
        let id = task.id;
        let payload = task.payload.clone();
        self.handle.lock().phase = Phase::Refreshing {
            task,
            cancelled: false,
        };

        let refreshed = self
            .source
            .refresh(payload)
            .await
            .with_context(|| format!("failed to refresh payload of task {id}"))?;

        let context = json!({
            "payload": refreshed,
            "auth": self.auth,
        });
        debug!("Rendering task {id} with payload {}", context["payload"]);
        let properties = self
            .renderer
            .render(&context)
            .context("failed to render the parameter file")?;

        // removed when dropped: on return, on error and when the loop is cancelled
        let staging = tempfile::Builder::new()
            .prefix("publishd-")
            .tempdir()
            .context("failed to create staging directory")?;
        let parameter_file = staging.path().join(PARAMETER_FILE_NAME);
        std::fs::write(&parameter_file, properties)
            .with_context(|| format!("failed to write {}", parameter_file.display()))?;

        let child = {
            let mut slots = self.handle.lock();
            let mut task = match std::mem::replace(&mut slots.phase, Phase::Idle) {
                Phase::Refreshing {
                    cancelled: true, ..
                } => {
                    info!("Task {id} was terminated while refreshing, skipping export");
                    return Ok(());
                }
                Phase::Refreshing {
                    mut task,
                    cancelled: false,
                } => {
                    task.payload = context["payload"].clone();
                    task
                }
                other @ (Phase::Init | Phase::Idle | Phase::Running { .. }) => {
                    slots.phase = other;
                    return Err(anyhow!("task {id} is no longer the current task"));
                }
            };

            info!("Running export for task {id}");
            info!(" {}", self.export.invocation(&parameter_file));
            task.start_time = Some(OffsetDateTime::now_utc());
            let (child, group) = spawn_in_new_session(&mut self.export.command(&parameter_file))
                .context("failed to spawn the export tool")?;
            debug!("Export of task {id} runs in process group {}", group.id());
            slots.phase = Phase::Running { task, group };
            child
        };

        let output = wait_for_exit(child).await;
        let end_time = OffsetDateTime::now_utc();

        let mut slots = self.handle.lock();
        match std::mem::replace(&mut slots.phase, Phase::Idle) {
            Phase::Running { mut task, group } => {
                let output = match output {
                    Ok(output) => output,
                    Err(e) => {
                        if let Err(signal_error) = group.terminate() {
                            warn!(
                                "Failed to signal process group {}: {signal_error}",
                                group.id()
                            );
                        }
                        return Err(e);
                    }
                };
                info!("Export of task {id} completed, rc={}", output.return_code);
                debug!("stdout={:?} stderr={:?}", output.stdout, output.stderr);
                task.return_code = Some(output.return_code);
                task.stdout = Some(output.stdout);
                task.stderr = Some(output.stderr);
                task.end_time = Some(end_time);
                slots.last = Some(task);
                Ok(())
            }
            other @ (Phase::Init | Phase::Idle | Phase::Refreshing { .. }) => {
                slots.phase = other;
                Err(anyhow!("task {id} is no longer the running task"))
            }
        }
    }
}

async fn read_all(mut pipe: impl AsyncRead + Unpin) -> io::Result<String> {
    let mut buf = Vec::new();
    pipe.read_to_end(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Collects stdout and stderr completely while waiting for the child to exit.
/// A child killed by signal `n` reports `-n`.
async fn wait_for_exit(mut child: Child) -> anyhow::Result<ExportOutput> {
    let stdout = Async::new(child.stdout.take().context("export stdout is not piped")?)?;
    let stderr = Async::new(child.stderr.take().context("export stderr is not piped")?)?;
    let pid_fd = AsyncPidFd::from_pid(child.id() as i32).context("failed to open pidfd")?;

    let (stdout, stderr, exit) = futures::join!(read_all(stdout), read_all(stderr), pid_fd.wait());
    let status = exit.context("failed to wait for the export tool")?.status();

    Ok(ExportOutput {
        return_code: status
            .code()
            .or_else(|| status.signal().map(|signal| -signal))
            .unwrap_or(-1),
        stdout: stdout.context("failed to read export stdout")?,
        stderr: stderr.context("failed to read export stderr")?,
    })
}
