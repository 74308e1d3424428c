// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use anyhow::Context;
use async_io::Async;
use futures::executor::LocalPool;
use futures::task::LocalSpawnExt;
use log::{error, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};

use crate::collaborators::data_source::{PassThrough, SingleFlight};
use crate::collaborators::template::PlaceholderTemplate;
use crate::config::{Config, ShutdownPolicy};
use crate::control::server::ControlServer;
use crate::job_engine::publisher::{Publisher, PublisherHandle, PublisherState};
use crate::tailer::observer::LogTailer;

/// Wires publisher, tailer and control socket onto one `LocalPool` and runs
/// them until SIGINT or SIGTERM arrives.
pub struct Service {
    config: Config,
}

impl Service {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn run(self) -> anyhow::Result<()> {
        // must happen before any thread exists so every thread inherits the mask
        let signals = shutdown_signals().context("failed to set up signal handling")?;

        let config = self.config;
        let renderer = PlaceholderTemplate::from_file(&config.publisher.template)?;
        let publisher = Publisher::new(
            &config.publisher,
            config.auth.clone(),
            SingleFlight::new(PassThrough),
            renderer,
        );
        let publisher_handle = publisher.handle();
        let tailer = LogTailer::new(&config.tailer.file_path, config.tailer.backlog);
        let control = ControlServer::bind(
            &config.control.socket_path,
            publisher.handle(),
            tailer.handle(),
        )?;

        let mut pool = LocalPool::new();
        let spawner = pool.spawner();
        let future_handles = vec![
            spawner
                .spawn_local_with_handle(publisher.run())
                .context("failed to spawn the publisher loop")?,
            spawner
                .spawn_local_with_handle(async move {
                    if let Err(e) = tailer.run().await {
                        error!("Log tailer stopped: {e:#}");
                    }
                })
                .context("failed to spawn the log tailer")?,
            spawner
                .spawn_local_with_handle(async move {
                    if let Err(e) = control.run().await {
                        error!("Control socket stopped: {e:#}");
                    }
                })
                .context("failed to spawn the control socket")?,
        ];

        info!("Starting publishd");
        let signal = pool.run_until(wait_for_signal(&signals))?;
        info!("Received {signal}, shutting down");

        apply_shutdown_policy(config.publisher.shutdown_policy, &publisher_handle);

        drop(future_handles);
        pool.run_until_stalled();
        info!("Stopping publishd");
        Ok(())
    }
}

fn shutdown_signals() -> anyhow::Result<Async<SignalFd>> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGINT);
    mask.add(Signal::SIGTERM);
    mask.thread_block()?;
    let signal_fd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)?;
    Ok(Async::new(signal_fd)?)
}

async fn wait_for_signal(signals: &Async<SignalFd>) -> anyhow::Result<Signal> {
    loop {
        signals.readable().await?;
        match signals.get_ref().read_signal() {
            Ok(Some(info)) => return Ok(Signal::try_from(info.ssi_signo as i32)?),
            Ok(None) | Err(Errno::EAGAIN) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

fn apply_shutdown_policy(policy: ShutdownPolicy, publisher: &PublisherHandle) {
    match policy {
        ShutdownPolicy::Terminate => {
            if publisher.terminate_current() {
                info!("Terminated the active export");
            }
        }
        ShutdownPolicy::LeaveRunning => {
            if publisher.state() == PublisherState::Running {
                warn!("An export is still running and is left to finish on its own");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::time::{Duration, Instant};

    use async_io::Timer;
    use futures::future::RemoteHandle;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    use super::*;
    use crate::config::PublisherConfig;

    fn config(dir: &Path) -> Config {
        Config::parse(&format!(
            r#"{{
                "publisher": {{"template": "{0}/missing.tmpl", "script": "{0}/run.sh"}},
                "tailer": {{"file_path": "{0}/export.log"}},
                "control": {{"socket_path": "{0}/control.sock"}}
            }}"#,
            dir.display()
        ))
        .unwrap()
    }

    #[test]
    fn missing_template_fails_before_anything_runs() {
        let dir = TempDir::new().unwrap();
        let err = Service::new(config(dir.path())).run().unwrap_err();
        assert!(format!("{err:#}").contains("missing.tmpl"), "{err:#}");
        assert!(!dir.path().join("control.sock").exists());
    }

    /// Starts a publisher whose export sleeps until signalled and waits for it to run.
    fn running_export(dir: &Path, pool: &mut LocalPool) -> (PublisherHandle, RemoteHandle<()>) {
        let script = dir.join("export.sh");
        fs::write(&script, "#!/bin/sh\nsleep 30 & wait\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        let config = PublisherConfig {
            template: dir.join("unused.tmpl"),
            script,
            queue_maxsize: 1,
            env: BTreeMap::from([("PATH".to_string(), "/usr/bin:/bin".to_string())]),
            argument_prefix: "properties=".to_string(),
            shutdown_policy: ShutdownPolicy::LeaveRunning,
        };
        let renderer = |_: &Value| -> anyhow::Result<String> { Ok(String::new()) };
        let publisher = Publisher::new(&config, Value::Null, PassThrough, renderer);
        let handle = publisher.handle();
        let running = pool.spawner().spawn_local_with_handle(publisher.run()).unwrap();

        handle.publish(json!({})).unwrap();
        run_for(pool, Duration::from_secs(10), || handle.state() == PublisherState::Running);
        assert_eq!(handle.state(), PublisherState::Running);
        (handle, running)
    }

    fn run_for(pool: &mut LocalPool, limit: Duration, done: impl Fn() -> bool) {
        let deadline = Instant::now() + limit;
        pool.run_until(async {
            while !done() && Instant::now() < deadline {
                Timer::after(Duration::from_millis(10)).await;
            }
        });
    }

    #[test]
    fn terminate_policy_signals_the_running_export() {
        let dir = TempDir::new().unwrap();
        let mut pool = LocalPool::new();
        let (handle, _running) = running_export(dir.path(), &mut pool);

        apply_shutdown_policy(ShutdownPolicy::Terminate, &handle);
        run_for(&mut pool, Duration::from_secs(10), || handle.status().last_task.is_some());

        let last = handle.status().last_task.unwrap();
        assert_eq!(last.return_code, Some(-15));
    }

    #[test]
    fn leave_running_policy_does_not_signal_the_export() {
        let dir = TempDir::new().unwrap();
        let mut pool = LocalPool::new();
        let (handle, _running) = running_export(dir.path(), &mut pool);

        apply_shutdown_policy(ShutdownPolicy::LeaveRunning, &handle);
        run_for(&mut pool, Duration::from_millis(300), || handle.status().last_task.is_some());

        assert_eq!(handle.state(), PublisherState::Running);
        assert!(handle.status().last_task.is_none());

        assert!(handle.terminate_current());
        run_for(&mut pool, Duration::from_secs(10), || handle.status().last_task.is_some());
    }
}
