// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::collections::BTreeMap;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use log::debug;
use nix::sys::signal::{killpg, sigprocmask, SigSet, SigmaskHow, Signal};
use nix::unistd::{setsid, Pid};

/// The process group of a spawned export, led by the child itself.
///
/// Obtained only through [`spawn_in_new_session`], so holding one means the
/// child called `setsid()` before exec and its descendants share the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessGroup {
    pgid: Pid,
}

impl ProcessGroup {
    pub fn id(&self) -> i32 {
        self.pgid.as_raw()
    }

    pub fn signal(&self, signal: Signal) -> nix::Result<()> {
        debug!("Sending {signal} to process group {}", self.pgid);
        killpg(self.pgid, signal)
    }

    pub fn terminate(&self) -> nix::Result<()> {
        self.signal(Signal::SIGTERM)
    }
}

/// Spawns `command` as leader of a new session and process group.
pub fn spawn_in_new_session(command: &mut Command) -> io::Result<(Child, ProcessGroup)> {
    unsafe {
        command.pre_exec(|| {
            // the daemon blocks SIGINT/SIGTERM for its signalfd and the mask survives exec
            sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)?;
            setsid()?;
            Ok(())
        });
    }
    let child = command.spawn()?;
    let pgid = Pid::from_raw(child.id() as i32);
    Ok((child, ProcessGroup { pgid }))
}

/// How the external export tool is invoked.
#[derive(Debug, Clone)]
pub struct ExportCommand {
    pub script: PathBuf,
    pub argument_prefix: String,
    pub env: BTreeMap<String, String>,
}

impl ExportCommand {
    /// `/bin/sh -c './<script> <prefix><parameter file>'` from the script's directory,
    /// with only the configured environment.
    pub fn command(&self, parameter_file: &Path) -> Command {
        let script_name = self
            .script
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let working_dir = match self.script.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let mut command = Command::new("/bin/sh");
        command
            .arg("-c")
            .arg("./\"$0\" \"$1\"")
            .arg(script_name)
            .arg(format!(
                "{}{}",
                self.argument_prefix,
                parameter_file.display()
            ))
            .current_dir(working_dir)
            .env_clear()
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }

    pub fn invocation(&self, parameter_file: &Path) -> String {
        format!(
            "./{} {}{}",
            self.script
                .file_name()
                .map(|name| name.to_string_lossy())
                .unwrap_or_default(),
            self.argument_prefix,
            parameter_file.display()
        )
    }
}
