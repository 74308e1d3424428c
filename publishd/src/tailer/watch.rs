// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

use async_io::Async;
use log::{debug, info};
use nix::errno::Errno;
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify, InotifyEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    Created,
    Modified,
    Deleted,
    MovedAway,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchKind,
    pub name: OsString,
}

impl WatchEvent {
    pub fn new(kind: WatchKind, name: impl Into<OsString>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    /// One inotify record may carry several flags. Modification wins over
    /// removal, removal over creation. Records without a name describe the
    /// directory itself and are dropped.
    fn from_inotify(event: InotifyEvent) -> Option<Self> {
        let name = event.name?;
        let mask = event.mask;
        let kind = if mask.contains(AddWatchFlags::IN_MODIFY) {
            WatchKind::Modified
        } else if mask.intersects(AddWatchFlags::IN_DELETE | AddWatchFlags::IN_MOVED_FROM) {
            if mask.contains(AddWatchFlags::IN_DELETE) {
                WatchKind::Deleted
            } else {
                WatchKind::MovedAway
            }
        } else if mask.contains(AddWatchFlags::IN_CREATE) {
            WatchKind::Created
        } else {
            return None;
        };
        Some(Self { kind, name })
    }
}

/// inotify watch on a directory, driven by the async-io reactor.
#[derive(Debug)]
pub struct DirectoryWatch {
    inotify: Async<Inotify>,
    dir: PathBuf,
}

impl DirectoryWatch {
    pub fn new(dir: &Path) -> io::Result<Self> {
        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)?;
        inotify.add_watch(
            dir,
            AddWatchFlags::IN_MODIFY
                | AddWatchFlags::IN_CREATE
                | AddWatchFlags::IN_DELETE
                | AddWatchFlags::IN_MOVED_FROM,
        )?;
        info!("inotify set up to watch path: {}", dir.display());
        Ok(Self {
            inotify: Async::new(inotify)?,
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Waits for the next batch of events in the watched directory.
    pub async fn next_events(&self) -> io::Result<Vec<WatchEvent>> {
        loop {
            self.inotify.readable().await?;
            match self.inotify.get_ref().read_events() {
                Ok(events) => {
                    debug!("inotify delivered {} events", events.len());
                    return Ok(events
                        .into_iter()
                        .filter_map(WatchEvent::from_inotify)
                        .collect());
                }
                Err(Errno::EAGAIN) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}
