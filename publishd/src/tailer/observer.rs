// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::fs::File;
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Context;
use async_io::Timer;
use log::{debug, info, warn};
use serde::Serialize;

use crate::tailer::backlog::Backlog;
use crate::tailer::watch::{DirectoryWatch, WatchEvent, WatchKind};

/// Files above this size are not read from the start on open.
pub const SKIP_FILESIZE_THRESHOLD: u64 = 1_000_000;
/// Where reading starts for large files, in percent of the file length.
/// The line cut by the seek is dropped, so the backlog never starts with a
/// fragment.
const SKIP_PERCENT: u64 = 80;
pub const OPEN_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TailerState {
    Init,
    Closed,
    Opened,
}

#[derive(Debug)]
struct TailedFile {
    reader: BufReader<File>,
    /// bytes of a line whose terminator has not been written yet
    partial: Vec<u8>,
}

impl TailedFile {
    fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        let mut tailed = Self {
            reader: BufReader::new(file),
            partial: Vec::new(),
        };

        if size > SKIP_FILESIZE_THRESHOLD {
            let target = size / 100 * SKIP_PERCENT;
            debug!("Seeking to pos {target}");
            // start one byte early so a seek onto a line start keeps that line
            tailed.reader.seek(SeekFrom::Start(target - 1))?;
            tailed.reader.read_until(b'\n', &mut Vec::new())?;
        } else {
            debug!("Churning the entire file");
        }
        Ok(tailed)
    }

    /// Returns the lines completed since the last call, without terminators.
    fn read_appended(&mut self) -> io::Result<Vec<String>> {
        let length = self.reader.get_ref().metadata()?.len();
        if length < self.reader.stream_position()? {
            info!("File was truncated, reading from the start");
            self.reader.seek(SeekFrom::Start(0))?;
            self.partial.clear();
        }

        let mut lines = Vec::new();
        loop {
            let read = self.reader.read_until(b'\n', &mut self.partial)?;
            if read == 0 || !self.partial.ends_with(b"\n") {
                break;
            }
            let mut line = std::mem::take(&mut self.partial);
            line.pop();
            if line.ends_with(b"\r") {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        Ok(lines)
    }
}

/// The tailer's own view of the file. Only `Opened` holds a handle.
#[derive(Debug)]
enum Tail {
    Init,
    Closed,
    Opened(TailedFile),
}

impl Tail {
    fn state(&self) -> TailerState {
        match self {
            Tail::Init => TailerState::Init,
            Tail::Closed => TailerState::Closed,
            Tail::Opened(_) => TailerState::Opened,
        }
    }
}

enum Transition {
    Open,
    Close,
}

#[derive(Debug)]
struct Shared {
    state: TailerState,
    backlog: Backlog,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn append(shared: &Mutex<Shared>, lines: Vec<String>) {
    let mut shared = lock(shared);
    for line in lines {
        shared.backlog.push(line);
    }
}

/// Read access to what a [`LogTailer`] has collected.
#[derive(Debug, Clone)]
pub struct TailerHandle {
    shared: Arc<Mutex<Shared>>,
}

impl TailerHandle {
    pub fn lines(&self) -> Vec<String> {
        lock(&self.shared).backlog.lines()
    }

    pub fn state(&self) -> TailerState {
        lock(&self.shared).state
    }
}

/// Follows one file through creation, appends and rotation by watching its
/// parent directory.
#[derive(Debug)]
pub struct LogTailer {
    path: PathBuf,
    tail: Tail,
    shared: Arc<Mutex<Shared>>,
}

impl LogTailer {
    pub fn new(path: impl Into<PathBuf>, backlog: usize) -> Self {
        Self {
            path: path.into(),
            tail: Tail::Init,
            shared: Arc::new(Mutex::new(Shared {
                state: TailerState::Init,
                backlog: Backlog::new(backlog),
            })),
        }
    }

    pub fn handle(&self) -> TailerHandle {
        TailerHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn state(&self) -> TailerState {
        self.tail.state()
    }

    fn watched_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// Watches the parent directory and follows the file until the future is dropped.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let watch = DirectoryWatch::new(&self.watched_dir()).with_context(|| {
            format!("failed to watch the directory of {}", self.path.display())
        })?;
        self.start().await;

        loop {
            let events = watch
                .next_events()
                .await
                .with_context(|| format!("failed to read events of {}", watch.dir().display()))?;
            for event in &events {
                self.handle_event(event).await;
            }
        }
    }

    /// Opens the file right away if it exists, otherwise stays in `Init`.
    pub async fn start(&mut self) {
        if self.path.exists() {
            self.open().await;
        } else {
            warn!(
                "File {} does not exist, delaying opening",
                self.path.display()
            );
        }
    }

    pub async fn handle_event(&mut self, event: &WatchEvent) {
        if self.path.file_name() != Some(event.name.as_os_str()) {
            return;
        }

        let transition = match (event.kind, &mut self.tail) {
            (WatchKind::Modified, Tail::Opened(file)) => {
                match file.read_appended() {
                    Ok(lines) => append(&self.shared, lines),
                    Err(e) => warn!("Failed to read {}: {e}", self.path.display()),
                }
                None
            }
            (WatchKind::Deleted | WatchKind::MovedAway, Tail::Opened(_)) => {
                Some(Transition::Close)
            }
            (WatchKind::Created, Tail::Init | Tail::Closed) => Some(Transition::Open),
            (WatchKind::Modified | WatchKind::Deleted | WatchKind::MovedAway, Tail::Init)
            | (WatchKind::Modified | WatchKind::Deleted | WatchKind::MovedAway, Tail::Closed)
            | (WatchKind::Created, Tail::Opened(_)) => None,
        };

        match transition {
            Some(Transition::Close) => {
                info!("Closing file since it has been deleted or moved");
                self.set_tail(Tail::Closed);
            }
            Some(Transition::Open) => {
                if matches!(self.tail, Tail::Closed) {
                    info!("Reopening file");
                }
                self.open().await;
            }
            None => {}
        }
    }

    fn set_tail(&mut self, tail: Tail) {
        lock(&self.shared).state = tail.state();
        self.tail = tail;
    }

    /// Opens and seeds the backlog, retrying while the file is briefly absent.
    async fn open(&mut self) {
        let (file, lines) = loop {
            match TailedFile::open(&self.path)
                .and_then(|mut file| file.read_appended().map(|lines| (file, lines)))
            {
                Ok(opened) => break opened,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("{} vanished while opening, retrying", self.path.display());
                }
                Err(e) => warn!("Failed to open {}: {e}, retrying", self.path.display()),
            }
            Timer::after(OPEN_RETRY_DELAY).await;
        };

        append(&self.shared, lines);
        self.set_tail(Tail::Opened(file));
        info!("File {} opened successfully", self.path.display());
    }
}

#[cfg(test)]
mod tests {
    use std::fs::{self, OpenOptions};
    use std::io::Write;
    use std::time::Instant;

    use futures::executor::{block_on, LocalPool};
    use futures::task::LocalSpawnExt;
    use tempfile::TempDir;

    use super::*;

    fn append_to(path: &Path, text: &str) {
        let mut file = OpenOptions::new().create(true).append(true).open(path).unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    fn event(kind: WatchKind, name: &str) -> WatchEvent {
        WatchEvent::new(kind, name)
    }

    /// `count` lines of exactly `width` bytes each, newline included.
    fn numbered_lines(count: usize, width: usize) -> String {
        (0..count)
            .map(|n| format!("{:0>pad$}\n", n, pad = width - 1))
            .collect()
    }

    #[test]
    fn missing_file_waits_for_creation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("export.log");
        let mut tailer = LogTailer::new(&path, 10);
        let handle = tailer.handle();

        block_on(tailer.start());
        assert_eq!(handle.state(), TailerState::Init);

        block_on(tailer.handle_event(&event(WatchKind::Modified, "export.log")));
        assert_eq!(handle.state(), TailerState::Init);

        fs::write(&path, "a\nb\n").unwrap();
        block_on(tailer.handle_event(&event(WatchKind::Created, "export.log")));
        assert_eq!(handle.state(), TailerState::Opened);
        assert_eq!(handle.lines(), vec!["a", "b"]);
    }

    #[test]
    fn appended_complete_lines_are_read_on_modify() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("export.log");
        fs::write(&path, "one\r\ntw").unwrap();

        let mut tailer = LogTailer::new(&path, 10);
        let handle = tailer.handle();
        block_on(tailer.start());
        assert_eq!(handle.lines(), vec!["one"]);

        append_to(&path, "o\nthree\n");
        block_on(tailer.handle_event(&event(WatchKind::Modified, "export.log")));
        assert_eq!(handle.lines(), vec!["one", "two", "three"]);
    }

    #[test]
    fn events_for_other_files_are_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("export.log");
        fs::write(&path, "kept\n").unwrap();

        let mut tailer = LogTailer::new(&path, 10);
        block_on(tailer.start());
        block_on(tailer.handle_event(&event(WatchKind::Deleted, "other.log")));
        assert_eq!(tailer.state(), TailerState::Opened);
    }

    #[test]
    fn rotation_closes_and_recreation_reopens() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("export.log");
        fs::write(&path, "old 1\nold 2\n").unwrap();

        let mut tailer = LogTailer::new(&path, 3);
        let handle = tailer.handle();
        block_on(tailer.start());
        assert_eq!(handle.state(), TailerState::Opened);

        fs::rename(&path, dir.path().join("export.log.1")).unwrap();
        block_on(tailer.handle_event(&event(WatchKind::MovedAway, "export.log")));
        assert_eq!(handle.state(), TailerState::Closed);

        // writes to the rotated file are no longer followed
        append_to(&dir.path().join("export.log.1"), "late\n");
        block_on(tailer.handle_event(&event(WatchKind::Modified, "export.log")));
        assert_eq!(handle.lines(), vec!["old 1", "old 2"]);

        fs::write(&path, "new 1\n").unwrap();
        block_on(tailer.handle_event(&event(WatchKind::Created, "export.log")));
        assert_eq!(handle.state(), TailerState::Opened);
        assert_eq!(handle.lines(), vec!["old 1", "old 2", "new 1"]);

        append_to(&path, "new 2\n");
        block_on(tailer.handle_event(&event(WatchKind::Modified, "export.log")));
        assert_eq!(handle.lines(), vec!["old 2", "new 1", "new 2"]);

        fs::remove_file(&path).unwrap();
        block_on(tailer.handle_event(&event(WatchKind::Deleted, "export.log")));
        assert_eq!(handle.state(), TailerState::Closed);
    }

    #[test]
    fn recreation_after_delete_waits_for_the_file_to_appear() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("export.log");
        fs::write(&path, "old\n").unwrap();

        let mut tailer = LogTailer::new(&path, 10);
        let handle = tailer.handle();
        block_on(tailer.start());

        fs::remove_file(&path).unwrap();
        block_on(tailer.handle_event(&event(WatchKind::Deleted, "export.log")));
        assert_eq!(handle.state(), TailerState::Closed);

        // the creation event arrives before the file can be opened
        let writer = {
            let path = path.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(700));
                fs::write(&path, "new\n").unwrap();
            })
        };
        let started = Instant::now();
        block_on(tailer.handle_event(&event(WatchKind::Created, "export.log")));
        writer.join().unwrap();

        assert!(started.elapsed() >= OPEN_RETRY_DELAY);
        assert_eq!(handle.state(), TailerState::Opened);
        assert_eq!(handle.lines(), vec!["old", "new"]);
    }

    #[test]
    fn large_file_is_read_from_eighty_percent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("export.log");
        // 10_001 lines of 100 bytes, just above the threshold
        fs::write(&path, numbered_lines(10_001, 100)).unwrap();

        let mut tailer = LogTailer::new(&path, 100_000);
        let handle = tailer.handle();
        block_on(tailer.start());

        // reading starts inside line 8000, whose remainder is dropped
        let lines = handle.lines();
        assert_eq!(lines[0].len(), 99);
        assert_eq!(lines[0].parse::<usize>().unwrap(), 8_001);
        assert_eq!(lines.last().unwrap().parse::<usize>().unwrap(), 10_000);
        assert_eq!(lines.len(), 2_000);
    }

    #[test]
    fn file_at_threshold_is_read_from_start() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("export.log");
        fs::write(&path, numbered_lines(10_000, 100)).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), SKIP_FILESIZE_THRESHOLD);

        let mut tailer = LogTailer::new(&path, 100_000);
        let handle = tailer.handle();
        block_on(tailer.start());

        let lines = handle.lines();
        assert_eq!(lines.len(), 10_000);
        assert_eq!(lines[0].parse::<usize>().unwrap(), 0);
    }

    #[test]
    fn truncated_file_is_read_again_from_start() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("export.log");
        fs::write(&path, "first run line\n").unwrap();

        let mut tailer = LogTailer::new(&path, 10);
        let handle = tailer.handle();
        block_on(tailer.start());

        fs::write(&path, "x\n").unwrap();
        block_on(tailer.handle_event(&event(WatchKind::Modified, "export.log")));
        assert_eq!(handle.lines(), vec!["first run line", "x"]);
    }

    #[test]
    fn run_follows_the_file_through_rotation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("export.log");
        let tailer = LogTailer::new(&path, 10);
        let handle = tailer.handle();

        let mut pool = LocalPool::new();
        let _running = pool
            .spawner()
            .spawn_local_with_handle(tailer.run())
            .unwrap();

        let mut wait_for = |what: &str, done: &dyn Fn() -> bool| {
            let deadline = Instant::now() + Duration::from_secs(10);
            pool.run_until(async {
                while !done() {
                    assert!(Instant::now() < deadline, "timed out waiting for {what}");
                    Timer::after(Duration::from_millis(10)).await;
                }
            });
        };

        append_to(&path, "first\n");
        wait_for("first line", &|| handle.lines() == vec!["first"]);
        assert_eq!(handle.state(), TailerState::Opened);

        append_to(&path, "second\n");
        wait_for("second line", &|| handle.lines().len() == 2);

        fs::rename(&path, dir.path().join("export.log.1")).unwrap();
        wait_for("close", &|| handle.state() == TailerState::Closed);

        append_to(&path, "third\n");
        wait_for("reopen", &|| {
            handle.state() == TailerState::Opened && handle.lines().len() == 3
        });
        assert_eq!(handle.lines(), vec!["first", "second", "third"]);
    }
}
