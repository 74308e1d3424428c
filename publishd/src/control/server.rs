// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_io::Async;
use futures::stream::FuturesUnordered;
use futures::{AsyncBufReadExt, AsyncWriteExt, FutureExt, StreamExt};
use log::{debug, info, warn};

use super::handle_request::handle_line;
use super::request::Request;
use crate::job_engine::publisher::PublisherHandle;
use crate::tailer::observer::TailerHandle;

/// Unix socket speaking newline-delimited JSON. Dropping the server cancels
/// all open connections and removes the socket file.
#[derive(Debug)]
pub struct ControlServer {
    listener: Async<UnixListener>,
    path: PathBuf,
    publisher: PublisherHandle,
    tailer: TailerHandle,
}

impl ControlServer {
    pub fn bind(
        path: &Path,
        publisher: PublisherHandle,
        tailer: TailerHandle,
    ) -> anyhow::Result<Self> {
        match std::fs::remove_file(path) {
            Ok(()) => debug!("Removed stale socket {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to remove stale socket {}", path.display()))
            }
        }
        let listener = Async::<UnixListener>::bind(path)
            .with_context(|| format!("failed to bind control socket {}", path.display()))?;
        info!("Control socket listening on {}", path.display());
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            publisher,
            tailer,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accepts connections and serves them concurrently until dropped.
    pub async fn run(self) -> anyhow::Result<()> {
        let mut connections = FuturesUnordered::new();
        loop {
            let accept = self.listener.accept().fuse();
            futures::pin_mut!(accept);
            futures::select! {
                accepted = accept => {
                    let (stream, _) = accepted.context("failed to accept control connection")?;
                    debug!("Accepted control connection");
                    connections.push(serve_connection(
                        stream,
                        self.publisher.clone(),
                        self.tailer.clone(),
                    ));
                }
                () = connections.select_next_some() => {}
            }
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!("Could not remove socket {}: {e}", self.path.display());
        }
    }
}

async fn serve_connection(
    stream: Async<UnixStream>,
    publisher: PublisherHandle,
    tailer: TailerHandle,
) {
    if let Err(e) = answer_requests(&stream, &publisher, &tailer).await {
        warn!("Control connection failed: {e}");
    }
    debug!("Control connection closed");
}

async fn answer_requests(
    stream: &Async<UnixStream>,
    publisher: &PublisherHandle,
    tailer: &TailerHandle,
) -> io::Result<()> {
    let mut lines = futures::io::BufReader::new(stream).lines();
    let mut writer = stream;
    while let Some(line) = lines.next().await {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response = handle_line(&line, publisher, tailer);
        let mut encoded = serde_json::to_string(&response)?;
        encoded.push('\n');
        writer.write_all(encoded.as_bytes()).await?;
    }
    Ok(())
}

/// Sends one request to a running daemon and returns its response line.
pub fn send_request(socket: &Path, request: &str) -> anyhow::Result<String> {
    let request: Request = serde_json::from_str(request).context("invalid request")?;
    let mut stream = UnixStream::connect(socket)
        .with_context(|| format!("failed to connect to {}", socket.display()))?;

    let mut encoded = serde_json::to_string(&request)?;
    encoded.push('\n');
    stream.write_all(encoded.as_bytes())?;
    stream.shutdown(std::net::Shutdown::Write)?;

    let mut response = String::new();
    BufReader::new(stream)
        .read_line(&mut response)
        .context("failed to read the response")?;
    if response.is_empty() {
        anyhow::bail!("connection closed without a response");
    }
    Ok(response.trim_end().to_string())
}
