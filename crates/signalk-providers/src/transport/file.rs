//! File and folder replay.
//!
//! The file is read start to end as fast as the pipeline accepts it, which
//! leaves pacing to the throttles further down. With `keep_running` the
//! replay starts over at the end; otherwise the stage ends there.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::wait_or_end;
use crate::app::AppHandle;
use crate::record::Record;
use crate::stage::Stage;

const READ_CHUNK: usize = 16 * 1024;

/// Pause before replaying again when a pass produced nothing.
const EMPTY_PASS_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
enum Source {
    File(PathBuf),
    Folder(PathBuf),
}

enum Pass {
    /// Replayed this many bytes.
    Done(usize),
    /// Input or output closed.
    Ended,
    Failed(String),
}

pub struct FileTransport {
    provider_id: String,
    source: Source,
    keep_running: bool,
    separator: String,
    app: AppHandle,
}

impl FileTransport {
    pub fn file(provider_id: &str, path: &Path, keep_running: bool, app: AppHandle) -> Self {
        Self::new(provider_id, Source::File(path.to_path_buf()), keep_running, app)
    }

    /// Replays every regular file in `folder`, in name order.
    pub fn folder(provider_id: &str, folder: &Path, keep_running: bool, app: AppHandle) -> Self {
        Self::new(provider_id, Source::Folder(folder.to_path_buf()), keep_running, app)
    }

    fn new(provider_id: &str, source: Source, keep_running: bool, app: AppHandle) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            source,
            keep_running,
            separator: "\n".to_string(),
            app,
        }
    }

    /// Separator written between two files, and between passes, so the last
    /// line of one never runs into the first of the next.
    pub fn with_separator(mut self, separator: &str) -> Self {
        if !separator.is_empty() {
            self.separator = separator.to_string();
        }
        self
    }

    async fn files(&self) -> std::io::Result<Vec<PathBuf>> {
        match &self.source {
            Source::File(path) => Ok(vec![path.clone()]),
            Source::Folder(folder) => {
                let mut entries = tokio::fs::read_dir(folder).await?;
                let mut files = Vec::new();
                while let Some(entry) = entries.next_entry().await? {
                    if entry.file_type().await?.is_file() {
                        files.push(entry.path());
                    }
                }
                files.sort();
                Ok(files)
            }
        }
    }

    async fn replay_file(
        &self,
        path: &Path,
        input: &mut mpsc::Receiver<Record>,
        output: &mpsc::Sender<Record>,
    ) -> Pass {
        let mut file = match tokio::fs::File::open(path).await {
            Ok(file) => file,
            Err(e) => return Pass::Failed(format!("Cannot open {}: {}", path.display(), e)),
        };
        debug!("{}: replaying {}", self.provider_id, path.display());
        let mut buf = vec![0u8; READ_CHUNK];
        let mut total = 0;
        loop {
            tokio::select! {
                record = input.recv() => match record {
                    Some(_) => debug!("{}: file transports do not write", self.provider_id),
                    None => return Pass::Ended,
                },
                read = file.read(&mut buf) => match read {
                    Ok(0) => return Pass::Done(total),
                    Ok(n) => {
                        total += n;
                        if output.send(Record::Bytes(buf[..n].to_vec())).await.is_err() {
                            return Pass::Ended;
                        }
                    }
                    Err(e) => return Pass::Failed(format!("Cannot read {}: {}", path.display(), e)),
                },
            }
        }
    }

    async fn replay(&self, input: &mut mpsc::Receiver<Record>, output: &mpsc::Sender<Record>) -> Pass {
        let files = match self.files().await {
            Ok(files) => files,
            Err(e) => return Pass::Failed(e.to_string()),
        };
        let mut total = 0;
        for (i, path) in files.iter().enumerate() {
            if i > 0 && total > 0 {
                let separator = Record::Bytes(self.separator.as_bytes().to_vec());
                if output.send(separator).await.is_err() {
                    return Pass::Ended;
                }
            }
            match self.replay_file(path, input, output).await {
                Pass::Done(n) => total += n,
                other => return other,
            }
        }
        Pass::Done(total)
    }

    async fn run_inner(self, mut input: mpsc::Receiver<Record>, output: mpsc::Sender<Record>) {
        let id = self.provider_id.as_str();
        let name = match &self.source {
            Source::File(path) | Source::Folder(path) => path.display().to_string(),
        };
        info!("{}: replaying {}", id, name);
        self.app.status(id, format!("Replaying {}", name));
        loop {
            match self.replay(&mut input, &output).await {
                Pass::Ended => return,
                Pass::Failed(reason) => {
                    warn!("{}: {}", id, reason);
                    self.app.error(id, reason);
                    return;
                }
                Pass::Done(_) if !self.keep_running => {
                    info!("{}: finished replaying {}", id, name);
                    self.app.status(id, format!("Finished {}", name));
                    return;
                }
                Pass::Done(n) => {
                    let separator = Record::Bytes(self.separator.as_bytes().to_vec());
                    if n > 0 && output.send(separator).await.is_err() {
                        return;
                    }
                    if n == 0 && !wait_or_end(&mut input, EMPTY_PASS_DELAY).await {
                        return;
                    }
                }
            }
        }
    }
}

impl Stage for FileTransport {
    fn name(&self) -> &str {
        "file"
    }

    fn run(
        self: Box<Self>,
        input: mpsc::Receiver<Record>,
        output: mpsc::Sender<Record>,
    ) -> BoxFuture<'static, ()> {
        Box::pin(self.run_inner(input, output))
    }
}
