//! Serializing archive writer.
//!
//! The archive backend is moved into one blocking owner task. Every
//! structural mutation (metadata, group and dataset creation, flush, close)
//! reaches it as a request on a bounded queue and is answered over a oneshot
//! channel, so the archive never sees two writers at once.
//!
//! [`WriteGroup`] is the caller side used during a sweep: each captured matrix
//! is dispatched as a short-lived task that submits it and records the
//! outcome. The sweep keeps moving while writes complete in any order, and
//! [`WriteGroup::drain`] is the join barrier before the archive is closed.

use crate::error::{AppResult, ScanError};
use crate::storage::archive::{ArchiveBackend, EntryKey, ScanMetadata, WaveformMatrix};
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{Id, JoinSet};
use tracing::{debug, info, warn};

enum Request {
    Metadata {
        metadata: ScanMetadata,
        reply: oneshot::Sender<AppResult<()>>,
    },
    Entry {
        key: EntryKey,
        matrix: WaveformMatrix,
        reply: oneshot::Sender<AppResult<()>>,
    },
    Close {
        reply: oneshot::Sender<AppResult<()>>,
    },
}

/// Spawns the archive owner task.
pub struct ArchiveWriter;

impl ArchiveWriter {
    /// Move `backend` into a dedicated blocking task and return a handle to it.
    ///
    /// At most `capacity` requests queue before submitters wait.
    pub fn spawn<B: ArchiveBackend>(backend: B, capacity: usize) -> ArchiveHandle {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::task::spawn_blocking(move || run_owner(backend, rx));
        ArchiveHandle { tx }
    }
}

fn run_owner<B: ArchiveBackend>(mut backend: B, mut rx: mpsc::Receiver<Request>) {
    let mut written = 0usize;
    let mut close_reply = None;

    while let Some(request) = rx.blocking_recv() {
        match request {
            Request::Metadata { metadata, reply } => {
                let result = backend.write_metadata(&metadata).and_then(|()| backend.flush());
                let _ = reply.send(result);
            }
            Request::Entry { key, matrix, reply } => {
                let result = write_entry(&mut backend, key, &matrix);
                if result.is_ok() {
                    written += 1;
                }
                let _ = reply.send(result);
            }
            Request::Close { reply } => {
                close_reply = Some(reply);
                break;
            }
        }
    }

    // Requests still queued are rejected; their submitters see the closed channel
    rx.close();
    let result = backend.flush();
    drop(backend);
    debug!(written, "Archive owner task stopped");

    if let Some(reply) = close_reply {
        let _ = reply.send(result);
    }
}

fn write_entry<B: ArchiveBackend>(
    backend: &mut B,
    key: EntryKey,
    matrix: &WaveformMatrix,
) -> AppResult<()> {
    if backend
        .contains(key)
        .map_err(|e| ScanError::write_failed(key, e))?
    {
        return Err(ScanError::DuplicateEntry { key });
    }

    backend
        .write_entry(key, matrix)
        .and_then(|()| backend.flush())
        .map_err(|e| match e {
            ScanError::DuplicateEntry { .. } | ScanError::ArchivalWriteFailed { .. } => e,
            other => ScanError::write_failed(key, other),
        })
}

/// Cloneable submitter for the archive owner task.
#[derive(Clone)]
pub struct ArchiveHandle {
    tx: mpsc::Sender<Request>,
}

impl ArchiveHandle {
    async fn request(
        &self,
        build: impl FnOnce(oneshot::Sender<AppResult<()>>) -> Request,
    ) -> Option<AppResult<()>> {
        let (reply, response) = oneshot::channel();
        self.tx.send(build(reply)).await.ok()?;
        response.await.ok()
    }

    /// Write scan metadata as root attributes.
    pub async fn write_metadata(&self, metadata: ScanMetadata) -> AppResult<()> {
        self.request(|reply| Request::Metadata { metadata, reply })
            .await
            .unwrap_or_else(|| Err(ScanError::Archive("archive writer is closed".to_string())))
    }

    /// Archive `matrix` as the entry for `key` and wait until it is written.
    ///
    /// Fails with [`ScanError::DuplicateEntry`] if the entry already exists,
    /// leaving it unchanged.
    pub async fn archive(&self, matrix: WaveformMatrix, key: EntryKey) -> AppResult<()> {
        self.request(|reply| Request::Entry { key, matrix, reply })
            .await
            .unwrap_or_else(|| Err(ScanError::write_failed(key, "archive writer is closed")))
    }

    /// Close the archive once every request queued before this call is done.
    pub async fn close(&self) -> AppResult<()> {
        match self.request(|reply| Request::Close { reply }).await {
            Some(result) => {
                info!("Archive closed");
                result
            }
            None => Err(ScanError::Archive("archive writer already closed".to_string())),
        }
    }

    /// Whether the owner task has stopped accepting requests.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Outcome of [`WriteGroup::drain`].
#[derive(Debug, Default)]
pub struct DrainReport {
    /// Entries written, ascending
    pub archived: Vec<EntryKey>,
    /// Entries that were dispatched but not written, ascending
    pub failed: Vec<(EntryKey, ScanError)>,
}

impl DrainReport {
    /// True when every dispatched write succeeded.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Keys of the failed writes.
    pub fn failed_keys(&self) -> Vec<EntryKey> {
        self.failed.iter().map(|(key, _)| *key).collect()
    }
}

/// Fire-and-collect group of archive writes.
pub struct WriteGroup {
    handle: ArchiveHandle,
    tasks: JoinSet<(EntryKey, AppResult<()>)>,
    keys: HashMap<Id, EntryKey>,
}

impl WriteGroup {
    /// Empty group submitting through `handle`.
    pub fn new(handle: ArchiveHandle) -> Self {
        Self {
            handle,
            tasks: JoinSet::new(),
            keys: HashMap::new(),
        }
    }

    /// Start archiving `matrix` under `key` without waiting for it.
    pub fn dispatch(&mut self, matrix: WaveformMatrix, key: EntryKey) {
        let handle = self.handle.clone();
        let task = self.tasks.spawn(async move {
            let result = handle.archive(matrix, key).await;
            (key, result)
        });
        self.keys.insert(task.id(), key);
        debug!(%key, in_flight = self.tasks.len(), "Dispatched archive write");
    }

    /// Writes dispatched but not yet joined.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for every dispatched write and report which ones landed.
    pub async fn drain(&mut self) -> DrainReport {
        let mut report = DrainReport::default();

        while let Some(joined) = self.tasks.join_next_with_id().await {
            match joined {
                Ok((id, (key, Ok(())))) => {
                    self.keys.remove(&id);
                    report.archived.push(key);
                }
                Ok((id, (key, Err(e)))) => {
                    self.keys.remove(&id);
                    warn!(%key, error = %e, "Archive write failed");
                    report.failed.push((key, e));
                }
                Err(join_error) => {
                    let Some(key) = self.keys.remove(&join_error.id()) else {
                        warn!(error = %join_error, "Unknown archive task failed");
                        continue;
                    };
                    warn!(%key, error = %join_error, "Archive task did not complete");
                    report.failed.push((key, ScanError::write_failed(key, join_error)));
                }
            }
        }

        report.archived.sort();
        report.failed.sort_by_key(|(key, _)| *key);
        report
    }
}
