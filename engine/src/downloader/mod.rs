//! Downloader
//!
//! Resumable, checksum-verified package downloads.
//!
//! A download is a [`DownloadTask`] driven to completion by
//! [`DownloadManager::start`]. Each attempt:
//! 1. Looks for a partial file at the destination and, when resuming is
//!    enabled, asks for the remaining bytes with a range request
//! 2. Streams chunks to disk, honouring pause and cancel between chunks and
//!    broadcasting throttled [`DownloadProgress`] updates
//! 3. Retries transport failures with a fixed delay, keeping the bytes
//!    already written
//!
//! Once the stream completes, the file's checksum must match the expected
//! digest. When signature verification is enabled and a
//! [`SecurityValidator`] is attached, the package is validated before the
//! task is marked complete.

pub mod fetch;

use crate::config::DownloadConfig;
use crate::security::SecurityValidator;
use crate::signature::digest;
use futures::StreamExt;
use fetch::HttpFetcher;
use sdk::errors::EngineError;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;

/// Download lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Paused,
    Verifying,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadStatus {
    pub fn is_active(self) -> bool {
        matches!(
            self,
            DownloadStatus::Pending
                | DownloadStatus::Downloading
                | DownloadStatus::Paused
                | DownloadStatus::Verifying
        )
    }
}

/// What to download and how to check it
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub id: String,
    pub url: String,
    /// `"sha256:<hex>"`, `"blake3:<hex>"` or bare SHA-256 hex
    pub checksum: String,
    pub destination: PathBuf,
}

/// Snapshot of a download
#[derive(Debug, Clone, Serialize)]
pub struct DownloadTask {
    pub id: String,
    pub url: String,
    pub destination: PathBuf,
    pub status: DownloadStatus,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub retry_count: u32,
    pub checksum: String,
    pub error: Option<String>,
}

/// Progress update broadcast while a download runs
#[derive(Debug, Clone, Serialize)]
pub struct DownloadProgress {
    pub task_id: String,
    pub downloaded: u64,
    pub total: Option<u64>,
    pub speed_bps: f64,
    pub eta_secs: Option<f64>,
}

#[derive(Default)]
struct TaskControl {
    paused: AtomicBool,
    cancelled: AtomicBool,
}

struct TaskEntry {
    task: DownloadTask,
    control: Arc<TaskControl>,
}

/// Owns every download task and enforces the concurrency cap
pub struct DownloadManager {
    config: DownloadConfig,
    fetcher: Arc<dyn HttpFetcher>,
    validator: Option<Arc<SecurityValidator>>,
    tasks: Mutex<HashMap<String, TaskEntry>>,
    progress_tx: broadcast::Sender<DownloadProgress>,
}

impl DownloadManager {
    pub fn new(config: DownloadConfig, fetcher: Arc<dyn HttpFetcher>) -> Self {
        let (progress_tx, _) = broadcast::channel(256);
        Self {
            config,
            fetcher,
            validator: None,
            tasks: Mutex::new(HashMap::new()),
            progress_tx,
        }
    }

    /// Attach the validator used for post-download package checks
    pub fn with_validator(mut self, validator: Arc<SecurityValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<DownloadProgress> {
        self.progress_tx.subscribe()
    }

    pub fn task(&self, id: &str) -> Option<DownloadTask> {
        self.lock_tasks().get(id).map(|e| e.task.clone())
    }

    pub fn tasks(&self) -> Vec<DownloadTask> {
        self.lock_tasks().values().map(|e| e.task.clone()).collect()
    }

    pub fn active_count(&self) -> usize {
        self.lock_tasks()
            .values()
            .filter(|e| e.task.status.is_active())
            .count()
    }

    /// Pause an active download; the transfer stops at the next chunk
    pub fn pause(&self, id: &str) -> Result<(), EngineError> {
        let mut tasks = self.lock_tasks();
        let entry = tasks
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("download {}", id)))?;
        if !matches!(entry.task.status, DownloadStatus::Pending | DownloadStatus::Downloading) {
            return Err(EngineError::Storage(format!(
                "Download {} cannot be paused in status {:?}",
                id, entry.task.status
            )));
        }
        entry.control.paused.store(true, Ordering::SeqCst);
        entry.task.status = DownloadStatus::Paused;
        tracing::info!(task_id = %id, "Download paused");
        Ok(())
    }

    pub fn resume(&self, id: &str) -> Result<(), EngineError> {
        let mut tasks = self.lock_tasks();
        let entry = tasks
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("download {}", id)))?;
        if entry.task.status != DownloadStatus::Paused {
            return Err(EngineError::Storage(format!(
                "Download {} is not paused",
                id
            )));
        }
        entry.control.paused.store(false, Ordering::SeqCst);
        entry.task.status = DownloadStatus::Downloading;
        tracing::info!(task_id = %id, "Download resumed");
        Ok(())
    }

    /// Cancel an active download; its partial file is deleted
    pub fn cancel(&self, id: &str) -> Result<(), EngineError> {
        let tasks = self.lock_tasks();
        let entry = tasks
            .get(id)
            .ok_or_else(|| EngineError::NotFound(format!("download {}", id)))?;
        if !entry.task.status.is_active() {
            return Err(EngineError::Storage(format!(
                "Download {} is not active",
                id
            )));
        }
        entry.control.cancelled.store(true, Ordering::SeqCst);
        tracing::info!(task_id = %id, "Download cancel requested");
        Ok(())
    }

    /// Run a download to completion
    ///
    /// # Errors
    ///
    /// - `DuplicateDownload` if a task with this id is still active
    /// - `DownloadLimitReached` if the concurrency cap is reached
    /// - `DownloadCancelled` if cancelled while running
    /// - `DownloadFailed` once every retry is used up
    /// - `ChecksumMismatch` if the finished file does not match (never retried)
    /// - `SecurityBlocked` if post-download validation denies the package
    pub async fn start(&self, request: DownloadRequest) -> Result<DownloadTask, EngineError> {
        let control = self.register(&request)?;
        tracing::info!(task_id = %request.id, url = %request.url, "Download started");

        let mut retries = 0u32;
        loop {
            match self.transfer(&request, &control).await {
                Ok(()) => break,
                Err(EngineError::DownloadCancelled(_)) => return Err(self.finish_cancelled(&request).await),
                Err(e) => {
                    if retries >= self.config.max_retries {
                        let err = EngineError::DownloadFailed {
                            task_id: request.id.clone(),
                            retries,
                            reason: e.to_string(),
                        };
                        self.finish_failed(&request.id, &err);
                        return Err(err);
                    }
                    retries += 1;
                    tracing::warn!(
                        task_id = %request.id,
                        attempt = retries,
                        "Download attempt failed, retrying: {}",
                        e
                    );
                    self.update(&request.id, |t| t.retry_count = retries);
                    tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
                    if control.cancelled.load(Ordering::SeqCst) {
                        return Err(self.finish_cancelled(&request).await);
                    }
                }
            }
        }

        self.update(&request.id, |t| t.status = DownloadStatus::Verifying);
        if let Err(e) = self.verify(&request).await {
            let _ = tokio::fs::remove_file(&request.destination).await;
            self.finish_failed(&request.id, &e);
            return Err(e);
        }

        self.update(&request.id, |t| {
            t.status = DownloadStatus::Completed;
            t.error = None;
        });
        tracing::info!(task_id = %request.id, "Download completed");

        self.task(&request.id)
            .ok_or_else(|| EngineError::NotFound(format!("download {}", request.id)))
    }

    fn register(&self, request: &DownloadRequest) -> Result<Arc<TaskControl>, EngineError> {
        let mut tasks = self.lock_tasks();

        if tasks.get(&request.id).is_some_and(|e| e.task.status.is_active()) {
            return Err(EngineError::DuplicateDownload(request.id.clone()));
        }

        let active = tasks.values().filter(|e| e.task.status.is_active()).count();
        if active >= self.config.max_concurrent {
            tracing::warn!(limit = self.config.max_concurrent, "Download limit reached");
            return Err(EngineError::DownloadLimitReached {
                limit: self.config.max_concurrent,
            });
        }

        let control = Arc::new(TaskControl::default());
        tasks.insert(
            request.id.clone(),
            TaskEntry {
                task: DownloadTask {
                    id: request.id.clone(),
                    url: request.url.clone(),
                    destination: request.destination.clone(),
                    status: DownloadStatus::Pending,
                    downloaded_bytes: 0,
                    total_bytes: None,
                    retry_count: 0,
                    checksum: request.checksum.clone(),
                    error: None,
                },
                control: control.clone(),
            },
        );
        Ok(control)
    }

    /// One attempt: stream from the current offset to the end
    async fn transfer(&self, request: &DownloadRequest, control: &TaskControl) -> Result<(), EngineError> {
        let mut offset = if self.config.resume {
            partial_len(&request.destination).await
        } else {
            0
        };

        let response = self
            .fetcher
            .fetch(&request.url, (offset > 0).then_some(offset))
            .await?;

        let append = match response.status {
            206 if offset > 0 => true,
            416 if offset > 0 => {
                // Nothing left to fetch; the checksum decides whether the file is whole
                tracing::debug!(task_id = %request.id, offset, "Range not satisfiable, treating as complete");
                self.update(&request.id, |t| t.downloaded_bytes = offset);
                return Ok(());
            }
            200..=299 => {
                if offset > 0 {
                    tracing::warn!(task_id = %request.id, offset, "Server ignored range request, restarting");
                    offset = 0;
                }
                false
            }
            status => {
                return Err(EngineError::Network(format!(
                    "Unexpected HTTP status {} from {}",
                    status, request.url
                )))
            }
        };

        let total = response.content_length.map(|len| offset + len);
        self.update(&request.id, |t| {
            t.downloaded_bytes = offset;
            t.total_bytes = total;
            if t.status != DownloadStatus::Paused {
                t.status = DownloadStatus::Downloading;
            }
        });

        if let Some(parent) = request.destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&request.destination)
            .await?;

        let mut body = response.body;
        let mut downloaded = offset;
        let started = Instant::now();
        let interval = Duration::from_millis(self.config.progress_interval_ms);
        let mut last_emit = Instant::now();

        while let Some(chunk) = body.next().await {
            self.wait_while_paused(&request.id, control).await?;
            let chunk = chunk?;

            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            tracing::debug!(task_id = %request.id, bytes = chunk.len(), downloaded, "Chunk written");

            self.update(&request.id, |t| t.downloaded_bytes = downloaded);
            if last_emit.elapsed() >= interval {
                self.emit_progress(&request.id, downloaded - offset, downloaded, total, started);
                last_emit = Instant::now();
            }
        }
        file.flush().await?;

        if let Some(total) = total {
            if downloaded != total {
                return Err(EngineError::Network(format!(
                    "Stream ended at {} of {} bytes",
                    downloaded, total
                )));
            }
        }

        self.emit_progress(&request.id, downloaded - offset, downloaded, total, started);
        Ok(())
    }

    async fn wait_while_paused(&self, id: &str, control: &TaskControl) -> Result<(), EngineError> {
        loop {
            if control.cancelled.load(Ordering::SeqCst) {
                return Err(EngineError::DownloadCancelled(id.to_string()));
            }
            if !control.paused.load(Ordering::SeqCst) {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(self.config.pause_poll_ms)).await;
        }
    }

    async fn verify(&self, request: &DownloadRequest) -> Result<(), EngineError> {
        let bytes = tokio::fs::read(&request.destination).await?;

        if let Err(e) = digest::verify_checksum(&bytes, &request.checksum) {
            tracing::error!(task_id = %request.id, "Checksum verification failed: {}", e);
            return Err(e);
        }
        tracing::info!(task_id = %request.id, "Checksum verified");

        if self.config.verify_signature {
            if let Some(validator) = &self.validator {
                validator.validate(&bytes, Some(&request.url))?.ensure_allowed()?;
            }
        }

        Ok(())
    }

    fn emit_progress(&self, id: &str, session_bytes: u64, downloaded: u64, total: Option<u64>, started: Instant) {
        let elapsed = started.elapsed().as_secs_f64();
        let speed_bps = if elapsed > 0.0 {
            session_bytes as f64 / elapsed
        } else {
            0.0
        };
        let eta_secs = match total {
            Some(total) if speed_bps > 0.0 => Some(total.saturating_sub(downloaded) as f64 / speed_bps),
            _ => None,
        };

        // No receivers is fine
        let _ = self.progress_tx.send(DownloadProgress {
            task_id: id.to_string(),
            downloaded,
            total,
            speed_bps,
            eta_secs,
        });
    }

    async fn finish_cancelled(&self, request: &DownloadRequest) -> EngineError {
        if let Err(e) = tokio::fs::remove_file(&request.destination).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(task_id = %request.id, "Failed to delete partial file: {}", e);
            }
        }
        self.update(&request.id, |t| t.status = DownloadStatus::Cancelled);
        tracing::info!(task_id = %request.id, "Download cancelled");
        EngineError::DownloadCancelled(request.id.clone())
    }

    fn finish_failed(&self, id: &str, err: &EngineError) {
        tracing::error!(task_id = %id, "Download failed: {}", err);
        self.update(id, |t| {
            t.status = DownloadStatus::Failed;
            t.error = Some(err.to_string());
        });
    }

    fn update(&self, id: &str, f: impl FnOnce(&mut DownloadTask)) {
        if let Some(entry) = self.lock_tasks().get_mut(id) {
            f(&mut entry.task);
        }
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, HashMap<String, TaskEntry>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn partial_len(path: &Path) -> u64 {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.len())
        .unwrap_or(0)
}
