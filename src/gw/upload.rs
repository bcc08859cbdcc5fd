//! The concurrent upload pipeline.
//!
//! For a batch of sync items, ensures every distinct content key is
//! present in the blob store exactly once. A fixed pool of workers
//! drives presence probes and uploads; a single reader consumes results
//! and invokes caller callbacks, so callbacks never run concurrently.

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::client::Client;
use super::GwError;
use crate::walk::SyncItem;

/// The outcome of processing one sync item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    /// Uploaded successfully during this call.
    Uploaded,
    /// Skipped because the blob was already present.
    Present,
    /// Skipped because another item in the same batch carries the key.
    Duplicate,
    /// Tried to upload and failed.
    Failed,
}

struct UploadResult {
    state: UploadState,
    item: SyncItem,
    error: Option<GwError>,
}

async fn upload_worker(
    client: Client,
    token: CancellationToken,
    jobs: Arc<Mutex<mpsc::Receiver<SyncItem>>>,
    results: mpsc::Sender<UploadResult>,
    claimed: Arc<DashMap<String, ()>>,
    worker_id: usize,
) {
    loop {
        let item = {
            let mut rx = jobs.lock().await;
            tokio::select! {
                _ = token.cancelled() => return,
                item = rx.recv() => item,
            }
        };
        let Some(item) = item else { return };

        // Skip the item if its upload has already begun on another
        // worker; the claimant reports the outcome for this key.
        if claimed.insert(item.key.clone(), ()).is_some() {
            debug!(key = %item.key, "Item is already being uploaded");
            continue;
        }

        let have = match client.have_blob(&token, &item).await {
            Ok(have) => have,
            Err(err) => {
                let error = GwError::Presence {
                    key: item.key.clone(),
                    source: Box::new(err),
                };
                let _ = results
                    .send(UploadResult {
                        state: UploadState::Failed,
                        item,
                        error: Some(error),
                    })
                    .await;
                return;
            }
        };

        if have {
            let _ = results
                .send(UploadResult {
                    state: UploadState::Present,
                    item,
                    error: None,
                })
                .await;
            continue;
        }

        match client.upload_blob(&token, &item).await {
            Ok(()) => {
                debug!(worker = worker_id, key = %item.key, "upload thread");
                let _ = results
                    .send(UploadResult {
                        state: UploadState::Uploaded,
                        item,
                        error: None,
                    })
                    .await;
            }
            Err(err) => {
                let error = GwError::Upload {
                    path: item.src_path.clone(),
                    source: Box::new(err),
                };
                let _ = results
                    .send(UploadResult {
                        state: UploadState::Failed,
                        item,
                        error: Some(error),
                    })
                    .await;
                return;
            }
        }
    }
}

impl Client {
    /// Processes every given item and ensures its content is present in
    /// the target environment.
    ///
    /// Per item, exactly one of the callbacks is invoked: `on_uploaded`
    /// if the content was uploaded during this call, `on_present` if it
    /// was already present, `on_duplicate` if another item in this call
    /// carries the same key. Items representing unfollowed symlinks are
    /// skipped entirely. All callbacks run from a single place and may
    /// return an error to abort the batch.
    pub async fn ensure_uploaded<F1, F2, F3>(
        &self,
        token: &CancellationToken,
        items: Vec<SyncItem>,
        mut on_uploaded: F1,
        mut on_present: F2,
        mut on_duplicate: F3,
    ) -> Result<(), GwError>
    where
        F1: FnMut(&SyncItem) -> Result<(), GwError>,
        F2: FnMut(&SyncItem) -> Result<(), GwError>,
        F3: FnMut(&SyncItem) -> Result<(), GwError>,
    {
        let capacity = items.len().max(1);
        let (jobs_tx, jobs_rx) = mpsc::channel::<SyncItem>(capacity);
        let (results_tx, mut results_rx) = mpsc::channel::<UploadResult>(capacity);

        // A child token lets a failure cancel all in-flight uploads at
        // once without touching the caller's context.
        let upload_token = token.child_token();

        let claimed: Arc<DashMap<String, ()>> = Arc::new(DashMap::new());
        let jobs_rx = Arc::new(Mutex::new(jobs_rx));

        let mut workers = Vec::with_capacity(self.upload_threads.max(1));
        for worker_id in 0..self.upload_threads.max(1) {
            workers.push(tokio::spawn(upload_worker(
                self.clone(),
                upload_token.clone(),
                jobs_rx.clone(),
                results_tx.clone(),
                claimed.clone(),
                worker_id + 1,
            )));
        }
        drop(jobs_rx);

        // Enqueue everything up front; channel capacities cover the full
        // batch so none of these sends block.
        let mut enqueued: HashSet<String> = HashSet::new();
        for item in items {
            if item.key.is_empty() && !item.link_to.is_empty() {
                debug!(uri = %item.src_path, "Skipping unfollowed symlink");
                continue;
            }

            if !enqueued.insert(item.key.clone()) {
                debug!(uri = %item.src_path, "Skipping duplicate item");
                // Nothing to upload; report straight to the reader.
                let _ = results_tx
                    .send(UploadResult {
                        state: UploadState::Duplicate,
                        item,
                        error: None,
                    })
                    .await;
                continue;
            }

            if jobs_tx.send(item).await.is_err() {
                break;
            }
        }

        // Close jobs so workers drain and exit; dropping our results
        // sender lets the reader loop end once all workers are done.
        drop(jobs_tx);
        drop(results_tx);

        let mut first_error: Option<GwError> = None;
        let mut record = |err: GwError, upload_token: &CancellationToken| {
            if first_error.is_none() {
                first_error = Some(err);
            }
            upload_token.cancel();
        };

        while let Some(result) = results_rx.recv().await {
            if result.state == UploadState::Failed {
                let err = result.error.unwrap_or(GwError::Cancelled);
                record(err, &upload_token);
                continue;
            }

            let callback_result = match result.state {
                UploadState::Uploaded => on_uploaded(&result.item),
                UploadState::Present => on_present(&result.item),
                UploadState::Duplicate => on_duplicate(&result.item),
                UploadState::Failed => Ok(()),
            };

            if let Err(err) = callback_result {
                record(err, &upload_token);
            }
        }

        for worker in workers {
            let _ = worker.await;
        }

        match first_error {
            Some(err) => Err(err),
            None if token.is_cancelled() => Err(GwError::Cancelled),
            None => Ok(()),
        }
    }
}
