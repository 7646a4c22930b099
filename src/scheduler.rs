//! Delayed-enqueue scheduling
//!
//! The core treats schedulers as clients that eventually call `enqueue`.
//! This collaborator covers the common case of a one-shot "start this
//! download at time T" job; periodic host-side triggers layer on top of the
//! same surface.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Weak;
use tokio::task::JoinHandle;

use crate::engine::DownloadEngine;
use crate::types::DownloadRequest;

/// Pending delayed enqueues, keyed by request id
#[derive(Default)]
pub struct Scheduler {
    jobs: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue `request` on `engine` at `when`. A time in the past fires
    /// immediately. Re-scheduling the same request id replaces the pending
    /// job.
    pub fn schedule(
        &self,
        engine: Weak<DownloadEngine>,
        request: DownloadRequest,
        when: DateTime<Utc>,
    ) {
        let id = request.id.clone();
        let delay = (when - Utc::now()).to_std().unwrap_or_default();

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(engine) = engine.upgrade() else {
                return; // engine is gone; the job dies with it
            };
            if let Err(e) = engine.enqueue(request).await {
                tracing::warn!("Scheduled download failed to enqueue: {}", e);
            }
        });

        if let Some(previous) = self.jobs.lock().insert(id, task) {
            previous.abort();
        }
    }

    /// Abort a pending job. Returns whether one existed.
    pub fn cancel(&self, id: &str) -> bool {
        match self.jobs.lock().remove(id) {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    /// Abort every pending job
    pub fn shutdown(&self) {
        for (_, task) in self.jobs.lock().drain() {
            task.abort();
        }
    }
}
