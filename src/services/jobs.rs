//! One-shot, time-triggered jobs keyed by caller-chosen ids.
//!
//! A job removes its own entry the moment it fires, so removal after that
//! point reports `false` and never interrupts a running job. Scheduling an id
//! that is already pending is a no-op.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::debug;

#[derive(Clone, Default)]
pub struct JobScheduler {
    jobs: Arc<DashMap<String, AbortHandle>>,
}

impl JobScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deterministic job id for one slice of a parent order
    pub fn slice_job_id(parent_order_id: &str, slice_num: i32) -> String {
        format!("{}_slice_{}", parent_order_id, slice_num)
    }

    /// Prefix matching every slice job of a parent order
    pub fn slice_job_prefix(parent_order_id: &str) -> String {
        format!("{}_slice_", parent_order_id)
    }

    /// Run `task` at `run_at` (immediately if that is in the past).
    /// Returns false if a job with this id is already pending.
    pub fn schedule_at<F>(&self, id: impl Into<String>, run_at: DateTime<Utc>, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = id.into();
        let (armed_tx, armed_rx) = oneshot::channel::<()>();

        match self.jobs.entry(id.clone()) {
            Entry::Occupied(_) => {
                debug!(job_id = %id, "job already scheduled");
                return false;
            }
            Entry::Vacant(slot) => {
                let jobs = Arc::clone(&self.jobs);
                let job_id = id.clone();
                let handle = tokio::spawn(async move {
                    // Wait until the entry is registered before touching the map
                    if armed_rx.await.is_err() {
                        return;
                    }
                    let delay = (run_at - Utc::now()).to_std().unwrap_or_default();
                    tokio::time::sleep(delay).await;
                    if jobs.remove(&job_id).is_none() {
                        return;
                    }
                    debug!(job_id = %job_id, "job fired");
                    task.await;
                });
                slot.insert(handle.abort_handle());
            }
        }

        let _ = armed_tx.send(());
        debug!(job_id = %id, run_at = %run_at, "job scheduled");
        true
    }

    /// Remove a pending job. False when it already fired or never existed.
    pub fn remove_job(&self, id: &str) -> bool {
        match self.jobs.remove(id) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Remove every pending job whose id starts with `prefix`
    pub fn remove_jobs_with_prefix(&self, prefix: &str) -> usize {
        let ids: Vec<String> = self
            .jobs
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        ids.iter().filter(|id| self.remove_job(id)).count()
    }

    pub fn is_scheduled(&self, id: &str) -> bool {
        self.jobs.contains_key(id)
    }

    pub fn job_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.jobs.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Abort everything still pending
    pub fn shutdown(&self) -> usize {
        let ids: Vec<String> = self.jobs.iter().map(|e| e.key().clone()).collect();
        ids.iter().filter(|id| self.remove_job(id)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_job_fires_once_and_removes_itself() {
        let jobs = JobScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        assert!(jobs.schedule_at("p1_slice_0", Utc::now(), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!jobs.is_scheduled("p1_slice_0"));
        // Already fired: removal is a benign no-op
        assert!(!jobs.remove_job("p1_slice_0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_id_is_ignored() {
        let jobs = JobScheduler::new();
        let at = Utc::now() + chrono::Duration::seconds(60);
        assert!(jobs.schedule_at("a", at, async {}));
        assert!(!jobs.schedule_at("a", at, async {}));
        assert_eq!(jobs.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prefix_removal_prevents_execution() {
        let jobs = JobScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let at = Utc::now() + chrono::Duration::seconds(1);
        for n in 0..3 {
            let counter = Arc::clone(&fired);
            jobs.schedule_at(JobScheduler::slice_job_id("p1", n), at, async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        jobs.schedule_at(JobScheduler::slice_job_id("p2", 0), at, async {});

        assert_eq!(jobs.remove_jobs_with_prefix(&JobScheduler::slice_job_prefix("p1")), 3);
        assert_eq!(jobs.job_ids(), vec!["p2_slice_0".to_string()]);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
