//! Job queue collaborator.
//!
//! Refresh batches too large for the triggering request and regeneration of
//! purged pages are pushed here. Lower priority numbers run first.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;
use crate::lock::mutex_lock;
use crate::model::SiteUri;
use crate::refresh::RefreshJobPayload;

const LOCK_TARGET: &str = "queue::memory";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Job {
    /// Resolve and purge a serialized batch.
    Refresh(RefreshJobPayload),
    /// Re-render purged pages.
    Generate {
        #[serde(rename = "siteUris")]
        site_uris: Vec<SiteUri>,
    },
}

/// Which pending jobs a release applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobFilter {
    All,
    Refresh,
    Generate,
}

impl JobFilter {
    pub fn matches(self, job: &Job) -> bool {
        matches!(
            (self, job),
            (JobFilter::All, _) | (JobFilter::Refresh, Job::Refresh(_)) | (JobFilter::Generate, Job::Generate { .. })
        )
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Push a job; returns its queue id.
    async fn enqueue(&self, job: Job, priority: u32, delay: Option<Duration>) -> Result<u64, Error>;

    /// Remove pending jobs matching `filter` and hand them back.
    async fn release(&self, filter: JobFilter) -> Result<Vec<Job>, Error>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedJob {
    pub id: u64,
    pub job: Job,
    pub priority: u32,
    pub available_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct QueueState {
    next_id: u64,
    jobs: Vec<QueuedJob>,
}

/// In-process queue ordered by priority, then insertion.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the highest-priority job available at `now`.
    pub fn pop_ready(&self, now: DateTime<Utc>) -> Option<QueuedJob> {
        let mut state = mutex_lock(&self.state, LOCK_TARGET, "pop_ready");
        let position = state
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, queued)| queued.available_at <= now)
            .min_by_key(|(_, queued)| (queued.priority, queued.id))
            .map(|(position, _)| position)?;
        Some(state.jobs.remove(position))
    }

    /// Snapshot of pending jobs in run order.
    pub fn pending(&self) -> Vec<QueuedJob> {
        let state = mutex_lock(&self.state, LOCK_TARGET, "pending");
        let mut jobs = state.jobs.clone();
        jobs.sort_by_key(|queued| (queued.priority, queued.id));
        jobs
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.state, LOCK_TARGET, "len").jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, job: Job, priority: u32, delay: Option<Duration>) -> Result<u64, Error> {
        let delay = match delay {
            Some(delay) => chrono::Duration::from_std(delay).map_err(|e| Error::Queue(format!("invalid delay: {e}")))?,
            None => chrono::Duration::zero(),
        };
        let mut state = mutex_lock(&self.state, LOCK_TARGET, "enqueue");
        state.next_id += 1;
        let id = state.next_id;
        state.jobs.push(QueuedJob { id, job, priority, available_at: Utc::now() + delay });
        Ok(id)
    }

    async fn release(&self, filter: JobFilter) -> Result<Vec<Job>, Error> {
        let mut state = mutex_lock(&self.state, LOCK_TARGET, "release");
        let (released, kept): (Vec<QueuedJob>, Vec<QueuedJob>) =
            std::mem::take(&mut state.jobs).into_iter().partition(|queued| filter.matches(&queued.job));
        state.jobs = kept;
        Ok(released.into_iter().map(|queued| queued.job).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generate(uri: &str) -> Job {
        Job::Generate { site_uris: vec![SiteUri::new(1, uri)] }
    }

    #[tokio::test]
    async fn test_priority_then_insertion_order() {
        let queue = MemoryQueue::new();
        queue.enqueue(generate("a"), 10, None).await.unwrap();
        queue.enqueue(generate("b"), 5, None).await.unwrap();
        queue.enqueue(generate("c"), 10, None).await.unwrap();

        let order: Vec<Job> = std::iter::from_fn(|| queue.pop_ready(Utc::now())).map(|q| q.job).collect();
        assert_eq!(order, vec![generate("b"), generate("a"), generate("c")]);
    }

    #[tokio::test]
    async fn test_delayed_jobs_wait() {
        let queue = MemoryQueue::new();
        queue.enqueue(generate("later"), 1, Some(Duration::from_secs(60))).await.unwrap();

        assert!(queue.pop_ready(Utc::now()).is_none());
        assert!(queue.pop_ready(Utc::now() + chrono::Duration::minutes(2)).is_some());
    }

    #[tokio::test]
    async fn test_release_by_filter() {
        let queue = MemoryQueue::new();
        queue.enqueue(generate("a"), 1, None).await.unwrap();
        queue.enqueue(Job::Refresh(RefreshJobPayload::default()), 1, None).await.unwrap();

        assert_eq!(queue.release(JobFilter::Generate).await.unwrap(), vec![generate("a")]);
        assert_eq!(queue.len(), 1);
        assert!(matches!(queue.pending()[0].job, Job::Refresh(_)));
    }

    #[test]
    fn test_job_json_shape() {
        let json = serde_json::to_value(generate("page")).unwrap();
        assert_eq!(json["kind"], "generate");
        assert_eq!(json["siteUris"][0]["siteId"], 1);
    }
}
