//! The database boundary.
//!
//! The scheduler never talks to a relational database directly; it issues
//! a handful of narrow calls through [`JobStore`]. Deployments implement
//! the trait against their own schema. [`MemoryStore`] is the in-process
//! implementation used by tests and demo runs.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{Result, SchedError};

/// Store-assigned job identifier.
pub type JobId = i64;

/// A unit of pending work as reported by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub id: JobId,
    /// Name of the agent type that must run this job.
    pub agent: String,
    /// Host the job must run on, if any.
    pub required_host: Option<String>,
}

/// Terminal result of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed,
}

impl std::fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobOutcome::Succeeded => write!(f, "succeeded"),
            JobOutcome::Failed => write!(f, "failed"),
        }
    }
}

/// Narrow data-access interface the scheduler drives jobs through.
///
/// Calls are synchronous request/response from the event loop's point of
/// view; the connection is (re)established at reload time only.
#[async_trait]
pub trait JobStore: Send {
    /// (Re)establish the connection. Called at startup and on reload.
    async fn connect(&mut self) -> Result<()>;

    /// Fetch work the scheduler has not seen yet, in creation order.
    async fn fetch_pending(&mut self) -> Result<Vec<JobSpec>>;

    /// Record that a worker was launched for the job.
    async fn job_started(&mut self, id: JobId) -> Result<()>;

    /// Record the terminal state of the job.
    async fn job_finished(&mut self, id: JobId, outcome: JobOutcome, message: &str) -> Result<()>;

    /// Return a job to the store untouched (e.g. pending work dropped
    /// during shutdown). It will be fetched again by the next daemon.
    async fn job_returned(&mut self, id: JobId) -> Result<()>;
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    queue: VecDeque<JobSpec>,
    started: Vec<JobId>,
    finished: Vec<(JobId, JobOutcome, String)>,
    returned: Vec<JobId>,
    connected: bool,
    next_id: JobId,
}

/// In-memory [`JobStore`]. Cloning yields another handle to the same
/// underlying state, which is how tests observe what the daemon did.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryStoreInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryStoreInner> {
        // Mutex poisoning only happens if a holder panicked; tests want
        // the state regardless.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Queue a new job, assigning the next id.
    pub fn push_job(&self, agent: &str, required_host: Option<&str>) -> JobId {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.queue.push_back(JobSpec {
            id,
            agent: agent.to_string(),
            required_host: required_host.map(str::to_string),
        });
        id
    }

    pub fn started(&self) -> Vec<JobId> {
        self.lock().started.clone()
    }

    pub fn finished(&self) -> Vec<(JobId, JobOutcome, String)> {
        self.lock().finished.clone()
    }

    pub fn returned(&self) -> Vec<JobId> {
        self.lock().returned.clone()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn connect(&mut self) -> Result<()> {
        self.lock().connected = true;
        Ok(())
    }

    async fn fetch_pending(&mut self) -> Result<Vec<JobSpec>> {
        let mut inner = self.lock();
        if !inner.connected {
            return Err(SchedError::Store("not connected".into()));
        }
        Ok(inner.queue.drain(..).collect())
    }

    async fn job_started(&mut self, id: JobId) -> Result<()> {
        self.lock().started.push(id);
        Ok(())
    }

    async fn job_finished(&mut self, id: JobId, outcome: JobOutcome, message: &str) -> Result<()> {
        self.lock().finished.push((id, outcome, message.to_string()));
        Ok(())
    }

    async fn job_returned(&mut self, id: JobId) -> Result<()> {
        self.lock().returned.push(id);
        Ok(())
    }
}
