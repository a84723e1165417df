use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};

use crate::store::{JobId, JobSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One unit of scheduled work, bound to an agent type.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub agent: String,
    pub required_host: Option<String>,
    pub status: JobStatus,
    /// Pid of the worker running this job, while one exists.
    pub instance: Option<u32>,
    /// Short human-readable reason, set on failure or kill.
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn from_spec(spec: JobSpec) -> Self {
        Self {
            id: spec.id,
            agent: spec.agent,
            required_host: spec.required_host,
            status: JobStatus::Pending,
            instance: None,
            message: String::new(),
            created_at: Utc::now(),
        }
    }
}

/// All jobs currently known to the scheduler plus the FIFO pending queue.
///
/// A job leaves the pending queue the instant a worker is launched for it
/// (or it is held for an exclusive launch) and leaves the table entirely
/// once its terminal state has been reported.
#[derive(Debug, Default)]
pub struct JobTable {
    jobs: HashMap<JobId, Job>,
    pending: VecDeque<JobId>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a job to the table and the back of the pending queue.
    /// Re-announcements of a known id are ignored.
    pub fn enqueue(&mut self, job: Job) -> bool {
        if self.jobs.contains_key(&job.id) {
            return false;
        }
        self.pending.push_back(job.id);
        self.jobs.insert(job.id, job);
        true
    }

    /// The job at the front of the pending queue, if any.
    pub fn peek_pending(&self) -> Option<&Job> {
        self.pending.front().and_then(|id| self.jobs.get(id))
    }

    /// Remove the front of the pending queue. The job stays in the table.
    pub fn pop_pending(&mut self) -> Option<JobId> {
        self.pending.pop_front()
    }

    /// Remove a specific job from the pending queue (interface kill).
    pub fn unqueue(&mut self, id: JobId) -> bool {
        match self.pending.iter().position(|p| *p == id) {
            Some(idx) => {
                self.pending.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Drop all pending jobs from queue and table, returning their ids.
    pub fn drain_pending(&mut self) -> Vec<JobId> {
        let ids: Vec<JobId> = self.pending.drain(..).collect();
        for id in &ids {
            self.jobs.remove(id);
        }
        ids
    }

    pub fn get(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(&id)
    }

    pub fn get_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.jobs.get_mut(&id)
    }

    pub fn remove(&mut self, id: JobId) -> Option<Job> {
        self.unqueue(id);
        self.jobs.remove(&id)
    }

    /// Number of jobs a worker is currently running for.
    pub fn running(&self) -> usize {
        self.jobs
            .values()
            .filter(|j| j.status == JobStatus::Running)
            .count()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// All jobs in creation order, for status replies.
    pub fn all(&self) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self.jobs.values().collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        jobs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: JobId) -> Job {
        Job::from_spec(JobSpec {
            id,
            agent: "ojo".into(),
            required_host: None,
        })
    }

    #[test]
    fn queue_is_fifo() {
        let mut table = JobTable::new();
        table.enqueue(job(3));
        table.enqueue(job(1));
        table.enqueue(job(2));

        assert_eq!(table.peek_pending().map(|j| j.id), Some(3));
        assert_eq!(table.pop_pending(), Some(3));
        assert_eq!(table.pop_pending(), Some(1));
        assert_eq!(table.pop_pending(), Some(2));
        assert_eq!(table.pop_pending(), None);
        // popped jobs stay in the table
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn duplicate_ids_are_ignored() {
        let mut table = JobTable::new();
        assert!(table.enqueue(job(1)));
        assert!(!table.enqueue(job(1)));
        assert_eq!(table.pending(), 1);
    }

    #[test]
    fn drain_pending_removes_from_table() {
        let mut table = JobTable::new();
        table.enqueue(job(1));
        table.enqueue(job(2));
        let running = table.pop_pending().unwrap();
        table.get_mut(running).unwrap().status = JobStatus::Running;

        let dropped = table.drain_pending();
        assert_eq!(dropped, vec![2]);
        assert_eq!(table.len(), 1);
        assert_eq!(table.running(), 1);
    }

    #[test]
    fn unqueue_targets_one_job() {
        let mut table = JobTable::new();
        table.enqueue(job(1));
        table.enqueue(job(2));
        table.enqueue(job(3));
        assert!(table.unqueue(2));
        assert!(!table.unqueue(2));
        assert_eq!(table.pop_pending(), Some(1));
        assert_eq!(table.pop_pending(), Some(3));
    }
}
