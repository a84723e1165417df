//! Completion notification seam (the email boundary).
//!
//! Formatting and delivery are somebody else's problem; the scheduler
//! only announces that a job reached a terminal state. NOEMAIL agent
//! types are filtered by the daemon before this is called.

use async_trait::async_trait;
use tracing::info;

use crate::config::SchedulerConfig;
use crate::scheduler::Job;
use crate::store::JobOutcome;

#[async_trait]
pub trait Notifier: Send {
    /// Announce a finished job.
    async fn job_finished(&self, job: &Job, outcome: JobOutcome);

    /// Re-derive templates and settings after a configuration reload.
    fn reload(&mut self, _config: &SchedulerConfig) {}
}

/// Writes announcements to the log. The default when no mail transport
/// is wired in.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn job_finished(&self, job: &Job, outcome: JobOutcome) {
        info!(
            job = job.id,
            agent = %job.agent,
            %outcome,
            message = %job.message,
            "job finished"
        );
    }
}
