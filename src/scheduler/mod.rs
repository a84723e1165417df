pub mod agent;
pub mod assigner;
pub mod host;
pub mod job;

pub use agent::{AgentInstance, AgentRegistry, InstanceState, MetaAgent, SpecialFlags};
pub use assigner::{tick, Decision};
pub use host::{Host, HostRegistry};
pub use job::{Job, JobStatus, JobTable};

use crate::store::JobId;

/// An exclusive job that has been pulled off the queue but whose launch
/// is deferred until the system drains.
#[derive(Debug, Clone)]
pub struct HeldJob {
    pub job: JobId,
    pub host: String,
}

/// Everything the scheduling algorithm reads and mutates.
///
/// Owned by the event-loop task; handlers mutate it one at a time and
/// never from a signal context.
#[derive(Debug, Default)]
pub struct SchedulerState {
    pub hosts: HostRegistry,
    pub agents: AgentRegistry,
    pub jobs: JobTable,
    /// Startup gate: the first idle tick triggers a job refresh.
    pub startup: bool,
    /// Admission is suspended while paused.
    pub paused: bool,
    /// Shutdown in progress; no new jobs are admitted.
    pub closing: bool,
    /// An exclusive job owns the scheduler until everything drains.
    pub lockout: bool,
    pub held: Option<HeldJob>,
}

impl SchedulerState {
    pub fn new() -> Self {
        Self {
            startup: true,
            ..Self::default()
        }
    }
}
