//! The scheduling algorithm, run after every event.
//!
//! [`tick`] is pure policy over [`SchedulerState`]: it picks at most one
//! job to admit, decides where it runs, and reports what should happen
//! as [`Decision`]s. Spawning, store reporting and process signalling
//! are carried out by the daemon, so the policy stays cheap and testable.

use tracing::debug;

use crate::config::LOCAL_HOST;
use crate::scheduler::{HeldJob, SchedulerState};
use crate::store::JobId;

/// An effect the daemon must carry out after a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Startup gate fired: ask the store for pending work.
    RefreshJobs,
    /// Close condition met: terminate the event loop.
    Terminate,
    /// Spawn a worker for the job on the named host.
    Launch { job: JobId, host: String },
    /// Permanent rejection; mark the job failed, no retry.
    FailJob { job: JobId, reason: String },
}

/// One scheduling pass. Invoked after every event, so it must stay light.
pub fn tick(state: &mut SchedulerState) -> Vec<Decision> {
    let mut out = Vec::new();
    let n_instances = state.agents.instance_count();
    let n_running = state.jobs.running();

    // Startup gate: an idle, freshly (re)configured scheduler asks the
    // store what work already exists.
    if state.startup && n_instances == 0 {
        state.startup = false;
        out.push(Decision::RefreshJobs);
    }

    if state.closing && n_instances == 0 && n_running == 0 {
        out.push(Decision::Terminate);
        return out;
    }

    // Release the exclusive lockout once everything has drained.
    if state.lockout && n_instances == 0 && n_running == 0 {
        debug!("exclusive lockout released");
        state.lockout = false;
    }

    if state.held.is_none() && !state.lockout && !state.closing && !state.paused {
        admit_one(state, &mut out);
    }

    // Deferred exclusive launch: the held job starts only once it would
    // be the only thing running.
    if let Some(held) = state.held.take() {
        if !state.closing && state.agents.instance_count() == 0 && state.jobs.running() == 0 {
            debug!(job = held.job, host = %held.host, "launching held exclusive job");
            state.lockout = true;
            out.push(Decision::Launch {
                job: held.job,
                host: held.host,
            });
        } else {
            state.held = Some(held);
        }
    }

    out
}

/// Admission: pull at most one job off the front of the queue. Capacity
/// blocks leave the head in place for the next tick; mis-specified jobs
/// are failed permanently and the next head is considered.
fn admit_one(state: &mut SchedulerState, out: &mut Vec<Decision>) {
    loop {
        let Some(job) = state.jobs.peek_pending() else {
            return;
        };
        let job_id = job.id;

        let Some(meta) = state.agents.meta(&job.agent) else {
            let reason = format!("agent type {} is not configured", job.agent);
            state.jobs.pop_pending();
            out.push(Decision::FailJob {
                job: job_id,
                reason,
            });
            continue;
        };

        if meta.at_limit() {
            debug!(
                job = job_id,
                agent = %meta.name,
                "held back, agent type at max run limit"
            );
            return;
        }

        let host = if meta.special.local_only {
            match state.hosts.get(LOCAL_HOST) {
                Some(h) if h.has_capacity() => LOCAL_HOST.to_string(),
                _ => return,
            }
        } else if let Some(required) = job.required_host.clone() {
            match state.hosts.get(&required) {
                None => {
                    let reason = format!("required host {} not in the host list", required);
                    state.jobs.pop_pending();
                    out.push(Decision::FailJob {
                        job: job_id,
                        reason,
                    });
                    continue;
                }
                Some(h) if h.has_capacity() => required,
                Some(_) => return,
            }
        } else {
            match state.hosts.next_available() {
                Some(h) => h,
                None => return,
            }
        };

        state.jobs.pop_pending();
        if meta.special.exclusive {
            debug!(job = job_id, "exclusive job, postponing launch");
            state.held = Some(HeldJob { job: job_id, host });
        } else {
            out.push(Decision::Launch { job: job_id, host });
        }
        return;
    }
}
