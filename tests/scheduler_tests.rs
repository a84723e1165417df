//! Scheduling policy tests: drive `tick` over a hand-built state and
//! apply its decisions the way the daemon would, without any processes.

use std::path::PathBuf;

use dispatchd::scheduler::{
    tick, AgentInstance, Decision, Host, Job, JobStatus, MetaAgent, SchedulerState, SpecialFlags,
};
use dispatchd::store::{JobId, JobSpec};

fn state() -> SchedulerState {
    let mut s = SchedulerState::new();
    // the startup gate is exercised by its own test
    s.startup = false;
    s
}

fn add_host(s: &mut SchedulerState, name: &str, max: u32) {
    s.hosts.insert(Host {
        name: name.to_string(),
        address: format!("{}.example", name),
        directory: PathBuf::from("/srv"),
        max,
        running: 0,
        kind: String::new(),
    });
}

fn add_agent(s: &mut SchedulerState, name: &str, max_run: u32, special: SpecialFlags) {
    s.agents.insert_meta(MetaAgent {
        name: name.to_string(),
        command: name.to_string(),
        max_run,
        running: 0,
        special,
    });
}

fn push_job(s: &mut SchedulerState, id: JobId, agent: &str) {
    push_job_on(s, id, agent, None);
}

fn push_job_on(s: &mut SchedulerState, id: JobId, agent: &str, host: Option<&str>) {
    s.jobs.enqueue(Job::from_spec(JobSpec {
        id,
        agent: agent.to_string(),
        required_host: host.map(str::to_string),
    }));
}

/// Apply a Launch decision the way the daemon does.
fn apply_launch(s: &mut SchedulerState, job: JobId, host: &str, pid: u32) {
    let agent = s.jobs.get(job).unwrap().agent.clone();
    s.agents
        .register_instance(AgentInstance::new(pid, &agent, job, host));
    s.agents.meta_mut(&agent).unwrap().running += 1;
    s.hosts.get_mut(host).unwrap().running += 1;
    let j = s.jobs.get_mut(job).unwrap();
    j.status = JobStatus::Running;
    j.instance = Some(pid);
}

/// Apply a worker exit the way the daemon does.
fn apply_exit(s: &mut SchedulerState, pid: u32) {
    let instance = s.agents.remove_instance(pid).unwrap();
    s.agents.meta_mut(&instance.agent).unwrap().running -= 1;
    s.hosts.get_mut(&instance.host).unwrap().running -= 1;
    s.jobs.remove(instance.job);
}

fn launches(decisions: &[Decision]) -> Vec<(JobId, String)> {
    decisions
        .iter()
        .filter_map(|d| match d {
            Decision::Launch { job, host } => Some((*job, host.clone())),
            _ => None,
        })
        .collect()
}

#[test]
fn startup_gate_fires_exactly_once() {
    let mut s = SchedulerState::new();
    assert!(s.startup);
    assert_eq!(tick(&mut s), vec![Decision::RefreshJobs]);
    assert!(!s.startup);
    assert_eq!(tick(&mut s), vec![]);
}

#[test]
fn admission_is_fifo() {
    let mut s = state();
    add_host(&mut s, "local", 10);
    add_agent(&mut s, "ojo", 10, SpecialFlags::default());
    for id in [5, 2, 9] {
        push_job(&mut s, id, "ojo");
    }

    let mut order = Vec::new();
    let mut pid = 100;
    loop {
        let decisions = tick(&mut s);
        let launched = launches(&decisions);
        if launched.is_empty() {
            break;
        }
        for (job, host) in launched {
            order.push(job);
            apply_launch(&mut s, job, &host, pid);
            pid += 1;
        }
    }
    assert_eq!(order, vec![5, 2, 9]);
}

#[test]
fn one_admission_per_tick() {
    let mut s = state();
    add_host(&mut s, "local", 10);
    add_agent(&mut s, "ojo", 10, SpecialFlags::default());
    push_job(&mut s, 1, "ojo");
    push_job(&mut s, 2, "ojo");

    assert_eq!(launches(&tick(&mut s)).len(), 1);
}

#[test]
fn agent_limit_holds_the_queue_head_back() {
    let mut s = state();
    add_host(&mut s, "local", 10);
    add_agent(&mut s, "ojo", 1, SpecialFlags::default());
    push_job(&mut s, 1, "ojo");
    push_job(&mut s, 2, "ojo");

    let first = launches(&tick(&mut s));
    assert_eq!(first, vec![(1, "local".to_string())]);
    apply_launch(&mut s, 1, "local", 100);

    // the limit blocks job 2 but does not discard it
    assert_eq!(launches(&tick(&mut s)), vec![]);
    assert_eq!(s.jobs.pending(), 1);

    apply_exit(&mut s, 100);
    assert_eq!(launches(&tick(&mut s)), vec![(2, "local".to_string())]);
}

#[test]
fn host_capacity_blocks_until_an_exit_frees_a_slot() {
    let mut s = state();
    add_host(&mut s, "local", 1);
    add_agent(&mut s, "ojo", 10, SpecialFlags::default());
    push_job(&mut s, 1, "ojo");
    push_job(&mut s, 2, "ojo");

    apply_launch(&mut s, 1, "local", 100);
    s.jobs.pop_pending();
    assert_eq!(launches(&tick(&mut s)), vec![]);

    apply_exit(&mut s, 100);
    assert_eq!(launches(&tick(&mut s)), vec![(2, "local".to_string())]);
}

#[test]
fn placement_rotates_across_hosts() {
    let mut s = state();
    add_host(&mut s, "a", 4);
    add_host(&mut s, "b", 4);
    add_agent(&mut s, "ojo", 10, SpecialFlags::default());
    for id in 1..=4 {
        push_job(&mut s, id, "ojo");
    }

    let mut hosts = Vec::new();
    let mut pid = 100;
    loop {
        let launched = launches(&tick(&mut s));
        if launched.is_empty() {
            break;
        }
        for (job, host) in launched {
            hosts.push(host.clone());
            apply_launch(&mut s, job, &host, pid);
            pid += 1;
        }
    }
    // both hosts share the work rather than first-fit piling onto one
    assert_eq!(hosts.iter().filter(|h| *h == "a").count(), 2);
    assert_eq!(hosts.iter().filter(|h| *h == "b").count(), 2);
}

#[test]
fn local_only_agents_never_leave_the_local_host() {
    let mut s = state();
    add_host(&mut s, "local", 1);
    add_host(&mut s, "remote", 10);
    add_agent(
        &mut s,
        "unpack",
        10,
        SpecialFlags {
            local_only: true,
            ..Default::default()
        },
    );
    push_job(&mut s, 1, "unpack");
    push_job(&mut s, 2, "unpack");

    assert_eq!(launches(&tick(&mut s)), vec![(1, "local".to_string())]);
    apply_launch(&mut s, 1, "local", 100);

    // local is full; the remote host with free capacity is not an option
    assert_eq!(launches(&tick(&mut s)), vec![]);
    assert_eq!(s.jobs.pending(), 1);
}

#[test]
fn missing_required_host_fails_the_job_permanently() {
    let mut s = state();
    add_host(&mut s, "local", 10);
    add_agent(&mut s, "ojo", 10, SpecialFlags::default());
    push_job_on(&mut s, 1, "ojo", Some("ghost"));
    push_job(&mut s, 2, "ojo");

    let decisions = tick(&mut s);
    // job 1 is rejected and, in the same pass, job 2 is admitted
    assert!(decisions.iter().any(
        |d| matches!(d, Decision::FailJob { job: 1, reason } if reason.contains("ghost"))
    ));
    assert_eq!(launches(&decisions), vec![(2, "local".to_string())]);
}

#[test]
fn full_required_host_blocks_without_failing() {
    let mut s = state();
    add_host(&mut s, "local", 10);
    add_host(&mut s, "build", 1);
    add_agent(&mut s, "ojo", 10, SpecialFlags::default());
    push_job_on(&mut s, 1, "ojo", Some("build"));
    push_job_on(&mut s, 2, "ojo", Some("build"));

    assert_eq!(launches(&tick(&mut s)), vec![(1, "build".to_string())]);
    apply_launch(&mut s, 1, "build", 100);

    assert_eq!(tick(&mut s), vec![]);
    assert_eq!(s.jobs.pending(), 1);
}

#[test]
fn unknown_agent_type_fails_and_the_next_job_proceeds() {
    let mut s = state();
    add_host(&mut s, "local", 10);
    add_agent(&mut s, "ojo", 10, SpecialFlags::default());
    push_job(&mut s, 1, "nosuch");
    push_job(&mut s, 2, "ojo");

    let decisions = tick(&mut s);
    assert!(decisions
        .iter()
        .any(|d| matches!(d, Decision::FailJob { job: 1, .. })));
    assert_eq!(launches(&decisions), vec![(2, "local".to_string())]);
}

#[test]
fn exclusive_job_waits_for_the_system_to_drain() {
    let mut s = state();
    add_host(&mut s, "local", 10);
    add_agent(&mut s, "ojo", 10, SpecialFlags::default());
    add_agent(
        &mut s,
        "maint",
        1,
        SpecialFlags {
            exclusive: true,
            ..Default::default()
        },
    );
    push_job(&mut s, 1, "ojo");
    push_job(&mut s, 2, "maint");
    push_job(&mut s, 3, "ojo");

    // ordinary job first
    assert_eq!(launches(&tick(&mut s)), vec![(1, "local".to_string())]);
    apply_launch(&mut s, 1, "local", 100);

    // the exclusive job is pulled and held; nothing launches while job 1 runs
    assert_eq!(launches(&tick(&mut s)), vec![]);
    assert!(s.held.is_some());

    // job 3 must not sneak past the held job
    assert_eq!(launches(&tick(&mut s)), vec![]);

    // drain; the held job launches alone and locks the scheduler
    apply_exit(&mut s, 100);
    assert_eq!(launches(&tick(&mut s)), vec![(2, "local".to_string())]);
    assert!(s.lockout);
    apply_launch(&mut s, 2, "local", 101);

    // lockout holds job 3 back while the exclusive job runs
    assert_eq!(launches(&tick(&mut s)), vec![]);

    // and releases once it exits
    apply_exit(&mut s, 101);
    assert_eq!(launches(&tick(&mut s)), vec![(3, "local".to_string())]);
    assert!(!s.lockout);
}

#[test]
fn pause_suspends_admission() {
    let mut s = state();
    add_host(&mut s, "local", 10);
    add_agent(&mut s, "ojo", 10, SpecialFlags::default());
    push_job(&mut s, 1, "ojo");

    s.paused = true;
    assert_eq!(tick(&mut s), vec![]);

    s.paused = false;
    assert_eq!(launches(&tick(&mut s)), vec![(1, "local".to_string())]);
}

#[test]
fn close_terminates_only_after_running_work_drains() {
    let mut s = state();
    add_host(&mut s, "local", 10);
    add_agent(&mut s, "ojo", 10, SpecialFlags::default());
    push_job(&mut s, 1, "ojo");

    assert_eq!(launches(&tick(&mut s)), vec![(1, "local".to_string())]);
    apply_launch(&mut s, 1, "local", 100);

    s.closing = true;
    assert_eq!(tick(&mut s), vec![]);

    apply_exit(&mut s, 100);
    assert_eq!(tick(&mut s), vec![Decision::Terminate]);
}

#[test]
fn randomized_churn_never_exceeds_capacity() {
    use rand::prelude::*;

    let mut rng = StdRng::seed_from_u64(7);
    let mut s = state();
    add_host(&mut s, "local", 3);
    add_host(&mut s, "build", 2);
    add_agent(&mut s, "ojo", 4, SpecialFlags::default());
    add_agent(&mut s, "copyright", 2, SpecialFlags::default());

    let mut next_job: JobId = 0;
    let mut next_pid: u32 = 1000;
    let mut live: Vec<u32> = Vec::new();
    let mut completed = 0usize;

    for _ in 0..500 {
        if rng.random_bool(0.4) {
            next_job += 1;
            let agent = if rng.random_bool(0.5) { "ojo" } else { "copyright" };
            push_job(&mut s, next_job, agent);
        }
        if !live.is_empty() && rng.random_bool(0.3) {
            let pid = live.swap_remove(rng.random_range(0..live.len()));
            apply_exit(&mut s, pid);
            completed += 1;
        }

        for decision in tick(&mut s) {
            match decision {
                Decision::Launch { job, host } => {
                    apply_launch(&mut s, job, &host, next_pid);
                    live.push(next_pid);
                    next_pid += 1;
                }
                other => panic!("unexpected decision {:?}", other),
            }
        }

        for name in ["local", "build"] {
            let host = s.hosts.get(name).unwrap();
            assert!(host.running <= host.max, "host {} over capacity", name);
        }
        for name in ["ojo", "copyright"] {
            let meta = s.agents.meta(name).unwrap();
            assert!(meta.running <= meta.max_run, "agent {} over limit", name);
        }
        assert_eq!(s.jobs.running(), s.agents.instance_count());
    }

    // drain whatever is left so the run ends in a quiet state
    while !live.is_empty() || s.jobs.pending() > 0 {
        if let Some(&pid) = live.first() {
            live.remove(0);
            apply_exit(&mut s, pid);
            completed += 1;
        }
        for decision in tick(&mut s) {
            if let Decision::Launch { job, host } = decision {
                apply_launch(&mut s, job, &host, next_pid);
                live.push(next_pid);
                next_pid += 1;
            }
        }
    }
    assert!(completed > 0);
    assert_eq!(s.agents.instance_count(), 0);
}
