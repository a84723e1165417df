//! The daemon: event loop, handlers, and the wiring between them.
//!
//! All scheduler state lives in one task. Handlers run to completion one
//! at a time, and the scheduling tick runs after every event, so nothing
//! here needs a lock. Signals and client connections feed the same
//! event queue from their own tasks.

use std::fmt::Write as _;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigSource, SchedulerConfig};
use crate::error::Result;
use crate::events::Event;
use crate::interface::{self, Command};
use crate::notify::Notifier;
use crate::scheduler::{
    tick, AgentInstance, Decision, Host, InstanceState, Job, JobStatus, MetaAgent, SchedulerState,
};
use crate::signals::SignalBridge;
use crate::store::{JobId, JobOutcome, JobStore};
use crate::worker::{signal_process, Executor, StatusLine, StatusTag};
use crate::SchedError;

pub struct Daemon {
    config: SchedulerConfig,
    source: Box<dyn ConfigSource>,
    state: SchedulerState,
    store: Box<dyn JobStore>,
    notifier: Box<dyn Notifier>,
    executor: Executor,
    events_tx: UnboundedSender<Event>,
    events_rx: UnboundedReceiver<Event>,
    cancel: CancellationToken,
    verbosity: i64,
    daemonized: bool,
    terminated: bool,
}

impl Daemon {
    /// Construct a daemon: load configuration (fatal if unreadable),
    /// populate the registries and connect the store.
    pub async fn new(
        source: Box<dyn ConfigSource>,
        store: Box<dyn JobStore>,
        notifier: Box<dyn Notifier>,
        port_override: Option<u16>,
        daemonized: bool,
    ) -> Result<Self> {
        let mut config = source.load()?;
        if let Some(port) = port_override {
            config.daemon.port = port;
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let executor = Executor::new(events_tx.clone(), config.daemon.log_dir.clone());

        let mut daemon = Self {
            config: config.clone(),
            source,
            state: SchedulerState::new(),
            store,
            notifier,
            executor,
            events_tx,
            events_rx,
            cancel: CancellationToken::new(),
            verbosity: 0,
            daemonized,
            terminated: false,
        };
        daemon.apply_config(config).await?;
        Ok(daemon)
    }

    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    pub fn terminated(&self) -> bool {
        self.terminated
    }

    pub fn events_sender(&self) -> UnboundedSender<Event> {
        self.events_tx.clone()
    }

    /// Run until the close condition is observed.
    pub async fn run(mut self) -> Result<()> {
        let listener =
            TcpListener::bind(("0.0.0.0", self.config.daemon.port)).await?;
        tokio::spawn(interface::listen(
            listener,
            self.events_tx.clone(),
            self.cancel.clone(),
        ));

        let mut bridge = SignalBridge::new(self.config.refresh_interval());
        bridge.install(&self.cancel)?;

        // The bridge is polled before every event and at least once a
        // second even when the queue is idle.
        let mut poll = interval(Duration::from_secs(1));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(port = self.config.daemon.port, "scheduler running");
        // opening pass: fires the startup gate before any event arrives
        self.run_tick().await?;
        while !self.terminated {
            let queued = tokio::select! {
                _ = poll.tick() => None,
                event = self.events_rx.recv() => event,
            };
            for event in bridge.poll() {
                self.handle_event(event).await?;
                if self.terminated {
                    break;
                }
            }
            if let (Some(event), false) = (queued, self.terminated) {
                self.handle_event(event).await?;
            }
        }

        self.cancel.cancel();
        info!("event loop terminated");
        Ok(())
    }

    /// Handle one event to completion, then run the scheduling tick.
    pub async fn handle_event(&mut self, event: Event) -> Result<()> {
        match event {
            // Exits arrive as AgentExited from the per-child wait tasks;
            // the signal only forces a prompt tick.
            Event::ReapCheck => {}
            Event::AgentExited { pid, success } => self.reap(pid, success).await?,
            Event::AgentStatus { pid, line } => self.agent_status(pid, line),
            Event::Close { force } => self.close(force).await?,
            Event::Reload => self.reload().await?,
            Event::RefreshAgents => self.refresh_agents(),
            Event::RefreshJobs => self.refresh_jobs().await?,
            Event::Command { command, reply } => {
                let text = self.run_command(command).await?;
                let _ = reply.send(text);
            }
        }
        self.run_tick().await
    }

    async fn run_tick(&mut self) -> Result<()> {
        for decision in tick(&mut self.state) {
            match decision {
                Decision::RefreshJobs => self.refresh_jobs().await?,
                Decision::Terminate => {
                    info!("close condition met");
                    self.terminated = true;
                }
                Decision::FailJob { job, reason } => self.fail_job(job, &reason).await,
                Decision::Launch { job, host } => self.launch(job, &host).await,
            }
        }
        Ok(())
    }

    /// Spawn a worker for an admitted job. A spawn failure is a terminal
    /// job failure, never a retry.
    async fn launch(&mut self, job_id: JobId, host_name: &str) {
        let Some(job) = self.state.jobs.get(job_id).cloned() else {
            // killed between admission and launch
            debug!(job = job_id, "launch skipped, job no longer known");
            return;
        };
        let Some(meta) = self.state.agents.meta(&job.agent).cloned() else {
            self.fail_job(job_id, &format!("agent type {} is not configured", job.agent))
                .await;
            return;
        };
        let Some(host) = self.state.hosts.get(host_name).cloned() else {
            self.fail_job(job_id, &format!("host {} vanished before launch", host_name))
                .await;
            return;
        };

        match self.executor.spawn_worker(&job, &meta, &host) {
            Ok(pid) => {
                info!(job = job_id, agent = %meta.name, host = %host.name, pid, "started job");
                self.state
                    .agents
                    .register_instance(AgentInstance::new(pid, &meta.name, job_id, host_name));
                if let Some(m) = self.state.agents.meta_mut(&meta.name) {
                    m.running += 1;
                }
                if let Some(h) = self.state.hosts.get_mut(host_name) {
                    h.running += 1;
                }
                if let Some(j) = self.state.jobs.get_mut(job_id) {
                    j.status = JobStatus::Running;
                    j.instance = Some(pid);
                }
                if let Err(e) = self.store.job_started(job_id).await {
                    warn!(job = job_id, error = %e, "store rejected start report");
                }
            }
            Err(e) => {
                warn!(job = job_id, error = %e, "spawn failed");
                self.fail_job(job_id, &e.to_string()).await;
            }
        }
    }

    /// Mark a job failed with a reason and report it out.
    async fn fail_job(&mut self, job_id: JobId, reason: &str) {
        if let Some(job) = self.state.jobs.get_mut(job_id) {
            job.status = JobStatus::Failed;
            job.message = reason.to_string();
        }
        warn!(job = job_id, reason, "job failed");
        self.finish_job(job_id, JobOutcome::Failed).await;
    }

    /// Report a terminal job state to the store and the notifier, then
    /// drop the job from the table.
    async fn finish_job(&mut self, job_id: JobId, outcome: JobOutcome) {
        let Some(job) = self.state.jobs.remove(job_id) else {
            return;
        };
        let no_email = self
            .state
            .agents
            .meta(&job.agent)
            .map(|m| m.special.no_email)
            .unwrap_or(false);
        if let Err(e) = self.store.job_finished(job.id, outcome, &job.message).await {
            warn!(job = job.id, error = %e, "store rejected finish report");
        }
        if !no_email {
            self.notifier.job_finished(&job, outcome).await;
        }
    }

    /// A worker process exited: resolve pid to instance, release its
    /// capacity and finish the owning job.
    async fn reap(&mut self, pid: u32, success: bool) -> Result<()> {
        let Some(instance) = self.state.agents.remove_instance(pid) else {
            // a process may die after its record was already cleared
            warn!(pid, "death notification for unknown pid, ignoring");
            return Ok(());
        };
        debug!(pid, job = instance.job, state = %instance.state, "reaping instance");

        if let Some(m) = self.state.agents.meta_mut(&instance.agent) {
            m.running = m.running.saturating_sub(1);
        }
        if let Some(h) = self.state.hosts.get_mut(&instance.host) {
            h.running = h.running.saturating_sub(1);
        }

        let marked_dead = matches!(instance.state, InstanceState::Failed | InstanceState::Closing);
        let outcome = if success && !marked_dead {
            JobOutcome::Succeeded
        } else {
            JobOutcome::Failed
        };
        if let Some(job) = self.state.jobs.get_mut(instance.job) {
            job.instance = None;
            job.status = match outcome {
                JobOutcome::Succeeded => JobStatus::Succeeded,
                JobOutcome::Failed => JobStatus::Failed,
            };
            if outcome == JobOutcome::Failed && job.message.is_empty() {
                job.message = "worker exited with failure".to_string();
            }
            self.finish_job(instance.job, outcome).await;
        } else {
            debug!(pid, job = instance.job, "reaped instance for unknown job");
        }
        Ok(())
    }

    fn agent_status(&mut self, pid: u32, line: StatusLine) {
        let Some(instance) = self.state.agents.instance_mut(pid) else {
            warn!(pid, "status line from unknown pid");
            return;
        };
        instance.touch();
        if instance.state == InstanceState::Starting {
            instance.state = InstanceState::Running;
        }
        match &line.tag {
            StatusTag::Heart => {
                debug!(pid, items = line.value, "heartbeat")
            }
            StatusTag::Items => debug!(pid, items = line.value, of = ?line.extra, "progress"),
            StatusTag::Memory => debug!(pid, kbytes = line.value, "memory report"),
            StatusTag::Other(tag) => debug!(pid, %tag, value = line.value, "status"),
        }
    }

    /// Begin shutdown. Graceful: stop admitting, let running work drain.
    /// Forced: additionally kill every non-NOKILL worker.
    async fn close(&mut self, force: bool) -> Result<()> {
        info!(force, "beginning shutdown");
        self.state.closing = true;

        // work that never started goes back to the store untouched
        if let Some(held) = self.state.held.take() {
            self.state.jobs.remove(held.job);
            if let Err(e) = self.store.job_returned(held.job).await {
                warn!(job = held.job, error = %e, "store rejected job return");
            }
        }
        for id in self.state.jobs.drain_pending() {
            debug!(job = id, "returning unstarted job");
            if let Err(e) = self.store.job_returned(id).await {
                warn!(job = id, error = %e, "store rejected job return");
            }
        }

        if force {
            self.kill_sweep();
        }
        Ok(())
    }

    /// Forced-terminate every tracked instance, except NOKILL types
    /// which are left to finish on their own.
    fn kill_sweep(&mut self) {
        let instances: Vec<(u32, String)> = self
            .state
            .agents
            .instances()
            .map(|i| (i.pid, i.agent.clone()))
            .collect();
        for (pid, agent) in instances {
            let no_kill = self
                .state
                .agents
                .meta(&agent)
                .map(|m| m.special.no_kill)
                .unwrap_or(false);
            if no_kill {
                info!(pid, %agent, "NOKILL agent left to terminate on its own");
                continue;
            }
            if let Some(instance) = self.state.agents.instance_mut(pid) {
                instance.state = InstanceState::Closing;
            }
            signal_process(pid, true);
        }
    }

    /// Synchronous configuration reload. An unreadable config is fatal;
    /// a store that will not reconnect is logged and retried at the
    /// next reload.
    async fn reload(&mut self) -> Result<()> {
        info!("reloading configuration");
        let config = self.source.load()?;
        match self.apply_config(config).await {
            Ok(()) => Ok(()),
            Err(SchedError::Store(e)) => {
                error!(error = %e, "store reconnect failed, keeping previous connection");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Clear and repopulate the registries, then re-derive everything
    /// that hangs off the configuration.
    async fn apply_config(&mut self, config: SchedulerConfig) -> Result<()> {
        self.state.hosts.clear();
        self.state.agents.clear_metas();
        for (name, entry) in &config.hosts {
            self.state.hosts.insert(Host::from_entry(name, entry));
        }
        for (name, entry) in &config.agents {
            self.state.agents.insert_meta(MetaAgent::from_entry(name, entry));
        }

        // instances launched before the reload keep running; recount
        // them against the fresh registries where their bindings still
        // exist
        let live: Vec<(String, String)> = self
            .state
            .agents
            .instances()
            .map(|i| (i.agent.clone(), i.host.clone()))
            .collect();
        for (agent, host) in live {
            if let Some(m) = self.state.agents.meta_mut(&agent) {
                m.running += 1;
            }
            if let Some(h) = self.state.hosts.get_mut(&host) {
                h.running += 1;
            }
        }

        self.executor.set_log_dir(config.daemon.log_dir.clone());
        self.notifier.reload(&config);
        self.store.connect().await?;
        // back to the startup state: the first idle tick after a
        // (re)load asks the store for work immediately instead of
        // waiting out the periodic refresh
        self.state.startup = true;
        info!(
            hosts = self.state.hosts.len(),
            agents = self.state.agents.meta_names().len(),
            "configuration applied"
        );
        self.config = config;
        Ok(())
    }

    /// Pull newly created jobs from the store into the pending queue.
    async fn refresh_jobs(&mut self) -> Result<()> {
        if self.state.closing {
            return Ok(());
        }
        let specs = match self.store.fetch_pending().await {
            Ok(specs) => specs,
            Err(e) => {
                warn!(error = %e, "store refresh failed");
                return Ok(());
            }
        };
        for spec in specs {
            let id = spec.id;
            if self.state.jobs.enqueue(Job::from_spec(spec)) {
                debug!(job = id, "queued job");
            }
        }
        Ok(())
    }

    /// Mark instances silent past the staleness threshold unresponsive
    /// and force-terminate them (NOKILL types are only reported).
    fn refresh_agents(&mut self) {
        let stale_after = self.config.stale_after();
        let stale: Vec<(u32, String, JobId)> = self
            .state
            .agents
            .instances()
            .filter(|i| {
                matches!(
                    i.state,
                    InstanceState::Starting | InstanceState::Running | InstanceState::Paused
                ) && i.silent_for() > stale_after
            })
            .map(|i| (i.pid, i.agent.clone(), i.job))
            .collect();

        for (pid, agent, job) in stale {
            warn!(pid, %agent, job, "agent unresponsive");
            let no_kill = self
                .state
                .agents
                .meta(&agent)
                .map(|m| m.special.no_kill)
                .unwrap_or(false);
            if no_kill {
                // reported only; a NOKILL worker that still manages a
                // clean exit keeps its result
                continue;
            }
            if let Some(j) = self.state.jobs.get_mut(job) {
                if j.message.is_empty() {
                    j.message = "agent unresponsive".to_string();
                }
            }
            if let Some(instance) = self.state.agents.instance_mut(pid) {
                instance.state = InstanceState::Failed;
            }
            signal_process(pid, true);
        }
    }

    /// Execute one client command and build its textual reply.
    async fn run_command(&mut self, command: Command) -> Result<String> {
        debug!(?command, "interface command");
        Ok(match command {
            Command::Stop => {
                self.close(false).await?;
                "stopping scheduler".to_string()
            }
            Command::Quit => {
                self.close(true).await?;
                "quitting scheduler".to_string()
            }
            Command::Pause => {
                self.state.paused = true;
                "paused".to_string()
            }
            Command::Start => {
                self.state.paused = false;
                "started".to_string()
            }
            Command::Reload => {
                self.reload().await?;
                "reloaded".to_string()
            }
            Command::Verbose(level) => {
                self.verbosity = level;
                info!(level, "verbosity changed");
                format!("verbose {}", level)
            }
            Command::Status { job: None } => self.status_summary(),
            Command::Status { job: Some(id) } => match self.state.jobs.get(id) {
                Some(job) => job_line(job),
                None => format!("err: job {} not found", id),
            },
            Command::Agents => {
                let mut out = String::new();
                for name in self.state.agents.meta_names() {
                    if let Some(m) = self.state.agents.meta(name) {
                        let _ = writeln!(
                            out,
                            "agent {} max={} running={}{}{}{}{}",
                            m.name,
                            m.max_run,
                            m.running,
                            flag(m.special.exclusive, " EXCLUSIVE"),
                            flag(m.special.no_email, " NOEMAIL"),
                            flag(m.special.no_kill, " NOKILL"),
                            flag(m.special.local_only, " LOCAL"),
                        );
                    }
                }
                out
            }
            Command::Hosts | Command::Load => {
                let mut out = String::new();
                for name in self.state.hosts.names() {
                    if let Some(h) = self.state.hosts.get(name) {
                        let _ = writeln!(
                            out,
                            "host {} address={} running={}/{}",
                            h.name, h.address, h.running, h.max
                        );
                    }
                }
                out
            }
            Command::Kill { job, reason } => self.kill_job(job, &reason).await,
        })
    }

    async fn kill_job(&mut self, job_id: JobId, reason: &str) -> String {
        let Some(job) = self.state.jobs.get(job_id) else {
            return format!("err: job {} not found", job_id);
        };
        match job.status {
            JobStatus::Pending => {
                self.fail_job(job_id, reason).await;
                format!("job {} killed", job_id)
            }
            JobStatus::Running => {
                if let Some(j) = self.state.jobs.get_mut(job_id) {
                    j.message = reason.to_string();
                }
                if let Some(instance) = self.state.agents.instance_for_job(job_id) {
                    let pid = instance.pid;
                    if let Some(i) = self.state.agents.instance_mut(pid) {
                        i.state = InstanceState::Closing;
                    }
                    signal_process(pid, false);
                    format!("job {} signalled", job_id)
                } else {
                    // running job with no instance should not happen
                    self.fail_job(job_id, reason).await;
                    format!("job {} killed", job_id)
                }
            }
            _ => format!("err: job {} already finished", job_id),
        }
    }

    fn status_summary(&self) -> String {
        let s = &self.state;
        let mut out = format!(
            "scheduler pause={} closing={} lockout={} daemon={} verbose={} pending={} running={} instances={}\n",
            s.paused,
            s.closing,
            s.lockout,
            self.daemonized,
            self.verbosity,
            s.jobs.pending(),
            s.jobs.running(),
            s.agents.instance_count(),
        );
        for job in s.jobs.all() {
            let _ = writeln!(out, "{}", job_line(job));
        }
        out
    }
}

fn job_line(job: &Job) -> String {
    let mut line = format!("job {} agent={} status={}", job.id, job.agent, job.status);
    if let Some(host) = &job.required_host {
        let _ = write!(line, " host={}", host);
    }
    if let Some(pid) = job.instance {
        let _ = write!(line, " pid={}", pid);
    }
    if !job.message.is_empty() {
        let _ = write!(line, " message={:?}", job.message);
    }
    line
}

fn flag(set: bool, label: &str) -> &str {
    if set {
        label
    } else {
        ""
    }
}
