use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use crate::error::{Result, SchedError};
use crate::events::Event;
use crate::scheduler::{Host, Job, MetaAgent};

/// Category of a worker status report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusTag {
    /// Heartbeat; payload is items processed so far.
    Heart,
    /// Progress report.
    Items,
    /// Memory usage report.
    Memory,
    /// Well-formed but unrecognised tag; logged and kept for liveness.
    Other(String),
}

/// One parsed worker status line, `TAG: number [number]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub tag: StatusTag,
    pub value: u64,
    pub extra: Option<u64>,
}

/// Parse a line of the worker status grammar:
/// one or more capital letters, a colon, whitespace, a number, and an
/// optional second number.
///
/// `HEART: 42` and `ITEMS: 42 7` match; `HEART:` and `heart: 1` do not.
pub fn parse_status_line(line: &str) -> Result<StatusLine> {
    let malformed = || SchedError::Protocol(format!("malformed status line: {:?}", line));

    let (tag, rest) = line.split_once(':').ok_or_else(malformed)?;
    if tag.is_empty() || !tag.chars().all(|c| c.is_ascii_uppercase()) {
        return Err(malformed());
    }
    if !rest.starts_with([' ', '\t']) {
        return Err(malformed());
    }

    let mut numbers = rest.split_ascii_whitespace();
    let value: u64 = numbers
        .next()
        .and_then(|n| n.parse().ok())
        .ok_or_else(malformed)?;
    let extra = match numbers.next() {
        Some(n) => Some(n.parse().map_err(|_| malformed())?),
        None => None,
    };
    if numbers.next().is_some() {
        return Err(malformed());
    }

    let tag = match tag {
        "HEART" => StatusTag::Heart,
        "ITEMS" => StatusTag::Items,
        "MEM" => StatusTag::Memory,
        other => StatusTag::Other(other.to_string()),
    };
    Ok(StatusLine { tag, value, extra })
}

/// Send a graceful (SIGTERM) or forced (SIGKILL) signal to a process.
/// Failures are logged; a vanished pid is not an error worth surfacing.
pub fn signal_process(pid: u32, force: bool) {
    let sig = if force { "-KILL" } else { "-TERM" };
    let result = std::process::Command::new("kill")
        .args([sig, &pid.to_string()])
        .status();
    match result {
        Ok(status) if status.success() => {}
        Ok(status) => warn!(pid, %sig, ?status, "kill exited non-zero"),
        Err(e) => warn!(pid, %sig, error = %e, "failed to run kill"),
    }
}

/// Spawns worker processes and feeds their output and exits back into
/// the event loop as events.
pub struct Executor {
    events: UnboundedSender<Event>,
    log_dir: PathBuf,
}

impl Executor {
    pub fn new(events: UnboundedSender<Event>, log_dir: PathBuf) -> Self {
        Self { events, log_dir }
    }

    pub fn set_log_dir(&mut self, log_dir: PathBuf) {
        self.log_dir = log_dir;
    }

    /// Spawn a worker for `job` on `host` and return its pid.
    ///
    /// Stdout is read line by line; well-formed status lines become
    /// [`Event::AgentStatus`], malformed ones are logged and discarded.
    /// The exit becomes one [`Event::AgentExited`].
    pub fn spawn_worker(&self, job: &Job, meta: &MetaAgent, host: &Host) -> Result<u32> {
        let mut command = self.build_command(job, meta, host);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(self.stderr_sink(job))
            .kill_on_drop(false);

        let mut child = command.spawn().map_err(|e| SchedError::Spawn {
            agent: meta.name.clone(),
            source: e,
        })?;
        let pid = child.id().ok_or_else(|| SchedError::Spawn {
            agent: meta.name.clone(),
            source: std::io::Error::other("pid unavailable after spawn"),
        })?;
        debug!(pid, job = job.id, agent = %meta.name, host = %host.name, "spawned worker");

        if let Some(stdout) = child.stdout.take() {
            let events = self.events.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    match parse_status_line(&line) {
                        Ok(parsed) => {
                            if events
                                .send(Event::AgentStatus { pid, line: parsed })
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(e) => warn!(pid, error = %e, "discarding worker output"),
                    }
                }
            });
        }

        let events = self.events.clone();
        tokio::spawn(async move {
            let success = match child.wait().await {
                Ok(status) => status.success(),
                Err(e) => {
                    warn!(pid, error = %e, "wait on worker failed");
                    false
                }
            };
            let _ = events.send(Event::AgentExited { pid, success });
        });

        Ok(pid)
    }

    fn build_command(&self, job: &Job, meta: &MetaAgent, host: &Host) -> Command {
        if host.is_local() {
            let mut cmd = Command::new("sh");
            cmd.args(["-c", &meta.command])
                .current_dir(&host.directory)
                .env("DISPATCHD_JOB_ID", job.id.to_string())
                .env("DISPATCHD_AGENT", &meta.name)
                .env("DISPATCHD_HOST", &host.name);
            cmd
        } else {
            // Remote hosts are reached over ssh; the worker inherits its
            // job binding through the environment prefix.
            let remote = format!(
                "cd {} && DISPATCHD_JOB_ID={} DISPATCHD_AGENT={} DISPATCHD_HOST={} {}",
                host.directory.display(),
                job.id,
                meta.name,
                host.name,
                meta.command
            );
            let mut cmd = Command::new("ssh");
            cmd.arg(&host.address).arg(remote);
            cmd
        }
    }

    fn stderr_sink(&self, job: &Job) -> Stdio {
        let path = self.log_dir.join(format!("job-{}.log", job.id));
        match std::fs::File::create(&path) {
            Ok(file) => Stdio::from(file),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot open job log, discarding stderr");
                Stdio::null()
            }
        }
    }
}
