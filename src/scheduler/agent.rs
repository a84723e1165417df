use std::collections::HashMap;
use std::time::Instant;

use crate::config::AgentEntry;
use crate::store::JobId;

/// Special behaviour flags an agent type may carry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpecialFlags {
    /// Only one instance of any agent may run system-wide while this
    /// type executes.
    pub exclusive: bool,
    /// Completion of this type's jobs is not mailed out.
    pub no_email: bool,
    /// Exempt from forced-termination sweeps.
    pub no_kill: bool,
    /// Must run on the local host only.
    pub local_only: bool,
}

impl SpecialFlags {
    pub fn parse(flags: &[String]) -> Self {
        let mut out = Self::default();
        for flag in flags {
            match flag.as_str() {
                "EXCLUSIVE" => out.exclusive = true,
                "NOEMAIL" => out.no_email = true,
                "NOKILL" => out.no_kill = true,
                "LOCAL" => out.local_only = true,
                // config validation rejects anything else
                _ => {}
            }
        }
        out
    }
}

/// Template describing how to run one class of worker.
#[derive(Debug, Clone)]
pub struct MetaAgent {
    pub name: String,
    pub command: String,
    pub max_run: u32,
    pub running: u32,
    pub special: SpecialFlags,
}

impl MetaAgent {
    pub fn from_entry(name: &str, entry: &AgentEntry) -> Self {
        Self {
            name: name.to_string(),
            command: entry.command.clone(),
            max_run: entry.max,
            running: 0,
            special: SpecialFlags::parse(&entry.special),
        }
    }

    pub fn at_limit(&self) -> bool {
        self.running >= self.max_run
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Starting,
    Running,
    Paused,
    Closing,
    Failed,
    Completed,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceState::Starting => write!(f, "starting"),
            InstanceState::Running => write!(f, "running"),
            InstanceState::Paused => write!(f, "paused"),
            InstanceState::Closing => write!(f, "closing"),
            InstanceState::Failed => write!(f, "failed"),
            InstanceState::Completed => write!(f, "completed"),
        }
    }
}

/// A live worker process bound to a job and host.
///
/// The agent/host are held by name: a configuration reload may replace
/// the registries underneath a running instance, which then keeps its
/// last-known binding until it is reaped.
#[derive(Debug, Clone)]
pub struct AgentInstance {
    pub pid: u32,
    pub agent: String,
    pub job: JobId,
    pub host: String,
    pub state: InstanceState,
    pub last_activity: Instant,
}

impl AgentInstance {
    pub fn new(pid: u32, agent: &str, job: JobId, host: &str) -> Self {
        Self {
            pid,
            agent: agent.to_string(),
            job,
            host: host.to_string(),
            state: InstanceState::Starting,
            last_activity: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn silent_for(&self) -> std::time::Duration {
        self.last_activity.elapsed()
    }
}

/// Agent types keyed by name and live instances keyed by pid.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    metas: HashMap<String, MetaAgent>,
    instances: HashMap<u32, AgentInstance>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace an agent type. Replacement resets its running
    /// count; live instances are untouched.
    pub fn insert_meta(&mut self, meta: MetaAgent) {
        self.metas.insert(meta.name.clone(), meta);
    }

    pub fn meta(&self, name: &str) -> Option<&MetaAgent> {
        self.metas.get(name)
    }

    pub fn meta_mut(&mut self, name: &str) -> Option<&mut MetaAgent> {
        self.metas.get_mut(name)
    }

    pub fn meta_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.metas.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn metas(&self) -> impl Iterator<Item = &MetaAgent> {
        self.metas.values()
    }

    /// Cleared before a reload. Instances survive; they are owned by
    /// still-running processes.
    pub fn clear_metas(&mut self) {
        self.metas.clear();
    }

    pub fn register_instance(&mut self, instance: AgentInstance) {
        self.instances.insert(instance.pid, instance);
    }

    pub fn instance(&self, pid: u32) -> Option<&AgentInstance> {
        self.instances.get(&pid)
    }

    pub fn instance_mut(&mut self, pid: u32) -> Option<&mut AgentInstance> {
        self.instances.get_mut(&pid)
    }

    /// Remove the instance the moment its process is reaped.
    pub fn remove_instance(&mut self, pid: u32) -> Option<AgentInstance> {
        self.instances.remove(&pid)
    }

    pub fn instances(&self) -> impl Iterator<Item = &AgentInstance> {
        self.instances.values()
    }

    pub fn instances_mut(&mut self) -> impl Iterator<Item = &mut AgentInstance> {
        self.instances.values_mut()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn instance_for_job(&self, job: JobId) -> Option<&AgentInstance> {
        self.instances.values().find(|i| i.job == job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_special_flags() {
        let flags = SpecialFlags::parse(&[
            "EXCLUSIVE".to_string(),
            "NOKILL".to_string(),
        ]);
        assert!(flags.exclusive);
        assert!(flags.no_kill);
        assert!(!flags.no_email);
        assert!(!flags.local_only);
    }

    #[test]
    fn meta_limit_check() {
        let mut meta = MetaAgent {
            name: "ojo".into(),
            command: "ojo".into(),
            max_run: 2,
            running: 0,
            special: SpecialFlags::default(),
        };
        assert!(!meta.at_limit());
        meta.running = 2;
        assert!(meta.at_limit());
    }

    #[test]
    fn instances_survive_meta_clear() {
        let mut reg = AgentRegistry::new();
        reg.insert_meta(MetaAgent {
            name: "ojo".into(),
            command: "ojo".into(),
            max_run: 1,
            running: 1,
            special: SpecialFlags::default(),
        });
        reg.register_instance(AgentInstance::new(100, "ojo", 1, "local"));

        reg.clear_metas();
        assert!(reg.meta("ojo").is_none());
        assert_eq!(reg.instance_count(), 1);
        assert_eq!(reg.instance(100).unwrap().agent, "ojo");
    }

    #[test]
    fn remove_instance_by_pid() {
        let mut reg = AgentRegistry::new();
        reg.register_instance(AgentInstance::new(100, "ojo", 1, "local"));
        assert!(reg.remove_instance(100).is_some());
        assert!(reg.remove_instance(100).is_none());
    }

    #[test]
    fn finds_instance_for_job() {
        let mut reg = AgentRegistry::new();
        reg.register_instance(AgentInstance::new(100, "ojo", 7, "local"));
        reg.register_instance(AgentInstance::new(101, "ojo", 8, "local"));
        assert_eq!(reg.instance_for_job(8).unwrap().pid, 101);
        assert!(reg.instance_for_job(9).is_none());
    }
}
