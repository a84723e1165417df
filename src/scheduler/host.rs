use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use crate::config::{HostEntry, LOCAL_HOST};

/// An execution target with its own concurrency capacity.
#[derive(Debug, Clone)]
pub struct Host {
    pub name: String,
    pub address: String,
    pub directory: PathBuf,
    pub max: u32,
    pub running: u32,
    pub kind: String,
}

impl Host {
    pub fn from_entry(name: &str, entry: &HostEntry) -> Self {
        Self {
            name: name.to_string(),
            address: entry.address.clone(),
            directory: entry.directory.clone(),
            max: entry.max,
            running: 0,
            kind: entry.kind.clone(),
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.running < self.max
    }

    /// Whether workers run here without an ssh hop.
    pub fn is_local(&self) -> bool {
        self.name == LOCAL_HOST || self.address == "localhost" || self.address == "127.0.0.1"
    }
}

/// Tracks execution targets and hands out placement with a rotation rule
/// so no single host is starved by first-fit.
#[derive(Debug, Default)]
pub struct HostRegistry {
    hosts: HashMap<String, Host>,
    /// Placement rotation. A host picked by `next_available` moves to the
    /// back, so repeated placements spread across hosts.
    rotation: VecDeque<String>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a host. Replacement resets its running count.
    pub fn insert(&mut self, host: Host) {
        if !self.rotation.contains(&host.name) {
            self.rotation.push_back(host.name.clone());
        }
        self.hosts.insert(host.name.clone(), host);
    }

    pub fn get(&self, name: &str) -> Option<&Host> {
        self.hosts.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Host> {
        self.hosts.get_mut(name)
    }

    /// Next host with spare capacity, rotating it to the back of the queue.
    pub fn next_available(&mut self) -> Option<String> {
        for _ in 0..self.rotation.len() {
            let name = self.rotation.pop_front()?;
            self.rotation.push_back(name.clone());
            if let Some(host) = self.hosts.get(&name) {
                if host.has_capacity() {
                    return Some(name);
                }
            }
        }
        None
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.hosts.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = &Host> {
        self.hosts.values()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Used before a configuration reload; no incremental diff.
    pub fn clear(&mut self) {
        self.hosts.clear();
        self.rotation.clear();
    }
}
