//! dispatchd: a job scheduling daemon.
//!
//! A single event loop owns all scheduler state; signals, worker
//! processes and client connections feed it through one typed event
//! queue. The scheduling pass itself is a pure function over that
//! state, so placement policy is testable without any processes.

pub mod config;
pub mod daemon;
pub mod error;
pub mod events;
pub mod interface;
pub mod notify;
pub mod scheduler;
pub mod signals;
pub mod store;
pub mod worker;

pub use config::{ConfigSource, FileSource, SchedulerConfig};
pub use daemon::Daemon;
pub use error::{Result, SchedError};
pub use events::Event;
