//! Worker process supervision: spawning, status-line parsing, signalling.

pub mod executor;

pub use executor::{parse_status_line, signal_process, Executor, StatusLine, StatusTag};
