use tokio::sync::oneshot;

use crate::interface::Command;
use crate::worker::StatusLine;

/// Everything the event loop reacts to. One event is handled to
/// completion before the next, and the scheduling tick runs after each.
#[derive(Debug)]
pub enum Event {
    /// A child-death signal arrived; exits themselves are delivered as
    /// [`Event::AgentExited`], this just forces a prompt tick.
    ReapCheck,
    /// A worker process exited.
    AgentExited { pid: u32, success: bool },
    /// A worker produced a well-formed status line.
    AgentStatus { pid: u32, line: StatusLine },
    /// Begin graceful (`force = false`) or forced shutdown.
    Close { force: bool },
    /// Reload configuration from the source.
    Reload,
    /// Periodic check for unresponsive agents.
    RefreshAgents,
    /// Ask the store for newly created jobs.
    RefreshJobs,
    /// A client command; the textual reply goes back through `reply`.
    Command {
        command: Command,
        reply: oneshot::Sender<String>,
    },
}
