use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing_subscriber::EnvFilter;

use dispatchd::config::FileSource;
use dispatchd::notify::LogNotifier;
use dispatchd::store::MemoryStore;
use dispatchd::Daemon;

#[derive(Parser, Debug)]
#[command(name = "dispatchd")]
#[command(version)]
#[command(about = "A job scheduling daemon for agent pipelines")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the scheduler daemon
    Daemon(DaemonArgs),

    /// Send one command to a running scheduler
    Cmd {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: CmdCommands,
    },
}

// =============================================================================
// Daemon Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct DaemonArgs {
    /// Path to the scheduler configuration file
    #[arg(long, short = 'c', default_value = "/etc/dispatchd/dispatchd.toml")]
    config: PathBuf,

    /// Port for the client interface (overrides the configuration)
    #[arg(long)]
    port: Option<u16>,

    /// Mark the process as daemonized (affects status reporting only;
    /// detaching is left to the init system)
    #[arg(long)]
    daemon: bool,
}

// =============================================================================
// Client Arguments (shared by all remote commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Scheduler interface address
    #[arg(long, short = 'a', default_value = "127.0.0.1:5555")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Remote Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum CmdCommands {
    /// Scheduler summary, or one job's status
    Status {
        /// Job id to query
        job: Option<i64>,
    },
    /// Stop admitting new jobs
    Pause,
    /// Resume admitting jobs
    Start,
    /// Graceful shutdown: running work drains first
    Stop,
    /// Forced shutdown: running workers are killed
    Quit,
    /// Reload the scheduler configuration
    Reload,
    /// List configured agent types
    Agents,
    /// List configured hosts
    Hosts,
    /// Show per-host load
    Load,
    /// Change the scheduler's verbosity level
    Verbose {
        level: i64,
    },
    /// Fail a job, killing its worker if one is running
    Kill {
        job: i64,
        reason: String,
    },
}

impl CmdCommands {
    /// Render as one protocol line.
    fn to_wire(&self) -> String {
        match self {
            CmdCommands::Status { job: None } => "status".to_string(),
            CmdCommands::Status { job: Some(id) } => format!("status {}", id),
            CmdCommands::Pause => "pause".to_string(),
            CmdCommands::Start => "start".to_string(),
            CmdCommands::Stop => "stop".to_string(),
            CmdCommands::Quit => "quit".to_string(),
            CmdCommands::Reload => "reload".to_string(),
            CmdCommands::Agents => "agents".to_string(),
            CmdCommands::Hosts => "hosts".to_string(),
            CmdCommands::Load => "load".to_string(),
            CmdCommands::Verbose { level } => format!("verbose {}", level),
            CmdCommands::Kill { job, reason } => {
                // the wire grammar has no escape sequences; a quote in
                // the reason would end the string early
                format!("kill {} \"{}\"", job, reason.replace('"', "'"))
            }
        }
    }
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct CommandOutput {
    command: String,
    ok: bool,
    lines: Vec<String>,
}

// =============================================================================
// Daemon Entry
// =============================================================================

async fn run_daemon(args: DaemonArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(config = %args.config.display(), "starting dispatchd");

    let daemon = Daemon::new(
        Box::new(FileSource::new(&args.config)),
        Box::new(MemoryStore::new()),
        Box::new(LogNotifier),
        args.port,
        args.daemon,
    )
    .await?;
    daemon.run().await?;
    Ok(())
}

// =============================================================================
// Client Implementation
// =============================================================================

/// Send one command line and collect reply lines up to the `end` marker.
async fn send_command(addr: &str, line: &str) -> Result<Vec<String>, Box<dyn std::error::Error>> {
    let stream = TcpStream::connect(addr).await?;
    let (read, mut write) = stream.into_split();

    write.write_all(line.as_bytes()).await?;
    write.write_all(b"\n").await?;

    let mut lines = BufReader::new(read).lines();
    let mut reply = Vec::new();
    while let Some(line) = lines.next_line().await? {
        if line == "end" {
            return Ok(reply);
        }
        reply.push(line);
    }
    Err("connection closed before end of reply".into())
}

async fn run_client(
    client: ClientArgs,
    command: CmdCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    let wire = command.to_wire();
    let reply = send_command(&client.addr, &wire).await?;
    let ok = !reply.iter().any(|l| l.starts_with("err:"));

    match client.output {
        OutputFormat::Json => {
            let output = CommandOutput {
                command: wire,
                ok,
                lines: reply,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            for line in &reply {
                println!("{}", line);
            }
        }
    }

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Daemon(daemon_args) => run_daemon(daemon_args).await?,
        Commands::Cmd { client, command } => run_client(client, command).await?,
    }

    Ok(())
}
