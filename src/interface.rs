//! The client command interface.
//!
//! External presentation layers (CLI, UI) connect over TCP and speak a
//! line-oriented protocol: `word [integer] [integer|"quoted string"]`.
//! Each command is forwarded into the event loop and answered with one
//! or more reply lines followed by a lone `end` line. `close` ends the
//! connection without involving the scheduler.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc::UnboundedSender, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, SchedError};
use crate::events::Event;
use crate::store::JobId;

/// A parsed client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Graceful shutdown: stop admitting, drain running work.
    Stop,
    /// Forced shutdown: kill running workers (NOKILL types excepted).
    Quit,
    Pause,
    Start,
    Reload,
    /// Scheduler summary, or one job's status when an id is given.
    Status { job: Option<JobId> },
    Agents,
    Hosts,
    Load,
    Verbose(i64),
    /// Fail a job with a reason, killing its worker if one is running.
    Kill { job: JobId, reason: String },
}

#[derive(Debug, PartialEq, Eq)]
enum Arg {
    Int(i64),
    Str(String),
}

/// Tokenize one protocol line: a word, an optional integer, and an
/// optional integer-or-quoted-string.
fn tokenize(line: &str) -> Result<(String, Option<i64>, Option<Arg>)> {
    let bad = |what: &str| SchedError::Protocol(format!("{}: {:?}", what, line));

    let mut rest = line.trim();
    let word_end = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(rest.len());
    if word_end == 0 {
        return Err(bad("expected command word"));
    }
    let word = rest[..word_end].to_string();
    rest = rest[word_end..].trim_start();

    let mut num = None;
    if !rest.is_empty() && !rest.starts_with('"') {
        let tok_end = rest
            .find(char::is_whitespace)
            .unwrap_or(rest.len());
        num = Some(
            rest[..tok_end]
                .parse::<i64>()
                .map_err(|_| bad("expected integer argument"))?,
        );
        rest = rest[tok_end..].trim_start();
    }

    let mut arg = None;
    if !rest.is_empty() {
        if let Some(quoted) = rest.strip_prefix('"') {
            let close = quoted.find('"').ok_or_else(|| bad("unterminated string"))?;
            arg = Some(Arg::Str(quoted[..close].to_string()));
            rest = quoted[close + 1..].trim_start();
        } else {
            let tok_end = rest
                .find(char::is_whitespace)
                .unwrap_or(rest.len());
            arg = Some(Arg::Int(
                rest[..tok_end]
                    .parse::<i64>()
                    .map_err(|_| bad("expected integer or quoted string"))?,
            ));
            rest = rest[tok_end..].trim_start();
        }
    }

    if !rest.is_empty() {
        return Err(bad("trailing input"));
    }
    Ok((word, num, arg))
}

/// Parse one line into a typed [`Command`].
pub fn parse_command(line: &str) -> Result<Command> {
    let (word, num, arg) = tokenize(line)?;
    let bare = |cmd: Command| -> Result<Command> {
        if num.is_some() || arg.is_some() {
            Err(SchedError::Protocol(format!(
                "{} takes no arguments",
                word
            )))
        } else {
            Ok(cmd)
        }
    };

    match word.as_str() {
        "stop" => bare(Command::Stop),
        "quit" | "die" => bare(Command::Quit),
        "pause" => bare(Command::Pause),
        "start" => bare(Command::Start),
        "reload" => bare(Command::Reload),
        "agents" => bare(Command::Agents),
        "hosts" => bare(Command::Hosts),
        "load" => bare(Command::Load),
        "status" => match arg {
            None => Ok(Command::Status { job: num }),
            Some(_) => Err(SchedError::Protocol(
                "status takes an optional job id only".into(),
            )),
        },
        "verbose" => match (num, arg) {
            (Some(level), None) => Ok(Command::Verbose(level)),
            _ => Err(SchedError::Protocol("usage: verbose <level>".into())),
        },
        "kill" => match (num, arg) {
            (Some(job), Some(Arg::Str(reason))) => Ok(Command::Kill { job, reason }),
            _ => Err(SchedError::Protocol(
                "usage: kill <job> \"<reason>\"".into(),
            )),
        },
        other => Err(SchedError::Protocol(format!("unknown command: {}", other))),
    }
}

/// Accept client connections until cancelled.
pub async fn listen(
    listener: TcpListener,
    events: UnboundedSender<Event>,
    cancel: CancellationToken,
) {
    info!(addr = ?listener.local_addr().ok(), "interface listening");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "client connected");
                    let events = events.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, events, cancel).await {
                            debug!(%peer, error = %e, "client connection ended");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "accept failed"),
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    events: UnboundedSender<Event>,
    cancel: CancellationToken,
) -> Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        if line.trim() == "close" {
            write.write_all(b"closing\nend\n").await?;
            break;
        }

        let reply = match parse_command(&line) {
            Err(e) => format!("err: {}", e),
            Ok(command) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                if events
                    .send(Event::Command {
                        command,
                        reply: reply_tx,
                    })
                    .is_err()
                {
                    // event loop has terminated
                    break;
                }
                match reply_rx.await {
                    Ok(reply) => reply,
                    Err(_) => break,
                }
            }
        };

        write.write_all(reply.as_bytes()).await?;
        if !reply.ends_with('\n') {
            write.write_all(b"\n").await?;
        }
        write.write_all(b"end\n").await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_words() {
        assert_eq!(parse_command("stop").unwrap(), Command::Stop);
        assert_eq!(parse_command("  pause  ").unwrap(), Command::Pause);
        assert_eq!(parse_command("die").unwrap(), Command::Quit);
        assert_eq!(parse_command("reload").unwrap(), Command::Reload);
    }

    #[test]
    fn parses_status_with_and_without_job() {
        assert_eq!(
            parse_command("status").unwrap(),
            Command::Status { job: None }
        );
        assert_eq!(
            parse_command("status 12").unwrap(),
            Command::Status { job: Some(12) }
        );
    }

    #[test]
    fn parses_kill_with_reason() {
        assert_eq!(
            parse_command("kill 10 \"hello world\"").unwrap(),
            Command::Kill {
                job: 10,
                reason: "hello world".into()
            }
        );
    }

    #[test]
    fn parses_verbose_level() {
        assert_eq!(parse_command("verbose 3").unwrap(), Command::Verbose(3));
    }

    #[test]
    fn rejects_malformed_commands() {
        for bad in [
            "",
            "   ",
            "pause 10 10",
            "kill \"hello world\" 10",
            "kill 10",
            "verbose",
            "frobnicate",
            "status 1 2",
            "kill 10 \"unterminated",
            "stop now",
        ] {
            assert!(
                matches!(parse_command(bad), Err(SchedError::Protocol(_))),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn tokenizer_handles_negative_numbers() {
        let (word, num, arg) = tokenize("status -1").unwrap();
        assert_eq!(word, "status");
        assert_eq!(num, Some(-1));
        assert_eq!(arg, None);
    }
}
