//! Stdio control channel between the arbiter and a worker process
//!
//! One JSON object per line. The worker writes [`WorkerEvent`]s to stdout, the
//! parent writes [`ControlCommand`]s to the worker's stdin. Logs go to stderr so
//! they never interleave with control messages.
//!
//! `bound` carries the mount path and function list the worker serves, so the
//! parent can check it is serving the tree it was asked to. `kill` relays a
//! callable's request to kill another instance up to the parent's arbiter.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, Lines};
use tracing::debug;

use crate::errors::BackendError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum WorkerEvent {
    Bound {
        address: SocketAddr,
        pid: u32,
        path: String,
        functions: Vec<String>,
    },
    Kill {
        mid: String,
    },
    Pong,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum ControlCommand {
    Stop,
    Ping,
}

/// Writes one event line and flushes.
pub async fn write_event<W>(writer: &mut W, event: &WorkerEvent) -> Result<(), BackendError>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(event)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

pub fn parse_command(line: &str) -> Option<ControlCommand> {
    serde_json::from_str(line.trim()).ok()
}

pub async fn send_command<W>(writer: &mut W, command: ControlCommand) -> Result<(), BackendError>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(&command)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Next event from the worker, skipping lines that are not control messages.
/// `None` means the worker closed its stdout.
pub async fn next_event<R>(lines: &mut Lines<R>) -> Result<Option<WorkerEvent>, BackendError>
where
    R: AsyncBufRead + Unpin,
{
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(event) => return Ok(Some(event)),
            Err(_) => debug!(line = %line, "ignoring non-control output from worker"),
        }
    }
    Ok(None)
}
