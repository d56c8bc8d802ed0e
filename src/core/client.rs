/// Command relay: the client side of the control protocol
///
/// Writes one command line, then streams the server's log output to
/// stdout until the server closes, buffering everything for callers
/// that inspect it (the healthcheck exit status). Ctrl-c does not stop
/// the stream: the server-side operation keeps running, so the relay
/// sends the interrupt command on a second connection and keeps
/// reading the original stream to completion.

use std::io::Write as _;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::warn;

use crate::utils::constants::{CONTROL_ADDR, HEALTHCHECK_PASS_MARKER};

pub async fn send_command(
    command: &str,
    interrupt: Option<&str>,
    silent: bool,
) -> Result<String> {
    if !silent {
        println!("Started command {command}, streaming logs...");
    }
    let mut stream = TcpStream::connect(CONTROL_ADDR)
        .await
        .with_context(|| format!("failed to connect to control server at {CONTROL_ADDR}"))?;
    stream
        .write_all(format!("{command}\n").as_bytes())
        .await
        .context("failed to send command")?;

    let mut buffer = String::new();
    let mut chunk = [0u8; 1024];
    let mut interrupt_pending = interrupt;
    loop {
        tokio::select! {
            read = stream.read(&mut chunk) => {
                let n = read.context("failed to read log stream")?;
                if n == 0 {
                    break;
                }
                let text = String::from_utf8_lossy(&chunk[..n]);
                if !silent {
                    print!("{text}");
                    let _ = std::io::stdout().flush();
                }
                buffer.push_str(&text);
            }
            _ = tokio::signal::ctrl_c(), if interrupt_pending.is_some() => {
                let interrupt_command = interrupt_pending.take().unwrap_or_default();
                warn!("Interrupted; asking the server to cancel");
                if let Err(err) = send_interrupt(interrupt_command).await {
                    warn!("Failed to send {interrupt_command}: {err:#}");
                }
                // Keep reading: the server-side operation is still
                // winding down and its logs tell us how that went.
            }
        }
    }
    Ok(buffer)
}

async fn send_interrupt(command: &str) -> Result<()> {
    let mut stream = TcpStream::connect(CONTROL_ADDR)
        .await
        .context("failed to open interrupt connection")?;
    stream
        .write_all(format!("{command}\n").as_bytes())
        .await
        .context("failed to send interrupt command")?;
    stream.shutdown().await.ok();
    Ok(())
}

/// Whether the streamed output carries the healthcheck pass marker.
pub fn contains_pass_marker(buffer: &str) -> bool {
    buffer
        .lines()
        .any(|line| line.contains(HEALTHCHECK_PASS_MARKER))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pass_marker_found_in_record_line() {
        let buffer = "INFO:volback.core.server:Backup requested\n\
                      INFO:volback.core.server:Healthcheck passed\n";
        assert!(contains_pass_marker(buffer));
    }

    #[test]
    fn test_pass_marker_absent_means_failure() {
        let buffer = "ERROR:volback.core.tasks:Healthcheck failed: leftover runner\n";
        assert!(!contains_pass_marker(buffer));
    }

    #[test]
    fn test_pass_marker_on_empty_stream() {
        assert!(!contains_pass_marker(""));
    }
}
