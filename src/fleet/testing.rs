//! Scripted in-memory shells for exercising the session protocol, pool and
//! dispatcher without an SSH server.
//!
//! A [`ScriptedWriter`] parses each wrapped command line it receives, asks a
//! responder closure what the "remote" should do, and appends the answer to
//! the shell's output buffer exactly as a PTY would.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::error::FleetError;
use super::pool::ShellConnector;
use super::shell::{OutputBuffer, RemoteShell, ShellWriter};
use super::types::HostDescriptor;

/// What the scripted remote does with one command.
pub(crate) enum Reply {
    /// Print output, then the sentinel with `code`
    Done { output: String, code: i32 },
    /// Print output and never finish
    Partial(String),
    /// Print nothing and never finish
    Silent,
    /// Print output and the sentinel (status 0) after a delay
    Delayed(Duration, String),
    /// Print output and the sentinel with `code` after a delay
    DelayedExit {
        delay: Duration,
        output: String,
        code: i32,
    },
    /// Sentinel with a non-numeric status
    Malformed,
}

impl Reply {
    pub(crate) fn output(output: impl Into<String>) -> Self {
        Reply::Done {
            output: output.into(),
            code: 0,
        }
    }

    pub(crate) fn exit(output: impl Into<String>, code: i32) -> Self {
        Reply::Done {
            output: output.into(),
            code,
        }
    }
}

pub(crate) type Responder = Arc<dyn Fn(&str) -> Reply + Send + Sync>;

pub(crate) struct ScriptedWriter {
    output: OutputBuffer,
    responder: Responder,
    closed: AtomicBool,
}

impl ScriptedWriter {
    fn deliver_later(&self, delay: Duration, text: String) {
        let buffer = self.output.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            buffer.lock().await.extend_from_slice(text.as_bytes());
        });
    }
}

/// Split a wrapped command line into `(command, token head, token tail)`.
fn parse_wrapped(text: &str) -> Option<(String, String, String)> {
    let body = text.strip_prefix("{ ")?;
    let split = body.rfind("\n} 2>&1; printf ")?;
    let quoted: Vec<&str> = body[split..].split('\'').collect();
    Some((
        body[..split].to_string(),
        quoted.get(3)?.to_string(),
        quoted.get(5)?.to_string(),
    ))
}

#[async_trait]
impl ShellWriter for ScriptedWriter {
    async fn write(&self, data: &[u8]) -> Result<(), String> {
        if self.closed.load(Ordering::SeqCst) {
            return Err("channel closed".to_string());
        }

        let text = String::from_utf8_lossy(data).into_owned();
        let Some((command, head, tail)) = parse_wrapped(&text) else {
            return Ok(());
        };
        let marker = |code: &str| format!("\r\n{}{}:{}:END\r\n", head, tail, code);

        match (self.responder)(&command) {
            Reply::Done { output, code } => {
                let text = format!("{}\r\n{}", output, marker(&code.to_string()));
                self.output.lock().await.extend_from_slice(text.as_bytes());
            }
            Reply::Partial(output) => {
                self.output.lock().await.extend_from_slice(output.as_bytes());
            }
            Reply::Silent => {}
            Reply::Delayed(delay, output) => {
                self.deliver_later(delay, format!("{}\r\n{}", output, marker("0")));
            }
            Reply::DelayedExit {
                delay,
                output,
                code,
            } => {
                self.deliver_later(delay, format!("{}\r\n{}", output, marker(&code.to_string())));
            }
            Reply::Malformed => {
                self.output
                    .lock()
                    .await
                    .extend_from_slice(marker("abc").as_bytes());
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), String> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub(crate) fn scripted_shell_with(host: HostDescriptor, responder: Responder) -> RemoteShell {
    let output: OutputBuffer = Arc::new(Mutex::new(Vec::new()));
    let writer = ScriptedWriter {
        output: output.clone(),
        responder,
        closed: AtomicBool::new(false),
    };
    RemoteShell::from_parts(
        host,
        Box::new(writer),
        output,
        Arc::new(AtomicBool::new(false)),
    )
}

pub(crate) fn scripted_shell(
    host: HostDescriptor,
    responder: impl Fn(&str) -> Reply + Send + Sync + 'static,
) -> RemoteShell {
    scripted_shell_with(host, Arc::new(responder))
}

/// Answers `echo <text>` with `<text>`, `exit <n>` with status `n`, and hangs
/// on `sleep`. Anything else is "command not found".
pub(crate) fn echo_responder(command: &str) -> Reply {
    if let Some(text) = command.strip_prefix("echo ") {
        return Reply::output(text);
    }
    if let Some(code) = command.strip_prefix("exit ") {
        return Reply::exit("", code.trim().parse().unwrap_or(1));
    }
    if command.starts_with("sleep") {
        return Reply::Silent;
    }
    Reply::exit(format!("bash: {}: command not found", command), 127)
}

/// Connector that builds scripted shells and counts how often it is asked.
pub(crate) struct ScriptedConnector {
    responder: Responder,
    connects: AtomicUsize,
    delay: Duration,
    unreachable: HashSet<String>,
}

impl ScriptedConnector {
    pub(crate) fn new(responder: impl Fn(&str) -> Reply + Send + Sync + 'static) -> Self {
        Self {
            responder: Arc::new(responder),
            connects: AtomicUsize::new(0),
            delay: Duration::ZERO,
            unreachable: HashSet::new(),
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn with_unreachable(mut self, addresses: &[&str]) -> Self {
        self.unreachable = addresses.iter().map(|a| a.to_string()).collect();
        self
    }

    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ShellConnector for ScriptedConnector {
    async fn connect(&self, host: &HostDescriptor) -> Result<RemoteShell, FleetError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.unreachable.contains(&host.address) {
            return Err(FleetError::Connect(format!(
                "Failed to connect: connection refused ({})",
                host.address
            )));
        }
        Ok(scripted_shell_with(host.clone(), self.responder.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_wrapped_line() {
        let sentinel = crate::fleet::sentinel::Sentinel::from_token("ABCDEF");
        let line = sentinel.wrap("ls -l 'x y'");
        let (command, head, tail) = parse_wrapped(&line).unwrap();
        assert_eq!(command, "ls -l 'x y'");
        assert_eq!(format!("{}{}", head, tail), "ABCDEF");
    }

    #[test]
    fn test_setup_lines_are_ignored() {
        assert!(parse_wrapped("export TERM=xterm\nstty -echo\n").is_none());
    }
}
