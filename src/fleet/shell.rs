//! Persistent interactive shell per host.
//!
//! A [`RemoteShell`] owns one SSH connection and one PTY shell channel. A
//! background reader task appends everything the channel produces to a single
//! output buffer (the PTY merges stdout and stderr). Commands are written to
//! the channel wrapped by a [`Sentinel`] and the buffer is polled until the
//! sentinel shows up, the deadline passes, or the channel closes.
//!
//! Shell state such as the working directory and exported variables survives
//! between calls, which is the reason for keeping one shell alive instead of
//! opening an exec channel per command.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{Handle, Msg};
use russh::{ChannelMsg, ChannelReadHalf, ChannelWriteHalf, Pty};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::client::{self, shell_quote};
use super::config::{
    ConnectSettings, ENV_TIMEOUT, LATE_SENTINEL_GRACE, MAX_CONSECUTIVE_TIMEOUTS, PING_TIMEOUT,
    POLL_INTERVAL, SCRIPT_TIMEOUT, SETUP_SETTLE, SHELL_SETTLE,
};
use super::error::FleetError;
use super::sentinel::{Sentinel, SentinelScan, clean_output};
use super::session::SshClientHandler;
use super::types::{HostDescriptor, ShellState};

/// Shared PTY output buffer (single stream, no stderr separation).
pub type OutputBuffer = Arc<Mutex<Vec<u8>>>;

/// Terminal modes requested with the PTY: no echo, 14400 baud.
const PTY_MODES: &[(Pty, u32)] = &[
    (Pty::ECHO, 0),
    (Pty::TTY_OP_ISPEED, 14400),
    (Pty::TTY_OP_OSPEED, 14400),
];

/// Commands that normalise the remote environment before the first command.
const SETUP_COMMANDS: &[&str] = &[
    "export TERM=xterm",
    "export LANG=en_US.UTF-8",
    "export PS1='' PS2=''",
    "unset PROMPT_COMMAND",
    "stty -echo",
    "unalias ls 2>/dev/null",
];

/// Input side of a shell channel.
#[async_trait]
pub trait ShellWriter: Send + Sync {
    /// Send raw bytes to the shell.
    async fn write(&self, data: &[u8]) -> Result<(), String>;

    /// Close the channel.
    async fn close(&self) -> Result<(), String>;
}

/// Write handle for sending input to a shell channel.
///
/// Wraps `russh::ChannelWriteHalf` so the read half can live in the reader
/// task while commands are written from the executing task.
pub struct ChannelWriter {
    write_half: ChannelWriteHalf<Msg>,
}

impl ChannelWriter {
    pub fn new(write_half: ChannelWriteHalf<Msg>) -> Self {
        Self { write_half }
    }
}

#[async_trait]
impl ShellWriter for ChannelWriter {
    async fn write(&self, data: &[u8]) -> Result<(), String> {
        self.write_half
            .data(data)
            .await
            .map_err(|e| format!("Failed to write to shell: {}", e))
    }

    async fn close(&self) -> Result<(), String> {
        self.write_half
            .close()
            .await
            .map_err(|e| format!("Failed to close shell channel: {}", e))
    }
}

/// One authenticated connection plus one interactive shell.
pub struct RemoteShell {
    id: Uuid,
    host: HostDescriptor,
    state: ShellState,
    writer: Box<dyn ShellWriter>,
    output: OutputBuffer,
    /// Set by the reader task when the channel reports EOF or close
    channel_closed: Arc<AtomicBool>,
    consecutive_timeouts: u32,
    /// Sentinels of timed-out commands whose markers have not arrived yet
    stale: Vec<Sentinel>,
    env_vars: HashMap<String, String>,
    cancel_token: CancellationToken,
    handle: Option<Arc<Handle<SshClientHandler>>>,
}

impl RemoteShell {
    /// Dial `host`, start a PTY shell and normalise its environment.
    pub async fn open(host: &HostDescriptor, settings: &ConnectSettings) -> Result<Self, FleetError> {
        let handle = client::connect(host, settings, true).await?;
        debug!("{} connected, opening shell", host.identity_key());

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| FleetError::Channel(format!("Failed to open channel: {}", e)))?;

        channel
            .request_pty(false, "xterm", 1000, 1000, 0, 0, PTY_MODES)
            .await
            .map_err(|e| FleetError::Channel(format!("Failed to request PTY: {}", e)))?;

        channel
            .request_shell(false)
            .await
            .map_err(|e| FleetError::Channel(format!("Failed to start shell: {}", e)))?;

        let (read_half, write_half) = channel.split();

        let output: OutputBuffer = Arc::new(Mutex::new(Vec::with_capacity(4096)));
        let channel_closed = Arc::new(AtomicBool::new(false));
        let cancel_token = CancellationToken::new();

        tokio::spawn(read_channel(
            read_half,
            output.clone(),
            channel_closed.clone(),
            cancel_token.clone(),
            host.identity_key(),
        ));

        let mut shell = Self {
            id: Uuid::new_v4(),
            host: host.clone(),
            state: ShellState::Connected,
            writer: Box::new(ChannelWriter::new(write_half)),
            output,
            channel_closed,
            consecutive_timeouts: 0,
            stale: Vec::new(),
            env_vars: HashMap::new(),
            cancel_token,
            handle: Some(Arc::new(handle)),
        };

        if let Err(e) = shell.prepare().await {
            shell.close().await;
            return Err(e);
        }

        info!("Shell ready on {}", shell.host.identity_key());
        Ok(shell)
    }

    /// Drop the banner, run the setup commands and drop their output.
    async fn prepare(&mut self) -> Result<(), FleetError> {
        tokio::time::sleep(SHELL_SETTLE).await;
        self.output.lock().await.clear();
        self.state = ShellState::ShellReady;

        let mut setup = SETUP_COMMANDS.join("\n");
        setup.push('\n');
        self.writer
            .write(setup.as_bytes())
            .await
            .map_err(FleetError::Channel)?;

        tokio::time::sleep(SETUP_SETTLE).await;
        self.output.lock().await.clear();

        if self.channel_closed.load(Ordering::SeqCst) {
            self.state = ShellState::Closed;
            return Err(FleetError::Channel(
                "shell exited during setup".to_string(),
            ));
        }

        self.state = ShellState::Idle;
        Ok(())
    }

    /// Assemble a shell from an arbitrary writer and buffer.
    #[cfg(test)]
    pub(crate) fn from_parts(
        host: HostDescriptor,
        writer: Box<dyn ShellWriter>,
        output: OutputBuffer,
        channel_closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            host,
            state: ShellState::Idle,
            writer,
            output,
            channel_closed,
            consecutive_timeouts: 0,
            stale: Vec::new(),
            env_vars: HashMap::new(),
            cancel_token: CancellationToken::new(),
            handle: None,
        }
    }

    /// Instance id, distinct for every shell ever built.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn host(&self) -> &HostDescriptor {
        &self.host
    }

    pub fn identity_key(&self) -> String {
        self.host.identity_key()
    }

    pub fn state(&self) -> ShellState {
        if self.channel_closed.load(Ordering::SeqCst) {
            ShellState::Closed
        } else {
            self.state
        }
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts
    }

    /// A shell is healthy while its channel is open and it has not timed out
    /// twice in a row.
    pub fn is_healthy(&self) -> bool {
        self.state() != ShellState::Closed && self.consecutive_timeouts < MAX_CONSECUTIVE_TIMEOUTS
    }

    /// Run `command` and wait for its sentinel.
    ///
    /// Returns the trimmed combined output on exit status 0. A non-zero status
    /// yields [`FleetError::ExitStatus`]; no sentinel before the deadline
    /// yields [`FleetError::Timeout`] with the partial output, or
    /// [`FleetError::LateTimeout`] when the sentinel lands within the grace
    /// period. None of these close the shell.
    pub async fn execute(&mut self, command: &str, timeout: Duration) -> Result<String, FleetError> {
        if self.state() == ShellState::Closed {
            return Err(FleetError::Closed);
        }

        let sentinel = Sentinel::generate();
        {
            let output = self.output.clone();
            let mut buffer = output.lock().await;
            discard_stale(&mut self.stale, &mut buffer);
            buffer.clear();
        }
        self.state = ShellState::Executing;

        if let Err(e) = self.writer.write(sentinel.wrap(command).as_bytes()).await {
            warn!("Write to {} failed: {}", self.host.identity_key(), e);
            self.state = ShellState::Closed;
            return Err(FleetError::Channel(e));
        }

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(result) = self.check(&sentinel).await {
                return result;
            }
            if self.channel_closed.load(Ordering::SeqCst) {
                self.state = ShellState::Closed;
                return Err(FleetError::Closed);
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }

        let grace_deadline = Instant::now() + LATE_SENTINEL_GRACE;
        while Instant::now() < grace_deadline {
            tokio::time::sleep(POLL_INTERVAL).await;
            if let Some(result) = self.check(&sentinel).await {
                warn!(
                    "Command on {} finished after its {:?} deadline",
                    self.host.identity_key(),
                    timeout
                );
                let (output, code) = match result {
                    Ok(output) => (output, 0),
                    Err(FleetError::ExitStatus { code, output }) => (output, code),
                    Err(e) => return Err(e),
                };
                return Err(FleetError::LateTimeout {
                    timeout,
                    code,
                    output,
                });
            }
        }

        self.consecutive_timeouts += 1;
        self.state = ShellState::Idle;
        self.stale.push(sentinel);
        warn!(
            "Command on {} timed out after {:?} ({} consecutive)",
            self.host.identity_key(),
            timeout,
            self.consecutive_timeouts
        );

        let partial = clean_output(&String::from_utf8_lossy(&self.output.lock().await));
        Err(FleetError::Timeout { timeout, partial })
    }

    /// Scan the buffer once; `Some` when the command has finished.
    async fn check(&mut self, sentinel: &Sentinel) -> Option<Result<String, FleetError>> {
        let scan = {
            let output = self.output.clone();
            let mut buffer = output.lock().await;
            discard_stale(&mut self.stale, &mut buffer);
            sentinel.scan(&String::from_utf8_lossy(&buffer))
        };

        let result = match scan {
            SentinelScan::NotFound | SentinelScan::Incomplete => return None,
            SentinelScan::Complete { output, code: 0 } => Ok(output),
            SentinelScan::Complete { output, code } => Err(FleetError::ExitStatus { code, output }),
            SentinelScan::Malformed(message) => Err(FleetError::MalformedSentinel(message)),
        };

        trace!("Sentinel {} seen on {}", sentinel.token(), self.host.identity_key());
        // The shell runs commands in order, so every earlier command is done.
        self.stale.clear();
        self.consecutive_timeouts = 0;
        self.state = ShellState::Idle;
        Some(result)
    }

    /// Liveness probe: `echo ping` must answer `ping` within two seconds.
    pub async fn ping(&mut self) -> bool {
        match self.execute("echo ping", PING_TIMEOUT).await {
            Ok(output) => output == "ping",
            Err(e) => {
                debug!("Ping to {} failed: {}", self.host.identity_key(), e);
                false
            }
        }
    }

    /// Pipe `content` into `bash` through a quoted heredoc.
    pub async fn execute_script(&mut self, content: &str) -> Result<String, FleetError> {
        let delimiter = format!("FLEET_SCRIPT_{}", Uuid::new_v4().simple());
        let command = format!("bash <<'{delimiter}'\n{content}\n{delimiter}");
        self.execute(&command, SCRIPT_TIMEOUT).await
    }

    /// Export `name=value` in the shell and remember it locally.
    pub async fn set_env(&mut self, name: &str, value: &str) -> Result<(), FleetError> {
        if !is_valid_env_name(name) {
            return Err(FleetError::InvalidName(name.to_string()));
        }
        self.execute(&format!("export {}={}", name, shell_quote(value)), ENV_TIMEOUT)
            .await?;
        self.env_vars.insert(name.to_string(), value.to_string());
        Ok(())
    }

    /// Read `$name` from the shell.
    pub async fn get_env(&mut self, name: &str) -> Result<String, FleetError> {
        if !is_valid_env_name(name) {
            return Err(FleetError::InvalidName(name.to_string()));
        }
        self.execute(&format!("printf '%s' \"${}\"", name), ENV_TIMEOUT)
            .await
    }

    /// Variables exported through [`set_env`](Self::set_env).
    pub fn env_vars(&self) -> &HashMap<String, String> {
        &self.env_vars
    }

    /// Stream `content` to `remote_path` on this host over a side channel.
    pub async fn push_file(
        &self,
        content: &[u8],
        remote_path: &str,
        timeout: Duration,
    ) -> Result<(), FleetError> {
        match &self.handle {
            Some(handle) => client::push_file(handle, content, remote_path, timeout).await,
            None => Err(FleetError::Closed),
        }
    }

    /// Close the channel, then the connection. Safe to call repeatedly.
    pub async fn close(&mut self) {
        if self.cancel_token.is_cancelled() {
            return;
        }
        self.cancel_token.cancel();

        if let Err(e) = self.writer.close().await {
            trace!("{}", e);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "session closed", "en")
                .await;
        }

        self.state = ShellState::Closed;
        debug!("Shell on {} closed", self.host.identity_key());
    }
}

impl Drop for RemoteShell {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Drop everything up to and including the marker of each timed-out command
/// that has finished since, so its late output never reaches a newer result.
fn discard_stale(stale: &mut Vec<Sentinel>, buffer: &mut Vec<u8>) {
    stale.retain(|sentinel| match sentinel.marker_end(buffer) {
        Some(end) => {
            buffer.drain(..end);
            false
        }
        None => true,
    });
}

fn is_valid_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Background reader: append channel output to the buffer until EOF, close
/// or cancellation.
async fn read_channel(
    mut read_half: ChannelReadHalf,
    output: OutputBuffer,
    channel_closed: Arc<AtomicBool>,
    cancel_token: CancellationToken,
    key: String,
) {
    loop {
        tokio::select! {
            biased;

            _ = cancel_token.cancelled() => break,

            msg = read_half.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    output.lock().await.extend_from_slice(&data);
                }
                Some(ChannelMsg::ExtendedData { data, .. }) => {
                    output.lock().await.extend_from_slice(&data);
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                    debug!("Shell channel on {} closed by remote", key);
                    channel_closed.store(true, Ordering::SeqCst);
                    break;
                }
                Some(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::testing::{Reply, scripted_shell};

    fn host() -> HostDescriptor {
        HostDescriptor::new("10.0.0.1", 22, "root", "pw")
    }

    mod execute {
        use super::*;

        #[tokio::test]
        async fn test_success_returns_trimmed_output() {
            let mut shell = scripted_shell(host(), |cmd| match cmd {
                "echo hi" => Reply::output("hi"),
                _ => Reply::Silent,
            });
            let output = shell.execute("echo hi", Duration::from_secs(2)).await;
            assert_eq!(output, Ok("hi".to_string()));
            assert_eq!(shell.state(), ShellState::Idle);
        }

        #[tokio::test]
        async fn test_nonzero_exit_code_is_error() {
            let mut shell = scripted_shell(host(), |_| Reply::exit("boom", 17));
            let err = shell.execute("false", Duration::from_secs(2)).await.unwrap_err();
            assert_eq!(err.exit_code(), Some(17));
            assert_eq!(err.partial_output(), Some("boom"));
            assert!(shell.is_healthy());
        }

        #[tokio::test]
        async fn test_stale_output_never_leaks() {
            let mut shell = scripted_shell(host(), |cmd| match cmd {
                "first" => Reply::output("one"),
                "second" => Reply::output("two"),
                _ => Reply::Silent,
            });
            assert_eq!(shell.execute("first", Duration::from_secs(2)).await.unwrap(), "one");
            assert_eq!(shell.execute("second", Duration::from_secs(2)).await.unwrap(), "two");
        }

        #[tokio::test]
        async fn test_timeout_returns_partial_output_within_grace() {
            let mut shell = scripted_shell(host(), |_| Reply::Partial("half".to_string()));
            let timeout = Duration::from_millis(100);
            let started = Instant::now();
            let err = shell.execute("sleep 100", timeout).await.unwrap_err();
            let elapsed = started.elapsed();

            assert!(matches!(err, FleetError::Timeout { .. }));
            assert_eq!(err.partial_output(), Some("half"));
            assert!(elapsed >= timeout);
            assert!(elapsed < timeout + LATE_SENTINEL_GRACE + Duration::from_millis(500));
            assert_eq!(shell.consecutive_timeouts(), 1);
            assert!(shell.is_healthy());
        }

        #[tokio::test]
        async fn test_late_sentinel_is_reported_as_late_timeout() {
            let mut shell = scripted_shell(host(), |_| {
                Reply::Delayed(Duration::from_millis(250), "late".to_string())
            });
            let err = shell
                .execute("slow", Duration::from_millis(100))
                .await
                .unwrap_err();
            assert_eq!(
                err,
                FleetError::LateTimeout {
                    timeout: Duration::from_millis(100),
                    code: 0,
                    output: "late".to_string()
                }
            );
            assert_eq!(shell.consecutive_timeouts(), 0);
        }

        #[tokio::test]
        async fn test_late_output_of_timed_out_command_is_dropped() {
            let mut shell = scripted_shell(host(), |cmd| match cmd {
                "slow" => Reply::Delayed(Duration::from_millis(700), "OLD_OUTPUT".to_string()),
                "fresh" => Reply::Delayed(Duration::from_millis(300), "new".to_string()),
                _ => Reply::Silent,
            });

            let err = shell
                .execute("slow", Duration::from_millis(50))
                .await
                .unwrap_err();
            assert!(matches!(err, FleetError::Timeout { .. }));

            // "slow" finishes while "fresh" is still running.
            let output = shell.execute("fresh", Duration::from_secs(2)).await;
            assert_eq!(output, Ok("new".to_string()));
            assert!(shell.stale.is_empty());
        }

        #[tokio::test]
        async fn test_late_nonzero_exit_keeps_code() {
            let mut shell = scripted_shell(host(), |_| Reply::DelayedExit {
                delay: Duration::from_millis(250),
                output: "late".to_string(),
                code: 3,
            });
            let err = shell
                .execute("slow", Duration::from_millis(100))
                .await
                .unwrap_err();
            assert!(matches!(err, FleetError::LateTimeout { code: 3, .. }));
            assert_eq!(err.exit_code(), Some(3));
            assert_eq!(err.partial_output(), Some("late"));
        }

        #[tokio::test]
        async fn test_two_timeouts_make_shell_unhealthy() {
            let mut shell = scripted_shell(host(), |_| Reply::Silent);
            for _ in 0..2 {
                let _ = shell.execute("hang", Duration::from_millis(20)).await;
            }
            assert_eq!(shell.consecutive_timeouts(), 2);
            assert!(!shell.is_healthy());
        }

        #[tokio::test]
        async fn test_success_resets_timeout_counter() {
            let mut shell = scripted_shell(host(), |cmd| match cmd {
                "hang" => Reply::Silent,
                _ => Reply::output("ok"),
            });
            let _ = shell.execute("hang", Duration::from_millis(20)).await;
            assert_eq!(shell.consecutive_timeouts(), 1);
            shell.execute("true", Duration::from_secs(1)).await.unwrap();
            assert_eq!(shell.consecutive_timeouts(), 0);
        }

        #[tokio::test]
        async fn test_malformed_sentinel_keeps_shell() {
            let mut shell = scripted_shell(host(), |_| Reply::Malformed);
            let err = shell.execute("x", Duration::from_secs(1)).await.unwrap_err();
            assert!(matches!(err, FleetError::MalformedSentinel(_)));
            assert!(shell.is_healthy());
        }

        #[tokio::test]
        async fn test_closed_shell_rejects_commands() {
            let mut shell = scripted_shell(host(), |_| Reply::output("x"));
            shell.close().await;
            assert_eq!(
                shell.execute("echo x", Duration::from_secs(1)).await,
                Err(FleetError::Closed)
            );
        }
    }

    mod lifecycle {
        use super::*;

        #[tokio::test]
        async fn test_ping() {
            let mut alive = scripted_shell(host(), |cmd| match cmd {
                "echo ping" => Reply::output("ping"),
                _ => Reply::Silent,
            });
            assert!(alive.ping().await);

            let mut broken = scripted_shell(host(), |_| Reply::exit("", 1));
            assert!(!broken.ping().await);
        }

        #[tokio::test]
        async fn test_close_is_idempotent() {
            let mut shell = scripted_shell(host(), |_| Reply::Silent);
            shell.close().await;
            shell.close().await;
            assert_eq!(shell.state(), ShellState::Closed);
            assert!(!shell.is_healthy());
        }

        #[tokio::test]
        async fn test_push_without_connection_is_closed_error() {
            let shell = scripted_shell(host(), |_| Reply::Silent);
            let result = shell.push_file(b"data", "/tmp/x", Duration::from_secs(1)).await;
            assert_eq!(result, Err(FleetError::Closed));
        }

        #[test]
        fn test_ids_are_distinct() {
            let a = scripted_shell(host(), |_| Reply::Silent);
            let b = scripted_shell(host(), |_| Reply::Silent);
            assert_ne!(a.id(), b.id());
            assert_eq!(a.identity_key(), b.identity_key());
        }
    }

    mod environment {
        use super::*;

        #[tokio::test]
        async fn test_set_env_remembers_value() {
            let mut shell = scripted_shell(host(), |cmd| {
                assert_eq!(cmd, "export APP_MODE='blue green'");
                Reply::output("")
            });
            shell.set_env("APP_MODE", "blue green").await.unwrap();
            assert_eq!(
                shell.env_vars().get("APP_MODE").map(String::as_str),
                Some("blue green")
            );
        }

        #[tokio::test]
        async fn test_get_env_reads_remote_value() {
            let mut shell = scripted_shell(host(), |cmd| match cmd {
                "printf '%s' \"$HOME\"" => Reply::output("/root"),
                _ => Reply::Silent,
            });
            assert_eq!(shell.get_env("HOME").await.unwrap(), "/root");
        }

        #[tokio::test]
        async fn test_invalid_names_rejected() {
            let mut shell = scripted_shell(host(), |_| Reply::output(""));
            assert!(matches!(
                shell.set_env("1BAD", "x").await,
                Err(FleetError::InvalidName(_))
            ));
            assert!(matches!(
                shell.get_env("A;rm").await,
                Err(FleetError::InvalidName(_))
            ));
        }

        #[test]
        fn test_env_name_rules() {
            assert!(is_valid_env_name("PATH"));
            assert!(is_valid_env_name("_x1"));
            assert!(!is_valid_env_name(""));
            assert!(!is_valid_env_name("a-b"));
        }
    }

    mod scripts {
        use super::*;

        #[tokio::test]
        async fn test_script_is_piped_through_heredoc() {
            let mut shell = scripted_shell(host(), |cmd| {
                let lines: Vec<&str> = cmd.lines().collect();
                assert!(lines[0].starts_with("bash <<'FLEET_SCRIPT_"));
                assert_eq!(lines[1], "echo a");
                assert_eq!(lines[2], "echo b");
                assert!(lines[3].starts_with("FLEET_SCRIPT_"));
                Reply::output("a\nb")
            });
            let output = shell.execute_script("echo a\necho b").await.unwrap();
            assert_eq!(output, "a\nb");
        }
    }
}
