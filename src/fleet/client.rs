//! SSH connection establishment for fleet hosts.
//!
//! ## Connection Lifecycle
//!
//! 1. **Client Configuration**: keepalive, compression and (for short-lived
//!    probes) an inactivity timeout.
//! 2. **Connection Establishment**: TCP dial and SSH handshake bounded by the
//!    connect timeout.
//! 3. **Authentication**: password authentication through [`AuthStrategy`].
//!
//! ## Retry Strategy
//!
//! Dial attempts use exponential backoff with jitter via the `backon` crate.
//! The default is a single attempt; retries only happen when
//! `FLEET_MAX_RETRIES` (or the matching flag) is raised.
//!
//! - **Retryable**: connection refused, timeout, network unreachable, broken pipe
//! - **Non-retryable**: authentication failures of any kind

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use russh::{ChannelMsg, client};
use tracing::{debug, error, info, warn};

use super::auth::{AuthStrategy, PasswordAuth};
use super::config::{ConnectSettings, MAX_RETRY_DELAY};
use super::error::{FleetError, is_retryable_error};
use super::session::SshClientHandler;
use super::types::HostDescriptor;

/// Build russh client configuration.
///
/// - Inactivity timeout set to `timeout`, or `None` when `persistent` is true
/// - Keepalive every 30 seconds, at most 3 unanswered
/// - ZLIB preferred when `compress` is set
pub(crate) fn build_client_config(
    timeout: Duration,
    compress: bool,
    persistent: bool,
) -> Arc<client::Config> {
    let compression = if compress {
        (&[russh::compression::ZLIB, russh::compression::NONE][..]).into()
    } else {
        (&[russh::compression::NONE][..]).into()
    };

    let preferred = russh::Preferred {
        compression,
        ..Default::default()
    };

    let inactivity_timeout = if persistent { None } else { Some(timeout) };

    Arc::new(client::Config {
        inactivity_timeout,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        preferred,
        ..Default::default()
    })
}

/// Dial and authenticate `host`, retrying transient failures.
///
/// Authentication failures are never retried to avoid account lockouts.
/// `persistent` connections carry no inactivity timeout and are meant to back
/// a long-lived shell.
pub(crate) async fn connect(
    host: &HostDescriptor,
    settings: &ConnectSettings,
    persistent: bool,
) -> Result<client::Handle<SshClientHandler>, FleetError> {
    let attempt_counter = AtomicU32::new(0);
    let target = format!("{}@{}:{}", host.user, host.address, host.port);

    let backoff = ExponentialBuilder::default()
        .with_min_delay(settings.retry_delay)
        .with_max_delay(MAX_RETRY_DELAY)
        .with_max_times(settings.max_retries as usize)
        .with_jitter();

    let result = (|| async {
        let current_attempt = attempt_counter.fetch_add(1, Ordering::SeqCst);

        if current_attempt > 0 {
            warn!("SSH connection retry attempt {} to {}", current_attempt, target);
        }

        dial(host, settings.timeout, settings.compress, persistent).await
    })
    .retry(backoff)
    .when(|e: &FleetError| {
        let retryable = match e {
            FleetError::Connect(message) => is_retryable_error(message),
            _ => false,
        };
        if !retryable && settings.max_retries > 0 {
            warn!(
                "SSH connection to {} failed with non-retryable error: {}",
                target, e
            );
        }
        retryable
    })
    .notify(|err: &FleetError, dur: Duration| {
        warn!("SSH connection failed: {}. Retrying in {:?}", err, dur);
    })
    .await;

    let total_attempts = attempt_counter.load(Ordering::SeqCst);
    let retry_count = total_attempts.saturating_sub(1);

    match result {
        Ok(handle) => {
            if retry_count > 0 {
                info!(
                    "SSH connection to {} succeeded after {} retry attempt(s)",
                    target, retry_count
                );
            } else {
                debug!("SSH connection to {} established", target);
            }
            Ok(handle)
        }
        Err(e) => {
            error!(
                "SSH connection to {} failed after {} attempt(s). Last error: {}",
                target, total_attempts, e
            );
            Err(e)
        }
    }
}

/// One dial + handshake + authentication attempt.
async fn dial(
    host: &HostDescriptor,
    timeout: Duration,
    compress: bool,
    persistent: bool,
) -> Result<client::Handle<SshClientHandler>, FleetError> {
    let config = build_client_config(timeout, compress, persistent);

    let connect_future = client::connect(
        config,
        (host.address.as_str(), host.port),
        SshClientHandler,
    );

    let mut handle = tokio::time::timeout(timeout, connect_future)
        .await
        .map_err(|_| FleetError::Connect(format!("Connection timed out after {:?}", timeout)))?
        .map_err(|e| FleetError::Connect(format!("Failed to connect: {}", e)))?;

    let auth = PasswordAuth::new(host.credential.as_str());
    let success = auth
        .authenticate(&mut handle, &host.user)
        .await
        .map_err(FleetError::Auth)?;

    if !success {
        return Err(FleetError::Auth(format!(
            "{} authentication rejected for user {}",
            auth.name(),
            host.user
        )));
    }

    Ok(handle)
}

/// Check that `host` accepts a connection and the stored credential.
pub(crate) async fn probe(host: &HostDescriptor, settings: &ConnectSettings) -> Result<(), FleetError> {
    let handle = connect(host, settings, false).await?;
    let _ = handle
        .disconnect(russh::Disconnect::ByApplication, "probe complete", "en")
        .await;
    Ok(())
}

/// Write `content` to `remote_path` over a fresh exec channel.
///
/// Best effort: the file is streamed into `cat` and only the exit status is
/// checked. Nothing is verified after the write.
pub(crate) async fn push_file(
    handle: &client::Handle<SshClientHandler>,
    content: &[u8],
    remote_path: &str,
    timeout: Duration,
) -> Result<(), FleetError> {
    let mut channel = handle
        .channel_open_session()
        .await
        .map_err(|e| FleetError::Channel(format!("Failed to open channel: {}", e)))?;

    channel
        .exec(true, format!("cat > {}", shell_quote(remote_path)))
        .await
        .map_err(|e| FleetError::Channel(format!("Failed to start upload: {}", e)))?;

    channel
        .data(content)
        .await
        .map_err(|e| FleetError::Channel(format!("Failed to send file data: {}", e)))?;

    channel
        .eof()
        .await
        .map_err(|e| FleetError::Channel(format!("Failed to finish upload: {}", e)))?;

    let exit_status = tokio::time::timeout(timeout, async {
        loop {
            match channel.wait().await {
                Some(ChannelMsg::ExitStatus { exit_status }) => return Some(exit_status),
                Some(ChannelMsg::Close) | None => return None,
                Some(_) => {}
            }
        }
    })
    .await
    .map_err(|_| FleetError::Timeout {
        timeout,
        partial: String::new(),
    })?;

    let _ = channel.close().await;

    match exit_status {
        Some(0) => Ok(()),
        Some(code) => Err(FleetError::ExitStatus {
            code: code as i32,
            output: String::new(),
        }),
        None => Err(FleetError::Channel(
            "channel closed before upload finished".to_string(),
        )),
    }
}

/// Quote `value` for a POSIX shell using single quotes.
pub(crate) fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
