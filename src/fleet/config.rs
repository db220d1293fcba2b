//! Configuration resolution for fleet execution.
//!
//! Every tunable follows a three-tier priority system:
//!
//! 1. **Parameter** - Explicit command-line flag (highest priority)
//! 2. **Environment Variable** - Value from environment variable
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `FLEET_CONNECT_TIMEOUT` | 5s | Dial and handshake timeout in seconds |
//! | `FLEET_COMMAND_TIMEOUT` | 60s | Per-command timeout in seconds |
//! | `FLEET_MAX_RETRIES` | 0 | Dial retries for transient errors |
//! | `FLEET_RETRY_DELAY_MS` | 1000ms | Initial retry delay in milliseconds |
//! | `FLEET_COMPRESSION` | false | Enable zlib compression |
//! | `FLEET_MAX_CONCURRENCY` | unset | Cap on simultaneous hosts per dispatch |
//! | `FLEET_INVENTORY` | `~/.fleetsh/inventory.json` | Inventory file |

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Default dial timeout in seconds
pub(crate) const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Default command execution timeout in seconds
pub(crate) const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 60;

/// Construction failures are reported, not retried, unless asked for
pub(crate) const DEFAULT_MAX_RETRIES: u32 = 0;

/// Default retry delay in milliseconds
pub(crate) const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// Maximum retry delay cap
pub(crate) const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Wait after the shell starts before discarding the banner
pub(crate) const SHELL_SETTLE: Duration = Duration::from_millis(500);

/// Wait after the setup commands before discarding their output
pub(crate) const SETUP_SETTLE: Duration = Duration::from_millis(300);

/// Interval between output buffer scans while a command runs
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long a sentinel may trail the deadline and still be reported
pub(crate) const LATE_SENTINEL_GRACE: Duration = Duration::from_millis(500);

/// Liveness probe timeout
pub(crate) const PING_TIMEOUT: Duration = Duration::from_secs(2);

/// Timeout for scripts piped into `bash`
pub(crate) const SCRIPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for exporting or reading a shell variable
pub(crate) const ENV_TIMEOUT: Duration = Duration::from_secs(3);

/// Consecutive timeouts after which a shell is considered unhealthy
pub(crate) const MAX_CONSECUTIVE_TIMEOUTS: u32 = 2;

/// Environment variable name for the dial timeout
pub(crate) const CONNECT_TIMEOUT_ENV_VAR: &str = "FLEET_CONNECT_TIMEOUT";

/// Environment variable name for the command timeout
pub(crate) const COMMAND_TIMEOUT_ENV_VAR: &str = "FLEET_COMMAND_TIMEOUT";

/// Environment variable name for dial retries
pub(crate) const MAX_RETRIES_ENV_VAR: &str = "FLEET_MAX_RETRIES";

/// Environment variable name for the retry delay in milliseconds
pub(crate) const RETRY_DELAY_MS_ENV_VAR: &str = "FLEET_RETRY_DELAY_MS";

/// Environment variable name for compression
pub(crate) const COMPRESSION_ENV_VAR: &str = "FLEET_COMPRESSION";

/// Environment variable name for the fan-out cap
pub(crate) const MAX_CONCURRENCY_ENV_VAR: &str = "FLEET_MAX_CONCURRENCY";

/// Environment variable name for the inventory path
pub(crate) const INVENTORY_ENV_VAR: &str = "FLEET_INVENTORY";

/// Settings used to dial and authenticate a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectSettings {
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub compress: bool,
}

impl ConnectSettings {
    /// Resolve every field from flags, environment and defaults.
    pub fn resolve(
        timeout_secs: Option<u64>,
        max_retries: Option<u32>,
        retry_delay_ms: Option<u64>,
        compress: Option<bool>,
    ) -> Self {
        Self {
            timeout: resolve_connect_timeout(timeout_secs),
            max_retries: resolve_max_retries(max_retries),
            retry_delay: resolve_retry_delay(retry_delay_ms),
            compress: resolve_compression(compress),
        }
    }
}

impl Default for ConnectSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            compress: false,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse::<T>().ok())
}

/// Resolve the dial timeout with priority: parameter -> env var -> default
pub fn resolve_connect_timeout(timeout_param: Option<u64>) -> Duration {
    let secs = timeout_param
        .or_else(|| env_parse(CONNECT_TIMEOUT_ENV_VAR))
        .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS);
    Duration::from_secs(secs)
}

/// Resolve the command timeout with priority: parameter -> env var -> default
pub fn resolve_command_timeout(timeout_param: Option<u64>) -> Duration {
    let secs = timeout_param
        .or_else(|| env_parse(COMMAND_TIMEOUT_ENV_VAR))
        .unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS);
    Duration::from_secs(secs)
}

/// Resolve the dial retry count with priority: parameter -> env var -> default
pub fn resolve_max_retries(max_retries_param: Option<u32>) -> u32 {
    max_retries_param
        .or_else(|| env_parse(MAX_RETRIES_ENV_VAR))
        .unwrap_or(DEFAULT_MAX_RETRIES)
}

/// Resolve the retry delay with priority: parameter -> env var -> default
pub fn resolve_retry_delay(retry_delay_param: Option<u64>) -> Duration {
    let ms = retry_delay_param
        .or_else(|| env_parse(RETRY_DELAY_MS_ENV_VAR))
        .unwrap_or(DEFAULT_RETRY_DELAY_MS);
    Duration::from_millis(ms)
}

/// Resolve compression with priority: parameter -> env var -> default (false)
pub fn resolve_compression(compress_param: Option<bool>) -> bool {
    if let Some(compress) = compress_param {
        return compress;
    }

    if let Ok(env_compress) = env::var(COMPRESSION_ENV_VAR) {
        return env_compress.eq_ignore_ascii_case("true") || env_compress == "1";
    }

    false
}

/// Resolve the fan-out cap. `None` means one worker per host; zero is treated as unset.
pub fn resolve_max_concurrency(param: Option<usize>) -> Option<usize> {
    param
        .or_else(|| env_parse(MAX_CONCURRENCY_ENV_VAR))
        .filter(|n| *n > 0)
}

/// Resolve the inventory file path with priority: parameter -> env var -> `~/.fleetsh/inventory.json`
pub fn resolve_inventory_path(param: Option<PathBuf>) -> PathBuf {
    if let Some(path) = param {
        return path;
    }

    if let Ok(path) = env::var(INVENTORY_ENV_VAR)
        && !path.trim().is_empty()
    {
        return PathBuf::from(path);
    }

    data_dir().join("inventory.json")
}

/// Application data directory, `~/.fleetsh` (current directory if home is unknown).
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".fleetsh")
}
