//! Completion markers for commands run inside an interactive shell.
//!
//! An interactive shell gives no boundary between one command's output and
//! the next. Each command is therefore followed by a line of the form
//! `<token>:<exit-code>:END`, where the token is unique per call. The reader
//! splits the output stream at the first occurrence of `<token>:`.
//!
//! The token is written in two halves (`printf '%s%s' head tail`), so the
//! complete token only ever appears in the stream as command *output*, never
//! as echoed input.

use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

const TOKEN_PREFIX: &str = "FLEET";
const END_SUFFIX: &str = ":END";

/// A per-call completion marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentinel {
    token: String,
}

/// Result of scanning an output buffer for a sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentinelScan {
    /// No `<token>:` in the buffer yet
    NotFound,
    /// `<token>:` seen but the trailing `:END` has not arrived
    Incomplete,
    Complete { output: String, code: i32 },
    /// `:END` arrived but the exit code is not an integer
    Malformed(String),
}

impl Sentinel {
    /// Generate a fresh token: wall-clock nanos plus 128 random bits.
    pub fn generate() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        Self {
            token: format!("{}_{}_{}", TOKEN_PREFIX, nanos, Uuid::new_v4().simple()),
        }
    }

    #[cfg(test)]
    pub(crate) fn from_token(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Wrap `command` so that its combined output is followed by the marker line.
    ///
    /// The command sits on its own line inside `{ ... }` so trailing `&` or
    /// comments cannot swallow the marker.
    pub fn wrap(&self, command: &str) -> String {
        let (head, tail) = self.token.split_at(self.token.len() / 2);
        format!(
            "{{ {}\n}} 2>&1; printf '\\n%s%s:%s{}\\n' '{}' '{}' \"$?\"\n",
            command, END_SUFFIX, head, tail
        )
    }

    /// Scan the accumulated shell output for this sentinel.
    pub fn scan(&self, buffer: &str) -> SentinelScan {
        let needle = format!("{}:", self.token);
        let Some(idx) = buffer.find(&needle) else {
            return SentinelScan::NotFound;
        };

        let rest = &buffer[idx + needle.len()..];
        let Some(end) = rest.find(END_SUFFIX) else {
            return SentinelScan::Incomplete;
        };

        let code_text = rest[..end].trim();
        match code_text.parse::<i32>() {
            Ok(code) => SentinelScan::Complete {
                output: clean_output(&buffer[..idx]),
                code,
            },
            Err(_) => SentinelScan::Malformed(format!(
                "exit code '{}' after token {}",
                code_text, self.token
            )),
        }
    }

    /// Byte offset just past this sentinel's complete `<token>:<code>:END`
    /// marker in `buffer`, if it has arrived.
    pub fn marker_end(&self, buffer: &[u8]) -> Option<usize> {
        let needle = format!("{}:", self.token);
        let start = find_bytes(buffer, needle.as_bytes())? + needle.len();
        let end = find_bytes(&buffer[start..], END_SUFFIX.as_bytes())?;
        Some(start + end + END_SUFFIX.len())
    }
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Normalise terminal line endings and trim surrounding whitespace.
pub fn clean_output(raw: &str) -> String {
    raw.replace("\r\n", "\n").replace('\r', "").trim().to_string()
}
