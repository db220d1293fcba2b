//! Grouping and rendering of dispatch results.
//!
//! Hosts are bucketed by their first three octets. Inside a bucket, results
//! are either printed one line per host or, in merge mode, collapsed into
//! groups of hosts that produced identical output or identical errors.

use std::collections::{BTreeMap, HashMap};

use colored::{Color, Colorize};

use super::address::{compress, sort_key};
use super::error::FleetError;
use super::types::{ExecutionResult, HostDescriptor};

/// Groups larger than this print a sample instead of every address.
pub const MERGE_THRESHOLD: usize = 5;

/// Addresses shown for a group above [`MERGE_THRESHOLD`].
pub const MERGE_SAMPLE: usize = 3;

/// Bucket key for `address`: the first three octets, or the raw address when
/// it is not a dotted quad.
pub fn bucket_key(address: &str) -> String {
    let parts: Vec<&str> = address.split('.').collect();
    if parts.len() == 4 && parts.iter().all(|p| p.parse::<u8>().is_ok()) {
        parts[..3].join(".")
    } else {
        address.to_string()
    }
}

/// Partition hosts into display buckets, each sorted by address.
pub fn bucket_hosts(hosts: &[HostDescriptor]) -> BTreeMap<String, Vec<HostDescriptor>> {
    let mut buckets: BTreeMap<String, Vec<HostDescriptor>> = BTreeMap::new();
    for host in hosts {
        buckets
            .entry(bucket_key(&host.address))
            .or_default()
            .push(host.clone());
    }
    for members in buckets.values_mut() {
        members.sort_by_key(|h| sort_key(&h.address));
    }
    buckets
}

/// Human-facing failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    CommandNotFound,
    PermissionDenied,
    ConnectionRefused,
    Timeout,
    Other,
}

impl ErrorCategory {
    /// Classify by error kind and exit status, then by substring of the error
    /// text. Captured output only counts for commands that exited non-zero.
    pub fn classify(error: &FleetError) -> Self {
        if error.is_timeout() {
            return ErrorCategory::Timeout;
        }
        if error.exit_code() == Some(127) {
            return ErrorCategory::CommandNotFound;
        }

        let mut text = error.to_string();
        if let FleetError::ExitStatus { output, .. } = error {
            text.push(' ');
            text.push_str(output);
        }
        let text = text.to_lowercase();

        if text.contains("command not found") {
            ErrorCategory::CommandNotFound
        } else if text.contains("permission denied") {
            ErrorCategory::PermissionDenied
        } else if text.contains("connection refused") {
            ErrorCategory::ConnectionRefused
        } else if text.contains("timeout") || text.contains("timed out") {
            ErrorCategory::Timeout
        } else {
            ErrorCategory::Other
        }
    }

    pub fn marker(&self) -> &'static str {
        match self {
            ErrorCategory::CommandNotFound => "command not found (127)",
            ErrorCategory::PermissionDenied => "permission denied",
            ErrorCategory::ConnectionRefused => "connection refused",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Other => "error",
        }
    }

    fn color(&self) -> Color {
        match self {
            ErrorCategory::CommandNotFound => Color::Magenta,
            ErrorCategory::PermissionDenied => Color::Yellow,
            ErrorCategory::ConnectionRefused => Color::Red,
            ErrorCategory::Timeout => Color::BrightYellow,
            ErrorCategory::Other => Color::BrightRed,
        }
    }
}

/// Renders one dispatch into console text.
#[derive(Debug, Clone, Copy, Default)]
pub struct Renderer {
    pub merge: bool,
    pub color: bool,
}

impl Renderer {
    pub fn new(merge: bool, color: bool) -> Self {
        Self { merge, color }
    }

    fn paint(&self, text: &str, color: Color) -> String {
        if self.color {
            text.color(color).to_string()
        } else {
            text.to_string()
        }
    }

    /// Render every bucket in key order. Hosts without a result are skipped.
    pub fn render(
        &self,
        buckets: &BTreeMap<String, Vec<HostDescriptor>>,
        results: &HashMap<String, ExecutionResult>,
    ) -> String {
        let mut out = String::new();

        for (key, hosts) in buckets {
            let addresses: Vec<String> = hosts.iter().map(|h| h.address.clone()).collect();
            let range = compress(&addresses).unwrap_or_else(|_| addresses.join(","));
            out.push('\n');
            out.push_str(&self.paint(&format!("{} ({}):", key, range), Color::BrightCyan));
            out.push('\n');

            if self.merge {
                self.render_merged(&mut out, hosts, results);
            } else {
                self.render_individual(&mut out, hosts, results);
            }
        }

        out.push('\n');
        out
    }

    fn render_individual(
        &self,
        out: &mut String,
        hosts: &[HostDescriptor],
        results: &HashMap<String, ExecutionResult>,
    ) {
        for host in hosts {
            let Some(result) = results.get(&host.address) else {
                continue;
            };
            let label = format!("[{}]", host.label());

            match &result.error {
                None => {
                    out.push_str(&self.paint(&label, Color::Green));
                    push_output(out, &result.output, " ", "    ");
                }
                Some(error) => {
                    let category = ErrorCategory::classify(error);
                    out.push_str(&self.paint(
                        &format!("{} {}: {}", label, category.marker(), error),
                        category.color(),
                    ));
                    out.push('\n');
                    if !result.output.is_empty() {
                        push_output(out, &result.output, "    output: ", "    ");
                    }
                }
            }
        }
    }

    fn render_merged(
        &self,
        out: &mut String,
        hosts: &[HostDescriptor],
        results: &HashMap<String, ExecutionResult>,
    ) {
        let mut failures: Vec<(String, ErrorCategory, Vec<&str>)> = Vec::new();
        let mut failure_outputs: Vec<(String, Vec<&str>)> = Vec::new();
        let mut successes: Vec<(String, Vec<&str>)> = Vec::new();

        for host in hosts {
            let Some(result) = results.get(&host.address) else {
                continue;
            };
            let address = host.address.as_str();

            match &result.error {
                None => push_grouped(&mut successes, &result.output, address),
                Some(error) => {
                    let text = error.to_string();
                    match failures.iter_mut().find(|(t, _, _)| *t == text) {
                        Some((_, _, members)) => members.push(address),
                        None => failures.push((text, ErrorCategory::classify(error), vec![address])),
                    }
                    if !result.output.is_empty() {
                        push_grouped(&mut failure_outputs, &result.output, address);
                    }
                }
            }
        }

        for (text, category, members) in &failures {
            let header = format!("[{}] {}:", group_label(members), category.marker());
            out.push_str(&self.paint(&header, category.color()));
            out.push('\n');
            push_output(out, text, "  ", "  ");
        }

        for (output, members) in &failure_outputs {
            let header = format!("[{}] output:", group_label(members));
            out.push_str(&self.paint(&header, Color::Yellow));
            out.push('\n');
            push_output(out, output, "  ", "  ");
        }

        for (output, members) in &successes {
            let header = format!("[{}]", group_label(members));
            out.push_str(&self.paint(&header, Color::Green));
            out.push('\n');
            if !output.is_empty() {
                push_output(out, output, "  ", "  ");
            }
        }
    }
}

fn push_grouped<'a>(groups: &mut Vec<(String, Vec<&'a str>)>, key: &str, address: &'a str) {
    match groups.iter_mut().find(|(k, _)| k == key) {
        Some((_, members)) => members.push(address),
        None => groups.push((key.to_string(), vec![address])),
    }
}

/// Append `text` with `first` before its first line and `indent` before the
/// rest, ending with a newline.
fn push_output(out: &mut String, text: &str, first: &str, indent: &str) {
    for (i, line) in text.lines().enumerate() {
        out.push_str(if i == 0 { first } else { indent });
        out.push_str(line);
        out.push('\n');
    }
    if text.is_empty() {
        out.push('\n');
    }
}

/// `a,b,c` for small groups, `a,b,c ... (N hosts)` for large ones.
pub fn group_label(members: &[&str]) -> String {
    if members.len() > MERGE_THRESHOLD {
        format!(
            "{} ... ({} hosts)",
            members[..MERGE_SAMPLE].join(","),
            members.len()
        )
    } else {
        members.join(",")
    }
}

/// One-line tally: `N ok, M failed`.
pub fn summary(results: &HashMap<String, ExecutionResult>) -> String {
    let ok = results.values().filter(|r| r.success).count();
    format!("{} ok, {} failed", ok, results.len() - ok)
}
