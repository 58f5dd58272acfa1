use std::sync::OnceLock;

use chrono::{SecondsFormat, Utc};
use regex::Regex;

use flyboard_types::{LogEntry, LogLevel};

use crate::ansi::{ansi_to_html, strip_ansi};

/// Upper bound for the requested log tail.
pub const MAX_TAIL_LINES: usize = 5000;
pub const DEFAULT_TAIL_LINES: usize = 100;

fn timestamp_regex() -> &'static Regex {
    static TIMESTAMP: OnceLock<Regex> = OnceLock::new();
    TIMESTAMP.get_or_init(|| {
        Regex::new(r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?")
            .unwrap_or_else(|_| Regex::new("$^").expect("regex"))
    })
}

/// Severity by keyword, most severe first; lines without a keyword are info.
pub fn detect_level(plain: &str) -> LogLevel {
    let lower = plain.to_ascii_lowercase();
    if lower.contains("error") {
        LogLevel::Error
    } else if lower.contains("warn") {
        LogLevel::Warn
    } else if lower.contains("info") {
        LogLevel::Info
    } else if lower.contains("debug") {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}

pub fn extract_timestamp(plain: &str) -> Option<String> {
    timestamp_regex()
        .find(plain)
        .map(|m| m.as_str().to_string())
}

pub fn clamp_tail(lines: Option<usize>) -> usize {
    lines.unwrap_or(DEFAULT_TAIL_LINES).clamp(1, MAX_TAIL_LINES)
}

/// Last `n` non-blank lines of `raw`, in original order.
pub fn tail_lines(raw: &str, n: usize) -> Vec<&str> {
    let lines = raw
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>();
    let skip = lines.len().saturating_sub(n);
    lines.into_iter().skip(skip).collect()
}

/// Append-only entry sequence for one log streaming attempt.
#[derive(Debug, Default)]
pub struct LogBook {
    next_id: u64,
    entries: Vec<LogEntry>,
    progress_messages: Vec<String>,
}

impl LogBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_line(&mut self, raw: &str) -> &LogEntry {
        let plain = strip_ansi(raw);
        let timestamp = extract_timestamp(&plain)
            .unwrap_or_else(|| Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
        let entry = LogEntry {
            id: self.next_id,
            timestamp,
            level: detect_level(&plain),
            message: raw.to_string(),
            html: ansi_to_html(raw),
        };
        self.next_id += 1;
        self.entries.push(entry);
        &self.entries[self.entries.len() - 1]
    }

    pub fn push_progress(&mut self, message: &str) -> &LogEntry {
        self.progress_messages.push(message.to_string());
        self.push_line(message)
    }

    /// Appends the tail of a final tool result after any progress entries.
    pub fn extend_tail(&mut self, raw: &str, n: usize) {
        for line in tail_lines(raw, n) {
            self.push_line(line);
        }
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn progress_messages(&self) -> &[String] {
        &self.progress_messages
    }

    pub fn into_parts(self) -> (Vec<LogEntry>, Vec<String>) {
        (self.entries, self.progress_messages)
    }
}
