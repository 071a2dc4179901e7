//! Per-check buffered logging with secret redaction.
//!
//! Every concurrently executing check gets its own [`CheckLogger`] so console
//! output from sibling checks never interleaves; the buffer is flushed
//! through `tracing` only after the check's task completes.

use indexmap::IndexMap;
use std::path::Path;

/// Replace every occurrence of a secret value with `***NAME***`.
///
/// Exact substring match against the supplied name → value table. Idempotent:
/// already-redacted text contains no secret values to replace.
pub fn redact(text: &str, secrets: &IndexMap<String, String>) -> String {
    let mut out = text.to_string();
    for (name, value) in secrets {
        if value.is_empty() {
            continue;
        }
        if out.contains(value.as_str()) {
            out = out.replace(value.as_str(), &format!("***{}***", name));
        }
    }
    out
}

/// Message level inside a check's log buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Buffered, secret-redacting logger scoped to one check.
#[derive(Debug, Clone)]
pub struct CheckLogger {
    /// Scope label, e.g. the check's composite id.
    scope: String,
    secrets: IndexMap<String, String>,
    lines: Vec<(LogLevel, String)>,
}

impl CheckLogger {
    pub fn new(scope: impl Into<String>, secrets: IndexMap<String, String>) -> Self {
        Self {
            scope: scope.into(),
            secrets,
            lines: Vec::new(),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    fn push(&mut self, level: LogLevel, message: &str) {
        self.lines.push((level, redact(message, &self.secrets)));
    }

    pub fn debug(&mut self, message: &str) {
        self.push(LogLevel::Debug, message);
    }

    pub fn info(&mut self, message: &str) {
        self.push(LogLevel::Info, message);
    }

    pub fn warn(&mut self, message: &str) {
        self.push(LogLevel::Warn, message);
    }

    pub fn error(&mut self, message: &str) {
        self.push(LogLevel::Error, message);
    }

    /// All buffered messages, redacted, in order.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(|(_, m)| m.as_str())
    }

    /// Emit the whole buffer through the global tracing subscriber.
    pub fn flush(&self) {
        for (level, message) in &self.lines {
            match level {
                LogLevel::Debug => tracing::debug!(check = %self.scope, "{message}"),
                LogLevel::Info => tracing::info!(check = %self.scope, "{message}"),
                LogLevel::Warn => tracing::warn!(check = %self.scope, "{message}"),
                LogLevel::Error => tracing::error!(check = %self.scope, "{message}"),
            }
        }
    }

    /// Write the buffered messages to a log file, one per line.
    pub fn write_to_file(&self, path: &Path) -> std::io::Result<()> {
        let mut content: String = self
            .lines
            .iter()
            .map(|(_, m)| m.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        if !content.is_empty() {
            content.push('\n');
        }
        std::fs::write(path, content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secrets() -> IndexMap<String, String> {
        let mut m = IndexMap::new();
        m.insert("TOKEN".to_string(), "tok-12345".to_string());
        m
    }

    #[test]
    fn test_redact_replaces_value_with_marker() {
        let out = redact("auth header: tok-12345", &secrets());
        assert_eq!(out, "auth header: ***TOKEN***");
    }

    #[test]
    fn test_redact_is_idempotent() {
        let once = redact("token=tok-12345", &secrets());
        let twice = redact(&once, &secrets());
        assert_eq!(once, twice);
        assert!(!twice.contains("tok-12345"));
    }

    #[test]
    fn test_redact_skips_empty_values() {
        let mut m = IndexMap::new();
        m.insert("EMPTY".to_string(), String::new());
        assert_eq!(redact("untouched", &m), "untouched");
    }

    #[test]
    fn test_logger_redacts_on_push() {
        let mut logger = CheckLogger::new("1_1_1", secrets());
        logger.info("using tok-12345 now");
        let lines: Vec<&str> = logger.lines().collect();
        assert_eq!(lines, vec!["using ***TOKEN*** now"]);
    }

    #[test]
    fn test_logger_writes_file_in_order() {
        let mut logger = CheckLogger::new("1_1_1", IndexMap::new());
        logger.info("first");
        logger.warn("second");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs.txt");
        logger.write_to_file(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }
}
