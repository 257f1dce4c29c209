//! Bounded capture of script log output.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde_json::Value as Json;

use crate::value::lock;

/// Ordered log lines for one execution. When full, the oldest line is dropped.
#[derive(Debug)]
pub struct LogBuffer {
    entries: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    /// Append `[level] message`, followed by `fields` as JSON when present.
    pub fn push(&self, level: &str, message: &str, fields: Option<&Json>) {
        let line = match fields {
            Some(fields) => format!("[{level}] {message} {fields}"),
            None => format!("[{level}] {message}"),
        };
        tracing::debug!(target: "sandbox", "{line}");

        if self.capacity == 0 {
            return;
        }
        let mut entries = lock(&self.entries);
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(line);
    }

    pub fn snapshot(&self) -> Vec<String> {
        lock(&self.entries).iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn formats_level_message_and_fields() {
        let logs = LogBuffer::new(10);
        logs.push("info", "fetched", Some(&json!({"count": 3})));
        logs.push("warn", "slow", None);
        assert_eq!(
            logs.snapshot(),
            vec![r#"[info] fetched {"count":3}"#, "[warn] slow"]
        );
    }

    #[test]
    fn drops_oldest_when_full() {
        let logs = LogBuffer::new(3);
        for i in 0..5 {
            logs.push("log", &i.to_string(), None);
        }
        assert_eq!(logs.snapshot(), vec!["[log] 2", "[log] 3", "[log] 4"]);
    }
}
