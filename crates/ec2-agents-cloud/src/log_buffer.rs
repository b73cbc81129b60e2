//! Per-node log
//!
//! Each instance record owns a [`NodeLog`]: lifecycle events, remote
//! stdout/stderr and error cause chains, capped at a fixed number of lines.
//! Remote output arrives in arbitrary chunks; a trailing fragment without a
//! newline is held back until the rest of its line arrives.

use chrono::Utc;
use ec2_agents_common::defaults::DEFAULT_NODE_LOG_LINES;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
struct NodeLogState {
    lines: VecDeque<String>,
    capacity: usize,
    /// Remote output after the last newline
    partial: String,
}

impl NodeLogState {
    fn append(&mut self, line: String) {
        if self.capacity == 0 {
            return;
        }
        while self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    /// Flush held-back output so an event line does not split it
    fn flush_partial(&mut self) {
        if !self.partial.is_empty() {
            let line = std::mem::take(&mut self.partial);
            self.append(line);
        }
    }
}

/// Shared handle to a node's log; clones write to the same buffer.
#[derive(Debug, Clone)]
pub struct NodeLog {
    state: Arc<Mutex<NodeLogState>>,
}

impl Default for NodeLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_NODE_LOG_LINES)
    }
}

impl NodeLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(NodeLogState {
                lines: VecDeque::new(),
                capacity,
                partial: String::new(),
            })),
        }
    }

    /// Append a timestamped lifecycle event.
    pub fn event(&self, message: impl AsRef<str>) {
        let stamp = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
        let mut state = self.lock();
        state.flush_partial();
        for line in message.as_ref().lines() {
            state.append(format!("{stamp} {line}"));
        }
    }

    /// Append a chunk of remote output.
    pub fn output(&self, chunk: &str) {
        let mut state = self.lock();
        let mut text = std::mem::take(&mut state.partial);
        text.push_str(chunk);

        let complete = match text.rfind('\n') {
            Some(end) => {
                state.partial = text[end + 1..].to_string();
                &text[..end]
            }
            None => {
                state.partial = text;
                return;
            }
        };
        for line in complete.split('\n') {
            state.append(line.trim_end_matches('\r').to_string());
        }
    }

    /// Everything retained, held-back output included
    pub fn contents(&self) -> String {
        let state = self.lock();
        let mut lines: Vec<&str> = state.lines.iter().map(String::as_str).collect();
        if !state.partial.is_empty() {
            lines.push(&state.partial);
        }
        lines.join("\n")
    }

    /// Retained lines, not counting held-back output
    pub fn len(&self) -> usize {
        self.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        let state = self.lock();
        state.lines.is_empty() && state.partial.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, NodeLogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_the_newest_lines() {
        let log = NodeLog::with_capacity(3);
        for i in 0..10 {
            log.event(format!("attempt {i}"));
        }
        assert_eq!(log.len(), 3);
        let contents = log.contents();
        assert!(!contents.contains("attempt 6"));
        assert!(contents.ends_with("attempt 9"));
    }

    #[test]
    fn zero_capacity_keeps_nothing() {
        let log = NodeLog::with_capacity(0);
        log.event("PENDING -> BOOTING (running)");
        log.output("done\n");
        assert_eq!(log.len(), 0);
        assert_eq!(log.contents(), "");
    }

    #[test]
    fn chunked_output_is_reassembled_into_lines() {
        let log = NodeLog::default();
        log.output("Downloading agent.j");
        log.output("ar\r\nStarting ag");
        assert_eq!(log.len(), 1);
        log.output("ent\nConnected\n");

        assert_eq!(log.len(), 3);
        assert_eq!(log.contents(), "Downloading agent.jar\nStarting agent\nConnected");
    }

    #[test]
    fn events_flush_pending_output() {
        let log = NodeLog::default();
        log.output("exit without newline");
        log.event("agent exited with status 1");

        let lines: Vec<String> = log.contents().lines().map(str::to_string).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "exit without newline");
        assert!(lines[1].ends_with(" agent exited with status 1"));
    }

    #[test]
    fn clones_share_one_buffer() {
        let log = NodeLog::with_capacity(10);
        let writer = log.clone();
        writer.event("PENDING -> BOOTING (running)");
        writer.output("stdout line 1\nstdout line 2");

        assert_eq!(log.len(), 2);
        let contents = log.contents();
        assert!(contents.contains("PENDING -> BOOTING (running)"));
        assert!(contents.ends_with("stdout line 1\nstdout line 2"));
    }
}
