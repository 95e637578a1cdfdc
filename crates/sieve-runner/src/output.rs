//! Bounded capture of step output.

use std::collections::VecDeque;

/// Output stream type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Keeps the last `limit` lines of a step's combined stdout and stderr.
#[derive(Debug, Clone)]
pub struct OutputTail {
    lines: VecDeque<String>,
    limit: usize,
    dropped: usize,
}

impl OutputTail {
    pub fn new(limit: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(limit.min(1024)),
            limit,
            dropped: 0,
        }
    }

    pub fn push(&mut self, stream: OutputStream, line: String) {
        if self.limit == 0 {
            self.dropped += 1;
            return;
        }
        if self.lines.len() == self.limit {
            self.lines.pop_front();
            self.dropped += 1;
        }
        let line = match stream {
            OutputStream::Stdout => line,
            OutputStream::Stderr => format!("[stderr] {line}"),
        };
        self.lines.push_back(line);
    }

    /// Lines pushed out of the window so far.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// The retained lines joined by newlines, with a marker when earlier
    /// output was dropped.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if self.dropped > 0 {
            out.push_str(&format!("... {} earlier lines omitted\n", self.dropped));
        }
        for (idx, line) in self.lines.iter().enumerate() {
            if idx > 0 {
                out.push('\n');
            }
            out.push_str(line);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_keeps_last_lines() {
        let mut tail = OutputTail::new(2);
        for n in 1..=4 {
            tail.push(OutputStream::Stdout, n.to_string());
        }
        assert_eq!(tail.len(), 2);
        assert_eq!(tail.dropped(), 2);
        assert_eq!(tail.render(), "... 2 earlier lines omitted\n3\n4");
    }

    #[test]
    fn test_stderr_is_marked() {
        let mut tail = OutputTail::new(10);
        tail.push(OutputStream::Stdout, "compiling".into());
        tail.push(OutputStream::Stderr, "error[E0308]".into());
        assert_eq!(tail.render(), "compiling\n[stderr] error[E0308]");
    }

    #[test]
    fn test_zero_limit_keeps_nothing() {
        let mut tail = OutputTail::new(0);
        tail.push(OutputStream::Stdout, "x".into());
        assert!(tail.is_empty());
        assert_eq!(tail.render(), "... 1 earlier lines omitted\n");
    }
}
