//! Bounded in-memory tail of the process log, served at `/logs`.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

/// Ring buffer holding the most recent log output.
#[derive(Clone)]
pub struct LogTail {
    buf: Arc<Mutex<VecDeque<u8>>>,
    cap: usize,
}

impl LogTail {
    pub fn new(cap: usize) -> LogTail {
        LogTail {
            buf: Arc::new(Mutex::new(VecDeque::with_capacity(cap))),
            cap,
        }
    }

    /// The buffered lines, oldest first. The first line after a wrap may be
    /// clipped, so it is dropped.
    pub fn lines(&self) -> Vec<String> {
        let (bytes, wrapped) = {
            let buf = self.buf.lock();
            (Vec::from_iter(buf.iter().copied()), buf.len() == self.cap)
        };
        let text = String::from_utf8_lossy(&bytes);
        let text = if wrapped {
            text.split_once('\n').map(|(_, rest)| rest).unwrap_or("")
        } else {
            &text
        };
        text.lines().map(str::to_string).collect()
    }

    /// An `io::Write` that tees into this buffer and stdout, for use as a
    /// tracing writer.
    pub fn tee_writer(&self) -> TeeWriter {
        TeeWriter {
            stdout: io::stdout(),
            tail: self.clone(),
        }
    }

    fn push(&self, bytes: &[u8]) {
        let mut buf = self.buf.lock();
        for &b in bytes {
            if buf.len() == self.cap {
                buf.pop_front();
            }
            buf.push_back(b);
        }
    }
}

pub struct TeeWriter {
    stdout: io::Stdout,
    tail: LogTail,
}

impl io::Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tail.push(buf);
        self.stdout.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stdout.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn keeps_recent_lines() {
        let tail = LogTail::new(32);
        let mut writer = tail.tee_writer();
        for i in 0..10 {
            writeln!(writer, "line {i}").unwrap();
        }

        let lines = tail.lines();
        assert!(lines.len() < 10);
        assert_eq!(lines.last().unwrap(), "line 9");
        // The oldest retained line is intact, not clipped mid-way.
        assert!(lines.first().unwrap().starts_with("line "));
    }

    #[test]
    fn small_logs_are_complete() {
        let tail = LogTail::new(1024);
        let mut writer = tail.tee_writer();
        writeln!(writer, "only line").unwrap();
        assert_eq!(tail.lines(), vec!["only line".to_string()]);
    }
}
