//! Console sinks.
//!
//! `chout` buffers writes and flushes on a bare newline write; `cherr`
//! flushes every write. Flushing delegates to a host-installed callback when
//! one is set, falling back to the process's standard streams. Both sinks
//! are created at VM initialization as locked roots.

pub mod file;

use std::io::Write;

/// Host-installed flush target.
pub type ConsoleCallback = Box<dyn Fn(&str) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPolicy {
    /// Flush when a bare `"\n"` is written (chout).
    OnNewline,
    /// Flush after every write (cherr).
    EveryWrite,
}

/// A buffered console sink.
pub struct ConsoleSink {
    buffer: String,
    callback: Option<ConsoleCallback>,
    policy: FlushPolicy,
    to_stderr: bool,
}

impl std::fmt::Debug for ConsoleSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsoleSink")
            .field("buffer", &self.buffer)
            .field("policy", &self.policy)
            .field("to_stderr", &self.to_stderr)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

impl ConsoleSink {
    /// The standard-output sink (`chout`).
    pub fn chout() -> Self {
        Self {
            buffer: String::new(),
            callback: None,
            policy: FlushPolicy::OnNewline,
            to_stderr: false,
        }
    }

    /// The error sink (`cherr`).
    pub fn cherr() -> Self {
        Self {
            buffer: String::new(),
            callback: None,
            policy: FlushPolicy::EveryWrite,
            to_stderr: true,
        }
    }

    pub fn set_output_callback(&mut self, cb: Option<ConsoleCallback>) {
        self.callback = cb;
    }

    pub fn good(&self) -> bool {
        true
    }

    pub fn write_str(&mut self, s: &str) {
        self.buffer.push_str(s);
        match self.policy {
            FlushPolicy::EveryWrite => self.flush(),
            FlushPolicy::OnNewline => {
                if s == "\n" {
                    self.flush();
                }
            }
        }
    }

    pub fn write_int(&mut self, v: i64) {
        self.buffer.push_str(&v.to_string());
        if self.policy == FlushPolicy::EveryWrite {
            self.flush();
        }
    }

    pub fn write_float(&mut self, v: f64) {
        self.buffer.push_str(&v.to_string());
        if self.policy == FlushPolicy::EveryWrite {
            self.flush();
        }
    }

    /// Write a full line; the trailing bare-newline write flushes chout.
    pub fn write_line(&mut self, s: &str) {
        self.write_str(s);
        self.write_str("\n");
    }

    pub fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        if let Some(cb) = &self.callback {
            cb(&self.buffer);
        } else if self.to_stderr {
            eprint!("{}", self.buffer);
            let _ = std::io::stderr().flush();
        } else {
            print!("{}", self.buffer);
            let _ = std::io::stdout().flush();
        }
        self.buffer.clear();
    }

    pub fn pending(&self) -> &str {
        &self.buffer
    }
}
