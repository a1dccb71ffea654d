//! Locations of the ftrace control files and the primitive used to flip them.
//!
//! The switches are host global kernel state, everything that touches them goes
//! through [`TracefsPaths`] so the root can be rebased (tests point it at a
//! temporary directory laid out like tracefs).

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub const DEFAULT_TRACING_DIR: &str = "/sys/kernel/debug/tracing";

const TRACING_ON_FILE: &str = "tracing_on";
const EVENTS_DIR: &str = "events";
const EVENT_ENABLE_FILE: &str = "enable";
const TRACE_PIPE_FILE: &str = "trace_pipe";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracefsPaths {
    root: PathBuf,
}

impl Default for TracefsPaths {
    fn default() -> Self {
        Self::new(DEFAULT_TRACING_DIR)
    }
}

impl TracefsPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        TracefsPaths { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The global tracing master switch.
    pub fn tracing_on(&self) -> PathBuf {
        self.root.join(TRACING_ON_FILE)
    }

    /// The enable switch of one event category, e.g. `sunrpc/xprt_transmit`.
    pub fn event_enable(&self, category: &str) -> PathBuf {
        self.root
            .join(EVENTS_DIR)
            .join(category)
            .join(EVENT_ENABLE_FILE)
    }

    pub fn trace_pipe(&self) -> PathBuf {
        self.root.join(TRACE_PIPE_FILE)
    }

    pub fn open_trace_pipe(&self) -> io::Result<File> {
        File::open(self.trace_pipe())
    }
}

/// Write "1" or "0" to a switch file.
///
/// The file is never created, tracefs does not allow it and a missing switch means
/// the event does not exist on this kernel.
pub fn write_switch(path: &Path, on: bool) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).truncate(true).open(path)?;
    file.write_all(if on { b"1" } else { b"0" })
}
