//! Common test utilities for tracepipe integration tests.

use std::fs;
use std::path::Path;

use tempfile::TempDir;
use tracepipe::TracefsPaths;

pub const CATEGORY: &str = "sunrpc/xprt_transmit";

/// A temporary directory laid out like tracefs, with both switches off and no
/// trace pipe yet.
pub struct FakeTracefs {
    _dir: TempDir,
    pub paths: TracefsPaths,
}

impl FakeTracefs {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let paths = TracefsPaths::new(dir.path());
        fs::write(paths.tracing_on(), "0").expect("Failed to create tracing_on");
        let event_switch = paths.event_enable(CATEGORY);
        fs::create_dir_all(event_switch.parent().unwrap()).expect("Failed to create events dir");
        fs::write(&event_switch, "0").expect("Failed to create event switch");
        FakeTracefs { _dir: dir, paths }
    }

    /// Use a regular file as the trace pipe, reading it ends at end of file.
    pub fn with_pipe_contents(contents: &str) -> Self {
        let tracefs = Self::new();
        fs::write(tracefs.paths.trace_pipe(), contents).expect("Failed to write trace_pipe");
        tracefs
    }

    pub fn tracing_on(&self) -> String {
        read_switch(&self.paths.tracing_on())
    }

    pub fn event_enabled(&self) -> String {
        read_switch(&self.paths.event_enable(CATEGORY))
    }
}

fn read_switch(path: &Path) -> String {
    fs::read_to_string(path).expect("Failed to read switch")
}

/// A kernel formatted event line for `pid`.
pub fn event_line(pid: u32) -> String {
    format!(
        "            nfsd-{pid}  [003] ...1.  12345.{pid:06}: xprt_transmit: xid=0x{pid:08x} status=0\n"
    )
}
