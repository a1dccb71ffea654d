//! Event based tracing through the ftrace trace pipe.
//!
//! An [`EventTrace`] owns one tracing session for a single event category. Enabling
//! it flips the global and per-category switches and opens the trace pipe, asking
//! for the [`EventStream`] starts a pump thread that reads the pipe line by line and
//! forwards every decoded [`TraceEvent`] over a bounded channel. Disabling stops the
//! pump, which closes the pipe and ends the stream, and turns both switches off.

use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::mem;
use std::net::Shutdown;
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::trace_event::TraceEvent;
use crate::tracefs::{write_switch, TracefsPaths};

/// Events buffered between the pump and the consumer before the pump blocks.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug)]
pub enum TraceError {
    /// The category name would not resolve to a switch under `events/`.
    InvalidCategory { category: String },
    /// Writing a tracing switch failed.
    SwitchUnwritable { path: PathBuf, source: io::Error },
    /// The trace pipe could not be opened.
    StreamUnopenable { path: PathBuf, source: io::Error },
    /// The pump thread could not be started.
    PumpUnavailable { source: io::Error },
    /// `enable` was called on a session that is already enabled.
    AlreadyEnabled,
    /// `event_source` was called on a session that is not enabled.
    NotEnabled,
}

impl fmt::Display for TraceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceError::InvalidCategory { category } => {
                write!(f, "Invalid trace event category '{category}'")
            }
            TraceError::SwitchUnwritable { path, source } => {
                write!(f, "Failed to write tracing switch {}: {source}", path.display())
            }
            TraceError::StreamUnopenable { path, source } => {
                write!(f, "Failed to open trace pipe {}: {source}", path.display())
            }
            TraceError::PumpUnavailable { source } => {
                write!(f, "Failed to start trace pump: {source}")
            }
            TraceError::AlreadyEnabled => write!(f, "Tracing is already enabled"),
            TraceError::NotEnabled => write!(f, "Tracing is not enabled"),
        }
    }
}

impl std::error::Error for TraceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TraceError::SwitchUnwritable { source, .. }
            | TraceError::StreamUnopenable { source, .. }
            | TraceError::PumpUnavailable { source } => Some(source),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceState {
    Disabled,
    Enabled,
    Streaming,
}

/// Consumer side of the event channel.
///
/// Every handle returned by [`EventTrace::event_source`] refers to the same
/// receiver. The stream ends once the pump exits, either because the trace pipe
/// reached end of file or because the session was disabled.
#[derive(Clone)]
pub struct EventStream {
    rx: Arc<Mutex<Receiver<TraceEvent>>>,
}

impl EventStream {
    fn new(rx: Receiver<TraceEvent>) -> Self {
        EventStream {
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    fn receiver(&self) -> MutexGuard<'_, Receiver<TraceEvent>> {
        self.rx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the next event, `None` once the stream has ended.
    pub fn recv(&self) -> Option<TraceEvent> {
        self.receiver().recv().ok()
    }

    /// Take an event if one is queued. Reports `Empty` while another handle is
    /// blocked receiving.
    pub fn try_recv(&self) -> Result<TraceEvent, TryRecvError> {
        match self.rx.try_lock() {
            Ok(rx) => rx.try_recv(),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().try_recv(),
            Err(TryLockError::WouldBlock) => Err(TryRecvError::Empty),
        }
    }

    /// Wait up to `timeout` for an event, including any time spent waiting for
    /// another handle to finish receiving.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<TraceEvent, RecvTimeoutError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.rx.try_lock() {
                Ok(rx) => {
                    return rx.recv_timeout(deadline.saturating_duration_since(Instant::now()))
                }
                Err(TryLockError::Poisoned(poisoned)) => {
                    return poisoned
                        .into_inner()
                        .recv_timeout(deadline.saturating_duration_since(Instant::now()))
                }
                Err(TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        return Err(RecvTimeoutError::Timeout);
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
            }
        }
    }
}

impl Iterator for EventStream {
    type Item = TraceEvent;

    fn next(&mut self) -> Option<TraceEvent> {
        self.recv()
    }
}

struct Pump {
    stop: Arc<AtomicBool>,
    waker: UnixStream,
    handle: JoinHandle<()>,
}

impl Pump {
    fn spawn(pipe: File, tx: SyncSender<TraceEvent>) -> io::Result<Self> {
        let (waker, wake_rx) = UnixStream::pair()?;
        let stop = Arc::new(AtomicBool::new(false));
        let pump_stop = stop.clone();
        let handle = thread::Builder::new()
            .name("tracepipe-pump".to_string())
            .spawn(move || pump_events(pipe, wake_rx, pump_stop, tx))?;
        Ok(Pump {
            stop,
            waker,
            handle,
        })
    }

    // The pump may be parked on a full channel. When the session holds the last
    // handle to the stream, dropping it fails that send and the pump is joined.
    // Otherwise the consumer is still draining and the pump exits on its own once
    // the channel empties or the consumer drops its handle.
    fn stop(self, stream: EventStream) {
        self.stop.store(true, Ordering::Release);
        if let Err(e) = self.waker.shutdown(Shutdown::Both) {
            tracing::debug!("Failed to wake trace pump: {}", e);
        }
        let consumer_gone = Arc::strong_count(&stream.rx) == 1;
        drop(stream);
        if consumer_gone || self.handle.is_finished() {
            if self.handle.join().is_err() {
                tracing::warn!("Trace pump panicked");
            }
        } else {
            tracing::debug!("Trace pump still draining, detaching it");
        }
    }
}

enum Session {
    Disabled,
    Enabled { pipe: File },
    Streaming { pump: Pump, stream: EventStream },
}

/// A tracing session for one event category, e.g. `sunrpc/xprt_transmit`.
///
/// Only one session should be active per host, the switches and the trace pipe
/// are global.
pub struct EventTrace {
    category: String,
    paths: TracefsPaths,
    event_switch: PathBuf,
    capacity: usize,
    session: Mutex<Session>,
}

impl EventTrace {
    /// Create a disabled session against the default tracefs location.
    pub fn new(category: &str) -> Result<Self, TraceError> {
        Self::with_paths(category, TracefsPaths::default())
    }

    pub fn with_paths(category: &str, paths: TracefsPaths) -> Result<Self, TraceError> {
        validate_category(category)?;
        Ok(EventTrace {
            category: category.to_string(),
            event_switch: paths.event_enable(category),
            paths,
            capacity: DEFAULT_CHANNEL_CAPACITY,
            session: Mutex::new(Session::Disabled),
        })
    }

    /// Set how many events may be queued before the pump waits on the consumer.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn state(&self) -> TraceState {
        match *self.lock() {
            Session::Disabled => TraceState::Disabled,
            Session::Enabled { .. } => TraceState::Enabled,
            Session::Streaming { .. } => TraceState::Streaming,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Turn on tracing and the category's event, then open the trace pipe.
    ///
    /// On failure the switches already turned on are turned back off.
    pub fn enable(&self) -> Result<(), TraceError> {
        let mut session = self.lock();
        if !matches!(*session, Session::Disabled) {
            return Err(TraceError::AlreadyEnabled);
        }

        let tracing_on = self.paths.tracing_on();
        write_switch(&tracing_on, true).map_err(|source| TraceError::SwitchUnwritable {
            path: tracing_on.clone(),
            source,
        })?;
        tracing::debug!("Enabled tracing via {}", tracing_on.display());

        if let Err(source) = write_switch(&self.event_switch, true) {
            revert_switch(&tracing_on);
            return Err(TraceError::SwitchUnwritable {
                path: self.event_switch.clone(),
                source,
            });
        }
        tracing::debug!("Enabled event via {}", self.event_switch.display());

        let pipe = match self.paths.open_trace_pipe() {
            Ok(pipe) => pipe,
            Err(source) => {
                self.revert_switches();
                return Err(TraceError::StreamUnopenable {
                    path: self.paths.trace_pipe(),
                    source,
                });
            }
        };

        *session = Session::Enabled { pipe };
        tracing::info!("Tracing {}", self.category);
        Ok(())
    }

    /// Get the stream of decoded events, starting the pump on the first call.
    pub fn event_source(&self) -> Result<EventStream, TraceError> {
        let mut session = self.lock();
        match &*session {
            Session::Disabled => return Err(TraceError::NotEnabled),
            Session::Streaming { stream, .. } => return Ok(stream.clone()),
            Session::Enabled { .. } => {}
        }
        let Session::Enabled { pipe } = mem::replace(&mut *session, Session::Disabled) else {
            return Err(TraceError::NotEnabled);
        };

        let (tx, rx) = sync_channel(self.capacity);
        let pump = match Pump::spawn(pipe, tx) {
            Ok(pump) => pump,
            Err(source) => {
                // The pipe went down with the failed spawn, the session is over.
                self.revert_switches();
                return Err(TraceError::PumpUnavailable { source });
            }
        };
        let stream = EventStream::new(rx);
        *session = Session::Streaming {
            pump,
            stream: stream.clone(),
        };
        tracing::debug!("Started trace pump for {}", self.category);
        Ok(stream)
    }

    /// Stop the session: end the stream, close the trace pipe and turn both switches
    /// off. Failures to write the switches are logged, the session is torn down
    /// regardless. Disabling a disabled session does nothing.
    ///
    /// If a consumer still holds an [`EventStream`] while the pump is parked on a
    /// full channel, the pump keeps the trace pipe open until that consumer drains
    /// the channel or drops its handle. Drop every handle before disabling when the
    /// session is going to be enabled again right away.
    pub fn disable(&self) {
        let mut session = self.lock();
        match mem::replace(&mut *session, Session::Disabled) {
            Session::Disabled => {
                tracing::debug!("Tracing {} already disabled", self.category);
                return;
            }
            Session::Enabled { pipe } => drop(pipe),
            Session::Streaming { pump, stream } => pump.stop(stream),
        }
        self.revert_switches();
        tracing::info!("Stopped tracing {}", self.category);
    }

    fn revert_switches(&self) {
        revert_switch(&self.event_switch);
        revert_switch(&self.paths.tracing_on());
    }
}

impl Drop for EventTrace {
    fn drop(&mut self) {
        self.disable();
    }
}

fn revert_switch(path: &Path) {
    if let Err(e) = write_switch(path, false) {
        tracing::warn!("Failed to turn off tracing switch {}: {}", path.display(), e);
    }
}

fn validate_category(category: &str) -> Result<(), TraceError> {
    let path = Path::new(category);
    let valid = !category.is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if !valid {
        return Err(TraceError::InvalidCategory {
            category: category.to_string(),
        });
    }
    Ok(())
}

// Block until the pipe has data (true) or the waker was shut down (false).
fn wait_readable(pipe: &File, waker: &UnixStream) -> io::Result<bool> {
    let mut fds = [
        PollFd::new(pipe.as_fd(), PollFlags::POLLIN),
        PollFd::new(waker.as_fd(), PollFlags::POLLIN),
    ];
    loop {
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => break,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    let woken = fds[1].revents().is_some_and(|revents| !revents.is_empty());
    Ok(!woken)
}

fn pump_events(pipe: File, waker: UnixStream, stop: Arc<AtomicBool>, tx: SyncSender<TraceEvent>) {
    let mut reader = BufReader::new(pipe);
    let mut line = Vec::new();
    let mut published: u64 = 0;
    let mut dropped: u64 = 0;

    loop {
        if stop.load(Ordering::Acquire) {
            break;
        }
        // Only wait when nothing is buffered, poll knows nothing about our buffer.
        if reader.buffer().is_empty() {
            match wait_readable(reader.get_ref(), &waker) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    tracing::warn!("Failed to wait on trace pipe: {}", e);
                    break;
                }
            }
        }

        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => {
                tracing::debug!("Trace pipe reached end of file");
                break;
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!("Failed to read trace pipe: {}", e);
                break;
            }
        }

        let text = String::from_utf8_lossy(&line);
        match TraceEvent::parse(&text) {
            Ok(Some(event)) => {
                if tx.send(event).is_err() {
                    tracing::debug!("Event stream dropped by consumer");
                    break;
                }
                published += 1;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::trace!("Dropping trace line '{}': {}", text.trim_end(), e);
                dropped += 1;
            }
        }
    }

    tracing::debug!(
        "Trace pump exiting, {} events published, {} lines dropped",
        published,
        dropped
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use tempfile::TempDir;

    const CATEGORY: &str = "sunrpc/xprt_transmit";

    fn fake_tracefs(pipe_contents: Option<&str>) -> (TempDir, TracefsPaths) {
        let dir = tempfile::tempdir().unwrap();
        let paths = TracefsPaths::new(dir.path());
        fs::write(paths.tracing_on(), "0").unwrap();
        let event_switch = paths.event_enable(CATEGORY);
        fs::create_dir_all(event_switch.parent().unwrap()).unwrap();
        fs::write(&event_switch, "0").unwrap();
        if let Some(contents) = pipe_contents {
            fs::write(paths.trace_pipe(), contents).unwrap();
        }
        (dir, paths)
    }

    fn switch(path: &Path) -> String {
        fs::read_to_string(path).unwrap()
    }

    #[test]
    fn test_invalid_categories() {
        for category in ["", "/sunrpc/xprt_transmit", "../sunrpc", "sunrpc/../../x"] {
            assert!(
                matches!(
                    EventTrace::new(category),
                    Err(TraceError::InvalidCategory { .. })
                ),
                "category '{category}' should be rejected"
            );
        }
        assert!(EventTrace::new(CATEGORY).is_ok());
        assert!(EventTrace::new("sched").is_ok());
    }

    #[test]
    fn test_state_transitions() {
        let (_dir, paths) = fake_tracefs(Some(""));
        let trace = EventTrace::with_paths(CATEGORY, paths.clone()).unwrap();
        assert_eq!(trace.state(), TraceState::Disabled);
        assert!(matches!(trace.event_source(), Err(TraceError::NotEnabled)));

        trace.enable().unwrap();
        assert_eq!(trace.state(), TraceState::Enabled);
        assert_eq!(switch(&paths.tracing_on()), "1");
        assert_eq!(switch(&paths.event_enable(CATEGORY)), "1");
        assert!(matches!(trace.enable(), Err(TraceError::AlreadyEnabled)));

        let _stream = trace.event_source().unwrap();
        assert_eq!(trace.state(), TraceState::Streaming);
        assert!(matches!(trace.enable(), Err(TraceError::AlreadyEnabled)));

        trace.disable();
        assert_eq!(trace.state(), TraceState::Disabled);
        assert_eq!(switch(&paths.tracing_on()), "0");
        assert_eq!(switch(&paths.event_enable(CATEGORY)), "0");

        // Idempotent.
        trace.disable();
        assert_eq!(trace.state(), TraceState::Disabled);
    }

    #[test]
    fn test_disable_from_enabled() {
        let (_dir, paths) = fake_tracefs(Some(""));
        let trace = EventTrace::with_paths(CATEGORY, paths.clone()).unwrap();
        trace.enable().unwrap();
        trace.disable();
        assert_eq!(trace.state(), TraceState::Disabled);
        assert_eq!(switch(&paths.tracing_on()), "0");
        assert_eq!(switch(&paths.event_enable(CATEGORY)), "0");
    }

    #[test]
    fn test_enable_fails_without_global_switch() {
        let (_dir, paths) = fake_tracefs(Some(""));
        fs::remove_file(paths.tracing_on()).unwrap();
        let trace = EventTrace::with_paths(CATEGORY, paths.clone()).unwrap();
        match trace.enable() {
            Err(TraceError::SwitchUnwritable { path, .. }) => {
                assert_eq!(path, paths.tracing_on())
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(trace.state(), TraceState::Disabled);
        assert_eq!(switch(&paths.event_enable(CATEGORY)), "0");
    }

    #[test]
    fn test_enable_rolls_back_global_switch() {
        let (_dir, paths) = fake_tracefs(Some(""));
        let trace = EventTrace::with_paths("sunrpc/missing_event", paths.clone()).unwrap();
        match trace.enable() {
            Err(TraceError::SwitchUnwritable { path, .. }) => {
                assert_eq!(path, paths.event_enable("sunrpc/missing_event"))
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(trace.state(), TraceState::Disabled);
        assert_eq!(switch(&paths.tracing_on()), "0");
    }

    #[test]
    fn test_enable_rolls_back_when_pipe_missing() {
        let (_dir, paths) = fake_tracefs(None);
        let trace = EventTrace::with_paths(CATEGORY, paths.clone()).unwrap();
        match trace.enable() {
            Err(TraceError::StreamUnopenable { path, .. }) => {
                assert_eq!(path, paths.trace_pipe())
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(trace.state(), TraceState::Disabled);
        assert_eq!(switch(&paths.tracing_on()), "0");
        assert_eq!(switch(&paths.event_enable(CATEGORY)), "0");
    }

    #[test]
    fn test_event_source_returns_same_stream() {
        let (_dir, paths) = fake_tracefs(Some(
            "nfsd-1 [000] .... 1.000001: xprt_transmit: status=0\n\
             nfsd-2 [001] .... 1.000002: xprt_transmit: status=0\n",
        ));
        let trace = EventTrace::with_paths(CATEGORY, paths).unwrap();
        trace.enable().unwrap();
        let first = trace.event_source().unwrap();
        let second = trace.event_source().unwrap();

        assert_eq!(first.recv().map(|e| e.pid), Some(1));
        assert_eq!(second.recv().map(|e| e.pid), Some(2));
        assert_eq!(first.recv(), None);
        assert_eq!(second.recv(), None);
        trace.disable();
    }

    #[test]
    fn test_nonblocking_receive_while_another_handle_waits() {
        let (tx, rx) = sync_channel(1);
        let stream = EventStream::new(rx);
        let waiting = stream.clone();
        let waiter = thread::spawn(move || waiting.recv());
        // Let the other handle park in recv() holding the receiver.
        thread::sleep(Duration::from_millis(50));

        let start = Instant::now();
        assert_eq!(stream.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(
            stream.recv_timeout(Duration::from_millis(50)),
            Err(RecvTimeoutError::Timeout)
        );
        assert!(start.elapsed() < Duration::from_secs(2));

        let event = TraceEvent {
            pid: 5,
            ..TraceEvent::default()
        };
        tx.send(event.clone()).unwrap();
        assert_eq!(waiter.join().unwrap(), Some(event));
        drop(tx);
        assert_eq!(stream.try_recv(), Err(TryRecvError::Disconnected));
    }

    #[test]
    fn test_drop_disables() {
        let (_dir, paths) = fake_tracefs(Some(""));
        {
            let trace = EventTrace::with_paths(CATEGORY, paths.clone()).unwrap();
            trace.enable().unwrap();
            assert_eq!(switch(&paths.tracing_on()), "1");
        }
        assert_eq!(switch(&paths.tracing_on()), "0");
        assert_eq!(switch(&paths.event_enable(CATEGORY)), "0");
    }

    #[test]
    fn test_error_source() {
        let err = TraceError::StreamUnopenable {
            path: PathBuf::from("/nope"),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        assert!(std::error::Error::source(&err).is_some());
        assert!(std::error::Error::source(&TraceError::NotEnabled).is_none());
        assert!(err.to_string().contains("/nope"));
    }
}
