//! Tracepipe library - typed kernel tracepoint events from the ftrace trace pipe.
//!
//! This library turns the text lines the kernel writes to
//! `/sys/kernel/debug/tracing/trace_pipe` into [`TraceEvent`] records and manages
//! the tracing switches for one event category at a time.
//!
//! # Modules
//!
//! - [`trace_event`] - Decoding of a single trace pipe line
//! - [`tracefs`] - Locations of the tracing switches and the trace pipe
//! - [`event_trace`] - Session lifecycle and the background pump
//!
//! # Example
//!
//! ```no_run
//! use tracepipe::EventTrace;
//!
//! let trace = EventTrace::new("sunrpc/xprt_transmit").expect("Invalid category");
//! trace.enable().expect("Failed to enable tracing");
//!
//! for event in trace.event_source().expect("Tracing is not enabled") {
//!     println!("{event}");
//! }
//!
//! trace.disable();
//! ```

pub mod event_trace;
pub mod trace_event;
pub mod tracefs;

pub use event_trace::{EventStream, EventTrace, TraceError, TraceState, DEFAULT_CHANNEL_CAPACITY};
pub use trace_event::{ParseError, TraceEvent};
pub use tracefs::{TracefsPaths, DEFAULT_TRACING_DIR};
