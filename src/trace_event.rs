//! Decoding of individual `trace_pipe` lines.
//!
//! With the default `irq-info` trace option the kernel emits one line per fired
//! tracepoint in the latency format:
//!
//! ```text
//!            nfsd-1234    [003] d.h1.  12345.678901: xprt_transmit: status=0
//!            ^task ^pid    ^cpu ^flags ^timestamp    ^function      ^payload
//! ```
//!
//! Interspersed with those are `#` comment lines (the header the kernel prints
//! when the buffer is first read) which are not events.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

// Number of whitespace separated fields in an event line, the last one being the
// unsplit payload.
const TRACE_LINE_FIELDS: usize = 6;

/// One decoded trace line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TraceEvent {
    pub task: String,
    pub pid: u32,
    pub cpu: u32,
    /// Interrupts were disabled when the event fired.
    pub irqs_off: bool,
    /// A reschedule was pending.
    pub need_resched: bool,
    /// The event fired from hard or soft interrupt context.
    pub in_irq: bool,
    /// The preemption count was non zero.
    pub preempt_depth: bool,
    /// Trace clock timestamp, zero when the line did not carry one we understand.
    pub timestamp: Duration,
    pub function: String,
    pub event: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The line had fewer fields than an event line carries.
    MalformedLine { fields: usize },
    /// The `<task>-<pid>` token could not be split or the pid is not a number.
    MalformedTask { task: String },
    /// The `[<cpu>]` token is not a bracketed number.
    MalformedCpu { cpu: String },
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::MalformedLine { fields } => write!(
                f,
                "Unexpected number of fields in trace line: {fields}, expected {TRACE_LINE_FIELDS}"
            ),
            ParseError::MalformedTask { task } => {
                write!(f, "Malformed task field '{task}', expected <task>-<pid>")
            }
            ParseError::MalformedCpu { cpu } => {
                write!(f, "Malformed cpu field '{cpu}', expected [<cpu>]")
            }
        }
    }
}

impl std::error::Error for ParseError {}

impl TraceEvent {
    /// Decode a single line read from the trace pipe.
    ///
    /// Returns `Ok(None)` for blank lines and `#` comment lines, they are part of
    /// the stream but are not events.
    pub fn parse(line: &str) -> Result<Option<Self>, ParseError> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        // Runs of alignment padding between the leading columns fold away here,
        // the payload is kept exactly as the kernel printed it.
        let fields = split_fields(line, TRACE_LINE_FIELDS);
        if fields.len() != TRACE_LINE_FIELDS {
            return Err(ParseError::MalformedLine {
                fields: fields.len(),
            });
        }

        let (task, pid) = parse_task(fields[0])?;
        let cpu = parse_cpu(fields[1])?;
        let flags = Flags::decode(fields[2]);
        let timestamp = parse_timestamp(fields[3]).unwrap_or_default();
        let function = fields[4].strip_suffix(':').unwrap_or(fields[4]);

        Ok(Some(TraceEvent {
            task: task.to_string(),
            pid,
            cpu,
            irqs_off: flags.irqs_off,
            need_resched: flags.need_resched,
            in_irq: flags.in_irq,
            preempt_depth: flags.preempt_depth,
            timestamp,
            function: function.to_string(),
            event: fields[5].to_string(),
        }))
    }

    /// Render the event the way the kernel would have printed it, `parse` maps the
    /// result back to an equal event (modulo sub-microsecond timestamp precision).
    pub fn to_trace_line(&self) -> String {
        let flags = [
            if self.irqs_off { 'd' } else { '.' },
            if self.need_resched { 'N' } else { '.' },
            if self.in_irq { 'h' } else { '.' },
            if self.preempt_depth { '1' } else { '.' },
        ];
        format!(
            "{}-{} [{:03}] {} {}.{:06}: {}: {}",
            self.task,
            self.pid,
            self.cpu,
            flags.iter().collect::<String>(),
            self.timestamp.as_secs(),
            self.timestamp.subsec_micros(),
            self.function,
            self.event
        )
    }
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}: {}",
            self.task, self.pid, self.cpu, self.function, self.event
        )
    }
}

// Split on whitespace into at most `max` fields, the final field keeps the rest of
// the line untouched.
fn split_fields(line: &str, max: usize) -> Vec<&str> {
    let mut fields = Vec::with_capacity(max);
    let mut rest = line;
    while fields.len() + 1 < max {
        match rest.split_once(char::is_whitespace) {
            Some((field, tail)) => {
                fields.push(field);
                rest = tail.trim_start();
            }
            None => break,
        }
    }
    if !rest.is_empty() {
        fields.push(rest);
    }
    fields
}

// Task names may contain hyphens themselves, the pid is always after the last one.
fn parse_task(field: &str) -> Result<(&str, u32), ParseError> {
    let malformed = || ParseError::MalformedTask {
        task: field.to_string(),
    };
    let (task, pid) = field.rsplit_once('-').ok_or_else(malformed)?;
    if task.is_empty() {
        return Err(malformed());
    }
    let pid = pid.parse::<u32>().map_err(|_| malformed())?;
    Ok((task, pid))
}

fn parse_cpu(field: &str) -> Result<u32, ParseError> {
    field
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .and_then(|s| s.parse::<u32>().ok())
        .ok_or_else(|| ParseError::MalformedCpu {
            cpu: field.to_string(),
        })
}

// "<secs>.<fraction>:" with up to nanosecond precision.
fn parse_timestamp(field: &str) -> Option<Duration> {
    let (secs, frac) = field.strip_suffix(':')?.split_once('.')?;
    if frac.is_empty() || frac.len() > 9 || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let secs = secs.parse::<u64>().ok()?;
    let nanos = frac.parse::<u32>().ok()? * 10u32.pow(9 - frac.len() as u32);
    Some(Duration::new(secs, nanos))
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Flags {
    irqs_off: bool,
    need_resched: bool,
    in_irq: bool,
    preempt_depth: bool,
}

impl Flags {
    // The latency format flag characters, see Documentation/trace/ftrace.rst. Newer
    // kernels append further columns (migrate disable), those are ignored. Anything
    // that does not fit the grammar decodes to no flags at all.
    fn decode(field: &str) -> Self {
        let chars: Vec<char> = field.chars().collect();
        if chars.len() < 4 {
            return Flags::default();
        }
        let irqs_off = match chars[0] {
            'd' | 'D' | 'X' => true,
            '.' => false,
            _ => return Flags::default(),
        };
        let need_resched = match chars[1] {
            'N' | 'n' | 'p' | 'B' | 'L' | 'b' => true,
            '.' => false,
            _ => return Flags::default(),
        };
        let in_irq = match chars[2] {
            'H' | 'h' | 's' | 'Z' | 'z' => true,
            '.' => false,
            _ => return Flags::default(),
        };
        let preempt_depth = match chars[3] {
            '0' | '.' => false,
            c if c.is_ascii_hexdigit() => true,
            _ => return Flags::default(),
        };
        Flags {
            irqs_off,
            need_resched,
            in_irq,
            preempt_depth,
        }
    }
}
