//! Collection session: ties tracepoints, per-CPU buffers and the trace file
//! writer together behind a small state machine.
//!
//! Lifecycle: `Created → Enabling → Running → Stopping → Closed`. The first
//! successful [`TracepointSession::enable_tracepoint`] moves the session to
//! `Enabling`; [`TracepointSession::run`] drives it through the remaining
//! states and closes it. `Closed` is absorbing.
//!
//! No kernel resource is acquired before the first `enable_tracepoint`, so a
//! session that is only constructed and queried never needs privileges.

use crate::cache::Registration;
use crate::cancel::CancelToken;
use crate::ring::AttachOptions;
use crate::ring::RingBufferSet;
use crate::ring::RingError;
use crate::ring::WaitOutcome;
use crate::ring::sample_raw;
use crate::writer::TraceFileWriter;
use crate::writer::WriterError;
use compact_str::CompactString;
use std::io;
use std::os::fd::AsRawFd;
use std::time::Duration;

/// How collected data flows from the buffers to the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Buffers overwrite their oldest data; one drain pass at shutdown.
    Circular,
    /// Buffers are flushed to the file continuously while running.
    RealTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Created,
    Enabling,
    Running,
    Stopping,
    Closed,
}

/// Errors from session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The operation needs a session that is collecting (or ready to).
    #[error("session is not in a runnable state")]
    NotRunning,
    /// The session has been closed; no further operations are valid.
    #[error("session is closed")]
    Closed,
    #[error(transparent)]
    Ring(#[from] RingError),
    #[error(transparent)]
    Writer(#[from] WriterError),
}

struct EnabledTracepoint {
    system: CompactString,
    event: CompactString,
    format_id: u32,
}

/// One collection session over a fixed CPU set.
pub struct TracepointSession {
    mode: Mode,
    state: State,
    rings: RingBufferSet,
    enabled: Vec<EnabledTracepoint>,
    wakeup_watermark_bytes: u32,
}

/// How long a realtime round waits before re-checking cancellation.
const ROUND_TIMEOUT: Duration = Duration::from_millis(500);

impl TracepointSession {
    /// Create a session. Allocates bookkeeping only; buffers are mapped when
    /// the first tracepoint is enabled.
    pub fn new(
        mode: Mode,
        cpu_count: usize,
        buffer_bytes: usize,
        wakeup_watermark_bytes: u32,
    ) -> Result<Self, SessionError> {
        Ok(Self {
            mode,
            state: State::Created,
            rings: RingBufferSet::open(cpu_count, buffer_bytes)?,
            enabled: Vec::new(),
            wakeup_watermark_bytes,
        })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Number of tracepoints currently feeding the buffers.
    pub fn enabled_count(&self) -> usize {
        self.enabled.len()
    }

    fn attach_options(&self) -> AttachOptions {
        match self.mode {
            Mode::Circular => AttachOptions {
                wakeup_watermark_bytes: None,
                overwrite: true,
            },
            Mode::RealTime => AttachOptions {
                wakeup_watermark_bytes: Some(self.wakeup_watermark_bytes),
                overwrite: false,
            },
        }
    }

    /// Attach one resolved tracepoint to every CPU's buffer.
    ///
    /// Idempotent per `(system, event)`. A failure here leaves previously
    /// enabled tracepoints collecting; the caller may continue with those.
    pub fn enable_tracepoint(&mut self, reg: &Registration) -> Result<(), SessionError> {
        match self.state {
            State::Created | State::Enabling => {}
            State::Closed => return Err(SessionError::Closed),
            State::Running | State::Stopping => return Err(SessionError::NotRunning),
        }
        if self
            .enabled
            .iter()
            .any(|e| e.system == reg.system && e.event == reg.event)
        {
            log::debug!("{} already enabled, skipping", reg.full_name());
            return Ok(());
        }

        self.rings.attach(reg.format_id(), &self.attach_options())?;
        log::info!(
            "enabled {} (format id {}) on {} cpus",
            reg.full_name(),
            reg.format_id(),
            self.rings.cpu_count()
        );
        self.enabled.push(EnabledTracepoint {
            system: reg.system.clone(),
            event: reg.event.clone(),
            format_id: reg.format_id(),
        });
        self.state = State::Enabling;
        Ok(())
    }

    /// Collect until cancelled, then close the session and finalize the
    /// writer. The writer must be freshly created (descriptions may already
    /// be registered on it).
    pub fn run(
        &mut self,
        writer: &mut TraceFileWriter,
        cancel: &CancelToken,
    ) -> Result<(), SessionError> {
        match self.state {
            State::Enabling => {}
            State::Closed => return Err(SessionError::Closed),
            _ => return Err(SessionError::NotRunning),
        }
        for tp in &self.enabled {
            writer.add_event_desc(tp.format_id, &format!("{}:{}", tp.system, tp.event));
        }
        writer.write_finished_init()?;
        self.state = State::Running;
        log::info!(
            "collecting ({} tracepoints, {} buffers of {} bytes)",
            self.enabled.len(),
            self.rings.cpu_count(),
            self.rings.buffer_bytes()
        );

        match self.mode {
            Mode::Circular => wait_for_cancel(cancel),
            Mode::RealTime => loop {
                match self
                    .rings
                    .wait_for_data(Some(ROUND_TIMEOUT), cancel)
                    .map_err(RingError::from)?
                {
                    WaitOutcome::Ready => {
                        let written = flush_round(&mut self.rings, writer)?;
                        if written > 0 {
                            writer.write_finished_round()?;
                        }
                    }
                    WaitOutcome::TimedOut => {}
                    WaitOutcome::Cancelled => break,
                }
                if cancel.is_cancelled() {
                    break;
                }
            },
        }

        // Final flush: whatever is resident in the buffers at shutdown.
        // The tracepoints are disabled first so the kernel stops writing
        // into the buffers while their records are copied out.
        self.state = State::Stopping;
        if let Err(err) = self.rings.disable_all() {
            log::warn!("Failed to disable tracepoints before final flush: {err}");
        }
        let written = flush_round(&mut self.rings, writer)?;
        if written > 0 {
            writer.write_finished_round()?;
        }
        log::info!("collected {} events", writer.event_count());

        self.state = State::Closed;
        writer.finalize_and_close()?;
        Ok(())
    }

    /// Session over pre-built buffers, already past enabling.
    #[cfg(test)]
    pub(crate) fn with_test_rings(mode: Mode, rings: RingBufferSet) -> Self {
        Self {
            mode,
            state: State::Enabling,
            rings,
            enabled: vec![EnabledTracepoint {
                system: "test".into(),
                event: "synthetic".into(),
                format_id: 1,
            }],
            wakeup_watermark_bytes: 0,
        }
    }
}

/// Drain every buffer once, writing events in per-CPU arrival order.
fn flush_round(
    rings: &mut RingBufferSet,
    writer: &mut TraceFileWriter,
) -> Result<usize, SessionError> {
    let mut write_error = None;
    let summary = rings.drain_ready(|cpu, time, record| {
        let payload = sample_raw(record).unwrap_or(record);
        writer
            .write_event(cpu as u32, time, payload)
            .map_err(|err| {
                let io_err = io::Error::other(err.to_string());
                write_error = Some(err);
                io_err
            })
    });
    if let Some(err) = write_error {
        return Err(err.into());
    }
    Ok(summary.records)
}

/// Block until the token fires. Wakes on the pipe, re-checks the flag, so a
/// signal arriving at any point terminates the wait.
fn wait_for_cancel(cancel: &CancelToken) {
    while !cancel.is_cancelled() {
        let mut pfd = libc::pollfd {
            fd: cancel.poll_fd().as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: pfd points at one valid pollfd.
        unsafe {
            libc::poll(&mut pfd, 1, 500);
        }
    }
}
