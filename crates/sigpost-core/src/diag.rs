//! Operator-facing diagnostics.
//!
//! Components never log operator events through process-wide state. They are
//! handed an `Arc<dyn DiagnosticSink>` and emit typed [`DiagnosticEvent`]s into
//! it; the binary wires in a [`TracingSink`], tests wire in a [`MemorySink`].

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{Level, error, info, warn};

use crate::wire::StreamId;

/// Something an operator may want to see.
#[derive(Debug, Clone, PartialEq)]
pub enum DiagnosticEvent {
    /// First hello from a new client.
    ClientRegistered { stream_id: StreamId },
    /// Hello from a client that is already registered.
    ClientReturned { stream_id: StreamId },
    /// Client said goodbye and was removed from the registry.
    ClientRemoved { stream_id: StreamId },
    /// Goodbye from a client the registry did not know.
    ClientUnknown { stream_id: StreamId },
    /// Staleness sweep dropped this client.
    ClientEvicted { stream_id: StreamId },
    /// Commands handed to a client, by label.
    CommandsDispatched {
        stream_id: StreamId,
        labels: Vec<String>,
    },
    /// Output produced by a command on the client.
    ClientOutput { stream_id: StreamId, output: String },
    /// Client could not make sense of a server signal.
    ClientFailed { stream_id: StreamId, detail: String },
    /// A file pushed to a client.
    FileSent {
        stream_id: StreamId,
        filename: String,
        bytes: u64,
    },
    /// A queued outbound file could not be read on the server.
    FileUnavailable {
        stream_id: StreamId,
        filename: String,
        error: String,
    },
    /// A file uploaded by a client.
    FileReceived {
        stream_id: StreamId,
        path: PathBuf,
        bytes: u64,
    },
    /// Client does not have the requested file.
    FileNotFound { stream_id: StreamId },
    /// Undecodable signal; the client was told to terminate.
    ProtocolDesync { stream_id: StreamId, code: u32 },
    /// Registry or mailbox operation failed; retried next interaction.
    StoreFailure {
        operation: &'static str,
        error: String,
    },
}

impl DiagnosticEvent {
    /// Severity used by [`TracingSink`].
    pub fn level(&self) -> Level {
        match self {
            DiagnosticEvent::ClientReturned { .. } | DiagnosticEvent::CommandsDispatched { .. } => {
                Level::DEBUG
            }
            DiagnosticEvent::ClientUnknown { .. }
            | DiagnosticEvent::ClientFailed { .. }
            | DiagnosticEvent::FileUnavailable { .. }
            | DiagnosticEvent::FileNotFound { .. }
            | DiagnosticEvent::ProtocolDesync { .. } => Level::WARN,
            DiagnosticEvent::StoreFailure { .. } => Level::ERROR,
            _ => Level::INFO,
        }
    }

    /// Client the event concerns, if any.
    pub fn stream_id(&self) -> Option<StreamId> {
        match self {
            DiagnosticEvent::ClientRegistered { stream_id }
            | DiagnosticEvent::ClientReturned { stream_id }
            | DiagnosticEvent::ClientRemoved { stream_id }
            | DiagnosticEvent::ClientUnknown { stream_id }
            | DiagnosticEvent::ClientEvicted { stream_id }
            | DiagnosticEvent::CommandsDispatched { stream_id, .. }
            | DiagnosticEvent::ClientOutput { stream_id, .. }
            | DiagnosticEvent::ClientFailed { stream_id, .. }
            | DiagnosticEvent::FileSent { stream_id, .. }
            | DiagnosticEvent::FileUnavailable { stream_id, .. }
            | DiagnosticEvent::FileReceived { stream_id, .. }
            | DiagnosticEvent::FileNotFound { stream_id }
            | DiagnosticEvent::ProtocolDesync { stream_id, .. } => Some(*stream_id),
            DiagnosticEvent::StoreFailure { .. } => None,
        }
    }
}

impl fmt::Display for DiagnosticEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticEvent::ClientRegistered { stream_id } => {
                write!(f, "new client {stream_id}")
            }
            DiagnosticEvent::ClientReturned { stream_id } => {
                write!(f, "client {stream_id} checked in")
            }
            DiagnosticEvent::ClientRemoved { stream_id } => {
                write!(f, "client {stream_id} terminated")
            }
            DiagnosticEvent::ClientUnknown { stream_id } => {
                write!(f, "client {stream_id} disconnected but was not registered")
            }
            DiagnosticEvent::ClientEvicted { stream_id } => {
                write!(f, "client {stream_id} evicted as stale")
            }
            DiagnosticEvent::CommandsDispatched { stream_id, labels } => {
                write!(f, "sent {} to client {stream_id}", labels.join(", "))
            }
            DiagnosticEvent::ClientOutput { stream_id, output } => {
                write!(f, "client {stream_id}:\n{output}")
            }
            DiagnosticEvent::ClientFailed { stream_id, detail } => {
                write!(f, "client {stream_id} failed: {detail}")
            }
            DiagnosticEvent::FileSent {
                stream_id,
                filename,
                bytes,
            } => write!(f, "sent {filename} ({bytes} bytes) to client {stream_id}"),
            DiagnosticEvent::FileUnavailable {
                stream_id,
                filename,
                error,
            } => write!(
                f,
                "cannot send {filename} to client {stream_id}: {error}"
            ),
            DiagnosticEvent::FileReceived {
                stream_id,
                path,
                bytes,
            } => write!(
                f,
                "received {bytes} bytes from client {stream_id} into {}",
                path.display()
            ),
            DiagnosticEvent::FileNotFound { stream_id } => {
                write!(f, "client {stream_id} could not find the requested file")
            }
            DiagnosticEvent::ProtocolDesync { stream_id, code } => {
                write!(f, "client {stream_id} sent undecodable signal {code}")
            }
            DiagnosticEvent::StoreFailure { operation, error } => {
                write!(f, "store {operation} failed: {error}")
            }
        }
    }
}

/// Receiver of diagnostic events.
pub trait DiagnosticSink: Send + Sync {
    fn emit(&self, event: DiagnosticEvent);
}

/// Forwards events to `tracing` at [`DiagnosticEvent::level`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn emit(&self, event: DiagnosticEvent) {
        let stream_id = event.stream_id();
        match event.level() {
            Level::ERROR => error!(stream_id, "{event}"),
            Level::WARN => warn!(stream_id, "{event}"),
            Level::INFO => info!(stream_id, "{event}"),
            _ => tracing::debug!(stream_id, "{event}"),
        }
    }
}

/// One captured event.
#[derive(Debug, Clone)]
pub struct DiagnosticRecord {
    /// Seconds since the sink was created.
    pub elapsed_secs: f64,
    pub event: DiagnosticEvent,
}

#[derive(Debug)]
struct RingBuffer {
    records: VecDeque<DiagnosticRecord>,
    capacity: usize,
    start_time: Instant,
}

impl RingBuffer {
    fn push(&mut self, event: DiagnosticEvent) {
        if self.records.len() >= self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(DiagnosticRecord {
            elapsed_secs: self.start_time.elapsed().as_secs_f64(),
            event,
        });
    }
}

/// Keeps the most recent events in a bounded ring buffer.
///
/// Clones share the same buffer.
#[derive(Debug, Clone)]
pub struct MemorySink {
    buffer: Arc<Mutex<RingBuffer>>,
}

impl MemorySink {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: Arc::new(Mutex::new(RingBuffer {
                records: VecDeque::with_capacity(capacity),
                capacity,
                start_time: Instant::now(),
            })),
        }
    }

    /// Snapshot of captured records, oldest first.
    pub fn records(&self) -> Vec<DiagnosticRecord> {
        self.buffer
            .lock()
            .map(|buf| buf.records.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of captured events, oldest first.
    pub fn events(&self) -> Vec<DiagnosticEvent> {
        self.records().into_iter().map(|r| r.event).collect()
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().map(|buf| buf.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut buf) = self.buffer.lock() {
            buf.records.clear();
        }
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl DiagnosticSink for MemorySink {
    fn emit(&self, event: DiagnosticEvent) {
        if let Ok(mut buf) = self.buffer.lock() {
            buf.push(event);
        }
    }
}
