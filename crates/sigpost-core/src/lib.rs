#![deny(unsafe_code)]

//! sigpost core: the signaling protocol and its dispatch engine.
//!
//! A client and a server exchange frames that carry one enumerated signal
//! alongside a payload. The server keeps a durable per-client mailbox of
//! pending commands and file transfers; each time a client checks in, the
//! server hands over the next piece of work and routes whatever the client
//! sends back.

use std::future::Future;
use std::pin::Pin;

/// A type-erased, `Send`-safe, boxed future, used as the return type for
/// async trait methods that have to stay object-safe (`dyn FrameSink`).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Client-side state machine and check-in loop.
pub mod client;
/// Validated client identifiers.
pub mod client_id;
/// Chunking, reassembly, and delimiter multiplexing.
pub mod codec;
/// Operator-facing diagnostic events and sinks.
pub mod diag;
/// Stock and free-form command execution.
pub mod exec;
/// Per-client pacing of outbound command frames.
pub mod pacing;
/// Server-side state machine, listener, and staleness sweep.
pub mod server;
/// The signal catalog.
pub mod signal;
/// SQLite-backed client registry and mailbox.
pub mod store;
/// Frame envelope and stream reader/writer.
pub mod wire;

pub use client::{ClientMachine, ClientRuntime, ClientState};
pub use client_id::ClientId;
pub use diag::{DiagnosticEvent, DiagnosticSink, MemorySink, TracingSink};
pub use pacing::Pacer;
pub use server::{Flow, Server, ServerMachine};
pub use signal::{Category, Signal};
pub use store::{ClientRecord, Store, StoreError};
pub use wire::{Envelope, Frame, FrameReader, FrameSink, FrameWriter, StreamId};
