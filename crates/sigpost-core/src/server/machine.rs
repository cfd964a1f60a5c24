//! Per-connection server state machine.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use sigpost_config::AppConfig;

use super::ServerError;
use crate::codec::{self, DELIMITER, Reassembler};
use crate::diag::{DiagnosticEvent, DiagnosticSink};
use crate::exec::Command;
use crate::pacing::Pacer;
use crate::signal::{Category, Signal};
use crate::store::{Store, StoreError};
use crate::wire::{Envelope, FrameSink, StreamId, TERMINATE_REASON};

/// Liveness payload a client sends with its hello.
pub const HELLO_PAYLOAD: &[u8] = b"Hello!";

/// Whether the connection should keep being read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// State shared by every connection handler and the staleness sweep.
pub struct ServerContext {
    pub store: Store,
    pub pacer: Pacer,
    pub diag: Arc<dyn DiagnosticSink>,
    /// Where uploaded client files land.
    pub upload_dir: PathBuf,
    /// Largest payload per outbound file chunk.
    pub max_chunk: usize,
    /// Refresh `last_seen` when a registered client says hello again.
    pub refresh_on_hello: bool,
    /// Clients that desynchronized after their reply was already closed.
    /// They are told to terminate at their next check-in.
    pub(crate) deferred_kills: Mutex<HashSet<StreamId>>,
}

impl ServerContext {
    pub fn new(config: &AppConfig, store: Store, diag: Arc<dyn DiagnosticSink>) -> Self {
        Self {
            store,
            pacer: Pacer::from_config(&config.pacing),
            diag,
            upload_dir: PathBuf::from(&config.server.upload_dir),
            max_chunk: config.transfer.max_chunk_bytes,
            refresh_on_hello: config.registry.refresh_on_hello,
            deferred_kills: Mutex::new(HashSet::new()),
        }
    }

    fn defer_kill(&self, id: StreamId) {
        if let Ok(mut kills) = self.deferred_kills.lock() {
            kills.insert(id);
        }
    }

    fn take_deferred_kill(&self, id: StreamId) -> bool {
        self.deferred_kills
            .lock()
            .map(|mut kills| kills.remove(&id))
            .unwrap_or(false)
    }

    pub(crate) fn store_failure(&self, operation: &'static str, err: StoreError) {
        self.diag.emit(DiagnosticEvent::StoreFailure {
            operation,
            error: err.to_string(),
        });
    }
}

/// Turn one queued mailbox item into a command.
///
/// Numeric text naming a stock signal and stock names (any case) become
/// stock commands; everything else, including unknown numbers, is free-form
/// text. Blank items yield `None`.
pub fn classify(item: &str) -> Option<Command> {
    let item = item.trim();
    if item.is_empty() {
        return None;
    }
    if let Ok(code) = item.parse::<u32>() {
        let signal = Signal::decode(code);
        if signal.is_stock() {
            return Some(Command::Stock(signal));
        }
        return Some(Command::Custom(item.to_string()));
    }
    match Signal::from_name(item) {
        Some(signal) if signal.is_stock() => Some(Command::Stock(signal)),
        _ => Some(Command::Custom(item.to_string())),
    }
}

/// What the server does with an inbound signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handler {
    Hello,
    Response,
    FileChunk,
    FileNotFound,
    ClientFail,
    /// Terminate the client: the signal could not be decoded.
    Desync,
    /// A valid signal a client has no business sending.
    Unexpected,
}

fn handler_for(signal: Signal) -> Handler {
    match (signal.category(), signal) {
        (Category::Client, Signal::ClientHello) => Handler::Hello,
        (Category::Client, Signal::ClientResponse) => Handler::Response,
        (Category::Client, Signal::ClientFileSend) => Handler::FileChunk,
        (Category::Client, Signal::ClientFail) => Handler::ClientFail,
        (Category::Status, Signal::FileNotFound) => Handler::FileNotFound,
        (Category::Status, Signal::Invalid) => Handler::Desync,
        _ => Handler::Unexpected,
    }
}

/// An upload in progress on this connection.
struct Upload {
    path: PathBuf,
    writer: Reassembler<tokio::fs::File>,
}

/// Reacts to the frames of one client connection.
pub struct ServerMachine {
    ctx: Arc<ServerContext>,
    stream_id: Option<StreamId>,
    /// Last signal received; reset to the default on desync.
    last_signal: Signal,
    /// File requested from the client during this interaction.
    requested: Option<String>,
    upload: Option<Upload>,
    /// Set once the hello of this interaction has been answered.
    replied: bool,
}

impl ServerMachine {
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        Self {
            ctx,
            stream_id: None,
            last_signal: Signal::default(),
            requested: None,
            upload: None,
            replied: false,
        }
    }

    /// Client id learned from the first frame, if any.
    pub fn stream_id(&self) -> Option<StreamId> {
        self.stream_id
    }

    pub fn last_signal(&self) -> Signal {
        self.last_signal
    }

    /// Handle one DATA frame, writing any reply to `sink`.
    pub async fn handle(
        &mut self,
        envelope: Envelope,
        sink: &mut dyn FrameSink,
    ) -> Result<Flow, ServerError> {
        let id = envelope.stream_id;
        self.stream_id.get_or_insert(id);
        let signal = envelope.signal();
        self.last_signal = signal;

        match handler_for(signal) {
            Handler::Hello => {
                // One interaction per connection: the mailbox is only drained
                // for the first hello.
                if self.replied {
                    warn!(stream_id = id, "Ignoring repeated hello on one connection");
                    return Ok(Flow::Continue);
                }
                self.replied = true;
                if self.ctx.take_deferred_kill(id) {
                    info!(stream_id = id, "Delivering deferred kill");
                    sink.send(Envelope::bare(id, Signal::ClientKill).into())
                        .await?;
                    return Ok(Flow::Stop);
                }
                self.on_hello(id, sink).await?;
                Ok(Flow::Continue)
            }
            Handler::Response => {
                let output = String::from_utf8_lossy(&envelope.payload).trim().to_string();
                self.ctx
                    .diag
                    .emit(DiagnosticEvent::ClientOutput { stream_id: id, output });
                Ok(Flow::Continue)
            }
            Handler::FileChunk => {
                self.on_file_chunk(id, &envelope.payload).await?;
                Ok(Flow::Continue)
            }
            Handler::FileNotFound => {
                self.requested = None;
                self.ctx
                    .diag
                    .emit(DiagnosticEvent::FileNotFound { stream_id: id });
                Ok(Flow::Continue)
            }
            Handler::ClientFail => {
                let detail = String::from_utf8_lossy(&envelope.payload).trim().to_string();
                self.ctx
                    .diag
                    .emit(DiagnosticEvent::ClientFailed { stream_id: id, detail });
                Ok(Flow::Continue)
            }
            Handler::Desync => {
                self.last_signal = Signal::default();
                self.ctx.diag.emit(DiagnosticEvent::ProtocolDesync {
                    stream_id: id,
                    code: envelope.code,
                });
                if sink.is_open() {
                    sink.send(Envelope::bare(id, Signal::ClientKill).into())
                        .await?;
                } else {
                    debug!(stream_id = id, "Reply already closed, deferring kill");
                    self.ctx.defer_kill(id);
                }
                Ok(Flow::Stop)
            }
            Handler::Unexpected => {
                warn!(stream_id = id, %signal, "Ignoring unexpected signal from client");
                Ok(Flow::Continue)
            }
        }
    }

    /// Handle a disconnect notification. The connection is done either way.
    pub fn handle_close(&mut self, code: u64, reason: &str) -> Flow {
        if reason != TERMINATE_REASON {
            debug!(code, reason, "Client closed the connection");
            return Flow::Stop;
        }
        match self.ctx.store.remove(code) {
            Ok(true) => self
                .ctx
                .diag
                .emit(DiagnosticEvent::ClientRemoved { stream_id: code }),
            Ok(false) => self
                .ctx
                .diag
                .emit(DiagnosticEvent::ClientUnknown { stream_id: code }),
            Err(e) => self.ctx.store_failure("remove", e),
        }
        Flow::Stop
    }

    /// Wrap up after the client stops sending: close any upload.
    pub async fn finish(&mut self) -> Result<Option<PathBuf>, ServerError> {
        let Some(upload) = self.upload.take() else {
            return Ok(None);
        };
        let bytes = upload.writer.bytes_written();
        upload.writer.finish().await?;
        if let Some(id) = self.stream_id {
            self.ctx.diag.emit(DiagnosticEvent::FileReceived {
                stream_id: id,
                path: upload.path.clone(),
                bytes,
            });
        }
        Ok(Some(upload.path))
    }

    async fn on_hello(&mut self, id: StreamId, sink: &mut dyn FrameSink) -> Result<(), ServerError> {
        let ctx = Arc::clone(&self.ctx);
        match ctx.store.register(id) {
            Ok(true) => ctx.diag.emit(DiagnosticEvent::ClientRegistered { stream_id: id }),
            Ok(false) => {
                if ctx.refresh_on_hello
                    && let Err(e) = ctx.store.touch(id)
                {
                    ctx.store_failure("touch", e);
                }
                ctx.diag.emit(DiagnosticEvent::ClientReturned { stream_id: id });
            }
            Err(e) => ctx.store_failure("register", e),
        }

        // Priority: commands, then a file to push, then a file to pull.
        match ctx.store.take_commands(id) {
            Ok(items) => {
                let commands: Vec<Command> = items.iter().filter_map(|i| classify(i)).collect();
                if !commands.is_empty() {
                    return self.dispatch_commands(id, commands, sink).await;
                }
            }
            Err(e) => ctx.store_failure("take_commands", e),
        }

        match ctx.store.take_outbound_file(id) {
            Ok(Some(filename)) => return self.send_file(id, &filename, sink).await,
            Ok(None) => {}
            Err(e) => ctx.store_failure("take_outbound_file", e),
        }

        match ctx.store.take_inbound_file(id) {
            Ok(Some(filename)) => {
                debug!(stream_id = id, %filename, "Requesting file from client");
                let payload = format!("{filename}{DELIMITER}");
                self.requested = Some(filename);
                return self
                    .send_chunked(id, Signal::ServerFileRecv, payload.as_bytes(), sink)
                    .await;
            }
            Ok(None) => {}
            Err(e) => ctx.store_failure("take_inbound_file", e),
        }

        sink.send(Envelope::bare(id, Signal::NoResponseNeeded).into())
            .await?;
        Ok(())
    }

    async fn dispatch_commands(
        &self,
        id: StreamId,
        commands: Vec<Command>,
        sink: &mut dyn FrameSink,
    ) -> Result<(), ServerError> {
        let labels: Vec<String> = commands.iter().map(Command::label).collect();
        let announcement = codec::join_items(&labels);
        self.send_chunked(id, Signal::ServerSeesHello, announcement.as_bytes(), sink)
            .await?;

        // Pacing is per command; the chunks of one command go out together.
        for command in &commands {
            self.ctx.pacer.wait(id).await;
            debug!(stream_id = id, command = %command.label(), "Sending command");
            match command {
                Command::Stock(signal) => {
                    sink.send(Envelope::new(id, *signal, DELIMITER).into())
                        .await?
                }
                Command::Custom(text) => {
                    let payload = format!("{text}{DELIMITER}");
                    self.send_chunked(id, Signal::Custom, payload.as_bytes(), sink)
                        .await?
                }
            }
        }

        self.ctx
            .diag
            .emit(DiagnosticEvent::CommandsDispatched { stream_id: id, labels });
        Ok(())
    }

    /// Send `payload` as consecutive `signal` frames of at most `max_chunk` bytes.
    async fn send_chunked(
        &self,
        id: StreamId,
        signal: Signal,
        payload: &[u8],
        sink: &mut dyn FrameSink,
    ) -> Result<(), ServerError> {
        for piece in codec::chunk(payload, self.ctx.max_chunk) {
            sink.send(Envelope::new(id, signal, piece).into()).await?;
        }
        Ok(())
    }

    fn file_unavailable(&self, id: StreamId, filename: &str, err: &std::io::Error) {
        self.ctx.diag.emit(DiagnosticEvent::FileUnavailable {
            stream_id: id,
            filename: filename.to_string(),
            error: err.to_string(),
        });
    }

    async fn send_file(
        &self,
        id: StreamId,
        filename: &str,
        sink: &mut dyn FrameSink,
    ) -> Result<(), ServerError> {
        let mut file = match codec::open_source(filename).await {
            Ok(file) => file,
            Err(e) => {
                self.file_unavailable(id, filename, &e);
                sink.send(Envelope::bare(id, Signal::NoResponseNeeded).into())
                    .await?;
                return Ok(());
            }
        };

        let max = self.ctx.max_chunk.max(1) as u64;
        let mut sent = 0u64;
        let mut chunks = 0u64;
        loop {
            let mut chunk = Vec::with_capacity(max as usize);
            if let Err(e) = (&mut file).take(max).read_to_end(&mut chunk).await {
                self.file_unavailable(id, filename, &e);
                if chunks == 0 {
                    sink.send(Envelope::bare(id, Signal::NoResponseNeeded).into())
                        .await?;
                }
                return Ok(());
            }
            // An empty file still gets one frame so the client creates it.
            if chunk.is_empty() && chunks > 0 {
                break;
            }
            let len = chunk.len() as u64;
            sink.send(Envelope::new(id, Signal::ServerFileSend, chunk).into())
                .await?;
            sent += len;
            chunks += 1;
            if len < max {
                break;
            }
        }

        self.ctx.diag.emit(DiagnosticEvent::FileSent {
            stream_id: id,
            filename: filename.to_string(),
            bytes: sent,
        });
        Ok(())
    }

    async fn on_file_chunk(&mut self, id: StreamId, chunk: &[u8]) -> Result<(), ServerError> {
        if self.upload.is_none() {
            let path = upload_path(&self.ctx.upload_dir, id, self.requested.as_deref());
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            // A repeated pull of the same file replaces the earlier copy.
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&path)
                .await?;
            debug!(stream_id = id, path = %path.display(), "Receiving file");
            self.upload = Some(Upload {
                path,
                writer: Reassembler::new(file),
            });
        }
        if let Some(upload) = self.upload.as_mut() {
            upload.writer.append(chunk).await?;
        }
        Ok(())
    }
}

/// `<dir>/<id>-<basename>`, or `<dir>/<id>-unsolicited.bin` with no request.
fn upload_path(dir: &Path, id: StreamId, requested: Option<&str>) -> PathBuf {
    let name = requested
        .and_then(|r| Path::new(r).file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unsolicited.bin".to_string());
    dir.join(format!("{id}-{name}"))
}
