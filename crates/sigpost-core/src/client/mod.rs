//! Client runtime: periodic check-ins against the server.

mod machine;

use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use sigpost_config::AppConfig;

use crate::client_id::ClientId;
use crate::exec::{CommandRunner, ShellRunner};
use crate::server::ShutdownSignal;
use crate::wire::{Frame, FrameReader, FrameSink, FrameWriter, StreamId, TransportError};

pub use machine::{ClientMachine, ClientSettings, ClientState, ERROR_PAYLOAD};

/// Errors from the client runtime.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("client was terminated by the server")]
    Terminated,
}

/// Why [`ClientRuntime::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientExit {
    /// The server sent a kill.
    Killed,
    /// Local shutdown; the server was told to forget us.
    Shutdown,
}

/// Drives a [`ClientMachine`] through repeated check-ins.
pub struct ClientRuntime {
    id: ClientId,
    server_addr: String,
    checkin_secs: Range<u64>,
    settings: ClientSettings,
    runner: Arc<dyn CommandRunner>,
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
}

impl ClientRuntime {
    pub fn new(config: &AppConfig, id: ClientId) -> Self {
        let runner = ShellRunner::new().with_timeout_secs(config.client.command_timeout_secs);
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            id,
            server_addr: config.client.server_addr.clone(),
            checkin_secs: config.client.checkin_min_secs..config.client.checkin_max_secs,
            settings: ClientSettings {
                download_dir: PathBuf::from(&config.client.download_dir),
                max_chunk: config.transfer.max_chunk_bytes,
            },
            runner: Arc::new(runner),
            shutdown_tx,
        }
    }

    /// Replace the command runner.
    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// A fresh state machine bound to this client's id and settings.
    pub fn machine(&self) -> ClientMachine {
        ClientMachine::new(
            self.id.get(),
            Arc::clone(&self.runner),
            self.settings.clone(),
        )
    }

    /// Request a graceful shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(ShutdownSignal);
    }

    /// Random delay before the next check-in.
    pub fn checkin_delay(&self) -> Duration {
        let secs = if self.checkin_secs.is_empty() {
            self.checkin_secs.start
        } else {
            rand::rng().random_range(self.checkin_secs.clone())
        };
        Duration::from_secs(secs)
    }

    /// Check in until killed by the server or shut down locally.
    pub async fn run(&self) -> Result<ClientExit, ClientError> {
        info!(client_id = %self.id, server = %self.server_addr, "sigpost client starting");
        let mut machine = self.machine();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            let outcome = tokio::select! {
                outcome = self.check_in(&mut machine) => outcome,
                _ = shutdown_rx.recv() => return Ok(self.say_goodbye().await),
                _ = tokio::signal::ctrl_c() => return Ok(self.say_goodbye().await),
            };
            match outcome {
                Ok(ClientState::Terminated) => {
                    info!(client_id = %self.id, "Terminated by server");
                    return Ok(ClientExit::Killed);
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Check-in failed"),
            }

            let delay = self.checkin_delay();
            debug!(delay_secs = delay.as_secs(), "Sleeping until next check-in");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.recv() => return Ok(self.say_goodbye().await),
                _ = tokio::signal::ctrl_c() => return Ok(self.say_goodbye().await),
            }
        }
    }

    async fn check_in(&self, machine: &mut ClientMachine) -> Result<ClientState, ClientError> {
        let stream = TcpStream::connect(&self.server_addr).await?;
        interact(machine, stream).await
    }

    /// Tell the server to drop our registry record. Failures are only logged.
    async fn say_goodbye(&self) -> ClientExit {
        info!(client_id = %self.id, "Shutting down, notifying server");
        let result = async {
            let stream = TcpStream::connect(&self.server_addr).await?;
            send_terminate(self.id.get(), stream).await
        }
        .await;
        if let Err(e) = result {
            warn!(error = %e, "Could not notify server of shutdown");
        }
        ClientExit::Shutdown
    }
}

/// Run one interaction over `stream`: hello, then every server frame until
/// the server finishes.
///
/// A kill stops all I/O at once and returns [`ClientState::Terminated`].
pub async fn interact<S>(machine: &mut ClientMachine, stream: S) -> Result<ClientState, ClientError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FrameReader::new(read_half);
    let mut writer = FrameWriter::new(write_half);

    machine.connect(&mut writer).await?;
    while let Some(frame) = reader.next().await? {
        match frame {
            Frame::Data(envelope) => {
                machine.handle(envelope, &mut writer).await?;
                if machine.is_terminated() {
                    return Ok(ClientState::Terminated);
                }
            }
            Frame::Close { code, reason } => {
                debug!(code, %reason, "Server sent a disconnect");
            }
        }
    }
    machine.end_of_stream().await?;
    writer.finish().await?;
    Ok(machine.state())
}

/// Send the terminate disconnect for `id` over `stream`.
pub async fn send_terminate<S>(id: StreamId, stream: S) -> Result<(), ClientError>
where
    S: AsyncWrite + Send + Unpin,
{
    let mut writer = FrameWriter::new(stream);
    writer.send(Frame::terminate(id)).await?;
    writer.finish().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_checkin_delay_in_range() {
        let config = AppConfig::default();
        let runtime = ClientRuntime::new(&config, ClientId::new(8).unwrap());
        for _ in 0..100 {
            let delay = runtime.checkin_delay().as_secs();
            assert!((6..9).contains(&delay), "{delay}");
        }
    }

    #[test]
    fn test_machine_uses_runtime_id() {
        let runtime = ClientRuntime::new(&AppConfig::default(), ClientId::new(1024).unwrap());
        assert_eq!(runtime.machine().id(), 1024);
        assert_eq!(runtime.id().get(), 1024);
    }

    #[tokio::test]
    async fn test_send_terminate_writes_close() {
        let (a, b) = tokio::io::duplex(1024);
        send_terminate(12, a).await.unwrap();
        let mut reader = FrameReader::new(b);
        assert_eq!(reader.next().await.unwrap(), Some(Frame::terminate(12)));
        assert_eq!(reader.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_run_returns_on_shutdown() {
        // Nothing listens here, so every check-in fails fast.
        let mut config = AppConfig::default();
        config.client.server_addr = "127.0.0.1:9".to_string();
        config.client.checkin_min_secs = 1;
        config.client.checkin_max_secs = 2;
        let runtime = Arc::new(ClientRuntime::new(&config, ClientId::new(8).unwrap()));
        let running = {
            let runtime = Arc::clone(&runtime);
            tokio::spawn(async move { runtime.run().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        runtime.shutdown();
        assert_eq!(running.await.unwrap().unwrap(), ClientExit::Shutdown);
    }
}
