//! Server runtime: TCP listener, per-connection tasks, and the staleness sweep.

mod machine;

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use sigpost_config::AppConfig;

use crate::diag::{DiagnosticEvent, DiagnosticSink};
use crate::signal::Signal;
use crate::store::{Store, StoreError};
use crate::wire::{Frame, FrameReader, FrameSink, FrameWriter, StreamId, TransportError};

pub use machine::{Flow, HELLO_PAYLOAD, ServerContext, ServerMachine, classify};

/// How long in-flight connections get to finish after shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from the server runtime.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("server startup failed: {0}")]
    Startup(String),
}

/// Shutdown signal sent via broadcast channel.
#[derive(Debug, Clone)]
pub struct ShutdownSignal;

/// The sigpost server.
pub struct Server {
    config: AppConfig,
    ctx: Arc<ServerContext>,
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
}

impl Server {
    pub fn new(config: AppConfig, store: Store, diag: Arc<dyn DiagnosticSink>) -> Self {
        let ctx = Arc::new(ServerContext::new(&config, store, diag));
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            ctx,
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Shared state handed to every connection.
    pub fn context(&self) -> Arc<ServerContext> {
        Arc::clone(&self.ctx)
    }

    /// Request a graceful shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(ShutdownSignal);
    }

    /// Bind the configured listen address.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = format!(
            "{}:{}",
            self.config.server.listen_addr, self.config.server.listen_port
        );
        TcpListener::bind(&addr)
            .await
            .map_err(|e| ServerError::Startup(format!("cannot bind {addr}: {e}")))
    }

    /// Bind and serve until Ctrl-C or [`Server::shutdown`].
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve connections from `listener` until shutdown.
    ///
    /// On the way out, waits for in-flight connections, stops the sweep, and
    /// purges the store if `store.purge_on_shutdown` is set.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "sigpost server listening");

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let sweeper = spawn_sweeper(
            self.context(),
            Duration::from_secs(self.config.server.sweep_interval_secs),
            Duration::from_secs(self.config.server.stale_threshold_secs),
            self.shutdown_tx.subscribe(),
        );
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "Accepted connection");
                        let ctx = self.context();
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(ctx, stream).await {
                                debug!(%peer, error = %e, "Connection ended with error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "Failed to accept connection"),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
                _ = tokio::signal::ctrl_c() => {
                    warn!("Ctrl-C received, initiating graceful shutdown");
                    self.shutdown();
                    break;
                }
            }
        }

        info!(active = connections.len(), "Draining connections");
        let drain = async { while connections.join_next().await.is_some() {} };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            warn!(active = connections.len(), "Drain timeout reached, aborting connections");
            connections.abort_all();
        }
        if let Err(e) = sweeper.await {
            warn!(error = %e, "Sweep task ended abnormally");
        }

        if self.config.store.purge_on_shutdown
            && let Err(e) = self.ctx.store.purge_all()
        {
            self.ctx.store_failure("purge_all", e);
        }

        info!("Server stopped");
        Ok(())
    }
}

/// Run one client interaction over `stream`.
///
/// The first hello gets the server's reply, after which the server's write
/// side is shut. Client frames are then read until the client finishes, sends
/// a disconnect, or desynchronizes. A desync seen after the reply was shut is
/// answered with a kill at the client's next check-in.
pub async fn handle_connection<S>(ctx: Arc<ServerContext>, stream: S) -> Result<(), ServerError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FrameReader::new(read_half);
    let mut writer = FrameWriter::new(write_half);
    let mut machine = ServerMachine::new(ctx);

    let result = async {
        while let Some(frame) = reader.next().await? {
            let flow = match frame {
                Frame::Data(envelope) => {
                    let is_hello = envelope.signal() == Signal::ClientHello;
                    let flow = machine.handle(envelope, &mut writer).await?;
                    if is_hello && !writer.is_finished() {
                        writer.finish().await?;
                    }
                    flow
                }
                Frame::Close { code, reason } => machine.handle_close(code, &reason),
            };
            if flow == Flow::Stop {
                break;
            }
        }
        Ok::<_, ServerError>(())
    }
    .await;

    let finished = machine.finish().await;
    if !writer.is_finished() {
        let _ = writer.finish().await;
    }
    result?;
    finished?;
    Ok(())
}

/// Evict stale clients every `every` until shutdown.
pub fn spawn_sweeper(
    ctx: Arc<ServerContext>,
    every: Duration,
    threshold: Duration,
    mut shutdown: broadcast::Receiver<ShutdownSignal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    sweep_once(&ctx, threshold).await;
                }
                _ = shutdown.recv() => break,
            }
        }
        debug!("Sweep task stopped");
    })
}

/// One staleness sweep, off the async worker threads.
pub async fn sweep_once(ctx: &Arc<ServerContext>, threshold: Duration) -> Vec<StreamId> {
    let store = ctx.store.clone();
    let swept = tokio::task::spawn_blocking(move || store.sweep_stale(threshold)).await;
    ctx.pacer.cleanup();
    match swept {
        Ok(Ok(evicted)) => {
            for id in &evicted {
                ctx.diag.emit(DiagnosticEvent::ClientEvicted { stream_id: *id });
            }
            evicted
        }
        Ok(Err(e)) => {
            ctx.store_failure("sweep_stale", e);
            Vec::new()
        }
        Err(e) => {
            warn!(error = %e, "Sweep task panicked");
            Vec::new()
        }
    }
}
