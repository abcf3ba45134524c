//! TCP server for inbound peer traffic.

use crate::error::{NetworkError, Result};
use crate::network::rpc::{read_frame, write_frame, Message};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Handler for incoming messages.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle an incoming message and optionally return a response.
    async fn handle(&self, msg: Message) -> Option<Message>;
}

/// TCP server accepting peer connections.
pub struct NetworkServer {
    listener: TcpListener,

    /// Address actually bound.
    local_addr: SocketAddr,

    /// Largest accepted frame.
    max_message_size: usize,

    /// Shutdown signal receiver.
    shutdown_rx: mpsc::Receiver<()>,
}

impl NetworkServer {
    /// Bind a new network server. Port 0 picks a free port.
    pub async fn bind(
        bind_addr: SocketAddr,
        max_message_size: usize,
    ) -> Result<(Self, mpsc::Sender<()>)> {
        let listener = TcpListener::bind(bind_addr).await.map_err(NetworkError::Io)?;
        let local_addr = listener.local_addr().map_err(NetworkError::Io)?;
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let server = Self {
            listener,
            local_addr,
            max_message_size,
            shutdown_rx,
        };

        Ok((server, shutdown_tx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve connections with `handler` until shutdown. Open connections
    /// are closed on exit.
    pub async fn run(mut self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        info!(addr = %self.local_addr, "Network server listening");
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!(peer = %peer_addr, "Accepted connection");
                            let handler = handler.clone();
                            let max = self.max_message_size;
                            connections.spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, handler, max).await {
                                    debug!(peer = %peer_addr, error = %e, "Connection handler error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = self.shutdown_rx.recv() => {
                    info!(addr = %self.local_addr, "Network server shutting down");
                    break;
                }
            }
        }

        connections.shutdown().await;
        Ok(())
    }

    async fn handle_connection(
        stream: TcpStream,
        handler: Arc<dyn MessageHandler>,
        max_message_size: usize,
    ) -> Result<()> {
        stream.set_nodelay(true).ok();
        let (mut reader, mut writer) = stream.into_split();
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Message>();

        let writer_task = tokio::spawn(async move {
            while let Some(msg) = reply_rx.recv().await {
                if write_frame(&mut writer, &msg, max_message_size).await.is_err() {
                    break;
                }
            }
        });

        // Each message is handled on its own task so slow handlers do not
        // hold up later calls on the same connection.
        let result = loop {
            let msg = match read_frame(&mut reader, max_message_size).await {
                Ok(Some(msg)) => msg,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };

            let handler = handler.clone();
            let reply_tx = reply_tx.clone();
            tokio::spawn(async move {
                if let Some(response) = handler.handle(msg).await {
                    let _ = reply_tx.send(response);
                }
            });
        };

        drop(reply_tx);
        let _ = writer_task.await;
        result
    }
}
