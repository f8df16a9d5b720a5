//! Peer Server
//!
//! TCP server accepting frames from other members.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use super::{read_frame, write_frame, Frame};
use crate::error::{Error, Result};

/// Produces the response for one inbound frame
pub type FrameHandler = Arc<dyn Fn(SocketAddr, Frame) -> Frame + Send + Sync>;

/// Peer server for cluster communication
pub struct PeerServer {
    bind_address: String,
    handler: FrameHandler,
    shutdown: watch::Sender<bool>,
}

impl PeerServer {
    pub fn new(bind_address: impl Into<String>, handler: FrameHandler) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            bind_address: bind_address.into(),
            handler,
            shutdown,
        }
    }

    /// Bind the listening socket
    pub async fn bind(&self) -> Result<TcpListener> {
        TcpListener::bind(&self.bind_address)
            .await
            .map_err(|e| Error::Network(format!("Failed to bind {}: {}", self.bind_address, e)))
    }

    /// Accept connections until `stop` is called
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let mut shutdown_rx = self.shutdown.subscribe();
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        tracing::info!(
            "Peer server listening on {}",
            listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| self.bind_address.clone())
        );

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let handler = Arc::clone(&self.handler);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, addr, handler).await {
                                    tracing::warn!("Connection error from {}: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Peer server stopped");
        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

async fn handle_connection(socket: TcpStream, peer: SocketAddr, handler: FrameHandler) -> Result<()> {
    socket.set_nodelay(true)?;
    let (mut reader, mut writer) = socket.into_split();

    loop {
        match read_frame(&mut reader).await {
            Ok(frame) => {
                tracing::trace!("Received {} from {}", frame.type_name(), peer);
                let response = handler(peer, frame);
                write_frame(&mut writer, &response).await?;
            }
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(e) => {
                tracing::warn!("Error reading frame from {}: {}", peer, e);
                break;
            }
        }
    }

    Ok(())
}
