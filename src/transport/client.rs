//! Peer Client
//!
//! One-shot request/response connections to other members.

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{read_frame, write_frame, Frame};
use crate::error::{Error, Result};

/// Peer client for connecting to other members
#[derive(Debug, Clone)]
pub struct PeerClient {
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl PeerClient {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            request_timeout,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Send a frame to a peer and wait for its response
    pub async fn request(&self, address: &str, frame: &Frame) -> Result<Frame> {
        let mut stream = self.connect(address).await?;

        let result = timeout(self.request_timeout, async {
            let (mut reader, mut writer) = stream.split();
            write_frame(&mut writer, frame).await?;
            read_frame(&mut reader).await
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    async fn connect(&self, address: &str) -> Result<TcpStream> {
        let result = timeout(self.connect_timeout, TcpStream::connect(address)).await;

        match result {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }
}
