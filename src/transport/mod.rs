//! Transport Module
//!
//! TCP communication between cluster members. Every request gets exactly one
//! response frame on the same connection.

mod client;
mod protocol;
mod server;

pub use client::PeerClient;
pub use protocol::{Frame, FrameHeader};
pub use server::{FrameHandler, PeerServer};

use crate::error::{Error, Result};

/// Read a framed message from a reader
pub async fn read_frame<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
    use tokio::io::AsyncReadExt;

    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length > FrameHeader::MAX_LENGTH {
        return Err(Error::Network(format!(
            "Frame of {} bytes exceeds the {} byte limit",
            header.length,
            FrameHeader::MAX_LENGTH
        )));
    }

    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    if crc32fast::hash(&body) != header.checksum {
        return Err(Error::Network("Frame checksum mismatch".into()));
    }

    Ok(Frame::deserialize(&body)?)
}

/// Write a framed message to a writer
pub async fn write_frame<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let body = frame.serialize()?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        write_frame(&mut a, &Frame::Error { reason: "nope".into() })
            .await
            .unwrap();

        match read_frame(&mut b).await.unwrap() {
            Frame::Error { reason } => assert_eq!(reason, "nope"),
            other => panic!("unexpected {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn test_corrupted_body_is_rejected() {
        use tokio::io::AsyncWriteExt;

        let body = Frame::LeaveAck.serialize().unwrap();
        let mut header = FrameHeader::new(&body);
        header.checksum ^= 0xFFFF;

        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&header.to_bytes()).await.unwrap();
        a.write_all(&body).await.unwrap();

        assert!(matches!(read_frame(&mut b).await, Err(Error::Network(_))));
    }
}
