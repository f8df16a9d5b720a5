//! Peer Protocol
//!
//! Defines the frames exchanged between cluster members.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cluster::{ClusterMember, ClusterMessage};

/// Frames for member-to-member communication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    // ========== Probing ==========
    /// Liveness probe, carrying the prober so the receiver learns about it too
    Ping {
        domain: String,
        member: ClusterMember,
    },

    /// Probe response
    Pong {
        member: ClusterMember,
    },

    // ========== Messages ==========
    /// Deliver a cluster message (live broadcast or replay)
    Deliver {
        message: ClusterMessage,
        replay: bool,
    },

    /// Sent once the message has been handed to the receiver's handler
    Ack {
        uuid: Uuid,
    },

    // ========== Membership ==========
    /// Graceful departure notice
    Leave {
        domain: String,
        member_id: String,
    },

    /// Leave acknowledged
    LeaveAck,

    // ========== Error ==========
    /// Error response
    Error {
        reason: String,
    },
}

impl Frame {
    /// Serialize frame to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize frame from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the frame type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Frame::Ping { .. } => "Ping",
            Frame::Pong { .. } => "Pong",
            Frame::Deliver { .. } => "Deliver",
            Frame::Ack { .. } => "Ack",
            Frame::Leave { .. } => "Leave",
            Frame::LeaveAck => "LeaveAck",
            Frame::Error { .. } => "Error",
        }
    }
}

/// Frame header for length-prefixed frames
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Body length
    pub length: u32,
    /// Body checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Largest body accepted from a peer
    pub const MAX_LENGTH: u32 = 16 * 1024 * 1024;

    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            length: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            checksum: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }
}
