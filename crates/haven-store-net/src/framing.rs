//! Message framing for network transport
//!
//! Length-prefixed frames carrying postcard-encoded messages.

use bytes::{Buf, BufMut, BytesMut};
use haven_store_core::request::MutationRequest;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum frame size (16 MB)
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    TooLarge(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<postcard::Error> for FrameError {
    fn from(e: postcard::Error) -> Self {
        FrameError::Serialization(e.to_string())
    }
}

/// A framed message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Frame type
    pub frame_type: FrameType,
    /// Payload bytes
    pub payload: Vec<u8>,
}

/// Frame types
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    /// Ping for keepalive
    Ping = 0,
    /// Pong response
    Pong = 1,
    /// Peer introduces itself with its transport public key
    Hello = 2,
    /// Add-record mutation
    AddData = 10,
    /// Remove-record mutation
    RemoveData = 11,
    /// Refresh-record mutation
    RefreshData = 12,
    /// Inventory request carrying a data filter
    InventoryRequest = 20,
    /// Inventory response carrying the diff
    InventoryResponse = 21,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Ping),
            1 => Ok(Self::Pong),
            2 => Ok(Self::Hello),
            10 => Ok(Self::AddData),
            11 => Ok(Self::RemoveData),
            12 => Ok(Self::RefreshData),
            20 => Ok(Self::InventoryRequest),
            21 => Ok(Self::InventoryResponse),
            _ => Err(FrameError::Serialization(format!(
                "Unknown frame type: {}",
                value
            ))),
        }
    }
}

/// Codec for length-prefixed frames
///
/// Wire format:
/// - 4 bytes: length (big-endian, includes type byte)
/// - 1 byte: frame type
/// - N bytes: payload
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least 5 bytes (4 length + 1 type)
        if src.len() < 5 {
            return Ok(None);
        }

        // Peek at length
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }

        // Need full frame
        if src.len() < 4 + length {
            return Ok(None);
        }

        // Consume length prefix
        src.advance(4);

        // Read frame type
        let frame_type = FrameType::try_from(src[0])?;
        src.advance(1);

        // Read payload
        let payload_len = length - 1;
        let payload = src.split_to(payload_len).to_vec();

        Ok(Some(Frame { frame_type, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = 1 + item.payload.len();
        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }

        dst.put_u32(length as u32);
        dst.put_u8(item.frame_type as u8);
        dst.put_slice(&item.payload);

        Ok(())
    }
}

impl Frame {
    /// Create a new frame
    pub fn new(frame_type: FrameType, payload: Vec<u8>) -> Self {
        Self { frame_type, payload }
    }

    /// Create a ping frame
    pub fn ping() -> Self {
        Self::new(FrameType::Ping, vec![])
    }

    /// Create a pong frame
    pub fn pong() -> Self {
        Self::new(FrameType::Pong, vec![])
    }

    /// Frame a mutation request. The frame type mirrors the mutation kind so
    /// a node can route without decoding the payload.
    pub fn from_mutation(request: &MutationRequest) -> Result<Self, FrameError> {
        let frame_type = match request {
            MutationRequest::AddAuthenticated(_)
            | MutationRequest::AddMailbox(_)
            | MutationRequest::AddAppendOnly(_) => FrameType::AddData,
            MutationRequest::RemoveAuthenticated(_) | MutationRequest::RemoveMailbox(_) => {
                FrameType::RemoveData
            }
            MutationRequest::RefreshAuthenticated(_) => FrameType::RefreshData,
        };
        let payload = postcard::to_allocvec(request)?;
        Ok(Self::new(frame_type, payload))
    }

    /// Decode the mutation request carried by a data frame.
    pub fn mutation(&self) -> Result<MutationRequest, FrameError> {
        Ok(postcard::from_bytes(&self.payload)?)
    }
}

/// Message serialization helpers
pub mod messages {
    use super::*;
    use haven_store_core::filter::{DataFilter, Inventory};

    /// Hello message carrying the peer's transport public key
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct HelloMessage {
        pub public_key: [u8; 32],
    }

    /// Inventory request message
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct InventoryRequestMessage {
        pub filter: DataFilter,
        pub max_items: u32,
    }

    /// Inventory response message
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct InventoryResponseMessage {
        pub inventory: Inventory,
    }

    impl HelloMessage {
        pub fn to_frame(&self) -> Result<Frame, FrameError> {
            let payload = postcard::to_allocvec(self)?;
            Ok(Frame::new(FrameType::Hello, payload))
        }

        pub fn from_frame(frame: &Frame) -> Result<Self, FrameError> {
            Ok(postcard::from_bytes(&frame.payload)?)
        }
    }

    impl InventoryRequestMessage {
        pub fn to_frame(&self) -> Result<Frame, FrameError> {
            let payload = postcard::to_allocvec(self)?;
            Ok(Frame::new(FrameType::InventoryRequest, payload))
        }

        pub fn from_frame(frame: &Frame) -> Result<Self, FrameError> {
            Ok(postcard::from_bytes(&frame.payload)?)
        }
    }

    impl InventoryResponseMessage {
        pub fn to_frame(&self) -> Result<Frame, FrameError> {
            let payload = postcard::to_allocvec(self)?;
            Ok(Frame::new(FrameType::InventoryResponse, payload))
        }

        pub fn from_frame(frame: &Frame) -> Result<Self, FrameError> {
            Ok(postcard::from_bytes(&frame.payload)?)
        }
    }
}
