//! Wire format of the block replication protocol.
//!
//! Every command is a fixed 16 byte [`CommandHeader`] followed by
//! `payload_length` bytes. READ and WRITE payloads are a sequence of
//! [`ControlBlock`]s, one per sub-request; on WRITE each control block is
//! followed by the raw sector data it describes. Control commands (COMMIT,
//! EPOCH_TIMER, FT_NOTIFY) and COMMIT_ACK have an empty payload.
//!
//! Responses reuse the header. A READ response carries the sector data as
//! its payload; a negative `payload_length` is a remote error code and
//! carries no payload bytes at all.
//!
//! Encoding uses bincode's default configuration: little-endian, fixed-width
//! integers, no padding between fields.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::request::RequestId;

/// Bytes per sector on the virtual device.
pub const SECTOR_SIZE: usize = 512;

/// Encoded size of [`CommandHeader`].
pub const HEADER_LEN: usize = 16;

/// Encoded size of [`ControlBlock`].
pub const CONTROL_BLOCK_LEN: usize = 12;

/// Default upper bound on an inbound payload.
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CommandCode {
    Read = 1,
    Write = 2,
    /// Ask the backend to commit the current epoch.
    Commit = 3,
    /// Backend confirmation that an epoch is durable. Not tied to a request id.
    CommitAck = 4,
    EpochTimer = 5,
    FtNotify = 6,
}

impl CommandCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Control commands never enter the pending table.
    pub fn is_control(self) -> bool {
        matches!(
            self,
            CommandCode::Commit | CommandCode::EpochTimer | CommandCode::FtNotify
        )
    }
}

impl TryFrom<u32> for CommandCode {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(CommandCode::Read),
            2 => Ok(CommandCode::Write),
            3 => Ok(CommandCode::Commit),
            4 => Ok(CommandCode::CommitAck),
            5 => Ok(CommandCode::EpochTimer),
            6 => Ok(CommandCode::FtNotify),
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }
}

/// Fixed-size frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandHeader {
    pub command: u32,
    pub id: RequestId,
    pub payload_len: i32,
    pub num_reqs: u32,
}

impl CommandHeader {
    pub fn new(command: CommandCode, id: RequestId, payload_len: i32, num_reqs: u32) -> Self {
        Self {
            command: command.as_u32(),
            id,
            payload_len,
            num_reqs,
        }
    }

    /// Header for a zero-payload control command.
    pub fn control(command: CommandCode) -> Self {
        Self::new(command, 0, 0, 0)
    }

    pub fn code(&self) -> Result<CommandCode, ProtocolError> {
        CommandCode::try_from(self.command)
    }

    /// Number of payload bytes that follow the header on the wire.
    pub fn wire_payload_len(&self) -> usize {
        usize::try_from(self.payload_len).unwrap_or(0)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < HEADER_LEN {
            return Err(ProtocolError::Truncated {
                needed: HEADER_LEN,
                available: bytes.len(),
            });
        }
        Ok(bincode::deserialize(&bytes[..HEADER_LEN])?)
    }
}

/// Sector range of one sub-request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlBlock {
    pub sector: i64,
    pub nb_sectors: i32,
}

impl ControlBlock {
    pub fn new(sector: i64, nb_sectors: i32) -> Self {
        Self { sector, nb_sectors }
    }

    /// Size in bytes of the sector range.
    pub fn data_len(&self) -> Result<usize, ProtocolError> {
        usize::try_from(self.nb_sectors)
            .map(|n| n * SECTOR_SIZE)
            .map_err(|_| ProtocolError::NegativeSectorCount(self.nb_sectors))
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < CONTROL_BLOCK_LEN {
            return Err(ProtocolError::Truncated {
                needed: CONTROL_BLOCK_LEN,
                available: bytes.len(),
            });
        }
        Ok(bincode::deserialize(&bytes[..CONTROL_BLOCK_LEN])?)
    }
}

/// A complete inbound or outbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: CommandHeader,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(header: CommandHeader, payload: Vec<u8>) -> Self {
        Self { header, payload }
    }

    /// Parses one complete frame; trailing bytes are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let header = CommandHeader::decode(bytes)?;
        let end = HEADER_LEN + header.wire_payload_len();
        if bytes.len() < end {
            return Err(ProtocolError::Truncated {
                needed: end,
                available: bytes.len(),
            });
        }
        Ok(Self {
            header,
            payload: bytes[HEADER_LEN..end].to_vec(),
        })
    }

    /// Serializes header and payload into one buffer.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.payload.len());
        bincode::serialize_into(&mut bytes, &self.header)?;
        bytes.extend_from_slice(&self.payload);
        Ok(bytes)
    }
}

/// One sub-request decoded from a READ or WRITE payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubRequest {
    pub control: ControlBlock,
    /// Raw sector data; empty for reads.
    pub data: Vec<u8>,
}

/// Splits a READ or WRITE payload into its sub-requests.
///
/// This is the backend's view of an outbound frame.
pub fn split_requests(
    header: &CommandHeader,
    payload: &[u8],
) -> Result<Vec<SubRequest>, ProtocolError> {
    let with_data = header.code()? == CommandCode::Write;
    let mut requests =
        Vec::with_capacity((header.num_reqs as usize).min(payload.len() / CONTROL_BLOCK_LEN));
    let mut rest = payload;

    for _ in 0..header.num_reqs {
        let control = ControlBlock::decode(rest)?;
        rest = &rest[CONTROL_BLOCK_LEN..];

        let data = if with_data {
            let len = control.data_len()?;
            if rest.len() < len {
                return Err(ProtocolError::Truncated {
                    needed: len,
                    available: rest.len(),
                });
            }
            let (data, tail) = rest.split_at(len);
            rest = tail;
            data.to_vec()
        } else {
            Vec::new()
        };

        requests.push(SubRequest { control, data });
    }

    Ok(requests)
}

/// Reassembles frames from a byte stream delivered in arbitrary chunks.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_payload: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl FrameDecoder {
    pub fn new(max_payload: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_payload,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes received but not yet part of a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pops the next complete frame, if one is buffered.
    ///
    /// An oversized payload is an unrecoverable framing error: the buffer is
    /// discarded because the stream can no longer be resynchronized.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let header = CommandHeader::decode(&self.buf)?;
        let len = header.wire_payload_len();
        if len > self.max_payload {
            self.buf.clear();
            return Err(ProtocolError::PayloadTooLarge {
                len,
                max: self.max_payload,
            });
        }
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }

        let payload = self.buf[HEADER_LEN..HEADER_LEN + len].to_vec();
        self.buf.drain(..HEADER_LEN + len);
        Ok(Some(Frame { header, payload }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_little_endian_fixed_width() {
        let header = CommandHeader::new(CommandCode::Read, 7, 12, 1);
        let bytes = header.encode().expect("encode header");
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(&bytes[0..4], &1u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &7i32.to_le_bytes());
        assert_eq!(&bytes[8..12], &12i32.to_le_bytes());
        assert_eq!(&bytes[12..16], &1u32.to_le_bytes());
    }

    #[test]
    fn control_block_is_packed() {
        let bytes = ControlBlock::new(100, 4).encode().expect("encode control");
        assert_eq!(bytes.len(), CONTROL_BLOCK_LEN);
        assert_eq!(&bytes[0..8], &100i64.to_le_bytes());
        assert_eq!(&bytes[8..12], &4i32.to_le_bytes());
    }

    #[test]
    fn unknown_command_code_is_rejected() {
        assert!(matches!(
            CommandCode::try_from(42),
            Err(ProtocolError::UnknownCommand(42))
        ));
        assert!(CommandCode::Commit.is_control());
        assert!(!CommandCode::CommitAck.is_control());
    }

    #[test]
    fn decoder_waits_for_split_frames() {
        let frame = Frame::new(
            CommandHeader::new(CommandCode::Read, 3, 4, 1),
            vec![1, 2, 3, 4],
        );
        let bytes = frame.encode().expect("encode frame");

        let mut decoder = FrameDecoder::default();
        decoder.extend(&bytes[..10]);
        assert!(decoder.next_frame().expect("partial header").is_none());
        decoder.extend(&bytes[10..18]);
        assert!(decoder.next_frame().expect("partial payload").is_none());
        decoder.extend(&bytes[18..]);
        assert_eq!(decoder.next_frame().expect("full frame"), Some(frame));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn negative_payload_length_carries_no_bytes() {
        let error_frame = Frame::new(CommandHeader::new(CommandCode::Read, 9, -1, 1), Vec::new());
        let ack = Frame::new(CommandHeader::control(CommandCode::CommitAck), Vec::new());

        let mut decoder = FrameDecoder::default();
        decoder.extend(&error_frame.encode().expect("encode error frame"));
        decoder.extend(&ack.encode().expect("encode ack"));

        let first = decoder.next_frame().expect("decode").expect("first frame");
        assert_eq!(first.header.payload_len, -1);
        assert!(first.payload.is_empty());
        let second = decoder.next_frame().expect("decode").expect("second frame");
        assert_eq!(second.header.code().expect("code"), CommandCode::CommitAck);
        assert!(decoder.next_frame().expect("decode").is_none());
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let header = CommandHeader::new(CommandCode::Read, 1, 1024, 1);
        let mut decoder = FrameDecoder::new(512);
        decoder.extend(&header.encode().expect("encode header"));
        assert!(matches!(
            decoder.next_frame(),
            Err(ProtocolError::PayloadTooLarge { len: 1024, max: 512 })
        ));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn split_write_payload_into_sub_requests() {
        let mut payload = Vec::new();
        payload.extend(ControlBlock::new(8, 1).encode().expect("control"));
        payload.extend(vec![0xaa; SECTOR_SIZE]);
        payload.extend(ControlBlock::new(64, 2).encode().expect("control"));
        payload.extend(vec![0xbb; 2 * SECTOR_SIZE]);
        let header = CommandHeader::new(CommandCode::Write, 5, payload.len() as i32, 2);

        let subs = split_requests(&header, &payload).expect("split");
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].control, ControlBlock::new(8, 1));
        assert!(subs[0].data.iter().all(|b| *b == 0xaa));
        assert_eq!(subs[1].control.sector, 64);
        assert_eq!(subs[1].data.len(), 2 * SECTOR_SIZE);
    }

    #[test]
    fn split_detects_truncated_write_data() {
        let mut payload = ControlBlock::new(0, 2).encode().expect("control");
        payload.extend(vec![0; SECTOR_SIZE]);
        let header = CommandHeader::new(CommandCode::Write, 1, payload.len() as i32, 1);
        assert!(matches!(
            split_requests(&header, &payload),
            Err(ProtocolError::Truncated { .. })
        ));
    }
}
