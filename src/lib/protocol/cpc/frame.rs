use std::convert::TryInto;

use crc::{Crc, CRC_16_XMODEM};
use log::debug;
use thiserror::Error;

use super::types::{EndpointId, PropertyId, UnnumberedFrameCommandId};

pub const FLAG: u8 = 0x14;
pub const HEADER_SIZE: usize = 7;
const CHECKSUM_SIZE: usize = 2;
const UNNUMBERED_HEADER_SIZE: usize = 4;

/// Control byte of an unnumbered frame with the poll/final bit set.
pub const CONTROL_UNNUMBERED_POLL_FINAL: u8 = 0xC4;

#[derive(Error, Debug, PartialEq)]
pub enum FrameError {
    #[error("need more data")]
    Incomplete,
    #[error("bad flag byte {0:#04x}")]
    BadFlag(u8),
    #[error("bad header checksum")]
    BadHeaderChecksum,
    #[error("bad payload checksum")]
    BadPayloadChecksum,
    #[error("frame has no payload")]
    NoPayload,
    #[error("malformed payload: {0}")]
    Malformed(&'static str),
    #[error("payload of {0} bytes does not fit in a frame")]
    TooLarge(usize),
}

fn checksum(data: &[u8]) -> u16 {
    let crc = Crc::<u16>::new(&CRC_16_XMODEM);
    crc.checksum(data)
}

fn read_u16(data: &[u8]) -> u16 {
    u16::from_le_bytes(data[..2].try_into().unwrap())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyCommand {
    pub property_id: PropertyId,
    pub value: Vec<u8>,
}

impl PropertyCommand {
    fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&u32::from(self.property_id).to_le_bytes());
        out.extend_from_slice(&self.value);
    }

    fn deserialize(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < 4 {
            return Err(FrameError::Malformed("short property command"));
        }

        Ok(PropertyCommand {
            property_id: u32::from_le_bytes(data[..4].try_into().unwrap()).into(),
            value: data[4..].to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandPayload {
    Property(PropertyCommand),
    Raw(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnnumberedFrame {
    pub command_id: UnnumberedFrameCommandId,
    pub command_seq: u8,
    pub payload: CommandPayload,
}

impl UnnumberedFrame {
    pub fn property(&self) -> Option<&PropertyCommand> {
        match &self.payload {
            CommandPayload::Property(prop) => Some(prop),
            CommandPayload::Raw(_) => None,
        }
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        let mut body = Vec::new();
        match &self.payload {
            CommandPayload::Property(prop) => prop.serialize(&mut body),
            CommandPayload::Raw(raw) => body.extend_from_slice(raw),
        }

        out.push(self.command_id.into());
        out.push(self.command_seq);
        out.extend_from_slice(&(body.len() as u16).to_le_bytes());
        out.extend_from_slice(&body);
    }

    fn deserialize(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < UNNUMBERED_HEADER_SIZE {
            return Err(FrameError::Malformed("short unnumbered frame"));
        }

        let command_id = UnnumberedFrameCommandId::from(data[0]);
        let length = read_u16(&data[2..]) as usize;
        let body = &data[UNNUMBERED_HEADER_SIZE..];

        if body.len() != length {
            return Err(FrameError::Malformed("unnumbered length mismatch"));
        }

        let payload = if command_id.carries_property() {
            CommandPayload::Property(PropertyCommand::deserialize(body)?)
        } else {
            CommandPayload::Raw(body.to_vec())
        };

        Ok(UnnumberedFrame {
            command_id,
            command_seq: data[1],
            payload,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpcTransportFrame {
    pub endpoint: EndpointId,
    pub control: u8,
    pub payload: UnnumberedFrame,
}

impl CpcTransportFrame {
    pub fn serialize(&self) -> Result<Vec<u8>, FrameError> {
        let mut payload = Vec::new();
        self.payload.serialize(&mut payload);
        let length: u16 = (payload.len() + CHECKSUM_SIZE)
            .try_into()
            .map_err(|_| FrameError::TooLarge(payload.len()))?;

        let mut out = Vec::with_capacity(HEADER_SIZE + length as usize);
        out.push(FLAG);
        out.push(self.endpoint.into());
        out.extend_from_slice(&length.to_le_bytes());
        out.push(self.control);
        let hcs = checksum(&out);
        out.extend_from_slice(&hcs.to_le_bytes());

        out.extend_from_slice(&payload);
        out.extend_from_slice(&checksum(&payload).to_le_bytes());
        Ok(out)
    }

    /// Parses one frame from the front of `data`, returning it with the
    /// number of bytes it occupied.
    pub fn deserialize(data: &[u8]) -> Result<(Self, usize), FrameError> {
        match decode_frame(data)? {
            (Some(frame), consumed) => Ok((frame, consumed)),
            (None, _) => Err(FrameError::NoPayload),
        }
    }
}

/// Header-only frames decode to `None` but still report their size.
fn decode_frame(data: &[u8]) -> Result<(Option<CpcTransportFrame>, usize), FrameError> {
    if data.len() < HEADER_SIZE {
        return Err(FrameError::Incomplete);
    }

    if data[0] != FLAG {
        return Err(FrameError::BadFlag(data[0]));
    }

    if checksum(&data[..5]) != read_u16(&data[5..]) {
        return Err(FrameError::BadHeaderChecksum);
    }

    let length = read_u16(&data[2..]) as usize;
    if length == 0 {
        return Ok((None, HEADER_SIZE));
    }
    if length < CHECKSUM_SIZE {
        return Err(FrameError::Malformed("length shorter than checksum"));
    }

    let total = HEADER_SIZE + length;
    if data.len() < total {
        return Err(FrameError::Incomplete);
    }

    let payload = &data[HEADER_SIZE..total - CHECKSUM_SIZE];
    if checksum(payload) != read_u16(&data[total - CHECKSUM_SIZE..]) {
        return Err(FrameError::BadPayloadChecksum);
    }

    let frame = CpcTransportFrame {
        endpoint: data[1].into(),
        control: data[4],
        payload: UnnumberedFrame::deserialize(payload)?,
    };

    Ok((Some(frame), total))
}

/// Incremental frame parser: accepts arbitrary chunks, yields complete frames.
///
/// Any checksum or shape error drops everything buffered so far.
#[derive(Debug, Default)]
pub struct CpcFrameDecoder {
    buffer: Vec<u8>,
}

impl CpcFrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    pub fn feed(&mut self, data: &[u8]) -> Vec<CpcTransportFrame> {
        self.buffer.extend_from_slice(data);
        let mut frames = Vec::new();

        loop {
            match decode_frame(&self.buffer) {
                Ok((frame, consumed)) => {
                    self.buffer.drain(..consumed);
                    match frame {
                        Some(frame) => frames.push(frame),
                        None => debug!("skipping header-only frame"),
                    }
                }
                Err(FrameError::Incomplete) => break,
                Err(e) => {
                    debug!("{}, discarding {} bytes", e, self.buffer.len());
                    self.buffer.clear();
                    break;
                }
            }
        }

        frames
    }
}
