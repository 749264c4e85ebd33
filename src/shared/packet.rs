use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::fmt;
use std::io::{self, Read, Write};

/// Wire protocol version stamped into every packet header.
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed header size:
/// `[type:1][version:1][source_id:2][flags:1][sequence:4][sent_timestamp_ms:8]`,
/// multi-byte fields little-endian.
pub const PACKET_HEADER_LEN: usize = 17;

/// Largest section body a sane peer will produce. Anything above this in a
/// length prefix is treated as end-of-stream garbage.
pub const MAX_SECTION_LEN: usize = u16::MAX as usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Bitstream-encoded tree mutations.
    TreeData = 1,
    /// Instruction to drop the whole tree.
    EraseAll = 2,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::TreeData),
            2 => Some(Self::EraseAll),
            _ => None,
        }
    }
}

/// Per-packet flag bits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PacketFlags(pub u8);

impl PacketFlags {
    pub const COLOR: u8 = 0x01;
    pub const COMPRESSED: u8 = 0x02;

    pub fn has_color(self) -> bool {
        self.0 & Self::COLOR != 0
    }

    pub fn is_compressed(self) -> bool {
        self.0 & Self::COMPRESSED != 0
    }

    pub fn with_color(mut self) -> Self {
        self.0 |= Self::COLOR;
        self
    }

    pub fn with_compressed(mut self) -> Self {
        self.0 |= Self::COMPRESSED;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_type: PacketType,
    pub protocol_version: u8,
    pub source_id: u16,
    pub flags: PacketFlags,
    pub sequence: u32,
    pub sent_timestamp_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketError {
    /// Fewer bytes than the fixed header size.
    MalformedHeader { available: usize },
    UnknownPacketType { value: u8 },
}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedHeader { available } => write!(
                f,
                "malformed header: {available} bytes available, {PACKET_HEADER_LEN} required"
            ),
            Self::UnknownPacketType { value } => write!(f, "unknown packet type {value}"),
        }
    }
}

impl std::error::Error for PacketError {}

impl PacketHeader {
    /// Decode the fixed header from the front of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < PACKET_HEADER_LEN {
            return Err(PacketError::MalformedHeader {
                available: bytes.len(),
            });
        }
        let packet_type =
            PacketType::from_u8(bytes[0]).ok_or(PacketError::UnknownPacketType { value: bytes[0] })?;
        Ok(Self {
            packet_type,
            protocol_version: bytes[1],
            source_id: u16::from_le_bytes([bytes[2], bytes[3]]),
            flags: PacketFlags(bytes[4]),
            sequence: u32::from_le_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]),
            sent_timestamp_ms: u64::from_le_bytes([
                bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15],
                bytes[16],
            ]),
        })
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.packet_type as u8);
        out.push(self.protocol_version);
        out.extend_from_slice(&self.source_id.to_le_bytes());
        out.push(self.flags.0);
        out.extend_from_slice(&self.sequence.to_le_bytes());
        out.extend_from_slice(&self.sent_timestamp_ms.to_le_bytes());
    }

    /// Offset of the first payload byte.
    pub fn payload_offset(&self) -> usize {
        PACKET_HEADER_LEN
    }
}

/// Walk a packet payload as a sequence of sections.
///
/// Compressed payloads carry `[len: u16 LE][len bytes]` per section; the
/// iterator *stops* — it does not fail — when the remaining bytes cannot
/// supply a length prefix or the declared body. That is the defensive
/// end-of-stream condition for a packet whose tail was cut off in flight.
/// Uncompressed payloads are a single section spanning the remainder.
pub struct SectionIter<'a> {
    payload: &'a [u8],
    offset: usize,
    compressed: bool,
    done: bool,
}

impl<'a> SectionIter<'a> {
    pub fn new(payload: &'a [u8], flags: PacketFlags) -> Self {
        Self {
            payload,
            offset: 0,
            compressed: flags.is_compressed(),
            done: false,
        }
    }
}

impl<'a> Iterator for SectionIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.done {
            return None;
        }
        if !self.compressed {
            self.done = true;
            if self.payload.is_empty() {
                return None;
            }
            return Some(self.payload);
        }
        let remaining = &self.payload[self.offset..];
        if remaining.len() < 2 {
            self.done = true;
            return None;
        }
        let len = u16::from_le_bytes([remaining[0], remaining[1]]) as usize;
        if len == 0 || remaining.len() < 2 + len {
            self.done = true;
            return None;
        }
        self.offset += 2 + len;
        Some(&remaining[2..2 + len])
    }
}

/// Deflate a section body for the compressed payload form.
pub fn compress_section(bytes: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

/// Inflate one section body.
pub fn decompress_section(bytes: &[u8]) -> io::Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Assembles one outbound packet: header first, then sections.
///
/// With the `COMPRESSED` flag each section body is deflated and
/// length-prefixed; without it exactly one section is allowed and written
/// raw (the wire format has no way to delimit a second).
pub struct PacketBuilder {
    buf: Vec<u8>,
    compressed: bool,
    sections: usize,
}

impl PacketBuilder {
    pub fn new(header: &PacketHeader) -> Self {
        let mut buf = Vec::with_capacity(PACKET_HEADER_LEN + 64);
        header.encode_into(&mut buf);
        Self {
            buf,
            compressed: header.flags.is_compressed(),
            sections: 0,
        }
    }

    pub fn push_section(&mut self, body: &[u8]) -> io::Result<()> {
        if self.compressed {
            let compressed = compress_section(body)?;
            if compressed.len() > MAX_SECTION_LEN {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("section of {} bytes exceeds wire limit", compressed.len()),
                ));
            }
            self.buf
                .extend_from_slice(&(compressed.len() as u16).to_le_bytes());
            self.buf.extend_from_slice(&compressed);
        } else {
            if self.sections > 0 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "uncompressed packets carry exactly one section",
                ));
            }
            self.buf.extend_from_slice(body);
        }
        self.sections += 1;
        Ok(())
    }

    pub fn section_count(&self) -> usize {
        self.sections
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}
