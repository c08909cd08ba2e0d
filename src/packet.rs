//! The on-wire frame: a fixed 32-byte header followed by an optional
//! encrypted payload.
//!
//! No crypto happens here; this module only maps between byte buffers and
//! the structured [`Packet`] value. Parse and serialize are exact inverses
//! for any valid frame.

use packed_struct::prelude::*;

use crate::error::Error;

/// First two bytes of every frame.
pub const MAGIC: u16 = 0x2131;

/// Fixed header size; also the total size of header-only frames.
pub const HEADER_SIZE: usize = 32;

/// Frame header, big-endian on the wire.
///
/// `reserved` is `0xFFFFFFFF` in the handshake request and `0` everywhere
/// else; `checksum` holds sentinel bytes in handshake frames and an MD5
/// digest in normal ones (see the codec module).
#[derive(PackedStruct, Debug, Clone, PartialEq, Eq)]
#[packed_struct(endian = "msb")]
pub struct PacketHeader {
    pub magic: u16,
    pub packet_length: u16,
    pub reserved: u32,
    pub device_id: u32,
    pub stamp: u32,
    pub checksum: [u8; 16],
}

/// One structured frame: header plus raw payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Parse a raw datagram.
    ///
    /// Accepts the buffer iff it starts with [`MAGIC`] and its declared
    /// `packet_length` equals the buffer length; any mismatch is a
    /// [`Error::MalformedFrame`] naming the offending field.
    pub fn parse(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::MalformedFrame {
                field: "packet_length",
                detail: format!("{} bytes is shorter than the header", buf.len()),
            });
        }
        let mut raw = [0u8; HEADER_SIZE];
        raw.copy_from_slice(&buf[..HEADER_SIZE]);
        let header = PacketHeader::unpack(&raw).map_err(|err| Error::MalformedFrame {
            field: "header",
            detail: err.to_string(),
        })?;
        if header.magic != MAGIC {
            return Err(Error::MalformedFrame {
                field: "magic",
                detail: format!("0x{:04x}", header.magic),
            });
        }
        if usize::from(header.packet_length) != buf.len() {
            return Err(Error::MalformedFrame {
                field: "packet_length",
                detail: format!("declares {}, buffer is {}", header.packet_length, buf.len()),
            });
        }
        Ok(Self {
            header,
            payload: buf[HEADER_SIZE..].to_vec(),
        })
    }

    /// Serialize back to wire bytes: header fields in order, then payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let header = self.header.pack().map_err(|err| Error::MalformedFrame {
            field: "header",
            detail: err.to_string(),
        })?;
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(&self.payload);
        Ok(out)
    }
}
