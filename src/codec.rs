//! Logical requests and responses, and their mapping onto [`Packet`]s.
//!
//! Both directions have exactly two variants. A handshake ("hello") frame
//! is header-only and carries sentinel values; a normal frame carries an
//! AES-encrypted JSON body guarded by an MD5 checksum over
//! `header prefix || token || ciphertext`. The prefix is the 16 header
//! bytes before the checksum field; the zeroed-checksum formulation seen
//! in some protocol write-ups is NOT what devices compute.

use crate::bytes::{md5_chain, u16_be, u32_be};
use crate::crypto::{self, Token};
use crate::error::Error;
use crate::packet::{Packet, PacketHeader, HEADER_SIZE, MAGIC};

/// Field value marking handshake requests.
const HELLO_FILL: u32 = 0xffff_ffff;

/// An outbound frame before serialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request<'a> {
    /// Header-only hello; the device answers with its id and stamp.
    Handshake,
    /// An encrypted JSON-RPC body addressed to a known device.
    Normal {
        device_id: u32,
        stamp: u32,
        body: &'a str,
    },
}

/// A validated, classified inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Hello reply reporting the device identity and its current stamp.
    Handshake { device_id: u32, stamp: u32 },
    /// Decrypted reply body, passed through verbatim; JSON parsing is the
    /// caller's concern.
    Normal {
        device_id: u32,
        stamp: u32,
        body: Vec<u8>,
    },
}

/// MD5 over the 16 header bytes before the checksum field, then the
/// token, then the ciphertext.
fn checksum(
    packet_length: u16,
    reserved: u32,
    device_id: u32,
    stamp: u32,
    token: &Token,
    ciphertext: &[u8],
) -> Result<[u8; 16], Error> {
    let mut prefix = Vec::with_capacity(16);
    prefix.extend_from_slice(&u16_be(usize::from(MAGIC))?);
    prefix.extend_from_slice(&u16_be(usize::from(packet_length))?);
    prefix.extend_from_slice(&u32_be(u64::from(reserved))?);
    prefix.extend_from_slice(&u32_be(u64::from(device_id))?);
    prefix.extend_from_slice(&u32_be(u64::from(stamp))?);
    Ok(md5_chain(&[&prefix, token.as_bytes(), ciphertext]))
}

/// Turn a logical request into a wire-ready [`Packet`].
pub fn serialize_request(request: &Request<'_>, token: &Token) -> Result<Packet, Error> {
    match request {
        Request::Handshake => Ok(Packet {
            header: PacketHeader {
                magic: MAGIC,
                packet_length: HEADER_SIZE as u16,
                reserved: HELLO_FILL,
                device_id: HELLO_FILL,
                stamp: HELLO_FILL,
                checksum: [0xff; 16],
            },
            payload: Vec::new(),
        }),
        Request::Normal {
            device_id,
            stamp,
            body,
        } => {
            let ciphertext = crypto::encrypt(token, body.as_bytes());
            let packet_length = u16::from_be_bytes(u16_be(HEADER_SIZE + ciphertext.len())?);
            let digest = checksum(packet_length, 0, *device_id, *stamp, token, &ciphertext)?;
            Ok(Packet {
                header: PacketHeader {
                    magic: MAGIC,
                    packet_length,
                    reserved: 0,
                    device_id: *device_id,
                    stamp: *stamp,
                    checksum: digest,
                },
                payload: ciphertext,
            })
        }
    }
}

/// Classify and validate a parsed inbound frame.
///
/// A hello reply (zero `reserved`, header-only, all-zero checksum) is
/// accepted without checksum verification or decryption. Everything else
/// is verified against the token-mixed MD5 and decrypted.
pub fn deserialize_response(packet: &Packet, token: &Token) -> Result<Response, Error> {
    let header = &packet.header;
    if header.reserved == 0
        && usize::from(header.packet_length) == HEADER_SIZE
        && header.checksum == [0u8; 16]
    {
        return Ok(Response::Handshake {
            device_id: header.device_id,
            stamp: header.stamp,
        });
    }

    let expected = checksum(
        header.packet_length,
        header.reserved,
        header.device_id,
        header.stamp,
        token,
        &packet.payload,
    )?;
    if expected != header.checksum {
        return Err(Error::ChecksumMismatch);
    }
    let body = crypto::decrypt(token, &packet.payload)?;
    Ok(Response::Normal {
        device_id: header.device_id,
        stamp: header.stamp,
        body,
    })
}
