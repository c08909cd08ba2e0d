//! Big-endian integer framing and the MD5-over-concatenation helper used
//! by the checksum construction.

use crate::error::Error;

/// Encode `value` as 2 big-endian bytes. Values above `u16::MAX` are an
/// encoding error, never a silent truncation.
pub fn u16_be(value: usize) -> Result<[u8; 2], Error> {
    let narrow = u16::try_from(value).map_err(|_| Error::IntOverflow {
        value: value as u64,
        width: 16,
    })?;
    Ok(narrow.to_be_bytes())
}

/// Encode `value` as 4 big-endian bytes, failing on overflow like
/// [`u16_be`].
pub fn u32_be(value: u64) -> Result<[u8; 4], Error> {
    let narrow = u32::try_from(value).map_err(|_| Error::IntOverflow { value, width: 32 })?;
    Ok(narrow.to_be_bytes())
}

/// MD5 digest of the in-order concatenation of `parts`.
pub fn md5_chain(parts: &[&[u8]]) -> [u8; 16] {
    let mut buf = Vec::with_capacity(parts.iter().map(|p| p.len()).sum());
    for part in parts {
        buf.extend_from_slice(part);
    }
    *md5::compute(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u16_be_encodes() {
        assert_eq!(u16_be(0x2131).unwrap(), [0x21, 0x31]);
        assert_eq!(u16_be(32).unwrap(), [0x00, 0x20]);
    }

    #[test]
    fn u16_be_rejects_oversize() {
        assert!(matches!(
            u16_be(0x1_0000),
            Err(Error::IntOverflow { value: 0x1_0000, width: 16 })
        ));
    }

    #[test]
    fn u32_be_encodes() {
        assert_eq!(u32_be(0xffff_ffff).unwrap(), [0xff; 4]);
        assert!(matches!(
            u32_be(0x1_0000_0000),
            Err(Error::IntOverflow { width: 32, .. })
        ));
    }

    #[test]
    fn md5_chain_matches_single_buffer_digest() {
        let whole = *md5::compute(b"hello world");
        assert_eq!(md5_chain(&[b"hello", b" ", b"world"]), whole);
        assert_eq!(md5_chain(&[b"hello world"]), whole);
    }
}
