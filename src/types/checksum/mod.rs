#![forbid(unsafe_code)]

/// Size of the trailing checksum field carried by every metadata block.
pub const CRC_LEN: usize = 4;

/// CRC32 (IEEE) of `bytes`.
pub fn crc32(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

/// Computes the CRC over everything but the trailing field and stores it there (LE).
pub fn seal_crc32(buf: &mut [u8]) {
    debug_assert!(buf.len() > CRC_LEN);
    let split = buf.len() - CRC_LEN;
    let crc = crc32(&buf[..split]);
    buf[split..].copy_from_slice(&crc.to_le_bytes());
}

/// Checks a buffer sealed by [`seal_crc32`].
pub fn verify_crc32(buf: &[u8]) -> bool {
    if buf.len() <= CRC_LEN {
        return false;
    }
    let split = buf.len() - CRC_LEN;
    let mut stored = [0u8; CRC_LEN];
    stored.copy_from_slice(&buf[split..]);
    crc32(&buf[..split]) == u32::from_le_bytes(stored)
}
