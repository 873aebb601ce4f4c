//! Big-endian helpers used for FCB on-flash headers.

/// Writes `x` into the first two bytes of `buf`, most significant byte first.
///
/// # Panics
///
/// Panics if `buf` is shorter than 2 bytes.
pub fn put_be16(buf: &mut [u8], x: u16) {
    buf[..2].copy_from_slice(&x.to_be_bytes());
}

/// Reads a big-endian `u16` from the first two bytes of `buf`.
///
/// # Panics
///
/// Panics if `buf` is shorter than 2 bytes.
pub fn get_be16(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}
