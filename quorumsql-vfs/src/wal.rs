//! The SQLite WAL file format: header layouts, page-size parsing and the
//! cumulative frame checksum.
//!
//! The layouts follow <https://www.sqlite.org/fileformat2.html#walformat>.
//! All integers are big-endian; the magic we write selects big-endian
//! checksumming so the same byte order is used throughout.

use zerocopy::byteorder::big_endian::U32;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::error::Error;

/// Size of the WAL file header.
pub const WAL_HDRSIZE: usize = 32;

/// Size of the header preceding each WAL frame.
pub const FRAME_HDRSIZE: usize = 24;

/// WAL magic selecting big-endian checksums.
pub const WAL_MAGIC: u32 = 0x377f_0683;

/// WAL format version written by SQLite since 3.7.0.
pub const WAL_VERSION: u32 = 3_007_000;

pub const MIN_PAGE_SIZE: u32 = 512;
pub const MAX_PAGE_SIZE: u32 = 65536;

/// The 32-byte header preceding all frames in a WAL file.
#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
pub struct WalHeader {
    pub magic: U32,
    pub version: U32,
    pub page_size: U32,
    pub checkpoint_seq: U32,
    pub salt1: U32,
    pub salt2: U32,
    pub checksum1: U32,
    pub checksum2: U32,
}

impl WalHeader {
    /// Computes and stores the header checksum over the first 24 bytes.
    pub fn seal(&mut self) {
        let (c1, c2) = checksum((0, 0), &self.as_bytes()[..24]);
        self.checksum1 = c1.into();
        self.checksum2 = c2.into();
    }

    pub fn checksum_seed(&self) -> (u32, u32) {
        (self.checksum1.get(), self.checksum2.get())
    }
}

/// The 24-byte header preceding each frame's page payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
pub struct WalFrameHeader {
    pub page_no: U32,
    /// Size of the database in pages after a commit, zero for non-commit
    /// frames. This is the commit marker.
    pub size_after: U32,
    pub salt1: U32,
    pub salt2: U32,
    pub checksum1: U32,
    pub checksum2: U32,
}

impl WalFrameHeader {
    pub fn is_commit(&self) -> bool {
        self.size_after.get() != 0
    }

    pub fn checksum_seed(&self) -> (u32, u32) {
        (self.checksum1.get(), self.checksum2.get())
    }

    /// Computes the running checksum for this frame and stores it.
    ///
    /// `seed` is the cumulative checksum of the WAL up to the previous
    /// frame (or the header checksum for the first frame); the frame
    /// checksum covers the first 8 header bytes plus the page payload.
    pub fn seal(&mut self, seed: (u32, u32), page: &[u8]) {
        let sum = checksum(seed, &self.as_bytes()[..8]);
        let (c1, c2) = checksum(sum, page);
        self.checksum1 = c1.into();
        self.checksum2 = c2.into();
    }
}

/// The cumulative WAL checksum over pairs of big-endian 32-bit words.
///
/// `data` must be a multiple of 8 bytes, which holds for every input the
/// format defines (24-byte headers, 8-byte prefixes, power-of-two pages).
pub fn checksum(seed: (u32, u32), data: &[u8]) -> (u32, u32) {
    debug_assert!(data.len() % 8 == 0);
    let (mut s1, mut s2) = seed;
    for chunk in data.chunks_exact(8) {
        let x0 = u32::from_be_bytes(chunk[..4].try_into().unwrap());
        let x1 = u32::from_be_bytes(chunk[4..].try_into().unwrap());
        s1 = s1.wrapping_add(x0).wrapping_add(s2);
        s2 = s2.wrapping_add(x1).wrapping_add(s1);
    }
    (s1, s2)
}

pub fn is_valid_page_size(n: u32) -> bool {
    (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&n) && n.is_power_of_two()
}

/// Extracts the page size from the first database page.
///
/// Bytes 16-17 of the database header hold the page size in big-endian; the
/// value 1 encodes 65536.
pub fn parse_db_page_size(header: &[u8]) -> Result<u32, Error> {
    let raw = u16::from_be_bytes([header[16], header[17]]) as u32;
    let page_size = if raw == 1 { MAX_PAGE_SIZE } else { raw };
    if !is_valid_page_size(page_size) {
        return Err(Error::InvalidPageSize(page_size));
    }
    Ok(page_size)
}

/// Extracts the page size from a WAL header (bytes 8-11, big-endian).
pub fn parse_wal_page_size(header: &[u8]) -> Result<u32, Error> {
    let raw = u32::from_be_bytes(header[8..12].try_into().unwrap());
    let page_size = if raw == 1 { MAX_PAGE_SIZE } else { raw };
    if !is_valid_page_size(page_size) {
        return Err(Error::InvalidPageSize(page_size));
    }
    Ok(page_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_page_size_parsing() {
        let mut hdr = [0u8; 100];
        hdr[16] = 0x10; // 4096
        assert_eq!(parse_db_page_size(&hdr).unwrap(), 4096);

        hdr[16] = 0x00;
        hdr[17] = 0x01; // the escape value for 65536
        assert_eq!(parse_db_page_size(&hdr).unwrap(), 65536);

        hdr[16] = 0x01;
        hdr[17] = 0xff; // 511, not a power of two and below the minimum
        assert!(matches!(
            parse_db_page_size(&hdr),
            Err(Error::InvalidPageSize(511))
        ));
    }

    #[test]
    fn wal_page_size_parsing() {
        let mut hdr = [0u8; 32];
        hdr[8..12].copy_from_slice(&4096u32.to_be_bytes());
        assert_eq!(parse_wal_page_size(&hdr).unwrap(), 4096);

        hdr[8..12].copy_from_slice(&1000u32.to_be_bytes());
        assert!(parse_wal_page_size(&hdr).is_err());
    }

    #[test]
    fn checksum_accumulates() {
        let data = [1u8; 16];
        let once = checksum((0, 0), &data);
        let split = checksum(checksum((0, 0), &data[..8]), &data[8..]);
        assert_eq!(once, split);
        assert_ne!(once, (0, 0));
    }

    #[test]
    fn sealed_header_roundtrips() {
        let mut hdr = WalHeader {
            magic: WAL_MAGIC.into(),
            version: WAL_VERSION.into(),
            page_size: 4096.into(),
            checkpoint_seq: 0.into(),
            salt1: 7.into(),
            salt2: 13.into(),
            checksum1: 0.into(),
            checksum2: 0.into(),
        };
        hdr.seal();

        let parsed = WalHeader::read_from(hdr.as_bytes()).unwrap();
        assert_eq!(parsed.checksum_seed(), hdr.checksum_seed());
        assert_eq!(parse_wal_page_size(hdr.as_bytes()).unwrap(), 4096);
    }
}
