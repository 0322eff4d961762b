#![forbid(unsafe_code)]
//! Simulated byte-addressable FRAM.
//!
//! Everything that must survive power loss lives at a fixed offset inside a
//! single [`Fram`] image; the rest of the workspace reads and writes through
//! it and never holds pointers into it. Power loss is simulated by cloning
//! the image bytes and re-opening the clone.
//!
//! # Crash injection
//!
//! With the write log enabled, every mutation is recorded as a [`WriteOp`].
//! [`apply_ops_prefix`] replays a recorded sequence onto an earlier snapshot
//! up to an arbitrary byte budget: plain writes tear at any byte boundary,
//! while [`WriteOp::FlipBit`] is applied all-or-nothing — a word-sized XOR in
//! FRAM is atomic, and it is the sole durability boundary the commit map
//! relies on.

mod layout;

pub use layout::{Header, FramLayout, FRAM_MAGIC, FRAM_VERSION, HEADER_SIZE};

use ember_error::{EmberError, Result};

/// One recorded mutation of the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// A plain store of `bytes` at `offset`. May tear at any byte boundary.
    Write { offset: usize, bytes: Vec<u8> },
    /// An atomic XOR of `mask` into the `u16` at `offset`. Never tears.
    FlipBit { offset: usize, mask: u16 },
}

impl WriteOp {
    /// Bytes this operation occupies in the replay budget.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        match self {
            Self::Write { bytes, .. } => bytes.len(),
            Self::FlipBit { .. } => 2,
        }
    }
}

/// Total byte budget needed to replay `ops` completely.
#[must_use]
pub fn ops_total_bytes(ops: &[WriteOp]) -> usize {
    ops.iter().map(WriteOp::byte_len).sum()
}

/// Replay a prefix of `ops` onto `image`, spending at most `budget` bytes.
///
/// Plain writes are applied byte-by-byte until the budget runs out; a flip is
/// applied only if the full two bytes fit (it cannot tear). Returns the
/// number of bytes actually applied.
pub fn apply_ops_prefix(image: &mut [u8], ops: &[WriteOp], budget: usize) -> usize {
    let mut remaining = budget;
    let mut applied = 0_usize;
    for op in ops {
        if remaining == 0 {
            break;
        }
        match op {
            WriteOp::Write { offset, bytes } => {
                let take = bytes.len().min(remaining);
                let end = (offset + take).min(image.len());
                if *offset < end {
                    image[*offset..end].copy_from_slice(&bytes[..end - offset]);
                }
                remaining -= take;
                applied += take;
                if take < bytes.len() {
                    break;
                }
            }
            WriteOp::FlipBit { offset, mask } => {
                if remaining < 2 {
                    break;
                }
                if offset + 2 <= image.len() {
                    let word = u16::from_le_bytes([image[*offset], image[*offset + 1]]) ^ mask;
                    image[*offset..*offset + 2].copy_from_slice(&word.to_le_bytes());
                }
                remaining -= 2;
                applied += 2;
            }
        }
    }
    applied
}

/// The non-volatile image.
#[derive(Debug, Clone)]
pub struct Fram {
    bytes: Vec<u8>,
    log: Option<Vec<WriteOp>>,
}

impl Fram {
    /// A zero-filled image of `len` bytes.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: vec![0_u8; len],
            log: None,
        }
    }

    /// Adopt an existing image (e.g. a snapshot taken before power loss).
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes, log: None }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Copy of the current image, bit-for-bit.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.clone()
    }

    /// Start (or stop) recording mutations for crash injection.
    pub fn set_write_log(&mut self, enabled: bool) {
        self.log = if enabled { Some(Vec::new()) } else { None };
    }

    /// Drain the recorded mutations. Recording stays enabled.
    pub fn take_write_log(&mut self) -> Vec<WriteOp> {
        match self.log.as_mut() {
            Some(log) => std::mem::take(log),
            None => Vec::new(),
        }
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        let end = offset
            .checked_add(len)
            .ok_or(EmberError::LayoutOverflow { region: "access" })?;
        if end > self.bytes.len() {
            return Err(EmberError::ImageTruncated {
                needed: len,
                offset,
                actual: self.bytes.len(),
            });
        }
        Ok(())
    }

    pub fn read_u8(&self, offset: usize) -> Result<u8> {
        self.check(offset, 1)?;
        Ok(self.bytes[offset])
    }

    pub fn read_u16(&self, offset: usize) -> Result<u16> {
        self.check(offset, 2)?;
        Ok(u16::from_le_bytes([
            self.bytes[offset],
            self.bytes[offset + 1],
        ]))
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        self.check(offset, 4)?;
        Ok(u32::from_le_bytes([
            self.bytes[offset],
            self.bytes[offset + 1],
            self.bytes[offset + 2],
            self.bytes[offset + 3],
        ]))
    }

    pub fn read_bytes(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.check(offset, len)?;
        Ok(&self.bytes[offset..offset + len])
    }

    pub fn write_u8(&mut self, offset: usize, value: u8) -> Result<()> {
        self.write_bytes(offset, &[value])
    }

    pub fn write_u16(&mut self, offset: usize, value: u16) -> Result<()> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) -> Result<()> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.check(offset, bytes.len())?;
        self.bytes[offset..offset + bytes.len()].copy_from_slice(bytes);
        if let Some(log) = self.log.as_mut() {
            log.push(WriteOp::Write {
                offset,
                bytes: bytes.to_vec(),
            });
        }
        Ok(())
    }

    pub fn fill(&mut self, offset: usize, len: usize, value: u8) -> Result<()> {
        self.check(offset, len)?;
        self.bytes[offset..offset + len].fill(value);
        if let Some(log) = self.log.as_mut() {
            log.push(WriteOp::Write {
                offset,
                bytes: vec![value; len],
            });
        }
        Ok(())
    }

    /// Atomically XOR `mask` into the `u16` at `offset`.
    ///
    /// This is the commit map's publish boundary: it is recorded as a single
    /// indivisible [`WriteOp::FlipBit`] and never torn by crash injection.
    pub fn flip_bits_u16(&mut self, offset: usize, mask: u16) -> Result<()> {
        self.check(offset, 2)?;
        let word = u16::from_le_bytes([self.bytes[offset], self.bytes[offset + 1]]) ^ mask;
        self.bytes[offset..offset + 2].copy_from_slice(&word.to_le_bytes());
        if let Some(log) = self.log.as_mut() {
            log.push(WriteOp::FlipBit { offset, mask });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_are_enforced() {
        let mut fram = Fram::new(8);
        assert!(fram.read_u32(4).is_ok());
        assert!(matches!(
            fram.read_u32(6),
            Err(EmberError::ImageTruncated { .. })
        ));
        assert!(matches!(
            fram.write_u16(7, 1),
            Err(EmberError::ImageTruncated { .. })
        ));
        assert!(fram.read_u32(usize::MAX).is_err());
    }

    #[test]
    fn little_endian_round_trip() {
        let mut fram = Fram::new(16);
        fram.write_u32(0, 0xDEAD_BEEF).expect("write");
        fram.write_u16(4, 0x1234).expect("write");
        fram.write_u8(6, 0xAB).expect("write");
        assert_eq!(fram.read_u32(0).expect("read"), 0xDEAD_BEEF);
        assert_eq!(fram.read_u16(4).expect("read"), 0x1234);
        assert_eq!(fram.read_u8(6).expect("read"), 0xAB);
        assert_eq!(fram.as_bytes()[0], 0xEF);
    }

    #[test]
    fn flip_is_xor() {
        let mut fram = Fram::new(4);
        fram.flip_bits_u16(0, 0b100).expect("flip");
        assert_eq!(fram.read_u16(0).expect("read"), 0b100);
        fram.flip_bits_u16(0, 0b100).expect("flip");
        assert_eq!(fram.read_u16(0).expect("read"), 0);
    }

    #[test]
    fn write_log_records_mutations() {
        let mut fram = Fram::new(8);
        fram.set_write_log(true);
        fram.write_u32(0, 7).expect("write");
        fram.flip_bits_u16(4, 1).expect("flip");
        let ops = fram.take_write_log();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].byte_len(), 4);
        assert_eq!(ops[1], WriteOp::FlipBit { offset: 4, mask: 1 });
        assert_eq!(ops_total_bytes(&ops), 6);
        // log drained but still recording
        fram.write_u8(0, 1).expect("write");
        assert_eq!(fram.take_write_log().len(), 1);
    }

    #[test]
    fn prefix_replay_tears_writes_but_not_flips() {
        let mut fram = Fram::new(8);
        let base = fram.snapshot();
        fram.set_write_log(true);
        fram.write_u32(0, 0xAABB_CCDD).expect("write");
        fram.flip_bits_u16(6, 0x8000).expect("flip");
        let ops = fram.take_write_log();
        assert_eq!(ops_total_bytes(&ops), 6);

        // Two bytes into the u32 write: half the word is torn in.
        let mut torn = base.clone();
        assert_eq!(apply_ops_prefix(&mut torn, &ops, 2), 2);
        assert_eq!(&torn[0..4], &[0xDD, 0xCC, 0x00, 0x00]);
        assert_eq!(u16::from_le_bytes([torn[6], torn[7]]), 0);

        // Five bytes: the flip does not fit, so it is withheld entirely.
        let mut torn = base.clone();
        assert_eq!(apply_ops_prefix(&mut torn, &ops, 5), 4);
        assert_eq!(u16::from_le_bytes([torn[6], torn[7]]), 0);

        // Full budget: everything lands.
        let mut full = base;
        assert_eq!(apply_ops_prefix(&mut full, &ops, 6), 6);
        assert_eq!(full.as_slice(), fram.as_bytes());
    }
}
