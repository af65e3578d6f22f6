//! Loaded image view: the engine's only window onto the binary.
//!
//! `LoadedImage` is built once from the loader collaborator's output
//! (ranges + bytes + symbols + relocations + entry point), validated
//! eagerly, and then treated as immutable shared input by every pass.
//! All reads are bounded; analysis code never indexes raw slices directly.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::address::Addr;
use crate::core::range::{ByteRange, RangePerms};
use crate::core::relocation::Relocation;
use crate::core::symbol::Symbol;
use crate::error::{Result, ScathaError};

/// One loaded range together with its bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadedRange {
    /// Placement and permissions.
    pub range: ByteRange,
    /// The bytes, exactly `range.size` of them.
    pub bytes: Vec<u8>,
}

impl LoadedRange {
    pub fn new(range: ByteRange, bytes: Vec<u8>) -> Self {
        Self { range, bytes }
    }
}

/// A validated, read-only view of the loaded binary.
///
/// Construction fails (rather than degrading) on inconsistent input: the
/// engine refuses to start on an image it cannot fully trust.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadedImage {
    ranges: Vec<LoadedRange>,
    symbols: Vec<Symbol>,
    relocations: Vec<Relocation>,
    entry: Addr,
    low: Addr,
    high: Addr,
}

impl LoadedImage {
    /// Build and validate an image from loader output.
    ///
    /// Ranges are sorted by start address. Validation rejects: an empty
    /// range set, zero-size ranges, byte buffers whose length does not
    /// match the range size, overlapping ranges, and an entry point that
    /// lies outside every code-eligible range.
    pub fn new(
        mut ranges: Vec<LoadedRange>,
        symbols: Vec<Symbol>,
        relocations: Vec<Relocation>,
        entry: Addr,
    ) -> Result<Self> {
        if ranges.is_empty() {
            return Err(ScathaError::MalformedImage {
                reason: "no loaded ranges".into(),
            });
        }
        ranges.sort_by_key(|r| r.range.start);
        for r in &ranges {
            if r.range.size == 0 {
                return Err(ScathaError::MalformedImage {
                    reason: format!("zero-size range {}", r.range.section),
                });
            }
            if r.bytes.len() as u64 != r.range.size {
                return Err(ScathaError::MalformedImage {
                    reason: format!(
                        "range {} declares {} bytes but carries {}",
                        r.range.section,
                        r.range.size,
                        r.bytes.len()
                    ),
                });
            }
            if r.range.start.checked_add(r.range.size).is_none() {
                return Err(ScathaError::MalformedImage {
                    reason: format!("range {} wraps the address space", r.range.section),
                });
            }
        }
        for pair in ranges.windows(2) {
            if pair[0].range.overlaps(&pair[1].range) {
                return Err(ScathaError::MalformedImage {
                    reason: format!(
                        "ranges {} and {} overlap",
                        pair[0].range.section, pair[1].range.section
                    ),
                });
            }
        }
        let low = ranges[0].range.start;
        let high = ranges.last().map(|r| r.range.end()).unwrap_or(low);
        let image = Self {
            ranges,
            symbols,
            relocations,
            entry,
            low,
            high,
        };
        if !image
            .range_at(entry)
            .map(|r| r.range.perms.is_code_eligible())
            .unwrap_or(false)
        {
            return Err(ScathaError::MalformedImage {
                reason: format!("entry point {} outside any code-eligible range", entry),
            });
        }
        Ok(image)
    }

    /// Lowest loaded address; base of all dense per-address tables.
    pub fn low_addr(&self) -> Addr {
        self.low
    }

    /// One past the highest loaded address.
    pub fn high_addr(&self) -> Addr {
        self.high
    }

    /// Total dense span in bytes, including any gaps between ranges.
    pub fn span(&self) -> u64 {
        self.high.0 - self.low.0
    }

    /// Architecture entry point.
    pub fn entry(&self) -> Addr {
        self.entry
    }

    /// Loaded ranges in ascending address order.
    pub fn ranges(&self) -> &[LoadedRange] {
        &self.ranges
    }

    /// Loader-supplied symbols.
    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    /// Loader-supplied relocations.
    pub fn relocations(&self) -> &[Relocation] {
        &self.relocations
    }

    /// The loaded range containing `addr`, if any.
    pub fn range_at(&self, addr: Addr) -> Option<&LoadedRange> {
        let idx = self
            .ranges
            .partition_point(|r| r.range.end() <= addr)
            .min(self.ranges.len().saturating_sub(1));
        let r = self.ranges.get(idx)?;
        r.range.contains(addr).then_some(r)
    }

    /// Whether `addr` lies in a code-eligible range.
    pub fn is_code_addr(&self, addr: Addr) -> bool {
        self.range_at(addr)
            .map(|r| r.range.perms.is_code_eligible())
            .unwrap_or(false)
    }

    /// Whether `addr` lies in a data-eligible range.
    pub fn is_data_addr(&self, addr: Addr) -> bool {
        self.range_at(addr)
            .map(|r| r.range.perms.is_data_eligible())
            .unwrap_or(false)
    }

    /// Whether `addr` lies inside any loaded range.
    pub fn contains(&self, addr: Addr) -> bool {
        self.range_at(addr).is_some()
    }

    /// Bytes from `addr` to the end of its containing range.
    pub fn bytes_at(&self, addr: Addr) -> Option<&[u8]> {
        let r = self.range_at(addr)?;
        let off = (addr - r.range.start) as usize;
        Some(&r.bytes[off..])
    }

    /// Bounded read of exactly `len` bytes at `addr`.
    pub fn read_bytes(&self, addr: Addr, len: usize) -> Option<&[u8]> {
        let b = self.bytes_at(addr)?;
        (b.len() >= len).then(|| &b[..len])
    }

    /// Little-endian u64 read, for pointer-cell scanning.
    pub fn read_u64(&self, addr: Addr) -> Option<u64> {
        let b = self.read_bytes(addr, 8)?;
        Some(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Little-endian u32 read.
    pub fn read_u32(&self, addr: Addr) -> Option<u32> {
        let b = self.read_bytes(addr, 4)?;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Normalized dense-table index for `addr`.
    pub fn index_of(&self, addr: Addr) -> Option<usize> {
        if addr < self.low || addr >= self.high {
            return None;
        }
        Some((addr.0 - self.low.0) as usize)
    }

    /// Inverse of [`index_of`](Self::index_of).
    pub fn addr_of(&self, index: usize) -> Addr {
        Addr(self.low.0 + index as u64)
    }

    /// First symbol defined exactly at `addr`, if any.
    pub fn symbol_at(&self, addr: Addr) -> Option<&Symbol> {
        self.symbols.iter().find(|s| s.address == addr)
    }
}

impl fmt::Display for LoadedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "image [{}..{}) {} ranges, {} symbols, {} relocations, entry {}",
            self.low,
            self.high,
            self.ranges.len(),
            self.symbols.len(),
            self.relocations.len(),
            self.entry
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::symbol::{SymbolBinding, SymbolKind};

    fn code_range(start: u64, bytes: Vec<u8>) -> LoadedRange {
        let size = bytes.len() as u64;
        LoadedRange::new(
            ByteRange::new(Addr(start), size, RangePerms::CODE, ".text"),
            bytes,
        )
    }

    fn data_range(start: u64, bytes: Vec<u8>) -> LoadedRange {
        let size = bytes.len() as u64;
        LoadedRange::new(
            ByteRange::new(Addr(start), size, RangePerms::DATA, ".data"),
            bytes,
        )
    }

    #[test]
    fn rejects_empty_range_set() {
        let err = LoadedImage::new(Vec::new(), Vec::new(), Vec::new(), Addr(0x1000));
        assert!(matches!(err, Err(ScathaError::MalformedImage { .. })));
    }

    #[test]
    fn rejects_byte_length_mismatch() {
        let mut r = code_range(0x1000, vec![0x90; 16]);
        r.range.size = 32;
        let err = LoadedImage::new(vec![r], Vec::new(), Vec::new(), Addr(0x1000));
        assert!(matches!(err, Err(ScathaError::MalformedImage { .. })));
    }

    #[test]
    fn rejects_overlapping_ranges() {
        let a = code_range(0x1000, vec![0x90; 16]);
        let b = data_range(0x1008, vec![0; 16]);
        let err = LoadedImage::new(vec![a, b], Vec::new(), Vec::new(), Addr(0x1000));
        assert!(matches!(err, Err(ScathaError::MalformedImage { .. })));
    }

    #[test]
    fn rejects_entry_outside_code() {
        let a = code_range(0x1000, vec![0x90; 16]);
        let b = data_range(0x2000, vec![0; 16]);
        let err = LoadedImage::new(vec![a, b], Vec::new(), Vec::new(), Addr(0x2000));
        assert!(matches!(err, Err(ScathaError::MalformedImage { .. })));
    }

    #[test]
    fn bounded_reads() {
        let img = LoadedImage::new(
            vec![code_range(0x1000, vec![0xde, 0xad, 0xbe, 0xef])],
            Vec::new(),
            Vec::new(),
            Addr(0x1000),
        )
        .unwrap();
        assert_eq!(img.read_bytes(Addr(0x1002), 2), Some(&[0xbe, 0xef][..]));
        assert_eq!(img.read_bytes(Addr(0x1002), 3), None);
        assert_eq!(img.bytes_at(Addr(0x2000)), None);
    }

    #[test]
    fn dense_index_round_trip() {
        let img = LoadedImage::new(
            vec![
                code_range(0x1000, vec![0x90; 0x10]),
                data_range(0x3000, vec![0; 0x10]),
            ],
            Vec::new(),
            Vec::new(),
            Addr(0x1000),
        )
        .unwrap();
        assert_eq!(img.span(), 0x2010);
        assert_eq!(img.index_of(Addr(0x1000)), Some(0));
        assert_eq!(img.index_of(Addr(0x3005)), Some(0x2005));
        assert_eq!(img.index_of(Addr(0x0fff)), None);
        assert_eq!(img.addr_of(0x2005), Addr(0x3005));
    }

    #[test]
    fn symbol_lookup_is_exact() {
        let sym = Symbol::new("main", Addr(0x1004), SymbolKind::Function, SymbolBinding::Global);
        let img = LoadedImage::new(
            vec![code_range(0x1000, vec![0x90; 0x10])],
            vec![sym],
            Vec::new(),
            Addr(0x1000),
        )
        .unwrap();
        assert!(img.symbol_at(Addr(0x1004)).is_some());
        assert!(img.symbol_at(Addr(0x1005)).is_none());
    }

    #[test]
    fn sorts_ranges_on_construction() {
        let img = LoadedImage::new(
            vec![
                data_range(0x3000, vec![0; 4]),
                code_range(0x1000, vec![0x90; 4]),
            ],
            Vec::new(),
            Vec::new(),
            Addr(0x1000),
        )
        .unwrap();
        assert_eq!(img.ranges()[0].range.start, Addr(0x1000));
        assert!(img.is_code_addr(Addr(0x1001)));
        assert!(img.is_data_addr(Addr(0x3003)));
        assert!(!img.contains(Addr(0x2000)));
    }
}
