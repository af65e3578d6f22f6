//! Data object types produced by the data inference pass.
//!
//! A `DataObject` claims a contiguous run of data-eligible bytes. Objects
//! never overlap each other and never overlap selected instructions.
//! Classification is best-effort; bytes the pass cannot classify stay in
//! `Opaque` objects rather than being dropped.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::address::Addr;

/// Classification of a data object's contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataKind {
    /// Pointer-sized cells whose values land inside the image.
    Pointer,
    /// An aligned scalar of the given byte width.
    Scalar(u8),
    /// NUL-terminated printable byte run.
    CharSequence,
    /// Unclassified bytes.
    Opaque,
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataKind::Pointer => write!(f, "pointer"),
            DataKind::Scalar(w) => write!(f, "scalar{}", w * 8),
            DataKind::CharSequence => write!(f, "chars"),
            DataKind::Opaque => write!(f, "opaque"),
        }
    }
}

/// One inferred data object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataObject {
    /// Starting address.
    pub start: Addr,
    /// Total size in bytes.
    pub size: u64,
    /// Content classification.
    pub kind: DataKind,
    /// Number of elements; 1 unless the object is an array run.
    pub element_count: u32,
}

impl DataObject {
    pub fn new(start: Addr, size: u64, kind: DataKind, element_count: u32) -> Self {
        Self {
            start,
            size,
            kind,
            element_count,
        }
    }

    /// End address (exclusive).
    pub fn end(&self) -> Addr {
        Addr(self.start.0 + self.size)
    }

    /// Whether `addr` falls inside this object.
    pub fn contains(&self, addr: Addr) -> bool {
        addr >= self.start && addr < self.end()
    }
}

impl fmt::Display for DataObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "data [{}..{}) {} x{}",
            self.start,
            self.end(),
            self.kind,
            self.element_count
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn containment_is_half_open() {
        let d = DataObject::new(Addr(0x2000), 16, DataKind::Pointer, 2);
        assert!(d.contains(Addr(0x2000)));
        assert!(d.contains(Addr(0x200f)));
        assert!(!d.contains(Addr(0x2010)));
    }

    #[test]
    fn display_format() {
        let d = DataObject::new(Addr(0x2000), 4, DataKind::Scalar(4), 1);
        assert_eq!(format!("{}", d), "data [0x2000..0x2004) scalar32 x1");
    }
}
