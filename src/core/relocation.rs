//! Relocation entries consumed from the loader.
//!
//! The engine does not apply relocations; it uses them as evidence. A
//! relocated address is a trustworthy seed for reachability (when it lands
//! in code) and a hard object boundary for data inference (when it lands
//! in data).

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::address::Addr;

/// The flavor of a relocation, collapsed to what the engine consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelocationKind {
    /// Absolute address patched at the site.
    Absolute,
    /// PC-relative displacement patched at the site.
    PcRelative,
    /// Format-specific kind the engine treats as opaque evidence.
    Other,
}

impl fmt::Display for RelocationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelocationKind::Absolute => write!(f, "Absolute"),
            RelocationKind::PcRelative => write!(f, "PcRelative"),
            RelocationKind::Other => write!(f, "Other"),
        }
    }
}

/// A single relocation record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relocation {
    /// Address of the patched site.
    pub address: Addr,
    /// Resolved referent, when the loader knows it.
    pub target: Option<Addr>,
    /// Referenced symbol name, when the record names one.
    pub symbol: Option<String>,
    /// Collapsed relocation flavor.
    pub kind: RelocationKind,
}

impl Relocation {
    pub fn new(
        address: Addr,
        target: Option<Addr>,
        symbol: Option<String>,
        kind: RelocationKind,
    ) -> Self {
        Self {
            address,
            target,
            symbol,
            kind,
        }
    }
}

impl fmt::Display for Relocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.target, &self.symbol) {
            (Some(t), _) => write!(f, "reloc {} -> {}", self.address, t),
            (None, Some(s)) => write!(f, "reloc {} -> {}", self.address, s),
            (None, None) => write!(f, "reloc {}", self.address),
        }
    }
}
