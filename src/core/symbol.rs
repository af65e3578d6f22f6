//! Symbol type for named program entities.
//!
//! Symbols arrive from the loader collaborator (symbol tables, dynamic
//! exports) and serve two roles in the engine: their addresses seed the
//! reachability fixpoint, and their names are reused when operands are
//! re-expressed symbolically.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::address::Addr;

/// Symbol kinds the engine distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SymbolKind {
    /// Function entry point.
    Function,
    /// Data object.
    Object,
    /// Anything else the loader reported.
    Other,
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SymbolKind::Function => write!(f, "Function"),
            SymbolKind::Object => write!(f, "Object"),
            SymbolKind::Other => write!(f, "Other"),
        }
    }
}

/// Symbol binding strength, mirroring the loader's view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SymbolBinding {
    /// Local symbol.
    Local,
    /// Global symbol.
    Global,
    /// Weak symbol.
    Weak,
}

impl fmt::Display for SymbolBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SymbolBinding::Local => write!(f, "Local"),
            SymbolBinding::Global => write!(f, "Global"),
            SymbolBinding::Weak => write!(f, "Weak"),
        }
    }
}

/// A named program entity supplied by the loader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbol {
    /// Symbol name as reported.
    pub name: String,
    /// Address the symbol is defined at.
    pub address: Addr,
    /// What the symbol names.
    pub kind: SymbolKind,
    /// Binding strength.
    pub binding: SymbolBinding,
}

impl Symbol {
    pub fn new(
        name: impl Into<String>,
        address: Addr,
        kind: SymbolKind,
        binding: SymbolBinding,
    ) -> Self {
        Self {
            name: name.into(),
            address,
            kind,
            binding,
        }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} ({})", self.name, self.address, self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_name_and_address() {
        let s = Symbol::new("main", Addr(0x401000), SymbolKind::Function, SymbolBinding::Global);
        assert_eq!(format!("{}", s), "main@0x401000 (Function)");
    }
}
