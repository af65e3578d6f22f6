//! Per-address fact storage for the inference fixpoint.
//!
//! Facts are bits in a dense arena indexed by `addr - base`. Within a run
//! bits are only ever set, never cleared; pruning happens downstream by
//! building a separate selection, not by mutating this table.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::address::Addr;

/// Bit set of facts known about one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FactSet(u8);

impl FactSet {
    pub const EMPTY: FactSet = FactSet(0);
    /// Address was seeded from external evidence.
    pub const SEED: FactSet = FactSet(1);
    /// A candidate decodes here and is not statically invalid.
    pub const VALID_START: FactSet = FactSet(2);
    /// Proven reachable from a seed.
    pub const REACHABLE: FactSet = FactSet(4);
    /// Target of at least one reachable direct call.
    pub const CALL_TARGET: FactSet = FactSet(8);
    /// Referenced by an operand as data.
    pub const DATA_REFERENCED: FactSet = FactSet(16);
    /// Candidate here was transitively invalidated.
    pub const STATIC_INVALID: FactSet = FactSet(32);

    pub fn contains(&self, other: FactSet) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Insert `other`; true when any bit was newly set.
    pub fn insert(&mut self, other: FactSet) -> bool {
        let before = self.0;
        self.0 |= other.0;
        self.0 != before
    }

    /// Number of set bits.
    pub fn bit_count(&self) -> u32 {
        self.0.count_ones()
    }
}

impl std::ops::BitOr for FactSet {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        FactSet(self.0 | rhs.0)
    }
}

impl fmt::Display for FactSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs = [
            (Self::SEED, 's'),
            (Self::VALID_START, 'v'),
            (Self::REACHABLE, 'r'),
            (Self::CALL_TARGET, 'c'),
            (Self::DATA_REFERENCED, 'd'),
            (Self::STATIC_INVALID, 'i'),
        ];
        for (bit, ch) in pairs {
            write!(f, "{}", if self.contains(bit) { ch } else { '-' })?;
        }
        Ok(())
    }
}

/// Dense per-address fact arena.
pub struct FactTable {
    base: Addr,
    facts: Vec<FactSet>,
}

impl FactTable {
    pub fn new(base: Addr, span: usize) -> Self {
        Self {
            base,
            facts: vec![FactSet::EMPTY; span],
        }
    }

    pub fn base(&self) -> Addr {
        self.base
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    fn index_of(&self, addr: Addr) -> Option<usize> {
        if addr < self.base {
            return None;
        }
        let idx = (addr.0 - self.base.0) as usize;
        (idx < self.facts.len()).then_some(idx)
    }

    /// Facts at `addr`; empty for addresses outside the span.
    pub fn get(&self, addr: Addr) -> FactSet {
        self.index_of(addr)
            .map(|i| self.facts[i])
            .unwrap_or(FactSet::EMPTY)
    }

    pub fn contains(&self, addr: Addr, facts: FactSet) -> bool {
        self.get(addr).contains(facts)
    }

    /// Set `facts` at `addr`; true when any bit was newly set.
    /// Out-of-span addresses are ignored.
    pub fn set(&mut self, addr: Addr, facts: FactSet) -> bool {
        match self.index_of(addr) {
            Some(i) => self.facts[i].insert(facts),
            None => false,
        }
    }

    /// Total set bits across the table.
    pub fn total_bits(&self) -> usize {
        self.facts.iter().map(|f| f.bit_count() as usize).sum()
    }

    /// Addresses with at least one fact, ascending.
    pub fn non_empty(&self) -> impl Iterator<Item = (Addr, FactSet)> + '_ {
        self.facts.iter().enumerate().filter_map(move |(i, f)| {
            (!f.is_empty()).then(|| (Addr(self.base.0 + i as u64), *f))
        })
    }
}

/// Frozen reachability snapshot handed to conflict resolution.
///
/// Built once after the fixpoint converges; conflict resolution reads it
/// and never writes back.
pub struct ReachabilitySet {
    base: Addr,
    bits: Vec<bool>,
}

impl ReachabilitySet {
    pub fn from_table(table: &FactTable) -> Self {
        let bits = (0..table.len())
            .map(|i| {
                table
                    .get(Addr(table.base().0 + i as u64))
                    .contains(FactSet::REACHABLE)
            })
            .collect();
        Self {
            base: table.base(),
            bits,
        }
    }

    pub fn is_reachable(&self, addr: Addr) -> bool {
        if addr < self.base {
            return false;
        }
        let idx = (addr.0 - self.base.0) as usize;
        self.bits.get(idx).copied().unwrap_or(false)
    }

    /// Reachable addresses in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = Addr> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter_map(move |(i, b)| b.then(|| Addr(self.base.0 + i as u64)))
    }

    pub fn len(&self) -> usize {
        self.bits.iter().filter(|b| **b).count()
    }

    pub fn is_empty(&self) -> bool {
        !self.bits.iter().any(|b| *b)
    }
}
