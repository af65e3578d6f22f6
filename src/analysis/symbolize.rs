//! Symbolization of address-valued operands.
//!
//! Runs over the frozen selection, in parallel with the data object
//! builder, so it cannot see finished data objects. Data references are
//! therefore emitted as *provisional* bindings by raw address; snapshot
//! assembly resolves each to (object start, byte offset) once the object
//! list exists. Block and symbol bindings are final here.

use std::collections::BTreeMap;
use tracing::info;

use crate::analysis::conflict::SelectedSet;
use crate::analysis::facts::{FactSet, FactTable};
use crate::analysis::superset::SupersetTable;
use crate::core::address::Addr;
use crate::core::block::Block;
use crate::core::image::LoadedImage;
use crate::core::instruction::AddressingMode;
use crate::core::symbolic::OperandKey;

/// One operand binding before data-object resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionalBinding {
    /// Final: the address starts a recovered block.
    Block(Addr),
    /// Provisional: the address lies in a data-eligible range; resolved
    /// to (object start, offset) at snapshot assembly.
    Data(Addr),
    /// Final: an externally supplied symbol at exactly this address.
    Symbol(usize),
    /// Final: matched nothing in the image.
    Constant(u64),
    /// Final: indirect operand, statically unresolved.
    UnresolvedIndirect,
}

/// One symbolized operand awaiting assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisionalExpression {
    pub operand: OperandKey,
    pub binding: ProvisionalBinding,
}

/// Symbolizer output: bindings plus labels for every block start.
pub struct SymbolizeOutcome {
    pub expressions: Vec<ProvisionalExpression>,
    pub labels: BTreeMap<Addr, String>,
}

/// Bind every address-valued operand of every selected instruction.
///
/// Binding precedence: block start, then data location, then external
/// symbol, then plain constant. An address that is both a block start
/// and inside a data range binds to the block.
pub fn run(
    image: &LoadedImage,
    table: &SupersetTable,
    selected: &SelectedSet,
    facts: &FactTable,
    blocks: &[Block],
) -> SymbolizeOutcome {
    let mut expressions = Vec::new();
    for addr in selected.iter() {
        let ins = match table.candidate_at(addr) {
            Some(ins) => ins,
            None => continue,
        };
        for op in &ins.operands {
            let key = OperandKey::new(ins.address, op.index);
            let binding = match (op.mode, op.target) {
                (AddressingMode::IndirectRegister, _) => ProvisionalBinding::UnresolvedIndirect,
                (AddressingMode::Absolute | AddressingMode::PcRelative, Some(target)) => {
                    bind(image, blocks, target)
                }
                (AddressingMode::Absolute | AddressingMode::PcRelative, None) => continue,
            };
            expressions.push(ProvisionalExpression {
                operand: key,
                binding,
            });
        }
    }

    let labels = block_labels(image, facts, blocks);
    info!(
        expressions = expressions.len(),
        labels = labels.len(),
        "symbolization done"
    );
    SymbolizeOutcome {
        expressions,
        labels,
    }
}

fn bind(image: &LoadedImage, blocks: &[Block], target: Addr) -> ProvisionalBinding {
    if blocks.binary_search_by_key(&target, |b| b.start).is_ok() {
        return ProvisionalBinding::Block(target);
    }
    if image.is_data_addr(target) {
        return ProvisionalBinding::Data(target);
    }
    if let Some(idx) = symbol_index_at(image, target) {
        return ProvisionalBinding::Symbol(idx);
    }
    ProvisionalBinding::Constant(target.0)
}

fn symbol_index_at(image: &LoadedImage, addr: Addr) -> Option<usize> {
    image.symbols().iter().position(|s| s.address == addr)
}

/// One label per block start: the external symbol name when one exists
/// at exactly that address, `sub_{:x}` for call targets and the entry
/// point, `loc_{:x}` otherwise.
fn block_labels(
    image: &LoadedImage,
    facts: &FactTable,
    blocks: &[Block],
) -> BTreeMap<Addr, String> {
    let mut labels = BTreeMap::new();
    for block in blocks {
        let name = match image.symbol_at(block.start) {
            Some(sym) => sym.name.clone(),
            None => {
                if facts.contains(block.start, FactSet::CALL_TARGET)
                    || block.start == image.entry()
                {
                    format!("sub_{:x}", block.start.0)
                } else {
                    format!("loc_{:x}", block.start.0)
                }
            }
        };
        labels.insert(block.start, name);
    }
    labels
}
