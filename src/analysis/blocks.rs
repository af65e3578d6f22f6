//! Block and edge construction over the final selection.
//!
//! A single ascending scan: leaders are computed first (run starts,
//! retained transfer targets, post-transfer addresses), then blocks are
//! cut at leaders and every block's last instruction contributes its
//! outgoing edges. Every retained target is a leader, so resolved edge
//! targets are always block starts and mid-block entry cannot occur.

use std::collections::BTreeSet;
use tracing::info;

use crate::analysis::conflict::SelectedSet;
use crate::analysis::superset::SupersetTable;
use crate::core::address::Addr;
use crate::core::block::Block;
use crate::core::edge::{Edge, EdgeKind, EdgeTarget};
use crate::core::instruction::{CandidateInstruction, InstructionClass};

/// Blocks and edges built from one selection.
pub struct BlockBuildOutcome {
    pub blocks: Vec<Block>,
    pub edges: Vec<Edge>,
}

/// Cut the selected instructions into blocks and emit the edge set.
pub fn build(table: &SupersetTable, selected: &SelectedSet) -> BlockBuildOutcome {
    let instructions: Vec<&CandidateInstruction> = selected
        .iter()
        .filter_map(|addr| table.candidate_at(addr))
        .collect();

    let leaders = collect_leaders(&instructions, selected);
    let mut blocks = Vec::new();
    let mut edges = Vec::new();

    let mut i = 0;
    while i < instructions.len() {
        let start = instructions[i].address;
        let mut last = instructions[i];
        let mut count = 1u32;
        while i + 1 < instructions.len() {
            let next = instructions[i + 1];
            let contiguous = last.end() == next.address;
            if !contiguous
                || last.class != InstructionClass::Ordinary
                || leaders.contains(&next.address)
            {
                break;
            }
            i += 1;
            last = next;
            count += 1;
        }
        blocks.push(Block::new(start, last.end(), count));
        emit_edges(start, last, selected, &mut edges);
        i += 1;
    }

    info!(
        blocks = blocks.len(),
        edges = edges.len(),
        "block construction done"
    );
    BlockBuildOutcome { blocks, edges }
}

/// Leader addresses: first instruction of each contiguous run, every
/// retained direct transfer target, and every address following a
/// control transfer.
fn collect_leaders(
    instructions: &[&CandidateInstruction],
    selected: &SelectedSet,
) -> BTreeSet<Addr> {
    let mut leaders = BTreeSet::new();
    let mut prev_end: Option<Addr> = None;
    for ins in instructions {
        if prev_end != Some(ins.address) {
            leaders.insert(ins.address);
        }
        prev_end = Some(ins.end());
    }
    for ins in instructions {
        if let Some(target) = ins.direct_target() {
            if selected.is_selected(target) {
                leaders.insert(target);
            }
        }
        if ins.class != InstructionClass::Ordinary && selected.is_selected(ins.end()) {
            leaders.insert(ins.end());
        }
    }
    leaders
}

/// Outgoing edges of a block, determined by its last instruction.
///
/// Direct targets that lost conflict resolution are kept as unresolved
/// edges rather than dropped; the snapshot can enumerate them.
fn emit_edges(
    source: Addr,
    last: &CandidateInstruction,
    selected: &SelectedSet,
    edges: &mut Vec<Edge>,
) {
    let resolved = |addr: Addr| {
        if selected.is_selected(addr) {
            EdgeTarget::Block(addr)
        } else {
            EdgeTarget::Unresolved
        }
    };
    match last.class {
        InstructionClass::Ordinary => {
            if selected.is_selected(last.end()) {
                edges.push(Edge::new(
                    source,
                    EdgeTarget::Block(last.end()),
                    EdgeKind::Fallthrough,
                ));
            }
        }
        InstructionClass::Branch => {
            if let Some(target) = last.direct_target() {
                edges.push(Edge::new(source, resolved(target), EdgeKind::BranchTaken));
            }
        }
        InstructionClass::CondBranch => {
            if let Some(target) = last.direct_target() {
                edges.push(Edge::new(source, resolved(target), EdgeKind::BranchTaken));
            }
            edges.push(Edge::new(
                source,
                resolved(last.end()),
                EdgeKind::BranchFallthrough,
            ));
        }
        InstructionClass::Call => {
            if let Some(target) = last.direct_target() {
                edges.push(Edge::new(source, resolved(target), EdgeKind::Call));
            }
            edges.push(Edge::new(
                source,
                resolved(last.end()),
                EdgeKind::CallFallthrough,
            ));
        }
        InstructionClass::Return => {
            edges.push(Edge::new(source, EdgeTarget::Unresolved, EdgeKind::Return));
        }
        InstructionClass::IndirectBranch => {
            edges.push(Edge::new(
                source,
                EdgeTarget::Unresolved,
                EdgeKind::IndirectUnresolved,
            ));
        }
        InstructionClass::IndirectCall => {
            edges.push(Edge::new(
                source,
                EdgeTarget::Unresolved,
                EdgeKind::IndirectUnresolved,
            ));
            edges.push(Edge::new(
                source,
                resolved(last.end()),
                EdgeKind::CallFallthrough,
            ));
        }
        InstructionClass::Halt => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::conflict::ConflictResolver;
    use crate::analysis::fixpoint;
    use crate::analysis::superset::StaticInvalidSet;
    use crate::core::image::{LoadedImage, LoadedRange};
    use crate::core::range::{ByteRange, RangePerms};
    use crate::disasm::iced::IcedDecoder;
    use crate::disasm::Architecture;

    fn build_from(bytes: Vec<u8>) -> BlockBuildOutcome {
        let size = bytes.len() as u64;
        let img = LoadedImage::new(
            vec![LoadedRange::new(
                ByteRange::new(Addr(0x1000), size, RangePerms::CODE, ".text"),
                bytes,
            )],
            Vec::new(),
            Vec::new(),
            Addr(0x1000),
        )
        .unwrap();
        let table = SupersetTable::build(&img, &IcedDecoder::new(Architecture::X86_64));
        let invalid = StaticInvalidSet::compute(&table, &img);
        let out = fixpoint::run(&img, &table, &invalid, None).unwrap();
        let selected = ConflictResolver::new(&table, &out.facts, &out.reachable).resolve();
        build(&table, &selected)
    }

    fn edge(out: &BlockBuildOutcome, source: u64, kind: EdgeKind) -> Option<&Edge> {
        out.edges
            .iter()
            .find(|e| e.source == Addr(source) && e.kind == kind)
    }

    #[test]
    fn straight_line_is_one_block() {
        let out = build_from(vec![0x90, 0x90, 0xc3]);
        assert_eq!(out.blocks.len(), 1);
        let b = &out.blocks[0];
        assert_eq!(b.start, Addr(0x1000));
        assert_eq!(b.end, Addr(0x1003));
        assert_eq!(b.instruction_count, 3);
        assert_eq!(out.edges.len(), 1);
        assert_eq!(out.edges[0].kind, EdgeKind::Return);
    }

    #[test]
    fn call_splits_at_return_site_and_callee() {
        // call 0x1006; ret; ret
        let out = build_from(vec![0xe8, 0x01, 0x00, 0x00, 0x00, 0xc3, 0xc3]);
        let starts: Vec<_> = out.blocks.iter().map(|b| b.start).collect();
        assert_eq!(starts, vec![Addr(0x1000), Addr(0x1005), Addr(0x1006)]);
        let call = edge(&out, 0x1000, EdgeKind::Call).unwrap();
        assert_eq!(call.target_block(), Some(Addr(0x1006)));
        let fall = edge(&out, 0x1000, EdgeKind::CallFallthrough).unwrap();
        assert_eq!(fall.target_block(), Some(Addr(0x1005)));
    }

    #[test]
    fn conditional_branch_emits_both_edges() {
        // je 0x1003; ret; ret
        let out = build_from(vec![0x74, 0x01, 0xc3, 0xc3]);
        let taken = edge(&out, 0x1000, EdgeKind::BranchTaken).unwrap();
        assert_eq!(taken.target_block(), Some(Addr(0x1003)));
        let fall = edge(&out, 0x1000, EdgeKind::BranchFallthrough).unwrap();
        assert_eq!(fall.target_block(), Some(Addr(0x1002)));
    }

    #[test]
    fn branch_target_splits_a_run() {
        // je 0x1004; nop; nop; nop; ret -- target lands mid-run
        let out = build_from(vec![0x74, 0x02, 0x90, 0x90, 0x90, 0xc3]);
        let starts: Vec<_> = out.blocks.iter().map(|b| b.start).collect();
        assert_eq!(starts, vec![Addr(0x1000), Addr(0x1002), Addr(0x1004)]);
        let fall = edge(&out, 0x1002, EdgeKind::Fallthrough).unwrap();
        assert_eq!(fall.target_block(), Some(Addr(0x1004)));
    }

    #[test]
    fn indirect_branch_keeps_flagged_edge() {
        let out = build_from(vec![0xff, 0xe0]);
        let e = edge(&out, 0x1000, EdgeKind::IndirectUnresolved).unwrap();
        assert!(e.is_unresolved());
    }

    #[test]
    fn self_loop_is_an_ordinary_edge() {
        // jmp 0x1000
        let out = build_from(vec![0xeb, 0xfe]);
        let e = edge(&out, 0x1000, EdgeKind::BranchTaken).unwrap();
        assert_eq!(e.target_block(), Some(Addr(0x1000)));
    }

    #[test]
    fn blocks_partition_selected_instructions() {
        let out = build_from(vec![0xe8, 0x01, 0x00, 0x00, 0x00, 0xc3, 0xc3]);
        for pair in out.blocks.windows(2) {
            assert!(pair[0].end <= pair[1].start);
        }
        // every resolved edge target is a block start
        for e in &out.edges {
            if let Some(t) = e.target_block() {
                assert!(out.blocks.iter().any(|b| b.start == t));
            }
        }
    }
}
