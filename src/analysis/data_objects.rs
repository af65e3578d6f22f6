//! Data object inference over unclaimed bytes.
//!
//! Runs after conflict resolution, in parallel with the symbolizer. Every
//! byte of a data-eligible range that no selected instruction claims ends
//! up inside exactly one object; classification is best-effort and the
//! pass never fails. Boundary evidence comes from operand reference hints,
//! relocation sites, and segment edges.

use std::collections::BTreeSet;
use tracing::{debug, info};

use crate::analysis::conflict::SelectedSet;
use crate::analysis::facts::{FactSet, FactTable};
use crate::analysis::superset::SupersetTable;
use crate::core::address::Addr;
use crate::core::data_object::{DataKind, DataObject};
use crate::core::image::LoadedImage;

/// Shortest printable run accepted as a char sequence.
const MIN_CHAR_RUN: usize = 4;

/// Build the data object list for one finished selection.
pub fn run(
    image: &LoadedImage,
    table: &SupersetTable,
    selected: &SelectedSet,
    facts: &FactTable,
    pointer_bytes: u64,
) -> Vec<DataObject> {
    let claimed: Vec<(Addr, Addr)> = selected
        .iter()
        .filter_map(|addr| table.candidate_at(addr).map(|ins| (addr, ins.end())))
        .collect();

    let mut boundaries: BTreeSet<Addr> = facts
        .non_empty()
        .filter(|(_, f)| f.contains(FactSet::DATA_REFERENCED))
        .map(|(addr, _)| addr)
        .collect();
    for reloc in image.relocations() {
        boundaries.insert(reloc.address);
    }

    let mut objects = Vec::new();
    for loaded in image.ranges() {
        if !loaded.range.perms.is_data_eligible() {
            continue;
        }
        let range_start = loaded.range.start;
        let range_end = loaded.range.end();
        let mut cursor = range_start;
        for &(cs, ce) in claimed
            .iter()
            .filter(|&&(cs, ce)| cs < range_end && ce > range_start)
        {
            if cs > cursor {
                build_segment(
                    image,
                    &boundaries,
                    cursor,
                    cs.min(range_end),
                    pointer_bytes,
                    &mut objects,
                );
            }
            cursor = cursor.max(ce);
        }
        if cursor < range_end {
            build_segment(
                image,
                &boundaries,
                cursor,
                range_end,
                pointer_bytes,
                &mut objects,
            );
        }
        debug!(section = %loaded.range.section, "data range scanned");
    }

    info!(objects = objects.len(), "data object inference done");
    objects
}

/// Cut one unclaimed segment at its interior boundaries and classify
/// each piece.
fn build_segment(
    image: &LoadedImage,
    boundaries: &BTreeSet<Addr>,
    start: Addr,
    end: Addr,
    pointer_bytes: u64,
    out: &mut Vec<DataObject>,
) {
    let mut cuts: Vec<Addr> = vec![start];
    cuts.extend(
        boundaries
            .range((
                std::ops::Bound::Excluded(start),
                std::ops::Bound::Excluded(end),
            ))
            .copied(),
    );
    cuts.push(end);
    for pair in cuts.windows(2) {
        let (piece_start, piece_end) = (pair[0], pair[1]);
        let len = (piece_end.0 - piece_start.0) as usize;
        let bytes = match image.read_bytes(piece_start, len) {
            Some(bytes) => bytes,
            None => continue,
        };
        let referenced = boundaries.contains(&piece_start);
        classify_piece(image, piece_start, bytes, referenced, pointer_bytes, out);
    }
}

/// Classify one piece, emitting one or more objects that cover it
/// exactly. Unclassifiable bytes degrade to `Opaque`.
fn classify_piece(
    image: &LoadedImage,
    start: Addr,
    bytes: &[u8],
    referenced: bool,
    pointer_bytes: u64,
    out: &mut Vec<DataObject>,
) {
    let mut pos = 0usize;
    while pos < bytes.len() {
        let addr = Addr(start.0 + pos as u64);
        let run = pointer_run(image, addr, &bytes[pos..], pointer_bytes);
        if run > 0 {
            out.push(DataObject::new(
                addr,
                run as u64 * pointer_bytes,
                DataKind::Pointer,
                run as u32,
            ));
            pos += run * pointer_bytes as usize;
            continue;
        }
        if pos == 0 && referenced {
            if let Some(n) = memchr::memchr(0, bytes) {
                if n >= MIN_CHAR_RUN && bytes[..n].iter().all(|b| is_printable(*b)) {
                    out.push(DataObject::new(
                        addr,
                        (n + 1) as u64,
                        DataKind::CharSequence,
                        (n + 1) as u32,
                    ));
                    pos = n + 1;
                    continue;
                }
            }
            let rem = bytes.len();
            if rem <= 8 && rem.is_power_of_two() && addr.0 % rem as u64 == 0 {
                out.push(DataObject::new(addr, rem as u64, DataKind::Scalar(rem as u8), 1));
                return;
            }
        }
        let extent = opaque_extent(image, addr, &bytes[pos..], pointer_bytes);
        out.push(DataObject::new(addr, extent as u64, DataKind::Opaque, 1));
        pos += extent;
    }
}

/// Length of the maximal run of aligned pointer-width cells whose values
/// land inside the image.
fn pointer_run(image: &LoadedImage, addr: Addr, bytes: &[u8], pointer_bytes: u64) -> usize {
    if addr.0 % pointer_bytes != 0 {
        return 0;
    }
    let width = pointer_bytes as usize;
    let mut run = 0usize;
    while let Some(value) = cell_value(&bytes[run * width..], pointer_bytes) {
        if !image.contains(Addr(value)) {
            break;
        }
        run += 1;
    }
    run
}

/// Bytes until the next qualifying pointer run, capped at the piece end.
fn opaque_extent(image: &LoadedImage, addr: Addr, bytes: &[u8], pointer_bytes: u64) -> usize {
    let misalign = addr.0 % pointer_bytes;
    let mut off = if misalign == 0 {
        pointer_bytes
    } else {
        pointer_bytes - misalign
    } as usize;
    while off < bytes.len() {
        match cell_value(&bytes[off..], pointer_bytes) {
            Some(value) if image.contains(Addr(value)) => return off,
            _ => off += pointer_bytes as usize,
        }
    }
    bytes.len()
}

fn cell_value(bytes: &[u8], pointer_bytes: u64) -> Option<u64> {
    match pointer_bytes {
        8 => bytes
            .get(..8)
            .and_then(|b| <[u8; 8]>::try_from(b).ok())
            .map(u64::from_le_bytes),
        4 => bytes
            .get(..4)
            .and_then(|b| <[u8; 4]>::try_from(b).ok())
            .map(|b| u32::from_le_bytes(b) as u64),
        _ => None,
    }
}

fn is_printable(b: u8) -> bool {
    (0x20..0x7f).contains(&b) || b == b'\t' || b == b'\n' || b == b'\r'
}
