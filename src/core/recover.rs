//! Purpose: Salvage message records from a raw message area after a crash.
//! Exports: `scan_records`, `select_records`, `ScannedRecord`, `ScanOutcome`.
//! Role: Pure scan over bytes; `store::LogStore::recover` rewrites the index from its output.
//! Invariants: Accepted records never overlap; a failed candidate advances one byte.
//! Invariants: Records referencing handles the salvaged string table lacks are rejected.
use std::collections::HashMap;

use crate::core::index::IndexEntry;
use crate::core::record::{StrippedMessage, EYE_CATCHER, RECORD_FIXED_LEN};
use crate::core::strings::TextResolver;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ScannedRecord {
    pub offset: u64,
    pub length: u32,
    pub id: u32,
    pub index_position: u32,
}

impl ScannedRecord {
    pub fn entry(&self) -> IndexEntry {
        IndexEntry {
            offset: self.offset as u32,
            length: self.length,
            id: self.id,
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ScanOutcome {
    pub records: Vec<ScannedRecord>,
    pub fragments_skipped: u32,
}

/// Walks `area` (starting at absolute file offset `base`) looking for eye-catchers.
pub fn scan_records(area: &[u8], base: u64, strings: &impl TextResolver) -> ScanOutcome {
    let needle = EYE_CATCHER.to_le_bytes();
    let mut outcome = ScanOutcome::default();
    let mut cursor = 0usize;

    while cursor + RECORD_FIXED_LEN <= area.len() {
        let Some(found) = find(&area[cursor..], &needle) else {
            break;
        };
        let at = cursor + found;
        match StrippedMessage::decode(&area[at..]) {
            Ok((stripped, length))
                if stripped
                    .handles()
                    .all(|handle| strings.resolve(handle).is_some()) =>
            {
                outcome.records.push(ScannedRecord {
                    offset: base + at as u64,
                    length: length as u32,
                    id: stripped.id,
                    index_position: stripped.index_position,
                });
                cursor = at + length;
            }
            _ => {
                outcome.fragments_skipped += 1;
                cursor = at + 1;
            }
        }
    }

    outcome
}

/// Orders salvaged records by id (later physical copy wins on duplicate ids) and
/// keeps at most `capacity` of the newest. Returns the kept records and how many were dropped.
pub fn select_records(records: Vec<ScannedRecord>, capacity: u32) -> (Vec<ScannedRecord>, u32) {
    let total = records.len();
    let mut by_id: HashMap<u32, ScannedRecord> = HashMap::with_capacity(total);
    for record in records {
        match by_id.get(&record.id) {
            Some(existing) if existing.offset > record.offset => {}
            _ => {
                by_id.insert(record.id, record);
            }
        }
    }
    let mut kept: Vec<ScannedRecord> = by_id.into_values().collect();
    kept.sort_by_key(|record| (record.id, record.offset));
    let excess = kept.len().saturating_sub(capacity as usize);
    kept.drain(..excess);
    let dropped = (total - kept.len()) as u32;
    (kept, dropped)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
