//! Purpose: Decide how a message will be stripped and where it will land, without I/O.
//! Exports: `plan_strip`, `plan_append`, `StripPlan`, `FieldPlan`, `AppendPlan`, `Placement`.
//! Role: Pure planning layer; `store` applies the resulting plan to the file.
//! Invariants: Output depends only on the index, string table, layout, and inputs.
//! Invariants: Evictions are always a prefix of the logical (oldest-first) order.
use crate::core::error::{Error, ErrorKind};
use crate::core::format::Layout;
use crate::core::index::{IndexDirectory, IndexHeader};
use crate::core::record::{Message, TextField, RECORD_FIXED_LEN};
use crate::core::strings::StringTable;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FieldPlan {
    Existing(u32),
    Intern,
    Inline,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StripPlan {
    pub fields: [FieldPlan; 4],
    pub record_len: usize,
}

/// Predicts which text fields become handles, so the record length is known up front.
pub fn plan_strip(strings: &StringTable, message: &Message) -> StripPlan {
    let mut fields = [FieldPlan::Inline; 4];
    let mut pending: Vec<&[u8]> = Vec::new();
    let mut pending_bytes = 0u64;
    let mut record_len = RECORD_FIXED_LEN;

    for (slot, field) in fields.iter_mut().zip(TextField::ALL) {
        let value: &[u8] = message.text(field);
        *slot = if value.is_empty() {
            FieldPlan::Inline
        } else if let Some(handle) = strings.lookup(value) {
            FieldPlan::Existing(handle)
        } else if pending.contains(&value) {
            FieldPlan::Intern
        } else if strings.has_room(pending.len() as u32 + 1, pending_bytes + value.len() as u64) {
            pending.push(value);
            pending_bytes += value.len() as u64;
            FieldPlan::Intern
        } else {
            FieldPlan::Inline
        };
        record_len += match slot {
            FieldPlan::Inline => 4 + value.len(),
            FieldPlan::Existing(_) | FieldPlan::Intern => 4,
        };
    }

    StripPlan { fields, record_len }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AppendPlan {
    pub position: u32,
    pub offset: u64,
    pub evictions: Vec<u32>,
    pub next_header: IndexHeader,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Placement {
    Append(AppendPlan),
    Rotate,
}

/// Chooses the index slot and byte offset for a record of `record_len` bytes.
///
/// Without `reuse`, a full index or a short tail asks for rotation. With
/// `reuse`, the record wraps to the start of the message area when the tail is
/// short, and the oldest entries are evicted until nothing live overlaps.
pub fn plan_append(
    index: &IndexDirectory,
    layout: &Layout,
    record_len: u64,
    reuse: bool,
) -> Result<Placement, Error> {
    let area_start = layout.message_offset;
    let area_end = layout.file_size;
    if record_len > layout.message_area_len() {
        return Err(Error::new(ErrorKind::Capacity)
            .with_message(format!(
                "record of {record_len} bytes exceeds message area of {} bytes",
                layout.message_area_len()
            ))
            .with_hint("Raise max_size or shorten the message."));
    }

    let header = index.header();
    // A zero-capacity directory is permanently full.
    if header.index_count == 0 {
        return Ok(Placement::Rotate);
    }
    let Some(newest) = index.newest() else {
        return Ok(Placement::Append(AppendPlan {
            position: 0,
            offset: area_start,
            evictions: Vec::new(),
            next_header: IndexHeader {
                record_count: 1,
                oldest_entry: 0,
                newest_entry: 0,
                ..header
            },
        }));
    };

    let position = (header.newest_entry + 1) % header.index_count;
    let tail = newest.end().max(area_start);
    let fits_tail = tail + record_len <= area_end;

    if !reuse {
        if index.is_full() || !fits_tail || tail < index.high_water() {
            return Ok(Placement::Rotate);
        }
        return Ok(Placement::Append(AppendPlan {
            position,
            offset: tail,
            evictions: Vec::new(),
            next_header: IndexHeader {
                record_count: header.record_count + 1,
                newest_entry: position,
                ..header
            },
        }));
    }

    // Bytes between the old tail and the end of the area are abandoned on wrap,
    // so entries living there count as overlapped too.
    let (offset, covered) = if fits_tail {
        (tail, [(tail, tail + record_len), (0, 0)])
    } else {
        (
            area_start,
            [(tail, area_end), (area_start, area_start + record_len)],
        )
    };

    let mut evict_through: Option<usize> = if index.is_full() { Some(0) } else { None };
    for (rank, live) in index.positions().enumerate() {
        let Some(entry) = index.entry(live) else {
            continue;
        };
        let overlapped = covered
            .iter()
            .any(|&(start, end)| start < end && entry.overlaps(start, end));
        if overlapped {
            evict_through = Some(evict_through.map_or(rank, |current| current.max(rank)));
        }
    }

    let evictions: Vec<u32> = match evict_through {
        Some(last) => index.positions().take(last + 1).collect(),
        None => Vec::new(),
    };
    let remaining = header.record_count - evictions.len() as u32;
    let oldest_entry = if remaining == 0 {
        position
    } else {
        (header.oldest_entry + evictions.len() as u32) % header.index_count
    };

    Ok(Placement::Append(AppendPlan {
        position,
        offset,
        evictions,
        next_header: IndexHeader {
            record_count: remaining + 1,
            oldest_entry,
            newest_entry: position,
            ..header
        },
    }))
}
