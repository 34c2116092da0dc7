//! Purpose: Fixed on-disk geometry of a log file and the capacity heuristics.
//! Exports: `Geometry`, `Layout`, signature and region size constants, LE field readers.
//! Role: Single source of truth for region offsets used by index, string table, and store.
//! Invariants: All persisted integers are little-endian; offsets fit in u32.
//! Invariants: Region order is signature, index header, index entries, string table, messages.

use crate::core::error::{Error, ErrorKind};

pub const SIGNATURE: [u8; 8] = *b"MSGLOG01";
pub const SIGNATURE_LEN: u64 = 8;
pub const INDEX_HEADER_OFFSET: u64 = SIGNATURE_LEN;
pub const INDEX_HEADER_LEN: u64 = 16;
pub const INDEX_ENTRY_OFFSET: u64 = INDEX_HEADER_OFFSET + INDEX_HEADER_LEN;
pub const INDEX_ENTRY_LEN: u64 = 12;
pub const STRING_HEADER_LEN: u64 = 12;
pub const STRING_SLOT_LEN: u64 = 8;

// Entry offsets are stored in four bytes.
pub const MAX_FILE_SIZE: u64 = u32::MAX as u64;

const MAX_DERIVED_STRING_TABLE: u64 = 1024 * 1024;
const AVG_STRING_LEN: u64 = 40;
const AVG_MESSAGE_LEN: u64 = 80;
const MAX_OVERHEAD_PERCENT: u64 = 20;

/// Capacities chosen when a file is created. Immutable for the life of that file.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Geometry {
    pub max_size: u64,
    pub max_entries: u32,
    pub string_table_size: u32,
    pub max_string_entries: u32,
}

impl Geometry {
    pub fn new(
        max_size: u64,
        max_entries: u32,
        string_table_size: u32,
        max_string_entries: u32,
    ) -> Self {
        Self {
            max_size,
            max_entries,
            string_table_size,
            max_string_entries,
        }
    }

    /// Derives index and string-table capacities from the file size alone.
    ///
    /// The string table takes a tenth of the file (at most 1 MiB) and assumes
    /// 40-byte strings; the index assumes 80-byte messages. Neither slot array
    /// may consume more than a fifth of the region it describes.
    pub fn derive(max_size: u64) -> Self {
        let table = (max_size / 10)
            .min(MAX_DERIVED_STRING_TABLE)
            .max(STRING_HEADER_LEN);
        let table_payload = table - STRING_HEADER_LEN;
        let string_entries = (table_payload / AVG_STRING_LEN)
            .min(table * MAX_OVERHEAD_PERCENT / 100 / STRING_SLOT_LEN);

        let region = max_size.saturating_sub(INDEX_ENTRY_OFFSET + table);
        let entries = (region / AVG_MESSAGE_LEN)
            .min(region * MAX_OVERHEAD_PERCENT / 100 / INDEX_ENTRY_LEN)
            .max(1);

        Self {
            max_size,
            max_entries: clamp_u32(entries),
            string_table_size: clamp_u32(table),
            max_string_entries: clamp_u32(string_entries),
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.max_entries == 0 {
            return Err(Error::new(ErrorKind::Usage).with_message("max_entries must be at least 1"));
        }
        if self.max_size > MAX_FILE_SIZE {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("max_size exceeds {MAX_FILE_SIZE} bytes")));
        }
        let slots_len = STRING_HEADER_LEN + self.max_string_entries as u64 * STRING_SLOT_LEN;
        if (self.string_table_size as u64) < slots_len {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("string_table_size is too small for max_string_entries")
                .with_hint(format!("Need at least {slots_len} bytes for the header and slots.")));
        }
        let layout = self.layout();
        if layout.message_offset >= self.max_size {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("max_size leaves no room for messages")
                .with_hint(format!(
                    "Headers need {} bytes; raise max_size or lower the capacities.",
                    layout.message_offset
                )));
        }
        Ok(())
    }

    pub fn layout(&self) -> Layout {
        Layout::new(
            self.max_entries,
            self.string_table_size,
            self.max_string_entries,
            self.max_size,
        )
    }
}

fn clamp_u32(value: u64) -> u32 {
    value.min(u32::MAX as u64) as u32
}

/// Absolute offsets of every region, computed from the persisted capacities.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Layout {
    pub index_count: u32,
    pub string_table_offset: u64,
    pub string_table_size: u64,
    pub string_slots: u32,
    pub string_data_offset: u64,
    pub string_data_len: u64,
    pub message_offset: u64,
    pub file_size: u64,
}

impl Layout {
    pub fn new(
        index_count: u32,
        string_table_size: u32,
        string_slots: u32,
        file_size: u64,
    ) -> Self {
        let string_table_offset = INDEX_ENTRY_OFFSET + index_count as u64 * INDEX_ENTRY_LEN;
        let string_table_size = string_table_size as u64;
        let string_data_offset =
            string_table_offset + STRING_HEADER_LEN + string_slots as u64 * STRING_SLOT_LEN;
        let string_data_len =
            (string_table_offset + string_table_size).saturating_sub(string_data_offset);
        Self {
            index_count,
            string_table_offset,
            string_table_size,
            string_slots,
            string_data_offset,
            string_data_len,
            message_offset: string_table_offset + string_table_size,
            file_size,
        }
    }

    pub fn index_entry_offset(&self, position: u32) -> u64 {
        INDEX_ENTRY_OFFSET + position as u64 * INDEX_ENTRY_LEN
    }

    pub fn string_slot_offset(&self, handle: u32) -> u64 {
        self.string_table_offset + STRING_HEADER_LEN + handle as u64 * STRING_SLOT_LEN
    }

    pub fn message_area_len(&self) -> u64 {
        self.file_size.saturating_sub(self.message_offset)
    }

    pub fn geometry(&self) -> Geometry {
        Geometry {
            max_size: self.file_size,
            max_entries: self.index_count,
            string_table_size: clamp_u32(self.string_table_size),
            max_string_entries: self.string_slots,
        }
    }
}

/// Reads a little-endian u32 at `offset`; callers size `buf` for every field they decode.
pub(crate) fn read_u32_le(buf: &[u8], offset: usize) -> u32 {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(out)
}

pub(crate) fn read_u64_le(buf: &[u8], offset: usize) -> u64 {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(out)
}
