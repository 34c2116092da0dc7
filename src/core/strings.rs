//! Purpose: Append-only interned string area shared by every record in one file.
//! Exports: `StringTable`, `StringTableHeader`, `StringSlot`, `TextResolver`, `SalvageReport`.
//! Role: Deduplicates repeated text fields into 4-byte handles.
//! Invariants: Slots are allocated contiguously and never moved, reused, or freed.
//! Invariants: Bytes, then slot, then header are written, so a torn intern is invisible.
//! Invariants: Hash caches are rebuilt from disk on open; disk is the source of truth.
use std::collections::HashMap;

use bstr::{BStr, BString, ByteSlice};

use crate::core::error::Error;
use crate::core::format::{read_u32_le, Layout, STRING_HEADER_LEN, STRING_SLOT_LEN};
use crate::core::io::BlockFile;

/// Resolves a string-table handle back to its bytes.
pub trait TextResolver {
    fn resolve(&self, handle: u32) -> Option<&BStr>;
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StringTableHeader {
    pub total_size: u32,
    pub total_indexes: u32,
    pub index_in_use: u32,
}

impl StringTableHeader {
    pub fn encode(&self) -> [u8; STRING_HEADER_LEN as usize] {
        let mut buf = [0u8; STRING_HEADER_LEN as usize];
        buf[0..4].copy_from_slice(&self.total_size.to_le_bytes());
        buf[4..8].copy_from_slice(&self.total_indexes.to_le_bytes());
        buf[8..12].copy_from_slice(&self.index_in_use.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < STRING_HEADER_LEN as usize {
            return Err(Error::corrupt("string table header too small"));
        }
        Ok(Self {
            total_size: read_u32_le(buf, 0),
            total_indexes: read_u32_le(buf, 4),
            index_in_use: read_u32_le(buf, 8),
        })
    }

    pub fn read(io: &mut BlockFile, table_offset: u64) -> Result<Self, Error> {
        let buf = io.read_at(table_offset, STRING_HEADER_LEN as usize)?;
        Self::decode(&buf)
    }
}

/// Location of one interned value, relative to the start of the data region.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StringSlot {
    pub offset: u32,
    pub length: u32,
}

impl StringSlot {
    fn encode(&self) -> [u8; STRING_SLOT_LEN as usize] {
        let mut buf = [0u8; STRING_SLOT_LEN as usize];
        buf[0..4].copy_from_slice(&self.offset.to_le_bytes());
        buf[4..8].copy_from_slice(&self.length.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            offset: read_u32_le(buf, 0),
            length: read_u32_le(buf, 4),
        }
    }

    fn end(&self) -> u64 {
        self.offset as u64 + self.length as u64
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SalvageReport {
    pub recovered: u32,
    pub dropped: u32,
}

#[derive(Debug)]
pub struct StringTable {
    header: StringTableHeader,
    slots: Vec<StringSlot>,
    values: Vec<BString>,
    by_value: HashMap<Vec<u8>, u32>,
    table_offset: u64,
    data_offset: u64,
    data_len: u64,
    used_bytes: u64,
    degraded: bool,
}

impl StringTable {
    fn empty(layout: &Layout) -> Self {
        Self {
            header: StringTableHeader {
                total_size: layout.string_table_size as u32,
                total_indexes: layout.string_slots,
                index_in_use: 0,
            },
            slots: Vec::new(),
            values: Vec::new(),
            by_value: HashMap::new(),
            table_offset: layout.string_table_offset,
            data_offset: layout.string_data_offset,
            data_len: layout.string_data_len,
            used_bytes: 0,
            degraded: false,
        }
    }

    /// A table that resolves nothing and accepts nothing; every value is stored inline.
    pub fn degraded(layout: &Layout) -> Self {
        let mut table = Self::empty(layout);
        table.degraded = true;
        table
    }

    /// Writes the header, zeroed slots, and zero-padded data region of a fresh file.
    pub fn write_empty(io: &mut BlockFile, layout: &Layout) -> Result<Self, Error> {
        let table = Self::empty(layout);
        io.write_at(table.table_offset, &table.header.encode())?;
        io.write_zeros(
            layout.string_slot_offset(0),
            layout.string_table_size - STRING_HEADER_LEN,
        )?;
        Ok(table)
    }

    /// Loads the table and rebuilds both caches.
    ///
    /// A header that cannot describe a usable table, or slots that break the
    /// contiguity rule, degrade the table: values read so far stay resolvable
    /// but nothing new is interned.
    pub fn load(
        io: &mut BlockFile,
        layout: &Layout,
        header: StringTableHeader,
    ) -> Result<Self, Error> {
        let mut table = Self::empty(layout);
        table.header = header;
        if !table.header_is_consistent() {
            tracing::warn!(
                path = %io.path().display(),
                total_size = header.total_size,
                total_indexes = header.total_indexes,
                in_use = header.index_in_use,
                "string table header is inconsistent; new strings will be stored inline"
            );
            table.header.index_in_use = 0;
            table.degraded = true;
            return Ok(table);
        }
        let in_use = header.index_in_use;
        let accepted = table.read_slots(io, in_use)?;
        if accepted < in_use {
            tracing::warn!(
                path = %io.path().display(),
                accepted,
                in_use,
                "string table slots are not contiguous; new strings will be stored inline"
            );
            table.degraded = true;
        }
        Ok(table)
    }

    /// Rebuilds the table from the longest valid run of slots, ignoring `index_in_use`.
    pub fn salvage(
        io: &mut BlockFile,
        layout: &Layout,
        header: StringTableHeader,
    ) -> Result<(Self, SalvageReport), Error> {
        let mut table = Self::empty(layout);
        table.header = header;
        if !table.header_is_consistent_capacity() {
            table.header.index_in_use = 0;
            table.degraded = true;
            return Ok((table, SalvageReport::default()));
        }
        let recovered = table.read_slots(io, header.total_indexes)?;
        let dropped = header.index_in_use.saturating_sub(recovered);
        table.header.index_in_use = recovered;
        io.write_at(table.table_offset, &table.header.encode())?;
        Ok((table, SalvageReport { recovered, dropped }))
    }

    fn header_is_consistent_capacity(&self) -> bool {
        let needed =
            STRING_HEADER_LEN + self.header.total_indexes as u64 * STRING_SLOT_LEN;
        (self.header.total_size as u64) >= needed
    }

    fn header_is_consistent(&self) -> bool {
        self.header_is_consistent_capacity()
            && self.header.index_in_use <= self.header.total_indexes
    }

    // Reads up to `limit` slots, stopping at the first one that is empty, out of
    // bounds, or not adjacent to its predecessor. Returns how many were accepted.
    fn read_slots(&mut self, io: &mut BlockFile, limit: u32) -> Result<u32, Error> {
        if limit == 0 {
            return Ok(0);
        }
        let raw = io.read_at(
            self.table_offset + STRING_HEADER_LEN,
            (limit as u64 * STRING_SLOT_LEN) as usize,
        )?;
        let data = io.read_at(self.data_offset, self.data_len as usize)?;
        for chunk in raw.chunks_exact(STRING_SLOT_LEN as usize) {
            let slot = StringSlot::decode(chunk);
            if slot.length == 0
                || slot.offset as u64 != self.used_bytes
                || slot.end() > self.data_len
            {
                break;
            }
            let value = BString::from(&data[slot.offset as usize..slot.end() as usize]);
            self.push(slot, value);
        }
        self.header.index_in_use = self.slots.len() as u32;
        Ok(self.slots.len() as u32)
    }

    fn push(&mut self, slot: StringSlot, value: BString) {
        let handle = self.slots.len() as u32;
        self.by_value.entry(value.to_vec()).or_insert(handle);
        self.used_bytes = slot.end();
        self.slots.push(slot);
        self.values.push(value);
    }

    pub fn lookup(&self, value: &[u8]) -> Option<u32> {
        self.by_value.get(value).copied()
    }

    /// Whether `extra_slots` more values totalling `extra_bytes` would still fit.
    pub fn has_room(&self, extra_slots: u32, extra_bytes: u64) -> bool {
        !self.degraded
            && self.slots.len() as u64 + extra_slots as u64
                <= self.header.total_indexes as u64
            && self.used_bytes + extra_bytes <= self.data_len
    }

    /// Returns the handle for `value`, appending it when absent and space allows.
    /// `None` means the caller must store the value inline.
    pub fn intern(&mut self, io: &mut BlockFile, value: &[u8]) -> Result<Option<u32>, Error> {
        if value.is_empty() {
            return Ok(None);
        }
        if let Some(handle) = self.lookup(value) {
            return Ok(Some(handle));
        }
        if !self.has_room(1, value.len() as u64) {
            return Ok(None);
        }
        let handle = self.slots.len() as u32;
        let slot = StringSlot {
            offset: self.used_bytes as u32,
            length: value.len() as u32,
        };
        io.write_at(self.data_offset + slot.offset as u64, value)?;
        io.write_at(
            self.table_offset + STRING_HEADER_LEN + handle as u64 * STRING_SLOT_LEN,
            &slot.encode(),
        )?;
        self.header.index_in_use = handle + 1;
        io.write_at(self.table_offset, &self.header.encode())?;
        self.push(slot, BString::from(value));
        tracing::trace!(handle, len = value.len(), "interned string");
        Ok(Some(handle))
    }

    pub fn header(&self) -> StringTableHeader {
        self.header
    }

    pub fn entry_count(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn capacity(&self) -> u32 {
        self.header.total_indexes
    }

    pub fn bytes_used(&self) -> u64 {
        self.used_bytes
    }

    pub fn bytes_capacity(&self) -> u64 {
        self.data_len
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &BStr)> {
        self.values
            .iter()
            .enumerate()
            .map(|(handle, value)| (handle as u32, value.as_bstr()))
    }
}

impl TextResolver for StringTable {
    fn resolve(&self, handle: u32) -> Option<&BStr> {
        self.values.get(handle as usize).map(|value| value.as_bstr())
    }
}
