//! Purpose: Fixed-capacity circular index of message locations plus its header.
//! Exports: `IndexHeader`, `IndexEntry`, `IndexDirectory`, `DirectoryState`, `Positions`.
//! Role: Owns header cursors and the id lookup; persistence goes through `BlockFile`.
//! Invariants: `record_count <= index_count`; live positions run from `oldest_entry`
//! Invariants: for `record_count` slots, wrapping at `index_count`.
//! Invariants: The id map is a cache rebuilt from disk; an entry offset of 0 means unused.
use std::collections::HashMap;

use crate::core::error::Error;
use crate::core::format::{
    read_u32_le, Layout, INDEX_ENTRY_LEN, INDEX_HEADER_LEN, INDEX_HEADER_OFFSET,
};
use crate::core::io::BlockFile;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct IndexHeader {
    pub record_count: u32,
    pub index_count: u32,
    pub oldest_entry: u32,
    pub newest_entry: u32,
}

impl IndexHeader {
    pub fn empty(index_count: u32) -> Self {
        Self {
            record_count: 0,
            index_count,
            oldest_entry: 0,
            newest_entry: 0,
        }
    }

    pub fn encode(&self) -> [u8; INDEX_HEADER_LEN as usize] {
        let mut buf = [0u8; INDEX_HEADER_LEN as usize];
        buf[0..4].copy_from_slice(&self.record_count.to_le_bytes());
        buf[4..8].copy_from_slice(&self.index_count.to_le_bytes());
        buf[8..12].copy_from_slice(&self.oldest_entry.to_le_bytes());
        buf[12..16].copy_from_slice(&self.newest_entry.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < INDEX_HEADER_LEN as usize {
            return Err(Error::corrupt("index header too small"));
        }
        Ok(Self {
            record_count: read_u32_le(buf, 0),
            index_count: read_u32_le(buf, 4),
            oldest_entry: read_u32_le(buf, 8),
            newest_entry: read_u32_le(buf, 12),
        })
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.index_count == 0 {
            return Err(Error::corrupt("index capacity is zero"));
        }
        if self.record_count > self.index_count {
            return Err(Error::corrupt("record count exceeds index capacity"));
        }
        if self.oldest_entry >= self.index_count || self.newest_entry >= self.index_count {
            return Err(Error::corrupt("index cursor out of range"));
        }
        if self.record_count == 0 {
            return Ok(());
        }
        let expected = (self.oldest_entry as u64 + self.record_count as u64 - 1)
            % self.index_count as u64;
        if expected != self.newest_entry as u64 {
            return Err(Error::corrupt("index cursors disagree with record count"));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct IndexEntry {
    pub offset: u32,
    pub length: u32,
    pub id: u32,
}

impl IndexEntry {
    pub const UNUSED: IndexEntry = IndexEntry {
        offset: 0,
        length: 0,
        id: 0,
    };

    pub fn is_used(&self) -> bool {
        self.offset != 0
    }

    pub fn end(&self) -> u64 {
        self.offset as u64 + self.length as u64
    }

    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.is_used() && (self.offset as u64) < end && start < self.end()
    }

    pub fn encode(&self) -> [u8; INDEX_ENTRY_LEN as usize] {
        let mut buf = [0u8; INDEX_ENTRY_LEN as usize];
        buf[0..4].copy_from_slice(&self.offset.to_le_bytes());
        buf[4..8].copy_from_slice(&self.length.to_le_bytes());
        buf[8..12].copy_from_slice(&self.id.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Self {
        Self {
            offset: read_u32_le(buf, 0),
            length: read_u32_le(buf, 4),
            id: read_u32_le(buf, 8),
        }
    }
}

/// Observable phases of the directory, derived from the header and entry offsets.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DirectoryState {
    Empty,
    Filling,
    Wrapped,
    Full,
}

impl DirectoryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DirectoryState::Empty => "empty",
            DirectoryState::Filling => "filling",
            DirectoryState::Wrapped => "wrapped",
            DirectoryState::Full => "full",
        }
    }
}

#[derive(Debug)]
pub struct IndexDirectory {
    header: IndexHeader,
    entries: Vec<IndexEntry>,
    by_id: HashMap<u32, u32>,
    high_water: u64,
}

impl IndexDirectory {
    pub fn new(index_count: u32) -> Self {
        Self {
            header: IndexHeader::empty(index_count),
            entries: vec![IndexEntry::UNUSED; index_count as usize],
            by_id: HashMap::new(),
            high_water: 0,
        }
    }

    /// Writes an empty header and a zeroed entry array for a fresh file.
    pub fn write_empty(io: &mut BlockFile, layout: &Layout) -> Result<Self, Error> {
        let directory = Self::new(layout.index_count);
        io.write_at(INDEX_HEADER_OFFSET, &directory.header.encode())?;
        io.write_zeros(
            layout.index_entry_offset(0),
            layout.index_count as u64 * INDEX_ENTRY_LEN,
        )?;
        Ok(directory)
    }

    pub fn read_header(io: &mut BlockFile) -> Result<IndexHeader, Error> {
        let buf = io.read_at(INDEX_HEADER_OFFSET, INDEX_HEADER_LEN as usize)?;
        IndexHeader::decode(&buf)
    }

    pub fn read_entries(io: &mut BlockFile, layout: &Layout) -> Result<Vec<IndexEntry>, Error> {
        let raw = io.read_at(
            layout.index_entry_offset(0),
            (layout.index_count as u64 * INDEX_ENTRY_LEN) as usize,
        )?;
        Ok(raw
            .chunks_exact(INDEX_ENTRY_LEN as usize)
            .map(IndexEntry::decode)
            .collect())
    }

    pub fn load(io: &mut BlockFile, layout: &Layout, header: IndexHeader) -> Result<Self, Error> {
        header.validate()?;
        let entries = Self::read_entries(io, layout)?;
        let mut directory = Self {
            header,
            entries,
            by_id: HashMap::new(),
            high_water: 0,
        };
        directory.reindex();
        Ok(directory)
    }

    /// Builds a directory whose live entries are `records`, oldest first, at positions 0..n.
    pub fn rebuild(index_count: u32, records: &[IndexEntry]) -> Self {
        let mut directory = Self::new(index_count);
        let count = records.len().min(index_count as usize);
        directory.entries[..count].copy_from_slice(&records[..count]);
        directory.header.record_count = count as u32;
        directory.header.newest_entry = count.saturating_sub(1) as u32;
        directory.reindex();
        directory
    }

    fn reindex(&mut self) {
        self.by_id.clear();
        self.high_water = 0;
        let positions: Vec<u32> = self.positions().collect();
        for position in positions {
            let entry = self.entries[position as usize];
            self.by_id.insert(entry.id, position);
            self.high_water = self.high_water.max(entry.end());
        }
    }

    pub fn header(&self) -> IndexHeader {
        self.header
    }

    pub fn len(&self) -> u32 {
        self.header.record_count
    }

    pub fn is_empty(&self) -> bool {
        self.header.record_count == 0
    }

    pub fn is_full(&self) -> bool {
        self.header.record_count == self.header.index_count
    }

    pub fn capacity(&self) -> u32 {
        self.header.index_count
    }

    /// Largest end offset among live entries.
    pub fn high_water(&self) -> u64 {
        self.high_water
    }

    pub fn entry(&self, position: u32) -> Option<IndexEntry> {
        self.entries.get(position as usize).copied()
    }

    pub fn lookup(&self, id: u32) -> Option<(u32, IndexEntry)> {
        let position = *self.by_id.get(&id)?;
        Some((position, self.entries[position as usize]))
    }

    pub fn oldest(&self) -> Option<IndexEntry> {
        if self.is_empty() {
            return None;
        }
        self.entry(self.header.oldest_entry)
    }

    pub fn newest(&self) -> Option<IndexEntry> {
        if self.is_empty() {
            return None;
        }
        self.entry(self.header.newest_entry)
    }

    /// Live positions in logical (oldest to newest) order.
    pub fn positions(&self) -> Positions {
        Positions {
            next: self.header.oldest_entry,
            remaining: self.header.record_count,
            capacity: self.header.index_count,
        }
    }

    pub fn state(&self) -> DirectoryState {
        if self.is_empty() {
            return DirectoryState::Empty;
        }
        if self.is_full() {
            return DirectoryState::Full;
        }
        match (self.oldest(), self.newest()) {
            (Some(oldest), Some(newest)) if oldest.offset > newest.offset => {
                DirectoryState::Wrapped
            }
            _ => DirectoryState::Filling,
        }
    }

    /// Drops the oldest live entry from memory and returns its position.
    pub fn evict_oldest(&mut self) -> Option<u32> {
        if self.is_empty() {
            return None;
        }
        let position = self.header.oldest_entry;
        let entry = self.entries[position as usize];
        if self.by_id.get(&entry.id) == Some(&position) {
            self.by_id.remove(&entry.id);
        }
        self.entries[position as usize] = IndexEntry::UNUSED;
        self.header.record_count -= 1;
        if self.header.record_count == 0 {
            self.header.oldest_entry = 0;
            self.header.newest_entry = 0;
        } else {
            self.header.oldest_entry = (position + 1) % self.header.index_count;
        }
        if entry.end() >= self.high_water {
            self.high_water = self
                .positions()
                .filter_map(|pos| self.entry(pos))
                .map(|entry| entry.end())
                .max()
                .unwrap_or(0);
        }
        Some(position)
    }

    /// Makes `entry` the newest record at `position`, which must follow the current newest.
    pub fn publish(&mut self, position: u32, entry: IndexEntry) {
        if self.is_empty() {
            self.header.oldest_entry = position;
        }
        debug_assert!(
            self.is_empty()
                || position == (self.header.newest_entry + 1) % self.header.index_count
        );
        self.entries[position as usize] = entry;
        self.header.newest_entry = position;
        self.header.record_count += 1;
        self.by_id.insert(entry.id, position);
        self.high_water = self.high_water.max(entry.end());
    }

    pub fn persist_header(&self, io: &mut BlockFile) -> Result<(), Error> {
        io.write_at(INDEX_HEADER_OFFSET, &self.header.encode())
    }

    pub fn persist_entry(
        &self,
        io: &mut BlockFile,
        layout: &Layout,
        position: u32,
    ) -> Result<(), Error> {
        let entry = self.entries[position as usize];
        io.write_at(layout.index_entry_offset(position), &entry.encode())
    }

    pub fn persist_all(&self, io: &mut BlockFile, layout: &Layout) -> Result<(), Error> {
        let mut raw = Vec::with_capacity(self.entries.len() * INDEX_ENTRY_LEN as usize);
        for entry in &self.entries {
            raw.extend_from_slice(&entry.encode());
        }
        io.write_at(layout.index_entry_offset(0), &raw)?;
        self.persist_header(io)
    }
}

#[derive(Clone, Debug)]
pub struct Positions {
    next: u32,
    remaining: u32,
    capacity: u32,
}

impl Iterator for Positions {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.remaining == 0 || self.capacity == 0 {
            return None;
        }
        let position = self.next;
        self.next = (self.next + 1) % self.capacity;
        self.remaining -= 1;
        Some(position)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining as usize, Some(self.remaining as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::{DirectoryState, IndexDirectory, IndexEntry, IndexHeader};
    use crate::core::error::ErrorKind;

    fn entry(offset: u32, length: u32, id: u32) -> IndexEntry {
        IndexEntry { offset, length, id }
    }

    #[test]
    fn header_round_trip() {
        let header = IndexHeader {
            record_count: 2,
            index_count: 5,
            oldest_entry: 4,
            newest_entry: 0,
        };
        let decoded = IndexHeader::decode(&header.encode()).expect("decode");
        assert_eq!(decoded, header);
        decoded.validate().expect("valid");
    }

    #[test]
    fn header_rejects_inconsistent_cursors() {
        let cases = [
            IndexHeader {
                record_count: 0,
                index_count: 0,
                oldest_entry: 0,
                newest_entry: 0,
            },
            IndexHeader {
                record_count: 4,
                index_count: 3,
                oldest_entry: 0,
                newest_entry: 2,
            },
            IndexHeader {
                record_count: 1,
                index_count: 3,
                oldest_entry: 3,
                newest_entry: 3,
            },
            IndexHeader {
                record_count: 2,
                index_count: 3,
                oldest_entry: 0,
                newest_entry: 2,
            },
        ];
        for header in cases {
            let err = header.validate().expect_err("invalid header");
            assert_eq!(err.kind(), ErrorKind::Corrupt);
        }
    }

    #[test]
    fn positions_wrap_in_logical_order() {
        let mut directory = IndexDirectory::new(4);
        for (i, id) in [10u32, 11, 12, 13].iter().enumerate() {
            directory.publish(i as u32, entry(100 + i as u32 * 10, 10, *id));
        }
        assert_eq!(directory.state(), DirectoryState::Full);
        assert_eq!(directory.evict_oldest(), Some(0));
        assert_eq!(directory.evict_oldest(), Some(1));
        directory.publish(0, entry(100, 10, 14));

        let order: Vec<u32> = directory.positions().collect();
        assert_eq!(order, vec![2, 3, 0]);
        assert_eq!(directory.oldest().map(|e| e.id), Some(12));
        assert_eq!(directory.newest().map(|e| e.id), Some(14));
        assert_eq!(directory.state(), DirectoryState::Wrapped);
        assert!(directory.lookup(10).is_none());
        assert_eq!(directory.lookup(14).map(|(pos, _)| pos), Some(0));
    }

    #[test]
    fn evicting_everything_resets_cursors() {
        let mut directory = IndexDirectory::new(2);
        directory.publish(0, entry(100, 10, 1));
        directory.evict_oldest();
        assert_eq!(directory.state(), DirectoryState::Empty);
        assert_eq!(directory.header(), IndexHeader::empty(2));
        assert_eq!(directory.high_water(), 0);
    }

    #[test]
    fn rebuild_places_records_from_position_zero() {
        let records = [entry(100, 10, 5), entry(110, 10, 6), entry(120, 10, 7)];
        let directory = IndexDirectory::rebuild(2, &records);
        assert_eq!(directory.len(), 2);
        assert_eq!(directory.header().newest_entry, 1);
        assert_eq!(directory.high_water(), 120);
        directory.header().validate().expect("valid");
    }

    #[test]
    fn overlap_ignores_unused_entries() {
        assert!(entry(100, 10, 1).overlaps(105, 200));
        assert!(!entry(100, 10, 1).overlaps(110, 200));
        assert!(!IndexEntry::UNUSED.overlaps(0, 200));
    }
}
