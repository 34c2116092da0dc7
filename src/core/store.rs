//! Purpose: The log-file storage engine: create/open/recover, write, read, rotate, dump.
//! Exports: `LogStore`, `StoreOptions`, `StoreInfo`, `WriteOutcome`, `RecoveryReport`.
//! Role: Applies `plan` decisions to disk through `BlockFile`; owns index and string table.
//! Invariants: One mutex guards all state; every public call holds it start to finish.
//! Invariants: Record bytes and index entry are written before the index header is published.
//! Invariants: Rotation happens entirely under the lock and leaves the archive on disk.
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use time::OffsetDateTime;

use crate::core::error::{Error, ErrorKind};
use crate::core::format::{Geometry, Layout, SIGNATURE, SIGNATURE_LEN, STRING_HEADER_LEN};
use crate::core::index::{IndexDirectory, IndexEntry, IndexHeader};
use crate::core::io::BlockFile;
use crate::core::plan::{self, AppendPlan, FieldPlan, Placement, StripPlan};
use crate::core::record::{Message, StoredText, StrippedMessage, TextField};
use crate::core::recover;
use crate::core::rotate;
use crate::core::strings::{StringTable, StringTableHeader};

/// Construction parameters for a [`LogStore`].
#[derive(Clone, Debug)]
pub struct StoreOptions {
    path: PathBuf,
    geometry: Option<Geometry>,
    reuse: bool,
    clear_at_startup: bool,
}

impl StoreOptions {
    /// Options with capacities derived from `max_size`.
    pub fn new(path: impl Into<PathBuf>, max_size: u64) -> Self {
        Self::with_geometry(path, Geometry::derive(max_size))
    }

    pub fn with_geometry(path: impl Into<PathBuf>, geometry: Geometry) -> Self {
        Self {
            path: path.into(),
            geometry: Some(geometry),
            reuse: false,
            clear_at_startup: false,
        }
    }

    /// Options for a file that must already exist; its persisted geometry is used.
    pub fn existing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            geometry: None,
            reuse: false,
            clear_at_startup: false,
        }
    }

    /// Evict the oldest records instead of rotating when space runs out.
    pub fn with_reuse(mut self, reuse: bool) -> Self {
        self.reuse = reuse;
        self
    }

    pub fn with_clear_at_startup(mut self, clear: bool) -> Self {
        self.clear_at_startup = clear;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn geometry(&self) -> Option<Geometry> {
        self.geometry
    }

    pub fn reuse(&self) -> bool {
        self.reuse
    }

    pub fn clear_at_startup(&self) -> bool {
        self.clear_at_startup
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct WriteOutcome {
    pub position: u32,
    pub offset: u64,
    pub length: u32,
    pub evicted: u32,
    pub archived: Option<PathBuf>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct StoreInfo {
    pub path: PathBuf,
    pub file_size: u64,
    pub state: &'static str,
    pub record_count: u32,
    pub index_count: u32,
    pub oldest_entry: u32,
    pub newest_entry: u32,
    pub oldest_id: Option<u32>,
    pub newest_id: Option<u32>,
    pub string_table_size: u64,
    pub string_entries: u32,
    pub string_capacity: u32,
    pub string_bytes_used: u64,
    pub string_bytes_capacity: u64,
    pub string_table_degraded: bool,
    pub message_offset: u64,
    pub message_area_len: u64,
    pub reuse: bool,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct RecoveryReport {
    pub records_recovered: u32,
    pub records_dropped: u32,
    pub fragments_skipped: u32,
    pub strings_recovered: u32,
    pub strings_dropped: u32,
}

struct StoreState {
    options: StoreOptions,
    io: BlockFile,
    layout: Layout,
    index: IndexDirectory,
    strings: StringTable,
}

pub struct LogStore {
    path: PathBuf,
    inner: Mutex<StoreState>,
}

impl LogStore {
    /// Creates a fresh file, replacing anything at the path.
    pub fn create(options: StoreOptions) -> Result<Self, Error> {
        let state = StoreState::create(options)?;
        Ok(Self::wrap(state))
    }

    /// Opens an existing file, or creates one when the path does not exist.
    pub fn open(options: StoreOptions) -> Result<Self, Error> {
        if !options.path.exists() {
            if options.geometry.is_none() {
                return Err(Error::new(ErrorKind::NotFound)
                    .with_message("log file not found")
                    .with_path(&options.path)
                    .with_hint("Create it first, or pass a size so it can be created."));
            }
            return Self::create(options);
        }
        let mut io = BlockFile::open(&options.path)?;
        check_signature(&mut io)?;
        if options.clear_at_startup {
            let geometry = match options.geometry {
                Some(geometry) => geometry,
                None => match read_layout(&mut io) {
                    Ok((layout, _, _)) => layout.geometry(),
                    Err(err) if err.kind() == ErrorKind::Corrupt => Geometry::derive(io.len()),
                    Err(err) => return Err(err),
                },
            };
            io.close()?;
            tracing::info!(path = %options.path.display(), "clearing log at startup");
            return Self::create(StoreOptions {
                geometry: Some(geometry),
                ..options
            });
        }
        let state = StoreState::load(options, io)?;
        Ok(Self::wrap(state))
    }

    /// Rebuilds the index and string table from whatever records survive in the file.
    pub fn recover(options: StoreOptions) -> Result<(Self, RecoveryReport), Error> {
        let mut io = BlockFile::open(&options.path)?;
        check_signature(&mut io)?;
        let (state, report) = StoreState::recover(options, io)?;
        Ok((Self::wrap(state), report))
    }

    fn wrap(state: StoreState) -> Self {
        Self {
            path: state.options.path.clone(),
            inner: Mutex::new(state),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>, Error> {
        self.inner.lock().map_err(|_| {
            Error::new(ErrorKind::Internal)
                .with_message("log store lock poisoned")
                .with_path(&self.path)
        })
    }

    fn lock_open(&self) -> Result<MutexGuard<'_, StoreState>, Error> {
        let state = self.lock()?;
        if !state.io.is_open() {
            return Err(Error::new(ErrorKind::Io)
                .with_message("log store is closed")
                .with_path(&self.path));
        }
        Ok(state)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_msg(&self, message: &Message) -> Result<WriteOutcome, Error> {
        let mut state = self.lock_open()?;
        state.write(message)
    }

    pub fn message_count(&self) -> Result<u32, Error> {
        Ok(self.lock_open()?.index.len())
    }

    pub fn get_message(&self, id: u32) -> Result<Option<Message>, Error> {
        let mut state = self.lock_open()?;
        let Some((position, entry)) = state.index.lookup(id) else {
            return Ok(None);
        };
        let message = state.read_entry(position, entry)?;
        Ok(Some(message))
    }

    /// All readable messages, oldest first. Undecodable records are skipped.
    pub fn get_all_messages(&self) -> Result<Vec<Message>, Error> {
        let mut state = self.lock_open()?;
        let positions: Vec<u32> = state.index.positions().collect();
        let mut messages = Vec::with_capacity(positions.len());
        for position in positions {
            let Some(entry) = state.index.entry(position) else {
                continue;
            };
            match state.read_entry(position, entry) {
                Ok(message) => messages.push(message),
                Err(err) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        position,
                        id = entry.id,
                        error = %err,
                        "skipping unreadable log record"
                    );
                }
            }
        }
        Ok(messages)
    }

    pub fn get_oldest_message_id(&self) -> Result<Option<u32>, Error> {
        Ok(self.lock_open()?.index.oldest().map(|entry| entry.id))
    }

    pub fn get_newest_message_id(&self) -> Result<Option<u32>, Error> {
        Ok(self.lock_open()?.index.newest().map(|entry| entry.id))
    }

    pub fn string_table_entry_count(&self) -> Result<u32, Error> {
        Ok(self.lock_open()?.strings.entry_count())
    }

    pub fn info(&self) -> Result<StoreInfo, Error> {
        Ok(self.lock_open()?.info())
    }

    /// Human-readable dump of headers, string table, index, and messages.
    pub fn dump_log(&self) -> Result<String, Error> {
        let mut state = self.lock_open()?;
        state.dump()
    }

    /// Forces a rotation; returns the archive path.
    pub fn create_new_file(&self) -> Result<PathBuf, Error> {
        let mut state = self.lock_open()?;
        state.rotate()
    }

    /// Syncs and releases the file. Further operations fail with `Io`.
    pub fn close(&self) -> Result<(), Error> {
        let mut state = self.lock()?;
        if state.io.is_open() {
            state.io.sync()?;
        }
        state.io.close()?;
        tracing::debug!(path = %self.path.display(), "closed log store");
        Ok(())
    }
}

fn check_signature(io: &mut BlockFile) -> Result<(), Error> {
    if io.len() < SIGNATURE_LEN {
        return Err(Error::new(ErrorKind::Format)
            .with_message("file is too small to be a message log")
            .with_path(io.path()));
    }
    let signature = io.read_at(0, SIGNATURE_LEN as usize)?;
    if signature != SIGNATURE {
        return Err(Error::new(ErrorKind::Format)
            .with_message("signature mismatch")
            .with_path(io.path())
            .with_hint("The file is not a message log, or its header was overwritten."));
    }
    Ok(())
}

// Reads the persisted index header and string-table header and derives the layout.
fn read_layout(io: &mut BlockFile) -> Result<(Layout, IndexHeader, StringTableHeader), Error> {
    let header = IndexDirectory::read_header(io)?;
    if header.index_count == 0 {
        return Err(Error::corrupt("index capacity is zero").with_path(io.path()));
    }
    let probe = Layout::new(header.index_count, 0, 0, io.len());
    if probe.string_table_offset + STRING_HEADER_LEN > io.len() {
        return Err(Error::corrupt("index directory exceeds file size").with_path(io.path()));
    }
    let strings = StringTableHeader::read(io, probe.string_table_offset)?;
    let layout = Layout::new(
        header.index_count,
        strings.total_size,
        strings.total_indexes,
        io.len(),
    );
    if layout.message_offset >= io.len() {
        return Err(Error::corrupt("string table exceeds file size").with_path(io.path()));
    }
    Ok((layout, header, strings))
}

impl StoreState {
    fn create(options: StoreOptions) -> Result<Self, Error> {
        let Some(geometry) = options.geometry else {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("creating a log file requires a size")
                .with_path(&options.path));
        };
        geometry.validate()?;
        let layout = geometry.layout();
        let mut io = BlockFile::create(&options.path, geometry.max_size)?;
        io.write_at(0, &SIGNATURE)?;
        let index = IndexDirectory::write_empty(&mut io, &layout)?;
        let strings = StringTable::write_empty(&mut io, &layout)?;
        io.flush()?;
        tracing::info!(
            path = %options.path.display(),
            max_size = geometry.max_size,
            max_entries = geometry.max_entries,
            string_table_size = geometry.string_table_size,
            max_string_entries = geometry.max_string_entries,
            "created log file"
        );
        Ok(Self {
            options,
            io,
            layout,
            index,
            strings,
        })
    }

    fn load(options: StoreOptions, mut io: BlockFile) -> Result<Self, Error> {
        if IndexDirectory::read_header(&mut io)?.index_count == 0 {
            return Ok(Self::degraded(options, io));
        }
        let (layout, header, string_header) = read_layout(&mut io)?;
        let index = IndexDirectory::load(&mut io, &layout, header)
            .map_err(|err| err.with_path(&options.path))?;
        let strings = StringTable::load(&mut io, &layout, string_header)?;
        if let Some(configured) = options.geometry {
            if configured != layout.geometry() {
                tracing::warn!(
                    path = %options.path.display(),
                    configured_entries = configured.max_entries,
                    file_entries = layout.index_count,
                    "existing file geometry differs from configured geometry; keeping the file's"
                );
            }
        }
        tracing::info!(
            path = %options.path.display(),
            records = index.len(),
            strings = strings.entry_count(),
            "opened log file"
        );
        Ok(Self {
            options,
            io,
            layout,
            index,
            strings,
        })
    }

    // Without an index capacity the string table cannot be located, so nothing is
    // interned and nothing is readable; the next write rotates to a fresh file.
    fn degraded(options: StoreOptions, io: BlockFile) -> Self {
        tracing::warn!(
            path = %options.path.display(),
            "index header reports zero capacity; string table disabled until rotation"
        );
        let layout = Layout::new(0, 0, 0, io.len());
        Self {
            strings: StringTable::degraded(&layout),
            index: IndexDirectory::new(0),
            layout,
            options,
            io,
        }
    }

    fn recover(options: StoreOptions, mut io: BlockFile) -> Result<(Self, RecoveryReport), Error> {
        let (layout, _, string_header) = read_layout(&mut io)?;
        let (strings, salvage) = StringTable::salvage(&mut io, &layout, string_header)?;

        let area = io.read_at(layout.message_offset, layout.message_area_len() as usize)?;
        let scan = recover::scan_records(&area, layout.message_offset, &strings);
        let scanned = scan.records.len();
        let (kept, dropped) = recover::select_records(scan.records, layout.index_count);

        for (position, record) in kept.iter().enumerate() {
            if record.index_position != position as u32 {
                // Stored position lives right after the eye-catcher and id.
                io.write_at(record.offset + 8, &(position as u32).to_le_bytes())?;
            }
        }
        let entries: Vec<IndexEntry> = kept.iter().map(|record| record.entry()).collect();
        let index = IndexDirectory::rebuild(layout.index_count, &entries);
        index.persist_all(&mut io, &layout)?;
        io.flush()?;

        let report = RecoveryReport {
            records_recovered: kept.len() as u32,
            records_dropped: dropped,
            fragments_skipped: scan.fragments_skipped,
            strings_recovered: salvage.recovered,
            strings_dropped: salvage.dropped,
        };
        tracing::info!(
            path = %options.path.display(),
            scanned,
            recovered = report.records_recovered,
            dropped = report.records_dropped,
            skipped = report.fragments_skipped,
            strings = report.strings_recovered,
            "recovered log file"
        );
        let state = Self {
            options,
            io,
            layout,
            index,
            strings,
        };
        Ok((state, report))
    }

    fn write(&mut self, message: &Message) -> Result<WriteOutcome, Error> {
        let mut archived = None;
        loop {
            let strip = plan::plan_strip(&self.strings, message);
            let placement = plan::plan_append(
                &self.index,
                &self.layout,
                strip.record_len as u64,
                self.options.reuse,
            )
            .map_err(|err| err.with_id(message.id).with_path(&self.options.path))?;
            match placement {
                Placement::Append(plan) => {
                    let mut outcome = self.apply(message, &strip, plan)?;
                    outcome.archived = archived;
                    return Ok(outcome);
                }
                Placement::Rotate if archived.is_none() => {
                    archived = Some(self.rotate()?);
                }
                Placement::Rotate => {
                    return Err(Error::new(ErrorKind::Capacity)
                        .with_message("record does not fit even in a fresh file")
                        .with_id(message.id)
                        .with_path(&self.options.path));
                }
            }
        }
    }

    fn apply(
        &mut self,
        message: &Message,
        strip: &StripPlan,
        plan: AppendPlan,
    ) -> Result<WriteOutcome, Error> {
        for expected in &plan.evictions {
            let evicted = self.index.evict_oldest();
            debug_assert_eq!(evicted, Some(*expected));
            self.index
                .persist_entry(&mut self.io, &self.layout, *expected)?;
        }
        if !plan.evictions.is_empty() {
            self.index.persist_header(&mut self.io)?;
            tracing::debug!(
                count = plan.evictions.len(),
                "evicted oldest records to make room"
            );
        }

        let stripped = self.strip(message, strip, plan.position)?;
        let bytes = stripped.encode();
        if bytes.len() != strip.record_len {
            return Err(Error::new(ErrorKind::Internal)
                .with_message("stripped record length differs from plan")
                .with_id(message.id));
        }
        self.io.write_at(plan.offset, &bytes)?;

        let entry = IndexEntry {
            offset: plan.offset as u32,
            length: bytes.len() as u32,
            id: message.id,
        };
        self.index.publish(plan.position, entry);
        self.index
            .persist_entry(&mut self.io, &self.layout, plan.position)?;
        self.index.persist_header(&mut self.io)?;
        self.io.flush()?;
        debug_assert_eq!(self.index.header(), plan.next_header);

        tracing::debug!(
            id = message.id,
            position = plan.position,
            offset = plan.offset,
            length = entry.length,
            "wrote log record"
        );
        Ok(WriteOutcome {
            position: plan.position,
            offset: plan.offset,
            length: entry.length,
            evicted: plan.evictions.len() as u32,
            archived: None,
        })
    }

    fn strip(
        &mut self,
        message: &Message,
        strip: &StripPlan,
        position: u32,
    ) -> Result<StrippedMessage, Error> {
        let mut fields: [StoredText; 4] = Default::default();
        for ((slot, field), planned) in fields.iter_mut().zip(TextField::ALL).zip(strip.fields) {
            let value = message.text(field);
            *slot = match planned {
                FieldPlan::Existing(handle) => StoredText::Handle(handle),
                FieldPlan::Intern => match self.strings.intern(&mut self.io, value)? {
                    Some(handle) => StoredText::Handle(handle),
                    None => StoredText::Inline(value.to_owned()),
                },
                FieldPlan::Inline => StoredText::Inline(value.to_owned()),
            };
        }
        Ok(StrippedMessage::new(message, position, fields))
    }

    fn read_entry(&mut self, position: u32, entry: IndexEntry) -> Result<Message, Error> {
        if !entry.is_used() || (entry.offset as u64) < self.layout.message_offset {
            return Err(Error::corrupt("index entry has no valid record offset")
                .with_id(entry.id)
                .with_offset(entry.offset as u64)
                .with_path(&self.options.path));
        }
        let bytes = self.io.read_at(entry.offset as u64, entry.length as usize)?;
        let context = |err: Error| {
            err.with_id(entry.id)
                .with_offset(entry.offset as u64)
                .with_path(&self.options.path)
        };
        let (stripped, consumed) = StrippedMessage::decode(&bytes).map_err(context)?;
        if consumed != bytes.len() || stripped.id != entry.id {
            return Err(context(Error::corrupt("record does not match its index entry")));
        }
        if stripped.index_position != position {
            return Err(context(Error::corrupt("record stored at a different index position")));
        }
        stripped.restore(&self.strings).map_err(context)
    }

    // Fresh files keep the current geometry unless it cannot describe a usable file.
    fn rotation_geometry(&self) -> Geometry {
        let current = self.layout.geometry();
        if current.validate().is_ok() {
            return current;
        }
        match self.options.geometry {
            Some(configured) if configured.validate().is_ok() => configured,
            _ => Geometry::derive(self.layout.file_size),
        }
    }

    fn rotate(&mut self) -> Result<PathBuf, Error> {
        let geometry = self.rotation_geometry();
        let path = self.options.path.clone();
        self.io.close()?;
        let archived = rotate::archive(&path, OffsetDateTime::now_utc())?;
        let options = StoreOptions {
            geometry: Some(geometry),
            clear_at_startup: false,
            ..self.options.clone()
        };
        let fresh = StoreState::create(options)?;
        *self = fresh;
        tracing::info!(
            path = %path.display(),
            archive = %archived.display(),
            "rotated log file"
        );
        Ok(archived)
    }

    fn info(&self) -> StoreInfo {
        let header = self.index.header();
        StoreInfo {
            path: self.options.path.clone(),
            file_size: self.layout.file_size,
            state: self.index.state().as_str(),
            record_count: header.record_count,
            index_count: header.index_count,
            oldest_entry: header.oldest_entry,
            newest_entry: header.newest_entry,
            oldest_id: self.index.oldest().map(|entry| entry.id),
            newest_id: self.index.newest().map(|entry| entry.id),
            string_table_size: self.layout.string_table_size,
            string_entries: self.strings.entry_count(),
            string_capacity: self.strings.capacity(),
            string_bytes_used: self.strings.bytes_used(),
            string_bytes_capacity: self.strings.bytes_capacity(),
            string_table_degraded: self.strings.is_degraded(),
            message_offset: self.layout.message_offset,
            message_area_len: self.layout.message_area_len(),
            reuse: self.options.reuse,
        }
    }

    fn dump(&mut self) -> Result<String, Error> {
        let info = self.info();
        let mut out = String::new();
        let _ = writeln!(out, "log: {}", info.path.display());
        let _ = writeln!(
            out,
            "file_size={} message_offset={} message_area={}",
            info.file_size, info.message_offset, info.message_area_len
        );
        let _ = writeln!(
            out,
            "index: state={} record_count={} index_count={} oldest_entry={} newest_entry={}",
            info.state, info.record_count, info.index_count, info.oldest_entry, info.newest_entry
        );
        let string_header = self.strings.header();
        let _ = writeln!(
            out,
            "strings: total_size={} total_indexes={} index_in_use={} bytes={}/{}{}",
            string_header.total_size,
            string_header.total_indexes,
            string_header.index_in_use,
            info.string_bytes_used,
            info.string_bytes_capacity,
            if info.string_table_degraded { " degraded" } else { "" }
        );
        for (handle, value) in self.strings.iter() {
            let _ = writeln!(out, "  [{handle}] {value:?}");
        }

        let positions: Vec<u32> = self.index.positions().collect();
        let _ = writeln!(out, "entries:");
        for position in &positions {
            if let Some(entry) = self.index.entry(*position) {
                let _ = writeln!(
                    out,
                    "  pos={position} offset={} length={} id={}",
                    entry.offset, entry.length, entry.id
                );
            }
        }

        let _ = writeln!(out, "messages:");
        for position in positions {
            let Some(entry) = self.index.entry(position) else {
                continue;
            };
            match self.read_entry(position, entry) {
                Ok(message) => {
                    let time = message
                        .timestamp
                        .to_rfc3339()
                        .unwrap_or_else(|| message.timestamp.secs.to_string());
                    let _ = writeln!(
                        out,
                        "  id={} time={} channel={} thread={} app={:?} machine={:?} source={}:{} msg={:?}",
                        message.id,
                        time,
                        message.channel,
                        message.thread_id,
                        message.app_name,
                        message.machine_name,
                        message.file,
                        message.line,
                        message.msg
                    );
                }
                Err(err) => {
                    let _ = writeln!(out, "  id={} <unreadable: {err}>", entry.id);
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::{LogStore, StoreOptions};
    use crate::core::error::ErrorKind;
    use crate::core::format::Geometry;
    use crate::core::record::{Message, Timestamp};
    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom, Write};
    use std::path::Path;

    fn message(id: u32) -> Message {
        Message::new(id, format!("request {id} handled"))
            .with_source("src/server.rs", 200 + id)
            .with_app_name("gateway")
            .with_machine_name("edge-01")
            .with_channel(2)
            .with_thread_id(id * 3)
            .with_timestamp(Timestamp::new(1_760_000_000 + id as i64, id * 1000))
    }

    fn options(path: &Path, max_entries: u32) -> StoreOptions {
        StoreOptions::with_geometry(path, Geometry::new(16 * 1024, max_entries, 1024, 32))
    }

    fn archives(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .expect("read dir")
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.starts_with("app.mlog."))
            .collect();
        names.sort();
        names
    }

    #[test]
    fn write_and_read_back_every_field() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LogStore::create(options(&dir.path().join("app.mlog"), 8)).expect("create");
        let original = message(10);
        store.write_msg(&original).expect("write");
        let read = store.get_message(10).expect("get").expect("present");
        assert_eq!(read, original);
        assert_eq!(store.get_message(99).expect("get"), None);
    }

    #[test]
    fn three_entries_then_rotation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("app.mlog");
        let store = LogStore::create(options(&path, 3)).expect("create");
        for id in [10, 11, 12] {
            let outcome = store.write_msg(&message(id)).expect("write");
            assert_eq!(outcome.archived, None);
        }
        assert_eq!(store.get_oldest_message_id().expect("oldest"), Some(10));
        assert_eq!(store.get_newest_message_id().expect("newest"), Some(12));
        assert_eq!(store.message_count().expect("count"), 3);

        let outcome = store.write_msg(&message(13)).expect("write");
        let archive = outcome.archived.expect("rotated");
        assert!(archive.exists());
        assert_eq!(archives(dir.path()).len(), 1);
        assert_eq!(store.message_count().expect("count"), 1);
        assert_eq!(store.get_oldest_message_id().expect("oldest"), Some(13));
        assert_eq!(store.get_newest_message_id().expect("newest"), Some(13));
        assert_eq!(store.get_message(10).expect("get"), None);

        store.close().expect("close");
        let old = LogStore::open(StoreOptions::existing(&archive)).expect("open archive");
        let ids: Vec<u32> = old
            .get_all_messages()
            .expect("all")
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec![10, 11, 12]);
    }

    #[test]
    fn repeated_values_share_one_string_entry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LogStore::create(options(&dir.path().join("app.mlog"), 16)).expect("create");
        for id in 0..10 {
            let msg = Message::new(id, "tick")
                .with_source("clock.rs", 1)
                .with_app_name("timer")
                .with_machine_name("node");
            store.write_msg(&msg).expect("write");
        }
        // file, app, machine and msg each repeat one value.
        assert_eq!(store.string_table_entry_count().expect("count"), 4);
        let all = store.get_all_messages().expect("all");
        assert_eq!(all.len(), 10);
        assert!(all.iter().all(|m| m.app_name == "timer" && m.msg == "tick"));
    }

    #[test]
    fn oversized_message_is_capacity_error_and_header_survives() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LogStore::create(options(&dir.path().join("app.mlog"), 8)).expect("create");
        store.write_msg(&message(1)).expect("write");
        let before = store.info().expect("info");

        let huge = Message::new(2, vec![b'x'; 20 * 1024]);
        let err = store.write_msg(&huge).expect_err("too large");
        assert_eq!(err.kind(), ErrorKind::Capacity);

        let after = store.info().expect("info");
        assert_eq!(after.record_count, before.record_count);
        assert_eq!(after.newest_entry, before.newest_entry);
        assert_eq!(archives(dir.path()).len(), 0);
        assert!(store.get_message(1).expect("get").is_some());
    }

    #[test]
    fn reopen_restores_index_and_strings() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("app.mlog");
        {
            let store = LogStore::create(options(&path, 8)).expect("create");
            for id in 1..=4 {
                store.write_msg(&message(id)).expect("write");
            }
            store.close().expect("close");
        }
        let store = LogStore::open(StoreOptions::existing(&path)).expect("open");
        assert_eq!(store.message_count().expect("count"), 4);
        assert_eq!(store.get_message(3).expect("get"), Some(message(3)));
        let entries_before = store.string_table_entry_count().expect("count");
        store.write_msg(&message(5)).expect("write");
        // gateway, edge-01 and src/server.rs were already interned.
        assert_eq!(
            store.string_table_entry_count().expect("count"),
            entries_before + 1
        );
    }

    #[test]
    fn clear_at_startup_discards_contents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("app.mlog");
        {
            let store = LogStore::create(options(&path, 8)).expect("create");
            store.write_msg(&message(1)).expect("write");
        }
        let store =
            LogStore::open(options(&path, 8).with_clear_at_startup(true)).expect("open");
        assert_eq!(store.message_count().expect("count"), 0);
        assert_eq!(store.string_table_entry_count().expect("count"), 0);
    }

    #[test]
    fn bad_signature_is_format_error_and_file_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("app.mlog");
        std::fs::write(&path, b"NOTALOG!plus some trailing bytes").expect("write");
        let before = std::fs::read(&path).expect("read");

        let err = match LogStore::open(options(&path, 8)) {
            Ok(_) => panic!("expected format error"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), ErrorKind::Format);
        assert_eq!(std::fs::read(&path).expect("read"), before);

        let err = match LogStore::open(options(&path, 8).with_clear_at_startup(true)) {
            Ok(_) => panic!("expected format error"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    #[test]
    fn existing_options_require_the_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = match LogStore::open(StoreOptions::existing(dir.path().join("none.mlog"))) {
            Ok(_) => panic!("expected not found"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn closed_store_rejects_operations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LogStore::create(options(&dir.path().join("app.mlog"), 8)).expect("create");
        store.close().expect("close");
        let err = store.write_msg(&message(1)).expect_err("closed");
        assert_eq!(err.kind(), ErrorKind::Io);
        let err = store.get_all_messages().expect_err("closed");
        assert_eq!(err.kind(), ErrorKind::Io);
        store.close().expect("close is idempotent");
    }

    #[test]
    fn forced_rotation_archives_and_resets() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("app.mlog");
        let store = LogStore::create(options(&path, 8)).expect("create");
        store.write_msg(&message(1)).expect("write");
        let archive = store.create_new_file().expect("rotate");
        assert!(archive.exists());
        assert!(path.exists());
        let info = store.info().expect("info");
        assert_eq!(info.state, "empty");
        assert_eq!(info.record_count, 0);
        assert_eq!(info.string_entries, 0);
        assert_eq!(info.index_count, 8);
    }

    #[test]
    fn reuse_wraps_and_keeps_logical_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("app.mlog");
        let store = LogStore::create(options(&path, 4).with_reuse(true)).expect("create");
        for id in 1..=10 {
            let outcome = store.write_msg(&message(id)).expect("write");
            assert_eq!(outcome.archived, None);
        }
        let info = store.info().expect("info");
        assert_eq!(info.record_count, 4);
        assert!(info.oldest_entry > info.newest_entry);
        let ids: Vec<u32> = store
            .get_all_messages()
            .expect("all")
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec![7, 8, 9, 10]);
        assert_eq!(archives(dir.path()).len(), 0);
    }

    #[test]
    fn reuse_wraps_bytes_when_area_is_exhausted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("app.mlog");
        let geometry = Geometry::new(4 * 1024, 64, 512, 16);
        let store =
            LogStore::create(StoreOptions::with_geometry(&path, geometry).with_reuse(true))
                .expect("create");
        let mut last = 0;
        for id in 1..=200 {
            store.write_msg(&message(id)).expect("write");
            last = id;
        }
        let ids: Vec<u32> = store
            .get_all_messages()
            .expect("all")
            .iter()
            .map(|m| m.id)
            .collect();
        assert!(!ids.is_empty());
        assert_eq!(*ids.last().expect("newest"), last);
        assert!(ids.windows(2).all(|pair| pair[1] == pair[0] + 1));
        assert_eq!(store.message_count().expect("count") as usize, ids.len());
    }

    #[test]
    fn corrupt_record_is_skipped_in_enumeration() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("app.mlog");
        let store = LogStore::create(options(&path, 8)).expect("create");
        let mut offsets = Vec::new();
        for id in 1..=3 {
            offsets.push(store.write_msg(&message(id)).expect("write").offset);
        }
        store.close().expect("close");

        let mut file = OpenOptions::new().write(true).open(&path).expect("open");
        file.seek(SeekFrom::Start(offsets[1])).expect("seek");
        file.write_all(&[0u8; 4]).expect("smash eye-catcher");
        drop(file);

        let store = LogStore::open(options(&path, 8)).expect("reopen");
        let ids: Vec<u32> = store
            .get_all_messages()
            .expect("all")
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec![1, 3]);
        let err = store.get_message(2).expect_err("corrupt");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn zeroed_entry_offset_is_corrupt_and_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("app.mlog");
        let store = LogStore::create(options(&path, 8)).expect("create");
        let mut positions = Vec::new();
        for id in 1..=3 {
            positions.push(store.write_msg(&message(id)).expect("write").position);
        }
        store.close().expect("close");

        // Entries start at 24; the offset is the first field of each 12-byte entry.
        let mut file = OpenOptions::new().write(true).open(&path).expect("open");
        file.seek(SeekFrom::Start(24 + 12 * positions[1] as u64))
            .expect("seek");
        file.write_all(&0u32.to_le_bytes()).expect("zero offset");
        drop(file);

        let store = LogStore::open(StoreOptions::existing(&path)).expect("reopen");
        let err = store.get_message(2).expect_err("zero offset");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
        assert_eq!(err.id(), Some(2));
        let ids: Vec<u32> = store
            .get_all_messages()
            .expect("all")
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn zero_capacity_header_opens_degraded_and_rotates_on_write() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("app.mlog");
        {
            let store = LogStore::create(options(&path, 8)).expect("create");
            store.write_msg(&message(1)).expect("write");
            store.close().expect("close");
        }
        let mut file = OpenOptions::new().write(true).open(&path).expect("open");
        file.seek(SeekFrom::Start(12)).expect("seek");
        file.write_all(&0u32.to_le_bytes()).expect("zero index_count");
        drop(file);

        let store = LogStore::open(StoreOptions::existing(&path)).expect("open degraded");
        assert_eq!(store.message_count().expect("count"), 0);
        assert_eq!(store.get_message(1).expect("get"), None);
        let info = store.info().expect("info");
        assert_eq!(info.index_count, 0);
        assert!(info.string_table_degraded);
        assert_eq!(store.string_table_entry_count().expect("count"), 0);

        let outcome = store.write_msg(&message(2)).expect("write rotates");
        let archive = outcome.archived.expect("archived");
        assert!(archive.exists());
        assert_eq!(archives(dir.path()).len(), 1);
        assert_eq!(store.message_count().expect("count"), 1);
        assert_eq!(store.get_message(2).expect("get"), Some(message(2)));
        let info = store.info().expect("info");
        assert!(info.index_count > 0);
        assert!(!info.string_table_degraded);
        assert_eq!(info.file_size, 16 * 1024);
    }

    #[test]
    fn recover_rebuilds_zeroed_index() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("app.mlog");
        {
            let store = LogStore::create(options(&path, 8)).expect("create");
            for id in 1..=5 {
                store.write_msg(&message(id)).expect("write");
            }
            store.close().expect("close");
        }
        let mut file = OpenOptions::new().write(true).open(&path).expect("open");
        file.seek(SeekFrom::Start(8)).expect("seek");
        // Zero record_count, keep index_count, zero cursors and all entries.
        file.write_all(&0u32.to_le_bytes()).expect("write");
        file.seek(SeekFrom::Start(16)).expect("seek");
        file.write_all(&[0u8; 8 + 8 * 12]).expect("write");
        drop(file);

        let store = LogStore::open(options(&path, 8)).expect("open");
        assert_eq!(store.message_count().expect("count"), 0);
        store.close().expect("close");

        let (store, report) = LogStore::recover(options(&path, 8)).expect("recover");
        assert_eq!(report.records_recovered, 5);
        assert_eq!(report.fragments_skipped, 0);
        assert_eq!(report.strings_recovered, 8);
        assert_eq!(store.message_count().expect("count"), 5);
        assert_eq!(store.get_message(4).expect("get"), Some(message(4)));
        store.write_msg(&message(6)).expect("write after recovery");
        assert_eq!(store.get_newest_message_id().expect("newest"), Some(6));
    }

    #[test]
    fn second_store_on_same_file_is_busy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("app.mlog");
        let _store = LogStore::create(options(&path, 8)).expect("create");
        let err = match LogStore::open(options(&path, 8)) {
            Ok(_) => panic!("expected busy"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), ErrorKind::Busy);
    }

    #[test]
    fn dump_lists_headers_strings_and_messages() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LogStore::create(options(&dir.path().join("app.mlog"), 8)).expect("create");
        store.write_msg(&message(1)).expect("write");
        let dump = store.dump_log().expect("dump");
        assert!(dump.contains("record_count=1"));
        assert!(dump.contains("\"gateway\""));
        assert!(dump.contains("id=1 time=2025-"));
        assert!(dump.contains("source=src/server.rs:201"));
    }

    #[test]
    fn concurrent_writers_serialize() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = std::sync::Arc::new(
            LogStore::create(options(&dir.path().join("app.mlog"), 128)).expect("create"),
        );
        let handles: Vec<_> = (0..4u32)
            .map(|worker| {
                let store = std::sync::Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..10u32 {
                        store.write_msg(&message(worker * 100 + i)).expect("write");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        assert_eq!(store.message_count().expect("count"), 40);
        assert_eq!(store.get_all_messages().expect("all").len(), 40);
    }
}
