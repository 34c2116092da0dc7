// Message model plus the stripped on-disk record codec.
use std::time::{SystemTime, UNIX_EPOCH};

use bstr::{BStr, BString, ByteSlice};

use crate::core::error::Error;
use crate::core::format::{read_u32_le, read_u64_le};
use crate::core::strings::TextResolver;

pub const EYE_CATCHER: u32 = 0x0BAC_ADAB;
pub const RECORD_FIXED_LEN: usize = 44;
const FIELD_HEADER_LEN: usize = 4;
const KNOWN_FLAGS: u32 = 0b1111;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Timestamp {
    pub secs: i64,
    pub nanos: u32,
}

impl Timestamp {
    pub fn new(secs: i64, nanos: u32) -> Self {
        Self { secs, nanos }
    }

    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(since) => Self::new(since.as_secs() as i64, since.subsec_nanos()),
            Err(err) => {
                let before = err.duration();
                let mut secs = -(before.as_secs() as i64);
                let mut nanos = before.subsec_nanos();
                if nanos > 0 {
                    secs -= 1;
                    nanos = 1_000_000_000 - nanos;
                }
                Self::new(secs, nanos)
            }
        }
    }

    pub fn to_rfc3339(&self) -> Option<String> {
        use time::format_description::well_known::Rfc3339;
        let nanos = self.secs as i128 * 1_000_000_000 + self.nanos as i128;
        time::OffsetDateTime::from_unix_timestamp_nanos(nanos)
            .ok()?
            .format(&Rfc3339)
            .ok()
    }
}

/// One log message as callers see it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Message {
    pub id: u32,
    pub file: BString,
    pub line: u32,
    pub thread_id: u32,
    pub timestamp: Timestamp,
    pub channel: u32,
    pub app_name: BString,
    pub machine_name: BString,
    pub msg: BString,
}

impl Message {
    pub fn new(id: u32, msg: impl Into<BString>) -> Self {
        Self {
            id,
            file: BString::default(),
            line: 0,
            thread_id: 0,
            timestamp: Timestamp::now(),
            channel: 0,
            app_name: BString::default(),
            machine_name: BString::default(),
            msg: msg.into(),
        }
    }

    pub fn with_source(mut self, file: impl Into<BString>, line: u32) -> Self {
        self.file = file.into();
        self.line = line;
        self
    }

    pub fn with_app_name(mut self, app_name: impl Into<BString>) -> Self {
        self.app_name = app_name.into();
        self
    }

    pub fn with_machine_name(mut self, machine_name: impl Into<BString>) -> Self {
        self.machine_name = machine_name.into();
        self
    }

    pub fn with_channel(mut self, channel: u32) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_thread_id(mut self, thread_id: u32) -> Self {
        self.thread_id = thread_id;
        self
    }

    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn text(&self, field: TextField) -> &BStr {
        match field {
            TextField::File => self.file.as_bstr(),
            TextField::AppName => self.app_name.as_bstr(),
            TextField::MachineName => self.machine_name.as_bstr(),
            TextField::Msg => self.msg.as_bstr(),
        }
    }
}

/// The four text fields eligible for the string table, in record order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TextField {
    File,
    AppName,
    MachineName,
    Msg,
}

impl TextField {
    pub const ALL: [TextField; 4] = [
        TextField::File,
        TextField::AppName,
        TextField::MachineName,
        TextField::Msg,
    ];

    pub fn flag(&self) -> u32 {
        match self {
            TextField::File => 1,
            TextField::AppName => 2,
            TextField::MachineName => 4,
            TextField::Msg => 8,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StoredText {
    Handle(u32),
    Inline(BString),
}

impl StoredText {
    fn encoded_len(&self) -> usize {
        match self {
            StoredText::Handle(_) => FIELD_HEADER_LEN,
            StoredText::Inline(bytes) => FIELD_HEADER_LEN + bytes.len(),
        }
    }
}

/// A message whose text fields are either inline bytes or string-table handles.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StrippedMessage {
    pub id: u32,
    pub index_position: u32,
    pub timestamp: Timestamp,
    pub line: u32,
    pub channel: u32,
    pub thread_id: u32,
    pub fields: [StoredText; 4],
}

impl StrippedMessage {
    pub fn new(message: &Message, index_position: u32, fields: [StoredText; 4]) -> Self {
        Self {
            id: message.id,
            index_position,
            timestamp: message.timestamp,
            line: message.line,
            channel: message.channel,
            thread_id: message.thread_id,
            fields,
        }
    }

    pub fn flags(&self) -> u32 {
        TextField::ALL
            .iter()
            .zip(self.fields.iter())
            .filter(|(_, stored)| matches!(stored, StoredText::Handle(_)))
            .fold(0, |flags, (field, _)| flags | field.flag())
    }

    pub fn encoded_len(&self) -> usize {
        RECORD_FIXED_LEN
            + self
                .fields
                .iter()
                .map(StoredText::encoded_len)
                .sum::<usize>()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&EYE_CATCHER.to_le_bytes());
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&self.index_position.to_le_bytes());
        buf.extend_from_slice(&self.timestamp.secs.to_le_bytes());
        buf.extend_from_slice(&(self.timestamp.nanos as u64).to_le_bytes());
        buf.extend_from_slice(&self.line.to_le_bytes());
        buf.extend_from_slice(&self.channel.to_le_bytes());
        buf.extend_from_slice(&self.thread_id.to_le_bytes());
        buf.extend_from_slice(&self.flags().to_le_bytes());
        for stored in &self.fields {
            match stored {
                StoredText::Handle(handle) => buf.extend_from_slice(&handle.to_le_bytes()),
                StoredText::Inline(bytes) => {
                    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                    buf.extend_from_slice(bytes);
                }
            }
        }
        buf
    }

    /// Decodes one record from the front of `buf`; returns it with its encoded length.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), Error> {
        if buf.len() < RECORD_FIXED_LEN {
            return Err(Error::corrupt("record shorter than fixed header"));
        }
        if read_u32_le(buf, 0) != EYE_CATCHER {
            return Err(Error::corrupt("bad record eye-catcher"));
        }
        let nanos = read_u64_le(buf, 20);
        if nanos >= 1_000_000_000 {
            return Err(Error::corrupt("timestamp nanoseconds out of range"));
        }
        let flags = read_u32_le(buf, 40);
        if flags & !KNOWN_FLAGS != 0 {
            return Err(Error::corrupt("unknown record flags"));
        }

        let mut cursor = RECORD_FIXED_LEN;
        let mut fields: [StoredText; 4] = Default::default();
        for (slot, field) in fields.iter_mut().zip(TextField::ALL) {
            if cursor + FIELD_HEADER_LEN > buf.len() {
                return Err(Error::corrupt("record truncated in text field"));
            }
            let value = read_u32_le(buf, cursor);
            cursor += FIELD_HEADER_LEN;
            if flags & field.flag() != 0 {
                *slot = StoredText::Handle(value);
                continue;
            }
            let len = value as usize;
            if len > buf.len() - cursor {
                return Err(Error::corrupt("inline text exceeds record bounds"));
            }
            *slot = StoredText::Inline(BString::from(&buf[cursor..cursor + len]));
            cursor += len;
        }

        let stripped = Self {
            id: read_u32_le(buf, 4),
            index_position: read_u32_le(buf, 8),
            timestamp: Timestamp::new(read_u64_le(buf, 12) as i64, nanos as u32),
            line: read_u32_le(buf, 28),
            channel: read_u32_le(buf, 32),
            thread_id: read_u32_le(buf, 36),
            fields,
        };
        Ok((stripped, cursor))
    }

    /// Replaces handles with their values. Unknown handles are corruption.
    pub fn restore(self, strings: &impl TextResolver) -> Result<Message, Error> {
        let [file, app_name, machine_name, msg] = self.fields;
        let id = self.id;
        let resolve = |stored: StoredText| -> Result<BString, Error> {
            match stored {
                StoredText::Inline(bytes) => Ok(bytes),
                StoredText::Handle(handle) => strings
                    .resolve(handle)
                    .map(|value| value.to_owned())
                    .ok_or_else(|| {
                        Error::corrupt(format!("record references unknown string handle {handle}"))
                            .with_id(id)
                    }),
            }
        };
        Ok(Message {
            id,
            file: resolve(file)?,
            line: self.line,
            thread_id: self.thread_id,
            timestamp: self.timestamp,
            channel: self.channel,
            app_name: resolve(app_name)?,
            machine_name: resolve(machine_name)?,
            msg: resolve(msg)?,
        })
    }

    pub fn handles(&self) -> impl Iterator<Item = u32> + '_ {
        self.fields.iter().filter_map(|stored| match stored {
            StoredText::Handle(handle) => Some(*handle),
            StoredText::Inline(_) => None,
        })
    }
}

impl Default for StoredText {
    fn default() -> Self {
        StoredText::Inline(BString::default())
    }
}
