//! Structured build-log entries and their wire encodings.
//!
//! Entries originate from the worker's in-process logger and flow through
//! the agent's logger bus to the remote log service. Activities form a
//! forest: `StartActivity.parent` refers to another activity id (0 = root).

use crate::error::ProtocolError;
use crate::wire::{self, Cursor};

pub type ActivityId = u64;

/// Nix verbosity ladder. `u64` on the wire.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Error = 0,
    Warn = 1,
    Notice = 2,
    Info = 3,
    Talkative = 4,
    Chatty = 5,
    Debug = 6,
    Vomit = 7,
}

impl TryFrom<u64> for Level {
    type Error = ProtocolError;

    fn try_from(value: u64) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(Self::Error),
            1 => Ok(Self::Warn),
            2 => Ok(Self::Notice),
            3 => Ok(Self::Info),
            4 => Ok(Self::Talkative),
            5 => Ok(Self::Chatty),
            6 => Ok(Self::Debug),
            7 => Ok(Self::Vomit),
            other => Err(ProtocolError::InvalidLevel(other)),
        }
    }
}

/// A typed field attached to an activity or result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogField {
    Int(u64),
    Text(String),
}

const FIELD_INT: u8 = 0;
const FIELD_TEXT: u8 = 1;

impl LogField {
    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            LogField::Int(v) => {
                wire::put_u8(buf, FIELD_INT);
                wire::put_u64(buf, *v);
            }
            LogField::Text(s) => {
                wire::put_u8(buf, FIELD_TEXT);
                wire::put_string(buf, s);
            }
        }
    }

    fn decode(cur: &mut Cursor<'_>) -> Result<Self, ProtocolError> {
        match cur.get_u8("field tag")? {
            FIELD_INT => Ok(LogField::Int(cur.get_u64("int field")?)),
            FIELD_TEXT => Ok(LogField::Text(cur.get_string("text field")?)),
            other => Err(ProtocolError::InvalidFieldTag(other)),
        }
    }
}

pub const TAG_MSG: u8 = 0x20;
pub const TAG_START_ACTIVITY: u8 = 0x21;
pub const TAG_STOP_ACTIVITY: u8 = 0x22;
pub const TAG_RESULT: u8 = 0x23;

/// One entry of the structured build log.
///
/// `ms` is milliseconds since the producing logger started; it is
/// monotonically non-decreasing in enqueue order per producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    Msg {
        level: Level,
        ms: u64,
        text: String,
    },
    StartActivity {
        act: ActivityId,
        level: Level,
        ms: u64,
        kind: u64,
        text: String,
        fields: Vec<LogField>,
        parent: ActivityId,
    },
    StopActivity {
        act: ActivityId,
        ms: u64,
    },
    Result {
        act: ActivityId,
        ms: u64,
        kind: u64,
        fields: Vec<LogField>,
    },
}

impl LogEntry {
    pub fn tag(&self) -> u8 {
        match self {
            LogEntry::Msg { .. } => TAG_MSG,
            LogEntry::StartActivity { .. } => TAG_START_ACTIVITY,
            LogEntry::StopActivity { .. } => TAG_STOP_ACTIVITY,
            LogEntry::Result { .. } => TAG_RESULT,
        }
    }

    pub fn ms(&self) -> u64 {
        match self {
            LogEntry::Msg { ms, .. }
            | LogEntry::StartActivity { ms, .. }
            | LogEntry::StopActivity { ms, .. }
            | LogEntry::Result { ms, .. } => *ms,
        }
    }

    /// Plain messages may be shed under queue pressure; activity records
    /// must survive so the remote activity forest stays consistent.
    pub fn is_discardable(&self) -> bool {
        matches!(self, LogEntry::Msg { .. })
    }

    /// Verbosity of the entry, for choosing which `Msg` to shed first.
    pub fn level(&self) -> Option<Level> {
        match self {
            LogEntry::Msg { level, .. } | LogEntry::StartActivity { level, .. } => Some(*level),
            _ => None,
        }
    }

    /// Encode tag byte plus body.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        wire::put_u8(buf, self.tag());
        match self {
            LogEntry::Msg { level, ms, text } => {
                wire::put_u64(buf, *level as u64);
                wire::put_u64(buf, *ms);
                wire::put_string(buf, text);
            }
            LogEntry::StartActivity {
                act,
                level,
                ms,
                kind,
                text,
                fields,
                parent,
            } => {
                wire::put_u64(buf, *act);
                wire::put_u64(buf, *level as u64);
                wire::put_u64(buf, *ms);
                wire::put_u64(buf, *kind);
                wire::put_string(buf, text);
                wire::put_u32(buf, fields.len() as u32);
                for field in fields {
                    field.encode(buf);
                }
                wire::put_u64(buf, *parent);
            }
            LogEntry::StopActivity { act, ms } => {
                wire::put_u64(buf, *act);
                wire::put_u64(buf, *ms);
            }
            LogEntry::Result {
                act,
                ms,
                kind,
                fields,
            } => {
                wire::put_u64(buf, *act);
                wire::put_u64(buf, *ms);
                wire::put_u64(buf, *kind);
                wire::put_u32(buf, fields.len() as u32);
                for field in fields {
                    field.encode(buf);
                }
            }
        }
    }

    /// Decode the body for a known tag. The tag byte itself has already
    /// been consumed by the caller.
    pub fn decode_body(tag: u8, cur: &mut Cursor<'_>) -> Result<Self, ProtocolError> {
        match tag {
            TAG_MSG => Ok(LogEntry::Msg {
                level: cur.get_u64("msg level")?.try_into()?,
                ms: cur.get_u64("msg ms")?,
                text: cur.get_string("msg text")?,
            }),
            TAG_START_ACTIVITY => Ok(LogEntry::StartActivity {
                act: cur.get_u64("activity id")?,
                level: cur.get_u64("activity level")?.try_into()?,
                ms: cur.get_u64("activity ms")?,
                kind: cur.get_u64("activity kind")?,
                text: cur.get_string("activity text")?,
                fields: decode_fields(cur)?,
                parent: cur.get_u64("activity parent")?,
            }),
            TAG_STOP_ACTIVITY => Ok(LogEntry::StopActivity {
                act: cur.get_u64("activity id")?,
                ms: cur.get_u64("stop ms")?,
            }),
            TAG_RESULT => Ok(LogEntry::Result {
                act: cur.get_u64("activity id")?,
                ms: cur.get_u64("result ms")?,
                kind: cur.get_u64("result kind")?,
                fields: decode_fields(cur)?,
            }),
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }
}

fn decode_fields(cur: &mut Cursor<'_>) -> Result<Vec<LogField>, ProtocolError> {
    let len = cur.get_u32("field count")?;
    if len > wire::MAX_LIST_SIZE {
        return Err(ProtocolError::ListTooLong {
            length: len as u64,
            max: wire::MAX_LIST_SIZE as u64,
        });
    }
    let mut fields = Vec::with_capacity(len as usize);
    for _ in 0..len {
        fields.push(LogField::decode(cur)?);
    }
    Ok(fields)
}

/// Encode a batch for the remote log socket: `u32` count, then entries.
pub fn encode_batch(entries: &[LogEntry]) -> Vec<u8> {
    let mut buf = Vec::new();
    wire::put_u32(&mut buf, entries.len() as u32);
    for entry in entries {
        entry.encode(&mut buf);
    }
    buf
}

/// Decode a batch produced by [`encode_batch`].
pub fn decode_batch(bytes: &[u8]) -> Result<Vec<LogEntry>, ProtocolError> {
    let mut cur = Cursor::new(bytes);
    let count = cur.get_u32("batch count")?;
    if count > wire::MAX_LIST_SIZE {
        return Err(ProtocolError::ListTooLong {
            length: count as u64,
            max: wire::MAX_LIST_SIZE as u64,
        });
    }
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let tag = cur.get_u8("entry tag")?;
        entries.push(LogEntry::decode_body(tag, &mut cur)?);
    }
    cur.finish()?;
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entries() -> Vec<LogEntry> {
        vec![
            LogEntry::StartActivity {
                act: 1,
                level: Level::Info,
                ms: 0,
                kind: 105,
                text: "building hello".into(),
                fields: vec![LogField::Text("/nix/store/aaa-hello.drv".into())],
                parent: 0,
            },
            LogEntry::Msg {
                level: Level::Chatty,
                ms: 12,
                text: "unpacking sources".into(),
            },
            LogEntry::Result {
                act: 1,
                ms: 30,
                kind: 101,
                fields: vec![LogField::Int(1), LogField::Int(4)],
            },
            LogEntry::StopActivity { act: 1, ms: 48 },
        ]
    }

    #[test]
    fn test_batch_roundtrip() {
        let entries = sample_entries();
        let bytes = encode_batch(&entries);
        assert_eq!(decode_batch(&bytes).unwrap(), entries);
    }

    #[test]
    fn test_unknown_entry_tag() {
        let mut bytes = Vec::new();
        wire::put_u32(&mut bytes, 1);
        wire::put_u8(&mut bytes, 0x7f);
        assert!(matches!(
            decode_batch(&bytes).unwrap_err(),
            ProtocolError::UnknownTag(0x7f)
        ));
    }

    #[test]
    fn test_bad_level_rejected() {
        let mut bytes = Vec::new();
        wire::put_u32(&mut bytes, 1);
        wire::put_u8(&mut bytes, TAG_MSG);
        wire::put_u64(&mut bytes, 99);
        wire::put_u64(&mut bytes, 0);
        wire::put_string(&mut bytes, "x");
        assert!(matches!(
            decode_batch(&bytes).unwrap_err(),
            ProtocolError::InvalidLevel(99)
        ));
    }
}
