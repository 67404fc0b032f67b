//! Events received from the worker over its stdout.

use crate::error::ProtocolError;
use crate::log::{LogEntry, TAG_MSG, TAG_RESULT};
use crate::wire::{self, Cursor};

pub const TAG_BUILD_RESULT: u8 = 0x10;
pub const TAG_EXCEPTION: u8 = 0x11;

/// An event frame. `BuildResult` is terminal; log-bearing events
/// (tags `0x20..=0x23`) are forwarded to the logger bus unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    BuildResult(bool),
    Exception(String),
    Log(LogEntry),
}

impl Event {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Event::BuildResult(success) => {
                wire::put_u8(&mut buf, TAG_BUILD_RESULT);
                wire::put_bool(&mut buf, *success);
            }
            Event::Exception(text) => {
                wire::put_u8(&mut buf, TAG_EXCEPTION);
                wire::put_string(&mut buf, text);
            }
            Event::Log(entry) => entry.encode(&mut buf),
        }
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut cur = Cursor::new(payload);
        let event = match cur.get_u8("event tag")? {
            TAG_BUILD_RESULT => Event::BuildResult(cur.get_bool("build result")?),
            TAG_EXCEPTION => Event::Exception(cur.get_string("exception text")?),
            tag @ TAG_MSG..=TAG_RESULT => Event::Log(LogEntry::decode_body(tag, &mut cur)?),
            other => return Err(ProtocolError::UnknownTag(other)),
        };
        cur.finish()?;
        Ok(event)
    }
}
