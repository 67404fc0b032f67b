use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Frame too large: {length} exceeds maximum {max}")]
    FrameTooLarge { length: u64, max: u64 },

    #[error("Truncated frame: expected {expected} payload bytes, got {actual}")]
    TruncatedFrame { expected: u64, actual: u64 },

    #[error("Unknown variant tag: {0:#04x}")]
    UnknownTag(u8),

    #[error("String too long: {length} exceeds maximum {max}")]
    StringTooLong { length: u64, max: u64 },

    #[error("List too long: {length} exceeds maximum {max}")]
    ListTooLong { length: u64, max: u64 },

    #[error("Short payload: needed {needed} more bytes while reading {context}")]
    ShortPayload { needed: usize, context: &'static str },

    #[error("Trailing garbage: {0} bytes left after payload")]
    TrailingBytes(usize),

    #[error("Invalid UTF-8 in {context}")]
    InvalidUtf8 { context: &'static str },

    #[error("Invalid verbosity level: {0}")]
    InvalidLevel(u64),

    #[error("Invalid log field tag: {0:#04x}")]
    InvalidFieldTag(u8),

    #[error("Malformed output: {0}")]
    Malformed(String),
}

impl ProtocolError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed(message.into())
    }
}

/// Helper trait for adding context to IO errors
pub trait IoErrorContext<T> {
    fn io_context(self, message: impl Into<String>) -> Result<T, ProtocolError>;
}

impl<T> IoErrorContext<T> for std::io::Result<T> {
    fn io_context(self, message: impl Into<String>) -> Result<T, ProtocolError> {
        self.map_err(|source| ProtocolError::Io {
            message: message.into(),
            source,
        })
    }
}
