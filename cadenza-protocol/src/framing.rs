use crate::error::{IoErrorContext, ProtocolError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hard ceiling on a single frame's payload. A worker that emits anything
/// bigger is misbehaving and the connection is torn down.
pub const MAX_FRAME_SIZE: u64 = 16 * 1024 * 1024;

/// Writes length-prefixed frames.
/// Each frame: 8-byte little-endian payload length, then the payload.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        let len = payload.len() as u64;
        if len > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                length: len,
                max: MAX_FRAME_SIZE,
            });
        }

        self.writer
            .write_all(&len.to_le_bytes())
            .await
            .io_context("Failed to write frame length")?;
        self.writer
            .write_all(payload)
            .await
            .io_context("Failed to write frame payload")?;
        self.writer
            .flush()
            .await
            .io_context("Failed to flush frame")?;
        Ok(())
    }

    /// Give the underlying writer back, e.g. to close it.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Reads length-prefixed frames.
pub struct FrameReader<R> {
    reader: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Read the next frame. Returns `None` on a clean end of stream
    /// (EOF at a frame boundary). EOF in the middle of a frame is an error.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        let mut len_bytes = [0u8; 8];
        let mut filled = 0;
        while filled < len_bytes.len() {
            let n = self
                .reader
                .read(&mut len_bytes[filled..])
                .await
                .io_context("Failed to read frame length")?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(ProtocolError::TruncatedFrame {
                    expected: 8,
                    actual: filled as u64,
                });
            }
            filled += n;
        }

        let len = u64::from_le_bytes(len_bytes);
        if len > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                length: len,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut payload = vec![0u8; len as usize];
        self.reader
            .read_exact(&mut payload)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => ProtocolError::TruncatedFrame {
                    expected: len,
                    actual: 0,
                },
                _ => ProtocolError::Io {
                    message: "Failed to read frame payload".into(),
                    source: e,
                },
            })?;

        Ok(Some(payload))
    }
}
