//! Deadline-enforcing writer used to detect slow consumers.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::{Instant, timeout_at};

/// Wraps a destination so every chunk must be written within a fixed deadline.
///
/// A chunk may be accepted in several partial writes; all of them share the
/// deadline computed when the chunk write began.
pub struct TimeoutWriter<W> {
    inner: W,
    write_timeout: Duration,
}

impl<W: AsyncWrite + Unpin> TimeoutWriter<W> {
    /// Creates a writer that allows `write_timeout` per chunk.
    pub fn new(inner: W, write_timeout: Duration) -> Self {
        Self {
            inner,
            write_timeout,
        }
    }

    /// Writes and flushes the whole chunk before the deadline.
    ///
    /// Returns the number of bytes written, which is always `chunk.len()` on
    /// success.
    ///
    /// # Errors
    ///
    /// - `WriteError::Timeout` - The deadline passed, or the destination reported a timeout
    /// - `WriteError::Io` - The destination failed or stopped accepting bytes
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<usize, WriteError> {
        let deadline = Instant::now() + self.write_timeout;
        let mut written = 0;

        while written < chunk.len() {
            match timeout_at(deadline, self.inner.write(&chunk[written..])).await {
                Err(_) => return Err(self.timed_out(written)),
                Ok(Ok(0)) => {
                    return Err(WriteError::Io {
                        written,
                        kind: io::ErrorKind::WriteZero,
                        reason: "destination stopped accepting bytes".to_string(),
                    });
                }
                Ok(Ok(n)) => written += n,
                Ok(Err(error)) => return Err(self.classify(written, error)),
            }
        }

        match timeout_at(deadline, self.inner.flush()).await {
            Err(_) => Err(self.timed_out(written)),
            Ok(Err(error)) => Err(self.classify(written, error)),
            Ok(Ok(())) => Ok(written),
        }
    }

    fn timed_out(&self, written: usize) -> WriteError {
        WriteError::Timeout {
            written,
            timeout: self.write_timeout,
        }
    }

    fn classify(&self, written: usize, error: io::Error) -> WriteError {
        if matches!(
            error.kind(),
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
        ) {
            return self.timed_out(written);
        }
        WriteError::Io {
            written,
            kind: error.kind(),
            reason: error.to_string(),
        }
    }
}

/// Failure writing a chunk to a client destination.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WriteError {
    #[error("write timed out after {timeout:?} with {written} bytes written")]
    Timeout { written: usize, timeout: Duration },

    #[error("write failed with {written} bytes written: {reason}")]
    Io {
        written: usize,
        kind: io::ErrorKind,
        reason: String,
    },
}

impl WriteError {
    /// Bytes accepted by the destination before the failure.
    pub fn written(&self) -> usize {
        match self {
            WriteError::Timeout { written, .. } | WriteError::Io { written, .. } => *written,
        }
    }

    /// True when the destination was too slow rather than broken.
    pub fn is_timeout(&self) -> bool {
        matches!(self, WriteError::Timeout { .. })
    }
}
