//! Line framing for node output streams
//!
//! Lines end with `\n` or `\r\n`, mixed freely within one stream. A line
//! longer than the configured maximum is discarded up to its terminator and
//! reported as an error; reading can continue with the next line. The
//! terminator, `\r` included, never counts toward the limit.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use super::ScanError;

/// Reads terminated lines from a buffered byte stream
pub struct LineReader<R> {
    reader: R,
    buf: Vec<u8>,
    max_len: usize,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    pub fn new(reader: R, max_len: usize) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            max_len,
        }
    }

    /// Next line without its terminator, `None` at end of stream.
    ///
    /// A final unterminated line is returned as-is.
    pub async fn next_line(&mut self) -> Result<Option<String>, ScanError> {
        self.buf.clear();
        let mut oversized = false;

        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                if oversized {
                    return Err(ScanError::LineTooLong(self.max_len));
                }
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(self.take_line()));
            }

            let (chunk, terminated) = match available.iter().position(|&b| b == b'\n') {
                Some(i) => (&available[..i], Some(i + 1)),
                None => (available, None),
            };

            if !oversized {
                if content_len(&self.buf, chunk) > self.max_len {
                    oversized = true;
                    self.buf.clear();
                } else {
                    self.buf.extend_from_slice(chunk);
                }
            }

            let consumed = terminated.unwrap_or(available.len());
            self.reader.consume(consumed);

            if terminated.is_some() {
                if oversized {
                    return Err(ScanError::LineTooLong(self.max_len));
                }
                return Ok(Some(self.take_line()));
            }
        }
    }

    fn take_line(&mut self) -> String {
        if self.buf.last() == Some(&b'\r') {
            self.buf.pop();
        }
        String::from_utf8_lossy(&self.buf).into_owned()
    }
}

/// Length of the buffered line plus `chunk`, not counting a trailing `\r`
/// that may turn out to be part of a `\r\n` terminator
fn content_len(buf: &[u8], chunk: &[u8]) -> usize {
    let total = buf.len() + chunk.len();
    if chunk.last().or_else(|| buf.last()) == Some(&b'\r') {
        total - 1
    } else {
        total
    }
}
