//! Per-stream output buffering.
//!
//! A `LineBuffer` accumulates whatever a descriptor has ready and hands back
//! complete lines. Partial lines stay buffered until the next newline arrives
//! or the stream is finished, at which point `take_remainder` flushes them.

use tokio::io::{AsyncRead, AsyncReadExt};

const READ_CHUNK: usize = 8192;

#[derive(Debug, Default)]
pub struct LineBuffer {
    data: Vec<u8>,
    /// Offset up to which `data` has already been scanned for a newline.
    scanned: usize,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads one chunk of whatever the stream has ready.
    ///
    /// Returns the number of bytes appended; zero means end of stream.
    pub async fn fill<R: AsyncRead + Unpin + ?Sized>(
        &mut self,
        reader: &mut R,
    ) -> std::io::Result<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = reader.read(&mut chunk).await?;
        self.data.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Pops the next complete line, newline included.
    pub fn next_line(&mut self) -> Option<Vec<u8>> {
        match memchr::memchr(b'\n', &self.data[self.scanned..]) {
            Some(i) => {
                let end = self.scanned + i + 1;
                let line = self.data.drain(..end).collect();
                self.scanned = 0;
                Some(line)
            }
            None => {
                self.scanned = self.data.len();
                None
            }
        }
    }

    /// Drains any trailing bytes that never saw a newline.
    pub fn take_remainder(&mut self) -> Option<Vec<u8>> {
        self.scanned = 0;
        if self.data.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.data))
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
