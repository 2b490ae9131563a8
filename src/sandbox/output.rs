//! Combined, size-capped output capture

use std::fmt::Write;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

const READ_CHUNK: usize = 8 * 1024;

/// Collects stdout and stderr chunks in arrival order up to a byte limit.
/// Anything past the limit is read and dropped so the writer never blocks.
#[derive(Debug)]
pub struct OutputCapture {
    buf: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl OutputCapture {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::with_capacity(limit.min(READ_CHUNK)),
            limit,
            truncated: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.buf.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    /// Decode as UTF-8 (lossy) and append a marker if anything was dropped
    pub fn finish(self) -> (String, bool) {
        let mut text = String::from_utf8_lossy(&self.buf).into_owned();
        if self.truncated {
            if !text.ends_with('\n') {
                text.push('\n');
            }
            let _ = write!(text, "[output truncated at {} bytes]", self.limit);
        }
        (text, self.truncated)
    }
}

/// Forward everything `reader` yields to `tx` until EOF or the receiver goes away
pub fn spawn_reader<R>(mut reader: R, tx: mpsc::Sender<Vec<u8>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
}
