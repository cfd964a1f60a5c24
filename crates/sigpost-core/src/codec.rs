//! Transfer codec: chunk reassembly and delimiter multiplexing.
//!
//! Chunks carry no boundary metadata. A receiver appends chunks in arrival
//! order until the stream reports that no more frames are coming; ordering
//! within one stream is the transport's job.
//!
//! Short text items (commands, filenames) share one payload separated by
//! [`DELIMITER`]. The transport may coalesce adjacent payloads, so the
//! receiver splits on the delimiter and never counts items. A long item may
//! also be chunked across several payloads; [`ItemBuffer`] holds the tail
//! until its delimiter arrives.

use std::io;
use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Separator between text items in one payload.
pub const DELIMITER: &str = "***";

/// Split `payload` into consecutive chunks of at most `max` bytes.
///
/// An empty payload yields no chunks. `max` is clamped to at least 1.
pub fn chunk(payload: &[u8], max: usize) -> impl Iterator<Item = &[u8]> {
    payload.chunks(max.max(1))
}

/// Terminate every item with [`DELIMITER`] and concatenate them.
pub fn join_items<I, S>(items: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = String::new();
    for item in items {
        out.push_str(item.as_ref());
        out.push_str(DELIMITER);
    }
    out
}

/// Split a payload back into items.
///
/// Items are trimmed; empty fragments from trailing delimiters or coalesced
/// payloads are dropped. Invalid UTF-8 is replaced rather than rejected.
pub fn split_items(payload: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(payload)
        .split(DELIMITER)
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// Collects delimiter-terminated items whose payloads may arrive in pieces.
#[derive(Debug, Default)]
pub struct ItemBuffer {
    pending: Vec<u8>,
}

impl ItemBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one payload and return every item it completes, in order.
    pub fn push(&mut self, payload: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(payload);
        let delim = DELIMITER.as_bytes();
        let Some(start) = self
            .pending
            .windows(delim.len())
            .rposition(|window| window == delim)
        else {
            return Vec::new();
        };
        let complete: Vec<u8> = self.pending.drain(..start + delim.len()).collect();
        split_items(&complete)
    }

    /// Whether no partial item is waiting for its delimiter.
    pub fn is_empty(&self) -> bool {
        self.pending.iter().all(u8::is_ascii_whitespace)
    }

    /// Drop and return the unterminated tail, if it holds any text.
    pub fn take_remainder(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        let text = String::from_utf8_lossy(&rest).trim().to_string();
        (!text.is_empty()).then_some(text)
    }
}

/// Open `path` as the source of a file transfer.
///
/// Anything other than a regular file (directories, sockets) is refused.
pub async fn open_source(path: impl AsRef<Path>) -> io::Result<File> {
    let file = File::open(path.as_ref()).await?;
    if !file.metadata().await?.is_file() {
        return Err(io::Error::other("not a regular file"));
    }
    Ok(file)
}

/// Appends chunks of one transfer session to a destination, in order.
pub struct Reassembler<W> {
    dest: W,
    bytes: u64,
    chunks: u64,
}

impl<W: AsyncWrite + Unpin> Reassembler<W> {
    pub fn new(dest: W) -> Self {
        Self {
            dest,
            bytes: 0,
            chunks: 0,
        }
    }

    /// Append one chunk verbatim.
    pub async fn append(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        self.dest.write_all(chunk).await?;
        self.bytes += chunk.len() as u64;
        self.chunks += 1;
        Ok(())
    }

    /// Total bytes appended so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    /// Number of chunks appended so far.
    pub fn chunks_written(&self) -> u64 {
        self.chunks
    }

    /// Flush and hand back the destination.
    pub async fn finish(mut self) -> std::io::Result<W> {
        self.dest.flush().await?;
        Ok(self.dest)
    }
}
