//! Pipes: typed, ordered, closable streams between two modules.
//!
//! A [`Pipe`] has exactly one producer end ([`PipeWriter`]) and one consumer
//! end ([`PipeReader`]). Data is moved in [`Chunk`]s and arrives in write
//! order. Closing the writer is the end-of-stream signal: once the buffered
//! chunks are drained, every read returns `None` without blocking.
//!
//! Pipes created with [`Pipe::new`] are unbounded. A producer that is much
//! faster than its consumer grows the buffer without limit; use
//! [`Pipe::bounded`] when backpressure is wanted.

use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

/// Data discipline of a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipeKind {
    /// Character stream: every chunk is valid UTF-8 text.
    Char,
    /// Raw byte stream.
    Byte,
}

impl PipeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipeKind::Char => "char",
            PipeKind::Byte => "byte",
        }
    }
}

impl fmt::Display for PipeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "char" | "chars" | "text" => Ok(PipeKind::Char),
            "byte" | "bytes" | "binary" => Ok(PipeKind::Byte),
            other => Err(format!("unknown pipe kind '{}' (use char or byte)", other)),
        }
    }
}

/// Process-unique pipe identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PipeId(u64);

impl PipeId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        PipeId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A unit of data travelling through a pipe.
///
/// Character pipes carry `Text`, byte pipes `Bytes`. The one exception is
/// [`PipeReader::read`] after an `io::Read` stopped inside a character: the
/// rest of that character comes back as `Bytes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Text(String),
    Bytes(Vec<u8>),
}

impl Chunk {
    pub fn kind(&self) -> PipeKind {
        match self {
            Chunk::Text(_) => PipeKind::Char,
            Chunk::Bytes(_) => PipeKind::Byte,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Chunk::Text(s) => s.as_bytes(),
            Chunk::Bytes(b) => b,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Chunk::Text(s) => Some(s),
            Chunk::Bytes(_) => None,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Chunk::Text(s) => s.into_bytes(),
            Chunk::Bytes(b) => b,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<String> for Chunk {
    fn from(s: String) -> Self {
        Chunk::Text(s)
    }
}

impl From<&str> for Chunk {
    fn from(s: &str) -> Self {
        Chunk::Text(s.to_string())
    }
}

impl From<Vec<u8>> for Chunk {
    fn from(b: Vec<u8>) -> Self {
        Chunk::Bytes(b)
    }
}

/// Lifecycle of a pipe, as seen from either end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipeState {
    /// Data may flow.
    Open,
    /// Producer signalled end-of-stream; buffered data may remain.
    ClosedForWriting,
    /// Consumer drained the pipe, or abandoned it.
    Closed,
}

const STATE_OPEN: u8 = 0;
const STATE_CLOSED_FOR_WRITING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// State shared by both ends of one pipe.
#[derive(Debug)]
struct Shared {
    state: AtomicU8,
}

impl Shared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(STATE_OPEN),
        })
    }

    fn get(&self) -> PipeState {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => PipeState::Open,
            STATE_CLOSED_FOR_WRITING => PipeState::ClosedForWriting,
            _ => PipeState::Closed,
        }
    }

    fn close_for_writing(&self) {
        // Only Open moves to ClosedForWriting; Closed is final.
        let _ = self.state.compare_exchange(
            STATE_OPEN,
            STATE_CLOSED_FOR_WRITING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn close(&self) {
        self.state.store(STATE_CLOSED, Ordering::Release);
    }
}

/// Errors raised by pipe ends.
#[derive(Debug, thiserror::Error)]
pub enum PipeError {
    #[error("pipe {0} is closed for writing")]
    Closed(PipeId),

    #[error("pipe {0} was abandoned by its consumer")]
    Abandoned(PipeId),

    #[error("character pipe {pipe} received invalid UTF-8: {source}")]
    InvalidUtf8 {
        pipe: PipeId,
        #[source]
        source: std::str::Utf8Error,
    },
}

/// A typed in-memory conduit, not yet split into its two ends.
#[derive(Debug)]
pub struct Pipe {
    writer: PipeWriter,
    reader: PipeReader,
}

impl Pipe {
    /// Create an unbounded pipe.
    pub fn new(kind: PipeKind) -> Self {
        Self::with_capacity(kind, None)
    }

    /// Create a pipe that buffers at most `capacity` chunks.
    ///
    /// Writes block while the buffer is full. A capacity of zero makes
    /// every write a rendezvous with a read.
    pub fn bounded(kind: PipeKind, capacity: usize) -> Self {
        Self::with_capacity(kind, Some(capacity))
    }

    /// Create a pipe, bounded if `capacity` is set.
    pub fn with_capacity(kind: PipeKind, capacity: Option<usize>) -> Self {
        let (tx, rx) = match capacity {
            Some(cap) => crossbeam_channel::bounded(cap),
            None => crossbeam_channel::unbounded(),
        };
        let id = PipeId::next();
        let shared = Shared::new();

        Self {
            writer: PipeWriter {
                id,
                kind,
                tx: Some(tx),
                shared: Arc::clone(&shared),
            },
            reader: PipeReader {
                id,
                kind,
                rx: Some(rx),
                pending: None,
                shared,
            },
        }
    }

    pub fn id(&self) -> PipeId {
        self.writer.id
    }

    pub fn kind(&self) -> PipeKind {
        self.writer.kind
    }

    pub fn state(&self) -> PipeState {
        self.writer.shared.get()
    }

    /// Separate the producer and consumer ends.
    pub fn split(self) -> (PipeWriter, PipeReader) {
        (self.writer, self.reader)
    }
}

/// Producer end of a pipe.
///
/// Not cloneable: a pipe has exactly one producer.
#[derive(Debug)]
pub struct PipeWriter {
    id: PipeId,
    kind: PipeKind,
    tx: Option<Sender<Chunk>>,
    shared: Arc<Shared>,
}

impl PipeWriter {
    pub fn id(&self) -> PipeId {
        self.id
    }

    pub fn kind(&self) -> PipeKind {
        self.kind
    }

    pub fn state(&self) -> PipeState {
        self.shared.get()
    }

    /// Write text. Byte pipes receive its UTF-8 encoding.
    pub fn write_text(&mut self, text: &str) -> Result<(), PipeError> {
        let chunk = match self.kind {
            PipeKind::Char => Chunk::Text(text.to_string()),
            PipeKind::Byte => Chunk::Bytes(text.as_bytes().to_vec()),
        };
        self.send(chunk)
    }

    /// Write raw bytes. Character pipes require them to be valid UTF-8.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), PipeError> {
        let chunk = match self.kind {
            PipeKind::Byte => Chunk::Bytes(bytes.to_vec()),
            PipeKind::Char => {
                let text = std::str::from_utf8(bytes).map_err(|source| PipeError::InvalidUtf8 {
                    pipe: self.id,
                    source,
                })?;
                Chunk::Text(text.to_string())
            }
        };
        self.send(chunk)
    }

    /// Write a chunk, converting it to this pipe's kind.
    pub fn write(&mut self, chunk: &Chunk) -> Result<(), PipeError> {
        match chunk {
            Chunk::Text(s) => self.write_text(s),
            Chunk::Bytes(b) => self.write_bytes(b),
        }
    }

    fn send(&mut self, chunk: Chunk) -> Result<(), PipeError> {
        let tx = self.tx.as_ref().ok_or(PipeError::Closed(self.id))?;
        if self.shared.get() == PipeState::Closed {
            return Err(PipeError::Abandoned(self.id));
        }
        // Empty chunks would read as end-of-stream through io::Read.
        if chunk.is_empty() {
            return Ok(());
        }
        tx.send(chunk).map_err(|_| PipeError::Abandoned(self.id))
    }

    /// Signal end-of-stream. Idempotent.
    pub fn close_for_writing(&mut self) {
        if self.tx.take().is_some() {
            self.shared.close_for_writing();
            tracing::trace!(pipe = %self.id, "pipe closed for writing");
        }
    }

    /// Whether `close_for_writing` has been called on this end.
    pub fn is_closed(&self) -> bool {
        self.tx.is_none()
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.close_for_writing();
    }
}

/// Consumer end of a pipe.
///
/// Implements [`io::Read`], so standard readers (`BufReader`, `serde_json`,
/// line scanners) can consume a pipe directly.
#[derive(Debug)]
pub struct PipeReader {
    id: PipeId,
    kind: PipeKind,
    rx: Option<Receiver<Chunk>>,
    /// Chunk partially consumed through `io::Read`, with the read offset.
    pending: Option<(Chunk, usize)>,
    shared: Arc<Shared>,
}

impl PipeReader {
    pub fn id(&self) -> PipeId {
        self.id
    }

    pub fn kind(&self) -> PipeKind {
        self.kind
    }

    pub fn state(&self) -> PipeState {
        self.shared.get()
    }

    /// Block until the next chunk arrives.
    ///
    /// Returns `None` once the producer has closed and all buffered chunks
    /// were read, and on every call after that.
    pub fn read(&mut self) -> Option<Chunk> {
        if let Some((chunk, offset)) = self.pending.take() {
            return Some(self.remainder(chunk, offset));
        }
        let rx = self.rx.as_ref()?;
        match rx.recv() {
            Ok(chunk) => Some(chunk),
            Err(_) => {
                self.shared.close();
                None
            }
        }
    }

    /// The unread tail of a chunk that was partially consumed via `io::Read`.
    ///
    /// A text chunk split inside a character first yields the character's
    /// remaining bytes; the text after it stays pending.
    fn remainder(&mut self, chunk: Chunk, offset: usize) -> Chunk {
        if offset == 0 {
            return chunk;
        }
        match chunk {
            Chunk::Bytes(b) => Chunk::Bytes(b[offset..].to_vec()),
            Chunk::Text(s) if s.is_char_boundary(offset) => Chunk::Text(s[offset..].to_string()),
            Chunk::Text(s) => {
                let boundary = (offset + 1..s.len())
                    .find(|&i| s.is_char_boundary(i))
                    .unwrap_or(s.len());
                let fragment = s.as_bytes()[offset..boundary].to_vec();
                if boundary < s.len() {
                    self.pending = Some((Chunk::Text(s), boundary));
                }
                Chunk::Bytes(fragment)
            }
        }
    }

    /// Read every remaining byte until end-of-stream.
    pub fn read_to_end(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = self.read() {
            out.extend_from_slice(chunk.as_bytes());
        }
        out
    }

    /// Read the remaining stream as text.
    pub fn read_to_string(&mut self) -> Result<String, PipeError> {
        let bytes = self.read_to_end();
        String::from_utf8(bytes).map_err(|e| PipeError::InvalidUtf8 {
            pipe: self.id,
            source: e.utf8_error(),
        })
    }

    /// Abandon the pipe. Pending data is discarded and later writes by the
    /// producer fail with [`PipeError::Abandoned`].
    pub fn close(&mut self) {
        self.pending = None;
        if self.rx.take().is_some() {
            self.shared.close();
            tracing::trace!(pipe = %self.id, "pipe closed by consumer");
        }
    }

    /// Whether end-of-stream was observed or the pipe was abandoned.
    pub fn is_finished(&self) -> bool {
        self.rx.is_none() || self.shared.get() == PipeState::Closed
    }
}

impl io::Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let (chunk, offset) = match self.pending.take() {
            Some(pending) => pending,
            None => match PipeReader::read(self) {
                Some(chunk) => (chunk, 0),
                None => return Ok(0),
            },
        };

        let bytes = chunk.as_bytes();
        let n = buf.len().min(bytes.len() - offset);
        buf[..n].copy_from_slice(&bytes[offset..offset + n]);
        if offset + n < bytes.len() {
            self.pending = Some((chunk, offset + n));
        }
        Ok(n)
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.close();
    }
}
