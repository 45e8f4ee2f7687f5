//! Ports: named attachment points for pipes on a module.
//!
//! An [`InputPort`] holds at most one pipe's consumer end. An
//! [`OutputPort`] holds any number of producer ends and broadcasts every
//! write to all of them.

use crate::pipe::{Chunk, PipeError, PipeId, PipeKind, PipeReader, PipeWriter};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether a port consumes or produces data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortDirection {
    Input,
    Output,
}

impl fmt::Display for PortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortDirection::Input => f.write_str("input"),
            PortDirection::Output => f.write_str("output"),
        }
    }
}

/// Errors raised while binding or using ports.
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("port '{port}' does not accept {kind} pipes (accepts: {})", kind_list(.accepted))]
    KindMismatch {
        port: String,
        kind: PipeKind,
        accepted: Vec<PipeKind>,
    },

    #[error("input port '{0}' already has a bound pipe")]
    AlreadyBound(String),

    #[error("input port '{0}' has no bound pipe")]
    Unbound(String),

    #[error("no {direction} port named '{port}'")]
    UnknownPort {
        direction: PortDirection,
        port: String,
    },
}

fn kind_list(kinds: &[PipeKind]) -> String {
    if kinds.is_empty() {
        return "nothing".to_string();
    }
    kinds
        .iter()
        .map(PipeKind::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Static description of a port, for catalogues and tree views.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    pub id: String,
    pub description: String,
    pub direction: PortDirection,
    pub accepts: Vec<PipeKind>,
    /// Number of pipes currently bound.
    pub bound: usize,
}

/// A module's single-pipe input.
#[derive(Debug)]
pub struct InputPort {
    id: String,
    description: String,
    accepts: Vec<PipeKind>,
    pipe: Option<PipeReader>,
}

impl InputPort {
    /// Create a port that accepts nothing yet; add kinds with [`accept`](Self::accept).
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            accepts: Vec::new(),
            pipe: None,
        }
    }

    /// Declare a pipe kind this port accepts.
    pub fn accept(mut self, kind: PipeKind) -> Self {
        if !self.accepts.contains(&kind) {
            self.accepts.push(kind);
        }
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn accepts(&self) -> &[PipeKind] {
        &self.accepts
    }

    pub fn accepts_kind(&self, kind: PipeKind) -> bool {
        self.accepts.contains(&kind)
    }

    pub fn is_bound(&self) -> bool {
        self.pipe.is_some()
    }

    /// Kind of the bound pipe, if any.
    pub fn bound_kind(&self) -> Option<PipeKind> {
        self.pipe.as_ref().map(PipeReader::kind)
    }

    /// Attach a pipe's consumer end.
    pub fn bind(&mut self, reader: PipeReader) -> Result<(), PortError> {
        if !self.accepts_kind(reader.kind()) {
            return Err(PortError::KindMismatch {
                port: self.id.clone(),
                kind: reader.kind(),
                accepted: self.accepts.clone(),
            });
        }
        if self.pipe.is_some() {
            return Err(PortError::AlreadyBound(self.id.clone()));
        }
        self.pipe = Some(reader);
        Ok(())
    }

    /// Detach and return the bound consumer end.
    pub fn unbind(&mut self) -> Option<PipeReader> {
        self.pipe.take()
    }

    /// The bound pipe's consumer end.
    pub fn reader(&mut self) -> Result<&mut PipeReader, PortError> {
        self.pipe
            .as_mut()
            .ok_or_else(|| PortError::Unbound(self.id.clone()))
    }

    /// Abandon the bound pipe; the producer's later writes are dropped.
    pub fn close(&mut self) {
        if let Some(reader) = self.pipe.as_mut() {
            reader.close();
        }
    }

    pub fn info(&self) -> PortInfo {
        PortInfo {
            id: self.id.clone(),
            description: self.description.clone(),
            direction: PortDirection::Input,
            accepts: self.accepts.clone(),
            bound: usize::from(self.pipe.is_some()),
        }
    }
}

/// A module's broadcasting output.
#[derive(Debug)]
pub struct OutputPort {
    id: String,
    description: String,
    accepts: Vec<PipeKind>,
    pipes: Vec<PipeWriter>,
    /// Set by `close_all`; later writes fail.
    closed: bool,
    /// Whether anything was written yet.
    started: bool,
}

impl OutputPort {
    /// Create a port that accepts nothing yet; add kinds with [`accept`](Self::accept).
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            accepts: Vec::new(),
            pipes: Vec::new(),
            closed: false,
            started: false,
        }
    }

    /// Declare a pipe kind this port can feed.
    pub fn accept(mut self, kind: PipeKind) -> Self {
        if !self.accepts.contains(&kind) {
            self.accepts.push(kind);
        }
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn accepts(&self) -> &[PipeKind] {
        &self.accepts
    }

    pub fn accepts_kind(&self, kind: PipeKind) -> bool {
        self.accepts.contains(&kind)
    }

    /// Number of pipes currently bound.
    pub fn pipe_count(&self) -> usize {
        self.pipes.len()
    }

    pub fn pipe_ids(&self) -> impl Iterator<Item = PipeId> + '_ {
        self.pipes.iter().map(PipeWriter::id)
    }

    /// Whether a pipe of `kind` is currently bound.
    pub fn feeds(&self, kind: PipeKind) -> bool {
        self.pipes.iter().any(|w| w.kind() == kind)
    }

    /// Attach another pipe's producer end.
    ///
    /// A pipe bound after writing started only receives later writes.
    pub fn bind(&mut self, writer: PipeWriter) -> Result<(), PortError> {
        if !self.accepts_kind(writer.kind()) {
            return Err(PortError::KindMismatch {
                port: self.id.clone(),
                kind: writer.kind(),
                accepted: self.accepts.clone(),
            });
        }
        if self.started {
            tracing::debug!(port = %self.id, pipe = %writer.id(), "pipe bound after writing started");
        }
        self.pipes.push(writer);
        Ok(())
    }

    /// Detach one pipe by id.
    pub fn unbind(&mut self, pipe: PipeId) -> Option<PipeWriter> {
        let idx = self.pipes.iter().position(|w| w.id() == pipe)?;
        Some(self.pipes.remove(idx))
    }

    /// Write text to every bound pipe.
    pub fn write_text(&mut self, text: &str) -> Result<(), PipeError> {
        self.broadcast(|writer| writer.write_text(text))
    }

    /// Write bytes to every bound pipe.
    ///
    /// If any character pipe is bound the bytes must be valid UTF-8; this is
    /// checked before anything is written.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), PipeError> {
        let char_pipe = self
            .pipes
            .iter()
            .find(|w| w.kind() == PipeKind::Char)
            .map(PipeWriter::id);
        if let Some(pipe) = char_pipe {
            std::str::from_utf8(bytes).map_err(|source| PipeError::InvalidUtf8 { pipe, source })?;
        }
        self.broadcast(|writer| writer.write_bytes(bytes))
    }

    /// Write a chunk to every bound pipe.
    pub fn write(&mut self, chunk: &Chunk) -> Result<(), PipeError> {
        match chunk {
            Chunk::Text(s) => self.write_text(s),
            Chunk::Bytes(b) => self.write_bytes(b),
        }
    }

    fn broadcast(
        &mut self,
        mut write: impl FnMut(&mut PipeWriter) -> Result<(), PipeError>,
    ) -> Result<(), PipeError> {
        if self.closed {
            // With nothing bound there is no stream that could observe the write.
            return match self.pipes.first() {
                Some(w) => Err(PipeError::Closed(w.id())),
                None => Ok(()),
            };
        }
        self.started = true;

        let mut abandoned = Vec::new();
        for writer in &mut self.pipes {
            match write(writer) {
                Ok(()) => {}
                Err(PipeError::Abandoned(id)) => abandoned.push(id),
                Err(e) => return Err(e),
            }
        }
        if !abandoned.is_empty() {
            for id in &abandoned {
                tracing::debug!(port = %self.id, pipe = %id, "consumer abandoned pipe, dropping it");
            }
            self.pipes.retain(|w| !abandoned.contains(&w.id()));
        }
        Ok(())
    }

    /// Close every bound pipe for writing. Idempotent.
    pub fn close_all(&mut self) {
        self.closed = true;
        for writer in &mut self.pipes {
            writer.close_for_writing();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn info(&self) -> PortInfo {
        PortInfo {
            id: self.id.clone(),
            description: self.description.clone(),
            direction: PortDirection::Output,
            accepts: self.accepts.clone(),
            bound: self.pipes.len(),
        }
    }
}
